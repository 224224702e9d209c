// ===============================
// src/metrics.rs
// ===============================
use once_cell::sync::Lazy;
use prometheus::core::Collector;
use prometheus::{Encoder, Gauge, IntCounter, IntCounterVec, IntGauge, Opts, Registry, TextEncoder};
use std::io::{Read, Write};
use std::net::{TcpListener, TcpStream};
use std::thread;
use std::time::Duration;
use tracing::{debug, info, warn};

pub static REGISTRY: Lazy<Registry> = Lazy::new(Registry::new);

// -------- Market data --------
pub static BOOK_UPDATES: Lazy<IntCounterVec> = Lazy::new(|| {
    IntCounterVec::new(Opts::new("book_updates_total", "order book updates per instrument"), &["instrument"]).unwrap()
});

pub static BOOK_STALE: Lazy<IntCounterVec> = Lazy::new(|| {
    IntCounterVec::new(
        Opts::new("book_updates_stale_total", "book updates dropped as out of sequence"),
        &["instrument"],
    )
    .unwrap()
});

// -------- Orders --------
pub static SIGNALS: Lazy<IntCounterVec> = Lazy::new(|| {
    IntCounterVec::new(Opts::new("signals_total", "entry/exit signals acted on"), &["kind", "side"]).unwrap()
});

pub static ORDERS: Lazy<IntCounterVec> = Lazy::new(|| {
    IntCounterVec::new(Opts::new("orders_total", "orders inserted"), &["side", "lifespan"]).unwrap()
});

pub static CANCELS: Lazy<IntCounter> =
    Lazy::new(|| IntCounter::new("cancels_total", "cancel requests sent").unwrap());

pub static FILLS: Lazy<IntCounterVec> = Lazy::new(|| {
    IntCounterVec::new(Opts::new("fills_total", "lots filled on our orders"), &["side"]).unwrap()
});

pub static HEDGES: Lazy<IntCounterVec> = Lazy::new(|| {
    IntCounterVec::new(Opts::new("hedges_total", "hedge orders sent"), &["side"]).unwrap()
});

pub static EXCHANGE_COMMANDS_DROPPED: Lazy<IntCounter> = Lazy::new(|| {
    IntCounter::new("exchange_commands_dropped_total", "commands the exchange channel refused").unwrap()
});

pub static CONSISTENCY_ERRORS: Lazy<IntCounterVec> = Lazy::new(|| {
    IntCounterVec::new(
        Opts::new("consistency_errors_total", "callbacks that did not match the order ledger"),
        &["kind"],
    )
    .unwrap()
});

pub static ORDER_ERRORS: Lazy<IntCounter> =
    Lazy::new(|| IntCounter::new("order_errors_total", "orders the exchange rejected").unwrap());

// -------- Exposure --------
pub static POSITION: Lazy<IntGauge> =
    Lazy::new(|| IntGauge::new("position_lots", "net ETF position (lots)").unwrap());

pub static POTENTIAL_BID: Lazy<IntGauge> =
    Lazy::new(|| IntGauge::new("potential_bid_lots", "position if every resting bid fills").unwrap());

pub static POTENTIAL_ASK: Lazy<IntGauge> =
    Lazy::new(|| IntGauge::new("potential_ask_lots", "position if every resting ask fills").unwrap());

pub static ACTIVE_ORDERS: Lazy<IntGauge> =
    Lazy::new(|| IntGauge::new("active_orders", "live orders in the ledger").unwrap());

// -------- Threshold --------
pub static THRESHOLD: Lazy<Gauge> =
    Lazy::new(|| Gauge::new("entry_threshold", "published entry threshold (fraction of price)").unwrap());

pub static THRESHOLD_RECOMPUTES: Lazy<IntCounter> =
    Lazy::new(|| IntCounter::new("threshold_recomputes_total", "threshold recomputations run").unwrap());

pub static THRESHOLD_COALESCED: Lazy<IntCounter> = Lazy::new(|| {
    IntCounter::new("threshold_requests_coalesced_total", "recompute requests superseded before running").unwrap()
});

fn collectors() -> Vec<Box<dyn Collector>> {
    vec![
        Box::new(BOOK_UPDATES.clone()),
        Box::new(BOOK_STALE.clone()),
        Box::new(SIGNALS.clone()),
        Box::new(ORDERS.clone()),
        Box::new(CANCELS.clone()),
        Box::new(FILLS.clone()),
        Box::new(HEDGES.clone()),
        Box::new(EXCHANGE_COMMANDS_DROPPED.clone()),
        Box::new(CONSISTENCY_ERRORS.clone()),
        Box::new(ORDER_ERRORS.clone()),
        Box::new(POSITION.clone()),
        Box::new(POTENTIAL_BID.clone()),
        Box::new(POTENTIAL_ASK.clone()),
        Box::new(ACTIVE_ORDERS.clone()),
        Box::new(THRESHOLD.clone()),
        Box::new(THRESHOLD_RECOMPUTES.clone()),
        Box::new(THRESHOLD_COALESCED.clone()),
    ]
}

/// Registers every series once; repeated calls are no-ops.
pub fn init() {
    for c in collectors() {
        match REGISTRY.register(c) {
            Ok(()) | Err(prometheus::Error::AlreadyReg) => {}
            Err(e) => warn!(?e, "metric registration failed"),
        }
    }
}

fn render() -> Vec<u8> {
    let mut body = Vec::new();
    if let Err(e) = TextEncoder::new().encode(&REGISTRY.gather(), &mut body) {
        warn!(?e, "metrics encoding failed");
        body.clear();
    }
    body
}

/// Path of an HTTP request line such as `GET /metrics HTTP/1.1`.
fn request_path(head: &str) -> Option<&str> {
    let mut parts = head.lines().next()?.split_whitespace();
    match (parts.next(), parts.next()) {
        (Some("GET"), Some(path)) => Some(path),
        _ => None,
    }
}

fn respond(mut stream: TcpStream) {
    let _ = stream.set_read_timeout(Some(Duration::from_millis(500)));
    let mut head = [0u8; 1024];
    let n = stream.read(&mut head).unwrap_or(0);
    let head = String::from_utf8_lossy(&head[..n]);

    let (status, body) = match request_path(&head) {
        Some("/") | Some("/metrics") => ("200 OK", render()),
        Some(_) => ("404 Not Found", b"not found\n".to_vec()),
        None => ("400 Bad Request", Vec::new()),
    };
    let reply = format!(
        "HTTP/1.1 {status}\r\nContent-Type: text/plain; version=0.0.4; charset=utf-8\r\nContent-Length: {}\r\nConnection: close\r\n\r\n",
        body.len()
    );
    if let Err(e) = stream.write_all(reply.as_bytes()).and_then(|_| stream.write_all(&body)) {
        debug!(?e, "metrics client went away");
    }
}

/// Serves the registry as Prometheus text on `port` from a plain OS thread,
/// outside the tokio runtime.
pub fn serve_metrics(port: u16) {
    thread::spawn(move || {
        let addr = format!("0.0.0.0:{port}");
        let listener = match TcpListener::bind(&addr) {
            Ok(l) => l,
            Err(e) => {
                warn!(?e, %addr, "metrics bind failed, endpoint disabled");
                return;
            }
        };
        info!(%addr, "metrics endpoint up");
        for stream in listener.incoming().flatten() {
            respond(stream);
        }
    });
}
