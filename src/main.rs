// ===============================
// src/main.rs
// ===============================
/*
 # run a 60s paper session with a journal
 cargo run --release -- --duration-secs 60 --record-file data/session.jsonl

 # exposure & threshold while it runs
 curl -s localhost:9898/metrics | egrep '^(position_lots|potential_|active_orders|entry_threshold)'
*/
/*
=============================================================================
Project : etf_arb_bot: ETF/future spread arbitrage agent in Rust
Module  : main.rs
Version : 0.1.0
License : MIT (see LICENSE)

Summary : Quotes the ETF whenever its book is dislocated from the future by
          more than an adaptive threshold, hedges every fill in the future,
          and unwinds the ETF position once the two books cross back.
=============================================================================
*/
mod config;
mod dispatcher;
mod domain;
mod exposure;
mod feed;
mod gateway; // Exchange trait + paper venue
mod ledger;
mod metrics;
mod recorder;
mod strategy;
mod threshold;

use clap::Parser;
use tokio::{
    sync::{mpsc, watch},
    time::Duration,
};
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use crate::dispatcher::Dispatcher;
use crate::domain::{Event, ExchangeCommand, ExchangeEvent};
use crate::gateway::ChannelExchange;
use crate::threshold::ThresholdEstimator;

#[tokio::main]
async fn main() {
    // ---- Logging ----
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    // ---- Config ----
    let cli = config::Cli::parse();
    let settings = match config::load(&cli) {
        Ok(s) => s,
        Err(e) => {
            error!(%e, "invalid configuration");
            std::process::exit(2);
        }
    };
    let args = settings.args.clone();
    let limits = settings.limits.clone();
    info!(
        max_lot_size = limits.max_lot_size,
        position_limit = limits.position_limit,
        tick_size = limits.tick_size,
        active_orders_limit = limits.active_orders_limit,
        threshold = settings.threshold.initial,
        zero_lower_bound = settings.threshold.zero_lower_bound,
        window = settings.threshold.window,
        record_file = ?args.record_file,
        "startup config"
    );

    // ---- Metrics ----
    metrics::init();
    if let Some(port) = args.metrics_port {
        metrics::serve_metrics(port);
    }

    // ---- Buses ----
    let (ev_tx, ev_rx) = mpsc::channel::<ExchangeEvent>(4096);
    let (cmd_tx, cmd_rx) = mpsc::channel::<ExchangeCommand>(2048);

    // ---- Recorder (optional) ----
    let (rec_tx, rec_task) = match args.record_file.clone() {
        Some(path) => {
            let (tx, rx) = mpsc::channel::<Event>(8192);
            (Some(tx), Some(tokio::spawn(recorder::run(rx, path))))
        }
        None => (None, None),
    };
    if let Some(rec) = &rec_tx {
        let _ = rec.try_send(Event::Note(format!("session start, limits {limits:?}")));
    }

    // ---- Paper venue + feed ----
    tokio::spawn(gateway::run_venue(cmd_rx, ev_tx.clone(), 2));
    tokio::spawn(feed::run_mock(
        ev_tx.clone(),
        feed::MockFeedCfg { tick_size: limits.tick_size, start_ticks: 1_000, interval_ms: args.feed_interval_ms },
    ));
    drop(ev_tx);

    // ---- Threshold worker + dispatcher ----
    let (estimator, worker) = ThresholdEstimator::spawn(&settings.threshold);
    let exchange = ChannelExchange::new(cmd_tx, rec_tx.clone());
    let dispatcher = Dispatcher::new(limits, estimator, exchange);

    let (stop_tx, stop_rx) = watch::channel(false);
    let session = tokio::spawn(dispatcher.run(ev_rx, rec_tx, stop_rx));

    // ---- Stop on Ctrl-C or after --duration-secs ----
    let deadline = async {
        match args.duration_secs {
            Some(secs) => tokio::time::sleep(Duration::from_secs(secs)).await,
            None => std::future::pending::<()>().await,
        }
    };
    tokio::select! {
        _ = tokio::signal::ctrl_c() => info!("ctrl-c received"),
        _ = deadline => info!("session duration reached"),
    }
    let _ = stop_tx.send(true);

    match session.await {
        Ok(summary) => info!(?summary, "final state"),
        Err(e) => error!(?e, "dispatcher task failed"),
    }
    // estimator and recorder senders went down with the dispatcher
    let _ = worker.await;
    if let Some(task) = rec_task {
        let _ = task.await;
    }
}
