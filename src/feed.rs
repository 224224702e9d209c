// ===============================
// src/feed.rs
// ===============================
//
// Paper market data: the future follows a random walk in whole ticks and the
// ETF tracks it with a small jitter, plus occasional dislocations of a few
// ticks that decay back. Both books are published every interval with five
// levels per side, future first, each with its own sequence number.
//
use rand::Rng;
use std::time::Duration;
use tokio::{sync::mpsc, time::sleep};
use tracing::info;

use crate::domain::{ExchangeEvent, Instrument, PriceLevel, TOP_LEVEL_COUNT};

#[derive(Debug, Clone)]
pub struct MockFeedCfg {
    pub tick_size: i64,
    pub start_ticks: i64,
    pub interval_ms: u64,
}

/// Five levels either side of `mid_ticks`, touch one tick away from mid.
pub fn ladder(mid_ticks: i64, tick_size: i64, rng: &mut impl Rng) -> ([PriceLevel; TOP_LEVEL_COUNT], [PriceLevel; TOP_LEVEL_COUNT]) {
    let mut asks = [PriceLevel::default(); TOP_LEVEL_COUNT];
    let mut bids = [PriceLevel::default(); TOP_LEVEL_COUNT];
    for i in 0..TOP_LEVEL_COUNT {
        let depth = 1 + i as i64;
        asks[i] = PriceLevel { price: (mid_ticks + depth) * tick_size, volume: rng.gen_range(5..200) };
        bids[i] = PriceLevel { price: ((mid_ticks - depth) * tick_size).max(0), volume: rng.gen_range(5..200) };
    }
    (asks, bids)
}

pub async fn run_mock(ev_tx: mpsc::Sender<ExchangeEvent>, cfg: MockFeedCfg) {
    info!(?cfg, "mock feed started");
    let mut fut_mid = cfg.start_ticks;
    let mut dislocation: i64 = 0;
    let mut seq: u64 = 0;

    loop {
        seq += 1;
        // build both books before awaiting; ThreadRng is not Send
        let (fut_book, etf_book, ticks) = {
            let mut rng = rand::thread_rng();
            fut_mid = (fut_mid + rng.gen_range(-1..=1)).max(10);
            if dislocation == 0 && rng.gen_bool(0.05) {
                dislocation = rng.gen_range(3..=6) * if rng.gen_bool(0.5) { 1 } else { -1 };
            } else {
                dislocation -= dislocation.signum();
            }
            let etf_mid = fut_mid + dislocation + rng.gen_range(-1..=1);
            (
                ladder(fut_mid, cfg.tick_size, &mut rng),
                ladder(etf_mid, cfg.tick_size, &mut rng),
                rng.gen_bool(0.2),
            )
        };

        let events = [
            ExchangeEvent::BookUpdate { instrument: Instrument::Future, sequence: seq, asks: fut_book.0, bids: fut_book.1 },
            ExchangeEvent::BookUpdate { instrument: Instrument::Etf, sequence: seq, asks: etf_book.0, bids: etf_book.1 },
        ];
        for ev in events {
            if ev_tx.send(ev).await.is_err() {
                info!("mock feed stopped");
                return;
            }
        }
        if ticks {
            let _ = ev_tx.send(ExchangeEvent::TradeTicks { instrument: Instrument::Etf, sequence: seq }).await;
        }
        sleep(Duration::from_millis(cfg.interval_ms)).await;
    }
}
