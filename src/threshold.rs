// ===============================
// src/threshold.rs (adaptive entry threshold)
// ===============================
//
// The entry threshold tracks the mean of recent normalised spreads that were
// wide enough to matter but not absurd. Samples live in a fixed-size FIFO
// owned by the dispatcher. A recompute request hands a frozen copy of that
// window to a single background worker over a `watch` slot: while the worker
// is busy, newer requests overwrite older ones, so at most one computation
// runs and the pending one is always the latest. Results are published
// through a second `watch` channel, which swaps the whole value at once.
//
use std::collections::VecDeque;
use std::sync::Arc;

use serde::Serialize;
use tokio::{sync::watch, task::JoinHandle};
use tracing::{debug, info};

use crate::config::ThresholdCfg;
use crate::metrics::{THRESHOLD, THRESHOLD_COALESCED, THRESHOLD_RECOMPUTES};

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct Threshold {
    pub value: f64,
    /// Request generation this value was computed from; 0 = initial.
    pub generation: u64,
}

#[derive(Debug, Clone)]
pub struct SpreadWindow {
    samples: VecDeque<f64>,
    cap: usize,
}

impl SpreadWindow {
    pub fn new(cap: usize) -> Self {
        Self { samples: VecDeque::with_capacity(cap), cap }
    }
    pub fn push(&mut self, sample: f64) {
        if self.samples.len() == self.cap {
            self.samples.pop_front();
        }
        self.samples.push_back(sample);
    }
    #[cfg(test)]
    pub fn len(&self) -> usize { self.samples.len() }
    #[cfg(test)]
    pub fn is_empty(&self) -> bool { self.samples.is_empty() }
    pub fn snapshot(&self) -> Arc<[f64]> { self.samples.iter().copied().collect() }
}

/// Mean of the samples strictly inside `(floor, ceiling)`, or `fallback`
/// when none qualify.
pub fn recompute(samples: &[f64], floor: f64, ceiling: f64, fallback: f64) -> f64 {
    let (sum, n) = samples
        .iter()
        .filter(|s| **s > floor && **s < ceiling)
        .fold((0.0, 0usize), |(sum, n), s| (sum + s, n + 1));
    if n == 0 { fallback } else { sum / n as f64 }
}

#[derive(Debug, Clone)]
struct Request {
    generation: u64,
    samples: Arc<[f64]>,
}

pub struct ThresholdEstimator {
    window: SpreadWindow,
    submitted: u64,
    req_tx: watch::Sender<Option<Request>>,
    published: watch::Receiver<Threshold>,
}

impl ThresholdEstimator {
    /// Starts the recompute worker; it stops once the estimator is dropped.
    pub fn spawn(cfg: &ThresholdCfg) -> (Self, JoinHandle<()>) {
        let (req_tx, req_rx) = watch::channel::<Option<Request>>(None);
        let (pub_tx, published) = watch::channel(Threshold { value: cfg.initial, generation: 0 });
        THRESHOLD.set(cfg.initial);
        let worker = tokio::spawn(run_worker(req_rx, pub_tx, cfg.zero_lower_bound, cfg.ceiling));
        let est = Self { window: SpreadWindow::new(cfg.window), submitted: 0, req_tx, published };
        (est, worker)
    }

    /// Latest published threshold.
    pub fn current(&self) -> Threshold { *self.published.borrow() }

    #[cfg(test)]
    pub fn subscribe(&self) -> watch::Receiver<Threshold> { self.published.clone() }

    #[cfg(test)]
    pub fn window(&self) -> &SpreadWindow { &self.window }

    pub fn observe(&mut self, sample: f64) {
        if sample.is_finite() {
            self.window.push(sample);
        }
    }

    /// Queues a recompute over the window as it is right now.
    pub fn request_recompute(&mut self) -> u64 {
        self.submitted += 1;
        let req = Request { generation: self.submitted, samples: self.window.snapshot() };
        self.req_tx.send_replace(Some(req));
        self.submitted
    }
}

async fn run_worker(
    mut req_rx: watch::Receiver<Option<Request>>,
    pub_tx: watch::Sender<Threshold>,
    floor: f64,
    ceiling: f64,
) {
    let mut last_generation = 0u64;
    while req_rx.changed().await.is_ok() {
        let Some(req) = req_rx.borrow_and_update().clone() else { continue };
        if req.generation <= last_generation {
            continue;
        }
        let skipped = req.generation - last_generation - 1;
        if skipped > 0 {
            THRESHOLD_COALESCED.inc_by(skipped);
        }
        last_generation = req.generation;

        let fallback = pub_tx.borrow().value;
        let value = recompute(&req.samples, floor, ceiling, fallback);
        pub_tx.send_replace(Threshold { value, generation: req.generation });
        THRESHOLD.set(value);
        THRESHOLD_RECOMPUTES.inc();
        debug!(generation = req.generation, samples = req.samples.len(), value, "threshold published");
    }
    info!("threshold worker stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tokio::time::timeout;

    fn cfg() -> ThresholdCfg {
        ThresholdCfg { initial: 0.002, zero_lower_bound: 0.0005, ceiling: 0.001, window: 4 }
    }

    #[test]
    fn window_drops_oldest_first() {
        let mut w = SpreadWindow::new(3);
        for s in [1.0, 2.0, 3.0, 4.0] {
            w.push(s);
        }
        assert_eq!(&*w.snapshot(), &[2.0, 3.0, 4.0]);
    }

    #[test]
    fn recompute_filters_bounds_strictly() {
        let samples = [0.0005, 0.0006, 0.0008, 0.001, -0.01, 0.5];
        let v = recompute(&samples, 0.0005, 0.001, 0.002);
        assert!((v - 0.0007).abs() < 1e-12);
    }

    #[test]
    fn recompute_falls_back_when_nothing_qualifies() {
        assert_eq!(recompute(&[], 0.0005, 0.001, 0.002), 0.002);
        assert_eq!(recompute(&[0.0, 0.0004, 0.003], 0.0005, 0.001, 0.0031), 0.0031);
    }

    #[tokio::test]
    async fn publishes_mean_of_snapshot() {
        let (mut est, _worker) = ThresholdEstimator::spawn(&cfg());
        let mut rx = est.subscribe();
        est.observe(0.0006);
        est.observe(0.0009);
        let generation = est.request_recompute();
        // later samples do not leak into the submitted snapshot
        est.observe(0.0007);

        timeout(Duration::from_secs(1), rx.changed()).await.unwrap().unwrap();
        let t = est.current();
        assert_eq!(t.generation, generation);
        assert!((t.value - 0.00075).abs() < 1e-12);
    }

    #[tokio::test]
    async fn keeps_prior_threshold_when_window_is_noise() {
        let (mut est, _worker) = ThresholdEstimator::spawn(&cfg());
        let mut rx = est.subscribe();
        for s in [0.0, 0.0001, 0.0004, 0.002] {
            est.observe(s);
        }
        est.request_recompute();
        timeout(Duration::from_secs(1), rx.changed()).await.unwrap().unwrap();
        assert_eq!(est.current(), Threshold { value: 0.002, generation: 1 });
    }

    #[tokio::test]
    async fn back_to_back_requests_coalesce() {
        // current-thread runtime: the worker cannot run until we yield
        let (mut est, _worker) = ThresholdEstimator::spawn(&cfg());
        let mut rx = est.subscribe();
        est.observe(0.0006);
        est.request_recompute();
        est.observe(0.0008);
        est.request_recompute();
        est.observe(0.0009);
        let last = est.request_recompute();

        timeout(Duration::from_secs(1), rx.changed()).await.unwrap().unwrap();
        let t = *rx.borrow_and_update();
        assert_eq!(t.generation, last);
        assert!((t.value - (0.0006 + 0.0008 + 0.0009) / 3.0).abs() < 1e-12);

        for _ in 0..10 {
            tokio::task::yield_now().await;
        }
        assert!(!rx.has_changed().unwrap());
    }

    #[tokio::test]
    async fn worker_stops_with_estimator() {
        let (est, worker) = ThresholdEstimator::spawn(&cfg());
        drop(est);
        timeout(Duration::from_secs(1), worker).await.unwrap().unwrap();
    }
}
