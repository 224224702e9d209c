// ===============================
// src/dispatcher.rs (exchange callbacks -> ledger / exposure / strategy)
// ===============================
//
// One task owns the ledger, the exposure tracker, the strategy and the
// spread window, and handles callbacks strictly one after another. The only
// work that leaves this task is the threshold recompute, which gets a copy
// of the window and answers through a watch channel.
//
use chrono::Utc;
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, warn};

use crate::config::Limits;
use crate::domain::{Event, ExchangeEvent, Instrument, OrderBookSnapshot, OrderId, Side};
use crate::exposure::{ExposureState, ExposureTracker};
use crate::gateway::Exchange;
use crate::ledger::{LedgerError, OrderLedger, StatusOutcome};
use crate::metrics::{BOOK_UPDATES, CONSISTENCY_ERRORS, FILLS, ORDER_ERRORS};
use crate::strategy::SpreadArb;
use crate::threshold::{Threshold, ThresholdEstimator};

#[derive(Debug, Clone, PartialEq)]
pub struct Summary {
    pub exposure: ExposureState,
    pub live_orders: usize,
    pub threshold: Threshold,
}

pub struct Dispatcher<X: Exchange> {
    ledger: OrderLedger,
    exposure: ExposureTracker,
    strategy: SpreadArb,
    estimator: ThresholdEstimator,
    exchange: X,
}

impl<X: Exchange> Dispatcher<X> {
    pub fn new(limits: Limits, estimator: ThresholdEstimator, exchange: X) -> Self {
        Self {
            ledger: OrderLedger::new(),
            exposure: ExposureTracker::new(limits.position_limit),
            strategy: SpreadArb::new(limits),
            estimator,
            exchange,
        }
    }

    #[cfg(test)]
    pub fn ledger(&self) -> &OrderLedger { &self.ledger }
    #[cfg(test)]
    pub fn exposure(&self) -> &ExposureTracker { &self.exposure }
    #[cfg(test)]
    pub fn estimator(&self) -> &ThresholdEstimator { &self.estimator }
    #[cfg(test)]
    pub fn exchange(&self) -> &X { &self.exchange }

    pub fn summary(&self) -> Summary {
        Summary {
            exposure: self.exposure.state(),
            live_orders: self.ledger.active_order_count(),
            threshold: self.estimator.current(),
        }
    }

    /// Handles one callback; consistency errors are counted and logged.
    pub fn dispatch(&mut self, ev: ExchangeEvent) {
        if let Err(e) = self.handle(ev) {
            CONSISTENCY_ERRORS.with_label_values(&[e.kind()]).inc();
            warn!(error = %e, "callback does not match the order ledger");
        }
        self.exposure.publish(self.ledger.active_order_count());
    }

    pub fn handle(&mut self, ev: ExchangeEvent) -> Result<(), LedgerError> {
        match ev {
            ExchangeEvent::BookUpdate { instrument, sequence, asks, bids } => {
                self.on_book_update(OrderBookSnapshot { instrument, sequence, asks, bids });
                Ok(())
            }
            ExchangeEvent::TradeTicks { instrument, sequence } => {
                debug!(%instrument, sequence, "trade ticks");
                Ok(())
            }
            ExchangeEvent::OrderFilled { order_id, price, volume } => self.on_order_filled(order_id, price, volume),
            ExchangeEvent::OrderStatus { order_id, filled_volume, remaining_volume, fees } => {
                self.on_order_status(order_id, filled_volume, remaining_volume, fees)
            }
            ExchangeEvent::Error { order_id, message } => {
                self.on_error(order_id, &message);
                Ok(())
            }
            ExchangeEvent::HedgeFilled { order_id, price, volume } => {
                info!(order_id, price, volume, "hedge filled");
                Ok(())
            }
            ExchangeEvent::Disconnected => {
                warn!("execution connection lost");
                Ok(())
            }
        }
    }

    fn on_book_update(&mut self, snap: OrderBookSnapshot) {
        let instrument = snap.instrument;
        BOOK_UPDATES.with_label_values(&[instrument.as_str()]).inc();
        debug!(%instrument, seq = snap.sequence, bid = ?snap.best_bid(), ask = ?snap.best_ask(), "order book");
        if !self.strategy.update_book(snap) || instrument != Instrument::PRIMARY {
            return;
        }

        // threshold as published before this evaluation started
        let threshold = self.estimator.current();
        let eval = self.strategy.evaluate(threshold.value, &mut self.ledger, &mut self.exposure, &mut self.exchange);
        if let Some(samples) = eval.samples {
            for s in samples {
                self.estimator.observe(s);
            }
            let generation = self.estimator.request_recompute();
            debug!(threshold = threshold.value, used_generation = threshold.generation, requested = generation, "evaluated");
        }
    }

    fn on_order_filled(&mut self, id: OrderId, price: i64, volume: i64) -> Result<(), LedgerError> {
        let fill = self.ledger.record_fill(id, volume, price, &mut self.exposure)?;
        FILLS.with_label_values(&[fill.side.as_str()]).inc_by(volume as u64);
        info!(id, price, volume, remaining = fill.remaining, position = self.exposure.position(), "order filled");

        // offset in the future at any price
        let limits = self.strategy.limits();
        let (hedge_side, hedge_px) = match fill.side {
            Side::Buy => (Side::Sell, limits.min_bid_nearest_tick()),
            Side::Sell => (Side::Buy, limits.max_ask_nearest_tick()),
        };
        let hedge_id = self.ledger.allocate_id();
        self.exchange.submit_hedge_order(hedge_id, hedge_side, hedge_px, volume);
        Ok(())
    }

    fn on_order_status(&mut self, id: OrderId, filled: i64, remaining: i64, fees: i64) -> Result<(), LedgerError> {
        let outcome = self.ledger.record_status(id, filled, remaining, fees, &mut self.exposure)?;
        match outcome {
            StatusOutcome::Working { remaining } => debug!(id, filled, remaining, "order working"),
            StatusOutcome::Cancelled { side, released } => {
                info!(id, side = side.as_str(), released, fees, "order closed")
            }
            StatusOutcome::TakerDone { side, filled } => {
                info!(id, side = side.as_str(), filled, fees, position = self.exposure.position(), "unwind done")
            }
            StatusOutcome::Acknowledged => debug!(id, fees, "fill confirmed"),
        }
        Ok(())
    }

    fn on_error(&mut self, id: OrderId, message: &str) {
        ORDER_ERRORS.inc();
        warn!(id, %message, "exchange error");
        if id == 0 {
            return;
        }
        if let Some(outcome) = self.ledger.record_error(id, &mut self.exposure) {
            info!(id, ?outcome, "errored order dropped");
        }
    }

    /// Consumes callbacks until the channel closes or shutdown is signalled.
    pub async fn run(
        mut self,
        mut rx: mpsc::Receiver<ExchangeEvent>,
        rec_tx: Option<mpsc::Sender<Event>>,
        mut shutdown: watch::Receiver<bool>,
    ) -> Summary {
        loop {
            tokio::select! {
                maybe_ev = rx.recv() => match maybe_ev {
                    Some(ev) => {
                        if let Some(rec) = &rec_tx {
                            let ts_ns = Utc::now().timestamp_nanos_opt().unwrap_or(0) as i128;
                            let _ = rec.try_send(Event::In { ts_ns, event: ev.clone() });
                        }
                        self.dispatch(ev);
                    }
                    None => break,
                },
                _ = shutdown.changed() => break,
            }
        }
        let summary = self.summary();
        info!(
            position = summary.exposure.position,
            potential_bid = summary.exposure.potential_bid,
            potential_ask = summary.exposure.potential_ask,
            live_orders = summary.live_orders,
            threshold = summary.threshold.value,
            "session finished"
        );
        summary
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use rand::{rngs::StdRng, Rng, SeedableRng};
    use tokio::time::timeout;

    use crate::config::ThresholdCfg;
    use crate::domain::{ExchangeCommand, Lifespan, PriceLevel, TOP_LEVEL_COUNT};
    use crate::gateway::testkit::RecordingExchange;

    fn book(instrument: Instrument, sequence: u64, bid: i64, ask: i64) -> ExchangeEvent {
        let mut bids = [PriceLevel::default(); TOP_LEVEL_COUNT];
        let mut asks = [PriceLevel::default(); TOP_LEVEL_COUNT];
        bids[0] = PriceLevel { price: bid, volume: 40 };
        asks[0] = PriceLevel { price: ask, volume: 40 };
        ExchangeEvent::BookUpdate { instrument, sequence, asks, bids }
    }

    struct Session {
        d: Dispatcher<RecordingExchange>,
        seq: u64,
    }

    impl Session {
        fn new(threshold: ThresholdCfg) -> Self {
            let (estimator, _worker) = ThresholdEstimator::spawn(&threshold);
            Self { d: Dispatcher::new(Limits::default(), estimator, RecordingExchange::default()), seq: 0 }
        }
        fn books(&mut self, etf: (i64, i64), fut: (i64, i64)) {
            self.seq += 1;
            self.d.handle(book(Instrument::Future, self.seq, fut.0, fut.1)).unwrap();
            self.d.handle(book(Instrument::Etf, self.seq, etf.0, etf.1)).unwrap();
        }
        fn last_insert_id(&self) -> OrderId {
            match self.d.exchange().inserts().last() {
                Some(ExchangeCommand::Insert { id, .. }) => *id,
                _ => panic!("no insert sent"),
            }
        }
    }

    #[tokio::test]
    async fn entry_fill_hedge_and_cancel_flow() {
        let mut s = Session::new(ThresholdCfg::default());

        // bid at 1100 for 20 lots
        s.books((1000, 1001), (1200, 1201));
        let bid = s.last_insert_id();
        assert_eq!(s.d.exposure().potential_bid(), 20);
        assert_eq!(s.d.ledger().active_order_count(), 1);

        // full fill: retired, long 20, hedge sold at the floor
        s.d.handle(ExchangeEvent::OrderFilled { order_id: bid, price: 1100, volume: 20 }).unwrap();
        assert_eq!(s.d.ledger().active_order_count(), 0);
        assert_eq!(s.d.exposure().position(), 20);
        assert_eq!(s.d.exposure().potential_ask(), 20);
        match s.d.exchange().hedges().as_slice() {
            [ExchangeCommand::Hedge { id, side, price, volume }] => {
                assert!(*id > bid);
                assert_eq!((*side, *price, *volume), (Side::Sell, 100, 20));
            }
            other => panic!("unexpected hedges {other:?}"),
        }
        s.d.handle(ExchangeEvent::OrderStatus { order_id: bid, filled_volume: 20, remaining_volume: 0, fees: -1 }).unwrap();
        assert_eq!(s.d.ledger().active_order_count(), 0);

        // another bid rests, then the spread collapses
        s.books((1000, 1001), (1200, 1201));
        let bid2 = s.last_insert_id();
        assert_eq!(s.d.exposure().potential_bid(), 40);
        s.books((1000, 1001), (1100, 1201));
        assert_eq!(s.d.exchange().cancels(), vec![bid2]);
        assert_eq!(s.d.exposure().potential_bid(), 40);

        s.d.handle(ExchangeEvent::OrderStatus { order_id: bid2, filled_volume: 0, remaining_volume: 0, fees: 0 }).unwrap();
        assert_eq!(s.d.exposure().potential_bid(), 20);
        assert_eq!(s.d.ledger().active_order_count(), 0);

        // duplicate terminal status is reported and changes nothing
        let before = s.d.exposure().state();
        let err = s.d.handle(ExchangeEvent::OrderStatus { order_id: bid2, filled_volume: 0, remaining_volume: 0, fees: 0 });
        assert_eq!(err, Err(LedgerError::AlreadyTerminal(bid2)));
        assert_eq!(s.d.exposure().state(), before);
    }

    #[tokio::test]
    async fn exchange_error_releases_reservation() {
        let mut s = Session::new(ThresholdCfg::default());
        s.books((1000, 1001), (1200, 1201));
        let bid = s.last_insert_id();

        s.d.dispatch(ExchangeEvent::Error { order_id: bid, message: "invalid price".into() });
        assert_eq!(s.d.exposure().potential_bid(), 0);
        assert_eq!(s.d.ledger().active_order_count(), 0);

        // errors for unknown or zero ids are absorbed
        s.d.handle(ExchangeEvent::Error { order_id: 0, message: "rate limit".into() }).unwrap();
        s.d.handle(ExchangeEvent::Error { order_id: 999, message: "?".into() }).unwrap();
    }

    #[tokio::test]
    async fn unknown_fill_is_a_consistency_error() {
        let mut s = Session::new(ThresholdCfg::default());
        let err = s.d.handle(ExchangeEvent::OrderFilled { order_id: 5, price: 1000, volume: 1 });
        assert_eq!(err, Err(LedgerError::UnknownOrder(5)));
        assert!(s.d.exchange().hedges().is_empty());
        assert_eq!(s.d.exposure().state(), ExposureState::default());
    }

    #[tokio::test]
    async fn secondary_updates_only_refresh_cache() {
        let mut s = Session::new(ThresholdCfg::default());
        s.d.handle(book(Instrument::Etf, 1, 1000, 1001)).unwrap();
        s.d.handle(book(Instrument::Future, 1, 1200, 1201)).unwrap();
        assert!(s.d.exchange().commands.is_empty());
        assert!(s.d.estimator().window().is_empty());

        s.d.handle(book(Instrument::Etf, 2, 1000, 1001)).unwrap();
        assert_eq!(s.d.exchange().inserts().len(), 1);
        assert_eq!(s.d.estimator().window().len(), 2);
    }

    #[tokio::test]
    async fn noise_only_window_keeps_threshold() {
        let mut s = Session::new(ThresholdCfg::default());
        let mut rx = s.d.estimator().subscribe();
        // samples of ~0.09 and negative both fall outside (0.0005, 0.001)
        s.books((1000, 1001), (1200, 1201));
        timeout(Duration::from_secs(1), rx.changed()).await.unwrap().unwrap();
        assert_eq!(s.d.estimator().current(), Threshold { value: 0.002, generation: 1 });
    }

    #[tokio::test]
    async fn next_cycle_uses_published_threshold() {
        let cfg = ThresholdCfg { ceiling: 0.5, ..ThresholdCfg::default() };
        let mut s = Session::new(cfg);
        let mut rx = s.d.estimator().subscribe();

        s.books((1000, 1001), (1200, 1201));
        let bid = s.last_insert_id();
        timeout(Duration::from_secs(1), rx.changed()).await.unwrap().unwrap();
        let t = s.d.estimator().current();
        assert!((t.value - 100.0 / 1100.0).abs() < 1e-12);

        // 50 lots of spread clears 0.002 but not ~0.09
        s.books((1000, 1001), (1150, 1201));
        assert_eq!(s.d.exchange().inserts().len(), 1);
        assert_eq!(s.d.exchange().cancels(), vec![bid]);
    }

    #[tokio::test]
    async fn unwind_is_settled_by_status() {
        let mut s = Session::new(ThresholdCfg::default());
        s.books((1000, 1001), (1200, 1201));
        let bid = s.last_insert_id();
        s.d.handle(ExchangeEvent::OrderFilled { order_id: bid, price: 1100, volume: 20 }).unwrap();
        s.d.handle(ExchangeEvent::OrderStatus { order_id: bid, filled_volume: 20, remaining_volume: 0, fees: 0 }).unwrap();

        // books cross back: sell 20 fill-and-kill at the ETF bid
        s.books((1300, 1400), (1200, 1250));
        let exit = match s.d.exchange().inserts().as_slice() {
            [.., ExchangeCommand::Insert { id, side: Side::Sell, lifespan: Lifespan::FillAndKill, volume: 20, .. }] => *id,
            other => panic!("unexpected inserts {other:?}"),
        };
        s.d.handle(ExchangeEvent::OrderFilled { order_id: exit, price: 1300, volume: 20 }).unwrap();
        assert!(s.d.ledger().contains(exit));
        s.d.handle(ExchangeEvent::OrderStatus { order_id: exit, filled_volume: 20, remaining_volume: 0, fees: 2 }).unwrap();
        assert!(!s.d.ledger().contains(exit));
        assert_eq!(s.d.exposure().position(), 0);
        assert_eq!(s.d.exposure().outstanding(Side::Buy), 0);

        // hedge buys back the future at the cap
        match s.d.exchange().hedges().last() {
            Some(ExchangeCommand::Hedge { side, price, volume, .. }) => {
                assert_eq!((*side, *price, *volume), (Side::Buy, 2_147_483_600, 20))
            }
            other => panic!("unexpected hedge {other:?}"),
        }
    }

    /// Random books and random exchange answers; the ledger and the exposure
    /// projections must agree after every single callback.
    #[tokio::test]
    async fn exposure_never_drifts_from_live_orders() {
        let mut s = Session::new(ThresholdCfg::default());
        let mut rng = StdRng::seed_from_u64(7);
        let limit = s.d.exposure().position_limit();

        for _ in 0..2_000 {
            let sent_before = s.d.exchange().commands.len();
            let etf_bid = rng.gen_range(900..1100);
            let etf_ask = etf_bid + rng.gen_range(1..300);
            let fut_bid = etf_bid + rng.gen_range(-300..300);
            let fut_ask = fut_bid + rng.gen_range(1..300);
            s.books((etf_bid, etf_ask), (fut_bid, fut_ask));

            // every resting order accepted this round fit under the limit
            for c in &s.d.exchange().commands[sent_before..] {
                match c {
                    ExchangeCommand::Insert { side: Side::Buy, lifespan: Lifespan::GoodTillCancelled, .. } => {
                        assert!(s.d.exposure().potential_bid() <= limit)
                    }
                    ExchangeCommand::Insert { side: Side::Sell, lifespan: Lifespan::GoodTillCancelled, .. } => {
                        assert!(s.d.exposure().potential_ask() >= -limit)
                    }
                    _ => {}
                }
            }
            assert!(s.d.ledger().active_order_count() <= s.d.strategy.limits().active_orders_limit);

            // answer some live orders the way a matching engine might
            let live: Vec<_> = [Side::Buy, Side::Sell]
                .iter()
                .flat_map(|side| s.d.ledger().live_on(*side).into_iter().cloned().collect::<Vec<_>>())
                .collect();
            for o in live {
                match rng.gen_range(0..6) {
                    0 if o.remaining_volume > 0 => {
                        let v = rng.gen_range(1..=o.remaining_volume);
                        s.d.handle(ExchangeEvent::OrderFilled { order_id: o.id, price: o.price, volume: v }).unwrap();
                        let left = o.remaining_volume - v;
                        s.d.handle(ExchangeEvent::OrderStatus {
                            order_id: o.id,
                            filled_volume: o.filled_volume() + v,
                            remaining_volume: if o.is_fak() { 0 } else { left },
                            fees: 0,
                        })
                        .unwrap();
                    }
                    1 if o.cancel_requested || o.is_fak() => {
                        s.d.handle(ExchangeEvent::OrderStatus {
                            order_id: o.id,
                            filled_volume: o.filled_volume(),
                            remaining_volume: 0,
                            fees: 0,
                        })
                        .unwrap();
                    }
                    2 => s.d.dispatch(ExchangeEvent::Error { order_id: o.id, message: "reject".into() }),
                    _ => {}
                }
            }

            let x = s.d.exposure();
            for side in [Side::Buy, Side::Sell] {
                let resting: i64 = s
                    .d
                    .ledger()
                    .live_on(side)
                    .iter()
                    .filter(|o| !o.is_fak())
                    .map(|o| o.remaining_volume)
                    .sum();
                assert_eq!(x.outstanding(side), resting, "{side:?} projection drifted");
            }
        }
    }

    #[tokio::test]
    async fn run_stops_on_shutdown_and_reports() {
        let (estimator, _worker) = ThresholdEstimator::spawn(&ThresholdCfg::default());
        let d = Dispatcher::new(Limits::default(), estimator, RecordingExchange::default());
        let (tx, rx) = mpsc::channel(16);
        let (rec_tx, mut rec_rx) = mpsc::channel(16);
        let (stop_tx, stop_rx) = watch::channel(false);
        let task = tokio::spawn(d.run(rx, Some(rec_tx), stop_rx));

        tx.send(book(Instrument::Future, 1, 1200, 1201)).await.unwrap();
        tx.send(book(Instrument::Etf, 1, 1000, 1001)).await.unwrap();
        assert!(matches!(rec_rx.recv().await, Some(Event::In { .. })));
        assert!(matches!(rec_rx.recv().await, Some(Event::In { .. })));

        stop_tx.send(true).unwrap();
        let summary = timeout(Duration::from_secs(1), task).await.unwrap().unwrap();
        assert_eq!(summary.live_orders, 1);
        assert_eq!(summary.exposure.potential_bid, 20);
    }
}
