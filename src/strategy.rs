// ===============================
// src/strategy.rs
// ===============================
//
// ETF/future spread arbitrage.
//
// Two "realistic" spreads are watched on every ETF update, both priced one
// tick inside the ETF touch so that our quote improves the book:
//   buy side : future best bid - (ETF best bid + tick)
//   sell side: (ETF best ask - tick) - future best ask
// A bid rests there when its spread is at least `threshold` times our bid
// price, an ask when its spread is at least `threshold` times the future ask
// (and every fill is hedged in the future). When it falls back
// below, every resting order on that side is pulled. A position left over is
// flattened with a fill-and-kill order as soon as the books cross back.
//
use ahash::AHashMap as HashMap;
use tracing::{debug, info};

use crate::config::Limits;
use crate::domain::{Instrument, Lifespan, NewOrder, OrderBookSnapshot, OrderId, Side};
use crate::exposure::ExposureTracker;
use crate::gateway::Exchange;
use crate::ledger::OrderLedger;
use crate::metrics::{BOOK_STALE, ORDERS, SIGNALS};

/// Best prices of both books for one evaluation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Quotes {
    pub etf_bid: i64,
    pub etf_ask: i64,
    pub fut_bid: i64,
    pub fut_ask: i64,
}

/// What one evaluation did.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Evaluation {
    pub inserted: Vec<OrderId>,
    pub cancelled: Vec<OrderId>,
    pub exit: Option<OrderId>,
    /// Normalised buy-side and sell-side spreads, in that order.
    pub samples: Option<[f64; 2]>,
}

pub struct SpreadArb {
    limits: Limits,
    books: HashMap<Instrument, OrderBookSnapshot>,
}

impl SpreadArb {
    pub fn new(limits: Limits) -> Self {
        Self { limits, books: HashMap::new() }
    }

    pub fn limits(&self) -> &Limits { &self.limits }
    #[cfg(test)]
    pub fn book(&self, instrument: Instrument) -> Option<&OrderBookSnapshot> { self.books.get(&instrument) }

    /// Replaces the cached book. Returns false (and keeps the old one) when
    /// the update is not newer than what we already hold.
    pub fn update_book(&mut self, snap: OrderBookSnapshot) -> bool {
        if let Some(prev) = self.books.get(&snap.instrument) {
            if snap.sequence <= prev.sequence {
                BOOK_STALE.with_label_values(&[snap.instrument.as_str()]).inc();
                debug!(instrument = %snap.instrument, seq = snap.sequence, last = prev.sequence, "stale book dropped");
                return false;
            }
        }
        self.books.insert(snap.instrument, snap);
        true
    }

    pub fn quotes(&self) -> Option<Quotes> {
        let etf = self.books.get(&Instrument::Etf)?;
        let fut = self.books.get(&Instrument::Future)?;
        Some(Quotes {
            etf_bid: etf.best_bid()?,
            etf_ask: etf.best_ask()?,
            fut_bid: fut.best_bid()?,
            fut_ask: fut.best_ask()?,
        })
    }

    fn bid_quote(&self, q: &Quotes) -> i64 { q.etf_bid + self.limits.tick_size }
    fn ask_quote(&self, q: &Quotes) -> i64 { q.etf_ask - self.limits.tick_size }

    pub fn buy_spread(&self, q: &Quotes) -> i64 { q.fut_bid - self.bid_quote(q) }
    pub fn sell_spread(&self, q: &Quotes) -> i64 { self.ask_quote(q) - q.fut_ask }

    pub fn buy_signal(&self, q: &Quotes, threshold: f64) -> bool {
        self.buy_spread(q) as f64 >= threshold * self.bid_quote(q) as f64
    }
    pub fn sell_signal(&self, q: &Quotes, threshold: f64) -> bool {
        self.sell_spread(q) as f64 >= threshold * q.fut_ask as f64
    }

    fn room_for_order(&self, ledger: &OrderLedger) -> bool {
        ledger.active_order_count() < self.limits.active_orders_limit
    }

    /// Runs entry, cancellation and exit against the cached books.
    pub fn evaluate(
        &mut self,
        threshold: f64,
        ledger: &mut OrderLedger,
        exposure: &mut ExposureTracker,
        exchange: &mut dyn Exchange,
    ) -> Evaluation {
        let mut eval = Evaluation::default();
        let Some(q) = self.quotes() else {
            debug!("books incomplete, skipping evaluation");
            return eval;
        };
        let buy_ok = self.buy_signal(&q, threshold);
        let sell_ok = self.sell_signal(&q, threshold);

        // entry
        if buy_ok {
            if let Some(id) = self.enter(Side::Buy, self.bid_quote(&q), ledger, exposure, exchange) {
                eval.inserted.push(id);
            }
        }
        if sell_ok {
            if let Some(id) = self.enter(Side::Sell, self.ask_quote(&q), ledger, exposure, exchange) {
                eval.inserted.push(id);
            }
        }

        // cancel
        if !buy_ok {
            eval.cancelled.extend(Self::pull_side(Side::Buy, ledger, exchange));
        }
        if !sell_ok {
            eval.cancelled.extend(Self::pull_side(Side::Sell, ledger, exchange));
        }

        // exit
        eval.exit = self.exit(&q, ledger, exposure, exchange);

        let bid_px = self.bid_quote(&q) as f64;
        let ask_px = self.ask_quote(&q) as f64;
        eval.samples = Some([self.buy_spread(&q) as f64 / bid_px, self.sell_spread(&q) as f64 / ask_px]);
        eval
    }

    fn enter(
        &self,
        side: Side,
        price: i64,
        ledger: &mut OrderLedger,
        exposure: &mut ExposureTracker,
        exchange: &mut dyn Exchange,
    ) -> Option<OrderId> {
        if !self.room_for_order(ledger) {
            return None;
        }
        let volume = self.limits.max_lot_size.min(exposure.capacity(side));
        if volume <= 0 {
            return None;
        }
        let id = ledger.insert(NewOrder { side, price, volume, lifespan: Lifespan::GoodTillCancelled }, exposure)?;
        exchange.submit_order(id, side, price, volume, Lifespan::GoodTillCancelled);
        SIGNALS.with_label_values(&["entry", side.as_str()]).inc();
        ORDERS.with_label_values(&[side.as_str(), Lifespan::GoodTillCancelled.as_str()]).inc();
        info!(id, side = side.as_str(), price, volume, "entry order");
        Some(id)
    }

    /// Cancels every resting order on `side` that has not been pulled yet.
    fn pull_side(side: Side, ledger: &mut OrderLedger, exchange: &mut dyn Exchange) -> Vec<OrderId> {
        let ids: Vec<OrderId> = ledger
            .live_on(side)
            .into_iter()
            .filter(|o| !o.is_fak() && !o.cancel_requested && !o.status.is_terminal())
            .map(|o| o.id)
            .collect();
        for id in &ids {
            exchange.cancel_order(*id);
            ledger.mark_cancel_requested(*id);
            debug!(id, side = side.as_str(), "cancel sent");
        }
        ids
    }

    fn exit(
        &self,
        q: &Quotes,
        ledger: &mut OrderLedger,
        exposure: &mut ExposureTracker,
        exchange: &mut dyn Exchange,
    ) -> Option<OrderId> {
        let position = exposure.position();
        let (side, price) = if position > 0 && q.etf_bid > q.fut_ask {
            (Side::Sell, q.etf_bid)
        } else if position < 0 && q.fut_bid > q.etf_ask {
            (Side::Buy, q.etf_ask)
        } else {
            return None;
        };
        // one unwind at a time
        if !self.room_for_order(ledger) || ledger.has_live_fak(side) {
            return None;
        }
        let volume = position.abs();
        let id = ledger.insert(NewOrder { side, price, volume, lifespan: Lifespan::FillAndKill }, exposure)?;
        exchange.submit_order(id, side, price, volume, Lifespan::FillAndKill);
        SIGNALS.with_label_values(&["exit", side.as_str()]).inc();
        ORDERS.with_label_values(&[side.as_str(), Lifespan::FillAndKill.as_str()]).inc();
        info!(id, side = side.as_str(), price, volume, position, "exit order");
        Some(id)
    }
}
