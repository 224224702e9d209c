// ===============================
// src/ledger.rs (live orders & lifecycle)
// ===============================
//
// Every method that adds or retires an order adjusts the exposure tracker in
// the same call, so the live set, the active-order count and the potential
// exposure can never drift apart. A method that returns `Err` has changed
// nothing.
//
use std::collections::BTreeSet;

use ahash::AHashMap as HashMap;
use thiserror::Error;
use tracing::debug;

use crate::domain::{Lifespan, NewOrder, Order, OrderId, OrderStatus, Side};
use crate::exposure::ExposureTracker;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum LedgerError {
    #[error("order {0} was never issued")]
    UnknownOrder(OrderId),
    #[error("order {0} is already terminal")]
    AlreadyTerminal(OrderId),
    #[error("fill of {volume} lots on order {id} exceeds remaining {remaining}")]
    Overfill { id: OrderId, volume: i64, remaining: i64 },
    #[error("fill of {volume} lots on order {id} is not a fill")]
    EmptyFill { id: OrderId, volume: i64 },
    #[error("status for order {id} reports {reported} lots filled, {recorded} were seen")]
    FillMismatch { id: OrderId, reported: i64, recorded: i64 },
}

impl LedgerError {
    pub fn kind(&self) -> &'static str {
        match self {
            LedgerError::UnknownOrder(_) => "unknown_order",
            LedgerError::AlreadyTerminal(_) => "already_terminal",
            LedgerError::Overfill { .. } => "overfill",
            LedgerError::EmptyFill { .. } => "empty_fill",
            LedgerError::FillMismatch { .. } => "fill_mismatch",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FillOutcome {
    pub side: Side,
    pub lifespan: Lifespan,
    pub remaining: i64,
    /// Good-till-cancelled order filled completely and retired.
    pub fully_filled: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatusOutcome {
    /// Resting order still working; nothing changed.
    Working { remaining: i64 },
    /// Resting order cancelled; its unfilled reservation was released.
    Cancelled { side: Side, released: i64 },
    /// Fill-and-kill order finished; its fills were settled.
    TakerDone { side: Side, filled: i64 },
    /// Final status for an order a fill already retired.
    Acknowledged,
}

/// Upper bound on retired ids still waiting for their closing status.
const AWAITING_STATUS_CAP: usize = 1024;

#[derive(Debug, Default)]
pub struct OrderLedger {
    next_id: OrderId,
    live: HashMap<OrderId, Order>,
    /// Retired by a full fill; the exchange still owes one final status.
    /// Oldest ids are dropped past `AWAITING_STATUS_CAP`.
    awaiting_status: BTreeSet<OrderId>,
}

impl OrderLedger {
    pub fn new() -> Self {
        Self { next_id: 1, live: HashMap::new(), awaiting_status: BTreeSet::new() }
    }

    /// Ids are shared by orders and hedges and never reused.
    pub fn allocate_id(&mut self) -> OrderId {
        let id = self.next_id;
        self.next_id += 1;
        id
    }

    fn issued(&self, id: OrderId) -> bool { id >= 1 && id < self.next_id }

    pub fn active_order_count(&self) -> usize { self.live.len() }
    #[cfg(test)]
    pub fn get(&self, id: OrderId) -> Option<&Order> { self.live.get(&id) }
    pub fn contains(&self, id: OrderId) -> bool { self.live.contains_key(&id) }

    /// Live orders on `side` in queue priority.
    pub fn live_on(&self, side: Side) -> Vec<&Order> {
        let mut v: Vec<&Order> = self.live.values().filter(|o| o.side == side).collect();
        v.sort_by(|a, b| side.priority(a, b));
        v
    }

    pub fn has_live_fak(&self, side: Side) -> bool {
        self.live.values().any(|o| o.side == side && o.is_fak())
    }

    /// Registers a new order. Good-till-cancelled orders reserve their volume
    /// first; `None` means the reservation would breach the position limit.
    pub fn insert(&mut self, req: NewOrder, exposure: &mut ExposureTracker) -> Option<OrderId> {
        if req.volume <= 0 {
            return None;
        }
        if req.lifespan == Lifespan::GoodTillCancelled && !exposure.reserve(req.side, req.volume) {
            return None;
        }
        let id = self.allocate_id();
        self.live.insert(id, Order::new(id, req));
        Some(id)
    }

    pub fn mark_cancel_requested(&mut self, id: OrderId) {
        if let Some(o) = self.live.get_mut(&id) {
            o.cancel_requested = true;
        }
    }

    fn not_live(&self, id: OrderId) -> LedgerError {
        if self.issued(id) { LedgerError::AlreadyTerminal(id) } else { LedgerError::UnknownOrder(id) }
    }

    pub fn record_fill(
        &mut self,
        id: OrderId,
        volume: i64,
        price: i64,
        exposure: &mut ExposureTracker,
    ) -> Result<FillOutcome, LedgerError> {
        let missing = self.not_live(id);
        let Some(order) = self.live.get_mut(&id) else {
            self.awaiting_status.remove(&id);
            return Err(missing);
        };
        if volume <= 0 {
            return Err(LedgerError::EmptyFill { id, volume });
        }
        if volume > order.remaining_volume {
            return Err(LedgerError::Overfill { id, volume, remaining: order.remaining_volume });
        }

        exposure.apply_fill(order.side, volume);
        order.remaining_volume -= volume;
        order.status = if order.remaining_volume == 0 { OrderStatus::FullyFilled } else { OrderStatus::PartiallyFilled };
        let (side, lifespan, remaining) = (order.side, order.lifespan, order.remaining_volume);
        debug!(id, volume, price, remaining, "fill recorded");

        // fill-and-kill orders end on their status message
        let fully_filled = remaining == 0 && lifespan == Lifespan::GoodTillCancelled;
        if fully_filled {
            self.live.remove(&id);
            self.awaiting_status.insert(id);
            if self.awaiting_status.len() > AWAITING_STATUS_CAP {
                self.awaiting_status.pop_first();
            }
        }
        Ok(FillOutcome { side, lifespan, remaining, fully_filled })
    }

    pub fn record_status(
        &mut self,
        id: OrderId,
        filled: i64,
        remaining: i64,
        fees: i64,
        exposure: &mut ExposureTracker,
    ) -> Result<StatusOutcome, LedgerError> {
        let Some(order) = self.live.get(&id) else {
            // one callback closes the wait either way
            if self.awaiting_status.remove(&id) && remaining == 0 {
                return Ok(StatusOutcome::Acknowledged);
            }
            return Err(self.not_live(id));
        };
        debug!(id, filled, remaining, fees, "status recorded");

        if order.is_fak() {
            let (side, recorded) = (order.side, order.filled_volume());
            if filled != recorded {
                return Err(LedgerError::FillMismatch { id, reported: filled, recorded });
            }
            exposure.settle_taker(side, recorded);
            self.live.remove(&id);
            return Ok(StatusOutcome::TakerDone { side, filled: recorded });
        }
        if remaining == 0 {
            let closed = self.remove(id, exposure)?;
            return Ok(StatusOutcome::Cancelled { side: closed.side, released: closed.remaining_volume });
        }
        Ok(StatusOutcome::Working { remaining: order.remaining_volume })
    }

    /// An order the exchange errored on is closed with the fills already
    /// seen for it; a resting one is taken to have never rested.
    pub fn record_error(&mut self, id: OrderId, exposure: &mut ExposureTracker) -> Option<StatusOutcome> {
        let Some(order) = self.live.get(&id) else {
            self.awaiting_status.remove(&id);
            return None;
        };
        let filled = order.filled_volume();
        self.record_status(id, filled, 0, 0, exposure).ok()
    }

    /// Drops a live order, releasing whatever it still had reserved.
    pub fn remove(&mut self, id: OrderId, exposure: &mut ExposureTracker) -> Result<Order, LedgerError> {
        let missing = self.not_live(id);
        let mut order = self.live.remove(&id).ok_or(missing)?;
        if !order.is_fak() {
            exposure.release(order.side, order.remaining_volume);
            order.status = OrderStatus::Cancelled;
        }
        Ok(order)
    }
}
