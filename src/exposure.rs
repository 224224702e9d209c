// ===============================
// src/exposure.rs (position & potential exposure)
// ===============================
//
// `potential_bid` is the position we would hold if every resting bid filled,
// `potential_ask` the position if every resting ask filled. Entry sizing is
// checked against these before an order goes out, so a burst of fills can
// never carry the position past the limit.
//
use serde::Serialize;

use crate::domain::Side;
use crate::metrics::{ACTIVE_ORDERS, POSITION, POTENTIAL_ASK, POTENTIAL_BID};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ExposureState {
    pub position: i64,
    pub potential_bid: i64,
    pub potential_ask: i64,
}

#[derive(Debug, Clone)]
pub struct ExposureTracker {
    state: ExposureState,
    position_limit: i64,
}

impl ExposureTracker {
    pub fn new(position_limit: i64) -> Self {
        Self { state: ExposureState::default(), position_limit }
    }

    pub fn state(&self) -> ExposureState { self.state }
    pub fn position(&self) -> i64 { self.state.position }
    #[cfg(test)]
    pub fn potential_bid(&self) -> i64 { self.state.potential_bid }
    #[cfg(test)]
    pub fn potential_ask(&self) -> i64 { self.state.potential_ask }
    #[cfg(test)]
    pub fn position_limit(&self) -> i64 { self.position_limit }

    /// Lots resting on `side` that have not filled yet.
    #[cfg(test)]
    pub fn outstanding(&self, side: Side) -> i64 {
        match side {
            Side::Buy => self.state.potential_bid - self.state.position,
            Side::Sell => self.state.position - self.state.potential_ask,
        }
    }

    /// Lots that can still be reserved on `side` without crossing the limit.
    pub fn capacity(&self, side: Side) -> i64 {
        match side {
            Side::Buy => self.position_limit - self.state.potential_bid,
            Side::Sell => self.position_limit + self.state.potential_ask,
        }
        .max(0)
    }

    /// Pre-reserves `volume` lots for a resting order. Refuses (and changes
    /// nothing) when the reservation would breach the position limit.
    pub fn reserve(&mut self, side: Side, volume: i64) -> bool {
        if volume <= 0 || volume > self.capacity(side) {
            return false;
        }
        match side {
            Side::Buy => self.state.potential_bid += volume,
            Side::Sell => self.state.potential_ask -= volume,
        }
        true
    }

    /// Gives back the unfilled part of a reservation.
    pub fn release(&mut self, side: Side, volume: i64) {
        match side {
            Side::Buy => self.state.potential_bid -= volume,
            Side::Sell => self.state.potential_ask += volume,
        }
    }

    /// Moves filled lots into the realised position. The reserved side
    /// already accounted for them; the other side's projection shifts.
    pub fn apply_fill(&mut self, side: Side, volume: i64) {
        match side {
            Side::Buy => {
                self.state.position += volume;
                self.state.potential_ask += volume;
            }
            Side::Sell => {
                self.state.position -= volume;
                self.state.potential_bid -= volume;
            }
        }
    }

    /// Fill-and-kill orders are not reserved up front; once the exchange
    /// reports their final fill volume the own-side projection catches up.
    pub fn settle_taker(&mut self, side: Side, filled: i64) {
        match side {
            Side::Buy => self.state.potential_bid += filled,
            Side::Sell => self.state.potential_ask -= filled,
        }
    }

    pub fn publish(&self, active_orders: usize) {
        POSITION.set(self.state.position);
        POTENTIAL_BID.set(self.state.potential_bid);
        POTENTIAL_ASK.set(self.state.potential_ask);
        ACTIVE_ORDERS.set(active_orders as i64);
    }
}
