// ===============================
// src/domain.rs
// ===============================
use std::cmp::Ordering;
use std::fmt;

use serde::{Deserialize, Serialize};

pub type OrderId = u64;

/// Number of price levels reported per side in every book message.
pub const TOP_LEVEL_COUNT: usize = 5;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Instrument { Future, Etf }

impl Instrument {
    /// The instrument we quote in; updates on it drive the signal engine.
    pub const PRIMARY: Instrument = Instrument::Etf;

    pub fn as_str(&self) -> &'static str {
        match self { Instrument::Future => "future", Instrument::Etf => "etf" }
    }
}

impl fmt::Display for Instrument {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result { f.write_str(self.as_str()) }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Side { Buy, Sell }

impl Side {
    pub fn as_str(&self) -> &'static str { match self { Side::Buy => "buy", Side::Sell => "sell" } }

    /// Queue priority among resting orders of this side: better price first,
    /// then older (lower) id. Bids rank high prices ahead, asks low prices.
    pub fn priority(&self, a: &Order, b: &Order) -> Ordering {
        let by_price = match self {
            Side::Buy => b.price.cmp(&a.price),
            Side::Sell => a.price.cmp(&b.price),
        };
        by_price.then(a.id.cmp(&b.id))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Lifespan { GoodTillCancelled, FillAndKill }

impl Lifespan {
    pub fn as_str(&self) -> &'static str {
        match self { Lifespan::GoodTillCancelled => "gtc", Lifespan::FillAndKill => "fak" }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OrderStatus { New, PartiallyFilled, FullyFilled, Cancelled }

impl OrderStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, OrderStatus::FullyFilled | OrderStatus::Cancelled)
    }
}

/// Order request handed to the ledger before an id is assigned.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NewOrder { pub side: Side, pub price: i64, pub volume: i64, pub lifespan: Lifespan }

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Order {
    pub id: OrderId,
    pub side: Side,
    pub price: i64,
    pub total_volume: i64,
    pub remaining_volume: i64,
    pub lifespan: Lifespan,
    pub status: OrderStatus,
    pub cancel_requested: bool,
}

impl Order {
    pub fn new(id: OrderId, req: NewOrder) -> Self {
        Self {
            id,
            side: req.side,
            price: req.price,
            total_volume: req.volume,
            remaining_volume: req.volume,
            lifespan: req.lifespan,
            status: OrderStatus::New,
            cancel_requested: false,
        }
    }
    pub fn is_fak(&self) -> bool { self.lifespan == Lifespan::FillAndKill }
    pub fn filled_volume(&self) -> i64 { self.total_volume - self.remaining_volume }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PriceLevel { pub price: i64, pub volume: i64 }

/// Top-of-book view of one instrument; replaced wholesale on every update.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrderBookSnapshot {
    pub instrument: Instrument,
    pub sequence: u64,
    pub asks: [PriceLevel; TOP_LEVEL_COUNT],
    pub bids: [PriceLevel; TOP_LEVEL_COUNT],
}

impl OrderBookSnapshot {
    /// Price 0 means the exchange had no level to report.
    pub fn best_bid(&self) -> Option<i64> { Some(self.bids[0].price).filter(|p| *p > 0) }
    pub fn best_ask(&self) -> Option<i64> { Some(self.asks[0].price).filter(|p| *p > 0) }
}

/// Callbacks delivered by the exchange connection, in arrival order.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum ExchangeEvent {
    BookUpdate {
        instrument: Instrument,
        sequence: u64,
        asks: [PriceLevel; TOP_LEVEL_COUNT],
        bids: [PriceLevel; TOP_LEVEL_COUNT],
    },
    TradeTicks { instrument: Instrument, sequence: u64 },
    OrderFilled { order_id: OrderId, price: i64, volume: i64 },
    OrderStatus { order_id: OrderId, filled_volume: i64, remaining_volume: i64, fees: i64 },
    Error { order_id: OrderId, message: String },
    HedgeFilled { order_id: OrderId, price: i64, volume: i64 },
    Disconnected,
}

/// Requests sent to the exchange; completion is observed through callbacks.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ExchangeCommand {
    Insert { id: OrderId, side: Side, price: i64, volume: i64, lifespan: Lifespan },
    Cancel { id: OrderId },
    Hedge { id: OrderId, side: Side, price: i64, volume: i64 },
}

/// Recorder line.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Event { In { ts_ns: i128, event: ExchangeEvent }, Out { ts_ns: i128, command: ExchangeCommand }, Note(String) }
