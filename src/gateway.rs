// ===============================
// src/gateway.rs (exchange surface + simulated venue)
// ===============================
use ahash::AHashMap as HashMap;

use chrono::Utc;
use rand::Rng;
use tokio::{sync::mpsc, time::{sleep, Duration}};
use tracing::{debug, warn};

use crate::domain::{Event, ExchangeCommand, ExchangeEvent, Lifespan, OrderId, Side};
use crate::metrics::{CANCELS, EXCHANGE_COMMANDS_DROPPED, HEDGES};

/// What the trading core may ask of the exchange. Calls are fire-and-forget;
/// their effect comes back later as callbacks.
pub trait Exchange {
    fn submit_order(&mut self, id: OrderId, side: Side, price: i64, volume: i64, lifespan: Lifespan);
    fn cancel_order(&mut self, id: OrderId);
    fn submit_hedge_order(&mut self, id: OrderId, side: Side, price: i64, volume: i64);
}

/// Forwards commands to the venue task (and the recorder, if enabled).
pub struct ChannelExchange {
    tx: mpsc::Sender<ExchangeCommand>,
    rec_tx: Option<mpsc::Sender<Event>>,
}

impl ChannelExchange {
    pub fn new(tx: mpsc::Sender<ExchangeCommand>, rec_tx: Option<mpsc::Sender<Event>>) -> Self {
        Self { tx, rec_tx }
    }

    fn dispatch(&mut self, command: ExchangeCommand) {
        if let Some(rec) = &self.rec_tx {
            let ts_ns = Utc::now().timestamp_nanos_opt().unwrap_or(0) as i128;
            let _ = rec.try_send(Event::Out { ts_ns, command: command.clone() });
        }
        if let Err(e) = self.tx.try_send(command) {
            EXCHANGE_COMMANDS_DROPPED.inc();
            warn!(?e, "exchange command not sent");
        }
    }
}

impl Exchange for ChannelExchange {
    fn submit_order(&mut self, id: OrderId, side: Side, price: i64, volume: i64, lifespan: Lifespan) {
        self.dispatch(ExchangeCommand::Insert { id, side, price, volume, lifespan });
    }
    fn cancel_order(&mut self, id: OrderId) {
        CANCELS.inc();
        self.dispatch(ExchangeCommand::Cancel { id });
    }
    fn submit_hedge_order(&mut self, id: OrderId, side: Side, price: i64, volume: i64) {
        HEDGES.with_label_values(&[side.as_str()]).inc();
        self.dispatch(ExchangeCommand::Hedge { id, side, price, volume });
    }
}

/// Paper venue: answers commands with the callbacks a real matching engine
/// would send. Resting orders fill with some probability per command
/// round; fill-and-kill orders fill immediately or not at all.
pub async fn run_venue(
    mut rx: mpsc::Receiver<ExchangeCommand>,
    ev_tx: mpsc::Sender<ExchangeEvent>,
    latency_ms: u64,
) {
    // id -> (remaining, filled, price)
    let mut resting: HashMap<OrderId, (i64, i64, i64)> = HashMap::new();

    while let Some(cmd) = rx.recv().await {
        sleep(Duration::from_millis(latency_ms)).await;
        let mut out = Vec::new();
        match cmd {
            ExchangeCommand::Insert { id, price, volume, lifespan: Lifespan::GoodTillCancelled, .. } => {
                resting.insert(id, (volume, 0, price));
                out.push(ExchangeEvent::OrderStatus { order_id: id, filled_volume: 0, remaining_volume: volume, fees: 0 });
            }
            ExchangeCommand::Insert { id, price, volume, lifespan: Lifespan::FillAndKill, .. } => {
                let filled = if rand::thread_rng().gen_bool(0.7) { volume } else { 0 };
                if filled > 0 {
                    out.push(ExchangeEvent::OrderFilled { order_id: id, price, volume: filled });
                }
                out.push(ExchangeEvent::OrderStatus { order_id: id, filled_volume: filled, remaining_volume: 0, fees: filled / 50 });
            }
            ExchangeCommand::Cancel { id } => match resting.remove(&id) {
                Some((_, filled, _)) => {
                    out.push(ExchangeEvent::OrderStatus { order_id: id, filled_volume: filled, remaining_volume: 0, fees: 0 });
                }
                None => out.push(ExchangeEvent::Error { order_id: id, message: "out of order cancel".into() }),
            },
            ExchangeCommand::Hedge { id, price, volume, .. } => {
                out.push(ExchangeEvent::HedgeFilled { order_id: id, price, volume });
            }
        }

        // passive fills on whatever is still resting
        let ids: Vec<OrderId> = resting.keys().copied().collect();
        for id in ids {
            let roll: f64 = rand::thread_rng().gen();
            if roll > 0.15 {
                continue;
            }
            let Some(entry) = resting.get_mut(&id) else { continue };
            let lots = rand::thread_rng().gen_range(1..=entry.0);
            entry.0 -= lots;
            entry.1 += lots;
            out.push(ExchangeEvent::OrderFilled { order_id: id, price: entry.2, volume: lots });
            out.push(ExchangeEvent::OrderStatus {
                order_id: id,
                filled_volume: entry.1,
                remaining_volume: entry.0,
                fees: -(lots / 100),
            });
            if entry.0 == 0 {
                resting.remove(&id);
            }
        }

        for ev in out {
            debug!(?ev, "venue callback");
            if ev_tx.send(ev).await.is_err() {
                return;
            }
        }
    }
}
