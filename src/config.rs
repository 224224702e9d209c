// ===============================
// src/config.rs
// ===============================
/*
=============================================================================
Project : etf_arb_bot: ETF/future spread arbitrage agent in Rust
Module  : config.rs
Version : 0.1.0
License : MIT (see LICENSE)

Summary : Quotes the ETF whenever its book is dislocated from the future by
          more than an adaptive threshold, hedges every fill in the future,
          and unwinds the ETF position once the two books cross back.
=============================================================================
*/
use std::env;

use clap::Parser;
use dotenvy::dotenv;
use thiserror::Error;

/// Command line overrides for the session; trading limits come from ENV.
#[derive(Parser, Debug, Clone, Default)]
#[command(name = "etf_arb_bot", version, about = "ETF/future spread arbitrage agent")]
pub struct Cli {
    /// Append every exchange event and command to this JSONL file.
    #[arg(long)]
    pub record_file: Option<String>,
    /// Port for the Prometheus text endpoint.
    #[arg(long)]
    pub metrics_port: Option<u16>,
    /// Do not start the metrics endpoint.
    #[arg(long)]
    pub no_metrics: bool,
    /// Stop the session after this many seconds.
    #[arg(long)]
    pub duration_secs: Option<u64>,
}

#[derive(Debug, Error, PartialEq)]
pub enum ConfigError {
    #[error("{key} must be positive, got {value}")]
    NotPositive { key: &'static str, value: i64 },
    #[error("ZERO_LOWER_BOUND ({floor}) must be below SPREAD_CEILING ({ceiling})")]
    EmptyBand { floor: f64, ceiling: f64 },
    #[error("SPREAD_WINDOW must hold at least one sample")]
    EmptyWindow,
}

#[derive(Clone, Debug)]
pub struct Args {
    pub record_file: Option<String>,
    pub metrics_port: Option<u16>,
    pub feed_interval_ms: u64,
    pub duration_secs: Option<u64>,
}

#[derive(Clone, Debug, PartialEq)]
pub struct Limits {
    pub max_lot_size: i64,
    pub position_limit: i64,
    pub tick_size: i64,
    pub active_orders_limit: usize,
    pub minimum_bid: i64,
    pub maximum_ask: i64,
}

impl Limits {
    /// Lowest tick-aligned price above the exchange minimum; hedge sells go here.
    pub fn min_bid_nearest_tick(&self) -> i64 {
        (self.minimum_bid + self.tick_size) / self.tick_size * self.tick_size
    }
    /// Highest tick-aligned price within the exchange maximum; hedge buys go here.
    pub fn max_ask_nearest_tick(&self) -> i64 {
        self.maximum_ask / self.tick_size * self.tick_size
    }
}

impl Default for Limits {
    fn default() -> Self {
        Self {
            max_lot_size: 20,
            position_limit: 100,
            tick_size: 100,
            active_orders_limit: 10,
            minimum_bid: 1,
            maximum_ask: 2_147_483_647,
        }
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct ThresholdCfg {
    pub initial: f64,
    pub zero_lower_bound: f64,
    pub ceiling: f64,
    pub window: usize,
}

impl Default for ThresholdCfg {
    fn default() -> Self {
        Self { initial: 2e-3, zero_lower_bound: 5e-4, ceiling: 1e-3, window: 10 }
    }
}

#[derive(Clone, Debug)]
pub struct Settings {
    pub args: Args,
    pub limits: Limits,
    pub threshold: ThresholdCfg,
}

fn parse_or<T: std::str::FromStr>(get: &impl Fn(&str) -> Option<String>, key: &str, default: T) -> T {
    get(key).and_then(|s| s.trim().parse().ok()).unwrap_or(default)
}

/// Reads settings through `get`, so tests need not touch the process env.
pub fn load_from(get: impl Fn(&str) -> Option<String>) -> Result<Settings, ConfigError> {
    let d = Limits::default();
    let limits = Limits {
        max_lot_size: parse_or(&get, "MAX_LOT_SIZE", d.max_lot_size),
        position_limit: parse_or(&get, "POSITION_LIMIT", d.position_limit),
        tick_size: parse_or(&get, "TICK_SIZE", d.tick_size),
        active_orders_limit: parse_or(&get, "ACTIVE_ORDERS_LIMIT", d.active_orders_limit),
        minimum_bid: parse_or(&get, "MINIMUM_BID", d.minimum_bid),
        maximum_ask: parse_or(&get, "MAXIMUM_ASK", d.maximum_ask),
    };
    for (key, value) in [
        ("MAX_LOT_SIZE", limits.max_lot_size),
        ("POSITION_LIMIT", limits.position_limit),
        ("TICK_SIZE", limits.tick_size),
        ("ACTIVE_ORDERS_LIMIT", limits.active_orders_limit as i64),
    ] {
        if value <= 0 {
            return Err(ConfigError::NotPositive { key, value });
        }
    }

    let t = ThresholdCfg::default();
    let threshold = ThresholdCfg {
        initial: parse_or(&get, "INITIAL_THRESHOLD", t.initial),
        zero_lower_bound: parse_or(&get, "ZERO_LOWER_BOUND", t.zero_lower_bound),
        ceiling: parse_or(&get, "SPREAD_CEILING", t.ceiling),
        window: parse_or(&get, "SPREAD_WINDOW", t.window),
    };
    if threshold.zero_lower_bound >= threshold.ceiling {
        return Err(ConfigError::EmptyBand { floor: threshold.zero_lower_bound, ceiling: threshold.ceiling });
    }
    if threshold.window == 0 {
        return Err(ConfigError::EmptyWindow);
    }

    let args = Args {
        record_file: get("RECORD_FILE").filter(|s| !s.trim().is_empty()),
        metrics_port: Some(parse_or(&get, "METRICS_PORT", 9898)),
        feed_interval_ms: parse_or(&get, "FEED_INTERVAL_MS", 250),
        duration_secs: None,
    };
    Ok(Settings { args, limits, threshold })
}

/// ENV (after `.env`) first, command line on top.
pub fn load(cli: &Cli) -> Result<Settings, ConfigError> {
    // .env is optional
    let _ = dotenv();
    let mut settings = load_from(|k| env::var(k).ok())?;

    if let Some(path) = &cli.record_file {
        settings.args.record_file = Some(path.clone());
    }
    if let Some(port) = cli.metrics_port {
        settings.args.metrics_port = Some(port);
    }
    if cli.no_metrics {
        settings.args.metrics_port = None;
    }
    settings.args.duration_secs = cli.duration_secs;
    Ok(settings)
}
