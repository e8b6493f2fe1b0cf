//! Configuration for the market data feed and the signal policy

use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::types::Timeframe;

/// Default Binance spot endpoints
pub const DEFAULT_WS_URL: &str = "wss://stream.binance.com:9443";
pub const DEFAULT_REST_URL: &str = "https://api.binance.com";

/// Exponential backoff for stream reconnects
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReconnectPolicy {
    /// Delay before the first reconnect attempt
    pub base_delay_ms: u64,

    /// Reconnect attempts allowed before giving up
    pub max_attempts: u32,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            base_delay_ms: 1_000,
            max_attempts: 5,
        }
    }
}

impl ReconnectPolicy {
    /// Delay for the given 1-based attempt, or None once the budget is spent
    pub fn delay_for(&self, attempt: u32) -> Option<Duration> {
        if attempt == 0 || attempt > self.max_attempts {
            return None;
        }
        let factor = 2u64.saturating_pow(attempt - 1);
        Some(Duration::from_millis(self.base_delay_ms.saturating_mul(factor)))
    }
}

/// Configuration for the market data feed
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FeedConfig {
    /// Stream endpoint (combined-stream path is appended)
    pub ws_base_url: String,

    /// REST endpoint for ticker and klines
    pub rest_base_url: String,

    pub reconnect: ReconnectPolicy,

    /// REST ticker polling interval, runs regardless of stream health
    pub ticker_poll_interval_ms: u64,

    /// Kline interval subscribed on the stream and used for seeding
    pub kline_interval: String,

    /// Number of klines fetched when seeding an empty window
    pub kline_seed_limit: u32,
}

impl Default for FeedConfig {
    fn default() -> Self {
        Self {
            ws_base_url: DEFAULT_WS_URL.to_string(),
            rest_base_url: DEFAULT_REST_URL.to_string(),
            reconnect: ReconnectPolicy::default(),
            ticker_poll_interval_ms: 10_000,
            kline_interval: "1m".to_string(),
            kline_seed_limit: 100,
        }
    }
}

/// How the risk:reward multiple for BUY/SELL targets is chosen
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "mode", rename_all = "snake_case")]
pub enum RiskRewardMode {
    /// Constant multiple and a fixed 20-trade stop lookback
    Fixed { multiple: f64 },
    /// Multiple scaled by confirmations, predictor agreement and band width
    Adaptive { min: f64, max: f64 },
}

impl Default for RiskRewardMode {
    fn default() -> Self {
        Self::Adaptive { min: 1.5, max: 4.0 }
    }
}

/// Rules that decide when a signal is emitted and when it may replace a cached one
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SignalPolicy {
    /// Base cooldown in milliseconds, scaled per timeframe
    pub cooldown_ms: u64,

    /// Base price move (percent) that forces regeneration, scaled per timeframe
    pub price_change_threshold_pct: f64,

    /// Votes one side must lead the other by
    pub margin_required: usize,

    /// Minimum votes for a directional signal
    pub min_confirmations: usize,

    pub risk_reward_mode: RiskRewardMode,
}

impl Default for SignalPolicy {
    fn default() -> Self {
        Self::conservative()
    }
}

impl SignalPolicy {
    /// 60s cooldown, two-vote margin
    pub fn conservative() -> Self {
        Self {
            cooldown_ms: 60_000,
            price_change_threshold_pct: 0.5,
            margin_required: 2,
            min_confirmations: 3,
            risk_reward_mode: RiskRewardMode::default(),
        }
    }

    /// No cooldown, one-vote margin
    pub fn responsive() -> Self {
        Self {
            cooldown_ms: 0,
            margin_required: 1,
            ..Self::conservative()
        }
    }

    pub fn from_name(name: &str) -> Option<Self> {
        match name {
            "conservative" => Some(Self::conservative()),
            "responsive" => Some(Self::responsive()),
            _ => None,
        }
    }

    pub fn cooldown(&self, timeframe: Timeframe) -> Duration {
        Duration::from_millis((self.cooldown_ms as f64 * timeframe.cooldown_scale()) as u64)
    }

    pub fn price_change_threshold(&self, timeframe: Timeframe) -> f64 {
        self.price_change_threshold_pct * timeframe.threshold_scale()
    }
}
