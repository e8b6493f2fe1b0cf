use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::time::Duration;
use uuid::Uuid;

/// A single executed trade from the exchange stream
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Trade {
    pub symbol: String,
    pub price: f64,
    pub quantity: f64,
    pub trade_time_ms: i64,
    pub is_buyer_maker: bool,
}

/// Candle update from the kline stream or the REST klines endpoint
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Kline {
    pub symbol: String,
    pub interval: String,
    pub open_time_ms: i64,
    pub close_time_ms: i64,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    pub volume: f64,
    pub closed: bool,
}

/// 24h rolling ticker snapshot
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Ticker {
    pub symbol: String,
    pub last_price: f64,
    pub price_change_percent: f64,
    pub volume: f64,
}

/// Events published by the market data feed
#[derive(Debug, Clone)]
pub enum FeedEvent {
    Trade(Trade),
    Kline(Kline),
    Ticker(Ticker),
    Connected { symbol: String },
    Disconnected { reason: String },
    /// Published before each backoff wait
    Reconnecting { attempt: u32, delay: Duration },
    Error { message: String },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum SignalType {
    Buy,
    Sell,
    Hold,
}

impl fmt::Display for SignalType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Buy => write!(f, "BUY"),
            Self::Sell => write!(f, "SELL"),
            Self::Hold => write!(f, "HOLD"),
        }
    }
}

/// Nominal candle interval a signal is requested for.
///
/// The timeframe governs how long a cached signal stays fresh, how long the
/// cooldown lasts and how large a price move forces regeneration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Timeframe {
    #[serde(rename = "1m")]
    M1,
    #[serde(rename = "5m")]
    M5,
    #[serde(rename = "15m")]
    M15,
    #[serde(rename = "30m")]
    M30,
    #[serde(rename = "1h")]
    H1,
    #[serde(rename = "4h")]
    H4,
    #[serde(rename = "1d")]
    D1,
}

impl Timeframe {
    pub const ALL: [Timeframe; 7] = [
        Timeframe::M1,
        Timeframe::M5,
        Timeframe::M15,
        Timeframe::M30,
        Timeframe::H1,
        Timeframe::H4,
        Timeframe::D1,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::M1 => "1m",
            Self::M5 => "5m",
            Self::M15 => "15m",
            Self::M30 => "30m",
            Self::H1 => "1h",
            Self::H4 => "4h",
            Self::D1 => "1d",
        }
    }

    /// How long a cached signal is served as-is
    pub fn max_age(&self) -> Duration {
        let secs = match self {
            Self::M1 => 10,
            Self::M5 => 30,
            Self::M15 => 60,
            Self::M30 => 90,
            Self::H1 => 120,
            Self::H4 => 180,
            Self::D1 => 300,
        };
        Duration::from_secs(secs)
    }

    /// Multiplier applied to the policy's base cooldown
    pub fn cooldown_scale(&self) -> f64 {
        match self {
            Self::M1 => 0.5,
            Self::M5 => 1.0,
            Self::M15 => 2.0,
            Self::M30 => 3.0,
            Self::H1 => 4.0,
            Self::H4 => 8.0,
            Self::D1 => 16.0,
        }
    }

    /// Multiplier applied to the policy's base price-change threshold
    pub fn threshold_scale(&self) -> f64 {
        match self {
            Self::M1 => 0.4,
            Self::M5 => 1.0,
            Self::M15 => 1.6,
            Self::M30 => 2.0,
            Self::H1 => 2.4,
            Self::H4 => 4.0,
            Self::D1 => 6.0,
        }
    }
}

impl fmt::Display for Timeframe {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Timeframe {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> anyhow::Result<Self> {
        Timeframe::ALL
            .into_iter()
            .find(|tf| tf.as_str() == s)
            .ok_or_else(|| anyhow::anyhow!("Unknown timeframe: {}", s))
    }
}

/// Display timestamp of a signal, kept structured instead of "2023-07-21 14:00:00 (1h)"
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SignalTimestamp {
    pub at: DateTime<Utc>,
    pub timeframe: Timeframe,
}

impl fmt::Display for SignalTimestamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.at.format("%Y-%m-%d %H:%M:%S"), self.timeframe)
    }
}

/// Output of the statistical predictor attached to a signal
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Prediction {
    pub predicted_type: SignalType,
    pub probability: f64,
    pub explanation: String,
}

/// Trading recommendation for one symbol and timeframe
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Signal {
    pub id: Uuid,
    pub symbol: String,
    pub signal: SignalType,
    pub entry_point: f64,
    pub stop_loss: f64,
    pub target_price: f64,
    /// 0..=95
    pub confidence: u8,
    pub reasoning: String,
    pub timestamp: SignalTimestamp,
    /// When the pipeline actually produced this signal
    pub generated_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub prediction: Option<Prediction>,
    /// Placeholder emitted when the pipeline could not run. With no known
    /// price its entry, stop and target are all 0.0 and carry no ordering.
    #[serde(default)]
    pub fallback: bool,
}

impl Signal {
    /// Check the stop/entry/target ordering for the signal's direction.
    /// Always false for an unpriced placeholder, see [`Signal::is_unpriced`].
    pub fn levels_are_ordered(&self) -> bool {
        match self.signal {
            SignalType::Buy | SignalType::Hold => {
                self.stop_loss < self.entry_point && self.entry_point < self.target_price
            }
            SignalType::Sell => {
                self.target_price < self.entry_point && self.entry_point < self.stop_loss
            }
        }
    }

    /// Placeholder with no price at all; its levels are zeros, not prices
    pub fn is_unpriced(&self) -> bool {
        self.fallback && self.entry_point == 0.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_timeframe_parse_roundtrip() {
        for tf in Timeframe::ALL {
            assert_eq!(tf.as_str().parse::<Timeframe>().unwrap(), tf);
        }
        assert!("2m".parse::<Timeframe>().is_err());
    }

    #[test]
    fn test_max_age_tiers_increase() {
        let ages: Vec<_> = Timeframe::ALL.iter().map(|tf| tf.max_age()).collect();
        assert_eq!(ages.first(), Some(&Duration::from_secs(10)));
        assert_eq!(ages.last(), Some(&Duration::from_secs(300)));
        assert!(ages.windows(2).all(|w| w[0] < w[1]));
    }

    #[test]
    fn test_timestamp_display_embeds_timeframe() {
        let ts = SignalTimestamp {
            at: Utc.with_ymd_and_hms(2023, 7, 21, 14, 0, 0).unwrap(),
            timeframe: Timeframe::H1,
        };
        assert_eq!(ts.to_string(), "2023-07-21 14:00:00 (1h)");
    }

    #[test]
    fn test_signal_type_serializes_uppercase() {
        assert_eq!(serde_json::to_string(&SignalType::Buy).unwrap(), "\"BUY\"");
        assert_eq!(serde_json::to_string(&Timeframe::M15).unwrap(), "\"15m\"");
    }
}
