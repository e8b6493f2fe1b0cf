//! Exchange wire formats
//!
//! Binance spot stream payloads and REST responses. Numeric fields arrive as
//! strings and are parsed when converting into the crate's own types.

use anyhow::{Context, Result};
use serde::Deserialize;
use serde_json::Value;

use crate::types::{FeedEvent, Kline, Ticker, Trade};

// ============================================================================
// Stream
// ============================================================================

/// Payloads of the subscribed streams, tagged by the `e` field
#[derive(Debug, Deserialize)]
#[serde(tag = "e")]
pub enum StreamPayload {
    #[serde(rename = "trade")]
    Trade(WsTrade),
    #[serde(rename = "kline")]
    Kline(WsKlineEvent),
    #[serde(rename = "24hrTicker")]
    Ticker(WsTicker),
}

#[derive(Debug, Deserialize)]
pub struct WsTrade {
    #[serde(rename = "s")]
    pub symbol: String,
    #[serde(rename = "p")]
    pub price: String,
    #[serde(rename = "q")]
    pub quantity: String,
    #[serde(rename = "T")]
    pub trade_time: i64,
    #[serde(rename = "m")]
    pub is_buyer_maker: bool,
}

#[derive(Debug, Deserialize)]
pub struct WsKlineEvent {
    #[serde(rename = "s")]
    pub symbol: String,
    #[serde(rename = "k")]
    pub kline: WsKline,
}

#[derive(Debug, Deserialize)]
pub struct WsKline {
    #[serde(rename = "t")]
    pub open_time: i64,
    #[serde(rename = "T")]
    pub close_time: i64,
    #[serde(rename = "i")]
    pub interval: String,
    #[serde(rename = "o")]
    pub open: String,
    #[serde(rename = "h")]
    pub high: String,
    #[serde(rename = "l")]
    pub low: String,
    #[serde(rename = "c")]
    pub close: String,
    #[serde(rename = "v")]
    pub volume: String,
    #[serde(rename = "x")]
    pub closed: bool,
}

#[derive(Debug, Deserialize)]
pub struct WsTicker {
    #[serde(rename = "s")]
    pub symbol: String,
    #[serde(rename = "c")]
    pub last_price: String,
    #[serde(rename = "P")]
    pub price_change_percent: String,
    #[serde(rename = "v")]
    pub volume: String,
}

fn num(field: &str, raw: &str) -> Result<f64> {
    raw.parse::<f64>()
        .with_context(|| format!("Invalid {} value: {:?}", field, raw))
}

impl WsTrade {
    pub fn into_trade(self) -> Result<Trade> {
        Ok(Trade {
            price: num("price", &self.price)?,
            quantity: num("quantity", &self.quantity)?,
            trade_time_ms: self.trade_time,
            is_buyer_maker: self.is_buyer_maker,
            symbol: self.symbol,
        })
    }
}

impl WsKlineEvent {
    pub fn into_kline(self) -> Result<Kline> {
        let k = self.kline;
        Ok(Kline {
            symbol: self.symbol,
            open: num("open", &k.open)?,
            high: num("high", &k.high)?,
            low: num("low", &k.low)?,
            close: num("close", &k.close)?,
            volume: num("volume", &k.volume)?,
            interval: k.interval,
            open_time_ms: k.open_time,
            close_time_ms: k.close_time,
            closed: k.closed,
        })
    }
}

impl WsTicker {
    pub fn into_ticker(self) -> Result<Ticker> {
        Ok(Ticker {
            last_price: num("lastPrice", &self.last_price)?,
            price_change_percent: num("priceChangePercent", &self.price_change_percent)?,
            volume: num("volume", &self.volume)?,
            symbol: self.symbol,
        })
    }
}

/// Parse one text frame, raw or wrapped in a combined-stream envelope.
///
/// Returns `Ok(None)` for frames that are not trade, kline or ticker events
/// (subscription acks and the like).
pub fn parse_stream_message(text: &str) -> Result<Option<FeedEvent>> {
    let value: Value = serde_json::from_str(text).context("Frame is not JSON")?;
    let payload = match value.get("data") {
        Some(data) => data.clone(),
        None => value,
    };

    match payload.get("e").and_then(Value::as_str) {
        Some("trade") | Some("kline") | Some("24hrTicker") => {}
        _ => return Ok(None),
    }

    let event = match serde_json::from_value::<StreamPayload>(payload)
        .context("Failed to decode stream payload")?
    {
        StreamPayload::Trade(t) => FeedEvent::Trade(t.into_trade()?),
        StreamPayload::Kline(k) => FeedEvent::Kline(k.into_kline()?),
        StreamPayload::Ticker(t) => FeedEvent::Ticker(t.into_ticker()?),
    };
    Ok(Some(event))
}

// ============================================================================
// REST
// ============================================================================

/// Response of `GET /api/v3/ticker/24hr`
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RestTicker {
    pub symbol: String,
    pub last_price: String,
    pub price_change_percent: String,
    pub volume: String,
}

impl RestTicker {
    pub fn into_ticker(self) -> Result<Ticker> {
        Ok(Ticker {
            last_price: num("lastPrice", &self.last_price)?,
            price_change_percent: num("priceChangePercent", &self.price_change_percent)?,
            volume: num("volume", &self.volume)?,
            symbol: self.symbol,
        })
    }
}

/// One row of `GET /api/v3/klines`:
/// open time, open, high, low, close, volume, close time, quote volume,
/// trade count, taker base volume, taker quote volume, unused
#[derive(Debug, Deserialize)]
pub struct RestKline(
    pub i64,
    pub String,
    pub String,
    pub String,
    pub String,
    pub String,
    pub i64,
    pub String,
    pub u64,
    pub String,
    pub String,
    pub String,
);

impl RestKline {
    /// REST klines are always closed except possibly the last one
    pub fn into_kline(self, symbol: &str, interval: &str, now_ms: i64) -> Result<Kline> {
        Ok(Kline {
            symbol: symbol.to_string(),
            interval: interval.to_string(),
            open_time_ms: self.0,
            open: num("open", &self.1)?,
            high: num("high", &self.2)?,
            low: num("low", &self.3)?,
            close: num("close", &self.4)?,
            volume: num("volume", &self.5)?,
            close_time_ms: self.6,
            closed: self.6 <= now_ms,
        })
    }
}
