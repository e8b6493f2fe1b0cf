//! Offline demo feed
//!
//! Random-walk prices served through the same [`StreamConnector`] and
//! [`MarketDataSource`] seams as the live exchange, so the whole pipeline
//! runs without network access.

use anyhow::Result;
use async_trait::async_trait;
use chrono::Utc;
use futures::StreamExt;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde_json::json;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use super::client::{MessageStream, StreamConnector};
use super::rest::MarketDataSource;
use crate::types::{Kline, Ticker};

/// Per-tick relative move bound
const STEP_PCT: f64 = 0.0015;

/// Shared random walk, one price per symbol
#[derive(Clone)]
pub struct RandomWalk {
    inner: Arc<Mutex<WalkState>>,
}

struct WalkState {
    rng: StdRng,
    prices: HashMap<String, f64>,
    opens: HashMap<String, f64>,
}

impl RandomWalk {
    pub fn new() -> Self {
        Self::from_rng(StdRng::from_entropy())
    }

    pub fn seeded(seed: u64) -> Self {
        Self::from_rng(StdRng::seed_from_u64(seed))
    }

    fn from_rng(rng: StdRng) -> Self {
        Self {
            inner: Arc::new(Mutex::new(WalkState {
                rng,
                prices: HashMap::new(),
                opens: HashMap::new(),
            })),
        }
    }

    fn starting_price(symbol: &str) -> f64 {
        match symbol {
            "BTCUSDT" => 60_000.0,
            "ETHUSDT" => 3_000.0,
            "SOLUSDT" => 150.0,
            "BNBUSDT" => 550.0,
            _ => 100.0,
        }
    }

    /// Advance `symbol` one step; returns (price, quantity, buyer_is_maker)
    pub fn step(&self, symbol: &str) -> (f64, f64, bool) {
        let mut state = match self.inner.lock() {
            Ok(state) => state,
            Err(poisoned) => poisoned.into_inner(),
        };
        let current = state
            .prices
            .get(symbol)
            .copied()
            .unwrap_or_else(|| Self::starting_price(symbol));
        state.opens.entry(symbol.to_string()).or_insert(current);

        let change = state.rng.gen_range(-STEP_PCT..STEP_PCT);
        let quantity = state.rng.gen_range(0.001..2.0);
        let maker = state.rng.gen_bool(0.5);

        let next = (current * (1.0 + change)).max(0.01);
        state.prices.insert(symbol.to_string(), next);
        (next, quantity, maker)
    }

    fn snapshot(&self, symbol: &str) -> (f64, f64) {
        let state = match self.inner.lock() {
            Ok(state) => state,
            Err(poisoned) => poisoned.into_inner(),
        };
        let price = state
            .prices
            .get(symbol)
            .copied()
            .unwrap_or_else(|| Self::starting_price(symbol));
        let open = state.opens.get(symbol).copied().unwrap_or(price);
        (price, open)
    }
}

impl Default for RandomWalk {
    fn default() -> Self {
        Self::new()
    }
}

/// Stream of synthetic trade frames in exchange wire format
pub struct DemoConnector {
    walk: RandomWalk,
    tick: Duration,
}

impl DemoConnector {
    pub fn new(walk: RandomWalk, tick: Duration) -> Self {
        Self { walk, tick }
    }
}

#[async_trait]
impl StreamConnector for DemoConnector {
    async fn connect(&self, symbol: &str) -> Result<MessageStream> {
        let walk = self.walk.clone();
        let tick = self.tick;
        let symbol = symbol.to_uppercase();

        let frames = futures::stream::unfold((), move |_| {
            let walk = walk.clone();
            let symbol = symbol.clone();
            async move {
                tokio::time::sleep(tick).await;
                let (price, quantity, maker) = walk.step(&symbol);
                let frame = json!({
                    "stream": format!("{}@trade", symbol.to_lowercase()),
                    "data": {
                        "e": "trade",
                        "s": symbol,
                        "p": format!("{:.8}", price),
                        "q": format!("{:.8}", quantity),
                        "T": Utc::now().timestamp_millis(),
                        "m": maker,
                    }
                });
                Some((Ok(frame.to_string()), ()))
            }
        });
        Ok(frames.boxed())
    }
}

/// Synthetic ticker and kline snapshots from the same walk
pub struct DemoMarket {
    walk: RandomWalk,
}

impl DemoMarket {
    pub fn new(walk: RandomWalk) -> Self {
        Self { walk }
    }
}

#[async_trait]
impl MarketDataSource for DemoMarket {
    async fn fetch_ticker(&self, symbol: &str) -> Result<Ticker> {
        let symbol = symbol.to_uppercase();
        let (price, open) = self.walk.snapshot(&symbol);
        Ok(Ticker {
            last_price: price,
            price_change_percent: (price - open) / open * 100.0,
            volume: 0.0,
            symbol,
        })
    }

    async fn fetch_klines(&self, symbol: &str, interval: &str, limit: u32) -> Result<Vec<Kline>> {
        let symbol = symbol.to_uppercase();
        let now_ms = Utc::now().timestamp_millis();
        let span_ms = 60_000;
        let count = limit as i64;

        let mut klines = Vec::with_capacity(limit as usize);
        for i in 0..count {
            let (close, quantity, _) = self.walk.step(&symbol);
            let open_time_ms = now_ms - (count - i) * span_ms;
            klines.push(Kline {
                symbol: symbol.clone(),
                interval: interval.to_string(),
                open_time_ms,
                close_time_ms: open_time_ms + span_ms - 1,
                open: close,
                high: close,
                low: close,
                close,
                volume: quantity,
                closed: true,
            });
        }
        Ok(klines)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::feed::models::parse_stream_message;
    use crate::types::FeedEvent;

    #[test]
    fn test_walk_stays_near_start() {
        let walk = RandomWalk::seeded(7);
        let mut last = 0.0;
        for _ in 0..100 {
            let (price, quantity, _) = walk.step("ETHUSDT");
            assert!(price > 0.0);
            assert!(quantity > 0.0);
            last = price;
        }
        // 100 steps of at most 0.15% each
        assert!(last > 3_000.0 * 0.85 && last < 3_000.0 * 1.17);
    }

    #[tokio::test(start_paused = true)]
    async fn test_demo_frames_parse_as_trades() {
        let connector = DemoConnector::new(RandomWalk::seeded(1), Duration::from_millis(250));
        let mut stream = connector.connect("btcusdt").await.unwrap();

        let frame = stream.next().await.unwrap().unwrap();
        match parse_stream_message(&frame).unwrap() {
            Some(FeedEvent::Trade(trade)) => {
                assert_eq!(trade.symbol, "BTCUSDT");
                assert!((trade.price - 60_000.0).abs() < 100.0);
            }
            other => panic!("unexpected event: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_demo_klines_are_closed_and_ordered() {
        let market = DemoMarket::new(RandomWalk::seeded(3));
        let klines = market.fetch_klines("SOLUSDT", "1m", 30).await.unwrap();
        assert_eq!(klines.len(), 30);
        assert!(klines.iter().all(|k| k.closed));
        assert!(klines.windows(2).all(|w| w[0].open_time_ms < w[1].open_time_ms));
    }
}
