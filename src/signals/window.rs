//! Bounded per-symbol trade history

use chrono::{DateTime, Utc};
use std::collections::VecDeque;
use tracing::warn;

use crate::types::{SignalType, Trade};

/// Trades kept per symbol
pub const WINDOW_CAPACITY: usize = 200;

/// Trades stamped further than this into the future are clamped to now
const MAX_FUTURE_SKEW_MS: i64 = 60_000;

/// Trades older than this are clamped to now
const MAX_TRADE_AGE_MS: i64 = 7 * 24 * 60 * 60 * 1000;

/// Most-recent-first window of trades for one symbol.
///
/// Prices, volumes and times are mirrored into parallel deques so the
/// indicator code can walk them without touching the trade structs.
#[derive(Debug, Clone)]
pub struct TradeWindow {
    symbol: String,
    capacity: usize,
    trades: VecDeque<Trade>,
    prices: VecDeque<f64>,
    volumes: VecDeque<f64>,
    times: VecDeque<i64>,
    last_signal: Option<SignalType>,
    last_signal_at: Option<DateTime<Utc>>,
}

impl TradeWindow {
    pub fn new(symbol: impl Into<String>) -> Self {
        Self::with_capacity(symbol, WINDOW_CAPACITY)
    }

    pub fn with_capacity(symbol: impl Into<String>, capacity: usize) -> Self {
        Self {
            symbol: symbol.into(),
            capacity: capacity.max(1),
            trades: VecDeque::with_capacity(capacity),
            prices: VecDeque::with_capacity(capacity),
            volumes: VecDeque::with_capacity(capacity),
            times: VecDeque::with_capacity(capacity),
            last_signal: None,
            last_signal_at: None,
        }
    }

    pub fn symbol(&self) -> &str {
        &self.symbol
    }

    pub fn len(&self) -> usize {
        self.trades.len()
    }

    pub fn is_empty(&self) -> bool {
        self.trades.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Add a trade at the front, evicting the oldest once full
    pub fn push(&mut self, mut trade: Trade) {
        if !trade.price.is_finite() || trade.price <= 0.0 {
            warn!("Dropping trade for {} with invalid price {}", self.symbol, trade.price);
            return;
        }
        if !trade.quantity.is_finite() || trade.quantity < 0.0 {
            warn!("Trade for {} has invalid quantity {}, using 0", self.symbol, trade.quantity);
            trade.quantity = 0.0;
        }
        trade.trade_time_ms = sanitize_trade_time(&self.symbol, trade.trade_time_ms);

        self.prices.push_front(trade.price);
        self.volumes.push_front(trade.quantity);
        self.times.push_front(trade.trade_time_ms);
        self.trades.push_front(trade);

        while self.trades.len() > self.capacity {
            self.trades.pop_back();
            self.prices.pop_back();
            self.volumes.pop_back();
            self.times.pop_back();
        }
    }

    /// Add an older trade at the back. Refused when the window is full or
    /// the trade is not older than the current oldest one.
    pub fn backfill(&mut self, mut trade: Trade) -> bool {
        if self.trades.len() >= self.capacity {
            return false;
        }
        if !trade.price.is_finite() || trade.price <= 0.0 {
            warn!("Dropping backfill for {} with invalid price {}", self.symbol, trade.price);
            return false;
        }
        if !trade.quantity.is_finite() || trade.quantity < 0.0 {
            trade.quantity = 0.0;
        }
        trade.trade_time_ms = sanitize_trade_time(&self.symbol, trade.trade_time_ms);
        if let Some(oldest) = self.times.back() {
            if trade.trade_time_ms >= *oldest {
                return false;
            }
        }

        self.prices.push_back(trade.price);
        self.volumes.push_back(trade.quantity);
        self.times.push_back(trade.trade_time_ms);
        self.trades.push_back(trade);
        true
    }

    /// Place a trade by its timestamp: at the front when it is the newest,
    /// at the back when it is the oldest, dropped when it falls in between.
    pub fn insert_ordered(&mut self, trade: Trade) -> bool {
        match self.times.front() {
            Some(newest) if trade.trade_time_ms < *newest => self.backfill(trade),
            _ => {
                self.push(trade);
                true
            }
        }
    }

    pub fn clear(&mut self) {
        self.trades.clear();
        self.prices.clear();
        self.volumes.clear();
        self.times.clear();
        self.last_signal = None;
        self.last_signal_at = None;
    }

    /// Most recent trade
    pub fn latest(&self) -> Option<&Trade> {
        self.trades.front()
    }

    pub fn latest_price(&self) -> Option<f64> {
        self.prices.front().copied()
    }

    /// Trades, most recent first
    pub fn trades(&self) -> impl Iterator<Item = &Trade> {
        self.trades.iter()
    }

    /// Prices, most recent first
    pub fn prices(&self) -> &VecDeque<f64> {
        &self.prices
    }

    /// Volumes, most recent first
    pub fn volumes(&self) -> &VecDeque<f64> {
        &self.volumes
    }

    /// Trade times in ms, most recent first
    pub fn times(&self) -> &VecDeque<i64> {
        &self.times
    }

    /// Prices ordered oldest to newest
    pub fn prices_chronological(&self) -> Vec<f64> {
        self.prices.iter().rev().copied().collect()
    }

    /// Lowest and highest price among the `n` most recent trades
    pub fn recent_range(&self, n: usize) -> Option<(f64, f64)> {
        if self.prices.is_empty() {
            return None;
        }
        let (low, high) = self
            .prices
            .iter()
            .take(n.max(1))
            .fold((f64::MAX, f64::MIN), |(lo, hi), p| (lo.min(*p), hi.max(*p)));
        Some((low, high))
    }

    pub fn record_signal(&mut self, signal_type: SignalType, at: DateTime<Utc>) {
        self.last_signal = Some(signal_type);
        self.last_signal_at = Some(at);
    }

    pub fn last_signal(&self) -> Option<(SignalType, DateTime<Utc>)> {
        self.last_signal.zip(self.last_signal_at)
    }
}

fn sanitize_trade_time(symbol: &str, trade_time_ms: i64) -> i64 {
    let now_ms = Utc::now().timestamp_millis();
    if trade_time_ms <= 0 {
        warn!("Trade for {} has no usable timestamp ({}), using now", symbol, trade_time_ms);
        return now_ms;
    }
    if trade_time_ms > now_ms + MAX_FUTURE_SKEW_MS {
        warn!(
            "Trade for {} is {}ms in the future, clamping to now",
            symbol,
            trade_time_ms - now_ms
        );
        return now_ms;
    }
    if now_ms - trade_time_ms > MAX_TRADE_AGE_MS {
        warn!("Trade for {} is older than 7 days ({}), clamping to now", symbol, trade_time_ms);
        return now_ms;
    }
    trade_time_ms
}

#[cfg(test)]
mod tests {
    use super::*;

    fn trade(price: f64, ts: i64) -> Trade {
        Trade {
            symbol: "BTCUSDT".to_string(),
            price,
            quantity: 1.0,
            trade_time_ms: ts,
            is_buyer_maker: false,
        }
    }

    #[test]
    fn test_capacity_evicts_oldest() {
        let now = Utc::now().timestamp_millis();
        let mut window = TradeWindow::with_capacity("BTCUSDT", 5);
        for i in 0..8 {
            window.push(trade(100.0 + i as f64, now));
        }

        assert_eq!(window.len(), 5);
        assert_eq!(window.latest_price(), Some(107.0));
        assert_eq!(window.prices_chronological(), vec![103.0, 104.0, 105.0, 106.0, 107.0]);
        assert_eq!(window.volumes().len(), 5);
        assert_eq!(window.times().len(), 5);
    }

    #[test]
    fn test_default_capacity_is_200() {
        let now = Utc::now().timestamp_millis();
        let mut window = TradeWindow::new("ETHUSDT");
        for i in 0..250 {
            window.push(trade(2000.0 + i as f64, now));
        }
        assert_eq!(window.len(), WINDOW_CAPACITY);
        assert_eq!(window.prices().back(), Some(&2050.0));
    }

    #[test]
    fn test_future_timestamp_is_clamped() {
        let now = Utc::now().timestamp_millis();
        let mut window = TradeWindow::new("BTCUSDT");
        window.push(trade(100.0, now + 3_600_000));
        window.push(trade(100.0, 0));

        for ts in window.times() {
            assert!(*ts <= Utc::now().timestamp_millis());
            assert!(*ts > 0);
        }
    }

    #[test]
    fn test_invalid_price_dropped() {
        let mut window = TradeWindow::new("BTCUSDT");
        window.push(trade(f64::NAN, 1));
        window.push(trade(-5.0, 1));
        assert!(window.is_empty());
    }

    #[test]
    fn test_backfill_goes_behind_live_trades() {
        let now = Utc::now().timestamp_millis();
        let mut window = TradeWindow::with_capacity("BTCUSDT", 4);
        window.push(trade(200.0, now - 1_000));
        window.push(trade(201.0, now));

        // Newest history first, each one older than the last
        assert!(window.backfill(trade(100.0, now - 60_000)));
        assert!(window.backfill(trade(99.0, now - 120_000)));
        // Not older than the current oldest
        assert!(!window.backfill(trade(98.0, now - 30_000)));
        assert!(window.backfill(trade(97.0, now - 180_000)));
        // Full
        assert!(!window.backfill(trade(96.0, now - 240_000)));

        assert_eq!(window.latest_price(), Some(201.0));
        assert_eq!(window.prices_chronological(), vec![97.0, 99.0, 100.0, 200.0]);
        let times: Vec<i64> = window.times().iter().copied().collect();
        assert!(times.windows(2).all(|w| w[0] >= w[1]));
    }

    #[test]
    fn test_insert_ordered_skips_trades_inside_the_window() {
        let now = Utc::now().timestamp_millis();
        let mut window = TradeWindow::new("BTCUSDT");
        window.push(trade(100.0, now - 10_000));
        window.push(trade(101.0, now - 5_000));

        assert!(window.insert_ordered(trade(102.0, now)));
        assert!(!window.insert_ordered(trade(103.0, now - 7_000)));
        assert!(window.insert_ordered(trade(99.0, now - 20_000)));

        assert_eq!(window.prices_chronological(), vec![99.0, 100.0, 101.0, 102.0]);
    }

    #[test]
    fn test_recent_range_and_clear() {
        let now = Utc::now().timestamp_millis();
        let mut window = TradeWindow::new("BTCUSDT");
        for p in [10.0, 12.0, 8.0, 11.0] {
            window.push(trade(p, now));
        }
        assert_eq!(window.recent_range(2), Some((8.0, 11.0)));
        assert_eq!(window.recent_range(10), Some((8.0, 12.0)));

        window.record_signal(SignalType::Buy, Utc::now());
        assert!(window.last_signal().is_some());

        window.clear();
        assert!(window.is_empty());
        assert!(window.last_signal().is_none());
        assert_eq!(window.recent_range(5), None);
    }
}
