//! Signal service
//!
//! Applies feed events to per-symbol windows and answers signal requests:
//! indicators → rule score + prediction → levels → blended confidence,
//! arbitrated by the per-symbol cache. Requests never fail; when the
//! pipeline cannot run a clearly marked placeholder is returned instead.

use anyhow::{anyhow, Result};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{broadcast, RwLock};
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::indicators::{self, MIN_TRADES};
use super::predictor::{blend, StatisticalPredictor};
use super::registry::{normalize, SymbolHandle, SymbolRegistry};
use super::rules::RuleScorer;
use crate::config::{FeedConfig, SignalPolicy};
use crate::error::PipelineError;
use crate::feed::{MarketDataFeed, MarketDataSource};
use crate::types::{FeedEvent, Kline, Signal, SignalTimestamp, SignalType, Timeframe, Trade};

/// Half-width of placeholder levels around the last known price
const FALLBACK_BAND: f64 = 0.05;

/// Feed health as seen through its events
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum ConnectionStatus {
    /// No lifecycle event received yet
    Idle,
    Connected { symbol: String },
    Disconnected { reason: String },
    Reconnecting { attempt: u32 },
    Failed { message: String },
}

impl ConnectionStatus {
    /// Why market data is not flowing, if it isn't
    pub fn failure(&self) -> Option<String> {
        match self {
            Self::Idle | Self::Connected { .. } => None,
            Self::Disconnected { reason } => Some(reason.clone()),
            Self::Reconnecting { attempt } => Some(format!("reconnecting (attempt {})", attempt)),
            Self::Failed { message } => Some(message.clone()),
        }
    }
}

/// Kline seeding parameters
#[derive(Debug, Clone)]
struct Seeding {
    interval: String,
    limit: u32,
}

/// Entry point for everything outside the pipeline
pub struct SignalService {
    registry: SymbolRegistry,
    scorer: RuleScorer,
    predictor: StatisticalPredictor,
    source: Option<Arc<dyn MarketDataSource>>,
    feed: Option<Arc<MarketDataFeed>>,
    seeding: Seeding,
    active_symbol: RwLock<String>,
    available: RwLock<Vec<String>>,
    status: RwLock<ConnectionStatus>,
    pipeline_runs: AtomicU64,
}

impl SignalService {
    /// Service over `symbols`; the first one starts active
    pub fn new(policy: SignalPolicy, symbols: Vec<String>) -> Self {
        let mut available: Vec<String> = Vec::new();
        for symbol in symbols.iter().map(|s| normalize(s)) {
            if !symbol.is_empty() && !available.contains(&symbol) {
                available.push(symbol);
            }
        }
        let active = available.first().cloned().unwrap_or_else(|| "BTCUSDT".to_string());
        if available.is_empty() {
            available.push(active.clone());
        }

        let defaults = FeedConfig::default();
        Self {
            scorer: RuleScorer::new(&policy),
            registry: SymbolRegistry::new(policy),
            predictor: StatisticalPredictor::default(),
            source: None,
            feed: None,
            seeding: Seeding {
                interval: defaults.kline_interval,
                limit: defaults.kline_seed_limit,
            },
            active_symbol: RwLock::new(active),
            available: RwLock::new(available),
            status: RwLock::new(ConnectionStatus::Idle),
            pipeline_runs: AtomicU64::new(0),
        }
    }

    /// REST source used to seed windows that are still below the indicator minimum
    pub fn with_source(mut self, source: Arc<dyn MarketDataSource>, config: &FeedConfig) -> Self {
        self.source = Some(source);
        self.seeding = Seeding {
            interval: config.kline_interval.clone(),
            limit: config.kline_seed_limit,
        };
        self
    }

    /// Feed that follows `change_symbol`
    pub fn with_feed(mut self, feed: Arc<MarketDataFeed>) -> Self {
        self.feed = Some(feed);
        self
    }

    pub fn registry(&self) -> &SymbolRegistry {
        &self.registry
    }

    pub async fn active_symbol(&self) -> String {
        self.active_symbol.read().await.clone()
    }

    pub async fn connection_status(&self) -> ConnectionStatus {
        self.status.read().await.clone()
    }

    /// Number of full pipeline executions so far
    pub fn pipeline_runs(&self) -> u64 {
        self.pipeline_runs.load(Ordering::SeqCst)
    }

    // ========================================================================
    // Feed side
    // ========================================================================

    /// Consume feed events until the channel closes
    pub async fn run(self: Arc<Self>, mut events: broadcast::Receiver<FeedEvent>) {
        info!("Signal service consuming feed events");
        loop {
            match events.recv().await {
                Ok(event) => self.apply_event(&event).await,
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!("Signal service lagged, {} feed events dropped", skipped);
                }
                Err(broadcast::error::RecvError::Closed) => {
                    info!("Feed channel closed, signal service stopping");
                    break;
                }
            }
        }
    }

    pub async fn apply_event(&self, event: &FeedEvent) {
        match event {
            FeedEvent::Trade(trade) => {
                let handle = self.registry.handle(&trade.symbol).await;
                handle.window.write().await.push(trade.clone());
                *handle.last_price.write().await = Some(trade.price);
            }
            FeedEvent::Kline(kline) => {
                if kline.closed {
                    let handle = self.registry.handle(&kline.symbol).await;
                    let mut window = handle.window.write().await;
                    if window.len() < MIN_TRADES && window.insert_ordered(kline_trade(kline)) {
                        debug!("Seeded {} from closed {} kline", kline.symbol, kline.interval);
                    }
                }
            }
            FeedEvent::Ticker(ticker) => {
                let handle = self.registry.handle(&ticker.symbol).await;
                *handle.last_price.write().await = Some(ticker.last_price);
            }
            FeedEvent::Connected { symbol } => {
                *self.status.write().await = ConnectionStatus::Connected {
                    symbol: symbol.clone(),
                };
            }
            FeedEvent::Disconnected { reason } => {
                let mut status = self.status.write().await;
                // A terminal failure stays visible until the next connect
                if !matches!(*status, ConnectionStatus::Failed { .. }) {
                    *status = ConnectionStatus::Disconnected {
                        reason: reason.clone(),
                    };
                }
            }
            FeedEvent::Reconnecting { attempt, .. } => {
                *self.status.write().await = ConnectionStatus::Reconnecting { attempt: *attempt };
            }
            FeedEvent::Error { message } => {
                warn!("Feed reported error: {}", message);
                *self.status.write().await = ConnectionStatus::Failed {
                    message: message.clone(),
                };
            }
        }
    }

    // ========================================================================
    // Request side
    // ========================================================================

    /// Signal for `timeframe` on `symbol` (active symbol when None)
    pub async fn get_signal(&self, timeframe: Timeframe, symbol: Option<&str>, force_refresh: bool) -> Signal {
        if force_refresh {
            return self.refresh_signal(timeframe, symbol).await;
        }

        let handle = self.resolve(symbol).await;
        let now = Utc::now();
        let price = current_price(&handle).await;

        let result = handle
            .cache
            .get_or_generate(timeframe, now, price, || self.generate(&handle, timeframe, now))
            .await;

        match result {
            Ok(signal) => signal,
            Err(e) => self.fallback(&handle, timeframe, now, &e).await,
        }
    }

    /// Drop cached signals for the symbol and regenerate `timeframe`
    pub async fn refresh_signal(&self, timeframe: Timeframe, symbol: Option<&str>) -> Signal {
        let handle = self.resolve(symbol).await;
        let now = Utc::now();
        info!("Refreshing {} {} signal", handle.symbol(), timeframe);

        let result = handle
            .cache
            .refresh(timeframe, now, || self.generate(&handle, timeframe, now))
            .await;

        match result {
            Ok(signal) => signal,
            Err(e) => self.fallback(&handle, timeframe, now, &e).await,
        }
    }

    /// Make `symbol` active. Collected history for every symbol is kept.
    pub async fn change_symbol(&self, symbol: &str) -> Result<String> {
        let symbol = normalize(symbol);
        if symbol.len() < 2 || !symbol.chars().all(|c| c.is_ascii_alphanumeric()) {
            return Err(anyhow!("Invalid symbol: {:?}", symbol));
        }

        {
            let mut active = self.active_symbol.write().await;
            if *active == symbol {
                return Ok(symbol);
            }
            *active = symbol.clone();
        }

        {
            let mut available = self.available.write().await;
            if !available.contains(&symbol) {
                available.push(symbol.clone());
            }
        }

        self.registry.handle(&symbol).await;
        if let Some(feed) = &self.feed {
            feed.set_symbol(&symbol);
        }
        info!("Active symbol is now {}", symbol);
        Ok(symbol)
    }

    pub async fn available_symbols(&self) -> Vec<String> {
        self.available.read().await.clone()
    }

    async fn resolve(&self, symbol: Option<&str>) -> Arc<SymbolHandle> {
        match symbol.map(normalize).filter(|s| !s.is_empty()) {
            Some(symbol) => self.registry.handle(&symbol).await,
            None => {
                let active = self.active_symbol().await;
                self.registry.handle(&active).await
            }
        }
    }

    // ========================================================================
    // Pipeline
    // ========================================================================

    async fn generate(
        &self,
        handle: &SymbolHandle,
        timeframe: Timeframe,
        now: DateTime<Utc>,
    ) -> Result<Signal, PipelineError> {
        let mut seed_error = None;
        if handle.window.read().await.len() < MIN_TRADES {
            if let Err(e) = self.seed_from_klines(handle).await {
                warn!("Kline seeding for {} failed: {:#}", handle.symbol(), e);
                seed_error = Some(e);
            }
        }

        let window = handle.window.read().await;
        let Some(ind) = indicators::compute(&window) else {
            let trades = window.len();
            drop(window);
            return Err(self.insufficient(handle.symbol(), trades, seed_error).await);
        };

        let mut score = self.scorer.score(&ind);
        let prediction = self.predictor.predict(&ind);
        let levels = self
            .scorer
            .price_levels(&window, &ind, &score, Some(&prediction));
        drop(window);

        let confidence = blend(score.signal_type, score.confidence, &mut score.reasoning, &prediction);

        let signal = Signal {
            id: Uuid::new_v4(),
            symbol: handle.symbol().to_string(),
            signal: score.signal_type,
            entry_point: levels.entry,
            stop_loss: levels.stop_loss,
            target_price: levels.target,
            confidence,
            reasoning: score.reasoning,
            timestamp: SignalTimestamp { at: now, timeframe },
            generated_at: now,
            prediction: Some(prediction),
            fallback: false,
        };

        if !signal.levels_are_ordered() {
            return Err(PipelineError::Market(anyhow!(
                "Inconsistent levels for {}: stop {} entry {} target {}",
                signal.symbol,
                signal.stop_loss,
                signal.entry_point,
                signal.target_price
            )));
        }

        handle.window.write().await.record_signal(signal.signal, now);
        self.pipeline_runs.fetch_add(1, Ordering::SeqCst);
        info!(
            "Generated {} {} {} signal at {:.2} (confidence {}, r:r {:.2})",
            signal.symbol, timeframe, signal.signal, signal.entry_point, signal.confidence, levels.risk_reward
        );
        Ok(signal)
    }

    /// Fill a short window with one trade per kline close
    async fn seed_from_klines(&self, handle: &SymbolHandle) -> Result<()> {
        let Some(source) = &self.source else {
            return Ok(());
        };

        let klines = source
            .fetch_klines(handle.symbol(), &self.seeding.interval, self.seeding.limit)
            .await?;

        let mut window = handle.window.write().await;
        // Re-check under the write lock, live trades may have arrived
        if window.len() >= MIN_TRADES {
            return Ok(());
        }
        let was_empty = window.is_empty();
        // History goes behind any live trades, newest kline first
        let mut seeded = 0;
        for kline in klines.iter().rev().filter(|k| k.closed) {
            if window.backfill(kline_trade(kline)) {
                seeded += 1;
            }
        }
        if was_empty {
            if let Some(price) = window.latest_price() {
                *handle.last_price.write().await = Some(price);
            }
        }
        info!("Seeded {} with {} klines ({} trades in window)", handle.symbol(), seeded, window.len());
        Ok(())
    }

    async fn insufficient(&self, symbol: &str, trades: usize, seed_error: Option<anyhow::Error>) -> PipelineError {
        if let Some(message) = self.status.read().await.failure() {
            return PipelineError::ConnectionFailed { message };
        }
        match seed_error {
            Some(e) => PipelineError::Market(e),
            None => PipelineError::InsufficientData {
                symbol: symbol.to_string(),
                trades,
                required: MIN_TRADES,
            },
        }
    }

    /// Placeholder HOLD around the last known price, never cached
    async fn fallback(
        &self,
        handle: &SymbolHandle,
        timeframe: Timeframe,
        now: DateTime<Utc>,
        error: &PipelineError,
    ) -> Signal {
        warn!("Fallback signal for {} {}: {}", handle.symbol(), timeframe, error);

        let reasoning = match error {
            PipelineError::InsufficientData { trades, required, .. } => format!(
                "Insufficient data: {} of {} trades collected, waiting for market data",
                trades, required
            ),
            PipelineError::ConnectionFailed { message } => {
                format!("Market data connection failure ({}), levels are placeholders", message)
            }
            PipelineError::Market(e) => format!("Market data unavailable: {:#}", e),
        };

        let (entry, stop_loss, target) = match current_price(handle).await {
            Some(price) if price > 0.0 => (
                price,
                price * (1.0 - FALLBACK_BAND),
                price * (1.0 + FALLBACK_BAND),
            ),
            // Unpriced placeholder
            _ => (0.0, 0.0, 0.0),
        };

        Signal {
            id: Uuid::new_v4(),
            symbol: handle.symbol().to_string(),
            signal: SignalType::Hold,
            entry_point: entry,
            stop_loss,
            target_price: target,
            confidence: 0,
            reasoning,
            timestamp: SignalTimestamp { at: now, timeframe },
            generated_at: now,
            prediction: None,
            fallback: true,
        }
    }
}

async fn current_price(handle: &SymbolHandle) -> Option<f64> {
    if let Some(price) = handle.window.read().await.latest_price() {
        return Some(price);
    }
    *handle.last_price.read().await
}

fn kline_trade(kline: &Kline) -> Trade {
    Trade {
        symbol: kline.symbol.clone(),
        price: kline.close,
        quantity: kline.volume,
        trade_time_ms: kline.close_time_ms,
        is_buyer_maker: false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Ticker;
    use async_trait::async_trait;
    use std::sync::atomic::AtomicUsize;

    fn trade(symbol: &str, price: f64, seconds_ago: i64) -> FeedEvent {
        FeedEvent::Trade(Trade {
            symbol: symbol.to_string(),
            price,
            quantity: 1.0,
            trade_time_ms: Utc::now().timestamp_millis() - seconds_ago * 1_000,
            is_buyer_maker: false,
        })
    }

    fn service() -> SignalService {
        SignalService::new(
            SignalPolicy::default(),
            vec!["BTCUSDT".to_string(), "ETHUSDT".to_string()],
        )
    }

    async fn feed_uptrend(service: &SignalService, symbol: &str) {
        for i in 0..25 {
            let price = 2000.0 + 50.0 * i as f64 / 24.0;
            service.apply_event(&trade(symbol, price, 25 - i)).await;
        }
    }

    async fn feed_flat(service: &SignalService, symbol: &str, price: f64, count: i64) {
        for i in 0..count {
            service.apply_event(&trade(symbol, price, count - i)).await;
        }
    }

    struct KlineSource {
        calls: AtomicUsize,
    }

    #[async_trait]
    impl MarketDataSource for KlineSource {
        async fn fetch_ticker(&self, symbol: &str) -> Result<Ticker> {
            Ok(Ticker {
                symbol: symbol.to_string(),
                last_price: 101.0,
                price_change_percent: 0.0,
                volume: 0.0,
            })
        }

        async fn fetch_klines(&self, symbol: &str, interval: &str, limit: u32) -> Result<Vec<Kline>> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let now = Utc::now().timestamp_millis();
            Ok((0..limit as i64)
                .map(|i| Kline {
                    symbol: symbol.to_string(),
                    interval: interval.to_string(),
                    open_time_ms: now - (limit as i64 - i + 1) * 60_000,
                    close_time_ms: now - (limit as i64 - i + 1) * 60_000 + 59_999,
                    open: 100.0,
                    high: 100.0,
                    low: 100.0,
                    close: 100.0 + i as f64 * 0.01,
                    volume: 1.0,
                    closed: true,
                })
                .collect())
        }
    }

    struct FailingSource;

    #[async_trait]
    impl MarketDataSource for FailingSource {
        async fn fetch_ticker(&self, _symbol: &str) -> Result<Ticker> {
            Err(anyhow!("timeout"))
        }

        async fn fetch_klines(&self, _symbol: &str, _interval: &str, _limit: u32) -> Result<Vec<Kline>> {
            Err(anyhow!("timeout"))
        }
    }

    #[tokio::test]
    async fn test_uptrend_produces_buy() {
        let service = service();
        feed_uptrend(&service, "ETHUSDT").await;

        let signal = service.get_signal(Timeframe::M5, Some("ETHUSDT"), false).await;
        assert_eq!(signal.signal, SignalType::Buy);
        assert!(!signal.fallback);
        assert!(signal.stop_loss < 2000.0);
        assert!(signal.target_price > 2050.0);
        assert!(signal.levels_are_ordered());
        assert!(signal.confidence <= 95);
        assert_eq!(signal.timestamp.timeframe, Timeframe::M5);
    }

    #[tokio::test]
    async fn test_flat_market_holds_with_symmetric_band() {
        let service = service();
        feed_flat(&service, "BTCUSDT", 100.0, 50).await;

        let signal = service.get_signal(Timeframe::M1, None, false).await;
        assert_eq!(signal.signal, SignalType::Hold);
        assert!(signal.levels_are_ordered());

        let below = signal.entry_point - signal.stop_loss;
        let above = signal.target_price - signal.entry_point;
        assert!((below - above).abs() < 1e-9);
        assert!(below >= 3.0 - 1e-9 && below <= 7.0 + 1e-9);
    }

    #[tokio::test]
    async fn test_repeat_get_reuses_cached_signal() {
        let service = service();
        feed_uptrend(&service, "ETHUSDT").await;

        let first = service.get_signal(Timeframe::M15, Some("ETHUSDT"), false).await;
        feed_flat(&service, "ETHUSDT", 2051.0, 3).await;
        let second = service.get_signal(Timeframe::M15, Some("ETHUSDT"), false).await;

        assert_eq!(first.id, second.id);
        assert_eq!(first.signal, second.signal);
        assert_eq!(first.entry_point, second.entry_point);
        assert_eq!(first.stop_loss, second.stop_loss);
        assert_eq!(first.target_price, second.target_price);
        assert_eq!(service.pipeline_runs(), 1);
    }

    #[tokio::test]
    async fn test_refresh_always_runs_pipeline() {
        let service = service();
        feed_uptrend(&service, "ETHUSDT").await;

        let first = service.get_signal(Timeframe::M5, Some("ETHUSDT"), false).await;
        assert_eq!(service.pipeline_runs(), 1);

        let refreshed = service.refresh_signal(Timeframe::M5, Some("ETHUSDT")).await;
        assert_eq!(service.pipeline_runs(), 2);
        assert_ne!(first.id, refreshed.id);

        let forced = service.get_signal(Timeframe::M5, Some("ETHUSDT"), true).await;
        assert_eq!(service.pipeline_runs(), 3);
        assert_ne!(refreshed.id, forced.id);
    }

    #[tokio::test]
    async fn test_symbol_caches_are_isolated() {
        let service = service();
        feed_uptrend(&service, "ETHUSDT").await;
        feed_flat(&service, "BTCUSDT", 60_000.0, 30).await;

        service.get_signal(Timeframe::M5, Some("BTCUSDT"), false).await;
        let btc = service.registry().handle("BTCUSDT").await;
        let before = btc.cache.entry(Timeframe::M5).await;

        feed_flat(&service, "ETHUSDT", 1_500.0, 40).await;
        service.refresh_signal(Timeframe::M5, Some("ETHUSDT")).await;

        assert_eq!(btc.cache.entry(Timeframe::M5).await, before);
        assert_eq!(btc.window.read().await.len(), 30);
    }

    #[tokio::test]
    async fn test_fallback_without_data() {
        let service = service();

        let signal = service.get_signal(Timeframe::H1, Some("SOLUSDT"), false).await;
        assert!(signal.fallback);
        assert_eq!(signal.signal, SignalType::Hold);
        assert_eq!(signal.confidence, 0);
        assert!(signal.reasoning.starts_with("Insufficient data"));
        assert_eq!(signal.entry_point, 0.0);
        assert_eq!(signal.stop_loss, 0.0);
        assert_eq!(signal.target_price, 0.0);
        assert!(signal.is_unpriced());
        assert!(!signal.levels_are_ordered());
        assert_eq!(service.pipeline_runs(), 0);

        service
            .apply_event(&FeedEvent::Ticker(Ticker {
                symbol: "SOLUSDT".to_string(),
                last_price: 100.0,
                price_change_percent: 1.0,
                volume: 10.0,
            }))
            .await;
        let signal = service.get_signal(Timeframe::H1, Some("SOLUSDT"), false).await;
        assert!(signal.fallback);
        assert!(!signal.is_unpriced());
        assert!(signal.levels_are_ordered());
        assert_eq!(signal.entry_point, 100.0);
        assert!((signal.stop_loss - 95.0).abs() < 1e-9);
        assert!((signal.target_price - 105.0).abs() < 1e-9);
    }

    #[tokio::test]
    async fn test_fallback_reports_connection_failure() {
        let service = service();
        service
            .apply_event(&FeedEvent::Error {
                message: "Connection failed after 5 reconnect attempts".to_string(),
            })
            .await;
        service
            .apply_event(&FeedEvent::Disconnected {
                reason: "manual disconnect".to_string(),
            })
            .await;

        let signal = service.get_signal(Timeframe::M1, None, false).await;
        assert!(signal.fallback);
        assert!(signal.reasoning.contains("connection failure"));
        assert!(signal.reasoning.contains("5 reconnect attempts"));

        service
            .apply_event(&FeedEvent::Connected {
                symbol: "BTCUSDT".to_string(),
            })
            .await;
        let signal = service.get_signal(Timeframe::M1, None, false).await;
        assert!(signal.reasoning.starts_with("Insufficient data"));
    }

    #[tokio::test]
    async fn test_seeds_from_klines_when_window_is_short() {
        let source = Arc::new(KlineSource {
            calls: AtomicUsize::new(0),
        });
        let config = FeedConfig {
            kline_seed_limit: 30,
            ..Default::default()
        };
        let service = service().with_source(source.clone(), &config);

        let signal = service.get_signal(Timeframe::M1, Some("BNBUSDT"), false).await;
        assert!(!signal.fallback);
        assert!(signal.levels_are_ordered());
        assert_eq!(source.calls.load(Ordering::SeqCst), 1);

        let handle = service.registry().handle("BNBUSDT").await;
        assert_eq!(handle.window.read().await.len(), 30);
    }

    #[tokio::test]
    async fn test_seeding_keeps_live_trades_newest() {
        let source = Arc::new(KlineSource {
            calls: AtomicUsize::new(0),
        });
        let config = FeedConfig {
            kline_seed_limit: 30,
            ..Default::default()
        };
        let service = service().with_source(source.clone(), &config);
        feed_flat(&service, "BNBUSDT", 200.0, 5).await;

        let signal = service.get_signal(Timeframe::M5, Some("BNBUSDT"), false).await;
        assert_eq!(source.calls.load(Ordering::SeqCst), 1);
        assert_eq!(signal.entry_point, 200.0);

        let handle = service.registry().handle("BNBUSDT").await;
        let window = handle.window.read().await;
        assert_eq!(window.len(), 35);
        assert_eq!(window.latest_price(), Some(200.0));
        let times: Vec<i64> = window.times().iter().copied().collect();
        assert!(times.windows(2).all(|w| w[0] >= w[1]));
        drop(window);
        assert_eq!(*handle.last_price.read().await, Some(200.0));
    }

    #[tokio::test]
    async fn test_seeding_failure_degrades_to_fallback() {
        let service = service().with_source(Arc::new(FailingSource), &FeedConfig::default());
        let signal = service.get_signal(Timeframe::M1, None, false).await;
        assert!(signal.fallback);
        assert!(signal.reasoning.contains("timeout"));
    }

    #[tokio::test]
    async fn test_closed_klines_only_fill_short_windows() {
        let service = service();
        let kline = |close: f64, closed: bool| {
            FeedEvent::Kline(Kline {
                symbol: "ETHUSDT".to_string(),
                interval: "1m".to_string(),
                open_time_ms: Utc::now().timestamp_millis() - 120_000,
                close_time_ms: Utc::now().timestamp_millis() - 60_000,
                open: close,
                high: close,
                low: close,
                close,
                volume: 2.0,
                closed,
            })
        };

        service.apply_event(&kline(2000.0, false)).await;
        service.apply_event(&kline(2001.0, true)).await;
        let handle = service.registry().handle("ETHUSDT").await;
        assert_eq!(handle.window.read().await.len(), 1);

        feed_flat(&service, "ETHUSDT", 2002.0, 25).await;
        service.apply_event(&kline(2003.0, true)).await;
        assert_eq!(handle.window.read().await.len(), 26);
    }

    #[tokio::test]
    async fn test_run_applies_events_until_closed() {
        let service = Arc::new(service());
        let (tx, rx) = broadcast::channel(64);
        let task = tokio::spawn(service.clone().run(rx));

        for i in 0..10 {
            tx.send(trade("BTCUSDT", 100.0 + i as f64, 10 - i)).unwrap();
        }
        tx.send(FeedEvent::Connected {
            symbol: "BTCUSDT".to_string(),
        })
        .unwrap();
        drop(tx);
        task.await.unwrap();

        let handle = service.registry().handle("BTCUSDT").await;
        assert_eq!(handle.window.read().await.len(), 10);
        assert_eq!(
            service.connection_status().await,
            ConnectionStatus::Connected {
                symbol: "BTCUSDT".to_string()
            }
        );
    }

    #[tokio::test]
    async fn test_change_symbol() {
        let service = service();
        assert_eq!(service.active_symbol().await, "BTCUSDT");

        assert_eq!(service.change_symbol("solusdt").await.unwrap(), "SOLUSDT");
        assert_eq!(service.active_symbol().await, "SOLUSDT");
        assert_eq!(
            service.available_symbols().await,
            vec!["BTCUSDT".to_string(), "ETHUSDT".to_string(), "SOLUSDT".to_string()]
        );

        assert!(service.change_symbol("").await.is_err());
        assert!(service.change_symbol("BTC/USDT").await.is_err());
        assert_eq!(service.active_symbol().await, "SOLUSDT");
    }
}
