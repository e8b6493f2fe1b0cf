//! Live market data feed
//!
//! Owns the exchange stream connection for the active symbol and fans out
//! parsed [`FeedEvent`]s over a broadcast channel. Handles:
//! - Exponential-backoff reconnects with a bounded attempt budget
//! - Switching the subscribed symbol without restarting the process
//! - REST ticker polling alongside the stream

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use futures::stream::BoxStream;
use futures::StreamExt;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, watch, Mutex, RwLock};
use tokio::task::JoinHandle;
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tracing::{debug, error, info, warn};

use super::models::parse_stream_message;
use super::rest::{MarketDataSource, RestClient};
use crate::config::{FeedConfig, ReconnectPolicy};
use crate::signals::registry::normalize;
use crate::types::{FeedEvent, Kline, Ticker};

/// Capacity of the event fan-out channel
pub const EVENT_CHANNEL_CAPACITY: usize = 4096;

/// Text frames from one stream session; an `Err` ends the session
pub type MessageStream = BoxStream<'static, Result<String>>;

/// Opens a stream session for one symbol
#[async_trait]
pub trait StreamConnector: Send + Sync {
    async fn connect(&self, symbol: &str) -> Result<MessageStream>;
}

/// Combined trade/kline/ticker stream over WebSocket
pub struct BinanceConnector {
    base_url: String,
    kline_interval: String,
}

impl BinanceConnector {
    pub fn new(base_url: impl Into<String>, kline_interval: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            kline_interval: kline_interval.into(),
        }
    }

    pub fn stream_url(&self, symbol: &str) -> String {
        let s = symbol.to_lowercase();
        format!(
            "{}/stream?streams={s}@trade/{s}@kline_{}/{s}@ticker",
            self.base_url, self.kline_interval
        )
    }
}

#[async_trait]
impl StreamConnector for BinanceConnector {
    async fn connect(&self, symbol: &str) -> Result<MessageStream> {
        let url = self.stream_url(symbol);
        debug!("Connecting to {}", url);

        let (ws, _) = connect_async(url.as_str())
            .await
            .with_context(|| format!("Failed to connect to {}", url))?;

        let frames = ws.filter_map(|msg| async move {
            match msg {
                Ok(Message::Text(text)) => Some(Ok(text)),
                Ok(Message::Close(frame)) => Some(Err(anyhow!("Server closed stream: {:?}", frame))),
                Ok(_) => None,
                Err(e) => Some(Err(anyhow!(e).context("Stream read failed"))),
            }
        });
        Ok(frames.boxed())
    }
}

/// Connection state of the feed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Reconnecting,
    Failed,
}

/// Shared pieces handed to the background tasks
#[derive(Clone)]
struct FeedContext {
    events: broadcast::Sender<FeedEvent>,
    connector: Arc<dyn StreamConnector>,
    rest: Arc<dyn MarketDataSource>,
    reconnect: ReconnectPolicy,
    state: Arc<RwLock<ConnectionState>>,
}

impl FeedContext {
    fn publish(&self, event: FeedEvent) {
        // No subscribers is not an error for the feed
        let _ = self.events.send(event);
    }

    async fn set_state(&self, state: ConnectionState) {
        *self.state.write().await = state;
    }

    async fn handle_frame(&self, text: &str) {
        match parse_stream_message(text) {
            Ok(Some(event)) => self.publish(event),
            Ok(None) => {}
            Err(e) => warn!("Dropping unparsable frame: {:#}", e),
        }
    }
}

/// How one stream session ended
enum SessionEnd {
    Closed(String),
    SymbolChanged,
    Shutdown,
}

/// Market data feed for a single active symbol
pub struct MarketDataFeed {
    config: FeedConfig,
    ctx: FeedContext,
    symbol: watch::Sender<String>,
    shutdown: Mutex<Option<watch::Sender<bool>>>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl MarketDataFeed {
    /// Feed against the configured exchange endpoints
    pub fn new(config: FeedConfig, symbol: &str) -> Self {
        let connector = Arc::new(BinanceConnector::new(
            config.ws_base_url.clone(),
            config.kline_interval.clone(),
        ));
        let rest = Arc::new(RestClient::new(config.rest_base_url.clone()));
        Self::with_parts(config, symbol, connector, rest)
    }

    pub fn with_parts(
        config: FeedConfig,
        symbol: &str,
        connector: Arc<dyn StreamConnector>,
        rest: Arc<dyn MarketDataSource>,
    ) -> Self {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        let (symbol, _) = watch::channel(normalize(symbol));

        Self {
            ctx: FeedContext {
                events,
                connector,
                rest,
                reconnect: config.reconnect.clone(),
                state: Arc::new(RwLock::new(ConnectionState::Disconnected)),
            },
            config,
            symbol,
            shutdown: Mutex::new(None),
            tasks: Mutex::new(Vec::new()),
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<FeedEvent> {
        self.ctx.events.subscribe()
    }

    pub fn symbol(&self) -> String {
        self.symbol.borrow().clone()
    }

    pub async fn state(&self) -> ConnectionState {
        *self.ctx.state.read().await
    }

    /// Start the stream and ticker polling tasks. No-op while already
    /// running; after the stream gave up it starts over with a fresh
    /// reconnect budget.
    pub async fn connect(&self) {
        let mut shutdown = self.shutdown.lock().await;
        let mut tasks = self.tasks.lock().await;

        if let Some(stale) = shutdown.take() {
            let stream_done = tasks.first().map_or(true, |task| task.is_finished());
            if !stream_done && self.state().await != ConnectionState::Failed {
                *shutdown = Some(stale);
                debug!("Feed already running");
                return;
            }

            info!("Restarting market data feed after failure");
            let _ = stale.send(true);
            for task in tasks.drain(..) {
                if let Err(e) = task.await {
                    warn!("Feed task ended abnormally: {}", e);
                }
            }
        }

        let (tx, rx) = watch::channel(false);
        *shutdown = Some(tx);

        info!("Starting market data feed for {}", self.symbol());

        tasks.push(tokio::spawn(run_stream(
            self.ctx.clone(),
            self.symbol.subscribe(),
            rx.clone(),
        )));

        if self.config.ticker_poll_interval_ms > 0 {
            tasks.push(tokio::spawn(poll_ticker(
                self.ctx.clone(),
                self.symbol.subscribe(),
                rx,
                Duration::from_millis(self.config.ticker_poll_interval_ms),
            )));
        }
    }

    /// Stop all tasks and cancel any pending reconnect
    pub async fn disconnect(&self) {
        let Some(tx) = self.shutdown.lock().await.take() else {
            return;
        };
        let _ = tx.send(true);

        let tasks: Vec<JoinHandle<()>> = self.tasks.lock().await.drain(..).collect();
        for task in tasks {
            if let Err(e) = task.await {
                warn!("Feed task ended abnormally: {}", e);
            }
        }

        self.ctx.set_state(ConnectionState::Disconnected).await;
        self.ctx.publish(FeedEvent::Disconnected {
            reason: "manual disconnect".to_string(),
        });
        info!("Market data feed stopped");
    }

    /// Switch the subscribed symbol. Returns false when it is already active.
    pub fn set_symbol(&self, symbol: &str) -> bool {
        let symbol = normalize(symbol);
        if *self.symbol.borrow() == symbol {
            return false;
        }
        info!("Switching feed symbol to {}", symbol);
        self.symbol.send_replace(symbol);
        true
    }

    pub async fn fetch_ticker(&self, symbol: &str) -> Result<Ticker> {
        self.ctx.rest.fetch_ticker(symbol).await
    }

    pub async fn fetch_klines(&self, symbol: &str, interval: &str, limit: u32) -> Result<Vec<Kline>> {
        self.ctx.rest.fetch_klines(symbol, interval, limit).await
    }
}

async fn run_stream(
    ctx: FeedContext,
    mut symbol_rx: watch::Receiver<String>,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut attempt: u32 = 0;

    loop {
        let symbol = symbol_rx.borrow_and_update().clone();
        ctx.set_state(if attempt == 0 {
            ConnectionState::Connecting
        } else {
            ConnectionState::Reconnecting
        })
        .await;

        let connected = tokio::select! {
            result = ctx.connector.connect(&symbol) => result,
            _ = shutdown.changed() => return,
        };

        match connected {
            Ok(stream) => {
                attempt = 0;
                ctx.set_state(ConnectionState::Connected).await;
                info!("Stream connected for {}", symbol);
                ctx.publish(FeedEvent::Connected { symbol: symbol.clone() });

                match read_session(&ctx, stream, &mut symbol_rx, &mut shutdown).await {
                    SessionEnd::Shutdown => return,
                    SessionEnd::SymbolChanged => {
                        ctx.publish(FeedEvent::Disconnected {
                            reason: format!("switching from {}", symbol),
                        });
                        continue;
                    }
                    SessionEnd::Closed(reason) => {
                        warn!("Stream for {} closed: {}", symbol, reason);
                        ctx.publish(FeedEvent::Disconnected { reason });
                    }
                }
            }
            Err(e) => {
                warn!("Stream connect for {} failed: {:#}", symbol, e);
                ctx.publish(FeedEvent::Disconnected {
                    reason: format!("connect failed: {:#}", e),
                });
            }
        }

        attempt += 1;
        let Some(delay) = ctx.reconnect.delay_for(attempt) else {
            error!(
                "Giving up on {} after {} reconnect attempts",
                symbol, ctx.reconnect.max_attempts
            );
            ctx.set_state(ConnectionState::Failed).await;
            ctx.publish(FeedEvent::Error {
                message: format!(
                    "Connection failed after {} reconnect attempts",
                    ctx.reconnect.max_attempts
                ),
            });
            return;
        };

        info!("Reconnecting {} in {:?} (attempt {})", symbol, delay, attempt);
        ctx.set_state(ConnectionState::Reconnecting).await;
        ctx.publish(FeedEvent::Reconnecting { attempt, delay });

        tokio::select! {
            _ = tokio::time::sleep(delay) => {}
            changed = symbol_rx.changed() => {
                if changed.is_err() {
                    return;
                }
                attempt = 0;
            }
            _ = shutdown.changed() => return,
        }
    }
}

async fn read_session(
    ctx: &FeedContext,
    mut stream: MessageStream,
    symbol_rx: &mut watch::Receiver<String>,
    shutdown: &mut watch::Receiver<bool>,
) -> SessionEnd {
    loop {
        tokio::select! {
            frame = stream.next() => match frame {
                Some(Ok(text)) => ctx.handle_frame(&text).await,
                Some(Err(e)) => return SessionEnd::Closed(format!("{:#}", e)),
                None => return SessionEnd::Closed("stream ended".to_string()),
            },
            changed = symbol_rx.changed() => {
                if changed.is_err() {
                    return SessionEnd::Shutdown;
                }
                return SessionEnd::SymbolChanged;
            }
            _ = shutdown.changed() => return SessionEnd::Shutdown,
        }
    }
}

async fn poll_ticker(
    ctx: FeedContext,
    symbol_rx: watch::Receiver<String>,
    mut shutdown: watch::Receiver<bool>,
    every: Duration,
) {
    let mut interval = tokio::time::interval(every);
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = interval.tick() => {}
            _ = shutdown.changed() => return,
        }

        let symbol = symbol_rx.borrow().clone();
        let fetched = tokio::select! {
            result = ctx.rest.fetch_ticker(&symbol) => result,
            _ = shutdown.changed() => return,
        };
        match fetched {
            Ok(ticker) => ctx.publish(FeedEvent::Ticker(ticker)),
            Err(e) => warn!("Ticker poll for {} failed: {:#}", symbol, e),
        }
    }
}
