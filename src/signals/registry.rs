//! Per-symbol state registry
//!
//! Each symbol owns one [`TradeWindow`] and one [`SignalCache`], each behind
//! its own lock, so activity on one symbol never touches another.

use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::debug;

use super::cache::SignalCache;
use super::window::TradeWindow;
use crate::config::SignalPolicy;

/// Window and cache pair for one symbol
#[derive(Debug)]
pub struct SymbolHandle {
    symbol: String,
    pub window: RwLock<TradeWindow>,
    pub cache: SignalCache,
    /// Last price seen from any source (trade, ticker)
    pub last_price: RwLock<Option<f64>>,
}

impl SymbolHandle {
    fn new(symbol: String, policy: SignalPolicy) -> Self {
        Self {
            window: RwLock::new(TradeWindow::new(symbol.clone())),
            cache: SignalCache::new(policy),
            last_price: RwLock::new(None),
            symbol,
        }
    }

    pub fn symbol(&self) -> &str {
        &self.symbol
    }

    /// Empty the window and drop all cached signals
    pub async fn clear(&self) {
        self.window.write().await.clear();
        self.cache.clear().await;
    }
}

/// Keyed registry of [`SymbolHandle`]s, created lazily
#[derive(Debug)]
pub struct SymbolRegistry {
    policy: SignalPolicy,
    symbols: RwLock<HashMap<String, Arc<SymbolHandle>>>,
}

impl SymbolRegistry {
    pub fn new(policy: SignalPolicy) -> Self {
        Self {
            policy,
            symbols: RwLock::new(HashMap::new()),
        }
    }

    /// Handle for `symbol`, creating it on first use
    pub async fn handle(&self, symbol: &str) -> Arc<SymbolHandle> {
        let key = normalize(symbol);
        if let Some(handle) = self.symbols.read().await.get(&key) {
            return handle.clone();
        }

        let mut symbols = self.symbols.write().await;
        symbols
            .entry(key.clone())
            .or_insert_with(|| {
                debug!("Creating state for {}", key);
                Arc::new(SymbolHandle::new(key.clone(), self.policy.clone()))
            })
            .clone()
    }

    pub async fn get(&self, symbol: &str) -> Option<Arc<SymbolHandle>> {
        self.symbols.read().await.get(&normalize(symbol)).cloned()
    }

    pub async fn clear(&self, symbol: &str) {
        if let Some(handle) = self.get(symbol).await {
            handle.clear().await;
        }
    }

    pub async fn remove(&self, symbol: &str) -> Option<Arc<SymbolHandle>> {
        self.symbols.write().await.remove(&normalize(symbol))
    }

    pub async fn symbols(&self) -> Vec<String> {
        let mut symbols: Vec<String> = self.symbols.read().await.keys().cloned().collect();
        symbols.sort();
        symbols
    }
}

pub fn normalize(symbol: &str) -> String {
    symbol.trim().to_uppercase()
}
