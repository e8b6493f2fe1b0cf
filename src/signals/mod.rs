//! Signal pipeline: trade window, indicators, scoring, prediction and caching

pub mod cache;
pub mod indicators;
pub mod predictor;
pub mod registry;
pub mod rules;
pub mod service;
pub mod window;

pub use cache::{CacheEntry, SignalCache};
pub use indicators::{Indicators, MIN_TRADES};
pub use predictor::{FeatureVector, StatisticalPredictor};
pub use registry::{SymbolHandle, SymbolRegistry};
pub use rules::{PriceLevels, RuleScore, RuleScorer};
pub use service::{ConnectionStatus, SignalService};
pub use window::{TradeWindow, WINDOW_CAPACITY};
