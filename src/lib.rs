// Library crate - exports the feed, the signal pipeline and the HTTP surface

pub mod api;
pub mod config;
pub mod error;
pub mod feed;
pub mod signals;
pub mod types;

// Re-export commonly used types
pub use config::{FeedConfig, ReconnectPolicy, RiskRewardMode, SignalPolicy};
pub use error::PipelineError;
pub use feed::MarketDataFeed;
pub use signals::SignalService;
pub use types::*;
