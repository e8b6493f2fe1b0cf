//! Error types for the signal pipeline

use thiserror::Error;

#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("Insufficient data for {symbol}: {trades} trades, need {required}")]
    InsufficientData {
        symbol: String,
        trades: usize,
        required: usize,
    },

    #[error("Market data connection failed: {message}")]
    ConnectionFailed { message: String },

    #[error("Market data error: {0}")]
    Market(#[from] anyhow::Error),
}

pub type Result<T> = std::result::Result<T, PipelineError>;
