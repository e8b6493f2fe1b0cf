//! REST market data client
//!
//! Ticker and kline snapshots from the exchange's public HTTP API.

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use chrono::Utc;
use reqwest::Client;
use serde::de::DeserializeOwned;
use std::time::Duration;
use tracing::debug;

use super::models::{RestKline, RestTicker};
use crate::types::{Kline, Ticker};

/// Snapshot queries used for polling and for seeding empty windows
#[async_trait]
pub trait MarketDataSource: Send + Sync {
    async fn fetch_ticker(&self, symbol: &str) -> Result<Ticker>;

    /// Most recent `limit` klines, oldest first
    async fn fetch_klines(&self, symbol: &str, interval: &str, limit: u32) -> Result<Vec<Kline>>;
}

/// HTTP client for the public market data endpoints
pub struct RestClient {
    client: Client,
    base_url: String,
}

impl RestClient {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            client: Client::builder()
                .timeout(Duration::from_secs(10))
                .build()
                .expect("Failed to create HTTP client"),
            base_url: base_url.into().trim_end_matches('/').to_string(),
        }
    }

    async fn get<R: DeserializeOwned>(&self, endpoint: &str, query: &[(&str, String)]) -> Result<R> {
        let response = self
            .client
            .get(format!("{}{}", self.base_url, endpoint))
            .query(query)
            .send()
            .await
            .with_context(|| format!("Failed to send request to {}", endpoint))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(anyhow!("Request to {} failed ({}): {}", endpoint, status, body));
        }

        response
            .json()
            .await
            .with_context(|| format!("Failed to parse response from {}", endpoint))
    }
}

#[async_trait]
impl MarketDataSource for RestClient {
    async fn fetch_ticker(&self, symbol: &str) -> Result<Ticker> {
        debug!("Fetching ticker for {}", symbol);
        let ticker: RestTicker = self
            .get("/api/v3/ticker/24hr", &[("symbol", symbol.to_uppercase())])
            .await?;
        ticker.into_ticker()
    }

    async fn fetch_klines(&self, symbol: &str, interval: &str, limit: u32) -> Result<Vec<Kline>> {
        debug!("Fetching {} {} klines for {}", limit, interval, symbol);
        let rows: Vec<RestKline> = self
            .get(
                "/api/v3/klines",
                &[
                    ("symbol", symbol.to_uppercase()),
                    ("interval", interval.to_string()),
                    ("limit", limit.to_string()),
                ],
            )
            .await?;

        let now_ms = Utc::now().timestamp_millis();
        rows.into_iter()
            .map(|row| row.into_kline(&symbol.to_uppercase(), interval, now_ms))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_base_url_trailing_slash_trimmed() {
        let client = RestClient::new("https://api.binance.com/");
        assert_eq!(client.base_url, "https://api.binance.com");
    }
}
