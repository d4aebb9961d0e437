//! Coinbase REST client for spot prices and 15-minute candles.
//!
//! Spot prices come from the v2 price endpoint; candles from the Exchange
//! products endpoint with granularity 900.

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use reqwest::Client;
use rust_decimal::Decimal;
use serde::Deserialize;
use thiserror::Error;
use tracing::debug;

use crate::Config;

#[derive(Debug, Error)]
pub enum FeedError {
    #[error("HTTP request failed: {0}")]
    RequestError(#[from] reqwest::Error),

    #[error("Failed to parse response: {0}")]
    ParseError(String),

    #[error("API error: {0}")]
    ApiError(String),
}

/// One bar from the candle feed.
#[derive(Debug, Clone, PartialEq)]
pub struct CandleData {
    pub open_time: DateTime<Utc>,
    pub open: Decimal,
    pub high: Decimal,
    pub low: Decimal,
    pub close: Decimal,
    pub volume: Decimal,
}

/// Source of reference spot prices and candles.
#[cfg_attr(any(test, feature = "mocks"), mockall::automock)]
#[async_trait]
pub trait PriceSource: Send + Sync {
    /// Latest spot price for a pair such as `BTC-USD`.
    async fn spot_price(&self, pair: &str) -> Result<Decimal, FeedError>;

    /// Recent 15-minute candles for a pair, most recent first as served.
    async fn candles_15m(&self, pair: &str) -> Result<Vec<CandleData>, FeedError>;
}

#[derive(Debug, Deserialize)]
struct SpotResponse {
    data: SpotData,
}

#[derive(Debug, Deserialize)]
struct SpotData {
    amount: String,
}

/// Raw candle row: `[timestamp, low, high, open, close, volume]`.
#[derive(Debug, Deserialize)]
struct RawCandle(i64, f64, f64, f64, f64, f64);

fn convert_candle(raw: &RawCandle) -> Result<CandleData, FeedError> {
    let open_time = Utc
        .timestamp_opt(raw.0, 0)
        .single()
        .ok_or_else(|| FeedError::ParseError(format!("invalid candle timestamp: {}", raw.0)))?;

    let decimal = |v: f64, field: &str| {
        Decimal::try_from(v).map_err(|e| FeedError::ParseError(format!("{field}: {e}")))
    };

    Ok(CandleData {
        open_time,
        open: decimal(raw.3, "open")?,
        high: decimal(raw.2, "high")?,
        low: decimal(raw.1, "low")?,
        close: decimal(raw.4, "close")?,
        volume: decimal(raw.5, "volume")?,
    })
}

/// Coinbase REST client.
pub struct CoinbaseClient {
    client: Client,
    base_url: String,
    exchange_url: String,
}

impl CoinbaseClient {
    pub fn new(config: &Config) -> Result<Self, FeedError> {
        let mut builder = Client::builder().timeout(Duration::from_secs(10));
        if let Some(proxy) = &config.proxy_url {
            builder = builder.proxy(reqwest::Proxy::all(proxy)?);
        }

        Ok(Self {
            client: builder.build()?,
            base_url: config.coinbase_api_url.clone(),
            exchange_url: config.coinbase_exchange_url.clone(),
        })
    }
}

#[async_trait]
impl PriceSource for CoinbaseClient {
    async fn spot_price(&self, pair: &str) -> Result<Decimal, FeedError> {
        let url = format!("{}/v2/prices/{}/spot", self.base_url, pair);

        let response = self.client.get(&url).send().await?;
        if !response.status().is_success() {
            return Err(FeedError::ApiError(format!(
                "spot endpoint returned status: {}",
                response.status()
            )));
        }

        let spot: SpotResponse = response.json().await?;
        spot.data
            .amount
            .parse::<Decimal>()
            .map_err(|e| FeedError::ParseError(format!("spot amount '{}': {e}", spot.data.amount)))
    }

    async fn candles_15m(&self, pair: &str) -> Result<Vec<CandleData>, FeedError> {
        let url = format!("{}/products/{}/candles", self.exchange_url, pair);

        let response = self
            .client
            .get(&url)
            .query(&[("granularity", "900")])
            .send()
            .await?;

        if !response.status().is_success() {
            return Err(FeedError::ApiError(format!(
                "candles endpoint returned status: {}",
                response.status()
            )));
        }

        let raw: Vec<RawCandle> = response.json().await?;
        let mut candles = Vec::with_capacity(raw.len());
        for row in &raw {
            match convert_candle(row) {
                Ok(candle) => candles.push(candle),
                Err(e) => debug!("Skipping malformed candle for {}: {}", pair, e),
            }
        }

        debug!("Fetched {} candles for {}", candles.len(), pair);
        Ok(candles)
    }
}
