//! Gamma API client for discovering binary markets.
//!
//! Fifteen-minute up/down markets are published under slugs of the form
//! `{asset}-updown-15m-{unix-seconds}` with the epoch snapped to a
//! 900-second boundary; the discoverer looks slugs up here and then pulls
//! the event detail to extract condition id, outcome tokens and end time.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use serde::Deserialize;
use thiserror::Error;
use tracing::debug;

use crate::Config;

#[derive(Debug, Error)]
pub enum GammaError {
    #[error("HTTP request failed: {0}")]
    RequestError(#[from] reqwest::Error),

    #[error("Failed to parse response: {0}")]
    ParseError(String),

    #[error("API error: {0}")]
    ApiError(String),
}

/// Raw event data from the Gamma /events endpoint.
#[derive(Debug, Clone, Deserialize)]
pub struct GammaEvent {
    pub id: String,
    pub slug: Option<String>,
    pub title: Option<String>,
    #[serde(rename = "endDate")]
    pub end_date: Option<String>,
    /// Nested markets within this event
    #[serde(default)]
    pub markets: Vec<GammaMarket>,
}

/// Raw market data from the Gamma API (nested in events).
#[derive(Debug, Clone, Deserialize)]
pub struct GammaMarket {
    #[serde(rename = "conditionId")]
    pub condition_id: String,
    pub question: Option<String>,
    pub description: Option<String>,
    #[serde(rename = "endDate")]
    pub end_date: Option<String>,
    /// JSON string of array: "[\"Up\", \"Down\"]" or "[\"Yes\", \"No\"]"
    pub outcomes: Option<String>,
    /// JSON string of array with token IDs
    #[serde(rename = "clobTokenIds")]
    pub clob_token_ids: Option<String>,
}

impl GammaMarket {
    /// Parse the clob_token_ids JSON string into a vector.
    pub fn parse_token_ids(&self) -> Option<Vec<String>> {
        self.clob_token_ids
            .as_ref()
            .and_then(|s| serde_json::from_str::<Vec<String>>(s).ok())
    }

    /// Parse the outcomes JSON string.
    pub fn parse_outcomes(&self) -> Option<Vec<String>> {
        self.outcomes
            .as_ref()
            .and_then(|s| serde_json::from_str::<Vec<String>>(s).ok())
    }
}

/// Map outcome labels onto (yes, no) token ids.
///
/// For up/down markets "Up" plays the YES role and "Down" the NO role.
pub fn outcome_tokens(
    outcomes: &[String],
    tokens: &[String],
) -> (Option<String>, Option<String>) {
    let mut yes_token = None;
    let mut no_token = None;

    for (i, outcome) in outcomes.iter().enumerate() {
        let Some(token) = tokens.get(i) else { break };
        match outcome.to_lowercase().as_str() {
            "up" | "yes" => yes_token = Some(token.clone()),
            "down" | "no" => no_token = Some(token.clone()),
            _ => {}
        }
    }

    (yes_token, no_token)
}

/// Source of event and market metadata.
#[cfg_attr(any(test, feature = "mocks"), mockall::automock)]
#[async_trait]
pub trait MarketSource: Send + Sync {
    /// Look up events by slug; an unknown slug yields an empty list.
    async fn events_by_slug(&self, slug: &str) -> Result<Vec<GammaEvent>, GammaError>;

    /// Fetch the full event detail including nested markets.
    async fn event_detail(&self, event_id: &str) -> Result<GammaEvent, GammaError>;
}

/// Gamma API client.
pub struct GammaClient {
    client: Client,
    base_url: String,
}

impl GammaClient {
    pub fn new(config: &Config) -> Result<Self, GammaError> {
        let mut builder = Client::builder().timeout(Duration::from_secs(30));
        if let Some(proxy) = &config.proxy_url {
            builder = builder.proxy(reqwest::Proxy::all(proxy)?);
        }

        Ok(Self {
            client: builder.build()?,
            base_url: config.gamma_api_url.clone(),
        })
    }
}

#[async_trait]
impl MarketSource for GammaClient {
    async fn events_by_slug(&self, slug: &str) -> Result<Vec<GammaEvent>, GammaError> {
        let url = format!("{}/events", self.base_url);

        debug!("Looking up events for slug={}", slug);

        let response = self.client.get(&url).query(&[("slug", slug)]).send().await?;

        if !response.status().is_success() {
            return Err(GammaError::ApiError(format!(
                "events endpoint returned status: {}",
                response.status()
            )));
        }

        let events: Vec<GammaEvent> = response.json().await?;
        debug!("Found {} events for slug {}", events.len(), slug);
        Ok(events)
    }

    async fn event_detail(&self, event_id: &str) -> Result<GammaEvent, GammaError> {
        let url = format!("{}/events/{}", self.base_url, event_id);

        let response = self.client.get(&url).send().await?;

        if !response.status().is_success() {
            return Err(GammaError::ApiError(format!(
                "event detail returned status: {}",
                response.status()
            )));
        }

        let event: GammaEvent = response.json().await?;
        Ok(event)
    }
}
