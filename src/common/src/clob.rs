//! CLOB REST client: orderbook snapshots and order lifecycle calls.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use rust_decimal::Decimal;
use serde::Deserialize;
use thiserror::Error;
use tracing::debug;

use crate::models::{BookLevel, OrderbookSummary, SignedOrder};
use crate::Config;

/// Depth is summed over this many levels per side.
const DEPTH_LEVELS: usize = 10;

#[derive(Debug, Error)]
pub enum ClobError {
    #[error("HTTP request failed: {0}")]
    RequestError(#[from] reqwest::Error),

    #[error("Order rejected by venue: {0}")]
    Rejected(String),

    #[error("Failed to parse response: {0}")]
    ParseError(String),

    #[error("API error: {0}")]
    ApiError(String),
}

/// Venue acknowledgement of a submitted order.
#[derive(Debug, Clone, Deserialize)]
pub struct VenueAck {
    #[serde(rename = "orderID")]
    pub order_id: String,
}

/// Venue-side order status, as reported by the data API.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VenueOrderStatus {
    Live,
    Matched,
    Cancelled,
    Unknown,
}

impl VenueOrderStatus {
    pub fn parse(s: &str) -> Self {
        match s.to_uppercase().as_str() {
            "LIVE" | "OPEN" => VenueOrderStatus::Live,
            "MATCHED" | "FILLED" => VenueOrderStatus::Matched,
            "CANCELED" | "CANCELLED" => VenueOrderStatus::Cancelled,
            _ => VenueOrderStatus::Unknown,
        }
    }
}

/// Venue-side view of an order, used by reconciliation.
#[derive(Debug, Clone)]
pub struct VenueOrder {
    pub order_id: String,
    pub status: VenueOrderStatus,
    pub size_matched: Option<Decimal>,
}

#[derive(Debug, Deserialize)]
struct RawLevel {
    price: String,
    size: String,
}

#[derive(Debug, Deserialize)]
struct RawBook {
    #[serde(default)]
    bids: Vec<RawLevel>,
    #[serde(default)]
    asks: Vec<RawLevel>,
}

#[derive(Debug, Deserialize)]
struct RawVenueOrder {
    id: String,
    status: String,
    size_matched: Option<String>,
}

/// Build a top-of-book summary from price-sorted levels (best first).
///
/// Best bid/ask are taken by max/min rather than position, so a venue that
/// ever changes its sort order cannot invert the book.
pub fn summarize_book(
    token_id: &str,
    bids: Vec<BookLevel>,
    asks: Vec<BookLevel>,
) -> OrderbookSummary {
    let bids: Vec<BookLevel> = bids.into_iter().take(DEPTH_LEVELS).collect();
    let asks: Vec<BookLevel> = asks.into_iter().take(DEPTH_LEVELS).collect();

    let best_bid = bids.iter().map(|l| l.price).max();
    let best_ask = asks.iter().map(|l| l.price).min();

    let bid_depth: Decimal = bids.iter().map(|l| l.size).sum();
    let ask_depth: Decimal = asks.iter().map(|l| l.size).sum();

    let spread = match (best_bid, best_ask) {
        (Some(bid), Some(ask)) => Some(ask - bid),
        _ => None,
    };

    OrderbookSummary {
        token_id: token_id.to_string(),
        best_bid,
        best_ask,
        bid_depth,
        ask_depth,
        spread,
        bids,
        asks,
    }
}

fn parse_levels(raw: Vec<RawLevel>) -> Vec<BookLevel> {
    raw.into_iter()
        .filter_map(|l| {
            let price = l.price.parse::<Decimal>().ok()?;
            let size = l.size.parse::<Decimal>().ok()?;
            Some(BookLevel { price, size })
        })
        .collect()
}

/// Order venue capability: orderbook reads and order lifecycle calls.
#[cfg_attr(any(test, feature = "mocks"), mockall::automock)]
#[async_trait]
pub trait OrderVenue: Send + Sync {
    /// Fetch a fresh orderbook snapshot for a token.
    async fn orderbook(&self, token_id: &str) -> Result<OrderbookSummary, ClobError>;

    /// Submit a signed order; 2xx acknowledges with the venue order id.
    async fn submit_order(&self, order: &SignedOrder) -> Result<VenueAck, ClobError>;

    /// Cancel an order by its venue id.
    async fn cancel_order(&self, venue_order_id: &str) -> Result<(), ClobError>;

    /// Fetch the venue-side state of an order; `None` when unknown.
    async fn fetch_order(&self, venue_order_id: &str) -> Result<Option<VenueOrder>, ClobError>;
}

/// CLOB REST client.
pub struct ClobClient {
    client: Client,
    base_url: String,
}

impl ClobClient {
    pub fn new(config: &Config) -> Result<Self, ClobError> {
        let mut builder = Client::builder().timeout(Duration::from_secs(30));
        if let Some(proxy) = &config.proxy_url {
            builder = builder.proxy(reqwest::Proxy::all(proxy)?);
        }

        Ok(Self {
            client: builder.build()?,
            base_url: config.clob_api_url.clone(),
        })
    }
}

#[async_trait]
impl OrderVenue for ClobClient {
    async fn orderbook(&self, token_id: &str) -> Result<OrderbookSummary, ClobError> {
        let url = format!("{}/book", self.base_url);

        let response = self
            .client
            .get(&url)
            .query(&[("token_id", token_id)])
            .send()
            .await?;

        if !response.status().is_success() {
            return Err(ClobError::ApiError(format!(
                "book endpoint returned status: {}",
                response.status()
            )));
        }

        let raw: RawBook = response.json().await?;
        Ok(summarize_book(
            token_id,
            parse_levels(raw.bids),
            parse_levels(raw.asks),
        ))
    }

    async fn submit_order(&self, order: &SignedOrder) -> Result<VenueAck, ClobError> {
        let url = format!("{}/order", self.base_url);

        let response = self.client.post(&url).json(order).send().await?;
        let status = response.status();

        if status.is_success() {
            let ack: VenueAck = response.json().await?;
            debug!("Order acknowledged: {}", ack.order_id);
            return Ok(ack);
        }

        let body = response.text().await.unwrap_or_default();
        if status.is_client_error() {
            Err(ClobError::Rejected(format!("{status}: {body}")))
        } else {
            Err(ClobError::ApiError(format!("{status}: {body}")))
        }
    }

    async fn cancel_order(&self, venue_order_id: &str) -> Result<(), ClobError> {
        let url = format!("{}/order/{}", self.base_url, venue_order_id);

        let response = self.client.delete(&url).send().await?;
        let status = response.status();

        if status.is_success() {
            return Ok(());
        }

        let body = response.text().await.unwrap_or_default();
        if status.is_client_error() {
            Err(ClobError::Rejected(format!("{status}: {body}")))
        } else {
            Err(ClobError::ApiError(format!("{status}: {body}")))
        }
    }

    async fn fetch_order(&self, venue_order_id: &str) -> Result<Option<VenueOrder>, ClobError> {
        // The venue's data API serves order lookups.
        let url = format!("{}/data/order/{}", self.base_url, venue_order_id);

        let response = self.client.get(&url).send().await?;
        let status = response.status();

        if status.as_u16() == 404 {
            return Ok(None);
        }
        if !status.is_success() {
            return Err(ClobError::ApiError(format!(
                "order lookup returned status: {status}"
            )));
        }

        let raw: RawVenueOrder = response.json().await?;
        Ok(Some(VenueOrder {
            order_id: raw.id,
            status: VenueOrderStatus::parse(&raw.status),
            size_matched: raw.size_matched.and_then(|s| s.parse().ok()),
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn level(price: Decimal, size: Decimal) -> BookLevel {
        BookLevel { price, size }
    }

    #[test]
    fn summarize_book_depth_uses_top_ten_levels() {
        let bids: Vec<BookLevel> = (0..12)
            .map(|i| level(Decimal::from(50 - i) / Decimal::from(100), dec!(10)))
            .collect();
        let book = summarize_book("tok", bids, vec![level(dec!(0.55), dec!(25))]);

        assert_eq!(book.best_bid, Some(dec!(0.50)));
        assert_eq!(book.best_ask, Some(dec!(0.55)));
        // 12 levels offered, only 10 counted
        assert_eq!(book.bid_depth, dec!(100));
        assert_eq!(book.ask_depth, dec!(25));
        assert_eq!(book.spread, Some(dec!(0.05)));
        assert_eq!(book.bids.len(), 10);
    }

    #[test]
    fn summarize_book_handles_empty_sides() {
        let book = summarize_book("tok", vec![], vec![]);
        assert_eq!(book.best_bid, None);
        assert_eq!(book.best_ask, None);
        assert_eq!(book.spread, None);
        assert_eq!(book.total_depth(), dec!(0));
    }

    #[test]
    fn summarize_book_best_prices_ignore_sort_order() {
        let bids = vec![level(dec!(0.40), dec!(5)), level(dec!(0.48), dec!(5))];
        let asks = vec![level(dec!(0.60), dec!(5)), level(dec!(0.52), dec!(5))];
        let book = summarize_book("tok", bids, asks);

        assert_eq!(book.best_bid, Some(dec!(0.48)));
        assert_eq!(book.best_ask, Some(dec!(0.52)));
    }

    #[test]
    fn raw_book_parses_string_levels() {
        let json = r#"{"bids":[{"price":"0.54","size":"120.5"}],"asks":[{"price":"0.56","size":"80"}]}"#;
        let raw: RawBook = serde_json::from_str(json).unwrap();
        let book = summarize_book("tok", parse_levels(raw.bids), parse_levels(raw.asks));

        assert_eq!(book.best_bid, Some(dec!(0.54)));
        assert_eq!(book.best_ask, Some(dec!(0.56)));
        assert_eq!(book.bid_depth, dec!(120.5));
    }

    #[test]
    fn venue_order_status_parses_known_values() {
        assert_eq!(VenueOrderStatus::parse("LIVE"), VenueOrderStatus::Live);
        assert_eq!(VenueOrderStatus::parse("matched"), VenueOrderStatus::Matched);
        assert_eq!(
            VenueOrderStatus::parse("CANCELED"),
            VenueOrderStatus::Cancelled
        );
        assert_eq!(VenueOrderStatus::parse("???"), VenueOrderStatus::Unknown);
    }

    #[test]
    fn venue_ack_parses() {
        let ack: VenueAck = serde_json::from_str(r#"{"orderID":"0xfeed"}"#).unwrap();
        assert_eq!(ack.order_id, "0xfeed");
    }
}
