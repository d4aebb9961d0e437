//! Market discovery for 15-minute up/down binary markets.
//!
//! Slugs are `{asset}-updown-15m-{epoch}` with the epoch snapped to a
//! 900-second boundary; each pass probes the previous, current and next
//! boundary per asset, pulls event details for hits and upserts markets by
//! condition id.

use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use rust_decimal::Decimal;
use tracing::{debug, info, warn};

use common::gamma::{outcome_tokens, GammaEvent};
use common::models::{DiscoveredMarket, Market, OrderbookSummary};
use common::{Clock, MarketSource, OrderVenue, StateStore, StoreError};

const SLUG_INTERVAL_SECS: i64 = 900;

/// Candidate slugs around `now`: previous, current and next boundary.
pub fn candidate_slugs(asset: &str, now: DateTime<Utc>) -> Vec<String> {
    let prefix = asset.to_lowercase();
    let current = (now.timestamp() / SLUG_INTERVAL_SECS) * SLUG_INTERVAL_SECS;

    [
        current - SLUG_INTERVAL_SECS,
        current,
        current + SLUG_INTERVAL_SECS,
    ]
    .iter()
    .map(|ts| format!("{prefix}-updown-15m-{ts}"))
    .collect()
}

/// Extract a storable market from an event detail.
///
/// Outcomes map Up onto the YES token and Down onto the NO token; token ids
/// stay optional, the worker refuses to trade a side it has no token for.
pub fn parse_event(event: &GammaEvent, asset: &str) -> Option<DiscoveredMarket> {
    let market = event.markets.first()?;

    let end_date = event.end_date.as_ref().or(market.end_date.as_ref())?;
    let end_time = DateTime::parse_from_rfc3339(end_date)
        .ok()?
        .with_timezone(&Utc);

    let (yes_token_id, no_token_id) = match (market.parse_outcomes(), market.parse_token_ids()) {
        (Some(outcomes), Some(tokens)) => outcome_tokens(&outcomes, &tokens),
        _ => (None, None),
    };

    let title = event
        .title
        .clone()
        .or_else(|| market.question.clone())
        .unwrap_or_default();

    Some(DiscoveredMarket {
        condition_id: market.condition_id.clone(),
        slug: event.slug.clone(),
        title,
        description: market.description.clone(),
        asset: asset.to_string(),
        end_time,
        yes_token_id,
        no_token_id,
    })
}

/// Finds the currently tradable binary market per asset and maintains the
/// market table.
pub struct MarketDiscoverer {
    source: Arc<dyn MarketSource>,
    venue: Arc<dyn OrderVenue>,
    store: Arc<dyn StateStore>,
    clock: Arc<dyn Clock>,
    assets: Vec<String>,
}

impl MarketDiscoverer {
    pub fn new(
        source: Arc<dyn MarketSource>,
        venue: Arc<dyn OrderVenue>,
        store: Arc<dyn StateStore>,
        clock: Arc<dyn Clock>,
        assets: Vec<String>,
    ) -> Self {
        Self {
            source,
            venue,
            store,
            clock,
            assets,
        }
    }

    /// One discovery pass over all assets and candidate boundaries.
    pub async fn discover(&self) -> Result<usize, StoreError> {
        let now = self.clock.now();
        let mut found = 0;

        for asset in &self.assets {
            for slug in candidate_slugs(asset, now) {
                let events = match self.source.events_by_slug(&slug).await {
                    Ok(events) => events,
                    Err(e) => {
                        debug!("Slug lookup failed for {}: {}", slug, e);
                        continue;
                    }
                };
                let Some(event) = events.into_iter().next() else {
                    continue;
                };

                let detail = match self.source.event_detail(&event.id).await {
                    Ok(detail) => detail,
                    Err(e) => {
                        warn!("Failed to fetch event detail for {}: {}", slug, e);
                        continue;
                    }
                };

                let Some(market) = parse_event(&detail, asset) else {
                    debug!("Event for {} had no parseable market", slug);
                    continue;
                };
                if market.end_time <= now {
                    debug!("Skipping ended market for {}", slug);
                    continue;
                }

                self.store.upsert_market(&market).await?;
                found += 1;
                info!(
                    "Discovered market: {} (asset {}, ends {})",
                    market.title, asset, market.end_time
                );
            }
        }

        let expired = self.store.deactivate_expired_markets(now).await?;
        if expired > 0 {
            debug!("Deactivated {} expired markets", expired);
        }

        debug!("Market discovery complete: {} found", found);
        Ok(found)
    }

    /// The market this asset may be traded in right now, honoring the close
    /// buffer so every entered market can also be exited before settlement.
    pub async fn tradable_market(
        &self,
        asset: &str,
        close_buffer_minutes: i64,
    ) -> Result<Option<Market>, StoreError> {
        let min_end = self.clock.now() + Duration::minutes(close_buffer_minutes);
        self.store.tradable_market(asset, min_end).await
    }

    /// Fresh orderbook snapshot; `None` on any fetch failure.
    pub async fn orderbook(&self, token_id: &str) -> Option<OrderbookSummary> {
        match self.venue.orderbook(token_id).await {
            Ok(book) => Some(book),
            Err(e) => {
                warn!("Failed to fetch orderbook for {}: {}", token_id, e);
                None
            }
        }
    }

    /// Combined top-10 depth from a single snapshot meets the floor.
    pub async fn has_liquidity(&self, token_id: &str, min_usd: Decimal) -> bool {
        match self.orderbook(token_id).await {
            Some(book) => book.total_depth() >= min_usd,
            None => false,
        }
    }

    /// Persist an orderbook snapshot against a market.
    pub async fn snapshot(
        &self,
        market_id: i64,
        book: &OrderbookSummary,
    ) -> Result<(), StoreError> {
        self.store
            .insert_market_snapshot(market_id, book, self.clock.now())
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use common::gamma::GammaMarket;
    use common::models::BookLevel;
    use common::{ClobError, ManualClock, MemStore, MockMarketSource, MockOrderVenue};
    use rust_decimal_macros::dec;

    fn now() -> DateTime<Utc> {
        // 2023-11-14T22:22:30Z = epoch 1700000550; boundary 1700000100
        Utc.timestamp_opt(1_700_000_550, 0).unwrap()
    }

    fn gamma_market(condition_id: &str, end_date: &str) -> GammaMarket {
        GammaMarket {
            condition_id: condition_id.to_string(),
            question: Some("Bitcoin Up or Down?".to_string()),
            description: Some("15 minute window".to_string()),
            end_date: Some(end_date.to_string()),
            outcomes: Some(r#"["Up", "Down"]"#.to_string()),
            clob_token_ids: Some(r#"["yes-tok", "no-tok"]"#.to_string()),
        }
    }

    fn event(id: &str, slug: &str, end_date: &str, condition_id: &str) -> GammaEvent {
        GammaEvent {
            id: id.to_string(),
            slug: Some(slug.to_string()),
            title: Some("BTC Up or Down".to_string()),
            end_date: Some(end_date.to_string()),
            markets: vec![gamma_market(condition_id, end_date)],
        }
    }

    fn discoverer(
        source: MockMarketSource,
        venue: MockOrderVenue,
    ) -> (Arc<MemStore>, MarketDiscoverer) {
        let clock = Arc::new(ManualClock::new(now()));
        let store = Arc::new(MemStore::new(clock.clone()));
        let discoverer = MarketDiscoverer::new(
            Arc::new(source),
            Arc::new(venue),
            store.clone(),
            clock,
            vec!["BTC".to_string()],
        );
        (store, discoverer)
    }

    #[test]
    fn candidate_slugs_snap_to_900_second_boundaries() {
        let slugs = candidate_slugs("BTC", now());
        assert_eq!(
            slugs,
            vec![
                "btc-updown-15m-1699999200",
                "btc-updown-15m-1700000100",
                "btc-updown-15m-1700001000",
            ]
        );
    }

    #[test]
    fn candidate_slugs_lowercase_the_asset() {
        let slugs = candidate_slugs("SOL", now());
        assert!(slugs[0].starts_with("sol-updown-15m-"));
    }

    #[test]
    fn parse_event_maps_up_down_to_yes_no() {
        let event = event("9", "btc-updown-15m-1700000100", "2023-11-14T22:30:00Z", "0xaa");
        let market = parse_event(&event, "BTC").unwrap();

        assert_eq!(market.condition_id, "0xaa");
        assert_eq!(market.asset, "BTC");
        assert_eq!(market.yes_token_id.as_deref(), Some("yes-tok"));
        assert_eq!(market.no_token_id.as_deref(), Some("no-tok"));
        assert_eq!(
            market.end_time,
            Utc.with_ymd_and_hms(2023, 11, 14, 22, 30, 0).unwrap()
        );
    }

    #[test]
    fn parse_event_without_markets_is_none() {
        let mut event = event("9", "s", "2023-11-14T22:30:00Z", "0xaa");
        event.markets.clear();
        assert!(parse_event(&event, "BTC").is_none());
    }

    #[test]
    fn parse_event_without_end_date_is_none() {
        let mut event = event("9", "s", "2023-11-14T22:30:00Z", "0xaa");
        event.end_date = None;
        event.markets[0].end_date = None;
        assert!(parse_event(&event, "BTC").is_none());
    }

    #[test]
    fn parse_event_tolerates_missing_tokens() {
        let mut event = event("9", "s", "2023-11-14T22:30:00Z", "0xaa");
        event.markets[0].clob_token_ids = None;
        let market = parse_event(&event, "BTC").unwrap();
        assert!(market.yes_token_id.is_none());
        assert!(market.no_token_id.is_none());
    }

    #[tokio::test]
    async fn discover_upserts_markets_found_by_slug() {
        let mut source = MockMarketSource::new();
        source.expect_events_by_slug().returning(|slug| {
            if slug == "btc-updown-15m-1700000100" {
                Ok(vec![event(
                    "9",
                    slug,
                    "2023-11-14T22:30:00Z",
                    "0xaa",
                )])
            } else {
                Ok(vec![])
            }
        });
        source
            .expect_event_detail()
            .withf(|id| id == "9")
            .returning(|_| {
                Ok(event(
                    "9",
                    "btc-updown-15m-1700000100",
                    "2023-11-14T22:30:00Z",
                    "0xaa",
                ))
            });

        let (store, discoverer) = discoverer(source, MockOrderVenue::new());
        let found = discoverer.discover().await.unwrap();
        assert_eq!(found, 1);

        let market = discoverer.tradable_market("BTC", 2).await.unwrap().unwrap();
        assert_eq!(market.condition_id, "0xaa");
        assert!(market.active);

        // Re-discovery updates rather than duplicating.
        let found = discoverer.discover().await.unwrap();
        assert_eq!(found, 1);
        let markets = store.tradable_market("BTC", now()).await.unwrap();
        assert!(markets.is_some());
    }

    #[tokio::test]
    async fn discover_skips_already_ended_markets() {
        let mut source = MockMarketSource::new();
        source.expect_events_by_slug().returning(|slug| {
            if slug == "btc-updown-15m-1699999200" {
                // Ended half an hour before `now`
                Ok(vec![event(
                    "8",
                    slug,
                    "2023-11-14T21:52:00Z",
                    "0xold",
                )])
            } else {
                Ok(vec![])
            }
        });
        source.expect_event_detail().returning(|_| {
            Ok(event(
                "8",
                "btc-updown-15m-1699999200",
                "2023-11-14T21:52:00Z",
                "0xold",
            ))
        });

        let (_store, discoverer) = discoverer(source, MockOrderVenue::new());
        let found = discoverer.discover().await.unwrap();
        assert_eq!(found, 0);
        assert!(discoverer.tradable_market("BTC", 2).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn slug_lookup_failures_do_not_abort_discovery() {
        let mut source = MockMarketSource::new();
        source
            .expect_events_by_slug()
            .returning(|_| Err(common::GammaError::ApiError("500".to_string())));

        let (_store, discoverer) = discoverer(source, MockOrderVenue::new());
        let found = discoverer.discover().await.unwrap();
        assert_eq!(found, 0);
    }

    #[tokio::test]
    async fn has_liquidity_compares_single_snapshot_depth() {
        let mut venue = MockOrderVenue::new();
        venue.expect_orderbook().returning(|token_id| {
            Ok(OrderbookSummary {
                token_id: token_id.to_string(),
                best_bid: Some(dec!(0.54)),
                best_ask: Some(dec!(0.56)),
                bid_depth: dec!(300),
                ask_depth: dec!(200),
                spread: Some(dec!(0.02)),
                bids: vec![BookLevel {
                    price: dec!(0.54),
                    size: dec!(300),
                }],
                asks: vec![BookLevel {
                    price: dec!(0.56),
                    size: dec!(200),
                }],
            })
        });

        let (_store, discoverer) = discoverer(MockMarketSource::new(), venue);
        assert!(discoverer.has_liquidity("tok", dec!(500)).await);
        assert!(!discoverer.has_liquidity("tok", dec!(501)).await);
    }

    #[tokio::test]
    async fn orderbook_failure_means_no_liquidity() {
        let mut venue = MockOrderVenue::new();
        venue
            .expect_orderbook()
            .returning(|_| Err(ClobError::ApiError("timeout".to_string())));

        let (_store, discoverer) = discoverer(MockMarketSource::new(), venue);
        assert!(discoverer.orderbook("tok").await.is_none());
        assert!(!discoverer.has_liquidity("tok", dec!(1)).await);
    }
}
