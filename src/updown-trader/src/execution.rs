//! Order execution: staging, venue submission, cancellation and
//! reconciliation.
//!
//! Orders are persisted as `pending` before any network call, so a crash
//! between insert and venue acknowledgement leaves a recoverable row. The
//! critical section (risk pass + pending insert) runs under the risk gate;
//! the venue POST happens after the lock is released.

use std::sync::Arc;

use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde_json::json;
use thiserror::Error;
use tracing::{error, info, warn};
use uuid::Uuid;

use common::models::{
    NewOrder, NewTrade, Order, OrderPayload, OrderSide, OrderStatus, OrderbookSummary, SignedOrder,
};
use common::{ClobError, Clock, OrderSigner, OrderVenue, SignerError, StateStore, StoreError,
    VenueOrderStatus};

pub const MAKER_FEE: Decimal = dec!(0.00);
pub const TAKER_FEE: Decimal = dec!(0.02);

/// Default aggression for marketable limits, in basis points.
pub const DEFAULT_SLIPPAGE_BPS: u32 = 100;

const MIN_PRICE: Decimal = dec!(0.01);
const MAX_PRICE: Decimal = dec!(0.99);

#[derive(Debug, Error)]
pub enum ExecutionError {
    #[error("Invalid price: {0}. Must be between 0 and 1.")]
    InvalidPrice(Decimal),

    #[error("Invalid size: {0}. Must be positive.")]
    InvalidSize(Decimal),

    #[error("No {0} side in orderbook")]
    NoBook(&'static str),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Signer(#[from] SignerError),
}

/// Gross/fee/net arithmetic for an order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OrderValue {
    pub gross: Decimal,
    pub fee: Decimal,
    pub net: Decimal,
    pub fee_rate: Decimal,
}

/// Fee model: maker 0%, taker 2%. The venue computes fees authoritatively
/// at fill time; this is used for accounting and synthesized fills.
pub fn calculate_order_value(price: Decimal, size: Decimal, is_maker: bool) -> OrderValue {
    let fee_rate = if is_maker { MAKER_FEE } else { TAKER_FEE };
    let gross = price * size;
    let fee = gross * fee_rate;
    OrderValue {
        gross,
        fee,
        net: gross - fee,
        fee_rate,
    }
}

/// Price a marketable limit through the opposite top of book.
pub fn marketable_price(
    book: &OrderbookSummary,
    side: OrderSide,
    slippage_bps: u32,
) -> Result<Decimal, ExecutionError> {
    let slip = Decimal::from(slippage_bps) / dec!(10000);
    match side {
        OrderSide::Buy => {
            let ask = book.best_ask.ok_or(ExecutionError::NoBook("ask"))?;
            Ok((ask + slip).min(MAX_PRICE))
        }
        OrderSide::Sell => {
            let bid = book.best_bid.ok_or(ExecutionError::NoBook("bid"))?;
            Ok((bid - slip).max(MIN_PRICE))
        }
    }
}

/// A candidate order.
#[derive(Debug, Clone)]
pub struct OrderRequest {
    pub token_id: String,
    pub side: OrderSide,
    pub price: Decimal,
    pub size: Decimal,
    pub market_id: i64,
    pub decision_id: Option<i64>,
    pub order_type: String,
}

/// A validated order persisted as `pending`, not yet sent to the venue.
#[derive(Debug, Clone)]
pub struct StagedOrder {
    pub local_id: String,
    pub row_id: i64,
    pub request: OrderRequest,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlacementStatus {
    /// No credentials configured; the order never left the process.
    Simulated,
    Open,
    Rejected,
    Error,
}

/// Outcome of an order placement.
#[derive(Debug, Clone)]
pub struct Placement {
    pub local_id: String,
    pub row_id: i64,
    pub market_id: i64,
    pub token_id: String,
    pub side: OrderSide,
    pub price: Decimal,
    pub size: Decimal,
    pub status: PlacementStatus,
    pub exchange_order_id: Option<String>,
    pub error: Option<String>,
}

/// One executed fill, forwarded to the position manager.
#[derive(Debug, Clone)]
pub struct Fill {
    pub market_id: i64,
    pub token_id: String,
    pub side: OrderSide,
    pub price: Decimal,
    pub size: Decimal,
    pub fee: Decimal,
}

/// Report from one reconciliation pass.
#[derive(Debug, Clone, Default)]
pub struct ReconcileReport {
    pub checked: usize,
    pub mismatches: Vec<String>,
}

/// Realizes decisions as venue orders and maintains the order lifecycle.
pub struct ExecutionModule {
    venue: Arc<dyn OrderVenue>,
    signer: Option<Arc<dyn OrderSigner>>,
    store: Arc<dyn StateStore>,
    clock: Arc<dyn Clock>,
    slippage_bps: u32,
}

impl ExecutionModule {
    pub fn new(
        venue: Arc<dyn OrderVenue>,
        signer: Option<Arc<dyn OrderSigner>>,
        store: Arc<dyn StateStore>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            venue,
            signer,
            store,
            clock,
            slippage_bps: DEFAULT_SLIPPAGE_BPS,
        }
    }

    pub fn slippage_bps(&self) -> u32 {
        self.slippage_bps
    }

    /// Whether orders actually reach the venue.
    pub fn live_trading(&self) -> bool {
        self.signer.is_some()
    }

    /// Validate the request and persist it as a pending order.
    ///
    /// This is the second half of the pass-then-insert critical section;
    /// the caller holds the risk gate across the risk checks and this call.
    pub async fn stage_order(&self, request: OrderRequest) -> Result<StagedOrder, ExecutionError> {
        if request.price <= Decimal::ZERO || request.price >= Decimal::ONE {
            return Err(ExecutionError::InvalidPrice(request.price));
        }
        if request.size <= Decimal::ZERO {
            return Err(ExecutionError::InvalidSize(request.size));
        }

        let local_id = Uuid::new_v4().to_string();
        let order = NewOrder {
            local_id: local_id.clone(),
            market_id: request.market_id,
            decision_id: request.decision_id,
            side: request.side,
            token_id: request.token_id.clone(),
            price: request.price,
            size: request.size,
            order_type: request.order_type.clone(),
        };
        let row_id = self.store.insert_order(&order, self.clock.now()).await?;

        self.store
            .audit(
                "order_placed",
                json!({
                    "order_id": local_id,
                    "token_id": request.token_id,
                    "side": request.side.as_str(),
                    "price": request.price.to_string(),
                    "size": request.size.to_string(),
                }),
            )
            .await?;

        info!(
            "Staged {} order {}: {} @ {} on token {}",
            request.side, local_id, request.size, request.price, request.token_id
        );

        Ok(StagedOrder {
            local_id,
            row_id,
            request,
        })
    }

    /// Send a staged order to the venue, or keep it simulated without
    /// credentials. Never called under the risk gate.
    pub async fn submit(&self, staged: StagedOrder) -> Result<Placement, ExecutionError> {
        let placement = |status, exchange_order_id, error| Placement {
            local_id: staged.local_id.clone(),
            row_id: staged.row_id,
            market_id: staged.request.market_id,
            token_id: staged.request.token_id.clone(),
            side: staged.request.side,
            price: staged.request.price,
            size: staged.request.size,
            status,
            exchange_order_id,
            error,
        };

        let Some(signer) = &self.signer else {
            warn!(
                "Credentials not configured - order {} not sent to venue",
                staged.local_id
            );
            return Ok(placement(PlacementStatus::Simulated, None, None));
        };

        let payload = OrderPayload::new(
            &staged.request.token_id,
            staged.request.price,
            staged.request.size,
            staged.request.side,
            self.clock.now().timestamp_millis(),
        );
        let signature = signer.sign(&payload)?;
        let signed = SignedOrder { payload, signature };

        match self.venue.submit_order(&signed).await {
            Ok(ack) => {
                self.store
                    .set_exchange_order_id(&staged.local_id, &ack.order_id)
                    .await?;
                self.store
                    .update_order_status(&staged.local_id, OrderStatus::Open, None, self.clock.now())
                    .await?;
                info!(
                    "Order {} open on venue as {}",
                    staged.local_id, ack.order_id
                );
                Ok(placement(PlacementStatus::Open, Some(ack.order_id), None))
            }
            Err(ClobError::Rejected(message)) => {
                warn!("Order {} rejected: {}", staged.local_id, message);
                self.store
                    .update_order_status(
                        &staged.local_id,
                        OrderStatus::Rejected,
                        Some(&message),
                        self.clock.now(),
                    )
                    .await?;
                Ok(placement(PlacementStatus::Rejected, None, Some(message)))
            }
            Err(e) => {
                let message = e.to_string();
                error!("Order {} submission failed: {}", staged.local_id, message);
                self.store
                    .update_order_status(
                        &staged.local_id,
                        OrderStatus::Error,
                        Some(&message),
                        self.clock.now(),
                    )
                    .await?;
                Ok(placement(PlacementStatus::Error, None, Some(message)))
            }
        }
    }

    /// Stage and submit in one step, for callers outside the entry path
    /// (exits reduce exposure and bypass the soft caps).
    pub async fn place_limit_order(
        &self,
        request: OrderRequest,
    ) -> Result<Placement, ExecutionError> {
        let staged = self.stage_order(request).await?;
        self.submit(staged).await
    }

    /// Cancel one order; returns true when the cancellation stuck locally.
    pub async fn cancel_order(&self, order: &Order) -> bool {
        if self.signer.is_some() {
            let venue_id = order
                .exchange_order_id
                .as_deref()
                .unwrap_or(&order.order_id);
            if let Err(e) = self.venue.cancel_order(venue_id).await {
                warn!("Failed to cancel order {}: {}", order.order_id, e);
                return false;
            }
        }

        match self
            .store
            .update_order_status(&order.order_id, OrderStatus::Cancelled, None, self.clock.now())
            .await
        {
            Ok(()) => {
                info!("Cancelled order {}", order.order_id);
                true
            }
            Err(e) => {
                error!("Failed to mark order {} cancelled: {}", order.order_id, e);
                false
            }
        }
    }

    /// Cancel every live order; audits the aggregate count.
    pub async fn cancel_all(&self) -> Result<usize, ExecutionError> {
        let orders = self.store.live_orders().await?;
        let mut cancelled = 0;
        for order in &orders {
            if self.cancel_order(order).await {
                cancelled += 1;
            }
        }

        info!("Cancelled {} of {} live orders", cancelled, orders.len());
        self.store
            .audit("cancel_all_orders", json!({ "cancelled_count": cancelled }))
            .await?;
        Ok(cancelled)
    }

    /// Compare locally-live orders against venue state.
    ///
    /// Any venue-side disagreement is a mismatch for the caller to act on
    /// (trip `reconciliation_mismatch` and halt). Transient lookup failures
    /// are skipped, not flagged. A pending order with no venue
    /// acknowledgement is closed out locally as `error`.
    pub async fn reconcile(&self) -> Result<ReconcileReport, ExecutionError> {
        let mut report = ReconcileReport::default();
        if self.signer.is_none() {
            return Ok(report);
        }

        for order in self.store.live_orders().await? {
            let Some(venue_id) = order.exchange_order_id.as_deref() else {
                if order.status == OrderStatus::Pending {
                    warn!(
                        "Order {} pending with no venue acknowledgement, marking error",
                        order.order_id
                    );
                    self.store
                        .update_order_status(
                            &order.order_id,
                            OrderStatus::Error,
                            Some("no venue acknowledgement recorded"),
                            self.clock.now(),
                        )
                        .await?;
                } else {
                    report.mismatches.push(format!(
                        "order {} is {} with no venue id",
                        order.order_id, order.status
                    ));
                }
                continue;
            };

            report.checked += 1;
            match self.venue.fetch_order(venue_id).await {
                Ok(Some(venue_order)) => match venue_order.status {
                    VenueOrderStatus::Live => {}
                    VenueOrderStatus::Matched => report.mismatches.push(format!(
                        "order {} is {} locally but venue reports filled",
                        order.order_id, order.status
                    )),
                    VenueOrderStatus::Cancelled => report.mismatches.push(format!(
                        "order {} is {} locally but venue reports cancelled",
                        order.order_id, order.status
                    )),
                    VenueOrderStatus::Unknown => report.mismatches.push(format!(
                        "order {} has unrecognized venue status",
                        order.order_id
                    )),
                },
                Ok(None) => report.mismatches.push(format!(
                    "order {} ({}) unknown to venue",
                    order.order_id, venue_id
                )),
                Err(e) => {
                    warn!(
                        "Venue lookup failed for order {}: {}; skipping this pass",
                        order.order_id, e
                    );
                }
            }
        }

        Ok(report)
    }

    /// Record an executed fill: order transition, trade tape append, and
    /// the fill handed back for position aggregation.
    pub async fn record_fill(
        &self,
        order: &Order,
        price: Decimal,
        size: Decimal,
        asset: Option<&str>,
    ) -> Result<Fill, ExecutionError> {
        let value = calculate_order_value(price, size, false);
        let now = self.clock.now();

        self.store
            .record_order_fill(&order.order_id, size, now)
            .await?;

        let trade = NewTrade {
            trade_id: Uuid::new_v4().to_string(),
            order_row_id: order.id,
            market_id: order.market_id,
            side: order.side,
            price,
            size,
            fee: value.fee,
            asset: asset.map(|a| a.to_string()),
        };
        self.store.insert_trade(&trade, now).await?;

        Ok(Fill {
            market_id: order.market_id,
            token_id: order.token_id.clone(),
            side: order.side,
            price,
            size,
            fee: value.fee,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};
    use common::models::{BookLevel, DiscoveredMarket};
    use common::{ManualClock, MemStore, MockOrderSigner, MockOrderVenue, VenueAck, VenueOrder};
    use rust_decimal_macros::dec;

    fn book(best_bid: Option<Decimal>, best_ask: Option<Decimal>) -> OrderbookSummary {
        OrderbookSummary {
            token_id: "tok".to_string(),
            best_bid,
            best_ask,
            bid_depth: dec!(600),
            ask_depth: dec!(600),
            spread: None,
            bids: best_bid
                .map(|p| vec![BookLevel { price: p, size: dec!(600) }])
                .unwrap_or_default(),
            asks: best_ask
                .map(|p| vec![BookLevel { price: p, size: dec!(600) }])
                .unwrap_or_default(),
        }
    }

    fn request(side: OrderSide, price: Decimal, size: Decimal, market_id: i64) -> OrderRequest {
        OrderRequest {
            token_id: "tok".to_string(),
            side,
            price,
            size,
            market_id,
            decision_id: None,
            order_type: "marketable_limit".to_string(),
        }
    }

    struct Fixture {
        store: Arc<MemStore>,
        market_id: i64,
    }

    async fn fixture() -> Fixture {
        let clock = Arc::new(ManualClock::new(
            Utc.with_ymd_and_hms(2025, 6, 1, 12, 0, 0).unwrap(),
        ));
        let store = Arc::new(MemStore::new(clock.clone()));
        let market_id = store
            .upsert_market(&DiscoveredMarket {
                condition_id: "0xaa".to_string(),
                slug: None,
                title: "BTC up or down".to_string(),
                description: None,
                asset: "BTC".to_string(),
                end_time: Utc.with_ymd_and_hms(2025, 6, 1, 12, 30, 0).unwrap(),
                yes_token_id: Some("tok".to_string()),
                no_token_id: Some("no-tok".to_string()),
            })
            .await
            .unwrap();
        Fixture { store, market_id }
    }

    fn module(
        fixture: &Fixture,
        venue: MockOrderVenue,
        signer: Option<MockOrderSigner>,
    ) -> ExecutionModule {
        let clock = Arc::new(ManualClock::new(
            Utc.with_ymd_and_hms(2025, 6, 1, 12, 0, 0).unwrap(),
        ));
        ExecutionModule::new(
            Arc::new(venue),
            signer.map(|s| Arc::new(s) as Arc<dyn OrderSigner>),
            fixture.store.clone(),
            clock,
        )
    }

    fn signing_ok() -> MockOrderSigner {
        let mut signer = MockOrderSigner::new();
        signer.expect_sign().returning(|_| Ok("ab".repeat(65)));
        signer
    }

    #[test]
    fn order_value_fees() {
        let maker = calculate_order_value(dec!(0.50), dec!(100), true);
        assert_eq!(maker.gross, dec!(50));
        assert_eq!(maker.fee, dec!(0));
        assert_eq!(maker.net, dec!(50));

        let taker = calculate_order_value(dec!(0.50), dec!(100), false);
        assert_eq!(taker.fee, dec!(1.0));
        assert_eq!(taker.net, dec!(49.0));
        assert_eq!(taker.fee_rate, TAKER_FEE);
    }

    #[test]
    fn marketable_buy_prices_through_the_ask() {
        let price =
            marketable_price(&book(Some(dec!(0.54)), Some(dec!(0.55))), OrderSide::Buy, 100)
                .unwrap();
        assert_eq!(price, dec!(0.56));
    }

    #[test]
    fn marketable_buy_ceilings_at_99_cents() {
        let price =
            marketable_price(&book(None, Some(dec!(0.985))), OrderSide::Buy, 100).unwrap();
        assert_eq!(price, dec!(0.99));
    }

    #[test]
    fn marketable_sell_prices_through_the_bid() {
        let price =
            marketable_price(&book(Some(dec!(0.55)), None), OrderSide::Sell, 100).unwrap();
        assert_eq!(price, dec!(0.54));
    }

    #[test]
    fn marketable_sell_floors_at_one_cent() {
        let price =
            marketable_price(&book(Some(dec!(0.015)), None), OrderSide::Sell, 100).unwrap();
        assert_eq!(price, dec!(0.01));
    }

    #[test]
    fn marketable_fails_without_the_relevant_side() {
        let err = marketable_price(&book(Some(dec!(0.5)), None), OrderSide::Buy, 100).unwrap_err();
        assert!(matches!(err, ExecutionError::NoBook("ask")));

        let err = marketable_price(&book(None, Some(dec!(0.5))), OrderSide::Sell, 100).unwrap_err();
        assert!(matches!(err, ExecutionError::NoBook("bid")));
    }

    #[tokio::test]
    async fn staging_validates_price_and_size() {
        let fixture = fixture().await;
        let module = module(&fixture, MockOrderVenue::new(), None);

        for price in [dec!(0), dec!(1), dec!(1.5), dec!(-0.1)] {
            let err = module
                .stage_order(request(OrderSide::Buy, price, dec!(10), fixture.market_id))
                .await
                .unwrap_err();
            assert!(matches!(err, ExecutionError::InvalidPrice(_)), "{price}");
        }

        let err = module
            .stage_order(request(OrderSide::Buy, dec!(0.5), dec!(0), fixture.market_id))
            .await
            .unwrap_err();
        assert!(matches!(err, ExecutionError::InvalidSize(_)));

        // Nothing persisted for rejected inputs.
        assert!(fixture.store.all_orders().is_empty());
    }

    #[tokio::test]
    async fn two_identical_requests_get_distinct_local_ids() {
        let fixture = fixture().await;
        let module = module(&fixture, MockOrderVenue::new(), None);

        let a = module
            .stage_order(request(OrderSide::Buy, dec!(0.5), dec!(10), fixture.market_id))
            .await
            .unwrap();
        let b = module
            .stage_order(request(OrderSide::Buy, dec!(0.5), dec!(10), fixture.market_id))
            .await
            .unwrap();
        assert_ne!(a.local_id, b.local_id);
        assert_eq!(fixture.store.all_orders().len(), 2);
    }

    #[tokio::test]
    async fn simulation_path_without_credentials() {
        let fixture = fixture().await;
        let module = module(&fixture, MockOrderVenue::new(), None);
        assert!(!module.live_trading());

        let placement = module
            .place_limit_order(request(OrderSide::Buy, dec!(0.56), dec!(25), fixture.market_id))
            .await
            .unwrap();

        assert_eq!(placement.status, PlacementStatus::Simulated);
        let order = fixture
            .store
            .order_by_local_id(&placement.local_id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(order.status, OrderStatus::Pending);

        let events: Vec<String> = fixture
            .store
            .audit_entries()
            .into_iter()
            .map(|e| e.event_type)
            .collect();
        assert!(events.contains(&"order_placed".to_string()));
    }

    #[tokio::test]
    async fn accepted_order_goes_open_with_exchange_id() {
        let fixture = fixture().await;
        let mut venue = MockOrderVenue::new();
        venue
            .expect_submit_order()
            .withf(|signed| signed.payload.side == "BUY" && signed.payload.price == "0.56")
            .returning(|_| {
                Ok(VenueAck {
                    order_id: "0xfeed".to_string(),
                })
            });

        let module = module(&fixture, venue, Some(signing_ok()));
        let placement = module
            .place_limit_order(request(OrderSide::Buy, dec!(0.56), dec!(25), fixture.market_id))
            .await
            .unwrap();

        assert_eq!(placement.status, PlacementStatus::Open);
        assert_eq!(placement.exchange_order_id.as_deref(), Some("0xfeed"));

        let order = fixture
            .store
            .order_by_local_id(&placement.local_id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(order.status, OrderStatus::Open);
        assert_eq!(order.exchange_order_id.as_deref(), Some("0xfeed"));
    }

    #[tokio::test]
    async fn venue_rejection_is_terminal() {
        let fixture = fixture().await;
        let mut venue = MockOrderVenue::new();
        venue
            .expect_submit_order()
            .returning(|_| Err(ClobError::Rejected("400: not enough balance".to_string())));

        let module = module(&fixture, venue, Some(signing_ok()));
        let placement = module
            .place_limit_order(request(OrderSide::Buy, dec!(0.56), dec!(25), fixture.market_id))
            .await
            .unwrap();

        assert_eq!(placement.status, PlacementStatus::Rejected);
        let order = fixture
            .store
            .order_by_local_id(&placement.local_id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(order.status, OrderStatus::Rejected);
        assert!(order.error_message.unwrap().contains("not enough balance"));
    }

    #[tokio::test]
    async fn transport_failure_is_error_status() {
        let fixture = fixture().await;
        let mut venue = MockOrderVenue::new();
        venue
            .expect_submit_order()
            .returning(|_| Err(ClobError::ApiError("502: bad gateway".to_string())));

        let module = module(&fixture, venue, Some(signing_ok()));
        let placement = module
            .place_limit_order(request(OrderSide::Buy, dec!(0.56), dec!(25), fixture.market_id))
            .await
            .unwrap();

        assert_eq!(placement.status, PlacementStatus::Error);
        let order = fixture
            .store
            .order_by_local_id(&placement.local_id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(order.status, OrderStatus::Error);
    }

    #[tokio::test]
    async fn cancel_all_targets_live_orders_and_audits() {
        let fixture = fixture().await;
        let module = module(&fixture, MockOrderVenue::new(), None);

        module
            .place_limit_order(request(OrderSide::Buy, dec!(0.5), dec!(5), fixture.market_id))
            .await
            .unwrap();
        module
            .place_limit_order(request(OrderSide::Buy, dec!(0.5), dec!(5), fixture.market_id))
            .await
            .unwrap();

        let cancelled = module.cancel_all().await.unwrap();
        assert_eq!(cancelled, 2);

        for order in fixture.store.all_orders() {
            assert_eq!(order.status, OrderStatus::Cancelled);
            assert!(order.cancelled_at.is_some());
        }

        let entry = fixture
            .store
            .audit_entries()
            .into_iter()
            .find(|e| e.event_type == "cancel_all_orders")
            .unwrap();
        assert_eq!(entry.details["cancelled_count"], 2);
    }

    #[tokio::test]
    async fn venue_cancel_failure_leaves_order_untouched() {
        let fixture = fixture().await;
        let mut venue = MockOrderVenue::new();
        venue
            .expect_submit_order()
            .returning(|_| Ok(VenueAck { order_id: "0x1".to_string() }));
        venue
            .expect_cancel_order()
            .returning(|_| Err(ClobError::ApiError("timeout".to_string())));

        let module = module(&fixture, venue, Some(signing_ok()));
        let placement = module
            .place_limit_order(request(OrderSide::Buy, dec!(0.5), dec!(5), fixture.market_id))
            .await
            .unwrap();

        let order = fixture
            .store
            .order_by_local_id(&placement.local_id)
            .await
            .unwrap()
            .unwrap();
        assert!(!module.cancel_order(&order).await);

        let order = fixture
            .store
            .order_by_local_id(&placement.local_id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(order.status, OrderStatus::Open);
    }

    #[tokio::test]
    async fn reconcile_flags_venue_filled_while_local_open() {
        let fixture = fixture().await;
        let mut venue = MockOrderVenue::new();
        venue
            .expect_submit_order()
            .returning(|_| Ok(VenueAck { order_id: "0x1".to_string() }));
        venue.expect_fetch_order().returning(|venue_id| {
            Ok(Some(VenueOrder {
                order_id: venue_id.to_string(),
                status: VenueOrderStatus::Matched,
                size_matched: Some(dec!(5)),
            }))
        });

        let module = module(&fixture, venue, Some(signing_ok()));
        module
            .place_limit_order(request(OrderSide::Buy, dec!(0.5), dec!(5), fixture.market_id))
            .await
            .unwrap();

        let report = module.reconcile().await.unwrap();
        assert_eq!(report.checked, 1);
        assert_eq!(report.mismatches.len(), 1);
        assert!(report.mismatches[0].contains("venue reports filled"));
    }

    #[tokio::test]
    async fn reconcile_passes_when_venue_agrees() {
        let fixture = fixture().await;
        let mut venue = MockOrderVenue::new();
        venue
            .expect_submit_order()
            .returning(|_| Ok(VenueAck { order_id: "0x1".to_string() }));
        venue.expect_fetch_order().returning(|venue_id| {
            Ok(Some(VenueOrder {
                order_id: venue_id.to_string(),
                status: VenueOrderStatus::Live,
                size_matched: None,
            }))
        });

        let module = module(&fixture, venue, Some(signing_ok()));
        module
            .place_limit_order(request(OrderSide::Buy, dec!(0.5), dec!(5), fixture.market_id))
            .await
            .unwrap();

        let report = module.reconcile().await.unwrap();
        assert_eq!(report.checked, 1);
        assert!(report.mismatches.is_empty());
    }

    #[tokio::test]
    async fn reconcile_closes_out_unacknowledged_pending_orders() {
        let fixture = fixture().await;
        let mut venue = MockOrderVenue::new();
        // Simulate a crash between insert and POST: stage without submit.
        venue.expect_fetch_order().never();

        let module = module(&fixture, venue, Some(signing_ok()));
        let staged = module
            .stage_order(request(OrderSide::Buy, dec!(0.5), dec!(5), fixture.market_id))
            .await
            .unwrap();

        let report = module.reconcile().await.unwrap();
        assert!(report.mismatches.is_empty());

        let order = fixture
            .store
            .order_by_local_id(&staged.local_id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(order.status, OrderStatus::Error);
    }

    #[tokio::test]
    async fn reconcile_skips_everything_in_simulation() {
        let fixture = fixture().await;
        let module = module(&fixture, MockOrderVenue::new(), None);
        module
            .place_limit_order(request(OrderSide::Buy, dec!(0.5), dec!(5), fixture.market_id))
            .await
            .unwrap();

        let report = module.reconcile().await.unwrap();
        assert_eq!(report.checked, 0);
        assert!(report.mismatches.is_empty());
    }

    #[tokio::test]
    async fn record_fill_appends_trade_with_taker_fee() {
        let fixture = fixture().await;
        let mut venue = MockOrderVenue::new();
        venue
            .expect_submit_order()
            .returning(|_| Ok(VenueAck { order_id: "0x1".to_string() }));

        let module = module(&fixture, venue, Some(signing_ok()));
        let placement = module
            .place_limit_order(request(OrderSide::Buy, dec!(0.50), dec!(50), fixture.market_id))
            .await
            .unwrap();

        let order = fixture
            .store
            .order_by_local_id(&placement.local_id)
            .await
            .unwrap()
            .unwrap();
        let fill = module
            .record_fill(&order, dec!(0.50), dec!(50), Some("BTC"))
            .await
            .unwrap();

        // 0.50 x 50 = 25 gross, 2% taker fee = 0.50
        assert_eq!(fill.fee, dec!(0.50));

        let order = fixture
            .store
            .order_by_local_id(&placement.local_id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(order.status, OrderStatus::Filled);
        assert_eq!(order.filled_size, dec!(50));

        let trades = fixture.store.all_trades();
        assert_eq!(trades.len(), 1);
        assert_eq!(trades[0].fee, dec!(0.50));
        assert_eq!(trades[0].asset.as_deref(), Some("BTC"));
    }
}
