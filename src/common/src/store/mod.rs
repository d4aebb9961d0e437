//! Transactional state store shared by every pipeline component.
//!
//! Components hold a `StateStore` handle and exchange value types; nothing
//! retains live row handles across transactions. `PgStore` is the production
//! implementation; `MemStore` is the in-memory double used by tests and dry
//! runs.

mod mem;
mod pg;

pub use mem::MemStore;
pub use pg::PgStore;

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use rust_decimal::Decimal;
use thiserror::Error;

use crate::models::{
    BreakerStatus, Candle, DailyPnl, Decision, DiscoveredMarket, Market, NewDecision, NewOrder,
    NewPosition, NewTrade, Order, OrderStatus, OrderbookSummary, Position, RiskMetricsRecord,
    RunState,
};

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Illegal order status transition: {from} -> {to}")]
    IllegalTransition { from: OrderStatus, to: OrderStatus },

    #[error("Not found: {0}")]
    NotFound(String),
}

/// Persistence surface of the trading pipeline.
///
/// Every method is one logical transaction; partial writes are impossible.
#[async_trait]
pub trait StateStore: Send + Sync {
    // Spot prices (append-only)
    async fn insert_spot_price(
        &self,
        symbol: &str,
        price: Decimal,
        timestamp: DateTime<Utc>,
    ) -> Result<(), StoreError>;

    // Candles, keyed by (symbol, timeframe, open_time). Upsert refreshes
    // high/low/close/volume; open is immutable after first insert.
    async fn upsert_candle(&self, candle: &Candle) -> Result<(), StoreError>;

    /// Most recent candles in ascending open_time order.
    async fn recent_candles(&self, symbol: &str, limit: i64) -> Result<Vec<Candle>, StoreError>;

    // Markets, keyed by condition_id.
    async fn upsert_market(&self, market: &DiscoveredMarket) -> Result<i64, StoreError>;
    async fn market_by_id(&self, id: i64) -> Result<Option<Market>, StoreError>;

    /// Earliest-ending active market for the asset with `end_time > min_end_time`.
    async fn tradable_market(
        &self,
        asset: &str,
        min_end_time: DateTime<Utc>,
    ) -> Result<Option<Market>, StoreError>;

    async fn deactivate_expired_markets(&self, now: DateTime<Utc>) -> Result<u64, StoreError>;

    async fn insert_market_snapshot(
        &self,
        market_id: i64,
        book: &OrderbookSummary,
        at: DateTime<Utc>,
    ) -> Result<(), StoreError>;

    // Decisions (immutable once written; executed flips false->true once)
    async fn insert_decision(
        &self,
        decision: &NewDecision,
        at: DateTime<Utc>,
    ) -> Result<i64, StoreError>;
    async fn set_decision_risk_checks(
        &self,
        decision_id: i64,
        checks: serde_json::Value,
    ) -> Result<(), StoreError>;
    async fn mark_decision_executed(
        &self,
        decision_id: i64,
        execution_id: &str,
    ) -> Result<(), StoreError>;
    async fn latest_decision(&self, asset: &str) -> Result<Option<Decision>, StoreError>;

    // Orders
    async fn insert_order(&self, order: &NewOrder, at: DateTime<Utc>) -> Result<i64, StoreError>;
    async fn order_by_local_id(&self, local_id: &str) -> Result<Option<Order>, StoreError>;

    /// Orders whose status is pending, open or partially filled.
    async fn live_orders(&self) -> Result<Vec<Order>, StoreError>;

    /// Monotone status transition; rejects anything not permitted by
    /// `OrderStatus::can_transition_to`.
    async fn update_order_status(
        &self,
        local_id: &str,
        status: OrderStatus,
        error_message: Option<&str>,
        at: DateTime<Utc>,
    ) -> Result<(), StoreError>;

    async fn set_exchange_order_id(
        &self,
        local_id: &str,
        exchange_order_id: &str,
    ) -> Result<(), StoreError>;

    /// Record a fill: updates filled_size and transitions to filled (or
    /// partially_filled while filled_size < size).
    async fn record_order_fill(
        &self,
        local_id: &str,
        filled_size: Decimal,
        at: DateTime<Utc>,
    ) -> Result<(), StoreError>;

    // Trade tape (append-only)
    async fn insert_trade(&self, trade: &NewTrade, at: DateTime<Utc>) -> Result<i64, StoreError>;

    // Positions: at most one open position per (market_id, token_id)
    async fn open_position(
        &self,
        market_id: i64,
        token_id: &str,
    ) -> Result<Option<Position>, StoreError>;
    async fn open_positions(&self) -> Result<Vec<Position>, StoreError>;
    async fn open_position_count(&self) -> Result<i64, StoreError>;
    async fn insert_position(
        &self,
        position: &NewPosition,
        at: DateTime<Utc>,
    ) -> Result<i64, StoreError>;
    async fn save_position(&self, position: &Position) -> Result<(), StoreError>;

    /// Σ size × avg_entry_price over open positions in the asset's markets.
    async fn asset_exposure(&self, asset: &str) -> Result<Decimal, StoreError>;

    // Daily accounting, keyed by UTC calendar day
    async fn daily_pnl(&self, day: NaiveDate) -> Result<Option<DailyPnl>, StoreError>;
    async fn record_realized(
        &self,
        day: NaiveDate,
        pnl: Decimal,
        fees: Decimal,
        is_win: bool,
    ) -> Result<(), StoreError>;

    // Bot state (audited transitions; STOPPED when never set)
    async fn bot_state(&self) -> Result<RunState, StoreError>;
    async fn set_bot_state(
        &self,
        state: RunState,
        reason: &str,
        actor: &str,
        at: DateTime<Utc>,
    ) -> Result<(), StoreError>;

    // Circuit breakers (audited)
    async fn trip_breaker(&self, name: &str, reason: &str, at: DateTime<Utc>)
        -> Result<(), StoreError>;
    async fn reset_breaker(&self, name: &str, at: DateTime<Utc>) -> Result<(), StoreError>;
    async fn tripped_breakers(&self) -> Result<Vec<String>, StoreError>;
    async fn all_breakers(&self) -> Result<Vec<BreakerStatus>, StoreError>;

    // Hot-reloadable config
    async fn config_entries(&self) -> Result<Vec<(String, serde_json::Value)>, StoreError>;
    async fn set_config(
        &self,
        key: &str,
        value: serde_json::Value,
        actor: &str,
    ) -> Result<(), StoreError>;

    // Risk metrics + audit log
    async fn insert_risk_metrics(
        &self,
        record: &RiskMetricsRecord,
        at: DateTime<Utc>,
    ) -> Result<(), StoreError>;
    async fn audit(&self, event_type: &str, details: serde_json::Value) -> Result<(), StoreError>;
}
