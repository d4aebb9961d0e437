//! Shared data models for the trading pipeline.

use std::fmt;

use chrono::{DateTime, NaiveDate, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use sqlx::FromRow;

/// Named circuit breakers recognized by the risk gate.
pub mod breakers {
    pub const STALE_DATA: &str = "stale_data";
    pub const DAILY_LOSS_LIMIT: &str = "daily_loss_limit";
    pub const RECONCILIATION_MISMATCH: &str = "reconciliation_mismatch";
    pub const EMERGENCY: &str = "emergency";

    /// Breakers whose trip force-transitions the bot to HALTED_CIRCUIT_BREAKER.
    pub const HALTING: &[&str] = &[DAILY_LOSS_LIMIT, RECONCILIATION_MISMATCH];
}

/// Signal direction produced by the strategy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "VARCHAR")]
pub enum Direction {
    #[sqlx(rename = "UP")]
    #[serde(rename = "UP")]
    Up,
    #[sqlx(rename = "DOWN")]
    #[serde(rename = "DOWN")]
    Down,
    #[sqlx(rename = "NEUTRAL")]
    #[serde(rename = "NEUTRAL")]
    Neutral,
}

impl Direction {
    pub fn as_str(&self) -> &'static str {
        match self {
            Direction::Up => "UP",
            Direction::Down => "DOWN",
            Direction::Neutral => "NEUTRAL",
        }
    }
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Order side on the CLOB.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "VARCHAR")]
pub enum OrderSide {
    #[sqlx(rename = "BUY")]
    #[serde(rename = "BUY")]
    Buy,
    #[sqlx(rename = "SELL")]
    #[serde(rename = "SELL")]
    Sell,
}

impl OrderSide {
    pub fn as_str(&self) -> &'static str {
        match self {
            OrderSide::Buy => "BUY",
            OrderSide::Sell => "SELL",
        }
    }
}

impl fmt::Display for OrderSide {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Order lifecycle status.
///
/// Transitions are monotone: `pending -> open -> (partially_filled)* ->
/// filled | cancelled | rejected | error`. A terminal status never changes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "VARCHAR", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum OrderStatus {
    Pending,
    Open,
    PartiallyFilled,
    Filled,
    Cancelled,
    Rejected,
    Error,
}

impl OrderStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            OrderStatus::Pending => "pending",
            OrderStatus::Open => "open",
            OrderStatus::PartiallyFilled => "partially_filled",
            OrderStatus::Filled => "filled",
            OrderStatus::Cancelled => "cancelled",
            OrderStatus::Rejected => "rejected",
            OrderStatus::Error => "error",
        }
    }

    /// Whether the order still rests (or may rest) on the venue.
    pub fn is_live(&self) -> bool {
        matches!(
            self,
            OrderStatus::Pending | OrderStatus::Open | OrderStatus::PartiallyFilled
        )
    }

    /// Whether `next` is a legal forward transition from `self`.
    pub fn can_transition_to(&self, next: OrderStatus) -> bool {
        use OrderStatus::*;
        match (self, next) {
            (Pending, Open | Cancelled | Rejected | Error) => true,
            (Open, PartiallyFilled | Filled | Cancelled | Error) => true,
            (PartiallyFilled, PartiallyFilled | Filled | Cancelled | Error) => true,
            _ => false,
        }
    }
}

impl fmt::Display for OrderStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Which outcome token a position holds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "VARCHAR")]
pub enum PositionSide {
    #[sqlx(rename = "YES")]
    #[serde(rename = "YES")]
    Yes,
    #[sqlx(rename = "NO")]
    #[serde(rename = "NO")]
    No,
}

impl PositionSide {
    pub fn as_str(&self) -> &'static str {
        match self {
            PositionSide::Yes => "YES",
            PositionSide::No => "NO",
        }
    }
}

impl fmt::Display for PositionSide {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Position lifecycle status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "VARCHAR", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum PositionStatus {
    Open,
    Closed,
}

impl PositionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            PositionStatus::Open => "open",
            PositionStatus::Closed => "closed",
        }
    }
}

/// Bot run state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "VARCHAR")]
pub enum RunState {
    #[sqlx(rename = "RUNNING")]
    #[serde(rename = "RUNNING")]
    Running,
    #[sqlx(rename = "PAUSED")]
    #[serde(rename = "PAUSED")]
    Paused,
    #[sqlx(rename = "STOPPED")]
    #[serde(rename = "STOPPED")]
    Stopped,
    #[sqlx(rename = "HALTED_DAILY_LOSS")]
    #[serde(rename = "HALTED_DAILY_LOSS")]
    HaltedDailyLoss,
    #[sqlx(rename = "HALTED_CIRCUIT_BREAKER")]
    #[serde(rename = "HALTED_CIRCUIT_BREAKER")]
    HaltedCircuitBreaker,
}

impl RunState {
    pub fn as_str(&self) -> &'static str {
        match self {
            RunState::Running => "RUNNING",
            RunState::Paused => "PAUSED",
            RunState::Stopped => "STOPPED",
            RunState::HaltedDailyLoss => "HALTED_DAILY_LOSS",
            RunState::HaltedCircuitBreaker => "HALTED_CIRCUIT_BREAKER",
        }
    }
}

impl fmt::Display for RunState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A 15-minute OHLCV candle.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct Candle {
    pub symbol: String,
    pub timeframe: String,
    pub open_time: DateTime<Utc>,
    pub close_time: DateTime<Utc>,
    pub open: Decimal,
    pub high: Decimal,
    pub low: Decimal,
    pub close: Decimal,
    pub volume: Decimal,
}

/// A binary market discovered on the venue.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct Market {
    pub id: i64,
    pub condition_id: String,
    pub slug: Option<String>,
    pub title: String,
    pub description: Option<String>,
    pub asset: String,
    pub end_time: DateTime<Utc>,
    pub yes_token_id: Option<String>,
    pub no_token_id: Option<String>,
    pub active: bool,
}

/// Parsed market ready for upsert, keyed by condition_id.
#[derive(Debug, Clone)]
pub struct DiscoveredMarket {
    pub condition_id: String,
    pub slug: Option<String>,
    pub title: String,
    pub description: Option<String>,
    pub asset: String,
    pub end_time: DateTime<Utc>,
    pub yes_token_id: Option<String>,
    pub no_token_id: Option<String>,
}

/// A strategy decision as persisted.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct Decision {
    pub id: i64,
    pub timestamp: DateTime<Utc>,
    pub asset: String,
    pub market_id: Option<i64>,
    pub direction: Direction,
    pub confidence: Decimal,
    pub features: Option<serde_json::Value>,
    pub risk_checks: Option<serde_json::Value>,
    pub signal_source: Option<String>,
    pub executed: bool,
    pub execution_id: Option<String>,
}

/// A strategy decision to be inserted.
#[derive(Debug, Clone)]
pub struct NewDecision {
    pub asset: String,
    pub market_id: Option<i64>,
    pub direction: Direction,
    pub confidence: Decimal,
    pub features: serde_json::Value,
    pub signal_source: String,
}

/// An order as persisted.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct Order {
    pub id: i64,
    pub order_id: String,
    pub exchange_order_id: Option<String>,
    pub market_id: i64,
    pub decision_id: Option<i64>,
    pub side: OrderSide,
    pub token_id: String,
    pub price: Decimal,
    pub size: Decimal,
    pub filled_size: Decimal,
    pub status: OrderStatus,
    pub order_type: String,
    pub created_at: DateTime<Utc>,
    pub filled_at: Option<DateTime<Utc>>,
    pub cancelled_at: Option<DateTime<Utc>>,
    pub error_message: Option<String>,
}

/// An order to be inserted with status `pending`.
#[derive(Debug, Clone)]
pub struct NewOrder {
    pub local_id: String,
    pub market_id: i64,
    pub decision_id: Option<i64>,
    pub side: OrderSide,
    pub token_id: String,
    pub price: Decimal,
    pub size: Decimal,
    pub order_type: String,
}

/// An executed fill to be appended to the trade tape.
#[derive(Debug, Clone)]
pub struct NewTrade {
    pub trade_id: String,
    pub order_row_id: i64,
    pub market_id: i64,
    pub side: OrderSide,
    pub price: Decimal,
    pub size: Decimal,
    pub fee: Decimal,
    pub asset: Option<String>,
}

/// A position as persisted.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct Position {
    pub id: i64,
    pub market_id: i64,
    pub token_id: String,
    pub side: PositionSide,
    pub size: Decimal,
    pub avg_entry_price: Decimal,
    pub current_price: Option<Decimal>,
    pub unrealized_pnl: Option<Decimal>,
    pub realized_pnl: Decimal,
    pub status: PositionStatus,
    pub opened_at: DateTime<Utc>,
    pub closed_at: Option<DateTime<Utc>>,
}

/// A position to be opened.
#[derive(Debug, Clone)]
pub struct NewPosition {
    pub market_id: i64,
    pub token_id: String,
    pub side: PositionSide,
    pub size: Decimal,
    pub avg_entry_price: Decimal,
}

/// Daily realized accounting, unique per UTC calendar day.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct DailyPnl {
    pub date: NaiveDate,
    pub realized_pnl: Decimal,
    pub fees_paid: Decimal,
    pub trade_count: i32,
    pub win_count: i32,
    pub loss_count: i32,
}

/// Circuit breaker latch status.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct BreakerStatus {
    pub breaker_name: String,
    pub is_tripped: bool,
    pub trip_reason: Option<String>,
    pub trip_count: i32,
    pub last_trip: Option<DateTime<Utc>>,
    pub last_reset: Option<DateTime<Utc>>,
}

/// Risk metrics snapshot recorded each trading cycle.
#[derive(Debug, Clone)]
pub struct RiskMetricsRecord {
    pub total_exposure: Decimal,
    pub asset_exposure: serde_json::Value,
    pub correlation_risk: Decimal,
    pub daily_loss: Decimal,
    pub portfolio_value: Decimal,
}

/// A single price level in the orderbook.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BookLevel {
    pub price: Decimal,
    pub size: Decimal,
}

/// Top-of-book summary from a single orderbook snapshot.
///
/// Depth is the size summed over the top 10 levels per side; spread is
/// `ask - bid` when both sides exist.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrderbookSummary {
    pub token_id: String,
    pub best_bid: Option<Decimal>,
    pub best_ask: Option<Decimal>,
    pub bid_depth: Decimal,
    pub ask_depth: Decimal,
    pub spread: Option<Decimal>,
    pub bids: Vec<BookLevel>,
    pub asks: Vec<BookLevel>,
}

impl OrderbookSummary {
    /// Midpoint of the book; `None` when either side is empty.
    pub fn mid(&self) -> Option<Decimal> {
        match (self.best_bid, self.best_ask) {
            (Some(bid), Some(ask)) => Some((bid + ask) / Decimal::TWO),
            _ => None,
        }
    }

    /// Total top-10 depth across both sides.
    pub fn total_depth(&self) -> Decimal {
        self.bid_depth + self.ask_depth
    }
}

/// Wire payload for a CLOB order, signed before submission.
///
/// All numeric fields travel as strings, matching the venue's order body.
#[derive(Debug, Clone, Serialize)]
pub struct OrderPayload {
    #[serde(rename = "tokenID")]
    pub token_id: String,
    pub price: String,
    pub size: String,
    pub side: String,
    #[serde(rename = "feeRateBps")]
    pub fee_rate_bps: String,
    pub nonce: String,
    pub expiration: String,
}

impl OrderPayload {
    pub fn new(
        token_id: &str,
        price: Decimal,
        size: Decimal,
        side: OrderSide,
        nonce_ms: i64,
    ) -> Self {
        Self {
            token_id: token_id.to_string(),
            price: price.normalize().to_string(),
            size: size.normalize().to_string(),
            side: side.as_str().to_string(),
            fee_rate_bps: "0".to_string(),
            nonce: nonce_ms.to_string(),
            expiration: "0".to_string(),
        }
    }

    /// Stable field-ordered rendering used as the signing input.
    pub fn canonical(&self) -> String {
        format!(
            "tokenID:{}|price:{}|size:{}|side:{}|feeRateBps:{}|nonce:{}|expiration:{}",
            self.token_id,
            self.price,
            self.size,
            self.side,
            self.fee_rate_bps,
            self.nonce,
            self.expiration
        )
    }
}

/// Signed order body as POSTed to the venue.
#[derive(Debug, Clone, Serialize)]
pub struct SignedOrder {
    #[serde(flatten)]
    pub payload: OrderPayload,
    pub signature: String,
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn order_status_forward_transitions() {
        use OrderStatus::*;
        assert!(Pending.can_transition_to(Open));
        assert!(Pending.can_transition_to(Rejected));
        assert!(Pending.can_transition_to(Error));
        assert!(Pending.can_transition_to(Cancelled));
        assert!(Open.can_transition_to(PartiallyFilled));
        assert!(Open.can_transition_to(Filled));
        assert!(Open.can_transition_to(Cancelled));
        assert!(PartiallyFilled.can_transition_to(PartiallyFilled));
        assert!(PartiallyFilled.can_transition_to(Filled));
    }

    #[test]
    fn order_status_rejects_backwards_transitions() {
        use OrderStatus::*;
        assert!(!Open.can_transition_to(Pending));
        assert!(!Filled.can_transition_to(Open));
        assert!(!Filled.can_transition_to(Cancelled));
        assert!(!Cancelled.can_transition_to(Open));
        assert!(!Rejected.can_transition_to(Open));
        assert!(!Error.can_transition_to(Open));
        assert!(!Pending.can_transition_to(Filled));
        assert!(!Pending.can_transition_to(PartiallyFilled));
    }

    #[test]
    fn live_statuses() {
        assert!(OrderStatus::Pending.is_live());
        assert!(OrderStatus::Open.is_live());
        assert!(OrderStatus::PartiallyFilled.is_live());
        assert!(!OrderStatus::Filled.is_live());
        assert!(!OrderStatus::Cancelled.is_live());
    }

    #[test]
    fn order_payload_canonical_is_stable() {
        let payload =
            OrderPayload::new("tok-1", dec!(0.560), dec!(25), OrderSide::Buy, 1700000000123);
        assert_eq!(
            payload.canonical(),
            "tokenID:tok-1|price:0.56|size:25|side:BUY|feeRateBps:0|nonce:1700000000123|expiration:0"
        );
        let json = serde_json::to_value(&payload).unwrap();
        assert_eq!(json["tokenID"], "tok-1");
        assert_eq!(json["feeRateBps"], "0");
        assert_eq!(json["side"], "BUY");
    }

    #[test]
    fn orderbook_mid_requires_both_sides() {
        let mut book = OrderbookSummary {
            token_id: "t".into(),
            best_bid: Some(dec!(0.54)),
            best_ask: Some(dec!(0.56)),
            bid_depth: dec!(100),
            ask_depth: dec!(200),
            spread: Some(dec!(0.02)),
            bids: vec![],
            asks: vec![],
        };
        assert_eq!(book.mid(), Some(dec!(0.55)));
        assert_eq!(book.total_depth(), dec!(300));
        book.best_ask = None;
        assert_eq!(book.mid(), None);
    }
}
