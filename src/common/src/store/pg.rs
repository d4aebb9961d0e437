//! Postgres-backed state store.

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use rust_decimal::Decimal;
use serde_json::json;

use crate::db::Database;
use crate::models::{
    BreakerStatus, Candle, DailyPnl, Decision, DiscoveredMarket, Market, NewDecision, NewOrder,
    NewPosition, NewTrade, Order, OrderStatus, OrderbookSummary, Position, RiskMetricsRecord,
    RunState,
};

use super::{StateStore, StoreError};

const MARKET_COLUMNS: &str = "id, condition_id, slug, title, description, asset, end_time, \
     yes_token_id, no_token_id, active";

const ORDER_COLUMNS: &str = "id, order_id, exchange_order_id, market_id, decision_id, side, \
     token_id, price, size, filled_size, status, order_type, created_at, filled_at, \
     cancelled_at, error_message";

const POSITION_COLUMNS: &str = "id, market_id, token_id, side, size, avg_entry_price, \
     current_price, unrealized_pnl, realized_pnl, status, opened_at, closed_at";

/// Postgres implementation of [`StateStore`].
#[derive(Clone)]
pub struct PgStore {
    db: Database,
}

impl PgStore {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    fn pool(&self) -> &sqlx::PgPool {
        self.db.pool()
    }
}

#[async_trait]
impl StateStore for PgStore {
    async fn insert_spot_price(
        &self,
        symbol: &str,
        price: Decimal,
        timestamp: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        sqlx::query("INSERT INTO prices (symbol, price, timestamp) VALUES ($1, $2, $3)")
            .bind(symbol)
            .bind(price)
            .bind(timestamp)
            .execute(self.pool())
            .await?;
        Ok(())
    }

    async fn upsert_candle(&self, candle: &Candle) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO candles (symbol, timeframe, open_time, close_time, open, high, low, close, volume)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
            ON CONFLICT (symbol, timeframe, open_time) DO UPDATE SET
                high = EXCLUDED.high,
                low = EXCLUDED.low,
                close = EXCLUDED.close,
                volume = EXCLUDED.volume
            "#,
        )
        .bind(&candle.symbol)
        .bind(&candle.timeframe)
        .bind(candle.open_time)
        .bind(candle.close_time)
        .bind(candle.open)
        .bind(candle.high)
        .bind(candle.low)
        .bind(candle.close)
        .bind(candle.volume)
        .execute(self.pool())
        .await?;
        Ok(())
    }

    async fn recent_candles(&self, symbol: &str, limit: i64) -> Result<Vec<Candle>, StoreError> {
        let mut candles = sqlx::query_as::<_, Candle>(
            r#"
            SELECT symbol, timeframe, open_time, close_time, open, high, low, close, volume
            FROM candles
            WHERE symbol = $1 AND timeframe = '15m'
            ORDER BY open_time DESC
            LIMIT $2
            "#,
        )
        .bind(symbol)
        .bind(limit)
        .fetch_all(self.pool())
        .await?;

        candles.reverse();
        Ok(candles)
    }

    async fn upsert_market(&self, market: &DiscoveredMarket) -> Result<i64, StoreError> {
        let id: i64 = sqlx::query_scalar(
            r#"
            INSERT INTO markets (condition_id, slug, title, description, asset, end_time, yes_token_id, no_token_id, active)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, TRUE)
            ON CONFLICT (condition_id) DO UPDATE SET
                slug = EXCLUDED.slug,
                title = EXCLUDED.title,
                description = EXCLUDED.description,
                end_time = EXCLUDED.end_time,
                yes_token_id = EXCLUDED.yes_token_id,
                no_token_id = EXCLUDED.no_token_id,
                active = TRUE,
                updated_at = NOW()
            RETURNING id
            "#,
        )
        .bind(&market.condition_id)
        .bind(&market.slug)
        .bind(&market.title)
        .bind(&market.description)
        .bind(&market.asset)
        .bind(market.end_time)
        .bind(&market.yes_token_id)
        .bind(&market.no_token_id)
        .fetch_one(self.pool())
        .await?;

        Ok(id)
    }

    async fn market_by_id(&self, id: i64) -> Result<Option<Market>, StoreError> {
        let market = sqlx::query_as::<_, Market>(&format!(
            "SELECT {MARKET_COLUMNS} FROM markets WHERE id = $1"
        ))
        .bind(id)
        .fetch_optional(self.pool())
        .await?;
        Ok(market)
    }

    async fn tradable_market(
        &self,
        asset: &str,
        min_end_time: DateTime<Utc>,
    ) -> Result<Option<Market>, StoreError> {
        let market = sqlx::query_as::<_, Market>(&format!(
            r#"
            SELECT {MARKET_COLUMNS}
            FROM markets
            WHERE asset = $1 AND active = TRUE AND end_time > $2
            ORDER BY end_time ASC
            LIMIT 1
            "#
        ))
        .bind(asset)
        .bind(min_end_time)
        .fetch_optional(self.pool())
        .await?;
        Ok(market)
    }

    async fn deactivate_expired_markets(&self, now: DateTime<Utc>) -> Result<u64, StoreError> {
        let result = sqlx::query(
            "UPDATE markets SET active = FALSE, updated_at = NOW() \
             WHERE active = TRUE AND end_time < $1",
        )
        .bind(now)
        .execute(self.pool())
        .await?;
        Ok(result.rows_affected())
    }

    async fn insert_market_snapshot(
        &self,
        market_id: i64,
        book: &OrderbookSummary,
        at: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO market_snapshots (market_id, timestamp, best_bid, best_ask, bid_depth, ask_depth, spread)
            VALUES ($1, $2, $3, $4, $5, $6, $7)
            "#,
        )
        .bind(market_id)
        .bind(at)
        .bind(book.best_bid)
        .bind(book.best_ask)
        .bind(book.bid_depth)
        .bind(book.ask_depth)
        .bind(book.spread)
        .execute(self.pool())
        .await?;
        Ok(())
    }

    async fn insert_decision(
        &self,
        decision: &NewDecision,
        at: DateTime<Utc>,
    ) -> Result<i64, StoreError> {
        let id: i64 = sqlx::query_scalar(
            r#"
            INSERT INTO decisions (timestamp, asset, market_id, direction, confidence, features, signal_source, executed)
            VALUES ($1, $2, $3, $4, $5, $6, $7, FALSE)
            RETURNING id
            "#,
        )
        .bind(at)
        .bind(&decision.asset)
        .bind(decision.market_id)
        .bind(decision.direction)
        .bind(decision.confidence)
        .bind(&decision.features)
        .bind(&decision.signal_source)
        .fetch_one(self.pool())
        .await?;
        Ok(id)
    }

    async fn set_decision_risk_checks(
        &self,
        decision_id: i64,
        checks: serde_json::Value,
    ) -> Result<(), StoreError> {
        sqlx::query("UPDATE decisions SET risk_checks = $2 WHERE id = $1")
            .bind(decision_id)
            .bind(checks)
            .execute(self.pool())
            .await?;
        Ok(())
    }

    async fn mark_decision_executed(
        &self,
        decision_id: i64,
        execution_id: &str,
    ) -> Result<(), StoreError> {
        let result = sqlx::query(
            "UPDATE decisions SET executed = TRUE, execution_id = $2 \
             WHERE id = $1 AND executed = FALSE",
        )
        .bind(decision_id)
        .bind(execution_id)
        .execute(self.pool())
        .await?;

        if result.rows_affected() == 0 {
            return Err(StoreError::NotFound(format!(
                "decision {decision_id} missing or already executed"
            )));
        }
        Ok(())
    }

    async fn latest_decision(&self, asset: &str) -> Result<Option<Decision>, StoreError> {
        let decision = sqlx::query_as::<_, Decision>(
            r#"
            SELECT id, timestamp, asset, market_id, direction, confidence, features,
                   risk_checks, signal_source, executed, execution_id
            FROM decisions
            WHERE asset = $1
            ORDER BY timestamp DESC, id DESC
            LIMIT 1
            "#,
        )
        .bind(asset)
        .fetch_optional(self.pool())
        .await?;
        Ok(decision)
    }

    async fn insert_order(&self, order: &NewOrder, at: DateTime<Utc>) -> Result<i64, StoreError> {
        let id: i64 = sqlx::query_scalar(
            r#"
            INSERT INTO orders (order_id, market_id, decision_id, side, token_id, price, size,
                                status, order_type, created_at, updated_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, 'pending', $8, $9, $9)
            RETURNING id
            "#,
        )
        .bind(&order.local_id)
        .bind(order.market_id)
        .bind(order.decision_id)
        .bind(order.side)
        .bind(&order.token_id)
        .bind(order.price)
        .bind(order.size)
        .bind(&order.order_type)
        .bind(at)
        .fetch_one(self.pool())
        .await?;
        Ok(id)
    }

    async fn order_by_local_id(&self, local_id: &str) -> Result<Option<Order>, StoreError> {
        let order = sqlx::query_as::<_, Order>(&format!(
            "SELECT {ORDER_COLUMNS} FROM orders WHERE order_id = $1"
        ))
        .bind(local_id)
        .fetch_optional(self.pool())
        .await?;
        Ok(order)
    }

    async fn live_orders(&self) -> Result<Vec<Order>, StoreError> {
        let orders = sqlx::query_as::<_, Order>(&format!(
            r#"
            SELECT {ORDER_COLUMNS} FROM orders
            WHERE status IN ('pending', 'open', 'partially_filled')
            ORDER BY created_at ASC
            "#
        ))
        .fetch_all(self.pool())
        .await?;
        Ok(orders)
    }

    async fn update_order_status(
        &self,
        local_id: &str,
        status: OrderStatus,
        error_message: Option<&str>,
        at: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        let mut tx = self.pool().begin().await?;

        let current: Option<OrderStatus> =
            sqlx::query_scalar("SELECT status FROM orders WHERE order_id = $1 FOR UPDATE")
                .bind(local_id)
                .fetch_optional(&mut *tx)
                .await?;

        let current =
            current.ok_or_else(|| StoreError::NotFound(format!("order {local_id}")))?;
        if !current.can_transition_to(status) {
            return Err(StoreError::IllegalTransition {
                from: current,
                to: status,
            });
        }

        sqlx::query(
            r#"
            UPDATE orders SET
                status = $2,
                error_message = COALESCE($3, error_message),
                cancelled_at = CASE WHEN $2 = 'cancelled' THEN $4 ELSE cancelled_at END,
                filled_at = CASE WHEN $2 = 'filled' THEN $4 ELSE filled_at END,
                updated_at = NOW()
            WHERE order_id = $1
            "#,
        )
        .bind(local_id)
        .bind(status)
        .bind(error_message)
        .bind(at)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(())
    }

    async fn set_exchange_order_id(
        &self,
        local_id: &str,
        exchange_order_id: &str,
    ) -> Result<(), StoreError> {
        sqlx::query("UPDATE orders SET exchange_order_id = $2, updated_at = NOW() WHERE order_id = $1")
            .bind(local_id)
            .bind(exchange_order_id)
            .execute(self.pool())
            .await?;
        Ok(())
    }

    async fn record_order_fill(
        &self,
        local_id: &str,
        filled_size: Decimal,
        at: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        let mut tx = self.pool().begin().await?;

        let row: Option<(OrderStatus, Decimal)> =
            sqlx::query_as("SELECT status, size FROM orders WHERE order_id = $1 FOR UPDATE")
                .bind(local_id)
                .fetch_optional(&mut *tx)
                .await?;

        let (current, size) =
            row.ok_or_else(|| StoreError::NotFound(format!("order {local_id}")))?;

        let next = if filled_size >= size {
            OrderStatus::Filled
        } else {
            OrderStatus::PartiallyFilled
        };
        if !current.can_transition_to(next) {
            return Err(StoreError::IllegalTransition {
                from: current,
                to: next,
            });
        }

        sqlx::query(
            r#"
            UPDATE orders SET
                status = $2,
                filled_size = $3,
                filled_at = CASE WHEN $2 = 'filled' THEN $4 ELSE filled_at END,
                updated_at = NOW()
            WHERE order_id = $1
            "#,
        )
        .bind(local_id)
        .bind(next)
        .bind(filled_size)
        .bind(at)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(())
    }

    async fn insert_trade(&self, trade: &NewTrade, at: DateTime<Utc>) -> Result<i64, StoreError> {
        let id: i64 = sqlx::query_scalar(
            r#"
            INSERT INTO trades (trade_id, order_id, market_id, side, price, size, fee, asset, timestamp)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
            RETURNING id
            "#,
        )
        .bind(&trade.trade_id)
        .bind(trade.order_row_id)
        .bind(trade.market_id)
        .bind(trade.side)
        .bind(trade.price)
        .bind(trade.size)
        .bind(trade.fee)
        .bind(&trade.asset)
        .bind(at)
        .fetch_one(self.pool())
        .await?;
        Ok(id)
    }

    async fn open_position(
        &self,
        market_id: i64,
        token_id: &str,
    ) -> Result<Option<Position>, StoreError> {
        let position = sqlx::query_as::<_, Position>(&format!(
            r#"
            SELECT {POSITION_COLUMNS} FROM positions
            WHERE market_id = $1 AND token_id = $2 AND status = 'open'
            "#
        ))
        .bind(market_id)
        .bind(token_id)
        .fetch_optional(self.pool())
        .await?;
        Ok(position)
    }

    async fn open_positions(&self) -> Result<Vec<Position>, StoreError> {
        let positions = sqlx::query_as::<_, Position>(&format!(
            "SELECT {POSITION_COLUMNS} FROM positions WHERE status = 'open' ORDER BY opened_at ASC"
        ))
        .fetch_all(self.pool())
        .await?;
        Ok(positions)
    }

    async fn open_position_count(&self) -> Result<i64, StoreError> {
        let count: i64 =
            sqlx::query_scalar("SELECT COUNT(*) FROM positions WHERE status = 'open'")
                .fetch_one(self.pool())
                .await?;
        Ok(count)
    }

    async fn insert_position(
        &self,
        position: &NewPosition,
        at: DateTime<Utc>,
    ) -> Result<i64, StoreError> {
        let id: i64 = sqlx::query_scalar(
            r#"
            INSERT INTO positions (market_id, token_id, side, size, avg_entry_price, status, opened_at, updated_at)
            VALUES ($1, $2, $3, $4, $5, 'open', $6, $6)
            RETURNING id
            "#,
        )
        .bind(position.market_id)
        .bind(&position.token_id)
        .bind(position.side)
        .bind(position.size)
        .bind(position.avg_entry_price)
        .bind(at)
        .fetch_one(self.pool())
        .await?;
        Ok(id)
    }

    async fn save_position(&self, position: &Position) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            UPDATE positions SET
                size = $2,
                avg_entry_price = $3,
                current_price = $4,
                unrealized_pnl = $5,
                realized_pnl = $6,
                status = $7,
                closed_at = $8,
                updated_at = NOW()
            WHERE id = $1
            "#,
        )
        .bind(position.id)
        .bind(position.size)
        .bind(position.avg_entry_price)
        .bind(position.current_price)
        .bind(position.unrealized_pnl)
        .bind(position.realized_pnl)
        .bind(position.status)
        .bind(position.closed_at)
        .execute(self.pool())
        .await?;
        Ok(())
    }

    async fn asset_exposure(&self, asset: &str) -> Result<Decimal, StoreError> {
        let exposure: Decimal = sqlx::query_scalar(
            r#"
            SELECT COALESCE(SUM(p.size * p.avg_entry_price), 0)
            FROM positions p
            JOIN markets m ON p.market_id = m.id
            WHERE m.asset = $1 AND p.status = 'open'
            "#,
        )
        .bind(asset)
        .fetch_one(self.pool())
        .await?;
        Ok(exposure)
    }

    async fn daily_pnl(&self, day: NaiveDate) -> Result<Option<DailyPnl>, StoreError> {
        let row = sqlx::query_as::<_, DailyPnl>(
            "SELECT date, realized_pnl, fees_paid, trade_count, win_count, loss_count \
             FROM daily_pnl WHERE date = $1",
        )
        .bind(day)
        .fetch_optional(self.pool())
        .await?;
        Ok(row)
    }

    async fn record_realized(
        &self,
        day: NaiveDate,
        pnl: Decimal,
        fees: Decimal,
        is_win: bool,
    ) -> Result<(), StoreError> {
        let (win, loss): (i32, i32) = if is_win { (1, 0) } else { (0, 1) };
        sqlx::query(
            r#"
            INSERT INTO daily_pnl (date, realized_pnl, fees_paid, trade_count, win_count, loss_count)
            VALUES ($1, $2, $3, 1, $4, $5)
            ON CONFLICT (date) DO UPDATE SET
                realized_pnl = daily_pnl.realized_pnl + EXCLUDED.realized_pnl,
                fees_paid = daily_pnl.fees_paid + EXCLUDED.fees_paid,
                trade_count = daily_pnl.trade_count + 1,
                win_count = daily_pnl.win_count + EXCLUDED.win_count,
                loss_count = daily_pnl.loss_count + EXCLUDED.loss_count,
                updated_at = NOW()
            "#,
        )
        .bind(day)
        .bind(pnl)
        .bind(fees)
        .bind(win)
        .bind(loss)
        .execute(self.pool())
        .await?;
        Ok(())
    }

    async fn bot_state(&self) -> Result<RunState, StoreError> {
        let state: Option<RunState> =
            sqlx::query_scalar("SELECT state FROM bot_state ORDER BY id DESC LIMIT 1")
                .fetch_optional(self.pool())
                .await?;
        Ok(state.unwrap_or(RunState::Stopped))
    }

    async fn set_bot_state(
        &self,
        state: RunState,
        reason: &str,
        actor: &str,
        at: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        let mut tx = self.pool().begin().await?;

        sqlx::query(
            "INSERT INTO bot_state (state, reason, updated_by, updated_at) VALUES ($1, $2, $3, $4)",
        )
        .bind(state)
        .bind(reason)
        .bind(actor)
        .bind(at)
        .execute(&mut *tx)
        .await?;

        sqlx::query("INSERT INTO audit_log (event_type, details, actor) VALUES ($1, $2, $3)")
            .bind("bot_state_change")
            .bind(json!({ "new_state": state.as_str(), "reason": reason }))
            .bind(actor)
            .execute(&mut *tx)
            .await?;

        tx.commit().await?;
        Ok(())
    }

    async fn trip_breaker(
        &self,
        name: &str,
        reason: &str,
        at: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        let mut tx = self.pool().begin().await?;

        sqlx::query(
            r#"
            INSERT INTO circuit_breakers (breaker_name, is_tripped, trip_reason, trip_count, last_trip)
            VALUES ($1, TRUE, $2, 1, $3)
            ON CONFLICT (breaker_name) DO UPDATE SET
                is_tripped = TRUE,
                trip_reason = EXCLUDED.trip_reason,
                trip_count = circuit_breakers.trip_count + 1,
                last_trip = EXCLUDED.last_trip
            "#,
        )
        .bind(name)
        .bind(reason)
        .bind(at)
        .execute(&mut *tx)
        .await?;

        sqlx::query("INSERT INTO audit_log (event_type, details, actor) VALUES ($1, $2, 'system')")
            .bind("circuit_breaker_tripped")
            .bind(json!({ "breaker": name, "reason": reason }))
            .execute(&mut *tx)
            .await?;

        tx.commit().await?;
        Ok(())
    }

    async fn reset_breaker(&self, name: &str, at: DateTime<Utc>) -> Result<(), StoreError> {
        let mut tx = self.pool().begin().await?;

        sqlx::query(
            "UPDATE circuit_breakers SET is_tripped = FALSE, last_reset = $2 WHERE breaker_name = $1",
        )
        .bind(name)
        .bind(at)
        .execute(&mut *tx)
        .await?;

        sqlx::query("INSERT INTO audit_log (event_type, details, actor) VALUES ($1, $2, 'system')")
            .bind("circuit_breaker_reset")
            .bind(json!({ "breaker": name }))
            .execute(&mut *tx)
            .await?;

        tx.commit().await?;
        Ok(())
    }

    async fn tripped_breakers(&self) -> Result<Vec<String>, StoreError> {
        let names: Vec<String> = sqlx::query_scalar(
            "SELECT breaker_name FROM circuit_breakers WHERE is_tripped = TRUE ORDER BY breaker_name",
        )
        .fetch_all(self.pool())
        .await?;
        Ok(names)
    }

    async fn all_breakers(&self) -> Result<Vec<BreakerStatus>, StoreError> {
        let breakers = sqlx::query_as::<_, BreakerStatus>(
            "SELECT breaker_name, is_tripped, trip_reason, trip_count, last_trip, last_reset \
             FROM circuit_breakers ORDER BY breaker_name",
        )
        .fetch_all(self.pool())
        .await?;
        Ok(breakers)
    }

    async fn config_entries(&self) -> Result<Vec<(String, serde_json::Value)>, StoreError> {
        let rows: Vec<(String, serde_json::Value)> =
            sqlx::query_as("SELECT key, value FROM config")
                .fetch_all(self.pool())
                .await?;
        Ok(rows)
    }

    async fn set_config(
        &self,
        key: &str,
        value: serde_json::Value,
        actor: &str,
    ) -> Result<(), StoreError> {
        let mut tx = self.pool().begin().await?;

        sqlx::query(
            r#"
            INSERT INTO config (key, value, updated_by)
            VALUES ($1, $2, $3)
            ON CONFLICT (key) DO UPDATE SET
                value = EXCLUDED.value,
                updated_by = EXCLUDED.updated_by,
                updated_at = NOW()
            "#,
        )
        .bind(key)
        .bind(&value)
        .bind(actor)
        .execute(&mut *tx)
        .await?;

        sqlx::query("INSERT INTO audit_log (event_type, details, actor) VALUES ($1, $2, $3)")
            .bind("config_updated")
            .bind(json!({ "key": key, "value": value }))
            .bind(actor)
            .execute(&mut *tx)
            .await?;

        tx.commit().await?;
        Ok(())
    }

    async fn insert_risk_metrics(
        &self,
        record: &RiskMetricsRecord,
        at: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO risk_metrics (timestamp, total_exposure, asset_exposure, correlation_risk, daily_loss, portfolio_value)
            VALUES ($1, $2, $3, $4, $5, $6)
            "#,
        )
        .bind(at)
        .bind(record.total_exposure)
        .bind(&record.asset_exposure)
        .bind(record.correlation_risk)
        .bind(record.daily_loss)
        .bind(record.portfolio_value)
        .execute(self.pool())
        .await?;
        Ok(())
    }

    async fn audit(&self, event_type: &str, details: serde_json::Value) -> Result<(), StoreError> {
        sqlx::query("INSERT INTO audit_log (event_type, details, actor) VALUES ($1, $2, 'system')")
            .bind(event_type)
            .bind(details)
            .execute(self.pool())
            .await?;
        Ok(())
    }
}
