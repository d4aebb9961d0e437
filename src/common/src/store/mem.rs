//! In-memory state store.
//!
//! Mirrors `PgStore` semantics (upsert keys, monotone order transitions,
//! flip-once decision execution) without a database. Used by tests and
//! available for dry runs.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use rust_decimal::Decimal;
use serde_json::json;

use crate::clock::Clock;
use crate::models::{
    BreakerStatus, Candle, DailyPnl, Decision, DiscoveredMarket, Market, NewDecision, NewOrder,
    NewPosition, NewTrade, Order, OrderStatus, OrderbookSummary, Position, PositionStatus,
    RiskMetricsRecord, RunState,
};

use super::{StateStore, StoreError};

/// One audit log row.
#[derive(Debug, Clone)]
pub struct AuditEntry {
    pub timestamp: DateTime<Utc>,
    pub event_type: String,
    pub details: serde_json::Value,
}

#[derive(Default)]
struct Inner {
    prices: Vec<(String, Decimal, DateTime<Utc>)>,
    candles: Vec<Candle>,
    markets: Vec<Market>,
    snapshots: Vec<(i64, OrderbookSummary, DateTime<Utc>)>,
    decisions: Vec<Decision>,
    orders: Vec<Order>,
    trades: Vec<NewTrade>,
    positions: Vec<Position>,
    daily: HashMap<NaiveDate, DailyPnl>,
    states: Vec<(RunState, String, String, DateTime<Utc>)>,
    breakers: HashMap<String, BreakerStatus>,
    config: HashMap<String, serde_json::Value>,
    metrics: Vec<(RiskMetricsRecord, DateTime<Utc>)>,
    audit_log: Vec<AuditEntry>,
    next_id: i64,
}

impl Inner {
    fn next_id(&mut self) -> i64 {
        self.next_id += 1;
        self.next_id
    }
}

/// In-memory implementation of [`StateStore`].
pub struct MemStore {
    clock: Arc<dyn Clock>,
    inner: Mutex<Inner>,
}

impl MemStore {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            clock,
            inner: Mutex::new(Inner::default()),
        }
    }

    fn push_audit(inner: &mut Inner, timestamp: DateTime<Utc>, event_type: &str, details: serde_json::Value) {
        inner.audit_log.push(AuditEntry {
            timestamp,
            event_type: event_type.to_string(),
            details,
        });
    }

    // Inspection helpers for tests.

    pub fn audit_entries(&self) -> Vec<AuditEntry> {
        self.inner.lock().unwrap().audit_log.clone()
    }

    pub fn all_orders(&self) -> Vec<Order> {
        self.inner.lock().unwrap().orders.clone()
    }

    pub fn all_decisions(&self) -> Vec<Decision> {
        self.inner.lock().unwrap().decisions.clone()
    }

    pub fn all_trades(&self) -> Vec<NewTrade> {
        self.inner.lock().unwrap().trades.clone()
    }

    pub fn all_positions(&self) -> Vec<Position> {
        self.inner.lock().unwrap().positions.clone()
    }
}

#[async_trait]
impl StateStore for MemStore {
    async fn insert_spot_price(
        &self,
        symbol: &str,
        price: Decimal,
        timestamp: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        let mut inner = self.inner.lock().unwrap();
        inner.prices.push((symbol.to_string(), price, timestamp));
        Ok(())
    }

    async fn upsert_candle(&self, candle: &Candle) -> Result<(), StoreError> {
        let mut inner = self.inner.lock().unwrap();
        let existing = inner.candles.iter().position(|c| {
            c.symbol == candle.symbol
                && c.timeframe == candle.timeframe
                && c.open_time == candle.open_time
        });
        match existing {
            Some(index) => {
                // open is immutable after first insert
                let stored = &mut inner.candles[index];
                stored.high = candle.high;
                stored.low = candle.low;
                stored.close = candle.close;
                stored.volume = candle.volume;
            }
            None => inner.candles.push(candle.clone()),
        }
        Ok(())
    }

    async fn recent_candles(&self, symbol: &str, limit: i64) -> Result<Vec<Candle>, StoreError> {
        let inner = self.inner.lock().unwrap();
        let mut candles: Vec<Candle> = inner
            .candles
            .iter()
            .filter(|c| c.symbol == symbol && c.timeframe == "15m")
            .cloned()
            .collect();
        candles.sort_by_key(|c| c.open_time);
        let skip = candles.len().saturating_sub(limit as usize);
        Ok(candles.into_iter().skip(skip).collect())
    }

    async fn upsert_market(&self, market: &DiscoveredMarket) -> Result<i64, StoreError> {
        let mut inner = self.inner.lock().unwrap();
        if let Some(existing) = inner
            .markets
            .iter_mut()
            .find(|m| m.condition_id == market.condition_id)
        {
            existing.slug = market.slug.clone();
            existing.title = market.title.clone();
            existing.description = market.description.clone();
            existing.end_time = market.end_time;
            existing.yes_token_id = market.yes_token_id.clone();
            existing.no_token_id = market.no_token_id.clone();
            existing.active = true;
            return Ok(existing.id);
        }

        let id = inner.next_id();
        inner.markets.push(Market {
            id,
            condition_id: market.condition_id.clone(),
            slug: market.slug.clone(),
            title: market.title.clone(),
            description: market.description.clone(),
            asset: market.asset.clone(),
            end_time: market.end_time,
            yes_token_id: market.yes_token_id.clone(),
            no_token_id: market.no_token_id.clone(),
            active: true,
        });
        Ok(id)
    }

    async fn market_by_id(&self, id: i64) -> Result<Option<Market>, StoreError> {
        let inner = self.inner.lock().unwrap();
        Ok(inner.markets.iter().find(|m| m.id == id).cloned())
    }

    async fn tradable_market(
        &self,
        asset: &str,
        min_end_time: DateTime<Utc>,
    ) -> Result<Option<Market>, StoreError> {
        let inner = self.inner.lock().unwrap();
        Ok(inner
            .markets
            .iter()
            .filter(|m| m.asset == asset && m.active && m.end_time > min_end_time)
            .min_by_key(|m| m.end_time)
            .cloned())
    }

    async fn deactivate_expired_markets(&self, now: DateTime<Utc>) -> Result<u64, StoreError> {
        let mut inner = self.inner.lock().unwrap();
        let mut count = 0;
        for market in inner.markets.iter_mut() {
            if market.active && market.end_time < now {
                market.active = false;
                count += 1;
            }
        }
        Ok(count)
    }

    async fn insert_market_snapshot(
        &self,
        market_id: i64,
        book: &OrderbookSummary,
        at: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        let mut inner = self.inner.lock().unwrap();
        inner.snapshots.push((market_id, book.clone(), at));
        Ok(())
    }

    async fn insert_decision(
        &self,
        decision: &NewDecision,
        at: DateTime<Utc>,
    ) -> Result<i64, StoreError> {
        let mut inner = self.inner.lock().unwrap();
        let id = inner.next_id();
        inner.decisions.push(Decision {
            id,
            timestamp: at,
            asset: decision.asset.clone(),
            market_id: decision.market_id,
            direction: decision.direction,
            confidence: decision.confidence,
            features: Some(decision.features.clone()),
            risk_checks: None,
            signal_source: Some(decision.signal_source.clone()),
            executed: false,
            execution_id: None,
        });
        Ok(id)
    }

    async fn set_decision_risk_checks(
        &self,
        decision_id: i64,
        checks: serde_json::Value,
    ) -> Result<(), StoreError> {
        let mut inner = self.inner.lock().unwrap();
        if let Some(decision) = inner.decisions.iter_mut().find(|d| d.id == decision_id) {
            decision.risk_checks = Some(checks);
        }
        Ok(())
    }

    async fn mark_decision_executed(
        &self,
        decision_id: i64,
        execution_id: &str,
    ) -> Result<(), StoreError> {
        let mut inner = self.inner.lock().unwrap();
        let decision = inner
            .decisions
            .iter_mut()
            .find(|d| d.id == decision_id && !d.executed)
            .ok_or_else(|| {
                StoreError::NotFound(format!("decision {decision_id} missing or already executed"))
            })?;
        decision.executed = true;
        decision.execution_id = Some(execution_id.to_string());
        Ok(())
    }

    async fn latest_decision(&self, asset: &str) -> Result<Option<Decision>, StoreError> {
        let inner = self.inner.lock().unwrap();
        Ok(inner
            .decisions
            .iter()
            .filter(|d| d.asset == asset)
            .max_by_key(|d| (d.timestamp, d.id))
            .cloned())
    }

    async fn insert_order(&self, order: &NewOrder, at: DateTime<Utc>) -> Result<i64, StoreError> {
        let mut inner = self.inner.lock().unwrap();
        let id = inner.next_id();
        inner.orders.push(Order {
            id,
            order_id: order.local_id.clone(),
            exchange_order_id: None,
            market_id: order.market_id,
            decision_id: order.decision_id,
            side: order.side,
            token_id: order.token_id.clone(),
            price: order.price,
            size: order.size,
            filled_size: Decimal::ZERO,
            status: OrderStatus::Pending,
            order_type: order.order_type.clone(),
            created_at: at,
            filled_at: None,
            cancelled_at: None,
            error_message: None,
        });
        Ok(id)
    }

    async fn order_by_local_id(&self, local_id: &str) -> Result<Option<Order>, StoreError> {
        let inner = self.inner.lock().unwrap();
        Ok(inner.orders.iter().find(|o| o.order_id == local_id).cloned())
    }

    async fn live_orders(&self) -> Result<Vec<Order>, StoreError> {
        let inner = self.inner.lock().unwrap();
        Ok(inner
            .orders
            .iter()
            .filter(|o| o.status.is_live())
            .cloned()
            .collect())
    }

    async fn update_order_status(
        &self,
        local_id: &str,
        status: OrderStatus,
        error_message: Option<&str>,
        at: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        let mut inner = self.inner.lock().unwrap();
        let order = inner
            .orders
            .iter_mut()
            .find(|o| o.order_id == local_id)
            .ok_or_else(|| StoreError::NotFound(format!("order {local_id}")))?;

        if !order.status.can_transition_to(status) {
            return Err(StoreError::IllegalTransition {
                from: order.status,
                to: status,
            });
        }

        order.status = status;
        if let Some(message) = error_message {
            order.error_message = Some(message.to_string());
        }
        match status {
            OrderStatus::Cancelled => order.cancelled_at = Some(at),
            OrderStatus::Filled => order.filled_at = Some(at),
            _ => {}
        }
        Ok(())
    }

    async fn set_exchange_order_id(
        &self,
        local_id: &str,
        exchange_order_id: &str,
    ) -> Result<(), StoreError> {
        let mut inner = self.inner.lock().unwrap();
        let order = inner
            .orders
            .iter_mut()
            .find(|o| o.order_id == local_id)
            .ok_or_else(|| StoreError::NotFound(format!("order {local_id}")))?;
        order.exchange_order_id = Some(exchange_order_id.to_string());
        Ok(())
    }

    async fn record_order_fill(
        &self,
        local_id: &str,
        filled_size: Decimal,
        at: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        let mut inner = self.inner.lock().unwrap();
        let order = inner
            .orders
            .iter_mut()
            .find(|o| o.order_id == local_id)
            .ok_or_else(|| StoreError::NotFound(format!("order {local_id}")))?;

        let next = if filled_size >= order.size {
            OrderStatus::Filled
        } else {
            OrderStatus::PartiallyFilled
        };
        if !order.status.can_transition_to(next) {
            return Err(StoreError::IllegalTransition {
                from: order.status,
                to: next,
            });
        }

        order.status = next;
        order.filled_size = filled_size;
        if next == OrderStatus::Filled {
            order.filled_at = Some(at);
        }
        Ok(())
    }

    async fn insert_trade(&self, trade: &NewTrade, _at: DateTime<Utc>) -> Result<i64, StoreError> {
        let mut inner = self.inner.lock().unwrap();
        let id = inner.next_id();
        inner.trades.push(trade.clone());
        Ok(id)
    }

    async fn open_position(
        &self,
        market_id: i64,
        token_id: &str,
    ) -> Result<Option<Position>, StoreError> {
        let inner = self.inner.lock().unwrap();
        Ok(inner
            .positions
            .iter()
            .find(|p| {
                p.market_id == market_id
                    && p.token_id == token_id
                    && p.status == PositionStatus::Open
            })
            .cloned())
    }

    async fn open_positions(&self) -> Result<Vec<Position>, StoreError> {
        let inner = self.inner.lock().unwrap();
        Ok(inner
            .positions
            .iter()
            .filter(|p| p.status == PositionStatus::Open)
            .cloned()
            .collect())
    }

    async fn open_position_count(&self) -> Result<i64, StoreError> {
        Ok(self.open_positions().await?.len() as i64)
    }

    async fn insert_position(
        &self,
        position: &NewPosition,
        at: DateTime<Utc>,
    ) -> Result<i64, StoreError> {
        let mut inner = self.inner.lock().unwrap();
        let id = inner.next_id();
        inner.positions.push(Position {
            id,
            market_id: position.market_id,
            token_id: position.token_id.clone(),
            side: position.side,
            size: position.size,
            avg_entry_price: position.avg_entry_price,
            current_price: None,
            unrealized_pnl: None,
            realized_pnl: Decimal::ZERO,
            status: PositionStatus::Open,
            opened_at: at,
            closed_at: None,
        });
        Ok(id)
    }

    async fn save_position(&self, position: &Position) -> Result<(), StoreError> {
        let mut inner = self.inner.lock().unwrap();
        let existing = inner
            .positions
            .iter_mut()
            .find(|p| p.id == position.id)
            .ok_or_else(|| StoreError::NotFound(format!("position {}", position.id)))?;
        *existing = position.clone();
        Ok(())
    }

    async fn asset_exposure(&self, asset: &str) -> Result<Decimal, StoreError> {
        let inner = self.inner.lock().unwrap();
        let market_ids: Vec<i64> = inner
            .markets
            .iter()
            .filter(|m| m.asset == asset)
            .map(|m| m.id)
            .collect();

        Ok(inner
            .positions
            .iter()
            .filter(|p| p.status == PositionStatus::Open && market_ids.contains(&p.market_id))
            .map(|p| p.size * p.avg_entry_price)
            .sum())
    }

    async fn daily_pnl(&self, day: NaiveDate) -> Result<Option<DailyPnl>, StoreError> {
        let inner = self.inner.lock().unwrap();
        Ok(inner.daily.get(&day).cloned())
    }

    async fn record_realized(
        &self,
        day: NaiveDate,
        pnl: Decimal,
        fees: Decimal,
        is_win: bool,
    ) -> Result<(), StoreError> {
        let mut inner = self.inner.lock().unwrap();
        let entry = inner.daily.entry(day).or_insert_with(|| DailyPnl {
            date: day,
            realized_pnl: Decimal::ZERO,
            fees_paid: Decimal::ZERO,
            trade_count: 0,
            win_count: 0,
            loss_count: 0,
        });
        entry.realized_pnl += pnl;
        entry.fees_paid += fees;
        entry.trade_count += 1;
        if is_win {
            entry.win_count += 1;
        } else {
            entry.loss_count += 1;
        }
        Ok(())
    }

    async fn bot_state(&self) -> Result<RunState, StoreError> {
        let inner = self.inner.lock().unwrap();
        Ok(inner
            .states
            .last()
            .map(|(state, _, _, _)| *state)
            .unwrap_or(RunState::Stopped))
    }

    async fn set_bot_state(
        &self,
        state: RunState,
        reason: &str,
        actor: &str,
        at: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        let mut inner = self.inner.lock().unwrap();
        inner
            .states
            .push((state, reason.to_string(), actor.to_string(), at));
        Self::push_audit(
            &mut inner,
            at,
            "bot_state_change",
            json!({ "new_state": state.as_str(), "reason": reason }),
        );
        Ok(())
    }

    async fn trip_breaker(
        &self,
        name: &str,
        reason: &str,
        at: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        let mut inner = self.inner.lock().unwrap();
        let breaker = inner
            .breakers
            .entry(name.to_string())
            .or_insert_with(|| BreakerStatus {
                breaker_name: name.to_string(),
                is_tripped: false,
                trip_reason: None,
                trip_count: 0,
                last_trip: None,
                last_reset: None,
            });
        breaker.is_tripped = true;
        breaker.trip_reason = Some(reason.to_string());
        breaker.trip_count += 1;
        breaker.last_trip = Some(at);
        Self::push_audit(
            &mut inner,
            at,
            "circuit_breaker_tripped",
            json!({ "breaker": name, "reason": reason }),
        );
        Ok(())
    }

    async fn reset_breaker(&self, name: &str, at: DateTime<Utc>) -> Result<(), StoreError> {
        let mut inner = self.inner.lock().unwrap();
        if let Some(breaker) = inner.breakers.get_mut(name) {
            breaker.is_tripped = false;
            breaker.last_reset = Some(at);
        }
        Self::push_audit(
            &mut inner,
            at,
            "circuit_breaker_reset",
            json!({ "breaker": name }),
        );
        Ok(())
    }

    async fn tripped_breakers(&self) -> Result<Vec<String>, StoreError> {
        let inner = self.inner.lock().unwrap();
        let mut names: Vec<String> = inner
            .breakers
            .values()
            .filter(|b| b.is_tripped)
            .map(|b| b.breaker_name.clone())
            .collect();
        names.sort();
        Ok(names)
    }

    async fn all_breakers(&self) -> Result<Vec<BreakerStatus>, StoreError> {
        let inner = self.inner.lock().unwrap();
        let mut breakers: Vec<BreakerStatus> = inner.breakers.values().cloned().collect();
        breakers.sort_by(|a, b| a.breaker_name.cmp(&b.breaker_name));
        Ok(breakers)
    }

    async fn config_entries(&self) -> Result<Vec<(String, serde_json::Value)>, StoreError> {
        let inner = self.inner.lock().unwrap();
        Ok(inner
            .config
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect())
    }

    async fn set_config(
        &self,
        key: &str,
        value: serde_json::Value,
        _actor: &str,
    ) -> Result<(), StoreError> {
        let now = self.clock.now();
        let mut inner = self.inner.lock().unwrap();
        inner.config.insert(key.to_string(), value.clone());
        Self::push_audit(
            &mut inner,
            now,
            "config_updated",
            json!({ "key": key, "value": value }),
        );
        Ok(())
    }

    async fn insert_risk_metrics(
        &self,
        record: &RiskMetricsRecord,
        at: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        let mut inner = self.inner.lock().unwrap();
        inner.metrics.push((record.clone(), at));
        Ok(())
    }

    async fn audit(&self, event_type: &str, details: serde_json::Value) -> Result<(), StoreError> {
        let now = self.clock.now();
        let mut inner = self.inner.lock().unwrap();
        Self::push_audit(&mut inner, now, event_type, details);
        Ok(())
    }
}
