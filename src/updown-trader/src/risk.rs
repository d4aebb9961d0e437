//! Risk gate: bot state machine, circuit breakers, exposure and loss
//! limits, and take-profit / stop-loss pricing.
//!
//! The gate also owns the order-gate mutex. Risk reads and the pending
//! order insert happen under it so two candidate orders cannot both pass a
//! soft cap that only one of them fits; the same mutex serialises bot state
//! transitions. No network call ever runs under the lock.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex as StdMutex};

use chrono::{DateTime, Utc};
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde_json::json;
use thiserror::Error;
use tokio::sync::{Mutex, MutexGuard};
use tracing::{info, warn};

use common::models::{breakers, PositionSide, RiskMetricsRecord, RunState};
use common::{Clock, StateStore, StoreError};

/// Fee buffer folded into both exit thresholds.
const FEE_BUFFER: Decimal = dec!(0.02);
const MIN_EXIT_PRICE: Decimal = dec!(0.01);
const MAX_EXIT_PRICE: Decimal = dec!(0.99);

/// DB-backed config entries are cached at most this long.
const CONFIG_CACHE_SECS: i64 = 60;

#[derive(Debug, Error)]
pub enum RiskError {
    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("Cannot start: circuit breakers tripped: {0}")]
    BreakersTripped(String),
}

/// Default values for the recognized config keys.
pub fn config_defaults() -> Vec<(&'static str, serde_json::Value)> {
    vec![
        ("portfolio_trade_pct", json!(5.0)),
        ("max_market_usd", json!(100.0)),
        ("max_market_portfolio_pct", json!(20.0)),
        ("correlation_max_basket_pct", json!(35.0)),
        ("daily_loss_limit_usd", json!(25.0)),
        ("take_profit_pct", json!(8.0)),
        ("stop_loss_pct", json!(5.0)),
        ("min_liquidity_usd", json!(500.0)),
        ("market_close_buffer_minutes", json!(2)),
        ("stale_data_threshold_seconds", json!(60)),
        ("max_open_positions", json!(5)),
        ("llm_advisor_enabled", json!(false)),
        ("portfolio_size_usd", json!(500.0)),
    ]
}

/// Result of the layered order checks, in evaluation order.
#[derive(Debug, Clone)]
pub struct RiskVerdict {
    pub passed: bool,
    pub checks: Vec<(&'static str, bool)>,
    pub reasons: Vec<String>,
}

impl RiskVerdict {
    /// The first failing check's reason.
    pub fn reason(&self) -> Option<&str> {
        self.reasons.first().map(|s| s.as_str())
    }

    pub fn to_json(&self) -> serde_json::Value {
        let checks: BTreeMap<&str, bool> = self.checks.iter().cloned().collect();
        json!({
            "passed": self.passed,
            "checks": checks,
            "reasons": self.reasons,
        })
    }
}

/// Take-profit / stop-loss thresholds for a position.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExitPrices {
    pub take_profit: Decimal,
    pub stop_loss: Decimal,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitReason {
    TakeProfit,
    StopLoss,
}

impl ExitReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            ExitReason::TakeProfit => "take_profit",
            ExitReason::StopLoss => "stop_loss",
        }
    }
}

fn clamp_price(price: Decimal) -> Decimal {
    price.max(MIN_EXIT_PRICE).min(MAX_EXIT_PRICE)
}

/// Exit thresholds for an entry price, with the fee buffer folded in.
///
/// Percentages are plain percent values (8 means 8%). Both thresholds clamp
/// to [0.01, 0.99].
pub fn exit_prices(
    entry: Decimal,
    side: PositionSide,
    take_profit_pct: Decimal,
    stop_loss_pct: Decimal,
) -> ExitPrices {
    let tp = take_profit_pct / dec!(100);
    let sl = stop_loss_pct / dec!(100);

    let (take_profit, stop_loss) = match side {
        PositionSide::Yes => (
            entry * (Decimal::ONE + tp + FEE_BUFFER),
            entry * (Decimal::ONE - sl - FEE_BUFFER),
        ),
        PositionSide::No => (
            entry * (Decimal::ONE - tp - FEE_BUFFER),
            entry * (Decimal::ONE + sl + FEE_BUFFER),
        ),
    };

    ExitPrices {
        take_profit: clamp_price(take_profit),
        stop_loss: clamp_price(stop_loss),
    }
}

/// Whether the current price triggers an exit for the position.
pub fn should_exit(
    entry: Decimal,
    current: Decimal,
    side: PositionSide,
    take_profit_pct: Decimal,
    stop_loss_pct: Decimal,
) -> Option<ExitReason> {
    let exits = exit_prices(entry, side, take_profit_pct, stop_loss_pct);

    match side {
        PositionSide::Yes => {
            if current >= exits.take_profit {
                Some(ExitReason::TakeProfit)
            } else if current <= exits.stop_loss {
                Some(ExitReason::StopLoss)
            } else {
                None
            }
        }
        PositionSide::No => {
            if current <= exits.take_profit {
                Some(ExitReason::TakeProfit)
            } else if current >= exits.stop_loss {
                Some(ExitReason::StopLoss)
            } else {
                None
            }
        }
    }
}

struct ConfigCache {
    entries: HashMap<String, serde_json::Value>,
    loaded_at: Option<DateTime<Utc>>,
}

/// Authoritative yes/no for state changes and candidate orders.
pub struct RiskGate {
    store: Arc<dyn StateStore>,
    clock: Arc<dyn Clock>,
    assets: Vec<String>,
    config_cache: StdMutex<ConfigCache>,
    order_gate: Mutex<()>,
}

impl RiskGate {
    pub fn new(store: Arc<dyn StateStore>, clock: Arc<dyn Clock>, assets: Vec<String>) -> Self {
        Self {
            store,
            clock,
            assets,
            config_cache: StdMutex::new(ConfigCache {
                entries: HashMap::new(),
                loaded_at: None,
            }),
            order_gate: Mutex::new(()),
        }
    }

    /// Serialises the pass-then-insert critical section (and state
    /// transitions). Hold the guard across `can_trade` + `check_order` +
    /// the pending order insert, and nothing else.
    pub async fn order_gate(&self) -> MutexGuard<'_, ()> {
        self.order_gate.lock().await
    }

    async fn load_config(&self) -> Result<HashMap<String, serde_json::Value>, StoreError> {
        let now = self.clock.now();
        {
            let cache = self.config_cache.lock().unwrap();
            if let Some(loaded_at) = cache.loaded_at {
                if (now - loaded_at).num_seconds() < CONFIG_CACHE_SECS {
                    return Ok(cache.entries.clone());
                }
            }
        }

        let entries: HashMap<String, serde_json::Value> =
            self.store.config_entries().await?.into_iter().collect();

        let mut cache = self.config_cache.lock().unwrap();
        cache.entries = entries.clone();
        cache.loaded_at = Some(now);
        Ok(entries)
    }

    pub async fn config_decimal(
        &self,
        key: &str,
        default: Decimal,
    ) -> Result<Decimal, StoreError> {
        let config = self.load_config().await?;
        Ok(config.get(key).and_then(decimal_value).unwrap_or(default))
    }

    pub async fn config_i64(&self, key: &str, default: i64) -> Result<i64, StoreError> {
        let config = self.load_config().await?;
        Ok(config
            .get(key)
            .and_then(|v| v.as_i64().or_else(|| v.as_f64().map(|f| f as i64)))
            .unwrap_or(default))
    }

    pub async fn config_bool(&self, key: &str, default: bool) -> Result<bool, StoreError> {
        let config = self.load_config().await?;
        Ok(config.get(key).and_then(|v| v.as_bool()).unwrap_or(default))
    }

    /// Today's realized loss as a positive number; zero when flat or up.
    pub async fn daily_loss(&self) -> Result<Decimal, StoreError> {
        let today = self.clock.now().date_naive();
        let daily = self.store.daily_pnl(today).await?;
        Ok(match daily {
            Some(daily) if daily.realized_pnl < Decimal::ZERO => daily.realized_pnl.abs(),
            _ => Decimal::ZERO,
        })
    }

    /// Checks 1-3 of the layered gate: bot state, breakers, daily loss.
    ///
    /// Crossing the daily loss limit transitions the bot to
    /// HALTED_DAILY_LOSS as a side effect.
    pub async fn can_trade(&self) -> Result<(bool, String), StoreError> {
        let state = self.store.bot_state().await?;
        if state != RunState::Running {
            return Ok((false, format!("Bot state is {state}")));
        }

        let tripped = self.store.tripped_breakers().await?;
        if !tripped.is_empty() {
            return Ok((
                false,
                format!("Circuit breakers tripped: {}", tripped.join(", ")),
            ));
        }

        let daily_loss = self.daily_loss().await?;
        let limit = self.config_decimal("daily_loss_limit_usd", dec!(25)).await?;
        if daily_loss >= limit {
            self.transition(
                RunState::HaltedDailyLoss,
                &format!("Daily loss ${daily_loss:.2} >= ${limit:.2}"),
                "system",
            )
            .await?;
            return Ok((false, "Daily loss limit reached".to_string()));
        }

        Ok((true, "Trading allowed".to_string()))
    }

    /// Checks 4-7 of the layered gate for a candidate order.
    pub async fn check_order(
        &self,
        asset: &str,
        size_usd: Decimal,
        portfolio_value: Decimal,
    ) -> Result<RiskVerdict, StoreError> {
        let mut checks = Vec::new();
        let mut reasons = Vec::new();

        // 4. Trade size vs portfolio percentage
        let trade_pct = self.config_decimal("portfolio_trade_pct", dec!(5)).await?;
        let max_trade = portfolio_value * trade_pct / dec!(100);
        let ok = size_usd <= max_trade;
        checks.push(("max_trade_size", ok));
        if !ok {
            reasons.push(format!(
                "Trade size ${size_usd:.2} > max ${max_trade:.2} ({trade_pct}%)"
            ));
        }

        // 5. Absolute per-market cap
        let max_market = self.config_decimal("max_market_usd", dec!(100)).await?;
        let ok = size_usd <= max_market;
        checks.push(("max_market_exposure", ok));
        if !ok {
            reasons.push(format!(
                "Trade size ${size_usd:.2} > max market ${max_market:.2}"
            ));
        }

        // 6. Correlation basket across all configured assets
        let basket_pct = self
            .config_decimal("correlation_max_basket_pct", dec!(35))
            .await?;
        let basket = self.total_basket_exposure().await?;
        let new_total = basket + size_usd;
        let max_basket = portfolio_value * basket_pct / dec!(100);
        let ok = new_total <= max_basket;
        checks.push(("correlation_limit", ok));
        if !ok {
            reasons.push(format!(
                "Crypto exposure ${new_total:.2} > max ${max_basket:.2}"
            ));
        }

        // 7. Open position count
        let max_positions = self.config_i64("max_open_positions", 5).await?;
        let open = self.store.open_position_count().await?;
        let ok = open < max_positions;
        checks.push(("max_positions", ok));
        if !ok {
            reasons.push(format!("Open positions {open} >= max {max_positions}"));
        }

        let passed = checks.iter().all(|(_, ok)| *ok);
        Ok(RiskVerdict {
            passed,
            checks,
            reasons,
        })
    }

    /// Aggregate exposure across all configured assets.
    pub async fn total_basket_exposure(&self) -> Result<Decimal, StoreError> {
        let mut total = Decimal::ZERO;
        for asset in &self.assets {
            total += self.store.asset_exposure(asset).await?;
        }
        Ok(total)
    }

    /// Persist and audit a state transition (not gate-serialised; callers
    /// inside the critical section use this directly).
    async fn transition(
        &self,
        state: RunState,
        reason: &str,
        actor: &str,
    ) -> Result<(), StoreError> {
        self.store
            .set_bot_state(state, reason, actor, self.clock.now())
            .await?;
        info!("Bot state -> {} ({})", state, reason);
        Ok(())
    }

    /// Gate-serialised state transition for callers outside the critical
    /// section.
    pub async fn set_state(
        &self,
        state: RunState,
        reason: &str,
        actor: &str,
    ) -> Result<(), StoreError> {
        let _guard = self.order_gate.lock().await;
        self.transition(state, reason, actor).await
    }

    /// Start trading; refuses while any breaker is tripped.
    pub async fn start(&self, actor: &str) -> Result<(), RiskError> {
        let tripped = self.store.tripped_breakers().await?;
        if !tripped.is_empty() {
            return Err(RiskError::BreakersTripped(tripped.join(", ")));
        }
        self.set_state(RunState::Running, "start requested", actor)
            .await?;
        Ok(())
    }

    pub async fn pause(&self, actor: &str) -> Result<(), StoreError> {
        self.set_state(RunState::Paused, "pause requested", actor).await
    }

    /// Resume from pause; like start, refuses while breakers are tripped.
    pub async fn resume(&self, actor: &str) -> Result<(), RiskError> {
        let tripped = self.store.tripped_breakers().await?;
        if !tripped.is_empty() {
            return Err(RiskError::BreakersTripped(tripped.join(", ")));
        }
        self.set_state(RunState::Running, "resume requested", actor)
            .await?;
        Ok(())
    }

    pub async fn stop(&self, actor: &str) -> Result<(), StoreError> {
        self.set_state(RunState::Stopped, "stop requested", actor).await
    }

    /// Trip a named breaker; halting breakers force the bot into
    /// HALTED_CIRCUIT_BREAKER.
    pub async fn trip_breaker(&self, name: &str, reason: &str) -> Result<(), StoreError> {
        self.store
            .trip_breaker(name, reason, self.clock.now())
            .await?;
        warn!("Circuit breaker tripped: {} ({})", name, reason);

        if breakers::HALTING.contains(&name) {
            self.set_state(
                RunState::HaltedCircuitBreaker,
                &format!("Circuit breaker: {name}"),
                "system",
            )
            .await?;
        }
        Ok(())
    }

    /// Explicit, audited breaker reset.
    pub async fn reset_breaker(&self, name: &str) -> Result<(), StoreError> {
        self.store.reset_breaker(name, self.clock.now()).await?;
        info!("Circuit breaker reset: {}", name);
        Ok(())
    }

    /// Exit evaluation with config-backed thresholds.
    pub async fn evaluate_exit(
        &self,
        entry: Decimal,
        current: Decimal,
        side: PositionSide,
    ) -> Result<Option<ExitReason>, StoreError> {
        let tp = self.config_decimal("take_profit_pct", dec!(8)).await?;
        let sl = self.config_decimal("stop_loss_pct", dec!(5)).await?;
        Ok(should_exit(entry, current, side, tp, sl))
    }

    /// Snapshot per-asset exposure, basket ratio and daily loss.
    pub async fn record_risk_metrics(&self, portfolio_value: Decimal) -> Result<(), StoreError> {
        let mut exposures = BTreeMap::new();
        let mut total = Decimal::ZERO;
        for asset in &self.assets {
            let exposure = self.store.asset_exposure(asset).await?;
            total += exposure;
            exposures.insert(asset.clone(), exposure.to_f64().unwrap_or(0.0));
        }

        let correlation_risk = if portfolio_value > Decimal::ZERO {
            total / portfolio_value
        } else {
            Decimal::ZERO
        };

        let record = RiskMetricsRecord {
            total_exposure: total,
            asset_exposure: serde_json::to_value(&exposures).unwrap_or_else(|_| json!({})),
            correlation_risk,
            daily_loss: self.daily_loss().await?,
            portfolio_value,
        };
        self.store
            .insert_risk_metrics(&record, self.clock.now())
            .await
    }
}

fn decimal_value(value: &serde_json::Value) -> Option<Decimal> {
    match value {
        serde_json::Value::Number(n) => n
            .as_f64()
            .and_then(|f| Decimal::try_from(f).ok())
            .or_else(|| n.as_i64().map(Decimal::from)),
        serde_json::Value::String(s) => s.parse().ok(),
        _ => None,
    }
}
