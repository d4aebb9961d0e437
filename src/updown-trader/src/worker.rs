//! Trading worker: the timed loop that wires the pipeline together.
//!
//! Each cycle: market discovery refresh, one pass over the assets
//! (staleness gate, signal, liquidity, risk, order), then the exit pass
//! over open positions and a risk metrics snapshot. The risk pass and the
//! pending order insert share one critical section under the risk gate;
//! the venue POST happens after the lock is dropped.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration as StdDuration;

use anyhow::{anyhow, Result};
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use tokio::sync::watch;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

use common::models::{breakers, Direction, OrderSide, Position, PositionSide};
use common::{Clock, StateStore, StoreError};

use crate::discovery::MarketDiscoverer;
use crate::execution::{marketable_price, ExecutionModule, OrderRequest, PlacementStatus};
use crate::ingest::PriceIngester;
use crate::positions::PositionManager;
use crate::risk::{RiskError, RiskGate};
use crate::signal::SignalGenerator;

/// Per-asset analysis throttle inside the 60-second loop.
const ANALYSIS_INTERVAL_SECS: i64 = 300;

/// Signals below this confidence are recorded but not traded.
const MIN_TRADE_CONFIDENCE: f64 = 0.5;

const MARKETABLE_LIMIT: &str = "marketable_limit";

pub struct TradingWorker {
    ingester: Arc<PriceIngester>,
    discoverer: MarketDiscoverer,
    signal: SignalGenerator,
    risk: RiskGate,
    execution: ExecutionModule,
    positions: PositionManager,
    store: Arc<dyn StateStore>,
    clock: Arc<dyn Clock>,
    assets: Vec<String>,
    loop_interval: StdDuration,
    last_analysis: Mutex<HashMap<String, DateTime<Utc>>>,
}

impl TradingWorker {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        ingester: Arc<PriceIngester>,
        discoverer: MarketDiscoverer,
        signal: SignalGenerator,
        risk: RiskGate,
        execution: ExecutionModule,
        positions: PositionManager,
        store: Arc<dyn StateStore>,
        clock: Arc<dyn Clock>,
        assets: Vec<String>,
        loop_interval: StdDuration,
    ) -> Self {
        Self {
            ingester,
            discoverer,
            signal,
            risk,
            execution,
            positions,
            store,
            clock,
            assets,
            loop_interval,
            last_analysis: Mutex::new(HashMap::new()),
        }
    }

    /// Run until the shutdown flag flips, then cancel all live orders.
    ///
    /// The in-flight cycle finishes before cancellation; cancel responses
    /// are awaited so local order state reflects reality on exit.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = tokio::time::interval(self.loop_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    if let Err(e) = self.cycle().await {
                        error!("Trading cycle failed: {e:#}");
                    }
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        break;
                    }
                }
            }
        }

        self.shutdown().await;
    }

    /// Flush on the way out: cancel everything still live.
    pub async fn shutdown(&self) {
        info!("Shutdown requested, cancelling live orders");
        match self.execution.cancel_all().await {
            Ok(count) => info!("Cancelled {} orders on shutdown", count),
            Err(e) => error!("Cancel-all on shutdown failed: {e}"),
        }
    }

    /// Start trading; fails while any breaker is tripped.
    pub async fn start_bot(&self, actor: &str) -> std::result::Result<(), RiskError> {
        self.risk.start(actor).await
    }

    /// Reconcile local live orders against the venue; a mismatch trips the
    /// breaker and leaves the bot halted until an operator resets it.
    pub async fn reconcile_startup(&self) -> Result<()> {
        let report = self.execution.reconcile().await?;
        if !report.mismatches.is_empty() {
            warn!(
                "Reconciliation found {} mismatches",
                report.mismatches.len()
            );
            self.risk
                .trip_breaker(
                    breakers::RECONCILIATION_MISMATCH,
                    &report.mismatches.join("; "),
                )
                .await?;
        } else {
            debug!("Reconciliation clean ({} orders checked)", report.checked);
        }
        Ok(())
    }

    /// One trading cycle.
    pub async fn cycle(&self) -> Result<()> {
        let (allowed, reason) = self.risk.can_trade().await?;
        if !allowed {
            debug!("Trading disabled: {}", reason);
            return Ok(());
        }

        if let Err(e) = self.discoverer.discover().await {
            warn!("Market discovery failed: {e}");
        }

        for asset in self.assets.clone() {
            if let Err(e) = self.process_asset(&asset).await {
                error!("Error processing {}: {e:#}", asset);
            }
        }

        self.check_position_exits().await;

        let portfolio_value = self.portfolio_value().await?;
        if let Err(e) = self.risk.record_risk_metrics(portfolio_value).await {
            warn!("Failed to record risk metrics: {e}");
        }

        Ok(())
    }

    async fn portfolio_value(&self) -> std::result::Result<Decimal, StoreError> {
        self.risk.config_decimal("portfolio_size_usd", dec!(500)).await
    }

    fn analysis_due(&self, asset: &str) -> bool {
        let last_analysis = self.last_analysis.lock().unwrap();
        match last_analysis.get(asset) {
            None => true,
            Some(at) => (self.clock.now() - *at).num_seconds() >= ANALYSIS_INTERVAL_SECS,
        }
    }

    fn mark_analyzed(&self, asset: &str) {
        self.last_analysis
            .lock()
            .unwrap()
            .insert(asset.to_string(), self.clock.now());
    }

    async fn process_asset(&self, asset: &str) -> Result<()> {
        if !self.analysis_due(asset) {
            return Ok(());
        }

        let stale_threshold = self
            .risk
            .config_i64("stale_data_threshold_seconds", 60)
            .await?;
        if self.ingester.is_stale(asset, stale_threshold) {
            self.risk
                .trip_breaker(
                    breakers::STALE_DATA,
                    &format!("Stale price data for {asset}"),
                )
                .await?;
            return Ok(());
        }

        let buffer = self
            .risk
            .config_i64("market_close_buffer_minutes", 2)
            .await?;
        let market = self.discoverer.tradable_market(asset, buffer).await?;

        let analysis = self
            .signal
            .analyze(asset, market.as_ref().map(|m| m.id))
            .await?;
        self.mark_analyzed(asset);

        if analysis.direction == Direction::Neutral
            || analysis.confidence < MIN_TRADE_CONFIDENCE
        {
            debug!(
                "No trade signal for {} ({} @ {:.2})",
                asset, analysis.direction, analysis.confidence
            );
            return Ok(());
        }

        let Some(market) = market else {
            debug!("No tradable market for {}", asset);
            return Ok(());
        };

        let (token_id, token_side) = match analysis.direction {
            Direction::Up => (market.yes_token_id.clone(), PositionSide::Yes),
            Direction::Down => (market.no_token_id.clone(), PositionSide::No),
            Direction::Neutral => return Ok(()),
        };
        let Some(token_id) = token_id else {
            warn!(
                "Market {} has no token for direction {}",
                market.condition_id, analysis.direction
            );
            return Ok(());
        };

        let Some(book) = self.discoverer.orderbook(&token_id).await else {
            debug!("No orderbook for {}, skipping this cycle", asset);
            return Ok(());
        };

        let min_liquidity = self.risk.config_decimal("min_liquidity_usd", dec!(500)).await?;
        if book.total_depth() < min_liquidity {
            debug!(
                "Insufficient liquidity for {}: {} < {}",
                asset,
                book.total_depth(),
                min_liquidity
            );
            return Ok(());
        }
        self.discoverer.snapshot(market.id, &book).await?;

        let price = match marketable_price(&book, OrderSide::Buy, self.execution.slippage_bps()) {
            Ok(price) => price,
            Err(e) => {
                debug!("No marketable price for {}: {}", asset, e);
                return Ok(());
            }
        };

        let portfolio_value = self.portfolio_value().await?;
        let size_usd = self.position_size(analysis.confidence, portfolio_value).await?;
        // Order size is shares; exposure tracking multiplies back by entry.
        let shares = (size_usd / price).round_dp(2);

        info!(
            "Placing trade: {} {} conf {:.2}, ${} ({} shares) on {} token",
            asset, analysis.direction, analysis.confidence, size_usd, shares, token_side
        );

        // Pass-then-insert critical section: risk reads and the pending
        // order insert see the same serialized view of state.
        let staged = {
            let _gate = self.risk.order_gate().await;

            let (allowed, reason) = self.risk.can_trade().await?;
            if !allowed {
                debug!("Trading disabled before order: {}", reason);
                return Ok(());
            }

            let verdict = self
                .risk
                .check_order(asset, size_usd, portfolio_value)
                .await?;
            self.store
                .set_decision_risk_checks(analysis.decision_id, verdict.to_json())
                .await?;
            if !verdict.passed {
                info!(
                    "Risk check failed for {}: {}",
                    asset,
                    verdict.reason().unwrap_or("unknown")
                );
                return Ok(());
            }

            self.execution
                .stage_order(OrderRequest {
                    token_id: token_id.clone(),
                    side: OrderSide::Buy,
                    price,
                    size: shares,
                    market_id: market.id,
                    decision_id: Some(analysis.decision_id),
                    order_type: MARKETABLE_LIMIT.to_string(),
                })
                .await?
        };

        let placement = self.execution.submit(staged).await?;
        match placement.status {
            PlacementStatus::Open | PlacementStatus::Simulated => {
                self.store
                    .mark_decision_executed(analysis.decision_id, &placement.local_id)
                    .await?;
                info!(
                    "Order {} placed for {} ({:?})",
                    placement.local_id, asset, placement.status
                );

                // Marketable limits are expected to fill immediately; with
                // no user-event feed the fill is synthesized from the order
                // transition.
                if placement.status == PlacementStatus::Open {
                    self.settle_placement(&placement, token_side, Some(asset)).await?;
                }
            }
            PlacementStatus::Rejected | PlacementStatus::Error => {
                warn!(
                    "Order failed for {}: {}",
                    asset,
                    placement.error.as_deref().unwrap_or("unknown")
                );
            }
        }

        Ok(())
    }

    /// Synthesize the fill for an accepted marketable order and aggregate
    /// it into positions.
    async fn settle_placement(
        &self,
        placement: &crate::execution::Placement,
        side: PositionSide,
        asset: Option<&str>,
    ) -> Result<()> {
        let order = self
            .store
            .order_by_local_id(&placement.local_id)
            .await?
            .ok_or_else(|| anyhow!("order {} vanished after submit", placement.local_id))?;

        let fill = self
            .execution
            .record_fill(&order, placement.price, placement.size, asset)
            .await?;
        self.positions.apply_fill(&fill, side).await?;
        Ok(())
    }

    /// Confidence-scaled position size in USD: 50%-100% of the base
    /// per-trade allocation, capped by the per-market limit.
    async fn position_size(
        &self,
        confidence: f64,
        portfolio_value: Decimal,
    ) -> std::result::Result<Decimal, StoreError> {
        let base_pct = self.risk.config_decimal("portfolio_trade_pct", dec!(5)).await?;
        let max_market = self.risk.config_decimal("max_market_usd", dec!(100)).await?;

        let factor = Decimal::try_from(0.5 + confidence * 0.5).unwrap_or(Decimal::ONE);
        let size = portfolio_value * base_pct / dec!(100) * factor;
        Ok(size.min(max_market).round_dp(2))
    }

    /// Evaluate every open position for take-profit / stop-loss.
    async fn check_position_exits(&self) {
        let positions = match self.positions.open_positions().await {
            Ok(positions) => positions,
            Err(e) => {
                error!("Failed to load open positions: {e}");
                return;
            }
        };

        for position in positions {
            if let Err(e) = self.check_exit(&position).await {
                error!("Error checking exit for position {}: {e:#}", position.id);
            }
        }
    }

    async fn check_exit(&self, position: &Position) -> Result<()> {
        // Missing book data skips the position this cycle; no forced exit.
        let Some(book) = self.discoverer.orderbook(&position.token_id).await else {
            return Ok(());
        };
        let Some(mid) = book.mid() else {
            return Ok(());
        };

        self.positions.mark_price(position, mid).await?;

        let Some(reason) = self
            .risk
            .evaluate_exit(position.avg_entry_price, mid, position.side)
            .await?
        else {
            return Ok(());
        };

        info!(
            "Exiting position {} ({}): entry {} current {}",
            position.id,
            reason.as_str(),
            position.avg_entry_price,
            mid
        );

        let price = match marketable_price(&book, OrderSide::Sell, self.execution.slippage_bps()) {
            Ok(price) => price,
            Err(e) => {
                debug!("No exit price for position {}: {}", position.id, e);
                return Ok(());
            }
        };

        let placement = self
            .execution
            .place_limit_order(OrderRequest {
                token_id: position.token_id.clone(),
                side: OrderSide::Sell,
                price,
                size: position.size,
                market_id: position.market_id,
                decision_id: None,
                order_type: MARKETABLE_LIMIT.to_string(),
            })
            .await?;

        if placement.status == PlacementStatus::Open {
            self.settle_placement(&placement, position.side, None).await?;
        }

        Ok(())
    }
}
