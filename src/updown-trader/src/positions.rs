//! Position aggregation, exits accounting and daily PnL.
//!
//! Fills aggregate into at most one open position per (market, token);
//! buys raise the size-weighted average entry, sells realize PnL against
//! it and feed the day's accounting row.

use std::sync::Arc;

use rust_decimal::Decimal;
use tracing::{debug, info, warn};

use common::models::{NewPosition, Position, PositionSide, PositionStatus};
use common::{Clock, StateStore, StoreError};

use crate::execution::Fill;

/// Aggregates fills into positions and maintains daily accounting.
pub struct PositionManager {
    store: Arc<dyn StateStore>,
    clock: Arc<dyn Clock>,
}

impl PositionManager {
    pub fn new(store: Arc<dyn StateStore>, clock: Arc<dyn Clock>) -> Self {
        Self { store, clock }
    }

    pub async fn open_positions(&self) -> Result<Vec<Position>, StoreError> {
        self.store.open_positions().await
    }

    /// Apply an executed fill to the open position for its (market, token).
    ///
    /// `side` names the outcome token held; it only matters when the fill
    /// opens a new position.
    pub async fn apply_fill(&self, fill: &Fill, side: PositionSide) -> Result<(), StoreError> {
        let size_change = match fill.side {
            common::models::OrderSide::Buy => fill.size,
            common::models::OrderSide::Sell => -fill.size,
        };

        let existing = self
            .store
            .open_position(fill.market_id, &fill.token_id)
            .await?;

        match existing {
            None => {
                if size_change <= Decimal::ZERO {
                    warn!(
                        "Sell fill for token {} with no open position, ignoring",
                        fill.token_id
                    );
                    return Ok(());
                }

                let position = NewPosition {
                    market_id: fill.market_id,
                    token_id: fill.token_id.clone(),
                    side,
                    size: size_change,
                    avg_entry_price: fill.price,
                };
                self.store.insert_position(&position, self.clock.now()).await?;
                info!(
                    "Opened {} position: {} @ {} on token {}",
                    side, size_change, fill.price, fill.token_id
                );
            }
            Some(mut position) => {
                if size_change > Decimal::ZERO {
                    let new_size = position.size + size_change;
                    let total_value =
                        position.size * position.avg_entry_price + size_change * fill.price;
                    position.avg_entry_price = total_value / new_size;
                    position.size = new_size;
                    self.store.save_position(&position).await?;
                    debug!(
                        "Added to position {}: size {} avg {}",
                        position.id, position.size, position.avg_entry_price
                    );
                } else {
                    self.reduce(&mut position, -size_change, fill.price, fill.fee)
                        .await?;
                }
            }
        }

        Ok(())
    }

    /// Reduce (and possibly close) a position, realizing PnL against the
    /// average entry and rolling it into the day's accounting.
    async fn reduce(
        &self,
        position: &mut Position,
        quantity: Decimal,
        price: Decimal,
        fee: Decimal,
    ) -> Result<(), StoreError> {
        let realized = (price - position.avg_entry_price) * quantity - fee;
        position.realized_pnl += realized;

        let new_size = position.size - quantity;
        if new_size <= Decimal::ZERO {
            position.size = Decimal::ZERO;
            position.status = PositionStatus::Closed;
            position.closed_at = Some(self.clock.now());
            info!(
                "Closed position {}: realized {:.4}",
                position.id, realized
            );
        } else {
            position.size = new_size;
            debug!(
                "Reduced position {} to {}: realized {:.4}",
                position.id, new_size, realized
            );
        }
        self.store.save_position(position).await?;

        let today = self.clock.now().date_naive();
        self.store
            .record_realized(today, realized, fee, realized > Decimal::ZERO)
            .await?;

        Ok(())
    }

    /// Refresh mark-to-mid on an open position.
    pub async fn mark_price(&self, position: &Position, mid: Decimal) -> Result<(), StoreError> {
        let mut updated = position.clone();
        updated.current_price = Some(mid);
        updated.unrealized_pnl = Some((mid - position.avg_entry_price) * position.size);
        self.store.save_position(&updated).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};
    use common::models::{DiscoveredMarket, OrderSide};
    use common::{ManualClock, MemStore};
    use rust_decimal_macros::dec;

    struct Fixture {
        store: Arc<MemStore>,
        manager: PositionManager,
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
                yes_token_id: Some("yes-tok".to_string()),
                no_token_id: Some("no-tok".to_string()),
            })
            .await
            .unwrap();
        let manager = PositionManager::new(store.clone(), clock);
        Fixture {
            store,
            manager,
            market_id,
        }
    }

    fn fill(market_id: i64, side: OrderSide, price: Decimal, size: Decimal, fee: Decimal) -> Fill {
        Fill {
            market_id,
            token_id: "yes-tok".to_string(),
            side,
            price,
            size,
            fee,
        }
    }

    #[tokio::test]
    async fn buy_fill_opens_a_position() {
        let f = fixture().await;
        f.manager
            .apply_fill(
                &fill(f.market_id, OrderSide::Buy, dec!(0.50), dec!(50), dec!(0.5)),
                PositionSide::Yes,
            )
            .await
            .unwrap();

        let position = f
            .store
            .open_position(f.market_id, "yes-tok")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(position.side, PositionSide::Yes);
        assert_eq!(position.size, dec!(50));
        assert_eq!(position.avg_entry_price, dec!(0.50));
        assert_eq!(position.realized_pnl, dec!(0));
    }

    #[tokio::test]
    async fn second_buy_averages_entry_price() {
        let f = fixture().await;
        f.manager
            .apply_fill(
                &fill(f.market_id, OrderSide::Buy, dec!(0.40), dec!(100), dec!(0)),
                PositionSide::Yes,
            )
            .await
            .unwrap();
        f.manager
            .apply_fill(
                &fill(f.market_id, OrderSide::Buy, dec!(0.60), dec!(100), dec!(0)),
                PositionSide::Yes,
            )
            .await
            .unwrap();

        let position = f
            .store
            .open_position(f.market_id, "yes-tok")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(position.size, dec!(200));
        assert_eq!(position.avg_entry_price, dec!(0.50));
        // Still a single open position for the (market, token) pair.
        assert_eq!(f.store.open_position_count().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn partial_sell_realizes_and_keeps_position_open() {
        let f = fixture().await;
        f.manager
            .apply_fill(
                &fill(f.market_id, OrderSide::Buy, dec!(0.50), dec!(50), dec!(0)),
                PositionSide::Yes,
            )
            .await
            .unwrap();
        f.manager
            .apply_fill(
                &fill(f.market_id, OrderSide::Sell, dec!(0.56), dec!(10), dec!(0.112)),
                PositionSide::Yes,
            )
            .await
            .unwrap();

        let position = f
            .store
            .open_position(f.market_id, "yes-tok")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(position.size, dec!(40));
        assert_eq!(position.status, PositionStatus::Open);
        // (0.56 - 0.50) x 10 - 0.112 = 0.488
        assert_eq!(position.realized_pnl, dec!(0.488));

        let daily = f
            .store
            .daily_pnl(Utc.with_ymd_and_hms(2025, 6, 1, 0, 0, 0).unwrap().date_naive())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(daily.realized_pnl, dec!(0.488));
        assert_eq!(daily.fees_paid, dec!(0.112));
        assert_eq!(daily.trade_count, 1);
        assert_eq!(daily.win_count, 1);
        assert_eq!(daily.loss_count, 0);
    }

    #[tokio::test]
    async fn full_sell_closes_the_position() {
        let f = fixture().await;
        f.manager
            .apply_fill(
                &fill(f.market_id, OrderSide::Buy, dec!(0.50), dec!(50), dec!(0)),
                PositionSide::Yes,
            )
            .await
            .unwrap();
        f.manager
            .apply_fill(
                &fill(f.market_id, OrderSide::Sell, dec!(0.44), dec!(50), dec!(0.44)),
                PositionSide::Yes,
            )
            .await
            .unwrap();

        assert!(f
            .store
            .open_position(f.market_id, "yes-tok")
            .await
            .unwrap()
            .is_none());

        let positions = f.store.all_positions();
        assert_eq!(positions.len(), 1);
        let closed = &positions[0];
        assert_eq!(closed.status, PositionStatus::Closed);
        assert_eq!(closed.size, dec!(0));
        assert!(closed.closed_at.is_some());
        // (0.44 - 0.50) x 50 - 0.44 = -3.44
        assert_eq!(closed.realized_pnl, dec!(-3.44));

        let daily = f
            .store
            .daily_pnl(Utc.with_ymd_and_hms(2025, 6, 1, 0, 0, 0).unwrap().date_naive())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(daily.loss_count, 1);
        assert_eq!(daily.win_count, 0);
    }

    #[tokio::test]
    async fn oversell_clamps_to_closed() {
        let f = fixture().await;
        f.manager
            .apply_fill(
                &fill(f.market_id, OrderSide::Buy, dec!(0.50), dec!(10), dec!(0)),
                PositionSide::Yes,
            )
            .await
            .unwrap();
        f.manager
            .apply_fill(
                &fill(f.market_id, OrderSide::Sell, dec!(0.55), dec!(15), dec!(0)),
                PositionSide::Yes,
            )
            .await
            .unwrap();

        let positions = f.store.all_positions();
        assert_eq!(positions[0].status, PositionStatus::Closed);
        assert_eq!(positions[0].size, dec!(0));
    }

    #[tokio::test]
    async fn sell_without_position_is_ignored() {
        let f = fixture().await;
        f.manager
            .apply_fill(
                &fill(f.market_id, OrderSide::Sell, dec!(0.55), dec!(10), dec!(0)),
                PositionSide::Yes,
            )
            .await
            .unwrap();

        assert!(f.store.all_positions().is_empty());
    }

    #[tokio::test]
    async fn mark_price_updates_unrealized() {
        let f = fixture().await;
        f.manager
            .apply_fill(
                &fill(f.market_id, OrderSide::Buy, dec!(0.50), dec!(100), dec!(0)),
                PositionSide::Yes,
            )
            .await
            .unwrap();

        let position = f
            .store
            .open_position(f.market_id, "yes-tok")
            .await
            .unwrap()
            .unwrap();
        f.manager.mark_price(&position, dec!(0.55)).await.unwrap();

        let marked = f
            .store
            .open_position(f.market_id, "yes-tok")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(marked.current_price, Some(dec!(0.55)));
        assert_eq!(marked.unrealized_pnl, Some(dec!(5.00)));
    }
}
