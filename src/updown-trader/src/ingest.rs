//! Price ingestion: spot polling, candle refresh, freshness tracking.
//!
//! One ticker polls the spot endpoint per asset every five seconds and
//! piggy-backs a per-symbol 15-minute candle refresh every five minutes.
//! Network failures are logged and never propagated; consumers observe
//! staleness through `is_stale`.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration as StdDuration;

use chrono::{DateTime, Duration, Utc};
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

use common::coinbase::CandleData;
use common::models::Candle;
use common::{Clock, Config, PriceSource, StateStore, StoreError};

const SPOT_POLL_SECS: u64 = 5;
const CANDLE_REFRESH_SECS: i64 = 300;
const TIMEFRAME: &str = "15m";
const TIMEFRAME_MINUTES: i64 = 15;

/// Latest spot price as held in the volatile cache.
#[derive(Debug, Clone, Copy)]
pub struct CachedPrice {
    pub price: Decimal,
    pub timestamp: DateTime<Utc>,
}

/// Keeps a fresh view of spot prices and recent candles per asset.
///
/// The ingester is the only writer of the latest-price cache; other
/// components read it through the typed accessors.
pub struct PriceIngester {
    source: Arc<dyn PriceSource>,
    store: Arc<dyn StateStore>,
    clock: Arc<dyn Clock>,
    assets: Vec<String>,
    cache: RwLock<HashMap<String, CachedPrice>>,
    last_candle_fetch: Mutex<HashMap<String, DateTime<Utc>>>,
}

impl PriceIngester {
    pub fn new(
        source: Arc<dyn PriceSource>,
        store: Arc<dyn StateStore>,
        clock: Arc<dyn Clock>,
        assets: Vec<String>,
    ) -> Self {
        Self {
            source,
            store,
            clock,
            assets,
            cache: RwLock::new(HashMap::new()),
            last_candle_fetch: Mutex::new(HashMap::new()),
        }
    }

    /// Latest cached price for a symbol.
    pub fn latest_price(&self, symbol: &str) -> Option<CachedPrice> {
        self.cache.read().unwrap().get(symbol).copied()
    }

    /// True when there is no cached price or its age exceeds the threshold.
    pub fn is_stale(&self, symbol: &str, threshold_seconds: i64) -> bool {
        match self.latest_price(symbol) {
            None => true,
            Some(cached) => {
                let age = (self.clock.now() - cached.timestamp).num_seconds();
                age > threshold_seconds
            }
        }
    }

    /// Recent candles for a symbol in ascending open_time order.
    pub async fn candles(&self, symbol: &str, limit: i64) -> Result<Vec<Candle>, StoreError> {
        self.store.recent_candles(symbol, limit).await
    }

    /// Close-to-close change between the two most recent candles, percent.
    pub async fn change_pct_15m(&self, symbol: &str) -> Result<Option<f64>, StoreError> {
        let candles = self.store.recent_candles(symbol, 2).await?;
        if candles.len() < 2 {
            return Ok(None);
        }

        let previous = candles[0].close;
        let current = candles[1].close;
        if previous <= Decimal::ZERO {
            return Ok(None);
        }

        let change = (current - previous) / previous * Decimal::ONE_HUNDRED;
        Ok(change.to_f64())
    }

    pub(crate) fn record_price(&self, symbol: &str, price: Decimal) {
        let cached = CachedPrice {
            price,
            timestamp: self.clock.now(),
        };
        self.cache.write().unwrap().insert(symbol.to_string(), cached);
    }

    async fn poll_once(&self) {
        for asset in self.assets.clone() {
            let pair = Config::spot_pair(&asset);

            match self.source.spot_price(&pair).await {
                Ok(price) => {
                    self.record_price(&asset, price);
                    if let Err(e) = self
                        .store
                        .insert_spot_price(&asset, price, self.clock.now())
                        .await
                    {
                        error!("Failed to store spot price for {}: {}", asset, e);
                    }
                }
                Err(e) => warn!("Failed to fetch spot price for {}: {}", pair, e),
            }

            if self.candle_refresh_due(&asset) {
                self.refresh_candles(&asset, &pair).await;
            }
        }
    }

    fn candle_refresh_due(&self, symbol: &str) -> bool {
        let last_fetch = self.last_candle_fetch.lock().unwrap();
        match last_fetch.get(symbol) {
            None => true,
            Some(at) => (self.clock.now() - *at).num_seconds() >= CANDLE_REFRESH_SECS,
        }
    }

    /// Fetch and upsert the 15-minute candle series for one symbol.
    pub async fn refresh_candles(&self, symbol: &str, pair: &str) {
        match self.source.candles_15m(pair).await {
            Ok(rows) => {
                let count = rows.len();
                for raw in &rows {
                    let candle = normalize_candle(symbol, raw);
                    if let Err(e) = self.store.upsert_candle(&candle).await {
                        error!("Failed to store candle for {}: {}", symbol, e);
                    }
                }
                debug!("Refreshed {} candles for {}", count, symbol);
            }
            Err(e) => warn!("Failed to fetch candles for {}: {}", pair, e),
        }

        self.last_candle_fetch
            .lock()
            .unwrap()
            .insert(symbol.to_string(), self.clock.now());
    }

    /// Initial candle backfill for all assets.
    pub async fn backfill(&self) {
        for asset in self.assets.clone() {
            let pair = Config::spot_pair(&asset);
            self.refresh_candles(&asset, &pair).await;
        }
    }

    /// Run the polling loop until the shutdown flag flips.
    pub fn spawn(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(StdDuration::from_secs(SPOT_POLL_SECS));
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

            loop {
                tokio::select! {
                    _ = ticker.tick() => self.poll_once().await,
                    _ = shutdown.changed() => {
                        if *shutdown.borrow() {
                            break;
                        }
                    }
                }
            }
            info!("Price ingester stopped");
        })
    }
}

/// Build a storable candle, widening high/low so the OHLC invariant holds
/// after ingestion even when the source serves a still-forming bar.
fn normalize_candle(symbol: &str, data: &CandleData) -> Candle {
    let high = data.high.max(data.open).max(data.close);
    let low = data.low.min(data.open).min(data.close);

    Candle {
        symbol: symbol.to_string(),
        timeframe: TIMEFRAME.to_string(),
        open_time: data.open_time,
        close_time: data.open_time + Duration::minutes(TIMEFRAME_MINUTES),
        open: data.open,
        high,
        low,
        close: data.close,
        volume: data.volume,
    }
}
