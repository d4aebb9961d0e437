//! Signal generation from recent 15-minute candles.
//!
//! Feature math runs in f64; only the persisted confidence goes back
//! through Decimal. Every evaluation writes a decision row, traded or not.

use std::collections::BTreeMap;
use std::sync::Arc;

use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use tracing::{debug, info, warn};

use common::models::{Direction, NewDecision};
use common::{Clock, StateStore, StoreError};

/// Candles required before a signal is attempted.
pub const LOOKBACK: usize = 20;

const MOMENTUM_PERIODS: [usize; 3] = [3, 5, 10];
const MA_PERIODS: [usize; 3] = [5, 10, 20];
const RSI_PERIOD: usize = 14;
const VOLATILITY_PERIOD: usize = 14;
const ZSCORE_PERIOD: usize = 20;
const TREND_PERIOD: usize = 10;
const CANDLE_FETCH_LIMIT: i64 = 50;

/// Momentum must clear 0.5% to count as a directional vote.
const MOMENTUM_THRESHOLD: f64 = 0.005;
/// Net score past this threshold turns into a direction.
const SIGNAL_THRESHOLD: f64 = 0.3;
const CONFIDENCE_CAP: f64 = 0.95;

/// Outcome of one asset analysis, with its persisted decision id.
#[derive(Debug, Clone)]
pub struct Analysis {
    pub asset: String,
    pub direction: Direction,
    pub confidence: f64,
    pub decision_id: i64,
    pub features: BTreeMap<String, f64>,
    pub last_close: Option<f64>,
}

/// Maps a window of candles to a direction and confidence.
pub struct SignalGenerator {
    store: Arc<dyn StateStore>,
    clock: Arc<dyn Clock>,
}

impl SignalGenerator {
    pub fn new(store: Arc<dyn StateStore>, clock: Arc<dyn Clock>) -> Self {
        Self { store, clock }
    }

    /// Analyze an asset and persist the resulting decision.
    pub async fn analyze(
        &self,
        asset: &str,
        market_id: Option<i64>,
    ) -> Result<Analysis, StoreError> {
        let candles = self.store.recent_candles(asset, CANDLE_FETCH_LIMIT).await?;

        if candles.len() < LOOKBACK {
            warn!(
                "Insufficient candle data for {}: {} of {} candles",
                asset,
                candles.len(),
                LOOKBACK
            );
            let decision_id = self
                .persist(asset, market_id, Direction::Neutral, 0.0, &BTreeMap::new())
                .await?;
            return Ok(Analysis {
                asset: asset.to_string(),
                direction: Direction::Neutral,
                confidence: 0.0,
                decision_id,
                features: BTreeMap::new(),
                last_close: None,
            });
        }

        let closes: Vec<f64> = candles.iter().map(|c| c.close.to_f64().unwrap_or(0.0)).collect();
        let highs: Vec<f64> = candles.iter().map(|c| c.high.to_f64().unwrap_or(0.0)).collect();
        let lows: Vec<f64> = candles.iter().map(|c| c.low.to_f64().unwrap_or(0.0)).collect();
        let volumes: Vec<f64> = candles.iter().map(|c| c.volume.to_f64().unwrap_or(0.0)).collect();

        let features = compute_features(&closes, &highs, &lows, &volumes);
        let (direction, confidence) = score(&features);

        let decision_id = self
            .persist(asset, market_id, direction, confidence, &features)
            .await?;

        info!(
            "Signal for {}: {} (confidence {:.2})",
            asset, direction, confidence
        );

        Ok(Analysis {
            asset: asset.to_string(),
            direction,
            confidence,
            decision_id,
            features,
            last_close: closes.last().copied(),
        })
    }

    async fn persist(
        &self,
        asset: &str,
        market_id: Option<i64>,
        direction: Direction,
        confidence: f64,
        features: &BTreeMap<String, f64>,
    ) -> Result<i64, StoreError> {
        let decision = NewDecision {
            asset: asset.to_string(),
            market_id,
            direction,
            confidence: Decimal::try_from(confidence).unwrap_or(Decimal::ZERO),
            features: serde_json::to_value(features).unwrap_or_else(|_| serde_json::json!({})),
            signal_source: "technical".to_string(),
        };
        self.store.insert_decision(&decision, self.clock.now()).await
    }
}

/// Compute the full technical feature map over the candle window.
pub fn compute_features(
    closes: &[f64],
    highs: &[f64],
    lows: &[f64],
    volumes: &[f64],
) -> BTreeMap<String, f64> {
    let mut features = BTreeMap::new();
    let n = closes.len();

    // One-step returns
    let returns: Vec<f64> = closes
        .windows(2)
        .map(|w| if w[0] != 0.0 { (w[1] - w[0]) / w[0] } else { 0.0 })
        .collect();

    features.insert(
        "return_1".to_string(),
        returns.last().copied().unwrap_or(0.0),
    );
    for k in [3usize, 5] {
        let value = if returns.len() >= k {
            returns[returns.len() - k..].iter().sum()
        } else {
            0.0
        };
        features.insert(format!("return_{k}"), value);
    }

    // Momentum over p steps
    for p in MOMENTUM_PERIODS {
        if n > p {
            let base = closes[n - p - 1];
            if base != 0.0 {
                features.insert(format!("momentum_{p}"), (closes[n - 1] - base) / base);
            }
        }
    }

    // Moving averages and price-vs-MA
    for p in MA_PERIODS {
        if n >= p {
            let ma = mean(&closes[n - p..]);
            features.insert(format!("ma_{p}"), ma);
            if ma != 0.0 {
                features.insert(format!("price_vs_ma_{p}"), (closes[n - 1] - ma) / ma);
            }
        }
    }

    // MA crossovers
    if let (Some(ma_5), Some(ma_10)) = (features.get("ma_5"), features.get("ma_10")) {
        let cross = if ma_5 > ma_10 { 1.0 } else { -1.0 };
        features.insert("ma_5_10_cross".to_string(), cross);
    }
    if let (Some(ma_5), Some(ma_20)) = (features.get("ma_5"), features.get("ma_20")) {
        let cross = if ma_5 > ma_20 { 1.0 } else { -1.0 };
        features.insert("ma_5_20_cross".to_string(), cross);
    }

    features.insert("rsi".to_string(), rsi(closes, RSI_PERIOD));

    if returns.len() >= VOLATILITY_PERIOD {
        features.insert(
            "volatility".to_string(),
            stdev(&returns[returns.len() - VOLATILITY_PERIOD..]),
        );
    }

    if n >= ZSCORE_PERIOD {
        let window = &closes[n - ZSCORE_PERIOD..];
        let mu = mean(window);
        let sigma = stdev(window);
        if sigma > 0.0 {
            features.insert("zscore".to_string(), (closes[n - 1] - mu) / sigma);
        }
    }

    // Position of the close inside the recent high-low range
    if n >= LOOKBACK {
        let recent_high = highs[n - LOOKBACK..].iter().cloned().fold(f64::MIN, f64::max);
        let recent_low = lows[n - LOOKBACK..].iter().cloned().fold(f64::MAX, f64::min);
        if recent_high > recent_low {
            features.insert(
                "range_position".to_string(),
                (closes[n - 1] - recent_low) / (recent_high - recent_low),
            );
        }
    }

    if volumes.len() >= 10 {
        let avg_volume = mean(&volumes[volumes.len() - 10..]);
        if avg_volume > 0.0 {
            features.insert(
                "volume_ratio".to_string(),
                volumes[volumes.len() - 1] / avg_volume,
            );
        }
    }

    if n >= TREND_PERIOD {
        let window = &closes[n - TREND_PERIOD..];
        let base = window[0];
        if base != 0.0 {
            features.insert("trend_slope".to_string(), linreg_slope(window) / base);
        }
    }

    features
}

/// Wilder-style RSI over simple means of gains and losses.
///
/// Returns 50 when under-windowed and 100 when there are no losses.
pub fn rsi(closes: &[f64], period: usize) -> f64 {
    if closes.len() < period + 1 {
        return 50.0;
    }

    let deltas: Vec<f64> = closes.windows(2).map(|w| w[1] - w[0]).collect();
    let window = &deltas[deltas.len() - period..];

    let avg_gain = window.iter().filter(|d| **d > 0.0).sum::<f64>() / period as f64;
    let avg_loss = -window.iter().filter(|d| **d < 0.0).sum::<f64>() / period as f64;

    if avg_loss == 0.0 {
        return 100.0;
    }

    let rs = avg_gain / avg_loss;
    100.0 - (100.0 / (1.0 + rs))
}

/// Fixed-weight vote over the feature map.
pub fn score(features: &BTreeMap<String, f64>) -> (Direction, f64) {
    let mut bullish = 0.0;
    let mut bearish = 0.0;
    let mut total_weight = 0.0;

    let momentum_weight = 2.0;
    for p in MOMENTUM_PERIODS {
        if let Some(momentum) = features.get(&format!("momentum_{p}")) {
            total_weight += momentum_weight;
            if *momentum > MOMENTUM_THRESHOLD {
                bullish += momentum_weight;
            } else if *momentum < -MOMENTUM_THRESHOLD {
                bearish += momentum_weight;
            }
        }
    }

    let ma_weight = 1.5;
    for key in ["ma_5_10_cross", "ma_5_20_cross"] {
        if let Some(cross) = features.get(key) {
            total_weight += ma_weight;
            if *cross > 0.0 {
                bullish += ma_weight;
            } else {
                bearish += ma_weight;
            }
        }
    }

    let rsi_weight = 1.5;
    if let Some(rsi) = features.get("rsi") {
        total_weight += rsi_weight;
        if *rsi < 30.0 {
            bullish += rsi_weight;
        } else if *rsi > 70.0 {
            bearish += rsi_weight;
        }
    }

    let zscore_weight = 1.0;
    if let Some(zscore) = features.get("zscore") {
        total_weight += zscore_weight;
        if *zscore < -1.5 {
            bullish += zscore_weight;
        } else if *zscore > 1.5 {
            bearish += zscore_weight;
        }
    }

    let trend_weight = 2.0;
    if let Some(slope) = features.get("trend_slope") {
        total_weight += trend_weight;
        if *slope > 0.0 {
            bullish += trend_weight;
        } else if *slope < 0.0 {
            bearish += trend_weight;
        }
    }

    if total_weight == 0.0 {
        return (Direction::Neutral, 0.0);
    }

    let net = (bullish - bearish) / total_weight;
    debug!(
        "Score: bullish={:.1} bearish={:.1} net={:.3}",
        bullish, bearish, net
    );

    if net > SIGNAL_THRESHOLD {
        (Direction::Up, net.abs().min(CONFIDENCE_CAP))
    } else if net < -SIGNAL_THRESHOLD {
        (Direction::Down, net.abs().min(CONFIDENCE_CAP))
    } else {
        (Direction::Neutral, 0.0)
    }
}

fn mean(values: &[f64]) -> f64 {
    if values.is_empty() {
        return 0.0;
    }
    values.iter().sum::<f64>() / values.len() as f64
}

/// Population standard deviation.
fn stdev(values: &[f64]) -> f64 {
    if values.is_empty() {
        return 0.0;
    }
    let mu = mean(values);
    let variance = values.iter().map(|v| (v - mu).powi(2)).sum::<f64>() / values.len() as f64;
    variance.sqrt()
}

/// Least-squares slope of y over x = 0..len.
fn linreg_slope(y: &[f64]) -> f64 {
    let n = y.len();
    if n < 2 {
        return 0.0;
    }
    let x_mean = (n - 1) as f64 / 2.0;
    let y_mean = mean(y);

    let mut num = 0.0;
    let mut den = 0.0;
    for (i, value) in y.iter().enumerate() {
        let dx = i as f64 - x_mean;
        num += dx * (value - y_mean);
        den += dx * dx;
    }
    if den == 0.0 {
        0.0
    } else {
        num / den
    }
}
