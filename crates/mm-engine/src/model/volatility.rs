//! Volatility regime classification.
//!
//! Classifies recent candle history into a discrete regime that scales
//! quoted spread (and gates quoting entirely when `Volatile`). The
//! metrics are range-based: ATR(14) as a percent of close with its
//! rolling percentile, Bollinger band width (20, k=2) with its rolling
//! percentile, and the ATR(7)/ATR(28) ratio.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use mm_common::{Candle, CryptoAsset};
use mm_market::CandleSource;
use tracing::{info, warn};

/// Minimum candles for a meaningful classification.
const MIN_CANDLES: usize = 30;

/// A state older than this is not trusted after a fetch failure.
const STATE_STALE_AFTER: Duration = Duration::from_secs(300);

/// Discrete volatility regime.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Regime {
    Calm,
    Normal,
    Elevated,
    Volatile,
}

impl Regime {
    pub fn name(&self) -> &'static str {
        match self {
            Regime::Calm => "calm",
            Regime::Normal => "normal",
            Regime::Elevated => "elevated",
            Regime::Volatile => "volatile",
        }
    }

    /// Spread multiplier applied to the configured base spread.
    /// `Volatile` has no multiplier: quoting is disabled outright.
    pub fn spread_multiplier(&self) -> Option<f64> {
        match self {
            Regime::Calm => Some(1.0),
            Regime::Normal => Some(1.5),
            Regime::Elevated => Some(2.5),
            Regime::Volatile => None,
        }
    }
}

impl std::fmt::Display for Regime {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.name())
    }
}

/// Regime plus the metrics that produced it.
#[derive(Debug, Clone)]
pub struct VolatilityState {
    pub regime: Regime,
    /// Rolling percentile of ATR(14) as % of close.
    pub atr_pct_percentile: f64,
    /// Rolling percentile of Bollinger band width.
    pub band_width_percentile: f64,
    /// ATR(7) / ATR(28).
    pub atr_ratio: f64,
    pub updated_at: DateTime<Utc>,
}

impl VolatilityState {
    /// Fail-safe state used before the first classification and when
    /// history is unusable.
    pub fn fail_safe() -> Self {
        Self {
            regime: Regime::Volatile,
            atr_pct_percentile: 0.0,
            band_width_percentile: 0.0,
            atr_ratio: 0.0,
            updated_at: Utc::now(),
        }
    }
}

/// Average true range over the trailing `period` candles, or `None`
/// when there is not enough history.
fn atr(candles: &[Candle], period: usize) -> Option<f64> {
    if candles.len() < period + 1 {
        return None;
    }
    let start = candles.len() - period;
    let mut sum = 0.0;
    for i in start..candles.len() {
        let c = &candles[i];
        let prev_close = candles[i - 1].close;
        let tr = (c.high - c.low)
            .max((c.high - prev_close).abs())
            .max((c.low - prev_close).abs());
        sum += tr;
    }
    Some(sum / period as f64)
}

/// ATR(`period`) as a percent of close for every index with enough
/// trailing history.
fn atr_pct_series(candles: &[Candle], period: usize) -> Vec<f64> {
    let mut out = Vec::new();
    for end in (period + 1)..=candles.len() {
        if let Some(a) = atr(&candles[..end], period) {
            let close = candles[end - 1].close;
            if close > 0.0 {
                out.push(a / close * 100.0);
            }
        }
    }
    out
}

/// Bollinger band width (20-period, k=2) as a percent of the SMA, for
/// every index with enough trailing history.
fn band_width_series(candles: &[Candle], period: usize) -> Vec<f64> {
    let mut out = Vec::new();
    for end in period..=candles.len() {
        let window = &candles[end - period..end];
        let mean = window.iter().map(|c| c.close).sum::<f64>() / period as f64;
        if mean <= 0.0 {
            continue;
        }
        let var = window
            .iter()
            .map(|c| (c.close - mean).powi(2))
            .sum::<f64>()
            / period as f64;
        let std = var.sqrt();
        out.push(4.0 * std / mean * 100.0);
    }
    out
}

/// Percent of values in the series strictly below `value`.
fn percentile_rank(series: &[f64], value: f64) -> f64 {
    if series.is_empty() {
        return 0.0;
    }
    let below = series.iter().filter(|v| **v < value).count();
    below as f64 / series.len() as f64 * 100.0
}

/// Regime rules, evaluated in order. The band-width squeeze override
/// comes first: a compressed range signals imminent expansion, which is
/// unsafe to quote into.
fn regime_from_metrics(atr_pctile: f64, bw_pctile: f64, ratio: f64) -> Regime {
    if bw_pctile < 10.0 {
        Regime::Volatile
    } else if atr_pctile < 40.0 && (15.0..=50.0).contains(&bw_pctile) && ratio < 0.9 {
        Regime::Calm
    } else if atr_pctile < 55.0 && bw_pctile < 60.0 && ratio < 1.1 {
        Regime::Normal
    } else if atr_pctile < 70.0 && ratio < 1.3 {
        Regime::Elevated
    } else {
        Regime::Volatile
    }
}

/// Classify a candle history. Fewer than 30 candles is always
/// `Volatile`.
pub fn classify(candles: &[Candle], now: DateTime<Utc>) -> VolatilityState {
    if candles.len() < MIN_CANDLES {
        return VolatilityState {
            updated_at: now,
            ..VolatilityState::fail_safe()
        };
    }

    let atr_series = atr_pct_series(candles, 14);
    let bw_series = band_width_series(candles, 20);

    let (atr_pctile, bw_pctile) = match (atr_series.last(), bw_series.last()) {
        (Some(a), Some(b)) => (
            percentile_rank(&atr_series, *a),
            percentile_rank(&bw_series, *b),
        ),
        _ => {
            return VolatilityState {
                updated_at: now,
                ..VolatilityState::fail_safe()
            }
        }
    };

    let ratio = match (atr(candles, 7), atr(candles, 28)) {
        (Some(short), Some(long)) if long > 0.0 => short / long,
        _ => {
            return VolatilityState {
                updated_at: now,
                ..VolatilityState::fail_safe()
            }
        }
    };

    VolatilityState {
        regime: regime_from_metrics(atr_pctile, bw_pctile, ratio),
        atr_pct_percentile: atr_pctile,
        band_width_percentile: bw_pctile,
        atr_ratio: ratio,
        updated_at: now,
    }
}

/// Stateful classifier polling a candle source on the engine's
/// volatility timer.
pub struct VolatilityClassifier {
    source: Arc<dyn CandleSource>,
    asset: CryptoAsset,
    interval: &'static str,
    lookback: u32,
    state: VolatilityState,
}

impl VolatilityClassifier {
    pub fn new(
        source: Arc<dyn CandleSource>,
        asset: CryptoAsset,
        interval: &'static str,
        lookback: u32,
    ) -> Self {
        Self {
            source,
            asset,
            interval,
            lookback,
            state: VolatilityState::fail_safe(),
        }
    }

    pub fn state(&self) -> &VolatilityState {
        &self.state
    }

    pub fn regime(&self) -> Regime {
        self.state.regime
    }

    /// Force the regime without touching the metrics; used by the
    /// circuit breaker until the next scheduled reclassification.
    pub fn force_regime(&mut self, regime: Regime) {
        if self.state.regime != regime {
            info!(from = %self.state.regime, to = %regime, "volatility regime forced");
        }
        self.state.regime = regime;
    }

    /// Refetch candles and reclassify. On fetch failure the previous
    /// state is kept unless it has gone stale, in which case the
    /// classifier fails safe to `Volatile`.
    pub async fn refresh(&mut self) -> Regime {
        let now = Utc::now();
        match self
            .source
            .recent_candles(self.asset, self.interval, self.lookback)
            .await
        {
            Ok(candles) => {
                let next = classify(&candles, now);
                if next.regime != self.state.regime {
                    info!(
                        asset = %self.asset,
                        from = %self.state.regime,
                        to = %next.regime,
                        atr_pctile = next.atr_pct_percentile,
                        bw_pctile = next.band_width_percentile,
                        atr_ratio = next.atr_ratio,
                        "volatility regime changed"
                    );
                }
                self.state = next;
            }
            Err(e) => {
                let age = now - self.state.updated_at;
                if age.to_std().map(|d| d > STATE_STALE_AFTER).unwrap_or(true) {
                    warn!(
                        asset = %self.asset,
                        "candle fetch failed with stale state, forcing volatile: {e}"
                    );
                    self.state = VolatilityState {
                        updated_at: now,
                        ..VolatilityState::fail_safe()
                    };
                } else {
                    warn!(asset = %self.asset, "candle fetch failed, keeping previous state: {e}");
                }
            }
        }
        self.state.regime
    }
}
