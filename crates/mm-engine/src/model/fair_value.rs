//! Black-Scholes digital option pricing.
//!
//! A binary market paying 1 if spot finishes above strike is a digital
//! call; its fair price is `N(d2)`. Everything here is pure `f64` math
//! on the hot path, converted to `Decimal` by the caller.

use mm_common::Candle;

/// Minutes in a (non-leap) year, the annualization base for 1m candles.
const MINUTES_PER_YEAR: f64 = 525_600.0;

/// Fallback annualized volatility when candle history is unusable.
/// 60% is mid-range for crypto; wrong by a lot only in extremes.
const FALLBACK_SIGMA: f64 = 0.6;

/// Standard normal CDF via the Abramowitz-Stegun rational
/// approximation (maximum absolute error ~7.5e-8).
pub fn norm_cdf(x: f64) -> f64 {
    if x < -8.0 {
        return 0.0;
    }
    if x > 8.0 {
        return 1.0;
    }

    let t = 1.0 / (1.0 + 0.2316419 * x.abs());
    let poly = t
        * (0.319381530
            + t * (-0.356563782 + t * (1.781477937 + t * (-1.821255978 + t * 1.330274429))));
    let pdf = (-0.5 * x * x).exp() / (2.0 * std::f64::consts::PI).sqrt();
    let tail = pdf * poly;

    if x >= 0.0 {
        1.0 - tail
    } else {
        tail
    }
}

/// Model probability that spot finishes at or above strike.
///
/// `minutes_left <= 0` collapses to the indicator `spot >= strike`.
/// Degenerate inputs (non-positive spot, strike or sigma) return the
/// neutral 0.5 rather than propagating a NaN.
pub fn binary_fair_value(spot: f64, strike: f64, sigma: f64, minutes_left: f64) -> f64 {
    if minutes_left <= 0.0 {
        return if spot >= strike { 1.0 } else { 0.0 };
    }
    if spot <= 0.0 || strike <= 0.0 || sigma <= 0.0 {
        return 0.5;
    }

    let t = minutes_left / MINUTES_PER_YEAR;
    let d2 = ((spot / strike).ln() - 0.5 * sigma * sigma * t) / (sigma * t.sqrt());
    norm_cdf(d2)
}

/// Garman-Klass realized volatility from 1-minute OHLC candles,
/// annualized. Needs at least 2 valid candles, otherwise returns the
/// 0.6 fallback.
pub fn realized_vol_garman_klass(candles: &[Candle]) -> f64 {
    let two_ln_two_minus_one = 2.0 * std::f64::consts::LN_2 - 1.0;

    let variances: Vec<f64> = candles
        .iter()
        .filter(|c| c.is_valid())
        .map(|c| {
            let hl = (c.high / c.low).ln();
            let co = (c.close / c.open).ln();
            0.5 * hl * hl - two_ln_two_minus_one * co * co
        })
        .collect();

    if variances.len() < 2 {
        return FALLBACK_SIGMA;
    }

    let mean_var = variances.iter().sum::<f64>() / variances.len() as f64;
    // G-K per-candle variance can go slightly negative on pathological
    // bars; clamp before annualizing.
    (mean_var.max(0.0) * MINUTES_PER_YEAR).sqrt()
}

/// Directional signal from a fair-vs-market comparison.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Signal {
    BuyYes,
    BuyNo,
    NoTrade,
}

/// Output of one fair-value comparison against the market.
#[derive(Debug, Clone)]
pub struct MispricingResult {
    /// Model fair YES price.
    pub fair_yes: f64,
    /// Observed market YES price.
    pub market_yes: f64,
    /// Signed edge, fair minus market.
    pub edge: f64,
    pub signal: Signal,
    /// Confidence in [0, 1]; scales with edge size and time remaining.
    pub confidence: f64,
}

/// Compare model fair value against the observed market price.
///
/// The signal fires only when the edge in cents exceeds
/// `min_edge_cents`. Confidence discounts signals close to expiry,
/// where the model has little room left to be right.
pub fn analyze_mispricing(
    spot: f64,
    strike: f64,
    sigma: f64,
    minutes_left: f64,
    market_yes: f64,
    min_edge_cents: f64,
) -> MispricingResult {
    let fair_yes = binary_fair_value(spot, strike, sigma, minutes_left);
    let edge = fair_yes - market_yes;

    let signal = if edge.abs() * 100.0 > min_edge_cents {
        if edge > 0.0 {
            Signal::BuyYes
        } else {
            Signal::BuyNo
        }
    } else {
        Signal::NoTrade
    };

    let confidence = (edge.abs() * 10.0).min(1.0) * (minutes_left / 2.0).min(1.0);

    MispricingResult {
        fair_yes,
        market_yes,
        edge,
        signal,
        confidence,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn candle(open: f64, high: f64, low: f64, close: f64) -> Candle {
        Candle {
            open_time: Utc::now(),
            open,
            high,
            low,
            close,
        }
    }

    #[test]
    fn test_norm_cdf_known_values() {
        assert!((norm_cdf(0.0) - 0.5).abs() < 1e-7);
        assert!((norm_cdf(1.0) - 0.8413447).abs() < 1e-6);
        assert!((norm_cdf(-1.0) - 0.1586553).abs() < 1e-6);
        assert!((norm_cdf(1.96) - 0.9750021).abs() < 1e-6);
        assert_eq!(norm_cdf(9.0), 1.0);
        assert_eq!(norm_cdf(-9.0), 0.0);
    }

    #[test]
    fn test_at_the_money_is_half() {
        // Spot == strike with time left sits essentially at 0.5; the
        // -sigma^2/2 drift term pulls it a hair below for tiny t.
        let p = binary_fair_value(97500.0, 97500.0, 0.6, 15.0);
        assert!((p - 0.5).abs() < 0.01, "got {p}");
    }

    #[test]
    fn test_expiry_collapses_to_indicator() {
        assert_eq!(binary_fair_value(97600.0, 97500.0, 0.6, 0.0), 1.0);
        assert_eq!(binary_fair_value(97400.0, 97500.0, 0.6, 0.0), 0.0);
        assert_eq!(binary_fair_value(97500.0, 97500.0, 0.6, -1.0), 1.0);
    }

    #[test]
    fn test_near_expiry_approaches_indicator() {
        let above = binary_fair_value(98000.0, 97500.0, 0.6, 0.01);
        let below = binary_fair_value(97000.0, 97500.0, 0.6, 0.01);
        assert!(above > 0.999, "got {above}");
        assert!(below < 0.001, "got {below}");
    }

    #[test]
    fn test_degenerate_inputs_neutral() {
        assert_eq!(binary_fair_value(0.0, 97500.0, 0.6, 10.0), 0.5);
        assert_eq!(binary_fair_value(97500.0, -1.0, 0.6, 10.0), 0.5);
        assert_eq!(binary_fair_value(97500.0, 97500.0, 0.0, 10.0), 0.5);
    }

    #[test]
    fn test_more_spot_means_higher_probability() {
        let low = binary_fair_value(97000.0, 97500.0, 0.6, 15.0);
        let mid = binary_fair_value(97500.0, 97500.0, 0.6, 15.0);
        let high = binary_fair_value(98000.0, 97500.0, 0.6, 15.0);
        assert!(low < mid && mid < high);
    }

    #[test]
    fn test_gk_fallback_with_too_few_candles() {
        assert_eq!(realized_vol_garman_klass(&[]), 0.6);
        assert_eq!(
            realized_vol_garman_klass(&[candle(100.0, 101.0, 99.0, 100.5)]),
            0.6
        );
        // Invalid candles don't count toward the minimum.
        let invalid = vec![
            candle(100.0, 99.0, 101.0, 100.0),
            candle(0.0, 1.0, 0.5, 0.7),
            candle(100.0, 101.0, 99.0, 100.5),
        ];
        assert_eq!(realized_vol_garman_klass(&invalid), 0.6);
    }

    #[test]
    fn test_gk_is_nonnegative_and_scales_with_range() {
        let quiet = vec![
            candle(100.0, 100.05, 99.95, 100.01),
            candle(100.01, 100.06, 99.97, 100.02),
            candle(100.02, 100.04, 99.99, 100.0),
        ];
        let wild = vec![
            candle(100.0, 103.0, 97.0, 101.0),
            candle(101.0, 105.0, 99.0, 100.0),
            candle(100.0, 104.0, 96.0, 102.0),
        ];
        let sigma_quiet = realized_vol_garman_klass(&quiet);
        let sigma_wild = realized_vol_garman_klass(&wild);
        assert!(sigma_quiet >= 0.0);
        assert!(sigma_wild > sigma_quiet);
    }

    #[test]
    fn test_mispricing_signal_thresholds() {
        // Fair well above market: buy YES.
        let r = analyze_mispricing(98500.0, 97500.0, 0.6, 10.0, 0.50, 5.0);
        assert!(r.fair_yes > 0.55);
        assert_eq!(r.signal, Signal::BuyYes);
        assert!(r.edge > 0.0);

        // Fair well below market: buy NO.
        let r = analyze_mispricing(96500.0, 97500.0, 0.6, 10.0, 0.50, 5.0);
        assert_eq!(r.signal, Signal::BuyNo);

        // Edge below the threshold: no trade.
        let r = analyze_mispricing(97500.0, 97500.0, 0.6, 10.0, 0.50, 5.0);
        assert_eq!(r.signal, Signal::NoTrade);
    }

    #[test]
    fn test_mispricing_confidence_bounds() {
        let r = analyze_mispricing(99000.0, 97500.0, 0.6, 10.0, 0.10, 1.0);
        assert!(r.confidence > 0.0 && r.confidence <= 1.0);

        // Near expiry the time factor discounts confidence.
        let late = analyze_mispricing(99000.0, 97500.0, 0.6, 0.5, 0.10, 1.0);
        assert!(late.confidence < r.confidence);
    }
}
