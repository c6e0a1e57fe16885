//! Spot-velocity circuit breaker.
//!
//! Watches the spot price per quoted asset; a move beyond the
//! configured percentage inside the sample window halts quoting
//! globally for a cooldown. One tripped asset halts everything: the
//! breaker is a blunt, conservative instrument, not a per-asset lock.
//!
//! `is_halted()` on the quote path is an atomic load plus one timestamp
//! comparison; sample recording takes a short mutex.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use chrono::{DateTime, Utc};
use mm_common::CryptoAsset;
use rust_decimal::Decimal;
use tracing::warn;

/// How far back a prior sample may be and still count as "fast".
const SAMPLE_WINDOW: Duration = Duration::from_secs(120);

/// Quoting stays halted this long after a trip.
const COOLDOWN: Duration = Duration::from_secs(60);

/// Details of a breaker trip.
#[derive(Debug, Clone)]
pub struct Trip {
    pub asset: CryptoAsset,
    pub from_price: Decimal,
    pub to_price: Decimal,
    pub move_pct: Decimal,
    pub tripped_at: DateTime<Utc>,
}

pub struct SpotVelocityBreaker {
    /// Fractional move threshold (0.005 = 0.5%).
    threshold: Decimal,
    sample_window: Duration,
    cooldown: Duration,
    halted: AtomicBool,
    trip_time_ms: AtomicI64,
    samples: Mutex<HashMap<CryptoAsset, VecDeque<(DateTime<Utc>, Decimal)>>>,
}

impl SpotVelocityBreaker {
    pub fn new(threshold: Decimal) -> Self {
        Self {
            threshold,
            sample_window: SAMPLE_WINDOW,
            cooldown: COOLDOWN,
            halted: AtomicBool::new(false),
            trip_time_ms: AtomicI64::new(0),
            samples: Mutex::new(HashMap::new()),
        }
    }

    #[cfg(test)]
    fn with_windows(threshold: Decimal, sample_window: Duration, cooldown: Duration) -> Self {
        Self {
            sample_window,
            cooldown,
            ..Self::new(threshold)
        }
    }

    /// Record a spot sample and check velocity against every retained
    /// sample in the window. Returns the trip when the threshold is
    /// crossed.
    pub fn record(&self, asset: CryptoAsset, price: Decimal, now: DateTime<Utc>) -> Option<Trip> {
        if price <= Decimal::ZERO {
            return None;
        }

        let mut samples = match self.samples.lock() {
            Ok(s) => s,
            // Poisoned sample history fails open on recording; the halt
            // flag itself is atomic and unaffected.
            Err(poisoned) => poisoned.into_inner(),
        };
        let history = samples.entry(asset).or_default();

        let cutoff = now
            - chrono::Duration::from_std(self.sample_window)
                .unwrap_or_else(|_| chrono::Duration::seconds(120));
        while let Some((t, _)) = history.front() {
            if *t < cutoff {
                history.pop_front();
            } else {
                break;
            }
        }

        let mut trip = None;
        if let Some((_, oldest)) = history.front() {
            if *oldest > Decimal::ZERO {
                let move_pct = ((price - *oldest) / *oldest).abs();
                if move_pct > self.threshold {
                    trip = Some(Trip {
                        asset,
                        from_price: *oldest,
                        to_price: price,
                        move_pct,
                        tripped_at: now,
                    });
                }
            }
        }

        history.push_back((now, price));
        drop(samples);

        if let Some(t) = &trip {
            warn!(
                asset = %t.asset,
                from = %t.from_price,
                to = %t.to_price,
                move_pct = %t.move_pct,
                "circuit breaker tripped"
            );
            self.halted.store(true, Ordering::Release);
            self.trip_time_ms
                .store(now.timestamp_millis(), Ordering::Release);
        }
        trip
    }

    /// Whether quoting is currently halted. Auto-clears once the
    /// cooldown has elapsed.
    pub fn is_halted(&self, now: DateTime<Utc>) -> bool {
        if !self.halted.load(Ordering::Acquire) {
            return false;
        }
        let trip_ms = self.trip_time_ms.load(Ordering::Acquire);
        let elapsed_ms = now.timestamp_millis() - trip_ms;
        if elapsed_ms >= self.cooldown.as_millis() as i64 {
            self.halted.store(false, Ordering::Release);
            false
        } else {
            true
        }
    }

    pub fn cooldown_remaining(&self, now: DateTime<Utc>) -> Option<Duration> {
        if !self.halted.load(Ordering::Acquire) {
            return None;
        }
        let trip_ms = self.trip_time_ms.load(Ordering::Acquire);
        let elapsed_ms = now.timestamp_millis() - trip_ms;
        let cooldown_ms = self.cooldown.as_millis() as i64;
        if elapsed_ms >= cooldown_ms {
            Some(Duration::ZERO)
        } else {
            Some(Duration::from_millis((cooldown_ms - elapsed_ms) as u64))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration as ChronoDuration;
    use rust_decimal_macros::dec;

    #[test]
    fn test_trips_on_fast_move() {
        let breaker = SpotVelocityBreaker::new(dec!(0.005));
        let t0 = Utc::now();

        assert!(breaker.record(CryptoAsset::Btc, dec!(100000), t0).is_none());
        // 0.6% move 100 seconds later.
        let trip = breaker
            .record(
                CryptoAsset::Btc,
                dec!(100600),
                t0 + ChronoDuration::seconds(100),
            )
            .unwrap();
        assert_eq!(trip.move_pct, dec!(0.006));
        assert!(breaker.is_halted(t0 + ChronoDuration::seconds(101)));
    }

    #[test]
    fn test_small_move_does_not_trip() {
        let breaker = SpotVelocityBreaker::new(dec!(0.005));
        let t0 = Utc::now();

        breaker.record(CryptoAsset::Btc, dec!(100000), t0);
        let result = breaker.record(
            CryptoAsset::Btc,
            dec!(100300),
            t0 + ChronoDuration::seconds(100),
        );
        assert!(result.is_none());
        assert!(!breaker.is_halted(t0 + ChronoDuration::seconds(101)));
    }

    #[test]
    fn test_old_samples_age_out() {
        let breaker = SpotVelocityBreaker::new(dec!(0.005));
        let t0 = Utc::now();

        breaker.record(CryptoAsset::Btc, dec!(100000), t0);
        // Same size move, but over 3 minutes: the old sample is gone.
        let result = breaker.record(
            CryptoAsset::Btc,
            dec!(100600),
            t0 + ChronoDuration::seconds(180),
        );
        assert!(result.is_none());
    }

    #[test]
    fn test_assets_are_tracked_separately() {
        let breaker = SpotVelocityBreaker::new(dec!(0.005));
        let t0 = Utc::now();

        breaker.record(CryptoAsset::Btc, dec!(100000), t0);
        // First ETH sample has no prior to compare with.
        let result = breaker.record(
            CryptoAsset::Eth,
            dec!(3000),
            t0 + ChronoDuration::seconds(10),
        );
        assert!(result.is_none());
    }

    #[test]
    fn test_cooldown_expires() {
        let breaker = SpotVelocityBreaker::with_windows(
            dec!(0.005),
            Duration::from_secs(120),
            Duration::from_secs(60),
        );
        let t0 = Utc::now();

        breaker.record(CryptoAsset::Btc, dec!(100000), t0);
        breaker
            .record(CryptoAsset::Btc, dec!(101000), t0 + ChronoDuration::seconds(10))
            .unwrap();

        assert!(breaker.is_halted(t0 + ChronoDuration::seconds(30)));
        assert!(!breaker.is_halted(t0 + ChronoDuration::seconds(71)));
        // And stays clear.
        assert!(!breaker.is_halted(t0 + ChronoDuration::seconds(72)));
    }

    #[test]
    fn test_cooldown_remaining() {
        let breaker = SpotVelocityBreaker::new(dec!(0.005));
        let t0 = Utc::now();
        assert!(breaker.cooldown_remaining(t0).is_none());

        breaker.record(CryptoAsset::Btc, dec!(100000), t0);
        breaker
            .record(CryptoAsset::Btc, dec!(101000), t0 + ChronoDuration::seconds(1))
            .unwrap();
        let remaining = breaker
            .cooldown_remaining(t0 + ChronoDuration::seconds(2))
            .unwrap();
        assert!(remaining > Duration::from_secs(55));
    }

    #[test]
    fn test_ignores_nonpositive_prices() {
        let breaker = SpotVelocityBreaker::new(dec!(0.005));
        assert!(breaker
            .record(CryptoAsset::Btc, Decimal::ZERO, Utc::now())
            .is_none());
    }
}
