//! Per-market mutable state owned by one engine instance.

use chrono::{DateTime, Utc};
use mm_common::CryptoAsset;
use mm_market::FoundMarket;
use rust_decimal::Decimal;
use rust_decimal_macros::dec;

/// A resting order on one side of the book.
#[derive(Debug, Clone)]
pub struct RestingOrder {
    pub order_id: String,
    pub price: Decimal,
    pub size: Decimal,
    pub placed_at: DateTime<Utc>,
}

/// Fill state for one side.
#[derive(Debug, Clone)]
pub struct FillRecord {
    pub filled_at: DateTime<Utc>,
    pub entry_price: Decimal,
}

/// One binary market currently quoted or watched.
///
/// Exclusively owned by its engine instance; every field here is
/// mutated from the instance's single dispatch loop.
#[derive(Debug, Clone)]
pub struct ActiveMarket {
    pub market_id: String,
    pub question: String,
    pub asset: CryptoAsset,
    pub yes_token_id: String,
    pub no_token_id: String,
    pub end_time: DateTime<Utc>,
    /// Strike, when known. Pure up/down markets without a derivable
    /// session-open price stay `None` and cannot run fair-value mode.
    pub strike: Option<Decimal>,
    pub neg_risk: bool,

    pub best_bid: Option<Decimal>,
    pub best_ask: Option<Decimal>,
    pub midpoint: Option<Decimal>,

    pub yes_held: Decimal,
    pub no_held: Decimal,

    pub resting_bid: Option<RestingOrder>,
    pub resting_ask: Option<RestingOrder>,
    pub bid_fill: Option<FillRecord>,
    pub ask_fill: Option<FillRecord>,
    /// Taker sell closing out a timed-out one-sided fill. While set, no
    /// further exit attempts are made for this market.
    pub exit_order: Option<RestingOrder>,

    /// Written before any placement network call; gates concurrent
    /// requote attempts on the same market.
    pub last_quote_time: Option<DateTime<Utc>>,
}

impl ActiveMarket {
    pub fn from_found(found: &FoundMarket) -> Self {
        Self {
            market_id: found.market_id.clone(),
            question: found.question.clone(),
            asset: found.asset,
            yes_token_id: found.yes_token_id.clone(),
            no_token_id: found.no_token_id.clone(),
            end_time: found.end_time,
            strike: found.strike,
            neg_risk: found.neg_risk,
            best_bid: None,
            best_ask: None,
            midpoint: None,
            yes_held: Decimal::ZERO,
            no_held: Decimal::ZERO,
            resting_bid: None,
            resting_ask: None,
            bid_fill: None,
            ask_fill: None,
            exit_order: None,
            last_quote_time: None,
        }
    }

    /// Apply a top-of-book update for the YES instrument.
    pub fn update_book(&mut self, best_bid: Decimal, best_ask: Decimal) {
        self.best_bid = Some(best_bid);
        self.best_ask = Some(best_ask);
        self.midpoint = Some((best_bid + best_ask) / dec!(2));
    }

    /// Book state is no longer trustworthy (stream disconnect).
    pub fn clear_book(&mut self) {
        self.best_bid = None;
        self.best_ask = None;
        self.midpoint = None;
    }

    pub fn minutes_remaining(&self, now: DateTime<Utc>) -> f64 {
        (self.end_time - now).num_milliseconds() as f64 / 60_000.0
    }

    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        now >= self.end_time
    }

    pub fn has_resting_orders(&self) -> bool {
        self.resting_bid.is_some() || self.resting_ask.is_some()
    }

    pub fn has_any_fill(&self) -> bool {
        self.bid_fill.is_some() || self.ask_fill.is_some()
    }

    pub fn has_inventory(&self) -> bool {
        self.yes_held > Decimal::ZERO || self.no_held > Decimal::ZERO
    }
}

/// Inventory handed to settlement at expiry, awaiting resolution.
#[derive(Debug, Clone)]
pub struct PendingRedeem {
    /// Condition id on the venue.
    pub market_id: String,
    pub neg_risk: bool,
    pub yes_token_id: String,
    pub no_token_id: String,
    pub asset: CryptoAsset,
    pub added_at: DateTime<Utc>,
}

impl PendingRedeem {
    pub fn from_market(market: &ActiveMarket, now: DateTime<Utc>) -> Self {
        Self {
            market_id: market.market_id.clone(),
            neg_risk: market.neg_risk,
            yes_token_id: market.yes_token_id.clone(),
            no_token_id: market.no_token_id.clone(),
            asset: market.asset,
            added_at: now,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use mm_common::WindowMode;
    use mm_market::SessionWindow;

    fn found(end_offset_min: i64) -> FoundMarket {
        let now = Utc::now();
        let end = now + Duration::minutes(end_offset_min);
        FoundMarket {
            market_id: "m1".to_string(),
            question: "Bitcoin Up or Down - 3:45pm-4:00pm ET".to_string(),
            asset: CryptoAsset::Btc,
            yes_token_id: "yes1".to_string(),
            no_token_id: "no1".to_string(),
            end_time: end,
            strike: Some(dec!(97500)),
            neg_risk: false,
            window: SessionWindow {
                start: end - Duration::minutes(WindowMode::FifteenMin.minutes()),
                end,
            },
        }
    }

    #[test]
    fn test_from_found_starts_empty() {
        let m = ActiveMarket::from_found(&found(14));
        assert!(m.midpoint.is_none());
        assert!(!m.has_resting_orders());
        assert!(!m.has_any_fill());
        assert!(!m.has_inventory());
        assert_eq!(m.strike, Some(dec!(97500)));
    }

    #[test]
    fn test_book_update_sets_midpoint() {
        let mut m = ActiveMarket::from_found(&found(14));
        m.update_book(dec!(0.50), dec!(0.54));
        assert_eq!(m.midpoint, Some(dec!(0.52)));

        m.clear_book();
        assert!(m.midpoint.is_none());
    }

    #[test]
    fn test_expiry_and_minutes_remaining() {
        let now = Utc::now();
        let m = ActiveMarket::from_found(&found(14));
        assert!(!m.is_expired(now));
        let mins = m.minutes_remaining(now);
        assert!(mins > 13.9 && mins < 14.1);

        let expired = ActiveMarket::from_found(&found(-1));
        assert!(expired.is_expired(now));
    }
}
