//! Two-sided quote construction.
//!
//! Pure function of midpoint, regime, inventory and balance. The bid
//! buys YES below the midpoint; the ask buys NO priced as the
//! complement, so a filled pair is a round trip worth
//! `1 - (bid + ask)` per share before fees. Declining to quote is the
//! normal outcome in hostile conditions, not an error.

use rust_decimal::Decimal;
use rust_decimal_macros::dec;

use crate::model::volatility::Regime;

/// Quote band: never quote within 5 cents of either boundary.
const PRICE_FLOOR: Decimal = dec!(0.05);
const PRICE_CEIL: Decimal = dec!(0.95);

/// A pair whose entry costs sum to at least this cannot round-trip
/// profitably net of fees.
const MAX_PAIR_COST: Decimal = dec!(0.975);

/// Pricing shift per share of inventory imbalance. Quotes are biased to
/// unwind the overweight side instead of hedging elsewhere.
const SKEW_PER_SHARE: Decimal = dec!(0.005);

/// Inputs to one quote computation.
#[derive(Debug, Clone)]
pub struct QuoteInputs {
    /// Book midpoint; `None` before the first book update.
    pub midpoint: Option<Decimal>,
    pub regime: Regime,
    /// Base spread in cents from config.
    pub base_spread_cents: Decimal,
    pub max_position_size: Decimal,
    pub yes_held: Decimal,
    pub no_held: Decimal,
    /// Available collateral balance.
    pub balance: Decimal,
    pub tick_size: Decimal,
}

/// A priced and sized two-sided quote.
#[derive(Debug, Clone, PartialEq)]
pub struct QuotePair {
    /// Price to bid for YES.
    pub bid: Decimal,
    /// Price to bid for NO (the complement-side quote).
    pub ask: Decimal,
    /// Shares per side.
    pub size: Decimal,
}

fn regime_multiplier(regime: Regime) -> Option<Decimal> {
    match regime {
        Regime::Calm => Some(dec!(1.0)),
        Regime::Normal => Some(dec!(1.5)),
        Regime::Elevated => Some(dec!(2.5)),
        Regime::Volatile => None,
    }
}

fn round_to_tick(price: Decimal, tick: Decimal) -> Decimal {
    if tick <= Decimal::ZERO {
        return price;
    }
    (price / tick).round() * tick
}

/// Compute a quote, or decline.
///
/// Declines when the regime is `Volatile`, the midpoint is missing or
/// outside (0.05, 0.95), the pair cost reaches 0.975, or the size
/// rounds below one share.
pub fn quote_for(inputs: &QuoteInputs) -> Option<QuotePair> {
    let mult = regime_multiplier(inputs.regime)?;
    let mid = inputs.midpoint?;
    if mid <= PRICE_FLOOR || mid >= PRICE_CEIL {
        return None;
    }

    let spread = inputs.base_spread_cents / dec!(100) * mult;
    let half = spread / dec!(2);
    let skew = (inputs.yes_held - inputs.no_held) * SKEW_PER_SHARE;

    let bid = round_to_tick(mid - half - skew, inputs.tick_size)
        .clamp(PRICE_FLOOR, PRICE_CEIL);
    let ask = round_to_tick((Decimal::ONE - mid) - half + skew, inputs.tick_size)
        .clamp(PRICE_FLOOR, PRICE_CEIL);

    if bid + ask >= MAX_PAIR_COST {
        return None;
    }

    let worst = bid.max(ask);
    if worst <= Decimal::ZERO {
        return None;
    }
    let affordable = (inputs.balance / (dec!(2) * worst)).floor();
    let size = inputs.max_position_size.min(affordable);
    if size < Decimal::ONE {
        return None;
    }

    Some(QuotePair { bid, ask, size })
}

/// Largest shift the fair-value model may apply to either quote.
const MAX_FAIR_VALUE_BIAS: Decimal = dec!(0.01);

/// Bias a quote toward the model fair value.
///
/// A positive edge (model above market) lifts the YES bid and cheapens
/// the NO-side quote; negative edge does the opposite. The shift is
/// capped at one cent and the profitability and band invariants are
/// re-checked, so a bias can turn a quote into a decline but never into
/// an invalid pair.
pub fn apply_fair_value_bias(pair: &QuotePair, edge: Decimal, tick: Decimal) -> Option<QuotePair> {
    let bias = edge.clamp(-MAX_FAIR_VALUE_BIAS, MAX_FAIR_VALUE_BIAS);
    let bid = round_to_tick(pair.bid + bias, tick).clamp(PRICE_FLOOR, PRICE_CEIL);
    let ask = round_to_tick(pair.ask - bias, tick).clamp(PRICE_FLOOR, PRICE_CEIL);
    if bid + ask >= MAX_PAIR_COST {
        return None;
    }
    Some(QuotePair {
        bid,
        ask,
        size: pair.size,
    })
}
