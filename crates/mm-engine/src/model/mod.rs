//! Pricing models: Black-Scholes fair value and volatility regimes.

pub mod fair_value;
pub mod volatility;
