//! Shared types for the binary-market quoting engine.
//!
//! CRITICAL: All prices and quantities use `rust_decimal::Decimal`.
//! NEVER use f64 for financial math. Model math (probabilities,
//! volatility estimators) is f64 by design and converted at the boundary.

pub mod activity;
pub mod types;

pub use activity::{ActivityEvent, ActivityLevel, ActivityLog, ActivitySink, ChannelSink};
pub use types::{Candle, CryptoAsset, Outcome, Side, SpotTick, WindowMode};
