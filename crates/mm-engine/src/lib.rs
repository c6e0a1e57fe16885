//! Quoting and sniper engine for short-window binary crypto markets.
//!
//! One engine instance runs per profile. The market-making variant
//! posts two-sided maker quotes priced off the book midpoint, volatility
//! regime and inventory skew, optionally biased toward a Black-Scholes
//! fair value; the sniper variant takes a single directional position
//! when spot has diverged from strike. Both share market discovery and
//! on-chain settlement.
//!
//! CRITICAL: All prices, sizes and PnL figures use
//! `rust_decimal::Decimal`. Model math (fair value, volatility
//! estimators) is `f64` and converted at the boundary.

pub mod balance;
pub mod breaker;
pub mod config;
pub mod credentials;
pub mod engine;
pub mod fills;
pub mod market;
pub mod model;
pub mod quote;
pub mod registry;
pub mod router;
pub mod settlement;
pub mod sniper;

pub use config::{EngineConfig, SniperConfig};
pub use credentials::{Profile, ProfileStore};
pub use engine::{MmEngine, MmEngineDeps};
pub use fills::{FillReconciler, ReconcileEvent};
pub use market::{ActiveMarket, PendingRedeem};
pub use model::fair_value::{analyze_mispricing, binary_fair_value, MispricingResult, Signal};
pub use model::volatility::{Regime, VolatilityClassifier, VolatilityState};
pub use quote::{apply_fair_value_bias, quote_for, QuoteInputs, QuotePair};
pub use registry::{InstanceKind, InstanceRegistry, InstanceStatus, RegistryError};
pub use router::{
    BalanceKind, OpenOrder, OrderRouter, PlaceOrder, PlacedOrder, RouterError,
};
pub use settlement::{ChainClient, SettlementManager, TxOutcome};
pub use sniper::{SniperEngine, SniperEngineDeps, SniperMarket, SniperState};
