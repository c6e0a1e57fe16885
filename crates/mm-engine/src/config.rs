//! Engine configuration.
//!
//! Loaded from a TOML file with environment-variable overrides for
//! endpoints and CLI overrides for mode and assets. Two named presets
//! cover the two window modes; anything set explicitly in the file wins
//! over the preset.

use std::path::Path;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use mm_common::{CryptoAsset, WindowMode};
use rust_decimal::Decimal;
use serde::Deserialize;

/// Per-instance configuration for the market-making engine.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Market window mode (5m or 15m sessions).
    pub mode: WindowMode,

    /// Assets to quote.
    pub assets: Vec<CryptoAsset>,

    /// Logging level.
    pub log_level: String,

    /// Base half-spread basis, in cents, before regime widening.
    pub base_spread_cents: u32,

    /// Maximum position size per market (shares).
    pub max_position_size: Decimal,

    /// Maximum total exposure across all markets (USDC).
    pub max_total_exposure: Decimal,

    /// Quote refresh interval.
    pub quote_refresh: Duration,

    /// Pull all quotes this long before market expiry.
    pub pre_expiry_pull: Duration,

    /// Spot move (fraction, 0.005 = 0.5%) that trips the circuit
    /// breaker.
    pub circuit_breaker_pct: Decimal,

    /// How long a one-sided fill may sit before the exit logic runs.
    pub one_side_fill_timeout: Duration,

    /// Candles fetched per volatility classification.
    pub volatility_lookback: u32,

    /// Minimum model edge, in cents, for fair-value signals.
    pub min_edge_cents: u32,

    /// Bias quotes toward the Black-Scholes fair value.
    pub fair_value_enabled: bool,

    /// External service endpoints.
    pub endpoints: EndpointConfig,

    /// Sniper engine parameters.
    pub sniper: SniperConfig,
}

/// External endpoints, override-able for testing against mocks.
#[derive(Debug, Clone)]
pub struct EndpointConfig {
    pub clob_rest: String,
    pub clob_ws: String,
    pub catalog: String,
    pub exchange_rest: String,
    pub exchange_ws: String,
    /// Tried in order; rotated on rate-limit or network errors.
    pub rpc_endpoints: Vec<String>,
}

impl Default for EndpointConfig {
    fn default() -> Self {
        Self {
            clob_rest: "https://clob.polymarket.com".to_string(),
            clob_ws: "wss://ws-subscriptions-clob.polymarket.com/ws/market".to_string(),
            catalog: "https://gamma-api.polymarket.com".to_string(),
            exchange_rest: "https://api.binance.com".to_string(),
            exchange_ws: "wss://stream.binance.com:9443/ws".to_string(),
            rpc_endpoints: vec![
                "https://polygon-rpc.com".to_string(),
                "https://rpc-mainnet.matic.quiknode.pro".to_string(),
            ],
        }
    }
}

/// Sniper engine parameters.
#[derive(Debug, Clone)]
pub struct SniperConfig {
    /// Entry window: at least this many minutes to expiry.
    pub min_minutes_left: f64,

    /// Entry window: at most this many minutes to expiry.
    pub max_minutes_left: f64,

    /// Minimum spot-vs-strike divergence (fraction) to enter.
    pub min_price_diff_pct: Decimal,

    /// Never pay more than this per share.
    pub max_token_price: Decimal,

    /// Position size (USDC) at the base divergence tier.
    pub tier1_size: Decimal,

    /// Divergence at which tier 2 sizing kicks in.
    pub tier2_diff_pct: Decimal,
    pub tier2_size: Decimal,

    /// Divergence at which tier 3 sizing kicks in.
    pub tier3_diff_pct: Decimal,
    pub tier3_size: Decimal,

    /// Cap on simultaneously entered markets.
    pub max_concurrent_positions: usize,

    /// Cap on aggregate sniper exposure (USDC), independent of the MM
    /// engine's limits.
    pub max_exposure: Decimal,
}

impl Default for SniperConfig {
    fn default() -> Self {
        Self {
            min_minutes_left: 0.5,
            max_minutes_left: 3.0,
            min_price_diff_pct: Decimal::new(15, 4), // 0.15%
            max_token_price: Decimal::new(92, 2),    // 0.92
            tier1_size: Decimal::new(50, 0),
            tier2_diff_pct: Decimal::new(30, 4), // 0.30%
            tier2_size: Decimal::new(100, 0),
            tier3_diff_pct: Decimal::new(60, 4), // 0.60%
            tier3_size: Decimal::new(200, 0),
            max_concurrent_positions: 3,
            max_exposure: Decimal::new(500, 0),
        }
    }
}

impl EngineConfig {
    /// Preset tuned for 15-minute sessions: tighter spread, more
    /// patience on one-sided fills.
    pub fn preset_15m() -> Self {
        Self {
            mode: WindowMode::FifteenMin,
            assets: vec![CryptoAsset::Btc, CryptoAsset::Eth],
            log_level: "info".to_string(),
            base_spread_cents: 3,
            max_position_size: Decimal::new(100, 0),
            max_total_exposure: Decimal::new(1000, 0),
            quote_refresh: Duration::from_millis(1500),
            pre_expiry_pull: Duration::from_secs(120),
            circuit_breaker_pct: Decimal::new(5, 3), // 0.5%
            one_side_fill_timeout: Duration::from_millis(30_000),
            volatility_lookback: 60,
            min_edge_cents: 4,
            fair_value_enabled: false,
            endpoints: EndpointConfig::default(),
            sniper: SniperConfig::default(),
        }
    }

    /// Preset tuned for 5-minute sessions: wider spread, faster refresh,
    /// shorter patience everywhere.
    pub fn preset_5m() -> Self {
        Self {
            mode: WindowMode::FiveMin,
            base_spread_cents: 4,
            quote_refresh: Duration::from_millis(1000),
            pre_expiry_pull: Duration::from_secs(60),
            one_side_fill_timeout: Duration::from_millis(20_000),
            ..Self::preset_15m()
        }
    }

    pub fn preset_for(mode: WindowMode) -> Self {
        match mode {
            WindowMode::FiveMin => Self::preset_5m(),
            WindowMode::FifteenMin => Self::preset_15m(),
        }
    }

    /// Load configuration from a TOML file.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(path.as_ref())
            .with_context(|| format!("failed to read config file: {:?}", path.as_ref()))?;
        Self::from_toml_str(&content)
    }

    /// Parse configuration from a TOML string. The window mode selects
    /// the preset; every present field overrides it.
    pub fn from_toml_str(content: &str) -> Result<Self> {
        let file: TomlConfig = toml::from_str(content).context("failed to parse TOML config")?;
        let mode = parse_mode(&file.general.mode)?;
        let mut config = Self::preset_for(mode);

        if let Some(assets) = file.general.assets {
            config.assets = parse_assets(&assets)?;
        }
        if let Some(level) = file.general.log_level {
            config.log_level = level;
        }

        let q = file.quoting;
        if let Some(v) = q.base_spread_cents {
            config.base_spread_cents = v;
        }
        if let Some(v) = q.max_position_size {
            config.max_position_size = f64_to_decimal(v);
        }
        if let Some(v) = q.max_total_exposure {
            config.max_total_exposure = f64_to_decimal(v);
        }
        if let Some(v) = q.quote_refresh_ms {
            config.quote_refresh = Duration::from_millis(v);
        }
        if let Some(v) = q.pre_expiry_pull_secs {
            config.pre_expiry_pull = Duration::from_secs(v);
        }
        if let Some(v) = q.circuit_breaker_pct {
            config.circuit_breaker_pct = pct_to_decimal(v);
        }
        if let Some(v) = q.one_side_fill_timeout_ms {
            config.one_side_fill_timeout = Duration::from_millis(v);
        }
        if let Some(v) = q.volatility_lookback {
            config.volatility_lookback = v;
        }

        let fv = file.fair_value;
        if let Some(v) = fv.enabled {
            config.fair_value_enabled = v;
        }
        if let Some(v) = fv.min_edge_cents {
            config.min_edge_cents = v;
        }

        let s = file.sniper;
        if let Some(v) = s.min_minutes_left {
            config.sniper.min_minutes_left = v;
        }
        if let Some(v) = s.max_minutes_left {
            config.sniper.max_minutes_left = v;
        }
        if let Some(v) = s.min_price_diff_pct {
            config.sniper.min_price_diff_pct = pct_to_decimal(v);
        }
        if let Some(v) = s.max_token_price {
            config.sniper.max_token_price = f64_to_decimal(v);
        }
        if let Some(v) = s.tier1_size {
            config.sniper.tier1_size = f64_to_decimal(v);
        }
        if let Some(v) = s.tier2_diff_pct {
            config.sniper.tier2_diff_pct = pct_to_decimal(v);
        }
        if let Some(v) = s.tier2_size {
            config.sniper.tier2_size = f64_to_decimal(v);
        }
        if let Some(v) = s.tier3_diff_pct {
            config.sniper.tier3_diff_pct = pct_to_decimal(v);
        }
        if let Some(v) = s.tier3_size {
            config.sniper.tier3_size = f64_to_decimal(v);
        }
        if let Some(v) = s.max_concurrent_positions {
            config.sniper.max_concurrent_positions = v;
        }
        if let Some(v) = s.max_exposure {
            config.sniper.max_exposure = f64_to_decimal(v);
        }

        let e = file.endpoints;
        if let Some(v) = e.clob_rest {
            config.endpoints.clob_rest = v;
        }
        if let Some(v) = e.clob_ws {
            config.endpoints.clob_ws = v;
        }
        if let Some(v) = e.catalog {
            config.endpoints.catalog = v;
        }
        if let Some(v) = e.exchange_rest {
            config.endpoints.exchange_rest = v;
        }
        if let Some(v) = e.exchange_ws {
            config.endpoints.exchange_ws = v;
        }
        if let Some(v) = e.rpc_endpoints {
            config.endpoints.rpc_endpoints = v;
        }

        Ok(config)
    }

    /// Environment variable overrides for endpoints.
    pub fn apply_env_overrides(&mut self) {
        if let Ok(url) = std::env::var("MM_CLOB_REST_URL") {
            self.endpoints.clob_rest = url;
        }
        if let Ok(url) = std::env::var("MM_CLOB_WS_URL") {
            self.endpoints.clob_ws = url;
        }
        if let Ok(url) = std::env::var("MM_CATALOG_URL") {
            self.endpoints.catalog = url;
        }
        if let Ok(urls) = std::env::var("MM_RPC_ENDPOINTS") {
            let endpoints: Vec<String> = urls
                .split(',')
                .map(|s| s.trim().to_string())
                .filter(|s| !s.is_empty())
                .collect();
            if !endpoints.is_empty() {
                self.endpoints.rpc_endpoints = endpoints;
            }
        }
        if let Ok(level) = std::env::var("MM_LOG_LEVEL") {
            self.log_level = level;
        }
    }

    /// CLI argument overrides.
    pub fn apply_cli_overrides(&mut self, mode: Option<String>, assets: Option<Vec<String>>) {
        if let Some(mode_str) = mode {
            if let Ok(m) = parse_mode(&mode_str) {
                // Re-seed the preset timings when the mode changes.
                if m != self.mode {
                    let preset = Self::preset_for(m);
                    self.mode = m;
                    self.quote_refresh = preset.quote_refresh;
                    self.pre_expiry_pull = preset.pre_expiry_pull;
                    self.one_side_fill_timeout = preset.one_side_fill_timeout;
                    self.base_spread_cents = preset.base_spread_cents;
                }
            }
        }
        if let Some(asset_list) = assets {
            if let Ok(parsed) = parse_assets(&asset_list) {
                if !parsed.is_empty() {
                    self.assets = parsed;
                }
            }
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.assets.is_empty() {
            bail!("at least one asset must be configured");
        }
        if self.base_spread_cents == 0 {
            bail!("base_spread_cents must be positive");
        }
        if self.max_position_size <= Decimal::ZERO {
            bail!("max_position_size must be positive");
        }
        if self.max_total_exposure <= Decimal::ZERO {
            bail!("max_total_exposure must be positive");
        }
        if self.circuit_breaker_pct <= Decimal::ZERO {
            bail!("circuit_breaker_pct must be positive");
        }
        if self.pre_expiry_pull.as_secs() as i64 >= self.mode.minutes() * 60 {
            bail!("pre_expiry_pull must be shorter than the market window");
        }
        if self.volatility_lookback < 30 {
            bail!("volatility_lookback must be at least 30 candles");
        }
        if self.endpoints.rpc_endpoints.is_empty() {
            bail!("at least one RPC endpoint must be configured");
        }
        if self.sniper.min_minutes_left >= self.sniper.max_minutes_left {
            bail!("sniper entry window is empty");
        }
        if self.sniper.max_token_price <= Decimal::ZERO
            || self.sniper.max_token_price >= Decimal::ONE
        {
            bail!("sniper max_token_price must be between 0 and 1");
        }
        Ok(())
    }
}

fn parse_mode(s: &str) -> Result<WindowMode> {
    s.parse::<WindowMode>().map_err(|e| anyhow::anyhow!(e))
}

fn parse_assets(list: &[String]) -> Result<Vec<CryptoAsset>> {
    list.iter()
        .map(|s| s.parse::<CryptoAsset>().map_err(|e| anyhow::anyhow!(e)))
        .collect()
}

/// Convert f64 percentage to Decimal ratio (e.g., 0.5 -> 0.005).
fn pct_to_decimal(pct: f64) -> Decimal {
    Decimal::try_from(pct / 100.0).unwrap_or(Decimal::ZERO)
}

fn f64_to_decimal(val: f64) -> Decimal {
    Decimal::try_from(val).unwrap_or(Decimal::ZERO)
}

// ============================================================================
// TOML deserialization structures
// ============================================================================

#[derive(Debug, Default, Deserialize)]
struct TomlConfig {
    #[serde(default)]
    general: GeneralToml,
    #[serde(default)]
    quoting: QuotingToml,
    #[serde(default)]
    fair_value: FairValueToml,
    #[serde(default)]
    sniper: SniperToml,
    #[serde(default)]
    endpoints: EndpointsToml,
}

#[derive(Debug, Deserialize)]
#[serde(default)]
struct GeneralToml {
    mode: String,
    assets: Option<Vec<String>>,
    log_level: Option<String>,
}

impl Default for GeneralToml {
    fn default() -> Self {
        Self {
            mode: "15m".to_string(),
            assets: None,
            log_level: None,
        }
    }
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct QuotingToml {
    base_spread_cents: Option<u32>,
    max_position_size: Option<f64>,
    max_total_exposure: Option<f64>,
    quote_refresh_ms: Option<u64>,
    pre_expiry_pull_secs: Option<u64>,
    circuit_breaker_pct: Option<f64>,
    one_side_fill_timeout_ms: Option<u64>,
    volatility_lookback: Option<u32>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct FairValueToml {
    enabled: Option<bool>,
    min_edge_cents: Option<u32>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct SniperToml {
    min_minutes_left: Option<f64>,
    max_minutes_left: Option<f64>,
    min_price_diff_pct: Option<f64>,
    max_token_price: Option<f64>,
    tier1_size: Option<f64>,
    tier2_diff_pct: Option<f64>,
    tier2_size: Option<f64>,
    tier3_diff_pct: Option<f64>,
    tier3_size: Option<f64>,
    max_concurrent_positions: Option<usize>,
    max_exposure: Option<f64>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct EndpointsToml {
    clob_rest: Option<String>,
    clob_ws: Option<String>,
    catalog: Option<String>,
    exchange_rest: Option<String>,
    exchange_ws: Option<String>,
    rpc_endpoints: Option<Vec<String>>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn test_presets_differ_by_mode() {
        let long = EngineConfig::preset_15m();
        let short = EngineConfig::preset_5m();

        assert_eq!(long.mode, WindowMode::FifteenMin);
        assert_eq!(short.mode, WindowMode::FiveMin);
        assert!(short.base_spread_cents > long.base_spread_cents);
        assert!(short.quote_refresh < long.quote_refresh);
        assert!(short.pre_expiry_pull < long.pre_expiry_pull);
        assert!(long.validate().is_ok());
        assert!(short.validate().is_ok());
    }

    #[test]
    fn test_parse_toml_overrides_preset() {
        let toml = r#"
            [general]
            mode = "5m"
            assets = ["BTC"]
            log_level = "debug"

            [quoting]
            base_spread_cents = 6
            max_position_size = 250.0
            circuit_breaker_pct = 0.4

            [fair_value]
            enabled = true
            min_edge_cents = 5
        "#;

        let config = EngineConfig::from_toml_str(toml).unwrap();
        assert_eq!(config.mode, WindowMode::FiveMin);
        assert_eq!(config.assets, vec![CryptoAsset::Btc]);
        assert_eq!(config.log_level, "debug");
        assert_eq!(config.base_spread_cents, 6);
        assert_eq!(config.max_position_size, dec!(250));
        assert_eq!(config.circuit_breaker_pct, dec!(0.004));
        assert!(config.fair_value_enabled);
        assert_eq!(config.min_edge_cents, 5);
        // Untouched fields keep the 5m preset.
        assert_eq!(config.quote_refresh, Duration::from_millis(1000));
    }

    #[test]
    fn test_parse_toml_sniper_and_endpoints() {
        let toml = r#"
            [general]
            mode = "15m"

            [sniper]
            min_price_diff_pct = 0.2
            max_token_price = 0.9
            max_concurrent_positions = 5

            [endpoints]
            clob_rest = "http://localhost:8080"
            rpc_endpoints = ["http://localhost:8545"]
        "#;

        let config = EngineConfig::from_toml_str(toml).unwrap();
        assert_eq!(config.sniper.min_price_diff_pct, dec!(0.002));
        assert_eq!(config.sniper.max_token_price, dec!(0.9));
        assert_eq!(config.sniper.max_concurrent_positions, 5);
        assert_eq!(config.endpoints.clob_rest, "http://localhost:8080");
        assert_eq!(config.endpoints.rpc_endpoints.len(), 1);
    }

    #[test]
    fn test_unknown_mode_and_asset_are_rejected() {
        assert!(EngineConfig::from_toml_str("[general]\nmode = \"1h\"").is_err());
        assert!(
            EngineConfig::from_toml_str("[general]\nmode = \"15m\"\nassets = [\"DOGE\"]").is_err()
        );
    }

    #[test]
    fn test_cli_override_reseeds_preset_timings() {
        let mut config = EngineConfig::preset_15m();
        config.apply_cli_overrides(Some("5m".to_string()), Some(vec!["ETH".to_string()]));

        assert_eq!(config.mode, WindowMode::FiveMin);
        assert_eq!(config.quote_refresh, Duration::from_millis(1000));
        assert_eq!(config.assets, vec![CryptoAsset::Eth]);
    }

    #[test]
    fn test_validate_rejects_bad_values() {
        let mut config = EngineConfig::preset_15m();
        config.assets.clear();
        assert!(config.validate().is_err());

        let mut config = EngineConfig::preset_15m();
        config.pre_expiry_pull = Duration::from_secs(15 * 60);
        assert!(config.validate().is_err());

        let mut config = EngineConfig::preset_15m();
        config.volatility_lookback = 10;
        assert!(config.validate().is_err());

        let mut config = EngineConfig::preset_15m();
        config.sniper.min_minutes_left = 5.0;
        config.sniper.max_minutes_left = 3.0;
        assert!(config.validate().is_err());
    }
}
