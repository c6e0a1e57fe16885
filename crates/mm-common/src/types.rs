//! Core market types shared across the workspace.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

/// Supported cryptocurrency assets for short-window markets.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum CryptoAsset {
    Btc,
    Eth,
    Sol,
    Xrp,
}

impl CryptoAsset {
    /// Spot feed trading pair symbol (e.g. "btcusdt").
    pub fn spot_symbol(&self) -> &'static str {
        match self {
            CryptoAsset::Btc => "btcusdt",
            CryptoAsset::Eth => "ethusdt",
            CryptoAsset::Sol => "solusdt",
            CryptoAsset::Xrp => "xrpusdt",
        }
    }

    /// Display name.
    pub fn as_str(&self) -> &'static str {
        match self {
            CryptoAsset::Btc => "BTC",
            CryptoAsset::Eth => "ETH",
            CryptoAsset::Sol => "SOL",
            CryptoAsset::Xrp => "XRP",
        }
    }

    /// Keywords that identify this asset in market question text.
    pub fn question_keywords(&self) -> &'static [&'static str] {
        match self {
            CryptoAsset::Btc => &["bitcoin", "btc"],
            CryptoAsset::Eth => &["ethereum", "eth"],
            CryptoAsset::Sol => &["solana", "sol"],
            CryptoAsset::Xrp => &["xrp", "ripple"],
        }
    }

    /// Detect the asset referenced by a (lowercased) question text.
    pub fn detect(question: &str) -> Option<Self> {
        let q = question.to_lowercase();
        [
            CryptoAsset::Btc,
            CryptoAsset::Eth,
            CryptoAsset::Sol,
            CryptoAsset::Xrp,
        ]
        .into_iter()
        .find(|asset| asset.question_keywords().iter().any(|kw| q.contains(kw)))
    }

    /// All supported assets.
    pub fn all() -> &'static [CryptoAsset] {
        &[
            CryptoAsset::Btc,
            CryptoAsset::Eth,
            CryptoAsset::Sol,
            CryptoAsset::Xrp,
        ]
    }
}

impl std::fmt::Display for CryptoAsset {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl std::str::FromStr for CryptoAsset {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_uppercase().as_str() {
            "BTC" => Ok(CryptoAsset::Btc),
            "ETH" => Ok(CryptoAsset::Eth),
            "SOL" => Ok(CryptoAsset::Sol),
            "XRP" => Ok(CryptoAsset::Xrp),
            _ => Err(format!("Unknown asset: {}", s)),
        }
    }
}

/// Market window mode. Markets are fixed 5- or 15-minute windows.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum WindowMode {
    /// 5-minute markets.
    FiveMin,
    /// 15-minute markets.
    #[default]
    FifteenMin,
}

impl WindowMode {
    /// Window duration in minutes.
    pub fn minutes(&self) -> i64 {
        match self {
            WindowMode::FiveMin => 5,
            WindowMode::FifteenMin => 15,
        }
    }

    /// Tolerance when matching a parsed window against this mode.
    pub fn tolerance_minutes(&self) -> i64 {
        2
    }

    /// Candle interval string for volatility lookups on this mode.
    pub fn candle_interval(&self) -> &'static str {
        match self {
            WindowMode::FiveMin => "1m",
            WindowMode::FifteenMin => "1m",
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            WindowMode::FiveMin => "5m",
            WindowMode::FifteenMin => "15m",
        }
    }
}

impl std::fmt::Display for WindowMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl std::str::FromStr for WindowMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "5m" | "5min" | "5" | "fivemin" => Ok(WindowMode::FiveMin),
            "15m" | "15min" | "15" | "fifteenmin" => Ok(WindowMode::FifteenMin),
            _ => Err(format!("Unknown window mode: {}", s)),
        }
    }
}

/// Order side.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Side {
    Buy,
    Sell,
}

impl Side {
    pub fn opposite(&self) -> Self {
        match self {
            Side::Buy => Side::Sell,
            Side::Sell => Side::Buy,
        }
    }
}

impl std::fmt::Display for Side {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Side::Buy => write!(f, "BUY"),
            Side::Sell => write!(f, "SELL"),
        }
    }
}

/// Binary market outcome leg.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Outcome {
    Yes,
    No,
}

impl Outcome {
    pub fn opposite(&self) -> Self {
        match self {
            Outcome::Yes => Outcome::No,
            Outcome::No => Outcome::Yes,
        }
    }
}

impl std::fmt::Display for Outcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Outcome::Yes => write!(f, "YES"),
            Outcome::No => write!(f, "NO"),
        }
    }
}

/// A spot price observation from the real-time feed.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SpotTick {
    pub asset: CryptoAsset,
    pub price: Decimal,
    pub timestamp: DateTime<Utc>,
}

/// One OHLC candle for volatility estimation.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Candle {
    pub open_time: DateTime<Utc>,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
}

impl Candle {
    /// A candle is usable for range-based estimators only if its OHLC
    /// values are positive and internally consistent.
    pub fn is_valid(&self) -> bool {
        self.open > 0.0
            && self.high > 0.0
            && self.low > 0.0
            && self.close > 0.0
            && self.high >= self.low
    }
}
