//! Market discovery.
//!
//! Scans the venue catalog for active, short-window crypto markets,
//! parses the session window and strike out of the question text, and
//! keeps the single soonest-expiring candidate per asset.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use mm_common::{CryptoAsset, WindowMode};
use regex::Regex;
use reqwest::Client;
use rust_decimal::Decimal;
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::types::{CatalogMarket, CatalogQuery, MarketCatalog, SessionWindow};

/// Errors from catalog access and market parsing.
#[derive(Debug, Error)]
pub enum FinderError {
    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("JSON parsing failed: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Invalid market data: {0}")]
    InvalidData(String),
}

/// Historical spot lookup, used to derive a strike for markets that key
/// off the session-open price instead of an explicit dollar amount.
#[async_trait]
pub trait HistoricalSpot: Send + Sync {
    /// Spot price at (or immediately before) the given instant.
    async fn price_at(&self, asset: CryptoAsset, at: DateTime<Utc>) -> Option<Decimal>;
}

/// A market that passed all finder filters and is ready to quote.
#[derive(Debug, Clone)]
pub struct FoundMarket {
    pub market_id: String,
    pub question: String,
    pub asset: CryptoAsset,
    pub yes_token_id: String,
    pub no_token_id: String,
    pub end_time: DateTime<Utc>,
    /// Strike price. `None` when neither the question nor the historical
    /// lookup could produce one.
    pub strike: Option<Decimal>,
    pub neg_risk: bool,
    pub window: SessionWindow,
}

impl FoundMarket {
    pub fn minutes_remaining(&self, now: DateTime<Utc>) -> f64 {
        (self.end_time - now).num_seconds() as f64 / 60.0
    }
}

/// Finder configuration.
#[derive(Debug, Clone)]
pub struct FinderConfig {
    pub assets: Vec<CryptoAsset>,
    pub mode: WindowMode,
}

impl FinderConfig {
    pub fn new(assets: Vec<CryptoAsset>, mode: WindowMode) -> Self {
        Self { assets, mode }
    }

    fn window_tag(&self) -> Option<&'static str> {
        match self.mode {
            WindowMode::FiveMin => Some("5M"),
            WindowMode::FifteenMin => Some("15M"),
        }
    }
}

/// Market discovery client.
pub struct MarketFinder {
    catalog: Arc<dyn MarketCatalog>,
    history: Arc<dyn HistoricalSpot>,
    config: FinderConfig,
    strike_re: Regex,
    window_re: Regex,
    single_time_re: Regex,
}

impl MarketFinder {
    pub fn new(
        catalog: Arc<dyn MarketCatalog>,
        history: Arc<dyn HistoricalSpot>,
        config: FinderConfig,
    ) -> Self {
        Self {
            catalog,
            history,
            config,
            // "$97,500" or "$0.58" - commas stripped before parsing.
            strike_re: Regex::new(r"\$([0-9][0-9,]*(?:\.[0-9]+)?)")
                .expect("static regex"),
            // "3:45pm-4:00pm" or "3:45 PM - 4:00 PM"
            window_re: Regex::new(
                r"(?i)(\d{1,2}):(\d{2})\s*(am|pm)?\s*[-\u{2013}]\s*(\d{1,2}):(\d{2})\s*(am|pm)",
            )
            .expect("static regex"),
            // "at 5:00 PM"
            single_time_re: Regex::new(r"(?i)at\s+(\d{1,2}):(\d{2})\s*(am|pm)")
                .expect("static regex"),
        }
    }

    /// Scan the catalog. Returns at most one market per configured asset,
    /// the soonest-expiring one, already parsed and strike-resolved.
    pub async fn scan(&self, now: DateTime<Utc>) -> Result<Vec<FoundMarket>, FinderError> {
        let query = CatalogQuery {
            window_tag: self.config.window_tag(),
            ..CatalogQuery::default()
        };
        let markets = self.catalog.list_markets(&query).await?;
        debug!(count = markets.len(), mode = %self.config.mode, "catalog scan");

        let mut best: Vec<FoundMarket> = Vec::new();
        for market in &markets {
            let candidate = match self.parse_market(market, now) {
                Some(c) => c,
                None => continue,
            };
            match best.iter_mut().find(|m| m.asset == candidate.asset) {
                Some(existing) => {
                    if candidate.end_time < existing.end_time {
                        *existing = candidate;
                    }
                }
                None => best.push(candidate),
            }
        }

        let mut found = Vec::with_capacity(best.len());
        for candidate in best {
            let resolved = self.resolve_strike(candidate).await;
            info!(
                market = %resolved.market_id,
                asset = %resolved.asset,
                strike = ?resolved.strike,
                end = %resolved.end_time,
                "found market"
            );
            found.push(resolved);
        }
        Ok(found)
    }

    /// Filter and parse one catalog entry. Returns `None` for markets the
    /// finder is not interested in; hard data problems are logged, not
    /// propagated (one bad market must not sink the scan).
    fn parse_market(&self, market: &CatalogMarket, now: DateTime<Utc>) -> Option<FoundMarket> {
        if !market.active || market.closed {
            return None;
        }

        let asset = CryptoAsset::detect(&market.question)?;
        if !self.config.assets.contains(&asset) {
            return None;
        }

        let end_time = market.end_date?;
        if end_time <= now {
            return None;
        }

        let (yes_token_id, no_token_id) =
            match (&market.yes_token_id, &market.no_token_id) {
                (Some(y), Some(n)) => (y.clone(), n.clone()),
                _ => {
                    warn!(market = %market.id, "market missing instrument ids, skipping");
                    return None;
                }
            };

        let window = match self.parse_window(&market.question, end_time) {
            Some(w) => {
                // Explicit windows must match the configured mode.
                let want = self.config.mode.minutes();
                let tol = self.config.mode.tolerance_minutes();
                if (w.width_minutes() - want).abs() > tol {
                    debug!(
                        market = %market.id,
                        width = w.width_minutes(),
                        want,
                        "window width mismatch, skipping"
                    );
                    return None;
                }
                w
            }
            // Strike-style questions carry a single settlement time; the
            // window is synthesized from the configured mode.
            None => SessionWindow {
                start: end_time - Duration::minutes(self.config.mode.minutes()),
                end: end_time,
            },
        };

        let strike = self.parse_strike(&market.question);

        Some(FoundMarket {
            market_id: market.id.clone(),
            question: market.question.clone(),
            asset,
            yes_token_id,
            no_token_id,
            end_time,
            strike,
            neg_risk: market.neg_risk,
            window,
        })
    }

    /// Extract the dollar strike from the question, if present.
    fn parse_strike(&self, question: &str) -> Option<Decimal> {
        let caps = self.strike_re.captures(question)?;
        let raw = caps.get(1)?.as_str().replace(',', "");
        raw.parse::<Decimal>().ok()
    }

    /// Parse an explicit "start-end" session window out of the question.
    ///
    /// The question only carries clock times in the venue's local zone;
    /// the absolute end instant comes from the catalog. The window is
    /// anchored on that: width is taken from the parsed clock times and
    /// the start derived as `end - width`, which sidesteps zone handling
    /// entirely.
    fn parse_window(&self, question: &str, end_time: DateTime<Utc>) -> Option<SessionWindow> {
        let caps = self.window_re.captures(question)?;

        let start_h: i64 = caps.get(1)?.as_str().parse().ok()?;
        let start_m: i64 = caps.get(2)?.as_str().parse().ok()?;
        let end_h: i64 = caps.get(4)?.as_str().parse().ok()?;
        let end_m: i64 = caps.get(5)?.as_str().parse().ok()?;
        let end_meridiem = caps.get(6)?.as_str().to_lowercase();
        // A missing start meridiem inherits the end's ("3:45-4:00pm").
        let start_meridiem = caps
            .get(3)
            .map(|m| m.as_str().to_lowercase())
            .unwrap_or_else(|| end_meridiem.clone());

        let start_min = clock_minutes(start_h, start_m, &start_meridiem)?;
        let end_min = clock_minutes(end_h, end_m, &end_meridiem)?;
        // Windows never span midnight for these markets, but "11:55pm-12:10am"
        // style wraps are handled by the modulo.
        let width = (end_min - start_min).rem_euclid(24 * 60);
        if width == 0 {
            return None;
        }

        Some(SessionWindow {
            start: end_time - Duration::minutes(width),
            end: end_time,
        })
    }

    /// True if the question carries only a single settlement time (the
    /// "above $X at 5:00 PM" shape) rather than a start-end window.
    pub fn is_single_time(&self, question: &str) -> bool {
        self.window_re.captures(question).is_none()
            && self.single_time_re.captures(question).is_some()
    }

    /// Fill in a missing strike from the session-open spot price.
    async fn resolve_strike(&self, mut market: FoundMarket) -> FoundMarket {
        if market.strike.is_some() {
            return market;
        }
        match self.history.price_at(market.asset, market.window.start).await {
            Some(price) => {
                debug!(
                    market = %market.market_id,
                    strike = %price,
                    "derived strike from session-open price"
                );
                market.strike = Some(price);
            }
            None => {
                warn!(
                    market = %market.market_id,
                    "no session-open price available, strike stays unknown"
                );
            }
        }
        market
    }
}

/// Minutes-of-day for a 12-hour clock time.
fn clock_minutes(hour: i64, minute: i64, meridiem: &str) -> Option<i64> {
    if !(1..=12).contains(&hour) || !(0..60).contains(&minute) {
        return None;
    }
    let h24 = match (meridiem, hour) {
        ("am", 12) => 0,
        ("am", h) => h,
        ("pm", 12) => 12,
        ("pm", h) => h + 12,
        _ => return None,
    };
    Some(h24 * 60 + minute)
}

/// HTTP market catalog client.
pub struct HttpCatalog {
    http: Client,
    base_url: String,
}

impl HttpCatalog {
    pub fn new(base_url: impl Into<String>, timeout: std::time::Duration) -> Self {
        let http = Client::builder()
            .timeout(timeout)
            .build()
            .unwrap_or_default();
        Self {
            http,
            base_url: base_url.into(),
        }
    }
}

#[async_trait]
impl MarketCatalog for HttpCatalog {
    async fn list_markets(&self, query: &CatalogQuery) -> Result<Vec<CatalogMarket>, FinderError> {
        let mut url = format!(
            "{}/markets?active={}&closed={}&order={}&ascending={}&limit={}",
            self.base_url, query.active, query.closed, query.order, query.ascending, query.limit
        );
        if let Some(tag) = query.window_tag {
            url.push_str(&format!("&tag_slug={}", tag));
        }

        let response = self.http.get(&url).send().await?;
        if !response.status().is_success() {
            return Err(FinderError::InvalidData(format!(
                "catalog returned status {}",
                response.status()
            )));
        }
        let markets: Vec<CatalogMarket> = response.json().await?;
        Ok(markets)
    }
}
