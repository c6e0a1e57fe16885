//! Candle history client.
//!
//! Fetches recent klines from the exchange REST API. The volatility
//! classifier and realized-vol estimator both run off this data; the
//! finder also uses it to look up the spot price at a session open.

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use mm_common::{Candle, CryptoAsset};
use reqwest::Client;
use rust_decimal::Decimal;
use serde_json::Value;
use thiserror::Error;
use tracing::{debug, warn};

use crate::finder::HistoricalSpot;

#[derive(Debug, Error)]
pub enum CandleError {
    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Invalid kline data: {0}")]
    InvalidData(String),
}

/// Candle history contract.
#[async_trait]
pub trait CandleSource: Send + Sync {
    /// Most recent `limit` candles at the given interval (e.g. "1m"),
    /// oldest first.
    async fn recent_candles(
        &self,
        asset: CryptoAsset,
        interval: &str,
        limit: u32,
    ) -> Result<Vec<Candle>, CandleError>;
}

/// Candle client against the exchange klines endpoint.
pub struct HttpCandleSource {
    http: Client,
    base_url: String,
}

impl HttpCandleSource {
    pub fn new(base_url: impl Into<String>, request_timeout: Duration) -> Self {
        let http = Client::builder()
            .timeout(request_timeout)
            .build()
            .unwrap_or_default();
        Self {
            http,
            base_url: base_url.into(),
        }
    }

    async fn fetch_klines(&self, url: &str) -> Result<Vec<Candle>, CandleError> {
        let response = self.http.get(url).send().await?;
        if !response.status().is_success() {
            return Err(CandleError::InvalidData(format!(
                "klines returned status {}",
                response.status()
            )));
        }
        let rows: Vec<Vec<Value>> = response.json().await?;

        let mut candles = Vec::with_capacity(rows.len());
        for row in &rows {
            match parse_kline_row(row) {
                Some(candle) => candles.push(candle),
                None => {
                    debug!("skipping malformed kline row");
                }
            }
        }
        Ok(candles)
    }
}

/// One kline row is a JSON array:
/// `[openTime, "open", "high", "low", "close", "volume", closeTime, ...]`.
fn parse_kline_row(row: &[Value]) -> Option<Candle> {
    if row.len() < 5 {
        return None;
    }
    let open_time_ms = row[0].as_i64()?;
    let open_time = Utc.timestamp_millis_opt(open_time_ms).single()?;
    let open: f64 = row[1].as_str()?.parse().ok()?;
    let high: f64 = row[2].as_str()?.parse().ok()?;
    let low: f64 = row[3].as_str()?.parse().ok()?;
    let close: f64 = row[4].as_str()?.parse().ok()?;

    Some(Candle {
        open_time,
        open,
        high,
        low,
        close,
    })
}

#[async_trait]
impl CandleSource for HttpCandleSource {
    async fn recent_candles(
        &self,
        asset: CryptoAsset,
        interval: &str,
        limit: u32,
    ) -> Result<Vec<Candle>, CandleError> {
        let url = format!(
            "{}/api/v3/klines?symbol={}&interval={}&limit={}",
            self.base_url,
            asset.spot_symbol().to_uppercase(),
            interval,
            limit
        );
        self.fetch_klines(&url).await
    }
}

#[async_trait]
impl HistoricalSpot for HttpCandleSource {
    /// Open of the 1m candle covering `at`. Best effort: lookup failures
    /// are logged and reported as `None`, the caller decides what a
    /// missing strike means.
    async fn price_at(&self, asset: CryptoAsset, at: DateTime<Utc>) -> Option<Decimal> {
        let start_ms = at.timestamp_millis();
        let url = format!(
            "{}/api/v3/klines?symbol={}&interval=1m&startTime={}&limit=1",
            self.base_url,
            asset.spot_symbol().to_uppercase(),
            start_ms
        );
        match self.fetch_klines(&url).await {
            Ok(candles) => candles
                .first()
                .and_then(|c| Decimal::try_from(c.open).ok()),
            Err(e) => {
                warn!(asset = %asset, "historical spot lookup failed: {e}");
                None
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_parse_kline_row() {
        let row = vec![
            json!(1704067200000i64),
            json!("42000.50"),
            json!("42100.00"),
            json!("41900.00"),
            json!("42050.25"),
            json!("12.5"),
            json!(1704067259999i64),
        ];
        let candle = parse_kline_row(&row).unwrap();
        assert_eq!(candle.open, 42000.50);
        assert_eq!(candle.high, 42100.00);
        assert_eq!(candle.low, 41900.00);
        assert_eq!(candle.close, 42050.25);
        assert_eq!(candle.open_time.timestamp_millis(), 1704067200000);
        assert!(candle.is_valid());
    }

    #[test]
    fn test_parse_kline_row_malformed() {
        assert!(parse_kline_row(&[json!(1), json!("a")]).is_none());
        let bad_price = vec![
            json!(1704067200000i64),
            json!("not-a-number"),
            json!("42100.00"),
            json!("41900.00"),
            json!("42050.25"),
        ];
        assert!(parse_kline_row(&bad_price).is_none());
        // Numeric instead of string prices.
        let numeric = vec![
            json!(1704067200000i64),
            json!(42000.5),
            json!(42100.0),
            json!(41900.0),
            json!(42050.25),
        ];
        assert!(parse_kline_row(&numeric).is_none());
    }
}
