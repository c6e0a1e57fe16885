//! Token metadata cache.
//!
//! Tick size and settlement variant are needed on every quote but
//! change essentially never, so lookups go through a process-wide cache
//! with a short TTL instead of hitting the venue each time.

use std::time::{Duration, Instant};

use dashmap::DashMap;
use reqwest::Client;
use rust_decimal::Decimal;
use rust_decimal::prelude::FromPrimitive;
use serde::Deserialize;
use tracing::{debug, warn};

/// Default cache TTL.
pub const DEFAULT_META_TTL: Duration = Duration::from_secs(300);

/// Per-instrument venue metadata.
#[derive(Debug, Clone, PartialEq)]
pub struct TokenMeta {
    /// Minimum price increment for orders on this instrument.
    pub tick_size: Decimal,
    /// Negative-risk settlement variant flag.
    pub neg_risk: bool,
}

impl Default for TokenMeta {
    fn default() -> Self {
        Self {
            // Coarsest tick the venue uses; a wrong-but-coarse tick only
            // rounds prices, never produces a rejected order.
            tick_size: Decimal::new(1, 2),
            neg_risk: false,
        }
    }
}

#[derive(Debug, Deserialize)]
struct TickSizeResponse {
    minimum_tick_size: f64,
}

struct CacheEntry {
    meta: TokenMeta,
    fetched_at: Instant,
}

/// Metadata cache over the venue REST API.
pub struct MetadataCache {
    http: Client,
    base_url: String,
    ttl: Duration,
    cache: DashMap<String, CacheEntry>,
}

impl MetadataCache {
    pub fn new(base_url: impl Into<String>, request_timeout: Duration) -> Self {
        let http = Client::builder()
            .timeout(request_timeout)
            .build()
            .unwrap_or_default();
        Self {
            http,
            base_url: base_url.into(),
            ttl: DEFAULT_META_TTL,
            cache: DashMap::new(),
        }
    }

    pub fn with_ttl(mut self, ttl: Duration) -> Self {
        self.ttl = ttl;
        self
    }

    /// Seed an entry directly, e.g. from market discovery where the
    /// settlement variant is already known.
    pub fn insert(&self, token_id: &str, meta: TokenMeta) {
        self.cache.insert(
            token_id.to_string(),
            CacheEntry {
                meta,
                fetched_at: Instant::now(),
            },
        );
    }

    /// Metadata for an instrument. Serves from cache within the TTL,
    /// otherwise refetches. On fetch failure a stale entry is better
    /// than nothing, and with no entry at all the defaults apply.
    pub async fn get(&self, token_id: &str, neg_risk: bool) -> TokenMeta {
        if let Some(entry) = self.cache.get(token_id) {
            if entry.fetched_at.elapsed() < self.ttl {
                return entry.meta.clone();
            }
        }

        match self.fetch_tick_size(token_id).await {
            Some(tick_size) => {
                let meta = TokenMeta {
                    tick_size,
                    neg_risk,
                };
                self.insert(token_id, meta.clone());
                meta
            }
            None => self
                .cache
                .get(token_id)
                .map(|e| e.meta.clone())
                .unwrap_or_else(|| TokenMeta {
                    neg_risk,
                    ..TokenMeta::default()
                }),
        }
    }

    async fn fetch_tick_size(&self, token_id: &str) -> Option<Decimal> {
        let url = format!("{}/tick-size?token_id={}", self.base_url, token_id);
        let response = match self.http.get(&url).send().await {
            Ok(r) => r,
            Err(e) => {
                warn!("tick size request failed: {e}");
                return None;
            }
        };
        let parsed: TickSizeResponse = match response.json().await {
            Ok(p) => p,
            Err(e) => {
                warn!("tick size parse failed: {e}");
                return None;
            }
        };
        debug!(token = token_id, tick = parsed.minimum_tick_size, "fetched tick size");
        Decimal::from_f64(parsed.minimum_tick_size)
    }
}
