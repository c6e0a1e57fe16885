//! Wire types for the market catalog.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::finder::FinderError;

/// One market as returned by the venue's catalog API.
///
/// Every field the engine depends on is explicit; absent fields stay
/// `Option` rather than being defaulted into plausible-looking values.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CatalogMarket {
    /// Market identifier (condition id on the venue).
    pub id: String,
    /// Question text, e.g. "Bitcoin Up or Down - 3:45pm-4:00pm ET".
    pub question: String,
    /// YES instrument id.
    #[serde(rename = "yesTokenId")]
    pub yes_token_id: Option<String>,
    /// NO instrument id.
    #[serde(rename = "noTokenId")]
    pub no_token_id: Option<String>,
    /// Market end time.
    #[serde(rename = "endDate")]
    pub end_date: Option<DateTime<Utc>>,
    /// Whether the market is accepting orders.
    #[serde(default)]
    pub active: bool,
    /// Whether the market has closed.
    #[serde(default)]
    pub closed: bool,
    /// Negative-risk settlement variant flag.
    #[serde(rename = "negRisk", default)]
    pub neg_risk: bool,
}

/// Query filters for a catalog scan.
#[derive(Debug, Clone)]
pub struct CatalogQuery {
    pub active: bool,
    pub closed: bool,
    /// Sort field, ascending. The finder always asks for "endDate".
    pub order: &'static str,
    pub ascending: bool,
    /// Maximum number of markets to return.
    pub limit: u32,
    /// Venue tag for the window duration (e.g. "5M"/"15M"), if any.
    pub window_tag: Option<&'static str>,
}

impl Default for CatalogQuery {
    fn default() -> Self {
        Self {
            active: true,
            closed: false,
            order: "endDate",
            ascending: true,
            limit: 100,
            window_tag: None,
        }
    }
}

/// Market catalog lookup contract.
#[async_trait]
pub trait MarketCatalog: Send + Sync {
    async fn list_markets(&self, query: &CatalogQuery) -> Result<Vec<CatalogMarket>, FinderError>;
}

/// An explicit session window parsed out of a market question.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SessionWindow {
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
}

impl SessionWindow {
    /// Window width in whole minutes.
    pub fn width_minutes(&self) -> i64 {
        (self.end - self.start).num_minutes()
    }
}
