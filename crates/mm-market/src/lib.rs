//! Market discovery and streaming clients.
//!
//! This crate owns everything venue-facing that is not order execution:
//! the market catalog scan ([`finder::MarketFinder`]), the order book and
//! spot price streaming clients, candle history for volatility inputs,
//! and the process-wide token metadata cache.

pub mod book_stream;
pub mod candles;
pub mod finder;
pub mod metadata;
pub mod spot_stream;
pub mod types;

pub use book_stream::{BookEvent, BookStream, BookStreamConfig, BookStreamHandle, TopOfBook};
pub use candles::{CandleError, CandleSource, HttpCandleSource};
pub use finder::{FinderConfig, FinderError, FoundMarket, HistoricalSpot, HttpCatalog, MarketFinder};
pub use metadata::{MetadataCache, TokenMeta};
pub use spot_stream::{
    HttpSpotQuote, SpotCache, SpotEvent, SpotPriceStream, SpotQuote, SpotStreamConfig,
    SpotStreamHandle, MAX_SPOT_AGE,
};
pub use types::{CatalogMarket, CatalogQuery, MarketCatalog, SessionWindow};
