//! Exchange spot price stream.
//!
//! Subscribes to trade streams for the configured assets and keeps a
//! shared last-price cache. Consumers read the cache through
//! [`SpotCache::latest`], which enforces a staleness bound so a dead
//! stream can never feed old prices into pricing. A pull-based
//! [`SpotQuote`] fallback covers the gap while the stream reconnects.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use dashmap::DashMap;
use futures_util::{SinkExt, StreamExt};
use mm_common::{CryptoAsset, SpotTick};
use reqwest::Client;
use rust_decimal::Decimal;
use serde::Deserialize;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::time::timeout;
use tokio_tungstenite::{
    connect_async,
    tungstenite::{protocol::Message, Error as WsError},
};
use tracing::{debug, error, info, warn};

/// Prices older than this are not served from the cache.
pub const MAX_SPOT_AGE: Duration = Duration::from_secs(30);

#[derive(Debug, Error)]
pub enum SpotStreamError {
    #[error("WebSocket connection failed: {0}")]
    Connection(String),

    #[error("WebSocket error: {0}")]
    WebSocket(#[from] WsError),

    #[error("JSON parse error: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("Connection timeout")]
    Timeout,

    #[error("Stream ended unexpectedly")]
    StreamEnded,
}

/// Configuration for the spot stream client.
#[derive(Debug, Clone)]
pub struct SpotStreamConfig {
    pub ws_url: String,
    pub assets: Vec<CryptoAsset>,
    pub connect_timeout: Duration,
    pub initial_reconnect_delay: Duration,
    pub max_reconnect_delay: Duration,
    pub event_buffer: usize,
}

impl Default for SpotStreamConfig {
    fn default() -> Self {
        Self {
            ws_url: "wss://stream.binance.com:9443/ws".to_string(),
            assets: CryptoAsset::all().to_vec(),
            connect_timeout: Duration::from_secs(10),
            initial_reconnect_delay: Duration::from_secs(1),
            max_reconnect_delay: Duration::from_secs(30),
            event_buffer: 1024,
        }
    }
}

/// Events delivered to the consumer.
#[derive(Debug, Clone)]
pub enum SpotEvent {
    Tick(SpotTick),
    Connected,
    Disconnected,
}

/// Pull-based spot price source, used while the stream is down.
#[async_trait]
pub trait SpotQuote: Send + Sync {
    async fn latest_price(&self, asset: CryptoAsset) -> Option<Decimal>;
}

/// Shared last-price cache, updated by the stream task.
#[derive(Default)]
pub struct SpotCache {
    prices: DashMap<CryptoAsset, SpotTick>,
}

impl SpotCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn update(&self, tick: SpotTick) {
        self.prices.insert(tick.asset, tick);
    }

    /// Latest price for an asset, or `None` when the cached tick is
    /// older than [`MAX_SPOT_AGE`].
    pub fn latest(&self, asset: CryptoAsset, now: DateTime<Utc>) -> Option<SpotTick> {
        let tick = self.prices.get(&asset)?.clone();
        let age = now - tick.timestamp;
        if age.num_seconds() >= 0 && age.to_std().ok()? <= MAX_SPOT_AGE {
            Some(tick)
        } else {
            None
        }
    }
}

/// Trade message from the exchange stream.
#[derive(Debug, Deserialize)]
struct ExchangeTrade {
    #[serde(rename = "s")]
    symbol: String,
    #[serde(rename = "p")]
    price: String,
    #[serde(rename = "T")]
    trade_time: u64,
}

#[derive(Debug, serde::Serialize)]
struct SubscribeRequest {
    method: &'static str,
    params: Vec<String>,
    id: u64,
}

fn symbol_to_asset(symbol: &str) -> Option<CryptoAsset> {
    CryptoAsset::all()
        .iter()
        .copied()
        .find(|a| a.spot_symbol().eq_ignore_ascii_case(symbol))
}

/// Handle for controlling a running [`SpotPriceStream`].
#[derive(Clone)]
pub struct SpotStreamHandle {
    closing: Arc<AtomicBool>,
    cache: Arc<SpotCache>,
}

impl SpotStreamHandle {
    pub fn close(&self) {
        self.closing.store(true, Ordering::SeqCst);
    }

    pub fn cache(&self) -> Arc<SpotCache> {
        Arc::clone(&self.cache)
    }
}

/// Spot trade streaming client with automatic reconnection.
pub struct SpotPriceStream {
    config: SpotStreamConfig,
    closing: Arc<AtomicBool>,
    cache: Arc<SpotCache>,
    events: mpsc::Sender<SpotEvent>,
}

impl SpotPriceStream {
    /// Spawn the stream task. Returns the control handle and the event
    /// receiver; the handle also exposes the shared price cache.
    pub fn spawn(config: SpotStreamConfig) -> (SpotStreamHandle, mpsc::Receiver<SpotEvent>) {
        let (tx, rx) = mpsc::channel(config.event_buffer);
        let closing = Arc::new(AtomicBool::new(false));
        let cache = Arc::new(SpotCache::new());

        let handle = SpotStreamHandle {
            closing: Arc::clone(&closing),
            cache: Arc::clone(&cache),
        };
        let stream = Self {
            config,
            closing,
            cache,
            events: tx,
        };
        tokio::spawn(async move { stream.run().await });

        (handle, rx)
    }

    async fn run(&self) {
        let mut reconnect_delay = self.config.initial_reconnect_delay;

        loop {
            if self.closing.load(Ordering::SeqCst) {
                info!("spot stream: closing");
                return;
            }

            match self.run_connection().await {
                Ok(()) => {
                    info!("spot stream: clean shutdown");
                    return;
                }
                Err(e) => {
                    if self.events.send(SpotEvent::Disconnected).await.is_err() {
                        return;
                    }
                    if self.closing.load(Ordering::SeqCst) {
                        return;
                    }
                    warn!("spot stream error: {e}, reconnecting in {reconnect_delay:?}");
                    tokio::time::sleep(reconnect_delay).await;
                    reconnect_delay =
                        (reconnect_delay * 2).min(self.config.max_reconnect_delay);
                }
            }
        }
    }

    async fn run_connection(&self) -> Result<(), SpotStreamError> {
        info!("connecting to spot stream at {}", self.config.ws_url);

        let connect_result =
            timeout(self.config.connect_timeout, connect_async(&self.config.ws_url)).await;
        let (ws_stream, _response) = match connect_result {
            Ok(Ok((stream, response))) => (stream, response),
            Ok(Err(e)) => return Err(SpotStreamError::Connection(e.to_string())),
            Err(_) => return Err(SpotStreamError::Timeout),
        };

        let (mut write, mut read) = ws_stream.split();

        let streams: Vec<String> = self
            .config
            .assets
            .iter()
            .map(|a| format!("{}@trade", a.spot_symbol().to_lowercase()))
            .collect();
        let subscribe = SubscribeRequest {
            method: "SUBSCRIBE",
            params: streams.clone(),
            id: 1,
        };
        let msg = serde_json::to_string(&subscribe)?;
        write.send(Message::Text(msg.into())).await?;
        info!("spot stream subscribed: {:?}", streams);

        if self.events.send(SpotEvent::Connected).await.is_err() {
            return Ok(());
        }

        loop {
            if self.closing.load(Ordering::SeqCst) {
                let _ = write.send(Message::Close(None)).await;
                return Ok(());
            }

            match read.next().await {
                Some(Ok(Message::Text(text))) => {
                    if let Some(tick) = self.parse_trade(&text) {
                        self.cache.update(tick.clone());
                        // A full channel only costs the consumer a tick
                        // it would immediately supersede anyway.
                        let _ = self.events.try_send(SpotEvent::Tick(tick));
                    }
                }
                Some(Ok(Message::Ping(data))) => {
                    write.send(Message::Pong(data)).await?;
                }
                Some(Ok(Message::Pong(_))) => {
                    debug!("spot stream pong");
                }
                Some(Ok(Message::Close(frame))) => {
                    info!("spot stream closed by server: {:?}", frame);
                    if self.closing.load(Ordering::SeqCst) {
                        return Ok(());
                    }
                    return Err(SpotStreamError::StreamEnded);
                }
                Some(Err(e)) => {
                    error!("spot stream websocket error: {e}");
                    return Err(SpotStreamError::WebSocket(e));
                }
                None => {
                    warn!("spot stream ended");
                    return Err(SpotStreamError::StreamEnded);
                }
                _ => {}
            }
        }
    }

    fn parse_trade(&self, text: &str) -> Option<SpotTick> {
        // Subscription confirmations and other control frames.
        if text.contains("\"result\"") || text.contains("\"id\"") {
            debug!("spot stream ignoring non-trade message");
            return None;
        }

        let trade: ExchangeTrade = match serde_json::from_str(text) {
            Ok(t) => t,
            Err(e) => {
                debug!("failed to parse trade message: {e}");
                return None;
            }
        };

        let asset = symbol_to_asset(&trade.symbol)?;
        let price: Decimal = match trade.price.parse() {
            Ok(p) => p,
            Err(e) => {
                warn!("failed to parse price '{}': {e}", trade.price);
                return None;
            }
        };
        let timestamp = Utc.timestamp_millis_opt(trade.trade_time as i64).single()?;

        Some(SpotTick {
            asset,
            price,
            timestamp,
        })
    }
}

/// Pull-based spot quote via the exchange REST API.
pub struct HttpSpotQuote {
    http: Client,
    base_url: String,
}

impl HttpSpotQuote {
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
}

#[derive(Debug, Deserialize)]
struct TickerPrice {
    price: String,
}

#[async_trait]
impl SpotQuote for HttpSpotQuote {
    async fn latest_price(&self, asset: CryptoAsset) -> Option<Decimal> {
        let url = format!(
            "{}/api/v3/ticker/price?symbol={}",
            self.base_url,
            asset.spot_symbol().to_uppercase()
        );
        let response = match self.http.get(&url).send().await {
            Ok(r) => r,
            Err(e) => {
                warn!("spot quote request failed: {e}");
                return None;
            }
        };
        let ticker: TickerPrice = match response.json().await {
            Ok(t) => t,
            Err(e) => {
                warn!("spot quote parse failed: {e}");
                return None;
            }
        };
        ticker.price.parse().ok()
    }
}
