//! Venue order book WebSocket client.
//!
//! Maintains top-of-book for the tracked instrument ids and pushes an
//! event downstream on every change. The consumer is also told about
//! disconnects, because stale book data must pull quotes, not freeze
//! them.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, TimeZone, Utc};
use futures_util::{SinkExt, StreamExt};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::{mpsc, RwLock};
use tokio::time::{interval, timeout};
use tokio_tungstenite::{
    connect_async,
    tungstenite::{protocol::Message, Error as WsError},
};
use tracing::{debug, error, info, warn};

/// Keepalive interval; the venue expects a ping every 10s.
const PING_INTERVAL: Duration = Duration::from_secs(9);

/// How often the connection task checks for subscription changes.
const SUBSCRIPTION_CHECK_INTERVAL: Duration = Duration::from_secs(5);

#[derive(Debug, Error)]
pub enum BookStreamError {
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

/// Configuration for the book stream client.
#[derive(Debug, Clone)]
pub struct BookStreamConfig {
    pub ws_url: String,
    pub connect_timeout: Duration,
    pub initial_reconnect_delay: Duration,
    pub max_reconnect_delay: Duration,
    /// Capacity of the event channel to the consumer.
    pub event_buffer: usize,
}

impl Default for BookStreamConfig {
    fn default() -> Self {
        Self {
            ws_url: "wss://ws-subscriptions-clob.polymarket.com/ws/market".to_string(),
            connect_timeout: Duration::from_secs(10),
            initial_reconnect_delay: Duration::from_secs(1),
            max_reconnect_delay: Duration::from_secs(30),
            event_buffer: 1024,
        }
    }
}

/// Top-of-book for one instrument.
#[derive(Debug, Clone, PartialEq)]
pub struct TopOfBook {
    pub token_id: String,
    pub best_bid: Decimal,
    pub best_bid_size: Decimal,
    pub best_ask: Decimal,
    pub best_ask_size: Decimal,
    pub timestamp: DateTime<Utc>,
}

/// Events delivered to the consumer.
#[derive(Debug, Clone)]
pub enum BookEvent {
    /// Top-of-book changed for an instrument.
    Top(TopOfBook),
    /// Connection established and subscriptions sent.
    Connected,
    /// Connection lost. Book state held by the consumer is now stale.
    Disconnected,
}

/// Subscription message for the market channel.
#[derive(Debug, Serialize)]
struct SubscribeMessage {
    assets_ids: Vec<String>,
    #[serde(rename = "type")]
    msg_type: &'static str,
}

#[derive(Debug, Serialize)]
struct SubscriptionOp {
    assets_ids: Vec<String>,
    operation: &'static str,
}

#[derive(Debug, Deserialize)]
struct GenericMessage {
    event_type: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
struct OrderSummary {
    price: String,
    size: String,
}

#[derive(Debug, Clone, Deserialize)]
struct BookMessage {
    asset_id: String,
    timestamp: String,
    bids: Vec<OrderSummary>,
    asks: Vec<OrderSummary>,
}

#[derive(Debug, Clone, Deserialize)]
struct PriceChange {
    price: String,
    size: String,
    side: String,
}

#[derive(Debug, Clone, Deserialize)]
struct PriceChangeMessage {
    asset_id: String,
    timestamp: String,
    price_changes: Vec<PriceChange>,
}

/// In-memory book for a single instrument.
#[derive(Debug, Default)]
struct BookState {
    bids: HashMap<Decimal, Decimal>,
    asks: HashMap<Decimal, Decimal>,
}

impl BookState {
    fn apply_book(&mut self, book: &BookMessage) {
        self.bids.clear();
        self.asks.clear();
        for level in &book.bids {
            if let (Ok(price), Ok(size)) = (level.price.parse(), level.size.parse()) {
                self.bids.insert(price, size);
            }
        }
        for level in &book.asks {
            if let (Ok(price), Ok(size)) = (level.price.parse(), level.size.parse()) {
                self.asks.insert(price, size);
            }
        }
    }

    fn apply_price_change(&mut self, change: &PriceChange) {
        let price: Decimal = match change.price.parse() {
            Ok(p) => p,
            Err(_) => return,
        };
        let size: Decimal = match change.size.parse() {
            Ok(s) => s,
            Err(_) => return,
        };
        let side = match change.side.to_lowercase().as_str() {
            "buy" | "bid" => &mut self.bids,
            "sell" | "ask" => &mut self.asks,
            _ => return,
        };
        if size.is_zero() {
            side.remove(&price);
        } else {
            side.insert(price, size);
        }
    }

    fn top(&self, token_id: &str, timestamp: DateTime<Utc>) -> TopOfBook {
        let (best_bid, best_bid_size) = self
            .bids
            .iter()
            .max_by_key(|(p, _)| *p)
            .map(|(p, s)| (*p, *s))
            .unwrap_or((Decimal::ZERO, Decimal::ZERO));
        let (best_ask, best_ask_size) = self
            .asks
            .iter()
            .min_by_key(|(p, _)| *p)
            .map(|(p, s)| (*p, *s))
            .unwrap_or((Decimal::ONE, Decimal::ZERO));
        TopOfBook {
            token_id: token_id.to_string(),
            best_bid,
            best_bid_size,
            best_ask,
            best_ask_size,
            timestamp,
        }
    }
}

/// Handle for controlling a running [`BookStream`].
#[derive(Clone)]
pub struct BookStreamHandle {
    tokens: Arc<RwLock<HashSet<String>>>,
    closing: Arc<AtomicBool>,
}

impl BookStreamHandle {
    /// Replace the tracked instrument set. New ids are subscribed on the
    /// next subscription check; removed ids simply stop being forwarded.
    pub async fn set_tokens(&self, tokens: Vec<String>) {
        let mut guard = self.tokens.write().await;
        *guard = tokens.into_iter().collect();
    }

    /// Request a clean shutdown. The next disconnect (or the running
    /// connection noticing the flag) ends the task without reconnecting.
    pub fn close(&self) {
        self.closing.store(true, Ordering::SeqCst);
    }
}

/// Order book streaming client with automatic reconnection.
pub struct BookStream {
    config: BookStreamConfig,
    tokens: Arc<RwLock<HashSet<String>>>,
    closing: Arc<AtomicBool>,
    events: mpsc::Sender<BookEvent>,
}

impl BookStream {
    /// Spawn the stream task. Returns the control handle and the event
    /// receiver.
    pub fn spawn(config: BookStreamConfig) -> (BookStreamHandle, mpsc::Receiver<BookEvent>) {
        let (tx, rx) = mpsc::channel(config.event_buffer);
        let tokens = Arc::new(RwLock::new(HashSet::new()));
        let closing = Arc::new(AtomicBool::new(false));

        let handle = BookStreamHandle {
            tokens: Arc::clone(&tokens),
            closing: Arc::clone(&closing),
        };
        let stream = Self {
            config,
            tokens,
            closing,
            events: tx,
        };
        tokio::spawn(async move { stream.run().await });

        (handle, rx)
    }

    async fn run(&self) {
        let mut reconnect_delay = self.config.initial_reconnect_delay;

        loop {
            if self.closing.load(Ordering::SeqCst) {
                info!("book stream: closing");
                return;
            }

            match self.run_connection().await {
                Ok(()) => {
                    info!("book stream: clean shutdown");
                    return;
                }
                Err(e) => {
                    // Consumer must stop trusting its book state now.
                    if self.events.send(BookEvent::Disconnected).await.is_err() {
                        return;
                    }
                    if self.closing.load(Ordering::SeqCst) {
                        return;
                    }
                    warn!("book stream error: {e}, reconnecting in {reconnect_delay:?}");
                    tokio::time::sleep(reconnect_delay).await;
                    reconnect_delay =
                        (reconnect_delay * 2).min(self.config.max_reconnect_delay);
                }
            }
        }
    }

    async fn run_connection(&self) -> Result<(), BookStreamError> {
        info!("connecting to book stream at {}", self.config.ws_url);

        let connect_result =
            timeout(self.config.connect_timeout, connect_async(&self.config.ws_url)).await;
        let (ws_stream, _response) = match connect_result {
            Ok(Ok((stream, response))) => (stream, response),
            Ok(Err(e)) => return Err(BookStreamError::Connection(e.to_string())),
            Err(_) => return Err(BookStreamError::Timeout),
        };

        let (mut write, mut read) = ws_stream.split();

        let token_ids: Vec<String> = {
            let guard = self.tokens.read().await;
            guard.iter().cloned().collect()
        };
        if token_ids.is_empty() {
            warn!("book stream: no instruments to subscribe, waiting");
            tokio::time::sleep(Duration::from_secs(5)).await;
            return Err(BookStreamError::StreamEnded);
        }

        let subscribe = SubscribeMessage {
            assets_ids: token_ids.clone(),
            msg_type: "market",
        };
        let msg = serde_json::to_string(&subscribe)?;
        write.send(Message::Text(msg.into())).await?;
        info!("book stream subscribed to {} instruments", token_ids.len());

        let mut subscribed: HashSet<String> = token_ids.into_iter().collect();
        let mut books: HashMap<String, BookState> = HashMap::new();

        if self.events.send(BookEvent::Connected).await.is_err() {
            return Ok(());
        }

        let mut ping_timer = interval(PING_INTERVAL);
        let mut subscription_timer = interval(SUBSCRIPTION_CHECK_INTERVAL);

        loop {
            if self.closing.load(Ordering::SeqCst) {
                let _ = write.send(Message::Close(None)).await;
                return Ok(());
            }

            tokio::select! {
                msg = read.next() => {
                    match msg {
                        Some(Ok(Message::Text(text))) => {
                            self.handle_message(&text, &mut books, &subscribed).await;
                        }
                        Some(Ok(Message::Ping(data))) => {
                            write.send(Message::Pong(data)).await?;
                        }
                        Some(Ok(Message::Pong(_))) => {
                            debug!("book stream pong");
                        }
                        Some(Ok(Message::Close(frame))) => {
                            info!("book stream closed by server: {:?}", frame);
                            if self.closing.load(Ordering::SeqCst) {
                                return Ok(());
                            }
                            return Err(BookStreamError::StreamEnded);
                        }
                        Some(Err(e)) => {
                            error!("book stream websocket error: {e}");
                            return Err(BookStreamError::WebSocket(e));
                        }
                        None => {
                            warn!("book stream ended");
                            return Err(BookStreamError::StreamEnded);
                        }
                        _ => {}
                    }
                }

                _ = ping_timer.tick() => {
                    write.send(Message::Text("PING".into())).await?;
                }

                _ = subscription_timer.tick() => {
                    let current: HashSet<String> = {
                        let guard = self.tokens.read().await;
                        guard.clone()
                    };
                    let new_tokens: Vec<String> = current
                        .iter()
                        .filter(|t| !subscribed.contains(*t))
                        .cloned()
                        .collect();
                    if !new_tokens.is_empty() {
                        info!("book stream subscribing to {} new instruments", new_tokens.len());
                        let op = SubscriptionOp {
                            assets_ids: new_tokens.clone(),
                            operation: "subscribe",
                        };
                        let msg = serde_json::to_string(&op)?;
                        write.send(Message::Text(msg.into())).await?;
                        subscribed.extend(new_tokens);
                    }
                    // Drop book state for instruments no longer tracked.
                    books.retain(|token, _| current.contains(token));
                }
            }
        }
    }

    async fn handle_message(
        &self,
        text: &str,
        books: &mut HashMap<String, BookState>,
        subscribed: &HashSet<String>,
    ) {
        let generic: GenericMessage = match serde_json::from_str(text) {
            Ok(m) => m,
            Err(_) => {
                debug!("book stream non-JSON message: {}", text);
                return;
            }
        };

        match generic.event_type.as_deref() {
            Some("book") => {
                let book: BookMessage = match serde_json::from_str(text) {
                    Ok(b) => b,
                    Err(e) => {
                        warn!("failed to parse book message: {e}");
                        return;
                    }
                };
                if !subscribed.contains(&book.asset_id) {
                    return;
                }
                let timestamp = parse_timestamp(&book.timestamp).unwrap_or_else(Utc::now);
                let state = books.entry(book.asset_id.clone()).or_default();
                state.apply_book(&book);
                let top = state.top(&book.asset_id, timestamp);
                let _ = self.events.send(BookEvent::Top(top)).await;
            }
            Some("price_change") => {
                let msg: PriceChangeMessage = match serde_json::from_str(text) {
                    Ok(m) => m,
                    Err(e) => {
                        warn!("failed to parse price_change message: {e}");
                        return;
                    }
                };
                if !subscribed.contains(&msg.asset_id) {
                    return;
                }
                let timestamp = parse_timestamp(&msg.timestamp).unwrap_or_else(Utc::now);
                let state = books.entry(msg.asset_id.clone()).or_default();
                let before = state.top(&msg.asset_id, timestamp);
                for change in &msg.price_changes {
                    state.apply_price_change(change);
                }
                let after = state.top(&msg.asset_id, timestamp);
                // Only forward when the touch actually moved.
                if after.best_bid != before.best_bid
                    || after.best_ask != before.best_ask
                    || after.best_bid_size != before.best_bid_size
                    || after.best_ask_size != before.best_ask_size
                {
                    let _ = self.events.send(BookEvent::Top(after)).await;
                }
            }
            Some("last_trade_price") | Some("tick_size_change") => {}
            _ => {
                debug!("book stream unknown message type: {:?}", generic.event_type);
            }
        }
    }
}

/// Parse timestamp from milliseconds string.
fn parse_timestamp(ts: &str) -> Option<DateTime<Utc>> {
    ts.parse::<i64>()
        .ok()
        .and_then(|ms| Utc.timestamp_millis_opt(ms).single())
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn book_msg() -> BookMessage {
        serde_json::from_str(
            r#"{
                "event_type": "book",
                "asset_id": "tok1",
                "market": "cond1",
                "timestamp": "1704067200000",
                "hash": "h",
                "bids": [{"price": "0.45", "size": "100"}, {"price": "0.44", "size": "200"}],
                "asks": [{"price": "0.55", "size": "150"}]
            }"#,
        )
        .unwrap()
    }

    #[test]
    fn test_apply_book_and_top() {
        let mut state = BookState::default();
        state.apply_book(&book_msg());

        let top = state.top("tok1", Utc::now());
        assert_eq!(top.best_bid, dec!(0.45));
        assert_eq!(top.best_bid_size, dec!(100));
        assert_eq!(top.best_ask, dec!(0.55));
        assert_eq!(top.best_ask_size, dec!(150));
    }

    #[test]
    fn test_price_change_updates_and_removes_levels() {
        let mut state = BookState::default();
        state.apply_book(&book_msg());

        state.apply_price_change(&PriceChange {
            price: "0.46".to_string(),
            size: "50".to_string(),
            side: "buy".to_string(),
        });
        let top = state.top("tok1", Utc::now());
        assert_eq!(top.best_bid, dec!(0.46));

        state.apply_price_change(&PriceChange {
            price: "0.46".to_string(),
            size: "0".to_string(),
            side: "buy".to_string(),
        });
        let top = state.top("tok1", Utc::now());
        assert_eq!(top.best_bid, dec!(0.45));
    }

    #[test]
    fn test_empty_book_defaults() {
        let state = BookState::default();
        let top = state.top("tok1", Utc::now());
        assert_eq!(top.best_bid, Decimal::ZERO);
        assert_eq!(top.best_ask, Decimal::ONE);
        assert_eq!(top.best_bid_size, Decimal::ZERO);
    }

    #[test]
    fn test_subscribe_message_shape() {
        let msg = SubscribeMessage {
            assets_ids: vec!["a".to_string()],
            msg_type: "market",
        };
        let json = serde_json::to_string(&msg).unwrap();
        assert!(json.contains("\"assets_ids\""));
        assert!(json.contains("\"type\":\"market\""));
    }

    #[test]
    fn test_parse_timestamp_ms() {
        let ts = parse_timestamp("1704067200000").unwrap();
        assert_eq!(ts.timestamp_millis(), 1704067200000);
        assert!(parse_timestamp("junk").is_none());
    }

    #[tokio::test]
    async fn test_handle_ignores_untracked_instruments() {
        let (tx, mut rx) = mpsc::channel(8);
        let stream = BookStream {
            config: BookStreamConfig::default(),
            tokens: Arc::new(RwLock::new(HashSet::new())),
            closing: Arc::new(AtomicBool::new(false)),
            events: tx,
        };
        let mut books = HashMap::new();
        let subscribed: HashSet<String> = ["other".to_string()].into_iter().collect();

        let raw = serde_json::to_string(&serde_json::json!({
            "event_type": "book",
            "asset_id": "tok1",
            "market": "cond1",
            "timestamp": "1704067200000",
            "hash": "h",
            "bids": [{"price": "0.45", "size": "100"}],
            "asks": [{"price": "0.55", "size": "150"}]
        }))
        .unwrap();
        stream.handle_message(&raw, &mut books, &subscribed).await;

        assert!(rx.try_recv().is_err());
        assert!(books.is_empty());
    }

    #[tokio::test]
    async fn test_handle_emits_top_for_tracked_instrument() {
        let (tx, mut rx) = mpsc::channel(8);
        let stream = BookStream {
            config: BookStreamConfig::default(),
            tokens: Arc::new(RwLock::new(HashSet::new())),
            closing: Arc::new(AtomicBool::new(false)),
            events: tx,
        };
        let mut books = HashMap::new();
        let subscribed: HashSet<String> = ["tok1".to_string()].into_iter().collect();

        let raw = serde_json::to_string(&serde_json::json!({
            "event_type": "book",
            "asset_id": "tok1",
            "market": "cond1",
            "timestamp": "1704067200000",
            "hash": "h",
            "bids": [{"price": "0.45", "size": "100"}],
            "asks": [{"price": "0.55", "size": "150"}]
        }))
        .unwrap();
        stream.handle_message(&raw, &mut books, &subscribed).await;

        match rx.try_recv().unwrap() {
            BookEvent::Top(top) => {
                assert_eq!(top.token_id, "tok1");
                assert_eq!(top.best_bid, dec!(0.45));
            }
            other => panic!("unexpected event: {:?}", other),
        }
    }
}
