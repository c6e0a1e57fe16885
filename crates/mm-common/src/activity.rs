//! Per-instance activity log.
//!
//! Every engine instance keeps a bounded in-memory ring of recent events
//! so an operator always has actionable history, even when the external
//! sink is degraded. External delivery is fire-and-forget: appending must
//! never block or fail the trading path.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tracing::debug;

/// Default ring capacity.
pub const DEFAULT_RING_CAPACITY: usize = 500;

/// Severity of an activity event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ActivityLevel {
    Info,
    Warn,
    Error,
}

impl std::fmt::Display for ActivityLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ActivityLevel::Info => write!(f, "info"),
            ActivityLevel::Warn => write!(f, "warn"),
            ActivityLevel::Error => write!(f, "error"),
        }
    }
}

/// One structured activity record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ActivityEvent {
    pub timestamp: DateTime<Utc>,
    pub level: ActivityLevel,
    /// Short machine-readable event name (e.g. "fill_detected").
    pub event: String,
    /// Human-readable message.
    pub message: String,
    /// Structured payload.
    pub data: serde_json::Value,
}

impl ActivityEvent {
    pub fn new(
        level: ActivityLevel,
        event: impl Into<String>,
        message: impl Into<String>,
        data: serde_json::Value,
    ) -> Self {
        Self {
            timestamp: Utc::now(),
            level,
            event: event.into(),
            message: message.into(),
            data,
        }
    }
}

/// Sink for activity events. Implementations must be non-blocking; a
/// failed delivery is the sink's problem, never the caller's.
pub trait ActivitySink: Send + Sync {
    fn append(&self, event: ActivityEvent);
}

/// Sink that forwards events over a bounded channel. When the channel is
/// full the event is dropped and counted rather than blocking the caller.
pub struct ChannelSink {
    tx: mpsc::Sender<ActivityEvent>,
    dropped: AtomicU64,
}

impl ChannelSink {
    /// Create a sink and the receiving end for the consumer task.
    pub fn new(buffer: usize) -> (Self, mpsc::Receiver<ActivityEvent>) {
        let (tx, rx) = mpsc::channel(buffer);
        (
            Self {
                tx,
                dropped: AtomicU64::new(0),
            },
            rx,
        )
    }

    /// Number of events dropped due to backpressure.
    pub fn dropped_count(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

impl ActivitySink for ChannelSink {
    fn append(&self, event: ActivityEvent) {
        if self.tx.try_send(event).is_err() {
            let n = self.dropped.fetch_add(1, Ordering::Relaxed) + 1;
            if n.is_power_of_two() {
                debug!(dropped = n, "activity sink backpressure, dropping events");
            }
        }
    }
}

/// Bounded in-memory ring of the most recent activity events.
pub struct ActivityLog {
    ring: Mutex<VecDeque<ActivityEvent>>,
    capacity: usize,
    /// Optional external sink for best-effort persistence.
    sink: Option<Box<dyn ActivitySink>>,
}

impl ActivityLog {
    pub fn new(capacity: usize) -> Self {
        Self {
            ring: Mutex::new(VecDeque::with_capacity(capacity)),
            capacity,
            sink: None,
        }
    }

    pub fn with_sink(mut self, sink: Box<dyn ActivitySink>) -> Self {
        self.sink = Some(sink);
        self
    }

    /// Record an event: always lands in the ring, best-effort to the sink.
    pub fn record(
        &self,
        level: ActivityLevel,
        event: &str,
        message: impl Into<String>,
        data: serde_json::Value,
    ) {
        let evt = ActivityEvent::new(level, event, message, data);

        if let Some(sink) = &self.sink {
            sink.append(evt.clone());
        }

        let mut ring = match self.ring.lock() {
            Ok(r) => r,
            // A poisoned ring only loses history, never trading.
            Err(poisoned) => poisoned.into_inner(),
        };
        if ring.len() == self.capacity {
            ring.pop_front();
        }
        ring.push_back(evt);
    }

    pub fn info(&self, event: &str, message: impl Into<String>, data: serde_json::Value) {
        self.record(ActivityLevel::Info, event, message, data);
    }

    pub fn warn(&self, event: &str, message: impl Into<String>, data: serde_json::Value) {
        self.record(ActivityLevel::Warn, event, message, data);
    }

    pub fn error(&self, event: &str, message: impl Into<String>, data: serde_json::Value) {
        self.record(ActivityLevel::Error, event, message, data);
    }

    /// Snapshot of the most recent events, oldest first.
    pub fn recent(&self, limit: usize) -> Vec<ActivityEvent> {
        let ring = match self.ring.lock() {
            Ok(r) => r,
            Err(poisoned) => poisoned.into_inner(),
        };
        let skip = ring.len().saturating_sub(limit);
        ring.iter().skip(skip).cloned().collect()
    }

    pub fn len(&self) -> usize {
        match self.ring.lock() {
            Ok(r) => r.len(),
            Err(poisoned) => poisoned.into_inner().len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for ActivityLog {
    fn default() -> Self {
        Self::new(DEFAULT_RING_CAPACITY)
    }
}
