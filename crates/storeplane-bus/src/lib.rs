//! Event bus for the storeplane control plane.
//!
//! The bus has two surfaces with distinct semantics:
//!
//! - **Durable stream**: an append-only, bounded tail of events kept per
//!   store. Written by the operator's status manager, read by the intent
//!   layer so late subscribers can fetch recent history.
//! - **Live channel**: a best-effort broadcast to currently connected
//!   subscribers. Slow subscribers lag and are disconnected by their
//!   handler; publishers never block.
//!
//! When the bus is degraded (disabled by configuration, or tripped at
//! runtime), durable writes are dropped and `history` returns nothing; the
//! intent layer then serves history from the store resource's own activity
//! log instead.

use chrono::Utc;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::broadcast;
use tracing::debug;

/// Default bound for the durable per-store tail.
pub const DEFAULT_RETENTION: usize = 256;

/// Capacity of the live broadcast channel before subscribers lag.
const LIVE_CHANNEL_CAPACITY: usize = 512;

/// A single event on the bus, routed by store name.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct StoreEvent {
    /// Store the event belongs to (routing key)
    pub store: String,
    /// Uppercase event token, e.g. `PROVISIONING_START`
    pub event: String,
    /// Human-readable narrative
    pub message: String,
    /// Phase of the store at publish time, if known
    #[serde(skip_serializing_if = "Option::is_none")]
    pub phase: Option<String>,
    /// RFC 3339 timestamp
    pub timestamp: String,
}

impl StoreEvent {
    /// Build an event stamped with the current time.
    pub fn now(store: &str, event: &str, message: &str, phase: Option<String>) -> Self {
        Self {
            store: store.to_string(),
            event: event.to_string(),
            message: message.to_string(),
            phase,
            timestamp: Utc::now().to_rfc3339(),
        }
    }
}

/// Bus health as surfaced by the intent layer's health endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BusStatus {
    Connected,
    Degraded,
}

impl BusStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            BusStatus::Connected => "connected",
            BusStatus::Degraded => "degraded",
        }
    }
}

/// The process-wide event bus.
///
/// One instance is created at startup and shared by the reconciler (writer)
/// and the intent layer (reader).
pub struct EventBus {
    retention: usize,
    degraded: AtomicBool,
    streams: RwLock<HashMap<String, VecDeque<StoreEvent>>>,
    live: broadcast::Sender<StoreEvent>,
}

impl EventBus {
    /// Create a bus retaining at most `retention` events per store.
    pub fn new(retention: usize) -> Self {
        let (live, _) = broadcast::channel(LIVE_CHANNEL_CAPACITY);
        Self {
            retention: retention.max(1),
            degraded: AtomicBool::new(false),
            streams: RwLock::new(HashMap::new()),
            live,
        }
    }

    /// Create a bus that starts out degraded (durable surface disabled).
    pub fn degraded(retention: usize) -> Self {
        let bus = Self::new(retention);
        bus.degraded.store(true, Ordering::Relaxed);
        bus
    }

    /// Current bus status.
    pub fn status(&self) -> BusStatus {
        if self.degraded.load(Ordering::Relaxed) {
            BusStatus::Degraded
        } else {
            BusStatus::Connected
        }
    }

    /// Mark the backing store unavailable. Durable writes become no-ops and
    /// history is served from the store resource instead.
    pub fn mark_degraded(&self) {
        self.degraded.store(true, Ordering::Relaxed);
    }

    /// Publish an event: appended to the store's durable tail (unless
    /// degraded) and broadcast to live subscribers. Never blocks.
    pub fn publish(&self, event: StoreEvent) {
        if !self.degraded.load(Ordering::Relaxed) {
            let mut streams = self.streams.write();
            let tail = streams.entry(event.store.clone()).or_default();
            tail.push_back(event.clone());
            while tail.len() > self.retention {
                tail.pop_front();
            }
        }
        // A send error only means there are no live subscribers right now.
        let receivers = self.live.send(event).unwrap_or(0);
        debug!(receivers, "bus event published");
    }

    /// Recent durable history for one store, oldest first. Empty when the
    /// bus is degraded or the store has never published.
    pub fn history(&self, store: &str) -> Vec<StoreEvent> {
        if self.degraded.load(Ordering::Relaxed) {
            return Vec::new();
        }
        self.streams
            .read()
            .get(store)
            .map(|tail| tail.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Subscribe to the live channel. The receiver observes `Lagged` when it
    /// falls behind; handlers drop such subscribers rather than blocking the
    /// producer.
    pub fn subscribe(&self) -> broadcast::Receiver<StoreEvent> {
        self.live.subscribe()
    }

    /// Drop the durable tail for a store once the resource is gone.
    pub fn forget(&self, store: &str) {
        self.streams.write().remove(store);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn event(store: &str, name: &str) -> StoreEvent {
        StoreEvent::now(store, name, "msg", Some("Provisioning".to_string()))
    }

    #[test]
    fn history_is_bounded_oldest_first_eviction() {
        let bus = EventBus::new(4);
        for i in 0..10 {
            bus.publish(event("shop1", &format!("E{}", i)));
        }
        let history = bus.history("shop1");
        assert_eq!(history.len(), 4);
        assert_eq!(history[0].event, "E6");
        assert_eq!(history[3].event, "E9");
    }

    #[test]
    fn history_is_per_store() {
        let bus = EventBus::new(16);
        bus.publish(event("shop1", "A"));
        bus.publish(event("shop2", "B"));
        assert_eq!(bus.history("shop1").len(), 1);
        assert_eq!(bus.history("shop2").len(), 1);
        assert!(bus.history("shop3").is_empty());
    }

    #[tokio::test]
    async fn live_fan_out_reaches_all_subscribers() {
        let bus = EventBus::new(16);
        let mut rx1 = bus.subscribe();
        let mut rx2 = bus.subscribe();
        bus.publish(event("shop1", "NAMESPACE_READY"));
        assert_eq!(rx1.recv().await.unwrap().event, "NAMESPACE_READY");
        assert_eq!(rx2.recv().await.unwrap().event, "NAMESPACE_READY");
    }

    #[tokio::test]
    async fn slow_subscriber_observes_lag_without_blocking_publisher() {
        let bus = EventBus::new(16);
        let mut rx = bus.subscribe();
        for i in 0..(LIVE_CHANNEL_CAPACITY + 10) {
            bus.publish(event("shop1", &format!("E{}", i)));
        }
        match rx.recv().await {
            Err(broadcast::error::RecvError::Lagged(n)) => assert!(n > 0),
            other => panic!("expected lag, got {:?}", other),
        }
    }

    #[test]
    fn degraded_bus_drops_durable_writes() {
        let bus = EventBus::degraded(16);
        bus.publish(event("shop1", "A"));
        assert!(bus.history("shop1").is_empty());
        assert_eq!(bus.status(), BusStatus::Degraded);
    }

    #[test]
    fn mark_degraded_trips_at_runtime() {
        let bus = EventBus::new(16);
        assert_eq!(bus.status(), BusStatus::Connected);
        bus.mark_degraded();
        assert_eq!(bus.status(), BusStatus::Degraded);
        bus.publish(event("shop1", "A"));
        assert!(bus.history("shop1").is_empty());
    }

    #[test]
    fn forget_clears_the_tail() {
        let bus = EventBus::new(16);
        bus.publish(event("shop1", "A"));
        bus.forget("shop1");
        assert!(bus.history("shop1").is_empty());
    }
}
