//! Topic-scoped progress fan-out for round observers.
//!
//! - One topic per round (`training:<round_id>`)
//! - Each connected observer owns a bounded queue; a full or closed queue drops the event
//!   for that observer only, the publisher never waits
//! - Events for one topic reach each observer in publish order
//! - `disconnect` drops every subscription the observer holds
//!
//! There is no replay: observers that reconnect only see events published afterwards.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc::{self, error::TrySendError};
use tracing::debug;
use uuid::Uuid;

pub type ObserverId = String;

pub const TOPIC_PREFIX: &str = "training:";

pub fn round_topic(round_id: Uuid) -> String { format!("{TOPIC_PREFIX}{round_id}") }

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind { Progress, DeviceProgress, DeviceCompleted, TrainingCompleted, TrainingFailed, TrainingCancelled }

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProgressEvent {
    #[serde(rename = "type")]
    pub kind: EventKind,
    pub topic: String,
    pub data: serde_json::Value,
    pub timestamp: DateTime<Utc>,
}

impl ProgressEvent {
    pub fn new(kind: EventKind, topic: impl Into<String>, data: serde_json::Value) -> Self {
        Self { kind, topic: topic.into(), data, timestamp: Utc::now() }
    }
}

/// Frames an observer sends over the wire.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientFrame {
    Subscribe { topic: String },
    Unsubscribe { topic: String },
}

/// Acknowledgements sent back to an observer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerFrame {
    Subscribed { topic: String },
    Unsubscribed { topic: String },
    Error { message: String },
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct BusStats { pub delivered: u64, pub dropped: u64 }

#[derive(Default)]
struct Registry {
    observers: HashMap<ObserverId, mpsc::Sender<ProgressEvent>>,
    topics: HashMap<String, HashSet<ObserverId>>,
    subscriptions: HashMap<ObserverId, HashSet<String>>,
}

impl Registry {
    fn remove_observer(&mut self, observer: &str) {
        self.observers.remove(observer);
        for topic in self.subscriptions.remove(observer).unwrap_or_default() {
            if let Some(set) = self.topics.get_mut(&topic) {
                set.remove(observer);
                if set.is_empty() { self.topics.remove(&topic); }
            }
        }
    }
}

pub struct ProgressBus {
    registry: RwLock<Registry>,
    buffer: usize,
    delivered: AtomicU64,
    dropped: AtomicU64,
}

impl ProgressBus {
    pub fn new(buffer: usize) -> Self {
        Self { registry: RwLock::new(Registry::default()), buffer: buffer.max(1), delivered: AtomicU64::new(0), dropped: AtomicU64::new(0) }
    }

    /// Registers an observer and returns its event queue. Reconnecting with the same id
    /// replaces the old queue but keeps existing subscriptions.
    pub fn connect(&self, observer: impl Into<ObserverId>) -> mpsc::Receiver<ProgressEvent> {
        let (tx, rx) = mpsc::channel(self.buffer);
        self.registry.write().observers.insert(observer.into(), tx);
        rx
    }

    pub fn disconnect(&self, observer: &str) {
        self.registry.write().remove_observer(observer);
        debug!(observer, "observer_disconnected");
    }

    /// Returns false when the observer is not connected.
    pub fn subscribe(&self, topic: &str, observer: &str) -> bool {
        let mut reg = self.registry.write();
        if !reg.observers.contains_key(observer) { return false; }
        reg.topics.entry(topic.to_string()).or_default().insert(observer.to_string());
        reg.subscriptions.entry(observer.to_string()).or_default().insert(topic.to_string());
        true
    }

    pub fn unsubscribe(&self, topic: &str, observer: &str) -> bool {
        let mut reg = self.registry.write();
        let removed = reg.topics.get_mut(topic).map(|set| set.remove(observer)).unwrap_or(false);
        if reg.topics.get(topic).map(HashSet::is_empty).unwrap_or(false) { reg.topics.remove(topic); }
        if let Some(subs) = reg.subscriptions.get_mut(observer) { subs.remove(topic); }
        removed
    }

    pub fn subscriber_count(&self, topic: &str) -> usize { self.registry.read().topics.get(topic).map(HashSet::len).unwrap_or(0) }

    /// Best-effort fan-out; returns how many observers accepted the event.
    pub fn publish(&self, event: ProgressEvent) -> usize {
        let mut closed = Vec::new();
        let mut delivered = 0;
        {
            let reg = self.registry.read();
            let Some(subscribers) = reg.topics.get(&event.topic) else { return 0; };
            for observer in subscribers {
                let Some(tx) = reg.observers.get(observer) else { continue; };
                match tx.try_send(event.clone()) {
                    Ok(()) => delivered += 1,
                    Err(TrySendError::Full(_)) => {
                        self.dropped.fetch_add(1, Ordering::Relaxed);
                        debug!(observer = %observer, topic = %event.topic, "observer_queue_full_event_dropped");
                    }
                    Err(TrySendError::Closed(_)) => closed.push(observer.clone()),
                }
            }
        }
        if !closed.is_empty() {
            let mut reg = self.registry.write();
            for observer in &closed { reg.remove_observer(observer); }
            self.dropped.fetch_add(closed.len() as u64, Ordering::Relaxed);
        }
        self.delivered.fetch_add(delivered as u64, Ordering::Relaxed);
        delivered
    }

    pub fn emit(&self, topic: &str, kind: EventKind, data: serde_json::Value) -> usize { self.publish(ProgressEvent::new(kind, topic, data)) }

    /// Applies one raw wire frame from `observer` and returns the acknowledgement.
    pub fn handle_frame(&self, observer: &str, raw: &str) -> ServerFrame {
        match serde_json::from_str::<ClientFrame>(raw) {
            Ok(ClientFrame::Subscribe { topic }) => {
                if self.subscribe(&topic, observer) { ServerFrame::Subscribed { topic } }
                else { ServerFrame::Error { message: format!("observer {observer} is not connected") } }
            }
            Ok(ClientFrame::Unsubscribe { topic }) => { self.unsubscribe(&topic, observer); ServerFrame::Unsubscribed { topic } }
            Err(e) => ServerFrame::Error { message: format!("invalid frame: {e}") },
        }
    }

    pub fn stats(&self) -> BusStats { BusStats { delivered: self.delivered.load(Ordering::Relaxed), dropped: self.dropped.load(Ordering::Relaxed) } }
}

impl Default for ProgressBus { fn default() -> Self { Self::new(256) } }
