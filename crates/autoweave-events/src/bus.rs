//! Event bus with non-blocking publish and bounded subscriber queues.
//!
//! Publishing never waits on a subscriber. Each subscriber owns a bounded
//! queue; when it is full the event is dropped for that subscriber and a
//! counter is incremented. External collectors can attach to a broadcast tap.

use crate::event::{EventType, SystemEvent};
use dashmap::DashMap;
use parking_lot::RwLock;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc};

/// Event bus configuration
#[derive(Debug, Clone)]
pub struct EventBusConfig {
    /// Queue capacity per subscriber
    pub subscriber_capacity: usize,
    /// Broadcast tap capacity
    pub broadcast_capacity: usize,
}

impl Default for EventBusConfig {
    fn default() -> Self {
        Self {
            subscriber_capacity: 256,
            broadcast_capacity: 1024,
        }
    }
}

struct Subscription {
    name: String,
    tx: mpsc::Sender<Arc<SystemEvent>>,
    dropped: Arc<AtomicU64>,
}

/// Event bus for decoupled component communication
pub struct EventBus {
    /// Subscriptions grouped by event type; `None` key = all events
    by_type: DashMap<EventType, Vec<Subscription>>,
    all: RwLock<Vec<Subscription>>,
    broadcast_tx: broadcast::Sender<Arc<SystemEvent>>,
    config: EventBusConfig,
    published: AtomicU64,
}

/// Receiving half handed to a subscriber, with its drop counter
pub struct EventReceiver {
    pub rx: mpsc::Receiver<Arc<SystemEvent>>,
    dropped: Arc<AtomicU64>,
}

impl EventReceiver {
    pub async fn recv(&mut self) -> Option<Arc<SystemEvent>> {
        self.rx.recv().await
    }

    /// Events dropped for this subscriber because its queue was full
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

impl EventBus {
    pub fn new() -> Self {
        Self::with_config(EventBusConfig::default())
    }

    pub fn with_config(config: EventBusConfig) -> Self {
        let (broadcast_tx, _) = broadcast::channel(config.broadcast_capacity);
        Self {
            by_type: DashMap::new(),
            all: RwLock::new(Vec::new()),
            broadcast_tx,
            config,
            published: AtomicU64::new(0),
        }
    }

    /// Subscribe to a fixed set of event types
    pub fn subscribe(&self, name: impl Into<String>, event_types: &[&str]) -> EventReceiver {
        let name = name.into();
        let (tx, rx) = mpsc::channel(self.config.subscriber_capacity);
        let dropped = Arc::new(AtomicU64::new(0));

        for event_type in event_types {
            self.by_type
                .entry(EventType::new(*event_type))
                .or_default()
                .push(Subscription {
                    name: name.clone(),
                    tx: tx.clone(),
                    dropped: dropped.clone(),
                });
        }

        EventReceiver { rx, dropped }
    }

    /// Subscribe to every event on the bus
    pub fn subscribe_all(&self, name: impl Into<String>) -> EventReceiver {
        let (tx, rx) = mpsc::channel(self.config.subscriber_capacity);
        let dropped = Arc::new(AtomicU64::new(0));
        self.all.write().push(Subscription {
            name: name.into(),
            tx,
            dropped: dropped.clone(),
        });
        EventReceiver { rx, dropped }
    }

    /// Remove every subscription registered under `name`
    pub fn unsubscribe(&self, name: &str) {
        for mut entry in self.by_type.iter_mut() {
            entry.value_mut().retain(|s| s.name != name);
        }
        self.all.write().retain(|s| s.name != name);
    }

    /// Publish an event. Never blocks; slow subscribers lose the event.
    pub fn publish(&self, event: SystemEvent) {
        let event = Arc::new(event);
        self.published.fetch_add(1, Ordering::Relaxed);

        tracing::trace!(
            event_type = %event.event_type,
            event_id = %event.id,
            "Publishing event"
        );

        if let Some(subs) = self.by_type.get(&event.event_type()) {
            for sub in subs.iter() {
                Self::deliver(sub, &event);
            }
        }

        for sub in self.all.read().iter() {
            Self::deliver(sub, &event);
        }

        // Broadcast tap for external listeners; lagging receivers skip
        let _ = self.broadcast_tx.send(event);
    }

    fn deliver(sub: &Subscription, event: &Arc<SystemEvent>) {
        if sub.tx.try_send(event.clone()).is_err() {
            let total = sub.dropped.fetch_add(1, Ordering::Relaxed) + 1;
            tracing::warn!(
                subscriber = %sub.name,
                event_type = %event.event_type,
                dropped_total = total,
                "Subscriber queue full, event dropped"
            );
        }
    }

    /// Broadcast receiver for external collectors
    pub fn tap(&self) -> broadcast::Receiver<Arc<SystemEvent>> {
        self.broadcast_tx.subscribe()
    }

    /// Total events published since startup
    pub fn published(&self) -> u64 {
        self.published.load(Ordering::Relaxed)
    }

    /// Subscriber count for an event type
    pub fn subscriber_count(&self, event_type: &str) -> usize {
        let typed = self
            .by_type
            .get(&EventType::new(event_type))
            .map(|s| s.len())
            .unwrap_or(0);
        typed + self.all.read().len()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}
