//! In-process pub/sub hub for job lifecycle events.
//!
//! Pipeline-keyed broadcast channels push events to streaming subscribers.
//! Publishing is non-blocking and takes a short read lock; a slow subscriber
//! only loses its own oldest events (the broadcast ring drops from the tail
//! of history) and sees the miss count, surfaced as a lagged notification.
//! Events published from the same pipeline are delivered in publication
//! order to every subscriber that received them.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use tokio::sync::{broadcast, RwLock};
use uuid::Uuid;

use crate::kernel::jobs::JobEvent;

/// Firehose topic carrying events from every pipeline.
const TOPIC_ALL: &str = "all";

fn pipeline_topic(pipeline_id: &str) -> String {
    format!("pipeline:{pipeline_id}")
}

/// Subscriber-side predicate.
#[derive(Debug, Clone, Default)]
pub struct EventFilter {
    /// Restrict to one pipeline; `None` subscribes to the firehose.
    pub pipeline_id: Option<String>,
    /// Restrict to specific event types (`job:completed`, ...).
    pub event_types: Option<Vec<String>>,
}

impl EventFilter {
    pub fn pipeline(pipeline_id: impl Into<String>) -> Self {
        Self {
            pipeline_id: Some(pipeline_id.into()),
            event_types: None,
        }
    }

    pub fn matches(&self, event: &JobEvent) -> bool {
        if let Some(pipeline_id) = &self.pipeline_id {
            if event.pipeline_id() != pipeline_id {
                return false;
            }
        }
        if let Some(types) = &self.event_types {
            if !types.iter().any(|t| t == event.event_type()) {
                return false;
            }
        }
        true
    }
}

struct HubInner {
    channels: HashMap<String, broadcast::Sender<JobEvent>>,
    /// Dropped-event counters for live subscriptions.
    subscribers: HashMap<Uuid, Arc<AtomicU64>>,
}

/// Thread-safe, cloneable event hub.
#[derive(Clone)]
pub struct EventHub {
    inner: Arc<RwLock<HubInner>>,
    capacity: usize,
}

impl EventHub {
    /// Default per-subscriber buffer of 256 events.
    pub fn new() -> Self {
        Self::with_capacity(256)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            inner: Arc::new(RwLock::new(HubInner {
                channels: HashMap::new(),
                subscribers: HashMap::new(),
            })),
            capacity: capacity.max(1),
        }
    }

    /// Publish an event to its pipeline topic and the firehose. Non-blocking;
    /// O(subscribers). No-op for topics without subscribers.
    pub async fn publish(&self, event: JobEvent) {
        let inner = self.inner.read().await;
        if let Some(tx) = inner.channels.get(&pipeline_topic(event.pipeline_id())) {
            // Send errors mean no active receivers.
            let _ = tx.send(event.clone());
        }
        if let Some(tx) = inner.channels.get(TOPIC_ALL) {
            let _ = tx.send(event);
        }
    }

    /// Subscribe with a filter. The channel is created on first use.
    pub async fn subscribe(&self, filter: EventFilter) -> EventSubscription {
        let topic = filter
            .pipeline_id
            .as_deref()
            .map(pipeline_topic)
            .unwrap_or_else(|| TOPIC_ALL.to_string());

        let mut inner = self.inner.write().await;
        let capacity = self.capacity;
        let tx = inner
            .channels
            .entry(topic)
            .or_insert_with(|| broadcast::channel(capacity).0);
        let receiver = tx.subscribe();

        let id = Uuid::new_v4();
        let dropped = Arc::new(AtomicU64::new(0));
        inner.subscribers.insert(id, dropped.clone());

        EventSubscription {
            id,
            receiver,
            filter,
            dropped,
            hub: self.clone(),
        }
    }

    /// Forget a subscription's status entry. Delivery stops when the
    /// subscription (and its receiver) is dropped.
    pub async fn unsubscribe(&self, id: Uuid) {
        self.inner.write().await.subscribers.remove(&id);
    }

    /// Dropped-event count for a live subscription.
    pub async fn dropped_count(&self, id: Uuid) -> Option<u64> {
        self.inner
            .read()
            .await
            .subscribers
            .get(&id)
            .map(|counter| counter.load(Ordering::SeqCst))
    }

    /// Remove channels with zero subscribers (housekeeping).
    pub async fn cleanup(&self) {
        let mut inner = self.inner.write().await;
        inner.channels.retain(|_, tx| tx.receiver_count() > 0);
    }
}

impl Default for EventHub {
    fn default() -> Self {
        Self::new()
    }
}

/// A live subscription handle.
pub struct EventSubscription {
    pub id: Uuid,
    pub receiver: broadcast::Receiver<JobEvent>,
    pub filter: EventFilter,
    dropped: Arc<AtomicU64>,
    hub: EventHub,
}

impl EventSubscription {
    /// Receive the next event matching the filter. Returns `None` when the
    /// hub side is gone. Missed events (drop-oldest overflow) bump the
    /// dropped counter and reception continues.
    pub async fn recv(&mut self) -> Option<JobEvent> {
        loop {
            match self.receiver.recv().await {
                Ok(event) => {
                    if self.filter.matches(&event) {
                        return Some(event);
                    }
                }
                Err(broadcast::error::RecvError::Lagged(missed)) => {
                    self.dropped.fetch_add(missed, Ordering::SeqCst);
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }

    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::SeqCst)
    }

    /// Tear the subscription apart for stream adapters, keeping the counter
    /// shared and returning a guard that clears the status entry on drop.
    pub fn into_parts(
        self,
    ) -> (
        broadcast::Receiver<JobEvent>,
        EventFilter,
        Arc<AtomicU64>,
        SubscriptionGuard,
    ) {
        let guard = SubscriptionGuard {
            id: self.id,
            hub: self.hub.clone(),
        };
        (self.receiver, self.filter, self.dropped, guard)
    }
}

/// Clears the subscription status entry when the consuming stream is
/// dropped (e.g. an SSE client disconnects).
pub struct SubscriptionGuard {
    id: Uuid,
    hub: EventHub,
}

impl Drop for SubscriptionGuard {
    fn drop(&mut self) {
        let hub = self.hub.clone();
        let id = self.id;
        tokio::spawn(async move { hub.unsubscribe(id).await });
    }
}
