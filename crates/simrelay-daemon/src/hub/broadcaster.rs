//! Event fan-out to every connected subscriber.
//!
//! Each subscriber owns a bounded queue. Publishing never waits on a queue:
//! a subscriber whose queue is closed or full is dropped from the live set,
//! so every remaining subscriber sees the same gap-free sequence.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{RwLock, mpsc};
use tracing::{debug, info, warn};

use simrelay_core::Event;
use simrelay_core::config::HubConfig;

use super::types::{HubStats, SubscriberMap, SubscriberState, Subscription};

/// Broadcast hub managing the live subscriber set.
pub struct BroadcastHub {
    subscribers: SubscriberMap,
    published: Arc<AtomicU64>,
    config: HubConfig,
}

impl BroadcastHub {
    /// Create a new broadcast hub.
    pub fn new(config: HubConfig) -> Self {
        Self {
            subscribers: Arc::new(RwLock::new(HashMap::new())),
            published: Arc::new(AtomicU64::new(0)),
            config,
        }
    }

    /// Create with default configuration.
    pub fn with_defaults() -> Self {
        Self::new(HubConfig::default())
    }

    /// Register a new subscriber. It receives only events published after
    /// this call returns.
    pub async fn register(&self) -> Subscription {
        let id = uuid::Uuid::new_v4().to_string();
        let (sink, event_rx) = mpsc::channel(self.config.subscriber_buffer.max(1));

        let mut subscribers = self.subscribers.write().await;
        subscribers.insert(
            id.clone(),
            SubscriberState {
                sink,
                connected_at: Instant::now(),
            },
        );
        let total = subscribers.len();
        drop(subscribers);

        info!(subscriber_id = %id, total, "Subscriber connected");
        Subscription::new(id, event_rx, Arc::clone(&self.subscribers))
    }

    /// Remove a subscriber. Returns `false` if it was already gone.
    pub async fn unregister(&self, subscriber_id: &str) -> bool {
        let removed = self
            .subscribers
            .write()
            .await
            .remove(subscriber_id)
            .is_some();
        if removed {
            info!(subscriber_id, "Subscriber unregistered");
        }
        removed
    }

    /// Deliver an event to every registered subscriber. Returns the number
    /// of subscribers it was delivered to.
    pub async fn publish(&self, event: Event) -> usize {
        fan_out(&self.subscribers, &self.published, event).await
    }

    /// Number of registered subscribers.
    pub async fn subscriber_count(&self) -> usize {
        self.subscribers.read().await.len()
    }

    /// Get hub statistics.
    pub async fn stats(&self) -> HubStats {
        HubStats {
            subscribers: self.subscriber_count().await,
            published: self.published.load(Ordering::Relaxed),
        }
    }

    /// Create a sender channel for forwarding supervisor events.
    ///
    /// Events are published in the order they arrive on the channel. The
    /// forwarding task ends once every sender has been dropped.
    pub fn create_event_forwarder(&self) -> mpsc::Sender<Event> {
        let (tx, mut rx) = mpsc::channel::<Event>(self.config.forwarder_capacity.max(1));
        let subscribers = Arc::clone(&self.subscribers);
        let published = Arc::clone(&self.published);

        tokio::spawn(async move {
            while let Some(event) = rx.recv().await {
                fan_out(&subscribers, &published, event).await;
            }
            debug!("Event forwarder closed");
        });

        tx
    }
}

async fn fan_out(subscribers: &SubscriberMap, published: &AtomicU64, event: Event) -> usize {
    // The write guard serializes publishes: one event reaches everyone
    // before the next one is looked at.
    let mut subscribers = subscribers.write().await;
    published.fetch_add(1, Ordering::Relaxed);

    let mut dropped = Vec::new();
    for (id, subscriber) in subscribers.iter() {
        match subscriber.sink.try_send(event.clone()) {
            Ok(()) => {}
            Err(TrySendError::Closed(_)) => {
                debug!(subscriber_id = %id, "Subscriber sink closed");
                dropped.push(id.clone());
            }
            Err(TrySendError::Full(_)) => {
                warn!(subscriber_id = %id, "Subscriber queue full, dropping slow subscriber");
                dropped.push(id.clone());
            }
        }
    }

    for id in &dropped {
        subscribers.remove(id);
    }

    let delivered = subscribers.len();
    debug!(kind = event.kind(), delivered, dropped = dropped.len(), "Event broadcast");
    delivered
}
