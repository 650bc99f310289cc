//! Broadcast hub types.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

use tokio::sync::{RwLock, mpsc};
use tracing::debug;

use simrelay_core::Event;

pub(crate) type SubscriberMap = Arc<RwLock<HashMap<String, SubscriberState>>>;

/// Subscriber state tracked by the hub.
#[derive(Debug)]
pub(crate) struct SubscriberState {
    pub sink: mpsc::Sender<Event>,
    pub connected_at: Instant,
}

/// A registered subscriber's end of the event stream.
///
/// Dropping the subscription unregisters it from the hub.
#[derive(Debug)]
pub struct Subscription {
    id: String,
    event_rx: mpsc::Receiver<Event>,
    subscribers: SubscriberMap,
}

impl Subscription {
    pub(crate) fn new(
        id: String,
        event_rx: mpsc::Receiver<Event>,
        subscribers: SubscriberMap,
    ) -> Self {
        Self {
            id,
            event_rx,
            subscribers,
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    /// Wait for the next event. Returns `None` once the hub has dropped
    /// this subscriber.
    pub async fn recv(&mut self) -> Option<Event> {
        self.event_rx.recv().await
    }

    /// Return an already queued event without waiting.
    pub fn try_recv(&mut self) -> Option<Event> {
        self.event_rx.try_recv().ok()
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        // Outside a runtime the closed sink is pruned on the next publish.
        let Ok(handle) = tokio::runtime::Handle::try_current() else {
            return;
        };
        let id = std::mem::take(&mut self.id);
        let subscribers = Arc::clone(&self.subscribers);
        handle.spawn(async move {
            if let Some(state) = subscribers.write().await.remove(&id) {
                debug!(
                    subscriber_id = %id,
                    connected_for = ?state.connected_at.elapsed(),
                    "Subscriber disconnected"
                );
            }
        });
    }
}

/// Hub statistics.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HubStats {
    /// Currently registered subscribers.
    pub subscribers: usize,
    /// Events published since the hub was created.
    pub published: u64,
}
