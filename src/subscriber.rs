//! Subscriber handles and the shared registry

use std::collections::HashMap;

use tokio::sync::{mpsc, RwLock};
use tracing::{debug, info};
use uuid::Uuid;

use crate::error::{ReplayError, Result};

/// One connected receiver of broadcast batches.
///
/// The handle owns only the outbound channel; the connection task on the
/// other end drains it into the WebSocket.
pub struct Subscriber {
    pub id: Uuid,
    sender: mpsc::UnboundedSender<String>,
}

impl Subscriber {
    pub fn new(sender: mpsc::UnboundedSender<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            sender,
        }
    }
}

/// Live subscriber set, shared between the replay task and the
/// per-connection tasks.
///
/// Broadcast takes a point-in-time snapshot of the membership under the read
/// lock: subscribers added after the snapshot do not receive the in-flight
/// batch, and concurrent removals cannot invalidate the pass.
pub struct SubscriberRegistry {
    subscribers: RwLock<HashMap<Uuid, Subscriber>>,
    max_subscribers: usize,
}

impl SubscriberRegistry {
    pub fn new(max_subscribers: usize) -> Self {
        Self {
            subscribers: RwLock::new(HashMap::new()),
            max_subscribers,
        }
    }

    /// Register a new subscriber. Rejects when the registry is full.
    pub async fn add(&self, subscriber: Subscriber) -> Result<()> {
        let mut subscribers = self.subscribers.write().await;

        if subscribers.len() >= self.max_subscribers {
            return Err(ReplayError::Subscriber {
                message: format!("subscriber limit reached ({})", self.max_subscribers),
            });
        }

        let id = subscriber.id;
        subscribers.insert(id, subscriber);
        info!(%id, total = subscribers.len(), "subscriber connected");
        Ok(())
    }

    /// Drop a subscriber. Removing an id that is already gone is a no-op, so
    /// a failed delivery and a connection close can race freely.
    pub async fn remove(&self, id: Uuid) {
        let mut subscribers = self.subscribers.write().await;
        if subscribers.remove(&id).is_some() {
            info!(%id, total = subscribers.len(), "subscriber disconnected");
        }
    }

    /// Point-in-time copy of the current membership.
    pub async fn snapshot(&self) -> Vec<(Uuid, mpsc::UnboundedSender<String>)> {
        self.subscribers
            .read()
            .await
            .iter()
            .map(|(id, subscriber)| (*id, subscriber.sender.clone()))
            .collect()
    }

    /// Deliver one serialized message to every subscriber in a snapshot of
    /// the registry. A failed delivery evicts that subscriber and leaves the
    /// rest of the pass unaffected. Returns the number of deliveries.
    pub async fn broadcast(&self, message: &str) -> usize {
        let snapshot = self.snapshot().await;
        let mut delivered = 0;
        let mut failed = Vec::new();

        for (id, sender) in snapshot {
            if sender.send(message.to_string()).is_ok() {
                delivered += 1;
            } else {
                failed.push(id);
            }
        }

        for id in failed {
            debug!(%id, "delivery failed, evicting subscriber");
            self.remove(id).await;
        }

        delivered
    }

    /// Number of currently connected subscribers.
    pub async fn count(&self) -> usize {
        self.subscribers.read().await.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    fn subscriber() -> (Subscriber, mpsc::UnboundedReceiver<String>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Subscriber::new(tx), rx)
    }

    #[tokio::test]
    async fn add_and_remove_track_membership() {
        let registry = SubscriberRegistry::new(10);
        assert_eq!(registry.count().await, 0);

        let (sub, _rx) = subscriber();
        let id = sub.id;
        registry.add(sub).await.unwrap();
        assert_eq!(registry.count().await, 1);

        registry.remove(id).await;
        assert_eq!(registry.count().await, 0);

        // Removing an already-removed id is a no-op.
        registry.remove(id).await;
        assert_eq!(registry.count().await, 0);
    }

    #[tokio::test]
    async fn rejects_subscribers_past_the_limit() {
        let registry = SubscriberRegistry::new(1);
        let (first, _rx1) = subscriber();
        let (second, _rx2) = subscriber();

        registry.add(first).await.unwrap();
        assert!(registry.add(second).await.is_err());
        assert_eq!(registry.count().await, 1);
    }

    #[tokio::test]
    async fn broadcast_reaches_every_subscriber() {
        let registry = SubscriberRegistry::new(10);
        let (sub_a, mut rx_a) = subscriber();
        let (sub_b, mut rx_b) = subscriber();
        registry.add(sub_a).await.unwrap();
        registry.add(sub_b).await.unwrap();

        let delivered = registry.broadcast("payload").await;
        assert_eq!(delivered, 2);
        assert_eq!(rx_a.recv().await.unwrap(), "payload");
        assert_eq!(rx_b.recv().await.unwrap(), "payload");
    }

    #[tokio::test]
    async fn failed_delivery_evicts_only_the_dead_subscriber() {
        let registry = SubscriberRegistry::new(10);
        let (dead, rx_dead) = subscriber();
        let (live, mut rx_live) = subscriber();
        let dead_id = dead.id;
        let live_id = live.id;
        registry.add(dead).await.unwrap();
        registry.add(live).await.unwrap();

        drop(rx_dead); // connection presumed dead

        let delivered = registry.broadcast("tick").await;
        assert_eq!(delivered, 1);
        assert_eq!(rx_live.recv().await.unwrap(), "tick");
        assert_eq!(registry.count().await, 1);

        // The dead subscriber is gone for all subsequent passes.
        let snapshot = registry.snapshot().await;
        assert!(snapshot.iter().all(|(id, _)| *id != dead_id));
        assert!(snapshot.iter().any(|(id, _)| *id == live_id));
    }

    #[tokio::test]
    async fn snapshot_excludes_later_additions() {
        let registry = SubscriberRegistry::new(10);
        let (first, _rx1) = subscriber();
        registry.add(first).await.unwrap();

        let snapshot = registry.snapshot().await;

        let (late, _rx2) = subscriber();
        registry.add(late).await.unwrap();

        assert_eq!(snapshot.len(), 1);
        assert_eq!(registry.count().await, 2);
    }

    #[tokio::test]
    async fn concurrent_adds_and_removes_settle_exactly() {
        let registry = Arc::new(SubscriberRegistry::new(100));
        let mut receivers = Vec::new();
        let mut ids = Vec::new();

        let mut add_handles = Vec::new();
        for _ in 0..16 {
            let (sub, rx) = subscriber();
            ids.push(sub.id);
            receivers.push(rx);
            let registry = registry.clone();
            add_handles.push(tokio::spawn(async move {
                registry.add(sub).await.unwrap();
            }));
        }
        for handle in add_handles {
            handle.await.unwrap();
        }
        assert_eq!(registry.count().await, 16);

        let mut remove_handles = Vec::new();
        for id in ids.into_iter().take(8) {
            let registry = registry.clone();
            remove_handles.push(tokio::spawn(async move {
                registry.remove(id).await;
            }));
        }
        for handle in remove_handles {
            handle.await.unwrap();
        }
        assert_eq!(registry.count().await, 8);
    }
}
