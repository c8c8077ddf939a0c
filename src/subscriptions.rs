/// Post-commit change notifications.
///
/// A subscription names a path; it fires whenever a commit lands at that
/// path, at any descendant, or at any ancestor. Subscribers receive
/// events over a broadcast channel, so several consumers can observe the
/// same subscription. The engine notifies after the store write and
/// serializes notifications per commit; a subscriber that fell behind or
/// went away is skipped and logged, never blocking the rest.
use crate::types::{NodeId, Path};
use dashmap::DashMap;
use serde_json::Value as JsonValue;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::broadcast;
use tracing::debug;

/// Default channel capacity for subscription broadcasts.
const DEFAULT_CHANNEL_CAPACITY: usize = 256;

/// Unique identifier for a subscription.
///
/// The id is the handle: unsubscribing resolves it through the registry
/// rather than holding a reference back into the engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(pub u64);

impl fmt::Display for SubscriptionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "sub-{}", self.0)
    }
}

/// A change notification delivered to subscribers.
#[derive(Debug, Clone)]
pub struct ChangeEvent {
    /// The path that changed (may be a descendant or ancestor of the
    /// subscribed path).
    pub path: Path,
    /// The committed value; `Null` for a tombstone.
    pub value: JsonValue,
    /// The node that first issued the write.
    pub origin: NodeId,
    /// Wall-clock millis of the committed version.
    pub timestamp: i64,
}

struct SubscriptionState {
    path: Path,
    sender: broadcast::Sender<ChangeEvent>,
    events_delivered: AtomicU64,
}

/// Summary of an active subscription.
#[derive(Debug, Clone)]
pub struct SubscriptionInfo {
    pub id: SubscriptionId,
    pub path: Path,
    pub events_delivered: u64,
}

/// Registry of path subscriptions.
///
/// Every `subscribe` call creates a distinct subscription, even for a
/// path already subscribed; unsubscribing one leaves the others intact.
pub struct SubscriptionRegistry {
    subscriptions: DashMap<SubscriptionId, SubscriptionState>,
    next_id: AtomicU64,
    channel_capacity: usize,
}

impl SubscriptionRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self {
            subscriptions: DashMap::new(),
            next_id: AtomicU64::new(1),
            channel_capacity: DEFAULT_CHANNEL_CAPACITY,
        }
    }

    /// Register a subscription on a path.
    ///
    /// Returns the id and a receiver for its events.
    pub fn subscribe(&self, path: Path) -> (SubscriptionId, broadcast::Receiver<ChangeEvent>) {
        let id = SubscriptionId(self.next_id.fetch_add(1, Ordering::SeqCst));
        let (sender, receiver) = broadcast::channel(self.channel_capacity);

        self.subscriptions.insert(
            id,
            SubscriptionState {
                path,
                sender,
                events_delivered: AtomicU64::new(0),
            },
        );

        (id, receiver)
    }

    /// Attach another receiver to an existing subscription.
    pub fn receiver(&self, id: SubscriptionId) -> Option<broadcast::Receiver<ChangeEvent>> {
        self.subscriptions
            .get(&id)
            .map(|state| state.sender.subscribe())
    }

    /// Remove a subscription. Returns whether it existed.
    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        self.subscriptions.remove(&id).is_some()
    }

    /// Number of active subscriptions.
    pub fn count(&self) -> usize {
        self.subscriptions.len()
    }

    /// Summaries of all active subscriptions.
    pub fn list(&self) -> Vec<SubscriptionInfo> {
        self.subscriptions
            .iter()
            .map(|entry| SubscriptionInfo {
                id: *entry.key(),
                path: entry.value().path.clone(),
                events_delivered: entry.value().events_delivered.load(Ordering::Relaxed),
            })
            .collect()
    }

    /// Deliver a committed change to every related subscription.
    ///
    /// Called by the engine after the store write. Delivery to a dead or
    /// lagging receiver is logged and skipped.
    pub fn notify(&self, event: &ChangeEvent) {
        for entry in self.subscriptions.iter() {
            let state = entry.value();
            if state.path.related(&event.path) {
                if state.sender.send(event.clone()).is_ok() {
                    state.events_delivered.fetch_add(1, Ordering::Relaxed);
                } else {
                    debug!(subscription = %entry.key(), path = %state.path, "no live receivers");
                }
            }
        }
    }
}

impl Default for SubscriptionRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn path(s: &str) -> Path {
        Path::parse(s).unwrap()
    }

    fn event(p: &str, value: JsonValue) -> ChangeEvent {
        ChangeEvent {
            path: path(p),
            value,
            origin: NodeId::new("test"),
            timestamp: 0,
        }
    }

    #[tokio::test]
    async fn test_exact_path_delivery() {
        let registry = SubscriptionRegistry::new();
        let (_id, mut rx) = registry.subscribe(path("users/alice"));

        registry.notify(&event("users/alice", json!({"name": "Alice"})));

        let got = rx.recv().await.unwrap();
        assert_eq!(got.path, path("users/alice"));
        assert_eq!(got.value, json!({"name": "Alice"}));
    }

    #[tokio::test]
    async fn test_ancestor_subscription_sees_descendant_change() {
        let registry = SubscriptionRegistry::new();
        let (_id, mut rx) = registry.subscribe(path("users"));

        registry.notify(&event("users/alice/email", json!("a@x")));

        let got = rx.recv().await.unwrap();
        assert_eq!(got.path, path("users/alice/email"));
    }

    #[tokio::test]
    async fn test_descendant_subscription_sees_ancestor_change() {
        let registry = SubscriptionRegistry::new();
        let (_id, mut rx) = registry.subscribe(path("users/alice/email"));

        registry.notify(&event("users", json!({})));

        let got = rx.recv().await.unwrap();
        assert_eq!(got.path, path("users"));
    }

    #[tokio::test]
    async fn test_unrelated_path_not_delivered() {
        let registry = SubscriptionRegistry::new();
        let (_id, mut rx) = registry.subscribe(path("users"));

        registry.notify(&event("sessions/s1", json!(1)));
        // Segment-wise relation, not string-prefix: "userspace" is no kin.
        registry.notify(&event("userspace", json!(2)));

        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_unsubscribe_stops_delivery() {
        let registry = SubscriptionRegistry::new();
        let (id, mut rx) = registry.subscribe(path("x"));

        assert!(registry.unsubscribe(id));
        assert_eq!(registry.count(), 0);
        assert!(!registry.unsubscribe(id));

        registry.notify(&event("x", json!(1)));
        // Channel is closed once the registry drops the sender.
        assert!(matches!(
            rx.try_recv(),
            Err(broadcast::error::TryRecvError::Closed)
        ));
    }

    #[tokio::test]
    async fn test_duplicate_registration_is_distinct() {
        let registry = SubscriptionRegistry::new();
        let (id1, mut rx1) = registry.subscribe(path("x"));
        let (id2, mut rx2) = registry.subscribe(path("x"));
        assert_ne!(id1, id2);

        registry.notify(&event("x", json!(1)));
        assert!(rx1.try_recv().is_ok());
        assert!(rx2.try_recv().is_ok());

        registry.unsubscribe(id1);
        registry.notify(&event("x", json!(2)));
        assert!(rx2.try_recv().is_ok());
    }

    #[tokio::test]
    async fn test_delivery_counter() {
        let registry = SubscriptionRegistry::new();
        let (id, _rx) = registry.subscribe(path("x"));

        for i in 0..5 {
            registry.notify(&event("x", json!(i)));
        }

        let info = registry
            .list()
            .into_iter()
            .find(|info| info.id == id)
            .unwrap();
        assert_eq!(info.events_delivered, 5);
    }

    #[tokio::test]
    async fn test_dead_receiver_does_not_block_others() {
        let registry = SubscriptionRegistry::new();
        let (_id1, rx1) = registry.subscribe(path("x"));
        let (_id2, mut rx2) = registry.subscribe(path("x"));
        drop(rx1);

        registry.notify(&event("x", json!(1)));
        assert!(rx2.try_recv().is_ok());
    }
}
