//! Event bus for fleetsync using tokio::broadcast
//!
//! Every cache mutation, subscription transition and failure is published
//! here so consumers (views, the alert recomputation loop) can react.

use crate::channel::SubscriptionState;
use crate::models::{ChangeKind, Collection};
use tokio::sync::broadcast;

/// Events emitted by the sync layer
#[derive(Debug, Clone)]
pub enum SyncEvent {
    /// A full fetch result replaced a collection
    CacheUpdated(Collection),
    /// A push change was applied to a collection
    ChangeApplied {
        collection: Collection,
        kind: ChangeKind,
        record_id: Option<String>,
    },
    /// A collection was marked for background refetch
    Invalidated(Collection),
    /// An unused collection was dropped from the cache
    Evicted(Collection),
    /// A fetch failed; the cache keeps serving previous data
    RefetchFailed {
        collection: Collection,
        message: String,
    },
    /// A change-feed subscription moved to a new state
    SubscriptionChanged {
        collection: Collection,
        state: SubscriptionState,
    },
    /// The derived alert list changed
    AlertsUpdated { total: usize, critical: usize },
    /// Persisted entries were loaded at startup
    HydrationCompleted { restored: usize },
    /// The cache was written to local storage
    SnapshotSaved { entries: usize },
}

impl SyncEvent {
    /// Collection whose cached data this event changed, if any
    pub fn changed_collection(&self) -> Option<Collection> {
        match self {
            SyncEvent::CacheUpdated(c) | SyncEvent::Evicted(c) => Some(*c),
            SyncEvent::ChangeApplied { collection, .. } => Some(*collection),
            _ => None,
        }
    }
}

/// Event bus for broadcasting sync events
///
/// Uses tokio::broadcast for multi-consumer support. Slow receivers observe
/// `RecvError::Lagged` rather than blocking publishers.
pub struct EventBus {
    sender: broadcast::Sender<SyncEvent>,
}

impl EventBus {
    /// Create a new event bus with specified channel capacity
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self { sender }
    }

    /// Create with default capacity (256 events)
    pub fn default_capacity() -> Self {
        Self::new(256)
    }

    /// Publish an event to all subscribers
    pub fn publish(&self, event: SyncEvent) {
        // No subscribers is not an error
        let _ = self.sender.send(event);
    }

    /// Subscribe to receive events
    pub fn subscribe(&self) -> broadcast::Receiver<SyncEvent> {
        self.sender.subscribe()
    }

    /// Get current number of active subscribers
    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::default_capacity()
    }
}

impl Clone for EventBus {
    fn clone(&self) -> Self {
        Self {
            sender: self.sender.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_event_bus_publish_subscribe() {
        let bus = EventBus::default_capacity();
        let mut rx = bus.subscribe();

        bus.publish(SyncEvent::CacheUpdated(Collection::Vehicles));
        bus.publish(SyncEvent::Invalidated(Collection::Fuels));

        let event1 = rx.recv().await.unwrap();
        assert!(matches!(event1, SyncEvent::CacheUpdated(Collection::Vehicles)));

        let event2 = rx.recv().await.unwrap();
        assert!(matches!(event2, SyncEvent::Invalidated(Collection::Fuels)));
    }

    #[tokio::test]
    async fn test_event_bus_multiple_subscribers() {
        let bus = EventBus::default_capacity();
        let mut rx1 = bus.subscribe();
        let mut rx2 = bus.subscribe();

        assert_eq!(bus.subscriber_count(), 2);

        bus.publish(SyncEvent::SnapshotSaved { entries: 3 });

        let e1 = rx1.recv().await.unwrap();
        let e2 = rx2.recv().await.unwrap();

        assert!(matches!(e1, SyncEvent::SnapshotSaved { entries: 3 }));
        assert!(matches!(e2, SyncEvent::SnapshotSaved { entries: 3 }));
    }

    #[test]
    fn test_event_bus_no_subscribers_ok() {
        let bus = EventBus::default_capacity();
        bus.publish(SyncEvent::Evicted(Collection::Equipment));
    }

    #[test]
    fn test_changed_collection() {
        let applied = SyncEvent::ChangeApplied {
            collection: Collection::Movements,
            kind: ChangeKind::Insert,
            record_id: Some("m1".into()),
        };
        assert_eq!(applied.changed_collection(), Some(Collection::Movements));
        assert_eq!(
            SyncEvent::Invalidated(Collection::Movements).changed_collection(),
            None
        );
        assert_eq!(
            SyncEvent::AlertsUpdated {
                total: 1,
                critical: 0
            }
            .changed_collection(),
            None
        );
    }
}
