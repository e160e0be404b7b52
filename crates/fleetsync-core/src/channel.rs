//! Change event channel
//!
//! One logical subscription per collection. The transport gets an
//! `mpsc::Sender<FeedMessage>` and pushes into it; a dedicated task per
//! collection drains the receiver and applies events in arrival order.
//!
//! ```text
//! Unsubscribed -> Subscribing -> Active -> Degraded (Lost)
//!                                  ^          |
//!                                  +----------+ (Reconnected, re-registered)
//! ```
//!
//! Returning to `Active` from `Degraded` triggers one reconciling refetch
//! since events may have been missed while the feed was down.

use crate::error::SyncError;
use crate::event::{EventBus, SyncEvent};
use crate::fetch::Refetcher;
use crate::models::{ChangeEvent, Collection};
use crate::notifications::{Notification, NotificationBuffer, NotificationLevel};
use crate::store::{CacheStore, PatchOutcome};
use async_trait::async_trait;
use dashmap::DashMap;
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, Mutex as AsyncMutex};
use tokio::task::JoinHandle;
use tracing::{debug, info, trace, warn};

/// Buffered messages per subscription before the transport backs off
const FEED_BUFFER: usize = 256;

/// What a transport delivers for one subscription
#[derive(Debug, Clone)]
pub enum FeedMessage {
    Event(ChangeEvent),
    /// The connection dropped; events may be missed until `Reconnected`
    Lost(String),
    Reconnected,
}

/// Push-based change transport
#[async_trait]
pub trait ChangeFeed: Send + Sync {
    /// Start delivering changes of `collection` into `sink`
    async fn subscribe(
        &self,
        collection: Collection,
        sink: mpsc::Sender<FeedMessage>,
    ) -> Result<(), SyncError>;

    /// Stop delivering changes of `collection`. Unknown keys are ignored.
    async fn unsubscribe(&self, collection: Collection);
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SubscriptionState {
    Unsubscribed,
    Subscribing,
    Active,
    Degraded,
}

impl SubscriptionState {
    pub fn label(&self) -> &'static str {
        match self {
            SubscriptionState::Unsubscribed => "unsubscribed",
            SubscriptionState::Subscribing => "subscribing",
            SubscriptionState::Active => "active",
            SubscriptionState::Degraded => "degraded",
        }
    }
}

struct Registration {
    id: u64,
    task: JoinHandle<()>,
}

/// Bounded memory of recently applied event ids
struct ReplayGuard {
    capacity: usize,
    order: VecDeque<String>,
    seen: HashSet<String>,
}

impl ReplayGuard {
    fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            order: VecDeque::new(),
            seen: HashSet::new(),
        }
    }

    fn contains(&self, id: &str) -> bool {
        self.seen.contains(id)
    }

    fn remember(&mut self, id: String) {
        if !self.seen.insert(id.clone()) {
            return;
        }
        self.order.push_back(id);
        if self.order.len() > self.capacity {
            if let Some(oldest) = self.order.pop_front() {
                self.seen.remove(&oldest);
            }
        }
    }
}

/// Keeps the cache in step with pushed changes
pub struct ChangeEventChannel {
    feed: Arc<dyn ChangeFeed>,
    store: Arc<CacheStore>,
    refetcher: Arc<Refetcher>,
    event_bus: EventBus,
    notifications: Arc<NotificationBuffer>,
    states: DashMap<Collection, SubscriptionState>,
    registrations: Mutex<HashMap<Collection, Registration>>,
    /// Serializes subscribe/unsubscribe per collection across their awaits
    key_locks: DashMap<Collection, Arc<AsyncMutex<()>>>,
    next_registration: AtomicU64,
    guards: DashMap<Collection, ReplayGuard>,
    guard_capacity: usize,
}

impl ChangeEventChannel {
    pub fn new(
        feed: Arc<dyn ChangeFeed>,
        store: Arc<CacheStore>,
        refetcher: Arc<Refetcher>,
        event_bus: EventBus,
        notifications: Arc<NotificationBuffer>,
        guard_capacity: usize,
    ) -> Self {
        Self {
            feed,
            store,
            refetcher,
            event_bus,
            notifications,
            states: DashMap::new(),
            registrations: Mutex::new(HashMap::new()),
            key_locks: DashMap::new(),
            next_registration: AtomicU64::new(0),
            guards: DashMap::new(),
            guard_capacity,
        }
    }

    pub fn state(&self, collection: Collection) -> SubscriptionState {
        self.states
            .get(&collection)
            .map(|s| *s)
            .unwrap_or(SubscriptionState::Unsubscribed)
    }

    /// Collections whose live feed is currently down
    pub fn degraded(&self) -> Vec<Collection> {
        let mut keys: Vec<_> = self
            .states
            .iter()
            .filter(|r| *r.value() == SubscriptionState::Degraded)
            .map(|r| *r.key())
            .collect();
        keys.sort();
        keys
    }

    fn set_state(&self, collection: Collection, state: SubscriptionState) {
        let previous = self.states.insert(collection, state);
        if previous != Some(state) {
            trace!(%collection, state = state.label(), "Subscription state changed");
            self.event_bus
                .publish(SyncEvent::SubscriptionChanged { collection, state });
        }
    }

    fn key_lock(&self, collection: Collection) -> Arc<AsyncMutex<()>> {
        self.key_locks.entry(collection).or_default().clone()
    }

    /// Subscribe to a collection's changes, releasing any existing
    /// registration for it first.
    pub async fn subscribe(self: &Arc<Self>, collection: Collection) -> Result<(), SyncError> {
        let lock = self.key_lock(collection);
        let _guard = lock.lock().await;

        self.release(collection).await;
        self.set_state(collection, SubscriptionState::Subscribing);

        let (tx, mut rx) = mpsc::channel(FEED_BUFFER);
        if let Err(e) = self.feed.subscribe(collection, tx.clone()).await {
            warn!(%collection, error = %e, "Subscription failed");
            self.set_state(collection, SubscriptionState::Unsubscribed);
            return Err(e);
        }
        self.set_state(collection, SubscriptionState::Active);

        let id = self.next_registration.fetch_add(1, Ordering::Relaxed);
        let this = Arc::clone(self);
        let task = tokio::spawn(async move {
            while let Some(message) = rx.recv().await {
                if !this.handle_message(collection, id, message, &tx).await {
                    break;
                }
            }
            trace!(%collection, "Change feed closed");
        });
        let displaced = self
            .registrations
            .lock()
            .insert(collection, Registration { id, task });
        if let Some(stale) = displaced {
            stale.task.abort();
            debug!(%collection, "Displaced registration aborted");
        }

        debug!(%collection, "Subscribed to change feed");
        Ok(())
    }

    /// Subscribe every collection. Failures are logged; returns how many
    /// subscriptions are active.
    pub async fn subscribe_all(self: &Arc<Self>) -> usize {
        let mut active = 0;
        for collection in Collection::ALL {
            if self.subscribe(collection).await.is_ok() {
                active += 1;
            }
        }
        active
    }

    pub async fn unsubscribe(&self, collection: Collection) {
        let lock = self.key_lock(collection);
        let _guard = lock.lock().await;

        self.release(collection).await;
        self.set_state(collection, SubscriptionState::Unsubscribed);
    }

    /// Release every subscription
    pub async fn shutdown(&self) {
        let keys: Vec<_> = self.registrations.lock().keys().copied().collect();
        for collection in keys {
            self.unsubscribe(collection).await;
        }
        info!("Change event channel stopped");
    }

    /// Stop the processing task and drop the transport registration
    async fn release(&self, collection: Collection) {
        let previous = self.registrations.lock().remove(&collection);
        if let Some(registration) = previous {
            registration.task.abort();
            self.feed.unsubscribe(collection).await;
            trace!(%collection, "Previous registration released");
        }
    }

    /// Forget registration `id` if it is still the current one. Its task
    /// is left to finish on its own.
    fn drop_registration(&self, collection: Collection, id: u64) {
        let mut registrations = self.registrations.lock();
        if registrations.get(&collection).is_some_and(|r| r.id == id) {
            registrations.remove(&collection);
        }
    }

    /// Handle one transport message. Returns `false` once the registration
    /// is gone and its task should stop draining.
    async fn handle_message(
        &self,
        collection: Collection,
        registration: u64,
        message: FeedMessage,
        sink: &mpsc::Sender<FeedMessage>,
    ) -> bool {
        match message {
            FeedMessage::Event(event) => {
                self.apply_event(collection, &event);
            }
            FeedMessage::Lost(reason) => {
                let error = SyncError::SubscriptionLost { collection, reason };
                warn!(%collection, error = %error, "Live updates interrupted");
                self.set_state(collection, SubscriptionState::Degraded);
                self.notifications.push(Notification::new(
                    NotificationLevel::Warning,
                    Some(collection),
                    format!("Live updates for {} interrupted", collection),
                ));
            }
            FeedMessage::Reconnected => {
                let previous = self.state(collection);
                self.feed.unsubscribe(collection).await;
                self.set_state(collection, SubscriptionState::Subscribing);

                match self.feed.subscribe(collection, sink.clone()).await {
                    Ok(()) => {
                        self.set_state(collection, SubscriptionState::Active);
                        if previous == SubscriptionState::Degraded {
                            info!(%collection, "Live updates restored, reconciling");
                            self.refetcher.request(collection);
                        }
                    }
                    Err(e) => {
                        warn!(%collection, error = %e, "Re-subscription failed");
                        self.drop_registration(collection, registration);
                        self.set_state(collection, SubscriptionState::Unsubscribed);
                        return false;
                    }
                }
            }
        }
        true
    }

    /// Apply one change event to the cache.
    ///
    /// Replayed event ids and malformed events are dropped; `None` means the
    /// event was not applied.
    pub fn apply_event(&self, collection: Collection, event: &ChangeEvent) -> Option<PatchOutcome> {
        if let Some(id) = &event.event_id {
            let replayed = self
                .guards
                .get(&collection)
                .is_some_and(|guard| guard.contains(id));
            if replayed {
                trace!(%collection, event_id = %id, "Replayed event skipped");
                return None;
            }
        }

        let outcome = match self.store.patch(collection, event) {
            Ok(outcome) => outcome,
            Err(e) => {
                warn!(%collection, error = %e, "Dropping malformed change event");
                return None;
            }
        };

        if let Some(id) = &event.event_id {
            self.guards
                .entry(collection)
                .or_insert_with(|| ReplayGuard::new(self.guard_capacity))
                .remember(id.clone());
        }

        if outcome.changed() {
            self.notifications.push(Notification::from_change(event));
            self.event_bus.publish(SyncEvent::ChangeApplied {
                collection,
                kind: event.kind,
                record_id: event.record_id(),
            });
        }
        Some(outcome)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fetch::{FetchResult, Fetcher};
    use crate::models::{record_id, EntryStatus};
    use chrono::{TimeDelta, Utc};
    use serde_json::json;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::time::Duration;
    use tokio::sync::broadcast;

    #[derive(Default)]
    struct MockFeed {
        sinks: Mutex<HashMap<Collection, mpsc::Sender<FeedMessage>>>,
        subscribes: AtomicUsize,
        unsubscribes: AtomicUsize,
        fail: AtomicBool,
    }

    impl MockFeed {
        async fn send(&self, collection: Collection, message: FeedMessage) {
            let sink = self.sinks.lock().get(&collection).cloned().unwrap();
            sink.send(message).await.unwrap();
        }
    }

    #[async_trait]
    impl ChangeFeed for MockFeed {
        async fn subscribe(
            &self,
            collection: Collection,
            sink: mpsc::Sender<FeedMessage>,
        ) -> Result<(), SyncError> {
            self.subscribes.fetch_add(1, Ordering::SeqCst);
            // Real transports await a handshake here
            tokio::task::yield_now().await;
            if self.fail.load(Ordering::SeqCst) {
                return Err(SyncError::SubscriptionLost {
                    collection,
                    reason: "refused".to_string(),
                });
            }
            self.sinks.lock().insert(collection, sink);
            Ok(())
        }

        async fn unsubscribe(&self, collection: Collection) {
            self.unsubscribes.fetch_add(1, Ordering::SeqCst);
            self.sinks.lock().remove(&collection);
        }
    }

    #[derive(Default)]
    struct CountingFetcher {
        calls: AtomicUsize,
    }

    #[async_trait]
    impl Fetcher for CountingFetcher {
        async fn fetch_collection(&self, _collection: Collection) -> Result<FetchResult, SyncError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(FetchResult::new(
                vec![json!({"id": "v1"}), json!({"id": "v9"})],
                Utc::now() + TimeDelta::seconds(1),
            ))
        }
    }

    struct Harness {
        channel: Arc<ChangeEventChannel>,
        feed: Arc<MockFeed>,
        fetcher: Arc<CountingFetcher>,
        store: Arc<CacheStore>,
        notifications: Arc<NotificationBuffer>,
        events: broadcast::Receiver<SyncEvent>,
    }

    fn harness() -> Harness {
        let store = Arc::new(CacheStore::with_defaults());
        let bus = EventBus::default_capacity();
        let notifications = Arc::new(NotificationBuffer::default());
        let feed = Arc::new(MockFeed::default());
        let fetcher = Arc::new(CountingFetcher::default());
        let refetcher = Arc::new(Refetcher::new(
            fetcher.clone(),
            Arc::clone(&store),
            bus.clone(),
            Arc::clone(&notifications),
            Duration::from_secs(10),
            tokio::runtime::Handle::current(),
        ));
        let channel = Arc::new(ChangeEventChannel::new(
            feed.clone(),
            Arc::clone(&store),
            refetcher,
            bus.clone(),
            Arc::clone(&notifications),
            256,
        ));
        Harness {
            channel,
            feed,
            fetcher,
            store,
            notifications,
            events: bus.subscribe(),
        }
    }

    /// Wait for the first bus event matching `pred`
    async fn wait_for(
        rx: &mut broadcast::Receiver<SyncEvent>,
        pred: impl Fn(&SyncEvent) -> bool,
    ) -> SyncEvent {
        tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                let event = rx.recv().await.unwrap();
                if pred(&event) {
                    return event;
                }
            }
        })
        .await
        .expect("timed out waiting for event")
    }

    fn is_applied(event: &SyncEvent) -> bool {
        matches!(event, SyncEvent::ChangeApplied { .. })
    }

    fn ids(store: &CacheStore, key: Collection) -> Vec<String> {
        store.records(key).iter().filter_map(record_id).collect()
    }

    #[tokio::test]
    async fn test_events_applied_in_order() {
        let mut h = harness();
        h.store.set(
            Collection::Vehicles,
            vec![json!({"id": "v1", "plate": "AA-11"})],
            EntryStatus::Fresh,
        );
        h.channel.subscribe(Collection::Vehicles).await.unwrap();
        assert_eq!(h.channel.state(Collection::Vehicles), SubscriptionState::Active);

        let v = Collection::Vehicles;
        h.feed
            .send(v, FeedMessage::Event(ChangeEvent::insert(v, json!({"id": "v2"}))))
            .await;
        h.feed
            .send(
                v,
                FeedMessage::Event(ChangeEvent::update(v, json!({"id": "v1", "plate": "BB-22"}))),
            )
            .await;
        h.feed
            .send(v, FeedMessage::Event(ChangeEvent::delete(v, json!({"id": "v2"}))))
            .await;
        for _ in 0..3 {
            wait_for(&mut h.events, is_applied).await;
        }

        assert_eq!(ids(&h.store, v), vec!["v1"]);
        assert_eq!(h.store.records(v)[0]["plate"], "BB-22");
        assert_eq!(h.notifications.len(), 3);
        assert_eq!(h.notifications.recent(1)[0].message, "Vehicle #v2 removed");
    }

    #[tokio::test]
    async fn test_malformed_event_dropped_processing_continues() {
        let mut h = harness();
        let v = Collection::Vehicles;
        h.store.set(v, vec![], EntryStatus::Fresh);
        h.channel.subscribe(v).await.unwrap();

        // Addressed to another collection
        h.feed
            .send(
                v,
                FeedMessage::Event(ChangeEvent::insert(Collection::Fuels, json!({"id": "f1"}))),
            )
            .await;
        // No identity
        h.feed
            .send(v, FeedMessage::Event(ChangeEvent::insert(v, json!({"plate": "X"}))))
            .await;
        h.feed
            .send(v, FeedMessage::Event(ChangeEvent::insert(v, json!({"id": "v3"}))))
            .await;

        wait_for(&mut h.events, is_applied).await;
        assert_eq!(ids(&h.store, v), vec!["v3"]);
        assert_eq!(h.channel.state(v), SubscriptionState::Active);
    }

    #[tokio::test]
    async fn test_replayed_event_id_skipped() {
        let mut h = harness();
        let f = Collection::Fuels;
        h.store.set(f, vec![], EntryStatus::Fresh);
        h.channel.subscribe(f).await.unwrap();

        let first = ChangeEvent::insert(f, json!({"id": 1, "liters": 40})).with_event_id("e1");
        h.feed.send(f, FeedMessage::Event(first.clone())).await;
        h.feed.send(f, FeedMessage::Event(first)).await;
        h.feed
            .send(
                f,
                FeedMessage::Event(ChangeEvent::insert(f, json!({"id": 2})).with_event_id("e2")),
            )
            .await;

        wait_for(&mut h.events, is_applied).await;
        wait_for(&mut h.events, is_applied).await;
        assert_eq!(ids(&h.store, f), vec!["1", "2"]);
        assert_eq!(h.notifications.len(), 2);
    }

    #[test]
    fn test_replay_guard_is_bounded() {
        let mut guard = ReplayGuard::new(2);
        guard.remember("a".into());
        guard.remember("b".into());
        guard.remember("c".into());
        assert!(!guard.contains("a"));
        assert!(guard.contains("b"));
        assert!(guard.contains("c"));
    }

    #[tokio::test]
    async fn test_lost_then_reconnected_reconciles() {
        let mut h = harness();
        let v = Collection::Vehicles;
        h.store.set(v, vec![json!({"id": "v1"})], EntryStatus::Fresh);
        h.channel.subscribe(v).await.unwrap();

        h.feed.send(v, FeedMessage::Lost("socket closed".into())).await;
        wait_for(&mut h.events, |e| {
            matches!(
                e,
                SyncEvent::SubscriptionChanged {
                    state: SubscriptionState::Degraded,
                    ..
                }
            )
        })
        .await;
        assert_eq!(h.channel.degraded(), vec![v]);
        assert_eq!(h.notifications.len(), 1);

        h.feed.send(v, FeedMessage::Reconnected).await;
        wait_for(&mut h.events, |e| {
            matches!(e, SyncEvent::CacheUpdated(Collection::Vehicles))
        })
        .await;

        assert_eq!(h.channel.state(v), SubscriptionState::Active);
        assert!(h.channel.degraded().is_empty());
        assert_eq!(h.feed.subscribes.load(Ordering::SeqCst), 2);
        assert_eq!(h.feed.unsubscribes.load(Ordering::SeqCst), 1);
        assert_eq!(h.fetcher.calls.load(Ordering::SeqCst), 1);
        assert_eq!(ids(&h.store, v), vec!["v1", "v9"]);
    }

    #[tokio::test]
    async fn test_reconnect_while_active_skips_refetch() {
        let mut h = harness();
        let v = Collection::Vehicles;
        h.store.set(v, vec![], EntryStatus::Fresh);
        h.channel.subscribe(v).await.unwrap();

        h.feed.send(v, FeedMessage::Reconnected).await;
        h.feed
            .send(v, FeedMessage::Event(ChangeEvent::insert(v, json!({"id": "v5"}))))
            .await;
        wait_for(&mut h.events, is_applied).await;

        assert_eq!(h.channel.state(v), SubscriptionState::Active);
        assert_eq!(h.fetcher.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_failed_subscription_is_unsubscribed() {
        let h = harness();
        h.feed.fail.store(true, Ordering::SeqCst);
        let err = h.channel.subscribe(Collection::Fuels).await.unwrap_err();
        assert!(matches!(err, SyncError::SubscriptionLost { .. }));
        assert_eq!(
            h.channel.state(Collection::Fuels),
            SubscriptionState::Unsubscribed
        );
    }

    #[tokio::test]
    async fn test_resubscribe_releases_previous_registration() {
        let h = harness();
        h.channel.subscribe(Collection::Movements).await.unwrap();
        h.channel.subscribe(Collection::Movements).await.unwrap();
        assert_eq!(h.feed.subscribes.load(Ordering::SeqCst), 2);
        assert_eq!(h.feed.unsubscribes.load(Ordering::SeqCst), 1);
        assert_eq!(h.channel.registrations.lock().len(), 1);

        h.channel.shutdown().await;
        assert_eq!(h.feed.unsubscribes.load(Ordering::SeqCst), 2);
        assert_eq!(
            h.channel.state(Collection::Movements),
            SubscriptionState::Unsubscribed
        );
        assert!(h.channel.registrations.lock().is_empty());
    }

    #[tokio::test]
    async fn test_subscribe_all_counts_active() {
        let h = harness();
        assert_eq!(h.channel.subscribe_all().await, Collection::ALL.len());
        assert!(Collection::ALL
            .iter()
            .all(|c| h.channel.state(*c) == SubscriptionState::Active));
    }

    #[tokio::test]
    async fn test_concurrent_subscribes_leave_one_registration() {
        let h = harness();
        let v = Collection::Vehicles;
        let (first, second) = tokio::join!(h.channel.subscribe(v), h.channel.subscribe(v));
        first.unwrap();
        second.unwrap();
        assert_eq!(h.channel.registrations.lock().len(), 1);
        assert_eq!(h.feed.subscribes.load(Ordering::SeqCst), 2);
        assert_eq!(h.feed.unsubscribes.load(Ordering::SeqCst), 1);

        h.channel.shutdown().await;
        tokio::time::sleep(Duration::from_millis(200)).await;
        // Only the harness still holds the channel: every drain task ended
        assert_eq!(Arc::strong_count(&h.channel), 1);
    }

    #[tokio::test]
    async fn test_failed_resubscribe_releases_registration() {
        let mut h = harness();
        let v = Collection::Vehicles;
        h.channel.subscribe(v).await.unwrap();

        h.feed.send(v, FeedMessage::Lost("socket closed".into())).await;
        h.feed.fail.store(true, Ordering::SeqCst);
        h.feed.send(v, FeedMessage::Reconnected).await;
        wait_for(&mut h.events, |e| {
            matches!(
                e,
                SyncEvent::SubscriptionChanged {
                    state: SubscriptionState::Unsubscribed,
                    ..
                }
            )
        })
        .await;

        assert_eq!(h.channel.state(v), SubscriptionState::Unsubscribed);
        assert!(h.channel.registrations.lock().is_empty());
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(Arc::strong_count(&h.channel), 1);
        assert_eq!(h.fetcher.calls.load(Ordering::SeqCst), 0);
    }
}
