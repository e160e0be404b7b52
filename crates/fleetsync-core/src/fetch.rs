//! Full-collection fetches against the remote source of truth

use crate::error::SyncError;
use crate::event::{EventBus, SyncEvent};
use crate::models::{Collection, Record};
use crate::notifications::{Notification, NotificationBuffer, NotificationLevel};
use crate::store::CacheStore;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::runtime::Handle;
use tracing::{debug, info, warn};

/// A fetched collection and the instant the server produced it
#[derive(Debug, Clone)]
pub struct FetchResult {
    pub records: Vec<Record>,
    pub as_of: DateTime<Utc>,
}

impl FetchResult {
    pub fn new(records: Vec<Record>, as_of: DateTime<Utc>) -> Self {
        Self { records, as_of }
    }
}

/// Request/response access to the remote source of truth
#[async_trait]
pub trait Fetcher: Send + Sync {
    /// Fetch every record of a collection.
    ///
    /// Network and server failures are reported as
    /// [`SyncError::TransientFetch`].
    async fn fetch_collection(&self, collection: Collection) -> Result<FetchResult, SyncError>;
}

/// Runs background refetches with per-collection coalescing and a timeout
pub struct Refetcher {
    fetcher: Arc<dyn Fetcher>,
    store: Arc<CacheStore>,
    event_bus: EventBus,
    notifications: Arc<NotificationBuffer>,
    timeout: Duration,
    runtime: Handle,
    /// Collections with a fetch running; `true` when another request arrived
    /// meanwhile and one more fetch is owed
    in_flight: DashMap<Collection, bool>,
}

impl Refetcher {
    pub fn new(
        fetcher: Arc<dyn Fetcher>,
        store: Arc<CacheStore>,
        event_bus: EventBus,
        notifications: Arc<NotificationBuffer>,
        timeout: Duration,
        runtime: Handle,
    ) -> Self {
        Self {
            fetcher,
            store,
            event_bus,
            notifications,
            timeout,
            runtime,
            in_flight: DashMap::new(),
        }
    }

    /// Start a background refetch. Returns whether a new fetch was spawned.
    ///
    /// A request arriving while a fetch for the same collection runs is
    /// coalesced: at most one follow-up fetch is queued behind the running
    /// one. Spawns on the runtime given at construction, so it may be called
    /// from threads outside it.
    pub fn request(self: &Arc<Self>, collection: Collection) -> bool {
        match self.in_flight.entry(collection) {
            Entry::Occupied(mut running) => {
                *running.get_mut() = true;
                debug!(%collection, "Refetch in flight, queued one more");
                return false;
            }
            Entry::Vacant(slot) => {
                slot.insert(false);
            }
        }

        let this = Arc::clone(self);
        self.runtime.spawn(async move {
            loop {
                // Failures are already logged and published
                let _ = this.refetch(collection).await;
                if !this.finish(collection) {
                    break;
                }
                debug!(%collection, "Running queued refetch");
            }
        });
        true
    }

    /// Clear the in-flight mark, or consume a queued request. Returns
    /// whether another fetch is owed.
    fn finish(&self, collection: Collection) -> bool {
        match self.in_flight.entry(collection) {
            Entry::Occupied(mut running) if *running.get() => {
                *running.get_mut() = false;
                true
            }
            Entry::Occupied(running) => {
                running.remove();
                false
            }
            Entry::Vacant(_) => false,
        }
    }

    pub fn is_in_flight(&self, collection: Collection) -> bool {
        self.in_flight.contains_key(&collection)
    }

    /// Fetch a collection now and apply the result.
    ///
    /// Returns `Ok(false)` when the result was older than the cached data and
    /// was discarded. The fetch runs as its own task: when the timeout fires
    /// it counts as a failure, but the request keeps going and a late result
    /// still goes through the stale-response guard.
    pub async fn refetch(self: &Arc<Self>, collection: Collection) -> Result<bool, SyncError> {
        debug!(%collection, "Refetch started");
        let this = Arc::clone(self);
        let mut fetch = self
            .runtime
            .spawn(async move { this.fetch_and_apply(collection).await });

        let outcome = match tokio::time::timeout(self.timeout, &mut fetch).await {
            Ok(Ok(result)) => result,
            Ok(Err(e)) => Err(SyncError::transient(
                collection,
                format!("fetch task failed: {}", e),
            )),
            Err(_) => {
                debug!(%collection, "Fetch outlived its timeout, a late result may still apply");
                Err(SyncError::FetchTimeout {
                    collection,
                    timeout_secs: self.timeout.as_secs(),
                })
            }
        };

        if let Err(e) = &outcome {
            self.record_failure(collection, e);
        }
        outcome
    }

    async fn fetch_and_apply(&self, collection: Collection) -> Result<bool, SyncError> {
        let result = self.fetcher.fetch_collection(collection).await?;
        let count = result.records.len();
        let applied = self.store.apply_fetch(collection, result.records, result.as_of);
        if applied {
            info!(%collection, records = count, "Collection refreshed");
            self.event_bus.publish(SyncEvent::CacheUpdated(collection));
        }
        Ok(applied)
    }

    fn record_failure(&self, collection: Collection, error: &SyncError) {
        warn!(%collection, error = %error, "Refetch failed, serving cached data");
        let message = error.to_string();
        self.store.mark_error(collection, message.clone());
        self.notifications.push(Notification::new(
            NotificationLevel::Warning,
            Some(collection),
            format!("Could not refresh {}: data may be out of date", collection),
        ));
        self.event_bus.publish(SyncEvent::RefetchFailed {
            collection,
            message,
        });
    }
}
