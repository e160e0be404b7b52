//! Adaptive refresh scheduler
//!
//! On every tick, each collection with a [`RefreshPolicy`] gets an interval
//! derived from how often it is read:
//!
//! | reads/hour | interval                       |
//! |------------|--------------------------------|
//! | > 10       | base × usage multiplier        |
//! | > 5        | base × 0.9                     |
//! | < 1        | base × 1.5                     |
//! | otherwise  | base                           |
//!
//! clamped to `[min_interval, max_interval]`. A `Fresh` entry older than its
//! interval is invalidated and refetched. Failed refetches are retried on the
//! same interval, never faster.

use crate::config::{RefreshPolicy, SyncConfig};
use crate::event::{EventBus, SyncEvent};
use crate::fetch::Refetcher;
use crate::models::{Collection, EntryStatus};
use crate::store::CacheStore;
use crate::timeutil::elapsed;
use crate::usage::UsageTracker;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, trace};

/// Effective refresh interval for a collection read `frequency_per_hour`
/// times per hour. Always within the policy's bounds.
pub fn adaptive_interval(policy: &RefreshPolicy, frequency_per_hour: f64) -> Duration {
    let factor = if frequency_per_hour > 10.0 {
        policy.usage_multiplier
    } else if frequency_per_hour > 5.0 {
        0.9
    } else if frequency_per_hour < 1.0 {
        1.5
    } else {
        1.0
    };

    let min = policy.min_interval.as_secs_f64();
    let max = policy.max_interval.as_secs_f64().max(min);
    let secs = (policy.base_interval.as_secs_f64() * factor).clamp(min, max);
    // Whole milliseconds keep 30min × 0.8 at exactly 24min
    Duration::from_millis((secs * 1000.0).round() as u64)
}

/// Edge-triggered application lifecycle signals
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecycleSignal {
    /// The application became visible again
    VisibilityRegained,
    /// The network came back
    NetworkReconnected,
    /// The window regained focus
    FocusRegained,
}

impl LifecycleSignal {
    /// Collections to invalidate among those currently cached
    pub fn targets(&self, tracked: &[Collection]) -> Vec<Collection> {
        match self {
            LifecycleSignal::VisibilityRegained => tracked.to_vec(),
            LifecycleSignal::NetworkReconnected | LifecycleSignal::FocusRegained => tracked
                .iter()
                .copied()
                .filter(Collection::is_critical)
                .collect(),
        }
    }
}

/// A collection selected for background refresh on a tick
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RefreshDecision {
    pub collection: Collection,
    pub frequency: f64,
    pub interval: Duration,
}

/// What a tick did
#[derive(Debug, Default, Clone, PartialEq)]
pub struct TickOutcome {
    /// Collections invalidated; the caller requests their refetch
    pub refresh: Vec<RefreshDecision>,
    pub evicted: Vec<Collection>,
    pub metrics_cleaned: usize,
}

/// Periodic refresh and eviction decisions
pub struct RefreshScheduler {
    config: Arc<SyncConfig>,
    store: Arc<CacheStore>,
    usage: Arc<UsageTracker>,
    event_bus: EventBus,
    /// Last refresh attempt per collection, successful or not
    last_attempts: DashMap<Collection, DateTime<Utc>>,
}

impl RefreshScheduler {
    pub fn new(
        config: Arc<SyncConfig>,
        store: Arc<CacheStore>,
        usage: Arc<UsageTracker>,
        event_bus: EventBus,
    ) -> Self {
        Self {
            config,
            store,
            usage,
            event_bus,
            last_attempts: DashMap::new(),
        }
    }

    /// Current adaptive interval of a collection, `None` without a policy
    pub fn interval_for(&self, collection: Collection, now: DateTime<Utc>) -> Option<Duration> {
        let policy = self.config.refresh_policy(collection)?;
        let frequency = self.usage.frequency_per_hour_at(collection, now);
        Some(adaptive_interval(&policy, frequency))
    }

    /// Collections due for a background refresh at `now`
    pub fn due_at(&self, now: DateTime<Utc>) -> Vec<RefreshDecision> {
        Collection::ALL
            .into_iter()
            .filter_map(|collection| {
                let policy = self.config.refresh_policy(collection)?;
                let entry = self.store.get(collection)?;
                // Loading or never-read entries are handled by their initial fetch
                if entry.status != EntryStatus::Fresh {
                    return None;
                }
                let frequency = self.usage.frequency_per_hour_at(collection, now);
                let interval = adaptive_interval(&policy, frequency);

                if elapsed(entry.updated_at?, now) < interval {
                    return None;
                }
                if let Some(last) = self.last_attempts.get(&collection) {
                    if elapsed(*last, now) < interval {
                        trace!(%collection, "Refresh attempted recently, waiting");
                        return None;
                    }
                }
                Some(RefreshDecision {
                    collection,
                    frequency,
                    interval,
                })
            })
            .collect()
    }

    /// Entries past retention that no reader touched within it
    pub fn evictable_at(&self, now: DateTime<Utc>) -> Vec<Collection> {
        self.store
            .snapshot()
            .into_iter()
            .filter(|entry| entry.is_past_retention(now))
            .filter(|entry| {
                self.usage
                    .last_accessed(entry.key)
                    .map_or(true, |at| elapsed(at, now) > entry.retention_time)
            })
            .map(|entry| entry.key)
            .collect()
    }

    pub fn record_attempt(&self, collection: Collection, at: DateTime<Utc>) {
        self.last_attempts.insert(collection, at);
    }

    /// Evaluate every collection once.
    ///
    /// Invalidates due entries and records the attempt, evicts expired unused
    /// entries, and opportunistically cleans idle usage metrics.
    pub fn tick_at(&self, now: DateTime<Utc>) -> TickOutcome {
        // Evict first so expired, unused entries are dropped rather than refetched
        let evicted: Vec<_> = self
            .evictable_at(now)
            .into_iter()
            .filter(|collection| self.store.evict(*collection))
            .collect();
        for collection in &evicted {
            self.last_attempts.remove(collection);
            self.event_bus.publish(SyncEvent::Evicted(*collection));
        }

        let refresh = self.due_at(now);
        for decision in &refresh {
            debug!(
                collection = %decision.collection,
                frequency = decision.frequency,
                interval_secs = decision.interval.as_secs(),
                "Collection due for refresh"
            );
            self.store.invalidate(decision.collection);
            self.record_attempt(decision.collection, now);
            self.event_bus
                .publish(SyncEvent::Invalidated(decision.collection));
        }

        let metrics_cleaned = self.usage.cleanup_at(now, self.config.usage_retention);

        TickOutcome {
            refresh,
            evicted,
            metrics_cleaned,
        }
    }

    /// Run the tick loop until `shutdown` flips to true
    pub fn spawn(
        self: Arc<Self>,
        refetcher: Arc<Refetcher>,
        mut shutdown: watch::Receiver<bool>,
    ) -> JoinHandle<()> {
        let period = self.config.tick_interval;
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            info!(tick_secs = period.as_secs(), "Refresh scheduler started");

            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        let outcome = self.tick_at(Utc::now());
                        for decision in outcome.refresh {
                            refetcher.request(decision.collection);
                        }
                    }
                    changed = shutdown.changed() => {
                        if changed.is_err() || *shutdown.borrow() {
                            info!("Refresh scheduler shutting down");
                            break;
                        }
                    }
                }
            }
        })
    }
}
