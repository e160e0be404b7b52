//! Sync context: owns every component and the background tasks
//!
//! ```text
//! ChangeFeed ──> ChangeEventChannel ──patch──> CacheStore <──apply_fetch── Refetcher <── Fetcher
//!                                                 │  ▲                         ▲
//!                                    EventBus <───┘  └── PersistenceBridge     │
//!                                       │                                      │
//!                         alert loop ◄──┘        RefreshScheduler (tick) ──────┘
//! ```
//!
//! There are no globals: every consumer holds a `SyncContext` (usually in an
//! `Arc`) and `shutdown()` releases subscriptions and stops all tasks.

use crate::alerts::{derive_alerts, top_alerts, AlertSnapshot};
use crate::channel::{ChangeEventChannel, ChangeFeed, SubscriptionState};
use crate::config::SyncConfig;
use crate::error::{SyncError, SyncHealth};
use crate::event::{EventBus, SyncEvent};
use crate::fetch::{Fetcher, Refetcher};
use crate::models::{Alert, CacheEntry, Collection, EntryStatus, Severity};
use crate::notifications::NotificationBuffer;
use crate::persistence::{BlobStore, HydrationReport, PersistenceBridge, SnapshotReport};
use crate::scheduler::{LifecycleSignal, RefreshScheduler};
use crate::store::CacheStore;
use crate::usage::UsageTracker;
use chrono::Utc;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::broadcast::error::RecvError;
use tokio::runtime::Handle;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

/// Entry point of the sync layer
pub struct SyncContext {
    config: Arc<SyncConfig>,
    store: Arc<CacheStore>,
    usage: Arc<UsageTracker>,
    event_bus: EventBus,
    notifications: Arc<NotificationBuffer>,
    refetcher: Arc<Refetcher>,
    scheduler: Arc<RefreshScheduler>,
    channel: Arc<ChangeEventChannel>,
    persistence: Arc<PersistenceBridge>,
    shutdown_tx: watch::Sender<bool>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    started: AtomicBool,
}

impl SyncContext {
    /// Wire all components on the current tokio runtime. Nothing runs until
    /// [`start`](Self::start).
    pub fn new(
        config: SyncConfig,
        fetcher: Arc<dyn Fetcher>,
        feed: Arc<dyn ChangeFeed>,
        blobs: Arc<dyn BlobStore>,
    ) -> Result<Self, SyncError> {
        config.validate()?;
        let runtime = Handle::try_current().map_err(|e| SyncError::NoRuntime {
            message: e.to_string(),
        })?;
        Self::with_runtime(config, fetcher, feed, blobs, runtime)
    }

    /// Like [`new`](Self::new), for callers constructing the context outside
    /// the runtime that should run its background work.
    pub fn with_runtime(
        config: SyncConfig,
        fetcher: Arc<dyn Fetcher>,
        feed: Arc<dyn ChangeFeed>,
        blobs: Arc<dyn BlobStore>,
        runtime: Handle,
    ) -> Result<Self, SyncError> {
        config.validate()?;
        let config = Arc::new(config);

        let store = Arc::new(CacheStore::new(Arc::clone(&config)));
        let usage = Arc::new(UsageTracker::new());
        let event_bus = EventBus::new(config.event_bus_capacity);
        let notifications = Arc::new(NotificationBuffer::new(config.notification_capacity));

        let refetcher = Arc::new(Refetcher::new(
            fetcher,
            Arc::clone(&store),
            event_bus.clone(),
            Arc::clone(&notifications),
            config.fetch_timeout,
            runtime,
        ));
        let scheduler = Arc::new(RefreshScheduler::new(
            Arc::clone(&config),
            Arc::clone(&store),
            Arc::clone(&usage),
            event_bus.clone(),
        ));
        let channel = Arc::new(ChangeEventChannel::new(
            feed,
            Arc::clone(&store),
            Arc::clone(&refetcher),
            event_bus.clone(),
            Arc::clone(&notifications),
            config.replay_guard_capacity,
        ));
        let persistence = Arc::new(PersistenceBridge::new(blobs, &config));
        let (shutdown_tx, _) = watch::channel(false);

        Ok(Self {
            config,
            store,
            usage,
            event_bus,
            notifications,
            refetcher,
            scheduler,
            channel,
            persistence,
            shutdown_tx,
            tasks: Mutex::new(Vec::new()),
            started: AtomicBool::new(false),
        })
    }

    /// Hydrate from storage, subscribe every collection and start the
    /// scheduler, snapshot and alert loops.
    pub async fn start(&self) -> HydrationReport {
        if self.started.swap(true, Ordering::SeqCst) {
            warn!("Sync context already started");
            return HydrationReport::default();
        }

        let persistence = Arc::clone(&self.persistence);
        let store = Arc::clone(&self.store);
        let report = tokio::task::spawn_blocking(move || persistence.hydrate(&store, Utc::now()))
            .await
            .unwrap_or_else(|e| {
                error!(error = %e, "Hydration task failed");
                HydrationReport::default()
            });
        self.event_bus.publish(SyncEvent::HydrationCompleted {
            restored: report.restored_count(),
        });
        publish_alerts(&self.store, &self.event_bus);

        let active = self.channel.subscribe_all().await;
        info!(active, total = Collection::ALL.len(), "Change feed subscriptions registered");

        let handles = vec![
            Arc::clone(&self.scheduler)
                .spawn(Arc::clone(&self.refetcher), self.shutdown_tx.subscribe()),
            self.spawn_snapshot_loop(),
            self.spawn_alert_loop(),
        ];
        self.tasks.lock().extend(handles);

        info!(
            restored = report.restored_count(),
            storage = %self.persistence.describe(),
            "Sync context started"
        );
        report
    }

    fn spawn_snapshot_loop(&self) -> JoinHandle<()> {
        let persistence = Arc::clone(&self.persistence);
        let store = Arc::clone(&self.store);
        let event_bus = self.event_bus.clone();
        let period = self.config.snapshot_interval;
        let mut shutdown = self.shutdown_tx.subscribe();

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        let _ = snapshot_blocking(&persistence, &store, &event_bus).await;
                    }
                    changed = shutdown.changed() => {
                        if changed.is_err() || *shutdown.borrow() {
                            debug!("Snapshot loop stopped");
                            break;
                        }
                    }
                }
            }
        })
    }

    fn spawn_alert_loop(&self) -> JoinHandle<()> {
        let store = Arc::clone(&self.store);
        let event_bus = self.event_bus.clone();
        let mut events = self.event_bus.subscribe();
        let mut shutdown = self.shutdown_tx.subscribe();

        tokio::spawn(async move {
            loop {
                tokio::select! {
                    received = events.recv() => match received {
                        Ok(event) => {
                            if event.changed_collection().is_some_and(AlertSnapshot::depends_on) {
                                publish_alerts(&store, &event_bus);
                            }
                        }
                        Err(RecvError::Lagged(skipped)) => {
                            debug!(skipped, "Alert loop lagged, recomputing");
                            publish_alerts(&store, &event_bus);
                        }
                        Err(RecvError::Closed) => break,
                    },
                    changed = shutdown.changed() => {
                        if changed.is_err() || *shutdown.borrow() {
                            debug!("Alert loop stopped");
                            break;
                        }
                    }
                }
            }
        })
    }

    /// Read a collection.
    ///
    /// Counts the access and starts the initial fetch when the collection was
    /// never loaded. Always returns immediately with what is cached; callers
    /// render `Loading` entries as such. Safe to call from threads outside
    /// the runtime: fetches are spawned on the handle captured at
    /// construction.
    pub fn read(&self, key: Collection) -> CacheEntry {
        self.usage.record_access(key);
        if self.store.ensure_loading(key) {
            self.refetcher.request(key);
        }
        self.store.get(key).unwrap_or_else(|| {
            let settings = self.config.settings(key);
            CacheEntry {
                status: EntryStatus::Loading,
                ..CacheEntry::new(key, settings.stale_time, settings.retention_time)
            }
        })
    }

    /// Alerts derived from the current cache, highest severity first
    pub fn alerts(&self, top_n: Option<usize>) -> Vec<Alert> {
        let alerts = derive_alerts(&AlertSnapshot::from_store(&self.store), Utc::now());
        match top_n {
            Some(n) => top_alerts(alerts, n),
            None => alerts,
        }
    }

    /// Invalidate and refetch one collection, or every cached one
    pub fn force_sync(&self, key: Option<Collection>) -> Vec<Collection> {
        let targets = match key {
            Some(key) => vec![key],
            None => self.store.keys(),
        };
        info!(collections = targets.len(), "Manual sync requested");
        self.refresh(&targets);
        targets
    }

    /// React to an application lifecycle edge
    pub fn handle_signal(&self, signal: LifecycleSignal) -> Vec<Collection> {
        let targets = signal.targets(&self.store.keys());
        debug!(?signal, collections = targets.len(), "Lifecycle signal");
        self.refresh(&targets);
        targets
    }

    fn refresh(&self, targets: &[Collection]) {
        for &collection in targets {
            if self.store.invalidate(collection) {
                self.event_bus.publish(SyncEvent::Invalidated(collection));
            }
            self.scheduler.record_attempt(collection, Utc::now());
            self.refetcher.request(collection);
        }
    }

    /// Summary for "data may be out of date" indicators
    pub fn health(&self) -> SyncHealth {
        let mut reasons: Vec<String> = self
            .channel
            .degraded()
            .into_iter()
            .map(|c| format!("live updates for {} interrupted", c))
            .collect();

        for entry in self.store.snapshot() {
            match (&entry.last_error, entry.status) {
                (Some(message), EntryStatus::Error) => {
                    reasons.push(format!("{} unavailable: {}", entry.key, message));
                }
                (Some(message), _) => {
                    reasons.push(format!("{} may be out of date: {}", entry.key, message));
                }
                (None, _) => {}
            }
        }
        SyncHealth::from_reasons(reasons)
    }

    pub fn subscription_state(&self, key: Collection) -> SubscriptionState {
        self.channel.state(key)
    }

    pub fn notifications(&self) -> &NotificationBuffer {
        &self.notifications
    }

    pub fn event_bus(&self) -> &EventBus {
        &self.event_bus
    }

    pub fn store(&self) -> &CacheStore {
        &self.store
    }

    pub fn usage(&self) -> &UsageTracker {
        &self.usage
    }

    pub fn config(&self) -> &SyncConfig {
        &self.config
    }

    /// Persist the cache now
    pub async fn snapshot_now(&self) -> Result<SnapshotReport, SyncError> {
        snapshot_blocking(&self.persistence, &self.store, &self.event_bus).await
    }

    /// Stop background tasks, release subscriptions and write a final
    /// snapshot.
    pub async fn shutdown(&self) {
        let _ = self.shutdown_tx.send(true);
        self.channel.shutdown().await;

        let tasks: Vec<_> = self.tasks.lock().drain(..).collect();
        for task in tasks {
            if let Err(e) = task.await {
                if !e.is_cancelled() {
                    warn!(error = %e, "Background task ended abnormally");
                }
            }
        }

        if self.started.load(Ordering::SeqCst) {
            let _ = self.snapshot_now().await;
        }
        info!("Sync context shut down");
    }
}

/// Recompute alerts and announce their counts
fn publish_alerts(store: &CacheStore, event_bus: &EventBus) {
    let alerts = derive_alerts(&AlertSnapshot::from_store(store), Utc::now());
    let critical = alerts
        .iter()
        .filter(|a| a.severity == Severity::Critical)
        .count();
    event_bus.publish(SyncEvent::AlertsUpdated {
        total: alerts.len(),
        critical,
    });
}

async fn snapshot_blocking(
    persistence: &Arc<PersistenceBridge>,
    store: &Arc<CacheStore>,
    event_bus: &EventBus,
) -> Result<SnapshotReport, SyncError> {
    let persistence = Arc::clone(persistence);
    let store = Arc::clone(store);
    let result = tokio::task::spawn_blocking(move || persistence.snapshot(&store, Utc::now()))
        .await
        .unwrap_or_else(|e| {
            Err(SyncError::Persistence {
                message: format!("snapshot task failed: {}", e),
            })
        });

    match &result {
        Ok(report) => event_bus.publish(SyncEvent::SnapshotSaved {
            entries: report.saved.len(),
        }),
        Err(e) => warn!(error = %e, "Cache snapshot failed"),
    }
    result
}
