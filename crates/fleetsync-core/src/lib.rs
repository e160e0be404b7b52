//! fleetsync-core - Core library for fleetsync
//!
//! Keeps a local cache of fleet and staff collections fresh against a remote
//! source of truth: cache store, usage-driven adaptive refresh, push change
//! feed, alert derivation and local persistence.

pub mod alerts;
pub mod channel;
pub mod config;
pub mod context;
pub mod error;
pub mod event;
pub mod fetch;
pub mod models;
pub mod notifications;
pub mod persistence;
pub mod scheduler;
pub mod store;
pub mod usage;

mod timeutil;

pub use alerts::{derive_alerts, top_alerts, AlertSnapshot};
pub use channel::{ChangeEventChannel, ChangeFeed, FeedMessage, SubscriptionState};
pub use config::{CollectionSettings, RefreshPolicy, SyncConfig};
pub use context::SyncContext;
pub use error::{SyncError, SyncHealth};
pub use event::{EventBus, SyncEvent};
pub use fetch::{FetchResult, Fetcher, Refetcher};
pub use models::{
    Alert, AlertKind, CacheEntry, ChangeEvent, ChangeKind, Collection, EntryStatus, Freshness,
    Record, Severity, SubjectRef,
};
pub use notifications::{Notification, NotificationBuffer, NotificationLevel};
pub use persistence::{
    BlobStore, FileBlobStore, HydrationReport, MemoryBlobStore, PersistenceBridge,
    SnapshotReport, SqliteBlobStore,
};
pub use scheduler::{adaptive_interval, LifecycleSignal, RefreshScheduler, TickOutcome};
pub use store::{CacheStore, PatchOutcome};
pub use usage::{UsageMetric, UsageTracker};
