//! Persistence bridge between the cache store and durable local storage
//!
//! The whole cache is written as one versioned JSON blob:
//!
//! ```json
//! {"version": 1, "saved_at": "...", "entries": [
//!   {"key": "vehicles", "status": "fresh", "updated_at": "...", "data": [...]}
//! ]}
//! ```
//!
//! Snapshot skips entries that never received data, entries in error
//! status, and any entry whose serialized data exceeds `max_entry_bytes`.
//! Hydration drops entries older than `max_persisted_age` and discards the
//! whole blob on a version mismatch. Storage failures are reported, never
//! fatal: the cache simply starts empty.

mod file;
mod memory;
mod sqlite;

pub use file::FileBlobStore;
pub use memory::MemoryBlobStore;
pub use sqlite::SqliteBlobStore;

use crate::config::SyncConfig;
use crate::error::SyncError;
use crate::models::{CacheEntry, Collection, EntryStatus, Record};
use crate::store::CacheStore;
use crate::timeutil::elapsed;
use anyhow::Result;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Current snapshot format version
///
/// Increment when the layout of persisted entries changes; older blobs are
/// then discarded at startup instead of being misread.
pub const SNAPSHOT_VERSION: u32 = 1;

/// Durable storage holding a single serialized blob
pub trait BlobStore: Send + Sync {
    /// The stored blob, `None` when nothing was saved yet
    fn load_blob(&self) -> Result<Option<String>>;

    /// Replace the stored blob
    fn save_blob(&self, blob: &str) -> Result<()>;

    fn clear(&self) -> Result<()>;

    /// Human-readable location, for logs and `inspect`
    fn describe(&self) -> String;
}

#[derive(Serialize)]
struct SnapshotRef<'a> {
    version: u32,
    saved_at: DateTime<Utc>,
    entries: Vec<EntryRef<'a>>,
}

#[derive(Serialize)]
struct EntryRef<'a> {
    key: Collection,
    status: EntryStatus,
    updated_at: DateTime<Utc>,
    data: &'a [Record],
}

/// Persisted cache document, as read back
#[derive(Debug, Clone, Deserialize)]
pub struct PersistedCache {
    pub version: u32,
    pub saved_at: DateTime<Utc>,
    #[serde(default)]
    pub entries: Vec<PersistedEntry>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct PersistedEntry {
    pub key: Collection,
    pub status: EntryStatus,
    pub updated_at: DateTime<Utc>,
    #[serde(default)]
    pub data: Vec<Record>,
}

impl PersistedEntry {
    fn into_entry(self) -> CacheEntry {
        // Timings are replaced by the store's current settings
        CacheEntry {
            data: Arc::new(self.data),
            updated_at: Some(self.updated_at),
            status: self.status,
            ..CacheEntry::new(self.key, Duration::ZERO, Duration::ZERO)
        }
    }
}

/// What a hydration restored or dropped
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct HydrationReport {
    pub restored: Vec<Collection>,
    /// Older than the max persisted age
    pub expired: Vec<Collection>,
    /// Stored in a status other than fresh
    pub skipped: Vec<Collection>,
    /// The cache already held newer data
    pub superseded: Vec<Collection>,
    /// Set when a blob of another format version was discarded
    pub discarded_version: Option<u32>,
    /// Storage or parse failure, hydration was skipped
    pub failure: Option<String>,
}

impl HydrationReport {
    pub fn restored_count(&self) -> usize {
        self.restored.len()
    }

    fn failed(message: String) -> Self {
        Self {
            failure: Some(message),
            ..Default::default()
        }
    }
}

/// What a snapshot wrote or left out
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct SnapshotReport {
    pub saved: Vec<Collection>,
    /// Serialized data over the per-entry byte ceiling
    pub oversized: Vec<Collection>,
    /// Error status or never populated
    pub skipped: Vec<Collection>,
    pub bytes: usize,
}

/// Loads and saves the cache store through a [`BlobStore`]
pub struct PersistenceBridge {
    blobs: Arc<dyn BlobStore>,
    max_age: Duration,
    max_entry_bytes: usize,
}

impl PersistenceBridge {
    pub fn new(blobs: Arc<dyn BlobStore>, config: &SyncConfig) -> Self {
        Self {
            blobs,
            max_age: config.max_persisted_age,
            max_entry_bytes: config.max_entry_bytes,
        }
    }

    pub fn describe(&self) -> String {
        self.blobs.describe()
    }

    /// Read the persisted document without touching any store
    pub fn load(&self) -> Result<Option<PersistedCache>, SyncError> {
        let blob = self
            .blobs
            .load_blob()
            .map_err(|e| SyncError::persistence(&e))?;
        let Some(blob) = blob else {
            return Ok(None);
        };
        Ok(Some(serde_json::from_str(&blob)?))
    }

    /// Restore persisted entries into `store`
    pub fn hydrate(&self, store: &CacheStore, now: DateTime<Utc>) -> HydrationReport {
        let document = match self.load() {
            Ok(Some(document)) => document,
            Ok(None) => {
                debug!(location = %self.describe(), "No persisted cache found");
                return HydrationReport::default();
            }
            Err(e) => {
                warn!(error = %e, "Failed to load persisted cache, starting empty");
                return HydrationReport::failed(e.to_string());
            }
        };

        if document.version != SNAPSHOT_VERSION {
            warn!(
                stored = document.version,
                current = SNAPSHOT_VERSION,
                "Persisted cache version mismatch, discarding"
            );
            return HydrationReport {
                discarded_version: Some(document.version),
                ..Default::default()
            };
        }

        let mut report = HydrationReport::default();
        for persisted in document.entries {
            let key = persisted.key;
            if persisted.status != EntryStatus::Fresh {
                report.skipped.push(key);
                continue;
            }
            if elapsed(persisted.updated_at, now) > self.max_age {
                debug!(
                    collection = %key,
                    updated_at = %persisted.updated_at,
                    "Persisted entry expired"
                );
                report.expired.push(key);
                continue;
            }
            if store.hydrate(persisted.into_entry()) {
                report.restored.push(key);
            } else {
                report.superseded.push(key);
            }
        }

        info!(
            restored = report.restored.len(),
            expired = report.expired.len(),
            location = %self.describe(),
            "Cache hydrated"
        );
        report
    }

    /// Serialize every servable entry of `store` and save it
    pub fn snapshot(
        &self,
        store: &CacheStore,
        now: DateTime<Utc>,
    ) -> Result<SnapshotReport, SyncError> {
        let entries = store.snapshot();
        let mut report = SnapshotReport::default();
        let mut refs = Vec::with_capacity(entries.len());

        for entry in &entries {
            let Some(updated_at) = entry.updated_at else {
                report.skipped.push(entry.key);
                continue;
            };
            if entry.status != EntryStatus::Fresh {
                report.skipped.push(entry.key);
                continue;
            }
            let size = serde_json::to_vec(entry.data.as_slice())?.len();
            if size > self.max_entry_bytes {
                warn!(
                    collection = %entry.key,
                    bytes = size,
                    limit = self.max_entry_bytes,
                    "Entry too large to persist, skipping"
                );
                report.oversized.push(entry.key);
                continue;
            }
            refs.push(EntryRef {
                key: entry.key,
                status: entry.status,
                updated_at,
                data: entry.data.as_slice(),
            });
            report.saved.push(entry.key);
        }

        let blob = serde_json::to_string(&SnapshotRef {
            version: SNAPSHOT_VERSION,
            saved_at: now,
            entries: refs,
        })?;
        report.bytes = blob.len();

        self.blobs
            .save_blob(&blob)
            .map_err(|e| SyncError::persistence(&e))?;
        debug!(
            entries = report.saved.len(),
            bytes = report.bytes,
            location = %self.describe(),
            "Cache snapshot saved"
        );
        Ok(report)
    }

    pub fn clear(&self) -> Result<(), SyncError> {
        self.blobs.clear().map_err(|e| SyncError::persistence(&e))
    }
}
