//! Cache store with DashMap + parking_lot::Mutex
//!
//! Each collection lives behind its own mutex, so a refetch completing for
//! `fuels` never contends with an event being applied to `vehicles`, while
//! all writes to one collection are serialized. The DashMap shard lock is
//! only held long enough to clone the slot's `Arc`.

use crate::config::SyncConfig;
use crate::error::SyncError;
use crate::models::{
    record_id, CacheEntry, ChangeEvent, ChangeKind, Collection, EntryStatus, Record,
};
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use parking_lot::Mutex;
use std::sync::Arc;
use tracing::{debug, trace};

type Slot = Arc<Mutex<CacheEntry>>;

/// Result of applying a change event
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PatchOutcome {
    /// Record appended at the end
    Inserted,
    /// Record replaced in place
    Updated,
    /// Record removed, order of the others kept
    Deleted,
    /// Nothing changed (unknown id on delete, or no populated entry)
    Ignored,
}

impl PatchOutcome {
    pub fn changed(&self) -> bool {
        !matches!(self, PatchOutcome::Ignored)
    }
}

/// Central cache of collections
///
/// Readers always receive cloned [`CacheEntry`] snapshots; the `data` inside
/// is an `Arc` so cloning does not copy records.
pub struct CacheStore {
    config: Arc<SyncConfig>,
    entries: DashMap<Collection, Slot>,
}

impl CacheStore {
    pub fn new(config: Arc<SyncConfig>) -> Self {
        Self {
            config,
            entries: DashMap::new(),
        }
    }

    /// Create with default configuration
    pub fn with_defaults() -> Self {
        Self::new(Arc::new(SyncConfig::default()))
    }

    fn empty_entry(&self, key: Collection) -> CacheEntry {
        let settings = self.config.settings(key);
        CacheEntry::new(key, settings.stale_time, settings.retention_time)
    }

    /// Slot for `key`, created empty when absent
    fn slot(&self, key: Collection) -> Slot {
        Arc::clone(
            self.entries
                .entry(key)
                .or_insert_with(|| Arc::new(Mutex::new(self.empty_entry(key))))
                .value(),
        )
    }

    fn existing(&self, key: Collection) -> Option<Slot> {
        self.entries.get(&key).map(|r| Arc::clone(r.value()))
    }

    // ===================
    // Read accessors
    // ===================

    pub fn get(&self, key: Collection) -> Option<CacheEntry> {
        self.existing(key).map(|slot| slot.lock().clone())
    }

    pub fn contains(&self, key: Collection) -> bool {
        self.entries.contains_key(&key)
    }

    /// Records of a collection, empty when absent
    pub fn records(&self, key: Collection) -> Arc<Vec<Record>> {
        self.existing(key)
            .map(|slot| Arc::clone(&slot.lock().data))
            .unwrap_or_default()
    }

    /// Collections currently cached, in declaration order
    pub fn keys(&self) -> Vec<Collection> {
        let mut keys: Vec<_> = self.entries.iter().map(|r| *r.key()).collect();
        keys.sort();
        keys
    }

    /// Snapshot of every entry, in declaration order
    pub fn snapshot(&self) -> Vec<CacheEntry> {
        self.keys()
            .into_iter()
            .filter_map(|key| self.get(key))
            .collect()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    // ===================
    // Mutations
    // ===================

    /// Replace a collection's data, creating the entry when absent
    pub fn set(&self, key: Collection, data: Vec<Record>, status: EntryStatus) {
        self.set_at(key, data, status, Utc::now());
    }

    pub fn set_at(
        &self,
        key: Collection,
        data: Vec<Record>,
        status: EntryStatus,
        at: DateTime<Utc>,
    ) {
        let slot = self.slot(key);
        let mut entry = slot.lock();
        entry.data = Arc::new(data);
        entry.status = status;
        entry.invalidated = false;
        if status != EntryStatus::Error {
            entry.last_error = None;
        }
        entry.touch(at);
        trace!(collection = %key, records = entry.data.len(), ?status, "Entry set");
    }

    /// Mark a never-loaded entry as loading.
    ///
    /// Returns true when the caller should start the initial fetch: the entry
    /// was absent, empty, or failed before any data arrived.
    pub fn ensure_loading(&self, key: Collection) -> bool {
        let slot = self.slot(key);
        let mut entry = slot.lock();
        let needs_fetch = match entry.status {
            EntryStatus::Empty => true,
            EntryStatus::Error => !entry.is_populated(),
            EntryStatus::Loading | EntryStatus::Fresh => false,
        };
        if needs_fetch {
            entry.status = EntryStatus::Loading;
            debug!(collection = %key, "Entry loading");
        }
        needs_fetch
    }

    /// Apply a full fetch result taken at `as_of`.
    ///
    /// The result is discarded (returns false) unless `as_of` is strictly
    /// newer than the entry's `updated_at`: a slow fetch must not overwrite
    /// changes applied while it was in flight.
    pub fn apply_fetch(&self, key: Collection, data: Vec<Record>, as_of: DateTime<Utc>) -> bool {
        let slot = self.slot(key);
        let mut entry = slot.lock();

        if let Some(current) = entry.updated_at {
            if as_of <= current {
                debug!(
                    collection = %key,
                    %as_of,
                    updated_at = %current,
                    "Discarding fetch result older than cached data"
                );
                return false;
            }
        }

        entry.data = Arc::new(data);
        entry.status = EntryStatus::Fresh;
        entry.invalidated = false;
        entry.last_error = None;
        entry.touch(as_of);
        debug!(collection = %key, records = entry.data.len(), "Fetch result applied");
        true
    }

    /// Apply one change event against the ordered records.
    ///
    /// Matching is by record identity. Inserts of an existing id replace it
    /// (duplicate delivery), updates of an unknown id append it, deletes of
    /// an unknown id are ignored. Entries that were never populated are left
    /// alone: their pending initial fetch will carry the change.
    pub fn patch(&self, key: Collection, event: &ChangeEvent) -> Result<PatchOutcome, SyncError> {
        self.patch_at(key, event, Utc::now())
    }

    pub fn patch_at(
        &self,
        key: Collection,
        event: &ChangeEvent,
        at: DateTime<Utc>,
    ) -> Result<PatchOutcome, SyncError> {
        if event.collection != key {
            return Err(SyncError::malformed(
                key,
                format!("event addressed to {}", event.collection),
            ));
        }
        if event.kind != ChangeKind::Delete && !event.record.is_object() {
            return Err(SyncError::malformed(key, "record is not an object"));
        }
        let id = event
            .record_id()
            .ok_or_else(|| SyncError::malformed(key, "record has no id"))?;

        let Some(slot) = self.existing(key) else {
            trace!(collection = %key, "Patch on missing entry ignored");
            return Ok(PatchOutcome::Ignored);
        };
        let mut entry = slot.lock();
        if !entry.is_populated() {
            trace!(collection = %key, "Patch on unpopulated entry ignored");
            return Ok(PatchOutcome::Ignored);
        }

        let position = entry
            .data
            .iter()
            .position(|r| record_id(r).as_deref() == Some(id.as_str()));

        let outcome = match (event.kind, position) {
            (ChangeKind::Insert | ChangeKind::Update, Some(pos)) => {
                Arc::make_mut(&mut entry.data)[pos] = event.record.clone();
                PatchOutcome::Updated
            }
            (ChangeKind::Insert | ChangeKind::Update, None) => {
                Arc::make_mut(&mut entry.data).push(event.record.clone());
                PatchOutcome::Inserted
            }
            (ChangeKind::Delete, Some(pos)) => {
                Arc::make_mut(&mut entry.data).remove(pos);
                PatchOutcome::Deleted
            }
            (ChangeKind::Delete, None) => PatchOutcome::Ignored,
        };

        if outcome.changed() {
            entry.touch(at);
        }
        trace!(collection = %key, record_id = %id, ?outcome, "Patch applied");
        Ok(outcome)
    }

    /// Mark an entry for background refetch without dropping its data
    pub fn invalidate(&self, key: Collection) -> bool {
        match self.existing(key) {
            Some(slot) => {
                slot.lock().invalidated = true;
                debug!(collection = %key, "Entry invalidated");
                true
            }
            None => false,
        }
    }

    /// Remove an entry entirely
    pub fn evict(&self, key: Collection) -> bool {
        let removed = self.entries.remove(&key).is_some();
        if removed {
            debug!(collection = %key, "Entry evicted");
        }
        removed
    }

    /// Record a failed fetch.
    ///
    /// Populated entries keep serving their data with their status unchanged;
    /// only entries that never received data move to `Error`.
    pub fn mark_error(&self, key: Collection, message: impl Into<String>) {
        if let Some(slot) = self.existing(key) {
            let mut entry = slot.lock();
            entry.last_error = Some(message.into());
            if !entry.is_populated() {
                entry.status = EntryStatus::Error;
            }
        }
    }

    /// Insert a persisted entry unless a newer one is already cached
    pub fn hydrate(&self, restored: CacheEntry) -> bool {
        let key = restored.key;
        let slot = self.slot(key);
        let mut entry = slot.lock();
        if entry.updated_at >= restored.updated_at && entry.is_populated() {
            return false;
        }
        let settings = self.config.settings(key);
        *entry = CacheEntry {
            stale_time: settings.stale_time,
            retention_time: settings.retention_time,
            ..restored
        };
        true
    }
}
