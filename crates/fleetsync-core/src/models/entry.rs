//! Cache entries and their freshness metadata

use super::collection::Collection;
use crate::timeutil::elapsed;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;

/// A single business record. The schema is collection-specific and opaque
/// to the sync layer; only the `id` field is interpreted.
pub type Record = serde_json::Value;

/// Load status of a cache entry
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EntryStatus {
    /// Created but never requested
    Empty,
    /// Initial fetch in progress, no data yet
    Loading,
    /// Populated by a fetch, an event or hydration
    Fresh,
    /// Initial fetch failed before any data arrived
    Error,
}

/// Display-only age classification.
///
/// `VeryStale` starts at three times the entry's stale time. None of these
/// values gate refresh behavior; they exist for "data may be out of date"
/// indicators.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Freshness {
    Unknown,
    Fresh,
    Stale,
    VeryStale,
}

impl Freshness {
    pub fn label(&self) -> &'static str {
        match self {
            Freshness::Unknown => "unknown",
            Freshness::Fresh => "fresh",
            Freshness::Stale => "stale",
            Freshness::VeryStale => "very stale",
        }
    }
}

/// Cached state of one collection
///
/// `data` is behind an `Arc` so snapshots handed to readers are cheap clones;
/// writers copy-on-write through `Arc::make_mut`.
#[derive(Debug, Clone)]
pub struct CacheEntry {
    pub key: Collection,
    pub data: Arc<Vec<Record>>,
    /// Instant of the last applied write. `None` until first populated.
    pub updated_at: Option<DateTime<Utc>>,
    pub status: EntryStatus,
    /// Age after which data is stale but still servable
    pub stale_time: Duration,
    /// Age after which an unused entry may be evicted
    pub retention_time: Duration,
    /// Marked for background refetch; data is kept until replaced
    pub invalidated: bool,
    /// Message of the most recent failed fetch, cleared on success
    pub last_error: Option<String>,
}

impl CacheEntry {
    pub fn new(key: Collection, stale_time: Duration, retention_time: Duration) -> Self {
        Self {
            key,
            data: Arc::new(Vec::new()),
            updated_at: None,
            status: EntryStatus::Empty,
            stale_time,
            retention_time,
            invalidated: false,
            last_error: None,
        }
    }

    /// Advance `updated_at`, never moving it backwards
    pub(crate) fn touch(&mut self, at: DateTime<Utc>) {
        self.updated_at = Some(match self.updated_at {
            Some(current) if current > at => current,
            _ => at,
        });
    }

    pub fn is_populated(&self) -> bool {
        self.updated_at.is_some()
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Age of the data, `None` when never populated
    pub fn age(&self, now: DateTime<Utc>) -> Option<Duration> {
        self.updated_at.map(|at| elapsed(at, now))
    }

    pub fn is_stale(&self, now: DateTime<Utc>) -> bool {
        self.age(now).map_or(true, |age| age >= self.stale_time)
    }

    pub fn freshness(&self, now: DateTime<Utc>) -> Freshness {
        match self.age(now) {
            None => Freshness::Unknown,
            Some(age) if age < self.stale_time => Freshness::Fresh,
            Some(age) if age < self.stale_time.saturating_mul(3) => Freshness::Stale,
            Some(_) => Freshness::VeryStale,
        }
    }

    pub fn is_past_retention(&self, now: DateTime<Utc>) -> bool {
        self.age(now).is_some_and(|age| age > self.retention_time)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeDelta;

    fn entry() -> CacheEntry {
        CacheEntry::new(
            Collection::Vehicles,
            Duration::from_secs(60),
            Duration::from_secs(600),
        )
    }

    #[test]
    fn test_touch_never_regresses() {
        let mut e = entry();
        let now = Utc::now();
        e.touch(now);
        e.touch(now - TimeDelta::seconds(10));
        assert_eq!(e.updated_at, Some(now));
        e.touch(now + TimeDelta::seconds(5));
        assert_eq!(e.updated_at, Some(now + TimeDelta::seconds(5)));
    }

    #[test]
    fn test_freshness_thresholds() {
        let mut e = entry();
        let now = Utc::now();
        assert_eq!(e.freshness(now), Freshness::Unknown);
        assert!(e.is_stale(now));

        e.touch(now - TimeDelta::seconds(30));
        assert_eq!(e.freshness(now), Freshness::Fresh);
        assert!(!e.is_stale(now));

        e.updated_at = Some(now - TimeDelta::seconds(120));
        assert_eq!(e.freshness(now), Freshness::Stale);

        e.updated_at = Some(now - TimeDelta::seconds(180));
        assert_eq!(e.freshness(now), Freshness::VeryStale);
    }

    #[test]
    fn test_retention() {
        let mut e = entry();
        let now = Utc::now();
        assert!(!e.is_past_retention(now));
        e.updated_at = Some(now - TimeDelta::seconds(601));
        assert!(e.is_past_retention(now));
    }
}
