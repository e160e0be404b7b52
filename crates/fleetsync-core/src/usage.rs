//! Per-collection access tracking
//!
//! Feeds the adaptive refresh scheduler: hot collections refresh sooner,
//! idle ones later.

use crate::models::Collection;
use crate::timeutil::{cutoff, elapsed};
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use std::time::Duration;
use tracing::debug;

/// Access statistics of one collection
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UsageMetric {
    pub last_accessed_at: DateTime<Utc>,
    pub access_count: u64,
    /// Running average of the gap between reads
    pub average_access_interval: Duration,
}

/// Records how often each collection is read
#[derive(Default)]
pub struct UsageTracker {
    metrics: DashMap<Collection, UsageMetric>,
}

impl UsageTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_access(&self, key: Collection) {
        self.record_access_at(key, Utc::now());
    }

    /// Count one read at `now`.
    ///
    /// The average gap is `(previous average + time since last read) / 2`.
    pub fn record_access_at(&self, key: Collection, now: DateTime<Utc>) {
        self.metrics
            .entry(key)
            .and_modify(|metric| {
                let gap = elapsed(metric.last_accessed_at, now);
                metric.average_access_interval = (metric.average_access_interval + gap) / 2;
                metric.access_count = metric.access_count.saturating_add(1);
                if now > metric.last_accessed_at {
                    metric.last_accessed_at = now;
                }
            })
            .or_insert(UsageMetric {
                last_accessed_at: now,
                access_count: 1,
                average_access_interval: Duration::ZERO,
            });
    }

    pub fn frequency_per_hour(&self, key: Collection) -> f64 {
        self.frequency_per_hour_at(key, Utc::now())
    }

    /// `access_count / max(hours since last access, 1)`, 0 for unseen keys
    pub fn frequency_per_hour_at(&self, key: Collection, now: DateTime<Utc>) -> f64 {
        match self.metrics.get(&key) {
            Some(metric) => {
                let hours = elapsed(metric.last_accessed_at, now).as_secs_f64() / 3600.0;
                metric.access_count as f64 / hours.max(1.0)
            }
            None => 0.0,
        }
    }

    pub fn metric(&self, key: Collection) -> Option<UsageMetric> {
        self.metrics.get(&key).map(|m| *m)
    }

    pub fn last_accessed(&self, key: Collection) -> Option<DateTime<Utc>> {
        self.metrics.get(&key).map(|m| m.last_accessed_at)
    }

    pub fn cleanup(&self, older_than: Duration) -> usize {
        self.cleanup_at(Utc::now(), older_than)
    }

    /// Drop metrics not accessed within `older_than`. Returns how many went.
    pub fn cleanup_at(&self, now: DateTime<Utc>, older_than: Duration) -> usize {
        let limit = cutoff(now, older_than);
        let before = self.metrics.len();
        self.metrics.retain(|_, metric| metric.last_accessed_at >= limit);
        let removed = before.saturating_sub(self.metrics.len());
        if removed > 0 {
            debug!(removed, "Idle usage metrics cleaned up");
        }
        removed
    }

    pub fn len(&self) -> usize {
        self.metrics.len()
    }

    pub fn is_empty(&self) -> bool {
        self.metrics.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeDelta;

    #[test]
    fn test_first_access() {
        let tracker = UsageTracker::new();
        let now = Utc::now();
        tracker.record_access_at(Collection::Vehicles, now);

        let metric = tracker.metric(Collection::Vehicles).unwrap();
        assert_eq!(metric.access_count, 1);
        assert_eq!(metric.last_accessed_at, now);
        assert_eq!(metric.average_access_interval, Duration::ZERO);
    }

    #[test]
    fn test_running_average() {
        let tracker = UsageTracker::new();
        let t0 = Utc::now();
        tracker.record_access_at(Collection::Fuels, t0);
        tracker.record_access_at(Collection::Fuels, t0 + TimeDelta::seconds(60));
        // (0 + 60) / 2
        assert_eq!(
            tracker.metric(Collection::Fuels).unwrap().average_access_interval,
            Duration::from_secs(30)
        );
        tracker.record_access_at(Collection::Fuels, t0 + TimeDelta::seconds(150));
        // (30 + 90) / 2
        let metric = tracker.metric(Collection::Fuels).unwrap();
        assert_eq!(metric.average_access_interval, Duration::from_secs(60));
        assert_eq!(metric.access_count, 3);
    }

    #[test]
    fn test_out_of_order_access_keeps_latest() {
        let tracker = UsageTracker::new();
        let t0 = Utc::now();
        tracker.record_access_at(Collection::Fuels, t0);
        tracker.record_access_at(Collection::Fuels, t0 - TimeDelta::seconds(10));
        let metric = tracker.metric(Collection::Fuels).unwrap();
        assert_eq!(metric.last_accessed_at, t0);
        assert_eq!(metric.average_access_interval, Duration::ZERO);
    }

    #[test]
    fn test_frequency_per_hour() {
        let tracker = UsageTracker::new();
        let now = Utc::now();
        assert_eq!(tracker.frequency_per_hour_at(Collection::Employees, now), 0.0);

        for _ in 0..12 {
            tracker.record_access_at(Collection::Employees, now);
        }
        // Less than an hour since last access: divided by 1
        assert_eq!(tracker.frequency_per_hour_at(Collection::Employees, now), 12.0);
        // Four hours idle
        let later = now + TimeDelta::hours(4);
        assert_eq!(tracker.frequency_per_hour_at(Collection::Employees, later), 3.0);
    }

    #[test]
    fn test_cleanup_drops_idle_metrics() {
        let tracker = UsageTracker::new();
        let now = Utc::now();
        tracker.record_access_at(Collection::Vehicles, now - TimeDelta::minutes(90));
        tracker.record_access_at(Collection::Fuels, now - TimeDelta::minutes(10));

        let removed = tracker.cleanup_at(now, Duration::from_secs(3600));
        assert_eq!(removed, 1);
        assert!(tracker.metric(Collection::Vehicles).is_none());
        assert!(tracker.metric(Collection::Fuels).is_some());
    }
}
