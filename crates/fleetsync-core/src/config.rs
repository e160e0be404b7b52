//! Sync configuration
//!
//! Loadable from TOML. Durations are written in whole seconds, e.g.
//!
//! ```toml
//! tick_interval_secs = 30
//!
//! [collections.vehicles]
//! stale_time_secs = 300
//! retention_time_secs = 1800
//!
//! [collections.vehicles.refresh]
//! base_interval_secs = 900
//! min_interval_secs = 300
//! max_interval_secs = 3600
//! usage_multiplier = 0.7
//! ```

use crate::error::SyncError;
use crate::models::Collection;
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;
use std::time::Duration;

/// Largest serialized collection accepted into a persisted snapshot (1 MiB)
pub const DEFAULT_MAX_ENTRY_BYTES: usize = 1024 * 1024;

mod duration_secs {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_secs())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        u64::deserialize(d).map(Duration::from_secs)
    }
}

/// Static per-collection refresh configuration
///
/// Invariant (checked by [`RefreshPolicy::validate`]):
/// `min_interval <= max_interval` and `0 < usage_multiplier <= 1`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct RefreshPolicy {
    #[serde(rename = "base_interval_secs", with = "duration_secs")]
    pub base_interval: Duration,
    #[serde(rename = "min_interval_secs", with = "duration_secs")]
    pub min_interval: Duration,
    #[serde(rename = "max_interval_secs", with = "duration_secs")]
    pub max_interval: Duration,
    /// Factor applied to hot collections (more than 10 reads per hour)
    pub usage_multiplier: f64,
}

impl RefreshPolicy {
    pub fn new(
        base_interval: Duration,
        min_interval: Duration,
        max_interval: Duration,
        usage_multiplier: f64,
    ) -> Self {
        Self {
            base_interval,
            min_interval,
            max_interval,
            usage_multiplier,
        }
    }

    /// Policy for movements, maintenances and fuels
    pub fn critical() -> Self {
        Self::new(
            Duration::from_secs(5 * 60),
            Duration::from_secs(60),
            Duration::from_secs(15 * 60),
            0.5,
        )
    }

    /// Policy for slower-moving reference data (vehicles, equipment, staff)
    pub fn reference() -> Self {
        Self::new(
            Duration::from_secs(15 * 60),
            Duration::from_secs(5 * 60),
            Duration::from_secs(60 * 60),
            0.7,
        )
    }

    pub fn validate(&self, collection: Collection) -> Result<(), SyncError> {
        if self.min_interval > self.max_interval {
            return Err(SyncError::InvalidConfig {
                message: format!(
                    "{}: min interval ({}s) exceeds max interval ({}s)",
                    collection,
                    self.min_interval.as_secs(),
                    self.max_interval.as_secs()
                ),
            });
        }
        if !(self.usage_multiplier > 0.0 && self.usage_multiplier <= 1.0) {
            return Err(SyncError::InvalidConfig {
                message: format!(
                    "{}: usage multiplier must be in (0, 1], got {}",
                    collection, self.usage_multiplier
                ),
            });
        }
        if self.base_interval.is_zero() {
            return Err(SyncError::InvalidConfig {
                message: format!("{}: base interval must be positive", collection),
            });
        }
        Ok(())
    }
}

/// Cache timings and refresh policy of one collection
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CollectionSettings {
    #[serde(rename = "stale_time_secs", with = "duration_secs")]
    pub stale_time: Duration,
    #[serde(rename = "retention_time_secs", with = "duration_secs")]
    pub retention_time: Duration,
    /// Collections without a policy are never refreshed by the scheduler
    #[serde(default)]
    pub refresh: Option<RefreshPolicy>,
}

impl CollectionSettings {
    pub fn default_for(collection: Collection) -> Self {
        if collection.is_critical() {
            Self {
                stale_time: Duration::from_secs(60),
                retention_time: Duration::from_secs(30 * 60),
                refresh: Some(RefreshPolicy::critical()),
            }
        } else {
            Self {
                stale_time: Duration::from_secs(5 * 60),
                retention_time: Duration::from_secs(60 * 60),
                refresh: Some(RefreshPolicy::reference()),
            }
        }
    }
}

/// Configuration for the sync context
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    /// Scheduler tick period
    #[serde(rename = "tick_interval_secs", with = "duration_secs")]
    pub tick_interval: Duration,

    /// Upper bound on a single collection fetch
    #[serde(rename = "fetch_timeout_secs", with = "duration_secs")]
    pub fetch_timeout: Duration,

    /// Period of background persistence snapshots
    #[serde(rename = "snapshot_interval_secs", with = "duration_secs")]
    pub snapshot_interval: Duration,

    /// Persisted entries older than this are dropped at hydration
    #[serde(rename = "max_persisted_age_secs", with = "duration_secs")]
    pub max_persisted_age: Duration,

    /// Per-collection ceiling on serialized snapshot size
    pub max_entry_bytes: usize,

    /// Usage metrics idle longer than this are cleaned up
    #[serde(rename = "usage_retention_secs", with = "duration_secs")]
    pub usage_retention: Duration,

    /// Broadcast channel capacity of the event bus
    pub event_bus_capacity: usize,

    /// Number of recent notifications kept
    pub notification_capacity: usize,

    /// Number of recent event ids remembered per collection
    pub replay_guard_capacity: usize,

    /// Per-collection overrides, keyed by collection name
    pub collections: BTreeMap<String, CollectionSettings>,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            tick_interval: Duration::from_secs(30),
            fetch_timeout: Duration::from_secs(10),
            snapshot_interval: Duration::from_secs(5 * 60),
            max_persisted_age: Duration::from_secs(24 * 60 * 60),
            max_entry_bytes: DEFAULT_MAX_ENTRY_BYTES,
            usage_retention: Duration::from_secs(60 * 60),
            event_bus_capacity: 256,
            notification_capacity: 50,
            replay_guard_capacity: 256,
            collections: Collection::ALL
                .into_iter()
                .map(|c| (c.as_str().to_string(), CollectionSettings::default_for(c)))
                .collect(),
        }
    }
}

impl SyncConfig {
    /// Load configuration from a TOML file
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config: {}", path.display()))?;
        let config = Self::from_toml(&content)
            .with_context(|| format!("Invalid config: {}", path.display()))?;
        tracing::debug!(path = %path.display(), "Sync config loaded");
        Ok(config)
    }

    /// Parse and validate a TOML document
    pub fn from_toml(content: &str) -> Result<Self> {
        let config: SyncConfig = toml::from_str(content).context("Failed to parse TOML")?;
        config.validate()?;
        Ok(config)
    }

    /// Settings of a collection, falling back to built-in defaults
    pub fn settings(&self, collection: Collection) -> CollectionSettings {
        self.collections
            .get(collection.as_str())
            .cloned()
            .unwrap_or_else(|| CollectionSettings::default_for(collection))
    }

    pub fn refresh_policy(&self, collection: Collection) -> Option<RefreshPolicy> {
        self.settings(collection).refresh
    }

    pub fn validate(&self) -> Result<(), SyncError> {
        for (name, settings) in &self.collections {
            let collection: Collection = name.parse()?;
            if let Some(policy) = &settings.refresh {
                policy.validate(collection)?;
            }
        }
        for (label, value) in [
            ("tick_interval", self.tick_interval),
            ("fetch_timeout", self.fetch_timeout),
            ("snapshot_interval", self.snapshot_interval),
        ] {
            if value.is_zero() {
                return Err(SyncError::InvalidConfig {
                    message: format!("{} must be positive", label),
                });
            }
        }
        if self.event_bus_capacity == 0 {
            return Err(SyncError::InvalidConfig {
                message: "event_bus_capacity must be positive".to_string(),
            });
        }
        Ok(())
    }
}
