//! Derived operational alerts

use super::collection::Collection;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// What an alert is about
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum AlertKind {
    MaintenanceOverdue,
    MaintenanceUpcoming,
    InsuranceExpired,
    InsuranceUpcoming,
    LicenseExpired,
    LicenseUpcoming,
    EquipmentInMaintenance,
    StaffOnLeave,
}

impl AlertKind {
    /// Stable kebab-case name, used to build alert ids
    pub fn slug(&self) -> &'static str {
        match self {
            AlertKind::MaintenanceOverdue => "maintenance-overdue",
            AlertKind::MaintenanceUpcoming => "maintenance-upcoming",
            AlertKind::InsuranceExpired => "insurance-expired",
            AlertKind::InsuranceUpcoming => "insurance-upcoming",
            AlertKind::LicenseExpired => "license-expired",
            AlertKind::LicenseUpcoming => "license-upcoming",
            AlertKind::EquipmentInMaintenance => "equipment-in-maintenance",
            AlertKind::StaffOnLeave => "staff-on-leave",
        }
    }
}

/// Alert severity. Variant order is rank order: `Critical` sorts first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum Severity {
    Critical,
    Warning,
    Info,
}

impl Severity {
    pub fn rank(&self) -> u8 {
        match self {
            Severity::Critical => 0,
            Severity::Warning => 1,
            Severity::Info => 2,
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            Severity::Critical => "critical",
            Severity::Warning => "warning",
            Severity::Info => "info",
        }
    }
}

/// Reference into the cache: a single record, or a whole collection for
/// aggregate alerts
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SubjectRef {
    pub collection: Collection,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub record_id: Option<String>,
}

impl SubjectRef {
    pub fn record(collection: Collection, id: impl Into<String>) -> Self {
        Self {
            collection,
            record_id: Some(id.into()),
        }
    }

    pub fn collection(collection: Collection) -> Self {
        Self {
            collection,
            record_id: None,
        }
    }
}

/// An alert derived from a cache snapshot. Never persisted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Alert {
    pub id: String,
    pub kind: AlertKind,
    pub severity: Severity,
    pub subject: SubjectRef,
    pub message: String,
    pub created_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_severity_ordering_matches_rank() {
        assert!(Severity::Critical < Severity::Warning);
        assert!(Severity::Warning < Severity::Info);
        assert_eq!(Severity::Critical.rank(), 0);
        assert_eq!(Severity::Info.rank(), 2);
    }
}
