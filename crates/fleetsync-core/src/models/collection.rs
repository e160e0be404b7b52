//! The fixed set of synchronized collections

use crate::error::SyncError;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// One named set of business records synchronized as a unit.
///
/// Used as the index of the cache store, the usage tracker and the
/// change-feed subscriptions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Collection {
    Employees,
    Equipment,
    Vehicles,
    Movements,
    Maintenances,
    Fuels,
}

impl Collection {
    /// Every collection, in declaration order
    pub const ALL: [Collection; 6] = [
        Collection::Employees,
        Collection::Equipment,
        Collection::Vehicles,
        Collection::Movements,
        Collection::Maintenances,
        Collection::Fuels,
    ];

    /// Collections refreshed on network reconnect and window focus
    pub const CRITICAL: [Collection; 3] = [
        Collection::Movements,
        Collection::Maintenances,
        Collection::Fuels,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Collection::Employees => "employees",
            Collection::Equipment => "equipment",
            Collection::Vehicles => "vehicles",
            Collection::Movements => "movements",
            Collection::Maintenances => "maintenances",
            Collection::Fuels => "fuels",
        }
    }

    /// Human label for a single record of this collection
    pub fn singular(&self) -> &'static str {
        match self {
            Collection::Employees => "Employee",
            Collection::Equipment => "Equipment",
            Collection::Vehicles => "Vehicle",
            Collection::Movements => "Movement",
            Collection::Maintenances => "Maintenance record",
            Collection::Fuels => "Fuel record",
        }
    }

    pub fn is_critical(&self) -> bool {
        Self::CRITICAL.contains(self)
    }
}

impl fmt::Display for Collection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Collection {
    type Err = SyncError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let normalized = s.trim().to_ascii_lowercase();
        Self::ALL
            .into_iter()
            .find(|c| c.as_str() == normalized)
            .ok_or_else(|| SyncError::UnknownCollection {
                name: s.to_string(),
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_round_trips_names() {
        for collection in Collection::ALL {
            assert_eq!(collection.as_str().parse::<Collection>().unwrap(), collection);
        }
        assert_eq!(" Vehicles ".parse::<Collection>().unwrap(), Collection::Vehicles);
    }

    #[test]
    fn test_parse_unknown() {
        let err = "trailers".parse::<Collection>().unwrap_err();
        assert!(matches!(err, SyncError::UnknownCollection { name } if name == "trailers"));
    }

    #[test]
    fn test_critical_subset() {
        assert!(Collection::Fuels.is_critical());
        assert!(Collection::Movements.is_critical());
        assert!(!Collection::Vehicles.is_critical());
        assert!(!Collection::Employees.is_critical());
    }

    #[test]
    fn test_serde_lowercase() {
        let json = serde_json::to_string(&Collection::Maintenances).unwrap();
        assert_eq!(json, r#""maintenances""#);
    }
}
