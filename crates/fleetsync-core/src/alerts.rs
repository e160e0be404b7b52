//! Alert derivation
//!
//! Rule-based alerts computed from a point-in-time snapshot of the vehicle,
//! equipment and employee collections:
//! - Vehicle maintenance date passed → Critical, within 7 days → Warning
//! - Vehicle insurance / license expired → Critical, within 30 days → Warning
//! - Equipment in maintenance → one aggregate Warning with the count
//! - Employees on vacation → one aggregate Info with the count
//!
//! Output is deterministic for a given snapshot and `now`.

use crate::models::{record_id, record_label, Alert, AlertKind, Collection, Record, Severity, SubjectRef};
use crate::store::CacheStore;
use chrono::{DateTime, NaiveDate, NaiveDateTime, NaiveTime, Utc};
use std::sync::Arc;
use tracing::debug;

const MS_PER_DAY: f64 = 86_400_000.0;

/// Collections alerts are derived from
#[derive(Debug, Clone, Default)]
pub struct AlertSnapshot {
    pub vehicles: Arc<Vec<Record>>,
    pub equipment: Arc<Vec<Record>>,
    pub employees: Arc<Vec<Record>>,
}

impl AlertSnapshot {
    pub fn new(vehicles: Vec<Record>, equipment: Vec<Record>, employees: Vec<Record>) -> Self {
        Self {
            vehicles: Arc::new(vehicles),
            equipment: Arc::new(equipment),
            employees: Arc::new(employees),
        }
    }

    pub fn from_store(store: &CacheStore) -> Self {
        Self {
            vehicles: store.records(Collection::Vehicles),
            equipment: store.records(Collection::Equipment),
            employees: store.records(Collection::Employees),
        }
    }

    /// Whether a change to `collection` can affect derived alerts
    pub fn depends_on(collection: Collection) -> bool {
        matches!(
            collection,
            Collection::Vehicles | Collection::Equipment | Collection::Employees
        )
    }
}

/// A dated vehicle document checked against a warning window
struct DateRule {
    fields: [&'static str; 2],
    window_days: i64,
    past: AlertKind,
    upcoming: AlertKind,
}

/// Checked in this order for each vehicle
const VEHICLE_RULES: [DateRule; 3] = [
    DateRule {
        fields: ["nextMaintenanceDate", "next_maintenance_date"],
        window_days: 7,
        past: AlertKind::MaintenanceOverdue,
        upcoming: AlertKind::MaintenanceUpcoming,
    },
    DateRule {
        fields: ["insuranceExpiry", "insurance_expiry"],
        window_days: 30,
        past: AlertKind::InsuranceExpired,
        upcoming: AlertKind::InsuranceUpcoming,
    },
    DateRule {
        fields: ["licenseExpiry", "license_expiry"],
        window_days: 30,
        past: AlertKind::LicenseExpired,
        upcoming: AlertKind::LicenseUpcoming,
    },
];

/// Derive the full ordered alert list.
///
/// Sorted by severity, stable: ties keep vehicles before equipment before
/// employees, and maintenance before insurance before license per vehicle.
pub fn derive_alerts(snapshot: &AlertSnapshot, now: DateTime<Utc>) -> Vec<Alert> {
    let mut alerts = Vec::new();

    for (index, vehicle) in snapshot.vehicles.iter().enumerate() {
        let id = record_id(vehicle).unwrap_or_else(|| format!("#{}", index));
        let label = record_label(vehicle);

        for rule in &VEHICLE_RULES {
            let Some(date) = date_field(vehicle, &rule.fields) else {
                continue;
            };
            let days = days_until(date, now);
            let kind = if days < 0 {
                rule.past
            } else if days <= rule.window_days {
                rule.upcoming
            } else {
                continue;
            };
            let severity = if days < 0 {
                Severity::Critical
            } else {
                Severity::Warning
            };
            alerts.push(Alert {
                id: format!("{}:{}:{}", kind.slug(), Collection::Vehicles, id),
                kind,
                severity,
                subject: SubjectRef::record(Collection::Vehicles, id.clone()),
                message: vehicle_message(kind, &label, days),
                created_at: now,
            });
        }
    }

    let in_maintenance = count_status(&snapshot.equipment, "maintenance");
    if in_maintenance > 0 {
        alerts.push(aggregate(
            AlertKind::EquipmentInMaintenance,
            Severity::Warning,
            Collection::Equipment,
            format!(
                "{} equipment item{} in maintenance",
                in_maintenance,
                plural(in_maintenance)
            ),
            now,
        ));
    }

    let on_leave = count_status(&snapshot.employees, "vacation");
    if on_leave > 0 {
        alerts.push(aggregate(
            AlertKind::StaffOnLeave,
            Severity::Info,
            Collection::Employees,
            format!("{} employee{} on leave", on_leave, plural(on_leave)),
            now,
        ));
    }

    // sort_by_key is stable
    alerts.sort_by_key(|a| a.severity.rank());
    alerts
}

/// First `n` alerts of an ordered list, for summary displays
pub fn top_alerts(mut alerts: Vec<Alert>, n: usize) -> Vec<Alert> {
    alerts.truncate(n);
    alerts
}

fn aggregate(
    kind: AlertKind,
    severity: Severity,
    collection: Collection,
    message: String,
    now: DateTime<Utc>,
) -> Alert {
    Alert {
        id: format!("{}:{}", kind.slug(), collection),
        kind,
        severity,
        subject: SubjectRef::collection(collection),
        message,
        created_at: now,
    }
}

fn vehicle_message(kind: AlertKind, label: &str, days: i64) -> String {
    let n = days.unsigned_abs();
    let span = format!("{} day{}", n, plural(n as usize));
    match kind {
        AlertKind::MaintenanceOverdue => format!("Maintenance overdue for {} by {}", label, span),
        AlertKind::MaintenanceUpcoming if days == 0 => format!("Maintenance due today for {}", label),
        AlertKind::MaintenanceUpcoming => format!("Maintenance due for {} in {}", label, span),
        AlertKind::InsuranceExpired => format!("Insurance for {} expired {} ago", label, span),
        AlertKind::InsuranceUpcoming => format!("Insurance for {} expires in {}", label, span),
        AlertKind::LicenseExpired => format!("License for {} expired {} ago", label, span),
        AlertKind::LicenseUpcoming => format!("License for {} expires in {}", label, span),
        AlertKind::EquipmentInMaintenance | AlertKind::StaffOnLeave => label.to_string(),
    }
}

fn plural(n: usize) -> &'static str {
    if n == 1 {
        ""
    } else {
        "s"
    }
}

/// Whole days from `now` to `date`, rounded up
fn days_until(date: DateTime<Utc>, now: DateTime<Utc>) -> i64 {
    let ms = (date - now).num_milliseconds() as f64;
    (ms / MS_PER_DAY).ceil() as i64
}

fn count_status(records: &[Record], status: &str) -> usize {
    records
        .iter()
        .filter(|r| {
            r.get("status")
                .and_then(|s| s.as_str())
                .is_some_and(|s| s.trim().eq_ignore_ascii_case(status))
        })
        .count()
}

/// First present field among `names`, parsed as a date
fn date_field(record: &Record, names: &[&str]) -> Option<DateTime<Utc>> {
    let raw = names
        .iter()
        .find_map(|name| record.get(*name).and_then(|v| v.as_str()))?;
    let parsed = parse_date(raw);
    if parsed.is_none() && !raw.trim().is_empty() {
        debug!(value = raw, "Skipping unparseable date");
    }
    parsed
}

/// RFC 3339, naive date-time (taken as UTC), or `YYYY-MM-DD` (UTC midnight)
fn parse_date(raw: &str) -> Option<DateTime<Utc>> {
    let raw = raw.trim();
    if let Ok(dt) = DateTime::parse_from_rfc3339(raw) {
        return Some(dt.with_timezone(&Utc));
    }
    if let Ok(dt) = NaiveDateTime::parse_from_str(raw, "%Y-%m-%dT%H:%M:%S%.f") {
        return Some(dt.and_utc());
    }
    NaiveDate::parse_from_str(raw, "%Y-%m-%d")
        .ok()
        .map(|d| d.and_time(NaiveTime::MIN).and_utc())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeDelta;
    use serde_json::json;

    fn at(now: DateTime<Utc>, days: i64) -> String {
        (now + TimeDelta::days(days)).to_rfc3339()
    }

    #[test]
    fn test_maintenance_overdue_three_days() {
        let now = Utc::now();
        let snapshot = AlertSnapshot::new(
            vec![json!({"id": "v1", "plate": "AB-123", "nextMaintenanceDate": at(now, -3)})],
            vec![],
            vec![],
        );
        let alerts = derive_alerts(&snapshot, now);
        assert_eq!(alerts.len(), 1);
        assert_eq!(alerts[0].kind, AlertKind::MaintenanceOverdue);
        assert_eq!(alerts[0].severity, Severity::Critical);
        assert!(alerts[0].message.contains('3'));
        assert_eq!(alerts[0].message, "Maintenance overdue for AB-123 by 3 days");
        assert_eq!(alerts[0].id, "maintenance-overdue:vehicles:v1");
        assert_eq!(alerts[0].subject, SubjectRef::record(Collection::Vehicles, "v1"));
    }

    #[test]
    fn test_insurance_outside_window_ignored() {
        let now = Utc::now();
        let snapshot = AlertSnapshot::new(
            vec![json!({"id": "v1", "insuranceExpiry": at(now, 45)})],
            vec![],
            vec![],
        );
        assert!(derive_alerts(&snapshot, now).is_empty());
    }

    #[test]
    fn test_window_boundaries() {
        let now = Utc::now();
        let snapshot = AlertSnapshot::new(
            vec![
                json!({"id": 1, "nextMaintenanceDate": at(now, 7)}),
                json!({"id": 2, "nextMaintenanceDate": at(now, 8)}),
                json!({"id": 3, "license_expiry": at(now, 30)}),
                json!({"id": 4, "licenseExpiry": at(now, 0)}),
            ],
            vec![],
            vec![],
        );
        let kinds: Vec<_> = derive_alerts(&snapshot, now)
            .into_iter()
            .map(|a| (a.subject.record_id.unwrap(), a.kind))
            .collect();
        assert_eq!(
            kinds,
            vec![
                ("1".to_string(), AlertKind::MaintenanceUpcoming),
                ("3".to_string(), AlertKind::LicenseUpcoming),
                ("4".to_string(), AlertKind::LicenseUpcoming),
            ]
        );
    }

    #[test]
    fn test_equipment_aggregate_counts() {
        let now = Utc::now();
        let equipment = vec![
            json!({"id": 1, "status": "maintenance"}),
            json!({"id": 2, "status": "active"}),
            json!({"id": 3, "status": "Maintenance"}),
            json!({"id": 4, "status": "active"}),
            json!({"id": 5}),
        ];
        let alerts = derive_alerts(&AlertSnapshot::new(vec![], equipment, vec![]), now);
        assert_eq!(alerts.len(), 1);
        assert_eq!(alerts[0].kind, AlertKind::EquipmentInMaintenance);
        assert_eq!(alerts[0].severity, Severity::Warning);
        assert!(alerts[0].message.contains('2'));
        assert_eq!(alerts[0].subject.record_id, None);
    }

    #[test]
    fn test_ordering_by_severity_then_insertion() {
        let now = Utc::now();
        let snapshot = AlertSnapshot::new(
            vec![
                json!({"id": "a", "insuranceExpiry": at(now, 10), "licenseExpiry": at(now, -1)}),
                json!({"id": "b", "nextMaintenanceDate": at(now, -5), "insuranceExpiry": at(now, -2)}),
            ],
            vec![json!({"status": "maintenance"})],
            vec![json!({"status": "vacation"}), json!({"status": "vacation"})],
        );
        let ids: Vec<_> = derive_alerts(&snapshot, now).into_iter().map(|a| a.id).collect();
        assert_eq!(
            ids,
            vec![
                "license-expired:vehicles:a",
                "maintenance-overdue:vehicles:b",
                "insurance-expired:vehicles:b",
                "insurance-upcoming:vehicles:a",
                "equipment-in-maintenance:equipment",
                "staff-on-leave:employees",
            ]
        );
    }

    #[test]
    fn test_derivation_is_deterministic() {
        let now = Utc::now();
        let snapshot = AlertSnapshot::new(
            vec![
                json!({"id": "v1", "nextMaintenanceDate": at(now, 2)}),
                json!({"id": "v2", "insuranceExpiry": at(now, -4)}),
            ],
            vec![json!({"status": "maintenance"})],
            vec![json!({"status": "vacation"})],
        );
        let first = serde_json::to_string(&derive_alerts(&snapshot, now)).unwrap();
        let second = serde_json::to_string(&derive_alerts(&snapshot, now)).unwrap();
        assert_eq!(first, second);
    }

    #[test]
    fn test_date_formats() {
        let midnight = parse_date("2026-03-01").unwrap();
        assert_eq!(midnight.to_rfc3339(), "2026-03-01T00:00:00+00:00");
        assert_eq!(
            parse_date("2026-03-01T12:30:00").unwrap(),
            parse_date("2026-03-01T12:30:00Z").unwrap()
        );
        assert!(parse_date("next tuesday").is_none());
    }

    #[test]
    fn test_unparseable_date_skipped() {
        let now = Utc::now();
        let snapshot = AlertSnapshot::new(
            vec![json!({"id": "v1", "nextMaintenanceDate": "soon", "insuranceExpiry": null})],
            vec![],
            vec![],
        );
        assert!(derive_alerts(&snapshot, now).is_empty());
    }

    #[test]
    fn test_top_alerts_caps() {
        let now = Utc::now();
        let snapshot = AlertSnapshot::new(
            vec![],
            vec![json!({"status": "maintenance"})],
            vec![json!({"status": "vacation"})],
        );
        let all = derive_alerts(&snapshot, now);
        assert_eq!(top_alerts(all.clone(), 1).len(), 1);
        assert_eq!(top_alerts(all, 10).len(), 2);
    }
}
