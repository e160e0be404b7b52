//! Output formatting and argument helpers for the offline commands
//!
//! Everything here works on the persisted cache; nothing talks to the remote
//! source of truth.

use anyhow::{Context, Result};
use chrono::{DateTime, NaiveDate, Utc};
use comfy_table::{Cell, Color, ContentArrangement, Row, Table};
use fleetsync_core::{Alert, CacheEntry, ChangeEvent, EntryStatus, Severity};
use serde::Serialize;
use std::time::Duration;

// ============================================================================
// Arguments
// ============================================================================

/// Parse `--at`: `YYYY-MM-DD` (UTC midnight) or RFC 3339
pub fn parse_at(s: &str) -> Result<DateTime<Utc>> {
    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return Ok(dt.with_timezone(&Utc));
    }
    let date = NaiveDate::parse_from_str(s, "%Y-%m-%d")
        .context("Invalid date (expected YYYY-MM-DD or RFC 3339)")?;
    let datetime = date.and_hms_opt(0, 0, 0).context("Invalid time")?.and_utc();
    Ok(datetime)
}

/// Parse one line of a change-event log. Blank lines and `#` comments
/// yield `None`.
pub fn parse_event_line(line: &str) -> Result<Option<ChangeEvent>> {
    let line = line.trim();
    if line.is_empty() || line.starts_with('#') {
        return Ok(None);
    }
    let event = serde_json::from_str(line).context("Invalid change event")?;
    Ok(Some(event))
}

// ============================================================================
// Inspect
// ============================================================================

#[derive(Serialize)]
struct EntryView<'a> {
    collection: &'a str,
    records: usize,
    status: &'a str,
    freshness: &'a str,
    updated_at: Option<DateTime<Utc>>,
    age_secs: Option<u64>,
}

/// Format cached entries as table (human) or JSON
pub fn format_entries(
    entries: &[CacheEntry],
    now: DateTime<Utc>,
    json: bool,
    no_color: bool,
) -> String {
    if json {
        let views: Vec<_> = entries
            .iter()
            .map(|e| EntryView {
                collection: e.key.as_str(),
                records: e.len(),
                status: status_label(e),
                freshness: e.freshness(now).label(),
                updated_at: e.updated_at,
                age_secs: e.age(now).map(|a| a.as_secs()),
            })
            .collect();
        return serde_json::to_string_pretty(&views).unwrap_or_else(|_| "[]".to_string());
    }

    if entries.is_empty() {
        return "No cached collections.".to_string();
    }

    let mut table = Table::new();
    table.set_content_arrangement(ContentArrangement::Dynamic);
    let headers = ["Collection", "Records", "Status", "Freshness", "Updated", "Age"];
    if no_color {
        table.set_header(headers.to_vec());
    } else {
        table.set_header(
            headers
                .iter()
                .map(|h| Cell::new(h).fg(Color::Cyan))
                .collect::<Vec<_>>(),
        );
    }

    for entry in entries {
        let updated = entry
            .updated_at
            .map(|ts| ts.format("%Y-%m-%d %H:%M").to_string())
            .unwrap_or_else(|| "-".to_string());
        let age = entry
            .age(now)
            .map(format_duration)
            .unwrap_or_else(|| "-".to_string());
        let freshness = entry.freshness(now).label();
        let freshness_cell = if no_color {
            Cell::new(freshness)
        } else {
            Cell::new(freshness).fg(match freshness {
                "fresh" => Color::Green,
                "stale" => Color::Yellow,
                _ => Color::Red,
            })
        };

        table.add_row(Row::from(vec![
            Cell::new(entry.key.as_str()),
            Cell::new(entry.len()),
            Cell::new(status_label(entry)),
            freshness_cell,
            Cell::new(updated),
            Cell::new(age),
        ]));
    }

    table.to_string()
}

fn status_label(entry: &CacheEntry) -> &'static str {
    match entry.status {
        EntryStatus::Empty => "empty",
        EntryStatus::Loading => "loading",
        EntryStatus::Fresh => "fresh",
        EntryStatus::Error => "error",
    }
}

// ============================================================================
// Alerts
// ============================================================================

/// Format alerts as table (human) or JSON
pub fn format_alerts(alerts: &[Alert], json: bool, no_color: bool) -> String {
    if json {
        return serde_json::to_string_pretty(alerts).unwrap_or_else(|_| "[]".to_string());
    }

    if alerts.is_empty() {
        return "No alerts.".to_string();
    }

    let mut table = Table::new();
    table.set_content_arrangement(ContentArrangement::Dynamic);
    let headers = ["Severity", "Kind", "Subject", "Message"];
    if no_color {
        table.set_header(headers.to_vec());
    } else {
        table.set_header(
            headers
                .iter()
                .map(|h| Cell::new(h).fg(Color::Cyan))
                .collect::<Vec<_>>(),
        );
    }

    for alert in alerts {
        let severity = if no_color {
            Cell::new(alert.severity.label())
        } else {
            Cell::new(alert.severity.label()).fg(severity_color(alert.severity))
        };
        let subject = match &alert.subject.record_id {
            Some(id) => format!("{}/{}", alert.subject.collection, id),
            None => alert.subject.collection.to_string(),
        };
        table.add_row(Row::from(vec![
            severity,
            Cell::new(alert.kind.slug()),
            Cell::new(subject),
            Cell::new(truncate(&alert.message, 60)),
        ]));
    }

    table.to_string()
}

fn severity_color(severity: Severity) -> Color {
    match severity {
        Severity::Critical => Color::Red,
        Severity::Warning => Color::Yellow,
        Severity::Info => Color::Blue,
    }
}

// ============================================================================
// Utilities
// ============================================================================

/// Compact human duration: `45s`, `12m`, `3h 20m`, `2d 4h`
pub fn format_duration(d: Duration) -> String {
    let secs = d.as_secs();
    match secs {
        0..=59 => format!("{}s", secs),
        60..=3599 => format!("{}m", secs / 60),
        3600..=86_399 => match (secs % 3600) / 60 {
            0 => format!("{}h", secs / 3600),
            m => format!("{}h {}m", secs / 3600, m),
        },
        _ => match (secs % 86_400) / 3600 {
            0 => format!("{}d", secs / 86_400),
            h => format!("{}d {}h", secs / 86_400, h),
        },
    }
}

fn truncate(s: &str, max: usize) -> String {
    if s.chars().count() <= max {
        s.to_string()
    } else {
        // Char-based so multi-byte labels never split
        s.chars().take(max - 1).collect::<String>() + "…"
    }
}

// ============================================================================
// Tests
// ============================================================================
