//! Push change events and record identity

use super::collection::Collection;
use super::entry::Record;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Kind of change carried by a push event
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChangeKind {
    Insert,
    Update,
    Delete,
}

impl ChangeKind {
    pub fn past_tense(&self) -> &'static str {
        match self {
            ChangeKind::Insert => "added",
            ChangeKind::Update => "updated",
            ChangeKind::Delete => "removed",
        }
    }
}

/// A single insert/update/delete delivered by the change feed
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChangeEvent {
    pub collection: Collection,
    pub kind: ChangeKind,
    pub record: Record,
    /// Previous version of the record (updates and deletes only)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub prior_record: Option<Record>,
    /// Transport-assigned identifier, used to drop replays
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub event_id: Option<String>,
}

impl ChangeEvent {
    pub fn new(collection: Collection, kind: ChangeKind, record: Record) -> Self {
        Self {
            collection,
            kind,
            record,
            prior_record: None,
            event_id: None,
        }
    }

    pub fn insert(collection: Collection, record: Record) -> Self {
        Self::new(collection, ChangeKind::Insert, record)
    }

    pub fn update(collection: Collection, record: Record) -> Self {
        Self::new(collection, ChangeKind::Update, record)
    }

    pub fn delete(collection: Collection, record: Record) -> Self {
        Self::new(collection, ChangeKind::Delete, record)
    }

    pub fn with_prior(mut self, prior: Record) -> Self {
        self.prior_record = Some(prior);
        self
    }

    pub fn with_event_id(mut self, id: impl Into<String>) -> Self {
        self.event_id = Some(id.into());
        self
    }

    /// Identity of the affected record.
    ///
    /// Deletes may carry only the prior record, so it is consulted as a
    /// fallback.
    pub fn record_id(&self) -> Option<String> {
        record_id(&self.record).or_else(|| self.prior_record.as_ref().and_then(record_id))
    }
}

/// Identity of a record: its `id` field, string or number.
pub fn record_id(record: &Record) -> Option<String> {
    match record.get("id")? {
        Value::String(s) if !s.is_empty() => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

/// Short human label for a record, used in alerts and notifications
pub fn record_label(record: &Record) -> String {
    const LABEL_FIELDS: [&str; 6] = [
        "plate",
        "licensePlate",
        "license_plate",
        "name",
        "fullName",
        "description",
    ];

    LABEL_FIELDS
        .iter()
        .find_map(|field| record.get(*field).and_then(Value::as_str))
        .filter(|s| !s.trim().is_empty())
        .map(str::to_string)
        .or_else(|| record_id(record).map(|id| format!("#{}", id)))
        .unwrap_or_else(|| "(unnamed)".to_string())
}
