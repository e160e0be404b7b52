//! Bounded buffer of user-facing notifications (toasts)

use crate::models::{record_label, ChangeEvent, Collection};
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::VecDeque;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum NotificationLevel {
    Info,
    Success,
    Warning,
    Error,
}

#[derive(Debug, Clone, Serialize)]
pub struct Notification {
    pub level: NotificationLevel,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub collection: Option<Collection>,
    pub message: String,
    pub created_at: DateTime<Utc>,
}

impl Notification {
    pub fn new(
        level: NotificationLevel,
        collection: Option<Collection>,
        message: impl Into<String>,
    ) -> Self {
        Self {
            level,
            collection,
            message: message.into(),
            created_at: Utc::now(),
        }
    }

    /// Describe an applied change, e.g. "Vehicle AB-123 added"
    pub fn from_change(event: &ChangeEvent) -> Self {
        let label = record_label(&event.record);
        let label = match (label.as_str(), &event.prior_record) {
            ("(unnamed)", Some(prior)) => record_label(prior),
            _ => label,
        };
        Self::new(
            NotificationLevel::Info,
            Some(event.collection),
            format!(
                "{} {} {}",
                event.collection.singular(),
                label,
                event.kind.past_tense()
            ),
        )
    }
}

/// Ring buffer keeping the most recent notifications; the oldest is dropped
/// once `capacity` is reached.
pub struct NotificationBuffer {
    capacity: usize,
    items: Mutex<VecDeque<Notification>>,
}

impl NotificationBuffer {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            items: Mutex::new(VecDeque::with_capacity(capacity.max(1))),
        }
    }

    pub fn push(&self, notification: Notification) {
        let mut items = self.items.lock();
        if items.len() == self.capacity {
            items.pop_front();
        }
        items.push_back(notification);
    }

    /// Most recent notifications, newest first
    pub fn recent(&self, limit: usize) -> Vec<Notification> {
        self.items.lock().iter().rev().take(limit).cloned().collect()
    }

    /// Remove and return everything, oldest first
    pub fn drain(&self) -> Vec<Notification> {
        self.items.lock().drain(..).collect()
    }

    pub fn len(&self) -> usize {
        self.items.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.lock().is_empty()
    }
}

impl Default for NotificationBuffer {
    fn default() -> Self {
        Self::new(50)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_buffer_drops_oldest() {
        let buffer = NotificationBuffer::new(2);
        for i in 0..3 {
            buffer.push(Notification::new(
                NotificationLevel::Info,
                None,
                format!("n{}", i),
            ));
        }
        assert_eq!(buffer.len(), 2);
        let recent = buffer.recent(10);
        assert_eq!(recent[0].message, "n2");
        assert_eq!(recent[1].message, "n1");

        let drained = buffer.drain();
        assert_eq!(drained[0].message, "n1");
        assert!(buffer.is_empty());
    }

    #[test]
    fn test_from_change_message() {
        let event = ChangeEvent::insert(
            Collection::Vehicles,
            json!({"id": "v1", "plate": "AB-CD"}),
        );
        let n = Notification::from_change(&event);
        assert_eq!(n.message, "Vehicle AB-CD added");
        assert_eq!(n.collection, Some(Collection::Vehicles));

        let delete = ChangeEvent::delete(Collection::Employees, json!({}))
            .with_prior(json!({"id": 3, "name": "Ana"}));
        assert_eq!(
            Notification::from_change(&delete).message,
            "Employee Ana removed"
        );
    }
}
