//! Data models for fleetsync

pub mod alert;
pub mod change;
pub mod collection;
pub mod entry;

pub use alert::{Alert, AlertKind, Severity, SubjectRef};
pub use change::{record_id, record_label, ChangeEvent, ChangeKind};
pub use collection::Collection;
pub use entry::{CacheEntry, EntryStatus, Freshness, Record};
