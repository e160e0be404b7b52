//! Error types for fleetsync-core
//!
//! None of these are fatal: the worst outcome of any failure is serving data
//! older than its stale time.

use crate::models::Collection;
use thiserror::Error;

/// Core error type for sync operations
#[derive(Error, Debug)]
pub enum SyncError {
    // ===================
    // Fetch Errors
    // ===================
    #[error("Fetch failed for {collection}: {message}")]
    TransientFetch {
        collection: Collection,
        message: String,
    },

    #[error("Fetch for {collection} timed out after {timeout_secs}s")]
    FetchTimeout {
        collection: Collection,
        timeout_secs: u64,
    },

    // ===================
    // Subscription Errors
    // ===================
    #[error("Subscription lost for {collection}: {reason}")]
    SubscriptionLost {
        collection: Collection,
        reason: String,
    },

    #[error("Malformed {collection} event: {reason}")]
    MalformedEvent {
        collection: Collection,
        reason: String,
    },

    // ===================
    // Persistence Errors
    // ===================
    #[error("Persistence error: {message}")]
    Persistence { message: String },

    #[error("Failed to encode or decode cache snapshot")]
    Serialization(#[from] serde_json::Error),

    // ===================
    // Config Errors
    // ===================
    #[error("Invalid configuration: {message}")]
    InvalidConfig { message: String },

    #[error("Unknown collection: {name}")]
    UnknownCollection { name: String },

    #[error("No tokio runtime available: {message}")]
    NoRuntime { message: String },
}

impl SyncError {
    pub fn transient(collection: Collection, message: impl Into<String>) -> Self {
        Self::TransientFetch {
            collection,
            message: message.into(),
        }
    }

    pub fn malformed(collection: Collection, reason: impl Into<String>) -> Self {
        Self::MalformedEvent {
            collection,
            reason: reason.into(),
        }
    }

    pub fn persistence(error: &anyhow::Error) -> Self {
        Self::Persistence {
            message: format!("{:#}", error),
        }
    }

    /// Failures that the next scheduled refresh may resolve
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            SyncError::TransientFetch { .. }
                | SyncError::FetchTimeout { .. }
                | SyncError::SubscriptionLost { .. }
        )
    }
}

/// Overall health of the sync layer, for "data may be out of date" indicators
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SyncHealth {
    /// Every subscription active and no collection in error
    Healthy,
    /// Serving possibly outdated data
    Degraded { reasons: Vec<String> },
}

impl SyncHealth {
    pub fn from_reasons(reasons: Vec<String>) -> Self {
        if reasons.is_empty() {
            SyncHealth::Healthy
        } else {
            SyncHealth::Degraded { reasons }
        }
    }

    pub fn is_healthy(&self) -> bool {
        matches!(self, SyncHealth::Healthy)
    }

    pub fn is_degraded(&self) -> bool {
        !self.is_healthy()
    }
}
