//! Centralized error types for Lifeline.

use serde::Serialize;
use std::fmt;
use thiserror::Error;

use crate::model::OperationKind;

/// Which of the two backing stores an error or status refers to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StoreKind {
    Document,
    Graph,
}

impl StoreKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            StoreKind::Document => "document store",
            StoreKind::Graph => "graph store",
        }
    }
}

impl fmt::Display for StoreKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Error reported by a store adapter.
///
/// Adapter crates keep their own error enums and convert into this one at the
/// trait boundary.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum StoreError {
    #[error("Connection error: {0}")]
    Connection(String),

    #[error("Store unavailable: {0}")]
    Unavailable(String),

    #[error("Query failed: {0}")]
    Query(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Conflict: {0}")]
    Conflict(String),

    #[error("Serialization error: {0}")]
    Serialization(String),
}

/// Result type for store adapter calls.
pub type StoreResult<T> = Result<T, StoreError>;

impl From<serde_json::Error> for StoreError {
    fn from(err: serde_json::Error) -> Self {
        Self::Serialization(err.to_string())
    }
}

/// Failure of a coordinated write or of background reconciliation.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum SyncError {
    #[error("{store} unavailable: {source}")]
    StoreUnavailable { store: StoreKind, source: StoreError },

    #[error("Operation {index} ({kind} {collection}/{entity_id}) failed in {store}: {source}")]
    OperationExecution {
        store: StoreKind,
        index: usize,
        kind: OperationKind,
        collection: String,
        entity_id: String,
        source: StoreError,
    },

    #[error("Commit failed in {store}: {source}")]
    Commit { store: StoreKind, source: StoreError },

    #[error("Rollback failed in {store}: {source}")]
    Rollback { store: StoreKind, source: StoreError },

    #[error("{store} commit failed after the document store committed: {source}")]
    PartialCommit { store: StoreKind, source: StoreError },

    #[error(
        "Transaction failed after {attempts} attempt(s): {last_error}{}",
        rollback_suffix(.rollback_errors)
    )]
    MaxRetriesExceeded {
        attempts: u32,
        #[source]
        last_error: Box<SyncError>,
        rollback_errors: Vec<SyncError>,
    },

    #[error("Unsynced operation {operation_id} ({entity_id}) dropped after {retry_count} failed replay(s): {reason}")]
    PermanentSyncFailure {
        operation_id: String,
        entity_id: String,
        retry_count: u32,
        reason: String,
    },

    #[error("Validation error: {0}")]
    Validation(String),
}

fn rollback_suffix(errors: &[SyncError]) -> String {
    if errors.is_empty() {
        return String::new();
    }
    let joined = errors
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("; ");
    format!(" (rollback errors: {})", joined)
}

impl SyncError {
    /// Create a validation error.
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    /// The store the failure happened in, when there is exactly one.
    pub fn store(&self) -> Option<StoreKind> {
        match self {
            Self::StoreUnavailable { store, .. }
            | Self::OperationExecution { store, .. }
            | Self::Commit { store, .. }
            | Self::Rollback { store, .. }
            | Self::PartialCommit { store, .. } => Some(*store),
            Self::MaxRetriesExceeded { last_error, .. } => last_error.store(),
            Self::PermanentSyncFailure { .. } => Some(StoreKind::Graph),
            Self::Validation(_) => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_max_retries_message_keeps_original_cause() {
        let original = SyncError::StoreUnavailable {
            store: StoreKind::Document,
            source: StoreError::Connection("refused".to_string()),
        };
        let err = SyncError::MaxRetriesExceeded {
            attempts: 3,
            last_error: Box::new(original),
            rollback_errors: vec![SyncError::Rollback {
                store: StoreKind::Graph,
                source: StoreError::Query("abort rejected".to_string()),
            }],
        };

        let message = err.to_string();
        assert!(message.starts_with("Transaction failed after 3 attempt(s): document store unavailable"));
        assert!(message.contains("refused"));
        assert!(message.contains("rollback errors: Rollback failed in graph store"));
        assert_eq!(err.store(), Some(StoreKind::Document));
    }

    #[test]
    fn test_max_retries_message_without_rollback_errors() {
        let err = SyncError::MaxRetriesExceeded {
            attempts: 1,
            last_error: Box::new(SyncError::validation("bad label")),
            rollback_errors: Vec::new(),
        };
        assert_eq!(
            err.to_string(),
            "Transaction failed after 1 attempt(s): Validation error: bad label"
        );
        assert_eq!(err.store(), None);
    }
}
