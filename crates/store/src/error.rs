//! Store operation errors.

use thiserror::Error;

use cqrskit_core::{AggregateId, StatusCode};

/// Event or snapshot store operation error.
///
/// These are **infrastructure errors** (storage, concurrency) as opposed to
/// domain errors (validation, invariants). The dispatch cycle converts them
/// into messages; they never panic the caller.
#[derive(Debug, Error)]
pub enum StoreError {
    /// Optimistic concurrency check failed: the `(uuid, version)` slot is
    /// already taken.
    #[error("version conflict: aggregate {uuid} already has an event at version {version}")]
    Conflict { uuid: AggregateId, version: u64 },

    #[error("serialization failed: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("store lock poisoned")]
    LockPoisoned,

    #[error("{operation} failed: {message}")]
    Backend {
        operation: &'static str,
        message: String,
    },
}

impl StoreError {
    pub fn backend(operation: &'static str, message: impl Into<String>) -> Self {
        Self::Backend {
            operation,
            message: message.into(),
        }
    }

    /// Code carried by the message reporting this error.
    pub fn status_code(&self) -> StatusCode {
        match self {
            StoreError::Conflict { .. } => StatusCode::Conflict,
            _ => StatusCode::Error,
        }
    }
}
