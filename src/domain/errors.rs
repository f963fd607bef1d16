//! Domain Errors
//!
//! Error taxonomy shared by every component that talks to the resource store.

use thiserror::Error;

/// Errors returned by a [`ResourceStore`](crate::domain::ports::ResourceStore).
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StoreError {
    #[error("resource not found: {0}")]
    NotFound(String),

    #[error("resource already exists: {0}")]
    AlreadyExists(String),

    /// Optimistic-concurrency failure; the caller must re-read and retry.
    #[error("version conflict on {key}: expected {expected}, found {actual}")]
    Conflict {
        key: String,
        expected: u64,
        actual: u64,
    },

    /// Backend unreachable or timed out. Always transient.
    #[error("store unavailable: {0}")]
    Unavailable(String),

    #[error("invalid resource: {0}")]
    Invalid(String),
}

impl StoreError {
    /// Whether the error is a lost optimistic-concurrency race.
    pub fn is_conflict(&self) -> bool {
        matches!(self, Self::Conflict { .. } | Self::AlreadyExists(_))
    }

    /// Whether retrying later may succeed.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Unavailable(_)) || self.is_conflict()
    }
}

impl From<rusqlite::Error> for StoreError {
    fn from(e: rusqlite::Error) -> Self {
        Self::Unavailable(e.to_string())
    }
}
