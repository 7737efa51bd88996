//! Errors raised by coordination store backends.

use std::path::PathBuf;
use thiserror::Error;

/// Result type for coordination store operations.
pub type StoreResult<T> = std::result::Result<T, StoreError>;

/// Failure of a single coordination store operation.
#[derive(Error, Debug)]
pub enum StoreError {
    #[error("record not found: {path}")]
    NotFound { path: String },

    #[error("record already exists: {path}")]
    AlreadyExists { path: String },

    #[error("version conflict on {path}: expected {expected}, found {actual}")]
    VersionConflict {
        path: String,
        expected: u64,
        actual: u64,
    },

    /// A non-blocking lock request found the lock already held.
    #[error("lock is held by another client: {path}")]
    LockContention { path: String },

    /// The store is suspended or the session was lost.
    #[error("coordination store connection is not available")]
    ConnectionLoss,

    #[error("record still has children: {path}")]
    NotEmpty { path: String },

    #[error("invalid store path '{path}': {reason}")]
    InvalidPath { path: String, reason: String },

    #[error("corrupt record {path}: {reason}")]
    Corrupt { path: String, reason: String },

    #[error("store I/O error at {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

impl StoreError {
    pub(crate) fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        StoreError::Io {
            path: path.into(),
            source,
        }
    }
}

/// True when `err` (or anything in its chain) is lock contention.
pub fn is_lock_contention(err: &anyhow::Error) -> bool {
    err.chain().any(|cause| {
        matches!(
            cause.downcast_ref::<StoreError>(),
            Some(StoreError::LockContention { .. })
        )
    })
}

/// True when `err` (or anything in its chain) is a lost store connection.
pub fn is_connection_loss(err: &anyhow::Error) -> bool {
    err.chain().any(|cause| {
        matches!(
            cause.downcast_ref::<StoreError>(),
            Some(StoreError::ConnectionLoss)
        )
    })
}
