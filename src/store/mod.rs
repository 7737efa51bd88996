//! Coordination store: the only state shared between builder processes.
//!
//! The store is a tree of small records addressed by slash-separated paths
//! (`images/base/builds/0000000001`). Every record can carry data and have
//! children. On top of plain CRUD it offers:
//!
//! - sequence-numbered creation (`create_record(parent, .., true)` names the
//!   new child with the next 10-digit number for that parent),
//! - versioned updates (`update_record` with an expected version),
//! - exclusive, non-reentrant locks that are released when the holder dies,
//! - a connection state that workers poll before issuing operations.
//!
//! Names starting with `.` are reserved for backend metadata and are never
//! returned from [`CoordinationStore::list_children`].

mod error;
pub mod fs;
pub mod memory;

pub use error::{is_connection_loss, is_lock_contention, StoreError, StoreResult};
pub use fs::FsStore;
pub use memory::MemoryStore;

use std::fmt;

/// Connection state as seen by the local client.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Connected,
    /// Temporarily disconnected; locks may still be held server side.
    Suspended,
    /// Session expired; every lock held by this client is gone.
    Lost,
}

/// A record's payload and its current version.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Record {
    pub data: Vec<u8>,
    pub version: u64,
}

/// Contract every coordination backend implements.
pub trait CoordinationStore: Send + Sync + fmt::Debug {
    /// Create a record, creating missing parents as empty records.
    ///
    /// With `sequential`, `path` names the parent and the new child gets the
    /// next sequence number. Returns the full path of the created record.
    fn create_record(&self, path: &str, data: &[u8], sequential: bool) -> StoreResult<String>;

    /// Read a record, `None` if it does not exist.
    fn read_record(&self, path: &str) -> StoreResult<Option<Record>>;

    /// Replace a record's data. With `expected_version`, fail with
    /// [`StoreError::VersionConflict`] unless it matches. Returns the new version.
    fn update_record(
        &self,
        path: &str,
        data: &[u8],
        expected_version: Option<u64>,
    ) -> StoreResult<u64>;

    /// Delete a record. Deleting a missing record is not an error.
    fn delete_record(&self, path: &str, recursive: bool) -> StoreResult<()>;

    /// Names of the direct children of `path`, sorted. Empty if missing.
    fn list_children(&self, path: &str) -> StoreResult<Vec<String>>;

    fn exists(&self, path: &str) -> StoreResult<bool> {
        Ok(self.read_record(path)?.is_some())
    }

    /// Take the exclusive lock named by `path`.
    ///
    /// Without `blocking`, fails immediately with
    /// [`StoreError::LockContention`] when the lock is held, including by
    /// another guard in this same process.
    fn acquire_lock(&self, path: &str, blocking: bool) -> StoreResult<LockGuard>;

    fn connection_state(&self) -> ConnectionState;

    /// Sticky flag set whenever the session was lost since the last reset.
    fn did_lose_connection(&self) -> bool;

    fn reset_lost_flag(&self);

    fn is_connected(&self) -> bool {
        self.connection_state() == ConnectionState::Connected
    }
}

/// Held lock; released on drop.
pub struct LockGuard {
    path: String,
    release: Option<Box<dyn FnOnce() + Send>>,
}

impl LockGuard {
    pub(crate) fn new(path: impl Into<String>, release: Box<dyn FnOnce() + Send>) -> Self {
        Self {
            path: path.into(),
            release: Some(release),
        }
    }

    pub fn path(&self) -> &str {
        &self.path
    }
}

impl fmt::Debug for LockGuard {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LockGuard").field("path", &self.path).finish()
    }
}

impl Drop for LockGuard {
    fn drop(&mut self) {
        if let Some(release) = self.release.take() {
            release();
        }
    }
}

/// Join path segments with `/`.
pub fn join_path(segments: &[&str]) -> String {
    segments.join("/")
}

/// Split `path` into segments, rejecting anything that could escape the
/// tree or collide with backend metadata.
pub(crate) fn validate_path(path: &str) -> StoreResult<Vec<&str>> {
    let invalid = |reason: &str| StoreError::InvalidPath {
        path: path.to_string(),
        reason: reason.to_string(),
    };
    if path.is_empty() {
        return Ok(Vec::new());
    }
    let segments: Vec<&str> = path.split('/').collect();
    for segment in &segments {
        if segment.is_empty() {
            return Err(invalid("empty path segment"));
        }
        if segment.starts_with('.') {
            return Err(invalid("segments must not start with '.'"));
        }
        if segment.contains('\\') || segment.contains('\0') {
            return Err(invalid("segments must not contain '\\' or NUL"));
        }
    }
    Ok(segments)
}

pub(crate) fn sequence_name(seq: u64) -> String {
    format!("{seq:010}")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn validate_path_rejects_traversal_and_metadata() {
        assert!(validate_path("images/base").is_ok());
        assert!(validate_path("").unwrap().is_empty());
        assert!(validate_path("images/../etc").is_err());
        assert!(validate_path("images//base").is_err());
        assert!(validate_path("images/.lock").is_err());
    }

    #[test]
    fn sequence_names_sort_numerically() {
        assert_eq!(sequence_name(1), "0000000001");
        assert!(sequence_name(9) < sequence_name(10));
    }

    #[test]
    fn lock_contention_is_found_through_context() {
        let err = anyhow::Error::new(StoreError::LockContention {
            path: "images/base/builds".to_string(),
        })
        .context("locking image build");
        assert!(is_lock_contention(&err));
        assert!(!is_connection_loss(&err));
    }
}
