//! Coordination store on a local (or shared) filesystem.
//!
//! Layout under the store root:
//!
//! ```text
//! <root>/.store.lock              serializes mutations (fs2 exclusive lock)
//! <root>/<path>/.data             record payload
//! <root>/<path>/.version          record version, decimal
//! <root>/<path>/.seq              last sequence number issued under <path>
//! <root>/.locks/<path>.lock       named locks (fs2 exclusive lock)
//! ```
//!
//! Named locks are advisory `flock`s, so they are released by the kernel when
//! the holding process dies. Lock files are never unlinked while they may be
//! held: unlinking a locked file would let a second process create a fresh
//! file at the same path and take a separate "exclusive" lock.

use super::{
    sequence_name, validate_path, ConnectionState, CoordinationStore, LockGuard, Record,
    StoreError, StoreResult,
};
use fs2::FileExt;
use std::fs::{self, File, OpenOptions};
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

const DATA_FILE: &str = ".data";
const VERSION_FILE: &str = ".version";
const SEQ_FILE: &str = ".seq";
const STORE_LOCK_FILE: &str = ".store.lock";
const LOCKS_DIR: &str = ".locks";
const TMP_DIR: &str = ".tmp";

static TMP_COUNTER: AtomicU64 = AtomicU64::new(0);

/// Filesystem-backed coordination store rooted at a directory.
#[derive(Debug, Clone)]
pub struct FsStore {
    root: PathBuf,
}

impl FsStore {
    /// Open (and create if needed) the store at `root`.
    pub fn open(root: &Path) -> StoreResult<Self> {
        let store = Self {
            root: root.to_path_buf(),
        };
        for dir in [store.root.clone(), store.locks_dir(), store.tmp_dir()] {
            fs::create_dir_all(&dir).map_err(|e| StoreError::io(&dir, e))?;
        }
        Ok(store)
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn locks_dir(&self) -> PathBuf {
        self.root.join(LOCKS_DIR)
    }

    fn tmp_dir(&self) -> PathBuf {
        self.root.join(TMP_DIR)
    }

    fn node_dir(&self, segments: &[&str]) -> PathBuf {
        segments
            .iter()
            .fold(self.root.clone(), |dir, segment| dir.join(segment))
    }

    fn lock_file_path(&self, segments: &[&str]) -> PathBuf {
        let mut path = self.locks_dir();
        if let Some((last, parents)) = segments.split_last() {
            for segment in parents {
                path = path.join(segment);
            }
            path.join(format!("{last}.lock"))
        } else {
            path.join(".root.lock")
        }
    }

    /// Open the store-wide mutation lock, shared for reads.
    fn store_lock(&self, exclusive: bool) -> StoreResult<File> {
        let path = self.root.join(STORE_LOCK_FILE);
        let file = OpenOptions::new()
            .create(true)
            .read(true)
            .write(true)
            .truncate(false)
            .open(&path)
            .map_err(|e| StoreError::io(&path, e))?;
        let locked = if exclusive {
            file.lock_exclusive()
        } else {
            file.lock_shared()
        };
        locked.map_err(|e| StoreError::io(&path, e))?;
        Ok(file)
    }

    fn read_version(&self, dir: &Path, path: &str) -> StoreResult<u64> {
        let version_path = dir.join(VERSION_FILE);
        match fs::read_to_string(&version_path) {
            Ok(raw) => raw.trim().parse().map_err(|_| StoreError::Corrupt {
                path: path.to_string(),
                reason: format!("unparseable version '{}'", raw.trim()),
            }),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(0),
            Err(e) => Err(StoreError::io(version_path, e)),
        }
    }

    fn write_node(&self, dir: &Path, data: &[u8], version: u64) -> StoreResult<()> {
        self.write_atomic(&dir.join(DATA_FILE), data)?;
        self.write_atomic(&dir.join(VERSION_FILE), version.to_string().as_bytes())
    }

    fn write_atomic(&self, dest: &Path, bytes: &[u8]) -> StoreResult<()> {
        let tmp = self.tmp_dir().join(tmp_name());
        fs::write(&tmp, bytes).map_err(|e| StoreError::io(&tmp, e))?;
        fs::rename(&tmp, dest).map_err(|e| {
            let _ = fs::remove_file(&tmp);
            StoreError::io(dest, e)
        })
    }

    fn create_parents(&self, segments: &[&str]) -> StoreResult<()> {
        for depth in 1..=segments.len() {
            let dir = self.node_dir(&segments[..depth]);
            if !dir.is_dir() {
                fs::create_dir_all(&dir).map_err(|e| StoreError::io(&dir, e))?;
                self.write_node(&dir, b"", 0)?;
            }
        }
        Ok(())
    }

    fn next_sequence(&self, dir: &Path) -> StoreResult<u64> {
        let seq_path = dir.join(SEQ_FILE);
        let last = match fs::read_to_string(&seq_path) {
            Ok(raw) => raw.trim().parse::<u64>().unwrap_or(0),
            Err(e) if e.kind() == ErrorKind::NotFound => 0,
            Err(e) => return Err(StoreError::io(seq_path, e)),
        };
        let next = last + 1;
        self.write_atomic(&seq_path, next.to_string().as_bytes())?;
        Ok(next)
    }

    /// Remove lock files under a deleted subtree that nobody holds.
    fn prune_lock_files(&self, segments: &[&str]) {
        let lock_file = self.lock_file_path(segments);
        remove_unheld_lock(&lock_file);
        let lock_dir = segments
            .iter()
            .fold(self.locks_dir(), |dir, segment| dir.join(segment));
        if !lock_dir.is_dir() {
            return;
        }
        let mut pending = vec![lock_dir];
        while let Some(dir) = pending.pop() {
            let Ok(entries) = fs::read_dir(&dir) else {
                continue;
            };
            for entry in entries.filter_map(Result::ok) {
                let path = entry.path();
                if path.is_dir() {
                    pending.push(path);
                } else {
                    remove_unheld_lock(&path);
                }
            }
        }
    }
}

fn remove_unheld_lock(path: &Path) {
    let Ok(file) = OpenOptions::new().read(true).write(true).open(path) else {
        return;
    };
    if file.try_lock_exclusive().is_ok() {
        let _ = fs::remove_file(path);
        let _ = file.unlock();
    }
}

fn tmp_name() -> String {
    let nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_nanos();
    let n = TMP_COUNTER.fetch_add(1, Ordering::Relaxed);
    format!("tmp-{}-{nanos}-{n}", std::process::id())
}

fn is_metadata(name: &str) -> bool {
    name.starts_with('.')
}

impl CoordinationStore for FsStore {
    fn create_record(&self, path: &str, data: &[u8], sequential: bool) -> StoreResult<String> {
        let segments = validate_path(path)?;
        let _guard = self.store_lock(true)?;

        let (full, dir) = if sequential {
            self.create_parents(&segments)?;
            let parent = self.node_dir(&segments);
            let name = sequence_name(self.next_sequence(&parent)?);
            let full = if path.is_empty() {
                name.clone()
            } else {
                format!("{path}/{name}")
            };
            (full, parent.join(name))
        } else {
            let Some((_, parents)) = segments.split_last() else {
                return Err(StoreError::AlreadyExists {
                    path: path.to_string(),
                });
            };
            let dir = self.node_dir(&segments);
            if dir.is_dir() {
                return Err(StoreError::AlreadyExists {
                    path: path.to_string(),
                });
            }
            self.create_parents(parents)?;
            (path.to_string(), dir)
        };

        fs::create_dir(&dir).map_err(|e| match e.kind() {
            ErrorKind::AlreadyExists => StoreError::AlreadyExists { path: full.clone() },
            _ => StoreError::io(&dir, e),
        })?;
        self.write_node(&dir, data, 0)?;
        Ok(full)
    }

    fn read_record(&self, path: &str) -> StoreResult<Option<Record>> {
        let segments = validate_path(path)?;
        let _guard = self.store_lock(false)?;
        let dir = self.node_dir(&segments);
        if !dir.is_dir() {
            return Ok(None);
        }
        let data_path = dir.join(DATA_FILE);
        let data = match fs::read(&data_path) {
            Ok(data) => data,
            Err(e) if e.kind() == ErrorKind::NotFound => Vec::new(),
            Err(e) => return Err(StoreError::io(data_path, e)),
        };
        let version = self.read_version(&dir, path)?;
        Ok(Some(Record { data, version }))
    }

    fn update_record(
        &self,
        path: &str,
        data: &[u8],
        expected_version: Option<u64>,
    ) -> StoreResult<u64> {
        let segments = validate_path(path)?;
        let _guard = self.store_lock(true)?;
        let dir = self.node_dir(&segments);
        if segments.is_empty() || !dir.is_dir() {
            return Err(StoreError::NotFound {
                path: path.to_string(),
            });
        }
        let current = self.read_version(&dir, path)?;
        if let Some(expected) = expected_version {
            if expected != current {
                return Err(StoreError::VersionConflict {
                    path: path.to_string(),
                    expected,
                    actual: current,
                });
            }
        }
        let version = current + 1;
        self.write_node(&dir, data, version)?;
        Ok(version)
    }

    fn delete_record(&self, path: &str, recursive: bool) -> StoreResult<()> {
        let segments = validate_path(path)?;
        if segments.is_empty() {
            return Err(StoreError::InvalidPath {
                path: path.to_string(),
                reason: "cannot delete the store root".to_string(),
            });
        }
        let _guard = self.store_lock(true)?;
        let dir = self.node_dir(&segments);
        if !dir.is_dir() {
            return Ok(());
        }
        if !recursive && !self.list_children_unlocked(&dir)?.is_empty() {
            return Err(StoreError::NotEmpty {
                path: path.to_string(),
            });
        }
        // Rename out of the tree first so readers never see a half-deleted record.
        let doomed = self.tmp_dir().join(tmp_name());
        fs::rename(&dir, &doomed).map_err(|e| StoreError::io(&dir, e))?;
        fs::remove_dir_all(&doomed).map_err(|e| StoreError::io(&doomed, e))?;
        self.prune_lock_files(&segments);
        Ok(())
    }

    fn list_children(&self, path: &str) -> StoreResult<Vec<String>> {
        let segments = validate_path(path)?;
        let _guard = self.store_lock(false)?;
        let dir = self.node_dir(&segments);
        if !dir.is_dir() {
            return Ok(Vec::new());
        }
        self.list_children_unlocked(&dir)
    }

    fn acquire_lock(&self, path: &str, blocking: bool) -> StoreResult<LockGuard> {
        let segments = validate_path(path)?;
        let lock_path = self.lock_file_path(&segments);
        if let Some(parent) = lock_path.parent() {
            fs::create_dir_all(parent).map_err(|e| StoreError::io(parent, e))?;
        }
        let file = OpenOptions::new()
            .create(true)
            .read(true)
            .write(true)
            .truncate(false)
            .open(&lock_path)
            .map_err(|e| StoreError::io(&lock_path, e))?;

        if blocking {
            file.lock_exclusive()
                .map_err(|e| StoreError::io(&lock_path, e))?;
        } else if file.try_lock_exclusive().is_err() {
            return Err(StoreError::LockContention {
                path: path.to_string(),
            });
        }

        Ok(LockGuard::new(
            path,
            Box::new(move || {
                let _ = file.unlock();
            }),
        ))
    }

    fn connection_state(&self) -> ConnectionState {
        ConnectionState::Connected
    }

    fn did_lose_connection(&self) -> bool {
        false
    }

    fn reset_lost_flag(&self) {}
}

impl FsStore {
    fn list_children_unlocked(&self, dir: &Path) -> StoreResult<Vec<String>> {
        let mut children = Vec::new();
        for entry in fs::read_dir(dir).map_err(|e| StoreError::io(dir, e))? {
            let entry = entry.map_err(|e| StoreError::io(dir, e))?;
            let Some(name) = entry.file_name().to_str().map(str::to_string) else {
                continue;
            };
            if is_metadata(&name) {
                continue;
            }
            if entry.path().is_dir() {
                children.push(name);
            }
        }
        children.sort();
        Ok(children)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn open() -> (TempDir, FsStore) {
        let tmp = TempDir::new().unwrap();
        let store = FsStore::open(&tmp.path().join("store")).unwrap();
        (tmp, store)
    }

    #[test]
    fn record_roundtrip_with_versions() {
        let (_tmp, store) = open();
        let path = store
            .create_record("images/base/builds", b"{\"state\":\"building\"}", true)
            .unwrap();
        assert_eq!(path, "images/base/builds/0000000001");

        let record = store.read_record(&path).unwrap().unwrap();
        assert_eq!(record.version, 0);
        assert_eq!(store.update_record(&path, b"{}", Some(0)).unwrap(), 1);
        assert!(matches!(
            store.update_record(&path, b"{}", Some(0)),
            Err(StoreError::VersionConflict { .. })
        ));
        assert_eq!(store.read_record(&path).unwrap().unwrap().data, b"{}");
    }

    #[test]
    fn children_hide_metadata() {
        let (_tmp, store) = open();
        store.create_record("images/base/builds", b"", true).unwrap();
        store.create_record("images/base/pause", b"", false).unwrap();
        let _lock = store.acquire_lock("images/base/builds", false).unwrap();
        assert_eq!(
            store.list_children("images/base").unwrap(),
            vec!["builds".to_string(), "pause".to_string()]
        );
        assert_eq!(
            store.list_children("images/base/builds").unwrap(),
            vec!["0000000001".to_string()]
        );
    }

    #[test]
    fn delete_requires_recursive_for_children() {
        let (_tmp, store) = open();
        store
            .create_record("images/base/builds/0000000001/providers/p/images", b"", true)
            .unwrap();
        assert!(matches!(
            store.delete_record("images/base/builds/0000000001", false),
            Err(StoreError::NotEmpty { .. })
        ));
        store
            .delete_record("images/base/builds/0000000001", true)
            .unwrap();
        assert!(!store.exists("images/base/builds/0000000001").unwrap());
        store.delete_record("images/missing", false).unwrap();
    }

    #[test]
    fn locks_conflict_within_one_process() {
        let (_tmp, store) = open();
        let guard = store.acquire_lock("images/base/builds", false).unwrap();
        let again = store.acquire_lock("images/base/builds", false);
        assert!(matches!(again, Err(StoreError::LockContention { .. })));
        drop(guard);
        assert!(store.acquire_lock("images/base/builds", false).is_ok());
    }

    #[test]
    fn reopened_store_keeps_sequence() {
        let (tmp, store) = open();
        store.create_record("seq", b"", true).unwrap();
        let reopened = FsStore::open(&tmp.path().join("store")).unwrap();
        assert_eq!(
            reopened.create_record("seq", b"", true).unwrap(),
            "seq/0000000002"
        );
    }
}
