//! In-process coordination store.
//!
//! Used by tests to simulate several builder processes sharing one store,
//! and by embedders running a single builder. The connection state can be
//! driven by hand: moving to [`ConnectionState::Lost`] expires the session,
//! releasing every lock it held.

use super::{
    sequence_name, validate_path, ConnectionState, CoordinationStore, LockGuard, Record,
    StoreError, StoreResult,
};
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};

#[derive(Debug, Default)]
struct Node {
    data: Vec<u8>,
    version: u64,
    next_seq: u64,
}

#[derive(Debug)]
struct Inner {
    nodes: BTreeMap<String, Node>,
    /// Held locks, path -> guard token.
    locks: HashMap<String, u64>,
    next_token: u64,
    state: ConnectionState,
    lost: bool,
}

#[derive(Default)]
struct Shared {
    inner: Mutex<Inner>,
    released: Condvar,
}

impl Default for Inner {
    fn default() -> Self {
        Self {
            nodes: BTreeMap::new(),
            locks: HashMap::new(),
            next_token: 1,
            state: ConnectionState::Connected,
            lost: false,
        }
    }
}

/// Coordination store held entirely in memory. Clones share state.
#[derive(Clone, Default)]
pub struct MemoryStore {
    shared: Arc<Shared>,
}

impl fmt::Debug for MemoryStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let inner = self.inner();
        f.debug_struct("MemoryStore")
            .field("records", &inner.nodes.len())
            .field("locks", &inner.locks.len())
            .field("state", &inner.state)
            .finish()
    }
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn inner(&self) -> MutexGuard<'_, Inner> {
        self.shared
            .inner
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    fn connected(&self) -> StoreResult<MutexGuard<'_, Inner>> {
        let inner = self.inner();
        if inner.state != ConnectionState::Connected {
            return Err(StoreError::ConnectionLoss);
        }
        Ok(inner)
    }

    /// Drive the simulated connection. `Lost` drops every held lock.
    pub fn set_connection_state(&self, state: ConnectionState) {
        let mut inner = self.inner();
        inner.state = state;
        if state == ConnectionState::Lost {
            inner.lost = true;
            inner.locks.clear();
        }
        drop(inner);
        self.shared.released.notify_all();
    }

    /// Whether a lock at `path` is currently held by anyone.
    pub fn is_locked(&self, path: &str) -> bool {
        self.inner().locks.contains_key(path)
    }
}

fn ensure_parents(nodes: &mut BTreeMap<String, Node>, segments: &[&str]) {
    for depth in 1..segments.len() {
        let parent = segments[..depth].join("/");
        nodes.entry(parent).or_default();
    }
}

fn child_prefix(path: &str) -> String {
    if path.is_empty() {
        String::new()
    } else {
        format!("{path}/")
    }
}

impl CoordinationStore for MemoryStore {
    fn create_record(&self, path: &str, data: &[u8], sequential: bool) -> StoreResult<String> {
        let segments = validate_path(path)?;
        let mut inner = self.connected()?;

        let full = if sequential {
            ensure_parents(&mut inner.nodes, &segments);
            let parent = inner.nodes.entry(path.to_string()).or_default();
            parent.next_seq += 1;
            let name = sequence_name(parent.next_seq);
            format!("{}{}", child_prefix(path), name)
        } else {
            if segments.is_empty() {
                return Err(StoreError::AlreadyExists {
                    path: path.to_string(),
                });
            }
            if inner.nodes.contains_key(path) {
                return Err(StoreError::AlreadyExists {
                    path: path.to_string(),
                });
            }
            ensure_parents(&mut inner.nodes, &segments);
            path.to_string()
        };

        inner.nodes.insert(
            full.clone(),
            Node {
                data: data.to_vec(),
                version: 0,
                next_seq: 0,
            },
        );
        Ok(full)
    }

    fn read_record(&self, path: &str) -> StoreResult<Option<Record>> {
        validate_path(path)?;
        let inner = self.connected()?;
        Ok(inner.nodes.get(path).map(|node| Record {
            data: node.data.clone(),
            version: node.version,
        }))
    }

    fn update_record(
        &self,
        path: &str,
        data: &[u8],
        expected_version: Option<u64>,
    ) -> StoreResult<u64> {
        validate_path(path)?;
        let mut inner = self.connected()?;
        let node = inner
            .nodes
            .get_mut(path)
            .ok_or_else(|| StoreError::NotFound {
                path: path.to_string(),
            })?;
        if let Some(expected) = expected_version {
            if node.version != expected {
                return Err(StoreError::VersionConflict {
                    path: path.to_string(),
                    expected,
                    actual: node.version,
                });
            }
        }
        node.data = data.to_vec();
        node.version += 1;
        Ok(node.version)
    }

    fn delete_record(&self, path: &str, recursive: bool) -> StoreResult<()> {
        validate_path(path)?;
        let mut inner = self.connected()?;
        if !inner.nodes.contains_key(path) {
            return Ok(());
        }
        let prefix = child_prefix(path);
        let descendants: Vec<String> = inner
            .nodes
            .range(prefix.clone()..)
            .take_while(|(key, _)| key.starts_with(&prefix))
            .map(|(key, _)| key.clone())
            .collect();
        if !descendants.is_empty() && !recursive {
            return Err(StoreError::NotEmpty {
                path: path.to_string(),
            });
        }
        for key in descendants {
            inner.nodes.remove(&key);
        }
        inner.nodes.remove(path);
        Ok(())
    }

    fn list_children(&self, path: &str) -> StoreResult<Vec<String>> {
        validate_path(path)?;
        let inner = self.connected()?;
        let prefix = child_prefix(path);
        let children = inner
            .nodes
            .range(prefix.clone()..)
            .take_while(|(key, _)| key.starts_with(&prefix))
            .filter_map(|(key, _)| {
                let rest = &key[prefix.len()..];
                (!rest.is_empty() && !rest.contains('/')).then(|| rest.to_string())
            })
            .collect();
        Ok(children)
    }

    fn acquire_lock(&self, path: &str, blocking: bool) -> StoreResult<LockGuard> {
        validate_path(path)?;
        let mut inner = self.connected()?;
        while inner.locks.contains_key(path) {
            if !blocking {
                return Err(StoreError::LockContention {
                    path: path.to_string(),
                });
            }
            inner = self
                .shared
                .released
                .wait(inner)
                .unwrap_or_else(PoisonError::into_inner);
            if inner.state != ConnectionState::Connected {
                return Err(StoreError::ConnectionLoss);
            }
        }

        let token = inner.next_token;
        inner.next_token += 1;
        inner.locks.insert(path.to_string(), token);
        drop(inner);

        let shared = Arc::clone(&self.shared);
        let lock_path = path.to_string();
        Ok(LockGuard::new(
            path,
            Box::new(move || {
                let mut inner = shared.inner.lock().unwrap_or_else(PoisonError::into_inner);
                // The session may have expired and someone else re-taken it.
                if inner.locks.get(&lock_path) == Some(&token) {
                    inner.locks.remove(&lock_path);
                }
                drop(inner);
                shared.released.notify_all();
            }),
        ))
    }

    fn connection_state(&self) -> ConnectionState {
        self.inner().state
    }

    fn did_lose_connection(&self) -> bool {
        self.inner().lost
    }

    fn reset_lost_flag(&self) {
        self.inner().lost = false;
    }
}
