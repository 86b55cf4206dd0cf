//! Embedded store implementation.
//!
//! A hierarchical namespace held in process memory: persistent and
//! ephemeral entries, per-parent sequential suffixes, per-entry version
//! counters and one-shot watches delivered through per-session event
//! queues. The master process embeds one instance and serves it over
//! HTTP; tests use it directly.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::Notify;
use uuid::Uuid;

use super::{CreateMode, SessionId, StoreBackend, StoreEvent, WatchKind};
use crate::error::{KattaError, KattaResult};

struct Entry {
    data: String,
    version: u64,
    owner: Option<SessionId>,
    /// Counter handed out to sequential children of this entry
    seq_counter: u64,
}

struct Session {
    queue: VecDeque<StoreEvent>,
    notify: Arc<Notify>,
    last_poll: Instant,
}

#[derive(Default)]
struct Inner {
    tree: BTreeMap<String, Entry>,
    sessions: HashMap<SessionId, Session>,
    watches: HashMap<(WatchKind, String), Vec<SessionId>>,
    /// Counter for sequential entries created directly under the root
    root_seq: u64,
}

pub struct MemoryStore {
    inner: Mutex<Inner>,
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryStore {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(Inner::default()),
        }
    }

    /// Forcefully expire a session: its ephemeral entries disappear and
    /// its next poll errors. Also used to simulate node death in tests.
    pub fn expire_session(&self, session: &SessionId) {
        self.remove_session(session);
    }

    /// Expire every session that has not polled within `timeout`.
    pub fn expire_stale_sessions(&self, timeout: Duration) {
        let stale: Vec<SessionId> = {
            let inner = self.inner.lock();
            inner
                .sessions
                .iter()
                .filter(|(_, s)| s.last_poll.elapsed() > timeout)
                .map(|(id, _)| id.clone())
                .collect()
        };
        for session in stale {
            tracing::info!(session = %session, "Expiring stale store session");
            self.remove_session(&session);
        }
    }

    /// Spawn the background expiry sweep used when the store is served to
    /// other processes.
    pub fn start_expiry(self: &Arc<Self>, timeout: Duration) -> tokio::task::JoinHandle<()> {
        let store = Arc::clone(self);
        let interval = timeout / 4;
        tokio::spawn(async move {
            loop {
                tokio::time::sleep(interval).await;
                store.expire_stale_sessions(timeout);
            }
        })
    }

    fn remove_session(&self, session: &SessionId) {
        let mut inner = self.inner.lock();
        let removed = match inner.sessions.remove(session) {
            Some(s) => s,
            None => return,
        };
        // Wake a blocked poller so it observes the expiry
        removed.notify.notify_waiters();
        removed.notify.notify_one();

        for watchers in inner.watches.values_mut() {
            watchers.retain(|s| s != session);
        }

        let ephemerals: Vec<String> = inner
            .tree
            .iter()
            .filter(|(_, e)| e.owner.as_ref() == Some(session))
            .map(|(path, _)| path.clone())
            .collect();
        for path in ephemerals {
            inner.remove_entry(&path);
        }
    }
}

impl Inner {
    fn fire(&mut self, kind: WatchKind, path: &str) {
        let watchers = match self.watches.remove(&(kind, path.to_string())) {
            Some(w) => w,
            None => return,
        };
        let event = match kind {
            WatchKind::Children => StoreEvent::ChildrenChanged {
                path: path.to_string(),
            },
            WatchKind::Data => StoreEvent::DataChanged {
                path: path.to_string(),
            },
        };
        for session in watchers {
            if let Some(s) = self.sessions.get_mut(&session) {
                s.queue.push_back(event.clone());
                s.notify.notify_one();
            }
        }
    }

    /// Remove one entry and fire its data watch plus the parent's
    /// children watch. The caller guarantees the entry is a leaf.
    fn remove_entry(&mut self, path: &str) {
        if self.tree.remove(path).is_none() {
            return;
        }
        self.fire(WatchKind::Data, path);
        self.fire(WatchKind::Children, &parent_of(path));
    }

    fn direct_children(&self, path: &str) -> Vec<String> {
        let prefix = if path == "/" {
            "/".to_string()
        } else {
            format!("{}/", path)
        };
        self.tree
            .range(prefix.clone()..)
            .take_while(|(key, _)| key.starts_with(&prefix))
            .filter(|(key, _)| !key[prefix.len()..].contains('/'))
            .map(|(key, _)| key[prefix.len()..].to_string())
            .collect()
    }

    fn subtree(&self, path: &str) -> Vec<String> {
        let prefix = format!("{}/", path);
        let mut paths: Vec<String> = self
            .tree
            .range(prefix.clone()..)
            .take_while(|(key, _)| key.starts_with(&prefix))
            .map(|(key, _)| key.clone())
            .collect();
        if self.tree.contains_key(path) {
            paths.push(path.to_string());
        }
        // Leaves first
        paths.sort_by(|a, b| b.len().cmp(&a.len()).then_with(|| a.cmp(b)));
        paths
    }
}

fn parent_of(path: &str) -> String {
    match path.rfind('/') {
        Some(0) | None => "/".to_string(),
        Some(idx) => path[..idx].to_string(),
    }
}

fn validate(path: &str) -> KattaResult<()> {
    let ok = path.starts_with('/')
        && path.len() > 1
        && !path.ends_with('/')
        && !path.contains("//");
    if ok {
        Ok(())
    } else {
        Err(KattaError::InternalError(format!(
            "invalid store path '{}'",
            path
        )))
    }
}

#[async_trait]
impl StoreBackend for MemoryStore {
    async fn create_session(&self) -> KattaResult<SessionId> {
        let id = Uuid::new_v4().to_string();
        let mut inner = self.inner.lock();
        inner.sessions.insert(
            id.clone(),
            Session {
                queue: VecDeque::new(),
                notify: Arc::new(Notify::new()),
                last_poll: Instant::now(),
            },
        );
        Ok(id)
    }

    async fn close_session(&self, session: &SessionId) -> KattaResult<()> {
        self.remove_session(session);
        Ok(())
    }

    async fn create(
        &self,
        session: &SessionId,
        path: &str,
        data: String,
        mode: CreateMode,
    ) -> KattaResult<String> {
        validate(path)?;
        let mut inner = self.inner.lock();
        if !inner.sessions.contains_key(session) {
            return Err(KattaError::StoreUnavailable("session expired".to_string()));
        }
        if inner.tree.contains_key(path) {
            return Err(KattaError::PathExists(path.to_string()));
        }
        let parent = parent_of(path);
        if parent != "/" && !inner.tree.contains_key(&parent) {
            return Err(KattaError::PathNotFound(parent));
        }

        let final_path = if mode == CreateMode::EphemeralSequential {
            let seq = if parent == "/" {
                inner.root_seq += 1;
                inner.root_seq
            } else {
                let entry = inner
                    .tree
                    .get_mut(&parent)
                    .ok_or_else(|| KattaError::PathNotFound(parent.clone()))?;
                entry.seq_counter += 1;
                entry.seq_counter
            };
            format!("{}{:010}", path, seq)
        } else {
            path.to_string()
        };

        let owner = match mode {
            CreateMode::Persistent => None,
            CreateMode::Ephemeral | CreateMode::EphemeralSequential => Some(session.clone()),
        };
        inner.tree.insert(
            final_path.clone(),
            Entry {
                data,
                version: 1,
                owner,
                seq_counter: 0,
            },
        );
        inner.fire(WatchKind::Data, &final_path);
        inner.fire(WatchKind::Children, &parent);
        Ok(final_path)
    }

    async fn read(&self, path: &str) -> KattaResult<(String, u64)> {
        let inner = self.inner.lock();
        let entry = inner
            .tree
            .get(path)
            .ok_or_else(|| KattaError::PathNotFound(path.to_string()))?;
        Ok((entry.data.clone(), entry.version))
    }

    async fn write(
        &self,
        path: &str,
        data: String,
        expected_version: Option<u64>,
    ) -> KattaResult<u64> {
        let mut inner = self.inner.lock();
        let entry = inner
            .tree
            .get_mut(path)
            .ok_or_else(|| KattaError::PathNotFound(path.to_string()))?;
        if let Some(expected) = expected_version {
            if entry.version != expected {
                return Err(KattaError::StoreConflict(format!(
                    "{} is at version {}, write expected {}",
                    path, entry.version, expected
                )));
            }
        }
        entry.data = data;
        entry.version += 1;
        let version = entry.version;
        inner.fire(WatchKind::Data, path);
        Ok(version)
    }

    async fn delete(&self, path: &str) -> KattaResult<()> {
        let mut inner = self.inner.lock();
        if !inner.tree.contains_key(path) {
            return Err(KattaError::PathNotFound(path.to_string()));
        }
        if !inner.direct_children(path).is_empty() {
            return Err(KattaError::StoreConflict(format!("{} is not empty", path)));
        }
        inner.remove_entry(path);
        Ok(())
    }

    async fn delete_recursive(&self, path: &str) -> KattaResult<()> {
        let mut inner = self.inner.lock();
        for entry in inner.subtree(path) {
            inner.remove_entry(&entry);
        }
        Ok(())
    }

    async fn exists(&self, path: &str) -> KattaResult<bool> {
        Ok(self.inner.lock().tree.contains_key(path))
    }

    async fn children(&self, path: &str) -> KattaResult<Vec<String>> {
        let inner = self.inner.lock();
        if path != "/" && !inner.tree.contains_key(path) {
            return Err(KattaError::PathNotFound(path.to_string()));
        }
        Ok(inner.direct_children(path))
    }

    async fn watch(&self, session: &SessionId, path: &str, kind: WatchKind) -> KattaResult<()> {
        let mut inner = self.inner.lock();
        if !inner.sessions.contains_key(session) {
            return Err(KattaError::StoreUnavailable("session expired".to_string()));
        }
        let watchers = inner.watches.entry((kind, path.to_string())).or_default();
        if !watchers.contains(session) {
            watchers.push(session.clone());
        }
        Ok(())
    }

    async fn poll_events(
        &self,
        session: &SessionId,
        max_wait: Duration,
    ) -> KattaResult<Vec<StoreEvent>> {
        let deadline = Instant::now() + max_wait;
        loop {
            let notify = {
                let mut inner = self.inner.lock();
                let s = inner
                    .sessions
                    .get_mut(session)
                    .ok_or_else(|| KattaError::StoreUnavailable("session expired".to_string()))?;
                s.last_poll = Instant::now();
                if !s.queue.is_empty() {
                    return Ok(s.queue.drain(..).collect());
                }
                s.notify.clone()
            };
            let now = Instant::now();
            if now >= deadline {
                return Ok(Vec::new());
            }
            tokio::select! {
                _ = notify.notified() => {}
                _ = tokio::time::sleep(deadline - now) => {}
            }
        }
    }
}
