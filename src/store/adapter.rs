//! Typed facade over a [`StoreBackend`].
//!
//! One `MetaStore` owns one store session plus a single event pump task.
//! Consumers subscribe to paths and receive a *continuous* stream even
//! though backend watches are one-shot: the pump re-arms the watch before
//! forwarding each event. Events for one subscription arrive serially;
//! different subscriptions may interleave. Delivery is at-least-once
//! across reconnects, so every handler must be idempotent.
//!
//! On session loss subscribers get exactly one `Disconnected`, then one
//! `Reconnected` once a fresh session is up. Ephemeral entries are gone at
//! that point; re-creating them is the subscriber's job, never this
//! adapter's.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::{Mutex, RwLock};
use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::sync::mpsc::{unbounded_channel, UnboundedReceiver, UnboundedSender};

use super::{
    paths, CreateMode, SessionEvent, SessionId, StoreBackend, StoreEvent, WatchKind,
};
use crate::error::{KattaError, KattaResult};
use crate::protocol::{DeployedShard, IndexMetaData, NodeMetaData, ShardMetaData};

/// Receiver half of a continuous subscription.
pub type Subscription = UnboundedReceiver<StoreEvent>;

/// Receiver half of the session event stream.
pub type SessionSubscription = UnboundedReceiver<SessionEvent>;

const RECONNECT_BACKOFF: Duration = Duration::from_millis(250);
const UPDATE_RETRIES: u32 = 5;

type SubMap = HashMap<(WatchKind, String), Vec<UnboundedSender<StoreEvent>>>;

pub struct MetaStore {
    backend: Arc<dyn StoreBackend>,
    session: Arc<RwLock<SessionId>>,
    subs: Arc<Mutex<SubMap>>,
    session_subs: Arc<Mutex<Vec<UnboundedSender<SessionEvent>>>>,
    pump: Mutex<Option<tokio::task::JoinHandle<()>>>,
}

impl MetaStore {
    /// Open a session and start the event pump.
    pub async fn connect(
        backend: Arc<dyn StoreBackend>,
        poll_timeout: Duration,
    ) -> KattaResult<Arc<Self>> {
        let session = backend.create_session().await?;
        let store = Arc::new(Self {
            backend: Arc::clone(&backend),
            session: Arc::new(RwLock::new(session)),
            subs: Arc::new(Mutex::new(HashMap::new())),
            session_subs: Arc::new(Mutex::new(Vec::new())),
            pump: Mutex::new(None),
        });

        let pump = tokio::spawn(Self::pump_loop(
            backend,
            Arc::clone(&store.session),
            Arc::clone(&store.subs),
            Arc::clone(&store.session_subs),
            poll_timeout,
        ));
        *store.pump.lock() = Some(pump);
        Ok(store)
    }

    async fn pump_loop(
        backend: Arc<dyn StoreBackend>,
        session: Arc<RwLock<SessionId>>,
        subs: Arc<Mutex<SubMap>>,
        session_subs: Arc<Mutex<Vec<UnboundedSender<SessionEvent>>>>,
        poll_timeout: Duration,
    ) {
        let mut connected = true;
        loop {
            let current = session.read().clone();
            match backend.poll_events(&current, poll_timeout).await {
                Ok(events) => {
                    for event in events {
                        Self::dispatch(&backend, &session, &subs, event).await;
                    }
                }
                Err(err) => {
                    if connected {
                        tracing::warn!(error = %err, "Lost store session");
                        connected = false;
                        Self::emit_session(&session_subs, SessionEvent::Disconnected);
                    }
                    tokio::time::sleep(RECONNECT_BACKOFF).await;
                    match backend.create_session().await {
                        Ok(fresh) => {
                            *session.write() = fresh.clone();
                            Self::rearm_all(&backend, &fresh, &subs).await;
                            connected = true;
                            tracing::info!("Store session re-established");
                            Self::emit_session(&session_subs, SessionEvent::Reconnected);
                        }
                        Err(err) => {
                            tracing::debug!(error = %err, "Store still unreachable");
                        }
                    }
                }
            }
        }
    }

    async fn dispatch(
        backend: &Arc<dyn StoreBackend>,
        session: &Arc<RwLock<SessionId>>,
        subs: &Arc<Mutex<SubMap>>,
        event: StoreEvent,
    ) {
        let kind = match &event {
            StoreEvent::ChildrenChanged { .. } => WatchKind::Children,
            StoreEvent::DataChanged { .. } => WatchKind::Data,
        };
        let key = (kind, event.path().to_string());
        let has_subscribers = subs.lock().contains_key(&key);
        if !has_subscribers {
            return;
        }
        // Re-arm before forwarding so no change between the two is missed
        let current = session.read().clone();
        if let Err(err) = backend.watch(&current, event.path(), kind).await {
            tracing::debug!(error = %err, path = event.path(), "Failed to re-arm watch");
        }
        let mut subs = subs.lock();
        if let Some(senders) = subs.get_mut(&key) {
            senders.retain(|tx| tx.send(event.clone()).is_ok());
            if senders.is_empty() {
                subs.remove(&key);
            }
        }
    }

    /// Re-arm every subscription on a fresh session and push one synthetic
    /// event per path so consumers re-read state they may have missed.
    async fn rearm_all(
        backend: &Arc<dyn StoreBackend>,
        session: &SessionId,
        subs: &Arc<Mutex<SubMap>>,
    ) {
        let keys: Vec<(WatchKind, String)> = subs.lock().keys().cloned().collect();
        for (kind, path) in keys {
            if let Err(err) = backend.watch(session, &path, kind).await {
                tracing::debug!(error = %err, path = %path, "Failed to re-arm watch");
                continue;
            }
            let event = match kind {
                WatchKind::Children => StoreEvent::ChildrenChanged { path: path.clone() },
                WatchKind::Data => StoreEvent::DataChanged { path: path.clone() },
            };
            let mut subs = subs.lock();
            if let Some(senders) = subs.get_mut(&(kind, path)) {
                senders.retain(|tx| tx.send(event.clone()).is_ok());
            }
        }
    }

    fn emit_session(
        session_subs: &Arc<Mutex<Vec<UnboundedSender<SessionEvent>>>>,
        event: SessionEvent,
    ) {
        session_subs.lock().retain(|tx| tx.send(event).is_ok());
    }

    /// The current session id. Changes across reconnects.
    pub fn session_id(&self) -> SessionId {
        self.session.read().clone()
    }

    /// Stop the pump without closing the session, leaving ephemerals to
    /// expire server-side. Used to simulate an unclean death.
    pub fn abandon(&self) {
        if let Some(pump) = self.pump.lock().take() {
            pump.abort();
        }
    }

    /// Close the session and stop the pump. Ephemeral entries disappear.
    pub async fn close(&self) {
        if let Some(pump) = self.pump.lock().take() {
            pump.abort();
        }
        let session = self.session.read().clone();
        if let Err(err) = self.backend.close_session(&session).await {
            tracing::debug!(error = %err, "Closing store session failed");
        }
    }

    // ==================== subscriptions ====================

    pub async fn subscribe_children(&self, path: &str) -> KattaResult<Subscription> {
        self.subscribe(path, WatchKind::Children).await
    }

    pub async fn subscribe_data(&self, path: &str) -> KattaResult<Subscription> {
        self.subscribe(path, WatchKind::Data).await
    }

    async fn subscribe(&self, path: &str, kind: WatchKind) -> KattaResult<Subscription> {
        let (tx, rx) = unbounded_channel();
        let needs_arm = {
            let mut subs = self.subs.lock();
            let senders = subs.entry((kind, path.to_string())).or_default();
            senders.push(tx);
            senders.len() == 1
        };
        if needs_arm {
            let session = self.session.read().clone();
            self.backend.watch(&session, path, kind).await?;
        }
        Ok(rx)
    }

    pub fn subscribe_session_events(&self) -> SessionSubscription {
        let (tx, rx) = unbounded_channel();
        self.session_subs.lock().push(tx);
        rx
    }

    // ==================== raw operations ====================

    pub async fn create(&self, path: &str, data: String, mode: CreateMode) -> KattaResult<String> {
        let session = self.session.read().clone();
        self.backend.create(&session, path, data, mode).await
    }

    pub async fn read_raw(&self, path: &str) -> KattaResult<(String, u64)> {
        self.backend.read(path).await
    }

    pub async fn write_raw(&self, path: &str, data: String) -> KattaResult<u64> {
        self.backend.write(path, data, None).await
    }

    pub async fn delete(&self, path: &str) -> KattaResult<()> {
        self.backend.delete(path).await
    }

    pub async fn delete_recursive(&self, path: &str) -> KattaResult<()> {
        self.backend.delete_recursive(path).await
    }

    pub async fn exists(&self, path: &str) -> KattaResult<bool> {
        self.backend.exists(path).await
    }

    pub async fn children(&self, path: &str) -> KattaResult<Vec<String>> {
        self.backend.children(path).await
    }

    /// Children of a path that may not exist yet.
    pub async fn children_or_empty(&self, path: &str) -> KattaResult<Vec<String>> {
        match self.backend.children(path).await {
            Ok(children) => Ok(children),
            Err(KattaError::PathNotFound(_)) => Ok(Vec::new()),
            Err(err) => Err(err),
        }
    }

    /// Create a persistent path, parents included; existing segments are
    /// left alone.
    pub async fn ensure_path(&self, path: &str) -> KattaResult<()> {
        let mut current = String::new();
        for segment in path.split('/').filter(|s| !s.is_empty()) {
            current.push('/');
            current.push_str(segment);
            match self
                .create(&current, String::new(), CreateMode::Persistent)
                .await
            {
                Ok(_) | Err(KattaError::PathExists(_)) => {}
                Err(err) => return Err(err),
            }
        }
        Ok(())
    }

    /// Create the well-known tree every component expects.
    pub async fn create_default_structure(&self) -> KattaResult<()> {
        for root in [
            paths::NODES,
            paths::INDEXES,
            paths::NODE_TO_SHARD,
            paths::SHARD_TO_NODE,
        ] {
            self.ensure_path(root).await?;
        }
        Ok(())
    }

    // ==================== JSON helpers ====================

    pub async fn create_json<T: Serialize>(
        &self,
        path: &str,
        value: &T,
        mode: CreateMode,
    ) -> KattaResult<String> {
        self.create(path, serde_json::to_string(value)?, mode).await
    }

    pub async fn read_json<T: DeserializeOwned>(&self, path: &str) -> KattaResult<T> {
        let (data, _) = self.backend.read(path).await?;
        Ok(serde_json::from_str(&data)?)
    }

    pub async fn read_json_versioned<T: DeserializeOwned>(
        &self,
        path: &str,
    ) -> KattaResult<(T, u64)> {
        let (data, version) = self.backend.read(path).await?;
        Ok((serde_json::from_str(&data)?, version))
    }

    /// Versioned write; a stale writer gets `StoreConflict` instead of
    /// clobbering a newer value.
    pub async fn write_json_versioned<T: Serialize>(
        &self,
        path: &str,
        value: &T,
        expected_version: u64,
    ) -> KattaResult<()> {
        self.backend
            .write(path, serde_json::to_string(value)?, Some(expected_version))
            .await?;
        Ok(())
    }

    pub async fn write_json<T: Serialize>(&self, path: &str, value: &T) -> KattaResult<()> {
        self.backend
            .write(path, serde_json::to_string(value)?, None)
            .await?;
        Ok(())
    }

    /// Optimistic read-modify-write. The closure is re-applied on every
    /// conflict against a fresh read, so it must be a pure transition.
    pub async fn update_json<T, F>(&self, path: &str, mut apply: F) -> KattaResult<T>
    where
        T: Serialize + DeserializeOwned,
        F: FnMut(T) -> T,
    {
        let mut attempt = 0;
        loop {
            let (data, version) = self.backend.read(path).await?;
            let value: T = serde_json::from_str(&data)?;
            let updated = apply(value);
            match self
                .backend
                .write(path, serde_json::to_string(&updated)?, Some(version))
                .await
            {
                Ok(_) => return Ok(updated),
                Err(KattaError::StoreConflict(reason)) => {
                    attempt += 1;
                    if attempt >= UPDATE_RETRIES {
                        return Err(KattaError::StoreConflict(reason));
                    }
                }
                Err(err) => return Err(err),
            }
        }
    }

    // ==================== node descriptors ====================

    /// Register the ephemeral node descriptor. A leftover entry from a
    /// previous incarnation of the same node is replaced.
    pub async fn register_node(&self, name: &str, meta: &NodeMetaData) -> KattaResult<()> {
        let path = paths::node(name);
        let data = serde_json::to_string(meta)?;
        match self
            .create(&path, data.clone(), CreateMode::Ephemeral)
            .await
        {
            Ok(_) => Ok(()),
            Err(KattaError::PathExists(_)) => {
                tracing::info!(node = name, "Replacing stale node descriptor");
                self.delete(&path).await?;
                self.create(&path, data, CreateMode::Ephemeral).await?;
                Ok(())
            }
            Err(err) => Err(err),
        }
    }

    pub async fn update_node(&self, name: &str, meta: &NodeMetaData) -> KattaResult<()> {
        self.write_json(&paths::node(name), meta).await
    }

    pub async fn unregister_node(&self, name: &str) -> KattaResult<()> {
        match self.delete(&paths::node(name)).await {
            Ok(()) | Err(KattaError::PathNotFound(_)) => Ok(()),
            Err(err) => Err(err),
        }
    }

    pub async fn live_nodes(&self) -> KattaResult<Vec<String>> {
        self.children_or_empty(paths::NODES).await
    }

    pub async fn node_metadata(&self, name: &str) -> KattaResult<NodeMetaData> {
        self.read_json(&paths::node(name)).await
    }

    // ==================== master election ====================

    /// Try to take the election token. Returns false if another master
    /// holds it.
    pub async fn try_become_master(&self, name: &str) -> KattaResult<bool> {
        match self
            .create(paths::MASTER, name.to_string(), CreateMode::Ephemeral)
            .await
        {
            Ok(_) => Ok(true),
            Err(KattaError::PathExists(_)) => Ok(false),
            Err(err) => Err(err),
        }
    }

    pub async fn current_master(&self) -> KattaResult<Option<String>> {
        match self.backend.read(paths::MASTER).await {
            Ok((name, _)) => Ok(Some(name)),
            Err(KattaError::PathNotFound(_)) => Ok(None),
            Err(err) => Err(err),
        }
    }

    // ==================== indexes & shards ====================

    pub async fn announce_index(&self, name: &str, meta: &IndexMetaData) -> KattaResult<()> {
        self.create_json(&paths::index(name), meta, CreateMode::Persistent)
            .await?;
        Ok(())
    }

    pub async fn index_metadata(&self, name: &str) -> KattaResult<IndexMetaData> {
        self.read_json(&paths::index(name)).await
    }

    pub async fn write_index_metadata(
        &self,
        name: &str,
        meta: &IndexMetaData,
    ) -> KattaResult<()> {
        self.write_json(&paths::index(name), meta).await
    }

    pub async fn indexes(&self) -> KattaResult<Vec<String>> {
        self.children_or_empty(paths::INDEXES).await
    }

    pub async fn remove_index_metadata(&self, name: &str) -> KattaResult<()> {
        self.delete_recursive(&paths::index(name)).await
    }

    pub async fn announce_shard(
        &self,
        index: &str,
        shard: &str,
        meta: &ShardMetaData,
    ) -> KattaResult<()> {
        match self
            .create_json(&paths::index_shard(index, shard), meta, CreateMode::Persistent)
            .await
        {
            Ok(_) | Err(KattaError::PathExists(_)) => Ok(()),
            Err(err) => Err(err),
        }
    }

    pub async fn shards_of_index(&self, index: &str) -> KattaResult<Vec<String>> {
        self.children_or_empty(&paths::index(index)).await
    }

    pub async fn shard_metadata(&self, index: &str, shard: &str) -> KattaResult<ShardMetaData> {
        self.read_json(&paths::index_shard(index, shard)).await
    }

    // ==================== assignments ====================

    pub async fn assign_shard(&self, node: &str, shard: &str) -> KattaResult<()> {
        self.ensure_path(&paths::node_shards(node)).await?;
        // The deployment parent is pre-created so watchers never race a
        // missing path
        self.ensure_path(&paths::shard_nodes(shard)).await?;
        match self
            .create(
                &paths::node_shard(node, shard),
                String::new(),
                CreateMode::Persistent,
            )
            .await
        {
            Ok(_) | Err(KattaError::PathExists(_)) => Ok(()),
            Err(err) => Err(err),
        }
    }

    pub async fn unassign_shard(&self, node: &str, shard: &str) -> KattaResult<()> {
        match self.delete(&paths::node_shard(node, shard)).await {
            Ok(()) | Err(KattaError::PathNotFound(_)) => Ok(()),
            Err(err) => Err(err),
        }
    }

    pub async fn assignments(&self, node: &str) -> KattaResult<Vec<String>> {
        self.children_or_empty(&paths::node_shards(node)).await
    }

    pub async fn assignment_nodes(&self) -> KattaResult<Vec<String>> {
        self.children_or_empty(paths::NODE_TO_SHARD).await
    }

    // ==================== deployment records ====================

    pub async fn publish_deployment(
        &self,
        shard: &str,
        node: &str,
        record: &DeployedShard,
    ) -> KattaResult<()> {
        self.ensure_path(&paths::shard_nodes(shard)).await?;
        let path = paths::shard_node(shard, node);
        match self.create_json(&path, record, CreateMode::Persistent).await {
            Ok(_) => Ok(()),
            Err(KattaError::PathExists(_)) => self.write_json(&path, record).await,
            Err(err) => Err(err),
        }
    }

    pub async fn deployment(&self, shard: &str, node: &str) -> KattaResult<DeployedShard> {
        self.read_json(&paths::shard_node(shard, node)).await
    }

    pub async fn remove_deployment(&self, shard: &str, node: &str) -> KattaResult<()> {
        match self.delete(&paths::shard_node(shard, node)).await {
            Ok(()) | Err(KattaError::PathNotFound(_)) => Ok(()),
            Err(err) => Err(err),
        }
    }

    pub async fn nodes_serving(&self, shard: &str) -> KattaResult<Vec<String>> {
        self.children_or_empty(&paths::shard_nodes(shard)).await
    }

    pub async fn deployed_shards(&self) -> KattaResult<Vec<String>> {
        self.children_or_empty(paths::SHARD_TO_NODE).await
    }
}

impl Drop for MetaStore {
    fn drop(&mut self) {
        if let Some(pump) = self.pump.lock().take() {
            pump.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;

    async fn connected_store() -> (Arc<MemoryStore>, Arc<MetaStore>) {
        let backend = Arc::new(MemoryStore::new());
        let meta = MetaStore::connect(backend.clone(), Duration::from_millis(100))
            .await
            .unwrap();
        meta.create_default_structure().await.unwrap();
        (backend, meta)
    }

    #[tokio::test]
    async fn test_continuous_children_subscription() {
        let (_backend, meta) = connected_store().await;
        let mut sub = meta.subscribe_children(paths::NODES).await.unwrap();

        meta.register_node("n1", &NodeMetaData::new("localhost", 9000))
            .await
            .unwrap();
        let event = tokio::time::timeout(Duration::from_secs(2), sub.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(event.path(), paths::NODES);

        // The watch re-armed itself: a second change is observed too
        meta.register_node("n2", &NodeMetaData::new("localhost", 9001))
            .await
            .unwrap();
        let event = tokio::time::timeout(Duration::from_secs(2), sub.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(event.path(), paths::NODES);

        let mut nodes = meta.live_nodes().await.unwrap();
        nodes.sort();
        assert_eq!(nodes, vec!["n1", "n2"]);
    }

    #[tokio::test]
    async fn test_session_loss_surfaces_disconnect_then_reconnect() {
        let backend = Arc::new(MemoryStore::new());
        let meta = MetaStore::connect(
            backend.clone() as Arc<dyn StoreBackend>,
            Duration::from_millis(50),
        )
        .await
        .unwrap();
        meta.create_default_structure().await.unwrap();
        let mut session_events = meta.subscribe_session_events();
        let mut sub = meta.subscribe_children(paths::NODES).await.unwrap();

        let old_session = meta.session.read().clone();
        backend.expire_session(&old_session);

        let first = tokio::time::timeout(Duration::from_secs(2), session_events.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(first, SessionEvent::Disconnected);
        let second = tokio::time::timeout(Duration::from_secs(2), session_events.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(second, SessionEvent::Reconnected);

        // Subscriptions got a synthetic refresh event and keep working
        let refresh = tokio::time::timeout(Duration::from_secs(2), sub.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(refresh.path(), paths::NODES);
    }

    #[tokio::test]
    async fn test_update_json_applies_transition() {
        let (_backend, meta) = connected_store().await;
        let index = IndexMetaData::announced("/data/wiki", "simple", 2);
        meta.announce_index("wiki", &index).await.unwrap();

        let updated: IndexMetaData = meta
            .update_json(&paths::index("wiki"), |mut m: IndexMetaData| {
                m.state = crate::protocol::IndexState::Deploying;
                m
            })
            .await
            .unwrap();
        assert_eq!(updated.state, crate::protocol::IndexState::Deploying);

        let read_back = meta.index_metadata("wiki").await.unwrap();
        assert_eq!(read_back.state, crate::protocol::IndexState::Deploying);
    }

    #[tokio::test]
    async fn test_register_node_replaces_stale_descriptor() {
        let (_backend, meta) = connected_store().await;
        meta.register_node("n1", &NodeMetaData::new("a", 1))
            .await
            .unwrap();
        meta.register_node("n1", &NodeMetaData::new("b", 2))
            .await
            .unwrap();
        let read_back = meta.node_metadata("n1").await.unwrap();
        assert_eq!(read_back.host, "b");
    }

    #[tokio::test]
    async fn test_election_token() {
        let (_backend, meta) = connected_store().await;
        assert!(meta.try_become_master("m1").await.unwrap());
        assert!(!meta.try_become_master("m2").await.unwrap());
        assert_eq!(meta.current_master().await.unwrap().as_deref(), Some("m1"));
    }
}
