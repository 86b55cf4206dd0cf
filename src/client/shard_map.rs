//! Reactive view of the deployed cluster.
//!
//! Tracks which shards have OPEN replicas on which nodes, node RPC
//! addresses and the index-to-shard mapping. Watches on `/shard-to-node`,
//! `/nodes` and `/indexes` coalesce into a single refresh loop that
//! rebuilds the snapshot from current store state, so updates are
//! level-triggered and safe to deliver more than once. Construction
//! blocks until the first snapshot is loaded.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use tokio::sync::mpsc::{unbounded_channel, UnboundedSender};

use crate::error::KattaResult;
use crate::protocol::DeployState;
use crate::store::{paths, MetaStore, WatchKind};

#[derive(Default, Clone)]
struct Snapshot {
    /// shard -> node names with an OPEN replica, sorted
    replicas: HashMap<String, Vec<String>>,
    /// node name -> RPC address
    nodes: HashMap<String, String>,
    /// index -> its full shard set
    indexes: HashMap<String, Vec<String>>,
}

pub struct ShardMap {
    meta: Arc<MetaStore>,
    snapshot: RwLock<Snapshot>,
    watched: Mutex<HashSet<(WatchKind, String)>>,
    refresh_tx: UnboundedSender<()>,
    tasks: Mutex<Vec<tokio::task::JoinHandle<()>>>,
}

impl ShardMap {
    pub async fn start(meta: Arc<MetaStore>) -> KattaResult<Arc<Self>> {
        let (refresh_tx, mut refresh_rx) = unbounded_channel();
        let map = Arc::new(Self {
            meta,
            snapshot: RwLock::new(Snapshot::default()),
            watched: Mutex::new(HashSet::new()),
            refresh_tx,
            tasks: Mutex::new(Vec::new()),
        });

        for root in [paths::SHARD_TO_NODE, paths::NODES, paths::INDEXES] {
            map.ensure_watch(WatchKind::Children, root).await?;
        }
        map.refresh().await?;

        let refresher = Arc::clone(&map);
        let task = tokio::spawn(async move {
            while refresh_rx.recv().await.is_some() {
                // Coalesce a burst of events into one rebuild
                while refresh_rx.try_recv().is_ok() {}
                if let Err(err) = refresher.refresh().await {
                    tracing::warn!(error = %err, "Shard map refresh failed");
                }
            }
        });
        map.tasks.lock().push(task);
        Ok(map)
    }

    async fn ensure_watch(&self, kind: WatchKind, path: &str) -> KattaResult<()> {
        if !self.watched.lock().insert((kind, path.to_string())) {
            return Ok(());
        }
        let mut sub = match kind {
            WatchKind::Children => self.meta.subscribe_children(path).await?,
            WatchKind::Data => self.meta.subscribe_data(path).await?,
        };
        let tx = self.refresh_tx.clone();
        let task = tokio::spawn(async move {
            while sub.recv().await.is_some() {
                if tx.send(()).is_err() {
                    break;
                }
            }
        });
        self.tasks.lock().push(task);
        Ok(())
    }

    /// Rebuild the snapshot from current store state and widen the watch
    /// set to any shards, records or indexes seen for the first time.
    async fn refresh(&self) -> KattaResult<()> {
        let mut replicas = HashMap::new();
        for shard in self.meta.deployed_shards().await? {
            self.ensure_watch(WatchKind::Children, &paths::shard_nodes(&shard))
                .await?;
            let mut open = Vec::new();
            for node in self.meta.nodes_serving(&shard).await? {
                self.ensure_watch(WatchKind::Data, &paths::shard_node(&shard, &node))
                    .await?;
                if let Ok(record) = self.meta.deployment(&shard, &node).await {
                    if record.state == DeployState::Open {
                        open.push(node);
                    }
                }
            }
            if !open.is_empty() {
                open.sort();
                replicas.insert(shard, open);
            }
        }

        let mut nodes = HashMap::new();
        for node in self.meta.live_nodes().await? {
            if let Ok(descriptor) = self.meta.node_metadata(&node).await {
                nodes.insert(node, descriptor.addr());
            }
        }

        let mut indexes = HashMap::new();
        for index in self.meta.indexes().await? {
            self.ensure_watch(WatchKind::Children, &paths::index(&index))
                .await?;
            indexes.insert(index.clone(), self.meta.shards_of_index(&index).await?);
        }

        *self.snapshot.write() = Snapshot {
            replicas,
            nodes,
            indexes,
        };
        Ok(())
    }

    /// Nodes with an OPEN replica of the shard, sorted by name.
    pub fn replicas(&self, shard: &str) -> Vec<String> {
        self.snapshot
            .read()
            .replicas
            .get(shard)
            .cloned()
            .unwrap_or_default()
    }

    pub fn node_addr(&self, node: &str) -> Option<String> {
        self.snapshot.read().nodes.get(node).cloned()
    }

    pub fn indexes(&self) -> Vec<String> {
        let mut names: Vec<String> = self.snapshot.read().indexes.keys().cloned().collect();
        names.sort();
        names
    }

    /// The shard set of one index; `None` when the index is unknown.
    pub fn shards_of_index(&self, index: &str) -> Option<Vec<String>> {
        self.snapshot.read().indexes.get(index).cloned()
    }

    pub fn stop(&self) {
        for task in self.tasks.lock().drain(..) {
            task.abort();
        }
    }
}

impl Drop for ShardMap {
    fn drop(&mut self) {
        self.stop();
    }
}
