//! Master / placement controller.
//!
//! One active master holds the ephemeral election token; stand-bys watch
//! it and re-run the election when it disappears. The active master is a
//! reducer over store events: node and index changes plus per-shard
//! deployment reports are funnelled into one operator queue, and every
//! placement decision happens serially on that queue. Assignments live in
//! the store, so a failed-over master picks up mid-flight deploys from
//! whatever state it finds.

pub mod placement;

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::mpsc::{unbounded_channel, UnboundedSender};

use crate::config::KattaConfig;
use crate::error::{KattaError, KattaResult};
use crate::protocol::{
    index_of_shard, shard_name, DeployState, IndexMetaData, IndexState, ShardMetaData,
};
use crate::store::{paths, MetaStore, SessionEvent, StoreBackend, WatchKind};

#[derive(Debug, Clone)]
enum MasterEvent {
    NodesChanged,
    IndexesChanged,
    IndexChanged(String),
    ShardReportChanged(String),
    Deposed,
}

pub struct Master {
    name: String,
    meta: Arc<MetaStore>,
    active: AtomicBool,
    tasks: Mutex<Vec<tokio::task::JoinHandle<()>>>,
}

impl Master {
    pub async fn start(
        backend: Arc<dyn StoreBackend>,
        config: KattaConfig,
        name: &str,
    ) -> KattaResult<Arc<Self>> {
        let meta = MetaStore::connect(backend, Duration::from_millis(config.poll_timeout_ms))
            .await?;
        meta.create_default_structure().await?;
        let master = Arc::new(Self {
            name: name.to_string(),
            meta,
            active: AtomicBool::new(false),
            tasks: Mutex::new(Vec::new()),
        });
        let election = tokio::spawn(election_loop(Arc::clone(&master)));
        master.tasks.lock().push(election);
        Ok(master)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::SeqCst)
    }

    pub fn meta_store(&self) -> &Arc<MetaStore> {
        &self.meta
    }

    /// Graceful shutdown: the election token is released with the session
    /// and a standby takes over.
    pub async fn shutdown(&self) {
        for task in self.tasks.lock().drain(..) {
            task.abort();
        }
        self.active.store(false, Ordering::SeqCst);
        self.meta.close().await;
    }

    /// Simulate an unclean death; the token lingers until the session
    /// expires.
    pub fn kill(&self) {
        for task in self.tasks.lock().drain(..) {
            task.abort();
        }
        self.active.store(false, Ordering::SeqCst);
        self.meta.abandon();
    }
}

async fn election_loop(master: Arc<Master>) {
    loop {
        match master.meta.try_become_master(&master.name).await {
            Ok(true) => {
                tracing::info!(master = %master.name, "Elected as active master");
                master.active.store(true, Ordering::SeqCst);
                run_active(&master).await;
                master.active.store(false, Ordering::SeqCst);
                tracing::info!(master = %master.name, "Master deactivated");
            }
            Ok(false) => {
                tracing::info!(master = %master.name, "Standing by");
                wait_for_token_release(&master).await;
            }
            Err(err) => {
                tracing::warn!(error = %err, "Election attempt failed");
                tokio::time::sleep(Duration::from_secs(1)).await;
            }
        }
    }
}

/// Block until the election token disappears. Re-checks periodically so a
/// missed watch event cannot wedge the standby.
async fn wait_for_token_release(master: &Arc<Master>) {
    let mut sub = match master.meta.subscribe_data(paths::MASTER).await {
        Ok(sub) => sub,
        Err(_) => {
            tokio::time::sleep(Duration::from_secs(1)).await;
            return;
        }
    };
    loop {
        let received = tokio::time::timeout(Duration::from_secs(5), sub.recv()).await;
        if let Ok(None) = received {
            return;
        }
        match master.meta.current_master().await {
            Ok(None) => return,
            Ok(Some(_)) => {}
            Err(_) => {
                tokio::time::sleep(Duration::from_secs(1)).await;
                return;
            }
        }
    }
}

/// Drive the operator queue until deposed.
async fn run_active(master: &Arc<Master>) {
    let (tx, mut rx) = unbounded_channel();

    let mut session_sub = master.meta.subscribe_session_events();
    let session_tx = tx.clone();
    let session_task = tokio::spawn(async move {
        while let Some(event) = session_sub.recv().await {
            // Whether the token survived the outage is unknowable, so the
            // master steps down and re-elects from scratch
            if event == SessionEvent::Disconnected {
                let _ = session_tx.send(MasterEvent::Deposed);
            }
        }
    });

    let mut operator = Operator {
        meta: Arc::clone(&master.meta),
        tx: tx.clone(),
        watched: HashSet::new(),
        forwarders: Vec::new(),
        known_nodes: HashSet::new(),
        known_indexes: HashSet::new(),
    };

    if let Err(err) = operator.bootstrap().await {
        tracing::error!(error = %err, "Master bootstrap failed");
    }

    while let Some(event) = rx.recv().await {
        let outcome = match event {
            MasterEvent::Deposed => break,
            MasterEvent::NodesChanged => operator.on_nodes_changed().await,
            MasterEvent::IndexesChanged => operator.on_indexes_changed().await,
            MasterEvent::IndexChanged(index) => operator.check_index(&index).await,
            MasterEvent::ShardReportChanged(shard) => {
                let index = index_of_shard(&shard).to_string();
                operator.check_index(&index).await
            }
        };
        if let Err(err) = outcome {
            tracing::warn!(error = %err, "Master event handling failed");
        }
    }

    session_task.abort();
    for forwarder in operator.forwarders.drain(..) {
        forwarder.abort();
    }
}

/// The single-task reducer owning all placement decisions.
struct Operator {
    meta: Arc<MetaStore>,
    tx: UnboundedSender<MasterEvent>,
    watched: HashSet<(WatchKind, String)>,
    forwarders: Vec<tokio::task::JoinHandle<()>>,
    known_nodes: HashSet<String>,
    known_indexes: HashSet<String>,
}

impl Operator {
    /// Initial reconciliation: arm the root watches, prune assignments of
    /// nodes that died while no master ran, adopt every declared index.
    async fn bootstrap(&mut self) -> KattaResult<()> {
        self.forward(WatchKind::Children, paths::NODES, MasterEvent::NodesChanged)
            .await?;
        self.forward(
            WatchKind::Children,
            paths::INDEXES,
            MasterEvent::IndexesChanged,
        )
        .await?;

        self.known_nodes = self.meta.live_nodes().await?.into_iter().collect();
        for node in self.meta.assignment_nodes().await? {
            if !self.known_nodes.contains(&node) {
                tracing::info!(node = %node, "Pruning assignments of dead node");
                self.release_node(&node).await?;
            }
        }

        self.known_indexes.clear();
        self.on_indexes_changed().await
    }

    /// Subscribe once per (kind, path) and forward every event into the
    /// operator queue.
    async fn forward(
        &mut self,
        kind: WatchKind,
        path: &str,
        event: MasterEvent,
    ) -> KattaResult<()> {
        if !self.watched.insert((kind, path.to_string())) {
            return Ok(());
        }
        let mut sub = match kind {
            WatchKind::Children => self.meta.subscribe_children(path).await?,
            WatchKind::Data => self.meta.subscribe_data(path).await?,
        };
        let tx = self.tx.clone();
        self.forwarders.push(tokio::spawn(async move {
            while sub.recv().await.is_some() {
                if tx.send(event.clone()).is_err() {
                    break;
                }
            }
        }));
        Ok(())
    }

    async fn on_nodes_changed(&mut self) -> KattaResult<()> {
        let live: HashSet<String> = self.meta.live_nodes().await?.into_iter().collect();
        let removed: Vec<String> = self.known_nodes.difference(&live).cloned().collect();
        let added: Vec<String> = live.difference(&self.known_nodes).cloned().collect();
        self.known_nodes = live;

        for node in &removed {
            tracing::warn!(node = %node, "Node disappeared");
            self.release_node(node).await?;
        }
        for node in &added {
            tracing::info!(node = %node, "Node joined");
        }
        if !removed.is_empty() || !added.is_empty() {
            for index in self.meta.indexes().await? {
                self.check_index(&index).await?;
            }
        }
        Ok(())
    }

    /// Drop every trace of a dead node: assignment entries and deployment
    /// records. Under-replication repair happens in `check_index`.
    async fn release_node(&mut self, node: &str) -> KattaResult<()> {
        for shard in self.meta.assignments(node).await? {
            self.meta.unassign_shard(node, &shard).await?;
            self.meta.remove_deployment(&shard, node).await?;
        }
        let _ = self.meta.delete_recursive(&paths::node_shards(node)).await;
        Ok(())
    }

    async fn on_indexes_changed(&mut self) -> KattaResult<()> {
        let declared: HashSet<String> = self.meta.indexes().await?.into_iter().collect();
        let removed: Vec<String> = self.known_indexes.difference(&declared).cloned().collect();
        let added: Vec<String> = declared.difference(&self.known_indexes).cloned().collect();
        self.known_indexes = declared;

        for index in &removed {
            self.cleanup_index(index).await?;
        }
        for index in &added {
            self.forward(
                WatchKind::Data,
                &paths::index(index),
                MasterEvent::IndexChanged(index.clone()),
            )
            .await?;
            self.check_index(index).await?;
        }
        Ok(())
    }

    /// The index metadata is gone; retract its assignments so nodes
    /// unload the shards, and clear the deployment records.
    async fn cleanup_index(&mut self, index: &str) -> KattaResult<()> {
        tracing::info!(index, "Removing index");
        for node in self.meta.assignment_nodes().await? {
            for shard in self.meta.assignments(&node).await? {
                if index_of_shard(&shard) == index {
                    self.meta.unassign_shard(&node, &shard).await?;
                }
            }
        }
        for shard in self.meta.deployed_shards().await? {
            if index_of_shard(&shard) == index {
                self.meta
                    .delete_recursive(&paths::shard_nodes(&shard))
                    .await?;
            }
        }
        Ok(())
    }

    /// Reconcile one index against its target: enumerate shards, repair
    /// placement, aggregate replica reports, advance the state machine.
    /// Idempotent; called for every event that could affect the index.
    async fn check_index(&mut self, index: &str) -> KattaResult<()> {
        let (mut index_meta, version) = match self
            .meta
            .read_json_versioned::<IndexMetaData>(&paths::index(index))
            .await
        {
            Ok(read) => read,
            Err(KattaError::PathNotFound(_)) => return Ok(()),
            Err(err) => return Err(err),
        };

        let mut shards = self.meta.shards_of_index(index).await?;
        if shards.is_empty() {
            match self.enumerate_shards(index, &index_meta).await {
                Ok(found) if !found.is_empty() => shards = found,
                Ok(_) => {
                    return self
                        .fail_index(index, version, index_meta, "index has no shard folders")
                        .await;
                }
                Err(err) => {
                    return self
                        .fail_index(index, version, index_meta, &err.to_string())
                        .await;
                }
            }
        }

        let mut live: Vec<String> = self.known_nodes.iter().cloned().collect();
        live.sort();
        if live.is_empty() {
            tracing::warn!(index, "No live nodes, deployment waits");
            return Ok(());
        }
        let target = placement::replication_target(index_meta.replication_level, live.len());

        let mut node_assignments: HashMap<String, HashSet<String>> = HashMap::new();
        let mut loads: HashMap<String, usize> = HashMap::new();
        for node in &live {
            let assigned: HashSet<String> =
                self.meta.assignments(node).await?.into_iter().collect();
            loads.insert(node.clone(), assigned.len());
            node_assignments.insert(node.clone(), assigned);
        }

        let mut all_open = true;
        let mut stuck = false;
        let mut first_error: Option<String> = None;

        for shard in &shards {
            self.forward(
                WatchKind::Children,
                &paths::shard_nodes(shard),
                MasterEvent::ShardReportChanged(shard.clone()),
            )
            .await?;

            let assigned: HashSet<String> = live
                .iter()
                .filter(|node| node_assignments[*node].contains(shard))
                .cloned()
                .collect();

            let mut open_count = 0usize;
            let mut error_count = 0usize;
            for node in &assigned {
                self.forward(
                    WatchKind::Data,
                    &paths::shard_node(shard, node),
                    MasterEvent::ShardReportChanged(shard.clone()),
                )
                .await?;
                match self.meta.deployment(shard, node).await {
                    Ok(record) => match record.state {
                        DeployState::Open => open_count += 1,
                        DeployState::Error => {
                            error_count += 1;
                            if first_error.is_none() {
                                first_error = Some(
                                    record
                                        .error_message
                                        .unwrap_or_else(|| "shard deploy failed".to_string()),
                                );
                            }
                        }
                        DeployState::Assigned | DeployState::Fetching => {}
                    },
                    Err(KattaError::PathNotFound(_)) => {}
                    Err(err) => return Err(err),
                }
            }

            // Erroring nodes keep their assignment (the ERROR record stays
            // inspectable) but do not count towards the target; spares are
            // nodes without any copy, so a failed node is never re-picked
            let mut healthy = assigned.len() - error_count;
            let mut exclude = assigned.clone();
            while healthy < target {
                let Some(candidate) = placement::pick_least_loaded(&loads, &exclude) else {
                    if error_count > 0 {
                        stuck = true;
                    }
                    break;
                };
                tracing::info!(shard = %shard, node = %candidate, "Assigning shard replica");
                self.meta.assign_shard(&candidate, shard).await?;
                self.forward(
                    WatchKind::Data,
                    &paths::shard_node(shard, &candidate),
                    MasterEvent::ShardReportChanged(shard.clone()),
                )
                .await?;
                *loads.entry(candidate.clone()).or_insert(0) += 1;
                node_assignments
                    .entry(candidate.clone())
                    .or_default()
                    .insert(shard.clone());
                exclude.insert(candidate);
                healthy += 1;
            }

            if open_count < target {
                all_open = false;
            }
        }

        let next_state = match index_meta.state {
            IndexState::Announced => Some(IndexState::Deploying),
            IndexState::Deploying => {
                if all_open {
                    Some(IndexState::Deployed)
                } else if stuck {
                    Some(IndexState::DeployError)
                } else {
                    None
                }
            }
            IndexState::Deployed => {
                if all_open {
                    None
                } else {
                    Some(IndexState::Replicating)
                }
            }
            IndexState::Replicating => {
                if all_open {
                    Some(IndexState::Deployed)
                } else {
                    None
                }
            }
            IndexState::DeployError => {
                if all_open {
                    Some(IndexState::Deployed)
                } else {
                    None
                }
            }
        };

        if let Some(state) = next_state {
            index_meta.state = state;
            index_meta.error_message = if state == IndexState::DeployError {
                first_error
            } else {
                None
            };
            match self
                .meta
                .write_json_versioned(&paths::index(index), &index_meta, version)
                .await
            {
                Ok(()) => {
                    tracing::info!(index, state = %state, "Index state advanced");
                }
                Err(KattaError::StoreConflict(_)) => {
                    // Someone moved the metadata under us; re-evaluate
                    let _ = self.tx.send(MasterEvent::IndexChanged(index.to_string()));
                }
                Err(err) => return Err(err),
            }
        }
        Ok(())
    }

    /// Derive the shard set from the index source: one shard per
    /// subdirectory. Happens once; the shard children are the durable
    /// record from then on.
    async fn enumerate_shards(
        &self,
        index: &str,
        index_meta: &IndexMetaData,
    ) -> KattaResult<Vec<String>> {
        let source = index_meta
            .path
            .strip_prefix("file://")
            .unwrap_or(&index_meta.path)
            .to_string();
        let mut entries = tokio::fs::read_dir(&source).await.map_err(|e| {
            KattaError::DeployFailure(format!("cannot read index source {}: {}", source, e))
        })?;
        let mut found = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            if entry.file_type().await?.is_dir() {
                let folder = entry.file_name().to_string_lossy().to_string();
                let shard = shard_name(index, &folder);
                let shard_meta = ShardMetaData {
                    path: entry.path().display().to_string(),
                };
                self.meta.announce_shard(index, &shard, &shard_meta).await?;
                found.push(shard);
            }
        }
        found.sort();
        tracing::info!(index, shards = found.len(), "Shards enumerated");
        Ok(found)
    }

    async fn fail_index(
        &self,
        index: &str,
        version: u64,
        mut index_meta: IndexMetaData,
        message: &str,
    ) -> KattaResult<()> {
        if index_meta.state == IndexState::DeployError
            && index_meta.error_message.as_deref() == Some(message)
        {
            return Ok(());
        }
        tracing::error!(index, error = message, "Index deploy failed");
        index_meta.state = IndexState::DeployError;
        index_meta.error_message = Some(message.to_string());
        match self
            .meta
            .write_json_versioned(&paths::index(index), &index_meta, version)
            .await
        {
            Ok(()) => Ok(()),
            Err(KattaError::StoreConflict(_)) => {
                let _ = self.tx.send(MasterEvent::IndexChanged(index.to_string()));
                Ok(())
            }
            Err(err) => Err(err),
        }
    }
}
