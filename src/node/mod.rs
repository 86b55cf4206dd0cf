//! Worker node.
//!
//! Hosts a set of shard replicas and serves the search RPCs. Startup
//! order matters: the RPC server comes up first, then the ephemeral
//! descriptor is registered, then the assignment folder is watched, and
//! only then does the node flag itself healthy.

pub mod search;
pub mod server;
pub mod shard_manager;

pub use search::{SearchService, SearchStats};
pub use shard_manager::ShardManager;

use std::collections::HashSet;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::watch;

use crate::config::KattaConfig;
use crate::engine::IndexEngine;
use crate::error::KattaResult;
use crate::protocol::{index_of_shard, DeployedShard, NodeMetaData};
use crate::store::{paths, MetaStore, SessionEvent, StoreBackend};

pub struct Node {
    name: String,
    meta: Arc<MetaStore>,
    shards: Arc<ShardManager>,
    service: Arc<SearchService>,
    addr: SocketAddr,
    config: KattaConfig,
    tasks: Mutex<Vec<tokio::task::JoinHandle<()>>>,
    shutdown_tx: watch::Sender<bool>,
}

impl Node {
    /// Bring a node up: RPC server, ephemeral registration, assignment
    /// subscription, healthy flag. `port` 0 binds an ephemeral port.
    pub async fn start(
        backend: Arc<dyn StoreBackend>,
        engine: Arc<dyn IndexEngine>,
        config: KattaConfig,
        name: &str,
        host: &str,
        port: u16,
    ) -> KattaResult<Arc<Self>> {
        // 1. RPC server
        let work_dir = PathBuf::from(&config.work_dir).join(name).join("shards");
        tokio::fs::create_dir_all(&work_dir).await?;
        let shards = Arc::new(ShardManager::new(engine, &work_dir));
        let service = Arc::new(SearchService::new(
            name,
            Arc::clone(&shards),
            config.search_permits,
            config.filter_cache_capacity,
            Duration::from_secs(config.filter_cache_ttl_secs),
            config.shard_timeout_fraction,
        ));

        let listener = tokio::net::TcpListener::bind((host, port)).await?;
        let addr = listener.local_addr()?;
        let (shutdown_tx, mut shutdown_rx) = watch::channel(false);
        let router = server::create_node_router(Arc::clone(&service));
        let rpc_task = tokio::spawn(async move {
            let shutdown = async move {
                let _ = shutdown_rx.changed().await;
            };
            if let Err(err) = axum::serve(listener, router)
                .with_graceful_shutdown(shutdown)
                .await
            {
                tracing::error!(error = %err, "Node RPC server failed");
            }
        });
        tracing::info!(node = name, %addr, "Node RPC server listening");

        // 2. Ephemeral registration
        let meta = MetaStore::connect(backend, Duration::from_millis(config.poll_timeout_ms))
            .await?;
        meta.create_default_structure().await?;
        let descriptor = NodeMetaData::new(host, addr.port());
        meta.register_node(name, &descriptor).await?;
        meta.ensure_path(&paths::node_shards(name)).await?;

        // 3. Assignment subscription
        let mut assignment_sub = meta.subscribe_children(&paths::node_shards(name)).await?;
        let mut session_sub = meta.subscribe_session_events();

        let node = Arc::new(Self {
            name: name.to_string(),
            meta,
            shards,
            service,
            addr,
            config,
            tasks: Mutex::new(vec![rpc_task]),
            shutdown_tx,
        });

        node.sync_assignments().await?;

        // 4. Healthy
        let mut descriptor = descriptor;
        descriptor.healthy = true;
        descriptor.status = "running".to_string();
        node.meta.update_node(name, &descriptor).await?;

        let assignment_node = Arc::clone(&node);
        let assignment_task = tokio::spawn(async move {
            while let Some(event) = assignment_sub.recv().await {
                tracing::debug!(node = %assignment_node.name, path = event.path(), "Assignments changed");
                if let Err(err) = assignment_node.sync_assignments().await {
                    tracing::warn!(node = %assignment_node.name, error = %err, "Assignment sync failed");
                }
            }
        });

        let session_node = Arc::clone(&node);
        let session_task = tokio::spawn(async move {
            while let Some(event) = session_sub.recv().await {
                match event {
                    SessionEvent::Disconnected => {
                        tracing::warn!(node = %session_node.name, "Store connection lost");
                    }
                    SessionEvent::Reconnected => {
                        if let Err(err) = session_node.recover_registration().await {
                            tracing::error!(node = %session_node.name, error = %err, "Re-registration failed");
                        }
                    }
                }
            }
        });

        node.tasks.lock().push(assignment_task);
        node.tasks.lock().push(session_task);
        tracing::info!(node = name, "Node started");
        Ok(node)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn rpc_addr(&self) -> SocketAddr {
        self.addr
    }

    pub fn meta_store(&self) -> &Arc<MetaStore> {
        &self.meta
    }

    pub fn search_service(&self) -> &Arc<SearchService> {
        &self.service
    }

    pub fn open_shards(&self) -> Vec<String> {
        self.shards.shard_names()
    }

    /// Diff the assignment folder against the open shards and converge.
    /// Safe to re-run at any time; every step is idempotent.
    async fn sync_assignments(&self) -> KattaResult<()> {
        let target: HashSet<String> = self.meta.assignments(&self.name).await?.into_iter().collect();
        let current: HashSet<String> = self.shards.shard_names().into_iter().collect();

        for shard in target.difference(&current) {
            self.deploy_shard(shard).await;
        }
        for shard in current.difference(&target) {
            self.undeploy_shard(shard).await;
        }
        Ok(())
    }

    /// Fetch and open one shard, reporting progress through its
    /// deployment record. Failures are retried with exponential backoff;
    /// a terminal failure leaves an ERROR record for inspection.
    async fn deploy_shard(&self, shard: &str) {
        if let Err(err) = self
            .meta
            .publish_deployment(shard, &self.name, &DeployedShard::fetching())
            .await
        {
            tracing::warn!(shard, error = %err, "Could not publish fetching state");
        }

        let source = async {
            let index = index_of_shard(shard);
            let index_meta = self.meta.index_metadata(index).await?;
            let shard_meta = self.meta.shard_metadata(index, shard).await?;
            Ok::<_, crate::error::KattaError>((shard_meta.path, index_meta.analyzer))
        }
        .await;

        let (path, analyzer) = match source {
            Ok(resolved) => resolved,
            Err(err) => {
                tracing::error!(shard, error = %err, "Shard metadata unreadable");
                let record = DeployedShard::error(err.to_string());
                let _ = self.meta.publish_deployment(shard, &self.name, &record).await;
                return;
            }
        };

        let mut last_error = String::new();
        for attempt in 0..self.config.deploy_retry_max {
            if attempt > 0 {
                let backoff = self.config.deploy_retry_base_ms * (1 << (attempt - 1));
                tokio::time::sleep(Duration::from_millis(backoff)).await;
            }
            match self.shards.install(shard, &path, &analyzer).await {
                Ok(num_docs) => {
                    let record = DeployedShard::open(num_docs);
                    if let Err(err) =
                        self.meta.publish_deployment(shard, &self.name, &record).await
                    {
                        tracing::warn!(shard, error = %err, "Could not publish open state");
                    }
                    return;
                }
                Err(err) => {
                    tracing::warn!(shard, attempt, error = %err, "Shard deploy attempt failed");
                    last_error = err.to_string();
                }
            }
        }

        tracing::error!(shard, error = %last_error, "Shard deploy failed terminally");
        let record = DeployedShard::error(last_error);
        let _ = self.meta.publish_deployment(shard, &self.name, &record).await;
    }

    async fn undeploy_shard(&self, shard: &str) {
        self.shards.remove(shard).await;
        if let Err(err) = self.meta.remove_deployment(shard, &self.name).await {
            tracing::warn!(shard, error = %err, "Could not remove deployment record");
        }
    }

    /// After a session loss the descriptor and any pruned deployment
    /// records are gone; rebuild them and re-converge.
    async fn recover_registration(&self) -> KattaResult<()> {
        tracing::info!(node = %self.name, "Store session back, re-registering");
        let mut descriptor = NodeMetaData::new(&self.addr.ip().to_string(), self.addr.port());
        descriptor.healthy = true;
        descriptor.status = "running".to_string();
        self.meta.register_node(&self.name, &descriptor).await?;
        self.meta.ensure_path(&paths::node_shards(&self.name)).await?;

        for shard in self.shards.shard_names() {
            if let Ok(reader) = self.shards.reader(&shard) {
                let record = DeployedShard::open(reader.num_docs());
                self.meta.publish_deployment(&shard, &self.name, &record).await?;
            }
        }
        self.sync_assignments().await
    }

    /// Clean shutdown: descriptor and deployment records removed, RPC
    /// server drained, readers closed.
    pub async fn shutdown(&self) {
        tracing::info!(node = %self.name, "Node shutting down");
        for task in self.tasks.lock().drain(..) {
            task.abort();
        }
        let _ = self.meta.unregister_node(&self.name).await;
        for shard in self.shards.shard_names() {
            let _ = self.meta.remove_deployment(&shard, &self.name).await;
        }
        let _ = self.shutdown_tx.send(true);
        self.shards.remove_all().await;
        self.meta.close().await;
    }

    /// Drain the RPC server only; registration and shard records stay.
    /// Queries against this node fail until it is restarted.
    pub fn stop_rpc(&self) {
        let _ = self.shutdown_tx.send(true);
    }

    /// Simulate an unclean death: everything stops immediately and the
    /// store session is left to expire, which is what announces the
    /// failure to the rest of the cluster.
    pub fn kill(&self) {
        tracing::info!(node = %self.name, "Node killed");
        for task in self.tasks.lock().drain(..) {
            task.abort();
        }
        self.meta.abandon();
        let _ = self.shutdown_tx.send(true);
    }
}
