//! In-process cluster harness: one shared embedded store, real master,
//! node and client instances wired to it.

#![allow(dead_code)]

use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use katta::protocol::{DeployState, IndexMetaData, IndexState};
use katta::store::{MemoryStore, MetaStore, StoreBackend};
use katta::{InvertedEngine, KattaClient, KattaConfig, Master, Node};

pub struct TestCluster {
    pub store: Arc<MemoryStore>,
    pub config: KattaConfig,
    pub admin: Arc<MetaStore>,
    pub masters: Vec<Arc<Master>>,
    pub nodes: Vec<Arc<Node>>,
    pub scratch: tempfile::TempDir,
}

pub fn test_config(scratch: &tempfile::TempDir) -> KattaConfig {
    KattaConfig {
        work_dir: scratch.path().join("work").display().to_string(),
        session_timeout_ms: 2_000,
        poll_timeout_ms: 200,
        deploy_retry_max: 2,
        deploy_retry_base_ms: 50,
        query_timeout_ms: 5_000,
        ..KattaConfig::default()
    }
}

impl TestCluster {
    pub async fn start(node_count: usize) -> Self {
        Self::start_with_engine(node_count, Arc::new(InvertedEngine)).await
    }

    pub async fn start_with_engine(
        node_count: usize,
        engine: Arc<dyn katta::engine::IndexEngine>,
    ) -> Self {
        let scratch = tempfile::tempdir().unwrap();
        let store = Arc::new(MemoryStore::new());
        let _ = store.start_expiry(Duration::from_millis(2_000));
        let config = test_config(&scratch);

        let admin = MetaStore::connect(
            store.clone() as Arc<dyn StoreBackend>,
            Duration::from_millis(config.poll_timeout_ms),
        )
        .await
        .unwrap();
        admin.create_default_structure().await.unwrap();

        let master = Master::start(
            store.clone() as Arc<dyn StoreBackend>,
            config.clone(),
            "master-0",
        )
        .await
        .unwrap();

        let mut nodes = Vec::new();
        for i in 0..node_count {
            let node = Node::start(
                store.clone() as Arc<dyn StoreBackend>,
                Arc::clone(&engine),
                config.clone(),
                &format!("node-{}", i),
                "127.0.0.1",
                0,
            )
            .await
            .unwrap();
            nodes.push(node);
        }

        Self {
            store,
            config,
            admin,
            masters: vec![master],
            nodes,
            scratch,
        }
    }

    pub async fn start_standby_master(&mut self, name: &str) -> Arc<Master> {
        let master = Master::start(
            self.store.clone() as Arc<dyn StoreBackend>,
            self.config.clone(),
            name,
        )
        .await
        .unwrap();
        self.masters.push(Arc::clone(&master));
        master
    }

    pub async fn start_node(&mut self, name: &str) -> Arc<Node> {
        let node = Node::start(
            self.store.clone() as Arc<dyn StoreBackend>,
            Arc::new(InvertedEngine),
            self.config.clone(),
            name,
            "127.0.0.1",
            0,
        )
        .await
        .unwrap();
        self.nodes.push(Arc::clone(&node));
        node
    }

    /// Write shard folders under the scratch dir and announce the index.
    pub async fn add_index(
        &self,
        name: &str,
        shard_docs: &[Vec<serde_json::Value>],
        replication: u32,
    ) -> PathBuf {
        let index_dir = self.scratch.path().join("indexes").join(name);
        for (i, docs) in shard_docs.iter().enumerate() {
            let shard_dir = index_dir.join(format!("part-{:04}", i));
            std::fs::create_dir_all(&shard_dir).unwrap();
            for (j, doc) in docs.iter().enumerate() {
                std::fs::write(
                    shard_dir.join(format!("doc-{:04}.json", j)),
                    doc.to_string(),
                )
                .unwrap();
            }
        }
        let meta = IndexMetaData::announced(
            index_dir.to_str().unwrap(),
            "simple",
            replication,
        );
        self.admin.announce_index(name, &meta).await.unwrap();
        index_dir
    }

    pub async fn client(&self) -> Arc<KattaClient> {
        KattaClient::connect(
            self.store.clone() as Arc<dyn StoreBackend>,
            self.config.clone(),
        )
        .await
        .unwrap()
    }

    /// Simulate an unclean node death with a deterministic failure
    /// signal: everything on the node stops and its session is expired.
    pub fn kill_node(&self, node: &Arc<Node>) {
        let session = node.meta_store().session_id();
        node.kill();
        self.store.expire_session(&session);
    }

    pub fn kill_master(&self, master: &Arc<Master>) {
        let session = master.meta_store().session_id();
        master.kill();
        self.store.expire_session(&session);
    }

    pub async fn index_state(&self, index: &str) -> IndexState {
        self.admin.index_metadata(index).await.unwrap().state
    }

    pub async fn wait_for_index_state(
        &self,
        index: &str,
        state: IndexState,
        timeout: Duration,
    ) -> bool {
        let deadline = Instant::now() + timeout;
        while Instant::now() < deadline {
            if let Ok(meta) = self.admin.index_metadata(index).await {
                if meta.state == state {
                    return true;
                }
            }
            tokio::time::sleep(Duration::from_millis(25)).await;
        }
        false
    }

    /// Nodes currently reporting an OPEN replica of the shard.
    pub async fn open_replicas(&self, shard: &str) -> Vec<String> {
        let mut open = Vec::new();
        for node in self.admin.nodes_serving(shard).await.unwrap_or_default() {
            if let Ok(record) = self.admin.deployment(shard, &node).await {
                if record.state == DeployState::Open {
                    open.push(node);
                }
            }
        }
        open.sort();
        open
    }

    pub async fn wait_for_open_count(
        &self,
        shard: &str,
        count: usize,
        timeout: Duration,
    ) -> bool {
        let deadline = Instant::now() + timeout;
        while Instant::now() < deadline {
            if self.open_replicas(shard).await.len() == count {
                return true;
            }
            tokio::time::sleep(Duration::from_millis(25)).await;
        }
        false
    }

    pub async fn shutdown(self) {
        for node in &self.nodes {
            node.shutdown().await;
        }
        for master in &self.masters {
            master.shutdown().await;
        }
        self.admin.close().await;
    }
}

/// Documents with a text field; `alice` appears in every even-numbered
/// document.
pub fn sample_docs(count: usize, marker: &str) -> Vec<serde_json::Value> {
    (0..count)
        .map(|i| {
            let text = if i % 2 == 0 {
                format!("alice {} number {}", marker, i)
            } else {
                format!("rabbit {} number {}", marker, i)
            };
            serde_json::json!({ "text": text, "ordinal": i as i64, "marker": marker })
        })
        .collect()
}
