//! Metadata store plane.
//!
//! The coordination service is an external collaborator behind the
//! [`StoreBackend`] trait: a hierarchical, watchable namespace with
//! ephemeral entries, sequential create and versioned writes. The crate
//! ships [`memory::MemoryStore`] (embedded, also served over HTTP by the
//! master process), [`client::RemoteStore`] (the HTTP backend used by
//! nodes and the admin CLI) and [`adapter::MetaStore`], the typed facade
//! every component talks to.

pub mod adapter;
pub mod client;
pub mod memory;
pub mod server;

pub use adapter::MetaStore;
pub use client::RemoteStore;
pub use memory::MemoryStore;

use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::KattaResult;

/// Identifies one client session. Ephemeral entries live and die with it.
pub type SessionId = String;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum CreateMode {
    Persistent,
    Ephemeral,
    /// Ephemeral with a store-assigned monotonically increasing suffix
    EphemeralSequential,
}

/// Change notification. Watches are one-shot at this layer; the adapter
/// re-arms them so consumers observe a continuous stream. Events carry no
/// payload — handlers re-read current state.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub enum StoreEvent {
    ChildrenChanged { path: String },
    DataChanged { path: String },
}

impl StoreEvent {
    pub fn path(&self) -> &str {
        match self {
            StoreEvent::ChildrenChanged { path } => path,
            StoreEvent::DataChanged { path } => path,
        }
    }
}

/// Connection-level notification, surfaced once per transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionEvent {
    Disconnected,
    Reconnected,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum WatchKind {
    Children,
    Data,
}

/// The raw store contract. Operations are path-based; mutations fire any
/// registered one-shot watches. `poll_events` doubles as the session
/// heartbeat: a session that stops polling expires and loses its
/// ephemeral entries.
#[async_trait]
pub trait StoreBackend: Send + Sync {
    async fn create_session(&self) -> KattaResult<SessionId>;

    async fn close_session(&self, session: &SessionId) -> KattaResult<()>;

    /// Create an entry; returns the actual path (differs from the request
    /// for sequential creates). The parent must exist.
    async fn create(
        &self,
        session: &SessionId,
        path: &str,
        data: String,
        mode: CreateMode,
    ) -> KattaResult<String>;

    /// Read data plus its version counter.
    async fn read(&self, path: &str) -> KattaResult<(String, u64)>;

    /// Overwrite data. With `expected_version` the write only succeeds if
    /// the entry is still at that version (optimistic concurrency).
    async fn write(&self, path: &str, data: String, expected_version: Option<u64>)
        -> KattaResult<u64>;

    async fn delete(&self, path: &str) -> KattaResult<()>;

    async fn delete_recursive(&self, path: &str) -> KattaResult<()>;

    async fn exists(&self, path: &str) -> KattaResult<bool>;

    /// Names (not full paths) of the direct children, sorted.
    async fn children(&self, path: &str) -> KattaResult<Vec<String>>;

    /// Register a one-shot watch delivered to the session's event queue.
    /// Watching a missing path is allowed; the watch fires on creation.
    async fn watch(&self, session: &SessionId, path: &str, kind: WatchKind) -> KattaResult<()>;

    /// Long-poll the session's event queue. Returns accumulated events,
    /// or an empty vec after `max_wait`. Errors once the session expired.
    async fn poll_events(
        &self,
        session: &SessionId,
        max_wait: Duration,
    ) -> KattaResult<Vec<StoreEvent>>;
}

/// Store layout. These paths are the wire contract between master, nodes
/// and clients.
pub mod paths {
    /// Ephemeral election token; content is the active master's name
    pub const MASTER: &str = "/master";
    /// Ephemeral node descriptors
    pub const NODES: &str = "/nodes";
    /// Declared indexes with their shard children
    pub const INDEXES: &str = "/indexes";
    /// Assignments, written by the master and watched by nodes
    pub const NODE_TO_SHARD: &str = "/node-to-shard";
    /// Deployment records, written by nodes, watched by master and clients
    pub const SHARD_TO_NODE: &str = "/shard-to-node";

    pub fn node(name: &str) -> String {
        format!("{}/{}", NODES, name)
    }

    pub fn index(name: &str) -> String {
        format!("{}/{}", INDEXES, name)
    }

    pub fn index_shard(index: &str, shard: &str) -> String {
        format!("{}/{}/{}", INDEXES, index, shard)
    }

    pub fn node_shards(node: &str) -> String {
        format!("{}/{}", NODE_TO_SHARD, node)
    }

    pub fn node_shard(node: &str, shard: &str) -> String {
        format!("{}/{}/{}", NODE_TO_SHARD, node, shard)
    }

    pub fn shard_nodes(shard: &str) -> String {
        format!("{}/{}", SHARD_TO_NODE, shard)
    }

    pub fn shard_node(shard: &str, node: &str) -> String {
        format!("{}/{}/{}", SHARD_TO_NODE, shard, node)
    }

    /// Last path segment, e.g. the node name of a deployment record.
    pub fn leaf(path: &str) -> &str {
        path.rsplit('/').next().unwrap_or(path)
    }
}
