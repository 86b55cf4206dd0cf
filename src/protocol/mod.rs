//! Shared metadata types written to the store and exchanged between
//! master, nodes and clients. The store payloads are JSON; the search
//! RPC payloads live in [`query`] and use a compact binary codec.

pub mod query;

use serde::{Deserialize, Serialize};

pub use query::{
    DetailsRequest, DetailsResponse, DocFreqsRequest, DocFreqsResponse, DocumentFrequencyMap,
    FieldValue, Hit, Hits, Query, ScoredDoc, SearchRequest, SearchResponse, SortDescriptor,
    SortField, SortOrder, SortValue, Term, TermFilter,
};

/// Separator between the index name and the shard folder name. Shard names
/// are globally unique because index names are.
pub const SHARD_SEPARATOR: char = '#';

/// Build the globally unique shard name for a folder of an index.
pub fn shard_name(index: &str, folder: &str) -> String {
    format!("{}{}{}", index, SHARD_SEPARATOR, folder)
}

/// The index a shard belongs to (everything before the separator).
pub fn index_of_shard(shard: &str) -> &str {
    shard.split(SHARD_SEPARATOR).next().unwrap_or(shard)
}

/// Lifecycle of a declared index.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum IndexState {
    Announced,
    Deploying,
    Deployed,
    DeployError,
    Replicating,
}

impl std::fmt::Display for IndexState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            IndexState::Announced => "ANNOUNCED",
            IndexState::Deploying => "DEPLOYING",
            IndexState::Deployed => "DEPLOYED",
            IndexState::DeployError => "DEPLOY_ERROR",
            IndexState::Replicating => "REPLICATING",
        };
        f.write_str(s)
    }
}

/// Declared index, stored at `/indexes/<name>`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IndexMetaData {
    /// Source location the shard folders are pulled from
    pub path: String,
    /// Analyzer identifier, passed through to the index engine
    pub analyzer: String,
    pub replication_level: u32,
    pub state: IndexState,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
}

impl IndexMetaData {
    pub fn announced(path: &str, analyzer: &str, replication_level: u32) -> Self {
        Self {
            path: path.to_string(),
            analyzer: analyzer.to_string(),
            replication_level,
            state: IndexState::Announced,
            error_message: None,
        }
    }
}

/// Shard source descriptor, stored at `/indexes/<name>/<shard>`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ShardMetaData {
    pub path: String,
}

/// Per-replica deployment state, stored at `/shard-to-node/<shard>/<node>`.
/// Created by the master as `Assigned`; only the owning node mutates it.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum DeployState {
    Assigned,
    Fetching,
    Open,
    Error,
}

impl std::fmt::Display for DeployState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            DeployState::Assigned => "ASSIGNED",
            DeployState::Fetching => "FETCHING",
            DeployState::Open => "OPEN",
            DeployState::Error => "ERROR",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeployedShard {
    pub state: DeployState,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
    /// Document count of the opened shard
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub shard_size: Option<u64>,
}

impl DeployedShard {
    pub fn assigned() -> Self {
        Self {
            state: DeployState::Assigned,
            error_message: None,
            shard_size: None,
        }
    }

    pub fn fetching() -> Self {
        Self {
            state: DeployState::Fetching,
            error_message: None,
            shard_size: None,
        }
    }

    pub fn open(shard_size: u64) -> Self {
        Self {
            state: DeployState::Open,
            error_message: None,
            shard_size: Some(shard_size),
        }
    }

    pub fn error(message: String) -> Self {
        Self {
            state: DeployState::Error,
            error_message: Some(message),
            shard_size: None,
        }
    }
}

/// Node descriptor, stored ephemerally at `/nodes/<name>`. Its presence is
/// the liveness signal; the content is informational.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeMetaData {
    pub host: String,
    pub port: u16,
    pub start_time: i64,
    pub healthy: bool,
    pub status: String,
}

impl NodeMetaData {
    pub fn new(host: &str, port: u16) -> Self {
        Self {
            host: host.to_string(),
            port,
            start_time: chrono::Utc::now().timestamp_millis(),
            healthy: false,
            status: "starting".to_string(),
        }
    }

    /// host:port the search RPC endpoint listens on
    pub fn addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_shard_names() {
        let shard = shard_name("wiki", "part-0001");
        assert_eq!(shard, "wiki#part-0001");
        assert_eq!(index_of_shard(&shard), "wiki");
    }

    #[test]
    fn test_index_metadata_roundtrip() {
        let meta = IndexMetaData::announced("/data/wiki", "simple", 2);
        let json = serde_json::to_string(&meta).unwrap();
        // error_message is omitted while empty
        assert!(!json.contains("error_message"));
        let back: IndexMetaData = serde_json::from_str(&json).unwrap();
        assert_eq!(back.state, IndexState::Announced);
        assert_eq!(back.replication_level, 2);
    }

    #[test]
    fn test_deployed_shard_states() {
        assert_eq!(DeployedShard::open(42).shard_size, Some(42));
        let err = DeployedShard::error("disk full".into());
        assert_eq!(err.state, DeployState::Error);
        assert_eq!(err.error_message.as_deref(), Some("disk full"));
    }
}
