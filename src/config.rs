use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Runtime configuration shared by master, node and client processes.
///
/// Defaults can be overridden with `KATTA_*` environment variables
/// (loaded from `.env` by the binary) and, where exposed, CLI flags.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KattaConfig {
    /// Directory where a node keeps its local shard copies
    pub work_dir: String,

    /// Store session expiry; a session not polled within this window is
    /// considered dead and its ephemeral entries are removed
    pub session_timeout_ms: u64,

    /// Long-poll window for store event delivery (must stay well below the
    /// session timeout so a healthy client always re-polls in time)
    pub poll_timeout_ms: u64,

    /// Default replication level for newly added indexes
    pub replication_level: u32,

    /// Shard deploy retry policy (exponential backoff)
    pub deploy_retry_max: u32,
    pub deploy_retry_base_ms: u64,

    /// Maximum concurrently searched shards per node
    pub search_permits: usize,

    /// Fraction of the caller timeout each shard may spend before
    /// returning whatever it has collected
    pub shard_timeout_fraction: f64,

    /// Filter cache sizing
    pub filter_cache_capacity: usize,
    pub filter_cache_ttl_secs: u64,

    /// How long the client avoids a replica after a failed call
    pub unreachable_window_secs: u64,

    /// Default overall query deadline
    pub query_timeout_ms: u64,

    /// Fraction of the caller deadline reserved for RPC overhead
    pub rpc_margin_fraction: f64,
}

impl Default for KattaConfig {
    fn default() -> Self {
        Self {
            work_dir: "./katta-data".to_string(),
            session_timeout_ms: 10_000,
            poll_timeout_ms: 2_000,
            replication_level: 3,
            deploy_retry_max: 3,
            deploy_retry_base_ms: 500,
            search_permits: 100,
            shard_timeout_fraction: 0.75,
            filter_cache_capacity: 1000,
            filter_cache_ttl_secs: 600,
            unreachable_window_secs: 30,
            query_timeout_ms: 10_000,
            rpc_margin_fraction: 0.1,
        }
    }
}

impl KattaConfig {
    /// Build a configuration from defaults plus `KATTA_*` environment
    /// overrides.
    pub fn from_env() -> Self {
        let mut config = Self::default();
        if let Ok(dir) = std::env::var("KATTA_WORK_DIR") {
            config.work_dir = dir;
        }
        if let Some(v) = env_u64("KATTA_SESSION_TIMEOUT_MS") {
            config.session_timeout_ms = v;
        }
        if let Some(v) = env_u64("KATTA_POLL_TIMEOUT_MS") {
            config.poll_timeout_ms = v;
        }
        if let Some(v) = env_u64("KATTA_REPLICATION_LEVEL") {
            config.replication_level = v as u32;
        }
        if let Some(v) = env_u64("KATTA_QUERY_TIMEOUT_MS") {
            config.query_timeout_ms = v;
        }
        if let Some(v) = env_u64("KATTA_SEARCH_PERMITS") {
            config.search_permits = v as usize;
        }
        config
    }

    /// Generate a stable-ish node name: hostname plus a short random suffix
    /// so several nodes can share a host.
    pub fn default_node_name() -> String {
        let host = hostname::get()
            .map(|h| h.to_string_lossy().to_string())
            .unwrap_or_else(|_| "unknown".to_string());
        format!("{}-{}", host, &Uuid::new_v4().to_string()[..8])
    }
}

fn env_u64(key: &str) -> Option<u64> {
    match std::env::var(key) {
        Ok(raw) => match raw.parse() {
            Ok(v) => Some(v),
            Err(_) => {
                tracing::warn!("Ignoring unparseable {}={}", key, raw);
                None
            }
        },
        Err(_) => None,
    }
}
