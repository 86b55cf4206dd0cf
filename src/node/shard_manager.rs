//! Local shard lifecycle on a worker node.
//!
//! Shard data is pulled wholesale from its source location into the
//! node's work directory, then opened through the index engine. Readers
//! are handed out as reference-counted handles; a shard is only closed
//! and its local copy removed once every outstanding handle is released.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;

use crate::engine::{IndexEngine, ShardReader};
use crate::error::{KattaError, KattaResult};

/// How long a removal waits for in-flight searches to release their
/// handles before the reader is dropped anyway
const DRAIN_GRACE: Duration = Duration::from_secs(5);

pub struct ShardManager {
    engine: Arc<dyn IndexEngine>,
    work_dir: PathBuf,
    shards: DashMap<String, Arc<dyn ShardReader>>,
}

impl ShardManager {
    pub fn new(engine: Arc<dyn IndexEngine>, work_dir: &Path) -> Self {
        Self {
            engine,
            work_dir: work_dir.to_path_buf(),
            shards: DashMap::new(),
        }
    }

    pub fn shard_names(&self) -> Vec<String> {
        self.shards.iter().map(|e| e.key().clone()).collect()
    }

    pub fn has_shard(&self, shard: &str) -> bool {
        self.shards.contains_key(shard)
    }

    /// Acquire a handle on an open shard. The handle keeps the reader
    /// alive until dropped, on every exit path.
    pub fn reader(&self, shard: &str) -> KattaResult<Arc<dyn ShardReader>> {
        self.shards
            .get(shard)
            .map(|entry| Arc::clone(entry.value()))
            .ok_or_else(|| KattaError::ShardUnavailable(shard.to_string()))
    }

    fn local_path(&self, shard: &str) -> PathBuf {
        self.work_dir.join(shard)
    }

    /// Fetch the shard from `source` and open it. Returns the document
    /// count. Installing an already-open shard is a no-op.
    pub async fn install(
        &self,
        shard: &str,
        source: &str,
        analyzer: &str,
    ) -> KattaResult<u64> {
        if let Some(existing) = self.shards.get(shard) {
            return Ok(existing.num_docs());
        }

        let local = self.local_path(shard);
        fetch_shard(source, &local).await?;

        let reader = self.engine.open_reader(shard, &local, analyzer).await?;
        let num_docs = reader.num_docs();
        self.shards.insert(shard.to_string(), reader);
        tracing::info!(shard, num_docs, "Shard opened");
        Ok(num_docs)
    }

    /// Remove a shard: unpublish it from the map, wait for in-flight
    /// handles to drain, drop the reader and delete the local copy.
    pub async fn remove(&self, shard: &str) {
        let Some((_, reader)) = self.shards.remove(shard) else {
            return;
        };

        let drain_deadline = tokio::time::Instant::now() + DRAIN_GRACE;
        while Arc::strong_count(&reader) > 1 {
            if tokio::time::Instant::now() >= drain_deadline {
                tracing::warn!(shard, "Closing shard with searches still in flight");
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        drop(reader);

        let local = self.local_path(shard);
        if let Err(err) = tokio::fs::remove_dir_all(&local).await {
            if err.kind() != std::io::ErrorKind::NotFound {
                tracing::warn!(shard, error = %err, "Could not delete local shard copy");
            }
        }
        tracing::info!(shard, "Shard closed");
    }

    /// Close everything. Used on shutdown.
    pub async fn remove_all(&self) {
        for shard in self.shard_names() {
            self.remove(&shard).await;
        }
    }
}

/// Copy the shard source directory into place. The copy goes to a
/// temporary sibling first so a half-fetched shard is never opened.
async fn fetch_shard(source: &str, target: &Path) -> KattaResult<()> {
    let source = source
        .strip_prefix("file://")
        .unwrap_or(source)
        .to_string();
    let target = target.to_path_buf();
    tokio::task::spawn_blocking(move || {
        let staging = target.with_extension("fetch");
        if staging.exists() {
            std::fs::remove_dir_all(&staging)?;
        }
        if target.exists() {
            std::fs::remove_dir_all(&target)?;
        }
        copy_dir(Path::new(&source), &staging).map_err(|e| {
            KattaError::ShardOpenFailure(format!("fetching {} failed: {}", source, e))
        })?;
        std::fs::rename(&staging, &target)?;
        Ok::<(), KattaError>(())
    })
    .await
    .map_err(|e| KattaError::InternalError(format!("fetch task failed: {}", e)))?
}

fn copy_dir(from: &Path, to: &Path) -> std::io::Result<()> {
    std::fs::create_dir_all(to)?;
    for entry in std::fs::read_dir(from)? {
        let entry = entry?;
        let target = to.join(entry.file_name());
        if entry.file_type()?.is_dir() {
            copy_dir(&entry.path(), &target)?;
        } else {
            std::fs::copy(entry.path(), &target)?;
        }
    }
    Ok(())
}
