//! Shard-local search execution.
//!
//! Per-shard work runs on the blocking pool, bounded by a semaphore.
//! Each shard gets a soft budget of a fraction of the caller's timeout;
//! a shard that overruns it contributes whatever it collected instead of
//! failing the call. Filter doc-sets are cached per (shard, filter) with
//! access-based expiry.

use std::collections::{HashMap, HashSet};
use std::num::NonZeroUsize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use lru::LruCache;
use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::Semaphore;

use super::shard_manager::ShardManager;
use crate::engine::ShardReader;
use crate::error::{KattaError, KattaResult};
use crate::protocol::{
    DetailsRequest, DetailsResponse, DocFreqsRequest, DocFreqsResponse, DocumentFrequencyMap,
    Hits, SearchRequest, SearchResponse, TermFilter,
};

struct CacheEntry {
    docs: Arc<HashSet<u32>>,
    last_access: Instant,
}

/// Thread-safe LRU of evaluated filters, expiring by access time.
pub struct FilterCache {
    inner: Mutex<LruCache<String, CacheEntry>>,
    ttl: Duration,
    hits: AtomicU64,
    misses: AtomicU64,
}

impl FilterCache {
    pub fn new(capacity: usize, ttl: Duration) -> Self {
        let capacity = NonZeroUsize::new(capacity.max(1)).unwrap_or(NonZeroUsize::MIN);
        Self {
            inner: Mutex::new(LruCache::new(capacity)),
            ttl,
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
        }
    }

    fn get_or_compute(
        &self,
        shard: &str,
        filter: &TermFilter,
        reader: &Arc<dyn ShardReader>,
    ) -> Arc<HashSet<u32>> {
        let key = format!("{}::{}", shard, filter.cache_key());
        {
            let mut cache = self.inner.lock();
            if let Some(entry) = cache.get_mut(&key) {
                if entry.last_access.elapsed() <= self.ttl {
                    entry.last_access = Instant::now();
                    self.hits.fetch_add(1, Ordering::Relaxed);
                    return Arc::clone(&entry.docs);
                }
                cache.pop(&key);
            }
        }
        self.misses.fetch_add(1, Ordering::Relaxed);
        let docs = Arc::new(reader.filter_docs(filter));
        self.inner.lock().put(
            key,
            CacheEntry {
                docs: Arc::clone(&docs),
                last_access: Instant::now(),
            },
        );
        docs
    }

    pub fn hit_count(&self) -> u64 {
        self.hits.load(Ordering::Relaxed)
    }

    pub fn miss_count(&self) -> u64 {
        self.misses.load(Ordering::Relaxed)
    }
}

/// Point-in-time counters exposed on the node's status endpoint.
#[derive(Debug, Clone, Serialize)]
pub struct SearchStats {
    pub filter_cache_hits: u64,
    pub filter_cache_misses: u64,
}

pub struct SearchService {
    node_name: String,
    shards: Arc<ShardManager>,
    permits: Arc<Semaphore>,
    filter_cache: FilterCache,
    shard_timeout_fraction: f64,
}

impl SearchService {
    pub fn new(
        node_name: &str,
        shards: Arc<ShardManager>,
        max_concurrent_shards: usize,
        filter_cache_capacity: usize,
        filter_cache_ttl: Duration,
        shard_timeout_fraction: f64,
    ) -> Self {
        Self {
            node_name: node_name.to_string(),
            shards,
            permits: Arc::new(Semaphore::new(max_concurrent_shards.max(1))),
            filter_cache: FilterCache::new(filter_cache_capacity, filter_cache_ttl),
            shard_timeout_fraction,
        }
    }

    pub fn open_shards(&self) -> Vec<String> {
        self.shards.shard_names()
    }

    pub fn stats(&self) -> SearchStats {
        SearchStats {
            filter_cache_hits: self.filter_cache.hit_count(),
            filter_cache_misses: self.filter_cache.miss_count(),
        }
    }

    /// Rewrite the query on every named shard and sum the per-term
    /// document frequencies and document counts.
    pub async fn doc_freqs(&self, request: DocFreqsRequest) -> KattaResult<DocFreqsResponse> {
        let mut combined = DocumentFrequencyMap::default();
        for shard in &request.shards {
            let reader = self.shards.reader(shard)?;
            let freqs = reader.doc_freqs(&request.query)?;
            combined.merge(&freqs);
        }
        Ok(DocFreqsResponse { freqs: combined })
    }

    pub async fn search(&self, request: SearchRequest) -> KattaResult<SearchResponse> {
        let shard_budget = Duration::from_millis(
            (request.timeout_ms as f64 * self.shard_timeout_fraction).max(1.0) as u64,
        );
        let freqs = Arc::new(request.freqs);

        let tasks = request.shards.iter().map(|shard| {
            let shard = shard.clone();
            let query = request.query.clone();
            let freqs = Arc::clone(&freqs);
            let sort = request.sort.clone();
            let limit = request.limit;
            let permits = Arc::clone(&self.permits);
            async move {
                let _permit = permits
                    .acquire_owned()
                    .await
                    .map_err(|e| KattaError::InternalError(e.to_string()))?;
                let reader = self.shards.reader(&shard)?;
                let filter_docs = query
                    .filter
                    .as_ref()
                    .map(|f| self.filter_cache.get_or_compute(&shard, f, &reader));

                let deadline = Instant::now() + shard_budget;
                let result = tokio::task::spawn_blocking(move || {
                    reader.search(
                        &query,
                        &freqs,
                        limit,
                        sort.as_ref(),
                        deadline,
                        filter_docs.as_deref(),
                    )
                })
                .await
                .map_err(|e| KattaError::InternalError(format!("search task failed: {}", e)))??;
                Ok::<_, KattaError>((shard, result))
            }
        });

        let mut hits = Hits::empty(&self.node_name);
        for outcome in futures::future::join_all(tasks).await {
            let (shard, result) = outcome?;
            hits.total_hits += result.total_hits;
            if result.timed_out {
                hits.timed_out.push(shard.clone());
            }
            hits.shard_hits.insert(shard, result.docs);
        }
        Ok(SearchResponse { hits })
    }

    /// Fetch stored fields for previously returned documents.
    pub async fn get_details(&self, request: DetailsRequest) -> KattaResult<DetailsResponse> {
        let mut docs = HashMap::new();
        for (shard, ids) in &request.doc_ids {
            let reader = self.shards.reader(shard)?;
            let mut by_id = HashMap::new();
            for &id in ids {
                let fields = reader
                    .details(id, request.fields.as_deref())
                    .ok_or_else(|| {
                        KattaError::InternalError(format!("unknown doc {} in shard {}", id, shard))
                    })?;
                by_id.insert(id, fields);
            }
            docs.insert(shard.clone(), by_id);
        }
        Ok(DetailsResponse { docs })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::InvertedEngine;
    use crate::protocol::Query;
    use std::path::Path;

    fn write_docs(dir: &Path, docs: &[serde_json::Value]) {
        std::fs::create_dir_all(dir).unwrap();
        for (i, doc) in docs.iter().enumerate() {
            std::fs::write(dir.join(format!("doc-{:04}.json", i)), doc.to_string()).unwrap();
        }
    }

    async fn service_with_two_shards(scratch: &Path) -> SearchService {
        let manager = Arc::new(ShardManager::new(
            Arc::new(InvertedEngine),
            &scratch.join("work"),
        ));
        write_docs(
            &scratch.join("a"),
            &[
                serde_json::json!({"text": "alice in wonderland", "lang": "en"}),
                serde_json::json!({"text": "the queen of hearts", "lang": "en"}),
            ],
        );
        write_docs(
            &scratch.join("b"),
            &[serde_json::json!({"text": "alice through the looking glass", "lang": "en"})],
        );
        manager
            .install("demo#a", scratch.join("a").to_str().unwrap(), "simple")
            .await
            .unwrap();
        manager
            .install("demo#b", scratch.join("b").to_str().unwrap(), "simple")
            .await
            .unwrap();
        SearchService::new("n1", manager, 4, 16, Duration::from_secs(60), 0.75)
    }

    fn all_shards() -> Vec<String> {
        vec!["demo#a".to_string(), "demo#b".to_string()]
    }

    #[tokio::test]
    async fn test_doc_freqs_sums_across_shards() {
        let scratch = tempfile::tempdir().unwrap();
        let service = service_with_two_shards(scratch.path()).await;
        let response = service
            .doc_freqs(DocFreqsRequest {
                query: Query::new("alice"),
                shards: all_shards(),
            })
            .await
            .unwrap();
        assert_eq!(
            response
                .freqs
                .frequency(&crate::protocol::Term::new("text", "alice")),
            2
        );
        assert_eq!(response.freqs.num_docs, 3);
    }

    #[tokio::test]
    async fn test_search_returns_per_shard_hits() {
        let scratch = tempfile::tempdir().unwrap();
        let service = service_with_two_shards(scratch.path()).await;
        let freqs = service
            .doc_freqs(DocFreqsRequest {
                query: Query::new("alice"),
                shards: all_shards(),
            })
            .await
            .unwrap()
            .freqs;
        let response = service
            .search(SearchRequest {
                query: Query::new("alice"),
                freqs,
                shards: all_shards(),
                timeout_ms: 5_000,
                limit: 10,
                sort: None,
            })
            .await
            .unwrap();
        assert_eq!(response.hits.total_hits, 2);
        assert_eq!(response.hits.node, "n1");
        assert_eq!(response.hits.shard_hits["demo#a"].len(), 1);
        assert_eq!(response.hits.shard_hits["demo#b"].len(), 1);
        assert!(response.hits.timed_out.is_empty());
    }

    #[tokio::test]
    async fn test_unknown_shard_is_an_error() {
        let scratch = tempfile::tempdir().unwrap();
        let service = service_with_two_shards(scratch.path()).await;
        let err = service
            .doc_freqs(DocFreqsRequest {
                query: Query::new("alice"),
                shards: vec!["demo#missing".to_string()],
            })
            .await
            .unwrap_err();
        assert!(matches!(err, KattaError::ShardUnavailable(_)));
    }

    #[tokio::test]
    async fn test_filter_cache_hit_on_repeat() {
        let scratch = tempfile::tempdir().unwrap();
        let service = service_with_two_shards(scratch.path()).await;
        let filter = TermFilter {
            field: "lang".into(),
            value: "en".into(),
        };
        let request = || SearchRequest {
            query: Query::with_filter("alice", filter.clone()),
            freqs: DocumentFrequencyMap {
                frequencies: HashMap::new(),
                num_docs: 3,
            },
            shards: vec!["demo#a".to_string()],
            timeout_ms: 5_000,
            limit: 10,
            sort: None,
        };

        let first = service.search(request()).await.unwrap();
        assert_eq!(service.stats().filter_cache_hits, 0);
        assert_eq!(service.stats().filter_cache_misses, 1);

        let second = service.search(request()).await.unwrap();
        assert_eq!(service.stats().filter_cache_hits, 1);
        assert_eq!(first.hits.total_hits, second.hits.total_hits);
    }

    #[tokio::test]
    async fn test_details_in_requested_order() {
        let scratch = tempfile::tempdir().unwrap();
        let service = service_with_two_shards(scratch.path()).await;
        let mut doc_ids = HashMap::new();
        doc_ids.insert("demo#a".to_string(), vec![1, 0]);
        let response = service
            .get_details(DetailsRequest {
                doc_ids,
                fields: Some(vec!["text".to_string()]),
            })
            .await
            .unwrap();
        let by_id = &response.docs["demo#a"];
        assert_eq!(by_id.len(), 2);
        assert!(by_id[&0].contains_key("text"));
        assert!(!by_id[&0].contains_key("lang"));
    }
}
