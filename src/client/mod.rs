//! Query coordinator.
//!
//! Resolves index names to shards, picks one live replica per shard
//! (sticky round-robin, skipping recently unreachable nodes), then runs
//! the two-phase scatter/gather: global document frequencies first, the
//! actual search second, both grouped per node. A failed node call fails
//! over shard by shard onto the remaining replicas; a shard with nothing
//! left fails the whole query.

pub mod merge;
pub mod rpc;
pub mod shard_map;

pub use rpc::NodeRpc;
pub use shard_map::ShardMap;

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures::future::BoxFuture;
use parking_lot::Mutex;

use crate::config::KattaConfig;
use crate::error::{KattaError, KattaResult};
use crate::protocol::{
    DetailsRequest, DocFreqsRequest, DocumentFrequencyMap, FieldValue, Hit, Hits, Query,
    SearchRequest, SortDescriptor,
};
use crate::store::{MetaStore, StoreBackend};

/// Globally merged result of one query.
#[derive(Debug, Clone)]
pub struct SearchResults {
    pub hits: Vec<Hit>,
    pub total_hits: u64,
    /// Shards whose counts are partial because they hit their budget
    pub timed_out_shards: Vec<String>,
}

struct Selection {
    /// Per-shard affinity; reused while the replica stays viable
    sticky: HashMap<String, String>,
    /// Nodes to avoid, with the time of the last failure
    unreachable: HashMap<String, Instant>,
    cursor: usize,
}

pub struct KattaClient {
    meta: Arc<MetaStore>,
    map: Arc<ShardMap>,
    rpc: NodeRpc,
    config: KattaConfig,
    selection: Mutex<Selection>,
}

impl KattaClient {
    /// Connect and block until the initial shard map snapshot is loaded.
    pub async fn connect(
        backend: Arc<dyn StoreBackend>,
        config: KattaConfig,
    ) -> KattaResult<Arc<Self>> {
        let meta = MetaStore::connect(backend, Duration::from_millis(config.poll_timeout_ms))
            .await?;
        meta.create_default_structure().await?;
        let map = ShardMap::start(Arc::clone(&meta)).await?;
        Ok(Arc::new(Self {
            meta,
            map,
            rpc: NodeRpc::new(),
            config,
            selection: Mutex::new(Selection {
                sticky: HashMap::new(),
                unreachable: HashMap::new(),
                cursor: rand::random::<usize>() % 1024,
            }),
        }))
    }

    pub fn shard_map(&self) -> &Arc<ShardMap> {
        &self.map
    }

    pub async fn close(&self) {
        self.map.stop();
        self.meta.close().await;
    }

    /// Union of the shard sets of the requested indexes; `*` means every
    /// index the map knows about.
    fn resolve_shards(&self, index_names: &[String]) -> KattaResult<Vec<String>> {
        let names: Vec<String> = if index_names.iter().any(|n| n == "*") {
            self.map.indexes()
        } else {
            index_names.to_vec()
        };
        let mut shards = Vec::new();
        for name in &names {
            let mut index_shards = self
                .map
                .shards_of_index(name)
                .ok_or_else(|| KattaError::PathNotFound(format!("index {}", name)))?;
            shards.append(&mut index_shards);
        }
        shards.sort();
        shards.dedup();
        Ok(shards)
    }

    fn mark_unreachable(&self, node: &str) {
        self.selection
            .lock()
            .unreachable
            .insert(node.to_string(), Instant::now());
    }

    /// One replica for a shard: sticky first, then round-robin, skipping
    /// excluded and recently unreachable nodes. With every replica
    /// flagged unreachable the least-recently failed one is retried
    /// rather than failing a shard that still has live copies.
    fn pick_replica(
        &self,
        shard: &str,
        exclude: &HashSet<String>,
    ) -> KattaResult<(String, String)> {
        let replicas = self.map.replicas(shard);
        if replicas.is_empty() {
            return Err(KattaError::ShardUnavailable(shard.to_string()));
        }
        let mut selection = self.selection.lock();
        let window = Duration::from_secs(self.config.unreachable_window_secs);
        selection.unreachable.retain(|_, failed| failed.elapsed() < window);

        if let Some(node) = selection.sticky.get(shard).cloned() {
            if replicas.contains(&node)
                && !exclude.contains(&node)
                && !selection.unreachable.contains_key(&node)
            {
                if let Some(addr) = self.map.node_addr(&node) {
                    return Ok((node, addr));
                }
            }
        }

        let count = replicas.len();
        for i in 0..count {
            let index = (selection.cursor + i) % count;
            let node = &replicas[index];
            if exclude.contains(node) || selection.unreachable.contains_key(node) {
                continue;
            }
            let Some(addr) = self.map.node_addr(node) else {
                continue;
            };
            selection.cursor = selection.cursor.wrapping_add(i + 1);
            selection.sticky.insert(shard.to_string(), node.clone());
            return Ok((node.clone(), addr));
        }

        let mut last_resort: Vec<&String> = replicas
            .iter()
            .filter(|node| !exclude.contains(*node))
            .collect();
        last_resort.sort_by_key(|node| selection.unreachable.get(*node).copied());
        for node in last_resort {
            if let Some(addr) = self.map.node_addr(node) {
                return Ok((node.clone(), addr));
            }
        }
        Err(KattaError::ShardUnavailable(shard.to_string()))
    }

    /// Fan a per-node call out over a covering set with shard-level
    /// failover. Each failed node call re-queues its shards onto the next
    /// replica; a shard that runs out of replicas fails the query.
    /// Malformed queries surface unchanged and are never retried.
    async fn scatter<'a, R>(
        &'a self,
        shards: &[String],
        call: impl Fn(String, Vec<String>) -> BoxFuture<'a, KattaResult<R>>,
    ) -> KattaResult<Vec<R>> {
        let mut tried: HashMap<String, HashSet<String>> = HashMap::new();
        let mut pending: Vec<String> = shards.to_vec();
        let mut responses = Vec::new();

        while !pending.is_empty() {
            let mut groups: HashMap<(String, String), Vec<String>> = HashMap::new();
            for shard in &pending {
                let exclude = tried.entry(shard.clone()).or_default();
                let (node, addr) = self.pick_replica(shard, exclude)?;
                groups.entry((node, addr)).or_default().push(shard.clone());
            }
            pending.clear();

            let calls = groups.into_iter().map(|((node, addr), group)| {
                let future = call(addr, group.clone());
                async move { (node, group, future.await) }
            });
            for (node, group, outcome) in futures::future::join_all(calls).await {
                match outcome {
                    Ok(response) => responses.push(response),
                    Err(KattaError::MalformedQuery(message)) => {
                        return Err(KattaError::MalformedQuery(message));
                    }
                    Err(err) => {
                        tracing::warn!(node = %node, error = %err, "Node call failed, failing over");
                        self.mark_unreachable(&node);
                        for shard in &group {
                            tried.entry(shard.clone()).or_default().insert(node.clone());
                        }
                        pending.extend(group);
                    }
                }
            }
        }
        Ok(responses)
    }

    pub async fn search(
        &self,
        index_names: &[String],
        query: &Query,
        limit: usize,
        sort: Option<SortDescriptor>,
    ) -> KattaResult<SearchResults> {
        let timeout = Duration::from_millis(self.config.query_timeout_ms);
        self.search_with_timeout(index_names, query, limit, sort, timeout)
            .await
    }

    /// Two-phase scatter/gather with an overall deadline. Nodes receive
    /// the deadline minus an RPC-overhead margin and budget their shards
    /// within it, so partial results come back before the caller's clock
    /// runs out.
    pub async fn search_with_timeout(
        &self,
        index_names: &[String],
        query: &Query,
        limit: usize,
        sort: Option<SortDescriptor>,
        timeout: Duration,
    ) -> KattaResult<SearchResults> {
        let shards = self.resolve_shards(index_names)?;
        if shards.is_empty() {
            return Err(KattaError::ShardUnavailable(
                "no shards for requested indexes".to_string(),
            ));
        }
        let node_timeout_ms = (timeout.as_millis() as f64
            * (1.0 - self.config.rpc_margin_fraction)) as u64;

        // Phase 1: global document frequencies
        let freq_responses = self
            .scatter(&shards, |addr, group| {
                let request = DocFreqsRequest {
                    query: query.clone(),
                    shards: group,
                };
                Box::pin(async move { self.rpc.doc_freqs(&addr, &request, timeout).await })
            })
            .await?;
        let mut freqs = DocumentFrequencyMap::default();
        for response in &freq_responses {
            freqs.merge(&response.freqs);
        }

        // Phase 2: search with consistent scoring
        let responses: Vec<Hits> = self
            .scatter(&shards, |addr, group| {
                let request = SearchRequest {
                    query: query.clone(),
                    freqs: freqs.clone(),
                    shards: group,
                    timeout_ms: node_timeout_ms,
                    limit,
                    sort: sort.clone(),
                };
                Box::pin(async move {
                    self.rpc
                        .search(&addr, &request, timeout)
                        .await
                        .map(|response| response.hits)
                })
            })
            .await?;

        let total_hits = responses.iter().map(|hits| hits.total_hits).sum();
        let mut timed_out_shards: Vec<String> = responses
            .iter()
            .flat_map(|hits| hits.timed_out.iter().cloned())
            .collect();
        timed_out_shards.sort();

        let hits = match &sort {
            None => merge::merge_by_score(&responses, limit),
            Some(descriptor) => merge::merge_by_sort(&responses, descriptor, limit),
        };
        Ok(SearchResults {
            hits,
            total_hits,
            timed_out_shards,
        })
    }

    /// Hit count only: phase 1 plus a `limit = 1` search for its
    /// `total_hits`.
    pub async fn count(&self, index_names: &[String], query: &Query) -> KattaResult<u64> {
        let results = self.search(index_names, query, 1, None).await?;
        Ok(results.total_hits)
    }

    /// Stored fields for previously returned hits, in hit order.
    pub async fn get_details(
        &self,
        hits: &[Hit],
        fields: Option<Vec<String>>,
    ) -> KattaResult<Vec<HashMap<String, FieldValue>>> {
        let mut by_shard: HashMap<String, Vec<u32>> = HashMap::new();
        for hit in hits {
            by_shard.entry(hit.shard.clone()).or_default().push(hit.doc_id);
        }
        let mut shards: Vec<String> = by_shard.keys().cloned().collect();
        shards.sort();

        // Prefer the replicas that produced the hits; doc ids are stable
        // across replicas either way
        {
            let mut selection = self.selection.lock();
            for hit in hits {
                selection.sticky.insert(hit.shard.clone(), hit.node.clone());
            }
        }

        let timeout = Duration::from_millis(self.config.query_timeout_ms);
        let responses = self
            .scatter(&shards, |addr, group| {
                let doc_ids: HashMap<String, Vec<u32>> = group
                    .iter()
                    .map(|shard| (shard.clone(), by_shard[shard].clone()))
                    .collect();
                let request = DetailsRequest {
                    doc_ids,
                    fields: fields.clone(),
                };
                Box::pin(async move { self.rpc.get_details(&addr, &request, timeout).await })
            })
            .await?;

        let mut lookup: HashMap<(String, u32), HashMap<String, FieldValue>> = HashMap::new();
        for response in responses {
            for (shard, by_id) in response.docs {
                for (doc_id, doc_fields) in by_id {
                    lookup.insert((shard.clone(), doc_id), doc_fields);
                }
            }
        }
        hits.iter()
            .map(|hit| {
                lookup
                    .get(&(hit.shard.clone(), hit.doc_id))
                    .cloned()
                    .ok_or_else(|| {
                        KattaError::InternalError(format!(
                            "no details for doc {} in shard {}",
                            hit.doc_id, hit.shard
                        ))
                    })
            })
            .collect()
    }
}
