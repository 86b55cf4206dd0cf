//! Query-plane scenarios: scatter/gather, merging, timeouts, filter
//! caching and replica failover.

mod common;

use std::collections::{HashMap, HashSet};
use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use common::{sample_docs, TestCluster};
use katta::engine::{IndexEngine, InvertedEngine, ShardReader, ShardSearchResult};
use katta::error::{KattaError, KattaResult};
use katta::protocol::{
    DocumentFrequencyMap, FieldValue, IndexState, Query, SortDescriptor, SortField, SortOrder,
    Term, TermFilter,
};

#[tokio::test]
async fn test_search_across_two_indexes() {
    let cluster = TestCluster::start(2).await;
    cluster
        .add_index("wiki1", &[sample_docs(8, "w1a"), sample_docs(8, "w1b")], 2)
        .await;
    cluster.add_index("wiki2", &[sample_docs(8, "w2")], 2).await;
    for index in ["wiki1", "wiki2"] {
        assert!(
            cluster
                .wait_for_index_state(index, IndexState::Deployed, Duration::from_secs(15))
                .await
        );
    }

    let client = cluster.client().await;
    let results = client
        .search(&["*".to_string()], &Query::new("alice"), 10, None)
        .await
        .unwrap();

    // "alice" is in every even-numbered doc: 4 per shard, 3 shards
    assert_eq!(results.total_hits, 12);
    assert_eq!(results.hits.len(), 10);

    // Ranked by score descending, every (shard, doc) unique
    let mut seen = HashSet::new();
    for pair in results.hits.windows(2) {
        assert!(pair[0].score >= pair[1].score);
    }
    for hit in &results.hits {
        assert!(seen.insert((hit.shard.clone(), hit.doc_id)));
    }

    // count() reuses the same plumbing
    assert_eq!(
        client.count(&["*".to_string()], &Query::new("alice")).await.unwrap(),
        12
    );

    // Round-trip law: one stored-field record per hit, in hit order
    let details = client.get_details(&results.hits, None).await.unwrap();
    assert_eq!(details.len(), results.hits.len());
    for fields in &details {
        match fields.get("text") {
            Some(FieldValue::Text(text)) => assert!(text.contains("alice")),
            other => panic!("unexpected text field: {:?}", other),
        }
    }

    // limit = 0 still reports the total
    let empty = client
        .search(&["*".to_string()], &Query::new("alice"), 0, None)
        .await
        .unwrap();
    assert!(empty.hits.is_empty());
    assert_eq!(empty.total_hits, 12);

    client.close().await;
    cluster.shutdown().await;
}

#[tokio::test]
async fn test_single_node_serves_everything() {
    let cluster = TestCluster::start(1).await;
    cluster
        .add_index("wiki", &[sample_docs(6, "a"), sample_docs(6, "b")], 3)
        .await;
    assert!(
        cluster
            .wait_for_index_state("wiki", IndexState::Deployed, Duration::from_secs(15))
            .await
    );

    let client = cluster.client().await;
    let results = client
        .search(&["wiki".to_string()], &Query::new("alice"), 10, None)
        .await
        .unwrap();
    assert_eq!(results.total_hits, 6);
    assert_eq!(results.hits.len(), 6);

    client.close().await;
    cluster.shutdown().await;
}

#[tokio::test]
async fn test_zero_live_nodes_fails_with_shard_unavailable() {
    let cluster = TestCluster::start(0).await;
    cluster.add_index("wiki", &[sample_docs(4, "a")], 2).await;

    // Wait for the master to enumerate the shard set
    let deadline = Instant::now() + Duration::from_secs(10);
    while Instant::now() < deadline
        && cluster.admin.shards_of_index("wiki").await.unwrap().is_empty()
    {
        tokio::time::sleep(Duration::from_millis(25)).await;
    }

    let client = cluster.client().await;
    let err = client
        .search(&["wiki".to_string()], &Query::new("alice"), 10, None)
        .await
        .unwrap_err();
    match err {
        KattaError::ShardUnavailable(shard) => assert!(shard.contains("wiki#part-0000")),
        other => panic!("expected ShardUnavailable, got {:?}", other),
    }

    client.close().await;
    cluster.shutdown().await;
}

#[tokio::test]
async fn test_malformed_query_surfaces_unchanged() {
    let cluster = TestCluster::start(1).await;
    cluster.add_index("wiki", &[sample_docs(4, "a")], 1).await;
    assert!(
        cluster
            .wait_for_index_state("wiki", IndexState::Deployed, Duration::from_secs(15))
            .await
    );

    let client = cluster.client().await;
    let err = client
        .search(&["wiki".to_string()], &Query::new("title:"), 10, None)
        .await
        .unwrap_err();
    assert!(matches!(err, KattaError::MalformedQuery(_)));

    client.close().await;
    cluster.shutdown().await;
}

#[tokio::test]
async fn test_sorted_search_merges_across_shards() {
    let cluster = TestCluster::start(2).await;
    cluster
        .add_index("wiki", &[sample_docs(6, "a"), sample_docs(6, "b")], 2)
        .await;
    assert!(
        cluster
            .wait_for_index_state("wiki", IndexState::Deployed, Duration::from_secs(15))
            .await
    );

    let sort = SortDescriptor {
        fields: vec![SortField {
            field: "ordinal".into(),
            order: SortOrder::Desc,
        }],
    };
    let client = cluster.client().await;
    let results = client
        .search(&["wiki".to_string()], &Query::new("alice"), 10, Some(sort))
        .await
        .unwrap();

    let ordinals: Vec<i64> = results
        .hits
        .iter()
        .map(|hit| match hit.sort_values.as_ref().unwrap()[0] {
            FieldValue::Int(ordinal) => ordinal,
            _ => panic!("expected int sort value"),
        })
        .collect();
    // Both shards have alice docs at ordinals 0, 2, 4; merged descending
    assert_eq!(ordinals, vec![4, 4, 2, 2, 0, 0]);

    client.close().await;
    cluster.shutdown().await;
}

// ==================== timeout behaviour ====================

/// Engine whose shards named `*#slow` burn their whole collection budget
/// and come back empty-handed.
struct SlowShardEngine {
    inner: InvertedEngine,
}

struct SlowReader {
    inner: Arc<dyn ShardReader>,
}

#[async_trait]
impl IndexEngine for SlowShardEngine {
    async fn open_reader(
        &self,
        shard: &str,
        path: &Path,
        analyzer: &str,
    ) -> KattaResult<Arc<dyn ShardReader>> {
        let reader = self.inner.open_reader(shard, path, analyzer).await?;
        if shard.ends_with("#slow") {
            Ok(Arc::new(SlowReader { inner: reader }))
        } else {
            Ok(reader)
        }
    }
}

impl ShardReader for SlowReader {
    fn num_docs(&self) -> u64 {
        self.inner.num_docs()
    }

    fn rewrite(&self, query: &Query) -> KattaResult<Vec<Term>> {
        self.inner.rewrite(query)
    }

    fn doc_freqs(&self, query: &Query) -> KattaResult<DocumentFrequencyMap> {
        self.inner.doc_freqs(query)
    }

    fn filter_docs(&self, filter: &TermFilter) -> HashSet<u32> {
        self.inner.filter_docs(filter)
    }

    fn search(
        &self,
        query: &Query,
        freqs: &DocumentFrequencyMap,
        limit: usize,
        sort: Option<&SortDescriptor>,
        deadline: Instant,
        filter_docs: Option<&HashSet<u32>>,
    ) -> KattaResult<ShardSearchResult> {
        // Pretend to be a 500 ms shard that checks its budget as it goes
        let give_up = Instant::now() + Duration::from_millis(500);
        while Instant::now() < give_up {
            if Instant::now() >= deadline {
                return Ok(ShardSearchResult {
                    docs: Vec::new(),
                    total_hits: 0,
                    timed_out: true,
                });
            }
            std::thread::sleep(Duration::from_millis(5));
        }
        self.inner
            .search(query, freqs, limit, sort, deadline, filter_docs)
    }

    fn details(
        &self,
        doc_id: u32,
        fields: Option<&[String]>,
    ) -> Option<HashMap<String, FieldValue>> {
        self.inner.details(doc_id, fields)
    }
}

#[tokio::test]
async fn test_slow_shard_yields_partial_results_within_deadline() {
    let engine = Arc::new(SlowShardEngine {
        inner: InvertedEngine,
    });
    let cluster = TestCluster::start_with_engine(1, engine).await;

    // Hand-built index: one fast shard, one slow shard
    let index_dir = cluster.scratch.path().join("indexes").join("mix");
    for (shard, docs) in [("fast", sample_docs(8, "f")), ("slow", sample_docs(8, "s"))] {
        let dir = index_dir.join(shard);
        std::fs::create_dir_all(&dir).unwrap();
        for (i, doc) in docs.iter().enumerate() {
            std::fs::write(dir.join(format!("doc-{:04}.json", i)), doc.to_string()).unwrap();
        }
    }
    let meta = katta::protocol::IndexMetaData::announced(index_dir.to_str().unwrap(), "simple", 1);
    cluster.admin.announce_index("mix", &meta).await.unwrap();
    assert!(
        cluster
            .wait_for_index_state("mix", IndexState::Deployed, Duration::from_secs(15))
            .await
    );

    let client = cluster.client().await;
    let started = Instant::now();
    let results = client
        .search_with_timeout(
            &["mix".to_string()],
            &Query::new("alice"),
            10,
            None,
            Duration::from_millis(100),
        )
        .await
        .expect("partial results, not an error");
    let elapsed = started.elapsed();

    // The fast shard answered; the slow one contributed a partial count
    assert_eq!(results.total_hits, 4);
    assert_eq!(results.timed_out_shards, vec!["mix#slow".to_string()]);
    assert!(
        elapsed < Duration::from_millis(1_500),
        "query took {:?}, deadline was not enforced",
        elapsed
    );

    client.close().await;
    cluster.shutdown().await;
}

#[tokio::test]
async fn test_filter_cache_hit_across_identical_queries() {
    let cluster = TestCluster::start(1).await;
    cluster.add_index("wiki", &[sample_docs(8, "a")], 1).await;
    assert!(
        cluster
            .wait_for_index_state("wiki", IndexState::Deployed, Duration::from_secs(15))
            .await
    );

    let client = cluster.client().await;
    let query = Query::with_filter(
        "alice",
        TermFilter {
            field: "marker".into(),
            value: "a".into(),
        },
    );

    let first = client
        .search(&["wiki".to_string()], &query, 10, None)
        .await
        .unwrap();
    let second = client
        .search(&["wiki".to_string()], &query, 10, None)
        .await
        .unwrap();

    let stats = cluster.nodes[0].search_service().stats();
    assert!(stats.filter_cache_hits >= 1, "second query missed the cache");

    let keys = |results: &katta::SearchResults| -> Vec<(String, u32)> {
        results
            .hits
            .iter()
            .map(|hit| (hit.shard.clone(), hit.doc_id))
            .collect()
    };
    assert_eq!(keys(&first), keys(&second));

    client.close().await;
    cluster.shutdown().await;
}

// ==================== failover ====================

#[tokio::test]
async fn test_failover_to_surviving_replica() {
    let cluster = TestCluster::start(2).await;
    cluster.add_index("wiki", &[sample_docs(8, "a")], 2).await;
    assert!(
        cluster
            .wait_for_index_state("wiki", IndexState::Deployed, Duration::from_secs(15))
            .await
    );

    let client = cluster.client().await;
    // Both replicas are OPEN but one node stops answering; every query
    // must still succeed via the survivor
    cluster.nodes[0].stop_rpc();
    for _ in 0..3 {
        let results = client
            .search(&["wiki".to_string()], &Query::new("alice"), 10, None)
            .await
            .expect("failover should mask the dead replica");
        assert_eq!(results.total_hits, 4);
    }

    client.close().await;
    cluster.shutdown().await;
}

#[tokio::test]
async fn test_exhausted_replicas_fail_the_query() {
    let cluster = TestCluster::start(1).await;
    cluster.add_index("wiki", &[sample_docs(4, "a")], 1).await;
    assert!(
        cluster
            .wait_for_index_state("wiki", IndexState::Deployed, Duration::from_secs(15))
            .await
    );

    let client = cluster.client().await;
    cluster.nodes[0].stop_rpc();
    let err = client
        .search(&["wiki".to_string()], &Query::new("alice"), 10, None)
        .await
        .unwrap_err();
    assert!(matches!(err, KattaError::ShardUnavailable(_)));

    client.close().await;
    cluster.shutdown().await;
}
