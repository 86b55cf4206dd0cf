//! Coordination-plane scenarios: deployment, replication repair, master
//! failover and index removal against an in-process cluster.

mod common;

use std::collections::HashSet;
use std::time::Duration;

use common::{sample_docs, TestCluster};
use katta::error::KattaError;
use katta::protocol::IndexState;

#[tokio::test]
async fn test_deploy_with_replication() {
    let cluster = TestCluster::start(3).await;
    cluster
        .add_index("wiki", &[sample_docs(4, "a"), sample_docs(4, "b")], 2)
        .await;

    assert!(
        cluster
            .wait_for_index_state("wiki", IndexState::Deployed, Duration::from_secs(15))
            .await,
        "index never reached DEPLOYED"
    );

    let shards = cluster.admin.shards_of_index("wiki").await.unwrap();
    assert_eq!(shards.len(), 2);
    for shard in &shards {
        let replicas = cluster.open_replicas(shard).await;
        assert_eq!(replicas.len(), 2, "shard {} should have 2 open replicas", shard);
        let distinct: HashSet<&String> = replicas.iter().collect();
        assert_eq!(distinct.len(), 2, "replicas of {} must be on distinct nodes", shard);
    }

    // Every assignment belongs to a live node
    let live: HashSet<String> = cluster.admin.live_nodes().await.unwrap().into_iter().collect();
    for node in cluster.admin.assignment_nodes().await.unwrap() {
        let assigned = cluster.admin.assignments(&node).await.unwrap();
        if !assigned.is_empty() {
            assert!(live.contains(&node), "assignments on dead node {}", node);
        }
    }

    cluster.shutdown().await;
}

#[tokio::test]
async fn test_unreadable_index_source_fails_deploy() {
    let cluster = TestCluster::start(1).await;
    let meta = katta::protocol::IndexMetaData::announced("/nonexistent/source", "simple", 1);
    cluster.admin.announce_index("broken", &meta).await.unwrap();

    assert!(
        cluster
            .wait_for_index_state("broken", IndexState::DeployError, Duration::from_secs(10))
            .await
    );
    let read_back = cluster.admin.index_metadata("broken").await.unwrap();
    assert!(read_back.error_message.unwrap().contains("cannot read"));

    cluster.shutdown().await;
}

#[tokio::test]
async fn test_corrupt_shard_leaves_error_record() {
    let cluster = TestCluster::start(1).await;

    // One shard folder with an unparseable document
    let index_dir = cluster.scratch.path().join("indexes").join("corrupt");
    let shard_dir = index_dir.join("part-0000");
    std::fs::create_dir_all(&shard_dir).unwrap();
    std::fs::write(shard_dir.join("doc.json"), "{not valid json").unwrap();
    let meta =
        katta::protocol::IndexMetaData::announced(index_dir.to_str().unwrap(), "simple", 1);
    cluster.admin.announce_index("corrupt", &meta).await.unwrap();

    assert!(
        cluster
            .wait_for_index_state("corrupt", IndexState::DeployError, Duration::from_secs(15))
            .await
    );

    // The ERROR record stays inspectable
    let shard = "corrupt#part-0000";
    let nodes = cluster.admin.nodes_serving(shard).await.unwrap();
    assert_eq!(nodes.len(), 1);
    let record = cluster.admin.deployment(shard, &nodes[0]).await.unwrap();
    assert_eq!(record.state, katta::protocol::DeployState::Error);
    assert!(record.error_message.unwrap().contains("invalid document"));

    cluster.shutdown().await;
}

#[tokio::test]
async fn test_node_death_triggers_replication_repair() {
    let cluster = TestCluster::start(3).await;
    cluster
        .add_index("wiki", &[sample_docs(4, "a"), sample_docs(4, "b")], 1)
        .await;
    assert!(
        cluster
            .wait_for_index_state("wiki", IndexState::Deployed, Duration::from_secs(15))
            .await
    );

    let shard = "wiki#part-0000";
    let owners = cluster.open_replicas(shard).await;
    assert_eq!(owners.len(), 1);
    let owner = owners[0].clone();
    let victim = cluster
        .nodes
        .iter()
        .find(|n| n.name() == owner)
        .expect("owner node present")
        .clone();

    cluster.kill_node(&victim);

    // A replacement replica opens on a surviving node
    let deadline = std::time::Instant::now() + Duration::from_secs(15);
    let mut replacement = Vec::new();
    while std::time::Instant::now() < deadline {
        replacement = cluster.open_replicas(shard).await;
        if replacement.len() == 1 && replacement[0] != owner {
            break;
        }
        tokio::time::sleep(Duration::from_millis(25)).await;
    }
    assert_eq!(replacement.len(), 1, "shard was not re-replicated");
    assert_ne!(replacement[0], owner, "replica must move to a live node");

    assert!(
        cluster
            .wait_for_index_state("wiki", IndexState::Deployed, Duration::from_secs(10))
            .await,
        "index did not settle back to DEPLOYED"
    );

    cluster.shutdown().await;
}

#[tokio::test]
async fn test_replicas_clamped_to_live_nodes_and_restored() {
    let cluster = TestCluster::start(2).await;
    cluster.add_index("wiki", &[sample_docs(4, "a")], 2).await;
    assert!(
        cluster
            .wait_for_index_state("wiki", IndexState::Deployed, Duration::from_secs(15))
            .await
    );
    let shard = "wiki#part-0000";
    assert!(cluster.wait_for_open_count(shard, 2, Duration::from_secs(10)).await);

    // Lose one node: the remaining replica is the clamped target
    cluster.kill_node(&cluster.nodes[0].clone());
    assert!(cluster.wait_for_open_count(shard, 1, Duration::from_secs(10)).await);
    assert_eq!(cluster.index_state("wiki").await, IndexState::Deployed);

    // A fresh node restores the configured level
    let mut cluster = cluster;
    cluster.start_node("node-extra").await;
    assert!(cluster.wait_for_open_count(shard, 2, Duration::from_secs(15)).await);
    assert!(
        cluster
            .wait_for_index_state("wiki", IndexState::Deployed, Duration::from_secs(10))
            .await
    );

    cluster.shutdown().await;
}

#[tokio::test]
async fn test_master_failover_completes_deploy() {
    // No nodes yet: the deploy cannot finish under the first master
    let mut cluster = TestCluster::start(0).await;
    let primary = cluster.masters[0].clone();
    let deadline = std::time::Instant::now() + Duration::from_secs(5);
    while std::time::Instant::now() < deadline && !primary.is_active() {
        tokio::time::sleep(Duration::from_millis(25)).await;
    }
    assert!(primary.is_active());

    let standby = cluster.start_standby_master("master-1").await;
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert!(!standby.is_active());

    cluster.add_index("wiki", &[sample_docs(4, "a")], 2).await;
    tokio::time::sleep(Duration::from_millis(300)).await;
    assert_ne!(cluster.index_state("wiki").await, IndexState::Deployed);

    cluster.kill_master(&primary);

    let deadline = std::time::Instant::now() + Duration::from_secs(10);
    while std::time::Instant::now() < deadline && !standby.is_active() {
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    assert!(standby.is_active(), "standby never took over");

    cluster.start_node("node-0").await;
    cluster.start_node("node-1").await;
    assert!(
        cluster
            .wait_for_index_state("wiki", IndexState::Deployed, Duration::from_secs(20))
            .await,
        "failover master did not finish the deploy"
    );
    assert_eq!(
        cluster.open_replicas("wiki#part-0000").await.len(),
        2
    );

    cluster.shutdown().await;
}

#[tokio::test]
async fn test_remove_index_unloads_shards() {
    let cluster = TestCluster::start(2).await;
    cluster
        .add_index("wiki", &[sample_docs(4, "a"), sample_docs(4, "b")], 2)
        .await;
    assert!(
        cluster
            .wait_for_index_state("wiki", IndexState::Deployed, Duration::from_secs(15))
            .await
    );

    cluster.admin.remove_index_metadata("wiki").await.unwrap();

    let deadline = std::time::Instant::now() + Duration::from_secs(15);
    loop {
        let loaded: usize = cluster.nodes.iter().map(|n| n.open_shards().len()).sum();
        if loaded == 0 {
            break;
        }
        assert!(
            std::time::Instant::now() < deadline,
            "nodes still hold shards of the removed index"
        );
        tokio::time::sleep(Duration::from_millis(50)).await;
    }

    for node in &cluster.nodes {
        assert!(cluster.admin.assignments(node.name()).await.unwrap().is_empty());
    }
    assert!(cluster.open_replicas("wiki#part-0000").await.is_empty());

    cluster.shutdown().await;
}

#[tokio::test]
async fn test_redeploy_after_state_reset() {
    let cluster = TestCluster::start(2).await;
    cluster.add_index("wiki", &[sample_docs(4, "a")], 2).await;
    assert!(
        cluster
            .wait_for_index_state("wiki", IndexState::Deployed, Duration::from_secs(15))
            .await
    );

    // What redeploy-index does: retract assignments, reset the state
    for node in cluster.admin.assignment_nodes().await.unwrap() {
        for shard in cluster.admin.assignments(&node).await.unwrap() {
            cluster.admin.unassign_shard(&node, &shard).await.unwrap();
        }
    }
    cluster
        .admin
        .update_json(
            &katta::store::paths::index("wiki"),
            |mut meta: katta::protocol::IndexMetaData| {
                meta.state = IndexState::Announced;
                meta.error_message = None;
                meta
            },
        )
        .await
        .unwrap();

    assert!(
        cluster
            .wait_for_index_state("wiki", IndexState::Deployed, Duration::from_secs(20))
            .await,
        "redeploy never converged"
    );
    assert_eq!(cluster.open_replicas("wiki#part-0000").await.len(), 2);

    cluster.shutdown().await;
}

#[tokio::test]
async fn test_add_index_twice_reports_exists() {
    let cluster = TestCluster::start(1).await;
    cluster.add_index("wiki", &[sample_docs(2, "a")], 1).await;

    let meta = katta::protocol::IndexMetaData::announced("/elsewhere", "simple", 1);
    let err = cluster.admin.announce_index("wiki", &meta).await.unwrap_err();
    assert!(matches!(err, KattaError::PathExists(_)));

    cluster.shutdown().await;
}
