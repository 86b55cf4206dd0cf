use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, Subcommand};
use colored::Colorize;
use katta::{
    protocol::{DeployState, IndexMetaData, IndexState},
    store::{paths, server::create_store_router, MemoryStore, MetaStore, RemoteStore, StoreBackend},
    InvertedEngine, KattaClient, KattaConfig, Master, Node, Query,
};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser, Debug)]
#[command(name = "katta")]
#[command(about = "Katta - a distributed search cluster", long_about = None)]
struct Cli {
    /// Address of the metadata store service (host:port)
    #[arg(long, global = true, default_value = "127.0.0.1:6780")]
    store: String,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Start a master; embeds the metadata store service unless --join
    /// points at a running one (standby mode)
    StartMaster {
        /// Port the embedded store service listens on
        #[arg(long, default_value_t = 6780)]
        port: u16,

        /// Master name (auto-generated if not provided)
        #[arg(long)]
        name: Option<String>,

        /// Join an existing store instead of embedding one
        #[arg(long)]
        join: Option<String>,
    },

    /// Start a worker node
    StartNode {
        /// Search RPC port (0 picks a free port)
        #[arg(long, default_value_t = 0)]
        port: u16,

        /// Hostname other processes reach this node under
        #[arg(long, default_value = "127.0.0.1")]
        host: String,

        /// Node name (auto-generated if not provided)
        #[arg(long)]
        name: Option<String>,
    },

    /// Announce an index for deployment
    AddIndex {
        name: String,
        /// Directory containing one subdirectory per shard
        path: String,
        analyzer: String,
        replication: Option<u32>,
    },

    /// Remove an index; nodes unload its shards
    RemoveIndex { name: String },

    /// Undeploy and deploy an index again
    RedeployIndex { name: String },

    ListIndexes,

    ListNodes,

    /// Show the deploy errors of an index
    ListErrors { name: String },

    /// Dump the cluster structure from the store
    ShowStructure,

    /// Search one or more indexes (comma separated, or *)
    Search {
        index_names: String,
        query: String,
        count: Option<usize>,
    },
}

fn main() {
    let _ = dotenvy::dotenv();

    let cli = match Cli::try_parse() {
        Ok(cli) => cli,
        Err(err) => {
            let _ = err.print();
            std::process::exit(1);
        }
    };

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "katta=info,tower_http=warn".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let runtime = match tokio::runtime::Runtime::new() {
        Ok(runtime) => runtime,
        Err(err) => {
            eprintln!("Failed to start runtime: {}", err);
            std::process::exit(2);
        }
    };

    if let Err(err) = runtime.block_on(run(cli)) {
        eprintln!("{} {}", "Error:".red(), err);
        std::process::exit(2);
    }
}

async fn run(cli: Cli) -> anyhow::Result<()> {
    let config = KattaConfig::from_env();
    match cli.command {
        Command::StartMaster { port, name, join } => {
            start_master(config, port, name, join).await
        }
        Command::StartNode { port, host, name } => {
            start_node(&cli.store, config, port, &host, name).await
        }
        Command::AddIndex {
            name,
            path,
            analyzer,
            replication,
        } => {
            let meta = connect_store(&cli.store, &config).await?;
            let replication = replication.unwrap_or(config.replication_level);
            let index = IndexMetaData::announced(&path, &analyzer, replication);
            let outcome = meta.announce_index(&name, &index).await;
            meta.close().await;
            outcome?;
            println!("Index {} announced with replication {}", name, replication);
            Ok(())
        }
        Command::RemoveIndex { name } => {
            let meta = connect_store(&cli.store, &config).await?;
            let outcome = remove_index(&meta, &name).await;
            meta.close().await;
            outcome
        }
        Command::RedeployIndex { name } => {
            let meta = connect_store(&cli.store, &config).await?;
            let outcome = redeploy_index(&meta, &name).await;
            meta.close().await;
            outcome
        }
        Command::ListIndexes => {
            let meta = connect_store(&cli.store, &config).await?;
            let outcome = list_indexes(&meta).await;
            meta.close().await;
            outcome
        }
        Command::ListNodes => {
            let meta = connect_store(&cli.store, &config).await?;
            let outcome = list_nodes(&meta).await;
            meta.close().await;
            outcome
        }
        Command::ListErrors { name } => {
            let meta = connect_store(&cli.store, &config).await?;
            let outcome = list_errors(&meta, &name).await;
            meta.close().await;
            outcome
        }
        Command::ShowStructure => {
            let meta = connect_store(&cli.store, &config).await?;
            let outcome = show_structure(&meta).await;
            meta.close().await;
            outcome
        }
        Command::Search {
            index_names,
            query,
            count,
        } => search(&cli.store, config, &index_names, &query, count).await,
    }
}

async fn connect_store(addr: &str, config: &KattaConfig) -> anyhow::Result<Arc<MetaStore>> {
    let backend: Arc<dyn StoreBackend> = Arc::new(RemoteStore::new(addr));
    let meta = MetaStore::connect(backend, Duration::from_millis(config.poll_timeout_ms)).await?;
    meta.create_default_structure().await?;
    Ok(meta)
}

async fn start_master(
    config: KattaConfig,
    port: u16,
    name: Option<String>,
    join: Option<String>,
) -> anyhow::Result<()> {
    let name = name.unwrap_or_else(KattaConfig::default_node_name);

    let backend: Arc<dyn StoreBackend> = match join {
        Some(addr) => {
            tracing::info!(store = %addr, "Joining existing store as standby master");
            Arc::new(RemoteStore::new(&addr))
        }
        None => {
            let store = Arc::new(MemoryStore::new());
            let _ = store.start_expiry(Duration::from_millis(config.session_timeout_ms));
            let listener = tokio::net::TcpListener::bind(("0.0.0.0", port)).await?;
            tracing::info!(port, "Embedded store service listening");
            let router = create_store_router(Arc::clone(&store));
            tokio::spawn(async move {
                if let Err(err) = axum::serve(listener, router).await {
                    tracing::error!(error = %err, "Store service failed");
                }
            });
            store
        }
    };

    let master = Master::start(backend, config, &name).await?;
    tracing::info!(master = %name, "Master running, ctrl-c to stop");
    tokio::signal::ctrl_c().await?;
    master.shutdown().await;
    Ok(())
}

async fn start_node(
    store_addr: &str,
    config: KattaConfig,
    port: u16,
    host: &str,
    name: Option<String>,
) -> anyhow::Result<()> {
    let name = name.unwrap_or_else(KattaConfig::default_node_name);
    let backend: Arc<dyn StoreBackend> = Arc::new(RemoteStore::new(store_addr));
    let node = Node::start(backend, Arc::new(InvertedEngine), config, &name, host, port).await?;
    tracing::info!(node = %name, addr = %node.rpc_addr(), "Node running, ctrl-c to stop");
    tokio::signal::ctrl_c().await?;
    node.shutdown().await;
    Ok(())
}

async fn remove_index(meta: &Arc<MetaStore>, name: &str) -> anyhow::Result<()> {
    if !meta.exists(&paths::index(name)).await? {
        anyhow::bail!("index {} does not exist", name);
    }
    meta.remove_index_metadata(name).await?;
    println!("Index {} removed", name);
    Ok(())
}

async fn redeploy_index(meta: &Arc<MetaStore>, name: &str) -> anyhow::Result<()> {
    if !meta.exists(&paths::index(name)).await? {
        anyhow::bail!("index {} does not exist", name);
    }
    // Retract every assignment, then re-announce; the master deploys it
    // again from scratch
    for node in meta.assignment_nodes().await? {
        for shard in meta.assignments(&node).await? {
            if katta::protocol::index_of_shard(&shard) == name {
                meta.unassign_shard(&node, &shard).await?;
            }
        }
    }
    meta.update_json(&paths::index(name), |mut index: IndexMetaData| {
        index.state = IndexState::Announced;
        index.error_message = None;
        index
    })
    .await?;
    println!("Index {} redeploying", name);
    Ok(())
}

fn state_label(state: IndexState) -> colored::ColoredString {
    match state {
        IndexState::Deployed => state.to_string().green(),
        IndexState::DeployError => state.to_string().red(),
        _ => state.to_string().yellow(),
    }
}

async fn list_indexes(meta: &Arc<MetaStore>) -> anyhow::Result<()> {
    let indexes = meta.indexes().await?;
    if indexes.is_empty() {
        println!("No indexes");
        return Ok(());
    }
    for name in indexes {
        let index = meta.index_metadata(&name).await?;
        let shards = meta.shards_of_index(&name).await?;
        println!(
            "{:<24} {:<12} replication={} shards={} path={}",
            name,
            state_label(index.state),
            index.replication_level,
            shards.len(),
            index.path
        );
        if let Some(message) = index.error_message {
            println!("    error: {}", message.red());
        }
    }
    Ok(())
}

async fn list_nodes(meta: &Arc<MetaStore>) -> anyhow::Result<()> {
    let nodes = meta.live_nodes().await?;
    if nodes.is_empty() {
        println!("No live nodes");
        return Ok(());
    }
    for name in nodes {
        let node = meta.node_metadata(&name).await?;
        let health = if node.healthy {
            "healthy".green()
        } else {
            "unhealthy".red()
        };
        let shards = meta.assignments(&name).await?;
        println!(
            "{:<24} {:<21} {:<10} shards={} status={}",
            name,
            node.addr(),
            health,
            shards.len(),
            node.status
        );
    }
    Ok(())
}

async fn list_errors(meta: &Arc<MetaStore>, name: &str) -> anyhow::Result<()> {
    let index = meta.index_metadata(name).await?;
    println!("{:<24} {}", name, state_label(index.state));
    if let Some(message) = &index.error_message {
        println!("    {}", message.red());
    }
    let mut found = false;
    for shard in meta.shards_of_index(name).await? {
        for node in meta.nodes_serving(&shard).await? {
            let record = meta.deployment(&shard, &node).await?;
            if record.state == DeployState::Error {
                found = true;
                println!(
                    "    {} on {}: {}",
                    shard,
                    node,
                    record.error_message.unwrap_or_default().red()
                );
            }
        }
    }
    if !found {
        println!("    no shard errors");
    }
    Ok(())
}

async fn show_structure(meta: &Arc<MetaStore>) -> anyhow::Result<()> {
    match meta.current_master().await? {
        Some(master) => println!("master: {}", master),
        None => println!("master: {}", "none".red()),
    }

    println!("nodes:");
    for node in meta.live_nodes().await? {
        println!("  {}", node);
        for shard in meta.assignments(&node).await? {
            println!("    {}", shard);
        }
    }

    println!("indexes:");
    for index in meta.indexes().await? {
        let metadata = meta.index_metadata(&index).await?;
        println!("  {} [{}]", index, state_label(metadata.state));
        for shard in meta.shards_of_index(&index).await? {
            println!("    {}", shard);
            for node in meta.nodes_serving(&shard).await? {
                let record = meta.deployment(&shard, &node).await?;
                println!("      {} [{}]", node, record.state);
            }
        }
    }
    Ok(())
}

async fn search(
    store_addr: &str,
    config: KattaConfig,
    index_names: &str,
    query_text: &str,
    count: Option<usize>,
) -> anyhow::Result<()> {
    let backend: Arc<dyn StoreBackend> = Arc::new(RemoteStore::new(store_addr));
    let client = KattaClient::connect(backend, config).await?;
    let indexes: Vec<String> = index_names
        .split(',')
        .map(|name| name.trim().to_string())
        .filter(|name| !name.is_empty())
        .collect();
    let limit = count.unwrap_or(10);
    let query = Query::new(query_text);

    let results = client.search(&indexes, &query, limit, None).await;
    let results = match results {
        Ok(results) => results,
        Err(err) => {
            client.close().await;
            return Err(err.into());
        }
    };

    println!("{} hits (showing up to {})", results.total_hits, limit);
    if !results.timed_out_shards.is_empty() {
        println!(
            "{} partial counts, shards over budget: {}",
            "warning:".yellow(),
            results.timed_out_shards.join(", ")
        );
    }
    for (rank, hit) in results.hits.iter().enumerate() {
        println!(
            "{:>3}. {:<28} doc={:<8} score={:.4} node={}",
            rank + 1,
            hit.shard,
            hit.doc_id,
            hit.score,
            hit.node
        );
    }
    client.close().await;
    Ok(())
}
