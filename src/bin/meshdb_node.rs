/// meshdb node - run one replica of a meshdb cluster.
///
/// Usage:
///   meshdb-node --bind 0.0.0.0:7600
///   meshdb-node --bind 0.0.0.0:7601 --peer tcp://127.0.0.1:7600
///   meshdb-node --bind 0.0.0.0:7602 --node-id node-c \
///       --anti-entropy-secs 30 --strategy users=merge-fields
use anyhow::{Context, Result};
use clap::Parser;
use meshdb::{MemoryStore, MeshConfig, NodeId, ReplicationEngine, Strategy, TcpTransport};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::signal;
use tracing::{info, warn};

#[derive(Parser, Debug)]
#[command(name = "meshdb-node", version, about = "Run a meshdb replica")]
struct Args {
    /// Address to bind the cluster transport on.
    #[arg(long, default_value = "0.0.0.0:7600")]
    bind: SocketAddr,

    /// Peer URL to connect to at startup (repeatable).
    #[arg(long = "peer")]
    peers: Vec<String>,

    /// Explicit node id (random when omitted).
    #[arg(long = "node-id")]
    node_id: Option<String>,

    /// Data reconciliation interval in seconds (disabled when omitted).
    #[arg(long = "anti-entropy-secs")]
    anti_entropy_secs: Option<u64>,

    /// Path-scoped conflict strategy, as `prefix=strategy` (repeatable).
    #[arg(long = "strategy", value_parser = parse_strategy)]
    strategies: Vec<(String, Strategy)>,
}

fn parse_strategy(raw: &str) -> Result<(String, Strategy), String> {
    let (path, name) = raw
        .split_once('=')
        .ok_or_else(|| format!("expected prefix=strategy, got '{}'", raw))?;
    let strategy: Strategy = name.parse().map_err(|e| format!("{}", e))?;
    Ok((path.to_string(), strategy))
}

#[tokio::main]
async fn main() -> Result<()> {
    meshdb::init_logging();
    let args = Args::parse();

    let node_id = match &args.node_id {
        Some(id) => NodeId::new(id.clone()),
        None => NodeId::random(),
    };

    let mut config = MeshConfig::new().node_id(node_id.as_str());
    for peer in args.peers {
        config = config.peer(peer);
    }
    for (path, strategy) in args.strategies {
        config = config.strategy_for(path, strategy);
    }
    if let Some(secs) = args.anti_entropy_secs {
        config = config.anti_entropy_interval(Duration::from_secs(secs));
    }

    let transport = Arc::new(
        TcpTransport::bind(node_id.clone(), args.bind)
            .await
            .with_context(|| format!("failed to bind {}", args.bind))?,
    );
    info!(url = %transport.local_url(), node = %node_id, "listening");

    for peer in &config.peers {
        match transport.connect(peer).await {
            Ok(peer_id) => info!(peer = %peer_id, url = %peer, "connected"),
            // Unreachable peers are fine; they dial us or anti-entropy
            // finds them later.
            Err(e) => warn!(url = %peer, error = %e, "peer connect failed"),
        }
    }

    let engine = ReplicationEngine::start(config, Arc::new(MemoryStore::new()), transport)
        .await
        .context("failed to start replication engine")?;

    signal::ctrl_c().await.context("failed to listen for ctrl-c")?;
    info!("shutting down");

    engine.prepare_shutdown().await;
    engine.close().await.context("clean shutdown failed")?;
    Ok(())
}
