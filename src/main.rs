//! Cluster node binary: runs one checkpointing node until interrupted.

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Parser;
use tokio::signal;
use tracing::info;
use tracing_subscriber::EnvFilter;

use kt_checkpoint::{ClusterConfig, Node, NodeId};

#[derive(Parser)]
#[command(name = "kt-node")]
#[command(version)]
#[command(about = "Coordinated checkpointing cluster node")]
struct Cli {
    /// Path to the cluster configuration file, shared by all nodes
    config: PathBuf,

    /// This node's id within the configuration
    node_id: NodeId,

    /// Directory checkpoint artifacts are written to
    #[arg(long, default_value = "checkpoints")]
    snapshot_dir: PathBuf,

    /// Verbose output
    #[arg(short, long)]
    verbose: bool,
}

fn setup_logging(verbose: bool) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(if verbose { "debug" } else { "info" }));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    setup_logging(cli.verbose);

    let config = ClusterConfig::load(&cli.config)
        .with_context(|| format!("loading cluster config from {}", cli.config.display()))?
        .with_snapshot_dir(&cli.snapshot_dir);

    if cli.node_id as usize >= config.num_nodes {
        anyhow::bail!(
            "node id {} out of range, cluster has {} nodes",
            cli.node_id,
            config.num_nodes
        );
    }

    info!(
        node_id = cli.node_id,
        nodes = config.num_nodes,
        operations = config.operations.len(),
        "configuration loaded"
    );

    let node = Node::start(cli.node_id, config)
        .await
        .context("starting node")?;

    signal::ctrl_c().await.context("waiting for interrupt")?;
    node.shutdown().await;

    Ok(())
}
