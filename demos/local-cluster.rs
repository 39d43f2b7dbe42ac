//! Example of a 3-node checkpointing cluster in one process.
//!
//! Run with:
//!   RUST_LOG=info cargo run --example local-cluster
//!
//! Three nodes form a line; nodes 0 and 2 each take one cluster-wide
//! checkpoint. Permanent artifacts land in a temp directory.

use kt_checkpoint::{ClusterConfig, Node};
use std::time::Duration;

const CLUSTER: &str = "\
# three nodes in a line, checkpoints from both ends
3 300

0 127.0.0.1 9400
1 127.0.0.1 9401
2 127.0.0.1 9402

1
0 2
1

(0, c)
(2, c)
";

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "kt_checkpoint=info".to_string()),
        )
        .init();

    let dir = std::env::temp_dir().join("kt-checkpoint-demo");
    let _ = std::fs::remove_dir_all(&dir);

    let config = ClusterConfig::parse(CLUSTER)?.with_snapshot_dir(&dir);

    println!("Starting 3 nodes, artifacts land in {}", dir.display());

    let (a, b, c) = tokio::join!(
        Node::start(0, config.clone()),
        Node::start(1, config.clone()),
        Node::start(2, config.clone()),
    );
    let nodes = vec![a?, b?, c?];

    // Two checkpoints are scheduled, so each node should end up with
    // permanent artifacts for sequences 1 and 2.
    let expected: Vec<String> = (0..3)
        .flat_map(|id| (1..=2).map(move |seq| format!("node{id}_seq{seq}.ckpt")))
        .collect();

    for i in 1..=30 {
        tokio::time::sleep(Duration::from_secs(1)).await;

        let done = expected.iter().filter(|f| dir.join(f).exists()).count();
        println!("[{i:2}s] {done}/{} permanent checkpoints", expected.len());

        if done == expected.len() {
            break;
        }
    }

    for node in nodes {
        node.shutdown().await;
    }

    println!("Done.");
    Ok(())
}
