//! Coordinated checkpointing for a fixed cluster of communicating nodes.
//!
//! This crate implements a two-phase, tree-structured checkpoint
//! protocol over point-to-point TCP links:
//! - **Vector clocks** to order events, merged on every received frame
//! - **Two-phase voting** so a checkpoint commits everywhere or nowhere
//! - **Flood-based sequencing** to walk a shared operation schedule
//! - **Mailbox dispatch** so all protocol state mutates on one task
//!
//! # Example
//!
//! ```rust,no_run
//! use kt_checkpoint::{ClusterConfig, Node};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     // Same file on every node; the id selects our row.
//!     let config = ClusterConfig::load("cluster.cfg")?;
//!
//!     let node = Node::start(0, config).await?;
//!
//!     tokio::signal::ctrl_c().await?;
//!     node.shutdown().await;
//!     Ok(())
//! }
//! ```
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────┐
//! │            Operation schedule               │
//! │    (0,c) (2,r) ... identical on every node  │
//! └─────────────────────────────────────────────┘
//!                      │
//!                      ▼
//! ┌─────────────────────────────────────────────┐
//! │           Dispatcher (one task)             │
//! │  mailbox of inbound frames, app traffic and │
//! │  schedule ticks, applied in arrival order   │
//! └─────────────────────────────────────────────┘
//!        │               │               │
//!        ▼               ▼               ▼
//! ┌────────────┐  ┌─────────────┐  ┌───────────┐
//! │   Vector   │  │ Checkpoint  │  │ Operation │
//! │   Clock    │  │ Coordinator │  │ Sequencer │
//! └────────────┘  └─────────────┘  └───────────┘
//!                        │
//!                        ▼
//!               ┌─────────────────┐
//!               │  SnapshotStore  │
//!               │ tentative/commit│
//!               └─────────────────┘
//! ```
//!
//! # Checkpoint protocol
//!
//! A node whose schedule entry comes up freezes its clock, writes a
//! tentative snapshot and asks its neighbors to join. Requests induce
//! a spanning tree over the connectivity graph: the first request a
//! node sees makes the sender its parent, later requests for the same
//! instance are answered with an immediate yes, and requests for a
//! different instance are refused while busy. Votes aggregate up the
//! tree; the initiator commits only if nobody refused, and the
//! decision floods back out along the same edges. Every node ends up
//! with the same outcome: the tentative snapshot either becomes
//! permanent on all participants or is dropped on all of them.

pub mod clock;
pub mod config;
pub mod error;
pub mod network;
pub mod node;
pub mod protocol;
pub mod snapshot;
pub mod testing;
pub mod types;

// Re-export main types for convenience
pub use clock::VectorClock;
pub use config::{ClusterConfig, NodeAddr};
pub use error::{Error, Result};
pub use node::Node;
pub use types::{DecisionKind, NodeId, OpKind, Operation, SequenceNumber, Vote};

// Re-export protocol types
pub use protocol::{
    CheckpointCoordinator, Dispatcher, Engine, Event, EventSender, OperationSequencer,
};

// Re-export network types
pub use network::{Message, MessageBody, NetworkServer, TcpTransport, Transport, TransportConfig};

// Re-export snapshot types
pub use snapshot::{CheckpointArtifact, FileSnapshotStore, SnapshotStore};
