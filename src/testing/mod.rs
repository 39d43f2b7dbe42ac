//! Testing utilities for the checkpoint protocol.
//!
//! The pieces here let tests run whole clusters inside one process
//! with full control over message delivery:
//! - [`ClusterSim`] wires engines together through a FIFO queue
//! - [`MemorySnapshotStore`] records artifact transitions in memory
//!
//! # Example
//!
//! ```rust
//! use kt_checkpoint::testing::ClusterSim;
//! use kt_checkpoint::types::Operation;
//!
//! // Two nodes joined by one edge; node 0 checkpoints once.
//! let mut sim = ClusterSim::new(vec![vec![1], vec![0]], vec![Operation::checkpoint(0)]);
//! sim.run_schedule();
//!
//! assert!(sim.all_finished());
//! assert_eq!(sim.store(0).permanent_seqs(), vec![1]);
//! assert_eq!(sim.store(1).permanent_seqs(), vec![1]);
//! ```


use std::collections::{BTreeMap, VecDeque};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;

use crate::config::{ClusterConfig, NodeAddr};
use crate::error::SnapshotError;
use crate::network::wire::Message;
use crate::protocol::{Engine, Outbox};
use crate::snapshot::{CheckpointArtifact, SnapshotStore};
use crate::types::{NodeId, Operation, SequenceNumber};

/// Deliveries after which [`ClusterSim::run_to_quiet`] declares a
/// runaway flood and panics.
const MAX_DELIVERIES: usize = 10_000;

/// In-memory artifact store.
///
/// Mirrors the file store's contract, including `NotFound` from commit
/// and discard when no tentative artifact is held.
#[derive(Debug, Default)]
pub struct MemorySnapshotStore {
    state: Mutex<MemoryState>,
}

#[derive(Debug, Default)]
struct MemoryState {
    tentative: Option<CheckpointArtifact>,
    permanent: BTreeMap<SequenceNumber, CheckpointArtifact>,
}

impl MemorySnapshotStore {
    /// Sequences with a permanent artifact, ascending.
    pub fn permanent_seqs(&self) -> Vec<SequenceNumber> {
        self.state.lock().permanent.keys().copied().collect()
    }

    /// The permanent artifact for `seq`, if any.
    pub fn permanent(&self, seq: SequenceNumber) -> Option<CheckpointArtifact> {
        self.state.lock().permanent.get(&seq).cloned()
    }

    /// Whether a tentative artifact is currently held.
    pub fn has_tentative(&self) -> bool {
        self.state.lock().tentative.is_some()
    }
}

impl SnapshotStore for MemorySnapshotStore {
    fn write_tentative(&self, artifact: &CheckpointArtifact) -> Result<(), SnapshotError> {
        self.state.lock().tentative = Some(artifact.clone());
        Ok(())
    }

    fn commit_tentative(&self, seq: SequenceNumber) -> Result<(), SnapshotError> {
        let mut state = self.state.lock();
        let artifact = state.tentative.take().ok_or(SnapshotError::NotFound(seq))?;
        state.permanent.insert(seq, artifact);
        Ok(())
    }

    fn discard_tentative(&self, seq: SequenceNumber) -> Result<(), SnapshotError> {
        let mut state = self.state.lock();
        state.tentative.take().ok_or(SnapshotError::NotFound(seq))?;
        Ok(())
    }
}

/// Deterministic in-process cluster.
///
/// Every node is a bare [`Engine`]; messages travel through one FIFO
/// queue instead of sockets, so a test decides exactly when each frame
/// is delivered and can inject frames of its own.
pub struct ClusterSim {
    engines: Vec<Engine>,
    stores: Vec<Arc<MemorySnapshotStore>>,
    pending: VecDeque<(NodeId, Message)>,
}

impl ClusterSim {
    /// Build a cluster from neighbor lists and a shared schedule.
    pub fn new(neighbors: Vec<Vec<NodeId>>, operations: Vec<Operation>) -> Self {
        let num_nodes = neighbors.len();
        let config = Arc::new(ClusterConfig {
            num_nodes,
            min_delay: Duration::ZERO,
            nodes: (0..num_nodes as NodeId)
                .map(|id| NodeAddr {
                    id,
                    host: "localhost".to_string(),
                    port: 7000 + id as u16,
                })
                .collect(),
            neighbors,
            operations,
            snapshot_dir: PathBuf::from("unused"),
        });

        let mut engines = Vec::with_capacity(num_nodes);
        let mut stores = Vec::with_capacity(num_nodes);
        for id in 0..num_nodes as NodeId {
            let store = Arc::new(MemorySnapshotStore::default());
            engines.push(Engine::new(id, Arc::clone(&config), Arc::clone(&store) as _));
            stores.push(store);
        }

        Self {
            engines,
            stores,
            pending: VecDeque::new(),
        }
    }

    /// Number of nodes.
    pub fn node_count(&self) -> usize {
        self.engines.len()
    }

    /// The engine of `id`, for state assertions.
    pub fn engine(&self, id: NodeId) -> &Engine {
        &self.engines[id as usize]
    }

    /// The artifact store of `id`.
    pub fn store(&self, id: NodeId) -> &MemorySnapshotStore {
        &self.stores[id as usize]
    }

    /// Messages queued but not yet delivered.
    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    /// Let `id` look at the schedule now.
    pub fn tick(&mut self, id: NodeId) {
        let outbox = self.engines[id as usize].tick_schedule();
        self.enqueue(outbox);
    }

    /// Have `from` emit one application message to `to`.
    pub fn send_application(&mut self, from: NodeId, to: NodeId) {
        let outbox = self.engines[from as usize].send_application(to);
        self.enqueue(outbox);
    }

    /// Queue an arbitrary frame for delivery to `to`.
    pub fn inject(&mut self, to: NodeId, msg: Message) {
        self.pending.push_back((to, msg));
    }

    /// Deliver the oldest queued message. False when none are queued.
    pub fn step(&mut self) -> bool {
        let Some((to, msg)) = self.pending.pop_front() else {
            return false;
        };
        let outbox = self.engines[to as usize].handle_message(&msg);
        self.enqueue(outbox);
        true
    }

    /// Deliver queued messages until none remain, returning the count.
    ///
    /// Panics after [`MAX_DELIVERIES`] messages; a healthy run always
    /// drains.
    pub fn run_to_quiet(&mut self) -> usize {
        let mut delivered = 0;
        while self.step() {
            delivered += 1;
            assert!(
                delivered <= MAX_DELIVERIES,
                "message flood did not terminate"
            );
        }
        delivered
    }

    /// Walk the whole schedule: alternate schedule ticks on every node
    /// with full drains, as the delay timers would, until a tick round
    /// leaves the cluster quiet. Returns the total deliveries.
    pub fn run_schedule(&mut self) -> usize {
        let mut delivered = self.run_to_quiet();
        loop {
            let mut active = false;
            for id in 0..self.engines.len() {
                let outbox = self.engines[id].tick_schedule();
                active |= !outbox.messages.is_empty() || outbox.reschedule;
                self.enqueue(outbox);
            }
            delivered += self.run_to_quiet();
            if !active {
                return delivered;
            }
        }
    }

    /// Whether every node has walked off the end of the schedule.
    pub fn all_finished(&self) -> bool {
        self.engines.iter().all(|e| e.sequencer().is_finished())
    }

    fn enqueue(&mut self, outbox: Outbox) {
        for (to, msg) in outbox.messages {
            self.pending.push_back((to, msg));
        }
    }
}
