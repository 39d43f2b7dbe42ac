//! Vector clock tracking causal time at one node.

use std::fmt;

use crate::types::NodeId;

/// Per-node vector clock.
///
/// Entry `i` is this node's view of node `i`'s event count. The owning
/// node's entry strictly increases on every local event and on every
/// merge; all entries are monotone non-decreasing.
///
/// The clock is a plain struct: the dispatcher task is its only mutator,
/// so no locking is needed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VectorClock {
    owner: NodeId,
    entries: Vec<u64>,
}

impl VectorClock {
    /// Create a zeroed clock for `owner` in a cluster of `num_nodes`.
    pub fn new(num_nodes: usize, owner: NodeId) -> Self {
        Self {
            owner,
            entries: vec![0; num_nodes],
        }
    }

    /// Record a local event: increment the owner's entry.
    ///
    /// Called when emitting an application message. Protocol messages do
    /// not tick; they advance the clock only through `merge` on receipt.
    pub fn tick(&mut self) {
        self.entries[self.owner as usize] += 1;
    }

    /// Fold a received clock snapshot into this one.
    ///
    /// Every entry becomes the elementwise max of the local and received
    /// values, then the owner's entry is incremented to mark the receive
    /// event itself. Applied on receipt of every message, protocol
    /// traffic included.
    pub fn merge(&mut self, received: &[u64]) {
        for (local, incoming) in self.entries.iter_mut().zip(received) {
            if *incoming > *local {
                *local = *incoming;
            }
        }
        self.entries[self.owner as usize] += 1;
    }

    /// Immutable copy of the current entries.
    pub fn snapshot(&self) -> Vec<u64> {
        self.entries.clone()
    }

    /// The node that owns this clock.
    pub fn owner(&self) -> NodeId {
        self.owner
    }
}

impl fmt::Display for VectorClock {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[")?;
        for (i, v) in self.entries.iter().enumerate() {
            if i > 0 {
                write!(f, " ")?;
            }
            write!(f, "{v}")?;
        }
        write!(f, "]")
    }
}
