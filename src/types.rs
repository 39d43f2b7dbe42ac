//! Core types shared across the checkpointing node.

use serde::{Deserialize, Serialize};

/// Node identifier in the cluster.
///
/// Ids are assigned in the cluster configuration file and double as
/// indices into vector clocks, so they must be dense starting at 0.
pub type NodeId = u64;

/// Checkpoint sequence number. Sequence `k` corresponds to the k-th
/// entry of the shared operation schedule (1-based).
pub type SequenceNumber = u64;

/// Kind of a scheduled cluster operation.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum OpKind {
    /// Take a coordinated checkpoint.
    Checkpoint,
    /// Placeholder for rollback recovery. Completes immediately with no
    /// local effect; only the schedule advances.
    Recovery,
}

/// One entry of the shared operation schedule: which node initiates,
/// and what it initiates. The schedule is identical on every node.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct Operation {
    /// Node that initiates this operation.
    pub owner: NodeId,
    /// What the owner initiates.
    pub kind: OpKind,
}

impl Operation {
    /// Create a checkpoint operation owned by `owner`.
    pub fn checkpoint(owner: NodeId) -> Self {
        Self {
            owner,
            kind: OpKind::Checkpoint,
        }
    }

    /// Create a recovery operation owned by `owner`.
    pub fn recovery(owner: NodeId) -> Self {
        Self {
            owner,
            kind: OpKind::Recovery,
        }
    }
}

/// A participant's vote on a tentative checkpoint.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum Vote {
    /// Willing to commit: the local tentative checkpoint succeeded and
    /// every downstream participant voted yes.
    Yes,
    /// Unwilling: busy with another session, or a downstream no.
    No,
}

impl Vote {
    /// Whether this vote allows a commit.
    pub fn is_yes(&self) -> bool {
        matches!(self, Vote::Yes)
    }
}

/// Outcome of a checkpoint session, flooded by the initiator.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum DecisionKind {
    /// All participants voted yes; tentative checkpoints become permanent.
    Commit,
    /// At least one participant voted no; tentative checkpoints are dropped.
    Abort,
}

impl DecisionKind {
    /// Short label for log output.
    pub fn as_str(&self) -> &'static str {
        match self {
            DecisionKind::Commit => "commit",
            DecisionKind::Abort => "abort",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_operation_constructors() {
        let op = Operation::checkpoint(2);
        assert_eq!(op.owner, 2);
        assert_eq!(op.kind, OpKind::Checkpoint);

        let op = Operation::recovery(0);
        assert_eq!(op.owner, 0);
        assert_eq!(op.kind, OpKind::Recovery);
    }

    #[test]
    fn test_operation_serialization() {
        let op = Operation::checkpoint(3);
        let bytes = bincode::serialize(&op).unwrap();
        let decoded: Operation = bincode::deserialize(&bytes).unwrap();
        assert_eq!(op, decoded);
    }

    #[test]
    fn test_vote_is_yes() {
        assert!(Vote::Yes.is_yes());
        assert!(!Vote::No.is_yes());
    }

    #[test]
    fn test_decision_labels() {
        assert_eq!(DecisionKind::Commit.as_str(), "commit");
        assert_eq!(DecisionKind::Abort.as_str(), "abort");
    }
}
