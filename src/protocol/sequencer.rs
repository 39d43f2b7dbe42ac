//! Shared-schedule walker.
//!
//! Every node holds the same ordered operation list and a local cursor.
//! The owner of the current entry performs it; completion is announced
//! with an operation-finished flood that every node relays once, so all
//! cursors advance in lockstep. Between operations each node waits the
//! configured minimum delay before looking at the schedule again.

use std::collections::HashSet;

use tracing::{debug, info};

use crate::types::{NodeId, OpKind, Operation, SequenceNumber};

/// What the schedule asks of this node at the current cursor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Evaluation {
    /// Current entry is another node's, or already handled: wait.
    Waiting,
    /// The whole schedule has been walked.
    Finished,
    /// This node owns the current entry: start a checkpoint with this
    /// sequence number.
    StartCheckpoint(SequenceNumber),
    /// This node owns the current entry: recovery placeholder, complete
    /// immediately.
    RecoverNow,
}

/// Per-node view of the shared operation schedule.
pub struct OperationSequencer {
    node_id: NodeId,
    schedule: Vec<Operation>,
    cursor: usize,
    processed: HashSet<usize>,
}

impl OperationSequencer {
    /// Create a sequencer at the start of `schedule`.
    pub fn new(node_id: NodeId, schedule: Vec<Operation>) -> Self {
        Self {
            node_id,
            schedule,
            cursor: 0,
            processed: HashSet::new(),
        }
    }

    /// Current schedule index.
    pub fn cursor(&self) -> usize {
        self.cursor
    }

    /// Whether the cursor has walked past the last entry.
    pub fn is_finished(&self) -> bool {
        self.cursor >= self.schedule.len()
    }

    /// Look at the current entry and decide what to do.
    ///
    /// Owning the current unprocessed entry marks it processed right
    /// away; the cursor advances only on completion.
    pub fn evaluate(&mut self) -> Evaluation {
        if self.is_finished() {
            info!(node_id = self.node_id, "completed all operations");
            return Evaluation::Finished;
        }
        if self.processed.contains(&self.cursor) {
            debug!(node_id = self.node_id, index = self.cursor, "operation already processed");
            return Evaluation::Waiting;
        }

        let op = self.schedule[self.cursor];
        debug!(
            node_id = self.node_id,
            index = self.cursor,
            owner = op.owner,
            kind = ?op.kind,
            "checking operation"
        );
        if op.owner != self.node_id {
            return Evaluation::Waiting;
        }

        self.processed.insert(self.cursor);
        match op.kind {
            OpKind::Checkpoint => {
                let seq = (self.cursor + 1) as SequenceNumber;
                info!(node_id = self.node_id, index = self.cursor, seq, "starting checkpoint operation");
                Evaluation::StartCheckpoint(seq)
            }
            OpKind::Recovery => {
                info!(node_id = self.node_id, index = self.cursor, "recovery placeholder, completing");
                Evaluation::RecoverNow
            }
        }
    }

    /// Mark the current entry complete and advance the cursor.
    ///
    /// Returns the index that completed, which the caller announces to
    /// every neighbor.
    pub fn complete_current(&mut self) -> usize {
        let index = self.cursor;
        self.processed.insert(index);
        self.cursor += 1;
        info!(node_id = self.node_id, completed = index, cursor = self.cursor, "operation complete");
        index
    }

    /// Handle a completion flood for `op_index` originated by `from`.
    ///
    /// Returns `true` when the flood was accepted: the entry is marked
    /// processed and the cursor advances, and the caller relays the
    /// original message to every neighbor except the originator.
    /// Non-current and already-processed indices are dropped.
    pub fn handle_finished(&mut self, from: NodeId, op_index: usize) -> bool {
        if op_index != self.cursor {
            debug!(
                node_id = self.node_id,
                op_index,
                cursor = self.cursor,
                "ignoring completion for another index"
            );
            return false;
        }
        if self.processed.contains(&op_index) {
            debug!(node_id = self.node_id, op_index, "completion already processed");
            return false;
        }

        info!(node_id = self.node_id, op_index, from, "operation completed remotely");
        self.processed.insert(op_index);
        self.cursor += 1;
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_owner_starts_checkpoint_with_index_based_seq() {
        let mut seq = OperationSequencer::new(2, vec![Operation::checkpoint(2)]);
        assert_eq!(seq.evaluate(), Evaluation::StartCheckpoint(1));
        // Processed immediately, so a second look waits for completion.
        assert_eq!(seq.evaluate(), Evaluation::Waiting);
        assert_eq!(seq.cursor(), 0);
    }

    #[test]
    fn test_non_owner_waits() {
        let mut seq = OperationSequencer::new(0, vec![Operation::checkpoint(2)]);
        assert_eq!(seq.evaluate(), Evaluation::Waiting);
        assert_eq!(seq.evaluate(), Evaluation::Waiting);
    }

    #[test]
    fn test_recovery_completes_immediately() {
        let mut seq = OperationSequencer::new(1, vec![Operation::recovery(1), Operation::checkpoint(1)]);
        assert_eq!(seq.evaluate(), Evaluation::RecoverNow);
        assert_eq!(seq.complete_current(), 0);
        assert_eq!(seq.evaluate(), Evaluation::StartCheckpoint(2));
    }

    #[test]
    fn test_remote_completion_advances_cursor_once() {
        let mut seq = OperationSequencer::new(0, vec![Operation::checkpoint(2), Operation::checkpoint(0)]);

        assert!(seq.handle_finished(2, 0));
        assert_eq!(seq.cursor(), 1);

        // Relayed duplicates and stale indices are dropped.
        assert!(!seq.handle_finished(1, 0));
        assert!(!seq.handle_finished(2, 5));
        assert_eq!(seq.cursor(), 1);
    }

    #[test]
    fn test_schedule_end() {
        let mut seq = OperationSequencer::new(0, vec![Operation::recovery(0)]);
        assert_eq!(seq.evaluate(), Evaluation::RecoverNow);
        seq.complete_current();
        assert!(seq.is_finished());
        assert_eq!(seq.evaluate(), Evaluation::Finished);
    }

    #[test]
    fn test_empty_schedule_is_finished() {
        let mut seq = OperationSequencer::new(0, Vec::new());
        assert!(seq.is_finished());
        assert_eq!(seq.evaluate(), Evaluation::Finished);
    }
}
