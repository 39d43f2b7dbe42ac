//! Process-lifetime record of applied checkpoint decisions.

use std::collections::HashSet;

use crate::types::{DecisionKind, SequenceNumber};

/// Dedup record for flooded decisions.
///
/// An entry, once recorded, stays for the process lifetime. This is
/// what stops commit and abort floods from circulating forever in
/// cyclic topologies. Commit and abort for the same sequence are
/// tracked as distinct entries.
#[derive(Debug, Default)]
pub struct DecisionLedger {
    seen: HashSet<(DecisionKind, SequenceNumber)>,
}

impl DecisionLedger {
    /// Create an empty ledger.
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a decision. Returns `false` when it was already recorded.
    pub fn record(&mut self, kind: DecisionKind, seq: SequenceNumber) -> bool {
        self.seen.insert((kind, seq))
    }

    /// Whether this decision has already been recorded.
    pub fn contains(&self, kind: DecisionKind, seq: SequenceNumber) -> bool {
        self.seen.contains(&(kind, seq))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_record_is_idempotent() {
        let mut ledger = DecisionLedger::new();
        assert!(ledger.record(DecisionKind::Commit, 1));
        assert!(!ledger.record(DecisionKind::Commit, 1));
        assert!(ledger.contains(DecisionKind::Commit, 1));
    }

    #[test]
    fn test_commit_and_abort_tracked_separately() {
        let mut ledger = DecisionLedger::new();
        assert!(ledger.record(DecisionKind::Commit, 2));
        assert!(ledger.record(DecisionKind::Abort, 2));
        assert!(!ledger.contains(DecisionKind::Commit, 3));
    }
}
