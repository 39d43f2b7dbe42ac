//! Two-phase checkpoint session state machine.
//!
//! One node runs at most one session at a time. The initiator freezes
//! its clock, takes a tentative checkpoint and floods requests; every
//! joining node does the same toward its remaining neighbors, with the
//! first requester as its parent in the induced tree. Votes travel back
//! up the tree; the initiator turns them into a commit or abort
//! decision and floods it. The decision flood is deduplicated by a
//! process-lifetime ledger, so it terminates even on cyclic topologies.

use std::collections::HashSet;
use std::sync::Arc;

use tracing::{debug, info, warn};

use crate::clock::VectorClock;
use crate::error::ProtocolError;
use crate::network::wire::MessageBody;
use crate::protocol::ledger::DecisionLedger;
use crate::snapshot::{CheckpointArtifact, SnapshotStore};
use crate::types::{DecisionKind, NodeId, SequenceNumber, Vote};

/// One local participation instance, alive from initiation or join
/// until the decision for its sequence has been applied.
#[derive(Debug)]
struct Session {
    seq: SequenceNumber,
    initiator: NodeId,
    /// First requester; `None` on the initiator.
    parent: Option<NodeId>,
    /// Neighbors whose votes are still outstanding.
    expected_replies: HashSet<NodeId>,
    /// Sticky: set by the first NO and never cleared for the session.
    received_no: bool,
}

/// What a handler wants done once it returns: messages to emit, and
/// whether this node just completed its own schedule entry.
#[derive(Debug, Default)]
pub struct Actions {
    /// Messages to send, stamped by the dispatcher with this node's id
    /// and current clock.
    pub sends: Vec<(NodeId, MessageBody)>,
    /// True only on the initiator when its session reached a decision.
    pub completed: bool,
}

impl Actions {
    fn send(&mut self, to: NodeId, body: MessageBody) {
        self.sends.push((to, body));
    }
}

/// Per-node checkpoint protocol state machine.
pub struct CheckpointCoordinator {
    node_id: NodeId,
    neighbors: Vec<NodeId>,
    store: Arc<dyn SnapshotStore>,
    ledger: DecisionLedger,
    session: Option<Session>,
}

impl CheckpointCoordinator {
    /// Create an idle coordinator.
    pub fn new(node_id: NodeId, neighbors: Vec<NodeId>, store: Arc<dyn SnapshotStore>) -> Self {
        Self {
            node_id,
            neighbors,
            store,
            ledger: DecisionLedger::new(),
            session: None,
        }
    }

    /// Whether a session is active.
    pub fn is_participating(&self) -> bool {
        self.session.is_some()
    }

    /// Sequence of the active session, if any.
    pub fn active_seq(&self) -> Option<SequenceNumber> {
        self.session.as_ref().map(|s| s.seq)
    }

    /// Parent in the induced tree for the active session.
    pub fn parent(&self) -> Option<NodeId> {
        self.session.as_ref().and_then(|s| s.parent)
    }

    /// Votes still outstanding in the active session.
    pub fn pending_replies(&self) -> usize {
        self.session
            .as_ref()
            .map(|s| s.expected_replies.len())
            .unwrap_or(0)
    }

    /// Start a checkpoint with this node as initiator.
    ///
    /// Freezes the clock, persists the tentative artifact and requests
    /// every neighbor to join. With no neighbors the checkpoint commits
    /// on the spot.
    pub fn initiate(&mut self, seq: SequenceNumber, clock: &VectorClock) -> Actions {
        if let Some(old) = self.session.take() {
            warn!(
                node_id = self.node_id,
                abandoned_seq = old.seq,
                seq,
                "abandoning unfinished session to initiate"
            );
        }

        info!(node_id = self.node_id, seq, "initiating checkpoint");

        let frozen = clock.snapshot();
        self.take_tentative(seq, frozen);

        let mut session = Session {
            seq,
            initiator: self.node_id,
            parent: None,
            expected_replies: HashSet::new(),
            received_no: false,
        };

        let mut actions = Actions::default();
        for &nid in &self.neighbors {
            debug!(node_id = self.node_id, to = nid, seq, "sending checkpoint request");
            actions.send(
                nid,
                MessageBody::CheckpointRequest {
                    seq,
                    initiator: self.node_id,
                },
            );
            session.expected_replies.insert(nid);
        }
        debug!(
            node_id = self.node_id,
            seq,
            expected = session.expected_replies.len(),
            "awaiting votes"
        );

        if session.expected_replies.is_empty() {
            // Nobody to ask: commit alone.
            self.apply_local(DecisionKind::Commit, seq);
            self.ledger.record(DecisionKind::Commit, seq);
            info!(node_id = self.node_id, seq, "checkpoint committed without participants");
            actions.completed = true;
            return actions;
        }

        self.session = Some(session);
        actions
    }

    /// Handle a join request from `from`.
    pub fn handle_request(
        &mut self,
        from: NodeId,
        seq: SequenceNumber,
        initiator: NodeId,
        clock: &VectorClock,
    ) -> Actions {
        let mut actions = Actions::default();

        if let Some(session) = &self.session {
            if session.seq == seq {
                // Already in this instance: the request closed a cycle.
                debug!(node_id = self.node_id, from, seq, "cycle detected, voting yes");
                actions.send(from, MessageBody::CheckpointResponse { seq, vote: Vote::Yes });
            } else {
                info!(
                    node_id = self.node_id,
                    from,
                    seq,
                    active_seq = session.seq,
                    "busy with another checkpoint, voting no"
                );
                actions.send(from, MessageBody::CheckpointResponse { seq, vote: Vote::No });
            }
            return actions;
        }

        info!(node_id = self.node_id, from, seq, initiator, "joining checkpoint");

        let frozen = clock.snapshot();
        self.take_tentative(seq, frozen);

        let mut session = Session {
            seq,
            initiator,
            parent: Some(from),
            expected_replies: HashSet::new(),
            received_no: false,
        };

        for &nid in &self.neighbors {
            if nid != from {
                debug!(node_id = self.node_id, to = nid, seq, "forwarding checkpoint request");
                actions.send(nid, MessageBody::CheckpointRequest { seq, initiator });
                session.expected_replies.insert(nid);
            }
        }

        if session.expected_replies.is_empty() {
            // Leaf of the induced tree: vote yes right away but stay in
            // the session until the decision arrives.
            debug!(node_id = self.node_id, seq, parent = from, "leaf, voting yes to parent");
            actions.send(from, MessageBody::CheckpointResponse { seq, vote: Vote::Yes });
        }

        self.session = Some(session);
        actions
    }

    /// Handle a vote from `from`.
    ///
    /// Votes outside the active session are protocol violations: the
    /// caller logs and drops them.
    pub fn handle_response(
        &mut self,
        from: NodeId,
        seq: SequenceNumber,
        vote: Vote,
    ) -> Result<Actions, ProtocolError> {
        let session = self
            .session
            .as_mut()
            .ok_or(ProtocolError::UnexpectedVote { from, seq })?;
        if session.seq != seq {
            return Err(ProtocolError::SequenceMismatch {
                got: seq,
                active: session.seq,
            });
        }
        if !session.expected_replies.remove(&from) {
            return Err(ProtocolError::UnsolicitedVote(from));
        }

        if !vote.is_yes() {
            session.received_no = true;
        }
        info!(
            node_id = self.node_id,
            from,
            seq,
            vote = ?vote,
            remaining = session.expected_replies.len(),
            "received vote"
        );

        if !session.expected_replies.is_empty() {
            return Ok(Actions::default());
        }

        // All votes are in.
        let mut actions = Actions::default();
        if session.initiator == self.node_id {
            let kind = if session.received_no {
                DecisionKind::Abort
            } else {
                DecisionKind::Commit
            };
            info!(node_id = self.node_id, seq, decision = kind.as_str(), "deciding");

            self.ledger.record(kind, seq);
            self.apply_local(kind, seq);
            for &nid in &self.neighbors {
                debug!(node_id = self.node_id, to = nid, seq, decision = kind.as_str(), "flooding decision");
                actions.send(nid, decision_body(kind, seq));
            }
            self.session = None;
            actions.completed = true;
        } else {
            let vote = if session.received_no { Vote::No } else { Vote::Yes };
            let parent = session.parent.unwrap_or(session.initiator);
            info!(node_id = self.node_id, seq, parent, vote = ?vote, "reporting to parent");
            actions.send(parent, MessageBody::CheckpointResponse { seq, vote });
        }
        Ok(actions)
    }

    /// Handle a flooded decision from `from`.
    ///
    /// Unseen decisions are recorded and forwarded to the remaining
    /// neighbors no matter the session state, so the flood reaches
    /// nodes behind participants that finished early. Only a matching
    /// active session is affected locally.
    pub fn handle_decision(
        &mut self,
        from: NodeId,
        kind: DecisionKind,
        seq: SequenceNumber,
    ) -> Actions {
        let mut actions = Actions::default();

        if !self.ledger.record(kind, seq) {
            debug!(
                node_id = self.node_id,
                from,
                seq,
                decision = kind.as_str(),
                "ignoring duplicate decision"
            );
            return actions;
        }

        for &nid in &self.neighbors {
            if nid != from {
                debug!(
                    node_id = self.node_id,
                    to = nid,
                    seq,
                    decision = kind.as_str(),
                    "propagating decision"
                );
                actions.send(nid, decision_body(kind, seq));
            }
        }

        match &self.session {
            Some(session) if session.seq == seq => {
                info!(node_id = self.node_id, seq, decision = kind.as_str(), "applying decision");
                let was_initiator = session.initiator == self.node_id;
                self.apply_local(kind, seq);
                self.session = None;
                actions.completed = was_initiator;
            }
            Some(session) => {
                debug!(
                    node_id = self.node_id,
                    seq,
                    active_seq = session.seq,
                    "recorded decision for another sequence"
                );
            }
            None => {
                debug!(node_id = self.node_id, seq, "recorded decision while idle");
            }
        }
        actions
    }

    /// Persist the tentative artifact; failures are logged and do not
    /// stop the protocol.
    fn take_tentative(&self, seq: SequenceNumber, frozen: Vec<u64>) {
        let artifact = CheckpointArtifact { seq, clock: frozen };
        if let Err(e) = self.store.write_tentative(&artifact) {
            warn!(node_id = self.node_id, seq, error = %e, "failed to write tentative checkpoint");
        }
    }

    /// Apply a decision to local storage; failures are logged and do
    /// not stop the protocol.
    fn apply_local(&self, kind: DecisionKind, seq: SequenceNumber) {
        let result = match kind {
            DecisionKind::Commit => self.store.commit_tentative(seq),
            DecisionKind::Abort => self.store.discard_tentative(seq),
        };
        if let Err(e) = result {
            warn!(
                node_id = self.node_id,
                seq,
                decision = kind.as_str(),
                error = %e,
                "local checkpoint apply failed"
            );
        }
    }
}

fn decision_body(kind: DecisionKind, seq: SequenceNumber) -> MessageBody {
    match kind {
        DecisionKind::Commit => MessageBody::CheckpointCommit { seq },
        DecisionKind::Abort => MessageBody::CheckpointAbort { seq },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::snapshot::FileSnapshotStore;
    use tempfile::tempdir;

    fn coordinator(
        node_id: NodeId,
        neighbors: &[NodeId],
    ) -> (CheckpointCoordinator, Arc<FileSnapshotStore>, tempfile::TempDir) {
        let dir = tempdir().unwrap();
        let store = Arc::new(FileSnapshotStore::new(dir.path(), node_id).unwrap());
        let coord = CheckpointCoordinator::new(node_id, neighbors.to_vec(), store.clone());
        (coord, store, dir)
    }

    fn bodies(actions: &Actions) -> Vec<(NodeId, &MessageBody)> {
        actions.sends.iter().map(|(to, body)| (*to, body)).collect()
    }

    #[test]
    fn test_initiate_requests_all_neighbors() {
        let (mut coord, _store, _dir) = coordinator(0, &[1, 2]);
        let clock = VectorClock::new(3, 0);

        let actions = coord.initiate(1, &clock);

        assert!(!actions.completed);
        assert_eq!(actions.sends.len(), 2);
        for (_, body) in bodies(&actions) {
            assert_eq!(body, &MessageBody::CheckpointRequest { seq: 1, initiator: 0 });
        }
        assert!(coord.is_participating());
        assert_eq!(coord.active_seq(), Some(1));
        assert_eq!(coord.pending_replies(), 2);
    }

    #[test]
    fn test_initiate_without_neighbors_commits_alone() {
        let (mut coord, store, _dir) = coordinator(0, &[]);
        let mut clock = VectorClock::new(1, 0);
        clock.tick();

        let actions = coord.initiate(1, &clock);

        assert!(actions.completed);
        assert!(actions.sends.is_empty());
        assert!(!coord.is_participating());
        assert_eq!(store.read_permanent(1).unwrap().clock, vec![1]);
    }

    #[test]
    fn test_join_freezes_clock_and_forwards() {
        let (mut coord, _store, _dir) = coordinator(1, &[0, 2, 3]);
        let clock = VectorClock::new(4, 1);

        let actions = coord.handle_request(0, 1, 0, &clock);

        assert_eq!(coord.parent(), Some(0));
        assert_eq!(coord.pending_replies(), 2);
        let sends = bodies(&actions);
        assert_eq!(sends.len(), 2);
        assert!(sends
            .iter()
            .all(|(to, _)| *to != 0));
    }

    #[test]
    fn test_request_for_active_seq_votes_yes_without_state_change() {
        let (mut coord, _store, _dir) = coordinator(1, &[0, 2]);
        let clock = VectorClock::new(3, 1);
        coord.handle_request(0, 1, 0, &clock);
        let pending_before = coord.pending_replies();
        let parent_before = coord.parent();

        let actions = coord.handle_request(2, 1, 0, &clock);

        assert_eq!(
            bodies(&actions),
            vec![(2, &MessageBody::CheckpointResponse { seq: 1, vote: Vote::Yes })]
        );
        assert_eq!(coord.pending_replies(), pending_before);
        assert_eq!(coord.parent(), parent_before);
    }

    #[test]
    fn test_request_for_other_seq_votes_no_without_state_change() {
        let (mut coord, _store, _dir) = coordinator(1, &[0, 2]);
        let clock = VectorClock::new(3, 1);
        coord.handle_request(0, 1, 0, &clock);

        let actions = coord.handle_request(2, 5, 2, &clock);

        assert_eq!(
            bodies(&actions),
            vec![(2, &MessageBody::CheckpointResponse { seq: 5, vote: Vote::No })]
        );
        assert_eq!(coord.active_seq(), Some(1));
    }

    #[test]
    fn test_initiator_commits_when_all_vote_yes() {
        let (mut coord, store, _dir) = coordinator(0, &[1, 2]);
        let clock = VectorClock::new(3, 0);
        coord.initiate(1, &clock);

        let actions = coord.handle_response(1, 1, Vote::Yes).unwrap();
        assert!(actions.sends.is_empty());
        assert!(!actions.completed);

        let actions = coord.handle_response(2, 1, Vote::Yes).unwrap();
        assert!(actions.completed);
        assert!(!coord.is_participating());
        assert!(store.has_permanent(1));
        let sends = bodies(&actions);
        assert_eq!(sends.len(), 2);
        for (_, body) in sends {
            assert_eq!(body, &MessageBody::CheckpointCommit { seq: 1 });
        }
    }

    #[test]
    fn test_single_no_makes_initiator_abort() {
        let (mut coord, store, _dir) = coordinator(0, &[1, 2]);
        let clock = VectorClock::new(3, 0);
        coord.initiate(1, &clock);

        coord.handle_response(1, 1, Vote::No).unwrap();
        let actions = coord.handle_response(2, 1, Vote::Yes).unwrap();

        assert!(actions.completed);
        assert!(!store.has_permanent(1));
        for (_, body) in bodies(&actions) {
            assert_eq!(body, &MessageBody::CheckpointAbort { seq: 1 });
        }
    }

    #[test]
    fn test_cohort_reports_to_parent_and_waits() {
        let (mut coord, store, _dir) = coordinator(1, &[0, 2]);
        let clock = VectorClock::new(3, 1);
        coord.handle_request(0, 1, 0, &clock);

        let actions = coord.handle_response(2, 1, Vote::Yes).unwrap();

        assert!(!actions.completed);
        assert_eq!(
            bodies(&actions),
            vec![(0, &MessageBody::CheckpointResponse { seq: 1, vote: Vote::Yes })]
        );
        // Still in the session until the decision arrives.
        assert!(coord.is_participating());
        assert!(!store.has_permanent(1));
    }

    #[test]
    fn test_cohort_applies_and_forwards_decision() {
        let (mut coord, store, _dir) = coordinator(1, &[0, 2]);
        let clock = VectorClock::new(3, 1);
        coord.handle_request(0, 1, 0, &clock);
        coord.handle_response(2, 1, Vote::Yes).unwrap();

        let actions = coord.handle_decision(0, DecisionKind::Commit, 1);

        assert!(!actions.completed);
        assert!(!coord.is_participating());
        assert!(store.has_permanent(1));
        // Forwarded everywhere except the hop it came from.
        assert_eq!(
            bodies(&actions),
            vec![(2, &MessageBody::CheckpointCommit { seq: 1 })]
        );
    }

    #[test]
    fn test_abort_discards_tentative() {
        let (mut coord, store, _dir) = coordinator(1, &[0]);
        let clock = VectorClock::new(2, 1);
        coord.handle_request(0, 1, 0, &clock);

        coord.handle_decision(0, DecisionKind::Abort, 1);

        assert!(!coord.is_participating());
        assert!(!store.has_permanent(1));
        // Ledger remembers, so a replay is a no-op.
        let actions = coord.handle_decision(0, DecisionKind::Abort, 1);
        assert!(actions.sends.is_empty());
    }

    #[test]
    fn test_idle_node_still_records_and_forwards_decision() {
        let (mut coord, store, _dir) = coordinator(1, &[0, 2]);

        let actions = coord.handle_decision(0, DecisionKind::Commit, 4);

        assert!(!actions.completed);
        assert!(!store.has_permanent(4));
        assert_eq!(
            bodies(&actions),
            vec![(2, &MessageBody::CheckpointCommit { seq: 4 })]
        );

        // Second arrival from the other side is deduplicated.
        let actions = coord.handle_decision(2, DecisionKind::Commit, 4);
        assert!(actions.sends.is_empty());
    }

    #[test]
    fn test_votes_outside_session_are_violations() {
        let (mut coord, _store, _dir) = coordinator(0, &[1, 2]);
        let clock = VectorClock::new(3, 0);

        assert!(matches!(
            coord.handle_response(1, 1, Vote::Yes),
            Err(ProtocolError::UnexpectedVote { from: 1, seq: 1 })
        ));

        coord.initiate(2, &clock);
        assert!(matches!(
            coord.handle_response(1, 9, Vote::Yes),
            Err(ProtocolError::SequenceMismatch { got: 9, active: 2 })
        ));

        coord.handle_response(1, 2, Vote::Yes).unwrap();
        assert!(matches!(
            coord.handle_response(1, 2, Vote::Yes),
            Err(ProtocolError::UnsolicitedVote(1))
        ));
    }

    #[test]
    fn test_initiate_stomps_stale_session() {
        let (mut coord, _store, _dir) = coordinator(0, &[1]);
        let clock = VectorClock::new(2, 0);
        coord.handle_request(1, 1, 1, &clock);
        assert_eq!(coord.active_seq(), Some(1));

        coord.initiate(2, &clock);
        assert_eq!(coord.active_seq(), Some(2));
    }
}
