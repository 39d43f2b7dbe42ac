//! Serial event dispatch.
//!
//! All mutable protocol state of a node lives behind one mailbox:
//! connection handlers, the traffic generator and delay timers only
//! enqueue events, and a single consumer task applies them in arrival
//! order. That makes every clock merge, session transition and cursor
//! move atomic without locks, and every send atomic with respect to
//! the clock mutation that stamped it.

use std::sync::Arc;

use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::clock::VectorClock;
use crate::config::ClusterConfig;
use crate::network::transport::Transport;
use crate::network::wire::{Message, MessageBody};
use crate::protocol::coordinator::{Actions, CheckpointCoordinator};
use crate::protocol::sequencer::{Evaluation, OperationSequencer};
use crate::snapshot::SnapshotStore;
use crate::types::{DecisionKind, NodeId};

/// Events consumed by the dispatcher.
#[derive(Debug)]
pub enum Event {
    /// A frame arrived from a peer.
    Inbound(Message),
    /// The traffic generator wants an application message sent.
    SendApplication { to: NodeId },
    /// The inter-operation delay elapsed; look at the schedule again.
    ScheduleTick,
    /// Stop the dispatch loop.
    Shutdown,
}

/// Handle used to enqueue events into the dispatcher mailbox.
pub type EventSender = mpsc::UnboundedSender<Event>;

/// Messages produced by one engine step, already stamped, plus whether
/// the schedule should be looked at again after the delay.
#[derive(Debug, Default)]
pub struct Outbox {
    /// `(destination, message)` pairs, in emit order.
    pub messages: Vec<(NodeId, Message)>,
    /// The cursor advanced: re-evaluate after the inter-operation delay.
    pub reschedule: bool,
}

/// Serial protocol core of one node.
///
/// Owns the vector clock, the checkpoint coordinator and the operation
/// sequencer; every method runs on the dispatcher task (or a test
/// harness), so plain `&mut self` is all the synchronization needed.
pub struct Engine {
    node_id: NodeId,
    config: Arc<ClusterConfig>,
    clock: VectorClock,
    coordinator: CheckpointCoordinator,
    sequencer: OperationSequencer,
}

impl Engine {
    /// Build the engine for `node_id` from the cluster description.
    pub fn new(node_id: NodeId, config: Arc<ClusterConfig>, store: Arc<dyn SnapshotStore>) -> Self {
        let clock = VectorClock::new(config.num_nodes, node_id);
        let coordinator =
            CheckpointCoordinator::new(node_id, config.neighbors_of(node_id).to_vec(), store);
        let sequencer = OperationSequencer::new(node_id, config.operations.clone());
        Self {
            node_id,
            config,
            clock,
            coordinator,
            sequencer,
        }
    }

    /// This node's id.
    pub fn node_id(&self) -> NodeId {
        self.node_id
    }

    /// Current clock state.
    pub fn clock(&self) -> &VectorClock {
        &self.clock
    }

    /// Checkpoint session state.
    pub fn coordinator(&self) -> &CheckpointCoordinator {
        &self.coordinator
    }

    /// Schedule state.
    pub fn sequencer(&self) -> &OperationSequencer {
        &self.sequencer
    }

    /// Apply one inbound message.
    ///
    /// The clock merge happens first, for every kind of message;
    /// receiving protocol chatter is a causal event like any other.
    pub fn handle_message(&mut self, msg: &Message) -> Outbox {
        self.clock.merge(&msg.clock);
        debug!(
            node_id = self.node_id,
            from = msg.sender,
            kind = msg.kind(),
            clock = %self.clock,
            "received message"
        );

        let mut outbox = Outbox::default();
        match msg.body {
            MessageBody::Application => {}
            MessageBody::CheckpointRequest { seq, initiator } => {
                let actions = self
                    .coordinator
                    .handle_request(msg.sender, seq, initiator, &self.clock);
                self.perform(actions, &mut outbox);
            }
            MessageBody::CheckpointResponse { seq, vote } => {
                match self.coordinator.handle_response(msg.sender, seq, vote) {
                    Ok(actions) => self.perform(actions, &mut outbox),
                    Err(e) => {
                        warn!(node_id = self.node_id, error = %e, "dropping invalid vote");
                    }
                }
            }
            MessageBody::CheckpointCommit { seq } => {
                let actions = self
                    .coordinator
                    .handle_decision(msg.sender, DecisionKind::Commit, seq);
                self.perform(actions, &mut outbox);
            }
            MessageBody::CheckpointAbort { seq } => {
                let actions = self
                    .coordinator
                    .handle_decision(msg.sender, DecisionKind::Abort, seq);
                self.perform(actions, &mut outbox);
            }
            MessageBody::OperationFinished { op_index } => {
                if self.sequencer.handle_finished(msg.sender, op_index) {
                    // Relay the originator's message untouched, skipping
                    // the originator itself.
                    for &nid in self.config.neighbors_of(self.node_id) {
                        if nid != msg.sender {
                            outbox.messages.push((nid, msg.clone()));
                        }
                    }
                    self.after_advance(&mut outbox);
                }
            }
        }
        outbox
    }

    /// Emit one application message to `to`.
    pub fn send_application(&mut self, to: NodeId) -> Outbox {
        self.clock.tick();
        debug!(node_id = self.node_id, to, clock = %self.clock, "sending application message");
        let msg = Message::application(self.node_id, self.clock.snapshot());
        Outbox {
            messages: vec![(to, msg)],
            reschedule: false,
        }
    }

    /// Look at the schedule, acting on the current entry if it is ours.
    pub fn tick_schedule(&mut self) -> Outbox {
        let mut outbox = Outbox::default();
        match self.sequencer.evaluate() {
            Evaluation::Waiting | Evaluation::Finished => {}
            Evaluation::StartCheckpoint(seq) => {
                let actions = self.coordinator.initiate(seq, &self.clock);
                self.perform(actions, &mut outbox);
            }
            Evaluation::RecoverNow => self.complete_operation(&mut outbox),
        }
        outbox
    }

    /// Stamp and queue coordinator sends; fold in schedule completion.
    fn perform(&mut self, actions: Actions, outbox: &mut Outbox) {
        for (to, body) in actions.sends {
            let msg = Message {
                sender: self.node_id,
                clock: self.clock.snapshot(),
                body,
            };
            outbox.messages.push((to, msg));
        }
        if actions.completed {
            self.complete_operation(outbox);
        }
    }

    /// Announce completion of the current entry to every neighbor and
    /// advance.
    fn complete_operation(&mut self, outbox: &mut Outbox) {
        let index = self.sequencer.complete_current();
        let msg = Message::finished(self.node_id, self.clock.snapshot(), index);
        for &nid in self.config.neighbors_of(self.node_id) {
            outbox.messages.push((nid, msg.clone()));
        }
        self.after_advance(outbox);
    }

    fn after_advance(&mut self, outbox: &mut Outbox) {
        if self.sequencer.is_finished() {
            info!(node_id = self.node_id, "reached end of operations");
        } else {
            outbox.reschedule = true;
        }
    }
}

/// The mailbox consumer: one per node, sole owner of an [`Engine`].
pub struct Dispatcher {
    engine: Engine,
    transport: Arc<dyn Transport>,
    events: mpsc::UnboundedReceiver<Event>,
    self_sender: EventSender,
}

impl Dispatcher {
    /// Create a dispatcher and the sender half of its mailbox.
    pub fn new(engine: Engine, transport: Arc<dyn Transport>) -> (Self, EventSender) {
        let (tx, rx) = mpsc::unbounded_channel();
        let dispatcher = Self {
            engine,
            transport,
            events: rx,
            self_sender: tx.clone(),
        };
        (dispatcher, tx)
    }

    /// Consume events until shutdown.
    pub async fn run(mut self) {
        let node_id = self.engine.node_id();
        info!(node_id, "dispatcher running");
        while let Some(event) = self.events.recv().await {
            match event {
                Event::Inbound(msg) => {
                    let outbox = self.engine.handle_message(&msg);
                    self.flush(outbox);
                }
                Event::SendApplication { to } => {
                    let outbox = self.engine.send_application(to);
                    self.flush(outbox);
                }
                Event::ScheduleTick => {
                    let outbox = self.engine.tick_schedule();
                    self.flush(outbox);
                }
                Event::Shutdown => break,
            }
        }
        info!(node_id, "dispatcher stopped");
    }

    fn flush(&mut self, outbox: Outbox) {
        for (to, msg) in outbox.messages {
            self.transport.send(to, msg);
        }
        if outbox.reschedule {
            let tx = self.self_sender.clone();
            let delay = self.engine.config.min_delay;
            tokio::spawn(async move {
                tokio::time::sleep(delay).await;
                let _ = tx.send(Event::ScheduleTick);
            });
        }
    }
}
