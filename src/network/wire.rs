//! Wire message types for inter-node communication.

use serde::{Deserialize, Serialize};

use crate::types::{DecisionKind, NodeId, SequenceNumber, Vote};

/// One framed message between neighbors.
///
/// Every message carries the sender's id and a full clock snapshot;
/// receivers merge the snapshot before any other handling.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Message {
    /// Id of the node that emitted this frame. For forwarded
    /// operation-finished floods this stays the originator, not the
    /// forwarding hop.
    pub sender: NodeId,

    /// Sender's clock snapshot at send time.
    pub clock: Vec<u64>,

    /// Kind-specific content.
    pub body: MessageBody,
}

/// The six message kinds.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub enum MessageBody {
    /// Synthetic application traffic. Exists to advance vector clocks.
    Application,

    /// Ask the receiver to join checkpoint `seq`.
    CheckpointRequest {
        seq: SequenceNumber,
        /// Node that started this checkpoint instance.
        initiator: NodeId,
    },

    /// A participant's vote, sent to its parent in the induced tree.
    CheckpointResponse { seq: SequenceNumber, vote: Vote },

    /// Flooded decision: make tentative checkpoints permanent.
    CheckpointCommit { seq: SequenceNumber },

    /// Flooded decision: drop tentative checkpoints.
    CheckpointAbort { seq: SequenceNumber },

    /// Flooded signal that schedule entry `op_index` has completed.
    OperationFinished { op_index: usize },
}

impl Message {
    /// Application chatter from `sender`.
    pub fn application(sender: NodeId, clock: Vec<u64>) -> Self {
        Self {
            sender,
            clock,
            body: MessageBody::Application,
        }
    }

    /// Checkpoint join request.
    pub fn request(
        sender: NodeId,
        clock: Vec<u64>,
        seq: SequenceNumber,
        initiator: NodeId,
    ) -> Self {
        Self {
            sender,
            clock,
            body: MessageBody::CheckpointRequest { seq, initiator },
        }
    }

    /// Vote on checkpoint `seq`.
    pub fn response(sender: NodeId, clock: Vec<u64>, seq: SequenceNumber, vote: Vote) -> Self {
        Self {
            sender,
            clock,
            body: MessageBody::CheckpointResponse { seq, vote },
        }
    }

    /// Commit or abort decision for checkpoint `seq`.
    pub fn decision(
        sender: NodeId,
        clock: Vec<u64>,
        kind: DecisionKind,
        seq: SequenceNumber,
    ) -> Self {
        let body = match kind {
            DecisionKind::Commit => MessageBody::CheckpointCommit { seq },
            DecisionKind::Abort => MessageBody::CheckpointAbort { seq },
        };
        Self {
            sender,
            clock,
            body,
        }
    }

    /// Completion flood for schedule entry `op_index`.
    pub fn finished(sender: NodeId, clock: Vec<u64>, op_index: usize) -> Self {
        Self {
            sender,
            clock,
            body: MessageBody::OperationFinished { op_index },
        }
    }

    /// Short label of the body kind for log output.
    pub fn kind(&self) -> &'static str {
        match self.body {
            MessageBody::Application => "app",
            MessageBody::CheckpointRequest { .. } => "ckpt-request",
            MessageBody::CheckpointResponse { .. } => "ckpt-response",
            MessageBody::CheckpointCommit { .. } => "ckpt-commit",
            MessageBody::CheckpointAbort { .. } => "ckpt-abort",
            MessageBody::OperationFinished { .. } => "op-finished",
        }
    }
}

/// Encode a message to bytes.
pub fn encode_message(msg: &Message) -> Result<Vec<u8>, bincode::Error> {
    bincode::serialize(msg)
}

/// Decode a message from bytes.
pub fn decode_message(data: &[u8]) -> Result<Message, bincode::Error> {
    bincode::deserialize(data)
}

/// Frame a message with a u32 big-endian length prefix for TCP.
pub fn frame_message(msg: &Message) -> Result<Vec<u8>, bincode::Error> {
    let data = encode_message(msg)?;
    let len = data.len() as u32;

    let mut framed = Vec::with_capacity(4 + data.len());
    framed.extend_from_slice(&len.to_be_bytes());
    framed.extend_from_slice(&data);

    Ok(framed)
}
