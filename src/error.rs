//! Error types for the checkpointing node.

use std::io;
use thiserror::Error;

use crate::types::{NodeId, SequenceNumber};

/// Result type alias for checkpointing operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type for the checkpointing node.
#[derive(Error, Debug)]
pub enum Error {
    /// Cluster configuration errors. Fatal at startup.
    #[error("config error: {0}")]
    Config(#[from] ConfigError),

    /// Transport and framing errors.
    #[error("transport error: {0}")]
    Transport(#[from] TransportError),

    /// Checkpoint artifact persistence errors.
    #[error("snapshot error: {0}")]
    Snapshot(#[from] SnapshotError),

    /// Protocol violations: messages that make no sense in the current
    /// session state. Logged and dropped at the dispatch boundary.
    #[error("protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    /// Generic internal error.
    #[error("internal error: {0}")]
    Internal(String),
}

/// Cluster configuration file errors.
#[derive(Error, Debug)]
pub enum ConfigError {
    /// Could not read the configuration file.
    #[error("io error: {0}")]
    Io(#[from] io::Error),

    /// A required section of the file is missing or truncated.
    #[error("missing {0}")]
    Missing(&'static str),

    /// A line could not be parsed.
    #[error("malformed line {line}: {reason}")]
    Malformed { line: usize, reason: String },

    /// A referenced node id is outside the declared cluster.
    #[error("node {id} out of range, cluster has {num_nodes} nodes")]
    NodeOutOfRange { id: NodeId, num_nodes: usize },
}

/// Network communication errors.
#[derive(Error, Debug)]
pub enum TransportError {
    /// Connection to a peer failed after all retries.
    #[error("connection failed to {addr}: {reason}")]
    ConnectionFailed { addr: String, reason: String },

    /// The peer connection was closed.
    #[error("connection closed")]
    ConnectionClosed,

    /// Failed to send a message.
    #[error("send failed: {0}")]
    SendFailed(String),

    /// Serialization error.
    #[error("serialization error: {0}")]
    Serialization(String),

    /// Deserialization error.
    #[error("deserialization error: {0}")]
    Deserialization(String),

    /// Inbound frame exceeds the size cap.
    #[error("frame too large: {size} bytes (max {max})")]
    FrameTooLarge { size: usize, max: usize },

    /// I/O error.
    #[error("io error: {0}")]
    Io(#[from] io::Error),
}

/// Checkpoint artifact persistence errors.
///
/// `NotFound` is non-fatal everywhere it can occur: a commit or discard
/// for an artifact that is not on disk is logged and the protocol
/// decision still propagates.
#[derive(Error, Debug)]
pub enum SnapshotError {
    /// No tentative artifact exists for the requested operation.
    #[error("no tentative checkpoint for sequence {0}")]
    NotFound(SequenceNumber),

    /// A stored artifact could not be parsed back.
    #[error("corrupt artifact: {0}")]
    Corrupt(String),

    /// I/O error.
    #[error("snapshot io error: {0}")]
    Io(#[from] io::Error),
}

/// Protocol violations.
#[derive(Error, Debug)]
pub enum ProtocolError {
    /// A vote arrived while no session is active.
    #[error("vote from {from} for sequence {seq} with no active session")]
    UnexpectedVote { from: NodeId, seq: SequenceNumber },

    /// A vote arrived for a different sequence than the active session.
    #[error("vote for sequence {got}, active session is {active}")]
    SequenceMismatch {
        got: SequenceNumber,
        active: SequenceNumber,
    },

    /// A vote arrived from a node we were not waiting on.
    #[error("vote from {0} which is not in the expected-reply set")]
    UnsolicitedVote(NodeId),
}

impl SnapshotError {
    /// Whether this error leaves the protocol free to proceed.
    pub fn is_not_found(&self) -> bool {
        matches!(self, SnapshotError::NotFound(_))
    }
}

impl From<bincode::Error> for Error {
    fn from(e: bincode::Error) -> Self {
        Error::Transport(TransportError::Serialization(e.to_string()))
    }
}
