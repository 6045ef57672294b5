//! Error types for the Agora node.

use agora_consensus::ConsensusError;
use agora_fact::{FactError, PeerId};
use agora_router::RoutingError;
use agora_topology::TopologyError;
use agora_validation::ValidationError;
use thiserror::Error;

/// Result type for node operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur in node operations.
#[derive(Debug, Error)]
pub enum Error {
    /// Malformed configuration value
    #[error("Config error: {0}")]
    Config(String),

    /// Envelope or payload (de)serialization
    #[error("Codec error: {0}")]
    Codec(#[from] serde_json::Error),

    /// Peer unreachable at the transport layer
    #[error("Transport error to {peer}: {reason}")]
    Transport { peer: PeerId, reason: String },

    /// Peer is not in the connection set
    #[error("Peer not connected: {0}")]
    NotConnected(PeerId),

    /// Routing failure
    #[error("Routing error: {0}")]
    Routing(#[from] RoutingError),

    /// Fact rejected by the validation pipeline
    #[error("Validation error: {0}")]
    Validation(#[from] ValidationError),

    /// Consensus round error
    #[error("Consensus error: {0}")]
    Consensus(#[from] ConsensusError),

    /// Topology bookkeeping error
    #[error("Topology error: {0}")]
    Topology(#[from] TopologyError),

    /// Fact construction or encoding error
    #[error("Fact error: {0}")]
    Fact(#[from] FactError),

    /// Unknown fact id
    #[error("Unknown fact: {0}")]
    UnknownFact(String),

    /// The node actor has stopped
    #[error("Node has shut down")]
    Shutdown,
}

impl<T> From<tokio::sync::mpsc::error::SendError<T>> for Error {
    fn from(_: tokio::sync::mpsc::error::SendError<T>) -> Self {
        Error::Shutdown
    }
}

impl From<tokio::sync::oneshot::error::RecvError> for Error {
    fn from(_: tokio::sync::oneshot::error::RecvError) -> Self {
        Error::Shutdown
    }
}
