//! Error types for agora-consensus.

use agora_fact::{FactError, FactId, PeerId};
use thiserror::Error;

/// Result type for consensus operations.
pub type Result<T> = std::result::Result<T, ConsensusError>;

#[derive(Debug, Error)]
pub enum ConsensusError {
    /// No pending round for this fact (never requested, or already resolved).
    #[error("no pending consensus round for fact {0}")]
    UnknownRound(FactId),

    /// A round for this fact is already running.
    #[error("consensus already pending for fact {0}")]
    AlreadyPending(FactId),

    /// Only validated multi-party facts go to consensus.
    #[error("fact {0} is not a validated committed fact")]
    NotCommitted(FactId),

    /// No public key is known for the claimed voter.
    #[error("unknown voter {0}")]
    UnknownVoter(PeerId),

    /// The vote signature does not bind the claimed voter.
    #[error("vote signature from {voter} does not verify")]
    InvalidVoteSignature { voter: PeerId },

    /// The round ended without a single vote.
    #[error("consensus on fact {0} timed out without votes")]
    Timeout(FactId),

    /// Vote encoding failed.
    #[error("vote encoding error: {0}")]
    Encoding(#[from] FactError),
}
