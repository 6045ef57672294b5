//! Error types for agora-validation.

use agora_fact::{FactError, PeerId};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Result type for validation operations.
pub type Result<T> = std::result::Result<T, ValidationError>;

/// Pipeline stages, in execution order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    Structural,
    Semantic,
    Cryptographic,
    Context,
    BusinessRules,
}

impl std::fmt::Display for Stage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Stage::Structural => "structural",
            Stage::Semantic => "semantic",
            Stage::Cryptographic => "cryptographic",
            Stage::Context => "context",
            Stage::BusinessRules => "business_rules",
        };
        f.write_str(name)
    }
}

/// Why a fact was rejected. Every variant is fatal for that fact only.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ValidationError {
    /// Malformed fact: missing fields, bad id, bad relation.
    #[error("structural error: {0}")]
    Structural(String),

    /// Shape inconsistent with the relation.
    #[error("semantic error: {0}")]
    Semantic(String),

    /// Hash or signature mismatch.
    #[error("cryptographic error: {0}")]
    Cryptographic(String),

    /// The sending peer is on the revocation list.
    #[error("peer {0} is revoked")]
    Revoked(PeerId),

    /// A peer submitted a fact created by somebody else.
    #[error("creator {creator} does not match sending peer {sender}")]
    CreatorMismatch { creator: PeerId, sender: PeerId },

    /// Temporal or spatial constraint violated.
    #[error("context error: {0}")]
    Context(String),

    /// A named business rule failed.
    #[error("business rule `{rule}` violated: {reason}")]
    BusinessRule { rule: String, reason: String },
}

impl ValidationError {
    /// The pipeline stage this error belongs to.
    pub fn stage(&self) -> Stage {
        match self {
            ValidationError::Structural(_) => Stage::Structural,
            ValidationError::Semantic(_) => Stage::Semantic,
            ValidationError::Cryptographic(_)
            | ValidationError::Revoked(_)
            | ValidationError::CreatorMismatch { .. } => Stage::Cryptographic,
            ValidationError::Context(_) => Stage::Context,
            ValidationError::BusinessRule { .. } => Stage::BusinessRules,
        }
    }

    /// Whether the sending peer deserves to be flagged.
    pub fn implicates_sender(&self) -> bool {
        self.stage() == Stage::Cryptographic
    }
}

impl From<FactError> for ValidationError {
    fn from(e: FactError) -> Self {
        match e {
            FactError::InvalidDigest(_) | FactError::InvalidSignature => {
                ValidationError::Cryptographic(e.to_string())
            }
            other => ValidationError::Structural(other.to_string()),
        }
    }
}
