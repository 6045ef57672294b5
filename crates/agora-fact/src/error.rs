//! Error types for the fact model.

use thiserror::Error;

/// Result type for fact model operations.
pub type Result<T> = std::result::Result<T, FactError>;

/// Errors raised while constructing, encoding or signing a fact.
#[derive(Debug, Error)]
pub enum FactError {
    /// Relation outside the closed `has`/`needs`/`committed` set.
    #[error("invalid relation: {0:?}")]
    InvalidRelation(String),

    /// A fact could not be decoded from its wire form.
    #[error("malformed fact: {0}")]
    Malformed(String),

    /// Canonical encoding failed.
    #[error("encoding error: {0}")]
    Encoding(#[from] serde_json::Error),

    /// The stored hash is not a 32-byte hex digest.
    #[error("hash is not a valid digest: {0}")]
    InvalidDigest(String),

    /// Signature bytes could not be parsed.
    #[error("invalid signature encoding")]
    InvalidSignature,
}
