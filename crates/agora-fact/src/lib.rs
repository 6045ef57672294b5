//! Agora Fact Model
//!
//! The unit of truth exchanged between Agora peers is a **triplet**:
//! an entity, a relation (`has`, `needs` or `committed`) and an object,
//! qualified by an open context map.
//!
//! # Integrity
//!
//! Every triplet carries a BLAKE3 hash over its canonical encoding and an
//! optional Ed25519 signature by its creator over that hash. Two
//! implementations that agree on the canonical encoding agree bit-for-bit on
//! the hash.
//!
//! # Lifecycle
//!
//! ```text
//! create → validate (sign if local) → consensus (committed only) → index → expire
//! ```

mod error;
mod factory;
mod features;
mod identity;
mod index;
mod triplet;

pub use error::{FactError, Result};
pub use factory::FactFactory;
pub use features::{EntityType, FeatureSet, ResourceType, Timeframe};
pub use identity::{
    compute_peer_id, decode_signature, sign_hex, verify_hex, verify_peer_id, KeyLookup, Keypair,
    Keyring, PeerId, Signer,
};
pub use index::FactIndex;
pub use triplet::{
    canonical_json, Agreement, Context, Entity, FactFields, FactId, Location, Relation, Triplet,
    Urgency, FACT_VERSION,
};

use std::time::{SystemTime, UNIX_EPOCH};

/// Current unix time in milliseconds.
pub fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or_default()
}

/// BLAKE3 digest of arbitrary bytes, hex encoded.
pub fn digest_hex(data: &[u8]) -> String {
    blake3::hash(data).to_hex().to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn digest_deterministic() {
        assert_eq!(digest_hex(b"hello"), digest_hex(b"hello"));
        assert_ne!(digest_hex(b"hello"), digest_hex(b"world"));
    }

    #[test]
    fn clock_is_past_epoch() {
        assert!(now_millis() > 1_600_000_000_000);
    }
}
