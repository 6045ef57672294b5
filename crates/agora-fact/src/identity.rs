//! Peer identity, signing and public-key lookup.
//!
//! A peer is identified by the double-BLAKE3 digest of its Ed25519 public key:
//!
//! ```text
//! hash₁ = BLAKE3(pubkey), hash₂ = BLAKE3(hash₁), PeerId = "b3b3/{hex(hash₂)}"
//! ```
//!
//! Signing is exposed through the [`Signer`] trait so the protocol engine never
//! touches key material directly, and key lookup through [`KeyLookup`] so the
//! directory of known peers can live wherever the embedding application keeps it.

use std::collections::HashMap;

use ed25519_dalek::{Signature, SigningKey, VerifyingKey};
use serde::{Deserialize, Serialize};

use crate::error::{FactError, Result};

/// Unique peer identifier.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PeerId(String);

impl PeerId {
    /// Wrap an existing identifier string.
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Derive the identifier of a public key.
    pub fn from_public_key(key: &VerifyingKey) -> Self {
        compute_peer_id(key)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl std::fmt::Display for PeerId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for PeerId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for PeerId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

/// Compute a PeerId from an Ed25519 public key using double-BLAKE3.
pub fn compute_peer_id(key: &VerifyingKey) -> PeerId {
    let hash1 = blake3::hash(key.as_bytes());
    let hash2 = blake3::hash(hash1.as_bytes());
    PeerId(format!("b3b3/{}", hex::encode(hash2.as_bytes())))
}

/// Verify that a claimed PeerId matches the given public key.
pub fn verify_peer_id(claimed: &PeerId, key: &VerifyingKey) -> bool {
    compute_peer_id(key) == *claimed
}

/// Local signing capability.
pub trait Signer: Send + Sync {
    /// Identifier of the peer owning this key.
    fn peer_id(&self) -> &PeerId;

    /// Public half of the signing key.
    fn public_key(&self) -> VerifyingKey;

    /// Sign an arbitrary message.
    fn sign(&self, message: &[u8]) -> Signature;
}

/// Public-key lookup by peer id.
pub trait KeyLookup {
    fn public_key(&self, peer: &PeerId) -> Option<VerifyingKey>;
}

/// Ed25519 keypair with its derived peer id.
pub struct Keypair {
    signing_key: SigningKey,
    peer_id: PeerId,
}

impl Keypair {
    /// Generate a fresh random keypair.
    pub fn generate() -> Self {
        let mut rng = rand::rngs::OsRng;
        Self::from_signing_key(SigningKey::generate(&mut rng))
    }

    /// Deterministic keypair from a 32-byte seed.
    pub fn from_seed(seed: [u8; 32]) -> Self {
        Self::from_signing_key(SigningKey::from_bytes(&seed))
    }

    pub fn from_signing_key(signing_key: SigningKey) -> Self {
        let peer_id = compute_peer_id(&signing_key.verifying_key());
        Self {
            signing_key,
            peer_id,
        }
    }
}

impl std::fmt::Debug for Keypair {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Keypair")
            .field("peer_id", &self.peer_id)
            .finish_non_exhaustive()
    }
}

impl Signer for Keypair {
    fn peer_id(&self) -> &PeerId {
        &self.peer_id
    }

    fn public_key(&self) -> VerifyingKey {
        self.signing_key.verifying_key()
    }

    fn sign(&self, message: &[u8]) -> Signature {
        use ed25519_dalek::Signer as _;
        self.signing_key.sign(message)
    }
}

/// In-memory directory of known peer public keys.
#[derive(Debug, Clone, Default)]
pub struct Keyring {
    keys: HashMap<PeerId, VerifyingKey>,
}

impl Keyring {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a key under its derived peer id and return that id.
    pub fn register(&mut self, key: VerifyingKey) -> PeerId {
        let peer = compute_peer_id(&key);
        self.keys.insert(peer.clone(), key);
        peer
    }

    /// Register a key under an explicit peer id.
    pub fn insert(&mut self, peer: PeerId, key: VerifyingKey) {
        self.keys.insert(peer, key);
    }

    pub fn remove(&mut self, peer: &PeerId) -> Option<VerifyingKey> {
        self.keys.remove(peer)
    }

    pub fn contains(&self, peer: &PeerId) -> bool {
        self.keys.contains_key(peer)
    }

    pub fn len(&self) -> usize {
        self.keys.len()
    }

    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }
}

impl KeyLookup for Keyring {
    fn public_key(&self, peer: &PeerId) -> Option<VerifyingKey> {
        self.keys.get(peer).copied()
    }
}

/// Sign `message` and hex-encode the signature.
pub fn sign_hex(signer: &dyn Signer, message: &[u8]) -> String {
    hex::encode(signer.sign(message).to_bytes())
}

/// Decode a hex signature.
pub fn decode_signature(signature_hex: &str) -> Result<Signature> {
    let bytes = hex::decode(signature_hex).map_err(|_| FactError::InvalidSignature)?;
    Signature::from_slice(&bytes).map_err(|_| FactError::InvalidSignature)
}

/// Verify a hex-encoded signature over `message`.
pub fn verify_hex(key: &VerifyingKey, message: &[u8], signature_hex: &str) -> bool {
    match decode_signature(signature_hex) {
        Ok(signature) => key.verify_strict(message, &signature).is_ok(),
        Err(_) => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn peer_id_is_deterministic() {
        let a = Keypair::from_seed([7; 32]);
        let b = Keypair::from_seed([7; 32]);
        assert_eq!(a.peer_id(), b.peer_id());
        assert!(a.peer_id().as_str().starts_with("b3b3/"));
    }

    #[test]
    fn peer_id_matches_key() {
        let kp = Keypair::from_seed([1; 32]);
        assert!(verify_peer_id(kp.peer_id(), &kp.public_key()));

        let other = Keypair::from_seed([2; 32]);
        assert!(!verify_peer_id(kp.peer_id(), &other.public_key()));
    }

    #[test]
    fn sign_and_verify_roundtrip() {
        let kp = Keypair::from_seed([3; 32]);
        let sig = sign_hex(&kp, b"payload");
        assert!(verify_hex(&kp.public_key(), b"payload", &sig));
        assert!(!verify_hex(&kp.public_key(), b"tampered", &sig));
    }

    #[test]
    fn garbage_signature_does_not_verify() {
        let kp = Keypair::from_seed([4; 32]);
        assert!(!verify_hex(&kp.public_key(), b"payload", "not-hex"));
        assert!(!verify_hex(&kp.public_key(), b"payload", "abcd"));
    }

    #[test]
    fn keyring_lookup() {
        let kp = Keypair::from_seed([5; 32]);
        let mut ring = Keyring::new();
        let peer = ring.register(kp.public_key());

        assert_eq!(&peer, kp.peer_id());
        assert_eq!(ring.public_key(&peer), Some(kp.public_key()));
        assert!(ring.public_key(&PeerId::from("unknown")).is_none());
    }
}
