//! Signed votes.
//!
//! Wire form: `{factId, voterId, vote: {valid, reason}, signature}`. The
//! signature covers the canonical JSON of `{factId, vote, voterId}`, so a
//! vote cannot be replayed under another voter or another fact.

use agora_fact::{canonical_json, sign_hex, verify_hex, FactId, PeerId, Signer};
use ed25519_dalek::VerifyingKey;
use serde::{Deserialize, Serialize};
use serde_json::json;

use crate::error::Result;

/// A voter's verdict on a fact.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Verdict {
    pub valid: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

impl Verdict {
    pub fn accept() -> Self {
        Self {
            valid: true,
            reason: None,
        }
    }

    pub fn reject(reason: impl Into<String>) -> Self {
        Self {
            valid: false,
            reason: Some(reason.into()),
        }
    }
}

/// A verdict bound to a fact and a voter by signature.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SignedVote {
    pub fact_id: FactId,
    pub voter_id: PeerId,
    pub vote: Verdict,
    pub signature: String,
}

impl SignedVote {
    /// Sign `verdict` on `fact_id` as the signer's peer.
    pub fn sign(fact_id: FactId, verdict: Verdict, signer: &dyn Signer) -> Result<Self> {
        let voter_id = signer.peer_id().clone();
        let message = signing_bytes(&fact_id, &voter_id, &verdict)?;
        Ok(Self {
            signature: sign_hex(signer, &message),
            fact_id,
            voter_id,
            vote: verdict,
        })
    }

    /// True iff the signature verifies under `key` for these exact fields.
    pub fn verify(&self, key: &VerifyingKey) -> bool {
        match signing_bytes(&self.fact_id, &self.voter_id, &self.vote) {
            Ok(message) => verify_hex(key, &message, &self.signature),
            Err(_) => false,
        }
    }
}

fn signing_bytes(fact_id: &FactId, voter_id: &PeerId, verdict: &Verdict) -> Result<Vec<u8>> {
    let body = json!({
        "factId": fact_id,
        "vote": verdict,
        "voterId": voter_id,
    });
    Ok(canonical_json(&body)?)
}
