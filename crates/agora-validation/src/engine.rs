//! The validation pipeline.
//!
//! ```text
//! structural → semantic → cryptographic → context → business rules
//! ```
//!
//! Stages short-circuit on the first failure. A rejected fact is left exactly
//! as it was handed in so the caller may fix and resubmit it; an accepted fact
//! is marked `validated` and, when the local peer created it and it is still
//! unsigned, signed with the local key.

use std::collections::HashSet;
use std::sync::Arc;

use agora_fact::{Entity, KeyLookup, PeerId, Relation, Signer, Triplet, FACT_VERSION};
use serde_json::Value;
use tracing::{debug, trace};

use crate::config::ValidationConfig;
use crate::error::{Result, Stage, ValidationError};
use crate::rules::{RuleContext, RuleRegistry};

/// Where a fact came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Origin<'a> {
    /// Submitted by the local application.
    Local,
    /// Published directly by a connected peer.
    Peer(&'a PeerId),
    /// Relayed by a peer on behalf of its creator (overlay sync).
    Relayed(&'a PeerId),
}

/// Shared state the pipeline reads but never mutates.
pub struct ValidationContext<'a> {
    pub index: &'a agora_fact::FactIndex,
    pub keys: &'a dyn KeyLookup,
    /// Validation time (unix millis).
    pub now: u64,
}

/// Counters per outcome.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ValidationStats {
    pub validated: u64,
    pub signed: u64,
    pub structural: u64,
    pub semantic: u64,
    pub cryptographic: u64,
    pub context: u64,
    pub business_rules: u64,
}

impl ValidationStats {
    fn record_rejection(&mut self, stage: Stage) {
        match stage {
            Stage::Structural => self.structural += 1,
            Stage::Semantic => self.semantic += 1,
            Stage::Cryptographic => self.cryptographic += 1,
            Stage::Context => self.context += 1,
            Stage::BusinessRules => self.business_rules += 1,
        }
    }

    pub fn rejected(&self) -> u64 {
        self.structural + self.semantic + self.cryptographic + self.context + self.business_rules
    }
}

/// Validates facts for one local peer.
pub struct ValidationEngine {
    config: ValidationConfig,
    signer: Arc<dyn Signer>,
    rules: RuleRegistry,
    revoked: HashSet<PeerId>,
    stats: ValidationStats,
}

impl std::fmt::Debug for ValidationEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ValidationEngine")
            .field("local", self.signer.peer_id())
            .field("rules", &self.rules)
            .field("revoked", &self.revoked.len())
            .finish()
    }
}

impl ValidationEngine {
    pub fn new(config: ValidationConfig, signer: Arc<dyn Signer>) -> Self {
        Self {
            config,
            signer,
            rules: RuleRegistry::with_defaults(),
            revoked: HashSet::new(),
            stats: ValidationStats::default(),
        }
    }

    #[must_use]
    pub fn with_rules(mut self, rules: RuleRegistry) -> Self {
        self.rules = rules;
        self
    }

    pub fn local_peer(&self) -> &PeerId {
        self.signer.peer_id()
    }

    pub fn config(&self) -> &ValidationConfig {
        &self.config
    }

    pub fn rules(&self) -> &RuleRegistry {
        &self.rules
    }

    pub fn rules_mut(&mut self) -> &mut RuleRegistry {
        &mut self.rules
    }

    pub fn add_rule<F>(&mut self, id: impl Into<String>, rule: F)
    where
        F: Fn(&Triplet, &RuleContext<'_>) -> std::result::Result<(), String>
            + Send
            + Sync
            + 'static,
    {
        self.rules.add_rule(id, rule);
    }

    pub fn remove_rule(&mut self, id: &str) -> bool {
        self.rules.remove_rule(id)
    }

    /// Put a peer on the revocation list.
    pub fn revoke(&mut self, peer: PeerId) {
        debug!(peer = %peer, "peer revoked");
        self.revoked.insert(peer);
    }

    pub fn reinstate(&mut self, peer: &PeerId) -> bool {
        self.revoked.remove(peer)
    }

    pub fn is_revoked(&self, peer: &PeerId) -> bool {
        self.revoked.contains(peer)
    }

    pub fn stats(&self) -> &ValidationStats {
        &self.stats
    }

    /// Validate a locally submitted fact.
    pub fn validate(&mut self, fact: &mut Triplet, ctx: &ValidationContext<'_>) -> Result<()> {
        self.run(fact, Origin::Local, ctx)
    }

    /// Validate a fact published by `sender`.
    pub fn validate_from_peer(
        &mut self,
        fact: &mut Triplet,
        sender: &PeerId,
        ctx: &ValidationContext<'_>,
    ) -> Result<()> {
        self.run(fact, Origin::Peer(sender), ctx)
    }

    /// Validate a fact relayed by `relay` on behalf of its creator.
    pub fn validate_relayed(
        &mut self,
        fact: &mut Triplet,
        relay: &PeerId,
        ctx: &ValidationContext<'_>,
    ) -> Result<()> {
        self.run(fact, Origin::Relayed(relay), ctx)
    }

    fn run(&mut self, fact: &mut Triplet, origin: Origin<'_>, ctx: &ValidationContext<'_>) -> Result<()> {
        if let Err(e) = self.check(fact, origin, ctx) {
            self.stats.record_rejection(e.stage());
            debug!(fact_id = %fact.id, stage = %e.stage(), error = %e, "fact rejected");
            return Err(e);
        }

        if fact.signature.is_none() && fact.creator == *self.signer.peer_id() {
            fact.sign(self.signer.as_ref())?;
            self.stats.signed += 1;
            trace!(fact_id = %fact.id, "fact signed");
        }
        fact.validated = true;
        self.stats.validated += 1;
        debug!(fact_id = %fact.id, relation = %fact.relation, "fact validated");
        Ok(())
    }

    /// Run every stage without touching the fact.
    pub fn check(&self, fact: &Triplet, origin: Origin<'_>, ctx: &ValidationContext<'_>) -> Result<()> {
        structural(fact)?;
        semantic(fact)?;
        self.cryptographic(fact, origin, ctx)?;
        self.temporal(fact, ctx.now)?;
        self.rules.evaluate(
            fact,
            &RuleContext {
                index: ctx.index,
                now: ctx.now,
            },
        )
    }

    fn cryptographic(&self, fact: &Triplet, origin: Origin<'_>, ctx: &ValidationContext<'_>) -> Result<()> {
        match origin {
            Origin::Local => {}
            Origin::Peer(sender) => {
                if self.is_revoked(sender) {
                    return Err(ValidationError::Revoked(sender.clone()));
                }
                if fact.creator != *sender {
                    return Err(ValidationError::CreatorMismatch {
                        creator: fact.creator.clone(),
                        sender: sender.clone(),
                    });
                }
            }
            Origin::Relayed(relay) => {
                if self.is_revoked(relay) {
                    return Err(ValidationError::Revoked(relay.clone()));
                }
                if self.is_revoked(&fact.creator) {
                    return Err(ValidationError::Revoked(fact.creator.clone()));
                }
            }
        }

        if !fact.verify_hash() {
            return Err(ValidationError::Cryptographic(
                "hash does not match fact contents".into(),
            ));
        }

        if fact.signature.is_none() {
            if origin != Origin::Local && self.config.require_peer_signature {
                return Err(ValidationError::Cryptographic(
                    "fact from a peer must be signed".into(),
                ));
            }
            return Ok(());
        }

        let key = if fact.creator == *self.signer.peer_id() {
            Some(self.signer.public_key())
        } else {
            ctx.keys.public_key(&fact.creator)
        };
        let Some(key) = key else {
            return Err(ValidationError::Cryptographic(format!(
                "no public key known for creator {}",
                fact.creator
            )));
        };
        if !fact.verify_signature(&key) {
            return Err(ValidationError::Cryptographic(
                "signature does not verify against creator key".into(),
            ));
        }
        Ok(())
    }

    fn temporal(&self, fact: &Triplet, now: u64) -> Result<()> {
        if fact.timestamp > now.saturating_add(self.config.skew_ms()) {
            return Err(ValidationError::Context(format!(
                "timestamp {} is too far in the future",
                fact.timestamp
            )));
        }
        if now.saturating_sub(fact.timestamp) > self.config.max_age_ms() {
            return Err(ValidationError::Context(format!(
                "timestamp {} exceeds the maximum age",
                fact.timestamp
            )));
        }
        if let Some(expires) = fact.context.expires {
            if expires <= fact.timestamp {
                return Err(ValidationError::Context(
                    "expires must be after the fact timestamp".into(),
                ));
            }
        }
        if let Some(location) = fact.context.location {
            if !location.is_valid() {
                return Err(ValidationError::Context(format!(
                    "location ({}, {}) is out of bounds",
                    location.lat, location.lng
                )));
            }
        }
        Ok(())
    }
}

fn structural(fact: &Triplet) -> Result<()> {
    let fail = |msg: &str| Err(ValidationError::Structural(msg.to_string()));

    if !fact.id.is_well_formed() {
        return fail("id is not well formed");
    }
    if fact.timestamp == 0 {
        return fail("timestamp must be a positive integer");
    }
    if fact.creator.is_empty() {
        return fail("creator is missing");
    }
    if fact.version != FACT_VERSION {
        return Err(ValidationError::Structural(format!(
            "unsupported version {:?}",
            fact.version
        )));
    }
    if fact.hash.is_empty() {
        return fail("hash is missing");
    }
    if fact.object.is_null() {
        return fail("object is missing");
    }
    let ids = fact.entity.identifiers();
    if ids.is_empty() || ids.iter().any(|id| id.trim().is_empty()) {
        return fail("entity is missing");
    }
    Ok(())
}

fn semantic(fact: &Triplet) -> Result<()> {
    let fail = |msg: String| Err(ValidationError::Semantic(msg));

    match (fact.relation, &fact.entity) {
        (Relation::Committed, Entity::Parties(parties)) if parties.len() >= 2 => {}
        (Relation::Committed, Entity::Parties(parties)) => {
            return fail(format!(
                "committed fact needs at least 2 entities, got {}",
                parties.len()
            ));
        }
        (Relation::Committed, Entity::Single(_)) => {
            return fail("committed fact needs a set of entities".into());
        }
        (relation, Entity::Parties(_)) => {
            return fail(format!("entity sets are only allowed for committed, not {relation}"));
        }
        (_, Entity::Single(_)) => {}
    }

    match fact.relation {
        Relation::Committed => {
            let Some(agreement) = fact.object.get("agreement").filter(|a| a.is_object()) else {
                return fail("committed object needs an agreement".into());
            };
            if !agreement.get("validUntil").is_some_and(Value::is_u64) {
                return fail("agreement.validUntil must be an integer timestamp".into());
            }
        }
        Relation::Has | Relation::Needs => match &fact.object {
            Value::String(s) if !s.trim().is_empty() => {}
            Value::Object(_) | Value::Array(_) => {}
            _ => {
                return fail(format!(
                    "{} object must be a description or a structure",
                    fact.relation
                ));
            }
        },
    }
    Ok(())
}
