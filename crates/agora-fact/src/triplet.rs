//! The triplet: entity, relation, object with situational context.
//!
//! A triplet is the protocol's unit of truth. Its `hash` is a BLAKE3 digest over
//! the canonical JSON encoding (sorted keys, no whitespace) of
//! `{context, creator, entity, object, relation, timestamp, version}`. Any
//! mutation of those fields invalidates the hash until [`Triplet::recompute_hash`]
//! runs again. `signature`, `validated` and `consensus` are outside the digest.

use std::str::FromStr;

use ed25519_dalek::VerifyingKey;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::{FactError, Result};
use crate::identity::{decode_signature, PeerId, Signer};
use crate::now_millis;

/// Protocol version mixed into every fact hash.
pub const FACT_VERSION: &str = "1.0";

/// Maximum length of a fact identifier.
pub const MAX_ID_LEN: usize = 128;

/// Opaque fact identifier.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct FactId(String);

impl FactId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Fresh random identifier (`fact-` + 16 random bytes in hex).
    pub fn generate() -> Self {
        let bytes: [u8; 16] = rand::random();
        Self(format!("fact-{}", hex::encode(bytes)))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Non-empty, bounded, and restricted to `[A-Za-z0-9_.:-]`.
    pub fn is_well_formed(&self) -> bool {
        !self.0.is_empty()
            && self.0.len() <= MAX_ID_LEN
            && self
                .0
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | ':' | '.'))
    }
}

impl std::fmt::Display for FactId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for FactId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// The closed set of relations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Relation {
    /// An offer: the entity has a resource.
    Has,
    /// A request: the entity needs a resource.
    Needs,
    /// A multi-party agreement.
    Committed,
}

impl Relation {
    pub const ALL: [Relation; 3] = [Relation::Has, Relation::Needs, Relation::Committed];

    pub const fn as_str(&self) -> &'static str {
        match self {
            Relation::Has => "has",
            Relation::Needs => "needs",
            Relation::Committed => "committed",
        }
    }
}

impl std::fmt::Display for Relation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Relation {
    type Err = FactError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "has" => Ok(Relation::Has),
            "needs" => Ok(Relation::Needs),
            "committed" => Ok(Relation::Committed),
            other => Err(FactError::InvalidRelation(other.to_string())),
        }
    }
}

/// The acting party: one identifier, or an ordered set of parties for
/// `committed` facts.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Entity {
    Single(String),
    Parties(Vec<String>),
}

impl Entity {
    pub fn is_parties(&self) -> bool {
        matches!(self, Entity::Parties(_))
    }

    /// All identifiers named by this entity, in order.
    pub fn identifiers(&self) -> Vec<&str> {
        match self {
            Entity::Single(id) => vec![id.as_str()],
            Entity::Parties(ids) => ids.iter().map(String::as_str).collect(),
        }
    }

    /// Number of distinct identifiers.
    pub fn distinct_count(&self) -> usize {
        let mut ids = self.identifiers();
        ids.sort_unstable();
        ids.dedup();
        ids.len()
    }
}

impl From<&str> for Entity {
    fn from(s: &str) -> Self {
        Entity::Single(s.to_string())
    }
}

impl From<Vec<String>> for Entity {
    fn from(v: Vec<String>) -> Self {
        Entity::Parties(v)
    }
}

/// Urgency attribute of a fact's context.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Urgency {
    Low,
    #[default]
    Medium,
    High,
    Critical,
}

/// A geographic point.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Location {
    pub lat: f64,
    pub lng: f64,
}

impl Location {
    pub fn is_valid(&self) -> bool {
        self.lat.is_finite()
            && self.lng.is_finite()
            && (-90.0..=90.0).contains(&self.lat)
            && (-180.0..=180.0).contains(&self.lng)
    }
}

/// Open map of situational attributes. Well-known keys are typed; anything
/// else lands in `extra`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Context {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub location: Option<Location>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub urgency: Option<Urgency>,
    /// Expiry time (unix millis).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expires: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub availability: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub conditions: Option<Value>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub witnesses: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub escrow: Option<Value>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl Context {
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn with_urgency(mut self, urgency: Urgency) -> Self {
        self.urgency = Some(urgency);
        self
    }

    #[must_use]
    pub fn with_location(mut self, lat: f64, lng: f64) -> Self {
        self.location = Some(Location { lat, lng });
        self
    }

    #[must_use]
    pub fn with_expires(mut self, expires: u64) -> Self {
        self.expires = Some(expires);
        self
    }

    #[must_use]
    pub fn with_availability(mut self, availability: impl Into<String>) -> Self {
        self.availability = Some(availability.into());
        self
    }

    #[must_use]
    pub fn with_escrow(mut self, escrow: Value) -> Self {
        self.escrow = Some(escrow);
        self
    }

    #[must_use]
    pub fn with_witness(mut self, witness: impl Into<String>) -> Self {
        self.witnesses.push(witness.into());
        self
    }

    #[must_use]
    pub fn with_attribute(mut self, key: impl Into<String>, value: Value) -> Self {
        self.extra.insert(key.into(), value);
        self
    }
}

/// Typed view over a `committed` fact's `object.agreement`.
#[derive(Debug, Clone, PartialEq)]
pub struct Agreement {
    pub terms: Value,
    pub valid_until: u64,
}

/// Raw fields accepted by [`Triplet::create`].
#[derive(Debug, Clone)]
pub struct FactFields {
    pub entity: Entity,
    pub relation: String,
    pub object: Value,
    pub context: Context,
    pub creator: PeerId,
    /// Creation time; defaults to now.
    pub timestamp: Option<u64>,
}

/// A fact record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Triplet {
    pub id: FactId,
    pub entity: Entity,
    pub relation: Relation,
    pub object: Value,
    #[serde(default)]
    pub context: Context,
    pub creator: PeerId,
    pub timestamp: u64,
    #[serde(default = "default_version")]
    pub version: String,
    #[serde(default)]
    pub hash: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub signature: Option<String>,
    #[serde(default)]
    pub validated: bool,
    #[serde(default)]
    pub consensus: bool,
}

fn default_version() -> String {
    FACT_VERSION.to_string()
}

impl Triplet {
    /// Build a fact from raw fields. An unknown relation is rejected here and
    /// never reaches validation.
    pub fn create(fields: FactFields) -> Result<Self> {
        let relation = Relation::from_str(&fields.relation)?;
        let mut fact = Self {
            id: FactId::generate(),
            entity: fields.entity,
            relation,
            object: fields.object,
            context: fields.context,
            creator: fields.creator,
            timestamp: fields.timestamp.unwrap_or_else(now_millis),
            version: default_version(),
            hash: String::new(),
            signature: None,
            validated: false,
            consensus: false,
        };
        fact.recompute_hash()?;
        Ok(fact)
    }

    /// Decode a fact received from the wire. Locally-owned flags are cleared:
    /// a remote peer cannot vouch for our validation or consensus.
    pub fn from_wire(value: Value) -> Result<Self> {
        let mut fact: Triplet =
            serde_json::from_value(value).map_err(|e| FactError::Malformed(e.to_string()))?;
        fact.validated = false;
        fact.consensus = false;
        Ok(fact)
    }

    /// Canonical bytes covered by the hash.
    pub fn canonical_bytes(&self) -> Result<Vec<u8>> {
        let mut fields = Map::new();
        fields.insert("context".into(), serde_json::to_value(&self.context)?);
        fields.insert("creator".into(), serde_json::to_value(&self.creator)?);
        fields.insert("entity".into(), serde_json::to_value(&self.entity)?);
        fields.insert("object".into(), self.object.clone());
        fields.insert("relation".into(), serde_json::to_value(self.relation)?);
        fields.insert("timestamp".into(), Value::from(self.timestamp));
        fields.insert("version".into(), Value::from(self.version.clone()));
        canonical_json(&Value::Object(fields))
    }

    /// Hex digest of the current field values.
    pub fn compute_hash(&self) -> Result<String> {
        let bytes = self.canonical_bytes()?;
        Ok(blake3::hash(&bytes).to_hex().to_string())
    }

    pub fn recompute_hash(&mut self) -> Result<()> {
        self.hash = self.compute_hash()?;
        Ok(())
    }

    /// True iff the stored hash matches the current field values.
    pub fn verify_hash(&self) -> bool {
        match self.compute_hash() {
            Ok(hash) => !self.hash.is_empty() && hash == self.hash,
            Err(_) => false,
        }
    }

    /// Raw digest bytes of the stored hash (what signatures cover).
    pub fn digest(&self) -> Result<[u8; 32]> {
        let bytes = hex::decode(&self.hash).map_err(|_| FactError::InvalidDigest(self.hash.clone()))?;
        bytes
            .try_into()
            .map_err(|_| FactError::InvalidDigest(self.hash.clone()))
    }

    /// Sign the stored hash with the local key.
    pub fn sign(&mut self, signer: &dyn Signer) -> Result<()> {
        let digest = self.digest()?;
        self.signature = Some(hex::encode(signer.sign(&digest).to_bytes()));
        Ok(())
    }

    /// Verify the attached signature against `key`. False if unsigned.
    pub fn verify_signature(&self, key: &VerifyingKey) -> bool {
        let Some(signature) = &self.signature else {
            return false;
        };
        let (Ok(digest), Ok(signature)) = (self.digest(), decode_signature(signature)) else {
            return false;
        };
        key.verify_strict(&digest, &signature).is_ok()
    }

    /// Expired once `context.expires` or the agreement's `validUntil` has passed.
    pub fn is_expired(&self, now: u64) -> bool {
        if self.context.expires.is_some_and(|expires| expires <= now) {
            return true;
        }
        self.agreement()
            .is_some_and(|agreement| agreement.valid_until <= now)
    }

    /// Typed agreement for `committed` facts.
    pub fn agreement(&self) -> Option<Agreement> {
        let agreement = self.object.get("agreement")?;
        Some(Agreement {
            terms: agreement.get("terms").cloned().unwrap_or(Value::Null),
            valid_until: agreement.get("validUntil")?.as_u64()?,
        })
    }

    /// Fact ids a `committed` fact builds on (`object.references`).
    pub fn references(&self) -> Vec<FactId> {
        self.object
            .get("references")
            .and_then(Value::as_array)
            .map(|refs| {
                refs.iter()
                    .filter_map(Value::as_str)
                    .map(FactId::from)
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Human-readable rendering of the object (used for feature inference).
    pub fn object_text(&self) -> String {
        match &self.object {
            Value::String(s) => s.clone(),
            other => other.to_string(),
        }
    }
}

/// Serialize a JSON value with object keys sorted at every level.
pub fn canonical_json(value: &Value) -> Result<Vec<u8>> {
    Ok(serde_json::to_vec(&sorted(value))?)
}

fn sorted(value: &Value) -> Value {
    match value {
        Value::Object(map) => {
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort();
            let mut out = Map::new();
            for key in keys {
                out.insert(key.clone(), sorted(&map[key]));
            }
            Value::Object(out)
        }
        Value::Array(items) => Value::Array(items.iter().map(sorted).collect()),
        other => other.clone(),
    }
}
