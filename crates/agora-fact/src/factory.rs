//! Convenience constructors bound to a creator.

use serde_json::{json, Value};

use crate::error::Result;
use crate::identity::PeerId;
use crate::triplet::{Context, Entity, FactFields, FactId, Triplet};

/// Creates facts on behalf of one peer.
#[derive(Debug, Clone)]
pub struct FactFactory {
    creator: PeerId,
}

impl FactFactory {
    pub fn new(creator: PeerId) -> Self {
        Self { creator }
    }

    pub fn creator(&self) -> &PeerId {
        &self.creator
    }

    /// Generic constructor; `relation` is checked against the closed set.
    pub fn create(
        &self,
        relation: &str,
        entity: Entity,
        object: Value,
        context: Context,
    ) -> Result<Triplet> {
        Triplet::create(FactFields {
            entity,
            relation: relation.to_string(),
            object,
            context,
            creator: self.creator.clone(),
            timestamp: None,
        })
    }

    /// An offer.
    pub fn has(&self, entity: &str, object: impl Into<Value>, context: Context) -> Result<Triplet> {
        self.create("has", entity.into(), object.into(), context)
    }

    /// A request.
    pub fn needs(&self, entity: &str, object: impl Into<Value>, context: Context) -> Result<Triplet> {
        self.create("needs", entity.into(), object.into(), context)
    }

    /// A multi-party agreement over previously published facts.
    pub fn committed(
        &self,
        parties: Vec<String>,
        terms: Value,
        valid_until: u64,
        references: &[FactId],
        context: Context,
    ) -> Result<Triplet> {
        let object = json!({
            "agreement": {
                "terms": terms,
                "validUntil": valid_until,
            },
            "references": references,
        });
        self.create("committed", Entity::Parties(parties), object, context)
    }
}
