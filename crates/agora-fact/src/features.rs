//! Semantic feature extraction for downstream matching.
//!
//! Nothing in the protocol core consumes these; they are derived on demand
//! so a matcher layered on top of validated facts does not have to re-parse
//! free-form objects.

use serde::{Deserialize, Serialize};

use crate::triplet::{Triplet, Urgency};

const HOUR_MS: u64 = 60 * 60 * 1000;
const DAY_MS: u64 = 24 * HOUR_MS;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntityType {
    Individual,
    Group,
    Organization,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResourceType {
    Water,
    Food,
    Shelter,
    Medical,
    Transport,
    Tools,
    Other,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Timeframe {
    /// Expires within the hour.
    Immediate,
    /// Expires within a day.
    ShortTerm,
    LongTerm,
    /// No expiry.
    Open,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct FeatureSet {
    pub entity_type: EntityType,
    pub resource_type: ResourceType,
    pub urgency: Urgency,
    pub timeframe: Timeframe,
}

const ORGANIZATION_WORDS: &[&str] = &[
    "org", "clinic", "hospital", "shelter", "coop", "co-op", "school", "church", "depot", "bank",
];
const GROUP_WORDS: &[&str] = &["team", "group", "community", "family", "household", "crew"];

const RESOURCE_WORDS: &[(ResourceType, &[&str])] = &[
    (ResourceType::Water, &["water", "bottle", "hydration"]),
    (ResourceType::Food, &["food", "meal", "bread", "rice", "grocer"]),
    (ResourceType::Shelter, &["shelter", "housing", "bed", "tent", "room"]),
    (ResourceType::Medical, &["medic", "medicine", "first aid", "doctor", "insulin", "bandage"]),
    (ResourceType::Transport, &["ride", "car", "transport", "truck", "bike", "fuel"]),
    (ResourceType::Tools, &["tool", "drill", "ladder", "generator", "saw"]),
];

impl Triplet {
    /// Infer matching features from the fact's fields.
    pub fn semantic_features(&self) -> FeatureSet {
        FeatureSet {
            entity_type: infer_entity_type(&self.entity.identifiers()),
            resource_type: infer_resource_type(&self.object_text()),
            urgency: self.context.urgency.unwrap_or_default(),
            timeframe: infer_timeframe(self.timestamp, self.context.expires),
        }
    }
}

fn infer_entity_type(ids: &[&str]) -> EntityType {
    if ids.len() > 1 {
        return EntityType::Group;
    }
    let text = ids.first().map(|s| s.to_lowercase()).unwrap_or_default();
    if ORGANIZATION_WORDS.iter().any(|w| text.contains(w)) {
        EntityType::Organization
    } else if GROUP_WORDS.iter().any(|w| text.contains(w)) {
        EntityType::Group
    } else {
        EntityType::Individual
    }
}

fn infer_resource_type(object: &str) -> ResourceType {
    let text = object.to_lowercase();
    RESOURCE_WORDS
        .iter()
        .find(|(_, words)| words.iter().any(|w| text.contains(w)))
        .map(|(kind, _)| *kind)
        .unwrap_or(ResourceType::Other)
}

fn infer_timeframe(timestamp: u64, expires: Option<u64>) -> Timeframe {
    match expires.map(|e| e.saturating_sub(timestamp)) {
        None => Timeframe::Open,
        Some(d) if d <= HOUR_MS => Timeframe::Immediate,
        Some(d) if d <= DAY_MS => Timeframe::ShortTerm,
        Some(_) => Timeframe::LongTerm,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::factory::FactFactory;
    use crate::identity::PeerId;
    use crate::triplet::Context;
    use serde_json::json;

    #[test]
    fn water_need_features() {
        let factory = FactFactory::new(PeerId::from("a"));
        let mut fact = factory
            .needs("riverside clinic", "water", Context::new().with_urgency(Urgency::High))
            .unwrap();
        fact.context.expires = Some(fact.timestamp + 30 * 60 * 1000);

        let features = fact.semantic_features();
        assert_eq!(features.entity_type, EntityType::Organization);
        assert_eq!(features.resource_type, ResourceType::Water);
        assert_eq!(features.urgency, Urgency::High);
        assert_eq!(features.timeframe, Timeframe::Immediate);
    }

    #[test]
    fn structured_objects_are_searched() {
        let factory = FactFactory::new(PeerId::from("a"));
        let fact = factory
            .has("bob", json!({"item": "Water Bottles", "count": 24}), Context::new())
            .unwrap();
        let features = fact.semantic_features();
        assert_eq!(features.resource_type, ResourceType::Water);
        assert_eq!(features.entity_type, EntityType::Individual);
        assert_eq!(features.urgency, Urgency::Medium);
        assert_eq!(features.timeframe, Timeframe::Open);
    }

    #[test]
    fn unknown_resources_fall_back() {
        assert_eq!(infer_resource_type("a violin"), ResourceType::Other);
        assert_eq!(infer_timeframe(0, Some(2 * DAY_MS)), Timeframe::LongTerm);
        assert_eq!(infer_timeframe(0, Some(2 * HOUR_MS)), Timeframe::ShortTerm);
    }
}
