//! Pluggable business-rule registry.
//!
//! Rules run last in the pipeline, in registration order, and the first
//! failing rule rejects the fact. Deployments add or remove rules by id; the
//! defaults cover id uniqueness, temporal consistency, resource availability
//! and the multi-party requirements of `committed` facts.

use agora_fact::{FactIndex, Relation, Triplet};
use serde_json::Value;

use crate::error::{Result, ValidationError};

pub const UNIQUE_ID: &str = "unique-id";
pub const TEMPORAL_CONSISTENCY: &str = "temporal-consistency";
pub const RESOURCE_AVAILABILITY: &str = "resource-availability";
pub const MULTI_PARTY: &str = "multi-party";
pub const COMMITTED_REFERENCES: &str = "committed-references";
pub const ESCROW_TERMS: &str = "escrow-terms";

/// State a rule may consult.
pub struct RuleContext<'a> {
    pub index: &'a FactIndex,
    /// Validation time (unix millis).
    pub now: u64,
}

type RuleFn = dyn Fn(&Triplet, &RuleContext<'_>) -> std::result::Result<(), String> + Send + Sync;

/// Ordered set of named rules.
pub struct RuleRegistry {
    rules: Vec<(String, Box<RuleFn>)>,
}

impl std::fmt::Debug for RuleRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_list().entries(self.ids()).finish()
    }
}

impl Default for RuleRegistry {
    fn default() -> Self {
        Self::with_defaults()
    }
}

impl RuleRegistry {
    /// A registry with no rules at all.
    pub fn empty() -> Self {
        Self { rules: Vec::new() }
    }

    pub fn with_defaults() -> Self {
        let mut registry = Self::empty();
        registry.add_rule(UNIQUE_ID, unique_id);
        registry.add_rule(TEMPORAL_CONSISTENCY, temporal_consistency);
        registry.add_rule(RESOURCE_AVAILABILITY, resource_availability);
        registry.add_rule(MULTI_PARTY, multi_party);
        registry.add_rule(COMMITTED_REFERENCES, committed_references);
        registry.add_rule(ESCROW_TERMS, escrow_terms);
        registry
    }

    /// Register a rule. Re-registering an id replaces the rule in place.
    pub fn add_rule<F>(&mut self, id: impl Into<String>, rule: F)
    where
        F: Fn(&Triplet, &RuleContext<'_>) -> std::result::Result<(), String>
            + Send
            + Sync
            + 'static,
    {
        let id = id.into();
        match self.rules.iter_mut().find(|(existing, _)| *existing == id) {
            Some(slot) => slot.1 = Box::new(rule),
            None => self.rules.push((id, Box::new(rule))),
        }
    }

    /// Remove a rule by id. Returns whether it existed.
    pub fn remove_rule(&mut self, id: &str) -> bool {
        let before = self.rules.len();
        self.rules.retain(|(existing, _)| existing != id);
        self.rules.len() != before
    }

    pub fn contains(&self, id: &str) -> bool {
        self.rules.iter().any(|(existing, _)| existing == id)
    }

    pub fn ids(&self) -> impl Iterator<Item = &str> {
        self.rules.iter().map(|(id, _)| id.as_str())
    }

    pub fn len(&self) -> usize {
        self.rules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }

    /// Run every rule; the first failure wins.
    pub fn evaluate(&self, fact: &Triplet, ctx: &RuleContext<'_>) -> Result<()> {
        for (id, rule) in &self.rules {
            rule(fact, ctx).map_err(|reason| ValidationError::BusinessRule {
                rule: id.clone(),
                reason,
            })?;
        }
        Ok(())
    }
}

/// No *different* fact may already hold this id. Re-validating the same
/// fact (same hash) passes.
fn unique_id(fact: &Triplet, ctx: &RuleContext<'_>) -> std::result::Result<(), String> {
    match ctx.index.get(&fact.id) {
        Some(existing) if existing.hash != fact.hash => {
            Err(format!("id {} already names a different fact", fact.id))
        }
        _ => Ok(()),
    }
}

fn temporal_consistency(fact: &Triplet, _ctx: &RuleContext<'_>) -> std::result::Result<(), String> {
    let Some(agreement) = fact.agreement() else {
        return Ok(());
    };
    if agreement.valid_until <= fact.timestamp {
        return Err("validUntil must be after the fact timestamp".into());
    }
    match fact.context.expires {
        Some(expires) if expires > agreement.valid_until => {
            Err("context expiry outlives the agreement's validUntil".into())
        }
        _ => Ok(()),
    }
}

fn resource_availability(fact: &Triplet, _ctx: &RuleContext<'_>) -> std::result::Result<(), String> {
    if fact.relation == Relation::Has
        && fact
            .context
            .availability
            .as_deref()
            .is_some_and(|a| a.eq_ignore_ascii_case("unavailable"))
    {
        return Err("offered resource is marked unavailable".into());
    }
    Ok(())
}

fn multi_party(fact: &Triplet, _ctx: &RuleContext<'_>) -> std::result::Result<(), String> {
    if fact.relation == Relation::Committed && fact.entity.distinct_count() < 2 {
        return Err("agreement needs at least two distinct parties".into());
    }
    Ok(())
}

fn committed_references(fact: &Triplet, ctx: &RuleContext<'_>) -> std::result::Result<(), String> {
    if fact.relation != Relation::Committed {
        return Ok(());
    }
    for reference in fact.references() {
        let Some(referenced) = ctx.index.get(&reference) else {
            return Err(format!("referenced fact {reference} is unknown"));
        };
        if referenced.relation == Relation::Committed {
            return Err(format!("referenced fact {reference} is not a has/needs fact"));
        }
        if !referenced.validated {
            return Err(format!("referenced fact {reference} is not validated"));
        }
    }
    Ok(())
}

fn escrow_terms(fact: &Triplet, _ctx: &RuleContext<'_>) -> std::result::Result<(), String> {
    let Some(escrow) = &fact.context.escrow else {
        return Ok(());
    };
    let declared = |key: &str| escrow.get(key).is_some_and(|v| !v.is_null());
    if !matches!(escrow, Value::Object(_)) || !declared("conditions") || !declared("releaseConditions") {
        return Err("escrow must declare conditions and releaseConditions".into());
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use agora_fact::{Context, FactFactory, FactId, PeerId};
    use serde_json::json;

    fn factory() -> FactFactory {
        FactFactory::new(PeerId::from("b3b3/rules"))
    }

    fn check(fact: &Triplet, index: &FactIndex) -> Result<()> {
        RuleRegistry::with_defaults().evaluate(fact, &RuleContext { index, now: 0 })
    }

    fn rule_of(result: Result<()>) -> String {
        match result {
            Err(ValidationError::BusinessRule { rule, .. }) => rule,
            other => panic!("expected business rule violation, got {other:?}"),
        }
    }

    #[test]
    fn defaults_registered_in_order() {
        let registry = RuleRegistry::with_defaults();
        let ids: Vec<_> = registry.ids().collect();
        assert_eq!(
            ids,
            vec![
                UNIQUE_ID,
                TEMPORAL_CONSISTENCY,
                RESOURCE_AVAILABILITY,
                MULTI_PARTY,
                COMMITTED_REFERENCES,
                ESCROW_TERMS
            ]
        );
    }

    #[test]
    fn add_replace_and_remove() {
        let mut registry = RuleRegistry::empty();
        registry.add_rule("no-bikes", |f, _| {
            if f.object_text().contains("bike") {
                Err("bikes banned".into())
            } else {
                Ok(())
            }
        });
        assert_eq!(registry.len(), 1);

        let index = FactIndex::new();
        let fact = factory().has("a", "bike", Context::new()).unwrap();
        let ctx = RuleContext { index: &index, now: 0 };
        assert!(registry.evaluate(&fact, &ctx).is_err());

        registry.add_rule("no-bikes", |_, _| Ok(()));
        assert_eq!(registry.len(), 1);
        assert!(registry.evaluate(&fact, &ctx).is_ok());

        assert!(registry.remove_rule("no-bikes"));
        assert!(!registry.remove_rule("no-bikes"));
        assert!(registry.is_empty());
    }

    #[test]
    fn unique_id_allows_same_fact() {
        let mut index = FactIndex::new();
        let fact = factory().has("a", "water", Context::new()).unwrap();
        index.insert(fact.clone());
        assert!(check(&fact, &index).is_ok());

        let mut impostor = factory().has("b", "food", Context::new()).unwrap();
        impostor.id = fact.id.clone();
        impostor.recompute_hash().unwrap();
        assert_eq!(rule_of(check(&impostor, &index)), UNIQUE_ID);
    }

    #[test]
    fn unavailable_offers_rejected() {
        let index = FactIndex::new();
        let fact = factory()
            .has("a", "water", Context::new().with_availability("unavailable"))
            .unwrap();
        assert_eq!(rule_of(check(&fact, &index)), RESOURCE_AVAILABILITY);

        let need = factory()
            .needs("a", "water", Context::new().with_availability("unavailable"))
            .unwrap();
        assert!(check(&need, &index).is_ok());
    }

    #[test]
    fn committed_requires_distinct_parties() {
        let index = FactIndex::new();
        let fact = factory()
            .committed(
                vec!["same".into(), "same".into()],
                json!("t"),
                u64::MAX,
                &[],
                Context::new(),
            )
            .unwrap();
        assert_eq!(rule_of(check(&fact, &index)), MULTI_PARTY);
    }

    #[test]
    fn committed_references_must_be_validated() {
        let mut index = FactIndex::new();
        let mut need = factory().needs("a", "water", Context::new()).unwrap();
        let has = factory().has("b", "water", Context::new()).unwrap();
        need.validated = true;
        let refs = [need.id.clone(), has.id.clone()];
        index.insert(need);
        index.insert(has.clone());

        let committed = factory()
            .committed(vec!["a".into(), "b".into()], json!("t"), u64::MAX, &refs, Context::new())
            .unwrap();
        assert_eq!(rule_of(check(&committed, &index)), COMMITTED_REFERENCES);

        let mut has = has;
        has.validated = true;
        index.insert(has);
        assert!(check(&committed, &index).is_ok());

        let dangling = factory()
            .committed(
                vec!["a".into(), "b".into()],
                json!("t"),
                u64::MAX,
                &[FactId::from("fact-missing")],
                Context::new(),
            )
            .unwrap();
        assert_eq!(rule_of(check(&dangling, &index)), COMMITTED_REFERENCES);
    }

    #[test]
    fn escrow_needs_both_condition_sets() {
        let index = FactIndex::new();
        let partial = factory()
            .needs("a", "water", Context::new().with_escrow(json!({"conditions": ["delivered"]})))
            .unwrap();
        assert_eq!(rule_of(check(&partial, &index)), ESCROW_TERMS);

        let full = factory()
            .needs(
                "a",
                "water",
                Context::new().with_escrow(json!({
                    "conditions": ["delivered"],
                    "releaseConditions": ["signed receipt"],
                })),
            )
            .unwrap();
        assert!(check(&full, &index).is_ok());
    }

    #[test]
    fn expiry_must_not_outlive_agreement() {
        let index = FactIndex::new();
        let mut fact = factory()
            .committed(vec!["a".into(), "b".into()], json!("t"), 0, &[], Context::new())
            .unwrap();
        fact.object = json!({"agreement": {"terms": "t", "validUntil": fact.timestamp + 10}});
        fact.context.expires = Some(fact.timestamp + 20);
        assert_eq!(rule_of(check(&fact, &index)), TEMPORAL_CONSISTENCY);

        fact.context.expires = Some(fact.timestamp + 5);
        assert!(check(&fact, &index).is_ok());
    }
}
