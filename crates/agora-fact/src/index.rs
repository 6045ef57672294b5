//! In-memory fact index keyed by id and partitioned by relation.

use std::collections::{BTreeSet, HashMap};

use crate::triplet::{FactId, Relation, Triplet};

/// Local fact store.
#[derive(Debug, Default)]
pub struct FactIndex {
    facts: HashMap<FactId, Triplet>,
    by_relation: HashMap<Relation, BTreeSet<FactId>>,
}

impl FactIndex {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, id: &FactId) -> Option<&Triplet> {
        self.facts.get(id)
    }

    pub fn get_mut(&mut self, id: &FactId) -> Option<&mut Triplet> {
        self.facts.get_mut(id)
    }

    pub fn contains(&self, id: &FactId) -> bool {
        self.facts.contains_key(id)
    }

    /// Insert or replace a fact. Returns the replaced fact, if any.
    pub fn insert(&mut self, fact: Triplet) -> Option<Triplet> {
        let id = fact.id.clone();
        let relation = fact.relation;
        let previous = self.facts.insert(id.clone(), fact);
        if let Some(prev) = &previous {
            self.unlink(prev.relation, &id);
        }
        self.by_relation.entry(relation).or_default().insert(id);
        previous
    }

    pub fn remove(&mut self, id: &FactId) -> Option<Triplet> {
        let fact = self.facts.remove(id)?;
        self.unlink(fact.relation, id);
        Some(fact)
    }

    fn unlink(&mut self, relation: Relation, id: &FactId) {
        if let Some(ids) = self.by_relation.get_mut(&relation) {
            ids.remove(id);
        }
    }

    /// Facts of one relation, in id order.
    pub fn by_relation(&self, relation: Relation) -> impl Iterator<Item = &Triplet> {
        self.by_relation
            .get(&relation)
            .into_iter()
            .flatten()
            .filter_map(|id| self.facts.get(id))
    }

    pub fn count(&self, relation: Relation) -> usize {
        self.by_relation.get(&relation).map_or(0, BTreeSet::len)
    }

    /// Remove every expired fact and return their ids.
    pub fn sweep_expired(&mut self, now: u64) -> Vec<FactId> {
        let expired: Vec<FactId> = self
            .facts
            .values()
            .filter(|f| f.is_expired(now))
            .map(|f| f.id.clone())
            .collect();
        for id in &expired {
            self.remove(id);
        }
        expired
    }

    pub fn iter(&self) -> impl Iterator<Item = &Triplet> {
        self.facts.values()
    }

    pub fn validated(&self) -> impl Iterator<Item = &Triplet> {
        self.facts.values().filter(|f| f.validated)
    }

    pub fn len(&self) -> usize {
        self.facts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.facts.is_empty()
    }

    pub fn clear(&mut self) {
        self.facts.clear();
        self.by_relation.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::factory::FactFactory;
    use crate::identity::PeerId;
    use crate::triplet::Context;

    fn factory() -> FactFactory {
        FactFactory::new(PeerId::from("b3b3/test"))
    }

    #[test]
    fn insert_and_partition() {
        let mut index = FactIndex::new();
        let f = factory();
        index.insert(f.has("a", "water", Context::new()).unwrap());
        index.insert(f.has("b", "food", Context::new()).unwrap());
        index.insert(f.needs("c", "water", Context::new()).unwrap());

        assert_eq!(index.len(), 3);
        assert_eq!(index.count(Relation::Has), 2);
        assert_eq!(index.count(Relation::Needs), 1);
        assert_eq!(index.count(Relation::Committed), 0);
        assert_eq!(index.by_relation(Relation::Has).count(), 2);
    }

    #[test]
    fn replace_moves_partition() {
        let mut index = FactIndex::new();
        let mut fact = factory().has("a", "water", Context::new()).unwrap();
        index.insert(fact.clone());

        fact.relation = Relation::Needs;
        let prev = index.insert(fact);
        assert!(prev.is_some());
        assert_eq!(index.count(Relation::Has), 0);
        assert_eq!(index.count(Relation::Needs), 1);
    }

    #[test]
    fn sweep_removes_only_expired() {
        let mut index = FactIndex::new();
        let f = factory();
        let keep = f.has("a", "water", Context::new()).unwrap();
        let stale = f
            .needs("b", "water", Context::new().with_expires(1_000))
            .unwrap();
        let keep_id = keep.id.clone();
        let stale_id = stale.id.clone();
        index.insert(keep);
        index.insert(stale);

        let swept = index.sweep_expired(5_000);
        assert_eq!(swept, vec![stale_id.clone()]);
        assert!(index.contains(&keep_id));
        assert!(!index.contains(&stale_id));
        assert_eq!(index.count(Relation::Needs), 0);
    }

    #[test]
    fn validated_filter() {
        let mut index = FactIndex::new();
        let f = factory();
        let mut a = f.has("a", "water", Context::new()).unwrap();
        a.validated = true;
        index.insert(a);
        index.insert(f.has("b", "food", Context::new()).unwrap());
        assert_eq!(index.validated().count(), 1);
    }
}
