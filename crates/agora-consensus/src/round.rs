use std::collections::HashMap;
use std::time::Instant;

use agora_fact::{PeerId, Triplet};

/// One pending consensus round.
#[derive(Debug, Clone)]
pub struct Round {
    pub fact: Triplet,
    pub started_at: Instant,
    pub deadline: Instant,
    votes: HashMap<PeerId, bool>,
}

impl Round {
    pub fn new(fact: Triplet, started_at: Instant, deadline: Instant) -> Self {
        Self {
            fact,
            started_at,
            deadline,
            votes: HashMap::new(),
        }
    }

    /// Record a vote. A voter's later vote replaces the earlier one.
    /// Returns the previous vote, if any.
    pub fn record(&mut self, voter: PeerId, valid: bool) -> Option<bool> {
        self.votes.insert(voter, valid)
    }

    pub fn positive(&self) -> usize {
        self.votes.values().filter(|v| **v).count()
    }

    pub fn total(&self) -> usize {
        self.votes.len()
    }

    pub fn has_voted(&self, voter: &PeerId) -> bool {
        self.votes.contains_key(voter)
    }

    pub fn is_overdue(&self, now: Instant) -> bool {
        now >= self.deadline
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use agora_fact::{Context, FactFactory};
    use std::time::Duration;

    #[test]
    fn last_vote_wins() {
        let fact = FactFactory::new(PeerId::from("p"))
            .has("a", "water", Context::new())
            .unwrap();
        let now = Instant::now();
        let mut round = Round::new(fact, now, now + Duration::from_secs(1));

        assert_eq!(round.record(PeerId::from("v1"), false), None);
        assert_eq!(round.record(PeerId::from("v1"), true), Some(false));
        round.record(PeerId::from("v2"), false);

        assert_eq!(round.total(), 2);
        assert_eq!(round.positive(), 1);
        assert!(round.has_voted(&PeerId::from("v1")));
        assert!(!round.is_overdue(now));
        assert!(round.is_overdue(now + Duration::from_secs(1)));
    }
}
