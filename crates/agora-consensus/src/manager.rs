//! Pending rounds and their resolution.

use std::collections::HashMap;
use std::time::Instant;

use agora_fact::{FactId, KeyLookup, Relation, Signer, Triplet};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::error::{ConsensusError, Result};
use crate::round::Round;
use crate::threshold::{evaluate, settle_on_timeout, Outcome, QuorumConfig};
use crate::vote::{SignedVote, Verdict};

/// A resolved round. The round's state is gone once this is returned.
#[derive(Debug, Clone)]
pub struct Decision {
    /// The fact under review; `consensus` is set when accepted.
    pub fact: Triplet,
    pub outcome: Outcome,
    pub positive: usize,
    pub total: usize,
}

impl Decision {
    pub fn is_accepted(&self) -> bool {
        self.outcome.is_accepted()
    }
}

/// Snapshot of an open round.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RoundStatus {
    pub positive: usize,
    pub total: usize,
    pub deadline: Instant,
}

/// Counters kept across rounds.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConsensusStats {
    pub requested: u64,
    pub accepted: u64,
    pub accepted_partial: u64,
    pub rejected: u64,
    pub rejected_partial: u64,
    pub timeouts: u64,
    pub votes_recorded: u64,
    pub votes_refused: u64,
}

impl ConsensusStats {
    fn count(&mut self, outcome: Outcome) {
        match outcome {
            Outcome::Accepted => self.accepted += 1,
            Outcome::AcceptedPartial => self.accepted_partial += 1,
            Outcome::Rejected => self.rejected += 1,
            Outcome::RejectedPartial => self.rejected_partial += 1,
            Outcome::Timeout => self.timeouts += 1,
        }
    }
}

/// Quorum voting over validated `committed` facts.
#[derive(Debug)]
pub struct ConsensusManager {
    config: QuorumConfig,
    pending: HashMap<FactId, Round>,
    stats: ConsensusStats,
}

impl ConsensusManager {
    pub fn new(config: QuorumConfig) -> Self {
        Self {
            config,
            pending: HashMap::new(),
            stats: ConsensusStats::default(),
        }
    }

    pub fn config(&self) -> &QuorumConfig {
        &self.config
    }

    pub fn stats(&self) -> ConsensusStats {
        self.stats
    }

    /// Open a round for `fact`. Returns the round deadline; the caller owns
    /// the timer and broadcasts the vote request.
    pub fn request_consensus(&mut self, fact: Triplet, now: Instant) -> Result<Instant> {
        if fact.relation != Relation::Committed || !fact.validated {
            return Err(ConsensusError::NotCommitted(fact.id));
        }
        if self.pending.contains_key(&fact.id) {
            return Err(ConsensusError::AlreadyPending(fact.id));
        }
        let deadline = now + self.config.timeout;
        debug!(fact_id = %fact.id, timeout_ms = self.config.timeout.as_millis() as u64, "consensus requested");
        self.pending
            .insert(fact.id.clone(), Round::new(fact, now, deadline));
        self.stats.requested += 1;
        Ok(deadline)
    }

    /// Record a signed vote and decide the round if the quorum allows.
    ///
    /// `Ok(None)` means the vote counted and the round is still open.
    pub fn handle_vote(
        &mut self,
        vote: &SignedVote,
        keys: &dyn KeyLookup,
    ) -> Result<Option<Decision>> {
        let Some(round) = self.pending.get_mut(&vote.fact_id) else {
            return Err(ConsensusError::UnknownRound(vote.fact_id.clone()));
        };
        let Some(key) = keys.public_key(&vote.voter_id) else {
            self.stats.votes_refused += 1;
            return Err(ConsensusError::UnknownVoter(vote.voter_id.clone()));
        };
        if !vote.verify(&key) {
            self.stats.votes_refused += 1;
            warn!(fact_id = %vote.fact_id, voter = %vote.voter_id, "vote signature rejected");
            return Err(ConsensusError::InvalidVoteSignature {
                voter: vote.voter_id.clone(),
            });
        }

        round.record(vote.voter_id.clone(), vote.vote.valid);
        self.stats.votes_recorded += 1;
        let (positive, total) = (round.positive(), round.total());
        debug!(
            fact_id = %vote.fact_id,
            voter = %vote.voter_id,
            valid = vote.vote.valid,
            positive,
            total,
            "vote recorded"
        );

        Ok(evaluate(positive, total, &self.config)
            .and_then(|outcome| self.resolve(&vote.fact_id, outcome)))
    }

    /// Force-resolve a round whose timer fired.
    pub fn resolve_timeout(&mut self, fact_id: &FactId) -> Result<Decision> {
        let round = self
            .pending
            .get(fact_id)
            .ok_or_else(|| ConsensusError::UnknownRound(fact_id.clone()))?;
        let outcome = settle_on_timeout(round.positive(), round.total());
        self.resolve(fact_id, outcome)
            .ok_or_else(|| ConsensusError::UnknownRound(fact_id.clone()))
    }

    /// Resolve every round whose deadline has passed.
    pub fn poll_timeouts(&mut self, now: Instant) -> Vec<Decision> {
        let overdue: Vec<FactId> = self
            .pending
            .iter()
            .filter(|(_, round)| round.is_overdue(now))
            .map(|(id, _)| id.clone())
            .collect();
        overdue
            .iter()
            .filter_map(|id| self.resolve_timeout(id).ok())
            .collect()
    }

    fn resolve(&mut self, fact_id: &FactId, outcome: Outcome) -> Option<Decision> {
        let round = self.pending.remove(fact_id)?;
        let (positive, total) = (round.positive(), round.total());
        let mut fact = round.fact;
        if outcome.is_accepted() {
            fact.consensus = true;
        }
        self.stats.count(outcome);
        info!(fact_id = %fact_id, %outcome, positive, total, "consensus resolved");
        Some(Decision {
            fact,
            outcome,
            positive,
            total,
        })
    }

    pub fn is_pending(&self, fact_id: &FactId) -> bool {
        self.pending.contains_key(fact_id)
    }

    pub fn status(&self, fact_id: &FactId) -> Option<RoundStatus> {
        self.pending.get(fact_id).map(|round| RoundStatus {
            positive: round.positive(),
            total: round.total(),
            deadline: round.deadline,
        })
    }

    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }
}

/// Produce this peer's signed vote on a fact it was asked to review.
pub fn cast_vote(
    fact_id: FactId,
    verdict: Verdict,
    signer: &dyn Signer,
) -> Result<SignedVote> {
    SignedVote::sign(fact_id, verdict, signer)
}

#[cfg(test)]
mod tests {
    use super::*;
    use agora_fact::{Context, FactFactory, Keypair, Keyring, PeerId};
    use serde_json::json;
    use std::time::Duration;

    struct Voters {
        keys: Vec<Keypair>,
        ring: Keyring,
    }

    fn voters(n: u8) -> Voters {
        let keys: Vec<Keypair> = (0..n).map(|i| Keypair::from_seed([i + 10; 32])).collect();
        let mut ring = Keyring::new();
        for key in &keys {
            ring.register(key.public_key());
        }
        Voters { keys, ring }
    }

    fn committed() -> Triplet {
        let mut fact = FactFactory::new(PeerId::from("b3b3/requester"))
            .committed(
                vec!["alice".into(), "bob".into()],
                json!("24 bottles"),
                u64::MAX,
                &[],
                Context::new(),
            )
            .unwrap();
        fact.validated = true;
        fact
    }

    fn vote(fact: &Triplet, voter: &Keypair, valid: bool) -> SignedVote {
        let verdict = if valid {
            Verdict::accept()
        } else {
            Verdict::reject("no")
        };
        cast_vote(fact.id.clone(), verdict, voter).unwrap()
    }

    #[test]
    fn unanimous_yes_accepts_and_sets_flag() {
        let v = voters(3);
        let mut manager = ConsensusManager::new(QuorumConfig::default());
        let fact = committed();
        manager.request_consensus(fact.clone(), Instant::now()).unwrap();

        assert!(manager.handle_vote(&vote(&fact, &v.keys[0], true), &v.ring).unwrap().is_none());
        assert!(manager.handle_vote(&vote(&fact, &v.keys[1], true), &v.ring).unwrap().is_none());
        let decision = manager
            .handle_vote(&vote(&fact, &v.keys[2], true), &v.ring)
            .unwrap()
            .expect("three of three decides");

        assert_eq!(decision.outcome, Outcome::Accepted);
        assert!(decision.fact.consensus);
        assert!(!manager.is_pending(&fact.id));
        assert_eq!(manager.stats().accepted, 1);
    }

    #[test]
    fn unanimous_no_rejects() {
        let v = voters(3);
        let mut manager = ConsensusManager::new(QuorumConfig::default());
        let fact = committed();
        manager.request_consensus(fact.clone(), Instant::now()).unwrap();

        let mut last = None;
        for key in &v.keys {
            last = manager.handle_vote(&vote(&fact, key, false), &v.ring).unwrap();
        }
        let decision = last.expect("decided");
        assert_eq!(decision.outcome, Outcome::Rejected);
        assert!(!decision.fact.consensus);
    }

    #[test]
    fn split_stays_pending_then_settles_partial() {
        let v = voters(3);
        let mut manager = ConsensusManager::new(QuorumConfig::default());
        let fact = committed();
        let now = Instant::now();
        let deadline = manager.request_consensus(fact.clone(), now).unwrap();

        manager.handle_vote(&vote(&fact, &v.keys[0], true), &v.ring).unwrap();
        manager.handle_vote(&vote(&fact, &v.keys[1], true), &v.ring).unwrap();
        let open = manager.handle_vote(&vote(&fact, &v.keys[2], false), &v.ring).unwrap();
        assert!(open.is_none());
        assert_eq!(
            manager.status(&fact.id).map(|s| (s.positive, s.total)),
            Some((2, 3))
        );

        assert!(manager.poll_timeouts(now).is_empty());
        let decisions = manager.poll_timeouts(deadline);
        assert_eq!(decisions.len(), 1);
        assert_eq!(decisions[0].outcome, Outcome::AcceptedPartial);
        assert!(decisions[0].fact.consensus);
    }

    #[test]
    fn no_votes_times_out() {
        let mut manager = ConsensusManager::new(QuorumConfig::default());
        let fact = committed();
        manager.request_consensus(fact.clone(), Instant::now()).unwrap();
        let decision = manager.resolve_timeout(&fact.id).unwrap();
        assert_eq!(decision.outcome, Outcome::Timeout);
        assert_eq!(manager.stats().timeouts, 1);
        assert!(matches!(
            manager.resolve_timeout(&fact.id),
            Err(ConsensusError::UnknownRound(_))
        ));
    }

    #[test]
    fn revote_replaces_previous() {
        let v = voters(3);
        let mut manager = ConsensusManager::new(QuorumConfig::default());
        let fact = committed();
        manager.request_consensus(fact.clone(), Instant::now()).unwrap();

        manager.handle_vote(&vote(&fact, &v.keys[0], false), &v.ring).unwrap();
        manager.handle_vote(&vote(&fact, &v.keys[0], true), &v.ring).unwrap();
        assert_eq!(
            manager.status(&fact.id).map(|s| (s.positive, s.total)),
            Some((1, 1))
        );
    }

    #[test]
    fn forged_and_unknown_votes_refused() {
        let v = voters(2);
        let mut manager = ConsensusManager::new(QuorumConfig::default());
        let fact = committed();
        manager.request_consensus(fact.clone(), Instant::now()).unwrap();

        let stranger = Keypair::from_seed([99; 32]);
        assert!(matches!(
            manager.handle_vote(&vote(&fact, &stranger, true), &v.ring),
            Err(ConsensusError::UnknownVoter(_))
        ));

        let mut forged = vote(&fact, &stranger, true);
        forged.voter_id = v.keys[0].peer_id().clone();
        assert!(matches!(
            manager.handle_vote(&forged, &v.ring),
            Err(ConsensusError::InvalidVoteSignature { .. })
        ));
        assert_eq!(manager.stats().votes_refused, 2);
        assert_eq!(manager.status(&fact.id).map(|s| s.total), Some(0));
    }

    #[test]
    fn only_validated_committed_facts() {
        let mut manager = ConsensusManager::new(QuorumConfig::default());
        let mut has = FactFactory::new(PeerId::from("p"))
            .has("a", "water", Context::new())
            .unwrap();
        has.validated = true;
        assert!(matches!(
            manager.request_consensus(has, Instant::now()),
            Err(ConsensusError::NotCommitted(_))
        ));

        let mut fact = committed();
        fact.validated = false;
        assert!(manager.request_consensus(fact, Instant::now()).is_err());
    }

    #[test]
    fn duplicate_request_refused() {
        let mut manager = ConsensusManager::new(
            QuorumConfig::default().with_timeout(Duration::from_millis(10)),
        );
        let fact = committed();
        manager.request_consensus(fact.clone(), Instant::now()).unwrap();
        assert!(matches!(
            manager.request_consensus(fact, Instant::now()),
            Err(ConsensusError::AlreadyPending(_))
        ));
        assert_eq!(manager.pending_count(), 1);
    }

    #[test]
    fn vote_for_unknown_round() {
        let v = voters(1);
        let mut manager = ConsensusManager::new(QuorumConfig::default());
        let fact = committed();
        assert!(matches!(
            manager.handle_vote(&vote(&fact, &v.keys[0], true), &v.ring),
            Err(ConsensusError::UnknownRound(_))
        ));
    }
}
