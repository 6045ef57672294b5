//! Agora Quorum Consensus
//!
//! Multi-party (`committed`) facts are accepted only once enough peers vouch
//! for them. A round opens when a node requests consensus, collects one
//! signed vote per peer (a later vote replaces an earlier one), and resolves
//! as soon as the quorum rule decides, or when its timer fires.
//!
//! ```text
//! pending ──┬── accepted
//!           ├── rejected
//!           └── (timeout) ── accepted_partial | rejected_partial | timeout
//! ```
//!
//! Every resolution is terminal: the round is discarded and only the
//! statistics counters remember it.
//!
//! The manager does not own a clock or a network. Callers pass the current
//! [`std::time::Instant`], schedule the returned deadline, and broadcast
//! vote requests themselves.

mod error;
mod manager;
mod round;
mod threshold;
mod vote;

pub use error::{ConsensusError, Result};
pub use manager::{cast_vote, ConsensusManager, ConsensusStats, Decision, RoundStatus};
pub use round::Round;
pub use threshold::{
    agreement, evaluate, settle_on_timeout, Outcome, QuorumConfig, DEFAULT_MIN_VALIDATORS,
    DEFAULT_THRESHOLD, DEFAULT_TIMEOUT,
};
pub use vote::{SignedVote, Verdict};
