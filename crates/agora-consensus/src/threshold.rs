//! Quorum evaluation.
//!
//! Given `p` positive votes out of `n`:
//!
//! ```text
//! n < min_validators          → pending
//! p / n ≥ threshold           → accept
//! p / n ≤ 1 − threshold       → reject
//! otherwise                   → pending (until timeout)
//! ```
//!
//! Both comparisons are inclusive, and acceptance is checked first. With the
//! default threshold of 0.67 a 2-of-3 split (0.666…) stays pending: it is
//! neither a supermajority for nor against.
//!
//! At timeout the round settles on simple majority: strictly more than half
//! positive is a partial acceptance, anything else a partial rejection, and
//! zero votes is a timeout.

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Default supermajority fraction.
pub const DEFAULT_THRESHOLD: f64 = 0.67;

/// Default minimum number of votes before any decision.
pub const DEFAULT_MIN_VALIDATORS: usize = 3;

/// Default round timeout.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);

/// Quorum parameters.
#[derive(Debug, Clone)]
pub struct QuorumConfig {
    pub min_validators: usize,
    pub threshold: f64,
    pub timeout: Duration,
}

impl Default for QuorumConfig {
    fn default() -> Self {
        Self {
            min_validators: DEFAULT_MIN_VALIDATORS,
            threshold: DEFAULT_THRESHOLD,
            timeout: DEFAULT_TIMEOUT,
        }
    }
}

impl QuorumConfig {
    #[must_use]
    pub fn with_min_validators(mut self, min: usize) -> Self {
        self.min_validators = min;
        self
    }

    #[must_use]
    pub fn with_threshold(mut self, threshold: f64) -> Self {
        self.threshold = threshold;
        self
    }

    #[must_use]
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }
}

/// Terminal outcome of a round.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Outcome {
    Accepted,
    AcceptedPartial,
    Rejected,
    RejectedPartial,
    Timeout,
}

impl Outcome {
    pub fn is_accepted(&self) -> bool {
        matches!(self, Outcome::Accepted | Outcome::AcceptedPartial)
    }
}

impl std::fmt::Display for Outcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Outcome::Accepted => "accepted",
            Outcome::AcceptedPartial => "accepted_partial",
            Outcome::Rejected => "rejected",
            Outcome::RejectedPartial => "rejected_partial",
            Outcome::Timeout => "timeout",
        };
        f.write_str(name)
    }
}

/// Fraction of positive votes. Zero when there are no votes.
pub fn agreement(positive: usize, total: usize) -> f64 {
    if total == 0 {
        0.0
    } else {
        positive as f64 / total as f64
    }
}

/// Decide a round while it is still open. `None` means keep waiting.
pub fn evaluate(positive: usize, total: usize, config: &QuorumConfig) -> Option<Outcome> {
    if total == 0 || total < config.min_validators {
        return None;
    }
    let agreement = agreement(positive, total);
    if agreement >= config.threshold {
        Some(Outcome::Accepted)
    } else if agreement <= 1.0 - config.threshold {
        Some(Outcome::Rejected)
    } else {
        None
    }
}

/// Force a decision when the round's timer fires.
pub const fn settle_on_timeout(positive: usize, total: usize) -> Outcome {
    if total == 0 {
        Outcome::Timeout
    } else if positive * 2 > total {
        Outcome::AcceptedPartial
    } else {
        Outcome::RejectedPartial
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn default() -> QuorumConfig {
        QuorumConfig::default()
    }

    #[test]
    fn below_min_validators_is_pending() {
        assert_eq!(evaluate(0, 0, &default()), None);
        assert_eq!(evaluate(2, 2, &default()), None);
        assert_eq!(evaluate(0, 2, &default()), None);
    }

    #[test]
    fn two_of_three_is_pending() {
        // 0.666… < 0.67 and > 0.33
        assert_eq!(evaluate(2, 3, &default()), None);
        assert_eq!(evaluate(1, 3, &default()), None);
    }

    #[test]
    fn unanimous_decides() {
        assert_eq!(evaluate(3, 3, &default()), Some(Outcome::Accepted));
        assert_eq!(evaluate(0, 3, &default()), Some(Outcome::Rejected));
    }

    #[test]
    fn boundary_is_inclusive() {
        let config = default().with_threshold(0.6);
        assert_eq!(evaluate(3, 5, &config), Some(Outcome::Accepted));
        assert_eq!(evaluate(2, 5, &config), Some(Outcome::Rejected));

        let config = default().with_threshold(0.75);
        assert_eq!(evaluate(3, 4, &config), Some(Outcome::Accepted));
        assert_eq!(evaluate(1, 4, &config), Some(Outcome::Rejected));
        assert_eq!(evaluate(2, 4, &config), None);
    }

    #[test]
    fn three_of_four_at_default() {
        assert_eq!(evaluate(3, 4, &default()), Some(Outcome::Accepted));
        assert_eq!(evaluate(2, 4, &default()), None);
    }

    #[test]
    fn timeout_settlement() {
        assert_eq!(settle_on_timeout(0, 0), Outcome::Timeout);
        assert_eq!(settle_on_timeout(2, 3), Outcome::AcceptedPartial);
        assert_eq!(settle_on_timeout(1, 2), Outcome::RejectedPartial);
        assert_eq!(settle_on_timeout(0, 1), Outcome::RejectedPartial);
        assert_eq!(settle_on_timeout(1, 1), Outcome::AcceptedPartial);
    }

    proptest! {
        #[test]
        fn decisions_respect_thresholds(total in 0usize..50, positive_frac in 0.0f64..=1.0) {
            let positive = ((total as f64) * positive_frac).floor() as usize;
            let config = default();
            match evaluate(positive, total, &config) {
                Some(Outcome::Accepted) => {
                    prop_assert!(total >= config.min_validators);
                    prop_assert!(agreement(positive, total) >= config.threshold);
                }
                Some(Outcome::Rejected) => {
                    prop_assert!(total >= config.min_validators);
                    prop_assert!(agreement(positive, total) <= 1.0 - config.threshold);
                }
                Some(other) => prop_assert!(false, "open rounds never settle as {other}"),
                None => {}
            }
        }
    }
}
