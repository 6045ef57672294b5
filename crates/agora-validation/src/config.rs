//! Validation configuration.

use std::time::Duration;

/// Tolerances applied by the context stage and peer policy.
#[derive(Debug, Clone)]
pub struct ValidationConfig {
    /// How far ahead of local time a fact timestamp may be.
    pub max_future_skew: Duration,

    /// Maximum age of a fact at validation time.
    pub max_age: Duration,

    /// Reject unsigned facts arriving from other peers.
    pub require_peer_signature: bool,
}

impl Default for ValidationConfig {
    fn default() -> Self {
        Self {
            max_future_skew: Duration::from_secs(5 * 60),
            max_age: Duration::from_secs(30 * 24 * 60 * 60),
            require_peer_signature: true,
        }
    }
}

impl ValidationConfig {
    #[must_use]
    pub fn with_max_future_skew(mut self, skew: Duration) -> Self {
        self.max_future_skew = skew;
        self
    }

    #[must_use]
    pub fn with_max_age(mut self, age: Duration) -> Self {
        self.max_age = age;
        self
    }

    /// Accept unsigned peer facts (testing and closed deployments).
    #[must_use]
    pub fn allow_unsigned_peers(mut self) -> Self {
        self.require_peer_signature = false;
        self
    }

    pub(crate) fn skew_ms(&self) -> u64 {
        self.max_future_skew.as_millis() as u64
    }

    pub(crate) fn max_age_ms(&self) -> u64 {
        self.max_age.as_millis() as u64
    }
}
