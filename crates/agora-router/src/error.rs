use agora_fact::PeerId;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, RoutingError>;

/// Routing failures. None of these are retried by the router itself.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum RoutingError {
    #[error("no path to {destination} within {max_hops} hops")]
    NoRoute { destination: PeerId, max_hops: usize },

    #[error("hop budget exhausted before reaching {destination}")]
    HopBudgetExhausted { destination: PeerId },

    #[error("this node ({local}) is not the current hop of the route")]
    NotOnPath { local: PeerId },

    #[error("next hop {next_hop} is not connected")]
    Unreachable { next_hop: PeerId },

    #[error("cannot route a message to ourselves")]
    Loopback,
}
