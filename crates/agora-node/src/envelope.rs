//! Wire envelope and payloads.
//!
//! Every message between peers is one JSON object:
//!
//! ```text
//! {id, topic, data, sender, timestamp, open_n?, route?}
//! ```
//!
//! `open_n` is the Jitterbug port-expansion budget; a missing field reads as
//! `open_0`. `route` is present only on `route:forward` messages.

use std::collections::BTreeMap;

use agora_fact::{now_millis, PeerId};
use agora_router::RouteHeader;
use agora_topology::ClusterSummary;
use rand::RngCore;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::Result;

/// Protocol topics.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Topic {
    /// A fact of any relation published by its creator.
    #[serde(rename = "protocol:triplet")]
    Triplet,
    /// A `needs` fact published by its creator.
    #[serde(rename = "protocol:need")]
    Need,
    /// A `has` fact published by its creator.
    #[serde(rename = "protocol:has")]
    Has,
    /// Facts relayed on behalf of their creators.
    #[serde(rename = "overlay:sync")]
    OverlaySync,
    /// Cluster summaries and link states.
    #[serde(rename = "topology:update")]
    TopologyUpdate,
    /// A source-routed message.
    #[serde(rename = "route:forward")]
    RouteForward,
    /// Vote request for a committed fact.
    #[serde(rename = "consensus:request")]
    ConsensusRequest,
    /// A signed vote.
    #[serde(rename = "consensus:vote")]
    ConsensusVote,
}

impl Topic {
    pub const fn as_str(&self) -> &'static str {
        match self {
            Topic::Triplet => "protocol:triplet",
            Topic::Need => "protocol:need",
            Topic::Has => "protocol:has",
            Topic::OverlaySync => "overlay:sync",
            Topic::TopologyUpdate => "topology:update",
            Topic::RouteForward => "route:forward",
            Topic::ConsensusRequest => "consensus:request",
            Topic::ConsensusVote => "consensus:vote",
        }
    }

    /// Topics that carry a single fact published by its creator.
    pub const fn is_fact(&self) -> bool {
        matches!(self, Topic::Triplet | Topic::Need | Topic::Has)
    }
}

impl std::fmt::Display for Topic {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    pub id: String,
    pub topic: Topic,
    pub data: Value,
    pub sender: PeerId,
    pub timestamp: u64,
    #[serde(default)]
    pub open_n: u8,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub route: Option<RouteHeader>,
}

impl Envelope {
    pub fn new(topic: Topic, data: Value, sender: PeerId) -> Self {
        Self {
            id: message_id(),
            topic,
            data,
            sender,
            timestamp: now_millis(),
            open_n: 0,
            route: None,
        }
    }

    #[must_use]
    pub fn with_open_n(mut self, open_n: u8) -> Self {
        self.open_n = open_n;
        self
    }

    #[must_use]
    pub fn with_route(mut self, route: RouteHeader) -> Self {
        self.route = Some(route);
        self
    }

    pub fn encode(&self) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }

    pub fn decode(bytes: &[u8]) -> Result<Self> {
        Ok(serde_json::from_slice(bytes)?)
    }
}

fn message_id() -> String {
    let mut bytes = [0u8; 12];
    rand::thread_rng().fill_bytes(&mut bytes);
    format!("msg-{}", hex::encode(bytes))
}

/// One peer's view of its own transport links. `seq` grows with every
/// reissue; receivers keep only the highest they have seen.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LinkState {
    pub peer: PeerId,
    pub seq: u64,
    pub neighbors: Vec<PeerId>,
}

/// `topology:update` payload: the sender's clusters plus every link state
/// it knows, its own first.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TopologyUpdate {
    pub clusters: Vec<ClusterSummary>,
    #[serde(default)]
    pub links: Vec<LinkState>,
}

/// `overlay:sync` payload. Facts stay raw so one bad entry cannot poison
/// the batch. `keys` carries creator public keys (hex); peer ids are
/// self-certifying so receivers can check them.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SyncBatch {
    pub facts: Vec<Value>,
    #[serde(default)]
    pub keys: BTreeMap<PeerId, String>,
}

/// Inner payload of a `route:forward` message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Routed {
    pub topic: Topic,
    pub data: Value,
    /// Origin public key (hex), for receivers with no link to the origin.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub origin_key: Option<String>,
}
