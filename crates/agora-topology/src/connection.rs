use agora_fact::PeerId;
use serde::{Deserialize, Serialize};

use crate::cluster::ClusterId;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ConnectionKind {
    /// Member to its cluster center.
    Cluster,
    /// Center to center, between clusters.
    InterCluster,
    /// Peer to peer, outside the cluster structure.
    Direct,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", tag = "type", content = "id")]
pub enum Endpoint {
    Peer(PeerId),
    Cluster(ClusterId),
}

/// An edge in the topology.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Connection {
    pub kind: ConnectionKind,
    pub a: Endpoint,
    pub b: Endpoint,
    /// Routing cost; higher is busier.
    pub weight: f64,
}

/// Unordered pair, stored smaller-first so `(a, b)` and `(b, a)` collide.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub(crate) struct LinkKey(ClusterId, ClusterId);

impl LinkKey {
    pub(crate) fn new(a: ClusterId, b: ClusterId) -> Self {
        if a <= b {
            Self(a, b)
        } else {
            Self(b, a)
        }
    }

    pub(crate) fn ends(&self) -> (ClusterId, ClusterId) {
        (self.0, self.1)
    }

    pub(crate) fn touches(&self, id: ClusterId) -> bool {
        self.0 == id || self.1 == id
    }

    pub(crate) fn other(&self, id: ClusterId) -> ClusterId {
        if self.0 == id {
            self.1
        } else {
            self.0
        }
    }
}

/// Unordered peer pair for direct links.
pub(crate) fn peer_pair(a: PeerId, b: PeerId) -> (PeerId, PeerId) {
    if a <= b {
        (a, b)
    } else {
        (b, a)
    }
}
