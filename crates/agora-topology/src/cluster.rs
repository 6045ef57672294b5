use std::collections::BTreeSet;

use agora_fact::PeerId;
use serde::{Deserialize, Serialize};

/// Cluster identifier, unique within one node's view.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ClusterId(pub u64);

impl std::fmt::Display for ClusterId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "cluster-{}", self.0)
    }
}

/// A group of peers organised around a center peer.
///
/// The center is the cluster's representative on inter-cluster connections.
/// It is the founding peer until that peer leaves, then the smallest
/// remaining member id.
#[derive(Debug, Clone)]
pub struct Cluster {
    pub id: ClusterId,
    members: BTreeSet<PeerId>,
    center: PeerId,
    /// Messages attributed to this cluster in the current window.
    traffic: u64,
}

impl Cluster {
    pub fn new(id: ClusterId, founder: PeerId) -> Self {
        let mut members = BTreeSet::new();
        members.insert(founder.clone());
        Self {
            id,
            members,
            center: founder,
            traffic: 0,
        }
    }

    pub fn center(&self) -> &PeerId {
        &self.center
    }

    pub fn members(&self) -> impl Iterator<Item = &PeerId> {
        self.members.iter()
    }

    pub fn contains(&self, peer: &PeerId) -> bool {
        self.members.contains(peer)
    }

    pub fn len(&self) -> usize {
        self.members.len()
    }

    pub fn is_empty(&self) -> bool {
        self.members.is_empty()
    }

    pub fn traffic(&self) -> u64 {
        self.traffic
    }

    pub(crate) fn insert(&mut self, peer: PeerId) -> bool {
        self.members.insert(peer)
    }

    pub(crate) fn remove(&mut self, peer: &PeerId) -> bool {
        let removed = self.members.remove(peer);
        if removed && self.center == *peer {
            if let Some(next) = self.members.first() {
                self.center = next.clone();
            }
        }
        removed
    }

    pub(crate) fn drain_members(&mut self) -> Vec<PeerId> {
        std::mem::take(&mut self.members).into_iter().collect()
    }

    pub(crate) fn record_traffic(&mut self, messages: u64) {
        self.traffic = self.traffic.saturating_add(messages);
    }

    pub(crate) fn reset_traffic(&mut self) {
        self.traffic = 0;
    }

    /// Members relative to the base cluster size.
    pub fn peer_fill(&self, base_size: usize) -> f64 {
        self.members.len() as f64 / base_size.max(1) as f64
    }

    /// Window traffic relative to what the cluster's inter-cluster
    /// connections carry. An isolated cluster counts as one connection.
    pub fn connection_fill(&self, connections: usize, capacity: u64) -> f64 {
        let carried = connections.max(1) as f64 * capacity.max(1) as f64;
        self.traffic as f64 / carried
    }

    /// `max(peer fill, connection fill)`.
    pub fn load(&self, connections: usize, base_size: usize, capacity: u64) -> f64 {
        self.peer_fill(base_size)
            .max(self.connection_fill(connections, capacity))
    }
}

/// What a node advertises about one cluster in `topology:update`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClusterSummary {
    pub id: ClusterId,
    pub member_count: usize,
    pub load: f64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn center_moves_when_founder_leaves() {
        let mut cluster = Cluster::new(ClusterId(1), PeerId::from("m"));
        cluster.insert(PeerId::from("b"));
        cluster.insert(PeerId::from("z"));
        assert_eq!(cluster.center().as_str(), "m");

        assert!(cluster.remove(&PeerId::from("m")));
        assert_eq!(cluster.center().as_str(), "b");
        assert!(!cluster.remove(&PeerId::from("m")));
        assert_eq!(cluster.len(), 2);
    }

    #[test]
    fn load_is_max_of_fills() {
        let mut cluster = Cluster::new(ClusterId(1), PeerId::from("a"));
        cluster.insert(PeerId::from("b"));
        // 2 of 8 members
        assert!((cluster.load(1, 8, 10) - 0.25).abs() < f64::EPSILON);

        cluster.record_traffic(15);
        // 15 messages over 2 connections of 10
        assert!((cluster.load(2, 8, 10) - 0.75).abs() < f64::EPSILON);
        // isolated cluster counts as one connection
        assert!((cluster.connection_fill(0, 10) - 1.5).abs() < f64::EPSILON);

        cluster.reset_traffic();
        assert_eq!(cluster.traffic(), 0);
    }
}
