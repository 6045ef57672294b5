//! Jitterbug topology: clusters of peers joined by inter-cluster
//! connections, densified under load and thinned out when idle.
//!
//! ```text
//!            load > expansion_threshold
//! Contracted ──────────► Transitioning ──────────► Expanded
//!     ▲                                               │
//!     └────────── Transitioning ◄─────────────────────┘
//!            load < contraction_threshold
//! ```
//!
//! `Transitioning` only exists inside one [`Topology::adapt`] call. It is
//! recorded in the state history so observers can see that every change went
//! through it, but the topology never rests there.

use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet, VecDeque};

use agora_fact::PeerId;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::cluster::{Cluster, ClusterId, ClusterSummary};
use crate::config::TopologyConfig;
use crate::connection::{peer_pair, Connection, ConnectionKind, Endpoint, LinkKey};
use crate::error::{Result, TopologyError};

const IDLE_WEIGHT: f64 = 0.4;
const REMAINING_WEIGHT: f64 = 0.4;
const PROXIMITY_WEIGHT: f64 = 0.2;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TopologyState {
    Contracted,
    Transitioning,
    Expanded,
}

impl std::fmt::Display for TopologyState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            TopologyState::Contracted => "contracted",
            TopologyState::Transitioning => "transitioning",
            TopologyState::Expanded => "expanded",
        };
        f.write_str(name)
    }
}

/// Result of one adaptation cycle.
#[derive(Debug, Clone, PartialEq)]
pub struct Adaptation {
    /// Mean cluster load the decision was based on.
    pub load: f64,
    pub from: TopologyState,
    pub to: TopologyState,
    pub added: usize,
    pub removed: usize,
}

impl Adaptation {
    pub fn transitioned(&self) -> bool {
        self.from != self.to
    }
}

/// What happened to a departing peer's cluster.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Departure {
    pub cluster: ClusterId,
    /// Set when the remaining member was folded into a neighbor.
    pub merged_into: Option<ClusterId>,
    /// The cluster no longer exists.
    pub dissolved: bool,
}

/// Cluster graph of one node's view of the mesh.
#[derive(Debug)]
pub struct Topology {
    config: TopologyConfig,
    state: TopologyState,
    clusters: BTreeMap<ClusterId, Cluster>,
    membership: HashMap<PeerId, ClusterId>,
    links: BTreeSet<LinkKey>,
    direct: BTreeSet<(PeerId, PeerId)>,
    next_cluster: u64,
    history: VecDeque<TopologyState>,
}

impl Topology {
    pub fn new(config: TopologyConfig) -> Self {
        let mut history = VecDeque::new();
        history.push_back(TopologyState::Contracted);
        Self {
            config,
            state: TopologyState::Contracted,
            clusters: BTreeMap::new(),
            membership: HashMap::new(),
            links: BTreeSet::new(),
            direct: BTreeSet::new(),
            next_cluster: 0,
            history,
        }
    }

    pub fn config(&self) -> &TopologyConfig {
        &self.config
    }

    pub fn state(&self) -> TopologyState {
        self.state
    }

    /// Recent states, oldest first.
    pub fn history(&self) -> impl Iterator<Item = TopologyState> + '_ {
        self.history.iter().copied()
    }

    pub fn cluster(&self, id: ClusterId) -> Option<&Cluster> {
        self.clusters.get(&id)
    }

    pub fn clusters(&self) -> impl Iterator<Item = &Cluster> {
        self.clusters.values()
    }

    pub fn cluster_count(&self) -> usize {
        self.clusters.len()
    }

    pub fn cluster_of(&self, peer: &PeerId) -> Option<ClusterId> {
        self.membership.get(peer).copied()
    }

    pub fn contains_peer(&self, peer: &PeerId) -> bool {
        self.membership.contains_key(peer)
    }

    pub fn peer_count(&self) -> usize {
        self.membership.len()
    }

    pub fn peers(&self) -> impl Iterator<Item = &PeerId> {
        self.membership.keys()
    }

    /// Inter-cluster connections of a cluster.
    pub fn connection_count(&self, id: ClusterId) -> usize {
        self.links.iter().filter(|link| link.touches(id)).count()
    }

    pub fn link_count(&self) -> usize {
        self.links.len()
    }

    /// Clusters directly connected to `id`.
    pub fn neighbors(&self, id: ClusterId) -> Vec<ClusterId> {
        self.links
            .iter()
            .filter(|link| link.touches(id))
            .map(|link| link.other(id))
            .collect()
    }

    pub fn is_linked(&self, a: ClusterId, b: ClusterId) -> bool {
        self.links.contains(&LinkKey::new(a, b))
    }

    pub fn cluster_load(&self, id: ClusterId) -> Option<f64> {
        self.clusters.get(&id).map(|cluster| self.load_of(cluster))
    }

    /// Load of the cluster a peer belongs to.
    pub fn peer_load(&self, peer: &PeerId) -> Option<f64> {
        self.cluster_of(peer).and_then(|id| self.cluster_load(id))
    }

    /// Mean per-cluster load; zero for an empty topology.
    pub fn network_load(&self) -> f64 {
        if self.clusters.is_empty() {
            return 0.0;
        }
        let total: f64 = self.clusters.values().map(|c| self.load_of(c)).sum();
        total / self.clusters.len() as f64
    }

    fn load_of(&self, cluster: &Cluster) -> f64 {
        cluster.load(
            self.connection_count(cluster.id),
            self.config.base_cluster_size,
            self.config.connection_capacity,
        )
    }

    fn has_room(&self, id: ClusterId) -> bool {
        self.connection_count(id) < self.config.max_connections
    }

    fn link(&mut self, a: ClusterId, b: ClusterId) -> bool {
        if a == b || !self.has_room(a) || !self.has_room(b) {
            return false;
        }
        self.links.insert(LinkKey::new(a, b))
    }

    fn set_state(&mut self, state: TopologyState) {
        self.state = state;
        self.history.push_back(state);
        while self.history.len() > self.config.history_len.max(3) {
            self.history.pop_front();
        }
    }

    /// Place a newly connected peer.
    ///
    /// `known` lists peers the newcomer already talks to; clusters holding
    /// them score higher on proximity. When every cluster is full the peer
    /// founds its own cluster.
    pub fn integrate_peer(&mut self, peer: PeerId, known: &[PeerId]) -> Result<ClusterId> {
        if self.membership.contains_key(&peer) {
            return Err(TopologyError::AlreadyIntegrated(peer));
        }
        let known: HashSet<&PeerId> = known.iter().collect();
        let best = self
            .clusters
            .values()
            .filter(|c| c.len() < self.config.base_cluster_size)
            .map(|c| (self.integration_score(c, &known), c.id))
            .max_by(|a, b| a.0.total_cmp(&b.0).then(b.1.cmp(&a.1)))
            .map(|(_, id)| id);

        let Some(id) = best else {
            return Ok(self.found_cluster(peer));
        };
        if let Some(cluster) = self.clusters.get_mut(&id) {
            cluster.insert(peer.clone());
        }
        debug!(peer = %peer, cluster = %id, "peer joined cluster");
        self.membership.insert(peer, id);
        Ok(id)
    }

    fn integration_score(&self, cluster: &Cluster, known: &HashSet<&PeerId>) -> f64 {
        let base = self.config.base_cluster_size.max(1) as f64;
        let idle = (1.0 - self.load_of(cluster)).clamp(0.0, 1.0);
        let remaining = (base - cluster.len() as f64).max(0.0) / base;
        let proximity = if known.is_empty() {
            0.0
        } else {
            cluster.members().filter(|m| known.contains(m)).count() as f64 / known.len() as f64
        };
        IDLE_WEIGHT * idle + REMAINING_WEIGHT * remaining + PROXIMITY_WEIGHT * proximity
    }

    /// New singleton cluster, connected to the least loaded clusters that
    /// still have room.
    fn found_cluster(&mut self, peer: PeerId) -> ClusterId {
        let id = ClusterId(self.next_cluster);
        self.next_cluster += 1;
        let partners = self.least_loaded_with_room(id, self.config.redundancy_factor);
        self.clusters.insert(id, Cluster::new(id, peer.clone()));
        self.membership.insert(peer.clone(), id);
        for partner in &partners {
            self.link(id, *partner);
        }
        info!(peer = %peer, cluster = %id, links = partners.len(), "formed new cluster");
        id
    }

    fn least_loaded_with_room(&self, exclude: ClusterId, limit: usize) -> Vec<ClusterId> {
        let mut candidates: Vec<(f64, ClusterId)> = self
            .clusters
            .values()
            .filter(|c| c.id != exclude && self.has_room(c.id) && !self.is_linked(exclude, c.id))
            .map(|c| (self.load_of(c), c.id))
            .collect();
        candidates.sort_by(|a, b| a.0.total_cmp(&b.0).then(a.1.cmp(&b.1)));
        candidates
            .into_iter()
            .take(limit.min(self.config.max_connections))
            .map(|(_, id)| id)
            .collect()
    }

    /// Remove a departed peer, merging or dissolving its cluster if it
    /// became too small.
    pub fn remove_peer(&mut self, peer: &PeerId) -> Result<Departure> {
        let id = self
            .membership
            .remove(peer)
            .ok_or_else(|| TopologyError::UnknownPeer(peer.clone()))?;
        self.direct.retain(|(a, b)| a != peer && b != peer);
        let cluster = self
            .clusters
            .get_mut(&id)
            .ok_or(TopologyError::UnknownCluster(id))?;
        cluster.remove(peer);
        let remaining = cluster.len();
        debug!(peer = %peer, cluster = %id, remaining, "peer left cluster");

        if remaining == 0 {
            self.dissolve(id);
            return Ok(Departure {
                cluster: id,
                merged_into: None,
                dissolved: true,
            });
        }
        if remaining < 2 {
            if let Some(target) = self.merge_target(id) {
                self.merge(id, target);
                return Ok(Departure {
                    cluster: id,
                    merged_into: Some(target),
                    dissolved: true,
                });
            }
        }
        Ok(Departure {
            cluster: id,
            merged_into: None,
            dissolved: false,
        })
    }

    /// Neighbor with room for the source's members, most similar load first.
    fn merge_target(&self, source: ClusterId) -> Option<ClusterId> {
        let src = self.clusters.get(&source)?;
        let src_load = self.load_of(src);
        self.neighbors(source)
            .into_iter()
            .filter_map(|id| self.clusters.get(&id))
            .filter(|c| c.len() + src.len() <= self.config.base_cluster_size)
            .map(|c| (1.0 - (self.load_of(c) - src_load).abs(), c.id))
            .max_by(|a, b| a.0.total_cmp(&b.0).then(b.1.cmp(&a.1)))
            .map(|(_, id)| id)
    }

    fn merge(&mut self, source: ClusterId, target: ClusterId) {
        let Some(mut src) = self.clusters.remove(&source) else {
            return;
        };
        let traffic = src.traffic();
        let moved = src.drain_members();
        if let Some(dst) = self.clusters.get_mut(&target) {
            for member in &moved {
                dst.insert(member.clone());
            }
            dst.record_traffic(traffic);
        }
        for member in moved {
            self.membership.insert(member, target);
        }

        let inherited: Vec<ClusterId> = self
            .links
            .iter()
            .filter(|link| link.touches(source))
            .map(|link| link.other(source))
            .collect();
        self.links.retain(|link| !link.touches(source));
        for other in inherited {
            if other != target && !self.is_linked(target, other) {
                self.link(target, other);
            }
        }
        info!(from = %source, into = %target, "merged undersized cluster");
    }

    fn dissolve(&mut self, id: ClusterId) {
        self.clusters.remove(&id);
        self.links.retain(|link| !link.touches(id));
        debug!(cluster = %id, "dissolved empty cluster");
    }

    /// Attribute `messages` handled in the current window to a peer's cluster.
    pub fn record_traffic(&mut self, peer: &PeerId, messages: u64) -> Result<()> {
        let id = self
            .cluster_of(peer)
            .ok_or_else(|| TopologyError::UnknownPeer(peer.clone()))?;
        let cluster = self
            .clusters
            .get_mut(&id)
            .ok_or(TopologyError::UnknownCluster(id))?;
        cluster.record_traffic(messages);
        Ok(())
    }

    /// Record a transport-level link outside the cluster structure.
    pub fn add_direct(&mut self, a: PeerId, b: PeerId) -> bool {
        if a == b {
            return false;
        }
        self.direct.insert(peer_pair(a, b))
    }

    pub fn remove_direct(&mut self, a: &PeerId, b: &PeerId) -> bool {
        self.direct.remove(&peer_pair(a.clone(), b.clone()))
    }

    /// One adaptation cycle: compare the mean load against the thresholds,
    /// reshape if needed, and start a new traffic window.
    pub fn adapt(&mut self) -> Adaptation {
        let load = self.network_load();
        let from = self.state;
        let target = match from {
            TopologyState::Contracted if load > self.config.expansion_threshold => {
                Some(TopologyState::Expanded)
            }
            TopologyState::Expanded if load < self.config.contraction_threshold => {
                Some(TopologyState::Contracted)
            }
            _ => None,
        };

        let (mut added, mut removed) = (0, 0);
        if let Some(target) = target {
            self.set_state(TopologyState::Transitioning);
            match target {
                TopologyState::Expanded => added = self.expand(),
                _ => removed = self.contract(),
            }
            self.set_state(target);
            info!(%from, to = %target, load, added, removed, "topology transition");
        }

        for cluster in self.clusters.values_mut() {
            cluster.reset_traffic();
        }
        Adaptation {
            load,
            from,
            to: self.state,
            added,
            removed,
        }
    }

    /// Busiest clusters first, each paired with the least loaded clusters
    /// it is not yet connected to, until the ceiling stops it.
    fn expand(&mut self) -> usize {
        let mut order: Vec<(f64, ClusterId)> = self
            .clusters
            .values()
            .map(|c| (self.load_of(c), c.id))
            .collect();
        order.sort_by(|a, b| b.0.total_cmp(&a.0).then(a.1.cmp(&b.1)));
        let ids: Vec<ClusterId> = order.into_iter().map(|(_, id)| id).collect();

        let mut added = 0;
        for &a in &ids {
            for &b in ids.iter().rev() {
                if !self.has_room(a) {
                    break;
                }
                if a != b && !self.is_linked(a, b) && self.link(a, b) {
                    added += 1;
                }
            }
        }
        added
    }

    /// Drop connections whose endpoints both keep `redundancy_factor`
    /// connections afterwards, never splitting the cluster graph.
    fn contract(&mut self) -> usize {
        let floor = self.config.redundancy_factor;
        let candidates: Vec<LinkKey> = self.links.iter().copied().collect();
        let mut removed = 0;
        for key in candidates {
            let (a, b) = key.ends();
            if self.connection_count(a) <= floor || self.connection_count(b) <= floor {
                continue;
            }
            self.links.remove(&key);
            if self.cluster_path_exists(a, b) {
                removed += 1;
            } else {
                self.links.insert(key);
            }
        }
        removed
    }

    fn cluster_path_exists(&self, from: ClusterId, to: ClusterId) -> bool {
        let mut seen = HashSet::from([from]);
        let mut queue = VecDeque::from([from]);
        while let Some(id) = queue.pop_front() {
            if id == to {
                return true;
            }
            for next in self.neighbors(id) {
                if seen.insert(next) {
                    queue.push_back(next);
                }
            }
        }
        false
    }

    /// Reconnect clusters left without inter-cluster connections.
    /// Returns the clusters that were repaired.
    pub fn health_check(&mut self) -> Vec<ClusterId> {
        if self.clusters.len() < 2 {
            return Vec::new();
        }
        let isolated: Vec<ClusterId> = self
            .clusters
            .keys()
            .copied()
            .filter(|id| self.connection_count(*id) == 0)
            .collect();

        let mut repaired = Vec::new();
        for id in isolated {
            // linked while repairing an earlier one
            if self.connection_count(id) > 0 {
                continue;
            }
            let partners = self.least_loaded_with_room(id, self.config.redundancy_factor);
            let mut linked = 0;
            for partner in partners {
                if self.link(id, partner) {
                    linked += 1;
                }
            }
            if linked > 0 {
                info!(cluster = %id, links = linked, "reconnected isolated cluster");
                repaired.push(id);
            } else {
                warn!(cluster = %id, "isolated cluster has no partner with room");
            }
        }
        repaired
    }

    /// Cluster list for `topology:update`.
    pub fn summaries(&self) -> Vec<ClusterSummary> {
        self.clusters
            .values()
            .map(|c| ClusterSummary {
                id: c.id,
                member_count: c.len(),
                load: self.load_of(c),
            })
            .collect()
    }

    /// Every edge, typed.
    pub fn connections(&self) -> Vec<Connection> {
        let mut out = Vec::new();
        for cluster in self.clusters.values() {
            let weight = self.load_of(cluster);
            for member in cluster.members().filter(|m| *m != cluster.center()) {
                out.push(Connection {
                    kind: ConnectionKind::Cluster,
                    a: Endpoint::Peer(member.clone()),
                    b: Endpoint::Peer(cluster.center().clone()),
                    weight,
                });
            }
        }
        for link in &self.links {
            let (a, b) = link.ends();
            let weight = (self.cluster_load(a).unwrap_or(0.0) + self.cluster_load(b).unwrap_or(0.0)) / 2.0;
            out.push(Connection {
                kind: ConnectionKind::InterCluster,
                a: Endpoint::Cluster(a),
                b: Endpoint::Cluster(b),
                weight,
            });
        }
        for (a, b) in &self.direct {
            out.push(Connection {
                kind: ConnectionKind::Direct,
                a: Endpoint::Peer(a.clone()),
                b: Endpoint::Peer(b.clone()),
                weight: 1.0,
            });
        }
        out
    }

    /// Peer-level adjacency over transport-backed links only. Cluster
    /// membership and inter-cluster links shape the overlay but are not
    /// hops a message can take until a direct link backs them.
    pub fn adjacency(&self) -> BTreeMap<PeerId, BTreeSet<PeerId>> {
        let mut graph: BTreeMap<PeerId, BTreeSet<PeerId>> = self
            .membership
            .keys()
            .map(|peer| (peer.clone(), BTreeSet::new()))
            .collect();
        for (a, b) in &self.direct {
            graph.entry(a.clone()).or_default().insert(b.clone());
            graph.entry(b.clone()).or_default().insert(a.clone());
        }
        graph
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn peer(i: usize) -> PeerId {
        PeerId::from(format!("peer-{i:03}"))
    }

    /// Five singleton clusters, base size 8, at most 4 connections each.
    fn five_islands() -> Topology {
        let config = TopologyConfig::default()
            .with_max_connections(4)
            .with_redundancy_factor(2)
            .with_connection_capacity(10);
        let mut topology = Topology::new(config);
        for i in 0..5 {
            topology.found_cluster(peer(i));
        }
        topology
    }

    fn flood(topology: &mut Topology, messages: u64) {
        let peers: Vec<PeerId> = topology.peers().cloned().collect();
        for p in peers {
            topology.record_traffic(&p, messages).unwrap();
        }
    }

    fn assert_ceiling(topology: &Topology) {
        for cluster in topology.clusters() {
            assert!(topology.connection_count(cluster.id) <= topology.config().max_connections);
        }
    }

    #[test]
    fn fills_clusters_before_founding_new_ones() {
        let mut topology = Topology::new(TopologyConfig::default().with_base_cluster_size(3));
        let first = topology.integrate_peer(peer(0), &[]).unwrap();
        assert_eq!(topology.integrate_peer(peer(1), &[]).unwrap(), first);
        assert_eq!(topology.integrate_peer(peer(2), &[]).unwrap(), first);

        let second = topology.integrate_peer(peer(3), &[]).unwrap();
        assert_ne!(second, first);
        assert!(topology.is_linked(first, second));
        assert_eq!(topology.cluster_count(), 2);
        assert_eq!(topology.peer_count(), 4);
    }

    #[test]
    fn singleton_links_up_to_redundancy_factor() {
        let mut topology = Topology::new(
            TopologyConfig::default()
                .with_base_cluster_size(1)
                .with_redundancy_factor(2),
        );
        for i in 0..4 {
            topology.integrate_peer(peer(i), &[]).unwrap();
        }
        let last = topology.cluster_of(&peer(3)).unwrap();
        assert_eq!(topology.connection_count(last), 2);
        assert_eq!(topology.cluster_count(), 4);
    }

    #[test]
    fn proximity_breaks_ties() {
        let mut topology = five_islands();
        let target = topology.cluster_of(&peer(3)).unwrap();
        let joined = topology.integrate_peer(peer(10), &[peer(3)]).unwrap();
        assert_eq!(joined, target);
        assert_eq!(topology.cluster(target).map(Cluster::len), Some(2));
    }

    #[test]
    fn double_integration_refused() {
        let mut topology = Topology::new(TopologyConfig::default());
        topology.integrate_peer(peer(0), &[]).unwrap();
        assert_eq!(
            topology.integrate_peer(peer(0), &[]),
            Err(TopologyError::AlreadyIntegrated(peer(0)))
        );
    }

    #[test]
    fn expansion_passes_through_transitioning_once() {
        let mut topology = five_islands();
        assert_eq!(topology.state(), TopologyState::Contracted);

        flood(&mut topology, 100);
        let step = topology.adapt();
        assert!(step.transitioned());
        assert_eq!(step.to, TopologyState::Expanded);
        assert!(step.added > 0);
        assert_ceiling(&topology);

        // Load stays high: no second transition.
        flood(&mut topology, 100);
        let again = topology.adapt();
        assert!(!again.transitioned());
        assert_eq!(again.added, 0);

        let history: Vec<_> = topology.history().collect();
        assert_eq!(
            history,
            vec![
                TopologyState::Contracted,
                TopologyState::Transitioning,
                TopologyState::Expanded
            ]
        );
    }

    #[test]
    fn contraction_reverses_and_keeps_redundancy() {
        let mut topology = five_islands();
        flood(&mut topology, 100);
        topology.adapt();
        let dense = topology.link_count();

        // Traffic window reset: only peer fill (1/8) remains.
        let step = topology.adapt();
        assert_eq!(step.from, TopologyState::Expanded);
        assert_eq!(step.to, TopologyState::Contracted);
        assert!(step.removed > 0);
        assert_eq!(topology.link_count(), dense - step.removed);

        for cluster in topology.clusters() {
            assert!(topology.connection_count(cluster.id) >= 2);
        }
        let history: Vec<_> = topology.history().collect();
        assert_eq!(
            &history[history.len() - 2..],
            &[TopologyState::Transitioning, TopologyState::Contracted]
        );
    }

    #[test]
    fn contracted_topology_ignores_low_load() {
        let mut topology = five_islands();
        let links = topology.link_count();
        let step = topology.adapt();
        assert!(!step.transitioned());
        assert_eq!(topology.link_count(), links);
    }

    #[test]
    fn empty_cluster_dissolves() {
        let mut topology = five_islands();
        let id = topology.cluster_of(&peer(4)).unwrap();
        let departure = topology.remove_peer(&peer(4)).unwrap();
        assert!(departure.dissolved);
        assert_eq!(departure.merged_into, None);
        assert!(topology.cluster(id).is_none());
        assert_eq!(topology.connection_count(id), 0);
    }

    #[test]
    fn last_member_merges_into_neighbor() {
        let mut topology = five_islands();
        let id = topology.cluster_of(&peer(1)).unwrap();
        topology.integrate_peer(peer(20), &[peer(1)]).unwrap();
        assert_eq!(topology.cluster_of(&peer(20)), Some(id));

        let departure = topology.remove_peer(&peer(20)).unwrap();
        let target = departure.merged_into.expect("merged");
        assert!(topology.cluster(id).is_none());
        assert_eq!(topology.cluster_of(&peer(1)), Some(target));
        assert_ceiling(&topology);
    }

    #[test]
    fn unknown_peer_removal() {
        let mut topology = Topology::new(TopologyConfig::default());
        assert_eq!(
            topology.remove_peer(&peer(9)),
            Err(TopologyError::UnknownPeer(peer(9)))
        );
    }

    #[test]
    fn health_check_reconnects_isolated() {
        let mut topology = five_islands();
        let id = topology.cluster_of(&peer(2)).unwrap();
        topology.links.retain(|link| !link.touches(id));
        assert_eq!(topology.connection_count(id), 0);

        let repaired = topology.health_check();
        assert_eq!(repaired, vec![id]);
        assert!(topology.connection_count(id) > 0);
        assert!(topology.health_check().is_empty());
    }

    #[test]
    fn adjacency_follows_direct_links_only() {
        let mut topology = Topology::new(TopologyConfig::default().with_base_cluster_size(2));
        for i in 0..4 {
            topology.integrate_peer(peer(i), &[]).unwrap();
        }
        topology.add_direct(peer(1), peer(3));
        let graph = topology.adjacency();

        // peer-0 centers cluster A (with peer-1), peer-2 centers B (with peer-3),
        // but only the 1-3 link carries traffic
        assert_eq!(graph.len(), 4);
        assert!(graph[&peer(1)].contains(&peer(3)));
        assert!(graph[&peer(3)].contains(&peer(1)));
        assert!(graph[&peer(0)].is_empty());
        assert!(graph[&peer(2)].is_empty());

        let kinds: HashSet<ConnectionKind> =
            topology.connections().iter().map(|c| c.kind).collect();
        assert_eq!(kinds.len(), 3);
    }

    #[test]
    fn health_check_skips_clusters_linked_during_repair() {
        let config = TopologyConfig::default()
            .with_base_cluster_size(1)
            .with_max_connections(1)
            .with_redundancy_factor(1);
        let mut topology = Topology::new(config);
        for i in 0..2 {
            topology.integrate_peer(peer(i), &[]).unwrap();
        }
        for id in topology.clusters().map(|c| c.id).collect::<Vec<_>>() {
            topology.links.retain(|link| !link.touches(id));
        }

        // both are isolated; linking the first repairs the second too
        assert_eq!(topology.health_check().len(), 1);
        assert_eq!(topology.link_count(), 1);
        assert!(topology.health_check().is_empty());
    }

    #[test]
    fn summaries_report_each_cluster() {
        let topology = five_islands();
        let summaries = topology.summaries();
        assert_eq!(summaries.len(), 5);
        assert!(summaries.iter().all(|s| s.member_count == 1));
    }

    #[derive(Debug, Clone)]
    enum Op {
        Join(usize),
        Leave(usize),
        Traffic(usize, u64),
        Adapt,
        Health,
    }

    fn op() -> impl Strategy<Value = Op> {
        prop_oneof![
            (0usize..24).prop_map(Op::Join),
            (0usize..24).prop_map(Op::Leave),
            ((0usize..24), 0u64..500).prop_map(|(p, n)| Op::Traffic(p, n)),
            Just(Op::Adapt),
            Just(Op::Health),
        ]
    }

    proptest! {
        #[test]
        fn invariants_hold_under_churn(ops in proptest::collection::vec(op(), 1..80)) {
            let config = TopologyConfig::default()
                .with_base_cluster_size(3)
                .with_max_connections(3)
                .with_connection_capacity(20);
            let mut topology = Topology::new(config);
            for op in ops {
                match op {
                    Op::Join(i) => { let _ = topology.integrate_peer(peer(i), &[]); }
                    Op::Leave(i) => { let _ = topology.remove_peer(&peer(i)); }
                    Op::Traffic(i, n) => { let _ = topology.record_traffic(&peer(i), n); }
                    Op::Adapt => { topology.adapt(); }
                    Op::Health => { topology.health_check(); }
                }
                prop_assert_ne!(topology.state(), TopologyState::Transitioning);
                for cluster in topology.clusters() {
                    prop_assert!(!cluster.is_empty());
                    prop_assert!(topology.connection_count(cluster.id) <= 3);
                    for member in cluster.members() {
                        prop_assert_eq!(topology.cluster_of(member), Some(cluster.id));
                    }
                }
                prop_assert_eq!(
                    topology.peer_count(),
                    topology.clusters().map(Cluster::len).sum::<usize>()
                );
            }
        }
    }
}
