//! Source routing over the current topology.
//!
//! The originating node computes the whole path and stamps it on the message:
//!
//! ```text
//! path = [origin, hop₁, …, destination]    total_hops = path.len() − 1
//! ```
//!
//! The message is sent to `path[1]` with `current_hop = 1`. Each receiver
//! checks that it is `path[current_hop]`, delivers if it is the destination,
//! and otherwise advances `current_hop` and sends to the new `path[current_hop]`.
//! Running past `total_hops` is a routing failure; nothing retries it here.

use std::collections::BTreeSet;
use std::time::{Duration, Instant};

use agora_fact::PeerId;
use agora_topology::Topology;
use serde::{Deserialize, Serialize};
use tracing::{debug, trace, warn};

use crate::algorithm::RouteAlgorithm;
use crate::error::{Result, RoutingError};
use crate::graph::ConnectivityGraph;
use crate::table::{RouteEntry, RouteTable};

#[derive(Debug, Clone)]
pub struct RouterConfig {
    pub max_hops: usize,
    pub route_ttl: Duration,
    pub algorithm: RouteAlgorithm,
}

impl Default for RouterConfig {
    fn default() -> Self {
        Self {
            max_hops: 8,
            route_ttl: Duration::from_secs(60),
            algorithm: RouteAlgorithm::BreadthFirst,
        }
    }
}

impl RouterConfig {
    #[must_use]
    pub fn with_max_hops(mut self, max_hops: usize) -> Self {
        self.max_hops = max_hops;
        self
    }

    #[must_use]
    pub fn with_route_ttl(mut self, ttl: Duration) -> Self {
        self.route_ttl = ttl;
        self
    }

    #[must_use]
    pub fn with_algorithm(mut self, algorithm: RouteAlgorithm) -> Self {
        self.algorithm = algorithm;
        self
    }
}

/// Routing metadata carried by a forwarded message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RouteHeader {
    pub destination: PeerId,
    pub path: Vec<PeerId>,
    pub current_hop: usize,
    pub total_hops: usize,
}

impl RouteHeader {
    fn new(path: Vec<PeerId>) -> Option<Self> {
        let destination = path.last()?.clone();
        let total_hops = path.len().checked_sub(1)?;
        Some(Self {
            destination,
            path,
            current_hop: 1,
            total_hops,
        })
    }

    /// Peer the message is addressed to at this point of the path.
    pub fn current(&self) -> Option<&PeerId> {
        self.path.get(self.current_hop)
    }

    pub fn origin(&self) -> Option<&PeerId> {
        self.path.first()
    }
}

/// What a node does with a routed message it received.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Hop {
    /// Addressed to us: hand the payload up, routing metadata stripped.
    Deliver,
    /// Send the message on.
    Forward { next: PeerId, header: RouteHeader },
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RouterStats {
    pub routed: u64,
    pub direct: u64,
    pub cache_hits: u64,
    pub computed: u64,
    pub failures: u64,
    pub forwarded: u64,
    pub delivered: u64,
}

/// Path computation and route caching for one node.
#[derive(Debug)]
pub struct Router {
    local: PeerId,
    config: RouterConfig,
    graph: ConnectivityGraph,
    table: RouteTable,
    direct: BTreeSet<PeerId>,
    stats: RouterStats,
}

impl Router {
    pub fn new(local: PeerId, config: RouterConfig) -> Self {
        let table = RouteTable::new(config.route_ttl);
        Self {
            local,
            config,
            graph: ConnectivityGraph::new(),
            table,
            direct: BTreeSet::new(),
            stats: RouterStats::default(),
        }
    }

    pub fn local(&self) -> &PeerId {
        &self.local
    }

    pub fn config(&self) -> &RouterConfig {
        &self.config
    }

    pub fn stats(&self) -> RouterStats {
        self.stats
    }

    pub fn graph(&self) -> &ConnectivityGraph {
        &self.graph
    }

    pub fn table(&self) -> &RouteTable {
        &self.table
    }

    pub fn is_direct(&self, peer: &PeerId) -> bool {
        self.direct.contains(peer)
    }

    pub fn direct_peers(&self) -> impl Iterator<Item = &PeerId> {
        self.direct.iter()
    }

    /// Replace the searchable graph. Our own edges are always exactly our
    /// transport connections, whatever the overlay says.
    pub fn set_graph(&mut self, mut graph: ConnectivityGraph) {
        graph.isolate(&self.local);
        for peer in &self.direct {
            graph.add_edge(&self.local, peer);
        }
        self.graph = graph;
    }

    pub fn update_topology(&mut self, topology: &Topology) {
        self.set_graph(ConnectivityGraph::from_topology(topology));
    }

    pub fn peer_connected(&mut self, peer: PeerId) {
        if peer == self.local {
            return;
        }
        self.graph.add_edge(&self.local, &peer);
        self.direct.insert(peer);
    }

    /// Forget a transport connection and repair routes through it.
    pub fn peer_disconnected(&mut self, peer: &PeerId) {
        if !self.direct.remove(peer) {
            return;
        }
        self.graph.remove_edge(&self.local, peer);
        let (promoted, dropped) = self.table.invalidate_next_hop(peer);
        debug!(peer = %peer, promoted, dropped, "next hop disconnected");
    }

    /// Header for a message from this node to `destination`.
    pub fn route(&mut self, destination: &PeerId, now: Instant) -> Result<RouteHeader> {
        if *destination == self.local {
            return Err(RoutingError::Loopback);
        }
        self.stats.routed += 1;

        if self.direct.contains(destination) {
            self.stats.direct += 1;
            return Ok(RouteHeader {
                destination: destination.clone(),
                path: vec![self.local.clone(), destination.clone()],
                current_hop: 1,
                total_hops: 1,
            });
        }

        let direct = &self.direct;
        if let Some(entry) = self.table.lookup(destination, now, |hop| direct.contains(hop)) {
            if let Some(header) = RouteHeader::new(entry.path.clone()) {
                self.stats.cache_hits += 1;
                trace!(destination = %destination, hops = header.total_hops, "route cache hit");
                return Ok(header);
            }
        }

        let Some(entry) = self.compute(destination, now) else {
            self.stats.failures += 1;
            warn!(destination = %destination, max_hops = self.config.max_hops, "no route");
            return Err(RoutingError::NoRoute {
                destination: destination.clone(),
                max_hops: self.config.max_hops,
            });
        };
        let header = RouteHeader::new(entry.path.clone()).ok_or(RoutingError::NoRoute {
            destination: destination.clone(),
            max_hops: self.config.max_hops,
        })?;
        self.stats.computed += 1;
        debug!(
            destination = %destination,
            hops = header.total_hops,
            algorithm = %entry.algorithm,
            "route computed"
        );
        self.table.insert(entry);
        Ok(header)
    }

    fn compute(&self, destination: &PeerId, now: Instant) -> Option<RouteEntry> {
        let computed = self.config.algorithm.compute(
            &self.graph,
            &self.local,
            destination,
            self.config.max_hops,
        )?;
        if computed.path.len() < 2 {
            return None;
        }
        Some(RouteEntry {
            destination: destination.clone(),
            path: computed.path,
            backup: computed.backup,
            algorithm: self.config.algorithm,
            created_at: now,
        })
    }

    /// Process a routed message that arrived at this node.
    pub fn forward(&mut self, mut header: RouteHeader) -> Result<Hop> {
        if header.current() != Some(&self.local) {
            self.stats.failures += 1;
            return Err(RoutingError::NotOnPath {
                local: self.local.clone(),
            });
        }
        if header.destination == self.local {
            self.stats.delivered += 1;
            return Ok(Hop::Deliver);
        }

        header.current_hop += 1;
        let next = match header.current() {
            Some(next) if header.current_hop <= header.total_hops => next.clone(),
            _ => {
                self.stats.failures += 1;
                warn!(destination = %header.destination, "hop budget exhausted");
                return Err(RoutingError::HopBudgetExhausted {
                    destination: header.destination,
                });
            }
        };
        if !self.direct.contains(&next) {
            self.stats.failures += 1;
            return Err(RoutingError::Unreachable { next_hop: next });
        }
        self.stats.forwarded += 1;
        Ok(Hop::Forward { next, header })
    }

    pub fn purge_stale(&mut self, now: Instant) -> usize {
        self.table.purge_stale(now)
    }

    /// Precompute routes to graph peers we have no cached route for.
    /// Returns how many were added.
    pub fn refresh(&mut self, now: Instant) -> usize {
        let targets: Vec<PeerId> = self
            .graph
            .peers()
            .filter(|p| **p != self.local && !self.direct.contains(*p) && !self.table.contains(p))
            .cloned()
            .collect();
        let mut added = 0;
        for target in targets {
            if let Some(entry) = self.compute(&target, now) {
                self.table.insert(entry);
                added += 1;
            }
        }
        added
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use agora_topology::TopologyConfig;

    fn p(name: &str) -> PeerId {
        PeerId::from(name)
    }

    /// me - b - c - d, plus me - x
    fn chain_router(config: RouterConfig) -> Router {
        let mut router = Router::new(p("me"), config);
        router.peer_connected(p("b"));
        router.peer_connected(p("x"));
        let mut graph = ConnectivityGraph::new();
        graph.add_edge(&p("b"), &p("c"));
        graph.add_edge(&p("c"), &p("d"));
        // overlay claims an edge we do not actually have
        graph.add_edge(&p("me"), &p("d"));
        router.set_graph(graph);
        router
    }

    #[test]
    fn direct_peer_is_one_hop() {
        let mut router = chain_router(RouterConfig::default());
        let header = router.route(&p("b"), Instant::now()).unwrap();
        assert_eq!(header.path, vec![p("me"), p("b")]);
        assert_eq!(header.total_hops, 1);
        assert!(router.table().is_empty());
    }

    #[test]
    fn multi_hop_uses_transport_edges_only() {
        let mut router = chain_router(RouterConfig::default());
        let header = router.route(&p("d"), Instant::now()).unwrap();
        assert_eq!(header.path, vec![p("me"), p("b"), p("c"), p("d")]);
        assert_eq!(header.current(), Some(&p("b")));
        assert_eq!(router.stats().computed, 1);

        router.route(&p("d"), Instant::now()).unwrap();
        assert_eq!(router.stats().cache_hits, 1);
    }

    #[test]
    fn no_path_is_an_error_not_a_panic() {
        let mut router = chain_router(RouterConfig::default().with_max_hops(2));
        assert_eq!(
            router.route(&p("d"), Instant::now()),
            Err(RoutingError::NoRoute {
                destination: p("d"),
                max_hops: 2
            })
        );
        assert!(matches!(
            router.route(&p("nobody"), Instant::now()),
            Err(RoutingError::NoRoute { .. })
        ));
        assert_eq!(router.route(&p("me"), Instant::now()), Err(RoutingError::Loopback));
    }

    #[test]
    fn expired_route_is_recomputed() {
        let ttl = Duration::from_secs(5);
        let mut router = chain_router(RouterConfig::default().with_route_ttl(ttl));
        let start = Instant::now();
        router.route(&p("d"), start).unwrap();
        router.route(&p("d"), start + ttl).unwrap();
        assert_eq!(router.stats().cache_hits, 0);
        assert_eq!(router.stats().computed, 2);
    }

    #[test]
    fn disconnect_drops_routes_through_peer() {
        let mut router = chain_router(RouterConfig::default());
        router.route(&p("d"), Instant::now()).unwrap();
        router.peer_disconnected(&p("b"));
        assert!(router.table().is_empty());
        assert!(router.route(&p("d"), Instant::now()).is_err());
    }

    #[test]
    fn forwarding_walks_the_path() {
        let header = RouteHeader::new(vec![p("a"), p("me"), p("x")]).unwrap();
        let mut router = chain_router(RouterConfig::default());

        let Hop::Forward { next, header } = router.forward(header).unwrap() else {
            panic!("expected forward");
        };
        assert_eq!(next, p("x"));
        assert_eq!(header.current_hop, 2);

        let mut at_x = Router::new(p("x"), RouterConfig::default());
        assert_eq!(at_x.forward(header).unwrap(), Hop::Deliver);
        assert_eq!(at_x.stats().delivered, 1);
    }

    #[test]
    fn forwarding_rejects_bad_headers() {
        let mut router = chain_router(RouterConfig::default());

        let elsewhere = RouteHeader::new(vec![p("a"), p("b"), p("x")]).unwrap();
        assert!(matches!(
            router.forward(elsewhere),
            Err(RoutingError::NotOnPath { .. })
        ));

        let mut truncated = RouteHeader::new(vec![p("a"), p("me"), p("x")]).unwrap();
        truncated.total_hops = 1;
        assert_eq!(
            router.forward(truncated),
            Err(RoutingError::HopBudgetExhausted { destination: p("x") })
        );

        let unreachable = RouteHeader::new(vec![p("a"), p("me"), p("zz")]).unwrap();
        assert!(matches!(
            router.forward(unreachable),
            Err(RoutingError::Unreachable { .. })
        ));
    }

    #[test]
    fn redundant_routes_survive_next_hop_loss() {
        let mut router = Router::new(
            p("me"),
            RouterConfig::default().with_algorithm(RouteAlgorithm::Redundant),
        );
        router.peer_connected(p("b"));
        router.peer_connected(p("c"));
        let mut graph = ConnectivityGraph::new();
        graph.add_edge(&p("b"), &p("d"));
        graph.add_edge(&p("c"), &p("d"));
        router.set_graph(graph);

        let now = Instant::now();
        assert_eq!(router.route(&p("d"), now).unwrap().path[1], p("b"));
        router.peer_disconnected(&p("b"));
        let header = router.route(&p("d"), now).unwrap();
        assert_eq!(header.path, vec![p("me"), p("c"), p("d")]);
        assert_eq!(router.stats().cache_hits, 1);
    }

    #[test]
    fn refresh_and_purge() {
        let mut router = chain_router(RouterConfig::default().with_route_ttl(Duration::from_secs(1)));
        let start = Instant::now();
        // c and d are reachable but not direct
        assert_eq!(router.refresh(start), 2);
        assert_eq!(router.refresh(start), 0);
        assert_eq!(router.purge_stale(start + Duration::from_secs(2)), 2);
    }

    #[test]
    fn header_wire_form() {
        let header = RouteHeader::new(vec![p("a"), p("b")]).unwrap();
        let wire = serde_json::to_value(&header).unwrap();
        assert_eq!(wire["destination"], "b");
        assert_eq!(wire["currentHop"], 1);
        assert_eq!(wire["totalHops"], 1);
        assert_eq!(header.origin(), Some(&p("a")));
    }

    #[test]
    fn graph_from_topology() {
        let mut topology = Topology::new(TopologyConfig::default().with_base_cluster_size(2));
        for name in ["me", "b", "c", "d"] {
            topology.integrate_peer(p(name), &[]).unwrap();
        }
        let mut router = Router::new(p("me"), RouterConfig::default());
        router.peer_connected(p("b"));
        router.update_topology(&topology);

        // cluster membership alone adds no edges; only the transport link remains
        assert_eq!(router.graph().neighbors(&p("me")).count(), 1);
        assert!(router.route(&p("b"), Instant::now()).is_ok());
        assert!(router.route(&p("c"), Instant::now()).is_err());
    }

    #[test]
    fn routes_follow_links_across_clusters() {
        let chain = ["l", "a", "b", "c", "d"];
        let mut topology = Topology::new(TopologyConfig::default().with_base_cluster_size(2));
        for name in chain {
            topology.integrate_peer(p(name), &[]).unwrap();
        }
        for pair in chain.windows(2) {
            topology.add_direct(p(pair[0]), p(pair[1]));
        }
        assert!(topology.cluster_count() > 1);

        let mut router = Router::new(p("l"), RouterConfig::default());
        router.peer_connected(p("a"));
        router.update_topology(&topology);

        let header = router.route(&p("d"), Instant::now()).unwrap();
        let expected: Vec<PeerId> = chain.iter().map(|n| p(n)).collect();
        assert_eq!(header.path, expected);
        for hop in header.path.windows(2) {
            assert!(router.graph().neighbors(&hop[0]).any(|n| *n == hop[1]));
        }
    }
}
