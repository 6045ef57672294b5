use std::collections::HashSet;

use agora_fact::PeerId;
use serde::{Deserialize, Serialize};

use crate::graph::ConnectivityGraph;

/// Path search strategy. All three are breadth-first and share the hop
/// bound; they differ in neighbor order and in whether a backup is kept.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum RouteAlgorithm {
    /// Neighbors in discovery (id) order.
    #[default]
    BreadthFirst,
    /// Least loaded neighbors first.
    LoadBalanced,
    /// Breadth-first primary plus a node-disjoint backup path.
    Redundant,
}

impl std::fmt::Display for RouteAlgorithm {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            RouteAlgorithm::BreadthFirst => "breadth-first",
            RouteAlgorithm::LoadBalanced => "load-balanced",
            RouteAlgorithm::Redundant => "redundant",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ComputedRoute {
    pub path: Vec<PeerId>,
    pub backup: Option<Vec<PeerId>>,
}

fn discovery_order(graph: &ConnectivityGraph, peer: &PeerId) -> Vec<PeerId> {
    graph.neighbors(peer).cloned().collect()
}

fn load_order(graph: &ConnectivityGraph, peer: &PeerId) -> Vec<PeerId> {
    let mut neighbors = discovery_order(graph, peer);
    neighbors.sort_by(|a, b| graph.load(a).total_cmp(&graph.load(b)).then(a.cmp(b)));
    neighbors
}

impl RouteAlgorithm {
    pub fn compute(
        &self,
        graph: &ConnectivityGraph,
        from: &PeerId,
        to: &PeerId,
        max_hops: usize,
    ) -> Option<ComputedRoute> {
        let none = HashSet::new();
        match self {
            RouteAlgorithm::BreadthFirst => graph
                .search(from, to, max_hops, &none, discovery_order)
                .map(|path| ComputedRoute { path, backup: None }),
            RouteAlgorithm::LoadBalanced => graph
                .search(from, to, max_hops, &none, load_order)
                .map(|path| ComputedRoute { path, backup: None }),
            RouteAlgorithm::Redundant => {
                let path = graph.search(from, to, max_hops, &none, discovery_order)?;
                let interior: HashSet<PeerId> = path
                    .iter()
                    .filter(|p| *p != from && *p != to)
                    .cloned()
                    .collect();
                let backup = if interior.is_empty() {
                    None
                } else {
                    graph.search(from, to, max_hops, &interior, discovery_order)
                };
                Some(ComputedRoute { path, backup })
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn p(name: &str) -> PeerId {
        PeerId::from(name)
    }

    /// a reaches d through b or c.
    fn diamond() -> ConnectivityGraph {
        let mut graph = ConnectivityGraph::new();
        graph.add_edge(&p("a"), &p("b"));
        graph.add_edge(&p("a"), &p("c"));
        graph.add_edge(&p("b"), &p("d"));
        graph.add_edge(&p("c"), &p("d"));
        graph
    }

    #[test]
    fn breadth_first_takes_discovery_order() {
        let route = RouteAlgorithm::BreadthFirst
            .compute(&diamond(), &p("a"), &p("d"), 8)
            .unwrap();
        assert_eq!(route.path, vec![p("a"), p("b"), p("d")]);
        assert!(route.backup.is_none());
    }

    #[test]
    fn load_balanced_avoids_busy_peer() {
        let mut graph = diamond();
        graph.set_load(p("b"), 0.9);
        graph.set_load(p("c"), 0.1);
        let route = RouteAlgorithm::LoadBalanced
            .compute(&graph, &p("a"), &p("d"), 8)
            .unwrap();
        assert_eq!(route.path, vec![p("a"), p("c"), p("d")]);
    }

    #[test]
    fn redundant_keeps_disjoint_backup() {
        let route = RouteAlgorithm::Redundant
            .compute(&diamond(), &p("a"), &p("d"), 8)
            .unwrap();
        assert_eq!(route.path, vec![p("a"), p("b"), p("d")]);
        assert_eq!(route.backup, Some(vec![p("a"), p("c"), p("d")]));
    }

    #[test]
    fn hop_bound_applies_to_every_variant() {
        for algorithm in [
            RouteAlgorithm::BreadthFirst,
            RouteAlgorithm::LoadBalanced,
            RouteAlgorithm::Redundant,
        ] {
            assert!(algorithm.compute(&diamond(), &p("a"), &p("d"), 1).is_none());
        }
    }
}
