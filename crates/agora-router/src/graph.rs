//! Connectivity graph the router searches.

use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet, VecDeque};

use agora_fact::PeerId;
use agora_topology::Topology;

/// Undirected peer graph with per-peer load.
#[derive(Debug, Clone, Default)]
pub struct ConnectivityGraph {
    adjacency: BTreeMap<PeerId, BTreeSet<PeerId>>,
    load: HashMap<PeerId, f64>,
}

impl ConnectivityGraph {
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot the topology's peer adjacency and cluster loads.
    pub fn from_topology(topology: &Topology) -> Self {
        let adjacency = topology.adjacency();
        let load = adjacency
            .keys()
            .filter_map(|peer| topology.peer_load(peer).map(|l| (peer.clone(), l)))
            .collect();
        Self { adjacency, load }
    }

    pub fn add_edge(&mut self, a: &PeerId, b: &PeerId) {
        if a == b {
            return;
        }
        self.adjacency.entry(a.clone()).or_default().insert(b.clone());
        self.adjacency.entry(b.clone()).or_default().insert(a.clone());
    }

    pub fn remove_edge(&mut self, a: &PeerId, b: &PeerId) {
        if let Some(n) = self.adjacency.get_mut(a) {
            n.remove(b);
        }
        if let Some(n) = self.adjacency.get_mut(b) {
            n.remove(a);
        }
    }

    /// Drop every edge touching `peer`, keeping the peer itself.
    pub fn isolate(&mut self, peer: &PeerId) {
        let neighbors = self
            .adjacency
            .insert(peer.clone(), BTreeSet::new())
            .unwrap_or_default();
        for n in neighbors {
            if let Some(set) = self.adjacency.get_mut(&n) {
                set.remove(peer);
            }
        }
    }

    pub fn remove_peer(&mut self, peer: &PeerId) {
        self.isolate(peer);
        self.adjacency.remove(peer);
        self.load.remove(peer);
    }

    pub fn set_load(&mut self, peer: PeerId, load: f64) {
        self.load.insert(peer, load);
    }

    pub fn load(&self, peer: &PeerId) -> f64 {
        self.load.get(peer).copied().unwrap_or(0.0)
    }

    pub fn contains(&self, peer: &PeerId) -> bool {
        self.adjacency.contains_key(peer)
    }

    pub fn neighbors(&self, peer: &PeerId) -> impl Iterator<Item = &PeerId> {
        self.adjacency.get(peer).into_iter().flatten()
    }

    pub fn peers(&self) -> impl Iterator<Item = &PeerId> {
        self.adjacency.keys()
    }

    pub fn len(&self) -> usize {
        self.adjacency.len()
    }

    pub fn is_empty(&self) -> bool {
        self.adjacency.is_empty()
    }

    /// Breadth-first search for a path of at most `max_hops` edges, skipping
    /// `avoid`. Neighbors are expanded in the order `order` returns them, so
    /// the first path found wins ties.
    ///
    /// The returned path starts at `from` and ends at `to`.
    pub fn search<F>(
        &self,
        from: &PeerId,
        to: &PeerId,
        max_hops: usize,
        avoid: &HashSet<PeerId>,
        order: F,
    ) -> Option<Vec<PeerId>>
    where
        F: Fn(&Self, &PeerId) -> Vec<PeerId>,
    {
        if from == to {
            return Some(vec![from.clone()]);
        }
        let mut parent: HashMap<PeerId, PeerId> = HashMap::new();
        let mut seen: HashSet<PeerId> = HashSet::from([from.clone()]);
        let mut queue = VecDeque::from([(from.clone(), 0usize)]);

        while let Some((peer, depth)) = queue.pop_front() {
            if depth >= max_hops {
                continue;
            }
            for next in order(self, &peer) {
                if avoid.contains(&next) || !seen.insert(next.clone()) {
                    continue;
                }
                parent.insert(next.clone(), peer.clone());
                if next == *to {
                    return Some(unwind(&parent, from, to));
                }
                queue.push_back((next, depth + 1));
            }
        }
        None
    }
}

fn unwind(parent: &HashMap<PeerId, PeerId>, from: &PeerId, to: &PeerId) -> Vec<PeerId> {
    let mut path = vec![to.clone()];
    let mut cursor = to;
    while cursor != from {
        match parent.get(cursor) {
            Some(prev) => {
                path.push(prev.clone());
                cursor = prev;
            }
            None => break,
        }
    }
    path.reverse();
    path
}
