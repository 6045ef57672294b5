//! Route cache.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use agora_fact::PeerId;

use crate::algorithm::RouteAlgorithm;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RouteEntry {
    pub destination: PeerId,
    /// Full path, local peer first.
    pub path: Vec<PeerId>,
    pub backup: Option<Vec<PeerId>>,
    pub algorithm: RouteAlgorithm,
    pub created_at: Instant,
}

impl RouteEntry {
    pub fn hop_count(&self) -> usize {
        self.path.len().saturating_sub(1)
    }

    pub fn next_hop(&self) -> Option<&PeerId> {
        self.path.get(1)
    }

    fn is_fresh(&self, now: Instant, ttl: Duration) -> bool {
        now.saturating_duration_since(self.created_at) < ttl
    }
}

/// Cached routes keyed by destination. An entry is served only while it is
/// younger than the TTL and its next hop is still connected.
#[derive(Debug)]
pub struct RouteTable {
    entries: HashMap<PeerId, RouteEntry>,
    ttl: Duration,
}

impl RouteTable {
    pub fn new(ttl: Duration) -> Self {
        Self {
            entries: HashMap::new(),
            ttl,
        }
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    /// Serve a cached route, evicting it if it may no longer be used.
    pub fn lookup<F>(&mut self, destination: &PeerId, now: Instant, connected: F) -> Option<&RouteEntry>
    where
        F: Fn(&PeerId) -> bool,
    {
        let usable = self.entries.get(destination).is_some_and(|entry| {
            entry.is_fresh(now, self.ttl) && entry.next_hop().is_some_and(&connected)
        });
        if !usable {
            self.entries.remove(destination);
            return None;
        }
        self.entries.get(destination)
    }

    pub fn insert(&mut self, entry: RouteEntry) {
        self.entries.insert(entry.destination.clone(), entry);
    }

    pub fn remove(&mut self, destination: &PeerId) -> Option<RouteEntry> {
        self.entries.remove(destination)
    }

    pub fn contains(&self, destination: &PeerId) -> bool {
        self.entries.contains_key(destination)
    }

    /// Drop entries older than the TTL. Returns how many were dropped.
    pub fn purge_stale(&mut self, now: Instant) -> usize {
        let before = self.entries.len();
        let ttl = self.ttl;
        self.entries.retain(|_, entry| entry.is_fresh(now, ttl));
        before - self.entries.len()
    }

    /// Handle a disconnected peer: routes whose next hop it was fall back to
    /// their backup when the backup avoids it, otherwise they are dropped.
    /// Returns `(promoted, dropped)`.
    pub fn invalidate_next_hop(&mut self, peer: &PeerId) -> (usize, usize) {
        let (mut promoted, mut dropped) = (0, 0);
        self.entries.retain(|_, entry| {
            if entry.next_hop() != Some(peer) {
                return true;
            }
            match entry.backup.take() {
                Some(backup) if !backup.contains(peer) => {
                    entry.path = backup;
                    promoted += 1;
                    true
                }
                _ => {
                    dropped += 1;
                    false
                }
            }
        });
        (promoted, dropped)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn p(name: &str) -> PeerId {
        PeerId::from(name)
    }

    fn entry(path: &[&str], backup: Option<&[&str]>, at: Instant) -> RouteEntry {
        RouteEntry {
            destination: p(path[path.len() - 1]),
            path: path.iter().map(|s| p(s)).collect(),
            backup: backup.map(|b| b.iter().map(|s| p(s)).collect()),
            algorithm: RouteAlgorithm::BreadthFirst,
            created_at: at,
        }
    }

    #[test]
    fn stale_entries_are_never_served() {
        let start = Instant::now();
        let mut table = RouteTable::new(Duration::from_secs(10));
        table.insert(entry(&["me", "b", "c"], None, start));

        assert!(table.lookup(&p("c"), start + Duration::from_secs(9), |_| true).is_some());
        assert!(table.lookup(&p("c"), start + Duration::from_secs(10), |_| true).is_none());
        assert!(!table.contains(&p("c")));
    }

    #[test]
    fn disconnected_next_hop_evicts() {
        let start = Instant::now();
        let mut table = RouteTable::new(Duration::from_secs(10));
        table.insert(entry(&["me", "b", "c"], None, start));
        assert!(table.lookup(&p("c"), start, |peer| peer.as_str() != "b").is_none());
        assert!(table.is_empty());
    }

    #[test]
    fn purge_counts_removed() {
        let start = Instant::now();
        let mut table = RouteTable::new(Duration::from_secs(5));
        table.insert(entry(&["me", "b", "c"], None, start));
        table.insert(entry(&["me", "b", "d"], None, start + Duration::from_secs(4)));
        assert_eq!(table.purge_stale(start + Duration::from_secs(6)), 1);
        assert_eq!(table.len(), 1);
        assert!(table.contains(&p("d")));
    }

    #[test]
    fn backup_promoted_when_primary_hop_leaves() {
        let start = Instant::now();
        let mut table = RouteTable::new(Duration::from_secs(10));
        table.insert(entry(&["me", "b", "d"], Some(&["me", "c", "d"]), start));
        table.insert(entry(&["me", "b", "e"], None, start));

        assert_eq!(table.invalidate_next_hop(&p("b")), (1, 1));
        let kept = table.lookup(&p("d"), start, |_| true).unwrap();
        assert_eq!(kept.next_hop(), Some(&p("c")));
        assert_eq!(kept.hop_count(), 2);
        assert!(kept.backup.is_none());
    }
}
