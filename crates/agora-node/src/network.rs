//! Mesh network façade: connection set, broadcast and unicast.

use std::collections::BTreeSet;
use std::sync::Arc;

use agora_fact::PeerId;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, warn};

use crate::envelope::{Envelope, Topic};
use crate::error::{Error, Result};
use crate::transport::PeerTransport;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct NetworkStats {
    pub sent: u64,
    pub send_failures: u64,
    pub received: u64,
    pub undecodable: u64,
}

/// Connection bookkeeping over a [`PeerTransport`].
pub struct MeshNetwork {
    local: PeerId,
    transport: Arc<dyn PeerTransport>,
    peers: BTreeSet<PeerId>,
    stats: NetworkStats,
}

impl std::fmt::Debug for MeshNetwork {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MeshNetwork")
            .field("local", &self.local)
            .field("peers", &self.peers.len())
            .finish()
    }
}

impl MeshNetwork {
    pub fn new(transport: Arc<dyn PeerTransport>) -> Self {
        Self {
            local: transport.local_peer().clone(),
            transport,
            peers: BTreeSet::new(),
            stats: NetworkStats::default(),
        }
    }

    pub fn local(&self) -> &PeerId {
        &self.local
    }

    pub fn stats(&self) -> NetworkStats {
        self.stats
    }

    pub fn transport(&self) -> &Arc<dyn PeerTransport> {
        &self.transport
    }

    pub fn is_connected(&self, peer: &PeerId) -> bool {
        self.peers.contains(peer)
    }

    pub fn peers(&self) -> impl Iterator<Item = &PeerId> {
        self.peers.iter()
    }

    pub fn peer_count(&self) -> usize {
        self.peers.len()
    }

    /// Record a new connection. Returns false if it was already known.
    pub fn on_connect(&mut self, peer: PeerId) -> bool {
        self.peers.insert(peer)
    }

    pub fn on_disconnect(&mut self, peer: &PeerId) -> bool {
        self.peers.remove(peer)
    }

    pub fn envelope(&self, topic: Topic, data: Value) -> Envelope {
        Envelope::new(topic, data, self.local.clone())
    }

    /// Best-effort fan-out to every connected peer. Per-peer failures are
    /// logged and left out of the returned count.
    pub fn broadcast(&mut self, topic: Topic, data: Value, open_n: u8) -> Result<usize> {
        self.broadcast_except(topic, data, open_n, &[])
    }

    /// [`broadcast`](Self::broadcast), skipping `skip`.
    pub fn broadcast_except(
        &mut self,
        topic: Topic,
        data: Value,
        open_n: u8,
        skip: &[&PeerId],
    ) -> Result<usize> {
        let envelope = self.envelope(topic, data).with_open_n(open_n);
        let bytes = envelope.encode()?;
        let targets: Vec<PeerId> = self
            .peers
            .iter()
            .filter(|p| !skip.contains(p))
            .cloned()
            .collect();

        let mut delivered = 0;
        for peer in &targets {
            match self.transport.send(peer, bytes.clone()) {
                Ok(()) => {
                    self.stats.sent += 1;
                    delivered += 1;
                }
                Err(e) => {
                    self.stats.send_failures += 1;
                    warn!(peer = %peer, topic = %topic, error = %e, "broadcast send failed");
                }
            }
        }
        debug!(topic = %topic, delivered, targets = targets.len(), "broadcast");
        Ok(delivered)
    }

    /// Send to one connected peer.
    pub fn send_to_peer(&mut self, peer: &PeerId, topic: Topic, data: Value) -> Result<()> {
        let envelope = self.envelope(topic, data);
        self.send_envelope(peer, &envelope)
    }

    pub fn send_envelope(&mut self, peer: &PeerId, envelope: &Envelope) -> Result<()> {
        if !self.peers.contains(peer) {
            return Err(Error::NotConnected(peer.clone()));
        }
        let bytes = envelope.encode()?;
        match self.transport.send(peer, bytes) {
            Ok(()) => {
                self.stats.sent += 1;
                Ok(())
            }
            Err(e) => {
                self.stats.send_failures += 1;
                Err(e)
            }
        }
    }

    /// Decode inbound bytes. The node dispatches on the returned topic.
    pub fn receive(&mut self, from: &PeerId, bytes: &[u8]) -> Result<Envelope> {
        match Envelope::decode(bytes) {
            Ok(envelope) => {
                self.stats.received += 1;
                if envelope.sender != *from {
                    debug!(from = %from, sender = %envelope.sender, "envelope sender differs from link");
                }
                Ok(envelope)
            }
            Err(e) => {
                self.stats.undecodable += 1;
                Err(e)
            }
        }
    }
}
