//! Peer transport seam.
//!
//! The node never opens sockets itself. It drives a [`PeerTransport`] for
//! outbound traffic and consumes [`TransportEvent`]s for everything inbound.
//! [`ChannelHub`] is an in-process implementation over tokio channels.

use std::collections::{BTreeSet, HashMap};
use std::sync::{Arc, Mutex, MutexGuard};

use agora_fact::{PeerId, Signer};
use ed25519_dalek::VerifyingKey;
use tokio::sync::mpsc;
use tracing::{debug, trace};

use crate::error::{Error, Result};

/// Inbound transport activity.
#[derive(Debug, Clone)]
pub enum TransportEvent {
    /// Connection established; the handshake yielded the peer's key.
    Connected { peer: PeerId, public_key: VerifyingKey },
    Disconnected { peer: PeerId },
    Message { from: PeerId, bytes: Vec<u8> },
}

pub type TransportEvents = mpsc::UnboundedReceiver<TransportEvent>;

/// Outbound side of a peer transport.
pub trait PeerTransport: Send + Sync + 'static {
    fn local_peer(&self) -> &PeerId;

    /// Open a connection. Both ends observe [`TransportEvent::Connected`].
    fn connect(&self, peer: &PeerId) -> Result<()>;

    fn disconnect(&self, peer: &PeerId) -> Result<()>;

    /// Hand bytes to a connected peer.
    fn send(&self, peer: &PeerId, bytes: Vec<u8>) -> Result<()>;
}

struct Member {
    key: VerifyingKey,
    inbox: mpsc::UnboundedSender<TransportEvent>,
    links: BTreeSet<PeerId>,
}

#[derive(Default)]
struct HubState {
    members: HashMap<PeerId, Member>,
}

/// In-process switchboard connecting any number of nodes.
#[derive(Clone, Default)]
pub struct ChannelHub {
    state: Arc<Mutex<HubState>>,
}

impl std::fmt::Debug for ChannelHub {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChannelHub").field("members", &self.len()).finish()
    }
}

impl ChannelHub {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an identity and get its transport plus inbound stream.
    pub fn join(&self, identity: &dyn Signer) -> Result<(HubTransport, TransportEvents)> {
        let local = identity.peer_id().clone();
        let (inbox, events) = mpsc::unbounded_channel();
        let mut state = self.lock(&local)?;
        state.members.insert(
            local.clone(),
            Member {
                key: identity.public_key(),
                inbox,
                links: BTreeSet::new(),
            },
        );
        drop(state);
        debug!(peer = %local, "joined hub");
        Ok((
            HubTransport {
                local,
                hub: self.clone(),
            },
            events,
        ))
    }

    pub fn len(&self) -> usize {
        self.state.lock().map(|s| s.members.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn lock(&self, local: &PeerId) -> Result<MutexGuard<'_, HubState>> {
        self.state.lock().map_err(|_| Error::Transport {
            peer: local.clone(),
            reason: "hub state poisoned".into(),
        })
    }
}

/// One node's handle on a [`ChannelHub`].
#[derive(Debug, Clone)]
pub struct HubTransport {
    local: PeerId,
    hub: ChannelHub,
}

impl HubTransport {
    /// Drop every link and leave the hub.
    pub fn leave(&self) -> Result<()> {
        let mut state = self.hub.lock(&self.local)?;
        let Some(member) = state.members.remove(&self.local) else {
            return Ok(());
        };
        for peer in member.links {
            if let Some(other) = state.members.get_mut(&peer) {
                other.links.remove(&self.local);
                let _ = other.inbox.send(TransportEvent::Disconnected {
                    peer: self.local.clone(),
                });
            }
        }
        debug!(peer = %self.local, "left hub");
        Ok(())
    }
}

impl PeerTransport for HubTransport {
    fn local_peer(&self) -> &PeerId {
        &self.local
    }

    fn connect(&self, peer: &PeerId) -> Result<()> {
        if *peer == self.local {
            return Err(Error::Transport {
                peer: peer.clone(),
                reason: "cannot connect to self".into(),
            });
        }
        let mut state = self.hub.lock(&self.local)?;
        let unknown = |peer: &PeerId| Error::Transport {
            peer: peer.clone(),
            reason: "not on this hub".into(),
        };
        let local_key = state.members.get(&self.local).ok_or_else(|| unknown(&self.local))?.key;
        let remote_key = state.members.get(peer).ok_or_else(|| unknown(peer))?.key;

        if let Some(me) = state.members.get_mut(&self.local) {
            if !me.links.insert(peer.clone()) {
                return Ok(());
            }
            let _ = me.inbox.send(TransportEvent::Connected {
                peer: peer.clone(),
                public_key: remote_key,
            });
        }
        if let Some(other) = state.members.get_mut(peer) {
            other.links.insert(self.local.clone());
            let _ = other.inbox.send(TransportEvent::Connected {
                peer: self.local.clone(),
                public_key: local_key,
            });
        }
        debug!(local = %self.local, peer = %peer, "linked");
        Ok(())
    }

    fn disconnect(&self, peer: &PeerId) -> Result<()> {
        let mut state = self.hub.lock(&self.local)?;
        let was_linked = state
            .members
            .get_mut(&self.local)
            .is_some_and(|me| me.links.remove(peer));
        if !was_linked {
            return Err(Error::NotConnected(peer.clone()));
        }
        if let Some(me) = state.members.get(&self.local) {
            let _ = me.inbox.send(TransportEvent::Disconnected { peer: peer.clone() });
        }
        if let Some(other) = state.members.get_mut(peer) {
            other.links.remove(&self.local);
            let _ = other.inbox.send(TransportEvent::Disconnected {
                peer: self.local.clone(),
            });
        }
        Ok(())
    }

    fn send(&self, peer: &PeerId, bytes: Vec<u8>) -> Result<()> {
        let state = self.hub.lock(&self.local)?;
        let linked = state
            .members
            .get(&self.local)
            .is_some_and(|me| me.links.contains(peer));
        if !linked {
            return Err(Error::NotConnected(peer.clone()));
        }
        let other = state.members.get(peer).ok_or_else(|| Error::NotConnected(peer.clone()))?;
        trace!(from = %self.local, to = %peer, len = bytes.len(), "hub send");
        other
            .inbox
            .send(TransportEvent::Message {
                from: self.local.clone(),
                bytes,
            })
            .map_err(|_| Error::Transport {
                peer: peer.clone(),
                reason: "receiver gone".into(),
            })
    }
}
