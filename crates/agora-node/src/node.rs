//! The node actor.
//!
//! Architecture:
//! - One task owns every piece of mutable protocol state: fact index,
//!   validation engine, consensus rounds, topology, route table and
//!   congestion controller. Nothing is shared, so nothing is locked.
//! - [`NodeHandle`] talks to the task over a command mailbox; answers come
//!   back on oneshot channels.
//! - Inbound traffic arrives as [`TransportEvent`]s and is dispatched by
//!   topic.
//! - Maintenance (adaptation, health check, route cleanup, expiry sweep,
//!   congestion window) runs on interval ticks inside the same loop.
//! - Observers subscribe to a broadcast stream of [`NodeEvent`]s.

use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use std::time::Instant;

use agora_consensus::{
    cast_vote, ConsensusError, ConsensusManager, ConsensusStats, Decision, Outcome, SignedVote,
    Verdict,
};
use agora_fact::{
    now_millis, verify_peer_id, FactId, FactIndex, KeyLookup, Keypair, Keyring, PeerId, Relation,
    Signer, Triplet,
};
use agora_router::{Hop, Router, RouterStats};
use agora_topology::{
    Adaptation, Admission, ClusterSummary, CongestionController, CongestionStats, DeferredQueue,
    Topology, TopologyError, TopologyState,
};
use agora_validation::{
    RuleContext, Stage, ValidationContext, ValidationEngine, ValidationError, ValidationStats,
};
use ed25519_dalek::VerifyingKey;
use serde_json::Value;
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::time::{self, Interval, MissedTickBehavior};
use tracing::{debug, info, trace, warn};

use crate::config::NodeConfig;
use crate::envelope::{Envelope, LinkState, Routed, SyncBatch, Topic, TopologyUpdate};
use crate::error::{Error, Result};
use crate::network::{MeshNetwork, NetworkStats};
use crate::transport::{PeerTransport, TransportEvent, TransportEvents};

/// A business rule installed at runtime.
pub type Rule =
    Box<dyn Fn(&Triplet, &RuleContext<'_>) -> std::result::Result<(), String> + Send + Sync>;

/// How a fact reached this node.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FactSource {
    Local,
    /// Published by its creator.
    Peer(PeerId),
    /// Relayed by a peer on the creator's behalf.
    Relayed(PeerId),
}

impl FactSource {
    fn sender(&self) -> Option<&PeerId> {
        match self {
            FactSource::Local => None,
            FactSource::Peer(peer) | FactSource::Relayed(peer) => Some(peer),
        }
    }
}

impl std::fmt::Display for FactSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FactSource::Local => f.write_str("local"),
            FactSource::Peer(peer) => write!(f, "peer {peer}"),
            FactSource::Relayed(peer) => write!(f, "relay {peer}"),
        }
    }
}

/// Things observers may want to know about.
#[derive(Debug, Clone)]
pub enum NodeEvent {
    PeerConnected(PeerId),
    PeerDisconnected(PeerId),
    FactAccepted {
        fact_id: FactId,
        relation: Relation,
        source: FactSource,
    },
    FactRejected {
        /// Absent when the fact could not even be decoded.
        fact_id: Option<FactId>,
        stage: Stage,
        reason: String,
        source: FactSource,
    },
    FactExpired(FactId),
    VoteCast {
        fact_id: FactId,
        requester: PeerId,
        valid: bool,
    },
    ConsensusResolved {
        fact_id: FactId,
        outcome: Outcome,
        positive: usize,
        total: usize,
    },
    TopologyTransition {
        from: TopologyState,
        to: TopologyState,
        load: f64,
    },
    /// A routed message addressed to this node arrived.
    Delivered {
        origin: PeerId,
        topic: Topic,
        data: Value,
    },
    RoutingFailed {
        destination: PeerId,
        reason: String,
    },
}

/// Point-in-time counters.
#[derive(Debug, Clone)]
pub struct NodeStats {
    pub peer_id: PeerId,
    pub connected_peers: usize,
    pub known_peers: usize,
    pub facts: usize,
    pub validation: ValidationStats,
    pub consensus: ConsensusStats,
    pub pending_consensus: usize,
    pub topology_state: TopologyState,
    pub clusters: usize,
    pub cluster_links: usize,
    /// Isolated clusters relinked by health checks.
    pub repaired_clusters: u64,
    pub network_load: f64,
    pub remote_clusters: usize,
    pub router: RouterStats,
    pub cached_routes: usize,
    pub congestion: CongestionStats,
    pub deferred: usize,
    pub network: NetworkStats,
}

enum Command {
    Submit {
        fact: Triplet,
        reply: oneshot::Sender<Result<Triplet>>,
    },
    RequestConsensus {
        fact_id: FactId,
        reply: oneshot::Sender<Result<Decision>>,
    },
    ConsensusTimeout(FactId),
    SendTo {
        peer: PeerId,
        topic: Topic,
        data: Value,
        reply: oneshot::Sender<Result<usize>>,
    },
    Broadcast {
        topic: Topic,
        data: Value,
        reply: oneshot::Sender<Result<usize>>,
    },
    Connect {
        peer: PeerId,
        reply: oneshot::Sender<Result<()>>,
    },
    Disconnect {
        peer: PeerId,
        reply: oneshot::Sender<Result<()>>,
    },
    Fact {
        fact_id: FactId,
        reply: oneshot::Sender<Option<Triplet>>,
    },
    Facts {
        relation: Option<Relation>,
        reply: oneshot::Sender<Vec<Triplet>>,
    },
    Stats {
        reply: oneshot::Sender<NodeStats>,
    },
    Revoke {
        peer: PeerId,
        reply: oneshot::Sender<()>,
    },
    Reinstate {
        peer: PeerId,
        reply: oneshot::Sender<bool>,
    },
    AddRule {
        id: String,
        rule: Rule,
        reply: oneshot::Sender<()>,
    },
    RemoveRule {
        id: String,
        reply: oneshot::Sender<bool>,
    },
    Adapt {
        reply: oneshot::Sender<Adaptation>,
    },
    Shutdown {
        reply: oneshot::Sender<()>,
    },
}

/// A routed or relayed message waiting for congestion capacity.
#[derive(Debug)]
struct Outbound {
    next: PeerId,
    envelope: Envelope,
    /// Sent by this node; the stamped budget is not ours to spend.
    originated: bool,
}

/// Cloneable handle to a running node.
#[derive(Debug, Clone)]
pub struct NodeHandle {
    peer_id: PeerId,
    commands: mpsc::Sender<Command>,
    events: broadcast::Sender<NodeEvent>,
}

impl std::fmt::Debug for Command {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Command::Submit { .. } => "Submit",
            Command::RequestConsensus { .. } => "RequestConsensus",
            Command::ConsensusTimeout(_) => "ConsensusTimeout",
            Command::SendTo { .. } => "SendTo",
            Command::Broadcast { .. } => "Broadcast",
            Command::Connect { .. } => "Connect",
            Command::Disconnect { .. } => "Disconnect",
            Command::Fact { .. } => "Fact",
            Command::Facts { .. } => "Facts",
            Command::Stats { .. } => "Stats",
            Command::Revoke { .. } => "Revoke",
            Command::Reinstate { .. } => "Reinstate",
            Command::AddRule { .. } => "AddRule",
            Command::RemoveRule { .. } => "RemoveRule",
            Command::Adapt { .. } => "Adapt",
            Command::Shutdown { .. } => "Shutdown",
        };
        f.write_str(name)
    }
}

impl NodeHandle {
    pub fn peer_id(&self) -> &PeerId {
        &self.peer_id
    }

    pub fn subscribe(&self) -> broadcast::Receiver<NodeEvent> {
        self.events.subscribe()
    }

    async fn call<T>(&self, make: impl FnOnce(oneshot::Sender<T>) -> Command) -> Result<T> {
        let (reply, answer) = oneshot::channel();
        self.commands.send(make(reply)).await?;
        Ok(answer.await?)
    }

    /// Validate, sign and publish a locally created fact.
    pub async fn submit(&self, fact: Triplet) -> Result<Triplet> {
        self.call(|reply| Command::Submit { fact, reply }).await?
    }

    /// Put an indexed committed fact to a vote and wait for the outcome.
    ///
    /// A round that times out with no votes at all is an
    /// [`ConsensusError::Timeout`]; every other outcome is returned.
    pub async fn request_consensus(&self, fact_id: FactId) -> Result<Decision> {
        self.call(|reply| Command::RequestConsensus { fact_id, reply })
            .await?
    }

    /// Send to any reachable peer, routing through the mesh when it is not
    /// a direct connection. Returns the hop count of the chosen path.
    ///
    /// Delivery is best-effort: `Ok` means the first hop accepted the
    /// message. A failure further along shows up as
    /// [`NodeEvent::RoutingFailed`] on the node where it happened.
    pub async fn send_to(&self, peer: PeerId, topic: Topic, data: Value) -> Result<usize> {
        self.call(|reply| Command::SendTo {
            peer,
            topic,
            data,
            reply,
        })
        .await?
    }

    /// Fan out to every connected peer. Returns how many sends succeeded.
    pub async fn broadcast(&self, topic: Topic, data: Value) -> Result<usize> {
        self.call(|reply| Command::Broadcast { topic, data, reply })
            .await?
    }

    pub async fn connect(&self, peer: PeerId) -> Result<()> {
        self.call(|reply| Command::Connect { peer, reply }).await?
    }

    pub async fn disconnect(&self, peer: PeerId) -> Result<()> {
        self.call(|reply| Command::Disconnect { peer, reply }).await?
    }

    pub async fn fact(&self, fact_id: FactId) -> Result<Option<Triplet>> {
        self.call(|reply| Command::Fact { fact_id, reply }).await
    }

    /// Indexed facts, optionally of one relation.
    pub async fn facts(&self, relation: Option<Relation>) -> Result<Vec<Triplet>> {
        self.call(|reply| Command::Facts { relation, reply }).await
    }

    pub async fn stats(&self) -> Result<NodeStats> {
        self.call(|reply| Command::Stats { reply }).await
    }

    pub async fn revoke(&self, peer: PeerId) -> Result<()> {
        self.call(|reply| Command::Revoke { peer, reply }).await
    }

    pub async fn reinstate(&self, peer: PeerId) -> Result<bool> {
        self.call(|reply| Command::Reinstate { peer, reply }).await
    }

    pub async fn add_rule<F>(&self, id: impl Into<String>, rule: F) -> Result<()>
    where
        F: Fn(&Triplet, &RuleContext<'_>) -> std::result::Result<(), String>
            + Send
            + Sync
            + 'static,
    {
        let id = id.into();
        let rule: Rule = Box::new(rule);
        self.call(|reply| Command::AddRule { id, rule, reply }).await
    }

    pub async fn remove_rule(&self, id: impl Into<String>) -> Result<bool> {
        let id = id.into();
        self.call(|reply| Command::RemoveRule { id, reply }).await
    }

    /// Run one adaptation cycle now instead of waiting for the tick.
    pub async fn adapt(&self) -> Result<Adaptation> {
        self.call(|reply| Command::Adapt { reply }).await
    }

    pub async fn shutdown(&self) -> Result<()> {
        self.call(|reply| Command::Shutdown { reply }).await
    }
}

/// Actor state. Built by [`Node::spawn`], owned by its task.
pub struct Node {
    local: PeerId,
    identity: Arc<Keypair>,
    config: NodeConfig,
    engine: ValidationEngine,
    keys: Keyring,
    index: FactIndex,
    consensus: ConsensusManager,
    waiters: HashMap<FactId, Vec<oneshot::Sender<Result<Decision>>>>,
    topology: Topology,
    router: Router,
    congestion: CongestionController,
    deferred: DeferredQueue<Outbound>,
    network: MeshNetwork,
    link_seq: u64,
    link_states: HashMap<PeerId, (LinkState, Instant)>,
    learned_links: BTreeSet<(PeerId, PeerId)>,
    remote_clusters: HashMap<PeerId, Vec<ClusterSummary>>,
    repaired_clusters: u64,
    events: broadcast::Sender<NodeEvent>,
    mailbox: mpsc::WeakSender<Command>,
}

fn now() -> Instant {
    time::Instant::now().into_std()
}

fn ticker(period: std::time::Duration) -> Interval {
    let mut interval = time::interval_at(time::Instant::now() + period, period);
    interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
    interval
}

fn ordered(a: PeerId, b: PeerId) -> (PeerId, PeerId) {
    if a <= b {
        (a, b)
    } else {
        (b, a)
    }
}

fn expected_relation(topic: Topic) -> Option<Relation> {
    match topic {
        Topic::Need => Some(Relation::Needs),
        Topic::Has => Some(Relation::Has),
        _ => None,
    }
}

fn publish_topic(relation: Relation) -> Topic {
    match relation {
        Relation::Needs => Topic::Need,
        Relation::Has => Topic::Has,
        Relation::Committed => Topic::Triplet,
    }
}

impl Node {
    /// Start a node on the current tokio runtime.
    pub fn spawn(
        config: NodeConfig,
        identity: Keypair,
        transport: Arc<dyn PeerTransport>,
        inbound: TransportEvents,
    ) -> NodeHandle {
        let identity = Arc::new(identity);
        let local = identity.peer_id().clone();
        if *transport.local_peer() != local {
            warn!(
                identity = %local,
                transport = %transport.local_peer(),
                "transport bound to a different peer id"
            );
        }

        let (commands, mailbox) = mpsc::channel(config.mailbox_capacity);
        let (events, _) = broadcast::channel(config.event_capacity);

        let mut topology = Topology::new(config.topology.clone());
        if let Err(e) = topology.integrate_peer(local.clone(), &[]) {
            warn!(error = %e, "could not place local peer");
        }
        let mut router = Router::new(local.clone(), config.router.clone());
        router.update_topology(&topology);

        let node = Node {
            local: local.clone(),
            engine: ValidationEngine::new(config.validation.clone(), identity.clone()),
            identity,
            keys: Keyring::new(),
            index: FactIndex::new(),
            consensus: ConsensusManager::new(config.quorum.clone()),
            waiters: HashMap::new(),
            topology,
            router,
            congestion: CongestionController::new(config.congestion.clone()),
            deferred: DeferredQueue::new(config.congestion.queue_limit),
            network: MeshNetwork::new(transport),
            link_seq: 0,
            link_states: HashMap::new(),
            learned_links: BTreeSet::new(),
            remote_clusters: HashMap::new(),
            repaired_clusters: 0,
            events: events.clone(),
            mailbox: commands.downgrade(),
            config,
        };
        tokio::spawn(node.run(mailbox, inbound));

        NodeHandle {
            peer_id: local,
            commands,
            events,
        }
    }

    async fn run(mut self, mut commands: mpsc::Receiver<Command>, mut inbound: TransportEvents) {
        let intervals = self.config.intervals.clone();
        let mut adapt = ticker(intervals.adaptation);
        let mut health = ticker(intervals.health_check);
        let mut cleanup = ticker(intervals.route_cleanup);
        let mut sweep = ticker(intervals.expiry_sweep);
        let mut window = ticker(intervals.congestion_window);

        info!(peer = %self.local, "node started");
        loop {
            tokio::select! {
                command = commands.recv() => match command {
                    Some(Command::Shutdown { reply }) => {
                        let _ = reply.send(());
                        break;
                    }
                    Some(command) => self.handle_command(command),
                    None => break,
                },
                Some(event) = inbound.recv() => self.handle_transport(event),
                _ = adapt.tick() => {
                    self.on_adapt();
                }
                _ = health.tick() => self.on_health_check(),
                _ = cleanup.tick() => self.on_route_cleanup(),
                _ = sweep.tick() => self.on_expiry_sweep(),
                _ = window.tick() => self.on_window(),
            }
        }
        info!(peer = %self.local, facts = self.index.len(), "node stopped");
    }

    fn emit(&self, event: NodeEvent) {
        // No subscribers is fine.
        let _ = self.events.send(event);
    }

    fn handle_command(&mut self, command: Command) {
        trace!(command = ?command, "command");
        match command {
            Command::Submit { fact, reply } => {
                let _ = reply.send(self.submit(fact));
            }
            Command::RequestConsensus { fact_id, reply } => self.request_consensus(fact_id, reply),
            Command::ConsensusTimeout(fact_id) => self.on_consensus_timeout(&fact_id),
            Command::SendTo {
                peer,
                topic,
                data,
                reply,
            } => {
                let _ = reply.send(self.send_to(&peer, topic, data));
            }
            Command::Broadcast { topic, data, reply } => {
                let open_n = self.congestion.outgoing_open_n();
                let _ = reply.send(self.network.broadcast(topic, data, open_n));
            }
            Command::Connect { peer, reply } => {
                let _ = reply.send(self.network.transport().connect(&peer));
            }
            Command::Disconnect { peer, reply } => {
                let _ = reply.send(self.network.transport().disconnect(&peer));
            }
            Command::Fact { fact_id, reply } => {
                let _ = reply.send(self.index.get(&fact_id).cloned());
            }
            Command::Facts { relation, reply } => {
                let facts = match relation {
                    Some(relation) => self.index.by_relation(relation).cloned().collect(),
                    None => self.index.iter().cloned().collect(),
                };
                let _ = reply.send(facts);
            }
            Command::Stats { reply } => {
                let _ = reply.send(self.stats());
            }
            Command::Revoke { peer, reply } => {
                self.engine.revoke(peer);
                let _ = reply.send(());
            }
            Command::Reinstate { peer, reply } => {
                let _ = reply.send(self.engine.reinstate(&peer));
            }
            Command::AddRule { id, rule, reply } => {
                self.engine.add_rule(id, rule);
                let _ = reply.send(());
            }
            Command::RemoveRule { id, reply } => {
                let _ = reply.send(self.engine.remove_rule(&id));
            }
            Command::Adapt { reply } => {
                let _ = reply.send(self.on_adapt());
            }
            Command::Shutdown { reply } => {
                let _ = reply.send(());
            }
        }
    }

    fn stats(&self) -> NodeStats {
        NodeStats {
            peer_id: self.local.clone(),
            connected_peers: self.network.peer_count(),
            known_peers: self.topology.peer_count(),
            facts: self.index.len(),
            validation: self.engine.stats().clone(),
            consensus: self.consensus.stats(),
            pending_consensus: self.consensus.pending_count(),
            topology_state: self.topology.state(),
            clusters: self.topology.cluster_count(),
            cluster_links: self.topology.link_count(),
            repaired_clusters: self.repaired_clusters,
            network_load: self.topology.network_load(),
            remote_clusters: self.remote_clusters.values().map(Vec::len).sum(),
            router: self.router.stats(),
            cached_routes: self.router.table().len(),
            congestion: self.congestion.stats(),
            deferred: self.deferred.len(),
            network: self.network.stats(),
        }
    }

    // ---- facts ----

    fn validate(
        &mut self,
        mut fact: Triplet,
        source: &FactSource,
    ) -> std::result::Result<Triplet, ValidationError> {
        let ctx = ValidationContext {
            index: &self.index,
            keys: &self.keys,
            now: now_millis(),
        };
        match source {
            FactSource::Local => self.engine.validate(&mut fact, &ctx),
            FactSource::Peer(sender) => self.engine.validate_from_peer(&mut fact, sender, &ctx),
            FactSource::Relayed(relay) => self.engine.validate_relayed(&mut fact, relay, &ctx),
        }?;
        Ok(fact)
    }

    fn submit(&mut self, fact: Triplet) -> Result<Triplet> {
        let fact_id = fact.id.clone();
        let fact = match self.validate(fact, &FactSource::Local) {
            Ok(fact) => fact,
            Err(e) => {
                self.emit(NodeEvent::FactRejected {
                    fact_id: Some(fact_id),
                    stage: e.stage(),
                    reason: e.to_string(),
                    source: FactSource::Local,
                });
                return Err(e.into());
            }
        };

        let data = serde_json::to_value(&fact)?;
        self.index.insert(fact.clone());
        self.emit(NodeEvent::FactAccepted {
            fact_id: fact.id.clone(),
            relation: fact.relation,
            source: FactSource::Local,
        });

        let open_n = self.congestion.outgoing_open_n();
        let published = self
            .network
            .broadcast(publish_topic(fact.relation), data, open_n)?;
        info!(fact_id = %fact.id, relation = %fact.relation, published, "fact submitted");
        Ok(fact)
    }

    /// Decode, validate and index a fact from the wire. Newly accepted facts
    /// are relayed onward carrying the budget `open_n` they arrived with.
    /// Returns whether the fact was new and accepted.
    fn receive_fact(
        &mut self,
        raw: Value,
        source: FactSource,
        expected: Option<Relation>,
        open_n: u8,
    ) -> bool {
        let mut fact = match Triplet::from_wire(raw) {
            Ok(fact) => fact,
            Err(e) => {
                warn!(source = %source, error = %e, "undecodable fact");
                self.emit(NodeEvent::FactRejected {
                    fact_id: None,
                    stage: Stage::Structural,
                    reason: e.to_string(),
                    source,
                });
                return false;
            }
        };
        if self
            .index
            .get(&fact.id)
            .is_some_and(|known| known.hash == fact.hash)
        {
            trace!(fact_id = %fact.id, "fact already known");
            return false;
        }
        // Local flags are earned here, never taken from the wire.
        fact.validated = false;
        fact.consensus = false;

        let fact_id = fact.id.clone();
        if let Some(expected) = expected.filter(|r| *r != fact.relation) {
            let reason = format!("topic carries {expected} facts, got {}", fact.relation);
            debug!(fact_id = %fact_id, source = %source, reason = %reason, "fact rejected");
            self.emit(NodeEvent::FactRejected {
                fact_id: Some(fact_id),
                stage: Stage::Structural,
                reason,
                source,
            });
            return false;
        }

        match self.validate(fact, &source) {
            Ok(fact) => {
                let skip: Vec<PeerId> = source
                    .sender()
                    .into_iter()
                    .chain(std::iter::once(&fact.creator))
                    .cloned()
                    .collect();
                self.relay(&fact, &skip, open_n);
                self.emit(NodeEvent::FactAccepted {
                    fact_id: fact.id.clone(),
                    relation: fact.relation,
                    source,
                });
                self.index.insert(fact);
                true
            }
            Err(e) => {
                if e.implicates_sender() {
                    warn!(fact_id = %fact_id, source = %source, error = %e, "peer flagged");
                }
                self.emit(NodeEvent::FactRejected {
                    fact_id: Some(fact_id),
                    stage: e.stage(),
                    reason: e.to_string(),
                    source,
                });
                false
            }
        }
    }

    fn key_hex(&self, peer: &PeerId) -> Option<String> {
        let key = if *peer == self.local {
            self.identity.public_key()
        } else {
            self.keys.public_key(peer)?
        };
        Some(hex::encode(key.to_bytes()))
    }

    /// Register a key offered for `peer` if it hashes to that peer id.
    fn learn_key(&mut self, peer: &PeerId, key_hex: &str) {
        if *peer == self.local || self.keys.contains(peer) {
            return;
        }
        let key = hex::decode(key_hex)
            .ok()
            .and_then(|bytes| <[u8; 32]>::try_from(bytes.as_slice()).ok())
            .and_then(|bytes| VerifyingKey::from_bytes(&bytes).ok());
        match key {
            Some(key) if verify_peer_id(peer, &key) => {
                trace!(peer = %peer, "learned key");
                self.keys.insert(peer.clone(), key);
            }
            _ => warn!(peer = %peer, "offered key does not match peer id"),
        }
    }

    fn sync_batch<'a>(&self, facts: impl IntoIterator<Item = &'a Triplet>) -> SyncBatch {
        let mut batch = SyncBatch::default();
        for fact in facts {
            match serde_json::to_value(fact) {
                Ok(raw) => batch.facts.push(raw),
                Err(e) => {
                    warn!(fact_id = %fact.id, error = %e, "fact not encodable");
                    continue;
                }
            }
            if let Some(key) = self.key_hex(&fact.creator) {
                batch.keys.insert(fact.creator.clone(), key);
            }
        }
        batch
    }

    fn relay(&mut self, fact: &Triplet, skip: &[PeerId], open_n: u8) {
        let batch = self.sync_batch(std::iter::once(fact));
        match serde_json::to_value(&batch) {
            Ok(data) => {
                let relayed = self.fan_out(Topic::OverlaySync, data, open_n, skip);
                trace!(fact_id = %fact.id, relayed, "fact relayed");
            }
            Err(e) => warn!(fact_id = %fact.id, error = %e, "relay failed"),
        }
    }

    /// Forward a message on behalf of others to every connection except
    /// `skip`. Each copy goes through congestion admission with the budget
    /// the original arrived with. Returns how many copies were admitted.
    fn fan_out(&mut self, topic: Topic, data: Value, open_n: u8, skip: &[PeerId]) -> usize {
        let envelope = self.network.envelope(topic, data).with_open_n(open_n);
        let targets: Vec<PeerId> = self
            .network
            .peers()
            .filter(|p| !skip.contains(*p))
            .cloned()
            .collect();
        let mut admitted = 0;
        for next in targets {
            let outbound = Outbound {
                next,
                envelope: envelope.clone(),
                originated: false,
            };
            match self.dispatch(outbound, 0) {
                Ok(()) => admitted += 1,
                Err(e) => debug!(topic = %topic, error = %e, "relay not sent"),
            }
        }
        admitted
    }

    /// Validated facts for a newly connected peer, offers and requests
    /// before the agreements that reference them.
    fn send_snapshot(&mut self, peer: &PeerId) {
        let mut facts: Vec<&Triplet> = self.index.validated().collect();
        if facts.is_empty() {
            return;
        }
        facts.sort_by(|a, b| {
            a.relation
                .cmp(&b.relation)
                .then(a.timestamp.cmp(&b.timestamp))
        });
        let count = facts.len();
        let batch = self.sync_batch(facts);
        let sent = serde_json::to_value(&batch)
            .map_err(Error::from)
            .and_then(|data| self.network.send_to_peer(peer, Topic::OverlaySync, data));
        match sent {
            Ok(()) => debug!(peer = %peer, facts = count, "overlay snapshot sent"),
            Err(e) => warn!(peer = %peer, error = %e, "overlay snapshot failed"),
        }
    }

    fn on_overlay_sync(&mut self, from: &PeerId, data: Value, open_n: u8) {
        let batch: SyncBatch = match serde_json::from_value(data) {
            Ok(batch) => batch,
            Err(e) => {
                warn!(peer = %from, error = %e, "bad overlay batch");
                return;
            }
        };
        for (peer, key) in &batch.keys {
            self.learn_key(peer, key);
        }
        let total = batch.facts.len();
        let accepted = batch
            .facts
            .into_iter()
            .map(|raw| {
                self.receive_fact(raw, FactSource::Relayed(from.clone()), None, open_n)
            })
            .filter(|accepted| *accepted)
            .count();
        debug!(peer = %from, total, accepted, "overlay sync");
    }

    fn on_expiry_sweep(&mut self) {
        let expired = self.index.sweep_expired(now_millis());
        if expired.is_empty() {
            return;
        }
        info!(expired = expired.len(), remaining = self.index.len(), "expired facts swept");
        for fact_id in expired {
            self.emit(NodeEvent::FactExpired(fact_id));
        }
    }

    // ---- consensus ----

    fn request_consensus(&mut self, fact_id: FactId, reply: oneshot::Sender<Result<Decision>>) {
        let Some(fact) = self.index.get(&fact_id).cloned() else {
            let _ = reply.send(Err(Error::UnknownFact(fact_id.to_string())));
            return;
        };
        let data = match serde_json::to_value(&fact) {
            Ok(data) => data,
            Err(e) => {
                let _ = reply.send(Err(e.into()));
                return;
            }
        };
        let deadline = match self.consensus.request_consensus(fact, now()) {
            Ok(deadline) => deadline,
            Err(e) => {
                let _ = reply.send(Err(e.into()));
                return;
            }
        };
        self.waiters.entry(fact_id.clone()).or_default().push(reply);

        match self.network.broadcast(Topic::ConsensusRequest, data, 0) {
            Ok(asked) => info!(fact_id = %fact_id, asked, "vote requested"),
            Err(e) => warn!(fact_id = %fact_id, error = %e, "vote request not sent"),
        }
        self.schedule_timeout(fact_id, deadline);
    }

    fn schedule_timeout(&self, fact_id: FactId, deadline: Instant) {
        let mailbox = self.mailbox.clone();
        tokio::spawn(async move {
            time::sleep_until(time::Instant::from_std(deadline)).await;
            if let Some(commands) = mailbox.upgrade() {
                let _ = commands.send(Command::ConsensusTimeout(fact_id)).await;
            }
        });
    }

    fn on_consensus_timeout(&mut self, fact_id: &FactId) {
        match self.consensus.resolve_timeout(fact_id) {
            Ok(decision) => self.conclude(decision),
            // Already decided by votes.
            Err(ConsensusError::UnknownRound(_)) => {}
            Err(e) => warn!(fact_id = %fact_id, error = %e, "timeout resolution failed"),
        }
    }

    fn conclude(&mut self, decision: Decision) {
        let fact_id = decision.fact.id.clone();
        if decision.is_accepted() {
            match self.index.get_mut(&fact_id) {
                Some(fact) => fact.consensus = true,
                None => {
                    self.index.insert(decision.fact.clone());
                }
            }
        }
        self.emit(NodeEvent::ConsensusResolved {
            fact_id: fact_id.clone(),
            outcome: decision.outcome,
            positive: decision.positive,
            total: decision.total,
        });
        for waiter in self.waiters.remove(&fact_id).unwrap_or_default() {
            let answer = if decision.outcome == Outcome::Timeout {
                Err(Error::Consensus(ConsensusError::Timeout(fact_id.clone())))
            } else {
                Ok(decision.clone())
            };
            let _ = waiter.send(answer);
        }
    }

    /// Review a committed fact for `requester` and answer with a signed vote.
    fn on_consensus_request(&mut self, requester: &PeerId, data: Value) {
        let mut fact = match Triplet::from_wire(data) {
            Ok(fact) => fact,
            Err(e) => {
                warn!(peer = %requester, error = %e, "undecodable vote request");
                return;
            }
        };
        fact.validated = false;
        fact.consensus = false;
        let fact_id = fact.id.clone();

        let verdict = if fact.relation != Relation::Committed {
            Verdict::reject(format!("{} facts are not put to a vote", fact.relation))
        } else {
            let source = if fact.creator == *requester {
                FactSource::Peer(requester.clone())
            } else {
                FactSource::Relayed(requester.clone())
            };
            match self.validate(fact, &source) {
                Ok(fact) => {
                    if !self.index.contains(&fact.id) {
                        self.index.insert(fact);
                    }
                    Verdict::accept()
                }
                Err(e) => Verdict::reject(e.to_string()),
            }
        };

        let valid = verdict.valid;
        let vote = match cast_vote(fact_id.clone(), verdict, self.identity.as_ref()) {
            Ok(vote) => vote,
            Err(e) => {
                warn!(fact_id = %fact_id, error = %e, "could not sign vote");
                return;
            }
        };
        let sent = serde_json::to_value(&vote)
            .map_err(Error::from)
            .and_then(|data| self.send_to(requester, Topic::ConsensusVote, data));
        match sent {
            Ok(hops) => debug!(fact_id = %fact_id, valid, hops, "vote cast"),
            Err(e) => warn!(fact_id = %fact_id, error = %e, "vote not delivered"),
        }
        self.emit(NodeEvent::VoteCast {
            fact_id,
            requester: requester.clone(),
            valid,
        });
    }

    fn on_vote(&mut self, from: &PeerId, data: Value) {
        let vote: SignedVote = match serde_json::from_value(data) {
            Ok(vote) => vote,
            Err(e) => {
                warn!(peer = %from, error = %e, "undecodable vote");
                return;
            }
        };
        match self.consensus.handle_vote(&vote, &self.keys) {
            Ok(Some(decision)) => self.conclude(decision),
            Ok(None) => {}
            Err(e) => debug!(peer = %from, fact_id = %vote.fact_id, error = %e, "vote ignored"),
        }
    }

    // ---- routing ----

    fn routing_failed(&self, destination: PeerId, reason: String) {
        warn!(destination = %destination, reason = %reason, "routing failure");
        self.emit(NodeEvent::RoutingFailed {
            destination,
            reason,
        });
    }

    fn send_to(&mut self, peer: &PeerId, topic: Topic, data: Value) -> Result<usize> {
        let header = self.router.route(peer, now())?;
        let hops = header.total_hops;
        if hops == 1 {
            self.network.send_to_peer(peer, topic, data)?;
            return Ok(hops);
        }

        let routed = Routed {
            topic,
            data,
            origin_key: self.key_hex(&self.local),
        };
        let next = header
            .current()
            .cloned()
            .ok_or_else(|| Error::NotConnected(peer.clone()))?;
        let envelope = self
            .network
            .envelope(Topic::RouteForward, serde_json::to_value(&routed)?)
            .with_open_n(self.congestion.outgoing_open_n())
            .with_route(header);
        self.dispatch(
            Outbound {
                next,
                envelope,
                originated: true,
            },
            0,
        )?;
        Ok(hops)
    }

    /// Push a routed message through congestion admission.
    fn dispatch(&mut self, mut outbound: Outbound, attempt: u32) -> Result<()> {
        match self.congestion.admit(outbound.envelope.open_n, attempt) {
            Admission::Forward { open_n } => {
                if !outbound.originated {
                    outbound.envelope.open_n = open_n;
                }
                self.network
                    .send_envelope(&outbound.next, &outbound.envelope)
            }
            Admission::Queue { retry_in } => {
                trace!(next = %outbound.next, attempt, ?retry_in, "message deferred");
                match self.deferred.push(outbound, attempt + 1, now() + retry_in) {
                    None => Ok(()),
                    Some(rejected) => Err(Error::Transport {
                        peer: rejected.next,
                        reason: "deferred queue full".into(),
                    }),
                }
            }
            Admission::Drop => Err(Error::Transport {
                peer: outbound.next,
                reason: "dropped by congestion control".into(),
            }),
        }
    }

    fn on_route_forward(&mut self, envelope: Envelope) {
        let Some(header) = envelope.route.clone() else {
            warn!(sender = %envelope.sender, "route:forward without a route header");
            return;
        };
        let destination = header.destination.clone();
        let origin = header.origin().cloned();

        match self.router.forward(header) {
            Ok(Hop::Deliver) => match origin {
                Some(origin) => self.deliver(origin, envelope.data, envelope.open_n),
                None => warn!("routed message with an empty path"),
            },
            Ok(Hop::Forward { next, header }) => {
                let mut envelope = envelope;
                envelope.route = Some(header);
                envelope.sender = self.local.clone();
                let outbound = Outbound {
                    next,
                    envelope,
                    originated: false,
                };
                if let Err(e) = self.dispatch(outbound, 0) {
                    self.routing_failed(destination, e.to_string());
                }
            }
            Err(e) => self.routing_failed(destination, e.to_string()),
        }
    }

    /// Hand a routed payload up, stripped of its routing metadata.
    fn deliver(&mut self, origin: PeerId, data: Value, open_n: u8) {
        let routed: Routed = match serde_json::from_value(data) {
            Ok(routed) => routed,
            Err(e) => {
                warn!(origin = %origin, error = %e, "bad routed payload");
                return;
            }
        };
        if let Some(key) = &routed.origin_key {
            self.learn_key(&origin, key);
        }
        debug!(origin = %origin, topic = %routed.topic, "routed message delivered");
        self.emit(NodeEvent::Delivered {
            origin: origin.clone(),
            topic: routed.topic,
            data: routed.data.clone(),
        });
        match routed.topic {
            topic if topic.is_fact() => {
                let expected = expected_relation(topic);
                self.receive_fact(routed.data, FactSource::Peer(origin), expected, open_n);
            }
            Topic::ConsensusRequest => self.on_consensus_request(&origin, routed.data),
            Topic::ConsensusVote => self.on_vote(&origin, routed.data),
            // Mesh maintenance travels hop by hop, never routed.
            _ => {}
        }
    }

    fn on_route_cleanup(&mut self) {
        let now = now();
        let purged = self.router.purge_stale(now);
        self.router.update_topology(&self.topology);
        let added = self.router.refresh(now);
        debug!(purged, added, cached = self.router.table().len(), "route cache maintained");
    }

    fn on_window(&mut self) {
        self.congestion.roll_window();
        for deferred in self.deferred.take_ready(now()) {
            let destination = deferred
                .item
                .envelope
                .route
                .as_ref()
                .map(|r| r.destination.clone());
            let topic = deferred.item.envelope.topic;
            match (self.dispatch(deferred.item, deferred.attempt), destination) {
                (Ok(()), _) => {}
                (Err(e), Some(destination)) => self.routing_failed(destination, e.to_string()),
                (Err(e), None) => debug!(topic = %topic, error = %e, "relay given up"),
            }
        }
    }

    // ---- topology ----

    fn on_adapt(&mut self) -> Adaptation {
        let adaptation = self.topology.adapt();
        if adaptation.transitioned() {
            info!(
                from = %adaptation.from,
                to = %adaptation.to,
                load = adaptation.load,
                added = adaptation.added,
                removed = adaptation.removed,
                "topology transition"
            );
            self.emit(NodeEvent::TopologyTransition {
                from: adaptation.from,
                to: adaptation.to,
                load: adaptation.load,
            });
        }

        // Periodic reissue keeps our state alive in remote views.
        self.link_seq += 1;
        let ttl = self.config.intervals.link_state_ttl;
        let now = now();
        let before = self.link_states.len();
        self.link_states
            .retain(|_, (_, received)| now.saturating_duration_since(*received) <= ttl);
        if self.link_states.len() != before {
            self.apply_link_states();
        } else {
            self.router.update_topology(&self.topology);
        }
        self.broadcast_topology();
        adaptation
    }

    fn on_health_check(&mut self) {
        let repaired = self.topology.health_check();
        if !repaired.is_empty() {
            info!(repaired = repaired.len(), "isolated clusters reconnected");
            self.repaired_clusters += repaired.len() as u64;
        }
        self.open_cluster_links();
    }

    /// Back the inter-cluster links of a cluster we center with transport
    /// connections to the other centers.
    fn open_cluster_links(&mut self) {
        let Some(own) = self.topology.cluster_of(&self.local) else {
            return;
        };
        if self.topology.cluster(own).map(|c| c.center()) != Some(&self.local) {
            return;
        }
        let centers: Vec<PeerId> = self
            .topology
            .neighbors(own)
            .into_iter()
            .filter_map(|id| self.topology.cluster(id).map(|c| c.center().clone()))
            .filter(|center| *center != self.local && !self.network.is_connected(center))
            .collect();
        for center in centers {
            match self.network.transport().connect(&center) {
                Ok(()) => debug!(peer = %center, "linking neighboring cluster center"),
                Err(e) => debug!(peer = %center, error = %e, "cluster center unreachable"),
            }
        }
    }

    fn own_link_state(&self) -> LinkState {
        LinkState {
            peer: self.local.clone(),
            seq: self.link_seq,
            neighbors: self.network.peers().cloned().collect(),
        }
    }

    fn topology_update(&self) -> TopologyUpdate {
        let mut links = vec![self.own_link_state()];
        links.extend(self.link_states.values().map(|(state, _)| state.clone()));
        TopologyUpdate {
            clusters: self.topology.summaries(),
            links,
        }
    }

    /// Gossip our clusters and every link state we hold.
    fn broadcast_topology(&mut self) {
        if self.network.peer_count() == 0 {
            return;
        }
        let open_n = self.congestion.outgoing_open_n();
        let sent = serde_json::to_value(self.topology_update())
            .map_err(Error::from)
            .and_then(|data| self.network.broadcast(Topic::TopologyUpdate, data, open_n));
        if let Err(e) = sent {
            warn!(error = %e, "topology update not sent");
        }
    }

    /// Pass fresh link states on to everyone but `from`.
    fn relay_topology(&mut self, from: &PeerId, open_n: u8) {
        match serde_json::to_value(self.topology_update()) {
            Ok(data) => {
                self.fan_out(Topic::TopologyUpdate, data, open_n, std::slice::from_ref(from));
            }
            Err(e) => warn!(error = %e, "topology update not relayed"),
        }
    }

    fn on_topology_update(&mut self, from: &PeerId, data: Value, open_n: u8) {
        let update: TopologyUpdate = match serde_json::from_value(data) {
            Ok(update) => update,
            Err(e) => {
                warn!(peer = %from, error = %e, "bad topology update");
                return;
            }
        };
        self.remote_clusters.insert(from.clone(), update.clusters);

        let received = now();
        let mut changed = false;
        for state in update.links {
            if state.peer == self.local {
                continue;
            }
            let newer = self
                .link_states
                .get(&state.peer)
                .map_or(true, |(known, _)| state.seq > known.seq);
            if newer {
                self.link_states
                    .insert(state.peer.clone(), (state, received));
                changed = true;
            }
        }
        if changed {
            self.apply_link_states();
            self.relay_topology(from, open_n);
        }
    }

    /// Mirror gossiped links into the topology, placing newly discovered
    /// peers and forgetting ones nobody links to any more. A link counts
    /// only when both ends report it.
    fn apply_link_states(&mut self) {
        let reports = |peer: &PeerId, neighbor: &PeerId| {
            self.link_states
                .get(peer)
                .is_some_and(|(state, _)| state.neighbors.contains(neighbor))
        };
        let mut desired: BTreeSet<(PeerId, PeerId)> = BTreeSet::new();
        for (state, _) in self.link_states.values() {
            for neighbor in &state.neighbors {
                // Our own links come from the transport, not from gossip.
                if *neighbor == self.local || state.peer == *neighbor {
                    continue;
                }
                if reports(neighbor, &state.peer) {
                    desired.insert(ordered(state.peer.clone(), neighbor.clone()));
                }
            }
        }

        for (a, b) in self.learned_links.difference(&desired) {
            self.topology.remove_direct(a, b);
        }
        for (a, b) in desired.difference(&self.learned_links) {
            for (peer, via) in [(a, b), (b, a)] {
                if self.topology.contains_peer(peer) {
                    continue;
                }
                match self
                    .topology
                    .integrate_peer(peer.clone(), std::slice::from_ref(via))
                {
                    Ok(cluster) => debug!(peer = %peer, cluster = %cluster, "peer discovered"),
                    Err(e) => debug!(peer = %peer, error = %e, "discovered peer not placed"),
                }
            }
            self.topology.add_direct(a.clone(), b.clone());
        }

        let referenced: BTreeSet<&PeerId> = desired.iter().flat_map(|(a, b)| [a, b]).collect();
        let unreachable: Vec<PeerId> = self
            .topology
            .peers()
            .filter(|p| {
                **p != self.local && !self.network.is_connected(p) && !referenced.contains(p)
            })
            .cloned()
            .collect();
        for peer in unreachable {
            if let Err(e) = self.topology.remove_peer(&peer) {
                debug!(peer = %peer, error = %e, "forget failed");
            }
        }

        self.learned_links = desired;
        self.router.update_topology(&self.topology);
    }

    // ---- transport ----

    fn handle_transport(&mut self, event: TransportEvent) {
        match event {
            TransportEvent::Connected { peer, public_key } => {
                self.on_peer_connected(peer, public_key)
            }
            TransportEvent::Disconnected { peer } => self.on_peer_disconnected(&peer),
            TransportEvent::Message { from, bytes } => self.on_message(from, &bytes),
        }
    }

    fn on_peer_connected(&mut self, peer: PeerId, public_key: VerifyingKey) {
        if !verify_peer_id(&peer, &public_key) {
            warn!(peer = %peer, "handshake key does not match peer id");
            let _ = self.network.transport().disconnect(&peer);
            return;
        }
        self.keys.insert(peer.clone(), public_key);
        if !self.network.on_connect(peer.clone()) {
            return;
        }

        let known: Vec<PeerId> = self
            .network
            .peers()
            .filter(|p| **p != peer)
            .cloned()
            .collect();
        match self.topology.integrate_peer(peer.clone(), &known) {
            Ok(cluster) => debug!(peer = %peer, cluster = %cluster, "peer integrated"),
            Err(TopologyError::AlreadyIntegrated(_)) => {}
            Err(e) => warn!(peer = %peer, error = %e, "peer not integrated"),
        }
        self.topology.add_direct(self.local.clone(), peer.clone());
        self.router.peer_connected(peer.clone());
        self.router.update_topology(&self.topology);
        self.link_seq += 1;

        info!(peer = %peer, peers = self.network.peer_count(), "peer connected");
        self.emit(NodeEvent::PeerConnected(peer.clone()));
        self.send_snapshot(&peer);
        self.broadcast_topology();
    }

    fn on_peer_disconnected(&mut self, peer: &PeerId) {
        if !self.network.on_disconnect(peer) {
            return;
        }
        self.router.peer_disconnected(peer);
        self.topology.remove_direct(&self.local, peer);
        self.link_states.remove(peer);
        self.remote_clusters.remove(peer);
        self.link_seq += 1;
        self.apply_link_states();

        info!(peer = %peer, peers = self.network.peer_count(), "peer disconnected");
        self.emit(NodeEvent::PeerDisconnected(peer.clone()));
        self.broadcast_topology();
    }

    fn on_message(&mut self, from: PeerId, bytes: &[u8]) {
        let envelope = match self.network.receive(&from, bytes) {
            Ok(envelope) => envelope,
            Err(e) => {
                warn!(peer = %from, error = %e, "undecodable message");
                return;
            }
        };
        if !self.network.is_connected(&from) {
            debug!(peer = %from, "message from unlinked peer ignored");
            return;
        }
        let _ = self.topology.record_traffic(&from, 1);
        trace!(peer = %from, topic = %envelope.topic, id = %envelope.id, "message");

        match envelope.topic {
            Topic::Triplet | Topic::Need | Topic::Has => {
                let expected = expected_relation(envelope.topic);
                let open_n = envelope.open_n;
                self.receive_fact(envelope.data, FactSource::Peer(from), expected, open_n);
            }
            Topic::OverlaySync => self.on_overlay_sync(&from, envelope.data, envelope.open_n),
            Topic::TopologyUpdate => {
                self.on_topology_update(&from, envelope.data, envelope.open_n)
            }
            Topic::RouteForward => self.on_route_forward(envelope),
            Topic::ConsensusRequest => self.on_consensus_request(&from, envelope.data),
            Topic::ConsensusVote => self.on_vote(&from, envelope.data),
        }
    }
}
