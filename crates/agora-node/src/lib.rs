//! Agora Node - offer/request fact exchange over a self-organising mesh
//!
//! A node publishes `has`/`needs` facts, validates what peers send, puts
//! `committed` agreements to a vote, and keeps an adaptive Jitterbug
//! topology with source routing on top of whatever transport it is given.
//!
//! # Architecture
//!
//! - **Transport**: [`PeerTransport`] seam plus the in-process [`ChannelHub`]
//! - **Network**: connection set, broadcast and unicast ([`MeshNetwork`])
//! - **Envelope**: wire format and topic payloads
//! - **Node**: single-task actor owning all protocol state, driven through
//!   a [`NodeHandle`]
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use agora_fact::{Context, FactFactory, Keypair, Signer};
//! use agora_node::{ChannelHub, Node, NodeConfig};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let hub = ChannelHub::new();
//!     let identity = Keypair::generate();
//!     let factory = FactFactory::new(identity.peer_id().clone());
//!     let (transport, inbound) = hub.join(&identity)?;
//!     let node = Node::spawn(NodeConfig::from_env()?, identity, Arc::new(transport), inbound);
//!
//!     node.submit(factory.needs("clinic", "water", Context::new())?).await?;
//!     node.shutdown().await?;
//!     Ok(())
//! }
//! ```

pub mod config;
pub mod envelope;
pub mod error;
pub mod network;
pub mod node;
pub mod transport;

pub use config::{Intervals, NodeConfig};
pub use envelope::{Envelope, LinkState, Routed, SyncBatch, Topic, TopologyUpdate};
pub use error::{Error, Result};
pub use network::{MeshNetwork, NetworkStats};
pub use node::{FactSource, Node, NodeEvent, NodeHandle, NodeStats, Rule};
pub use transport::{ChannelHub, HubTransport, PeerTransport, TransportEvent, TransportEvents};
