//! Agora Mesh Topology
//!
//! Peers are grouped into clusters around a center peer, and clusters are
//! joined by inter-cluster connections. The [`Topology`] reshapes that graph
//! from the observed load (the Jitterbug cycle):
//!
//! - **contracted**: sparse, each cluster keeps `redundancy_factor` connections
//! - **expanded**: dense, up to `max_connections` per cluster (hard ceiling)
//!
//! Per-cluster load is `max(peer fill, connection fill)`: members against the
//! base cluster size, and window traffic against what the cluster's
//! connections carry. Adding connections therefore relieves connection fill,
//! which is what lets an expanded topology contract again once traffic falls.
//!
//! Independently of the cluster graph, each node runs a
//! [`CongestionController`] that admits messages against its own capacity
//! using the per-message `open_n` budget.

mod cluster;
mod config;
mod congestion;
mod connection;
mod error;
mod jitterbug;

pub use cluster::{Cluster, ClusterId, ClusterSummary};
pub use config::{CongestionConfig, TopologyConfig};
pub use congestion::{Admission, CongestionController, CongestionStats, Deferred, DeferredQueue};
pub use connection::{Connection, ConnectionKind, Endpoint};
pub use error::{Result, TopologyError};
pub use jitterbug::{Adaptation, Departure, Topology, TopologyState};
