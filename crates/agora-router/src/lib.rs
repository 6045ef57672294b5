//! Agora Mesh Router
//!
//! Bounded-hop source routing over the peer graph the topology exposes.
//!
//! - Direct peers are one hop and never cached.
//! - Other destinations use a cached path while it is younger than the TTL
//!   and its next hop is still connected; otherwise the path is recomputed
//!   with the configured [`RouteAlgorithm`].
//! - A destination with no path within `max_hops` is a [`RoutingError`],
//!   not a panic, and is not retried.

mod algorithm;
mod error;
mod graph;
mod router;
mod table;

pub use algorithm::{ComputedRoute, RouteAlgorithm};
pub use error::{Result, RoutingError};
pub use graph::ConnectivityGraph;
pub use router::{Hop, RouteHeader, Router, RouterConfig, RouterStats};
pub use table::{RouteEntry, RouteTable};
