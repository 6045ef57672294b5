use agora_fact::PeerId;
use thiserror::Error;

use crate::cluster::ClusterId;

pub type Result<T> = std::result::Result<T, TopologyError>;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum TopologyError {
    #[error("peer {0} is not part of the topology")]
    UnknownPeer(PeerId),

    #[error("peer {0} is already integrated")]
    AlreadyIntegrated(PeerId),

    #[error("unknown cluster {0}")]
    UnknownCluster(ClusterId),
}
