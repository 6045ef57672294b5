//! Node configuration.

use std::str::FromStr;
use std::time::Duration;

use agora_consensus::QuorumConfig;
use agora_router::RouterConfig;
use agora_topology::{CongestionConfig, TopologyConfig};
use agora_validation::ValidationConfig;

use crate::error::{Error, Result};

/// Periods of the node's maintenance ticks.
#[derive(Debug, Clone)]
pub struct Intervals {
    /// Jitterbug adaptation cycle.
    pub adaptation: Duration,
    /// Reconnection of isolated clusters.
    pub health_check: Duration,
    /// Route cache purge and refresh.
    pub route_cleanup: Duration,
    /// Removal of expired facts.
    pub expiry_sweep: Duration,
    /// Congestion accounting window; deferred messages are retried on it.
    pub congestion_window: Duration,
    /// How long a gossiped link state survives without being reissued.
    pub link_state_ttl: Duration,
}

impl Default for Intervals {
    fn default() -> Self {
        Self {
            adaptation: Duration::from_secs(5),
            health_check: Duration::from_secs(10),
            route_cleanup: Duration::from_secs(30),
            expiry_sweep: Duration::from_secs(60),
            congestion_window: Duration::from_secs(1),
            link_state_ttl: Duration::from_secs(60),
        }
    }
}

/// Configuration for an Agora node.
#[derive(Debug, Clone)]
pub struct NodeConfig {
    pub validation: ValidationConfig,
    pub quorum: QuorumConfig,
    pub topology: TopologyConfig,
    pub congestion: CongestionConfig,
    pub router: RouterConfig,
    pub intervals: Intervals,

    /// Capacity of the node event stream.
    pub event_capacity: usize,

    /// Capacity of the command mailbox.
    pub mailbox_capacity: usize,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            validation: ValidationConfig::default(),
            quorum: QuorumConfig::default(),
            topology: TopologyConfig::default(),
            congestion: CongestionConfig::default(),
            router: RouterConfig::default(),
            intervals: Intervals::default(),
            event_capacity: 1024,
            mailbox_capacity: 256,
        }
    }
}

impl NodeConfig {
    /// Create config from `AGORA_*` environment variables, falling back to
    /// defaults for anything unset.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Same as [`from_env`](Self::from_env) over an arbitrary variable source.
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self::default();
        let var = |name: &str| lookup(name).map(|v| v.trim().to_string()).filter(|v| !v.is_empty());

        if let Some(ms) = parse::<u64>(&var, "AGORA_MAX_FUTURE_SKEW_MS")? {
            config.validation.max_future_skew = Duration::from_millis(ms);
        }
        if let Some(ms) = parse::<u64>(&var, "AGORA_MAX_FACT_AGE_MS")? {
            config.validation.max_age = Duration::from_millis(ms);
        }

        if let Some(n) = parse::<usize>(&var, "AGORA_MIN_VALIDATORS")? {
            if n == 0 {
                return Err(Error::Config("AGORA_MIN_VALIDATORS must be at least 1".into()));
            }
            config.quorum.min_validators = n;
        }
        if let Some(t) = parse::<f64>(&var, "AGORA_CONSENSUS_THRESHOLD")? {
            if !(t > 0.5 && t <= 1.0) {
                return Err(Error::Config(format!(
                    "AGORA_CONSENSUS_THRESHOLD must be in (0.5, 1.0], got {t}"
                )));
            }
            config.quorum.threshold = t;
        }
        if let Some(ms) = parse::<u64>(&var, "AGORA_CONSENSUS_TIMEOUT_MS")? {
            config.quorum.timeout = Duration::from_millis(ms);
        }

        if let Some(n) = parse::<usize>(&var, "AGORA_CLUSTER_SIZE")? {
            if n < 2 {
                return Err(Error::Config("AGORA_CLUSTER_SIZE must be at least 2".into()));
            }
            config.topology.base_cluster_size = n;
        }
        if let Some(n) = parse::<usize>(&var, "AGORA_MAX_CLUSTER_CONNECTIONS")? {
            config.topology.max_connections = n;
        }
        if let Some(n) = parse::<usize>(&var, "AGORA_REDUNDANCY_FACTOR")? {
            config.topology.redundancy_factor = n;
        }
        if config.topology.redundancy_factor > config.topology.max_connections {
            return Err(Error::Config(format!(
                "redundancy factor {} exceeds the connection ceiling {}",
                config.topology.redundancy_factor, config.topology.max_connections
            )));
        }

        if let Some(n) = parse::<usize>(&var, "AGORA_MAX_HOPS")? {
            if n == 0 {
                return Err(Error::Config("AGORA_MAX_HOPS must be at least 1".into()));
            }
            config.router.max_hops = n;
        }
        if let Some(ms) = parse::<u64>(&var, "AGORA_ROUTE_TTL_MS")? {
            config.router.route_ttl = Duration::from_millis(ms);
        }

        Ok(config)
    }

    #[must_use]
    pub fn with_validation(mut self, validation: ValidationConfig) -> Self {
        self.validation = validation;
        self
    }

    #[must_use]
    pub fn with_quorum(mut self, quorum: QuorumConfig) -> Self {
        self.quorum = quorum;
        self
    }

    #[must_use]
    pub fn with_topology(mut self, topology: TopologyConfig) -> Self {
        self.topology = topology;
        self
    }

    #[must_use]
    pub fn with_congestion(mut self, congestion: CongestionConfig) -> Self {
        self.congestion = congestion;
        self
    }

    #[must_use]
    pub fn with_router(mut self, router: RouterConfig) -> Self {
        self.router = router;
        self
    }

    #[must_use]
    pub fn with_intervals(mut self, intervals: Intervals) -> Self {
        self.intervals = intervals;
        self
    }
}

fn parse<T>(var: &impl Fn(&str) -> Option<String>, name: &str) -> Result<Option<T>>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    var(name)
        .map(|raw| {
            raw.parse::<T>()
                .map_err(|e| Error::Config(format!("invalid {name}={raw:?}: {e}")))
        })
        .transpose()
}
