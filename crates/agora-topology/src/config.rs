use std::time::Duration;

/// Shape of the cluster graph and the load thresholds that reshape it.
#[derive(Debug, Clone)]
pub struct TopologyConfig {
    /// Members a cluster may hold before new peers go elsewhere.
    pub base_cluster_size: usize,
    /// Hard ceiling on inter-cluster connections per cluster.
    pub max_connections: usize,
    /// Connections each cluster keeps for baseline reachability.
    pub redundancy_factor: usize,
    /// Messages one inter-cluster connection carries per window before it counts as full.
    pub connection_capacity: u64,
    pub expansion_threshold: f64,
    pub contraction_threshold: f64,
    /// Number of recent states kept for inspection.
    pub history_len: usize,
}

impl Default for TopologyConfig {
    fn default() -> Self {
        Self {
            base_cluster_size: 8,
            max_connections: 6,
            redundancy_factor: 2,
            connection_capacity: 256,
            expansion_threshold: 0.75,
            contraction_threshold: 0.30,
            history_len: 64,
        }
    }
}

impl TopologyConfig {
    #[must_use]
    pub fn with_base_cluster_size(mut self, size: usize) -> Self {
        self.base_cluster_size = size.max(1);
        self
    }

    #[must_use]
    pub fn with_max_connections(mut self, max: usize) -> Self {
        self.max_connections = max;
        self
    }

    #[must_use]
    pub fn with_redundancy_factor(mut self, factor: usize) -> Self {
        self.redundancy_factor = factor;
        self
    }

    #[must_use]
    pub fn with_connection_capacity(mut self, capacity: u64) -> Self {
        self.connection_capacity = capacity.max(1);
        self
    }

    #[must_use]
    pub fn with_thresholds(mut self, expansion: f64, contraction: f64) -> Self {
        self.expansion_threshold = expansion;
        self.contraction_threshold = contraction;
        self
    }
}

/// Per-node congestion control constants.
#[derive(Debug, Clone)]
pub struct CongestionConfig {
    /// `open_n` a congested sender stamps on its messages (protocol constant N).
    pub open_n: u8,
    /// Messages a freshly opened block of temporary capacity may carry (B).
    pub budget: u32,
    /// Messages per window at normal capacity.
    pub base_capacity: u32,
    /// Messages per window never exceeded, temporary capacity included.
    pub hard_ceiling: u32,
    /// Temporary capacity opened per expansion.
    pub step: u32,
    /// Queue attempts before a message is dropped.
    pub max_retries: u32,
    /// Backoff before the first retry; doubles per attempt.
    pub backoff: Duration,
    /// Maximum deferred messages held at once.
    pub queue_limit: usize,
}

impl Default for CongestionConfig {
    fn default() -> Self {
        Self {
            open_n: 3,
            budget: 16,
            base_capacity: 64,
            hard_ceiling: 128,
            step: 16,
            max_retries: 4,
            backoff: Duration::from_millis(100),
            queue_limit: 1024,
        }
    }
}

impl CongestionConfig {
    #[must_use]
    pub fn with_capacity(mut self, base: u32, hard_ceiling: u32) -> Self {
        self.base_capacity = base;
        self.hard_ceiling = hard_ceiling.max(base);
        self
    }

    #[must_use]
    pub fn with_expansion(mut self, step: u32, budget: u32) -> Self {
        self.step = step;
        self.budget = budget;
        self
    }

    #[must_use]
    pub fn with_open_n(mut self, open_n: u8) -> Self {
        self.open_n = open_n;
        self
    }

    #[must_use]
    pub fn with_retries(mut self, max_retries: u32, backoff: Duration) -> Self {
        self.max_retries = max_retries;
        self.backoff = backoff;
        self
    }
}
