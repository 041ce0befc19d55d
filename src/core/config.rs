use crate::core::model::MAX_LEVELS;
use anyhow::anyhow;
use std::time::Duration;

/// Config is the immutable tuning of a peer and every node it hosts.
/// It is built once and shared as `Arc<Config>`; nothing mutates it afterwards.
#[derive(Clone, Debug, PartialEq)]
pub struct Config {
    /// A node whose table drops below this size leaves the graph.
    pub min_table_size: usize,
    /// A node whose table grows above this size splits.
    pub max_table_size: usize,
    /// Split by handing elements to the level-0 neighbors before creating a new node.
    pub load_balancing: bool,
    /// Extra hand-over during load balancing, as a fraction of `max_table_size`.
    pub load_balancing_headroom: f64,
    /// Fan range queries out over the contact range map instead of walking successors.
    pub parallel_search: bool,
    /// Churn scenario: periodic purge of expired elements and permissive duplicate handling.
    pub churn: bool,
    /// Choose and repair level prefixes to keep upper levels balanced.
    pub prefix_optimization: bool,
    /// Reject update batches holding malformed elements.
    pub validate_elements: bool,
    /// Reply budget of structural operations (join, join-level, load balancing, leave).
    pub structural_timeout: Duration,
    /// Reply budget of service operations (search, update).
    pub service_timeout: Duration,
    /// One-way delay the in-process networks add to every message.
    pub message_latency: Duration,
    /// How many receivers a re-sendable request tries before giving up.
    pub max_lookup_attempts: usize,
    /// How many times a failed update leg is resubmitted for one operation.
    pub max_update_retries: usize,
    /// How many hops a forwarded update or search may travel.
    pub max_forward_hops: usize,
    /// Back-off before retrying a request refused because of a busy level.
    pub busy_retry_delay: Duration,
    /// How many busy refusals a join-level attempt tolerates.
    pub max_busy_retries: usize,
    /// How long an element stays valid without being confirmed (churn only).
    pub retention: Duration,
    /// Grace period added to `retention` before an element is purged.
    pub purge_tolerance: Duration,
    /// Interval of the range adjustment broadcast every node repeats.
    pub announce_interval: Duration,
    /// Interval of the expired element purge (churn only).
    pub purge_interval: Duration,
    /// Interval of the per-node counter report.
    pub stats_interval: Duration,
    /// Upper bound on contact table levels.
    pub max_levels: usize,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            min_table_size: 5,
            max_table_size: 50,
            load_balancing: true,
            load_balancing_headroom: 0.1,
            parallel_search: false,
            churn: false,
            prefix_optimization: false,
            validate_elements: true,
            structural_timeout: Duration::from_secs(2),
            service_timeout: Duration::from_secs(5),
            message_latency: Duration::from_millis(10),
            max_lookup_attempts: 5,
            max_update_retries: 3,
            max_forward_hops: 64,
            busy_retry_delay: Duration::from_millis(200),
            max_busy_retries: 5,
            retention: Duration::from_secs(60),
            purge_tolerance: Duration::from_secs(10),
            announce_interval: Duration::from_secs(30),
            purge_interval: Duration::from_secs(15),
            stats_interval: Duration::from_secs(60),
            max_levels: 32,
        }
    }
}

impl Config {
    pub fn builder() -> ConfigBuilder {
        ConfigBuilder {
            config: Config::default(),
        }
    }

    /// Elements older than this window are purged.
    pub fn purge_window(&self) -> Duration {
        self.retention + self.purge_tolerance
    }

    /// How long a peer holds a node it created for a join. Outlives every confirmation the
    /// splitting node may send.
    pub fn join_hold_window(&self) -> Duration {
        let confirms = u32::try_from(self.max_lookup_attempts).unwrap_or(u32::MAX);
        self.structural_timeout.saturating_mul(confirms.saturating_add(1))
    }

    /// Checks the relations between fields that the protocols rely on.
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.min_table_size >= self.max_table_size {
            return Err(anyhow!(
                "min table size {} must be smaller than max table size {}",
                self.min_table_size,
                self.max_table_size
            ));
        }
        if !(0.0..=1.0).contains(&self.load_balancing_headroom) {
            return Err(anyhow!(
                "load balancing headroom {} must be within [0, 1]",
                self.load_balancing_headroom
            ));
        }
        if self.structural_timeout.is_zero() || self.service_timeout.is_zero() {
            return Err(anyhow!("operation timeouts must be non-zero"));
        }
        if self.max_lookup_attempts == 0 {
            return Err(anyhow!("max lookup attempts must be at least 1"));
        }
        if self.max_levels == 0 || self.max_levels > MAX_LEVELS {
            return Err(anyhow!(
                "max levels {} must be within 1..={}",
                self.max_levels,
                MAX_LEVELS
            ));
        }
        Ok(())
    }
}

/// ConfigBuilder starts from `Config::default()` and validates on `build`.
#[derive(Clone, Debug)]
pub struct ConfigBuilder {
    config: Config,
}

impl ConfigBuilder {
    pub fn table_size(mut self, min: usize, max: usize) -> Self {
        self.config.min_table_size = min;
        self.config.max_table_size = max;
        self
    }

    pub fn load_balancing(mut self, enabled: bool) -> Self {
        self.config.load_balancing = enabled;
        self
    }

    pub fn load_balancing_headroom(mut self, fraction: f64) -> Self {
        self.config.load_balancing_headroom = fraction;
        self
    }

    pub fn parallel_search(mut self, enabled: bool) -> Self {
        self.config.parallel_search = enabled;
        self
    }

    pub fn churn(mut self, enabled: bool) -> Self {
        self.config.churn = enabled;
        self
    }

    pub fn prefix_optimization(mut self, enabled: bool) -> Self {
        self.config.prefix_optimization = enabled;
        self
    }

    pub fn validate_elements(mut self, enabled: bool) -> Self {
        self.config.validate_elements = enabled;
        self
    }

    pub fn timeouts(mut self, structural: Duration, service: Duration) -> Self {
        self.config.structural_timeout = structural;
        self.config.service_timeout = service;
        self
    }

    pub fn message_latency(mut self, latency: Duration) -> Self {
        self.config.message_latency = latency;
        self
    }

    pub fn max_lookup_attempts(mut self, attempts: usize) -> Self {
        self.config.max_lookup_attempts = attempts;
        self
    }

    pub fn max_update_retries(mut self, retries: usize) -> Self {
        self.config.max_update_retries = retries;
        self
    }

    pub fn max_forward_hops(mut self, hops: usize) -> Self {
        self.config.max_forward_hops = hops;
        self
    }

    pub fn busy_retry(mut self, delay: Duration, max_retries: usize) -> Self {
        self.config.busy_retry_delay = delay;
        self.config.max_busy_retries = max_retries;
        self
    }

    pub fn retention(mut self, retention: Duration, tolerance: Duration) -> Self {
        self.config.retention = retention;
        self.config.purge_tolerance = tolerance;
        self
    }

    pub fn intervals(mut self, announce: Duration, purge: Duration, stats: Duration) -> Self {
        self.config.announce_interval = announce;
        self.config.purge_interval = purge;
        self.config.stats_interval = stats;
        self
    }

    pub fn max_levels(mut self, levels: usize) -> Self {
        self.config.max_levels = levels;
        self
    }

    pub fn build(self) -> anyhow::Result<Config> {
        self.config.validate()?;
        Ok(self.config)
    }
}

/// LoggingConfig selects the tracing filter and an optional log file.
#[derive(Clone, Debug, PartialEq)]
pub struct LoggingConfig {
    /// `EnvFilter` directive used when `RUST_LOG` is not set.
    pub filter: String,
    /// Directory and file name prefix of a daily rolling log file.
    pub file: Option<(String, String)>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        LoggingConfig {
            filter: "info".to_string(),
            file: None,
        }
    }
}
