use std::time::Duration;

use envconfig::Envconfig;

use crate::error::{Error, Result};
use crate::feed::FeedPosition;
use crate::store::StoreConfig;

/// Lease timing and distribution knobs shared by every worker of a processor.
#[derive(Debug, Clone)]
pub struct LeaseOptions {
    /// How often a supervisor refreshes the lease it holds.
    pub renew_interval: Duration,
    /// How often the load balancer runs.
    pub acquire_interval: Duration,
    /// A lease not written for this long is considered abandoned.
    pub expiration_interval: Duration,
    /// Id prefix of every document the processor writes to the lease store.
    pub prefix: String,
    /// Lower bound on the leases one worker aims to own. 0 = unset.
    pub min_lease_count: usize,
    /// Upper bound on the leases one worker aims to own. 0 = unset.
    pub max_lease_count: usize,
}

impl Default for LeaseOptions {
    fn default() -> Self {
        Self {
            renew_interval: Duration::from_secs(17),
            acquire_interval: Duration::from_secs(13),
            expiration_interval: Duration::from_secs(60),
            prefix: "changefeed".to_string(),
            min_lease_count: 0,
            max_lease_count: 0,
        }
    }
}

impl LeaseOptions {
    pub fn validate(&self) -> Result<()> {
        if self.renew_interval >= self.expiration_interval {
            return Err(Error::invalid_state(
                "lease renew interval must be shorter than the expiration interval",
            ));
        }
        if self.max_lease_count > 0 && self.min_lease_count > self.max_lease_count {
            return Err(Error::invalid_state(
                "min lease count must not exceed max lease count",
            ));
        }
        if self.prefix.is_empty() || self.prefix.contains('/') {
            return Err(Error::invalid_state(
                "lease prefix must be non-empty and must not contain '/'",
            ));
        }
        Ok(())
    }
}

/// When the processing loop persists progress after a successful callback.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CheckpointFrequency {
    EveryBatch,
    /// After at least this many items have been handed to the observer.
    ItemCount(usize),
    /// At most once per interval.
    Interval(Duration),
    /// Only when the observer calls `ChangeFeedContext::checkpoint`.
    Explicit,
}

#[derive(Debug, Clone)]
pub struct ProcessorOptions {
    /// Wait between reads when a partition has no new changes.
    pub feed_poll_delay: Duration,
    /// Page size hint passed to the data source.
    pub max_item_count: usize,
    /// Where a lease without a continuation starts reading.
    pub start_from: FeedPosition,
    pub checkpoint_frequency: CheckpointFrequency,
}

impl Default for ProcessorOptions {
    fn default() -> Self {
        Self {
            feed_poll_delay: Duration::from_secs(5),
            max_item_count: 100,
            start_from: FeedPosition::Now,
            checkpoint_frequency: CheckpointFrequency::EveryBatch,
        }
    }
}

#[derive(Debug, Clone)]
pub struct BootstrapOptions {
    /// TTL of the initialization lock document.
    pub lock_time: Duration,
    /// Wait between attempts while another worker holds the lock.
    pub sleep_time: Duration,
}

impl Default for BootstrapOptions {
    fn default() -> Self {
        Self {
            lock_time: Duration::from_secs(30),
            sleep_time: Duration::from_secs(15),
        }
    }
}

#[derive(Envconfig, Clone, Debug)]
pub struct Config {
    // ── etcd ────────────────────────────────────────────────────────
    #[envconfig(default = "http://localhost:2379")]
    pub etcd_endpoints: String,

    #[envconfig(default = "/change-feed/")]
    pub etcd_prefix: String,

    // ── Worker ──────────────────────────────────────────────────────
    #[envconfig(default = "worker-0")]
    pub instance_name: String,

    // ── Leases ──────────────────────────────────────────────────────
    #[envconfig(default = "changefeed")]
    pub lease_prefix: String,

    #[envconfig(default = "17000")]
    pub lease_renew_interval_ms: u64,

    #[envconfig(default = "13000")]
    pub lease_acquire_interval_ms: u64,

    #[envconfig(default = "60000")]
    pub lease_expiration_interval_ms: u64,

    #[envconfig(default = "0")]
    pub min_lease_count: usize,

    #[envconfig(default = "0")]
    pub max_lease_count: usize,

    // ── Processing ──────────────────────────────────────────────────
    #[envconfig(default = "5000")]
    pub feed_poll_delay_ms: u64,

    #[envconfig(default = "100")]
    pub max_item_count: usize,

    /// "now", "beginning", or an RFC 3339 timestamp.
    #[envconfig(default = "now")]
    pub start_from: String,

    /// 0 checkpoints after every batch.
    #[envconfig(default = "0")]
    pub checkpoint_interval_ms: u64,

    // ── Bootstrap / fan-out ─────────────────────────────────────────
    #[envconfig(default = "30")]
    pub bootstrap_lock_time_secs: u64,

    #[envconfig(default = "15")]
    pub bootstrap_sleep_time_secs: u64,

    #[envconfig(default = "25")]
    pub degree_of_parallelism: usize,
}

impl Config {
    pub fn init_with_defaults() -> std::result::Result<Self, envconfig::Error> {
        Config::init_from_env()
    }

    pub fn etcd_endpoint_list(&self) -> Vec<String> {
        self.etcd_endpoints
            .split(',')
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .collect()
    }

    pub fn store_config(&self) -> StoreConfig {
        StoreConfig {
            endpoints: self.etcd_endpoint_list(),
            prefix: self.etcd_prefix.clone(),
        }
    }

    pub fn lease_options(&self) -> LeaseOptions {
        LeaseOptions {
            renew_interval: Duration::from_millis(self.lease_renew_interval_ms),
            acquire_interval: Duration::from_millis(self.lease_acquire_interval_ms),
            expiration_interval: Duration::from_millis(self.lease_expiration_interval_ms),
            prefix: self.lease_prefix.clone(),
            min_lease_count: self.min_lease_count,
            max_lease_count: self.max_lease_count,
        }
    }

    pub fn processor_options(&self) -> Result<ProcessorOptions> {
        let raw = self.start_from.trim();
        let start_from = match raw.to_lowercase().as_str() {
            "now" => FeedPosition::Now,
            "beginning" => FeedPosition::Beginning,
            _ => {
                let at = chrono::DateTime::parse_from_rfc3339(raw).map_err(|e| {
                    Error::invalid_state(format!("invalid start_from {raw:?}: {e}"))
                })?;
                FeedPosition::PointInTime(at.with_timezone(&chrono::Utc))
            }
        };
        let checkpoint_frequency = match self.checkpoint_interval_ms {
            0 => CheckpointFrequency::EveryBatch,
            ms => CheckpointFrequency::Interval(Duration::from_millis(ms)),
        };
        Ok(ProcessorOptions {
            feed_poll_delay: Duration::from_millis(self.feed_poll_delay_ms),
            max_item_count: self.max_item_count,
            start_from,
            checkpoint_frequency,
        })
    }

    pub fn bootstrap_options(&self) -> BootstrapOptions {
        BootstrapOptions {
            lock_time: Duration::from_secs(self.bootstrap_lock_time_secs),
            sleep_time: Duration::from_secs(self.bootstrap_sleep_time_secs),
        }
    }
}
