//! Pipeline tuning configuration

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

/// Bytes each record adds on top of its payload when sizing a batch
pub const DEFAULT_PER_RECORD_OVERHEAD: usize = 26;

/// Longest payload a single record may carry before the framer splits it
pub const DEFAULT_MAX_RECORD_BYTES: usize = 262_144 - DEFAULT_PER_RECORD_OVERHEAD;

/// Bounds that decide when the accumulator seals a batch
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BatchLimits {
    /// Maximum number of records per batch
    pub max_records: usize,

    /// Maximum accounted bytes per batch
    pub max_bytes: usize,

    /// Accounting overhead added to every record's payload length
    pub per_record_overhead: usize,

    /// Longer lines are cut into several records of at most this many bytes
    pub max_record_bytes: usize,

    /// Maximum age of the oldest unsealed record
    pub max_latency: Duration,

    /// How often the latency bound is checked
    pub tick_interval: Duration,
}

impl Default for BatchLimits {
    fn default() -> Self {
        Self {
            max_records: 10_000,
            max_bytes: 1_048_576,
            per_record_overhead: DEFAULT_PER_RECORD_OVERHEAD,
            max_record_bytes: DEFAULT_MAX_RECORD_BYTES,
            max_latency: Duration::from_secs(5),
            tick_interval: Duration::from_secs(1),
        }
    }
}

/// What the queue does when a sealed batch arrives and it is full
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum OverflowPolicy {
    /// Wait for the delivery driver to free a slot
    #[default]
    Block,
    /// Evict the oldest queued batch and report it lost
    DropOldest,
}

const VALID_POLICIES: &str = "block, drop-oldest";

impl FromStr for OverflowPolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "block" => Ok(OverflowPolicy::Block),
            "drop-oldest" | "drop_oldest" => Ok(OverflowPolicy::DropOldest),
            other => Err(format!(
                "invalid overflow policy '{other}'. Valid options are: {VALID_POLICIES}"
            )),
        }
    }
}

impl fmt::Display for OverflowPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OverflowPolicy::Block => write!(f, "block"),
            OverflowPolicy::DropOldest => write!(f, "drop-oldest"),
        }
    }
}

/// Retry budget and backoff shape for retryable publish failures
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Retries after the first attempt
    pub max_retries: u32,

    /// Delay ceiling for the first retry
    pub base_delay: Duration,

    /// Upper bound on any single delay
    pub max_delay: Duration,

    /// Total time a batch may spend retrying
    pub max_elapsed: Duration,

    /// Fixed seed for jitter; `None` seeds from the OS
    pub seed: Option<u64>,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 5,
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(10),
            max_elapsed: Duration::from_secs(60),
            seed: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Config {
    /// Batch sealing bounds
    pub batch: BatchLimits,

    /// Number of sealed batches the queue holds
    pub queue_capacity: usize,

    /// Behaviour of a full queue
    pub overflow_policy: OverflowPolicy,

    /// Retry behaviour of the delivery driver
    pub retry: RetryPolicy,

    /// How long shutdown may spend delivering what is already buffered
    pub drain_timeout: Duration,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            batch: BatchLimits::default(),
            queue_capacity: 8,
            overflow_policy: OverflowPolicy::default(),
            retry: RetryPolicy::default(),
            drain_timeout: Duration::from_secs(20),
        }
    }
}

impl Config {
    /// Upper bound on bytes held in sealed batches waiting for delivery
    pub fn max_buffered_bytes(&self) -> usize {
        self.queue_capacity.saturating_mul(self.batch.max_bytes)
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<(), String> {
        if self.batch.max_records == 0 {
            return Err("max_records must be greater than 0".to_string());
        }

        if self.batch.max_bytes <= self.batch.per_record_overhead {
            return Err("max_bytes must be greater than the per-record overhead".to_string());
        }

        if self.batch.max_record_bytes == 0 {
            return Err("max_record_bytes must be greater than 0".to_string());
        }

        if self.batch.max_record_bytes.saturating_add(self.batch.per_record_overhead)
            > self.batch.max_bytes
        {
            return Err(
                "max_record_bytes plus the per-record overhead must fit in max_bytes".to_string(),
            );
        }

        if self.batch.max_latency.is_zero() {
            return Err("max_latency must be greater than 0".to_string());
        }

        if self.batch.tick_interval.is_zero() {
            return Err("tick_interval must be greater than 0".to_string());
        }

        if self.queue_capacity == 0 {
            return Err("queue_capacity must be greater than 0".to_string());
        }

        if self.retry.base_delay.is_zero() {
            return Err("base_delay must be greater than 0".to_string());
        }

        if self.retry.max_delay < self.retry.base_delay {
            return Err("max_delay must not be shorter than base_delay".to_string());
        }

        if self.drain_timeout.is_zero() {
            return Err("drain_timeout must be greater than 0".to_string());
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        let config = Config::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.overflow_policy, OverflowPolicy::Block);
        assert_eq!(config.max_buffered_bytes(), 8 * 1_048_576);
    }

    #[test]
    fn test_validate_rejects_zero_bounds() {
        let mut config = Config::default();
        config.batch.max_records = 0;
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.queue_capacity = 0;
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.batch.max_bytes = DEFAULT_PER_RECORD_OVERHEAD;
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.batch.max_record_bytes = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validate_rejects_records_larger_than_a_batch() {
        let mut config = Config::default();
        config.batch.max_bytes = 4_096;
        config.batch.max_record_bytes = 4_096;
        assert!(config.validate().is_err());

        config.batch.max_record_bytes = 4_096 - DEFAULT_PER_RECORD_OVERHEAD;
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_validate_rejects_inverted_backoff() {
        let mut config = Config::default();
        config.retry.max_delay = Duration::from_millis(10);
        assert_eq!(
            config.validate().unwrap_err(),
            "max_delay must not be shorter than base_delay"
        );
    }

    #[test]
    fn test_overflow_policy_parsing() {
        assert_eq!(" BLOCK ".parse::<OverflowPolicy>().unwrap(), OverflowPolicy::Block);
        assert_eq!("drop-oldest".parse::<OverflowPolicy>().unwrap(), OverflowPolicy::DropOldest);
        assert_eq!(
            "spill".parse::<OverflowPolicy>().unwrap_err(),
            "invalid overflow policy 'spill'. Valid options are: block, drop-oldest"
        );
    }
}
