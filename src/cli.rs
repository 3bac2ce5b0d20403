//! Command line and environment configuration for the shim binary

use crate::config::{BatchLimits, Config, OverflowPolicy, RetryPolicy, DEFAULT_MAX_RECORD_BYTES};
use crate::errors::Result;
use crate::options::{with_option, DestinationConfig, DestinationKind, LoggerInfo};

use clap::Parser;
use std::path::PathBuf;
use std::time::Duration;

#[derive(Debug, Clone, Parser)]
#[command(
    name = "log_shim",
    version,
    about = "Forwards container stdout and stderr to a log destination"
)]
pub struct Cli {
    /// Destination backend
    #[arg(long, value_enum, env = "LOG_SHIM_DESTINATION", default_value_t = DestinationKind::Http)]
    pub destination: DestinationKind,

    /// Destination option, may be repeated (e.g. awslogs-group=/ecs/app)
    #[arg(long = "log-opt", value_name = "KEY=VALUE", value_parser = parse_key_value)]
    pub log_opts: Vec<(String, String)>,

    #[arg(long, env = "LOG_SHIM_CONTAINER_ID", default_value = "")]
    pub container_id: String,

    #[arg(long, env = "LOG_SHIM_CONTAINER_NAME", default_value = "")]
    pub container_name: String,

    /// Pipe carrying the container's stdout
    #[arg(long, env = "LOG_SHIM_STDOUT")]
    pub stdout: Option<PathBuf>,

    /// Pipe carrying the container's stderr
    #[arg(long, env = "LOG_SHIM_STDERR")]
    pub stderr: Option<PathBuf>,

    #[arg(long, env = "LOG_SHIM_MAX_BATCH_RECORDS", default_value_t = 10_000)]
    pub max_batch_records: usize,

    #[arg(long, env = "LOG_SHIM_MAX_BATCH_BYTES", default_value_t = 1_048_576)]
    pub max_batch_bytes: usize,

    /// Longer lines are split into several records
    #[arg(long, env = "LOG_SHIM_MAX_RECORD_BYTES", default_value_t = DEFAULT_MAX_RECORD_BYTES)]
    pub max_record_bytes: usize,

    #[arg(long, env = "LOG_SHIM_MAX_LATENCY_MS", default_value_t = 5_000)]
    pub max_latency_ms: u64,

    #[arg(long, env = "LOG_SHIM_TICK_MS", default_value_t = 1_000)]
    pub tick_ms: u64,

    #[arg(long, env = "LOG_SHIM_QUEUE_CAPACITY", default_value_t = 8)]
    pub queue_capacity: usize,

    /// Full queue behaviour: block or drop-oldest
    #[arg(long, env = "LOG_SHIM_OVERFLOW_POLICY", default_value = "block")]
    pub overflow_policy: OverflowPolicy,

    #[arg(long, env = "LOG_SHIM_MAX_RETRIES", default_value_t = 5)]
    pub max_retries: u32,

    #[arg(long, env = "LOG_SHIM_RETRY_BASE_MS", default_value_t = 100)]
    pub retry_base_ms: u64,

    #[arg(long, env = "LOG_SHIM_RETRY_MAX_MS", default_value_t = 10_000)]
    pub retry_max_ms: u64,

    #[arg(long, env = "LOG_SHIM_RETRY_MAX_ELAPSED_MS", default_value_t = 60_000)]
    pub retry_max_elapsed_ms: u64,

    #[arg(long, env = "LOG_SHIM_DRAIN_TIMEOUT_MS", default_value_t = 20_000)]
    pub drain_timeout_ms: u64,

    /// Fixed seed for retry jitter
    #[arg(long, env = "LOG_SHIM_BACKOFF_SEED")]
    pub backoff_seed: Option<u64>,
}

impl Cli {
    /// Pipeline tuning assembled from the flags
    pub fn config(&self) -> Config {
        Config {
            batch: BatchLimits {
                max_records: self.max_batch_records,
                max_bytes: self.max_batch_bytes,
                max_record_bytes: self.max_record_bytes,
                max_latency: Duration::from_millis(self.max_latency_ms),
                tick_interval: Duration::from_millis(self.tick_ms),
                ..BatchLimits::default()
            },
            queue_capacity: self.queue_capacity,
            overflow_policy: self.overflow_policy,
            retry: RetryPolicy {
                max_retries: self.max_retries,
                base_delay: Duration::from_millis(self.retry_base_ms),
                max_delay: Duration::from_millis(self.retry_max_ms),
                max_elapsed: Duration::from_millis(self.retry_max_elapsed_ms),
                seed: self.backoff_seed,
            },
            drain_timeout: Duration::from_millis(self.drain_timeout_ms),
        }
    }

    pub fn logger_info(&self) -> LoggerInfo {
        LoggerInfo::new(
            self.container_id.clone(),
            self.container_name.clone(),
            self.log_opts
                .iter()
                .map(|(key, value)| with_option(key.clone(), value.clone())),
        )
    }

    pub fn destination_config(&self) -> Result<DestinationConfig> {
        DestinationConfig::resolve(self.destination, &self.logger_info())
    }
}

fn parse_key_value(s: &str) -> std::result::Result<(String, String), String> {
    let (key, value) = s
        .split_once('=')
        .ok_or_else(|| format!("invalid option '{s}', expected KEY=VALUE"))?;
    let key = key.trim();
    if key.is_empty() {
        return Err(format!("invalid option '{s}', key is empty"));
    }
    Ok((key.to_string(), value.to_string()))
}
