//! Logger options and their resolution into a destination configuration
//!
//! Options arrive as a flat `key=value` map (the same shape container
//! runtimes use for `--log-opt`). Constructors such as [`with_region`] build
//! that map programmatically; [`DestinationConfig::resolve`] validates it
//! once, before the pipeline starts, into an immutable typed configuration.

use crate::errors::{Result, ShimError};

use clap::ValueEnum;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::path::PathBuf;
use std::time::Duration;

pub const REGION_KEY: &str = "awslogs-region";
pub const GROUP_KEY: &str = "awslogs-group";
pub const STREAM_KEY: &str = "awslogs-stream";
pub const ENDPOINT_KEY: &str = "awslogs-endpoint";
pub const CREATE_GROUP_KEY: &str = "awslogs-create-group";
pub const RETENTION_DAYS_KEY: &str = "awslogs-retention-days";
pub const REQUEST_TIMEOUT_KEY: &str = "awslogs-request-timeout";
pub const FILE_PATH_KEY: &str = "file-path";

const HTTP_KEYS: [&str; 7] = [
    REGION_KEY,
    GROUP_KEY,
    STREAM_KEY,
    ENDPOINT_KEY,
    CREATE_GROUP_KEY,
    RETENTION_DAYS_KEY,
    REQUEST_TIMEOUT_KEY,
];
const FILE_KEYS: [&str; 1] = [FILE_PATH_KEY];

/// Retention periods accepted by log-group backends
const VALID_RETENTION_DAYS: [u32; 22] = [
    1, 3, 5, 7, 14, 30, 60, 90, 120, 150, 180, 365, 400, 545, 731, 1096, 1827, 2192, 2557, 2922,
    3288, 3653,
];

const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

/// Container identity plus the raw option map
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LoggerInfo {
    pub container_id: String,
    pub container_name: String,
    pub config: HashMap<String, String>,
}

/// Mutates a [`LoggerInfo`]; produced by the `with_*` constructors
pub type InfoOpt = Box<dyn FnOnce(&mut LoggerInfo) + Send>;

impl LoggerInfo {
    pub fn new(
        container_id: impl Into<String>,
        container_name: impl Into<String>,
        opts: impl IntoIterator<Item = InfoOpt>,
    ) -> Self {
        let mut info = Self {
            container_id: container_id.into(),
            container_name: container_name.into(),
            config: HashMap::new(),
        };
        for opt in opts {
            opt(&mut info);
        }
        info
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.config.get(key).map(String::as_str)
    }
}

/// Sets an arbitrary option
pub fn with_option(key: impl Into<String>, value: impl Into<String>) -> InfoOpt {
    let key = key.into();
    let value = value.into();
    Box::new(move |info| {
        info.config.insert(key, value);
    })
}

/// Sets the region of the log-stream backend
pub fn with_region(region: impl Into<String>) -> InfoOpt {
    with_option(REGION_KEY, region)
}

pub fn with_group(group: impl Into<String>) -> InfoOpt {
    with_option(GROUP_KEY, group)
}

pub fn with_stream(stream: impl Into<String>) -> InfoOpt {
    with_option(STREAM_KEY, stream)
}

pub fn with_endpoint(endpoint: impl Into<String>) -> InfoOpt {
    with_option(ENDPOINT_KEY, endpoint)
}

pub fn with_create_group(create: bool) -> InfoOpt {
    with_option(CREATE_GROUP_KEY, create.to_string())
}

pub fn with_retention_days(days: u32) -> InfoOpt {
    with_option(RETENTION_DAYS_KEY, days.to_string())
}

pub fn with_file_path(path: impl Into<String>) -> InfoOpt {
    with_option(FILE_PATH_KEY, path)
}

/// Which destination a shim instance delivers to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum DestinationKind {
    /// Log-stream ingestion service reached over HTTP
    Http,
    /// Local JSON-lines file
    File,
}

impl fmt::Display for DestinationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DestinationKind::Http => write!(f, "http"),
            DestinationKind::File => write!(f, "file"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HttpOptions {
    pub endpoint: String,
    pub region: String,
    pub group: String,
    pub stream: String,
    pub create_group: bool,
    pub retention_days: Option<u32>,
    pub request_timeout: Duration,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileOptions {
    pub path: PathBuf,
}

/// Validated, immutable destination settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum DestinationConfig {
    Http(HttpOptions),
    File(FileOptions),
}

impl DestinationConfig {
    /// Validate `info` for the chosen destination.
    ///
    /// Fails on unknown keys, missing required keys, and malformed values.
    pub fn resolve(kind: DestinationKind, info: &LoggerInfo) -> Result<Self> {
        let allowed: &[&str] = match kind {
            DestinationKind::Http => &HTTP_KEYS,
            DestinationKind::File => &FILE_KEYS,
        };
        let mut keys: Vec<&String> = info.config.keys().collect();
        keys.sort();
        if let Some(unknown) = keys.into_iter().find(|k| !allowed.contains(&k.as_str())) {
            return Err(ShimError::option(
                unknown.as_str(),
                format!("not supported by the {kind} destination"),
            ));
        }

        match kind {
            DestinationKind::Http => Self::resolve_http(info).map(DestinationConfig::Http),
            DestinationKind::File => Ok(DestinationConfig::File(FileOptions {
                path: PathBuf::from(required(info, FILE_PATH_KEY)?),
            })),
        }
    }

    fn resolve_http(info: &LoggerInfo) -> Result<HttpOptions> {
        let endpoint = required(info, ENDPOINT_KEY)?.trim_end_matches('/').to_string();
        if !endpoint.starts_with("http://") && !endpoint.starts_with("https://") {
            return Err(ShimError::option(ENDPOINT_KEY, "must be an http:// or https:// URL"));
        }

        // The stream defaults to the container id, one stream per container
        let stream = match info.get(STREAM_KEY) {
            Some(stream) => non_empty(STREAM_KEY, stream)?.to_string(),
            None if !info.container_id.is_empty() => info.container_id.clone(),
            None => {
                return Err(ShimError::option(
                    STREAM_KEY,
                    "required when no container id is known",
                ));
            }
        };

        let create_group = match info.get(CREATE_GROUP_KEY) {
            Some(value) => value
                .parse::<bool>()
                .map_err(|_| ShimError::option(CREATE_GROUP_KEY, "must be true or false"))?,
            None => false,
        };

        let retention_days = info
            .get(RETENTION_DAYS_KEY)
            .map(|value| {
                value
                    .parse::<u32>()
                    .ok()
                    .filter(|days| VALID_RETENTION_DAYS.contains(days))
                    .ok_or_else(|| {
                        ShimError::option(
                            RETENTION_DAYS_KEY,
                            format!("must be one of {VALID_RETENTION_DAYS:?}"),
                        )
                    })
            })
            .transpose()?;

        let request_timeout = match info.get(REQUEST_TIMEOUT_KEY) {
            Some(value) => value
                .parse::<u64>()
                .ok()
                .filter(|secs| *secs > 0)
                .map(Duration::from_secs)
                .ok_or_else(|| {
                    ShimError::option(REQUEST_TIMEOUT_KEY, "must be a positive number of seconds")
                })?,
            None => DEFAULT_REQUEST_TIMEOUT,
        };

        Ok(HttpOptions {
            endpoint,
            region: required(info, REGION_KEY)?.to_string(),
            group: required(info, GROUP_KEY)?.to_string(),
            stream,
            create_group,
            retention_days,
            request_timeout,
        })
    }

    pub fn kind(&self) -> DestinationKind {
        match self {
            DestinationConfig::Http(_) => DestinationKind::Http,
            DestinationConfig::File(_) => DestinationKind::File,
        }
    }
}

fn required<'a>(info: &'a LoggerInfo, key: &str) -> Result<&'a str> {
    match info.get(key) {
        Some(value) => non_empty(key, value),
        None => Err(ShimError::option(key, "required")),
    }
}

fn non_empty<'a>(key: &str, value: &'a str) -> Result<&'a str> {
    let value = value.trim();
    if value.is_empty() {
        Err(ShimError::option(key, "cannot be empty"))
    } else {
        Ok(value)
    }
}
