//! HTTP transport for log-stream ingestion endpoints

use super::{Destination, PublishOutcome, Rejection};
use crate::errors::{PublishError, Result, ShimError};
use crate::options::HttpOptions;
use crate::record::{LogRecord, RecordId, Source};

use async_trait::async_trait;
use reqwest::{Client, Response, StatusCode};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use tracing::{debug, warn};

/// Posts batches as JSON to `<endpoint>/v1/logs`.
///
/// A 2xx response accepts the batch; its body may list individual
/// rejections. Throttling, timeouts and server errors are retryable, any
/// other client error is terminal for the whole batch.
#[derive(Debug, Clone)]
pub struct HttpDestination {
    client: Client,
    url: String,
    options: HttpOptions,
}

#[derive(Debug, Serialize)]
struct PutLogsRequest<'a> {
    region: &'a str,
    group: &'a str,
    stream: &'a str,
    create_group: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    retention_days: Option<u32>,
    events: Vec<LogEventPayload>,
}

#[derive(Debug, Serialize)]
struct LogEventPayload {
    source: Source,
    sequence: u64,
    timestamp_ms: i64,
    message: String,
}

#[derive(Debug, Default, Deserialize)]
struct PutLogsResponse {
    #[serde(default)]
    rejected: Vec<RejectedEvent>,
}

#[derive(Debug, Deserialize)]
struct RejectedEvent {
    source: Source,
    sequence: u64,
    reason: String,
    #[serde(default)]
    retryable: bool,
}

impl HttpDestination {
    pub fn new(options: HttpOptions) -> Result<Self> {
        let client = Client::builder()
            .timeout(options.request_timeout)
            .user_agent(format!("log_shim/{}", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(ShimError::Http)?;

        Ok(Self {
            client,
            url: format!("{}/v1/logs", options.endpoint),
            options,
        })
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    fn request<'a>(&'a self, records: &[LogRecord]) -> PutLogsRequest<'a> {
        PutLogsRequest {
            region: &self.options.region,
            group: &self.options.group,
            stream: &self.options.stream,
            create_group: self.options.create_group,
            retention_days: self.options.retention_days,
            events: records
                .iter()
                .map(|record| LogEventPayload {
                    source: record.source(),
                    sequence: record.sequence(),
                    timestamp_ms: record.timestamp().timestamp_millis(),
                    message: record.message(),
                })
                .collect(),
        }
    }

    /// Map the ingestion endpoint's response onto a publish result
    async fn handle_response(
        &self,
        response: Response,
        records: &[LogRecord],
    ) -> std::result::Result<PublishOutcome, PublishError> {
        let status = response.status();
        let body = response.text().await.unwrap_or_default();

        if status.is_success() {
            return Ok(parse_rejections(&body, records));
        }

        let message = format!("{} from {}: {}", status, self.url, body.trim());
        Err(match status {
            StatusCode::TOO_MANY_REQUESTS | StatusCode::REQUEST_TIMEOUT => {
                PublishError::retryable(message)
            }
            s if s.is_server_error() => PublishError::retryable(message),
            _ => PublishError::terminal(message),
        })
    }
}

fn parse_rejections(body: &str, records: &[LogRecord]) -> PublishOutcome {
    if body.trim().is_empty() {
        return PublishOutcome::all_accepted(records);
    }

    let response: PutLogsResponse = match serde_json::from_str(body) {
        Ok(response) => response,
        Err(e) => {
            warn!("Ignoring unparseable success body from destination: {}", e);
            PutLogsResponse::default()
        }
    };

    let sent: HashSet<RecordId> = records.iter().map(LogRecord::id).collect();
    let rejected = response
        .rejected
        .into_iter()
        .map(|event| Rejection {
            id: RecordId {
                source: event.source,
                sequence: event.sequence,
            },
            error: if event.retryable {
                PublishError::retryable(event.reason)
            } else {
                PublishError::terminal(event.reason)
            },
        })
        .filter(|rejection| sent.contains(&rejection.id))
        .collect();

    PublishOutcome::with_rejections(records, rejected)
}

fn classify_send_error(err: reqwest::Error) -> PublishError {
    if err.is_builder() {
        PublishError::terminal(format!("invalid request: {err}"))
    } else {
        PublishError::retryable(format!("request failed: {err}"))
    }
}

#[async_trait]
impl Destination for HttpDestination {
    fn name(&self) -> &'static str {
        "http"
    }

    async fn publish(
        &self,
        records: &[LogRecord],
    ) -> std::result::Result<PublishOutcome, PublishError> {
        debug!("Posting {} records to {}", records.len(), self.url);

        let response = self
            .client
            .post(&self.url)
            .json(&self.request(records))
            .send()
            .await
            .map_err(classify_send_error)?;

        self.handle_response(response, records).await
    }
}
