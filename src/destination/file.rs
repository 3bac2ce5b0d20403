//! Appends records to a local JSON-lines file

use super::{Destination, PublishOutcome};
use crate::errors::{PublishError, Result};
use crate::options::FileOptions;
use crate::record::{LogRecord, Source};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::path::{Path, PathBuf};
use tokio::fs::{File, OpenOptions};
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tracing::{debug, warn};

#[derive(Debug, Serialize)]
struct FileLine<'a> {
    timestamp: DateTime<Utc>,
    source: Source,
    sequence: u64,
    message: &'a str,
}

/// Writes one JSON object per record.
///
/// The file is cut back to its previous length when a batch fails to write,
/// so a retried batch is never stored twice.
#[derive(Debug)]
pub struct FileDestination {
    path: PathBuf,
    write_lock: Mutex<()>,
}

impl FileDestination {
    pub fn new(options: FileOptions) -> Result<Self> {
        if let Some(parent) = options.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)?;
        }
        Ok(Self {
            path: options.path,
            write_lock: Mutex::new(()),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn encode(records: &[LogRecord]) -> std::result::Result<Vec<u8>, PublishError> {
        let mut buf = Vec::new();
        for record in records {
            let message = record.message();
            let line = FileLine {
                timestamp: record.timestamp(),
                source: record.source(),
                sequence: record.sequence(),
                message: &message,
            };
            serde_json::to_writer(&mut buf, &line).map_err(|e| {
                PublishError::terminal(format!("cannot encode {}: {e}", record.id()))
            })?;
            buf.push(b'\n');
        }
        Ok(buf)
    }
}

#[async_trait]
impl Destination for FileDestination {
    fn name(&self) -> &'static str {
        "file"
    }

    async fn publish(
        &self,
        records: &[LogRecord],
    ) -> std::result::Result<PublishOutcome, PublishError> {
        let buf = Self::encode(records)?;
        let _guard = self.write_lock.lock().await;
        let retryable = |what: &str, e: std::io::Error| {
            PublishError::retryable(format!("{what} {}: {e}", self.path.display()))
        };

        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .await
            .map_err(|e| retryable("cannot open", e))?;
        let start = file
            .metadata()
            .await
            .map_err(|e| retryable("cannot stat", e))?
            .len();

        if let Err(e) = append(&mut file, &buf).await {
            rollback(&mut file, start, &self.path).await;
            return Err(retryable("cannot append to", e));
        }

        debug!("Appended {} records to {}", records.len(), self.path.display());
        Ok(PublishOutcome::all_accepted(records))
    }
}

async fn append(file: &mut File, buf: &[u8]) -> std::io::Result<()> {
    file.write_all(buf).await?;
    file.flush().await
}

/// Cut `file` back to `len`, dropping whatever part of a batch made it in
async fn rollback(file: &mut File, len: u64, path: &Path) {
    if let Err(e) = file.set_len(len).await {
        warn!(
            "Could not truncate {} back to {} bytes after a failed write: {}",
            path.display(),
            len,
            e
        );
    }
}
