//! Log record and batch data structures

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use tokio::time::{Duration, Instant};
use uuid::Uuid;

/// Which container stream a record was read from
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Source {
    Stdout,
    Stderr,
}

impl Source {
    pub fn as_str(&self) -> &'static str {
        match self {
            Source::Stdout => "stdout",
            Source::Stderr => "stderr",
        }
    }
}

impl fmt::Display for Source {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Identifies a record within its source stream
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct RecordId {
    pub source: Source,
    pub sequence: u64,
}

impl fmt::Display for RecordId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}#{}", self.source, self.sequence)
    }
}

/// One delimited line of container output.
///
/// Records are immutable once framed. The payload never contains the
/// trailing newline.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct LogRecord {
    id: RecordId,
    payload: Vec<u8>,
    timestamp: DateTime<Utc>,
    received_at: Instant,
}

impl LogRecord {
    /// Create a record stamped with the current wall and monotonic time
    pub fn new(source: Source, sequence: u64, payload: Vec<u8>) -> Self {
        Self {
            id: RecordId { source, sequence },
            payload,
            timestamp: Utc::now(),
            received_at: Instant::now(),
        }
    }

    pub fn id(&self) -> RecordId {
        self.id
    }

    pub fn source(&self) -> Source {
        self.id.source
    }

    pub fn sequence(&self) -> u64 {
        self.id.sequence
    }

    pub fn payload(&self) -> &[u8] {
        &self.payload
    }

    /// Payload as text, replacing invalid UTF-8 sequences
    pub fn message(&self) -> String {
        String::from_utf8_lossy(&self.payload).into_owned()
    }

    pub fn timestamp(&self) -> DateTime<Utc> {
        self.timestamp
    }

    pub fn received_at(&self) -> Instant {
        self.received_at
    }

    /// Bytes this record counts against a batch limit
    pub fn accounted_size(&self, per_record_overhead: usize) -> usize {
        self.payload.len() + per_record_overhead
    }
}

/// An ordered group of records sealed together for delivery
#[derive(Clone, Debug)]
pub struct Batch {
    id: Uuid,
    sequence: u64,
    records: Vec<LogRecord>,
    byte_size: usize,
}

impl Batch {
    pub(crate) fn new(sequence: u64, records: Vec<LogRecord>, byte_size: usize) -> Self {
        debug_assert!(!records.is_empty(), "batches are never sealed empty");
        Self {
            id: Uuid::new_v4(),
            sequence,
            records,
            byte_size,
        }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    /// Position of this batch in seal order
    pub fn sequence(&self) -> u64 {
        self.sequence
    }

    pub fn records(&self) -> &[LogRecord] {
        &self.records
    }

    pub fn into_records(self) -> Vec<LogRecord> {
        self.records
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn byte_size(&self) -> usize {
        self.byte_size
    }

    pub fn oldest_record_age(&self, now: Instant) -> Duration {
        self.records
            .iter()
            .map(LogRecord::received_at)
            .min()
            .map(|oldest| now.saturating_duration_since(oldest))
            .unwrap_or_default()
    }
}
