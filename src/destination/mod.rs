//! Pluggable log destinations
//!
//! The delivery driver only needs one operation from a backend: publish an
//! ordered slice of records and report which were accepted. Each backend is
//! one [`Destination`] implementation, chosen once when the pipeline is built.

mod file;
mod http;

pub use file::FileDestination;
pub use http::HttpDestination;

use crate::errors::PublishError;
use crate::record::{LogRecord, RecordId};

use async_trait::async_trait;
use std::collections::HashSet;

/// A record the destination refused, with the reason
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Rejection {
    pub id: RecordId,
    pub error: PublishError,
}

/// Per-record result of a publish call that reached the destination
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PublishOutcome {
    pub accepted: Vec<RecordId>,
    pub rejected: Vec<Rejection>,
}

impl PublishOutcome {
    /// Every record in `records` was accepted
    pub fn all_accepted(records: &[LogRecord]) -> Self {
        Self {
            accepted: records.iter().map(LogRecord::id).collect(),
            rejected: Vec::new(),
        }
    }

    /// Accept everything except the given rejections
    pub fn with_rejections(records: &[LogRecord], rejected: Vec<Rejection>) -> Self {
        let refused: HashSet<RecordId> = rejected.iter().map(|r| r.id).collect();
        Self {
            accepted: records
                .iter()
                .map(LogRecord::id)
                .filter(|id| !refused.contains(id))
                .collect(),
            rejected,
        }
    }

    pub fn is_complete(&self) -> bool {
        self.rejected.is_empty()
    }
}

/// A backend that log batches are delivered to
#[async_trait]
pub trait Destination: Send + Sync {
    /// Short name used in logs
    fn name(&self) -> &'static str;

    /// Deliver `records` in order.
    ///
    /// `Err` means nothing was accepted. `Ok` lists per-record results;
    /// records absent from both lists are treated as not acknowledged.
    async fn publish(&self, records: &[LogRecord]) -> Result<PublishOutcome, PublishError>;
}

#[async_trait]
impl<D: Destination + ?Sized> Destination for std::sync::Arc<D> {
    fn name(&self) -> &'static str {
        (**self).name()
    }

    async fn publish(&self, records: &[LogRecord]) -> Result<PublishOutcome, PublishError> {
        (**self).publish(records).await
    }
}
