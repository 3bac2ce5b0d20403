//! Loss reporting for records the shim had to give up on
//!
//! Every drop in the pipeline goes through a [`LossReporter`] before the data
//! is discarded. The reporter counts losses per reason and forwards each event
//! to a [`LossSink`]; the default sink emits a structured warning.

use crate::record::{LogRecord, RecordId};

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use tracing::warn;

/// Why records were dropped
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LossReason {
    /// Destination rejected the data with a non-retryable error
    Terminal,
    /// Retry count or retry time budget ran out
    RetriesExhausted,
    /// Shutdown drain deadline elapsed before delivery
    DrainDeadline,
    /// Evicted from a full queue under the drop-oldest policy
    QueueOverflow,
}

impl LossReason {
    pub const ALL: [LossReason; 4] = [
        LossReason::Terminal,
        LossReason::RetriesExhausted,
        LossReason::DrainDeadline,
        LossReason::QueueOverflow,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            LossReason::Terminal => "terminal",
            LossReason::RetriesExhausted => "retries_exhausted",
            LossReason::DrainDeadline => "drain_deadline",
            LossReason::QueueOverflow => "queue_overflow",
        }
    }

    fn index(&self) -> usize {
        match self {
            LossReason::Terminal => 0,
            LossReason::RetriesExhausted => 1,
            LossReason::DrainDeadline => 2,
            LossReason::QueueOverflow => 3,
        }
    }
}

impl fmt::Display for LossReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A single drop of one or more records
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LossEvent {
    pub reason: LossReason,
    pub records: usize,
    pub bytes: usize,
    pub record_ids: Vec<RecordId>,
    pub detail: String,
}

impl LossEvent {
    pub fn for_records(
        reason: LossReason,
        records: &[LogRecord],
        detail: impl Into<String>,
    ) -> Self {
        Self {
            reason,
            records: records.len(),
            bytes: records.iter().map(|r| r.payload().len()).sum(),
            record_ids: records.iter().map(LogRecord::id).collect(),
            detail: detail.into(),
        }
    }
}

/// External observability hook for dropped data
pub trait LossSink: Send + Sync {
    fn record(&self, event: &LossEvent);
}

/// Emits every loss as a structured warning
#[derive(Debug, Default)]
pub struct TracingLossSink;

impl LossSink for TracingLossSink {
    fn record(&self, event: &LossEvent) {
        warn!(
            reason = %event.reason,
            records = event.records,
            bytes = event.bytes,
            first_record = ?event.record_ids.first(),
            last_record = ?event.record_ids.last(),
            "Dropped log records: {}",
            event.detail
        );
    }
}

/// Keeps every event in memory, for embedding and tests
#[derive(Debug, Default)]
pub struct CollectingLossSink {
    events: Mutex<Vec<LossEvent>>,
}

impl CollectingLossSink {
    pub fn events(&self) -> Vec<LossEvent> {
        self.events
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }
}

impl LossSink for CollectingLossSink {
    fn record(&self, event: &LossEvent) {
        self.events
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(event.clone());
    }
}

#[derive(Debug, Default)]
struct LossCounters {
    events: [AtomicU64; 4],
    records: [AtomicU64; 4],
}

/// Cloneable handle every stage uses to report drops
#[derive(Clone)]
pub struct LossReporter {
    sink: Arc<dyn LossSink>,
    counters: Arc<LossCounters>,
}

impl LossReporter {
    pub fn new(sink: Arc<dyn LossSink>) -> Self {
        Self {
            sink,
            counters: Arc::new(LossCounters::default()),
        }
    }

    pub fn report(&self, event: LossEvent) {
        if event.records == 0 {
            return;
        }
        let index = event.reason.index();
        self.counters.events[index].fetch_add(1, Ordering::Relaxed);
        self.counters.records[index].fetch_add(event.records as u64, Ordering::Relaxed);
        self.sink.record(&event);
    }

    pub fn snapshot(&self) -> LossSnapshot {
        let mut snapshot = LossSnapshot::default();
        for reason in LossReason::ALL {
            let index = reason.index();
            snapshot.events[index] = self.counters.events[index].load(Ordering::Relaxed);
            snapshot.records[index] = self.counters.records[index].load(Ordering::Relaxed);
        }
        snapshot
    }
}

impl Default for LossReporter {
    fn default() -> Self {
        Self::new(Arc::new(TracingLossSink))
    }
}

impl fmt::Debug for LossReporter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LossReporter")
            .field("snapshot", &self.snapshot())
            .finish()
    }
}

/// Point-in-time loss counts
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LossSnapshot {
    events: [u64; 4],
    records: [u64; 4],
}

impl LossSnapshot {
    pub fn events(&self, reason: LossReason) -> u64 {
        self.events[reason.index()]
    }

    pub fn records(&self, reason: LossReason) -> u64 {
        self.records[reason.index()]
    }

    pub fn total_records(&self) -> u64 {
        self.records.iter().sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::Source;

    fn records(n: u64) -> Vec<LogRecord> {
        (0..n)
            .map(|i| LogRecord::new(Source::Stdout, i, format!("line {i}").into_bytes()))
            .collect()
    }

    #[test]
    fn test_report_counts_by_reason() {
        let sink = Arc::new(CollectingLossSink::default());
        let reporter = LossReporter::new(sink.clone());

        reporter.report(LossEvent::for_records(LossReason::Terminal, &records(2), "bad request"));
        reporter.report(LossEvent::for_records(LossReason::QueueOverflow, &records(3), "full"));

        let snapshot = reporter.snapshot();
        assert_eq!(snapshot.events(LossReason::Terminal), 1);
        assert_eq!(snapshot.records(LossReason::Terminal), 2);
        assert_eq!(snapshot.records(LossReason::QueueOverflow), 3);
        assert_eq!(snapshot.total_records(), 5);

        let events = sink.events();
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].bytes, 12);
        assert_eq!(events[1].record_ids.len(), 3);
    }

    #[test]
    fn test_empty_events_are_ignored() {
        let sink = Arc::new(CollectingLossSink::default());
        let reporter = LossReporter::new(sink.clone());

        reporter.report(LossEvent::for_records(LossReason::DrainDeadline, &[], "nothing"));

        assert!(sink.events().is_empty());
        assert_eq!(reporter.snapshot().total_records(), 0);
    }

    #[test]
    fn test_clones_share_counters() {
        let reporter = LossReporter::default();
        let clone = reporter.clone();

        clone.report(LossEvent::for_records(LossReason::RetriesExhausted, &records(1), "gave up"));

        assert_eq!(reporter.snapshot().events(LossReason::RetriesExhausted), 1);
    }
}
