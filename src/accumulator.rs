//! Groups framed records into size, count and age bounded batches

use crate::config::BatchLimits;
use crate::loss::{LossEvent, LossReason, LossReporter};
use crate::queue::{BoundedQueue, PushOutcome, QueueClosed};
use crate::record::{Batch, LogRecord};

use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::time::{interval, Duration, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace};

/// Builds batches one record at a time.
///
/// A batch is sealed as soon as it reaches the record count or byte bound,
/// or when its oldest record is older than the latency bound. Records are
/// never split, and a record larger than the byte bound is sealed on its own.
#[derive(Debug)]
pub struct BatchAccumulator {
    limits: BatchLimits,
    records: Vec<LogRecord>,
    bytes: usize,
    oldest: Option<Instant>,
    next_sequence: u64,
}

impl BatchAccumulator {
    pub fn new(limits: BatchLimits) -> Self {
        Self {
            limits,
            records: Vec::new(),
            bytes: 0,
            oldest: None,
            next_sequence: 0,
        }
    }

    /// Append a record, returning any batches it caused to be sealed
    pub fn push(&mut self, record: LogRecord) -> Vec<Batch> {
        let size = record.accounted_size(self.limits.per_record_overhead);
        let mut sealed = Vec::new();

        if !self.records.is_empty() && self.bytes + size > self.limits.max_bytes {
            sealed.extend(self.seal("bytes"));
        }

        let received_at = record.received_at();
        self.oldest = Some(self.oldest.map_or(received_at, |oldest| oldest.min(received_at)));
        self.bytes += size;
        self.records.push(record);

        if self.records.len() >= self.limits.max_records {
            sealed.extend(self.seal("count"));
        } else if self.bytes >= self.limits.max_bytes {
            sealed.extend(self.seal("bytes"));
        }

        sealed
    }

    /// Seal the pending batch if its oldest record exceeded the latency bound
    pub fn poll_latency(&mut self, now: Instant) -> Option<Batch> {
        if self.oldest_age(now)? >= self.limits.max_latency {
            self.seal("latency")
        } else {
            None
        }
    }

    /// Seal whatever is pending regardless of bounds
    pub fn flush(&mut self) -> Option<Batch> {
        self.seal("flush")
    }

    pub fn pending_records(&self) -> usize {
        self.records.len()
    }

    pub fn pending_bytes(&self) -> usize {
        self.bytes
    }

    pub fn oldest_age(&self, now: Instant) -> Option<Duration> {
        self.oldest.map(|oldest| now.saturating_duration_since(oldest))
    }

    /// Number of batches sealed so far
    pub fn sealed(&self) -> u64 {
        self.next_sequence
    }

    fn seal(&mut self, reason: &'static str) -> Option<Batch> {
        if self.records.is_empty() {
            return None;
        }

        let records = std::mem::take(&mut self.records);
        let bytes = std::mem::take(&mut self.bytes);
        self.oldest = None;

        let batch = Batch::new(self.next_sequence, records, bytes);
        self.next_sequence += 1;

        debug!(
            "Sealed batch {} ({}): {} records, {} bytes",
            batch.sequence(),
            reason,
            batch.len(),
            batch.byte_size()
        );
        Some(batch)
    }

    /// Drive the accumulator until every reader is done or delivery is aborted.
    ///
    /// Sealed batches are pushed onto `queue`, which is closed when this
    /// returns. Returns the number of batches sealed.
    pub async fn run(
        mut self,
        mut records: mpsc::Receiver<LogRecord>,
        queue: Arc<BoundedQueue>,
        abort: CancellationToken,
        losses: LossReporter,
    ) -> u64 {
        let mut tick = interval(self.limits.tick_interval);
        tick.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                biased;
                () = abort.cancelled() => {
                    records.close();
                    let mut abandoned: Vec<LogRecord> = std::mem::take(&mut self.records);
                    while let Ok(record) = records.try_recv() {
                        abandoned.push(record);
                    }
                    self.bytes = 0;
                    self.oldest = None;
                    losses.report(LossEvent::for_records(
                        LossReason::DrainDeadline,
                        &abandoned,
                        "drain deadline elapsed before the records were batched",
                    ));
                    break;
                }
                next = records.recv() => match next {
                    Some(record) => {
                        trace!("Accumulating record {}", record.id());
                        for batch in self.push(record) {
                            enqueue(&queue, batch, &losses).await;
                        }
                    }
                    None => {
                        if let Some(batch) = self.flush() {
                            enqueue(&queue, batch, &losses).await;
                        }
                        break;
                    }
                },
                _ = tick.tick() => {
                    if let Some(batch) = self.poll_latency(Instant::now()) {
                        enqueue(&queue, batch, &losses).await;
                    }
                }
            }
        }

        queue.close();
        info!("Accumulator stopped after sealing {} batches", self.next_sequence);
        self.next_sequence
    }
}

async fn enqueue(queue: &BoundedQueue, batch: Batch, losses: &LossReporter) {
    match queue.push(batch).await {
        Ok(PushOutcome::Enqueued) => {}
        Ok(PushOutcome::EvictedOldest(evicted)) => {
            losses.report(LossEvent::for_records(
                LossReason::QueueOverflow,
                evicted.records(),
                format!("queue full, evicted batch {}", evicted.sequence()),
            ));
        }
        Err(QueueClosed(batch)) => {
            losses.report(LossEvent::for_records(
                LossReason::DrainDeadline,
                batch.records(),
                format!("queue closed before batch {} was enqueued", batch.sequence()),
            ));
        }
    }
}
