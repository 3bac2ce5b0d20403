//! Delivery driver: moves sealed batches from the queue to the destination
//!
//! Exactly one publish is in flight at a time, which keeps batches in seal
//! order and makes backoff accounting per batch. Failures are handled as
//! follows:
//!
//! - retryable errors are retried with jittered exponential backoff until the
//!   retry count or elapsed-time budget runs out;
//! - terminal errors drop the batch immediately;
//! - partial acceptance retries only the rejected records, under the same
//!   budget, and drops whatever is still rejected when it runs out.
//!
//! Every drop is reported through the [`LossReporter`] before the records are
//! released.

use crate::backoff::Backoff;
use crate::config::RetryPolicy;
use crate::destination::{Destination, PublishOutcome};
use crate::errors::PublishError;
use crate::loss::{LossEvent, LossReason, LossReporter};
use crate::queue::BoundedQueue;
use crate::record::{Batch, LogRecord, RecordId};

use std::collections::HashSet;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::time::{sleep, Duration, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;

/// How a single batch left the driver
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeliveryResult {
    /// Every record was accepted
    Delivered,
    /// Some records were accepted, the rest were dropped
    Partial { delivered: usize, dropped: usize },
    /// Nothing was accepted and the batch was dropped
    Dropped,
    /// Delivery was cut short by the drain deadline
    Aborted,
}

/// In-flight state of one batch
#[derive(Debug)]
pub struct DeliveryAttempt {
    pub batch_id: Uuid,
    pub batch_sequence: u64,
    /// Publish calls made so far
    pub attempt: u32,
    pub last_error: Option<PublishError>,
    pub next_backoff: Option<Instant>,
    records: Vec<LogRecord>,
    started: Instant,
    delivered: usize,
}

impl DeliveryAttempt {
    pub fn new(batch: Batch) -> Self {
        Self {
            batch_id: batch.id(),
            batch_sequence: batch.sequence(),
            attempt: 0,
            last_error: None,
            next_backoff: None,
            records: batch.into_records(),
            started: Instant::now(),
            delivered: 0,
        }
    }

    /// Records still awaiting acceptance
    pub fn pending(&self) -> &[LogRecord] {
        &self.records
    }

    pub fn elapsed(&self) -> Duration {
        self.started.elapsed()
    }

    /// Drop accepted records, keep rejected and unacknowledged ones.
    ///
    /// Returns the number of records newly delivered and the error to retry
    /// the remainder with.
    fn settle(&mut self, outcome: PublishOutcome) -> (usize, Option<PublishError>) {
        let accepted: HashSet<RecordId> = outcome.accepted.into_iter().collect();
        let before = self.records.len();
        self.records.retain(|record| !accepted.contains(&record.id()));
        let delivered = before - self.records.len();
        self.delivered += delivered;

        if self.records.is_empty() {
            return (delivered, None);
        }

        let error = outcome
            .rejected
            .into_iter()
            .find(|rejection| self.records.iter().any(|r| r.id() == rejection.id))
            .map(|rejection| rejection.error)
            .unwrap_or_else(|| PublishError::retryable("records not acknowledged by destination"));
        (delivered, Some(error))
    }
}

/// Delivery counters
#[derive(Debug, Default)]
pub struct DeliveryStats {
    batches_delivered: AtomicU64,
    records_delivered: AtomicU64,
    batches_dropped: AtomicU64,
    publish_calls: AtomicU64,
    retries: AtomicU64,
}

impl DeliveryStats {
    pub fn snapshot(&self) -> DeliverySnapshot {
        DeliverySnapshot {
            batches_delivered: self.batches_delivered.load(Ordering::Relaxed),
            records_delivered: self.records_delivered.load(Ordering::Relaxed),
            batches_dropped: self.batches_dropped.load(Ordering::Relaxed),
            publish_calls: self.publish_calls.load(Ordering::Relaxed),
            retries: self.retries.load(Ordering::Relaxed),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DeliverySnapshot {
    pub batches_delivered: u64,
    pub records_delivered: u64,
    pub batches_dropped: u64,
    pub publish_calls: u64,
    pub retries: u64,
}

pub struct DeliveryDriver<D> {
    destination: D,
    backoff: Backoff,
    losses: LossReporter,
    stats: Arc<DeliveryStats>,
}

impl<D: Destination> DeliveryDriver<D> {
    pub fn new(destination: D, retry: RetryPolicy, losses: LossReporter) -> Self {
        Self {
            destination,
            backoff: Backoff::new(retry),
            losses,
            stats: Arc::new(DeliveryStats::default()),
        }
    }

    pub fn stats(&self) -> Arc<DeliveryStats> {
        Arc::clone(&self.stats)
    }

    pub fn destination(&self) -> &D {
        &self.destination
    }

    /// Deliver batches until the queue is closed and empty, or `abort` fires.
    ///
    /// On abort, the in-flight batch and everything still queued are reported
    /// lost with [`LossReason::DrainDeadline`].
    #[instrument(skip_all, fields(destination = self.destination.name()))]
    pub async fn run(
        mut self,
        queue: Arc<BoundedQueue>,
        abort: CancellationToken,
    ) -> DeliverySnapshot {
        info!("Delivery driver started");

        loop {
            let batch = tokio::select! {
                biased;
                () = abort.cancelled() => break,
                next = queue.pop() => match next {
                    Some(batch) => batch,
                    None => break,
                },
            };
            self.deliver(batch, &abort).await;
        }

        if abort.is_cancelled() {
            for batch in queue.drain_remaining() {
                self.stats.batches_dropped.fetch_add(1, Ordering::Relaxed);
                self.losses.report(LossEvent::for_records(
                    LossReason::DrainDeadline,
                    batch.records(),
                    format!("drain deadline elapsed with batch {} still queued", batch.sequence()),
                ));
            }
        }

        let snapshot = self.stats.snapshot();
        info!(
            "Delivery driver stopped - delivered {} batches ({} records), dropped {}, {} retries",
            snapshot.batches_delivered,
            snapshot.records_delivered,
            snapshot.batches_dropped,
            snapshot.retries
        );
        snapshot
    }

    /// Deliver one batch, retrying as the policy allows
    pub async fn deliver(&mut self, batch: Batch, abort: &CancellationToken) -> DeliveryResult {
        let mut attempt = DeliveryAttempt::new(batch);
        let total = attempt.pending().len();

        loop {
            // A publish that completes in the same poll as the abort still counts
            let published = tokio::select! {
                biased;
                published = self.destination.publish(attempt.pending()) => published,
                () = abort.cancelled() => return self.abort(attempt),
            };
            attempt.attempt += 1;
            attempt.next_backoff = None;
            self.stats.publish_calls.fetch_add(1, Ordering::Relaxed);

            let (error, whole_batch) = match published {
                Ok(outcome) => {
                    let (delivered, error) = attempt.settle(outcome);
                    self.stats
                        .records_delivered
                        .fetch_add(delivered as u64, Ordering::Relaxed);
                    match error {
                        None => {
                            self.stats.batches_delivered.fetch_add(1, Ordering::Relaxed);
                            debug!(
                                "Delivered batch {} (attempt {})",
                                attempt.batch_sequence, attempt.attempt
                            );
                            return if attempt.delivered == total {
                                DeliveryResult::Delivered
                            } else {
                                DeliveryResult::Partial {
                                    delivered: attempt.delivered,
                                    dropped: total - attempt.delivered,
                                }
                            };
                        }
                        Some(error) => {
                            debug!(
                                "Batch {}: {} records accepted, {} rejected",
                                attempt.batch_sequence,
                                delivered,
                                attempt.pending().len()
                            );
                            (error, false)
                        }
                    }
                }
                Err(error) => (error, true),
            };

            if whole_batch && !error.is_retryable() {
                error!(
                    "Batch {} rejected with terminal error: {}",
                    attempt.batch_sequence, error
                );
                attempt.last_error = Some(error);
                return self.drop_pending(attempt, LossReason::Terminal, total);
            }

            let retries_used = attempt.attempt - 1;
            let delay = self.backoff.delay(retries_used);
            let policy = self.backoff.policy();
            let out_of_budget = retries_used >= policy.max_retries
                || attempt.elapsed() + delay > policy.max_elapsed;
            let reason = if error.is_retryable() {
                LossReason::RetriesExhausted
            } else {
                LossReason::Terminal
            };
            attempt.last_error = Some(error);

            if out_of_budget {
                error!(
                    "Giving up on batch {} after {} attempts: {}",
                    attempt.batch_sequence,
                    attempt.attempt,
                    attempt.last_error.as_ref().map(ToString::to_string).unwrap_or_default()
                );
                return self.drop_pending(attempt, reason, total);
            }

            self.stats.retries.fetch_add(1, Ordering::Relaxed);
            attempt.next_backoff = Some(Instant::now() + delay);
            warn!(
                "Failed to deliver {} records of batch {} (attempt {}), retrying in {}ms: {}",
                attempt.pending().len(),
                attempt.batch_sequence,
                attempt.attempt,
                delay.as_millis(),
                attempt.last_error.as_ref().map(ToString::to_string).unwrap_or_default()
            );

            tokio::select! {
                biased;
                () = abort.cancelled() => return self.abort(attempt),
                () = sleep(delay) => {}
            }
        }
    }

    fn drop_pending(
        &self,
        attempt: DeliveryAttempt,
        reason: LossReason,
        total: usize,
    ) -> DeliveryResult {
        let detail = match &attempt.last_error {
            Some(error) => format!(
                "batch {} after {} attempts: {}",
                attempt.batch_sequence, attempt.attempt, error.message
            ),
            None => format!("batch {} after {} attempts", attempt.batch_sequence, attempt.attempt),
        };
        let dropped = attempt.pending().len();
        self.losses
            .report(LossEvent::for_records(reason, attempt.pending(), detail));

        if attempt.delivered == 0 {
            self.stats.batches_dropped.fetch_add(1, Ordering::Relaxed);
            DeliveryResult::Dropped
        } else {
            self.stats.batches_delivered.fetch_add(1, Ordering::Relaxed);
            debug_assert_eq!(attempt.delivered + dropped, total);
            DeliveryResult::Partial {
                delivered: attempt.delivered,
                dropped,
            }
        }
    }

    fn abort(&self, attempt: DeliveryAttempt) -> DeliveryResult {
        warn!(
            "Drain deadline reached while delivering batch {}",
            attempt.batch_sequence
        );
        self.stats.batches_dropped.fetch_add(1, Ordering::Relaxed);
        self.losses.report(LossEvent::for_records(
            LossReason::DrainDeadline,
            attempt.pending(),
            format!("batch {} was in flight at the drain deadline", attempt.batch_sequence),
        ));
        DeliveryResult::Aborted
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::accumulator::BatchAccumulator;
    use crate::config::BatchLimits;
    use crate::destination::Rejection;
    use crate::loss::CollectingLossSink;
    use crate::record::Source;
    use async_trait::async_trait;
    use std::collections::VecDeque;
    use std::sync::Mutex;

    type Scripted = Result<Vec<RecordId>, PublishError>;

    /// Replies from a script; `Ok(ids)` rejects the listed ids as malformed
    #[derive(Default)]
    struct ScriptedDestination {
        script: Mutex<VecDeque<Scripted>>,
        calls: Mutex<Vec<(Instant, Vec<String>)>>,
    }

    impl ScriptedDestination {
        fn new(script: Vec<Scripted>) -> Self {
            Self {
                script: Mutex::new(script.into()),
                calls: Mutex::new(Vec::new()),
            }
        }

        fn calls(&self) -> Vec<(Instant, Vec<String>)> {
            self.calls.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl Destination for ScriptedDestination {
        fn name(&self) -> &'static str {
            "scripted"
        }

        async fn publish(&self, records: &[LogRecord]) -> Result<PublishOutcome, PublishError> {
            self.calls
                .lock()
                .unwrap()
                .push((Instant::now(), records.iter().map(LogRecord::message).collect()));

            match self.script.lock().unwrap().pop_front() {
                None => Ok(PublishOutcome::all_accepted(records)),
                Some(Err(error)) => Err(error),
                Some(Ok(rejected)) => {
                    let rejections = records
                        .iter()
                        .filter(|r| rejected.contains(&r.id()))
                        .map(|r| Rejection {
                            id: r.id(),
                            error: PublishError::terminal("malformed"),
                        })
                        .collect();
                    Ok(PublishOutcome::with_rejections(records, rejections))
                }
            }
        }
    }

    fn retry_policy(max_retries: u32) -> RetryPolicy {
        RetryPolicy {
            max_retries,
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(5),
            max_elapsed: Duration::from_secs(60),
            seed: Some(7),
        }
    }

    fn batch_of(lines: &[&str]) -> Batch {
        let mut accumulator = BatchAccumulator::new(BatchLimits::default());
        for (i, line) in lines.iter().enumerate() {
            accumulator.push(LogRecord::new(Source::Stdout, i as u64, line.as_bytes().to_vec()));
        }
        accumulator.flush().unwrap()
    }

    type Harness = (
        DeliveryDriver<Arc<ScriptedDestination>>,
        Arc<ScriptedDestination>,
        Arc<CollectingLossSink>,
    );

    fn driver(script: Vec<Scripted>, max_retries: u32) -> Harness {
        let destination = Arc::new(ScriptedDestination::new(script));
        let sink = Arc::new(CollectingLossSink::default());
        let driver = DeliveryDriver::new(
            Arc::clone(&destination),
            retry_policy(max_retries),
            LossReporter::new(sink.clone()),
        );
        (driver, destination, sink)
    }

    #[tokio::test(start_paused = true)]
    async fn test_retries_throttling_with_increasing_backoff() {
        let (mut driver, destination, sink) = driver(
            vec![
                Err(PublishError::retryable("throttled")),
                Err(PublishError::retryable("throttled")),
            ],
            5,
        );

        let result = driver.deliver(batch_of(&["a", "b"]), &CancellationToken::new()).await;

        assert_eq!(result, DeliveryResult::Delivered);
        let calls = destination.calls();
        assert_eq!(calls.len(), 3);
        let first_wait = calls[1].0 - calls[0].0;
        let second_wait = calls[2].0 - calls[1].0;
        assert!(first_wait >= Duration::from_millis(50));
        assert!(second_wait > first_wait);

        let stats = driver.stats().snapshot();
        assert_eq!(stats.retries, 2);
        assert_eq!(stats.batches_delivered, 1);
        assert_eq!(stats.records_delivered, 2);
        assert!(sink.events().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_terminal_error_drops_batch() {
        let (mut driver, destination, sink) =
            driver(vec![Err(PublishError::terminal("access denied"))], 5);

        let result = driver.deliver(batch_of(&["a", "b"]), &CancellationToken::new()).await;

        assert_eq!(result, DeliveryResult::Dropped);
        assert_eq!(destination.calls().len(), 1);
        let events = sink.events();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].reason, LossReason::Terminal);
        assert_eq!(events[0].records, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_partial_rejection_retries_rejected_records_alone() {
        let batch = batch_of(&["r1", "r2", "r3"]);
        let r2 = batch.records()[1].id();
        let (mut driver, destination, sink) =
            driver(vec![Ok(vec![r2]), Ok(vec![r2]), Ok(vec![r2])], 2);

        let result = driver.deliver(batch, &CancellationToken::new()).await;

        assert_eq!(result, DeliveryResult::Partial { delivered: 2, dropped: 1 });
        let calls: Vec<Vec<String>> = destination.calls().into_iter().map(|(_, m)| m).collect();
        assert_eq!(calls[0], vec!["r1", "r2", "r3"]);
        assert_eq!(calls[1], vec!["r2"]);
        assert_eq!(calls[2], vec!["r2"]);
        assert_eq!(calls.len(), 3);

        let events = sink.events();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].reason, LossReason::Terminal);
        assert_eq!(events[0].record_ids, vec![r2]);
        assert_eq!(driver.stats().snapshot().records_delivered, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_partial_rejection_recovers_on_retry() {
        let batch = batch_of(&["r1", "r2", "r3"]);
        let r2 = batch.records()[1].id();
        let (mut driver, _destination, sink) = driver(vec![Ok(vec![r2])], 2);

        let result = driver.deliver(batch, &CancellationToken::new()).await;

        assert_eq!(result, DeliveryResult::Delivered);
        assert!(sink.events().is_empty());
        assert_eq!(driver.stats().snapshot().records_delivered, 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_budget_exhaustion() {
        let script = (0..10).map(|_| Err(PublishError::retryable("unavailable"))).collect();
        let (mut driver, destination, sink) = driver(script, 3);

        let result = driver.deliver(batch_of(&["a"]), &CancellationToken::new()).await;

        assert_eq!(result, DeliveryResult::Dropped);
        assert_eq!(destination.calls().len(), 4);
        let events = sink.events();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].reason, LossReason::RetriesExhausted);
    }

    #[tokio::test(start_paused = true)]
    async fn test_elapsed_budget_limits_retries() {
        let script = (0..50).map(|_| Err(PublishError::retryable("unavailable"))).collect();
        let destination = Arc::new(ScriptedDestination::new(script));
        let sink = Arc::new(CollectingLossSink::default());
        let mut driver = DeliveryDriver::new(
            Arc::clone(&destination),
            RetryPolicy {
                max_elapsed: Duration::from_secs(1),
                ..retry_policy(50)
            },
            LossReporter::new(sink.clone()),
        );

        let start = Instant::now();
        assert_eq!(
            driver.deliver(batch_of(&["a"]), &CancellationToken::new()).await,
            DeliveryResult::Dropped
        );
        assert!(start.elapsed() <= Duration::from_secs(1));
        assert!(destination.calls().len() < 10);
        assert_eq!(sink.events()[0].reason, LossReason::RetriesExhausted);
    }

    #[tokio::test(start_paused = true)]
    async fn test_abort_during_backoff_reports_loss() {
        let script = (0..10).map(|_| Err(PublishError::retryable("throttled"))).collect();
        let (driver, _destination, sink) = driver(script, 10);
        let queue = Arc::new(BoundedQueue::new(4, crate::config::OverflowPolicy::Block));
        queue.push(batch_of(&["in flight"])).await.unwrap();
        queue.push(batch_of(&["queued"])).await.unwrap();

        let abort = CancellationToken::new();
        let handle = tokio::spawn(driver.run(Arc::clone(&queue), abort.clone()));
        tokio::time::sleep(Duration::from_millis(250)).await;
        abort.cancel();
        let snapshot = handle.await.unwrap();

        assert_eq!(snapshot.batches_delivered, 0);
        assert_eq!(snapshot.batches_dropped, 2);
        let events = sink.events();
        assert_eq!(events.len(), 2);
        assert!(events.iter().all(|e| e.reason == LossReason::DrainDeadline));
        assert!(queue.is_closed());
    }

    /// Holds every publish until released, then accepts it
    #[derive(Default)]
    struct HeldDestination {
        release: tokio::sync::Notify,
    }

    #[async_trait]
    impl Destination for HeldDestination {
        fn name(&self) -> &'static str {
            "held"
        }

        async fn publish(&self, records: &[LogRecord]) -> Result<PublishOutcome, PublishError> {
            self.release.notified().await;
            Ok(PublishOutcome::all_accepted(records))
        }
    }

    #[tokio::test]
    async fn test_publish_finishing_with_the_abort_is_not_lost() {
        let destination = Arc::new(HeldDestination::default());
        let sink = Arc::new(CollectingLossSink::default());
        let mut driver = DeliveryDriver::new(
            Arc::clone(&destination),
            retry_policy(0),
            LossReporter::new(sink.clone()),
        );
        let abort = CancellationToken::new();

        let handle = tokio::spawn({
            let abort = abort.clone();
            async move {
                let result = driver.deliver(batch_of(&["a", "b"]), &abort).await;
                (result, driver.stats().snapshot())
            }
        });
        tokio::task::yield_now().await;

        // Both are ready by the time the driver is polled again
        abort.cancel();
        destination.release.notify_one();
        let (result, stats) = handle.await.unwrap();

        assert_eq!(result, DeliveryResult::Delivered);
        assert_eq!(stats.records_delivered, 2);
        assert_eq!(stats.batches_dropped, 0);
        assert!(sink.events().is_empty());
    }

    #[tokio::test]
    async fn test_run_preserves_seal_order() {
        let (driver, destination, _sink) = driver(vec![], 0);
        let queue = Arc::new(BoundedQueue::new(4, crate::config::OverflowPolicy::Block));
        let mut accumulator = BatchAccumulator::new(BatchLimits {
            max_records: 1,
            ..BatchLimits::default()
        });
        for (i, line) in ["one", "two", "three"].into_iter().enumerate() {
            for batch in accumulator.push(LogRecord::new(Source::Stdout, i as u64, line.into())) {
                queue.push(batch).await.unwrap();
            }
        }
        queue.close();

        let snapshot = driver.run(Arc::clone(&queue), CancellationToken::new()).await;

        assert_eq!(snapshot.batches_delivered, 3);
        let calls: Vec<Vec<String>> = destination.calls().into_iter().map(|(_, m)| m).collect();
        assert_eq!(calls, vec![vec!["one"], vec!["two"], vec!["three"]]);
    }
}
