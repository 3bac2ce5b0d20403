//! Fixed-capacity FIFO of sealed batches between accumulation and delivery
//!
//! The queue is the only structure shared by the producer path and the
//! delivery driver. Its capacity, together with the batch byte bound, caps the
//! memory the shim holds for an unreachable destination. What happens when it
//! is full is decided by [`OverflowPolicy`]:
//!
//! - `Block` makes the producer wait for a free slot, which in turn stalls the
//!   readers and pushes backpressure onto the container's pipes.
//! - `DropOldest` evicts the oldest queued batch, hands it back to the caller
//!   for loss reporting, and enqueues the new one.

use crate::config::OverflowPolicy;
use crate::record::Batch;

use std::collections::VecDeque;
use std::sync::Mutex;
use tokio::sync::Notify;
use tracing::debug;

/// Result of a successful push
#[derive(Debug)]
pub enum PushOutcome {
    Enqueued,
    /// The queue was full; this batch was evicted to make room
    EvictedOldest(Batch),
}

/// The queue was closed; the batch is handed back undelivered
#[derive(Debug)]
pub struct QueueClosed(pub Batch);

/// Why [`BoundedQueue::try_push`] could not enqueue
#[derive(Debug)]
pub enum TryPushError {
    Full(Batch),
    Closed(Batch),
}

#[derive(Debug, Default)]
struct State {
    batches: VecDeque<Batch>,
    bytes: usize,
    closed: bool,
}

#[derive(Debug)]
pub struct BoundedQueue {
    state: Mutex<State>,
    capacity: usize,
    policy: OverflowPolicy,
    not_empty: Notify,
    not_full: Notify,
}

impl BoundedQueue {
    pub fn new(capacity: usize, policy: OverflowPolicy) -> Self {
        Self {
            state: Mutex::new(State::default()),
            capacity: capacity.max(1),
            policy,
            not_empty: Notify::new(),
            not_full: Notify::new(),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Enqueue a batch, applying the overflow policy when full
    pub async fn push(&self, mut batch: Batch) -> Result<PushOutcome, QueueClosed> {
        loop {
            let notified = self.not_full.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            batch = match self.try_push(batch) {
                Ok(outcome) => return Ok(outcome),
                Err(TryPushError::Closed(batch)) => return Err(QueueClosed(batch)),
                Err(TryPushError::Full(batch)) => batch,
            };

            debug!("Queue full, waiting for delivery to free a slot");
            notified.await;
        }
    }

    /// Enqueue without waiting
    pub fn try_push(&self, batch: Batch) -> Result<PushOutcome, TryPushError> {
        let mut state = self.lock();
        if state.closed {
            return Err(TryPushError::Closed(batch));
        }

        let mut evicted = None;
        if state.batches.len() >= self.capacity {
            if self.policy == OverflowPolicy::Block {
                return Err(TryPushError::Full(batch));
            }
            if let Some(oldest) = state.batches.pop_front() {
                state.bytes -= oldest.byte_size();
                debug!("Queue full, evicting batch {}", oldest.sequence());
                evicted = Some(oldest);
            }
        }

        state.bytes += batch.byte_size();
        state.batches.push_back(batch);
        drop(state);
        self.not_empty.notify_one();

        Ok(match evicted {
            Some(evicted) => PushOutcome::EvictedOldest(evicted),
            None => PushOutcome::Enqueued,
        })
    }

    /// Dequeue the oldest batch, waiting while empty.
    ///
    /// Returns `None` once the queue is closed and fully drained.
    pub async fn pop(&self) -> Option<Batch> {
        loop {
            let notified = self.not_empty.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            {
                let mut state = self.lock();
                if let Some(batch) = state.batches.pop_front() {
                    state.bytes -= batch.byte_size();
                    drop(state);
                    self.not_full.notify_one();
                    return Some(batch);
                }
                if state.closed {
                    return None;
                }
            }

            notified.await;
        }
    }

    /// Stop accepting batches; queued batches can still be popped
    pub fn close(&self) {
        self.lock().closed = true;
        self.not_empty.notify_waiters();
        self.not_full.notify_waiters();
    }

    /// Close the queue and take every batch still in it
    pub fn drain_remaining(&self) -> Vec<Batch> {
        let batches: Vec<Batch> = {
            let mut state = self.lock();
            state.closed = true;
            state.bytes = 0;
            state.batches.drain(..).collect()
        };
        self.not_empty.notify_waiters();
        self.not_full.notify_waiters();
        batches
    }

    pub fn len(&self) -> usize {
        self.lock().batches.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().batches.is_empty()
    }

    pub fn is_closed(&self) -> bool {
        self.lock().closed
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn policy(&self) -> OverflowPolicy {
        self.policy
    }

    /// Accounted bytes of all queued batches
    pub fn buffered_bytes(&self) -> usize {
        self.lock().bytes
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::accumulator::BatchAccumulator;
    use crate::config::{BatchLimits, Config};
    use crate::record::{LogRecord, Source};
    use std::sync::Arc;
    use std::time::Duration;

    fn batch(sequence: u64) -> Batch {
        let payload = format!("line {sequence}").into_bytes();
        let record = LogRecord::new(Source::Stdout, sequence, payload);
        let size = record.payload().len();
        Batch::new(sequence, vec![record], size)
    }

    #[tokio::test]
    async fn test_fifo_order() {
        let queue = BoundedQueue::new(3, OverflowPolicy::Block);
        for i in 0..3 {
            assert!(matches!(queue.push(batch(i)).await, Ok(PushOutcome::Enqueued)));
        }

        assert_eq!(queue.len(), 3);
        assert_eq!(queue.buffered_bytes(), 18);
        for i in 0..3 {
            assert_eq!(queue.pop().await.unwrap().sequence(), i);
        }
        assert!(queue.is_empty());
        assert_eq!(queue.buffered_bytes(), 0);
    }

    #[test]
    fn test_buffered_bytes_stay_within_capacity_times_batch_bytes() {
        for policy in [OverflowPolicy::Block, OverflowPolicy::DropOldest] {
            let config = Config {
                batch: BatchLimits {
                    max_bytes: 256,
                    max_record_bytes: 200,
                    ..BatchLimits::default()
                },
                queue_capacity: 3,
                overflow_policy: policy,
                ..Config::default()
            };
            assert!(config.validate().is_ok());
            let queue = BoundedQueue::new(config.queue_capacity, policy);
            let mut accumulator = BatchAccumulator::new(config.batch.clone());

            for i in 0..200u64 {
                let payload = vec![b'x'; (i as usize * 37) % 200];
                for sealed in accumulator.push(LogRecord::new(Source::Stdout, i, payload)) {
                    assert!(sealed.byte_size() <= config.batch.max_bytes);
                    let _ = queue.try_push(sealed);
                    assert!(queue.buffered_bytes() <= config.max_buffered_bytes());
                }
            }

            assert_eq!(queue.len(), config.queue_capacity, "{policy}");
            assert!(queue.buffered_bytes() > 0);
        }
    }

    #[tokio::test]
    async fn test_block_policy_applies_backpressure() {
        let queue = Arc::new(BoundedQueue::new(1, OverflowPolicy::Block));
        queue.push(batch(0)).await.unwrap();

        let producer = {
            let queue = Arc::clone(&queue);
            tokio::spawn(async move { queue.push(batch(1)).await })
        };

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!producer.is_finished());
        assert_eq!(queue.len(), 1);

        assert_eq!(queue.pop().await.unwrap().sequence(), 0);
        assert!(matches!(producer.await.unwrap(), Ok(PushOutcome::Enqueued)));
        assert_eq!(queue.pop().await.unwrap().sequence(), 1);
    }

    #[tokio::test]
    async fn test_try_push_reports_full() {
        let queue = BoundedQueue::new(1, OverflowPolicy::Block);
        queue.try_push(batch(0)).unwrap();

        match queue.try_push(batch(1)) {
            Err(TryPushError::Full(batch)) => assert_eq!(batch.sequence(), 1),
            other => panic!("expected full queue, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_drop_oldest_policy_evicts() {
        let queue = BoundedQueue::new(2, OverflowPolicy::DropOldest);
        queue.push(batch(0)).await.unwrap();
        queue.push(batch(1)).await.unwrap();

        match queue.push(batch(2)).await {
            Ok(PushOutcome::EvictedOldest(evicted)) => assert_eq!(evicted.sequence(), 0),
            other => panic!("expected eviction, got {other:?}"),
        }

        assert_eq!(queue.len(), 2);
        assert_eq!(queue.pop().await.unwrap().sequence(), 1);
        assert_eq!(queue.pop().await.unwrap().sequence(), 2);
    }

    #[tokio::test]
    async fn test_close_wakes_consumer_after_drain() {
        let queue = Arc::new(BoundedQueue::new(2, OverflowPolicy::Block));
        queue.push(batch(0)).await.unwrap();

        let consumer = {
            let queue = Arc::clone(&queue);
            tokio::spawn(async move {
                let mut seen = Vec::new();
                while let Some(batch) = queue.pop().await {
                    seen.push(batch.sequence());
                }
                seen
            })
        };

        tokio::time::sleep(Duration::from_millis(10)).await;
        queue.close();

        assert_eq!(consumer.await.unwrap(), vec![0]);
    }

    #[tokio::test]
    async fn test_close_releases_blocked_producer() {
        let queue = Arc::new(BoundedQueue::new(1, OverflowPolicy::Block));
        queue.push(batch(0)).await.unwrap();

        let producer = {
            let queue = Arc::clone(&queue);
            tokio::spawn(async move { queue.push(batch(1)).await })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;

        let remaining = queue.drain_remaining();

        assert_eq!(remaining.len(), 1);
        match producer.await.unwrap() {
            Err(QueueClosed(batch)) => assert_eq!(batch.sequence(), 1),
            other => panic!("expected closed queue, got {other:?}"),
        }
        assert!(queue.pop().await.is_none());
    }
}
