//! Pipeline assembly and lifecycle
//!
//! Each container stream gets its own reader task feeding a small channel.
//! A single accumulator task seals batches onto the bounded queue and a single
//! delivery task publishes them. The [`ShutdownCoordinator`] moves the whole
//! thing from Running to Draining to Stopped.

use crate::accumulator::BatchAccumulator;
use crate::config::Config;
use crate::delivery::{DeliveryDriver, DeliverySnapshot};
use crate::destination::Destination;
use crate::errors::{Result, ShimError};
use crate::framer::RecordFramer;
use crate::input::BoxedReader;
use crate::loss::{LossReporter, LossSink, LossSnapshot};
use crate::queue::BoundedQueue;
use crate::record::Source;
use crate::shutdown::{PipelineState, ShutdownCoordinator};

use std::future::Future;
use std::sync::Arc;
use tokio::io::AsyncRead;
use tokio::sync::{mpsc, watch};
use tokio::task::{JoinError, JoinSet};
use tracing::{error, info, instrument};

/// Records in flight between the readers and the accumulator
pub const RECORD_CHANNEL_CAPACITY: usize = 256;

/// Counters gathered over one pipeline run
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PipelineStats {
    pub records_forwarded: u64,
    pub batches_sealed: u64,
    pub delivery: DeliverySnapshot,
    pub losses: LossSnapshot,
}

impl PipelineStats {
    pub fn records_lost(&self) -> u64 {
        self.losses.total_records()
    }
}

/// Result of a pipeline run that stopped without a fatal error
#[derive(Debug, Clone)]
pub struct PipelineReport {
    pub stats: PipelineStats,
    /// The drain deadline elapsed and undelivered data was abandoned
    pub deadline_elapsed: bool,
}

pub struct Pipeline<D> {
    config: Config,
    destination: D,
    inputs: Vec<(Source, BoxedReader)>,
    losses: LossReporter,
    coordinator: ShutdownCoordinator,
}

impl<D: Destination + 'static> Pipeline<D> {
    pub fn new(config: Config, destination: D) -> Result<Self> {
        config.validate().map_err(ShimError::Config)?;
        let coordinator = ShutdownCoordinator::new(config.drain_timeout);

        Ok(Self {
            config,
            destination,
            inputs: Vec::new(),
            losses: LossReporter::default(),
            coordinator,
        })
    }

    /// Add a container output stream to read from
    pub fn with_source<R>(mut self, source: Source, reader: R) -> Self
    where
        R: AsyncRead + Send + Unpin + 'static,
    {
        self.inputs.push((source, Box::new(reader)));
        self
    }

    /// Send loss events to `sink` instead of the log
    pub fn with_loss_sink(mut self, sink: Arc<dyn LossSink>) -> Self {
        self.losses = LossReporter::new(sink);
        self
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Watch the lifecycle state
    pub fn state(&self) -> watch::Receiver<PipelineState> {
        self.coordinator.subscribe()
    }

    pub fn losses(&self) -> LossReporter {
        self.losses.clone()
    }

    /// Run until every stream ends or `signal` completes, then drain.
    ///
    /// A read error on any stream also starts the drain; once Stopped it is
    /// returned as the error of the run.
    #[instrument(skip_all, fields(destination = self.destination.name()))]
    pub async fn run<S>(self, signal: S) -> Result<PipelineReport>
    where
        S: Future<Output = ()>,
    {
        let Self {
            config,
            destination,
            inputs,
            losses,
            coordinator,
        } = self;

        info!(
            "Starting pipeline with {} sources, queue capacity {} ({}), drain timeout {}ms",
            inputs.len(),
            config.queue_capacity,
            config.overflow_policy,
            config.drain_timeout.as_millis()
        );

        let queue = Arc::new(BoundedQueue::new(
            config.queue_capacity,
            config.overflow_policy,
        ));
        let (records_tx, records_rx) = mpsc::channel(RECORD_CHANNEL_CAPACITY);

        let mut readers = JoinSet::new();
        for (source, reader) in inputs {
            let framer = RecordFramer::new(reader, source)
                .with_max_record_bytes(config.batch.max_record_bytes);
            readers.spawn(framer.forward(
                records_tx.clone(),
                coordinator.shutdown_token(),
                losses.clone(),
            ));
        }
        drop(records_tx);

        let accumulator = tokio::spawn(BatchAccumulator::new(config.batch.clone()).run(
            records_rx,
            Arc::clone(&queue),
            coordinator.abort_token(),
            losses.clone(),
        ));
        let driver = DeliveryDriver::new(destination, config.retry.clone(), losses.clone());
        let delivery = tokio::spawn(driver.run(Arc::clone(&queue), coordinator.abort_token()));

        let mut outcome = ReaderOutcome::default();
        tokio::pin!(signal);

        let cause = loop {
            tokio::select! {
                biased;
                () = &mut signal => break "shutdown signal",
                joined = readers.join_next() => match joined {
                    None => break "end of stream",
                    Some(joined) => {
                        if outcome.record(joined) {
                            break "upstream read error";
                        }
                    }
                },
            }
        };
        coordinator.begin_drain(cause);

        let ((sealed, delivered), deadline_elapsed) = coordinator
            .drain(async {
                while let Some(joined) = readers.join_next().await {
                    outcome.record(joined);
                }
                let sealed = accumulator.await;
                let delivered = delivery.await;
                (sealed, delivered)
            })
            .await;

        coordinator.stop()?;

        let stats = PipelineStats {
            records_forwarded: outcome.forwarded,
            batches_sealed: sealed.as_ref().copied().unwrap_or_default(),
            delivery: delivered.as_ref().copied().unwrap_or_default(),
            losses: losses.snapshot(),
        };
        info!(
            "Pipeline stopped - forwarded {} records in {} batches, \
             delivered {} records, lost {}, {} retries",
            stats.records_forwarded,
            stats.batches_sealed,
            stats.delivery.records_delivered,
            stats.records_lost(),
            stats.delivery.retries
        );

        if let Some(error) = outcome.fatal {
            return Err(error);
        }
        sealed.map_err(|e| task_error("accumulator", e))?;
        delivered.map_err(|e| task_error("delivery", e))?;

        Ok(PipelineReport {
            stats,
            deadline_elapsed,
        })
    }
}

fn task_error(task: &str, error: JoinError) -> ShimError {
    ShimError::Task(format!("{task} task failed: {error}"))
}

#[derive(Default)]
struct ReaderOutcome {
    forwarded: u64,
    fatal: Option<ShimError>,
}

impl ReaderOutcome {
    /// Returns true if the reader failed
    fn record(&mut self, joined: std::result::Result<Result<u64>, JoinError>) -> bool {
        let error = match joined {
            Ok(Ok(forwarded)) => {
                self.forwarded += forwarded;
                return false;
            }
            Ok(Err(error)) => error,
            Err(error) => task_error("reader", error),
        };

        error!("Reader failed: {}", error);
        if self.fatal.is_none() {
            self.fatal = Some(error);
        }
        true
    }
}
