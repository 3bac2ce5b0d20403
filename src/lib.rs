//! Container Log Shim Library
//!
//! Forwards a container's stdout and stderr to a log destination in bounded
//! batches. Anything that cannot be delivered is reported through the loss
//! reporter rather than dropped silently.

pub mod accumulator;
pub mod backoff;
pub mod cli;
pub mod config;
pub mod delivery;
pub mod destination;
pub mod errors;
pub mod framer;
pub mod input;
pub mod loss;
pub mod options;
pub mod pipeline;
pub mod queue;
pub mod record;
pub mod shutdown;

pub use config::{BatchLimits, Config, OverflowPolicy, RetryPolicy};
pub use destination::{Destination, FileDestination, HttpDestination, PublishOutcome, Rejection};
pub use errors::{ErrorKind, PublishError, Result, ShimError};
pub use loss::{LossEvent, LossReason, LossReporter, LossSink};
pub use pipeline::{Pipeline, PipelineReport, PipelineStats};
pub use record::{Batch, LogRecord, RecordId, Source};
pub use shutdown::PipelineState;
