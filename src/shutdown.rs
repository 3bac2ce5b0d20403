//! Pipeline lifecycle and drain deadline

use crate::errors::{Result, ShimError};

use std::fmt;
use std::future::Future;
use tokio::sync::watch;
use tokio::time::{sleep, Duration};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PipelineState {
    Running,
    Draining,
    Stopped,
}

impl PipelineState {
    /// Legal moves only go forward one step at a time
    pub fn can_transition(self, next: PipelineState) -> bool {
        matches!(
            (self, next),
            (PipelineState::Running, PipelineState::Draining)
                | (PipelineState::Draining, PipelineState::Stopped)
        )
    }
}

impl fmt::Display for PipelineState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PipelineState::Running => write!(f, "running"),
            PipelineState::Draining => write!(f, "draining"),
            PipelineState::Stopped => write!(f, "stopped"),
        }
    }
}

/// Owns the lifecycle state and the two cancellation tokens.
///
/// `shutdown` is cancelled when draining starts and tells the readers to stop
/// issuing reads. `abort` is cancelled when the drain deadline elapses and
/// tells every other stage to give up and report what it still holds.
#[derive(Debug)]
pub struct ShutdownCoordinator {
    state: watch::Sender<PipelineState>,
    shutdown: CancellationToken,
    abort: CancellationToken,
    drain_timeout: Duration,
}

impl ShutdownCoordinator {
    pub fn new(drain_timeout: Duration) -> Self {
        let (state, _) = watch::channel(PipelineState::Running);
        Self {
            state,
            shutdown: CancellationToken::new(),
            abort: CancellationToken::new(),
            drain_timeout,
        }
    }

    pub fn state(&self) -> PipelineState {
        *self.state.borrow()
    }

    pub fn subscribe(&self) -> watch::Receiver<PipelineState> {
        self.state.subscribe()
    }

    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    pub fn abort_token(&self) -> CancellationToken {
        self.abort.clone()
    }

    pub fn drain_timeout(&self) -> Duration {
        self.drain_timeout
    }

    fn transition(&self, next: PipelineState) -> Result<()> {
        let mut from = next;
        let moved = self.state.send_if_modified(|state| {
            from = *state;
            if state.can_transition(next) {
                *state = next;
                true
            } else {
                false
            }
        });

        if moved {
            info!("Pipeline {} -> {}", from, next);
            Ok(())
        } else {
            Err(ShimError::State(format!("{from} -> {next}")))
        }
    }

    /// Enter Draining and stop the readers. Returns false if draining had
    /// already begun.
    pub fn begin_drain(&self, cause: &str) -> bool {
        match self.transition(PipelineState::Draining) {
            Ok(()) => {
                info!("Draining pipeline: {}", cause);
                self.shutdown.cancel();
                true
            }
            Err(_) => false,
        }
    }

    /// Wait for `work` to finish, cancelling `abort` if the drain deadline
    /// elapses first. The work is still awaited after the abort so every
    /// stage can report its losses. Returns the output and whether the
    /// deadline was hit.
    pub async fn drain<F: Future>(&self, work: F) -> (F::Output, bool) {
        tokio::pin!(work);

        tokio::select! {
            biased;
            output = &mut work => return (output, false),
            () = sleep(self.drain_timeout) => {}
        }

        warn!(
            "Drain deadline of {}ms elapsed, abandoning undelivered data",
            self.drain_timeout.as_millis()
        );
        self.abort.cancel();
        (work.await, true)
    }

    /// Enter Stopped. Must follow Draining.
    pub fn stop(&self) -> Result<()> {
        self.transition(PipelineState::Stopped)
    }
}
