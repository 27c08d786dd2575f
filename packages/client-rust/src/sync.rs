//! Blocking façade over the async pipeline.
//!
//! Every blocking operation is its async form submitted to the pipeline and
//! waited on with a bounded timeout. On timeout the future is cancelled, so
//! an operation still queued never reaches the backend.

use std::future::Future;
use std::time::Duration;

use fnstate_core::{Outcome, StateError};
use tokio::runtime::{Handle, RuntimeFlavor};
use tokio::time::Instant;

use crate::pipeline::OpFuture;

/// Turns pipeline futures into blocking calls.
#[derive(Debug, Clone)]
pub struct SyncAdapter {
    timeout: Duration,
    runtime: Handle,
}

impl SyncAdapter {
    /// `runtime` drives the wait when the caller is not on a runtime thread.
    #[must_use]
    pub fn new(timeout: Duration, runtime: Handle) -> Self {
        Self { timeout, runtime }
    }

    #[must_use]
    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Waits for `admission`, then submits and waits for the operation, all
    /// within one timeout.
    ///
    /// # Errors
    ///
    /// Returns the operation's own error unchanged, `Timeout` if the
    /// timeout elapses, or `InvalidArgument` when called from a
    /// current-thread runtime, where blocking would deadlock the pipeline.
    pub fn wait<T, A, S>(&self, admission: A, submit: S) -> Result<T, StateError>
    where
        A: Future<Output = ()>,
        S: FnOnce() -> OpFuture<T>,
    {
        let timeout = self.timeout;
        self.block_on(async move {
            let deadline = Instant::now() + timeout;
            if tokio::time::timeout_at(deadline, admission).await.is_err() {
                // Never submitted.
                return Err(timeout_error(timeout, Outcome::NotApplied));
            }

            let mut fut = submit();
            match tokio::time::timeout_at(deadline, &mut fut).await {
                Ok(result) => result,
                Err(_elapsed) => {
                    let removed = fut.cancel();
                    tracing::debug!(
                        ?timeout,
                        removed,
                        "blocking call timed out"
                    );
                    Err(timeout_error(timeout, Outcome::Unknown))
                }
            }
        })?
    }

    /// Runs `fut` to completion on the calling thread.
    fn block_on<F: Future>(&self, fut: F) -> Result<F::Output, StateError> {
        match Handle::try_current() {
            Ok(current) => match current.runtime_flavor() {
                RuntimeFlavor::CurrentThread => Err(StateError::invalid(
                    "blocking state calls are not allowed on a current-thread runtime; use the async form",
                )),
                _ => Ok(tokio::task::block_in_place(|| current.block_on(fut))),
            },
            Err(_) => Ok(self.runtime.block_on(fut)),
        }
    }
}

fn timeout_error(timeout: Duration, outcome: Outcome) -> StateError {
    #[allow(clippy::cast_possible_truncation)]
    let timeout_ms = timeout.as_millis() as u64;
    StateError::Timeout {
        timeout_ms,
        outcome,
    }
}
