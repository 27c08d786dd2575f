//! Deadline middleware for backend calls.
//!
//! Fails calls that exceed `options.deadline` with `StateError::Timeout`.
//! A timed-out read has no effect; a timed-out mutation has an unknown
//! outcome.

use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll};

use fnstate_core::StateError;
use tower::{Layer, Service};

use crate::pipeline::dispatch::{Dispatch, Reply};

// ---------------------------------------------------------------------------
// DeadlineLayer
// ---------------------------------------------------------------------------

/// Tower layer enforcing the deadline carried by each [`Dispatch`].
#[derive(Debug, Clone)]
pub struct DeadlineLayer;

impl<S> Layer<S> for DeadlineLayer {
    type Service = DeadlineService<S>;

    fn layer(&self, inner: S) -> Self::Service {
        DeadlineService { inner }
    }
}

// ---------------------------------------------------------------------------
// DeadlineService
// ---------------------------------------------------------------------------

/// Service wrapper that enforces per-call deadlines.
#[derive(Debug, Clone)]
pub struct DeadlineService<S> {
    inner: S,
}

impl<S> Service<Dispatch> for DeadlineService<S>
where
    S: Service<Dispatch, Response = Reply, Error = StateError> + Send,
    S::Future: Send + 'static,
{
    type Response = Reply;
    type Error = StateError;
    type Future = Pin<Box<dyn Future<Output = Result<Reply, StateError>> + Send>>;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.inner.poll_ready(cx)
    }

    fn call(&mut self, dispatch: Dispatch) -> Self::Future {
        let deadline = dispatch.options.deadline;
        let outcome = dispatch.failure_outcome();
        let fut = self.inner.call(dispatch);
        Box::pin(async move {
            match tokio::time::timeout(deadline, fut).await {
                Ok(result) => result,
                Err(_elapsed) => {
                    #[allow(clippy::cast_possible_truncation)]
                    let timeout_ms = deadline.as_millis() as u64;
                    Err(StateError::Timeout {
                        timeout_ms,
                        outcome,
                    })
                }
            }
        })
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use bytes::Bytes;
    use fnstate_core::{OperationKind, Outcome, StoreKey};
    use tower::ServiceExt;

    use super::*;
    use crate::backend::CallOptions;

    /// Service that takes a configurable delay before responding.
    struct SlowService {
        delay_ms: u64,
    }

    impl Service<Dispatch> for SlowService {
        type Response = Reply;
        type Error = StateError;
        type Future = Pin<Box<dyn Future<Output = Result<Reply, StateError>> + Send>>;

        fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
            Poll::Ready(Ok(()))
        }

        fn call(&mut self, _dispatch: Dispatch) -> Self::Future {
            let delay = self.delay_ms;
            Box::pin(async move {
                tokio::time::sleep(Duration::from_millis(delay)).await;
                Ok(Reply::Ack)
            })
        }
    }

    fn make_dispatch(kind: OperationKind, deadline_ms: u64) -> Dispatch {
        Dispatch {
            store: StoreKey::new("t", "ns", "s").unwrap(),
            key: Bytes::from_static(b"k"),
            kind,
            options: CallOptions::new(Duration::from_millis(deadline_ms)),
        }
    }

    #[tokio::test]
    async fn completes_within_deadline() {
        let svc = DeadlineLayer.layer(SlowService { delay_ms: 10 });
        let reply = svc
            .oneshot(make_dispatch(OperationKind::Delete, 1000))
            .await
            .unwrap();
        assert_eq!(reply, Reply::Ack);
    }

    #[tokio::test]
    async fn expired_mutation_has_unknown_outcome() {
        let svc = DeadlineLayer.layer(SlowService { delay_ms: 200 });
        let err = svc
            .oneshot(make_dispatch(OperationKind::IncrBy(1), 50))
            .await
            .unwrap_err();
        assert_eq!(
            err,
            StateError::Timeout {
                timeout_ms: 50,
                outcome: Outcome::Unknown
            }
        );
    }

    #[tokio::test]
    async fn expired_read_was_not_applied() {
        let svc = DeadlineLayer.layer(SlowService { delay_ms: 200 });
        let err = svc
            .oneshot(make_dispatch(OperationKind::Get, 50))
            .await
            .unwrap_err();
        assert_eq!(err.outcome(), Outcome::NotApplied);
    }
}
