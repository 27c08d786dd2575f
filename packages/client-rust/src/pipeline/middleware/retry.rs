//! Retry middleware: re-sends transient backend failures with exponential
//! backoff.
//!
//! Only calls that are safe to repeat are retried (see
//! [`Dispatch::is_retryable`]). Every attempt reuses the same
//! [`Dispatch`], so a retried increment carries the operation id of the
//! first attempt and the backend applies it once.

use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::Duration;

use backon::{ExponentialBuilder, Retryable};
use fnstate_core::StateError;
use tower::{Layer, Service, ServiceExt};
use tracing::warn;

use crate::config::RetryConfig;
use crate::pipeline::dispatch::{Dispatch, Reply};
use crate::telemetry::METRIC_BACKEND_RETRIES;

fn build_backoff(config: &RetryConfig) -> ExponentialBuilder {
    ExponentialBuilder::default()
        .with_min_delay(config.initial_delay)
        .with_max_delay(config.max_delay)
        .with_max_times(config.max_retries as usize)
        .with_factor(config.factor)
        .with_jitter()
}

// ---------------------------------------------------------------------------
// RetryLayer
// ---------------------------------------------------------------------------

/// Tower layer that retries transient failures of idempotent calls.
#[derive(Debug, Clone)]
pub struct RetryLayer {
    config: RetryConfig,
}

impl RetryLayer {
    #[must_use]
    pub fn new(config: RetryConfig) -> Self {
        Self { config }
    }
}

impl<S> Layer<S> for RetryLayer {
    type Service = RetryService<S>;

    fn layer(&self, inner: S) -> Self::Service {
        RetryService {
            inner,
            config: self.config.clone(),
        }
    }
}

// ---------------------------------------------------------------------------
// RetryService
// ---------------------------------------------------------------------------

/// Service wrapper that retries transient failures.
#[derive(Debug, Clone)]
pub struct RetryService<S> {
    inner: S,
    config: RetryConfig,
}

impl<S> Service<Dispatch> for RetryService<S>
where
    S: Service<Dispatch, Response = Reply, Error = StateError> + Clone + Send + 'static,
    S::Future: Send + 'static,
{
    type Response = Reply;
    type Error = StateError;
    type Future = Pin<Box<dyn Future<Output = Result<Reply, StateError>> + Send>>;

    fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        // Each attempt drives its own clone of the inner service to readiness.
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, dispatch: Dispatch) -> Self::Future {
        let inner = self.inner.clone();

        if self.config.max_retries == 0 || !dispatch.is_retryable() {
            return Box::pin(inner.oneshot(dispatch));
        }

        let backoff = build_backoff(&self.config);
        let max_retries = self.config.max_retries;
        let kind = dispatch.kind.name();
        let op_id = dispatch.options.op_id;

        let attempt_fn = move || {
            let svc = inner.clone();
            let dispatch = dispatch.clone();
            async move { svc.oneshot(dispatch).await }
        };

        let mut attempt = 0u32;
        let notify = move |err: &StateError, dur: Duration| {
            attempt += 1;
            metrics::counter!(METRIC_BACKEND_RETRIES, "kind" => kind).increment(1);
            #[allow(clippy::cast_possible_truncation)]
            let next_delay_ms = dur.as_millis() as u64;
            warn!(
                kind,
                %op_id,
                attempt,
                max_retries,
                next_delay_ms,
                error = %err,
                "backend call failed, will retry"
            );
        };

        Box::pin(
            attempt_fn
                .retry(backoff)
                .when(StateError::is_transient)
                .notify(notify),
        )
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    use bytes::Bytes;
    use fnstate_core::{ErrorKind, OperationKind, Outcome, StoreKey};

    use super::*;
    use crate::backend::CallOptions;

    /// Fails the first `failures` calls with `error`, then acknowledges.
    #[derive(Clone)]
    struct FlakyService {
        calls: Arc<AtomicUsize>,
        failures: usize,
        error: StateError,
    }

    impl FlakyService {
        fn new(failures: usize, error: StateError) -> Self {
            Self {
                calls: Arc::new(AtomicUsize::new(0)),
                failures,
                error,
            }
        }

        fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    impl Service<Dispatch> for FlakyService {
        type Response = Reply;
        type Error = StateError;
        type Future = Pin<Box<dyn Future<Output = Result<Reply, StateError>> + Send>>;

        fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
            Poll::Ready(Ok(()))
        }

        fn call(&mut self, _dispatch: Dispatch) -> Self::Future {
            let n = self.calls.fetch_add(1, Ordering::SeqCst);
            let result = if n < self.failures {
                Err(self.error.clone())
            } else {
                Ok(Reply::Ack)
            };
            Box::pin(async move { result })
        }
    }

    fn unavailable() -> StateError {
        StateError::BackendUnavailable {
            reason: "connection reset".to_string(),
            outcome: Outcome::Unknown,
        }
    }

    fn fast_retries(max_retries: u32) -> RetryConfig {
        RetryConfig::default()
            .with_max_retries(max_retries)
            .with_initial_delay(Duration::from_millis(1))
    }

    fn make_dispatch(kind: OperationKind) -> Dispatch {
        Dispatch {
            store: StoreKey::new("t", "ns", "s").unwrap(),
            key: Bytes::from_static(b"k"),
            kind,
            options: CallOptions::new(Duration::from_secs(1)),
        }
    }

    #[tokio::test]
    async fn transient_failures_of_reads_are_retried() {
        let flaky = FlakyService::new(2, unavailable());
        let svc = RetryLayer::new(fast_retries(3)).layer(flaky.clone());

        let reply = svc.oneshot(make_dispatch(OperationKind::Get)).await.unwrap();
        assert_eq!(reply, Reply::Ack);
        assert_eq!(flaky.calls(), 3);
    }

    #[tokio::test]
    async fn gives_up_after_max_retries() {
        let flaky = FlakyService::new(10, unavailable());
        let svc = RetryLayer::new(fast_retries(2)).layer(flaky.clone());

        let err = svc
            .oneshot(make_dispatch(OperationKind::IncrBy(1)))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::BackendUnavailable);
        assert_eq!(flaky.calls(), 3);
    }

    #[tokio::test]
    async fn plain_put_is_not_retried() {
        let flaky = FlakyService::new(1, unavailable());
        let svc = RetryLayer::new(fast_retries(3)).layer(flaky.clone());

        let err = svc
            .oneshot(make_dispatch(OperationKind::Put(Bytes::from_static(b"v"))))
            .await
            .unwrap_err();
        assert_eq!(err.outcome(), Outcome::Unknown);
        assert_eq!(flaky.calls(), 1);
    }

    #[tokio::test]
    async fn put_with_idempotency_token_is_retried() {
        let flaky = FlakyService::new(1, unavailable());
        let svc = RetryLayer::new(fast_retries(3)).layer(flaky.clone());

        let mut dispatch = make_dispatch(OperationKind::Put(Bytes::from_static(b"v")));
        dispatch.options.idempotency_token = Some("put-1".into());
        svc.oneshot(dispatch).await.unwrap();
        assert_eq!(flaky.calls(), 2);
    }

    #[tokio::test]
    async fn permanent_errors_are_not_retried() {
        let flaky = FlakyService::new(1, StateError::CounterTypeConflict { len: 3 });
        let svc = RetryLayer::new(fast_retries(3)).layer(flaky.clone());

        let err = svc
            .oneshot(make_dispatch(OperationKind::GetCounter))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::CounterTypeConflict);
        assert_eq!(flaky.calls(), 1);
    }

    #[tokio::test]
    async fn disabled_retry_calls_once() {
        let flaky = FlakyService::new(1, unavailable());
        let svc = RetryLayer::new(RetryConfig::disabled()).layer(flaky.clone());

        assert!(svc.oneshot(make_dispatch(OperationKind::Get)).await.is_err());
        assert_eq!(flaky.calls(), 1);
    }
}
