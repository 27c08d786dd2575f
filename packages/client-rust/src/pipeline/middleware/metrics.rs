//! Metrics middleware for backend calls.
//!
//! Wraps each call in a `tracing` span and records its latency and outcome
//! through the `metrics` facade. Installing a recorder is left to the host.

use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::Instant;

use fnstate_core::StateError;
use tower::{Layer, Service};
use tracing::{info_span, Instrument};

use crate::pipeline::dispatch::{Dispatch, Reply};
use crate::telemetry::{METRIC_BACKEND_CALLS, METRIC_BACKEND_LATENCY};

// ---------------------------------------------------------------------------
// MetricsLayer
// ---------------------------------------------------------------------------

/// Tower layer that instruments backend calls with timing and counting.
#[derive(Debug, Clone)]
pub struct MetricsLayer;

impl<S> Layer<S> for MetricsLayer {
    type Service = MetricsService<S>;

    fn layer(&self, inner: S) -> Self::Service {
        MetricsService { inner }
    }
}

// ---------------------------------------------------------------------------
// MetricsService
// ---------------------------------------------------------------------------

/// Service wrapper that records call duration and outcome.
#[derive(Debug, Clone)]
pub struct MetricsService<S> {
    inner: S,
}

impl<S> Service<Dispatch> for MetricsService<S>
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
        let kind = dispatch.kind.name();
        let span = info_span!(
            "backend_call",
            store = %dispatch.store,
            kind,
            op_id = %dispatch.options.op_id,
            duration_ms = tracing::field::Empty,
            outcome = tracing::field::Empty,
        );

        let fut = self.inner.call(dispatch);

        Box::pin(
            async move {
                let start = Instant::now();
                let result = fut.await;
                let elapsed = start.elapsed();

                let outcome = match &result {
                    Ok(_) => "ok",
                    Err(err) => err.kind().as_str(),
                };

                #[allow(clippy::cast_possible_truncation)]
                let duration_ms = elapsed.as_millis() as u64;
                let span = tracing::Span::current();
                span.record("duration_ms", duration_ms);
                span.record("outcome", outcome);

                metrics::counter!(METRIC_BACKEND_CALLS, "kind" => kind, "outcome" => outcome)
                    .increment(1);
                metrics::histogram!(METRIC_BACKEND_LATENCY, "kind" => kind)
                    .record(elapsed.as_secs_f64());

                tracing::debug!(kind, duration_ms, outcome, "backend call complete");

                result
            }
            .instrument(span),
        )
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
