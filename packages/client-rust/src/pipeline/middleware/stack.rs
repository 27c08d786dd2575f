//! Stack composition: combines all middleware layers over the backend into a
//! single cloneable service.

use std::sync::Arc;

use fnstate_core::StateError;
use tower::util::BoxCloneService;
use tower::ServiceBuilder;

use super::deadline::DeadlineLayer;
use super::metrics::MetricsLayer;
use super::retry::RetryLayer;
use crate::backend::Backend;
use crate::config::StateConfig;
use crate::pipeline::dispatch::{BackendService, Dispatch, Reply};

/// Type-erased dispatch stack shared by every key lane of a pipeline.
pub type DispatchService = BoxCloneService<Dispatch, Reply, StateError>;

/// Build the dispatch stack by wrapping the backend with middleware layers.
///
/// Layer order (outermost to innermost):
/// 1. `MetricsLayer` -- one span and latency sample per logical call
/// 2. `RetryLayer` -- re-send transient failures of idempotent calls
/// 3. `DeadlineLayer` -- bound every individual attempt
#[must_use]
pub fn build_dispatch_stack(backend: Arc<dyn Backend>, config: &StateConfig) -> DispatchService {
    let svc = ServiceBuilder::new()
        .layer(MetricsLayer)
        .layer(RetryLayer::new(config.retry.clone()))
        .layer(DeadlineLayer)
        .service(BackendService::new(backend));
    BoxCloneService::new(svc)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use bytes::Bytes;
    use fnstate_core::{OperationKind, StoreKey};
    use tower::ServiceExt;

    use super::*;
    use crate::backend::{CallOptions, MemoryBackend};

    fn make_dispatch(kind: OperationKind) -> Dispatch {
        Dispatch {
            store: StoreKey::new("acme", "default", "hits").unwrap(),
            key: Bytes::from_static(b"page"),
            kind,
            options: CallOptions::new(Duration::from_secs(1)),
        }
    }

    #[tokio::test]
    async fn stack_routes_through_all_layers() {
        let svc = build_dispatch_stack(Arc::new(MemoryBackend::new()), &StateConfig::default());

        let reply = svc
            .clone()
            .oneshot(make_dispatch(OperationKind::IncrBy(2)))
            .await
            .unwrap();
        assert_eq!(reply, Reply::Counter(2));

        let reply = svc
            .oneshot(make_dispatch(OperationKind::GetCounter))
            .await
            .unwrap();
        assert_eq!(reply, Reply::Counter(2));
    }
}
