//! The innermost service of the dispatch stack: one [`Dispatch`] in, one
//! backend call out.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use bytes::Bytes;
use fnstate_core::{decode_counter, OperationKind, Outcome, StateError, StoreKey};
use tower::Service;

use crate::backend::{Backend, CallOptions};

/// A single backend call travelling through the middleware stack.
///
/// Cloned on every retry, so the operation id in `options` stays stable
/// across attempts.
#[derive(Debug, Clone)]
pub struct Dispatch {
    pub store: StoreKey,
    pub key: Bytes,
    pub kind: OperationKind,
    pub options: CallOptions,
}

impl Dispatch {
    /// Whether re-sending this call after an ambiguous failure is safe.
    ///
    /// Reads have no effect, increments are deduplicated by op id, and
    /// put/delete only when the caller supplied an idempotency token.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        match self.kind {
            OperationKind::Get | OperationKind::GetCounter | OperationKind::IncrBy(_) => true,
            OperationKind::Put(_) | OperationKind::Delete => {
                self.options.idempotency_token.is_some()
            }
        }
    }

    /// Outcome reported when this call fails without a definite answer.
    #[must_use]
    pub fn failure_outcome(&self) -> Outcome {
        if self.kind.is_read() {
            Outcome::NotApplied
        } else {
            Outcome::Unknown
        }
    }
}

/// Result of a successful backend call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Reply {
    /// Write acknowledged.
    Ack,
    /// Raw read; `None` when the key is absent.
    Value(Option<Bytes>),
    /// Counter value after an increment, or as read.
    Counter(i64),
}

impl Reply {
    fn mismatch(self, expected: &str) -> StateError {
        StateError::BackendUnavailable {
            reason: format!("expected {expected} reply, got {self:?}"),
            outcome: Outcome::Unknown,
        }
    }

    /// # Errors
    ///
    /// Fails if the reply is not an acknowledgement.
    pub fn into_ack(self) -> Result<(), StateError> {
        match self {
            Self::Ack => Ok(()),
            other => Err(other.mismatch("ack")),
        }
    }

    /// # Errors
    ///
    /// Fails if the reply is not a raw value.
    pub fn into_value(self) -> Result<Option<Bytes>, StateError> {
        match self {
            Self::Value(value) => Ok(value),
            other => Err(other.mismatch("value")),
        }
    }

    /// # Errors
    ///
    /// Fails if the reply is not a counter.
    pub fn into_counter(self) -> Result<i64, StateError> {
        match self {
            Self::Counter(value) => Ok(value),
            other => Err(other.mismatch("counter")),
        }
    }
}

/// Leaf service that executes a [`Dispatch`] against the backend connector.
#[derive(Clone)]
pub struct BackendService {
    backend: Arc<dyn Backend>,
}

impl BackendService {
    #[must_use]
    pub fn new(backend: Arc<dyn Backend>) -> Self {
        Self { backend }
    }
}

impl Service<Dispatch> for BackendService {
    type Response = Reply;
    type Error = StateError;
    type Future = Pin<Box<dyn Future<Output = Result<Reply, StateError>> + Send>>;

    fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, dispatch: Dispatch) -> Self::Future {
        let backend = Arc::clone(&self.backend);
        Box::pin(async move {
            let Dispatch {
                store,
                key,
                kind,
                options,
            } = dispatch;
            let mutation = !kind.is_read();
            let result = match kind {
                OperationKind::Get => backend.get(&store, &key, &options).await.map(Reply::Value),
                OperationKind::Put(value) => backend
                    .put(&store, &key, value, &options)
                    .await
                    .map(|()| Reply::Ack),
                OperationKind::Delete => backend
                    .delete(&store, &key, &options)
                    .await
                    .map(|()| Reply::Ack),
                OperationKind::IncrBy(amount) => backend
                    .merge_incr(&store, &key, amount, &options)
                    .await
                    .map(Reply::Counter),
                OperationKind::GetCounter => {
                    let raw = backend
                        .get(&store, &key, &options)
                        .await
                        .map_err(|err| err.into_state_error(false))?;
                    return decode_counter(raw.as_deref()).map(Reply::Counter);
                }
            };
            result.map_err(|err| err.into_state_error(mutation))
        })
    }
}
