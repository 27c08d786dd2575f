//! Backend connector: the only network-facing boundary of the client.
//!
//! [`Backend`] exposes raw key-scoped put/get/delete and an atomic
//! merge-increment. Every call carries [`CallOptions`] with its deadline and
//! operation id. Implementations:
//!
//! - [`MemoryBackend`]: in-process storage for local runs and tests
//! - [`HttpBackend`]: default network adapter for a remote state service

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use fnstate_core::{OpId, Outcome, StateError, StoreKey};

mod http;
mod memory;

pub use http::HttpBackend;
pub use memory::MemoryBackend;

/// Default largest value accepted by a backend (1 MiB).
pub const DEFAULT_MAX_VALUE_SIZE: usize = 1024 * 1024;

/// Per-call options passed to every backend method.
#[derive(Debug, Clone)]
pub struct CallOptions {
    /// Time budget for this call. Expiry is reported as [`BackendError::Timeout`].
    pub deadline: Duration,
    /// Identifier of the logical operation. Stable across retries.
    pub op_id: OpId,
    /// Caller-supplied token that makes a put/delete safe to retry.
    pub idempotency_token: Option<Arc<str>>,
}

impl CallOptions {
    #[must_use]
    pub fn new(deadline: Duration) -> Self {
        Self {
            deadline,
            op_id: OpId::new(),
            idempotency_token: None,
        }
    }
}

/// What a backend can do.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Capabilities {
    /// Whether `merge_incr` is supported.
    pub counters: bool,
    /// Largest value accepted by `put`.
    pub max_value_size: usize,
}

impl Default for Capabilities {
    fn default() -> Self {
        Self {
            counters: true,
            max_value_size: DEFAULT_MAX_VALUE_SIZE,
        }
    }
}

/// Errors reported by a backend connector.
#[derive(Debug, thiserror::Error)]
pub enum BackendError {
    /// Connectivity loss or a backend-side failure.
    #[error("backend unavailable: {0}")]
    Unavailable(String),
    /// The call's deadline elapsed. The effect of a mutation is unknown.
    #[error("backend call timed out after {timeout_ms}ms")]
    Timeout { timeout_ms: u64 },
    /// The backend rejected the request with an already-classified error
    /// (counter conflict, oversized value, overflow).
    #[error(transparent)]
    Rejected(#[from] StateError),
    /// Anything else.
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl BackendError {
    /// Converts to the caller-facing error.
    ///
    /// Failures of a mutation that may have reached the backend carry
    /// [`Outcome::Unknown`]; reads never have an effect.
    #[must_use]
    pub fn into_state_error(self, mutation: bool) -> StateError {
        let outcome = if mutation {
            Outcome::Unknown
        } else {
            Outcome::NotApplied
        };
        match self {
            Self::Unavailable(reason) => StateError::BackendUnavailable { reason, outcome },
            Self::Timeout { timeout_ms } => StateError::Timeout {
                timeout_ms,
                outcome,
            },
            Self::Rejected(err) => err,
            Self::Other(err) => StateError::BackendUnavailable {
                reason: format!("{err:#}"),
                outcome,
            },
        }
    }
}

/// Raw key-value and counter access to a state storage backend.
///
/// Shared across all store handles as `Arc<dyn Backend>`; implementations
/// must be safe for concurrent use and must not block the calling task.
#[async_trait]
pub trait Backend: Send + Sync + 'static {
    /// Short name used in logs.
    fn name(&self) -> &'static str;

    /// Capabilities of this backend.
    fn capabilities(&self) -> Capabilities {
        Capabilities::default()
    }

    /// Write `value` under `key`.
    async fn put(
        &self,
        store: &StoreKey,
        key: &[u8],
        value: Bytes,
        opts: &CallOptions,
    ) -> Result<(), BackendError>;

    /// Read the value under `key`, `None` if absent.
    async fn get(
        &self,
        store: &StoreKey,
        key: &[u8],
        opts: &CallOptions,
    ) -> Result<Option<Bytes>, BackendError>;

    /// Remove `key`. Removing an absent key succeeds.
    async fn delete(&self, store: &StoreKey, key: &[u8], opts: &CallOptions)
        -> Result<(), BackendError>;

    /// Atomically add `amount` to the counter at `key` (absent = 0) and
    /// return the new value.
    ///
    /// Must be idempotent per `opts.op_id`: a duplicate id within the
    /// backend's retention window returns the first result without applying
    /// the increment again.
    async fn merge_incr(
        &self,
        store: &StoreKey,
        key: &[u8],
        amount: i64,
        opts: &CallOptions,
    ) -> Result<i64, BackendError>;

    /// Release connections. Called once when the owning context shuts down.
    async fn close(&self) -> anyhow::Result<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use fnstate_core::ErrorKind;

    use super::*;

    #[test]
    fn mutation_failures_have_unknown_outcome() {
        let err = BackendError::Unavailable("reset".into()).into_state_error(true);
        assert_eq!(err.kind(), ErrorKind::BackendUnavailable);
        assert_eq!(err.outcome(), Outcome::Unknown);

        let err = BackendError::Timeout { timeout_ms: 5 }.into_state_error(false);
        assert_eq!(err.kind(), ErrorKind::Timeout);
        assert_eq!(err.outcome(), Outcome::NotApplied);
    }

    #[test]
    fn rejected_errors_pass_through() {
        let err = BackendError::from(StateError::CounterTypeConflict { len: 2 });
        assert_eq!(
            err.into_state_error(true),
            StateError::CounterTypeConflict { len: 2 }
        );
    }

    #[test]
    fn other_errors_keep_context_chain() {
        let err = BackendError::Other(anyhow::anyhow!("socket closed").context("sending put"));
        let state = err.into_state_error(true);
        assert!(state.to_string().contains("sending put: socket closed"));
    }
}
