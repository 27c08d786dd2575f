//! Store handles: the per-store client for key-value and counter operations.
//!
//! Every operation exists in two forms. The `*_async` form validates its
//! input, submits to the store's [`RequestPipeline`] and returns an
//! [`OpFuture`]; it never fails at the call site. The blocking form is the
//! async form driven through the [`SyncAdapter`].

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use fnstate_core::{validate_key, OperationKind, StateError, StoreKey};
use tokio::runtime::Handle;

use crate::backend::{Backend, CallOptions, Capabilities};
use crate::config::StateConfig;
use crate::pipeline::{build_dispatch_stack, OpFuture, Reply, RequestPipeline};
use crate::sync::SyncAdapter;

// ---------------------------------------------------------------------------
// StoreHandle
// ---------------------------------------------------------------------------

/// Client for one (tenant, namespace, name) store.
///
/// Obtained from the [`StoreRegistry`](crate::registry::StoreRegistry);
/// equal coordinates always yield the same instance.
pub struct StoreHandle {
    key: StoreKey,
    backend: Arc<dyn Backend>,
    capabilities: Capabilities,
    pipeline: RequestPipeline,
    sync: SyncAdapter,
    backend_deadline: Duration,
}

impl StoreHandle {
    /// Creates a handle with its own pipeline. Drainer tasks run on
    /// `runtime`.
    #[must_use]
    pub fn new(key: StoreKey, backend: Arc<dyn Backend>, config: &StateConfig, runtime: Handle) -> Self {
        let capabilities = backend.capabilities();
        let service = build_dispatch_stack(Arc::clone(&backend), config);
        let pipeline = RequestPipeline::new(
            key.clone(),
            service,
            config.per_key_watermark,
            runtime.clone(),
        );
        Self {
            key,
            backend,
            capabilities,
            pipeline,
            sync: SyncAdapter::new(config.operation_timeout, runtime),
            backend_deadline: config.backend_deadline,
        }
    }

    #[must_use]
    pub fn key(&self) -> &StoreKey {
        &self.key
    }

    #[must_use]
    pub fn capabilities(&self) -> Capabilities {
        self.capabilities
    }

    #[must_use]
    pub fn backend_name(&self) -> &'static str {
        self.backend.name()
    }

    #[must_use]
    pub fn pipeline(&self) -> &RequestPipeline {
        &self.pipeline
    }

    pub(crate) fn shutdown(&self) {
        self.pipeline.shutdown();
    }

    pub(crate) async fn closed(&self) {
        self.pipeline.closed().await;
    }

    fn options(&self, idempotency_token: Option<Arc<str>>) -> CallOptions {
        CallOptions {
            idempotency_token,
            ..CallOptions::new(self.backend_deadline)
        }
    }

    fn check_counters(&self) -> Result<(), StateError> {
        if self.capabilities.counters {
            Ok(())
        } else {
            Err(StateError::unsupported(format!(
                "backend {} does not support counters",
                self.backend.name()
            )))
        }
    }

    fn check_value(&self, value: &Bytes) -> Result<(), StateError> {
        if value.len() > self.capabilities.max_value_size {
            return Err(StateError::invalid(format!(
                "value of {} bytes exceeds the maximum of {}",
                value.len(),
                self.capabilities.max_value_size
            )));
        }
        Ok(())
    }

    fn submit<T>(
        &self,
        key: &[u8],
        kind: OperationKind,
        token: Option<Arc<str>>,
        map: fn(Reply) -> Result<T, StateError>,
    ) -> OpFuture<T> {
        if let Err(err) = validate_key(key) {
            return OpFuture::failed(err);
        }
        self.pipeline
            .submit_with(Bytes::copy_from_slice(key), kind, self.options(token), map)
    }

    fn blocking<T>(&self, key: &[u8], submit: impl FnOnce() -> OpFuture<T>) -> Result<T, StateError> {
        // A shut-down runtime cannot drive the wait.
        if self.pipeline.is_shut_down() {
            return Err(StateError::Cancelled);
        }
        self.sync.wait(self.pipeline.wait_for_capacity(key), submit)
    }

    // -- key/value ----------------------------------------------------------

    /// Writes `value` under `key`. Resolves once the backend acknowledges.
    pub fn put_async(&self, key: &[u8], value: impl Into<Bytes>) -> OpFuture<()> {
        self.put_with_token(key, value.into(), None)
    }

    /// Like [`put_async`](Self::put_async), tagged with an idempotency token
    /// so the write is retried on transient failures.
    pub fn put_idempotent_async(
        &self,
        key: &[u8],
        value: impl Into<Bytes>,
        token: impl Into<Arc<str>>,
    ) -> OpFuture<()> {
        self.put_with_token(key, value.into(), Some(token.into()))
    }

    fn put_with_token(&self, key: &[u8], value: Bytes, token: Option<Arc<str>>) -> OpFuture<()> {
        if let Err(err) = self.check_value(&value) {
            return OpFuture::failed(err);
        }
        self.submit(key, OperationKind::Put(value), token, Reply::into_ack)
    }

    /// Reads `key`; `None` when absent. An empty value is `Some(b"")`.
    pub fn get_async(&self, key: &[u8]) -> OpFuture<Option<Bytes>> {
        self.submit(key, OperationKind::Get, None, Reply::into_value)
    }

    /// Removes `key`. Removing an absent key succeeds.
    pub fn delete_async(&self, key: &[u8]) -> OpFuture<()> {
        self.submit(key, OperationKind::Delete, None, Reply::into_ack)
    }

    pub fn delete_idempotent_async(&self, key: &[u8], token: impl Into<Arc<str>>) -> OpFuture<()> {
        self.submit(key, OperationKind::Delete, Some(token.into()), Reply::into_ack)
    }

    /// # Errors
    ///
    /// See [`put_async`](Self::put_async), plus `Timeout` when the blocking
    /// timeout elapses.
    pub fn put(&self, key: &[u8], value: impl Into<Bytes>) -> Result<(), StateError> {
        let value = value.into();
        self.blocking(key, || self.put_async(key, value))
    }

    /// # Errors
    ///
    /// See [`get_async`](Self::get_async).
    pub fn get(&self, key: &[u8]) -> Result<Option<Bytes>, StateError> {
        self.blocking(key, || self.get_async(key))
    }

    /// # Errors
    ///
    /// See [`delete_async`](Self::delete_async).
    pub fn delete(&self, key: &[u8]) -> Result<(), StateError> {
        self.blocking(key, || self.delete_async(key))
    }

    // -- counters -----------------------------------------------------------

    /// Atomically adds `amount` to the counter at `key` (absent counts as 0)
    /// and resolves with the new value.
    ///
    /// Retries reuse the operation id, so the increment is applied at most
    /// once. Overflow resolves `InvalidArgument`.
    pub fn incr_counter_async(&self, key: &[u8], amount: i64) -> OpFuture<i64> {
        if let Err(err) = self.check_counters() {
            return OpFuture::failed(err);
        }
        self.submit(key, OperationKind::IncrBy(amount), None, Reply::into_counter)
    }

    /// Reads the counter at `key`, 0 when absent.
    pub fn get_counter_async(&self, key: &[u8]) -> OpFuture<i64> {
        if let Err(err) = self.check_counters() {
            return OpFuture::failed(err);
        }
        self.submit(key, OperationKind::GetCounter, None, Reply::into_counter)
    }

    /// # Errors
    ///
    /// See [`incr_counter_async`](Self::incr_counter_async).
    pub fn incr_counter(&self, key: &[u8], amount: i64) -> Result<i64, StateError> {
        self.blocking(key, || self.incr_counter_async(key, amount))
    }

    /// # Errors
    ///
    /// See [`get_counter_async`](Self::get_counter_async).
    pub fn get_counter(&self, key: &[u8]) -> Result<i64, StateError> {
        self.blocking(key, || self.get_counter_async(key))
    }
}

impl fmt::Debug for StoreHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StoreHandle")
            .field("key", &self.key)
            .field("backend", &self.backend.name())
            .field("capabilities", &self.capabilities)
            .field("pending", &self.pipeline.pending())
            .finish()
    }
}

// ---------------------------------------------------------------------------
// Typed views
// ---------------------------------------------------------------------------

/// A view of a store that can be obtained from a resolved handle.
///
/// Conversion checks the backend's capabilities, so a view that resolves
/// successfully supports every operation it exposes.
pub trait StoreCapability: Sized {
    /// # Errors
    ///
    /// Returns `Unsupported` if the backend lacks what this view needs.
    fn from_handle(handle: Arc<StoreHandle>) -> Result<Self, StateError>;
}

impl StoreCapability for Arc<StoreHandle> {
    fn from_handle(handle: Arc<StoreHandle>) -> Result<Self, StateError> {
        Ok(handle)
    }
}

/// Key-value view of a store.
#[derive(Debug, Clone)]
pub struct KeyValueStore {
    handle: Arc<StoreHandle>,
}

impl StoreCapability for KeyValueStore {
    fn from_handle(handle: Arc<StoreHandle>) -> Result<Self, StateError> {
        Ok(Self { handle })
    }
}

impl KeyValueStore {
    #[must_use]
    pub fn handle(&self) -> &Arc<StoreHandle> {
        &self.handle
    }

    pub fn put_async(&self, key: &[u8], value: impl Into<Bytes>) -> OpFuture<()> {
        self.handle.put_async(key, value)
    }

    pub fn get_async(&self, key: &[u8]) -> OpFuture<Option<Bytes>> {
        self.handle.get_async(key)
    }

    pub fn delete_async(&self, key: &[u8]) -> OpFuture<()> {
        self.handle.delete_async(key)
    }

    /// # Errors
    ///
    /// See [`StoreHandle::put`].
    pub fn put(&self, key: &[u8], value: impl Into<Bytes>) -> Result<(), StateError> {
        self.handle.put(key, value)
    }

    /// # Errors
    ///
    /// See [`StoreHandle::get`].
    pub fn get(&self, key: &[u8]) -> Result<Option<Bytes>, StateError> {
        self.handle.get(key)
    }

    /// # Errors
    ///
    /// See [`StoreHandle::delete`].
    pub fn delete(&self, key: &[u8]) -> Result<(), StateError> {
        self.handle.delete(key)
    }
}

/// Counter view of a store. Only obtainable on backends with counter support.
#[derive(Debug, Clone)]
pub struct CounterStore {
    handle: Arc<StoreHandle>,
}

impl StoreCapability for CounterStore {
    fn from_handle(handle: Arc<StoreHandle>) -> Result<Self, StateError> {
        handle.check_counters()?;
        Ok(Self { handle })
    }
}

impl CounterStore {
    #[must_use]
    pub fn handle(&self) -> &Arc<StoreHandle> {
        &self.handle
    }

    pub fn incr_async(&self, key: &[u8], amount: i64) -> OpFuture<i64> {
        self.handle.incr_counter_async(key, amount)
    }

    pub fn get_async(&self, key: &[u8]) -> OpFuture<i64> {
        self.handle.get_counter_async(key)
    }

    /// # Errors
    ///
    /// See [`StoreHandle::incr_counter`].
    pub fn incr(&self, key: &[u8], amount: i64) -> Result<i64, StateError> {
        self.handle.incr_counter(key, amount)
    }

    /// # Errors
    ///
    /// See [`StoreHandle::get_counter`].
    pub fn get(&self, key: &[u8]) -> Result<i64, StateError> {
        self.handle.get_counter(key)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
