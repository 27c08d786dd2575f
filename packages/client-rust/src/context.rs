//! The state context handed to each function invocation.
//!
//! A [`StateContext`] either wraps a [`StoreRegistry`] or is unsupported.
//! An unsupported context fails store resolution and every blocking
//! operation with `Unsupported`, and returns futures that resolve
//! `Unsupported` from every async operation.

use std::sync::Arc;

use anyhow::Context as _;
use bytes::Bytes;
use fnstate_core::StateError;
use tokio::runtime::Handle;
use tracing::info;

use crate::backend::{Backend, HttpBackend};
use crate::config::StateConfig;
use crate::pipeline::OpFuture;
use crate::registry::StoreRegistry;
use crate::store::{StoreCapability, StoreHandle};

const NO_BACKEND: &str = "no state storage is configured for this function";

/// Per-instance access to scoped state stores.
///
/// Cheap to clone; clones share the same registry.
#[derive(Debug, Clone)]
pub struct StateContext {
    registry: Option<Arc<StoreRegistry>>,
}

impl StateContext {
    /// A context backed by `backend`. Store pipelines run on `runtime`.
    #[must_use]
    pub fn new(backend: Arc<dyn Backend>, config: StateConfig, runtime: Handle) -> Self {
        Self {
            registry: Some(Arc::new(StoreRegistry::new(backend, config, runtime))),
        }
    }

    /// A context without state storage.
    #[must_use]
    pub fn unsupported() -> Self {
        Self { registry: None }
    }

    /// Builds a context from configuration: an [`HttpBackend`] when a state
    /// storage URL is set, otherwise an unsupported context.
    ///
    /// # Errors
    ///
    /// Returns an error if the configured URL is not a usable HTTP base URL.
    pub fn from_config(config: StateConfig, runtime: Handle) -> anyhow::Result<Self> {
        let Some(url) = config.state_storage_url.clone() else {
            info!("no state storage url configured, state is unsupported");
            return Ok(Self::unsupported());
        };
        let backend = HttpBackend::new(&url)
            .with_context(|| format!("configuring state storage at {url}"))?;
        info!(url = %url, "state storage configured");
        Ok(Self::new(Arc::new(backend), config, runtime))
    }

    #[must_use]
    pub fn is_supported(&self) -> bool {
        self.registry.is_some()
    }

    #[must_use]
    pub fn registry(&self) -> Option<&Arc<StoreRegistry>> {
        self.registry.as_ref()
    }

    /// Resolves the store handle for the given coordinates.
    ///
    /// # Errors
    ///
    /// `Unsupported` when no backend is configured; otherwise see
    /// [`StoreRegistry::resolve`].
    pub fn resolve_store(
        &self,
        tenant: &str,
        namespace: &str,
        name: &str,
    ) -> Result<Arc<StoreHandle>, StateError> {
        match &self.registry {
            Some(registry) => registry.resolve(tenant, namespace, name),
            None => Err(StateError::unsupported(NO_BACKEND)),
        }
    }

    /// Resolves a typed view of a store, e.g. [`KeyValueStore`] or
    /// [`CounterStore`].
    ///
    /// [`KeyValueStore`]: crate::store::KeyValueStore
    /// [`CounterStore`]: crate::store::CounterStore
    ///
    /// # Errors
    ///
    /// As [`resolve_store`](Self::resolve_store), plus `Unsupported` when the
    /// backend lacks the view's capability.
    pub fn store<S: StoreCapability>(
        &self,
        tenant: &str,
        namespace: &str,
        name: &str,
    ) -> Result<S, StateError> {
        S::from_handle(self.resolve_store(tenant, namespace, name)?)
    }

    fn with_store<T>(
        &self,
        tenant: &str,
        namespace: &str,
        name: &str,
        op: impl FnOnce(&StoreHandle) -> OpFuture<T>,
    ) -> OpFuture<T> {
        match self.resolve_store(tenant, namespace, name) {
            Ok(store) => op(&store),
            Err(err) => OpFuture::failed(err),
        }
    }

    // -- future-returning forms ----------------------------------------------

    pub fn put_state_async(
        &self,
        key: &[u8],
        value: impl Into<Bytes>,
        tenant: &str,
        namespace: &str,
        name: &str,
    ) -> OpFuture<()> {
        let value = value.into();
        self.with_store(tenant, namespace, name, |store| store.put_async(key, value))
    }

    pub fn get_state_async(
        &self,
        key: &[u8],
        tenant: &str,
        namespace: &str,
        name: &str,
    ) -> OpFuture<Option<Bytes>> {
        self.with_store(tenant, namespace, name, |store| store.get_async(key))
    }

    pub fn delete_state_async(
        &self,
        key: &[u8],
        tenant: &str,
        namespace: &str,
        name: &str,
    ) -> OpFuture<()> {
        self.with_store(tenant, namespace, name, |store| store.delete_async(key))
    }

    pub fn incr_counter_async(
        &self,
        key: &[u8],
        amount: i64,
        tenant: &str,
        namespace: &str,
        name: &str,
    ) -> OpFuture<i64> {
        self.with_store(tenant, namespace, name, |store| {
            store.incr_counter_async(key, amount)
        })
    }

    pub fn get_counter_async(
        &self,
        key: &[u8],
        tenant: &str,
        namespace: &str,
        name: &str,
    ) -> OpFuture<i64> {
        self.with_store(tenant, namespace, name, |store| store.get_counter_async(key))
    }

    // -- blocking forms --------------------------------------------------------

    /// # Errors
    ///
    /// `Unsupported` without a backend; otherwise see [`StoreHandle::put`].
    pub fn put_state(
        &self,
        key: &[u8],
        value: impl Into<Bytes>,
        tenant: &str,
        namespace: &str,
        name: &str,
    ) -> Result<(), StateError> {
        self.resolve_store(tenant, namespace, name)?.put(key, value)
    }

    /// # Errors
    ///
    /// `Unsupported` without a backend; otherwise see [`StoreHandle::get`].
    pub fn get_state(
        &self,
        key: &[u8],
        tenant: &str,
        namespace: &str,
        name: &str,
    ) -> Result<Option<Bytes>, StateError> {
        self.resolve_store(tenant, namespace, name)?.get(key)
    }

    /// # Errors
    ///
    /// `Unsupported` without a backend; otherwise see [`StoreHandle::delete`].
    pub fn delete_state(
        &self,
        key: &[u8],
        tenant: &str,
        namespace: &str,
        name: &str,
    ) -> Result<(), StateError> {
        self.resolve_store(tenant, namespace, name)?.delete(key)
    }

    /// # Errors
    ///
    /// `Unsupported` without a backend; otherwise see
    /// [`StoreHandle::incr_counter`].
    pub fn incr_counter(
        &self,
        key: &[u8],
        amount: i64,
        tenant: &str,
        namespace: &str,
        name: &str,
    ) -> Result<i64, StateError> {
        self.resolve_store(tenant, namespace, name)?
            .incr_counter(key, amount)
    }

    /// # Errors
    ///
    /// `Unsupported` without a backend; otherwise see
    /// [`StoreHandle::get_counter`].
    pub fn get_counter(
        &self,
        key: &[u8],
        tenant: &str,
        namespace: &str,
        name: &str,
    ) -> Result<i64, StateError> {
        self.resolve_store(tenant, namespace, name)?.get_counter(key)
    }

    /// Shuts down every store and the backend. A no-op without a backend.
    ///
    /// # Errors
    ///
    /// Returns an error if the backend fails to close.
    pub async fn close(&self) -> anyhow::Result<()> {
        match &self.registry {
            Some(registry) => registry.shutdown().await,
            None => Ok(()),
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
