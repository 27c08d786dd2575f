//! Store registry: one [`StoreHandle`] per (tenant, namespace, name).

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use dashmap::DashMap;
use fnstate_core::{StateError, StoreKey};
use tokio::runtime::Handle;
use tracing::{debug, info, warn};

use crate::backend::Backend;
use crate::config::StateConfig;
use crate::store::StoreHandle;
use crate::telemetry::METRIC_OPEN_STORES;

/// Lazily creates and caches store handles over a shared backend.
///
/// Handles are created on first resolution, exactly once even under
/// concurrent first access, and live until [`evict`](Self::evict) or
/// [`shutdown`](Self::shutdown).
pub struct StoreRegistry {
    handles: DashMap<StoreKey, Arc<StoreHandle>>,
    backend: Arc<dyn Backend>,
    config: StateConfig,
    runtime: Handle,
    closed: AtomicBool,
}

impl StoreRegistry {
    /// Creates an empty registry. Pipelines of resolved stores run on
    /// `runtime`.
    #[must_use]
    pub fn new(backend: Arc<dyn Backend>, config: StateConfig, runtime: Handle) -> Self {
        Self {
            handles: DashMap::new(),
            backend,
            config,
            runtime,
            closed: AtomicBool::new(false),
        }
    }

    #[must_use]
    pub fn config(&self) -> &StateConfig {
        &self.config
    }

    #[must_use]
    pub fn backend(&self) -> &Arc<dyn Backend> {
        &self.backend
    }

    /// Returns the handle for the given coordinates, creating it on first use.
    ///
    /// # Errors
    ///
    /// `InvalidArgument` if a component is empty, `Cancelled` once the
    /// registry has been shut down.
    pub fn resolve(
        &self,
        tenant: &str,
        namespace: &str,
        name: &str,
    ) -> Result<Arc<StoreHandle>, StateError> {
        self.resolve_key(StoreKey::new(tenant, namespace, name)?)
    }

    /// Like [`resolve`](Self::resolve), for an already-built key.
    ///
    /// # Errors
    ///
    /// `Cancelled` once the registry has been shut down.
    pub fn resolve_key(&self, key: StoreKey) -> Result<Arc<StoreHandle>, StateError> {
        if self.is_closed() {
            return Err(StateError::Cancelled);
        }
        if let Some(handle) = self.handles.get(&key) {
            return Ok(Arc::clone(handle.value()));
        }

        let mut created = false;
        let handle = Arc::clone(
            self.handles
                .entry(key.clone())
                .or_insert_with(|| {
                    created = true;
                    Arc::new(StoreHandle::new(
                        key.clone(),
                        Arc::clone(&self.backend),
                        &self.config,
                        self.runtime.clone(),
                    ))
                })
                .value(),
        );

        if created {
            info!(store = %key, backend = self.backend.name(), "store opened");
            self.record_open_stores();
            // Lost a race with shutdown: the drain may already have run.
            if self.is_closed() {
                self.handles.remove(&key);
                handle.shutdown();
                return Err(StateError::Cancelled);
            }
        }
        Ok(handle)
    }

    /// Tears down one store. Its queued and in-flight operations resolve
    /// `Cancelled`; the next resolution creates a fresh handle.
    ///
    /// Returns `false` if no handle was registered for `key`.
    pub fn evict(&self, key: &StoreKey) -> bool {
        let Some((_, handle)) = self.handles.remove(key) else {
            return false;
        };
        handle.shutdown();
        self.record_open_stores();
        debug!(store = %key, "store evicted");
        true
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.handles.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.handles.is_empty()
    }

    #[must_use]
    pub fn contains(&self, key: &StoreKey) -> bool {
        self.handles.contains_key(key)
    }

    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Shuts down every store and then closes the backend.
    ///
    /// Queued and in-flight operations resolve `Cancelled`, and later
    /// resolutions fail `Cancelled`. Calling this more than once is a no-op.
    ///
    /// # Errors
    ///
    /// Returns an error if the backend fails to close.
    pub async fn shutdown(&self) -> anyhow::Result<()> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }

        let keys: Vec<StoreKey> = self.handles.iter().map(|entry| entry.key().clone()).collect();
        let mut drained = Vec::with_capacity(keys.len());
        for key in keys {
            if let Some((_, handle)) = self.handles.remove(&key) {
                handle.shutdown();
                drained.push(handle);
            }
        }
        for handle in &drained {
            handle.closed().await;
        }
        self.record_open_stores();
        info!(stores = drained.len(), "state registry shut down");

        if let Err(err) = self.backend.close().await {
            warn!(backend = self.backend.name(), error = %err, "closing state backend failed");
            return Err(err);
        }
        Ok(())
    }

    fn record_open_stores(&self) {
        #[allow(clippy::cast_precision_loss)]
        metrics::gauge!(METRIC_OPEN_STORES).set(self.handles.len() as f64);
    }
}

impl std::fmt::Debug for StoreRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StoreRegistry")
            .field("backend", &self.backend.name())
            .field("stores", &self.handles.len())
            .field("closed", &self.is_closed())
            .finish_non_exhaustive()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
