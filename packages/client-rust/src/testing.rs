//! Scriptable backend for unit tests.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use dashmap::DashMap;
use fnstate_core::StoreKey;
use parking_lot::Mutex;

use crate::backend::{Backend, BackendError, CallOptions, Capabilities, MemoryBackend};

/// Wraps a [`MemoryBackend`] with per-key delays, injected failures and a
/// call log.
pub(crate) struct ScriptedBackend {
    memory: MemoryBackend,
    delays: DashMap<Bytes, Duration>,
    /// Calls that fail before reaching storage.
    fail_next: AtomicUsize,
    /// Calls that reach storage but whose reply is lost.
    lose_next: AtomicUsize,
    counters: AtomicBool,
    calls: Mutex<Vec<(&'static str, Bytes)>>,
    closed: AtomicBool,
}

impl ScriptedBackend {
    pub(crate) fn new() -> Self {
        Self {
            memory: MemoryBackend::new(),
            delays: DashMap::new(),
            fail_next: AtomicUsize::new(0),
            lose_next: AtomicUsize::new(0),
            counters: AtomicBool::new(true),
            calls: Mutex::new(Vec::new()),
            closed: AtomicBool::new(false),
        }
    }

    pub(crate) fn without_counters() -> Self {
        let backend = Self::new();
        backend.counters.store(false, Ordering::SeqCst);
        backend
    }

    pub(crate) fn memory(&self) -> &MemoryBackend {
        &self.memory
    }

    /// Every call on `key` sleeps for `delay` before touching storage.
    pub(crate) fn delay_key(&self, key: &[u8], delay: Duration) {
        self.delays.insert(Bytes::copy_from_slice(key), delay);
    }

    /// The next `n` calls fail with `Unavailable` without being applied.
    pub(crate) fn fail_next(&self, n: usize) {
        self.fail_next.store(n, Ordering::SeqCst);
    }

    /// The next `n` calls are applied but report `Unavailable`.
    pub(crate) fn lose_next_replies(&self, n: usize) {
        self.lose_next.store(n, Ordering::SeqCst);
    }

    /// Method names of every call made on `key`, in arrival order.
    pub(crate) fn calls_for(&self, key: &[u8]) -> Vec<&'static str> {
        self.calls
            .lock()
            .iter()
            .filter(|(_, k)| k.as_ref() == key)
            .map(|(method, _)| *method)
            .collect()
    }

    pub(crate) fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    fn take(counter: &AtomicUsize) -> bool {
        counter
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }

    async fn before(&self, method: &'static str, key: &[u8]) -> Result<(), BackendError> {
        self.calls.lock().push((method, Bytes::copy_from_slice(key)));
        let delay = self.delays.get(key).map(|delay| *delay.value());
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        if Self::take(&self.fail_next) {
            return Err(BackendError::Unavailable("injected failure".to_string()));
        }
        Ok(())
    }

    fn after<T>(&self, result: Result<T, BackendError>) -> Result<T, BackendError> {
        if result.is_ok() && Self::take(&self.lose_next) {
            return Err(BackendError::Unavailable("reply lost".to_string()));
        }
        result
    }
}

#[async_trait]
impl Backend for ScriptedBackend {
    fn name(&self) -> &'static str {
        "scripted"
    }

    fn capabilities(&self) -> Capabilities {
        Capabilities {
            counters: self.counters.load(Ordering::SeqCst),
            ..self.memory.capabilities()
        }
    }

    async fn put(
        &self,
        store: &StoreKey,
        key: &[u8],
        value: Bytes,
        opts: &CallOptions,
    ) -> Result<(), BackendError> {
        self.before("put", key).await?;
        let result = self.memory.put(store, key, value, opts).await;
        self.after(result)
    }

    async fn get(
        &self,
        store: &StoreKey,
        key: &[u8],
        opts: &CallOptions,
    ) -> Result<Option<Bytes>, BackendError> {
        self.before("get", key).await?;
        let result = self.memory.get(store, key, opts).await;
        self.after(result)
    }

    async fn delete(
        &self,
        store: &StoreKey,
        key: &[u8],
        opts: &CallOptions,
    ) -> Result<(), BackendError> {
        self.before("delete", key).await?;
        let result = self.memory.delete(store, key, opts).await;
        self.after(result)
    }

    async fn merge_incr(
        &self,
        store: &StoreKey,
        key: &[u8],
        amount: i64,
        opts: &CallOptions,
    ) -> Result<i64, BackendError> {
        self.before("incr", key).await?;
        let result = self.memory.merge_incr(store, key, amount, opts).await;
        self.after(result)
    }

    async fn close(&self) -> anyhow::Result<()> {
        self.closed.store(true, Ordering::SeqCst);
        Ok(())
    }
}
