//! In-process [`Backend`] backed by [`DashMap`].
//!
//! Entries of every store live in one concurrent map keyed by
//! `(store, key)`. Merge-increments run under the entry's shard lock, which
//! makes them atomic, and applied operation ids are remembered in a bounded
//! cache so retried increments are applied once.

use async_trait::async_trait;
use bytes::Bytes;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use fnstate_core::{encode_counter, merge_counter, OpId, StateError, StoreKey};
use quick_cache::sync::Cache;

use super::{Backend, BackendError, CallOptions, Capabilities, DEFAULT_MAX_VALUE_SIZE};

/// Number of applied increment ids remembered for deduplication.
pub const DEFAULT_DEDUP_CAPACITY: usize = 100_000;

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct EntryKey {
    store: StoreKey,
    key: Bytes,
}

impl EntryKey {
    fn new(store: &StoreKey, key: &[u8]) -> Self {
        Self {
            store: store.clone(),
            key: Bytes::copy_from_slice(key),
        }
    }
}

/// In-memory state backend.
///
/// Suitable for development, tests, and single-process deployments where
/// durability is not required.
pub struct MemoryBackend {
    entries: DashMap<EntryKey, Bytes>,
    applied: Cache<OpId, i64>,
    max_value_size: usize,
}

impl MemoryBackend {
    /// Creates an empty backend with default limits.
    #[must_use]
    pub fn new() -> Self {
        Self::with_limits(DEFAULT_MAX_VALUE_SIZE, DEFAULT_DEDUP_CAPACITY)
    }

    /// Creates an empty backend with the given value size limit and
    /// deduplication window.
    #[must_use]
    pub fn with_limits(max_value_size: usize, dedup_capacity: usize) -> Self {
        Self {
            entries: DashMap::new(),
            applied: Cache::new(dedup_capacity.max(1)),
            max_value_size,
        }
    }

    /// Number of entries across all stores.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Point-in-time copy of one store's entries, sorted by key.
    #[must_use]
    pub fn snapshot(&self, store: &StoreKey) -> Vec<(Bytes, Bytes)> {
        let mut entries: Vec<(Bytes, Bytes)> = self
            .entries
            .iter()
            .filter(|entry| &entry.key().store == store)
            .map(|entry| (entry.key().key.clone(), entry.value().clone()))
            .collect();
        entries.sort();
        entries
    }
}

impl Default for MemoryBackend {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Backend for MemoryBackend {
    fn name(&self) -> &'static str {
        "memory"
    }

    fn capabilities(&self) -> Capabilities {
        Capabilities {
            counters: true,
            max_value_size: self.max_value_size,
        }
    }

    async fn put(
        &self,
        store: &StoreKey,
        key: &[u8],
        value: Bytes,
        _opts: &CallOptions,
    ) -> Result<(), BackendError> {
        if value.len() > self.max_value_size {
            return Err(StateError::invalid(format!(
                "value of {} bytes exceeds the maximum of {}",
                value.len(),
                self.max_value_size
            ))
            .into());
        }
        self.entries.insert(EntryKey::new(store, key), value);
        Ok(())
    }

    async fn get(
        &self,
        store: &StoreKey,
        key: &[u8],
        _opts: &CallOptions,
    ) -> Result<Option<Bytes>, BackendError> {
        Ok(self
            .entries
            .get(&EntryKey::new(store, key))
            .map(|value| value.clone()))
    }

    async fn delete(
        &self,
        store: &StoreKey,
        key: &[u8],
        _opts: &CallOptions,
    ) -> Result<(), BackendError> {
        self.entries.remove(&EntryKey::new(store, key));
        Ok(())
    }

    async fn merge_incr(
        &self,
        store: &StoreKey,
        key: &[u8],
        amount: i64,
        opts: &CallOptions,
    ) -> Result<i64, BackendError> {
        // The shard lock held by `entry` serializes every merge on this key,
        // and an op id always targets a single key, so the dedup check and
        // the write cannot interleave with a duplicate.
        let entry = self.entries.entry(EntryKey::new(store, key));
        if let Some(previous) = self.applied.get(&opts.op_id) {
            return Ok(previous);
        }
        let value = match entry {
            Entry::Occupied(mut occupied) => {
                let value = merge_counter(Some(&occupied.get()[..]), amount)?;
                occupied.insert(Bytes::copy_from_slice(&encode_counter(value)));
                value
            }
            Entry::Vacant(vacant) => {
                let value = merge_counter(None, amount)?;
                vacant.insert(Bytes::copy_from_slice(&encode_counter(value)));
                value
            }
        };
        self.applied.insert(opts.op_id, value);
        Ok(value)
    }
}
