//! Store coordinates and key validation.
//!
//! A [`StoreKey`] names one logical state store by its three-level scope
//! (tenant, namespace, store name). It is the cache key of the store
//! registry and the prefix under which a backend partitions entries.

use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::error::StateError;

/// Largest key, in bytes, accepted by any store operation.
pub const MAX_KEY_SIZE: usize = 4096;

/// Identifies one logical state store: `tenant/namespace/name`.
///
/// Immutable and cheap to clone (components are shared `Arc<str>`).
/// Equality and hashing are by value.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct StoreKey {
    tenant: Arc<str>,
    namespace: Arc<str>,
    name: Arc<str>,
}

impl StoreKey {
    /// Builds a store key from its three components.
    ///
    /// # Errors
    ///
    /// Returns [`StateError::InvalidArgument`] if any component is empty.
    pub fn new(
        tenant: impl AsRef<str>,
        namespace: impl AsRef<str>,
        name: impl AsRef<str>,
    ) -> Result<Self, StateError> {
        let (tenant, namespace, name) = (tenant.as_ref(), namespace.as_ref(), name.as_ref());
        for (field, value) in [("tenant", tenant), ("namespace", namespace), ("name", name)] {
            if value.is_empty() {
                return Err(StateError::invalid(format!("store {field} must not be empty")));
            }
        }
        Ok(Self {
            tenant: Arc::from(tenant),
            namespace: Arc::from(namespace),
            name: Arc::from(name),
        })
    }

    #[must_use]
    pub fn tenant(&self) -> &str {
        &self.tenant
    }

    #[must_use]
    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }
}

impl fmt::Display for StoreKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}/{}", self.tenant, self.namespace, self.name)
    }
}

/// Checks that `key` is usable as an entry key.
///
/// # Errors
///
/// Returns [`StateError::InvalidArgument`] for an empty key or one longer
/// than [`MAX_KEY_SIZE`].
pub fn validate_key(key: &[u8]) -> Result<(), StateError> {
    if key.is_empty() {
        return Err(StateError::invalid("key must not be empty"));
    }
    if key.len() > MAX_KEY_SIZE {
        return Err(StateError::invalid(format!(
            "key is {} bytes, maximum is {MAX_KEY_SIZE}",
            key.len()
        )));
    }
    Ok(())
}
