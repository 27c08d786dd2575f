//! Operation kinds and operation identifiers.

use std::fmt;

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Identifier attached to every dispatched operation.
///
/// Backends deduplicate merge-increments on it, so a retry that reuses the
/// same `OpId` is applied at most once.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct OpId(Uuid);

impl OpId {
    /// Generates a fresh random identifier.
    #[must_use]
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    #[must_use]
    pub fn from_uuid(uuid: Uuid) -> Self {
        Self(uuid)
    }

    #[must_use]
    pub fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl Default for OpId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for OpId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&self.0, f)
    }
}

/// What a pending operation does to its key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OperationKind {
    /// Read the raw value.
    Get,
    /// Overwrite the raw value.
    Put(Bytes),
    /// Remove the entry. Removing an absent entry succeeds.
    Delete,
    /// Atomically add to the counter stored under the key.
    IncrBy(i64),
    /// Read the value as a counter.
    GetCounter,
}

impl OperationKind {
    /// Stable lowercase name, used in spans and metric labels.
    #[must_use]
    pub fn name(&self) -> &'static str {
        match self {
            Self::Get => "get",
            Self::Put(_) => "put",
            Self::Delete => "delete",
            Self::IncrBy(_) => "incr",
            Self::GetCounter => "get_counter",
        }
    }

    /// Reads have no effect at the backend and are always safe to retry.
    #[must_use]
    pub fn is_read(&self) -> bool {
        matches!(self, Self::Get | Self::GetCounter)
    }
}
