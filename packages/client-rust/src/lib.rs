//! `fnstate` Client: scoped, tenant-isolated key-value and counter state for
//! function instances, with blocking and future-returning forms of every
//! operation.
//!
//! Entry point is [`StateContext`]: it resolves [`StoreHandle`]s through a
//! [`StoreRegistry`], and each handle routes operations through its own
//! [`RequestPipeline`] to a shared [`Backend`].

pub mod backend;
pub mod config;
pub mod context;
pub mod pipeline;
pub mod registry;
pub mod store;
pub mod sync;
pub mod telemetry;

#[cfg(test)]
mod testing;

pub use backend::{Backend, BackendError, CallOptions, Capabilities, HttpBackend, MemoryBackend};
pub use config::{RetryConfig, StateConfig};
pub use context::StateContext;
pub use fnstate_core::{ErrorKind, OpId, OperationKind, Outcome, StateError, StoreKey};
pub use pipeline::{OpFuture, RequestPipeline};
pub use registry::StoreRegistry;
pub use store::{CounterStore, KeyValueStore, StoreCapability, StoreHandle};
pub use sync::SyncAdapter;
