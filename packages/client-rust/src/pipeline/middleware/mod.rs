//! Tower middleware layers wrapped around every backend call.
//!
//! - [`deadline`]: Per-call deadline enforcement
//! - [`retry`]: Exponential-backoff retry of transient failures
//! - [`metrics`]: Call timing and counting via `tracing` spans and `metrics`
//! - [`stack`]: Composes all layers over the backend into one service

pub mod deadline;
pub mod metrics;
pub mod retry;
pub mod stack;

pub use deadline::DeadlineLayer;
pub use metrics::MetricsLayer;
pub use retry::RetryLayer;
pub use stack::{build_dispatch_stack, DispatchService};
