//! Logging setup and metric names.
//!
//! The client only emits `tracing` events and `metrics` samples; installing
//! a subscriber or recorder is the hosting runtime's choice. [`init_tracing`]
//! is provided for runtimes (and tests) that want the default setup.

use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Environment variable consulted for the log filter before falling back to
/// `RUST_LOG`.
pub const LOG_ENV: &str = "FNSTATE_LOG";

/// Counter: backend calls, labelled by `kind` and `outcome`.
pub const METRIC_BACKEND_CALLS: &str = "fnstate_backend_calls_total";
/// Histogram: backend call latency in seconds, labelled by `kind`.
pub const METRIC_BACKEND_LATENCY: &str = "fnstate_backend_call_seconds";
/// Counter: retried backend calls, labelled by `kind`.
pub const METRIC_BACKEND_RETRIES: &str = "fnstate_backend_retries_total";
/// Counter: operations cancelled before dispatch.
pub const METRIC_CANCELLED: &str = "fnstate_operations_cancelled_total";
/// Gauge: store handles currently registered.
pub const METRIC_OPEN_STORES: &str = "fnstate_open_stores";

/// Installs a global `tracing` subscriber with an env filter.
///
/// The filter is read from `FNSTATE_LOG`, then `RUST_LOG`, defaulting to
/// `info`. With `json` set, events are written as JSON lines.
///
/// # Errors
///
/// Returns an error if a global subscriber is already installed.
pub fn init_tracing(json: bool) -> anyhow::Result<()> {
    let filter = EnvFilter::try_from_env(LOG_ENV)
        .or_else(|_| EnvFilter::try_from_default_env())
        .unwrap_or_else(|_| EnvFilter::new("info"));

    let registry = tracing_subscriber::registry().with(filter);
    if json {
        registry
            .with(fmt::layer().json().with_target(true))
            .try_init()?;
    } else {
        registry.with(fmt::layer().with_target(true)).try_init()?;
    }
    Ok(())
}
