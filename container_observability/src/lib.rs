//! Container Observability - logging and metrics
//!
//! This crate wires the container into the tracing and metrics
//! ecosystems: subscriber setup for structured logs, and the counters and
//! histograms recorded for every call.

mod metrics;
mod tracing;

pub use self::metrics::{
    describe_metrics, record_access_denied, record_invocation, record_pool_exhausted,
};
pub use self::tracing::{init_tracing, TracingConfig, TracingGuard};

use container_core::error::Result;

/// Initialize observability for the container.
pub fn init(tracing_config: Option<TracingConfig>) -> Result<ObservabilityHandle> {
    let tracing_guard = match tracing_config {
        Some(config) => Some(init_tracing(config)?),
        None => None,
    };
    describe_metrics();
    ::tracing::info!(tracing = tracing_guard.is_some(), "Observability initialized");

    Ok(ObservabilityHandle {
        _tracing_guard: tracing_guard,
    })
}

/// Handle for observability resources.
///
/// Buffered log output is flushed when the handle is dropped.
pub struct ObservabilityHandle {
    _tracing_guard: Option<TracingGuard>,
}
