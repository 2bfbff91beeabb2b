//! Invocation metrics.
//!
//! Recording goes through the `metrics` facade and is a no-op until the
//! embedding application installs a recorder.

use std::time::Duration;

use once_cell::sync::OnceCell;

const INVOCATIONS: &str = "container.invocations";
const INVOCATION_DURATION: &str = "container.invocation_duration_ms";
const ACCESS_DENIED: &str = "container.access_denied";
const POOL_EXHAUSTED: &str = "container.pool_exhausted";

static DESCRIBED: OnceCell<()> = OnceCell::new();

/// Register metric descriptions with the installed recorder, once.
pub fn describe_metrics() {
    DESCRIBED.get_or_init(|| {
        ::metrics::describe_counter!(INVOCATIONS, "Business method calls by outcome");
        ::metrics::describe_histogram!(INVOCATION_DURATION, "Business method latency in milliseconds");
        ::metrics::describe_counter!(ACCESS_DENIED, "Calls refused an instance or lock");
        ::metrics::describe_counter!(POOL_EXHAUSTED, "Calls refused because a pool was full");
    });
}

/// Record one business method call.
pub fn record_invocation(component: &str, method: &str, duration: Duration, outcome: &str) {
    ::metrics::counter!(INVOCATIONS, 1,
        "component" => component.to_string(),
        "method" => method.to_string(),
        "outcome" => outcome.to_string()
    );

    ::metrics::histogram!(INVOCATION_DURATION, duration.as_secs_f64() * 1_000.0,
        "component" => component.to_string(),
        "method" => method.to_string()
    );
}

/// Record a call denied by an access controller.
pub fn record_access_denied(component: &str, kind: &str) {
    ::metrics::counter!(ACCESS_DENIED, 1,
        "component" => component.to_string(),
        "kind" => kind.to_string()
    );
}

/// Record a call refused by a full pool.
pub fn record_pool_exhausted(component: &str) {
    ::metrics::counter!(POOL_EXHAUSTED, 1, "component" => component.to_string());
}
