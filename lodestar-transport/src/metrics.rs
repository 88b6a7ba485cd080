//! Transport observability metrics
//!
//! Prometheus-compatible metrics for request outcomes, liveness probes,
//! sniffing and pool churn, behind the `metrics` facade.

use std::time::Duration;

/// Record one completed request attempt against a node.
pub fn record_request(method: &str, status: u16, duration: Duration) {
    metrics::histogram!(
        "lodestar_request_duration_seconds",
        "method" => method.to_string(),
    )
    .record(duration.as_secs_f64());

    metrics::counter!(
        "lodestar_requests_total",
        "method" => method.to_string(),
        "status" => status.to_string(),
    )
    .increment(1);
}

/// Record a terminal pipeline failure.
pub fn record_pipeline_failure(failure: &str) {
    metrics::counter!(
        "lodestar_pipeline_failures_total",
        "failure" => failure.to_string(),
    )
    .increment(1);
}

/// Record a liveness probe.
pub fn record_ping(success: bool, duration: Duration) {
    let status = if success { "ok" } else { "error" };
    metrics::counter!(
        "lodestar_pings_total",
        "status" => status.to_string(),
    )
    .increment(1);

    metrics::histogram!("lodestar_ping_duration_seconds").record(duration.as_secs_f64());
}

/// Record one sniff round.
pub fn record_sniff(success: bool) {
    let status = if success { "ok" } else { "error" };
    metrics::counter!(
        "lodestar_sniffs_total",
        "status" => status.to_string(),
    )
    .increment(1);
}

/// Record a node transitioning to dead.
pub fn record_node_dead(failed_attempts: u32) {
    metrics::counter!("lodestar_nodes_marked_dead_total").increment(1);
    metrics::histogram!("lodestar_node_failed_attempts").record(f64::from(failed_attempts));
}

/// Record the current pool size.
pub fn record_pool_size(size: usize) {
    metrics::gauge!("lodestar_node_pool_size").set(size as f64);
}
