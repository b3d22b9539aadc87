//! Prometheus metrics exposition
//!
//! - `gateway_requests_total` (counter): labels `status`, `mode`
//! - `gateway_request_duration_seconds` (histogram): label `status`
//! - `gateway_upstream_errors_total` (counter): label `error_type`
//! - `gateway_pool_exhausted_total` (counter)

use metrics_exporter_prometheus::{Matcher, PrometheusBuilder, PrometheusHandle};

const DURATION_METRIC: &str = "gateway_request_duration_seconds";

/// Streamed completions stay open for as long as the upstream keeps talking,
/// so the upper buckets reach well past a typical idle timeout.
const DURATION_BUCKETS: &[f64] = &[
    0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0, 60.0, 120.0, 300.0,
];

fn builder() -> PrometheusBuilder {
    PrometheusBuilder::new()
        .set_buckets_for_metric(Matcher::Full(DURATION_METRIC.to_string()), DURATION_BUCKETS)
        .expect("failed to set histogram buckets")
}

/// Install the Prometheus recorder and return a handle for rendering metrics.
pub fn install_recorder() -> PrometheusHandle {
    builder()
        .install_recorder()
        .expect("failed to install Prometheus recorder")
}

/// Record a finished completion request. `mode` is `stream` or `blocking`.
///
/// For streams the duration covers the time until response headers were
/// sent; body-level failures surface through `record_upstream_error`.
pub fn record_request(status: u16, mode: &str, duration_secs: f64) {
    let status_str = status.to_string();
    metrics::counter!("gateway_requests_total", "status" => status_str.clone(), "mode" => mode.to_string())
        .increment(1);
    metrics::histogram!(DURATION_METRIC, "status" => status_str).record(duration_secs);
}

/// Record an upstream failure: `transport`, `status`, `protocol`,
/// `stream_failed` or `idle_timeout`.
pub fn record_upstream_error(error_type: &str) {
    metrics::counter!("gateway_upstream_errors_total", "error_type" => error_type.to_string())
        .increment(1);
}

/// Record a request turned away because no session could be leased.
pub fn record_pool_exhausted() {
    metrics::counter!("gateway_pool_exhausted_total").increment(1);
}
