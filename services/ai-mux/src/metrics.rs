//! Prometheus metrics exposition
//!
//! - `proxy_requests_total` (counter): labels `provider`, `status`, `method`
//! - `proxy_request_duration_seconds` (histogram): labels `provider`, `status`
//! - `proxy_upstream_errors_total` (counter): labels `provider`, `error_type`
//! - `proxy_response_bytes_total` (counter): label `provider`
//! - `credential_refresh_total` (counter): recorded by the credential manager

use metrics_exporter_prometheus::{BuildError, Matcher, PrometheusBuilder, PrometheusHandle};

const REQUEST_DURATION: &str = "proxy_request_duration_seconds";

/// 5ms up to the longest streamed completions we expect to proxy.
const DURATION_BUCKETS: &[f64] = &[
    0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0, 60.0, 120.0, 300.0,
];

fn builder() -> Result<PrometheusBuilder, BuildError> {
    PrometheusBuilder::new()
        .set_buckets_for_metric(Matcher::Full(REQUEST_DURATION.to_string()), DURATION_BUCKETS)
}

/// Install the global Prometheus recorder and return a handle for `/metrics`.
///
/// Fails if a global recorder is already installed.
pub fn install_recorder() -> Result<PrometheusHandle, BuildError> {
    builder()?.install_recorder()
}

/// Build a recorder that is not installed globally.
#[cfg(test)]
pub fn local_recorder() -> metrics_exporter_prometheus::PrometheusRecorder {
    builder()
        .expect("valid histogram buckets")
        .build_recorder()
}

/// Record a completed proxied request.
pub fn record_request(provider: &str, status: u16, method: &str, duration_secs: f64, bytes: u64) {
    let status = status.to_string();
    metrics::counter!(
        "proxy_requests_total",
        "provider" => provider.to_string(),
        "status" => status.clone(),
        "method" => method.to_string()
    )
    .increment(1);
    metrics::histogram!(REQUEST_DURATION, "provider" => provider.to_string(), "status" => status)
        .record(duration_secs);
    metrics::counter!("proxy_response_bytes_total", "provider" => provider.to_string())
        .increment(bytes);
}

/// Record an upstream failure: `timeout`, `connection`, `stream` or `other`.
pub fn record_upstream_error(provider: &str, error_type: &str) {
    metrics::counter!(
        "proxy_upstream_errors_total",
        "provider" => provider.to_string(),
        "error_type" => error_type.to_string()
    )
    .increment(1);
}
