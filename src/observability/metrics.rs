//! Metrics collection and exposition.
//!
//! # Responsibilities
//! - Define registry metrics (endpoints, churn, dial failures, retries)
//! - Expose a Prometheus-compatible scrape endpoint
//! - Track per-service and aggregate series
//!
//! # Metrics
//! - `registry_endpoints` (gauge): live endpoints, by service
//! - `registry_endpoint_changes_total` (counter): by service and change
//! - `registry_connect_failures_total` (counter): failed dials, by service
//! - `registry_retry_outcomes_total` (counter): sweep results, by outcome
//! - `registry_retry_pending` (gauge): instances waiting for a retry
//! - `registry_watch_restarts_total` (counter): watch re-establishments
//! - `registry_notifications_dropped_total` (counter): full subscriber queues
//!
//! # Design Decisions
//! - Recording is a no-op until a recorder is installed
//! - Labels are service logical paths, never instance keys

use std::net::SocketAddr;

use metrics_exporter_prometheus::PrometheusBuilder;

/// Install the Prometheus recorder and its HTTP listener.
///
/// Must be called from within a Tokio runtime.
pub fn init_metrics(addr: SocketAddr) {
    match PrometheusBuilder::new().with_http_listener(addr).install() {
        Ok(()) => tracing::info!(address = %addr, "Metrics endpoint listening"),
        Err(e) => tracing::error!(address = %addr, error = %e, "Failed to install metrics exporter"),
    }
}

pub fn set_endpoint_count(service: &str, count: usize) {
    metrics::gauge!("registry_endpoints", "service" => service.to_string()).set(count as f64);
}

/// `change` is one of `added`, `replaced`, `removed`.
pub fn record_endpoint_change(service: &str, change: &'static str) {
    metrics::counter!(
        "registry_endpoint_changes_total",
        "service" => service.to_string(),
        "change" => change
    )
    .increment(1);
}

pub fn record_connect_failure(service: &str) {
    metrics::counter!("registry_connect_failures_total", "service" => service.to_string())
        .increment(1);
}

/// `outcome` is one of `recovered`, `failed`, `given_up`, `dropped`, `deferred`.
pub fn record_retry_outcome(outcome: &'static str, count: usize) {
    if count == 0 {
        return;
    }
    metrics::counter!("registry_retry_outcomes_total", "outcome" => outcome)
        .increment(count as u64);
}

pub fn set_retry_pending(count: usize) {
    metrics::gauge!("registry_retry_pending").set(count as f64);
}

pub fn record_watch_restart() {
    metrics::counter!("registry_watch_restarts_total").increment(1);
}

pub fn record_notifications_dropped(service: &str, count: usize) {
    metrics::counter!(
        "registry_notifications_dropped_total",
        "service" => service.to_string()
    )
    .increment(count as u64);
}
