//! Metrics collection and exposition.
//!
//! # Responsibilities
//! - Define load balancer metrics (requests, latency, backend load, health)
//! - Expose a Prometheus-compatible scrape endpoint when enabled
//!
//! # Metrics
//! - `lb_requests_total` (counter): requests by method, status, backend
//! - `lb_request_duration_seconds` (histogram): latency by method, status, backend
//! - `lb_backend_open_connections` (gauge): leased connections per backend
//! - `lb_backend_healthy` (gauge): 1=healthy, 0=unhealthy
//! - `lb_connect_failures_total` (counter): failed connects per backend
//! - `lb_pool_exhausted_total` (counter): acquisitions refused at capacity
//! - `lb_connections_invalidated_total` (counter): leases discarded after errors
//!
//! Recording is a no-op until a recorder is installed, so the functions are
//! safe to call from tests and from binaries with metrics disabled.

use std::net::SocketAddr;
use std::time::Instant;

use metrics_exporter_prometheus::{BuildError, PrometheusBuilder};

/// Install the Prometheus recorder and its HTTP listener.
///
/// Must be called from within a Tokio runtime.
pub fn init_metrics(addr: SocketAddr) -> Result<(), BuildError> {
    PrometheusBuilder::new().with_http_listener(addr).install()?;
    tracing::info!(address = %addr, "Metrics endpoint listening");
    Ok(())
}

pub fn record_request(method: &str, status: u16, backend: &str, start: Instant) {
    let labels = [
        ("method", method.to_string()),
        ("status", status.to_string()),
        ("backend", backend.to_string()),
    ];
    ::metrics::counter!("lb_requests_total", &labels).increment(1);
    ::metrics::histogram!("lb_request_duration_seconds", &labels)
        .record(start.elapsed().as_secs_f64());
}

pub fn record_open_connections(backend: &str, open: usize) {
    ::metrics::gauge!("lb_backend_open_connections", "backend" => backend.to_string())
        .set(open as f64);
}

pub fn record_backend_health(backend: &str, healthy: bool) {
    ::metrics::gauge!("lb_backend_healthy", "backend" => backend.to_string())
        .set(if healthy { 1.0 } else { 0.0 });
}

pub fn record_connect_failure(backend: &str) {
    ::metrics::counter!("lb_connect_failures_total", "backend" => backend.to_string())
        .increment(1);
}

pub fn record_pool_exhausted(backend: &str) {
    ::metrics::counter!("lb_pool_exhausted_total", "backend" => backend.to_string())
        .increment(1);
}

pub fn record_invalidated(backend: &str) {
    ::metrics::counter!("lb_connections_invalidated_total", "backend" => backend.to_string())
        .increment(1);
}
