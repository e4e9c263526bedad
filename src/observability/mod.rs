//! Logs and metrics.
//!
//! Log events carry the request id and backend id as fields. Metrics are
//! recorded through the `metrics` facade and only leave the process when
//! the Prometheus exporter is enabled.

pub mod logging;
pub mod metrics;
