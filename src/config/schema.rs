//! Configuration schema definitions.
//!
//! This module defines the complete configuration structure for the load
//! balancer. Every tunable lives here; components receive the section they
//! need at construction and never consult library defaults.
//!
//! The `Default` impls carry the demonstrated tuning: front door on
//! `0.0.0.0:8000`, 20 connections per backend, `cores × 8` workers, 4 I/O
//! threads, backlog 1000 and a 30 s request deadline. The default backend
//! list is empty; [`LbConfig::demonstrated`] adds the `127.0.0.1:8001` one.

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Root configuration for the load balancer.
#[derive(Debug, Clone, Deserialize, Serialize, Default)]
#[serde(default)]
pub struct LbConfig {
    /// Front-door listener (bind address, backlog, protocol).
    pub listener: ListenerConfig,

    /// Runtime sizing (worker pool and I/O threads).
    pub runtime: RuntimeConfig,

    /// Static backend list, in dispatch tie-break order.
    pub backends: Vec<BackendConfig>,

    /// Outbound connection pool settings.
    pub pool: PoolConfig,

    /// Request pipeline behavior.
    pub proxy: ProxyConfig,

    /// Active health probing.
    pub health_check: HealthCheckConfig,

    /// Graceful shutdown.
    pub shutdown: ShutdownConfig,

    /// Logging and metrics.
    pub observability: ObservabilityConfig,
}

/// Listener configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ListenerConfig {
    /// Bind address (e.g., "0.0.0.0:8000").
    pub bind_address: String,

    /// Kernel accept backlog.
    pub backlog: u32,

    /// Maximum concurrently served inbound connections (backpressure).
    pub max_inbound_connections: usize,

    /// Accept HTTP/2 (prior knowledge) alongside HTTP/1.1.
    pub http2: bool,
}

impl Default for ListenerConfig {
    fn default() -> Self {
        Self {
            bind_address: "0.0.0.0:8000".to_string(),
            backlog: 1000,
            max_inbound_connections: 10_000,
            http2: true,
        }
    }
}

/// Runtime sizing.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct RuntimeConfig {
    /// Maximum number of requests processed concurrently.
    pub worker_count: usize,

    /// Number of runtime threads driving socket readiness.
    pub io_threads: usize,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        let cores = std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(1);
        Self {
            worker_count: cores * 8,
            io_threads: 4,
        }
    }
}

/// Backend server configuration.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Eq)]
pub struct BackendConfig {
    /// Optional identifier; defaults to `host:port`.
    #[serde(default)]
    pub name: Option<String>,

    /// Backend base URL (e.g., "http://127.0.0.1:8001/").
    pub address: String,

    /// Per-backend override of `pool.max_connections_per_backend`.
    #[serde(default)]
    pub max_connections: Option<usize>,
}

impl BackendConfig {
    /// Backend with no name and no capacity override.
    pub fn new(address: impl Into<String>) -> Self {
        Self {
            name: None,
            address: address.into(),
            max_connections: None,
        }
    }
}

/// Outbound connection pool configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct PoolConfig {
    /// Upper bound on open connections per backend.
    pub max_connections_per_backend: usize,

    /// Idle connections older than this are closed by the sweeper.
    pub idle_timeout_ms: u64,

    /// How often the idle sweeper runs.
    pub sweep_interval_ms: u64,

    /// Deadline for opening a new backend connection.
    pub connect_timeout_ms: u64,

    /// Speak HTTP/2 (prior knowledge) to backends instead of HTTP/1.1.
    pub backend_http2: bool,
}

impl PoolConfig {
    pub fn idle_timeout(&self) -> Duration {
        Duration::from_millis(self.idle_timeout_ms)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_millis(self.sweep_interval_ms)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_connections_per_backend: 20,
            idle_timeout_ms: 60_000,
            sweep_interval_ms: 5_000,
            connect_timeout_ms: 5_000,
            backend_http2: false,
        }
    }
}

/// What to do when every candidate backend is at capacity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ExhaustedPolicy {
    /// Answer 503 immediately.
    Reject,
    /// Wait up to `pool_wait_timeout_ms` for a slot, then 503.
    Wait,
}

/// What to do when no backend is healthy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum UnavailablePolicy {
    /// Answer 503.
    FailClosed,
    /// Dispatch to the least-loaded backend regardless of health.
    FailOpen,
}

/// Backend selection strategy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Strategy {
    LeastConnections,
    RoundRobin,
}

/// Request pipeline configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ProxyConfig {
    /// Hard deadline from request start to response completion.
    pub max_request_time_ms: u64,

    /// Append to incoming `X-Forwarded-*` headers instead of replacing them.
    pub reuse_x_forwarded: bool,

    /// Replace the `Host` header with the backend authority.
    pub rewrite_host_header: bool,

    /// Retry once against another backend when connecting fails.
    pub retry_on_connect_failure: bool,

    /// Behavior when all candidate pools are exhausted.
    pub exhausted_policy: ExhaustedPolicy,

    /// Bound on the wait under `ExhaustedPolicy::Wait`.
    pub pool_wait_timeout_ms: u64,

    /// Behavior when no backend is healthy.
    pub unavailable_policy: UnavailablePolicy,

    /// Backend selection strategy.
    pub strategy: Strategy,

    /// Consecutive connect failures before a backend is marked unhealthy.
    pub failure_threshold: u32,
}

impl ProxyConfig {
    pub fn max_request_time(&self) -> Duration {
        Duration::from_millis(self.max_request_time_ms)
    }

    pub fn pool_wait_timeout(&self) -> Duration {
        Duration::from_millis(self.pool_wait_timeout_ms)
    }
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            max_request_time_ms: 30_000,
            reuse_x_forwarded: false,
            rewrite_host_header: false,
            retry_on_connect_failure: true,
            exhausted_policy: ExhaustedPolicy::Reject,
            pool_wait_timeout_ms: 1_000,
            unavailable_policy: UnavailablePolicy::FailClosed,
            strategy: Strategy::LeastConnections,
            failure_threshold: 3,
        }
    }
}

/// Health check configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct HealthCheckConfig {
    /// Enable active health checks.
    pub enabled: bool,

    /// Health check interval in seconds.
    pub interval_secs: u64,

    /// Health check timeout in seconds.
    pub timeout_secs: u64,

    /// Path to probe for HTTP health checks.
    pub path: String,

    /// Number of consecutive successes before marking healthy again.
    pub healthy_threshold: u32,
}

impl HealthCheckConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs)
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

impl Default for HealthCheckConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            interval_secs: 10,
            timeout_secs: 5,
            path: "/".to_string(),
            healthy_threshold: 1,
        }
    }
}

/// Shutdown configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ShutdownConfig {
    /// Time allowed for in-flight connections to finish.
    pub grace_period_secs: u64,
}

impl ShutdownConfig {
    pub fn grace_period(&self) -> Duration {
        Duration::from_secs(self.grace_period_secs)
    }
}

impl Default for ShutdownConfig {
    fn default() -> Self {
        Self {
            grace_period_secs: 30,
        }
    }
}

/// Log output format.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum LogFormat {
    Full,
    Compact,
    Json,
}

/// Observability configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ObservabilityConfig {
    /// Log level (trace, debug, info, warn, error); `RUST_LOG` wins.
    pub log_level: String,

    /// Log line format.
    pub log_format: LogFormat,

    /// Enable metrics endpoint.
    pub metrics_enabled: bool,

    /// Metrics endpoint bind address.
    pub metrics_address: String,
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            log_format: LogFormat::Full,
            metrics_enabled: false,
            metrics_address: "0.0.0.0:9090".to_string(),
        }
    }
}

impl Default for BackendConfig {
    fn default() -> Self {
        Self::new("http://127.0.0.1:8001/")
    }
}

impl LbConfig {
    /// Capacity for a backend, honoring its override.
    pub fn max_connections_for(&self, backend: &BackendConfig) -> usize {
        backend
            .max_connections
            .unwrap_or(self.pool.max_connections_per_backend)
    }

    /// The demonstrated deployment: one backend on loopback port 8001.
    pub fn demonstrated() -> Self {
        Self {
            backends: vec![BackendConfig::default()],
            ..Self::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_demonstrated_deployment() {
        let config = LbConfig::demonstrated();
        assert_eq!(config.listener.bind_address, "0.0.0.0:8000");
        assert_eq!(config.listener.backlog, 1000);
        assert_eq!(config.pool.max_connections_per_backend, 20);
        assert_eq!(config.runtime.io_threads, 4);
        assert_eq!(config.proxy.max_request_time(), Duration::from_secs(30));
        assert!(!config.proxy.reuse_x_forwarded);
        assert!(!config.proxy.rewrite_host_header);
        assert_eq!(config.backends, vec![BackendConfig::new("http://127.0.0.1:8001/")]);
        assert_eq!(config.runtime.worker_count % 8, 0);
    }

    #[test]
    fn backend_override_wins() {
        let mut config = LbConfig::default();
        let plain = BackendConfig::new("http://a:1");
        let tuned = BackendConfig {
            max_connections: Some(2),
            ..BackendConfig::new("http://b:1")
        };
        config.pool.max_connections_per_backend = 7;
        assert_eq!(config.max_connections_for(&plain), 7);
        assert_eq!(config.max_connections_for(&tuned), 2);
    }

    #[test]
    fn partial_toml_keeps_defaults() {
        let config: LbConfig = toml::from_str(
            r#"
            [proxy]
            exhausted_policy = "wait"
            unavailable_policy = "fail_open"

            [[backends]]
            address = "http://10.0.0.1:9000"
            "#,
        )
        .unwrap();

        assert_eq!(config.proxy.exhausted_policy, ExhaustedPolicy::Wait);
        assert_eq!(config.proxy.unavailable_policy, UnavailablePolicy::FailOpen);
        assert_eq!(config.proxy.strategy, Strategy::LeastConnections);
        assert_eq!(config.proxy.max_request_time_ms, 30_000);
        assert_eq!(config.backends.len(), 1);
        assert_eq!(config.backends[0].max_connections, None);
    }
}
