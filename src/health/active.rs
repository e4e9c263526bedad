//! Active health checking.
//!
//! # Responsibilities
//! - Periodically probe every registered backend
//! - Bring unhealthy backends back after `healthy_threshold` good probes
//! - Feed failed probes into the same failure streak as connect errors

use std::sync::Arc;
use std::time::Duration;

use axum::body::Body;
use axum::http::Request;
use hyper_util::{
    client::legacy::{connect::HttpConnector, Client},
    rt::TokioExecutor,
};
use tokio::sync::broadcast;
use tokio::time;

use crate::config::HealthCheckConfig;
use crate::load_balancer::{Backend, BackendRegistry};

/// Result of probing one backend.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProbeOutcome {
    Healthy,
    Unhealthy(String),
}

pub struct HealthMonitor {
    registry: Arc<BackendRegistry>,
    config: HealthCheckConfig,
    client: Client<HttpConnector, Body>,
}

impl HealthMonitor {
    pub fn new(registry: Arc<BackendRegistry>, config: HealthCheckConfig) -> Self {
        let mut connector = HttpConnector::new();
        connector.set_connect_timeout(Some(config.timeout()));
        // Health check sockets are not counted against max_connections; close each after use.
        let client = Client::builder(TokioExecutor::new())
            .pool_max_idle_per_host(0)
            .build(connector);

        Self {
            registry,
            config,
            client,
        }
    }

    pub async fn run(self, mut shutdown: broadcast::Receiver<()>) {
        if !self.config.enabled {
            tracing::info!("Active health checks disabled");
            return;
        }

        tracing::info!(
            interval_secs = self.config.interval_secs,
            path = %self.config.path,
            "Health monitor starting"
        );

        let mut ticker = time::interval(self.config.interval());
        ticker.set_missed_tick_behavior(time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    self.check_all().await;
                }
                _ = shutdown.recv() => {
                    tracing::info!("Health monitor received shutdown signal, exiting loop");
                    break;
                }
            }
        }
    }

    /// Probe every backend once and apply the results.
    pub async fn check_all(&self) {
        let probes = self
            .registry
            .list_backends()
            .into_iter()
            .map(|backend| async move {
                let outcome = self.probe(&backend).await;
                (backend, outcome)
            });

        for (backend, outcome) in futures_util::future::join_all(probes).await {
            self.apply(&backend, outcome);
        }
    }

    pub async fn probe(&self, backend: &Backend) -> ProbeOutcome {
        let uri = format!("http://{}{}", backend.authority(), self.config.path);
        let request = match Request::get(uri)
            .header("user-agent", "lb-proxy-health-check")
            .body(Body::empty())
        {
            Ok(req) => req,
            Err(e) => return ProbeOutcome::Unhealthy(format!("invalid probe request: {e}")),
        };

        match time::timeout(self.config.timeout(), self.client.request(request)).await {
            Ok(Ok(response)) if response.status().is_success() => ProbeOutcome::Healthy,
            Ok(Ok(response)) => ProbeOutcome::Unhealthy(format!("status {}", response.status())),
            Ok(Err(e)) => ProbeOutcome::Unhealthy(format!("connection error: {e}")),
            Err(_) => ProbeOutcome::Unhealthy(format!(
                "timed out after {:?}",
                Duration::from_secs(self.config.timeout_secs)
            )),
        }
    }

    fn apply(&self, backend: &Backend, outcome: ProbeOutcome) {
        match outcome {
            ProbeOutcome::Healthy => {
                let successes = backend.record_success();
                if !backend.is_healthy() && successes >= self.config.healthy_threshold {
                    self.registry.mark_healthy(backend);
                }
            }
            ProbeOutcome::Unhealthy(reason) => {
                tracing::warn!(backend = %backend.id, reason = %reason, "Health check failed");
                self.registry.record_connect_failure(backend, &reason);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    async fn ok_backend() -> std::net::SocketAddr {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            while let Ok((mut socket, _)) = listener.accept().await {
                tokio::spawn(async move {
                    let mut buf = [0u8; 1024];
                    let _ = socket.read(&mut buf).await;
                    let _ = socket
                        .write_all(b"HTTP/1.1 200 OK\r\nContent-Length: 2\r\nConnection: close\r\n\r\nok")
                        .await;
                    let _ = socket.shutdown().await;
                });
            }
        });
        addr
    }

    fn config(healthy_threshold: u32) -> HealthCheckConfig {
        HealthCheckConfig {
            timeout_secs: 1,
            healthy_threshold,
            ..HealthCheckConfig::default()
        }
    }

    #[tokio::test]
    async fn recovers_after_threshold_successes() {
        let addr = ok_backend().await;
        let backend = Arc::new(Backend::new(&format!("http://{addr}"), None, 4).unwrap());
        let registry = Arc::new(BackendRegistry::new(vec![backend.clone()], 3));
        registry.mark_unhealthy(&backend, "test");

        let monitor = HealthMonitor::new(registry.clone(), config(2));
        monitor.check_all().await;
        assert!(!backend.is_healthy());
        monitor.check_all().await;
        assert!(backend.is_healthy());
    }

    #[tokio::test]
    async fn failed_probes_count_toward_threshold() {
        // Bind then drop to get a port nobody listens on.
        let addr = TcpListener::bind("127.0.0.1:0").await.unwrap().local_addr().unwrap();
        let backend = Arc::new(Backend::new(&format!("http://{addr}"), None, 4).unwrap());
        let registry = Arc::new(BackendRegistry::new(vec![backend.clone()], 2));

        let monitor = HealthMonitor::new(registry, config(1));
        monitor.check_all().await;
        assert!(backend.is_healthy());
        monitor.check_all().await;
        assert!(!backend.is_healthy());
    }
}
