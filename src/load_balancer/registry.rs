//! Backend registry.
//!
//! # Responsibilities
//! - Own the ordered set of known backends
//! - Answer least-loaded queries over healthy backends
//! - Apply health transitions (explicit marks and connect-failure streaks)
//! - Support adding and removing backends at runtime
//!
//! # Design Decisions
//! - The backend list is an `ArcSwap` snapshot: dispatch reads never lock
//! - Registration order is dispatch tie-break order
//! - The registry never touches connection counts; the pool does

use std::sync::{Arc, Mutex};

use arc_swap::ArcSwap;

use crate::config::{BackendConfig, LbConfig};
use crate::load_balancer::backend::{Backend, BackendAddrError, HealthState};
use crate::load_balancer::{least_conn::LeastConnections, LoadBalancer};
use crate::observability::metrics;

/// No backend satisfied the query.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("no healthy backend available")]
pub struct NoneAvailable;

/// Error type for registry changes.
#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
    #[error("backend '{0}' is already registered")]
    Duplicate(String),
    #[error(transparent)]
    Address(#[from] BackendAddrError),
}

/// The set of backends and their runtime state.
#[derive(Debug)]
pub struct BackendRegistry {
    backends: ArcSwap<Vec<Arc<Backend>>>,
    /// Serializes add/remove; readers never take it.
    writers: Mutex<()>,
    failure_threshold: u32,
}

impl BackendRegistry {
    pub fn new(backends: Vec<Arc<Backend>>, failure_threshold: u32) -> Self {
        for backend in &backends {
            metrics::record_backend_health(&backend.id, backend.is_healthy());
        }
        Self {
            backends: ArcSwap::from_pointee(backends),
            writers: Mutex::new(()),
            failure_threshold,
        }
    }

    /// Build the registry from validated configuration.
    pub fn from_config(config: &LbConfig) -> Result<Self, RegistryError> {
        let mut backends: Vec<Arc<Backend>> = Vec::with_capacity(config.backends.len());
        for backend_config in &config.backends {
            let backend = Backend::new(
                &backend_config.address,
                backend_config.name.as_deref(),
                config.max_connections_for(backend_config),
            )?;
            if backends.iter().any(|b| b.id == backend.id) {
                return Err(RegistryError::Duplicate(backend.id));
            }
            backends.push(Arc::new(backend));
        }
        Ok(Self::new(backends, config.proxy.failure_threshold))
    }

    /// All backends in registration order.
    pub fn list_backends(&self) -> Vec<Arc<Backend>> {
        self.backends.load().as_ref().clone()
    }

    /// Cheap shared view of the current backend list.
    pub fn snapshot(&self) -> Arc<Vec<Arc<Backend>>> {
        self.backends.load_full()
    }

    pub fn get(&self, id: &str) -> Option<Arc<Backend>> {
        self.backends.load().iter().find(|b| b.id == id).cloned()
    }

    pub fn len(&self) -> usize {
        self.backends.load().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn failure_threshold(&self) -> u32 {
        self.failure_threshold
    }

    /// Exclude a backend from dispatch until it is marked healthy again.
    pub fn mark_unhealthy(&self, backend: &Backend, reason: &str) {
        backend.touch_last_failure();
        if backend.set_health(HealthState::Unhealthy) {
            tracing::warn!(backend = %backend.id, reason, "Backend marked unhealthy");
            metrics::record_backend_health(&backend.id, false);
        }
    }

    /// Return a backend to dispatch and clear its failure streak.
    pub fn mark_healthy(&self, backend: &Backend) {
        backend.reset_counters();
        if backend.set_health(HealthState::Healthy) {
            tracing::info!(backend = %backend.id, "Backend marked healthy");
            metrics::record_backend_health(&backend.id, true);
        }
    }

    /// Healthy backend with the fewest leased connections; ties by registration order.
    pub fn least_loaded(&self) -> Result<Arc<Backend>, NoneAvailable> {
        let healthy: Vec<_> = self
            .backends
            .load()
            .iter()
            .filter(|b| b.is_healthy())
            .cloned()
            .collect();
        LeastConnections.next_server(&healthy).ok_or(NoneAvailable)
    }

    /// Same scan ignoring health; the fail-open fallback.
    pub fn least_loaded_any(&self) -> Result<Arc<Backend>, NoneAvailable> {
        LeastConnections
            .next_server(&self.backends.load())
            .ok_or(NoneAvailable)
    }

    /// Count a connect failure. Returns true if this one made the backend unhealthy.
    pub fn record_connect_failure(&self, backend: &Backend, reason: &str) -> bool {
        let failures = backend.record_failure();
        metrics::record_connect_failure(&backend.id);
        tracing::debug!(backend = %backend.id, failures, reason, "Connect failure recorded");

        if failures >= self.failure_threshold && backend.is_healthy() {
            self.mark_unhealthy(
                backend,
                &format!("{failures} consecutive connect failures, last: {reason}"),
            );
            return true;
        }
        false
    }

    /// A completed exchange breaks any failure streak.
    pub fn record_success(&self, backend: &Backend) {
        backend.record_success();
    }

    /// Register a new backend at the end of the dispatch order.
    pub fn add_backend(
        &self,
        config: &BackendConfig,
        default_max_connections: usize,
    ) -> Result<Arc<Backend>, RegistryError> {
        let backend = Arc::new(Backend::new(
            &config.address,
            config.name.as_deref(),
            config.max_connections.unwrap_or(default_max_connections),
        )?);

        let _guard = self.writers.lock().unwrap_or_else(|e| e.into_inner());
        let current = self.backends.load_full();
        if current.iter().any(|b| b.id == backend.id) {
            return Err(RegistryError::Duplicate(backend.id.clone()));
        }
        let mut next = current.as_ref().clone();
        next.push(backend.clone());
        self.backends.store(Arc::new(next));

        metrics::record_backend_health(&backend.id, true);
        tracing::info!(backend = %backend.id, "Added backend");
        Ok(backend)
    }

    /// Stop dispatching to a backend. In-flight leases finish normally;
    /// pooled connections are closed by `ConnectionPool::forget`.
    pub fn remove_backend(&self, id: &str) -> Option<Arc<Backend>> {
        let _guard = self.writers.lock().unwrap_or_else(|e| e.into_inner());
        let current = self.backends.load_full();
        let position = current.iter().position(|b| b.id == id)?;
        let mut next = current.as_ref().clone();
        let removed = next.remove(position);
        self.backends.store(Arc::new(next));

        tracing::info!(backend = %id, "Removed backend");
        Some(removed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn registry(ports: &[u16]) -> BackendRegistry {
        let backends = ports
            .iter()
            .map(|p| Arc::new(Backend::new(&format!("http://127.0.0.1:{p}"), None, 10).unwrap()))
            .collect();
        BackendRegistry::new(backends, 3)
    }

    #[test]
    fn least_loaded_prefers_smallest_count() {
        let reg = registry(&[1, 2, 3]);
        let all = reg.list_backends();
        all[0].lease_started();
        all[0].lease_started();
        all[1].lease_started();

        assert_eq!(reg.least_loaded().unwrap().id, all[2].id);
        all[2].lease_started();
        all[2].lease_started();
        assert_eq!(reg.least_loaded().unwrap().id, all[1].id);
    }

    #[test]
    fn least_loaded_ties_go_to_insertion_order() {
        let reg = registry(&[3, 1, 2]);
        assert_eq!(reg.least_loaded().unwrap().id, "127.0.0.1:3");
    }

    #[test]
    fn unhealthy_backends_are_skipped() {
        let reg = registry(&[1, 2]);
        let all = reg.list_backends();
        all[1].lease_started();
        reg.mark_unhealthy(&all[0], "test");

        assert_eq!(reg.least_loaded().unwrap().id, all[1].id);

        reg.mark_unhealthy(&all[1], "test");
        assert!(matches!(reg.least_loaded(), Err(NoneAvailable)));
        assert_eq!(reg.least_loaded_any().unwrap().id, all[0].id);
    }

    #[test]
    fn three_connect_failures_mark_unhealthy_until_marked_healthy() {
        let reg = registry(&[1, 2]);
        let flaky = reg.get("127.0.0.1:1").unwrap();

        assert!(!reg.record_connect_failure(&flaky, "refused"));
        assert!(!reg.record_connect_failure(&flaky, "refused"));
        assert!(reg.record_connect_failure(&flaky, "refused"));
        assert!(!flaky.is_healthy());
        assert!(flaky.last_failure().is_some());

        for _ in 0..5 {
            assert_eq!(reg.least_loaded().unwrap().id, "127.0.0.1:2");
        }

        reg.mark_healthy(&flaky);
        assert_eq!(flaky.consecutive_failures(), 0);
        assert_eq!(reg.least_loaded().unwrap().id, "127.0.0.1:1");
    }

    #[test]
    fn success_breaks_failure_streak() {
        let reg = registry(&[1]);
        let b = reg.get("127.0.0.1:1").unwrap();
        reg.record_connect_failure(&b, "refused");
        reg.record_connect_failure(&b, "refused");
        reg.record_success(&b);
        reg.record_connect_failure(&b, "refused");
        assert!(b.is_healthy());
    }

    #[test]
    fn add_and_remove() {
        let reg = registry(&[1]);
        let added = reg.add_backend(&BackendConfig::new("http://127.0.0.1:2"), 5).unwrap();
        assert_eq!(added.max_connections, 5);
        assert_eq!(reg.len(), 2);

        assert!(matches!(
            reg.add_backend(&BackendConfig::new("http://127.0.0.1:2/"), 5),
            Err(RegistryError::Duplicate(_))
        ));

        let snapshot = reg.snapshot();
        let removed = reg.remove_backend("127.0.0.1:1").unwrap();
        assert_eq!(removed.id, "127.0.0.1:1");
        assert_eq!(reg.len(), 1);
        assert_eq!(snapshot.len(), 2, "existing snapshots are unaffected");
        assert!(reg.remove_backend("127.0.0.1:1").is_none());
    }

    #[test]
    fn from_config_keeps_order_and_capacity() {
        let mut config = LbConfig::default();
        config.pool.max_connections_per_backend = 20;
        config.backends = vec![
            BackendConfig::new("http://127.0.0.1:8002"),
            BackendConfig {
                max_connections: Some(1),
                ..BackendConfig::new("http://127.0.0.1:8001")
            },
        ];

        let reg = BackendRegistry::from_config(&config).unwrap();
        let all = reg.list_backends();
        assert_eq!(all[0].id, "127.0.0.1:8002");
        assert_eq!(all[0].max_connections, 20);
        assert_eq!(all[1].max_connections, 1);
        assert_eq!(reg.failure_threshold(), 3);
    }
}
