//! Outbound connection pool.
//!
//! # Data Flow
//! ```text
//! acquire(backend)
//!     → reuse most recently used idle connection (valid, not expired)
//!     → else reserve a slot (CAS on the backend's open count) and connect
//!     → else Busy
//! Lease in flight
//!     → release()    → idle set, waiters notified
//!     → invalidate() → transport closed, slot freed, waiters notified
//! Sweeper (periodic)
//!     → close idle connections older than idle_timeout
//! ```
//!
//! # Design Decisions
//! - One `HostPool` per backend; its mutex guards only the idle list
//! - No I/O while holding a lock; connecting happens on a reserved slot
//! - Waiting for capacity uses `Notify`, never polling

pub mod connection;
pub mod connector;
#[cfg(test)]
pub(crate) mod testing;

use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use futures_util::future::select_all;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio::time::Instant;

use crate::config::PoolConfig;
use crate::load_balancer::Backend;
use crate::observability::metrics;

pub use connection::{Lease, PooledConnection, Protocol, UpstreamSender};
pub use connector::{ConnectError, Connector, HttpConnector, Upstream};

use connection::HostPool;

/// Why a lease could not be handed out.
#[derive(Debug, thiserror::Error)]
pub enum PoolError {
    /// Every slot is in use. Another backend may have room.
    #[error("backend {backend} is at capacity ({max} connections)")]
    Busy { backend: String, max: usize },
    /// Opening a new connection failed. Counts against backend health.
    #[error("connecting to backend {backend} failed: {source}")]
    ConnectFailed {
        backend: String,
        #[source]
        source: ConnectError,
    },
    /// Nothing to wait on.
    #[error("no backends to wait for")]
    NoBackends,
}

/// Per-backend pools of reusable connections.
pub struct ConnectionPool {
    connector: Arc<dyn Connector>,
    idle_timeout: Duration,
    hosts: DashMap<String, Arc<HostPool>>,
}

impl std::fmt::Debug for ConnectionPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionPool")
            .field("idle_timeout", &self.idle_timeout)
            .field("backends", &self.hosts.len())
            .finish()
    }
}

impl ConnectionPool {
    pub fn new(config: &PoolConfig, connector: Arc<dyn Connector>) -> Self {
        Self {
            connector,
            idle_timeout: config.idle_timeout(),
            hosts: DashMap::new(),
        }
    }

    /// Pool using the TCP/hyper connector described by `config`.
    pub fn with_http_connector(config: &PoolConfig) -> Self {
        Self::new(config, Arc::new(HttpConnector::from_config(config)))
    }

    fn host(&self, backend: &Arc<Backend>) -> Arc<HostPool> {
        if let Some(host) = self.hosts.get(&backend.id) {
            if host.is_for(backend) {
                return host.clone();
            }
        }
        let mut entry = self
            .hosts
            .entry(backend.id.clone())
            .or_insert_with(|| Arc::new(HostPool::new(backend)));
        // Same id re-registered as a new backend: start over.
        if !entry.is_for(backend) {
            *entry = Arc::new(HostPool::new(backend));
        }
        entry.value().clone()
    }

    /// Lease a connection without waiting.
    pub async fn acquire(&self, backend: &Arc<Backend>) -> Result<Lease, PoolError> {
        let host = self.host(backend);

        if let Some(conn) = host.pop_idle(self.idle_timeout) {
            tracing::trace!(backend = %backend.id, connection = conn.id(), "Reusing idle connection");
            return Ok(Lease::new(conn, backend.clone(), host));
        }

        let Some(slot) = backend.try_reserve() else {
            metrics::record_pool_exhausted(&backend.id);
            return Err(PoolError::Busy {
                backend: backend.id.clone(),
                max: backend.max_connections,
            });
        };

        match self.connector.connect(backend).await {
            Ok(upstream) => {
                let conn = PooledConnection::new(upstream, slot);
                Ok(Lease::new(conn, backend.clone(), host))
            }
            Err(source) => {
                drop(slot);
                host.capacity().notify_one();
                Err(PoolError::ConnectFailed {
                    backend: backend.id.clone(),
                    source,
                })
            }
        }
    }

    /// Lease a connection, waiting for capacity until `deadline`.
    pub async fn acquire_wait(
        &self,
        backend: &Arc<Backend>,
        deadline: Instant,
    ) -> Result<Lease, PoolError> {
        self.acquire_wait_any(std::slice::from_ref(backend), deadline)
            .await
    }

    /// Lease from whichever of `backends` frees capacity first, trying the
    /// least loaded first on every wakeup. Waits until `deadline`.
    pub async fn acquire_wait_any(
        &self,
        backends: &[Arc<Backend>],
        deadline: Instant,
    ) -> Result<Lease, PoolError> {
        let hosts: Vec<Arc<HostPool>> = backends.iter().map(|b| self.host(b)).collect();
        let mut order: Vec<&Arc<Backend>> = backends.iter().collect();
        loop {
            let mut wakeups: Vec<_> = hosts
                .iter()
                .map(|host| Box::pin(host.capacity().notified()))
                .collect();
            for wakeup in &mut wakeups {
                wakeup.as_mut().enable();
            }

            order.sort_by_key(|b| b.open_connections());
            let mut busy = None;
            for backend in &order {
                match self.acquire(backend).await {
                    Err(err @ PoolError::Busy { .. }) => {
                        busy.get_or_insert(err);
                    }
                    other => return other,
                }
            }
            let Some(busy) = busy else {
                return Err(PoolError::NoBackends);
            };
            if tokio::time::timeout_at(deadline, select_all(wakeups))
                .await
                .is_err()
            {
                return Err(busy);
            }
        }
    }

    /// Return a lease; see [`Lease::release`].
    pub fn release(&self, lease: Lease) {
        lease.release();
    }

    /// Discard a lease after an I/O error; see [`Lease::invalidate`].
    pub fn invalidate(&self, lease: Lease) {
        lease.invalidate();
    }

    /// Close idle connections past the idle timeout. Returns how many closed.
    pub fn sweep_idle(&self) -> usize {
        let mut closed = 0;
        for host in self.hosts.iter() {
            let expired = host.drain_expired(self.idle_timeout);
            if !expired.is_empty() {
                closed += expired.len();
                drop(expired);
                host.capacity().notify_one();
            }
        }
        if closed > 0 {
            tracing::debug!(closed, "Swept idle backend connections");
        }
        closed
    }

    /// Close every idle connection (shutdown).
    pub fn close_idle(&self) -> usize {
        let mut closed = 0;
        for host in self.hosts.iter() {
            closed += host.drain_all().len();
        }
        closed
    }

    /// Close the idle set of a removed backend. Leases still in flight are
    /// closed when they come back instead of rejoining an idle set.
    pub fn forget(&self, backend_id: &str) -> usize {
        let Some((_, host)) = self.hosts.remove(backend_id) else {
            return 0;
        };
        let closed = host.retire();
        tracing::debug!(backend = %backend_id, closed, "Closed idle connections of removed backend");
        closed
    }

    pub fn idle_count(&self, backend: &Backend) -> usize {
        self.hosts
            .get(&backend.id)
            .map(|h| h.idle_len())
            .unwrap_or(0)
    }

    /// Open transports (idle + leased) to `backend`.
    pub fn open_count(&self, backend: &Backend) -> usize {
        backend.pooled_connections()
    }

    /// Run `sweep_idle` every `interval` until shutdown.
    pub fn spawn_sweeper(
        self: Arc<Self>,
        interval: Duration,
        mut shutdown: broadcast::Receiver<()>,
    ) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        self.sweep_idle();
                    }
                    _ = shutdown.recv() => {
                        tracing::debug!("Idle sweeper stopping");
                        break;
                    }
                }
            }
        })
    }
}
