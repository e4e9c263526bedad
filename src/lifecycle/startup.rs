//! Startup orchestration.
//!
//! # Responsibilities
//! - Build the Tokio runtime sized by `runtime.io_threads`
//! - Initialize subsystems in dependency order (metrics, backends, pool)
//! - Bind the listener last and begin accepting traffic
//!
//! # Design Decisions
//! - Fail fast: any startup error is fatal
//! - Subsystems initialize in order, not concurrently
//! - Listeners start last (traffic only when ready)

use std::net::SocketAddr;
use std::sync::Arc;

use tokio::runtime::Runtime;
use tokio::task::JoinHandle;

use crate::config::{validate_config, ConfigError, LbConfig, RuntimeConfig};
use crate::http::{HttpServer, ServerError};
use crate::lifecycle::Shutdown;
use crate::load_balancer::{Backend, BackendRegistry};
use crate::net::{Listener, ListenerError};
use crate::observability::metrics;
use crate::pool::ConnectionPool;

/// Error type for bringing the load balancer up.
#[derive(Debug, thiserror::Error)]
pub enum StartupError {
    #[error("failed to build runtime: {0}")]
    Runtime(std::io::Error),
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error("invalid metrics address '{address}': {source}")]
    MetricsAddress {
        address: String,
        source: std::net::AddrParseError,
    },
    #[error("failed to start metrics exporter: {0}")]
    Metrics(#[from] metrics_exporter_prometheus::BuildError),
    #[error(transparent)]
    Server(#[from] ServerError),
    #[error("server task failed: {0}")]
    Join(#[from] tokio::task::JoinError),
}

impl From<ListenerError> for StartupError {
    fn from(err: ListenerError) -> Self {
        StartupError::Server(ServerError::Listener(err))
    }
}

/// Multi-threaded runtime with `io_threads` workers.
pub fn build_runtime(config: &RuntimeConfig) -> Result<Runtime, StartupError> {
    tokio::runtime::Builder::new_multi_thread()
        .worker_threads(config.io_threads)
        .thread_name("lb-io")
        .enable_all()
        .build()
        .map_err(StartupError::Runtime)
}

/// A server accepting traffic in a background task.
#[derive(Debug)]
pub struct Running {
    local_addr: SocketAddr,
    shutdown: Shutdown,
    registry: Arc<BackendRegistry>,
    pool: Arc<ConnectionPool>,
    task: JoinHandle<Result<(), ServerError>>,
}

impl Running {
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn shutdown(&self) -> &Shutdown {
        &self.shutdown
    }

    pub fn registry(&self) -> &Arc<BackendRegistry> {
        &self.registry
    }

    pub fn pool(&self) -> &Arc<ConnectionPool> {
        &self.pool
    }

    /// Stop dispatching to `id` and close its pooled connections.
    pub fn remove_backend(&self, id: &str) -> Option<Arc<Backend>> {
        let removed = self.registry.remove_backend(id)?;
        self.pool.forget(&removed.id);
        Some(removed)
    }

    /// Wait until the server exits on its own (after a shutdown trigger).
    pub async fn wait(self) -> Result<(), StartupError> {
        self.task.await??;
        Ok(())
    }

    /// Trigger shutdown and wait for the drain to finish.
    pub async fn stop(self) -> Result<(), StartupError> {
        self.shutdown.trigger();
        self.wait().await
    }
}

/// Build everything from `config` and start serving. Must run inside a Tokio runtime.
pub fn start(config: LbConfig) -> Result<Running, StartupError> {
    validate_config(&config).map_err(ConfigError::Validation)?;
    if config.observability.metrics_enabled {
        let address = &config.observability.metrics_address;
        let addr = address
            .parse()
            .map_err(|source| StartupError::MetricsAddress {
                address: address.clone(),
                source,
            })?;
        metrics::init_metrics(addr)?;
    }
    start_server(HttpServer::new(config)?)
}

/// Bind the listener for an already built server and spawn its accept loop.
pub fn start_server(server: HttpServer) -> Result<Running, StartupError> {
    let listener = Listener::bind(&server.config().listener)?;
    let local_addr = listener.local_addr().map_err(ListenerError::Bind)?;

    let shutdown = Shutdown::new();
    let registry = server.registry().clone();
    let pool = server.pool().clone();
    let task = tokio::spawn(server.run(listener, shutdown.subscribe()));

    tracing::info!(address = %local_addr, "Load balancer ready");
    Ok(Running {
        local_addr,
        shutdown,
        registry,
        pool,
        task,
    })
}
