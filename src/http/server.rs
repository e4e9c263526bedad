//! HTTP server setup and configuration.
//!
//! # Responsibilities
//! - Create the Axum Router around the proxy handler
//! - Configure HTTP/1.1 and HTTP/2 support
//! - Wire up middleware (request ID, tracing)
//! - Bound concurrent request handling to the worker pool size
//! - Run the accept loop, background tasks and graceful drain

use std::sync::Arc;
use std::time::Duration;

use axum::{
    body::Body,
    extract::State,
    http::{Request, Response},
    Router,
};
use hyper::body::Incoming;
use hyper::service::service_fn;
use hyper_util::rt::{TokioExecutor, TokioIo};
use hyper_util::server::conn::auto;
use tokio::sync::{broadcast, watch, Semaphore};
use tokio::task::JoinSet;
use tower::{ServiceBuilder, ServiceExt};
use tower_http::request_id::{MakeRequestUuid, PropagateRequestIdLayer, SetRequestIdLayer};
use tower_http::trace::TraceLayer;

use crate::config::LbConfig;
use crate::health::HealthMonitor;
use crate::http::proxy::{ConnectionInfo, ProxyHandler, X_REQUEST_ID};
use crate::load_balancer::{BackendRegistry, RegistryError};
use crate::net::{ConnectionTracker, Listener, ListenerError};
use crate::pool::{ConnectionPool, Connector};

/// Error type for building or running the server.
#[derive(Debug, thiserror::Error)]
pub enum ServerError {
    #[error("invalid backend set: {0}")]
    Registry(#[from] RegistryError),
    #[error(transparent)]
    Listener(#[from] ListenerError),
}

/// HTTP server for the load balancer.
pub struct HttpServer {
    router: Router,
    config: LbConfig,
    registry: Arc<BackendRegistry>,
    pool: Arc<ConnectionPool>,
}

impl HttpServer {
    /// Create a server that dials backends over TCP.
    pub fn new(config: LbConfig) -> Result<Self, ServerError> {
        let pool = Arc::new(ConnectionPool::with_http_connector(&config.pool));
        Self::with_pool(config, pool)
    }

    /// Create a server that opens backend connections through `connector`.
    pub fn with_connector(config: LbConfig, connector: Arc<dyn Connector>) -> Result<Self, ServerError> {
        let pool = Arc::new(ConnectionPool::new(&config.pool, connector));
        Self::with_pool(config, pool)
    }

    fn with_pool(config: LbConfig, pool: Arc<ConnectionPool>) -> Result<Self, ServerError> {
        let registry = Arc::new(BackendRegistry::from_config(&config)?);
        let proxy = Arc::new(ProxyHandler::new(&config, registry.clone(), pool.clone()));
        let router = Self::build_router(proxy);
        Ok(Self {
            router,
            config,
            registry,
            pool,
        })
    }

    /// Build the Axum router with all middleware layers.
    fn build_router(proxy: Arc<ProxyHandler>) -> Router {
        Router::new()
            .fallback(proxy_handler)
            .with_state(proxy)
            .layer(
                ServiceBuilder::new()
                    .layer(SetRequestIdLayer::x_request_id(MakeRequestUuid))
                    .layer(TraceLayer::new_for_http().make_span_with(|request: &Request<Body>| {
                        let request_id = request
                            .headers()
                            .get(X_REQUEST_ID)
                            .and_then(|v| v.to_str().ok())
                            .unwrap_or("unknown");
                        tracing::info_span!(
                            "request",
                            request_id = %request_id,
                            method = %request.method(),
                            uri = %request.uri(),
                        )
                    }))
                    .layer(PropagateRequestIdLayer::x_request_id()),
            )
    }

    pub fn config(&self) -> &LbConfig {
        &self.config
    }

    pub fn registry(&self) -> &Arc<BackendRegistry> {
        &self.registry
    }

    pub fn pool(&self) -> &Arc<ConnectionPool> {
        &self.pool
    }

    /// The request pipeline without the accept loop.
    pub fn router(&self) -> Router {
        self.router.clone()
    }

    /// Serve connections from `listener` until `shutdown` fires, then drain.
    pub async fn run(
        self,
        listener: Listener,
        mut shutdown: broadcast::Receiver<()>,
    ) -> Result<(), ServerError> {
        let local_addr = listener.local_addr().map_err(ListenerError::Bind)?;
        tracing::info!(
            address = %local_addr,
            backends = self.registry.len(),
            workers = self.config.runtime.worker_count,
            http2 = self.config.listener.http2,
            "HTTP server starting"
        );

        let mut background = Vec::new();
        if self.config.health_check.enabled {
            let monitor = HealthMonitor::new(self.registry.clone(), self.config.health_check.clone());
            background.push(tokio::spawn(monitor.run(shutdown.resubscribe())));
        }
        background.push(
            self.pool
                .clone()
                .spawn_sweeper(self.config.pool.sweep_interval(), shutdown.resubscribe()),
        );

        let workers = Arc::new(Semaphore::new(self.config.runtime.worker_count));
        let mut builder = auto::Builder::new(TokioExecutor::new());
        if !self.config.listener.http2 {
            builder = builder.http1_only();
        }

        let tracker = ConnectionTracker::new();
        let (drain_tx, drain_rx) = watch::channel(false);
        let mut connections = JoinSet::new();

        loop {
            tokio::select! {
                accepted = listener.accept() => {
                    let (stream, peer, permit) = match accepted {
                        Ok(accepted) => accepted,
                        Err(e) => {
                            tracing::warn!(error = %e, "Accept failed");
                            continue;
                        }
                    };
                    if let Err(e) = stream.set_nodelay(true) {
                        tracing::debug!(peer_addr = %peer, error = %e, "Failed to set TCP_NODELAY");
                    }

                    let info = ConnectionInfo { peer, local: local_addr };
                    let app = self.router.clone();
                    let workers = workers.clone();
                    let service = service_fn(move |mut request: Request<Incoming>| {
                        let app = app.clone();
                        let workers = workers.clone();
                        async move {
                            let _worker = workers.acquire_owned().await.ok();
                            request.extensions_mut().insert(info);
                            app.oneshot(request.map(Body::new)).await
                        }
                    });

                    let builder = builder.clone();
                    let guard = tracker.track();
                    let mut drain = drain_rx.clone();
                    connections.spawn(async move {
                        let _permit = permit;
                        let conn = builder.serve_connection(TokioIo::new(stream), service);
                        tokio::pin!(conn);
                        let result = tokio::select! {
                            result = conn.as_mut() => result,
                            _ = drain.changed() => {
                                conn.as_mut().graceful_shutdown();
                                conn.await
                            }
                        };
                        if let Err(e) = result {
                            tracing::debug!(connection_id = %guard.id(), peer_addr = %peer, error = %e, "Connection ended with error");
                        }
                    });
                }
                Some(_) = connections.join_next(), if !connections.is_empty() => {}
                _ = shutdown.recv() => break,
            }
        }

        drop(listener);
        self.drain(connections, &tracker, &drain_tx).await;

        let closed = self.pool.close_idle();
        // Receivers resubscribed after an early trigger never see it.
        for task in background {
            task.abort();
            let _ = task.await;
        }
        tracing::info!(closed_idle = closed, "HTTP server stopped");
        Ok(())
    }

    async fn drain(
        &self,
        mut connections: JoinSet<()>,
        tracker: &ConnectionTracker,
        drain_tx: &watch::Sender<bool>,
    ) {
        let grace: Duration = self.config.shutdown.grace_period();
        tracing::info!(
            active = tracker.active_count(),
            grace_secs = grace.as_secs(),
            "Shutdown signal received, draining connections"
        );
        let _ = drain_tx.send(true);

        if tokio::time::timeout(grace, tracker.wait_idle()).await.is_err() {
            tracing::warn!(
                remaining = tracker.active_count(),
                "Grace period elapsed, aborting connections"
            );
            connections.abort_all();
        }
        while connections.join_next().await.is_some() {}
    }
}

/// Every request, whatever its path or method, goes to the proxy.
async fn proxy_handler(
    State(proxy): State<Arc<ProxyHandler>>,
    request: Request<Body>,
) -> Response<Body> {
    proxy.handle(request).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::BackendConfig;
    use crate::pool::testing::DuplexConnector;
    use axum::http::StatusCode;

    fn config() -> LbConfig {
        let mut config = LbConfig::default();
        config.backends.push(BackendConfig::new("http://127.0.0.1:8001"));
        config.health_check.enabled = false;
        config
    }

    #[tokio::test]
    async fn router_proxies_any_path_and_sets_request_id() {
        let server = HttpServer::with_connector(config(), Arc::new(DuplexConnector::default())).unwrap();
        let response = server
            .router()
            .oneshot(Request::post("/any/path?q=1").body(Body::empty()).unwrap())
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        assert!(response.headers().contains_key(X_REQUEST_ID));
        let body = axum::body::to_bytes(response.into_body(), 1024).await.unwrap();
        assert_eq!(&body[..], b"ok");
    }

    #[tokio::test]
    async fn caller_request_id_is_kept() {
        let server = HttpServer::with_connector(config(), Arc::new(DuplexConnector::default())).unwrap();
        let response = server
            .router()
            .oneshot(
                Request::get("/")
                    .header(X_REQUEST_ID, "req-42")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.headers()[X_REQUEST_ID], "req-42");
    }

    #[tokio::test]
    async fn lease_released_after_body_is_read() {
        let server = HttpServer::with_connector(config(), Arc::new(DuplexConnector::default())).unwrap();
        let backend = server.registry().list_backends().remove(0);

        let response = server
            .router()
            .oneshot(Request::get("/").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(backend.open_connections(), 1);

        axum::body::to_bytes(response.into_body(), 1024).await.unwrap();
        assert_eq!(backend.open_connections(), 0);
        assert_eq!(server.pool().idle_count(&backend), 1);
    }

    #[tokio::test]
    async fn unread_body_dropped_by_caller_invalidates_lease() {
        let server = HttpServer::with_connector(config(), Arc::new(DuplexConnector::default())).unwrap();
        let backend = server.registry().list_backends().remove(0);

        let response = server
            .router()
            .oneshot(Request::get("/").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(backend.open_connections(), 1);

        drop(response);
        assert_eq!(backend.open_connections(), 0);
        assert_eq!(backend.pooled_connections(), 0);
        assert_eq!(server.pool().idle_count(&backend), 0);
    }

    #[test]
    fn duplicate_backends_are_rejected() {
        let mut config = config();
        config.backends.push(BackendConfig::new("http://127.0.0.1:8001"));
        assert!(matches!(
            HttpServer::new(config),
            Err(ServerError::Registry(RegistryError::Duplicate(_)))
        ));
    }
}
