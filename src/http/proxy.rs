//! The proxy handler: one inbound request, one backend exchange.
//!
//! # Request states
//! ```text
//! Received → Dispatched → Forwarding → Responding → Completed
//!     └──────────┴────────────┴────────────┴──────→ Failed
//! ```
//! - Dispatched: a backend was chosen (re-entered on reselection)
//! - Forwarding: a lease is held and the request head is being written
//! - Responding: the backend's head came back; its body streams through
//!   [`LeasedBody`], which holds the lease until the last frame
//! - Completed: lease released, success recorded
//! - Failed: the lease (if any) is invalidated and an error returned
//!
//! # Retries
//! A connect failure is retried once on another backend; a backend at
//! capacity triggers reselection. Nothing is retried once the request
//! went out on a connection.

use std::fmt;
use std::future::Future;
use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::{Duration, Instant};

use axum::body::{Body, Bytes};
use axum::http::{header, HeaderValue, Method, Request, Response, Uri, Version};
use axum::BoxError;
use hyper::body::{Body as HttpBody, Frame, Incoming, SizeHint};
use tokio::time::Sleep;

use crate::config::{ExhaustedPolicy, LbConfig};
use crate::http::error::ProxyError;
use crate::http::headers::{apply_forwarded, apply_host, strip_hop_by_hop, ForwardedInfo};
use crate::load_balancer::{Backend, BackendRegistry, DispatchDecision, Dispatcher};
use crate::observability::metrics;
use crate::pool::{ConnectionPool, Lease, PoolError, Protocol};
use crate::resilience::{Deadline, RetryPolicy};

pub const X_REQUEST_ID: &str = "x-request-id";

/// Reused idle connections found closed before anything was written.
const MAX_STALE_CONNECTIONS: u32 = 3;

/// Addresses of the inbound connection, attached to every request by the server.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConnectionInfo {
    pub peer: SocketAddr,
    pub local: SocketAddr,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestState {
    Received,
    Dispatched,
    Forwarding,
    Responding,
    Completed,
    Failed,
}

impl fmt::Display for RequestState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            RequestState::Received => "received",
            RequestState::Dispatched => "dispatched",
            RequestState::Forwarding => "forwarding",
            RequestState::Responding => "responding",
            RequestState::Completed => "completed",
            RequestState::Failed => "failed",
        };
        f.write_str(name)
    }
}

/// Progress of one request through the handler.
#[derive(Debug)]
struct RequestCycle {
    request_id: String,
    method: Method,
    state: RequestState,
    backend: Option<String>,
    started: Instant,
}

impl RequestCycle {
    fn new<B>(request: &Request<B>) -> Self {
        let request_id = request
            .headers()
            .get(X_REQUEST_ID)
            .and_then(|v| v.to_str().ok())
            .unwrap_or("unknown")
            .to_string();
        tracing::debug!(
            request_id = %request_id,
            method = %request.method(),
            uri = %request.uri(),
            "Request received"
        );
        Self {
            request_id,
            method: request.method().clone(),
            state: RequestState::Received,
            backend: None,
            started: Instant::now(),
        }
    }

    fn advance(&mut self, next: RequestState) {
        tracing::debug!(
            request_id = %self.request_id,
            backend = self.backend.as_deref().unwrap_or("-"),
            from = %self.state,
            to = %next,
            "Request state changed"
        );
        self.state = next;
    }

    fn fail(&mut self, err: &ProxyError) {
        self.advance(RequestState::Failed);
        let status = err.status();
        tracing::warn!(
            request_id = %self.request_id,
            backend = self.backend.as_deref().unwrap_or("-"),
            kind = err.kind(),
            status = status.as_u16(),
            error = %err,
            "Request failed"
        );
        metrics::record_request(
            self.method.as_str(),
            status.as_u16(),
            self.backend.as_deref().unwrap_or("none"),
            self.started,
        );
    }
}

/// Forwards requests to the least-loaded backend over pooled connections.
#[derive(Debug)]
pub struct ProxyHandler {
    dispatcher: Dispatcher,
    pool: Arc<ConnectionPool>,
    retry: RetryPolicy,
    max_request_time: Duration,
    pool_wait_timeout: Duration,
    exhausted_policy: ExhaustedPolicy,
    reuse_x_forwarded: bool,
    rewrite_host_header: bool,
}

impl ProxyHandler {
    pub fn new(config: &LbConfig, registry: Arc<BackendRegistry>, pool: Arc<ConnectionPool>) -> Self {
        let proxy = &config.proxy;
        Self {
            dispatcher: Dispatcher::new(registry, proxy.strategy, proxy.unavailable_policy),
            pool,
            retry: RetryPolicy::from_config(proxy),
            max_request_time: proxy.max_request_time(),
            pool_wait_timeout: proxy.pool_wait_timeout(),
            exhausted_policy: proxy.exhausted_policy,
            reuse_x_forwarded: proxy.reuse_x_forwarded,
            rewrite_host_header: proxy.rewrite_host_header,
        }
    }

    pub fn registry(&self) -> &Arc<BackendRegistry> {
        self.dispatcher.registry()
    }

    pub fn pool(&self) -> &Arc<ConnectionPool> {
        &self.pool
    }

    /// Proxy one request. Failures become plain-text error responses.
    pub async fn handle(&self, request: Request<Body>) -> Response<Body> {
        let deadline = Deadline::after(self.max_request_time);
        let mut cycle = RequestCycle::new(&request);

        match self.forward(request, deadline, &mut cycle).await {
            Ok(response) => response,
            Err(err) => {
                cycle.fail(&err);
                err.to_response(&cycle.request_id)
            }
        }
    }

    async fn forward(
        &self,
        request: Request<Body>,
        deadline: Deadline,
        cycle: &mut RequestCycle,
    ) -> Result<Response<Body>, ProxyError> {
        let (parts, body) = request.into_parts();
        let head = Request::from_parts(parts, ());

        let mut lease = match deadline.run(self.lease_for(&head, &deadline, cycle)).await {
            Ok(lease) => lease?,
            Err(_) => return Err(ProxyError::Timeout(deadline.budget())),
        };
        cycle.backend = Some(lease.backend().id.clone());
        cycle.advance(RequestState::Forwarding);

        let (parts, ()) = head.into_parts();
        let outbound = match self.prepare(Request::from_parts(parts, body), lease.backend(), lease.protocol()) {
            Ok(outbound) => outbound,
            Err(err) => {
                lease.release();
                return Err(err);
            }
        };
        let response = match deadline.run(lease.send_request(outbound)).await {
            Ok(Ok(response)) => response,
            Ok(Err(source)) => {
                let backend = lease.backend().id.clone();
                lease.invalidate();
                return Err(ProxyError::UpstreamProtocolError { backend, source });
            }
            Err(_) => {
                lease.invalidate();
                return Err(ProxyError::Timeout(deadline.budget()));
            }
        };
        cycle.advance(RequestState::Responding);

        let (mut parts, body) = response.into_parts();
        strip_hop_by_hop(&mut parts.headers);
        let completion = Completion {
            registry: self.registry().clone(),
            request_id: cycle.request_id.clone(),
            method: cycle.method.clone(),
            status: parts.status.as_u16(),
            started: cycle.started,
        };
        let body = LeasedBody::new(body, lease, &deadline, completion);
        Ok(Response::from_parts(parts, Body::new(body)))
    }

    /// Choose a backend and lease a connection to it.
    async fn lease_for(
        &self,
        request: &Request<()>,
        deadline: &Deadline,
        cycle: &mut RequestCycle,
    ) -> Result<Lease, ProxyError> {
        let mut tried: Vec<Arc<Backend>> = Vec::new();
        let mut busy: Vec<Arc<Backend>> = Vec::new();
        let mut last_error: Option<ProxyError> = None;
        let mut connect_failures = 0;
        let mut stale = 0;

        loop {
            let backend = match self.dispatcher.select_excluding(request, &tried) {
                DispatchDecision::Backend { backend, .. } => backend,
                DispatchDecision::Unavailable => break,
            };
            cycle.backend = Some(backend.id.clone());
            cycle.advance(RequestState::Dispatched);

            match self.pool.acquire(&backend).await {
                Ok(mut lease) => match lease.ready().await {
                    Ok(()) => return Ok(lease),
                    Err(source) => {
                        lease.invalidate();
                        stale += 1;
                        if stale >= MAX_STALE_CONNECTIONS {
                            return Err(ProxyError::UpstreamProtocolError {
                                backend: backend.id.clone(),
                                source,
                            });
                        }
                    }
                },
                Err(PoolError::Busy { .. }) => {
                    busy.push(backend.clone());
                    last_error.get_or_insert(ProxyError::PoolExhausted);
                    tried.push(backend);
                }
                Err(PoolError::ConnectFailed { backend: id, source }) => {
                    self.registry()
                        .record_connect_failure(&backend, &source.to_string());
                    connect_failures += 1;
                    let err = ProxyError::ConnectFailed { backend: id, source };
                    if !self.retry.should_retry_connect(connect_failures) {
                        return Err(err);
                    }
                    tracing::debug!(request_id = %cycle.request_id, error = %err, "Retrying on another backend");
                    last_error = Some(err);
                    tried.push(backend);
                }
                Err(PoolError::NoBackends) => break,
            }
        }

        // Every busy backend is a candidate; the first to free a slot wins.
        if matches!(self.exhausted_policy, ExhaustedPolicy::Wait) && !busy.is_empty() {
            let until = deadline.capped(self.pool_wait_timeout);
            return match self.pool.acquire_wait_any(&busy, until).await {
                Ok(lease) => {
                    cycle.backend = Some(lease.backend().id.clone());
                    Ok(lease)
                }
                Err(PoolError::Busy { .. }) if deadline.is_expired() => {
                    Err(ProxyError::Timeout(deadline.budget()))
                }
                Err(PoolError::Busy { .. }) => Err(ProxyError::PoolExhausted),
                Err(PoolError::ConnectFailed { backend: id, source }) => {
                    if let Some(backend) = busy.iter().find(|b| b.id == id) {
                        self.registry()
                            .record_connect_failure(backend, &source.to_string());
                    }
                    Err(ProxyError::ConnectFailed { backend: id, source })
                }
                Err(PoolError::NoBackends) => Err(ProxyError::Unavailable),
            };
        }

        Err(last_error.unwrap_or(ProxyError::Unavailable))
    }

    /// Rewrite the inbound request for the chosen backend.
    fn prepare(
        &self,
        request: Request<Body>,
        backend: &Backend,
        protocol: Protocol,
    ) -> Result<Request<Body>, ProxyError> {
        let (mut parts, body) = request.into_parts();
        let inbound_authority = parts.uri.authority().map(|a| a.as_str().to_owned());
        let path_and_query = parts
            .uri
            .path_and_query()
            .map(|pq| pq.as_str())
            .unwrap_or("/");

        let uri = match protocol {
            Protocol::Http1 => Uri::try_from(path_and_query),
            Protocol::Http2 => Uri::try_from(format!("http://{}{}", backend.authority(), path_and_query)),
        };
        parts.uri = uri.map_err(|e| ProxyError::InvalidRequest(e.to_string()))?;
        parts.version = match protocol {
            Protocol::Http1 => Version::HTTP_11,
            Protocol::Http2 => Version::HTTP_2,
        };

        let requested_host = parts.headers.get(header::HOST).cloned().or_else(|| {
            inbound_authority
                .as_deref()
                .and_then(|a| HeaderValue::from_str(a).ok())
        });
        strip_hop_by_hop(&mut parts.headers);

        if let Some(conn) = parts.extensions.get::<ConnectionInfo>().copied() {
            let info = ForwardedInfo {
                peer: conn.peer,
                local: conn.local,
                proto: "http",
                host: requested_host,
            };
            apply_forwarded(&mut parts.headers, &info, self.reuse_x_forwarded);
        }
        apply_host(
            &mut parts.headers,
            inbound_authority.as_deref(),
            backend.authority(),
            self.rewrite_host_header,
        );

        Ok(Request::from_parts(parts, body))
    }
}

/// Response body timed out after the head was sent.
#[derive(Debug, thiserror::Error)]
#[error("response body not finished within {0:?}")]
pub struct BodyTimeout(pub Duration);

struct Completion {
    registry: Arc<BackendRegistry>,
    request_id: String,
    method: Method,
    status: u16,
    started: Instant,
}

/// Streams a backend response body while holding its lease.
///
/// The lease is released at end of stream and invalidated on a body error,
/// on the request deadline, or when the body is dropped unfinished.
pub struct LeasedBody {
    inner: Incoming,
    lease: Option<Lease>,
    deadline: Pin<Box<Sleep>>,
    budget: Duration,
    completion: Completion,
}

impl LeasedBody {
    fn new(inner: Incoming, lease: Lease, deadline: &Deadline, completion: Completion) -> Self {
        let mut body = Self {
            inner,
            lease: Some(lease),
            deadline: Box::pin(deadline.sleep()),
            budget: deadline.budget(),
            completion,
        };
        if body.inner.is_end_stream() {
            body.complete();
        }
        body
    }

    fn complete(&mut self) {
        let Some(lease) = self.lease.take() else {
            return;
        };
        let backend = lease.backend().clone();
        lease.release();

        let c = &self.completion;
        c.registry.record_success(&backend);
        metrics::record_request(c.method.as_str(), c.status, &backend.id, c.started);
        tracing::debug!(
            request_id = %c.request_id,
            backend = %backend.id,
            status = c.status,
            elapsed_ms = c.started.elapsed().as_millis() as u64,
            from = %RequestState::Responding,
            to = %RequestState::Completed,
            "Request state changed"
        );
    }

    fn abort(&mut self, reason: &str) {
        let Some(lease) = self.lease.take() else {
            return;
        };
        let backend = lease.backend().id.clone();
        lease.invalidate();

        let c = &self.completion;
        metrics::record_request(c.method.as_str(), c.status, &backend, c.started);
        tracing::warn!(
            request_id = %c.request_id,
            backend = %backend,
            reason,
            from = %RequestState::Responding,
            to = %RequestState::Failed,
            "Request state changed"
        );
    }
}

impl fmt::Debug for LeasedBody {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LeasedBody")
            .field("request_id", &self.completion.request_id)
            .field("leased", &self.lease.is_some())
            .finish()
    }
}

impl HttpBody for LeasedBody {
    type Data = Bytes;
    type Error = BoxError;

    fn poll_frame(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
    ) -> Poll<Option<Result<Frame<Self::Data>, Self::Error>>> {
        let this = self.get_mut();
        if this.lease.is_none() {
            return Poll::Ready(None);
        }
        if this.deadline.as_mut().poll(cx).is_ready() {
            this.abort("request deadline exceeded while streaming");
            return Poll::Ready(Some(Err(BodyTimeout(this.budget).into())));
        }

        match Pin::new(&mut this.inner).poll_frame(cx) {
            Poll::Ready(Some(Ok(frame))) => {
                if this.inner.is_end_stream() {
                    this.complete();
                }
                Poll::Ready(Some(Ok(frame)))
            }
            Poll::Ready(Some(Err(err))) => {
                this.abort("backend body error");
                Poll::Ready(Some(Err(err.into())))
            }
            Poll::Ready(None) => {
                this.complete();
                Poll::Ready(None)
            }
            Poll::Pending => Poll::Pending,
        }
    }

    fn is_end_stream(&self) -> bool {
        self.lease.is_none() || self.inner.is_end_stream()
    }

    fn size_hint(&self) -> SizeHint {
        self.inner.size_hint()
    }
}

impl Drop for LeasedBody {
    fn drop(&mut self) {
        if self.lease.is_none() {
            return;
        }
        if self.inner.is_end_stream() {
            self.complete();
        } else {
            self.abort("response body dropped before completion");
        }
    }
}
