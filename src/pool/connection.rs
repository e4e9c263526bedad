//! Pooled connections and leases.
//!
//! # Ownership
//! ```text
//! idle:   HostPool ──owns──▶ PooledConnection
//! leased: Lease    ──owns──▶ PooledConnection
//!         release()    → back to the idle set (if still usable)
//!         invalidate() → transport closed, slot freed
//!         drop         → same as invalidate()
//! ```
//!
//! A `PooledConnection` refers to its backend only weakly (through its
//! `BackendSlot`); dropping it aborts the driver task and frees the slot.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError, Weak};
use std::time::Duration;

use axum::body::Body;
use axum::http::{Request, Response};
use hyper::body::Incoming;
use hyper::client::conn::{http1, http2};
use tokio::sync::Notify;
use tokio::task::AbortHandle;
use tokio::time::Instant;

use crate::load_balancer::{Backend, BackendSlot};
use crate::observability::metrics;
use crate::pool::connector::Upstream;

static CONNECTION_IDS: AtomicU64 = AtomicU64::new(1);

/// Wire protocol spoken on an upstream connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Protocol {
    Http1,
    Http2,
}

/// The request half of a client connection.
#[derive(Debug)]
pub enum UpstreamSender {
    Http1(http1::SendRequest<Body>),
    Http2(http2::SendRequest<Body>),
}

impl UpstreamSender {
    pub fn protocol(&self) -> Protocol {
        match self {
            UpstreamSender::Http1(_) => Protocol::Http1,
            UpstreamSender::Http2(_) => Protocol::Http2,
        }
    }

    pub fn is_closed(&self) -> bool {
        match self {
            UpstreamSender::Http1(s) => s.is_closed(),
            UpstreamSender::Http2(s) => s.is_closed(),
        }
    }

    /// Wait until the connection can take another request.
    pub async fn ready(&mut self) -> Result<(), hyper::Error> {
        match self {
            UpstreamSender::Http1(s) => s.ready().await,
            UpstreamSender::Http2(s) => s.ready().await,
        }
    }

    pub async fn send(&mut self, request: Request<Body>) -> Result<Response<Incoming>, hyper::Error> {
        match self {
            UpstreamSender::Http1(s) => s.send_request(request).await,
            UpstreamSender::Http2(s) => s.send_request(request).await,
        }
    }
}

/// An open transport to a backend.
#[derive(Debug)]
pub struct PooledConnection {
    id: u64,
    sender: UpstreamSender,
    driver: AbortHandle,
    slot: BackendSlot,
    last_used: Instant,
    valid: bool,
}

impl PooledConnection {
    pub(crate) fn new(upstream: Upstream, slot: BackendSlot) -> Self {
        Self {
            id: CONNECTION_IDS.fetch_add(1, Ordering::Relaxed),
            sender: upstream.sender,
            driver: upstream.driver.abort_handle(),
            slot,
            last_used: Instant::now(),
            valid: true,
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn backend(&self) -> Option<Arc<Backend>> {
        self.slot.backend()
    }

    pub fn last_used(&self) -> Instant {
        self.last_used
    }

    /// False once an I/O error was seen or the transport went away.
    pub fn is_valid(&self) -> bool {
        self.valid && !self.driver.is_finished() && !self.sender.is_closed()
    }

    fn idle_expired(&self, now: Instant, idle_timeout: Duration) -> bool {
        now.saturating_duration_since(self.last_used) >= idle_timeout
    }
}

impl Drop for PooledConnection {
    fn drop(&mut self) {
        self.driver.abort();
        tracing::trace!(connection = self.id, "Backend connection closed");
    }
}

/// Idle connections and capacity notifications for one backend.
#[derive(Debug)]
pub(crate) struct HostPool {
    backend: Weak<Backend>,
    idle: Mutex<Vec<PooledConnection>>,
    /// Signalled whenever a connection returns or a slot frees up.
    capacity: Notify,
    /// Set once the backend is removed; returned connections are closed.
    retired: AtomicBool,
}

impl HostPool {
    pub(crate) fn new(backend: &Arc<Backend>) -> Self {
        Self {
            backend: Arc::downgrade(backend),
            idle: Mutex::new(Vec::new()),
            capacity: Notify::new(),
            retired: AtomicBool::new(false),
        }
    }

    pub(crate) fn is_for(&self, backend: &Arc<Backend>) -> bool {
        Weak::ptr_eq(&self.backend, &Arc::downgrade(backend))
    }

    pub(crate) fn capacity(&self) -> &Notify {
        &self.capacity
    }

    /// Most recently used connection that is still usable.
    pub(crate) fn pop_idle(&self, idle_timeout: Duration) -> Option<PooledConnection> {
        let now = Instant::now();
        let mut stale = Vec::new();
        let found = {
            let mut idle = self.idle.lock().unwrap_or_else(PoisonError::into_inner);
            loop {
                match idle.pop() {
                    Some(conn) if conn.is_valid() && !conn.idle_expired(now, idle_timeout) => {
                        break Some(conn)
                    }
                    Some(conn) => stale.push(conn),
                    None => break None,
                }
            }
        };
        if !stale.is_empty() {
            drop(stale);
            self.capacity.notify_one();
        }
        found
    }

    fn put_back(&self, mut conn: PooledConnection) {
        conn.last_used = Instant::now();
        let mut idle = self.idle.lock().unwrap_or_else(PoisonError::into_inner);
        if self.retired.load(Ordering::Acquire) {
            drop(idle);
            drop(conn);
            return;
        }
        idle.push(conn);
    }

    /// Close the idle set and refuse connections returned later.
    pub(crate) fn retire(&self) -> usize {
        self.retired.store(true, Ordering::Release);
        let closed = self.drain_all().len();
        self.capacity.notify_waiters();
        closed
    }

    /// Remove idle connections that expired or broke.
    pub(crate) fn drain_expired(&self, idle_timeout: Duration) -> Vec<PooledConnection> {
        let now = Instant::now();
        let mut idle = self.idle.lock().unwrap_or_else(PoisonError::into_inner);
        let (keep, expired): (Vec<_>, Vec<_>) = idle
            .drain(..)
            .partition(|c| c.is_valid() && !c.idle_expired(now, idle_timeout));
        *idle = keep;
        expired
    }

    pub(crate) fn drain_all(&self) -> Vec<PooledConnection> {
        std::mem::take(&mut *self.idle.lock().unwrap_or_else(PoisonError::into_inner))
    }

    pub(crate) fn idle_len(&self) -> usize {
        self.idle.lock().unwrap_or_else(PoisonError::into_inner).len()
    }
}

/// Bookkeeping for one lease: the leased count and waking waiters.
#[derive(Debug)]
struct LeaseGuard {
    backend: Arc<Backend>,
    host: Arc<HostPool>,
    connection: u64,
    released: bool,
}

impl Drop for LeaseGuard {
    fn drop(&mut self) {
        self.backend.lease_ended();
        if !self.released {
            metrics::record_invalidated(&self.backend.id);
            tracing::debug!(
                backend = %self.backend.id,
                connection = self.connection,
                "Backend connection invalidated"
            );
        }
        self.host.capacity.notify_one();
    }
}

/// A connection on loan to one in-flight request.
///
/// Dropping a lease without calling [`Lease::release`] invalidates it: the
/// transport is closed and never returns to the idle set.
#[derive(Debug)]
pub struct Lease {
    conn: PooledConnection,
    guard: LeaseGuard,
}

impl Lease {
    pub(crate) fn new(conn: PooledConnection, backend: Arc<Backend>, host: Arc<HostPool>) -> Self {
        backend.lease_started();
        let connection = conn.id;
        Self {
            conn,
            guard: LeaseGuard {
                backend,
                host,
                connection,
                released: false,
            },
        }
    }

    pub fn backend(&self) -> &Arc<Backend> {
        &self.guard.backend
    }

    pub fn connection_id(&self) -> u64 {
        self.conn.id
    }

    pub fn protocol(&self) -> Protocol {
        self.conn.sender.protocol()
    }

    pub fn is_valid(&self) -> bool {
        self.conn.is_valid()
    }

    /// Wait for the connection to accept a request. Nothing has been
    /// written when this fails, so the request can go elsewhere.
    pub async fn ready(&mut self) -> Result<(), hyper::Error> {
        let result = self.conn.sender.ready().await;
        if result.is_err() {
            self.conn.valid = false;
        }
        result
    }

    /// Forward a request. Any error poisons the connection.
    pub async fn send_request(
        &mut self,
        request: Request<Body>,
    ) -> Result<Response<Incoming>, hyper::Error> {
        self.ready().await?;
        let result = self.conn.sender.send(request).await;
        if result.is_err() {
            self.conn.valid = false;
        }
        result
    }

    /// Return the connection to the idle set, or discard it if it broke.
    pub fn release(self) {
        let Lease { conn, mut guard } = self;
        if conn.is_valid() {
            guard.released = true;
            guard.host.put_back(conn);
        } else {
            drop(conn);
        }
        drop(guard);
    }

    /// Close the transport; it is never handed out again.
    pub fn invalidate(self) {
        drop(self);
    }
}
