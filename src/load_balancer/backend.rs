//! Backend abstraction.
//!
//! # Responsibilities
//! - Represent a single backend server
//! - Track leased connections (for Least Connections LB)
//! - Enforce max connection limits on open transports
//! - Track health state (Healthy/Unhealthy) and failure history

use std::sync::atomic::{AtomicU32, AtomicU64, AtomicU8, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use url::Url;

use crate::observability::metrics;

/// Health State enum.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HealthState {
    Healthy = 1,
    Unhealthy = 2,
}

impl From<u8> for HealthState {
    fn from(val: u8) -> Self {
        match val {
            2 => HealthState::Unhealthy,
            _ => HealthState::Healthy,
        }
    }
}

/// Why a backend address could not be used.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum BackendAddrError {
    #[error("invalid URL: {0}")]
    Parse(#[from] url::ParseError),
    #[error("unsupported scheme '{0}', only http is proxied")]
    UnsupportedScheme(String),
    #[error("URL has no host")]
    MissingHost,
}

fn parse_backend_url(address: &str) -> Result<(Url, String, u16), BackendAddrError> {
    let url = Url::parse(address)?;
    if url.scheme() != "http" {
        return Err(BackendAddrError::UnsupportedScheme(url.scheme().to_string()));
    }
    let host = url.host_str().ok_or(BackendAddrError::MissingHost)?.to_string();
    let port = url.port_or_known_default().unwrap_or(80);
    Ok((url, host, port))
}

/// The identity a backend would get: its configured name, else `host:port`.
pub fn backend_identity(name: Option<&str>, address: &str) -> Result<String, BackendAddrError> {
    let (_, host, port) = parse_backend_url(address)?;
    Ok(name.map_or_else(|| format!("{host}:{port}"), str::to_string))
}

/// A single backend server.
#[derive(Debug)]
pub struct Backend {
    /// Stable identifier used in logs and metrics.
    pub id: String,
    /// Base URL as configured.
    pub base_url: Url,
    /// Maximum concurrent connections allowed.
    pub max_connections: usize,

    host: String,
    port: u16,
    authority: String,

    /// Open transports to this backend, idle or leased.
    pooled: AtomicUsize,
    /// Transports currently leased to in-flight requests.
    leased: AtomicUsize,

    state: AtomicU8,
    consecutive_failures: AtomicU32,
    consecutive_successes: AtomicU32,
    /// Unix millis of the last recorded failure, 0 when none.
    last_failure_ms: AtomicU64,
}

impl Backend {
    /// Create a new backend from its base URL.
    pub fn new(
        address: &str,
        name: Option<&str>,
        max_connections: usize,
    ) -> Result<Self, BackendAddrError> {
        let (base_url, host, port) = parse_backend_url(address)?;
        let id = name.map_or_else(|| format!("{host}:{port}"), str::to_string);
        Ok(Self {
            id,
            base_url,
            max_connections,
            authority: format!("{host}:{port}"),
            host,
            port,
            pooled: AtomicUsize::new(0),
            leased: AtomicUsize::new(0),
            state: AtomicU8::new(HealthState::Healthy as u8),
            consecutive_failures: AtomicU32::new(0),
            consecutive_successes: AtomicU32::new(0),
            last_failure_ms: AtomicU64::new(0),
        })
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    /// `host:port`, suitable for connecting and for a `Host` header.
    pub fn authority(&self) -> &str {
        &self.authority
    }

    // --- Connection accounting ---

    /// Connections currently carrying a request; the load figure used for dispatch.
    pub fn open_connections(&self) -> usize {
        self.leased.load(Ordering::Acquire)
    }

    /// Open transports, idle ones included. Never exceeds `max_connections`.
    pub fn pooled_connections(&self) -> usize {
        self.pooled.load(Ordering::Acquire)
    }

    /// Reserve room for one more transport. Returns `None` at capacity.
    pub fn try_reserve(self: &Arc<Self>) -> Option<BackendSlot> {
        let mut prev = self.pooled.load(Ordering::Relaxed);
        loop {
            if prev >= self.max_connections {
                return None;
            }
            match self.pooled.compare_exchange_weak(
                prev,
                prev + 1,
                Ordering::AcqRel,
                Ordering::Relaxed,
            ) {
                Ok(_) => break,
                Err(x) => prev = x,
            }
        }
        Some(BackendSlot {
            backend: Arc::downgrade(self),
        })
    }

    pub(crate) fn lease_started(&self) {
        let open = self.leased.fetch_add(1, Ordering::AcqRel) + 1;
        metrics::record_open_connections(&self.id, open);
    }

    pub(crate) fn lease_ended(&self) {
        let open = self.leased.fetch_sub(1, Ordering::AcqRel) - 1;
        metrics::record_open_connections(&self.id, open);
    }

    // --- Health Logic ---

    pub fn health(&self) -> HealthState {
        HealthState::from(self.state.load(Ordering::Acquire))
    }

    pub fn is_healthy(&self) -> bool {
        self.health() == HealthState::Healthy
    }

    /// Store a new state, returning true if it changed.
    pub(crate) fn set_health(&self, state: HealthState) -> bool {
        self.state.swap(state as u8, Ordering::AcqRel) != state as u8
    }

    /// Count a failure; returns the consecutive failure count.
    pub fn record_failure(&self) -> u32 {
        self.consecutive_successes.store(0, Ordering::Relaxed);
        self.touch_last_failure();
        self.consecutive_failures.fetch_add(1, Ordering::AcqRel) + 1
    }

    pub(crate) fn touch_last_failure(&self) {
        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis() as u64)
            .unwrap_or(0);
        self.last_failure_ms.store(now.max(1), Ordering::Relaxed);
    }

    /// Count a success; returns the consecutive success count.
    pub fn record_success(&self) -> u32 {
        self.consecutive_failures.store(0, Ordering::Relaxed);
        self.consecutive_successes.fetch_add(1, Ordering::AcqRel) + 1
    }

    pub(crate) fn reset_counters(&self) {
        self.consecutive_failures.store(0, Ordering::Relaxed);
        self.consecutive_successes.store(0, Ordering::Relaxed);
    }

    pub fn consecutive_failures(&self) -> u32 {
        self.consecutive_failures.load(Ordering::Acquire)
    }

    pub fn last_failure(&self) -> Option<SystemTime> {
        match self.last_failure_ms.load(Ordering::Acquire) {
            0 => None,
            ms => Some(UNIX_EPOCH + Duration::from_millis(ms)),
        }
    }
}

/// One reserved transport slot on a backend.
///
/// Holds the backend weakly: the pool never keeps a removed backend alive.
/// Dropping the slot frees it.
#[derive(Debug)]
pub struct BackendSlot {
    backend: Weak<Backend>,
}

impl BackendSlot {
    pub fn backend(&self) -> Option<Arc<Backend>> {
        self.backend.upgrade()
    }

    #[cfg(test)]
    pub(crate) fn is_for(&self, backend: &Arc<Backend>) -> bool {
        Weak::ptr_eq(&self.backend, &Arc::downgrade(backend))
    }
}

impl Drop for BackendSlot {
    fn drop(&mut self) {
        if let Some(backend) = self.backend.upgrade() {
            backend.pooled.fetch_sub(1, Ordering::AcqRel);
        }
    }
}
