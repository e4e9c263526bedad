//! Dispatch policy: which backend serves a request.
//!
//! # Responsibilities
//! - Filter the registry snapshot to eligible candidates
//! - Apply the configured strategy (least connections by default)
//! - Make the all-unhealthy case an explicit fail-open/fail-closed decision

use std::fmt;
use std::sync::Arc;

use axum::http::Request;

use crate::config::{Strategy, UnavailablePolicy};
use crate::load_balancer::backend::Backend;
use crate::load_balancer::registry::BackendRegistry;
use crate::load_balancer::{create_load_balancer, LoadBalancer};

/// Outcome of backend selection.
#[derive(Debug, Clone)]
pub enum DispatchDecision {
    /// Forward to this backend. `fail_open` is set when the backend is
    /// unhealthy and was chosen only because every backend is.
    Backend {
        backend: Arc<Backend>,
        fail_open: bool,
    },
    /// Nothing to forward to.
    Unavailable,
}

impl DispatchDecision {
    pub fn backend(&self) -> Option<&Arc<Backend>> {
        match self {
            DispatchDecision::Backend { backend, .. } => Some(backend),
            DispatchDecision::Unavailable => None,
        }
    }
}

/// Selects a backend for each request.
pub struct Dispatcher {
    registry: Arc<BackendRegistry>,
    balancer: Box<dyn LoadBalancer>,
    unavailable_policy: UnavailablePolicy,
}

impl fmt::Debug for Dispatcher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Dispatcher")
            .field("strategy", &self.balancer.name())
            .field("unavailable_policy", &self.unavailable_policy)
            .finish()
    }
}

impl Dispatcher {
    pub fn new(
        registry: Arc<BackendRegistry>,
        strategy: Strategy,
        unavailable_policy: UnavailablePolicy,
    ) -> Self {
        Self {
            registry,
            balancer: create_load_balancer(strategy),
            unavailable_policy,
        }
    }

    pub fn registry(&self) -> &Arc<BackendRegistry> {
        &self.registry
    }

    pub fn select<B>(&self, request: &Request<B>) -> DispatchDecision {
        self.select_excluding(request, &[])
    }

    /// Select among backends not in `exclude` (already tried for this request).
    pub fn select_excluding<B>(
        &self,
        request: &Request<B>,
        exclude: &[Arc<Backend>],
    ) -> DispatchDecision {
        let snapshot = self.registry.snapshot();
        let eligible = |b: &&Arc<Backend>| !exclude.iter().any(|e| Arc::ptr_eq(e, b));

        let healthy: Vec<_> = snapshot
            .iter()
            .filter(|b| b.is_healthy())
            .filter(eligible)
            .cloned()
            .collect();
        if let Some(backend) = self.balancer.next_server(&healthy) {
            return DispatchDecision::Backend {
                backend,
                fail_open: false,
            };
        }

        // Healthy backends exist but were all tried already.
        if snapshot.iter().any(|b| b.is_healthy()) {
            return DispatchDecision::Unavailable;
        }

        match self.unavailable_policy {
            UnavailablePolicy::FailClosed => DispatchDecision::Unavailable,
            UnavailablePolicy::FailOpen => {
                let candidates: Vec<_> = snapshot.iter().filter(eligible).cloned().collect();
                match self.balancer.next_server(&candidates) {
                    Some(backend) => {
                        tracing::warn!(
                            backend = %backend.id,
                            method = %request.method(),
                            uri = %request.uri(),
                            "No healthy backend, failing open"
                        );
                        DispatchDecision::Backend {
                            backend,
                            fail_open: true,
                        }
                    }
                    None => DispatchDecision::Unavailable,
                }
            }
        }
    }
}
