//! Least Connections load balancing strategy.

use std::sync::Arc;

use crate::load_balancer::{backend::Backend, LoadBalancer};

/// Least connections selector.
/// Selects the backend with the minimum number of leased connections.
#[derive(Debug, Default)]
pub struct LeastConnections;

impl LeastConnections {
    pub fn new() -> Self {
        Self
    }
}

impl LoadBalancer for LeastConnections {
    fn next_server(&self, backends: &[Arc<Backend>]) -> Option<Arc<Backend>> {
        // min_by_key keeps the first of equal minima: ties go to the
        // earliest registered backend.
        backends
            .iter()
            .min_by_key(|b| b.open_connections())
            .cloned()
    }

    fn name(&self) -> &'static str {
        "least_connections"
    }
}
