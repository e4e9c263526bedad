//! Load balancing subsystem.
//!
//! # Data Flow
//! ```text
//! Request received
//!     → dispatch.rs (filter healthy / not yet tried candidates)
//!     → Apply load balancing algorithm:
//!         - least_conn.rs (pick backend with fewest leased connections)
//!         - round_robin.rs (rotate through backends)
//!     → registry.rs (health transitions, add/remove)
//!     → DispatchDecision handed to the connection pool
//! ```
//!
//! # Design Decisions
//! - Algorithms are stateless over the candidate slice; backends track load
//! - Unhealthy backends excluded from selection unless failing open
//! - Connection counts only change through the pool

pub mod backend;
pub mod dispatch;
pub mod least_conn;
pub mod registry;
pub mod round_robin;

use std::sync::Arc;

use crate::config::Strategy;

pub use backend::{Backend, BackendAddrError, BackendSlot, HealthState};
pub use dispatch::{DispatchDecision, Dispatcher};
pub use registry::{BackendRegistry, NoneAvailable, RegistryError};

/// A backend selection algorithm over an already-filtered candidate list.
pub trait LoadBalancer: Send + Sync + std::fmt::Debug {
    fn next_server(&self, backends: &[Arc<Backend>]) -> Option<Arc<Backend>>;

    fn name(&self) -> &'static str;
}

pub fn create_load_balancer(strategy: Strategy) -> Box<dyn LoadBalancer> {
    match strategy {
        Strategy::LeastConnections => Box::new(least_conn::LeastConnections::new()),
        Strategy::RoundRobin => Box::new(round_robin::RoundRobin::new()),
    }
}
