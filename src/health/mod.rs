//! Health checking subsystem.
//!
//! # Data Flow
//! ```text
//! Active health checks (active.rs):
//!     Periodic timer
//!     → Probe each backend
//!     → registry: mark_healthy after healthy_threshold successes
//!     → registry: record_connect_failure on a failed probe
//!
//! Passive signal (proxy handler):
//!     Connect failure observed
//!     → registry: record_connect_failure
//!     → Unhealthy once failure_threshold is reached
//! ```
//!
//! # Design Decisions
//! - Active and passive signals share one failure streak per backend
//! - Recovery is explicit: a probe streak or `mark_healthy`
//! - Health state is per-backend, not per-pool

pub mod active;

pub use active::{HealthMonitor, ProbeOutcome};
