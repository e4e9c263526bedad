//! Resilience subsystem.
//!
//! # Data Flow
//! ```text
//! Request to backend:
//!     → timeouts.rs (one deadline from request start to body end)
//!     → On connect failure: retries.rs (one retry on another backend)
//! ```
//!
//! # Design Decisions
//! - Timeouts are non-negotiable; every external call has a deadline
//! - Retries only before anything was written to a backend
//! - Repeated connect failures feed backend health, not a separate breaker

pub mod retries;
pub mod timeouts;

pub use retries::RetryPolicy;
pub use timeouts::Deadline;
