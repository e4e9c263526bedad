//! Retry logic.
//!
//! # Responsibilities
//! - Decide whether a failed connect may be retried on another backend
//!
//! # Design Decisions
//! - Only connect failures are retried: nothing reached the backend yet
//! - At most one retry per request; the failed backend is excluded
//! - Once a request was written to a backend it is never retried

use crate::config::ProxyConfig;

/// Retry budget of one request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    max_connect_retries: u32,
}

impl RetryPolicy {
    pub fn new(max_connect_retries: u32) -> Self {
        Self {
            max_connect_retries,
        }
    }

    pub fn from_config(config: &ProxyConfig) -> Self {
        Self::new(u32::from(config.retry_on_connect_failure))
    }

    /// `failures` is the number of connect failures seen so far.
    pub fn should_retry_connect(&self, failures: u32) -> bool {
        failures <= self.max_connect_retries
    }
}
