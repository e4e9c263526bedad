//! Timeout enforcement.
//!
//! # Responsibilities
//! - Fix one deadline per request: start + `max_request_time`
//! - Bound every await on the request path by that deadline
//!
//! # Design Decisions
//! - Uses Tokio's timer facilities (`timeout_at`, `sleep_until`)
//! - The deadline covers the response body, not just the head
//! - Timed-out requests return 504 Gateway Timeout

use std::future::Future;
use std::time::Duration;

use tokio::time::{error::Elapsed, Instant, Sleep};

/// Absolute deadline of one request.
#[derive(Debug, Clone, Copy)]
pub struct Deadline {
    started: Instant,
    at: Instant,
    budget: Duration,
}

impl Deadline {
    pub fn after(budget: Duration) -> Self {
        let started = Instant::now();
        Self {
            started,
            at: started + budget,
            budget,
        }
    }

    pub fn at(&self) -> Instant {
        self.at
    }

    pub fn budget(&self) -> Duration {
        self.budget
    }

    pub fn elapsed(&self) -> Duration {
        self.started.elapsed()
    }

    pub fn remaining(&self) -> Duration {
        self.at.saturating_duration_since(Instant::now())
    }

    pub fn is_expired(&self) -> bool {
        Instant::now() >= self.at
    }

    /// The earlier of this deadline and `now + limit`.
    pub fn capped(&self, limit: Duration) -> Instant {
        self.at.min(Instant::now() + limit)
    }

    pub async fn run<F: Future>(&self, future: F) -> Result<F::Output, Elapsed> {
        tokio::time::timeout_at(self.at, future).await
    }

    pub fn sleep(&self) -> Sleep {
        tokio::time::sleep_until(self.at)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn run_times_out_at_deadline() {
        let deadline = Deadline::after(Duration::from_millis(20));
        let result = deadline
            .run(tokio::time::sleep(Duration::from_secs(5)))
            .await;
        assert!(result.is_err());
        assert!(deadline.is_expired());
        assert_eq!(deadline.remaining(), Duration::ZERO);
    }

    #[tokio::test]
    async fn capped_never_extends_the_deadline() {
        let deadline = Deadline::after(Duration::from_millis(50));
        assert!(deadline.capped(Duration::from_secs(10)) <= deadline.at());
        assert!(deadline.capped(Duration::from_millis(1)) < deadline.at());
    }
}
