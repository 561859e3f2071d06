use std::time::Duration;

use tokio::time::Instant;

/// Failures a worker may accumulate inside one window before it is
/// considered stuck in a tight failure loop.
pub const DEFAULT_FAILURE_LIMIT: u32 = 16;

/// Detects a worker failing faster than its own schedule allows.
///
/// A worker that fails once per cycle never trips the budget; only bursts
/// of more than `limit` failures inside a single `window` do.
#[derive(Debug)]
pub struct FailureBudget {
    window: Duration,
    limit: u32,
    window_start: Instant,
    failures: u32,
}

impl FailureBudget {
    pub fn new(window: Duration, limit: u32) -> Self {
        Self {
            window,
            limit,
            window_start: Instant::now(),
            failures: 0,
        }
    }

    /// Record a failure. Returns true once the budget is exhausted.
    pub fn record_failure(&mut self) -> bool {
        let now = Instant::now();
        if now.duration_since(self.window_start) > self.window {
            self.window_start = now;
            self.failures = 0;
        }
        self.failures += 1;
        self.failures > self.limit
    }

    pub fn record_success(&mut self) {
        self.failures = 0;
        self.window_start = Instant::now();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn test_burst_exhausts_budget() {
        let mut budget = FailureBudget::new(Duration::from_secs(1), 3);
        assert!(!budget.record_failure());
        assert!(!budget.record_failure());
        assert!(!budget.record_failure());
        assert!(budget.record_failure());
    }

    #[tokio::test(start_paused = true)]
    async fn test_paced_failures_never_exhaust() {
        let mut budget = FailureBudget::new(Duration::from_secs(1), 3);
        for _ in 0..20 {
            assert!(!budget.record_failure());
            tokio::time::advance(Duration::from_millis(600)).await;
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_success_resets() {
        let mut budget = FailureBudget::new(Duration::from_secs(1), 2);
        budget.record_failure();
        budget.record_failure();
        budget.record_success();
        assert!(!budget.record_failure());
        assert!(!budget.record_failure());
        assert!(budget.record_failure());
    }
}
