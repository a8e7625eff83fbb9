use std::time::Duration;

/// Bounded linear-backoff retry schedule.
///
/// Every retry loop in the crate is an explicit bounded iteration with the
/// decision at the top; this type only answers "how many attempts" and
/// "how long to sleep after attempt N".
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    max_attempts: u32,
    base_delay: Duration,
}

impl RetryPolicy {
    pub const fn new(max_attempts: u32, base_delay: Duration) -> Self {
        Self {
            max_attempts,
            base_delay,
        }
    }

    pub const fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    /// Delay to apply after a failed attempt (1-based): base × attempt.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        self.base_delay.saturating_mul(attempt)
    }

    pub fn is_last(&self, attempt: u32) -> bool {
        attempt >= self.max_attempts
    }

    /// Sleep out the backoff for `attempt`, unless it was the last one.
    pub async fn pause_after(&self, attempt: u32) {
        if !self.is_last(attempt) {
            tokio::time::sleep(self.delay_for(attempt)).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_linear_schedule() {
        let policy = RetryPolicy::new(3, Duration::from_millis(100));
        assert_eq!(policy.delay_for(1), Duration::from_millis(100));
        assert_eq!(policy.delay_for(2), Duration::from_millis(200));
        assert_eq!(policy.delay_for(3), Duration::from_millis(300));
    }

    #[test]
    fn test_last_attempt_detection() {
        let policy = RetryPolicy::new(3, Duration::from_millis(100));
        assert!(!policy.is_last(1));
        assert!(!policy.is_last(2));
        assert!(policy.is_last(3));
        assert!(policy.is_last(4));
    }
}
