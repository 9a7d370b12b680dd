use std::time::Duration;

use rand::TryRngCore;
use rand::rngs::OsRng;

/// Exponential backoff with jitter.
/// Based on https://www.awsarchitectureblog.com/2015/03/backoff.html.
pub(crate) struct RetryBackoff {
    attempt: u32,
    base_ms: u64,
    cap_ms: u64,
}

impl RetryBackoff {
    pub(crate) fn new(cap: Duration) -> Self {
        Self {
            attempt: 0,
            base_ms: 100,
            cap_ms: cap.as_millis() as u64,
        }
    }

    fn max_wait_ms(&self) -> u64 {
        let shift = self.attempt.min(63);
        self.cap_ms.min(self.base_ms.saturating_mul(1u64 << shift))
    }

    pub(crate) fn next_delay(&mut self) -> Duration {
        let max_wait = self.max_wait_ms();
        let wait_ms = if max_wait > 0 {
            OsRng.try_next_u64().unwrap_or(0) % max_wait
        } else {
            0
        };
        self.attempt = self.attempt.saturating_add(1);
        Duration::from_millis(wait_ms)
    }

    pub(crate) async fn wait(&mut self) {
        tokio::time::sleep(self.next_delay()).await;
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_retry_backoff_max_wait_calculation() {
        let mut backoff = RetryBackoff::new(Duration::from_secs(10));

        // base_ms = 100, cap_ms = 10000
        // attempt 0: min(10000, 100 * 2^0) = 100
        // attempt 1: min(10000, 100 * 2^1) = 200
        // attempt 7: min(10000, 100 * 2^7) = 10000 (capped)
        assert_eq!(backoff.max_wait_ms(), 100);
        backoff.attempt = 1;
        assert_eq!(backoff.max_wait_ms(), 200);
        backoff.attempt = 7;
        assert_eq!(backoff.max_wait_ms(), 10000);
    }

    #[test]
    fn test_retry_backoff_delay_within_bounds() {
        let mut backoff = RetryBackoff::new(Duration::from_secs(2));
        for _ in 0..20 {
            let max = backoff.max_wait_ms();
            let delay = backoff.next_delay();
            assert!(delay.as_millis() as u64 <= max);
        }
        assert_eq!(backoff.attempt, 20);
    }

    #[tokio::test]
    async fn test_retry_backoff_attempt_increments() {
        let mut backoff = RetryBackoff::new(Duration::from_millis(1));

        assert_eq!(backoff.attempt, 0);
        backoff.wait().await;
        assert_eq!(backoff.attempt, 1);
        backoff.wait().await;
        assert_eq!(backoff.attempt, 2);
    }

    #[test]
    fn test_retry_backoff_saturates() {
        let mut backoff = RetryBackoff::new(Duration::from_secs(10));
        backoff.attempt = u32::MAX;
        // Should not panic on overflow
        backoff.next_delay();
        assert_eq!(backoff.attempt, u32::MAX);
    }
}
