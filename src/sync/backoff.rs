//! Reconnect backoff policy
//!
//! Exponential with jitter: after attempt `n` the delay is
//! `min(base * 2^n, cap) * U(0.5, 1.5)`. The attempt count itself is
//! uncapped; only the exponent saturates.

use std::time::Duration;

use rand::Rng;

/// Exponential backoff state for one transport session
#[derive(Debug)]
pub struct Backoff {
    base: Duration,
    cap: Duration,
    attempts: u32,
}

impl Backoff {
    /// Create a backoff with the given base delay and cap
    pub fn new(base: Duration, cap: Duration) -> Self {
        Self {
            base,
            cap,
            attempts: 0,
        }
    }

    /// Number of consecutive failed attempts so far
    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    /// Record a failed attempt and return the delay before the next one
    pub fn next_delay(&mut self) -> Duration {
        let delay = self.delay_for(self.attempts);
        self.attempts = self.attempts.saturating_add(1);
        delay
    }

    /// Reset after a successful connection
    pub fn reset(&mut self) {
        self.attempts = 0;
    }

    fn delay_for(&self, attempt: u32) -> Duration {
        let mut raw = self.base;
        for _ in 0..attempt {
            if raw >= self.cap {
                break;
            }
            raw = raw.saturating_mul(2).min(self.cap);
        }

        let jitter: f64 = rand::thread_rng().gen_range(0.5..1.5);
        raw.mul_f64(jitter)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_delay_grows_exponentially() {
        let backoff = Backoff::new(Duration::from_millis(500), Duration::from_secs(30));

        for (attempt, expected_ms) in [(0u32, 500u64), (1, 1000), (2, 2000), (3, 4000)] {
            let delay = backoff.delay_for(attempt);
            let expected = Duration::from_millis(expected_ms);
            assert!(delay >= expected.mul_f64(0.5), "attempt {}", attempt);
            assert!(delay <= expected.mul_f64(1.5), "attempt {}", attempt);
        }
    }

    #[test]
    fn test_delay_saturates_at_cap() {
        let backoff = Backoff::new(Duration::from_millis(500), Duration::from_secs(30));

        // Far past the point where base * 2^n exceeds the cap.
        let delay = backoff.delay_for(40);
        assert!(delay <= Duration::from_secs(30).mul_f64(1.5));
        assert!(delay >= Duration::from_secs(30).mul_f64(0.5));
    }

    #[test]
    fn test_attempt_counting_and_reset() {
        let mut backoff = Backoff::new(Duration::from_millis(1), Duration::from_millis(10));

        assert_eq!(backoff.attempts(), 0);
        backoff.next_delay();
        backoff.next_delay();
        assert_eq!(backoff.attempts(), 2);

        backoff.reset();
        assert_eq!(backoff.attempts(), 0);
    }

    #[test]
    fn test_huge_attempt_count_does_not_overflow() {
        let mut backoff = Backoff::new(Duration::from_millis(500), Duration::from_secs(30));
        backoff.attempts = u32::MAX - 1;
        let delay = backoff.next_delay();
        assert!(delay <= Duration::from_secs(45));
        assert_eq!(backoff.attempts(), u32::MAX);
        // One more must not panic.
        backoff.next_delay();
    }
}
