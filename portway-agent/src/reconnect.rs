//! Exponential backoff for tunnel reconnection.

use portway_common::constants::{
    DEFAULT_MAX_RECONNECT_ATTEMPTS, DEFAULT_RECONNECT_SECS, MAX_RECONNECT_DELAY_SECS,
};
use rand::Rng;
use std::time::Duration;

/// Backoff policy: delay for attempt `k` (1-based) is
/// `min(base * 2^(k-1), cap)`, with optional jitter.
#[derive(Debug, Clone)]
pub struct BackoffPolicy {
    pub base: Duration,
    pub cap: Duration,
    /// Jitter factor in `[0.0, 1.0]`; the delay is scaled by a random value
    /// in `[1 - jitter, 1 + jitter]`.
    pub jitter: f64,
    /// Attempts allowed before giving up. `None` retries forever.
    pub max_attempts: Option<u32>,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            base: Duration::from_secs(DEFAULT_RECONNECT_SECS),
            cap: Duration::from_secs(MAX_RECONNECT_DELAY_SECS),
            jitter: 0.2,
            max_attempts: Some(DEFAULT_MAX_RECONNECT_ATTEMPTS),
        }
    }
}

/// Tracks reconnect attempts for one tunnel.
#[derive(Debug, Clone)]
pub struct Backoff {
    policy: BackoffPolicy,
    attempt: u32,
}

impl Backoff {
    #[must_use]
    pub fn new(policy: BackoffPolicy) -> Self {
        Self { policy, attempt: 0 }
    }

    /// Register a failure. Returns the delay to wait before the next
    /// attempt, or `None` when the attempt budget is exhausted.
    pub fn next_delay(&mut self) -> Option<Duration> {
        self.attempt = self.attempt.saturating_add(1);
        if let Some(max) = self.policy.max_attempts {
            if self.attempt > max {
                return None;
            }
        }
        Some(self.delay_for_attempt(self.attempt))
    }

    /// Reset after a successful connection.
    pub fn reset(&mut self) {
        self.attempt = 0;
    }

    #[must_use]
    pub fn attempts(&self) -> u32 {
        self.attempt
    }

    fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let base = self.policy.base.as_secs_f64();
        let cap = self.policy.cap.as_secs_f64();
        // Cap the exponent so large attempt counts cannot overflow.
        let exp = f64::from(attempt.saturating_sub(1).min(32));
        let raw = (base * 2f64.powf(exp)).min(cap);

        let jittered = if self.policy.jitter > 0.0 {
            let factor = rand::thread_rng()
                .gen_range(1.0 - self.policy.jitter..=1.0 + self.policy.jitter);
            (raw * factor).min(cap)
        } else {
            raw
        };

        Duration::from_secs_f64(jittered.max(0.0))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn no_jitter(base: u64, cap: u64, max_attempts: Option<u32>) -> Backoff {
        Backoff::new(BackoffPolicy {
            base: Duration::from_secs(base),
            cap: Duration::from_secs(cap),
            jitter: 0.0,
            max_attempts,
        })
    }

    #[test]
    fn test_exponential_growth() {
        let mut backoff = no_jitter(5, 60, None);
        assert_eq!(backoff.next_delay(), Some(Duration::from_secs(5)));
        assert_eq!(backoff.next_delay(), Some(Duration::from_secs(10)));
        assert_eq!(backoff.next_delay(), Some(Duration::from_secs(20)));
        assert_eq!(backoff.next_delay(), Some(Duration::from_secs(40)));
    }

    #[test]
    fn test_delay_capped() {
        let mut backoff = no_jitter(10, 30, None);
        let _ = backoff.next_delay(); // 10
        let _ = backoff.next_delay(); // 20
        assert_eq!(backoff.next_delay(), Some(Duration::from_secs(30)));
        assert_eq!(backoff.next_delay(), Some(Duration::from_secs(30)));
    }

    #[test]
    fn test_attempt_budget_exhausts() {
        let mut backoff = no_jitter(1, 60, Some(2));
        assert!(backoff.next_delay().is_some());
        assert!(backoff.next_delay().is_some());
        assert!(backoff.next_delay().is_none());
        assert_eq!(backoff.attempts(), 3);
    }

    #[test]
    fn test_reset_restores_budget() {
        let mut backoff = no_jitter(1, 60, Some(1));
        assert!(backoff.next_delay().is_some());
        assert!(backoff.next_delay().is_none());
        backoff.reset();
        assert!(backoff.next_delay().is_some());
    }

    #[test]
    fn test_jitter_stays_within_bounds() {
        let mut backoff = Backoff::new(BackoffPolicy {
            base: Duration::from_secs(10),
            cap: Duration::from_secs(60),
            jitter: 0.3,
            max_attempts: None,
        });
        for _ in 0..50 {
            let delay = backoff.next_delay().unwrap();
            assert!(delay <= Duration::from_secs(60));
        }
        backoff.reset();
        let first = backoff.next_delay().unwrap().as_secs_f64();
        assert!((7.0..=13.0).contains(&first), "delay was {first}");
    }
}
