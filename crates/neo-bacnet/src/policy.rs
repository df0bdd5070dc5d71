//! Timeout and retry policy for confirmed requests

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// How the deadline grows between attempts
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum Backoff {
    /// Every attempt waits the initial timeout
    #[default]
    Fixed,
    /// Each retry multiplies the previous wait by `factor`, capped at `max`
    Exponential { factor: f64, max: Duration },
}

/// Per-request timeout and retry budget.
///
/// `max_attempts` counts the first transmission, so `3` means one send and
/// at most two retries.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct TimeoutPolicy {
    pub initial_timeout: Duration,
    pub max_attempts: u32,
    #[serde(default)]
    pub backoff: Backoff,
}

impl Default for TimeoutPolicy {
    fn default() -> Self {
        Self {
            initial_timeout: Duration::from_secs(3),
            max_attempts: 3,
            backoff: Backoff::Fixed,
        }
    }
}

impl TimeoutPolicy {
    pub fn new(initial_timeout: Duration, max_attempts: u32) -> Self {
        Self {
            initial_timeout,
            max_attempts: max_attempts.max(1),
            backoff: Backoff::Fixed,
        }
    }

    /// Exponential backoff, preferred for WAN-routed destinations
    pub fn with_exponential_backoff(mut self, factor: f64, max: Duration) -> Self {
        self.backoff = Backoff::Exponential { factor, max };
        self
    }

    /// Wait before giving up on `attempt` (1-based)
    pub fn timeout_for(&self, attempt: u32) -> Duration {
        match self.backoff {
            Backoff::Fixed => self.initial_timeout,
            Backoff::Exponential { factor, max } => {
                let exp = attempt.saturating_sub(1).min(32) as i32;
                let scaled = self.initial_timeout.as_secs_f64() * factor.max(1.0).powi(exp);
                Duration::from_secs_f64(scaled.min(max.as_secs_f64())).max(self.initial_timeout.min(max))
            }
        }
    }

    /// Whether another transmission is allowed after `attempts_made`
    pub fn may_retry(&self, attempts_made: u32) -> bool {
        attempts_made < self.max_attempts.max(1)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fixed_backoff() {
        let policy = TimeoutPolicy::new(Duration::from_millis(500), 3);
        assert_eq!(policy.timeout_for(1), Duration::from_millis(500));
        assert_eq!(policy.timeout_for(3), Duration::from_millis(500));
        assert!(policy.may_retry(2));
        assert!(!policy.may_retry(3));
    }

    #[test]
    fn test_exponential_backoff_caps() {
        let policy = TimeoutPolicy::new(Duration::from_secs(1), 5)
            .with_exponential_backoff(2.0, Duration::from_secs(5));
        assert_eq!(policy.timeout_for(1), Duration::from_secs(1));
        assert_eq!(policy.timeout_for(2), Duration::from_secs(2));
        assert_eq!(policy.timeout_for(3), Duration::from_secs(4));
        assert_eq!(policy.timeout_for(4), Duration::from_secs(5));
        assert_eq!(policy.timeout_for(40), Duration::from_secs(5));
    }

    #[test]
    fn test_zero_attempts_means_one() {
        let policy = TimeoutPolicy::new(Duration::from_secs(1), 0);
        assert_eq!(policy.max_attempts, 1);
        assert!(!policy.may_retry(1));
    }
}
