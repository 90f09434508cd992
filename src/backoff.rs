//! Reconnection backoff policy
//!
//! A single policy drives retry pacing for both video and audio sources so
//! a flapping camera is retried on one predictable cadence.

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Retry budget and delay schedule for source reconnection.
///
/// Attempts are numbered from 1. The delay ramps linearly with the attempt
/// number and is clamped at `max_delay`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackoffPolicy {
    /// Maximum number of reconnection attempts before giving up
    pub max_attempts: u32,
    /// Delay before the first attempt
    pub base_delay: Duration,
    /// Upper bound on any single delay
    pub max_delay: Duration,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(10),
        }
    }
}

impl BackoffPolicy {
    /// Whether the budget still allows the given attempt
    pub fn allows(&self, attempt: u32) -> bool {
        attempt <= self.max_attempts
    }

    /// Delay to wait before the given attempt (1-based)
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let delay = self.base_delay.saturating_mul(attempt.max(1));
        delay.min(self.max_delay)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_delay_ramps_linearly() {
        let policy = BackoffPolicy::default();
        assert_eq!(policy.delay_for(1), Duration::from_secs(1));
        assert_eq!(policy.delay_for(2), Duration::from_secs(2));
        assert_eq!(policy.delay_for(3), Duration::from_secs(3));
    }

    #[test]
    fn test_delay_clamped_at_max() {
        let policy = BackoffPolicy {
            max_attempts: 100,
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(10),
        };
        assert_eq!(policy.delay_for(50), Duration::from_secs(10));
    }

    #[test]
    fn test_zeroth_attempt_treated_as_first() {
        let policy = BackoffPolicy::default();
        assert_eq!(policy.delay_for(0), policy.delay_for(1));
    }

    #[test]
    fn test_budget_exhaustion() {
        let policy = BackoffPolicy::default();
        assert!(policy.allows(1));
        assert!(policy.allows(3));
        assert!(!policy.allows(4));
    }
}
