//! Bounded exponential backoff for step re-attempts.

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Retry policy attached to a step invocation when it is scheduled.
///
/// Attempts are 1-based. The delay before attempt `n > 1` is
/// `base_delay * backoff_coefficient^(n - 2)`, optionally capped by
/// `max_delay`. Once `max_attempts` attempts have failed the failure is
/// terminal.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Total attempts allowed, including the first (values below 1 act as 1)
    pub max_attempts: u32,
    /// Delay before the second attempt
    pub base_delay: Duration,
    /// Growth factor applied to each further delay
    pub backoff_coefficient: f64,
    /// Optional ceiling for a single delay
    #[serde(default)]
    pub max_delay: Option<Duration>,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_secs(5),
            backoff_coefficient: 1.7,
            max_delay: None,
        }
    }
}

impl RetryPolicy {
    pub fn new(max_attempts: u32, base_delay: Duration, backoff_coefficient: f64) -> Self {
        Self {
            max_attempts,
            base_delay,
            backoff_coefficient,
            max_delay: None,
        }
    }

    /// A single attempt, no retries.
    pub fn no_retry() -> Self {
        Self {
            max_attempts: 1,
            ..Default::default()
        }
    }

    pub fn with_max_delay(mut self, max_delay: Duration) -> Self {
        self.max_delay = Some(max_delay);
        self
    }

    /// Effective attempt budget.
    pub fn attempts(&self) -> u32 {
        self.max_attempts.max(1)
    }

    /// Delay to wait before `attempt` (1-based).
    ///
    /// `None` for the first attempt and for any attempt beyond the budget.
    pub fn delay_before_attempt(&self, attempt: u32) -> Option<Duration> {
        if attempt <= 1 || attempt > self.attempts() {
            return None;
        }

        let exponent = i32::try_from(attempt - 2).unwrap_or(i32::MAX);
        let factor = self.backoff_coefficient.max(0.0).powi(exponent);
        let millis = (self.base_delay.as_millis() as f64 * factor).round();
        let delay = if millis.is_finite() && millis < u64::MAX as f64 {
            Duration::from_millis(millis as u64)
        } else {
            Duration::MAX
        };

        Some(match self.max_delay {
            Some(cap) => delay.min(cap),
            None => delay,
        })
    }

    /// Whether another attempt is allowed after `attempts_made` failed ones.
    pub fn should_retry(&self, attempts_made: u32) -> bool {
        attempts_made < self.attempts()
    }

    /// Every delay this policy can produce, in order (before attempt 2, 3, ...).
    pub fn delays(&self) -> impl Iterator<Item = Duration> + '_ {
        (2..=self.attempts()).filter_map(|attempt| self.delay_before_attempt(attempt))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn exponential_backoff_matches_documented_example() {
        let policy = RetryPolicy::new(3, Duration::from_secs(5), 1.7);

        assert_eq!(policy.delay_before_attempt(1), None);
        assert_eq!(policy.delay_before_attempt(2), Some(Duration::from_secs(5)));
        assert_eq!(policy.delay_before_attempt(3), Some(Duration::from_millis(8500)));
        assert_eq!(policy.delay_before_attempt(4), None);

        let delays: Vec<_> = policy.delays().collect();
        assert_eq!(delays, vec![Duration::from_secs(5), Duration::from_millis(8500)]);
    }

    #[test]
    fn should_retry_respects_max_attempts() {
        let policy = RetryPolicy::new(3, Duration::from_secs(1), 2.0);

        assert!(policy.should_retry(1));
        assert!(policy.should_retry(2));
        assert!(!policy.should_retry(3));
        assert!(!policy.should_retry(4));
    }

    #[test]
    fn no_retry_allows_exactly_one_attempt() {
        let policy = RetryPolicy::no_retry();
        assert!(!policy.should_retry(1));
        assert_eq!(policy.delays().count(), 0);
    }

    #[test]
    fn zero_attempts_behaves_like_one() {
        let policy = RetryPolicy::new(0, Duration::from_secs(1), 2.0);
        assert_eq!(policy.attempts(), 1);
        assert!(!policy.should_retry(1));
    }

    #[test]
    fn max_delay_caps_growth() {
        let policy = RetryPolicy::new(6, Duration::from_secs(1), 10.0)
            .with_max_delay(Duration::from_secs(30));

        assert_eq!(policy.delay_before_attempt(3), Some(Duration::from_secs(10)));
        assert_eq!(policy.delay_before_attempt(4), Some(Duration::from_secs(30)));
        assert_eq!(policy.delay_before_attempt(6), Some(Duration::from_secs(30)));
    }

    proptest! {
        #[test]
        fn delays_never_shrink_when_coefficient_at_least_one(
            max_attempts in 1u32..12,
            base_ms in 0u64..60_000,
            coefficient in 1.0f64..4.0,
        ) {
            let policy = RetryPolicy::new(max_attempts, Duration::from_millis(base_ms), coefficient);
            let delays: Vec<_> = policy.delays().collect();

            prop_assert_eq!(delays.len() as u32, max_attempts - 1);
            for pair in delays.windows(2) {
                prop_assert!(pair[0] <= pair[1]);
            }
        }

        #[test]
        fn no_delay_beyond_attempt_budget(max_attempts in 1u32..20, extra in 1u32..50) {
            let policy = RetryPolicy::new(max_attempts, Duration::from_secs(1), 1.5);
            prop_assert_eq!(policy.delay_before_attempt(max_attempts + extra), None);
        }
    }
}
