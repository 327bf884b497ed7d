//! Retry delays for the connect loop
//!
//! The connect loop retries forever; this policy only decides how long it
//! sleeps between attempts. A multiplier of 1.0 gives the fixed cadence the
//! collector expects, anything larger grows the delay up to `max_delay`.

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Past this many doublings every sane policy has hit its cap
const MAX_EXPONENT: u32 = 64;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Delay before the first retry
    pub initial_delay: Duration,
    /// Cap on the delay
    pub max_delay: Duration,
    /// Growth factor per consecutive failure
    pub multiplier: f64,
}

impl RetryPolicy {
    /// Same delay after every failure
    pub fn fixed(delay: Duration) -> Self {
        Self {
            initial_delay: delay,
            max_delay: delay,
            multiplier: 1.0,
        }
    }

    pub fn exponential(initial: Duration, max: Duration, multiplier: f64) -> Self {
        Self {
            initial_delay: initial,
            max_delay: max,
            multiplier,
        }
    }

    /// Delay after `failures` consecutive failures (0 = first failure)
    pub fn delay_for(&self, failures: u32) -> Duration {
        if self.multiplier <= 1.0 || failures == 0 {
            return self.initial_delay.min(self.max_delay);
        }

        let exponent = failures.min(MAX_EXPONENT) as i32;
        let delay = self.initial_delay.as_nanos() as f64 * self.multiplier.powi(exponent);

        if delay.is_finite() && delay < self.max_delay.as_nanos() as f64 {
            Duration::from_nanos(delay as u64).min(self.max_delay)
        } else {
            self.max_delay
        }
    }
}

/// Consecutive failure counter for one phase of the connect loop
#[derive(Debug, Default)]
pub(crate) struct Attempts {
    failures: u32,
}

impl Attempts {
    /// Record a failure and return the delay to wait before retrying
    pub(crate) fn fail(&mut self, policy: &RetryPolicy) -> Duration {
        let delay = policy.delay_for(self.failures);
        self.failures = self.failures.saturating_add(1);
        delay
    }

    pub(crate) fn failures(&self) -> u32 {
        self.failures
    }

    pub(crate) fn reset(&mut self) {
        self.failures = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fixed_policy_never_grows() {
        let policy = RetryPolicy::fixed(Duration::from_secs(10));
        for failures in [0, 1, 5, 1000] {
            assert_eq!(policy.delay_for(failures), Duration::from_secs(10));
        }
    }

    #[test]
    fn test_exponential_policy_is_capped() {
        let policy = RetryPolicy::exponential(
            Duration::from_millis(100),
            Duration::from_secs(1),
            2.0,
        );

        assert_eq!(policy.delay_for(0), Duration::from_millis(100));
        assert_eq!(policy.delay_for(1), Duration::from_millis(200));
        assert_eq!(policy.delay_for(3), Duration::from_millis(800));
        assert_eq!(policy.delay_for(4), Duration::from_secs(1));
        assert_eq!(policy.delay_for(u32::MAX), Duration::from_secs(1));
    }

    #[test]
    fn test_delay_never_exceeds_cap() {
        let policy = RetryPolicy::exponential(Duration::from_secs(30), Duration::from_secs(5), 2.0);
        assert_eq!(policy.delay_for(0), Duration::from_secs(5));
        assert_eq!(policy.delay_for(3), Duration::from_secs(5));

        let fixed = RetryPolicy {
            initial_delay: Duration::from_secs(10),
            max_delay: Duration::from_secs(2),
            multiplier: 1.0,
        };
        assert_eq!(fixed.delay_for(4), Duration::from_secs(2));
    }

    #[test]
    fn test_zero_initial_delay_stays_zero() {
        let policy = RetryPolicy::exponential(Duration::ZERO, Duration::from_secs(1), 3.0);
        assert_eq!(policy.delay_for(0), Duration::ZERO);
        assert_eq!(policy.delay_for(u32::MAX), Duration::ZERO);
    }

    #[test]
    fn test_attempts_track_consecutive_failures() {
        let policy = RetryPolicy::exponential(
            Duration::from_millis(100),
            Duration::from_secs(1),
            2.0,
        );
        let mut attempts = Attempts::default();

        assert_eq!(attempts.fail(&policy), Duration::from_millis(100));
        assert_eq!(attempts.fail(&policy), Duration::from_millis(200));
        assert_eq!(attempts.failures(), 2);

        attempts.reset();
        assert_eq!(attempts.fail(&policy), Duration::from_millis(100));
    }
}
