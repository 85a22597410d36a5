//! Retry policy: whether to try again and how long to wait first.

use rand::Rng;
use serde::Deserialize;
use std::time::Duration;

use super::classify::Classification;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RetryStrategy {
    None,
    FixedDelay,
    /// delay = base × attempt (attempt 0 waits one base).
    LinearBackoff,
    /// delay = base × factor^attempt, capped at max delay.
    ExponentialBackoff,
}

#[derive(Clone, Debug, PartialEq)]
pub struct RetryPolicy {
    /// Overrides the strategy the classifier recommends for every retryable kind.
    /// `Some(RetryStrategy::None)` disables retries; `None` keeps the per-kind recommendation.
    pub strategy: Option<RetryStrategy>,
    pub base_delay: Duration,
    pub max_delay: Duration,
    pub factor: f64,
    pub max_retries: u32,
    /// Scale each delay by a random factor in [0.5, 1.5].
    pub jitter: bool,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            strategy: None,
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(60),
            factor: 2.0,
            max_retries: 3,
            jitter: true,
        }
    }
}

impl RetryPolicy {
    /// Retries allowed for this classification: the policy cap, lowered by the kind's own cap.
    pub fn retry_limit(&self, cls: &Classification) -> u32 {
        match (self.effective_strategy(cls), cls.retry_cap) {
            (RetryStrategy::None, _) => 0,
            (_, Some(cap)) => cap.min(self.max_retries),
            (_, None) => self.max_retries,
        }
    }

    /// Kinds that are never retried keep `None` whatever the policy says.
    pub fn effective_strategy(&self, cls: &Classification) -> RetryStrategy {
        match (self.strategy, cls.retry_cap) {
            (_, Some(0)) => RetryStrategy::None,
            (Some(configured), _) => configured,
            (None, _) => cls.strategy,
        }
    }

    /// `attempt` is the 0-based index of the retry being considered.
    pub fn should_retry(&self, cls: &Classification, attempt: u32) -> bool {
        attempt < self.retry_limit(cls)
    }

    /// Delay before retry `attempt` under the effective strategy for `cls`.
    pub fn delay_for(&self, cls: &Classification, attempt: u32) -> Duration {
        self.delay(self.effective_strategy(cls), attempt)
    }

    /// Delay before retry `attempt` (0-based) under `strategy`. Never exceeds `max_delay`;
    /// backoff strategies never go below `base_delay`.
    pub fn delay(&self, strategy: RetryStrategy, attempt: u32) -> Duration {
        let base = self.base_delay.as_secs_f64();
        let raw = match strategy {
            RetryStrategy::None => return Duration::ZERO,
            RetryStrategy::FixedDelay => base,
            RetryStrategy::LinearBackoff => base * f64::from(attempt.max(1)),
            RetryStrategy::ExponentialBackoff => {
                base * self.factor.max(1.0).powi(attempt.min(i32::MAX as u32) as i32)
            }
        };
        let max = self.max_delay.as_secs_f64();
        let mut secs = raw.min(max);
        if self.jitter {
            secs *= rand::rng().random_range(0.5..=1.5);
        }
        let floor = match strategy {
            RetryStrategy::FixedDelay => 0.0,
            _ => base.min(max),
        };
        Duration::from_secs_f64(secs.clamp(floor, max))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::resilience::ErrorKind;

    fn exp_policy() -> RetryPolicy {
        RetryPolicy {
            strategy: None,
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(10),
            factor: 2.0,
            max_retries: 5,
            jitter: false,
        }
    }

    #[test]
    fn exponential_delays_are_capped() {
        let p = exp_policy();
        let delays: Vec<u64> = (0..5)
            .map(|a| p.delay(RetryStrategy::ExponentialBackoff, a).as_secs())
            .collect();
        assert_eq!(delays, vec![1, 2, 4, 8, 10]);
    }

    #[test]
    fn jittered_delays_stay_in_bounds() {
        let p = RetryPolicy {
            jitter: true,
            ..exp_policy()
        };
        for attempt in 0..5 {
            for _ in 0..50 {
                let d = p.delay(RetryStrategy::ExponentialBackoff, attempt);
                assert!(d >= Duration::from_secs(1) && d <= Duration::from_secs(10));
            }
        }
    }

    #[test]
    fn sixth_attempt_is_refused() {
        let p = exp_policy();
        let cls = ErrorKind::Transient.classification();
        assert!((0..5).all(|a| p.should_retry(&cls, a)));
        assert!(!p.should_retry(&cls, 5));
    }

    #[test]
    fn linear_grows_by_base() {
        let p = RetryPolicy {
            max_delay: Duration::from_secs(100),
            ..exp_policy()
        };
        assert_eq!(p.delay(RetryStrategy::LinearBackoff, 3), Duration::from_secs(3));
        assert_eq!(p.delay(RetryStrategy::FixedDelay, 7), Duration::from_secs(1));
        assert_eq!(p.delay(RetryStrategy::None, 2), Duration::ZERO);
    }

    #[test]
    fn kind_caps_lower_the_policy_limit() {
        let p = exp_policy();
        assert_eq!(p.retry_limit(&ErrorKind::DataValidation.classification()), 2);
        assert_eq!(p.retry_limit(&ErrorKind::Permission.classification()), 0);
        assert_eq!(p.retry_limit(&ErrorKind::Unknown.classification()), 5);
    }

    #[test]
    fn none_strategy_disables_retries() {
        let p = RetryPolicy {
            strategy: Some(RetryStrategy::None),
            ..exp_policy()
        };
        assert!(!p.should_retry(&ErrorKind::Transient.classification(), 0));
    }

    #[test]
    fn configured_strategy_overrides_recommendation() {
        let fixed = RetryPolicy {
            strategy: Some(RetryStrategy::FixedDelay),
            ..exp_policy()
        };
        let transient = ErrorKind::Transient.classification();
        let delays: Vec<u64> = (0..4).map(|a| fixed.delay_for(&transient, a).as_secs()).collect();
        assert_eq!(delays, vec![1, 1, 1, 1]);
        assert_eq!(
            fixed.effective_strategy(&ErrorKind::Unknown.classification()),
            RetryStrategy::FixedDelay
        );
        // per-kind caps and never-retry kinds still hold
        assert_eq!(fixed.retry_limit(&ErrorKind::DataValidation.classification()), 2);
        assert_eq!(fixed.retry_limit(&ErrorKind::Permission.classification()), 0);

        let by_kind = exp_policy();
        let delays: Vec<u64> = (0..4).map(|a| by_kind.delay_for(&transient, a).as_secs()).collect();
        assert_eq!(delays, vec![1, 2, 4, 8]);
        assert_eq!(
            by_kind.effective_strategy(&ErrorKind::Unknown.classification()),
            RetryStrategy::LinearBackoff
        );
    }
}
