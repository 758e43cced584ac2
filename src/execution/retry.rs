use rand::Rng;
use std::time::Duration;

/// How failed plugin API calls are retried.
///
/// Transport errors, 429 and 5xx are retried; other 4xx never are.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    /// Total attempts including the first.
    pub max_attempts: u32,
    pub min_backoff: Duration,
    pub max_backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 2,
            min_backoff: Duration::from_secs(1),
            max_backoff: Duration::from_secs(60),
        }
    }
}

impl RetryPolicy {
    /// Same attempts, no sleeping between them.
    pub fn no_wait(max_attempts: u32) -> Self {
        Self {
            max_attempts,
            min_backoff: Duration::ZERO,
            max_backoff: Duration::ZERO,
        }
    }

    pub fn is_retryable_status(status: u16) -> bool {
        status == 429 || (500..600).contains(&status)
    }

    /// Randomized exponential delay before attempt `attempt + 1`, within `[min_backoff, max_backoff]`.
    pub fn backoff_delay(&self, attempt: u32) -> Duration {
        if self.max_backoff.is_zero() {
            return Duration::ZERO;
        }
        let exp = attempt.saturating_sub(1).min(10);
        let base = self.min_backoff.saturating_mul(2u32.saturating_pow(exp));
        let capped = base.min(self.max_backoff);
        let low = self.min_backoff.as_secs_f64();
        let high = capped.as_secs_f64();
        if high <= low {
            return capped;
        }
        Duration::from_secs_f64(rand::rng().random_range(low..=high))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_is_two_attempts() {
        let p = RetryPolicy::default();
        assert_eq!(p.max_attempts, 2);
        assert_eq!(p.min_backoff, Duration::from_secs(1));
    }

    #[test]
    fn delays_stay_within_bounds() {
        let p = RetryPolicy::default();
        for attempt in 1..20 {
            let d = p.backoff_delay(attempt);
            assert!(d >= p.min_backoff, "attempt {attempt}: {d:?}");
            assert!(d <= p.max_backoff, "attempt {attempt}: {d:?}");
        }
        assert_eq!(p.backoff_delay(1), Duration::from_secs(1));
    }

    #[test]
    fn no_wait_never_sleeps() {
        assert_eq!(RetryPolicy::no_wait(3).backoff_delay(5), Duration::ZERO);
    }

    #[test]
    fn retryable_statuses() {
        assert!(RetryPolicy::is_retryable_status(429));
        assert!(RetryPolicy::is_retryable_status(503));
        assert!(!RetryPolicy::is_retryable_status(400));
        assert!(!RetryPolicy::is_retryable_status(404));
        assert!(!RetryPolicy::is_retryable_status(200));
    }
}
