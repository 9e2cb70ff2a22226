use chrono::{DateTime, Duration, Utc};

use crate::config::RetryConfig;

/// What the retry policy decided for a failed attempt.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum RetryDecision {
    /// Return to ELIGIBLE at `retry_at`.
    Retry {
        delay: Duration,
        retry_at: DateTime<Utc>,
    },
    /// `attempt_count` reached `max_attempts`.
    Exhausted,
    /// The executor marked the failure permanent.
    NotRetryable,
}

impl RetryDecision {
    pub fn retry_at(&self) -> Option<DateTime<Utc>> {
        match self {
            RetryDecision::Retry { retry_at, .. } => Some(*retry_at),
            _ => None,
        }
    }
}

/// Computes the backoff before the next attempt.
///
/// Formula: delay = min(base_delay * 2^(attempts-1), max_backoff), where
/// `attempts` counts failed attempts so far (the first retry waits one
/// base delay).
pub fn compute_backoff(attempts: u32, config: &RetryConfig) -> Duration {
    if attempts == 0 {
        return Duration::zero();
    }

    let exp = attempts.saturating_sub(1).min(62) as i32;
    let scaled = (config.base_delay_ms as f64) * 2f64.powi(exp);
    let capped = scaled.min(config.max_backoff_ms as f64);
    let clamped_ms = capped.max(0.0) as i64;

    Duration::milliseconds(clamped_ms)
}

/// Whether a job has used up its attempts.
///
/// Returns true when attempts >= max_attempts.
pub fn should_fail_terminally(attempts: u32, max_attempts: u32) -> bool {
    attempts >= max_attempts
}

#[derive(Clone, Debug, Default)]
pub struct RetryPolicy {
    config: RetryConfig,
}

impl RetryPolicy {
    pub fn new(config: RetryConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &RetryConfig {
        &self.config
    }

    /// Decides the fate of a failed attempt. `attempts` already includes
    /// the attempt that just failed.
    pub fn decide(
        &self,
        attempts: u32,
        max_attempts: u32,
        retryable: bool,
        now: DateTime<Utc>,
    ) -> RetryDecision {
        if !retryable {
            return RetryDecision::NotRetryable;
        }
        if should_fail_terminally(attempts, max_attempts) {
            return RetryDecision::Exhausted;
        }
        let delay = compute_backoff(attempts, &self.config);
        RetryDecision::Retry {
            delay,
            retry_at: now + delay,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_compute_backoff_exponential() {
        let config = RetryConfig::default();

        assert_eq!(compute_backoff(0, &config), Duration::zero());
        assert_eq!(
            compute_backoff(1, &config).num_milliseconds() as u64,
            config.base_delay_ms
        );
        assert_eq!(
            compute_backoff(2, &config).num_milliseconds() as u64,
            config.base_delay_ms * 2
        );
        assert_eq!(
            compute_backoff(3, &config).num_milliseconds() as u64,
            config.base_delay_ms * 4
        );
    }

    #[test]
    fn test_backoff_capped() {
        let config = RetryConfig {
            base_delay_ms: 1000,
            max_backoff_ms: 5000,
            ..Default::default()
        };
        assert_eq!(compute_backoff(10, &config).num_milliseconds(), 5000);
        assert_eq!(compute_backoff(u32::MAX, &config).num_milliseconds(), 5000);
    }

    #[test]
    fn test_should_fail_terminally() {
        assert!(!should_fail_terminally(1, 3));
        assert!(!should_fail_terminally(2, 3));
        assert!(should_fail_terminally(3, 3));
        assert!(should_fail_terminally(4, 3));
    }

    #[test]
    fn test_decide() {
        let policy = RetryPolicy::default();
        let now = Utc::now();

        let first = policy.decide(1, 3, true, now);
        assert_eq!(first.retry_at(), Some(now + Duration::seconds(1)));
        assert!(matches!(policy.decide(2, 3, true, now), RetryDecision::Retry { .. }));
        assert_eq!(policy.decide(3, 3, true, now), RetryDecision::Exhausted);
        assert_eq!(policy.decide(1, 3, false, now), RetryDecision::NotRetryable);
    }
}
