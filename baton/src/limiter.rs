use std::num::NonZeroU32;

use governor::clock::DefaultClock;
use governor::state::{InMemoryState, NotKeyed};
use governor::{Quota, RateLimiter};

use crate::error::{BatonError, Result};

/// Throttles job submission with a per-minute quota.
///
/// A batch is admitted or rejected as a whole. A quota of zero disables
/// throttling.
pub struct SubmissionLimiter {
    limiter: Option<RateLimiter<NotKeyed, InMemoryState, DefaultClock>>,
}

impl std::fmt::Debug for SubmissionLimiter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SubmissionLimiter")
            .field("enabled", &self.limiter.is_some())
            .finish()
    }
}

impl SubmissionLimiter {
    pub fn per_minute(jobs: u32) -> Self {
        let limiter = NonZeroU32::new(jobs)
            .map(|quota| RateLimiter::direct(Quota::per_minute(quota)));
        Self { limiter }
    }

    pub fn unlimited() -> Self {
        Self { limiter: None }
    }

    /// Takes `jobs` permits or fails with `RateLimited`.
    pub fn check(&self, jobs: usize) -> Result<()> {
        let Some(limiter) = &self.limiter else {
            return Ok(());
        };
        let Some(n) = u32::try_from(jobs).ok().and_then(NonZeroU32::new) else {
            return Ok(());
        };
        if matches!(limiter.check_n(n), Ok(Ok(()))) {
            Ok(())
        } else {
            Err(BatonError::RateLimited)
        }
    }
}
