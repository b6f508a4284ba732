//! Decides whether a failed execution is retried and when.
use std::{fmt::Debug, sync::Arc};

use chrono::{DateTime, TimeDelta, Utc};

use crate::{
    backoff::{BackoffStrategy, Jitter, Strategy},
    executor::Failure,
    job::Job,
};

/// Exponential backoff starting at 10 seconds, capped at one hour, with a 10% jitter.
pub const DEFAULT_BACKOFF: BackoffStrategy =
    BackoffStrategy::exponential(TimeDelta::seconds(10))
        .with_max(TimeDelta::hours(1))
        .with_jitter(Jitter::Relative(0.1));

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    /// Hold the job in [`crate::job::JobStatus::Retrying`] until `due_at`.
    Retry {
        retry_count: u16,
        backoff: TimeDelta,
        due_at: DateTime<Utc>,
    },
    /// Retries are exhausted or the failure is not retriable.
    Fail,
}

#[derive(Clone)]
pub struct RetryPolicy {
    strategy: Arc<dyn Strategy + Send + Sync>,
}

impl Debug for RetryPolicy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RetryPolicy").finish_non_exhaustive()
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::new(DEFAULT_BACKOFF)
    }
}

impl RetryPolicy {
    pub fn new(strategy: impl Strategy + Send + Sync + 'static) -> Self {
        Self {
            strategy: Arc::new(strategy),
        }
    }

    pub fn decide(&self, job: &Job, failure: &Failure, now: DateTime<Utc>) -> RetryDecision {
        if !failure.retriable || job.retry_count >= job.max_retries {
            return RetryDecision::Fail;
        }
        let backoff = self.strategy.backoff(job.retry_count).max(TimeDelta::zero());
        RetryDecision::Retry {
            retry_count: job.retry_count + 1,
            backoff,
            due_at: now
                .checked_add_signed(backoff)
                .unwrap_or(DateTime::<Utc>::MAX_UTC),
        }
    }
}
