//! Engine configuration.
use std::time::Duration;

use crate::{backoff::Strategy, retry::RetryPolicy, sweeper::SweeperConfig};

pub const DEFAULT_MAX_CONCURRENCY: usize = 10;
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(30);
pub const DEFAULT_CANCELLATION_CHECK_INTERVAL: Duration = Duration::from_secs(1);
pub const DEFAULT_REPORT_ATTEMPTS: usize = 10;

const MIN_INTERVAL: Duration = Duration::from_millis(1);

/// Configuration of a [`crate::Chronos`] engine.
///
/// # Example
///
/// ```
/// # use chronos::prelude::*;
/// # use chrono::TimeDelta;
/// # use std::time::Duration;
/// let config = EngineConfig::default()
///     .with_max_concurrency(4)
///     .with_poll_interval(Duration::from_secs(5))
///     .with_default_timeout(Some(Duration::from_secs(300)))
///     .with_backoff(
///         BackoffStrategy::exponential(TimeDelta::seconds(5)).with_max(TimeDelta::minutes(10)),
///     );
/// ```
#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub(crate) max_concurrency: usize,
    pub(crate) poll_interval: Duration,
    pub(crate) cancellation_check_interval: Duration,
    pub(crate) default_timeout: Option<Duration>,
    pub(crate) report_attempts: usize,
    pub(crate) retry_policy: RetryPolicy,
    pub(crate) sweeper: Option<SweeperConfig>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_concurrency: DEFAULT_MAX_CONCURRENCY,
            poll_interval: DEFAULT_POLL_INTERVAL,
            cancellation_check_interval: DEFAULT_CANCELLATION_CHECK_INTERVAL,
            default_timeout: None,
            report_attempts: DEFAULT_REPORT_ATTEMPTS,
            retry_policy: RetryPolicy::default(),
            sweeper: None,
        }
    }
}

impl EngineConfig {
    /// The number of runner slots, at least one.
    pub fn with_max_concurrency(self, max_concurrency: usize) -> Self {
        Self {
            max_concurrency: max_concurrency.max(1),
            ..self
        }
    }

    /// The longest the dispatcher sleeps between two cycles when it is not woken up.
    pub fn with_poll_interval(self, poll_interval: Duration) -> Self {
        Self {
            poll_interval: poll_interval.max(MIN_INTERVAL),
            ..self
        }
    }

    /// How often a running job is checked for a cancellation request.
    pub fn with_cancellation_check_interval(self, interval: Duration) -> Self {
        Self {
            cancellation_check_interval: interval.max(MIN_INTERVAL),
            ..self
        }
    }

    /// Timeout applied to executors that do not set their own.
    pub fn with_default_timeout(self, default_timeout: Option<Duration>) -> Self {
        Self {
            default_timeout,
            ..self
        }
    }

    /// How many failed writes of an execution's outcome a slot tolerates once the engine is
    /// shutting down. Until then the write is retried until the store accepts it.
    pub fn with_report_attempts(self, report_attempts: usize) -> Self {
        Self {
            report_attempts: report_attempts.max(1),
            ..self
        }
    }

    pub fn with_retry_policy(self, retry_policy: RetryPolicy) -> Self {
        Self {
            retry_policy,
            ..self
        }
    }

    pub fn with_backoff(self, strategy: impl Strategy + Send + Sync + 'static) -> Self {
        self.with_retry_policy(RetryPolicy::new(strategy))
    }

    pub fn with_sweeper(self, sweeper: SweeperConfig) -> Self {
        Self {
            sweeper: Some(sweeper),
            ..self
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn defaults() {
        let config = EngineConfig::default();

        assert_eq!(config.max_concurrency, 10);
        assert_eq!(config.poll_interval, Duration::from_secs(30));
        assert_eq!(config.report_attempts, 10);
        assert!(config.default_timeout.is_none());
        assert!(config.sweeper.is_none());
    }

    #[test]
    fn bounds() {
        let config = EngineConfig::default()
            .with_max_concurrency(0)
            .with_poll_interval(Duration::ZERO)
            .with_cancellation_check_interval(Duration::ZERO)
            .with_report_attempts(0);

        assert_eq!(config.max_concurrency, 1);
        assert_eq!(config.poll_interval, MIN_INTERVAL);
        assert_eq!(config.cancellation_check_interval, MIN_INTERVAL);
        assert_eq!(config.report_attempts, 1);
    }
}
