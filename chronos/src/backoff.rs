//! Delays applied before a failed job becomes due again.
//!
//! A [`BackoffStrategy`] grows the delay with the job's retry count in one of three ways:
//! constant, linear or exponential. Every strategy can be capped, spread with [`Jitter`] and
//! given a floor. The retry count passed to [`Strategy::backoff`] is the count before the
//! failure being handled, so the first retry is computed from `0`.
//!
//! # Example
//!
//! ```
//! # use chronos::prelude::*;
//! # use chrono::TimeDelta;
//! let strategy = BackoffStrategy::linear(TimeDelta::seconds(20))
//!     .with_max(TimeDelta::seconds(60))
//!     .with_jitter(Jitter::Absolute(TimeDelta::seconds(10)));
//!
//! let first = strategy.backoff(0);
//! assert!(first >= TimeDelta::seconds(10) && first <= TimeDelta::seconds(30));
//! // jitter is applied after the cap
//! let late = strategy.backoff(9);
//! assert!(late >= TimeDelta::seconds(50) && late <= TimeDelta::seconds(70));
//! ```
use chrono::TimeDelta;
use rand::Rng;

/// Computes the delay before retry number `retry_count + 1`.
pub trait Strategy {
    fn backoff(&self, retry_count: u16) -> TimeDelta;
}

impl<F> Strategy for F
where
    F: Fn(u16) -> TimeDelta,
{
    fn backoff(&self, retry_count: u16) -> TimeDelta {
        self(retry_count)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Growth {
    Constant,
    Linear,
    Exponential { multiplier: u32 },
}

/// Random spread applied to a delay so that jobs failing together are not retried together.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Jitter {
    /// Adds a random offset in `-delta..=delta`.
    Absolute(TimeDelta),
    /// Adds a random offset of up to `ratio` times the delay, in either direction.
    Relative(f64),
}

impl Jitter {
    fn spread_millis(self, delay_millis: i64) -> i64 {
        match self {
            Self::Absolute(delta) => delta.num_milliseconds().saturating_abs(),
            Self::Relative(ratio) => (delay_millis as f64 * ratio.abs()).round() as i64,
        }
    }

    fn apply(self, delay: TimeDelta) -> TimeDelta {
        let delay_millis = delay.num_milliseconds();
        let spread = self.spread_millis(delay_millis);
        if spread == 0 {
            return delay;
        }
        let offset = rand::thread_rng().gen_range(-spread..=spread);
        delay_millis
            .checked_add(offset)
            .and_then(TimeDelta::try_milliseconds)
            .unwrap_or(delay)
    }
}

/// A backoff strategy built from a growth mode, an optional cap, jitter and a floor.
///
/// # Example
///
/// ```
/// # use chronos::prelude::*;
/// # use chrono::TimeDelta;
/// let strategy = BackoffStrategy::exponential(TimeDelta::seconds(10))
///     .with_max(TimeDelta::seconds(60));
///
/// assert_eq!(strategy.backoff(0), TimeDelta::seconds(10));
/// assert_eq!(strategy.backoff(1), TimeDelta::seconds(20));
/// assert_eq!(strategy.backoff(2), TimeDelta::seconds(40));
/// assert_eq!(strategy.backoff(3), TimeDelta::seconds(60));
/// ```
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BackoffStrategy {
    initial: TimeDelta,
    growth: Growth,
    max: Option<TimeDelta>,
    jitter: Option<Jitter>,
    min: TimeDelta,
}

impl BackoffStrategy {
    const fn with_growth(initial: TimeDelta, growth: Growth) -> Self {
        Self {
            initial,
            growth,
            max: None,
            jitter: None,
            min: TimeDelta::zero(),
        }
    }

    /// Always waits `delay`.
    pub const fn constant(delay: TimeDelta) -> Self {
        Self::with_growth(delay, Growth::Constant)
    }

    /// Waits `step × (retry_count + 1)`.
    pub const fn linear(step: TimeDelta) -> Self {
        Self::with_growth(step, Growth::Linear)
    }

    /// Waits `initial × 2^retry_count`, see [`BackoffStrategy::with_multiplier`].
    ///
    /// Without [`BackoffStrategy::with_max`] the delay saturates at [`TimeDelta::MAX`].
    pub const fn exponential(initial: TimeDelta) -> Self {
        Self::with_growth(initial, Growth::Exponential { multiplier: 2 })
    }

    /// Replaces the factor of an exponential strategy, other strategies are left unchanged.
    pub const fn with_multiplier(mut self, multiplier: u32) -> Self {
        if let Growth::Exponential { .. } = self.growth {
            self.growth = Growth::Exponential { multiplier };
        }
        self
    }

    /// Caps the delay before jitter is applied.
    pub const fn with_max(mut self, max: TimeDelta) -> Self {
        self.max = Some(max);
        self
    }

    pub const fn with_jitter(mut self, jitter: Jitter) -> Self {
        self.jitter = Some(jitter);
        self
    }

    /// The shortest delay returned, after jitter.
    pub const fn with_min(mut self, min: TimeDelta) -> Self {
        self.min = min;
        self
    }

    fn grown(&self, retry_count: u16) -> TimeDelta {
        let initial = self.initial.num_milliseconds();
        let millis = match self.growth {
            Growth::Constant => Some(initial),
            Growth::Linear => initial.checked_mul(i64::from(retry_count) + 1),
            Growth::Exponential { multiplier } => i64::from(multiplier)
                .checked_pow(u32::from(retry_count))
                .and_then(|factor| initial.checked_mul(factor)),
        };
        millis
            .and_then(TimeDelta::try_milliseconds)
            .unwrap_or(TimeDelta::MAX)
    }
}

impl Strategy for BackoffStrategy {
    fn backoff(&self, retry_count: u16) -> TimeDelta {
        let mut delay = self.grown(retry_count);
        if let Some(max) = self.max {
            delay = delay.min(max);
        }
        if let Some(jitter) = self.jitter {
            delay = jitter.apply(delay);
        }
        delay.max(self.min)
    }
}
