//! Scheduled administrative sweeps.
//!
//! Finished jobs accumulate and jobs can be abandoned in the running state when an engine
//! instance dies. [`SweeperConfig`] runs the sweeps of [`crate::admin::Admin`] on a
//! [`cron::Schedule`] so neither needs an external scheduler.
//!
//! # Example
//!
//! Check for stuck jobs every hour and remove jobs that finished more than a month ago every
//! night:
//!
//! ```
//! # use chronos::prelude::*;
//! # use std::str::FromStr;
//! let hourly = SweeperConfig::new(cron::Schedule::from_str("0 0 * * * *").unwrap())
//!     .with_sweep(Sweep::ResetStuck { timeout_minutes: 30 });
//! let nightly = SweeperConfig::new(cron::Schedule::from_str("0 30 3 * * *").unwrap())
//!     .with_sweep(Sweep::Retention { days_old: 31 });
//! ```

pub(crate) mod runner;

/// A single administrative sweep.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Sweep {
    /// Delete finished jobs, and their logs, that completed more than `days_old` days ago.
    Retention { days_old: u32 },
    /// Report running jobs started more than `timeout_minutes` ago without touching them.
    DetectStuck { timeout_minutes: u32 },
    /// Return running jobs started more than `timeout_minutes` ago to the dispatch pool.
    ResetStuck { timeout_minutes: u32 },
}

#[derive(Debug, Clone)]
pub struct SweeperConfig {
    pub(crate) schedule: cron::Schedule,
    pub(crate) sweeps: Vec<Sweep>,
}

impl SweeperConfig {
    /// Construct a new instance of [`SweeperConfig`] scheduled to run on the provided cron
    /// schedule, in UTC.
    pub fn new(schedule: cron::Schedule) -> Self {
        Self {
            schedule,
            sweeps: Default::default(),
        }
    }

    pub fn with_sweep(mut self, sweep: Sweep) -> Self {
        self.sweeps.push(sweep);
        self
    }

    pub fn with_sweeps(mut self, sweeps: impl IntoIterator<Item = Sweep>) -> Self {
        self.sweeps.extend(sweeps);
        self
    }
}
