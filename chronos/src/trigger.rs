//! Resolution of job triggers into due times.
//!
//! Recurring jobs are described by six field cron expressions evaluated in UTC:
//!
//! ```text
//! sec   min   hour   day of month   month   day of week
//! 0     0     9      *              *       ?
//! ```
//!
//! The `?` placeholder is accepted in any field and means "no specific value".
//!
//! # Example
//!
//! ```
//! # use chronos::trigger::{CronExpression, Trigger};
//! # use chrono::{TimeZone, Utc};
//! let cron: CronExpression = "0 0 9 * * ?".parse().unwrap();
//! let trigger = Trigger::Recurring { cron, active: true };
//! let reference = Utc.with_ymd_and_hms(2024, 5, 1, 10, 30, 0).unwrap();
//!
//! assert_eq!(
//!     trigger.next_due_time(reference, None),
//!     Some(Utc.with_ymd_and_hms(2024, 5, 2, 9, 0, 0).unwrap())
//! );
//! ```
use std::{fmt, str::FromStr};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use thiserror::Error;

const CRON_FIELDS: usize = 6;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[error("invalid cron expression `{expression}`: {reason}")]
pub struct InvalidCronExpression {
    pub expression: String,
    pub reason: String,
}

impl InvalidCronExpression {
    fn new(expression: &str, reason: impl Into<String>) -> Self {
        Self {
            expression: expression.to_owned(),
            reason: reason.into(),
        }
    }
}

/// A validated six field cron expression.
#[derive(Clone)]
pub struct CronExpression {
    source: String,
    schedule: cron::Schedule,
}

impl CronExpression {
    pub fn as_str(&self) -> &str {
        &self.source
    }

    /// The earliest instant strictly after `reference` matching the expression.
    pub fn next_after(&self, reference: DateTime<Utc>) -> Option<DateTime<Utc>> {
        self.schedule.after(&reference).next()
    }
}

impl FromStr for CronExpression {
    type Err = InvalidCronExpression;

    fn from_str(expression: &str) -> Result<Self, Self::Err> {
        let fields = expression.split_whitespace().collect::<Vec<_>>();
        if fields.len() != CRON_FIELDS {
            return Err(InvalidCronExpression::new(
                expression,
                format!(
                    "expected {CRON_FIELDS} fields (seconds minutes hours day-of-month month \
                     day-of-week) but found {}",
                    fields.len()
                ),
            ));
        }
        let normalized = fields
            .iter()
            .map(|field| if *field == "?" { "*" } else { field })
            .collect::<Vec<_>>()
            .join(" ");
        let schedule = cron::Schedule::from_str(&normalized)
            .map_err(|error| InvalidCronExpression::new(expression, error.to_string()))?;
        if schedule.upcoming(Utc).next().is_none() {
            return Err(InvalidCronExpression::new(
                expression,
                "expression never fires",
            ));
        }
        Ok(Self {
            source: fields.join(" "),
            schedule,
        })
    }
}

impl PartialEq for CronExpression {
    fn eq(&self, other: &Self) -> bool {
        self.source == other.source
    }
}

impl Eq for CronExpression {}

impl fmt::Debug for CronExpression {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("CronExpression").field(&self.source).finish()
    }
}

impl fmt::Display for CronExpression {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.source)
    }
}

impl Serialize for CronExpression {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.source)
    }
}

impl<'de> Deserialize<'de> for CronExpression {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let source = String::deserialize(deserializer)?;
        source.parse().map_err(serde::de::Error::custom)
    }
}

/// What makes a job due.
#[derive(Debug, Clone, PartialEq)]
pub enum Trigger {
    OneTime { at: DateTime<Utc> },
    Recurring { cron: CronExpression, active: bool },
    Batch { created_at: DateTime<Utc> },
}

impl Trigger {
    /// Computes when the trigger is next due.
    ///
    /// `last_fired` is the last time the trigger produced an execution. One time and batch
    /// triggers only fire once, recurring triggers never fire twice for the same instant and
    /// stop once their schedule is deactivated.
    pub fn next_due_time(
        &self,
        reference: DateTime<Utc>,
        last_fired: Option<DateTime<Utc>>,
    ) -> Option<DateTime<Utc>> {
        match self {
            Self::OneTime { at } => last_fired.is_none().then_some(*at),
            Self::Batch { created_at } => last_fired.is_none().then_some(*created_at),
            Self::Recurring { active: false, .. } => None,
            Self::Recurring { cron, active: true } => {
                let reference = last_fired.map_or(reference, |fired| fired.max(reference));
                cron.next_after(reference)
            }
        }
    }
}
