//! Jobs, their identifiers and the transitions between job states.
use std::fmt::Display;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::{
    backend::NewJob,
    job::builder::ValidationError,
    trigger::{CronExpression, Trigger},
};

pub mod builder;
pub mod query;
pub(crate) mod runner;

#[derive(Debug, Eq, PartialEq, Ord, PartialOrd, Hash, Clone, Copy, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JobId(i64);

impl From<i64> for JobId {
    fn from(value: i64) -> Self {
        Self(value)
    }
}

impl From<JobId> for i64 {
    fn from(value: JobId) -> Self {
        value.0
    }
}

impl Display for JobId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "JobId({})", self.0)
    }
}

/// Fencing token identifying a single claim of a job.
///
/// Every time the dispatcher claims a job the token is incremented. Outcomes reported with an
/// older token are discarded, which protects a job that was reset by the stuck job monitor from
/// late writes of the abandoned execution.
#[derive(
    Debug, Default, Eq, PartialEq, Ord, PartialOrd, Hash, Clone, Copy, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct ExecutionToken(u64);

impl ExecutionToken {
    fn next(self) -> Self {
        Self(self.0 + 1)
    }
}

impl From<u64> for ExecutionToken {
    fn from(value: u64) -> Self {
        Self(value)
    }
}

impl From<ExecutionToken> for u64 {
    fn from(value: ExecutionToken) -> Self {
        value.0
    }
}

impl Display for ExecutionToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, Eq, PartialEq, Ord, PartialOrd, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum JobStatus {
    Scheduled,
    Running,
    Completed,
    Failed,
    Cancelled,
    Retrying,
}

impl JobStatus {
    pub const ALL: [JobStatus; 6] = [
        Self::Scheduled,
        Self::Running,
        Self::Completed,
        Self::Failed,
        Self::Cancelled,
        Self::Retrying,
    ];

    /// Terminal states are never left again.
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }

    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Scheduled => "SCHEDULED",
            Self::Running => "RUNNING",
            Self::Completed => "COMPLETED",
            Self::Failed => "FAILED",
            Self::Cancelled => "CANCELLED",
            Self::Retrying => "RETRYING",
        }
    }
}

impl Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, Eq, PartialEq, Ord, PartialOrd, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum JobType {
    /// Runs once at a fixed future instant.
    OneTime,
    /// Fires on a cron schedule, each firing is its own job record.
    Recurring,
    /// Eligible immediately after submission.
    Batch,
}

impl JobType {
    pub const ALL: [JobType; 3] = [Self::OneTime, Self::Recurring, Self::Batch];

    pub const fn as_str(self) -> &'static str {
        match self {
            Self::OneTime => "ONE_TIME",
            Self::Recurring => "RECURRING",
            Self::Batch => "BATCH",
        }
    }
}

impl Display for JobType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Dispatch priority, higher values are claimed first.
#[derive(
    Debug, Default, Clone, Copy, Eq, PartialEq, Ord, PartialOrd, Hash, Serialize, Deserialize,
)]
#[serde(try_from = "u8", into = "u8")]
pub struct Priority(u8);

impl Priority {
    pub const LOW: Self = Self(0);
    pub const NORMAL: Self = Self(1);
    pub const HIGH: Self = Self(2);
    pub const CRITICAL: Self = Self(3);

    pub const fn value(self) -> u8 {
        self.0
    }
}

impl TryFrom<u8> for Priority {
    type Error = ValidationError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        if value <= Self::CRITICAL.0 {
            Ok(Self(value))
        } else {
            Err(ValidationError::InvalidPriority(value))
        }
    }
}

impl From<Priority> for u8 {
    fn from(value: Priority) -> Self {
        value.0
    }
}

impl Display for Priority {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// The cron schedule owned by a recurring job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobSchedule {
    pub cron: CronExpression,
    pub is_active: bool,
    pub next_execution: Option<DateTime<Utc>>,
    pub last_execution: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Job {
    pub id: JobId,
    pub name: String,
    pub description: Option<String>,
    pub job_type: JobType,
    pub status: JobStatus,
    pub payload: serde_json::Value,
    pub priority: Priority,
    pub max_retries: u16,
    pub retry_count: u16,
    /// The instant at which the job next becomes due.
    pub scheduled_at: DateTime<Utc>,
    pub schedule: Option<JobSchedule>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub error_message: Option<String>,
    pub cancel_requested: bool,
    pub execution_token: ExecutionToken,
    /// Incremented by the store on every write, used for conditional updates.
    pub version: u64,
    pub previous_occurrence: Option<JobId>,
    pub created_by: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// A transition that is not allowed from the job's current state.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
#[error("cannot {action} a job that is {from}")]
pub struct InvalidTransition {
    pub from: JobStatus,
    pub action: &'static str,
}

impl Job {
    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    fn expect_status(
        &self,
        allowed: &[JobStatus],
        action: &'static str,
    ) -> Result<(), InvalidTransition> {
        if allowed.contains(&self.status) {
            Ok(())
        } else {
            Err(InvalidTransition {
                from: self.status,
                action,
            })
        }
    }

    pub(crate) fn claim(&mut self, now: DateTime<Utc>) -> Result<(), InvalidTransition> {
        self.expect_status(&[JobStatus::Scheduled], "claim")?;
        self.status = JobStatus::Running;
        self.started_at = Some(now);
        self.execution_token = self.execution_token.next();
        if let Some(schedule) = self.schedule.as_mut() {
            schedule.last_execution = Some(now);
        }
        self.updated_at = now;
        Ok(())
    }

    pub(crate) fn complete(&mut self, now: DateTime<Utc>) -> Result<(), InvalidTransition> {
        self.expect_status(&[JobStatus::Running], "complete")?;
        self.status = JobStatus::Completed;
        self.completed_at = Some(now);
        self.error_message = None;
        self.deactivate_schedule();
        self.updated_at = now;
        Ok(())
    }

    pub(crate) fn retry(
        &mut self,
        retry_count: u16,
        due_at: DateTime<Utc>,
        error: &str,
        now: DateTime<Utc>,
    ) -> Result<(), InvalidTransition> {
        self.expect_status(&[JobStatus::Running], "retry")?;
        self.status = JobStatus::Retrying;
        self.retry_count = retry_count.max(self.retry_count);
        self.scheduled_at = due_at;
        self.error_message = Some(error.to_owned());
        self.updated_at = now;
        Ok(())
    }

    /// Moves a job whose backoff has elapsed back into the dispatch pool.
    pub(crate) fn requeue(&mut self, now: DateTime<Utc>) -> Result<(), InvalidTransition> {
        self.expect_status(&[JobStatus::Retrying], "requeue")?;
        self.status = JobStatus::Scheduled;
        self.scheduled_at = self.scheduled_at.max(now);
        self.updated_at = now;
        Ok(())
    }

    pub(crate) fn fail(&mut self, error: &str, now: DateTime<Utc>) -> Result<(), InvalidTransition> {
        self.expect_status(&[JobStatus::Running], "fail")?;
        self.status = JobStatus::Failed;
        self.error_message = Some(error.to_owned());
        self.completed_at = Some(now);
        self.deactivate_schedule();
        self.updated_at = now;
        Ok(())
    }

    /// Cancels a job that has not started yet, or records the request for a running job.
    ///
    /// Running jobs are cancelled cooperatively: the flag is observed by the runner slot which
    /// signals the executor, the job only becomes [`JobStatus::Cancelled`] once the executor
    /// acknowledges it.
    pub(crate) fn cancel(&mut self, now: DateTime<Utc>) -> Result<(), InvalidTransition> {
        self.expect_status(
            &[JobStatus::Scheduled, JobStatus::Retrying, JobStatus::Running],
            "cancel",
        )?;
        if self.status == JobStatus::Running {
            self.cancel_requested = true;
        } else {
            self.status = JobStatus::Cancelled;
            self.completed_at = Some(now);
            self.deactivate_schedule();
        }
        self.updated_at = now;
        Ok(())
    }

    pub(crate) fn acknowledge_cancel(
        &mut self,
        reason: &str,
        now: DateTime<Utc>,
    ) -> Result<(), InvalidTransition> {
        self.expect_status(&[JobStatus::Running], "acknowledge cancellation of")?;
        self.status = JobStatus::Cancelled;
        self.error_message = Some(reason.to_owned());
        self.completed_at = Some(now);
        self.deactivate_schedule();
        self.updated_at = now;
        Ok(())
    }

    /// Returns a job abandoned in [`JobStatus::Running`] to the dispatch pool.
    ///
    /// The retry count is left untouched.
    pub(crate) fn reset_stuck(&mut self, now: DateTime<Utc>) -> Result<(), InvalidTransition> {
        self.expect_status(&[JobStatus::Running], "reset")?;
        self.status = JobStatus::Scheduled;
        self.scheduled_at = now;
        self.started_at = None;
        self.updated_at = now;
        Ok(())
    }

    pub(crate) fn deactivate_schedule(&mut self) {
        if let Some(schedule) = self.schedule.as_mut() {
            schedule.is_active = false;
            schedule.next_execution = None;
        }
    }

    /// The record for the next firing of a recurring job, if there is one.
    pub(crate) fn next_occurrence(&self, now: DateTime<Utc>) -> Option<NewJob> {
        let schedule = self.schedule.as_ref().filter(|schedule| schedule.is_active)?;
        let trigger = Trigger::Recurring {
            cron: schedule.cron.clone(),
            active: true,
        };
        let scheduled_at = trigger.next_due_time(now, schedule.last_execution)?;
        Some(NewJob {
            name: self.name.clone(),
            description: self.description.clone(),
            job_type: self.job_type,
            payload: self.payload.clone(),
            priority: self.priority,
            max_retries: self.max_retries,
            scheduled_at,
            schedule: Some(JobSchedule {
                cron: schedule.cron.clone(),
                is_active: true,
                next_execution: Some(scheduled_at),
                last_execution: schedule.last_execution,
            }),
            previous_occurrence: Some(self.id),
            created_by: self.created_by.clone(),
            created_at: now,
        })
    }
}
