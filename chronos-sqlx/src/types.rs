use chrono::{DateTime, Utc};
use chronos::{
    backend::StoreError,
    execution_log::ExecutionLogEntry,
    job::{ExecutionToken, JobSchedule, Priority},
    trigger::CronExpression,
};
use sqlx::prelude::FromRow;

#[derive(sqlx::Type, Debug, Clone, Copy, PartialEq, Eq)]
#[sqlx(type_name = "chronos_job_status", rename_all = "lowercase")]
pub(crate) enum JobStatus {
    Scheduled,
    Running,
    Completed,
    Failed,
    Cancelled,
    Retrying,
}

impl From<JobStatus> for chronos::job::JobStatus {
    fn from(value: JobStatus) -> Self {
        match value {
            JobStatus::Scheduled => Self::Scheduled,
            JobStatus::Running => Self::Running,
            JobStatus::Completed => Self::Completed,
            JobStatus::Failed => Self::Failed,
            JobStatus::Cancelled => Self::Cancelled,
            JobStatus::Retrying => Self::Retrying,
        }
    }
}

impl From<chronos::job::JobStatus> for JobStatus {
    fn from(value: chronos::job::JobStatus) -> Self {
        match value {
            chronos::job::JobStatus::Scheduled => Self::Scheduled,
            chronos::job::JobStatus::Running => Self::Running,
            chronos::job::JobStatus::Completed => Self::Completed,
            chronos::job::JobStatus::Failed => Self::Failed,
            chronos::job::JobStatus::Cancelled => Self::Cancelled,
            chronos::job::JobStatus::Retrying => Self::Retrying,
        }
    }
}

#[derive(sqlx::Type, Debug, Clone, Copy, PartialEq, Eq)]
#[sqlx(type_name = "chronos_job_type", rename_all = "snake_case")]
pub(crate) enum JobType {
    OneTime,
    Recurring,
    Batch,
}

impl From<JobType> for chronos::job::JobType {
    fn from(value: JobType) -> Self {
        match value {
            JobType::OneTime => Self::OneTime,
            JobType::Recurring => Self::Recurring,
            JobType::Batch => Self::Batch,
        }
    }
}

impl From<chronos::job::JobType> for JobType {
    fn from(value: chronos::job::JobType) -> Self {
        match value {
            chronos::job::JobType::OneTime => Self::OneTime,
            chronos::job::JobType::Recurring => Self::Recurring,
            chronos::job::JobType::Batch => Self::Batch,
        }
    }
}

#[derive(sqlx::Type, Debug, Clone, Copy, PartialEq, Eq)]
#[sqlx(type_name = "chronos_log_level", rename_all = "lowercase")]
pub(crate) enum LogLevel {
    Debug,
    Info,
    Warn,
    Error,
}

impl From<LogLevel> for chronos::execution_log::LogLevel {
    fn from(value: LogLevel) -> Self {
        match value {
            LogLevel::Debug => Self::Debug,
            LogLevel::Info => Self::Info,
            LogLevel::Warn => Self::Warn,
            LogLevel::Error => Self::Error,
        }
    }
}

impl From<chronos::execution_log::LogLevel> for LogLevel {
    fn from(value: chronos::execution_log::LogLevel) -> Self {
        match value {
            chronos::execution_log::LogLevel::Debug => Self::Debug,
            chronos::execution_log::LogLevel::Info => Self::Info,
            chronos::execution_log::LogLevel::Warn => Self::Warn,
            chronos::execution_log::LogLevel::Error => Self::Error,
        }
    }
}

#[derive(Debug, FromRow)]
pub(crate) struct Job {
    pub id: i64,
    pub name: String,
    pub description: Option<String>,
    pub job_type: JobType,
    pub status: JobStatus,
    pub payload: serde_json::Value,
    pub priority: i16,
    pub max_retries: i32,
    pub retry_count: i32,
    pub scheduled_at: DateTime<Utc>,
    pub cron_expression: Option<String>,
    pub schedule_active: Option<bool>,
    pub next_execution: Option<DateTime<Utc>>,
    pub last_execution: Option<DateTime<Utc>>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub error_message: Option<String>,
    pub cancel_requested: bool,
    pub execution_token: i64,
    pub version: i64,
    pub previous_occurrence: Option<i64>,
    pub created_by: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

fn corrupt(id: i64, column: &str, value: impl std::fmt::Display) -> StoreError {
    StoreError::Corrupt(format!("job {id} has an invalid {column}: {value}"))
}

fn unsigned<T: TryFrom<i64>>(id: i64, column: &str, value: i64) -> Result<T, StoreError> {
    T::try_from(value).map_err(|_| corrupt(id, column, value))
}

impl TryFrom<Job> for chronos::job::Job {
    type Error = StoreError;

    fn try_from(value: Job) -> Result<Self, Self::Error> {
        let id = value.id;
        let priority = u8::try_from(value.priority)
            .ok()
            .and_then(|priority| Priority::try_from(priority).ok())
            .ok_or_else(|| corrupt(id, "priority", value.priority))?;
        let schedule = match value.cron_expression {
            Some(expression) => Some(JobSchedule {
                cron: expression
                    .parse::<CronExpression>()
                    .map_err(|err| corrupt(id, "cron expression", err))?,
                is_active: value.schedule_active.unwrap_or_default(),
                next_execution: value.next_execution,
                last_execution: value.last_execution,
            }),
            None => None,
        };
        Ok(Self {
            id: id.into(),
            name: value.name,
            description: value.description,
            job_type: value.job_type.into(),
            status: value.status.into(),
            payload: value.payload,
            priority,
            max_retries: unsigned(id, "max retries", value.max_retries.into())?,
            retry_count: unsigned(id, "retry count", value.retry_count.into())?,
            scheduled_at: value.scheduled_at,
            schedule,
            started_at: value.started_at,
            completed_at: value.completed_at,
            error_message: value.error_message,
            cancel_requested: value.cancel_requested,
            execution_token: ExecutionToken::from(unsigned::<u64>(
                id,
                "execution token",
                value.execution_token,
            )?),
            version: unsigned(id, "version", value.version)?,
            previous_occurrence: value.previous_occurrence.map(Into::into),
            created_by: value.created_by,
            created_at: value.created_at,
            updated_at: value.updated_at,
        })
    }
}

#[derive(Debug, FromRow)]
pub(crate) struct LogEntry {
    pub id: i64,
    pub job_id: i64,
    pub level: LogLevel,
    pub message: String,
    pub details: Option<serde_json::Value>,
    pub slot: Option<String>,
    pub duration_ms: Option<i64>,
    pub created_at: DateTime<Utc>,
}

impl From<LogEntry> for ExecutionLogEntry {
    fn from(value: LogEntry) -> Self {
        Self {
            id: value.id,
            job_id: value.job_id.into(),
            level: value.level.into(),
            message: value.message,
            details: value.details,
            slot: value.slot,
            duration_ms: value.duration_ms,
            created_at: value.created_at,
        }
    }
}
