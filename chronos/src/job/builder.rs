//! Job submission and job edits.
use chrono::{DateTime, Utc};
use thiserror::Error;

use crate::{
    backend::NewJob,
    trigger::{CronExpression, InvalidCronExpression, Trigger},
};

use super::{Job, JobSchedule, JobType, Priority};

pub const DEFAULT_MAX_RETRIES: u16 = 3;
pub const MAX_RETRIES_LIMIT: u16 = 10;

/// Reasons a job submission or edit is rejected.
///
/// Nothing is persisted when validation fails.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ValidationError {
    #[error("job name must not be blank")]
    MissingName,
    #[error("one time jobs must be scheduled in the future, got {scheduled_at}")]
    NotInFuture { scheduled_at: DateTime<Utc> },
    #[error(transparent)]
    InvalidCron(#[from] InvalidCronExpression),
    #[error("max retries must be between 0 and 10, got {0}")]
    MaxRetriesOutOfRange(u16),
    #[error("max retries {max_retries} is below the current retry count {retry_count}")]
    MaxRetriesBelowRetryCount { max_retries: u16, retry_count: u16 },
    #[error("priority must be between 0 and 3, got {0}")]
    InvalidPriority(u8),
}

fn validate_name(name: &str) -> Result<String, ValidationError> {
    let name = name.trim();
    if name.is_empty() {
        Err(ValidationError::MissingName)
    } else {
        Ok(name.to_owned())
    }
}

fn validate_max_retries(max_retries: u16) -> Result<u16, ValidationError> {
    if max_retries > MAX_RETRIES_LIMIT {
        Err(ValidationError::MaxRetriesOutOfRange(max_retries))
    } else {
        Ok(max_retries)
    }
}

#[derive(Debug, Clone)]
enum TriggerSpec {
    OneTime(DateTime<Utc>),
    Recurring(String),
    Batch,
}

/// Describes a job to submit.
///
/// # Example
///
/// ```
/// # use chronos::prelude::*;
/// let descriptor = JobDescriptor::recurring("nightly_report", "0 0 2 * * ?")
///     .with_description("Builds the nightly report")
///     .with_priority(Priority::HIGH)
///     .with_max_retries(5)
///     .with_payload(serde_json::json!({ "recipients": ["ops@example.com"] }));
///
/// let job = descriptor.validate(chrono::Utc::now()).unwrap();
/// assert_eq!(job.job_type, JobType::Recurring);
/// ```
#[derive(Debug, Clone)]
pub struct JobDescriptor {
    name: String,
    description: Option<String>,
    trigger: TriggerSpec,
    payload: serde_json::Value,
    priority: Priority,
    max_retries: u16,
    created_by: Option<String>,
}

impl JobDescriptor {
    fn new(name: impl Into<String>, trigger: TriggerSpec) -> Self {
        Self {
            name: name.into(),
            description: None,
            trigger,
            payload: serde_json::Value::Null,
            priority: Priority::default(),
            max_retries: DEFAULT_MAX_RETRIES,
            created_by: None,
        }
    }

    /// A job that runs once at `scheduled_at`, which must be in the future.
    pub fn one_time(name: impl Into<String>, scheduled_at: DateTime<Utc>) -> Self {
        Self::new(name, TriggerSpec::OneTime(scheduled_at))
    }

    /// A job that fires on every occurrence of a six field cron expression.
    pub fn recurring(name: impl Into<String>, cron_expression: impl Into<String>) -> Self {
        Self::new(name, TriggerSpec::Recurring(cron_expression.into()))
    }

    /// A job that is due as soon as it is submitted.
    pub fn batch(name: impl Into<String>) -> Self {
        Self::new(name, TriggerSpec::Batch)
    }

    pub fn with_description(self, description: impl Into<String>) -> Self {
        Self {
            description: Some(description.into()),
            ..self
        }
    }

    pub fn with_payload(self, payload: serde_json::Value) -> Self {
        Self { payload, ..self }
    }

    pub fn with_priority(self, priority: Priority) -> Self {
        Self { priority, ..self }
    }

    pub fn with_max_retries(self, max_retries: u16) -> Self {
        Self {
            max_retries,
            ..self
        }
    }

    pub fn created_by(self, created_by: impl Into<String>) -> Self {
        Self {
            created_by: Some(created_by.into()),
            ..self
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn job_type(&self) -> JobType {
        match self.trigger {
            TriggerSpec::OneTime(_) => JobType::OneTime,
            TriggerSpec::Recurring(_) => JobType::Recurring,
            TriggerSpec::Batch => JobType::Batch,
        }
    }

    /// Validates the descriptor and resolves its first due time.
    pub fn validate(self, now: DateTime<Utc>) -> Result<NewJob, ValidationError> {
        let name = validate_name(&self.name)?;
        let max_retries = validate_max_retries(self.max_retries)?;
        let job_type = self.job_type();
        let trigger = match self.trigger {
            TriggerSpec::OneTime(at) if at <= now => {
                return Err(ValidationError::NotInFuture { scheduled_at: at })
            }
            TriggerSpec::OneTime(at) => Trigger::OneTime { at },
            TriggerSpec::Recurring(expression) => Trigger::Recurring {
                cron: expression.parse::<CronExpression>()?,
                active: true,
            },
            TriggerSpec::Batch => Trigger::Batch { created_at: now },
        };
        let scheduled_at = match (trigger.next_due_time(now, None), &trigger) {
            (Some(scheduled_at), _) => scheduled_at,
            (None, trigger) => {
                let expression = match trigger {
                    Trigger::Recurring { cron, .. } => cron.to_string(),
                    _ => String::new(),
                };
                return Err(InvalidCronExpression {
                    expression,
                    reason: "no future occurrence".to_owned(),
                }
                .into());
            }
        };
        let schedule = match trigger {
            Trigger::Recurring { cron, .. } => Some(JobSchedule {
                cron,
                is_active: true,
                next_execution: Some(scheduled_at),
                last_execution: None,
            }),
            Trigger::OneTime { .. } | Trigger::Batch { .. } => None,
        };

        Ok(NewJob {
            name,
            description: self.description,
            job_type,
            payload: self.payload,
            priority: self.priority,
            max_retries,
            scheduled_at,
            schedule,
            previous_occurrence: None,
            created_by: self.created_by,
            created_at: now,
        })
    }
}

/// Edits to the descriptive fields of an existing job.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct JobUpdate {
    pub name: Option<String>,
    pub description: Option<String>,
    pub payload: Option<serde_json::Value>,
    pub priority: Option<Priority>,
    pub max_retries: Option<u16>,
}

impl JobUpdate {
    pub fn with_name(self, name: impl Into<String>) -> Self {
        Self {
            name: Some(name.into()),
            ..self
        }
    }

    pub fn with_description(self, description: impl Into<String>) -> Self {
        Self {
            description: Some(description.into()),
            ..self
        }
    }

    pub fn with_payload(self, payload: serde_json::Value) -> Self {
        Self {
            payload: Some(payload),
            ..self
        }
    }

    pub fn with_priority(self, priority: Priority) -> Self {
        Self {
            priority: Some(priority),
            ..self
        }
    }

    pub fn with_max_retries(self, max_retries: u16) -> Self {
        Self {
            max_retries: Some(max_retries),
            ..self
        }
    }

    pub(crate) fn apply(&self, job: &mut Job, now: DateTime<Utc>) -> Result<(), ValidationError> {
        if let Some(name) = &self.name {
            job.name = validate_name(name)?;
        }
        if let Some(max_retries) = self.max_retries {
            let max_retries = validate_max_retries(max_retries)?;
            if max_retries < job.retry_count {
                return Err(ValidationError::MaxRetriesBelowRetryCount {
                    max_retries,
                    retry_count: job.retry_count,
                });
            }
            job.max_retries = max_retries;
        }
        if let Some(description) = &self.description {
            job.description = Some(description.clone());
        }
        if let Some(payload) = &self.payload {
            job.payload = payload.clone();
        }
        if let Some(priority) = self.priority {
            job.priority = priority;
        }
        job.updated_at = now;
        Ok(())
    }
}
