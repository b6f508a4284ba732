//! Storage contracts for jobs and their execution logs.
//!
//! The store is the only synchronization point of the engine. Every state change is written
//! with [`JobStore::compare_and_swap`], a conditional write keyed by the job id and the version
//! the writer last observed. Dispatchers on several engine instances can therefore share a store
//! without ever running a job twice for the same claim.
//!
//! Implementors can run the conformance suite with [`crate::test_suite`].
use std::collections::BTreeMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use thiserror::Error;

use crate::{
    execution_log::{ExecutionLogEntry, NewLogEntry},
    job::{
        query::{JobQuery, Page, Pagination},
        Job, JobId, JobSchedule, JobStatus, JobType, Priority,
    },
};

pub mod memory;
mod queryable;
#[doc(hidden)]
pub mod testing;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("Job {0} not found")]
    JobNotFound(JobId),
    #[error("Job {0} was modified concurrently")]
    Conflict(JobId),
    #[error("Stored record could not be decoded: {0}")]
    Corrupt(String),
    #[error("System in bad state")]
    BadState,
    #[error("Store unavailable: {0}")]
    Unavailable(#[source] Box<dyn std::error::Error + Send + Sync>),
}

/// A job ready to be inserted, see [`crate::job::builder::JobDescriptor::validate`].
#[derive(Debug, Clone, PartialEq)]
pub struct NewJob {
    pub name: String,
    pub description: Option<String>,
    pub job_type: JobType,
    pub payload: serde_json::Value,
    pub priority: Priority,
    pub max_retries: u16,
    pub scheduled_at: DateTime<Utc>,
    pub schedule: Option<JobSchedule>,
    /// Set on the next firing of a recurring job. At most one job may exist per previous
    /// occurrence, inserting a second one returns the existing job.
    pub previous_occurrence: Option<JobId>,
    pub created_by: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl NewJob {
    pub fn into_job(self, id: JobId) -> Job {
        Job {
            id,
            name: self.name,
            description: self.description,
            job_type: self.job_type,
            status: JobStatus::Scheduled,
            payload: self.payload,
            priority: self.priority,
            max_retries: self.max_retries,
            retry_count: 0,
            scheduled_at: self.scheduled_at,
            schedule: self.schedule,
            started_at: None,
            completed_at: None,
            error_message: None,
            cancel_requested: false,
            execution_token: Default::default(),
            version: 0,
            previous_occurrence: self.previous_occurrence,
            created_by: self.created_by,
            created_at: self.created_at,
            updated_at: self.created_at,
        }
    }
}

/// Job counts per status and per type.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct Statistics {
    pub total: u64,
    pub by_status: BTreeMap<JobStatus, u64>,
    pub by_type: BTreeMap<JobType, u64>,
}

impl Statistics {
    /// Builds statistics from partial counts, every status and type is present in the result.
    pub fn from_counts(
        statuses: impl IntoIterator<Item = (JobStatus, u64)>,
        types: impl IntoIterator<Item = (JobType, u64)>,
    ) -> Self {
        let mut by_status = JobStatus::ALL
            .into_iter()
            .map(|status| (status, 0))
            .collect::<BTreeMap<_, _>>();
        let mut by_type = JobType::ALL
            .into_iter()
            .map(|job_type| (job_type, 0))
            .collect::<BTreeMap<_, _>>();
        for (status, count) in statuses {
            *by_status.entry(status).or_default() += count;
        }
        for (job_type, count) in types {
            *by_type.entry(job_type).or_default() += count;
        }
        Self {
            total: by_status.values().sum(),
            by_status,
            by_type,
        }
    }

    pub fn status(&self, status: JobStatus) -> u64 {
        self.by_status.get(&status).copied().unwrap_or_default()
    }

    pub fn job_type(&self, job_type: JobType) -> u64 {
        self.by_type.get(&job_type).copied().unwrap_or_default()
    }
}

#[async_trait]
pub trait JobStore: Send + Sync {
    /// Inserts a job in [`JobStatus::Scheduled`].
    async fn insert(&self, job: NewJob) -> Result<Job, StoreError>;

    async fn get(&self, id: JobId) -> Result<Option<Job>, StoreError>;

    /// Writes `job` if the stored version still equals `expected_version`.
    ///
    /// On success the stored job, with its version incremented, is returned. Fails with
    /// [`StoreError::Conflict`] when another writer got there first and with
    /// [`StoreError::JobNotFound`] when the job no longer exists.
    async fn compare_and_swap(&self, job: Job, expected_version: u64) -> Result<Job, StoreError>;

    /// Deletes a job and its execution log entries if the stored version still equals
    /// `expected_version`.
    async fn delete(&self, id: JobId, expected_version: u64) -> Result<(), StoreError>;

    /// Jobs in `status` with `scheduled_at <= now`, highest priority first then earliest due.
    async fn due_jobs(
        &self,
        status: JobStatus,
        now: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<Job>, StoreError>;

    /// The earliest due time among scheduled and retrying jobs.
    async fn next_due_at(&self) -> Result<Option<DateTime<Utc>>, StoreError>;

    async fn query(&self, query: &JobQuery) -> Result<Page<Job>, StoreError>;

    async fn statistics(&self) -> Result<Statistics, StoreError>;

    /// Running jobs that started strictly before `started_before`.
    async fn stuck_jobs(&self, started_before: DateTime<Utc>) -> Result<Vec<Job>, StoreError>;

    /// Completed, failed and cancelled jobs that finished strictly before `completed_before`.
    async fn expired_jobs(&self, completed_before: DateTime<Utc>)
        -> Result<Vec<Job>, StoreError>;
}

#[async_trait]
pub trait LogStore: Send + Sync {
    /// Fails with [`StoreError::JobNotFound`] when the job does not exist.
    async fn append(&self, entry: NewLogEntry) -> Result<ExecutionLogEntry, StoreError>;

    /// A page of the job's entries in creation order.
    async fn logs(
        &self,
        job_id: JobId,
        pagination: Pagination,
    ) -> Result<Page<ExecutionLogEntry>, StoreError>;
}

/// A store holding both jobs and execution logs.
pub trait Backend: JobStore + LogStore + Clone + 'static {}

impl<T> Backend for T where T: JobStore + LogStore + Clone + 'static {}
