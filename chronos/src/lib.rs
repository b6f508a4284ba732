//! A job scheduling and execution engine.
//!
//! Jobs are submitted as [`JobDescriptor`]s, persisted in a [`Backend`] and executed by the
//! [`Executor`] registered under the job's name once they become due. Failed executions are
//! retried with backoff until the job's retry budget is used up, recurring jobs are rescheduled
//! from their cron expression and jobs abandoned by a dead engine instance can be recovered
//! through [`Chronos::admin`].
//!
//! # Example
//!
//! ```no_run
//! use chronos::{backend::memory::InMemoryBackend, prelude::*};
//! use async_trait::async_trait;
//!
//! struct SendReport;
//!
//! #[async_trait]
//! impl Executor for SendReport {
//!     type Payload = String;
//!     const NAME: &'static str = "send_report";
//!
//!     async fn execute(&self, context: ExecutionContext<Self::Payload>) -> ExecutionResult {
//!         context.log(LogLevel::Info, format!("Sending report to {}", context.payload)).await;
//!         ExecutionResult::Done
//!     }
//! }
//!
//! # async fn run() -> Result<(), ChronosError> {
//! let chronos = Chronos::new(InMemoryBackend::new())
//!     .with_executor(SendReport)
//!     .start();
//!
//! let job = chronos
//!     .submit(
//!         JobDescriptor::recurring(SendReport::NAME, "0 0 9 * * ?")
//!             .with_payload(serde_json::json!("ops@example.com")),
//!     )
//!     .await?;
//!
//! chronos.cancel(job.id).await?;
//! chronos.graceful_shutdown().await?;
//! # Ok(())
//! # }
//! ```
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::json;
use thiserror::Error;
use tokio::{sync::Notify, task::JoinHandle};
use tokio_util::{sync::CancellationToken, task::TaskTracker};

pub mod admin;
pub mod backend;
pub mod backoff;
pub mod config;
mod dispatcher;
pub mod execution_log;
pub mod executor;
pub mod job;
pub mod notifier;
pub mod prelude;
pub mod retry;
pub mod sweeper;
pub mod trigger;

use admin::Admin;
use backend::{Backend, Statistics, StoreError};
use config::EngineConfig;
use dispatcher::Dispatcher;
use execution_log::{ExecutionLogEntry, LogLevel, NewLogEntry};
use executor::{Executor, ExecutorRegistry};
use job::{
    builder::{JobDescriptor, JobUpdate, ValidationError},
    query::{JobQuery, Page, Pagination},
    InvalidTransition, Job, JobId, JobStatus, JobType,
};
use notifier::{JobEvent, Notifier, TracingNotifier};
use sweeper::runner::SweeperRunner;

const MAX_CONFLICT_RETRIES: usize = 5;

/// The engine handle.
///
/// Built with [`Chronos::new`] and the `with_*` methods, background work starts with
/// [`Chronos::start`]. The inbound operations work whether or not the engine was started, an
/// engine that is never started can be used to manage jobs run by other instances sharing the
/// same backend.
pub struct Chronos<B: Backend> {
    backend: B,
    config: EngineConfig,
    executors: ExecutorRegistry,
    notifier: Arc<dyn Notifier>,
    wake: Arc<Notify>,
    cancellation_token: CancellationToken,
    tracker: TaskTracker,
    handles: Vec<JoinHandle<()>>,
}

impl<B> Default for Chronos<B>
where
    B: Backend + Default,
{
    fn default() -> Self {
        Self::new(Default::default())
    }
}

/// A job together with a page of its execution log.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct JobDetails {
    pub job: Job,
    pub logs: Option<Page<ExecutionLogEntry>>,
}

impl<B> Chronos<B>
where
    B: Backend,
{
    pub fn new(backend: B) -> Self {
        Self {
            backend,
            config: Default::default(),
            executors: Default::default(),
            notifier: Arc::new(TracingNotifier),
            wake: Arc::new(Notify::new()),
            cancellation_token: Default::default(),
            tracker: TaskTracker::new(),
            handles: Default::default(),
        }
    }

    pub fn with_config(self, config: EngineConfig) -> Self {
        Self { config, ..self }
    }

    /// Registers `executor` for jobs named [`Executor::NAME`].
    pub fn with_executor<E: Executor>(mut self, executor: E) -> Self {
        self.executors.register(executor);
        self
    }

    /// Registers `executor` for jobs of `job_type` that have no executor of their own name.
    pub fn with_fallback_executor<E: Executor>(mut self, job_type: JobType, executor: E) -> Self {
        self.executors.register_fallback(job_type, executor);
        self
    }

    /// Replaces the default [`TracingNotifier`].
    pub fn with_notifier(self, notifier: impl Notifier + 'static) -> Self {
        Self {
            notifier: Arc::new(notifier),
            ..self
        }
    }

    /// Spawns the dispatcher, and the sweeper when one is configured.
    ///
    /// Executors registered afterwards are not picked up by the running dispatcher.
    pub fn start(mut self) -> Self {
        if !self.handles.is_empty() {
            tracing::warn!("Chronos is already running");
            return self;
        }
        tracing::debug!(
            max_concurrency = self.config.max_concurrency,
            "Starting Chronos with {} runner slots",
            self.config.max_concurrency
        );
        let dispatcher = Dispatcher::new(
            self.backend.clone(),
            &self.config,
            Arc::new(self.executors.clone()),
            self.notifier.clone(),
            self.wake.clone(),
            self.tracker.clone(),
            self.cancellation_token.clone(),
        );
        self.handles
            .push(dispatcher.spawn(self.cancellation_token.clone()));

        if let Some(sweeper) = self.config.sweeper.clone() {
            self.handles.push(
                SweeperRunner::new(self.admin(), sweeper).spawn(self.cancellation_token.clone()),
            );
        }
        self
    }

    /// Validates and persists a new job, it becomes eligible for dispatch once due.
    #[tracing::instrument(skip_all, fields(name = %descriptor.name()))]
    pub async fn submit(&self, descriptor: JobDescriptor) -> Result<Job, ChronosError> {
        let job = self.backend.insert(descriptor.validate(Utc::now())?).await?;
        tracing::info!(
            job_id = %job.id,
            job_type = %job.job_type,
            scheduled_at = %job.scheduled_at,
            "Submitted job {}",
            job.id
        );
        self.log(
            NewLogEntry::new(job.id, LogLevel::Info, "Job submitted").with_details(json!({
                "job_type": job.job_type,
                "scheduled_at": job.scheduled_at,
                "priority": job.priority,
            })),
        )
        .await;
        self.wake.notify_one();
        Ok(job)
    }

    /// The job, with a page of its execution log when `logs` is set.
    pub async fn get(
        &self,
        id: JobId,
        logs: Option<Pagination>,
    ) -> Result<JobDetails, ChronosError> {
        let job = self.find(id).await?;
        let logs = match logs {
            Some(pagination) => Some(self.backend.logs(id, pagination).await?),
            None => None,
        };
        Ok(JobDetails { job, logs })
    }

    pub async fn list(&self, query: &JobQuery) -> Result<Page<Job>, ChronosError> {
        Ok(self.backend.query(query).await?)
    }

    /// Edits the descriptive fields of a job that is not running.
    pub async fn update(&self, id: JobId, update: JobUpdate) -> Result<Job, ChronosError> {
        self.transition(id, |job, now| {
            if job.status == JobStatus::Running {
                return Err(ChronosError::JobRunning(id));
            }
            Ok(update.apply(job, now)?)
        })
        .await
    }

    /// Cancels a job.
    ///
    /// Scheduled and retrying jobs are cancelled immediately. For a running job the request is
    /// recorded and the job becomes [`JobStatus::Cancelled`] once its executor stops.
    #[tracing::instrument(skip(self))]
    pub async fn cancel(&self, id: JobId) -> Result<Job, ChronosError> {
        let job = self
            .transition(id, |job, now| {
                job.cancel(now)
                    .map_err(|err| ChronosError::InvalidTransition(id, err))
            })
            .await?;
        if job.status == JobStatus::Cancelled {
            tracing::info!(job_id = %id, "Cancelled job {id}");
            self.log(NewLogEntry::new(id, LogLevel::Warn, "Job cancelled"))
                .await;
            self.notifier.notify(JobEvent::from(&job)).await;
        } else {
            tracing::info!(job_id = %id, "Requested cancellation of running job {id}");
            self.log(NewLogEntry::new(
                id,
                LogLevel::Info,
                "Cancellation requested while running",
            ))
            .await;
        }
        Ok(job)
    }

    /// Deletes a job and its execution log.
    ///
    /// A running job can only be deleted once its cancellation was requested.
    #[tracing::instrument(skip(self))]
    pub async fn delete(&self, id: JobId) -> Result<(), ChronosError> {
        for _ in 0..MAX_CONFLICT_RETRIES {
            let job = self.find(id).await?;
            if job.status == JobStatus::Running && !job.cancel_requested {
                return Err(ChronosError::JobRunning(id));
            }
            match self.backend.delete(id, job.version).await {
                Ok(()) => {
                    tracing::info!(job_id = %id, "Deleted job {id}");
                    return Ok(());
                }
                Err(StoreError::Conflict(_)) => continue,
                Err(StoreError::JobNotFound(_)) => return Err(ChronosError::JobNotFound(id)),
                Err(err) => return Err(err.into()),
            }
        }
        Err(StoreError::Conflict(id).into())
    }

    pub async fn statistics(&self) -> Result<Statistics, ChronosError> {
        Ok(self.backend.statistics().await?)
    }

    /// A page of the job's execution log, oldest entry first.
    pub async fn logs(
        &self,
        id: JobId,
        pagination: Pagination,
    ) -> Result<Page<ExecutionLogEntry>, ChronosError> {
        self.find(id).await?;
        Ok(self.backend.logs(id, pagination).await?)
    }

    /// Stuck job recovery and retention.
    pub fn admin(&self) -> Admin<B> {
        Admin::new(self.backend.clone(), self.wake.clone())
    }

    /// Stops dispatching and waits for the jobs already running to be recorded.
    ///
    /// Running executors observe the shutdown through [`executor::ExecutionContext::cancelled`]. A job
    /// that stops because of it is rescheduled instead of cancelled.
    pub async fn graceful_shutdown(self) -> Result<(), ChronosError> {
        tracing::debug!("Shutting down Chronos tasks");
        self.cancellation_token.cancel();
        let results = futures::future::join_all(self.handles).await;
        self.tracker.close();
        self.tracker.wait().await;
        results
            .into_iter()
            .collect::<Result<Vec<_>, _>>()
            .map_err(|err| {
                tracing::error!(?err, "Chronos task failed: {err}");
                ChronosError::GracefulShutdownFailed
            })?;
        Ok(())
    }

    async fn find(&self, id: JobId) -> Result<Job, ChronosError> {
        self.backend
            .get(id)
            .await?
            .ok_or(ChronosError::JobNotFound(id))
    }

    /// Read, modify and conditionally write a job, retrying when a concurrent write won.
    async fn transition(
        &self,
        id: JobId,
        mut change: impl FnMut(&mut Job, DateTime<Utc>) -> Result<(), ChronosError>,
    ) -> Result<Job, ChronosError> {
        for _ in 0..MAX_CONFLICT_RETRIES {
            let mut job = self.find(id).await?;
            let version = job.version;
            change(&mut job, Utc::now())?;
            match self.backend.compare_and_swap(job, version).await {
                Ok(job) => return Ok(job),
                Err(StoreError::Conflict(_)) => {
                    tracing::debug!(job_id = %id, "Job {id} was modified concurrently, retrying");
                }
                Err(StoreError::JobNotFound(_)) => return Err(ChronosError::JobNotFound(id)),
                Err(err) => return Err(err.into()),
            }
        }
        Err(StoreError::Conflict(id).into())
    }

    async fn log(&self, entry: NewLogEntry) {
        let job_id = entry.job_id;
        if let Err(err) = self.backend.append(entry).await {
            tracing::error!(?err, %job_id, "Failed to append log entry for job {job_id}: {err}");
        }
    }
}

#[derive(Debug, Error)]
pub enum ChronosError {
    #[error(transparent)]
    Validation(#[from] ValidationError),
    #[error("Error communicating with the store: {0}")]
    Store(#[from] StoreError),
    #[error("Job {0} not found")]
    JobNotFound(JobId),
    #[error("Invalid transition of job {0}: {1}")]
    InvalidTransition(JobId, #[source] InvalidTransition),
    #[error("Job {0} is running, request its cancellation first")]
    JobRunning(JobId),
    #[error("Failed to gracefully shut down")]
    GracefulShutdownFailed,
}
