use std::{future::Future, sync::Arc, time::Duration};

use chrono::{DateTime, TimeDelta, Utc};
use serde_json::json;
use tokio::{task::JoinHandle, time::MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{instrument, Instrument};

use crate::{
    backend::{Backend, NewJob, StoreError},
    backoff::{BackoffStrategy, Strategy},
    config::EngineConfig,
    dispatcher::Slot,
    execution_log::{LogLevel, LogReporter},
    executor::{ContextHandle, DynExecutor, ExecutionResult, Failure},
    notifier::{JobEvent, Notifier},
    retry::RetryDecision,
};

use super::{ExecutionToken, InvalidTransition, Job, JobId, JobStatus};

const STORE_RETRY_BACKOFF: BackoffStrategy =
    BackoffStrategy::exponential(TimeDelta::milliseconds(50)).with_max(TimeDelta::seconds(5));

/// How an execution ended, before it is recorded on the job.
#[derive(Debug, Clone, PartialEq)]
pub(crate) enum Outcome {
    Success,
    Cancelled(String),
    /// The executor stopped because the engine is shutting down.
    Interrupted(String),
    Failure(Failure),
}

#[derive(Debug)]
enum Recorded {
    Completed,
    Cancelled(String),
    Requeued(String),
    Retrying {
        failure: Failure,
        retry_count: u16,
        due_at: DateTime<Utc>,
    },
    Failed(Failure),
}

struct Report {
    job: Job,
    recorded: Recorded,
    next: Option<NewJob>,
}

/// What became of an attempt to record an outcome.
enum Written {
    Recorded(Report),
    /// The job was reset, reclaimed or otherwise moved on without this execution.
    Superseded,
    Removed,
}

pub(crate) struct JobRunner<B: Backend> {
    backend: B,
    notifier: Arc<dyn Notifier>,
    config: EngineConfig,
    shutdown: CancellationToken,
}

impl<B> JobRunner<B>
where
    B: Backend,
{
    pub(crate) fn new(
        backend: B,
        notifier: Arc<dyn Notifier>,
        config: EngineConfig,
        shutdown: CancellationToken,
    ) -> Self {
        Self {
            backend,
            notifier,
            config,
            shutdown,
        }
    }

    /// Runs a claimed job and records its outcome.
    ///
    /// The slot is released only once the outcome is durable, or once recording it was given up
    /// during shutdown.
    #[instrument(skip_all, fields(job_id = %job.id, slot = %slot))]
    pub(crate) async fn execute_job(
        &self,
        job: Job,
        executor: Option<Arc<dyn DynExecutor>>,
        slot: Slot,
    ) {
        let reporter = LogReporter::new(Arc::new(self.backend.clone()), job.id, slot.to_string());
        reporter
            .record(
                LogLevel::Info,
                "Job execution started",
                Some(json!({
                    "attempt": u32::from(job.retry_count) + 1,
                    "execution_token": job.execution_token,
                })),
            )
            .await;

        let outcome = self.run(&job, executor, reporter.clone()).await;
        self.report(&job, outcome, &reporter).await;
        drop(slot);
    }

    async fn run(
        &self,
        job: &Job,
        executor: Option<Arc<dyn DynExecutor>>,
        reporter: LogReporter,
    ) -> Outcome {
        let job_id = job.id;
        let Some(executor) = executor else {
            tracing::error!(%job_id, name = %job.name, "No executor registered for job {job_id}");
            return Outcome::Failure(Failure::no_executor(job));
        };
        let cancellation = self.shutdown.child_token();
        let handle = ContextHandle {
            cancellation: cancellation.clone(),
            reporter,
        };
        let started = match executor.start(job, handle) {
            Ok(started) => started,
            Err(error) => {
                tracing::error!(?error, %job_id, "Failed to decode payload of job {job_id}: {error}");
                return Outcome::Failure(Failure::invalid_payload(error));
            }
        };
        let timeout = started.timeout.or(self.config.default_timeout);
        let future = started.future;

        tracing::debug!(%job_id, "Executing job {job_id}");
        let execution = tokio::spawn(
            async move {
                match timeout {
                    Some(timeout) => tokio::time::timeout(timeout, future)
                        .await
                        .map_err(|_| timeout),
                    None => Ok(future.await),
                }
            }
            .in_current_span(),
        );
        let watcher = self.watch_cancellation(job_id, job.execution_token, cancellation);
        let result = execution.await;
        watcher.abort();

        match result {
            Ok(Ok(ExecutionResult::Done)) => Outcome::Success,
            Ok(Ok(ExecutionResult::Cancelled { reason })) if self.shutdown.is_cancelled() => {
                Outcome::Interrupted(reason.to_string())
            }
            Ok(Ok(ExecutionResult::Cancelled { reason })) => Outcome::Cancelled(reason.to_string()),
            Ok(Ok(ExecutionResult::Error { error })) => Outcome::Failure(error.into()),
            Ok(Err(timeout)) => Outcome::Failure(timeout.into()),
            Err(error) => Outcome::Failure(error.into()),
        }
    }

    /// Signals the executor once the job is cancelled, reset or removed from under it.
    fn watch_cancellation(
        &self,
        job_id: JobId,
        token: ExecutionToken,
        cancellation: CancellationToken,
    ) -> JoinHandle<()> {
        let backend = self.backend.clone();
        let period = self.config.cancellation_check_interval;
        tokio::spawn(
            async move {
                let mut interval = tokio::time::interval(period);
                interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
                loop {
                    interval.tick().await;
                    match backend.get(job_id).await {
                        Ok(Some(job))
                            if job.status == JobStatus::Running
                                && job.execution_token == token
                                && !job.cancel_requested => {}
                        Ok(_) => {
                            tracing::debug!(%job_id, "Signalling cancellation to job {job_id}");
                            cancellation.cancel();
                            break;
                        }
                        Err(err) => {
                            tracing::warn!(?err, %job_id, "Failed to check job {job_id} for cancellation: {err}")
                        }
                    }
                }
            }
            .in_current_span(),
        )
    }

    async fn report(&self, job: &Job, outcome: Outcome, reporter: &LogReporter) {
        let job_id = job.id;
        let token = job.execution_token;
        let written = self
            .persist(job_id, "record the outcome of", || {
                self.try_report(job_id, token, &outcome)
            })
            .await;
        match written {
            Some(Written::Recorded(mut report)) => {
                let successor = match report.next.take() {
                    Some(next) => {
                        self.persist(job_id, "schedule the next occurrence of", || {
                            self.backend.insert(next.clone())
                        })
                        .await
                    }
                    None => None,
                };
                self.announce(report, successor, reporter).await
            }
            Some(Written::Superseded) => self.discard(job, reporter).await,
            Some(Written::Removed) => {
                tracing::debug!(%job_id, ?outcome, "Job {job_id} was deleted while running")
            }
            None => tracing::error!(
                %job_id,
                ?outcome,
                "Gave up recording outcome of job {job_id} during shutdown"
            ),
        }
    }

    /// Retries a store write until it succeeds.
    ///
    /// Once the engine is shutting down the write is abandoned after
    /// [`EngineConfig::with_report_attempts`] failures.
    async fn persist<T, F, Fut>(&self, job_id: JobId, action: &str, mut write: F) -> Option<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, StoreError>>,
    {
        let mut attempt = 0usize;
        loop {
            let err = match write().await {
                Ok(value) => return Some(value),
                Err(err) => err,
            };
            attempt += 1;
            if self.shutdown.is_cancelled() && attempt >= self.config.report_attempts {
                tracing::error!(
                    ?err,
                    %job_id,
                    attempt,
                    "Failed to {action} job {job_id}, giving up: {err}"
                );
                return None;
            }
            tracing::warn!(?err, %job_id, attempt, "Failed to {action} job {job_id}: {err}");
            let delay = STORE_RETRY_BACKOFF.backoff(u16::try_from(attempt - 1).unwrap_or(u16::MAX));
            tokio::time::sleep(delay.to_std().unwrap_or_default()).await;
        }
    }

    /// Writes the outcome if this execution still owns the job.
    ///
    /// The next occurrence of a recurring job is decided on the version that was written, so a
    /// cancellation request that raced the write is never followed by another firing.
    async fn try_report(
        &self,
        job_id: JobId,
        token: ExecutionToken,
        outcome: &Outcome,
    ) -> Result<Written, StoreError> {
        loop {
            let Some(mut job) = self.backend.get(job_id).await? else {
                return Ok(Written::Removed);
            };
            if job.status != JobStatus::Running || job.execution_token != token {
                return Ok(Written::Superseded);
            }
            let now = Utc::now();
            let version = job.version;
            let next = if job.cancel_requested {
                None
            } else {
                job.next_occurrence(now)
            };
            let Ok(recorded) = self.apply(&mut job, outcome, now) else {
                return Ok(Written::Superseded);
            };
            let next = next.filter(|_| {
                matches!(job.status, JobStatus::Completed | JobStatus::Failed)
            });

            match self.backend.compare_and_swap(job, version).await {
                Ok(job) => return Ok(Written::Recorded(Report { job, recorded, next })),
                Err(StoreError::Conflict(_)) => {
                    tracing::debug!(%job_id, "Job {job_id} changed while recording its outcome");
                }
                Err(StoreError::JobNotFound(_)) => return Ok(Written::Removed),
                Err(err) => return Err(err),
            }
        }
    }

    fn apply(
        &self,
        job: &mut Job,
        outcome: &Outcome,
        now: DateTime<Utc>,
    ) -> Result<Recorded, InvalidTransition> {
        match outcome {
            Outcome::Success => job.complete(now).map(|_| Recorded::Completed),
            Outcome::Cancelled(reason) => job
                .acknowledge_cancel(reason, now)
                .map(|_| Recorded::Cancelled(reason.clone())),
            Outcome::Interrupted(reason) if job.cancel_requested => job
                .acknowledge_cancel(reason, now)
                .map(|_| Recorded::Cancelled(reason.clone())),
            Outcome::Interrupted(reason) => job
                .reset_stuck(now)
                .map(|_| Recorded::Requeued(reason.clone())),
            Outcome::Failure(failure) => match self.config.retry_policy.decide(job, failure, now) {
                RetryDecision::Retry { .. } if job.cancel_requested => {
                    let reason = format!("Cancellation requested after failure: {failure}");
                    job.acknowledge_cancel(&reason, now)
                        .map(|_| Recorded::Cancelled(reason))
                }
                RetryDecision::Retry {
                    retry_count,
                    due_at,
                    ..
                } => job
                    .retry(retry_count, due_at, &failure.to_string(), now)
                    .map(|_| Recorded::Retrying {
                        failure: failure.clone(),
                        retry_count,
                        due_at,
                    }),
                RetryDecision::Fail => job
                    .fail(&failure.to_string(), now)
                    .map(|_| Recorded::Failed(failure.clone())),
            },
        }
    }

    async fn announce(&self, report: Report, successor: Option<Job>, reporter: &LogReporter) {
        let job = &report.job;
        let job_id = job.id;
        match &report.recorded {
            Recorded::Completed => {
                tracing::debug!(%job_id, "Job {job_id} completed");
                reporter
                    .record(LogLevel::Info, "Job completed successfully", None)
                    .await;
            }
            Recorded::Cancelled(reason) => {
                tracing::info!(%job_id, %reason, "Job {job_id} cancelled");
                reporter
                    .record(LogLevel::Warn, format!("Job cancelled: {reason}"), None)
                    .await;
            }
            Recorded::Requeued(reason) => {
                tracing::info!(%job_id, %reason, "Job {job_id} interrupted by shutdown");
                reporter
                    .record(
                        LogLevel::Warn,
                        format!("Job interrupted by shutdown and rescheduled: {reason}"),
                        None,
                    )
                    .await;
            }
            Recorded::Retrying {
                failure,
                retry_count,
                due_at,
            } => {
                tracing::warn!(
                    %job_id,
                    error_type = %failure.error_type,
                    retry_count,
                    %due_at,
                    "Job {job_id} failed and will be retried at {due_at}: {failure}"
                );
                reporter
                    .record(
                        LogLevel::Error,
                        format!("Job failed, retry {retry_count} of {}: {failure}", job.max_retries),
                        Some(json!({
                            "error_type": failure.error_type,
                            "message": failure.message,
                            "retry_count": retry_count,
                            "next_attempt_at": due_at,
                        })),
                    )
                    .await;
            }
            Recorded::Failed(failure) => {
                tracing::error!(
                    %job_id,
                    error_type = %failure.error_type,
                    retry_count = job.retry_count,
                    "Job {job_id} failed permanently: {failure}"
                );
                reporter
                    .record(
                        LogLevel::Error,
                        format!("Job failed permanently: {failure}"),
                        Some(json!({
                            "error_type": failure.error_type,
                            "message": failure.message,
                            "retry_count": job.retry_count,
                            "retriable": failure.retriable,
                        })),
                    )
                    .await;
            }
        }

        if let Some(successor) = &successor {
            reporter
                .record(
                    LogLevel::Info,
                    format!("Next occurrence scheduled for {}", successor.scheduled_at),
                    Some(json!({ "next_job_id": successor.id })),
                )
                .await;
        }

        if job.is_terminal() {
            self.notifier.notify(JobEvent::from(job)).await;
        }
    }

    async fn discard(&self, job: &Job, reporter: &LogReporter) {
        let job_id = job.id;
        tracing::warn!(
            %job_id,
            execution_token = %job.execution_token,
            "Discarding outcome of job {job_id}, it was modified while running"
        );
        reporter
            .record(
                LogLevel::Warn,
                "Discarded outcome of superseded execution",
                Some(json!({ "execution_token": job.execution_token })),
            )
            .await;
    }
}

#[cfg(test)]
mod test {
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

    use assert_matches::assert_matches;
    use async_trait::async_trait;
    use tokio::sync::Notify;

    use crate::{
        backend::{memory::InMemoryBackend, JobStore, LogStore, Statistics},
        dispatcher::SlotPool,
        execution_log::{ExecutionLogEntry, NewLogEntry},
        executor::{
            test::{MockExecutor, MockOutcome, RecurringExecutor},
            Executor,
        },
        job::query::{JobQuery, Page, Pagination},
        notifier::MockNotifier,
        retry::RetryPolicy,
    };

    use super::*;

    /// Delegates to an [`InMemoryBackend`], failing or racing the next job writes on demand.
    #[derive(Clone, Default)]
    struct InterferingBackend {
        inner: InMemoryBackend,
        failing_swaps: Arc<AtomicUsize>,
        cancel_before_swap: Arc<AtomicBool>,
    }

    impl InterferingBackend {
        fn fail_swaps(&self, count: usize) {
            self.failing_swaps.store(count, Ordering::SeqCst);
        }

        /// The next swap loses against a cancellation request written just before it.
        fn cancel_before_next_swap(&self) {
            self.cancel_before_swap.store(true, Ordering::SeqCst);
        }
    }

    #[async_trait]
    impl JobStore for InterferingBackend {
        async fn insert(&self, job: NewJob) -> Result<Job, StoreError> {
            self.inner.insert(job).await
        }

        async fn get(&self, id: JobId) -> Result<Option<Job>, StoreError> {
            self.inner.get(id).await
        }

        async fn compare_and_swap(
            &self,
            job: Job,
            expected_version: u64,
        ) -> Result<Job, StoreError> {
            if self
                .failing_swaps
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok()
            {
                return Err(StoreError::Unavailable("connection reset".into()));
            }
            if self.cancel_before_swap.swap(false, Ordering::SeqCst) {
                let mut stored = self.inner.get(job.id).await?.unwrap();
                let version = stored.version;
                stored.cancel(Utc::now()).unwrap();
                self.inner.compare_and_swap(stored, version).await?;
            }
            self.inner.compare_and_swap(job, expected_version).await
        }

        async fn delete(&self, id: JobId, expected_version: u64) -> Result<(), StoreError> {
            self.inner.delete(id, expected_version).await
        }

        async fn due_jobs(
            &self,
            status: JobStatus,
            now: DateTime<Utc>,
            limit: usize,
        ) -> Result<Vec<Job>, StoreError> {
            self.inner.due_jobs(status, now, limit).await
        }

        async fn next_due_at(&self) -> Result<Option<DateTime<Utc>>, StoreError> {
            self.inner.next_due_at().await
        }

        async fn query(&self, query: &JobQuery) -> Result<Page<Job>, StoreError> {
            self.inner.query(query).await
        }

        async fn statistics(&self) -> Result<Statistics, StoreError> {
            self.inner.statistics().await
        }

        async fn stuck_jobs(&self, started_before: DateTime<Utc>) -> Result<Vec<Job>, StoreError> {
            self.inner.stuck_jobs(started_before).await
        }

        async fn expired_jobs(
            &self,
            completed_before: DateTime<Utc>,
        ) -> Result<Vec<Job>, StoreError> {
            self.inner.expired_jobs(completed_before).await
        }
    }

    #[async_trait]
    impl LogStore for InterferingBackend {
        async fn append(&self, entry: NewLogEntry) -> Result<ExecutionLogEntry, StoreError> {
            self.inner.append(entry).await
        }

        async fn logs(
            &self,
            job_id: JobId,
            pagination: Pagination,
        ) -> Result<Page<ExecutionLogEntry>, StoreError> {
            self.inner.logs(job_id, pagination).await
        }
    }

    fn runner_with<B: Backend>(
        backend: &B,
        notifier: MockNotifier,
        shutdown: CancellationToken,
    ) -> JobRunner<B> {
        JobRunner::new(
            backend.clone(),
            Arc::new(notifier),
            EngineConfig::default()
                .with_retry_policy(RetryPolicy::new(BackoffStrategy::constant(
                    TimeDelta::zero(),
                )))
                .with_cancellation_check_interval(Duration::from_millis(10))
                .with_report_attempts(2),
            shutdown,
        )
    }

    fn runner(backend: &InMemoryBackend, notifier: MockNotifier) -> JobRunner<InMemoryBackend> {
        runner_with(backend, notifier, CancellationToken::new())
    }

    fn notifies(status: JobStatus) -> MockNotifier {
        let mut notifier = MockNotifier::new();
        notifier
            .expect_notify()
            .withf(move |event| event.status == status)
            .times(1)
            .return_const(());
        notifier
    }

    fn silent() -> MockNotifier {
        let mut notifier = MockNotifier::new();
        notifier.expect_notify().never();
        notifier
    }

    fn slot() -> Slot {
        SlotPool::new(1, Arc::new(Notify::new()))
            .try_acquire()
            .unwrap()
    }

    async fn claimed<B: JobStore>(backend: &B, job: NewJob) -> Job {
        let mut job = backend.insert(job).await.unwrap();
        let version = job.version;
        job.claim(Utc::now()).unwrap();
        backend.compare_and_swap(job, version).await.unwrap()
    }

    fn reporter<B: Backend>(backend: &B, job: &Job) -> LogReporter {
        LogReporter::new(Arc::new(backend.clone()), job.id, "slot-0".to_owned())
    }

    fn mock(outcome: MockOutcome) -> NewJob {
        NewJob::mock_job()
            .with_name(MockExecutor::NAME)
            .with_payload(outcome.payload())
    }

    async fn run_with<E: Executor>(
        runner: &JobRunner<InMemoryBackend>,
        job: &Job,
        executor: E,
    ) {
        runner
            .execute_job(job.clone(), Some(Arc::new(executor)), slot())
            .await;
    }

    async fn logs<B: LogStore>(backend: &B, job: &Job) -> Vec<ExecutionLogEntry> {
        backend
            .logs(job.id, Pagination::new(0, 100))
            .await
            .unwrap()
            .items
    }

    #[tokio::test]
    async fn successful_execution() {
        let backend = InMemoryBackend::new();
        let runner = runner(&backend, notifies(JobStatus::Completed));
        let job = claimed(&backend, mock(MockOutcome::Done)).await;

        run_with(&runner, &job, MockExecutor).await;

        let stored = backend.get(job.id).await.unwrap().unwrap();
        assert_eq!(stored.status, JobStatus::Completed);
        assert!(stored.completed_at.is_some());

        let logs = logs(&backend, &job).await;
        assert_eq!(logs.len(), 2);
        assert_eq!(logs[0].message, "Job execution started");
        assert_eq!(logs[0].slot.as_deref(), Some("slot-0"));
        assert_eq!(logs[1].message, "Job completed successfully");
        assert!(logs[1].duration_ms.is_some());
    }

    #[tokio::test]
    async fn retriable_error_schedules_a_retry() {
        let backend = InMemoryBackend::new();
        let runner = runner(&backend, silent());
        let job = claimed(
            &backend,
            mock(MockOutcome::Error {
                message: "boom".to_owned(),
                retriable: true,
            }),
        )
        .await;

        run_with(&runner, &job, MockExecutor).await;

        let stored = backend.get(job.id).await.unwrap().unwrap();
        assert_eq!(stored.status, JobStatus::Retrying);
        assert_eq!(stored.retry_count, 1);
        assert_eq!(stored.error_message.as_deref(), Some("custom: boom"));

        let logs = logs(&backend, &job).await;
        let last = logs.last().unwrap();
        assert_eq!(last.level, LogLevel::Error);
        let details = last.details.as_ref().unwrap();
        assert_eq!(details["error_type"], "custom");
        assert_eq!(details["retry_count"], 1);
        assert!(details.get("next_attempt_at").is_some());
    }

    #[tokio::test]
    async fn exhausted_retries_fail_the_job() {
        let backend = InMemoryBackend::new();
        let runner = runner(&backend, notifies(JobStatus::Failed));
        let mut job = claimed(
            &backend,
            mock(MockOutcome::Error {
                message: "boom".to_owned(),
                retriable: true,
            }),
        )
        .await;
        let version = job.version;
        job.retry_count = job.max_retries;
        let job = backend.compare_and_swap(job, version).await.unwrap();

        run_with(&runner, &job, MockExecutor).await;

        let stored = backend.get(job.id).await.unwrap().unwrap();
        assert_eq!(stored.status, JobStatus::Failed);
        assert_eq!(stored.retry_count, stored.max_retries);
        assert_eq!(
            logs(&backend, &job).await.last().unwrap().message,
            "Job failed permanently: custom: boom"
        );
    }

    #[tokio::test]
    async fn non_retriable_error_fails_immediately() {
        let backend = InMemoryBackend::new();
        let runner = runner(&backend, notifies(JobStatus::Failed));
        let job = claimed(
            &backend,
            mock(MockOutcome::Error {
                message: "bad input".to_owned(),
                retriable: false,
            }),
        )
        .await;

        run_with(&runner, &job, MockExecutor).await;

        let stored = backend.get(job.id).await.unwrap().unwrap();
        assert_eq!(stored.status, JobStatus::Failed);
        assert_eq!(stored.retry_count, 0);
    }

    #[tokio::test]
    async fn panic_is_retried() {
        let backend = InMemoryBackend::new();
        let runner = runner(&backend, silent());
        let job = claimed(&backend, mock(MockOutcome::Panic)).await;

        run_with(&runner, &job, MockExecutor).await;

        let stored = backend.get(job.id).await.unwrap().unwrap();
        assert_eq!(stored.status, JobStatus::Retrying);
        assert_eq!(stored.error_message.as_deref(), Some("panic: job panicked"));
    }

    #[tokio::test]
    async fn timeout_is_retried() {
        let backend = InMemoryBackend::new();
        let runner = runner(&backend, silent());
        let job = claimed(&backend, mock(MockOutcome::Timeout)).await;

        run_with(&runner, &job, MockExecutor).await;

        let stored = backend.get(job.id).await.unwrap().unwrap();
        assert_eq!(stored.status, JobStatus::Retrying);
        assert_matches!(stored.error_message, Some(message) if message.starts_with("timeout:"));
    }

    #[tokio::test]
    async fn missing_executor_fails_without_retry() {
        let backend = InMemoryBackend::new();
        let runner = runner(&backend, notifies(JobStatus::Failed));
        let job = claimed(&backend, NewJob::mock_job().with_name("unknown")).await;

        runner.execute_job(job.clone(), None, slot()).await;

        let stored = backend.get(job.id).await.unwrap().unwrap();
        assert_eq!(stored.status, JobStatus::Failed);
        assert_eq!(stored.retry_count, 0);
        assert_matches!(stored.error_message, Some(message) if message.starts_with("no_executor:"));
    }

    #[tokio::test]
    async fn outcome_of_superseded_execution_is_discarded() {
        let backend = InMemoryBackend::new();
        let runner = runner(&backend, silent());
        let job = claimed(&backend, mock(MockOutcome::Done)).await;

        let mut reclaimed = job.clone();
        reclaimed.reset_stuck(Utc::now()).unwrap();
        reclaimed.claim(Utc::now()).unwrap();
        let reclaimed = backend
            .compare_and_swap(reclaimed, job.version)
            .await
            .unwrap();

        runner
            .report(&job, Outcome::Success, &reporter(&backend, &job))
            .await;

        let stored = backend.get(job.id).await.unwrap().unwrap();
        assert_eq!(stored.status, JobStatus::Running);
        assert_eq!(stored.execution_token, reclaimed.execution_token);
        assert_eq!(
            logs(&backend, &job).await.last().unwrap().message,
            "Discarded outcome of superseded execution"
        );
    }

    #[tokio::test]
    async fn cooperative_cancellation() {
        let backend = InMemoryBackend::new();
        let runner = runner(&backend, notifies(JobStatus::Cancelled));
        let job = claimed(&backend, mock(MockOutcome::WaitForCancellation)).await;

        let execution = run_with(&runner, &job, MockExecutor);
        let cancel = async {
            tokio::time::sleep(Duration::from_millis(20)).await;
            let mut stored = backend.get(job.id).await.unwrap().unwrap();
            let version = stored.version;
            stored.cancel(Utc::now()).unwrap();
            backend.compare_and_swap(stored, version).await.unwrap();
        };
        tokio::time::timeout(Duration::from_secs(5), async {
            tokio::join!(execution, cancel)
        })
        .await
        .unwrap();

        let stored = backend.get(job.id).await.unwrap().unwrap();
        assert_eq!(stored.status, JobStatus::Cancelled);
        assert_eq!(stored.error_message.as_deref(), Some("stopped on request"));
        assert_eq!(
            logs(&backend, &job).await.last().unwrap().message,
            "Job cancelled: stopped on request"
        );
    }

    #[tokio::test]
    async fn recurring_job_schedules_its_next_occurrence() {
        let backend = InMemoryBackend::new();
        let runner = runner(&backend, notifies(JobStatus::Completed));
        let job = claimed(
            &backend,
            NewJob::mock_recurring("0 0 9 * * ?").with_name(RecurringExecutor::NAME),
        )
        .await;

        run_with(&runner, &job, RecurringExecutor).await;

        let stored = backend.get(job.id).await.unwrap().unwrap();
        assert_eq!(stored.status, JobStatus::Completed);
        assert!(!stored.schedule.unwrap().is_active);

        let logs = logs(&backend, &job).await;
        let scheduled = logs.last().unwrap();
        assert!(scheduled.message.starts_with("Next occurrence scheduled for"));
        let next_id =
            serde_json::from_value(scheduled.details.as_ref().unwrap()["next_job_id"].clone())
                .unwrap();
        let next = backend.get(next_id).await.unwrap().unwrap();
        assert_eq!(next.status, JobStatus::Scheduled);
        assert_eq!(next.previous_occurrence, Some(job.id));
        assert!(next.scheduled_at > Utc::now());
        assert!(next.schedule.unwrap().is_active);
    }

    #[tokio::test]
    async fn no_next_occurrence_after_cancellation_request() {
        let backend = InMemoryBackend::new();
        let runner = runner(&backend, notifies(JobStatus::Completed));
        let mut job = claimed(
            &backend,
            NewJob::mock_recurring("0 0 9 * * ?").with_name(RecurringExecutor::NAME),
        )
        .await;
        let version = job.version;
        job.cancel(Utc::now()).unwrap();
        let job = backend.compare_and_swap(job, version).await.unwrap();

        runner
            .report(&job, Outcome::Success, &reporter(&backend, &job))
            .await;

        assert_eq!(
            backend.get(job.id).await.unwrap().unwrap().status,
            JobStatus::Completed
        );
        assert_eq!(backend.statistics().await.unwrap().total, 1);
    }

    #[tokio::test]
    async fn cancellation_racing_the_outcome_stops_the_recurrence() {
        let backend = InterferingBackend::default();
        let runner = runner_with(
            &backend,
            notifies(JobStatus::Completed),
            CancellationToken::new(),
        );
        let job = claimed(
            &backend,
            NewJob::mock_recurring("0 0 9 * * ?").with_name(RecurringExecutor::NAME),
        )
        .await;
        backend.cancel_before_next_swap();

        runner
            .report(&job, Outcome::Success, &reporter(&backend, &job))
            .await;

        let stored = backend.get(job.id).await.unwrap().unwrap();
        assert_eq!(stored.status, JobStatus::Completed);
        assert!(stored.cancel_requested);
        assert!(!stored.schedule.unwrap().is_active);
        assert_eq!(backend.statistics().await.unwrap().total, 1);
        assert!(logs(&backend, &job)
            .await
            .iter()
            .all(|entry| !entry.message.starts_with("Next occurrence")));
    }

    #[tokio::test]
    async fn outcome_is_recorded_once_the_store_recovers() {
        let backend = InterferingBackend::default();
        let runner = runner_with(
            &backend,
            notifies(JobStatus::Completed),
            CancellationToken::new(),
        );
        let job = claimed(&backend, mock(MockOutcome::Done)).await;
        backend.fail_swaps(4);

        runner
            .report(&job, Outcome::Success, &reporter(&backend, &job))
            .await;

        let stored = backend.get(job.id).await.unwrap().unwrap();
        assert_eq!(stored.status, JobStatus::Completed);
        assert_eq!(
            logs(&backend, &job).await.last().unwrap().message,
            "Job completed successfully"
        );
    }

    #[tokio::test]
    async fn recording_is_abandoned_during_shutdown() {
        let backend = InterferingBackend::default();
        let shutdown = CancellationToken::new();
        let runner = runner_with(&backend, silent(), shutdown.clone());
        let job = claimed(&backend, mock(MockOutcome::Done)).await;
        backend.fail_swaps(usize::MAX);
        shutdown.cancel();

        tokio::time::timeout(
            Duration::from_secs(5),
            runner.report(&job, Outcome::Success, &reporter(&backend, &job)),
        )
        .await
        .unwrap();

        let stored = backend.get(job.id).await.unwrap().unwrap();
        assert_eq!(stored.status, JobStatus::Running);
        assert_eq!(stored.execution_token, job.execution_token);
    }

    #[tokio::test]
    async fn shutdown_reschedules_running_job() {
        let backend = InMemoryBackend::new();
        let shutdown = CancellationToken::new();
        let runner = runner_with(&backend, silent(), shutdown.clone());
        let job = claimed(&backend, mock(MockOutcome::WaitForCancellation)).await;

        let execution = runner.execute_job(job.clone(), Some(Arc::new(MockExecutor)), slot());
        let stop = async {
            tokio::time::sleep(Duration::from_millis(20)).await;
            shutdown.cancel();
        };
        tokio::time::timeout(Duration::from_secs(5), async {
            tokio::join!(execution, stop)
        })
        .await
        .unwrap();

        let stored = backend.get(job.id).await.unwrap().unwrap();
        assert_eq!(stored.status, JobStatus::Scheduled);
        assert_eq!(stored.retry_count, 0);
        assert!(stored.started_at.is_none());
        assert!(!stored.cancel_requested);
        assert_eq!(
            logs(&backend, &job).await.last().unwrap().message,
            "Job interrupted by shutdown and rescheduled: stopped on request"
        );
    }

    #[tokio::test]
    async fn interrupted_job_with_pending_cancellation_is_cancelled() {
        let backend = InMemoryBackend::new();
        let runner = runner(&backend, notifies(JobStatus::Cancelled));
        let mut job = claimed(&backend, mock(MockOutcome::WaitForCancellation)).await;
        let version = job.version;
        job.cancel(Utc::now()).unwrap();
        let job = backend.compare_and_swap(job, version).await.unwrap();

        runner
            .report(
                &job,
                Outcome::Interrupted("stopped on request".to_owned()),
                &reporter(&backend, &job),
            )
            .await;

        let stored = backend.get(job.id).await.unwrap().unwrap();
        assert_eq!(stored.status, JobStatus::Cancelled);
        assert_eq!(stored.error_message.as_deref(), Some("stopped on request"));
    }

    #[tokio::test]
    async fn outcome_of_deleted_job_is_dropped() {
        let backend = InMemoryBackend::new();
        let runner = runner(&backend, silent());
        let job = claimed(&backend, mock(MockOutcome::Done)).await;
        backend.delete(job.id, job.version).await.unwrap();

        runner
            .report(&job, Outcome::Success, &reporter(&backend, &job))
            .await;

        assert!(backend.get(job.id).await.unwrap().is_none());
        assert!(logs(&backend, &job).await.is_empty());
    }
}
