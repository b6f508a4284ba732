//! The executable side of a job.
//!
//! An [`Executor`] is registered with the engine under a name. When a job is claimed the engine
//! looks up the executor whose [`Executor::NAME`] equals the job's name, falling back to an
//! executor registered for the job's [`JobType`].
use std::{error::Error, fmt::Display, sync::Arc, time::Duration};

use async_trait::async_trait;
use futures::future::BoxFuture;
use fxhash::FxHashMap;
use serde::de::DeserializeOwned;
use tokio::task::JoinError;
use tokio_util::sync::{CancellationToken, WaitForCancellationFuture};

use crate::{
    execution_log::{LogLevel, LogReporter},
    job::{ExecutionToken, Job, JobId, JobType},
};

const ERROR_TYPE_PANIC: &str = "panic";
const ERROR_TYPE_TIMEOUT: &str = "timeout";
const ERROR_TYPE_INVALID_PAYLOAD: &str = "invalid_payload";
const ERROR_TYPE_NO_EXECUTOR: &str = "no_executor";

/// The work performed when a job runs.
///
/// # Example
///
/// ```
/// # use chronos::prelude::*;
/// use async_trait::async_trait;
///
/// struct SendReport;
///
/// #[async_trait]
/// impl Executor for SendReport {
///     type Payload = String;
///     const NAME: &'static str = "send_report";
///
///     async fn execute(&self, context: ExecutionContext<Self::Payload>) -> ExecutionResult {
///         context.log(LogLevel::Info, format!("Sending report to {}", context.payload)).await;
///         ExecutionResult::Done
///     }
/// }
/// ```
#[async_trait]
pub trait Executor: Send + Sync + 'static {
    /// The type the job payload is deserialized into.
    ///
    /// If this is not needed it can be set to [`serde_json::Value`].
    type Payload: DeserializeOwned + Send + 'static;

    /// The job name this executor runs.
    const NAME: &'static str;

    async fn execute(&self, context: ExecutionContext<Self::Payload>) -> ExecutionResult;

    /// Overrides the engine wide default timeout for a single execution.
    fn timeout(&self, _context: &ExecutionContext<Self::Payload>) -> Option<Duration> {
        None
    }
}

/// Everything an executor knows about the execution it performs.
pub struct ExecutionContext<P> {
    pub job_id: JobId,
    pub name: String,
    pub job_type: JobType,
    pub payload: P,
    pub retry_count: u16,
    pub max_retries: u16,
    pub execution_token: ExecutionToken,
    cancellation: CancellationToken,
    reporter: LogReporter,
}

impl<P> ExecutionContext<P> {
    /// One based number of the current attempt.
    pub fn attempt(&self) -> u32 {
        u32::from(self.retry_count) + 1
    }

    /// Whether the execution should stop, either because cancellation of the job was requested
    /// or because the engine is shutting down.
    ///
    /// Executors are expected to check this, or await [`ExecutionContext::cancelled`], at
    /// convenient points and return [`ExecutionResult::Cancelled`]. When the engine is shutting
    /// down the job is rescheduled rather than cancelled.
    pub fn is_cancelled(&self) -> bool {
        self.cancellation.is_cancelled()
    }

    pub fn cancelled(&self) -> WaitForCancellationFuture<'_> {
        self.cancellation.cancelled()
    }

    /// Appends an entry to the job's execution log.
    pub async fn log(&self, level: LogLevel, message: impl Into<String>) {
        self.reporter.record(level, message, None).await
    }

    pub async fn log_with_details(
        &self,
        level: LogLevel,
        message: impl Into<String>,
        details: serde_json::Value,
    ) {
        self.reporter.record(level, message, Some(details)).await
    }
}

pub enum ExecutionResult {
    Done,
    Cancelled { reason: Box<dyn CancellationReason> },
    Error { error: Box<dyn ExecutionError> },
}

impl<T> From<T> for ExecutionResult
where
    T: ExecutionError + 'static,
{
    fn from(value: T) -> Self {
        Self::Error {
            error: Box::new(value),
        }
    }
}

pub trait ExecutionError: Error + Send {
    fn error_type(&self) -> &'static str;

    /// Errors that can never succeed on a later attempt should return `false`, the job then
    /// fails without using its remaining retries.
    fn is_retriable(&self) -> bool {
        true
    }
}

pub trait CancellationReason: Display + Send {}

impl<T> CancellationReason for T where T: Display + Send {}

/// A failed execution as recorded on the job and in its log.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Failure {
    pub error_type: String,
    pub message: String,
    pub retriable: bool,
}

impl Display for Failure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.error_type, self.message)
    }
}

impl Failure {
    pub(crate) fn invalid_payload(error: serde_json::Error) -> Self {
        Self {
            error_type: ERROR_TYPE_INVALID_PAYLOAD.to_owned(),
            message: format!("Job payload could not be decoded: {error}"),
            retriable: false,
        }
    }

    pub(crate) fn no_executor(job: &Job) -> Self {
        Self {
            error_type: ERROR_TYPE_NO_EXECUTOR.to_owned(),
            message: format!(
                "No executor registered for job {} of type {}",
                job.name, job.job_type
            ),
            retriable: false,
        }
    }
}

impl From<JoinError> for Failure {
    fn from(value: JoinError) -> Self {
        let msg = value.to_string();
        let message = match value.try_into_panic() {
            Ok(panic) => panic
                .downcast_ref::<&str>()
                .map(ToString::to_string)
                .or_else(|| panic.downcast_ref::<String>().cloned())
                .unwrap_or(msg),
            Err(_) => msg,
        };
        Self {
            error_type: ERROR_TYPE_PANIC.to_owned(),
            message,
            retriable: true,
        }
    }
}

impl From<Box<dyn ExecutionError>> for Failure {
    fn from(value: Box<dyn ExecutionError>) -> Self {
        Self {
            error_type: value.error_type().to_owned(),
            message: value.to_string(),
            retriable: value.is_retriable(),
        }
    }
}

impl From<Duration> for Failure {
    fn from(value: Duration) -> Self {
        Self {
            error_type: ERROR_TYPE_TIMEOUT.to_owned(),
            message: format!("Job failed to complete within timeout: {value:?}"),
            retriable: true,
        }
    }
}

/// The per execution state handed to an executor by the runner slot.
pub(crate) struct ContextHandle {
    pub(crate) cancellation: CancellationToken,
    pub(crate) reporter: LogReporter,
}

pub(crate) struct Started {
    pub(crate) future: BoxFuture<'static, ExecutionResult>,
    pub(crate) timeout: Option<Duration>,
}

/// Object safe view of an [`Executor`] with its payload type erased.
pub(crate) trait DynExecutor: Send + Sync {
    fn start(
        self: Arc<Self>,
        job: &Job,
        handle: ContextHandle,
    ) -> Result<Started, serde_json::Error>;
}

impl<E> DynExecutor for E
where
    E: Executor,
{
    fn start(
        self: Arc<Self>,
        job: &Job,
        handle: ContextHandle,
    ) -> Result<Started, serde_json::Error> {
        let payload = serde_json::from_value(job.payload.clone())?;
        let context = ExecutionContext {
            job_id: job.id,
            name: job.name.clone(),
            job_type: job.job_type,
            payload,
            retry_count: job.retry_count,
            max_retries: job.max_retries,
            execution_token: job.execution_token,
            cancellation: handle.cancellation,
            reporter: handle.reporter,
        };
        let timeout = self.timeout(&context);
        Ok(Started {
            future: Box::pin(async move { self.execute(context).await }),
            timeout,
        })
    }
}

#[derive(Clone, Default)]
pub(crate) struct ExecutorRegistry {
    by_name: FxHashMap<&'static str, Arc<dyn DynExecutor>>,
    by_type: FxHashMap<JobType, Arc<dyn DynExecutor>>,
}

impl ExecutorRegistry {
    pub(crate) fn register<E: Executor>(&mut self, executor: E) {
        if self.by_name.insert(E::NAME, Arc::new(executor)).is_some() {
            tracing::warn!(executor = E::NAME, "Replaced executor {}", E::NAME);
        }
    }

    pub(crate) fn register_fallback<E: Executor>(&mut self, job_type: JobType, executor: E) {
        if self.by_type.insert(job_type, Arc::new(executor)).is_some() {
            tracing::warn!(%job_type, "Replaced fallback executor for {job_type} jobs");
        }
    }

    pub(crate) fn resolve(&self, job: &Job) -> Option<Arc<dyn DynExecutor>> {
        self.by_name
            .get(job.name.as_str())
            .or_else(|| self.by_type.get(&job.job_type))
            .cloned()
    }
}

#[cfg(test)]
pub(crate) mod test {
    use assert_matches::assert_matches;
    use serde::{Deserialize, Serialize};

    use crate::{
        backend::{memory::InMemoryBackend, LogStore},
        job::query::Pagination,
    };

    use super::*;

    impl std::fmt::Debug for ExecutionResult {
        fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
            match self {
                Self::Done => f.write_str("Done"),
                Self::Cancelled { reason } => f
                    .debug_struct("Cancelled")
                    .field("reason", &reason.to_string())
                    .finish(),
                Self::Error { error } => f.debug_struct("Error").field("error", error).finish(),
            }
        }
    }

    impl std::fmt::Debug for Started {
        fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
            f.debug_struct("Started")
                .field("timeout", &self.timeout)
                .finish_non_exhaustive()
        }
    }

    pub(crate) struct MockExecutor;

    #[derive(Debug, Clone, Serialize, Deserialize)]
    pub(crate) enum MockOutcome {
        Done,
        Panic,
        Timeout,
        Sleep { millis: u64 },
        WaitForCancellation,
        Cancelled { reason: String },
        Error { message: String, retriable: bool },
    }

    impl MockOutcome {
        pub(crate) fn payload(&self) -> serde_json::Value {
            serde_json::to_value(self).unwrap()
        }
    }

    #[derive(Debug, Clone)]
    pub(crate) struct MockError {
        message: String,
        retriable: bool,
    }

    impl std::fmt::Display for MockError {
        fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
            write!(f, "{}", self.message)
        }
    }

    impl Error for MockError {}

    impl ExecutionError for MockError {
        fn error_type(&self) -> &'static str {
            "custom"
        }

        fn is_retriable(&self) -> bool {
            self.retriable
        }
    }

    #[async_trait]
    impl Executor for MockExecutor {
        type Payload = MockOutcome;
        const NAME: &'static str = "mock";

        async fn execute(&self, context: ExecutionContext<Self::Payload>) -> ExecutionResult {
            match context.payload {
                MockOutcome::Done => ExecutionResult::Done,
                MockOutcome::Panic => panic!("job panicked"),
                MockOutcome::Timeout => {
                    tokio::time::sleep(Duration::from_millis(50)).await;
                    ExecutionResult::Done
                }
                MockOutcome::Sleep { millis } => {
                    tokio::time::sleep(Duration::from_millis(millis)).await;
                    ExecutionResult::Done
                }
                MockOutcome::WaitForCancellation => {
                    context.cancelled().await;
                    ExecutionResult::Cancelled {
                        reason: Box::new("stopped on request"),
                    }
                }
                MockOutcome::Cancelled { reason } => ExecutionResult::Cancelled {
                    reason: Box::new(reason),
                },
                MockOutcome::Error { message, retriable } => {
                    MockError { message, retriable }.into()
                }
            }
        }

        fn timeout(&self, context: &ExecutionContext<Self::Payload>) -> Option<Duration> {
            matches!(context.payload, MockOutcome::Timeout).then_some(Duration::from_millis(1))
        }
    }

    pub(crate) struct RecurringExecutor;

    #[async_trait]
    impl Executor for RecurringExecutor {
        type Payload = serde_json::Value;
        const NAME: &'static str = "recurring";

        async fn execute(&self, context: ExecutionContext<Self::Payload>) -> ExecutionResult {
            context
                .log(LogLevel::Debug, format!("Attempt {}", context.attempt()))
                .await;
            ExecutionResult::Done
        }
    }

    fn handle(backend: &InMemoryBackend, job: &Job) -> ContextHandle {
        ContextHandle {
            cancellation: CancellationToken::new(),
            reporter: LogReporter::new(Arc::new(backend.clone()), job.id, "slot-0".to_owned()),
        }
    }

    #[test]
    fn resolve_by_name_then_job_type() {
        let mut registry = ExecutorRegistry::default();
        registry.register(MockExecutor);
        registry.register_fallback(JobType::Recurring, RecurringExecutor);

        let mut job = Job::raw_job();
        job.name = MockExecutor::NAME.to_owned();
        assert!(registry.resolve(&job).is_some());

        job.name = "unknown".to_owned();
        assert!(registry.resolve(&job).is_none());

        let job = Job::raw_job().with_schedule("0 0 9 * * ?");
        assert!(registry.resolve(&job).is_some());
    }

    #[tokio::test]
    async fn start_decodes_payload() {
        let backend = InMemoryBackend::new();
        let mut job = Job::raw_job();
        job.payload = MockOutcome::Error {
            message: "boom".to_owned(),
            retriable: false,
        }
        .payload();

        let started = Arc::new(MockExecutor)
            .start(&job, handle(&backend, &job))
            .unwrap();
        assert!(started.timeout.is_none());

        let ExecutionResult::Error { error } = started.future.await else {
            panic!("expected the execution to fail");
        };
        assert_eq!(
            Failure::from(error),
            Failure {
                error_type: "custom".to_owned(),
                message: "boom".to_owned(),
                retriable: false,
            }
        );
    }

    #[tokio::test]
    async fn start_with_invalid_payload() {
        let backend = InMemoryBackend::new();
        let mut job = Job::raw_job();
        job.payload = serde_json::json!({ "unexpected": true });

        assert_matches!(
            Arc::new(MockExecutor).start(&job, handle(&backend, &job)),
            Err(_)
        );
    }

    #[tokio::test]
    async fn context_logs_to_job_log() {
        let backend = InMemoryBackend::new();
        let job = Job::raw_job();

        let started = Arc::new(RecurringExecutor)
            .start(&job, handle(&backend, &job))
            .unwrap();
        assert_matches!(started.future.await, ExecutionResult::Done);

        let logs = backend.logs(job.id, Pagination::default()).await.unwrap();
        assert_eq!(logs.total, 1);
        assert_eq!(logs.items[0].message, "Attempt 1");
        assert_eq!(logs.items[0].level, LogLevel::Debug);
        assert_eq!(logs.items[0].slot.as_deref(), Some("slot-0"));
    }

    #[tokio::test]
    async fn panic_becomes_retriable_failure() {
        let error = tokio::spawn(async { panic!("job panicked") })
            .await
            .unwrap_err();

        assert_eq!(
            Failure::from(error),
            Failure {
                error_type: ERROR_TYPE_PANIC.to_owned(),
                message: "job panicked".to_owned(),
                retriable: true,
            }
        );
    }

    #[test]
    fn unknown_executor_is_not_retriable() {
        let failure = Failure::no_executor(&Job::raw_job());

        assert!(!failure.retriable);
        assert_eq!(failure.error_type, ERROR_TYPE_NO_EXECUTOR);
    }
}
