//! Selection of due jobs and their hand-off to runner slots.
//!
//! The dispatcher wakes up when a job is submitted, when a slot is released or when the poll
//! interval elapses. On every cycle it moves retrying jobs whose backoff elapsed back to
//! [`JobStatus::Scheduled`], then claims as many due jobs as there are free slots, highest
//! priority first. A claim is a conditional write, losing it to another dispatcher is expected
//! and simply skips the job.
use std::{
    fmt::Display,
    sync::{Arc, Mutex, MutexGuard, PoisonError},
    time::Duration,
};

use chrono::{DateTime, TimeDelta, Utc};
use tokio::{sync::Notify, task::JoinHandle};
use tokio_util::{sync::CancellationToken, task::TaskTracker};

use crate::{
    backend::{Backend, StoreError},
    backoff::{BackoffStrategy, Strategy},
    config::EngineConfig,
    execution_log::{LogLevel, NewLogEntry},
    executor::ExecutorRegistry,
    job::{runner::JobRunner, Job, JobStatus},
    notifier::{JobEvent, Notifier},
};

const MIN_DELAY: Duration = Duration::from_millis(15);
const PROMOTION_BATCH: usize = 100;

/// The fixed set of runner slots of one engine instance.
pub(crate) struct SlotPool {
    free: Mutex<Vec<usize>>,
    wake: Arc<Notify>,
}

impl SlotPool {
    pub(crate) fn new(size: usize, wake: Arc<Notify>) -> Arc<Self> {
        Arc::new(Self {
            free: Mutex::new((0..size).rev().collect()),
            wake,
        })
    }

    fn lock(&self) -> MutexGuard<'_, Vec<usize>> {
        self.free.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub(crate) fn available(&self) -> usize {
        self.lock().len()
    }

    pub(crate) fn try_acquire(self: &Arc<Self>) -> Option<Slot> {
        let id = self.lock().pop()?;
        Some(Slot {
            id,
            pool: self.clone(),
            occupied: false,
        })
    }
}

/// A reserved runner slot, returned to its pool when dropped.
pub(crate) struct Slot {
    id: usize,
    pool: Arc<SlotPool>,
    occupied: bool,
}

impl Slot {
    /// Marks the slot as running a job, releasing it will wake the dispatcher.
    pub(crate) fn occupy(&mut self) {
        self.occupied = true;
    }
}

impl Display for Slot {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "slot-{}", self.id)
    }
}

impl Drop for Slot {
    fn drop(&mut self) {
        self.pool.lock().push(self.id);
        if self.occupied {
            self.pool.wake.notify_one();
        }
    }
}

pub(crate) struct Dispatcher<B: Backend> {
    backend: B,
    runner: Arc<JobRunner<B>>,
    executors: Arc<ExecutorRegistry>,
    slots: Arc<SlotPool>,
    wake: Arc<Notify>,
    notifier: Arc<dyn Notifier>,
    tracker: TaskTracker,
    poll_interval: Duration,
}

impl<B> Dispatcher<B>
where
    B: Backend,
{
    pub(crate) fn new(
        backend: B,
        config: &EngineConfig,
        executors: Arc<ExecutorRegistry>,
        notifier: Arc<dyn Notifier>,
        wake: Arc<Notify>,
        tracker: TaskTracker,
        shutdown: CancellationToken,
    ) -> Self {
        Self {
            runner: Arc::new(JobRunner::new(
                backend.clone(),
                notifier.clone(),
                config.clone(),
                shutdown,
            )),
            slots: SlotPool::new(config.max_concurrency, wake.clone()),
            poll_interval: config.poll_interval,
            backend,
            executors,
            wake,
            notifier,
            tracker,
        }
    }

    pub(crate) fn spawn(self, cancellation_token: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(async move {
            let error_backoff = BackoffStrategy::exponential(TimeDelta::milliseconds(100))
                .with_max(TimeDelta::seconds(30));
            let mut failures = 0u16;
            loop {
                let delay = match self.dispatch().await {
                    Ok(_) => {
                        failures = 0;
                        self.next_delay().await
                    }
                    Err(err) => {
                        tracing::error!(?err, "Failed to dispatch jobs: {err}");
                        let delay = error_backoff.backoff(failures);
                        failures = failures.saturating_add(1);
                        delay.to_std().unwrap_or(self.poll_interval)
                    }
                };
                tokio::select! {
                    _ = cancellation_token.cancelled() => {
                        tracing::debug!("Shutting down the dispatcher");
                        break;
                    }
                    _ = self.wake.notified() => {}
                    _ = tokio::time::sleep(delay) => {}
                }
            }
        })
    }

    /// Runs one dispatch cycle, returning the number of jobs handed to a slot.
    pub(crate) async fn dispatch(&self) -> Result<usize, StoreError> {
        let now = Utc::now();
        self.promote_retries(now).await?;

        let free = self.slots.available();
        if free == 0 {
            return Ok(0);
        }

        let mut dispatched = 0;
        for job in self
            .backend
            .due_jobs(JobStatus::Scheduled, now, free)
            .await?
        {
            if job.cancel_requested {
                self.cancel_pending(job, now).await?;
                continue;
            }
            let Some(mut slot) = self.slots.try_acquire() else {
                break;
            };
            let job_id = job.id;
            let version = job.version;
            let mut claimed = job;
            if claimed.claim(now).is_err() {
                continue;
            }
            match self.backend.compare_and_swap(claimed, version).await {
                Ok(job) => {
                    tracing::debug!(%job_id, %slot, "Claimed job {job_id}");
                    slot.occupy();
                    let executor = self.executors.resolve(&job);
                    let runner = self.runner.clone();
                    self.tracker
                        .spawn(async move { runner.execute_job(job, executor, slot).await });
                    dispatched += 1;
                }
                Err(StoreError::Conflict(_) | StoreError::JobNotFound(_)) => {
                    tracing::debug!(%job_id, "Job {job_id} was claimed elsewhere, skipping");
                }
                Err(err) => return Err(err),
            }
        }
        Ok(dispatched)
    }

    async fn promote_retries(&self, now: DateTime<Utc>) -> Result<(), StoreError> {
        for mut job in self
            .backend
            .due_jobs(JobStatus::Retrying, now, PROMOTION_BATCH)
            .await?
        {
            let job_id = job.id;
            let version = job.version;
            if job.requeue(now).is_err() {
                continue;
            }
            match self.backend.compare_and_swap(job, version).await {
                Ok(_) => tracing::debug!(%job_id, "Job {job_id} is due for another attempt"),
                Err(StoreError::Conflict(_) | StoreError::JobNotFound(_)) => {}
                Err(err) => return Err(err),
            }
        }
        Ok(())
    }

    /// A job reset while a cancellation was pending is cancelled instead of run again.
    async fn cancel_pending(&self, mut job: Job, now: DateTime<Utc>) -> Result<(), StoreError> {
        let job_id = job.id;
        let version = job.version;
        if job.cancel(now).is_err() {
            return Ok(());
        }
        match self.backend.compare_and_swap(job, version).await {
            Ok(job) => {
                let entry = NewLogEntry::new(
                    job_id,
                    LogLevel::Warn,
                    "Job cancelled before it was run again",
                );
                if let Err(err) = self.backend.append(entry).await {
                    tracing::error!(?err, %job_id, "Failed to log cancellation of job {job_id}: {err}");
                }
                self.notifier.notify(JobEvent::from(&job)).await;
                Ok(())
            }
            Err(StoreError::Conflict(_) | StoreError::JobNotFound(_)) => Ok(()),
            Err(err) => Err(err),
        }
    }

    async fn next_delay(&self) -> Duration {
        if self.slots.available() == 0 {
            return self.poll_interval;
        }
        match self.backend.next_due_at().await {
            Ok(Some(next)) => (next - Utc::now())
                .to_std()
                .unwrap_or(Duration::ZERO)
                .max(MIN_DELAY)
                .min(self.poll_interval),
            Ok(None) => self.poll_interval,
            Err(err) => {
                tracing::warn!(?err, "Failed to find the next due job: {err}");
                self.poll_interval
            }
        }
    }
}
