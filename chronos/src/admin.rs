//! Administrative operations: recovery of stuck jobs and retention of finished jobs.
use std::sync::Arc;

use chrono::{DateTime, TimeDelta, Utc};
use tokio::sync::Notify;
use tracing::instrument;

use crate::{
    backend::{Backend, StoreError},
    execution_log::{LogLevel, NewLogEntry},
    job::Job,
};

/// Handle to the administrative sweeps, see [`crate::Chronos::admin`].
#[derive(Clone)]
pub struct Admin<B: Backend> {
    backend: B,
    wake: Arc<Notify>,
}

fn cutoff(now: DateTime<Utc>, age: TimeDelta) -> DateTime<Utc> {
    now.checked_sub_signed(age)
        .unwrap_or(DateTime::<Utc>::MIN_UTC)
}

impl<B> Admin<B>
where
    B: Backend,
{
    pub(crate) fn new(backend: B, wake: Arc<Notify>) -> Self {
        Self { backend, wake }
    }

    /// Running jobs that started more than `timeout_minutes` ago.
    pub async fn find_stuck(&self, timeout_minutes: u32) -> Result<Vec<Job>, StoreError> {
        let started_before = cutoff(Utc::now(), TimeDelta::minutes(timeout_minutes.into()));
        self.backend.stuck_jobs(started_before).await
    }

    /// Returns every stuck job to [`crate::job::JobStatus::Scheduled`], due immediately.
    ///
    /// The retry count is left untouched and one warning is appended to each job's log. Jobs
    /// that changed since they were read are skipped. The abandoned execution can no longer
    /// record its outcome once the job is claimed again.
    #[instrument(skip(self))]
    pub async fn reset_stuck(&self, timeout_minutes: u32) -> Result<usize, StoreError> {
        let now = Utc::now();
        let started_before = cutoff(now, TimeDelta::minutes(timeout_minutes.into()));
        let mut reset = 0;
        let mut result = Ok(());
        for mut job in self.backend.stuck_jobs(started_before).await? {
            let job_id = job.id;
            let version = job.version;
            let started_at = job.started_at;
            if job.reset_stuck(now).is_err() {
                continue;
            }
            match self.backend.compare_and_swap(job, version).await {
                Ok(_) => {
                    reset += 1;
                    tracing::warn!(
                        %job_id,
                        ?started_at,
                        "Job {job_id} reset after being stuck in RUNNING for more than {timeout_minutes} minutes"
                    );
                    let entry = NewLogEntry::new(
                        job_id,
                        LogLevel::Warn,
                        format!(
                            "Job reset after being stuck in RUNNING for more than {timeout_minutes} minutes"
                        ),
                    )
                    .with_details(serde_json::json!({
                        "started_at": started_at,
                        "timeout_minutes": timeout_minutes,
                    }));
                    if let Err(err) = self.backend.append(entry).await {
                        tracing::error!(?err, %job_id, "Failed to log reset of job {job_id}: {err}");
                    }
                }
                Err(StoreError::Conflict(_) | StoreError::JobNotFound(_)) => {
                    tracing::debug!(%job_id, "Job {job_id} changed while being reset, skipping");
                }
                Err(err) => {
                    result = Err(err);
                    break;
                }
            }
        }
        if reset > 0 {
            self.wake.notify_one();
        }
        result.map(|_| reset)
    }

    /// Completed, failed and cancelled jobs that finished more than `days_old` days ago.
    pub async fn find_for_cleanup(&self, days_old: u32) -> Result<Vec<Job>, StoreError> {
        let completed_before = cutoff(Utc::now(), TimeDelta::days(days_old.into()));
        self.backend.expired_jobs(completed_before).await
    }

    /// Deletes the jobs returned by [`Admin::find_for_cleanup`] together with their logs.
    #[instrument(skip(self))]
    pub async fn cleanup(&self, days_old: u32) -> Result<usize, StoreError> {
        let mut removed = 0;
        for job in self.find_for_cleanup(days_old).await? {
            if !job.is_terminal() {
                continue;
            }
            match self.backend.delete(job.id, job.version).await {
                Ok(()) => removed += 1,
                Err(StoreError::Conflict(_) | StoreError::JobNotFound(_)) => {
                    tracing::debug!(job_id = %job.id, "Job {} changed before removal, skipping", job.id);
                }
                Err(err) => return Err(err),
            }
        }
        tracing::debug!(removed, days_old, "Removed {removed} jobs older than {days_old} days");
        Ok(removed)
    }
}

#[cfg(test)]
mod test {
    use assert_matches::assert_matches;

    use crate::{
        backend::{memory::InMemoryBackend, JobStore, LogStore, NewJob},
        job::{query::Pagination, JobStatus},
    };

    use super::*;

    async fn running_since(backend: &InMemoryBackend, started_at: DateTime<Utc>) -> Job {
        let mut job = backend.insert(NewJob::mock_job()).await.unwrap();
        let version = job.version;
        job.claim(started_at).unwrap();
        backend.compare_and_swap(job, version).await.unwrap()
    }

    async fn finished_at(
        backend: &InMemoryBackend,
        completed_at: DateTime<Utc>,
        status: JobStatus,
    ) -> Job {
        let mut job = running_since(backend, completed_at).await;
        let version = job.version;
        match status {
            JobStatus::Completed => job.complete(completed_at).unwrap(),
            JobStatus::Failed => job.fail("boom", completed_at).unwrap(),
            _ => job.acknowledge_cancel("stopped", completed_at).unwrap(),
        }
        backend.compare_and_swap(job, version).await.unwrap()
    }

    #[tokio::test]
    async fn find_stuck_selects_only_old_running_jobs() {
        let backend = InMemoryBackend::new();
        let admin = Admin::new(backend.clone(), Arc::new(Notify::new()));
        let now = Utc::now();
        let stuck = running_since(&backend, now - TimeDelta::minutes(45)).await;
        running_since(&backend, now - TimeDelta::minutes(5)).await;
        backend.insert(NewJob::mock_job()).await.unwrap();

        let jobs = admin.find_stuck(30).await.unwrap();

        assert_eq!(jobs.len(), 1);
        assert_eq!(jobs[0].id, stuck.id);
    }

    #[tokio::test]
    async fn reset_stuck_job() {
        let backend = InMemoryBackend::new();
        let wake = Arc::new(Notify::new());
        let admin = Admin::new(backend.clone(), wake.clone());
        let mut stuck = running_since(&backend, Utc::now() - TimeDelta::minutes(45)).await;
        let version = stuck.version;
        stuck.retry_count = 1;
        let stuck = backend.compare_and_swap(stuck, version).await.unwrap();
        let before = Utc::now();

        assert_eq!(admin.reset_stuck(30).await.unwrap(), 1);

        let job = backend.get(stuck.id).await.unwrap().unwrap();
        assert_eq!(job.status, JobStatus::Scheduled);
        assert_eq!(job.retry_count, 1);
        assert!(job.scheduled_at >= before);
        assert!(job.started_at.is_none());

        let logs = backend.logs(stuck.id, Pagination::default()).await.unwrap();
        let warnings = logs
            .items
            .iter()
            .filter(|entry| entry.level == LogLevel::Warn)
            .collect::<Vec<_>>();
        assert_eq!(warnings.len(), 1);
        assert_eq!(
            warnings[0].message,
            "Job reset after being stuck in RUNNING for more than 30 minutes"
        );

        tokio::time::timeout(std::time::Duration::from_secs(1), wake.notified())
            .await
            .unwrap();

        assert_eq!(admin.reset_stuck(30).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn reset_stuck_leaves_recent_jobs() {
        let backend = InMemoryBackend::new();
        let admin = Admin::new(backend.clone(), Arc::new(Notify::new()));
        let job = running_since(&backend, Utc::now() - TimeDelta::minutes(5)).await;

        assert_eq!(admin.reset_stuck(30).await.unwrap(), 0);
        assert_matches!(
            backend.get(job.id).await.unwrap(),
            Some(Job { status: JobStatus::Running, .. })
        );
    }

    #[tokio::test]
    async fn cleanup_removes_only_old_terminal_jobs() {
        let backend = InMemoryBackend::new();
        let admin = Admin::new(backend.clone(), Arc::new(Notify::new()));
        let now = Utc::now();
        let old = now - TimeDelta::days(40);
        let completed = finished_at(&backend, old, JobStatus::Completed).await;
        let failed = finished_at(&backend, old, JobStatus::Failed).await;
        let cancelled = finished_at(&backend, old, JobStatus::Cancelled).await;
        let recent = finished_at(&backend, now - TimeDelta::days(1), JobStatus::Completed).await;
        let running = running_since(&backend, old).await;
        let scheduled = backend
            .insert(NewJob::mock_job().with_scheduled_at(old))
            .await
            .unwrap();
        backend
            .append(NewLogEntry::new(completed.id, LogLevel::Info, "done"))
            .await
            .unwrap();

        let mut expired = admin
            .find_for_cleanup(30)
            .await
            .unwrap()
            .into_iter()
            .map(|job| job.id)
            .collect::<Vec<_>>();
        expired.sort();
        assert_eq!(expired, vec![completed.id, failed.id, cancelled.id]);

        assert_eq!(admin.cleanup(30).await.unwrap(), 3);

        for id in [completed.id, failed.id, cancelled.id] {
            assert!(backend.get(id).await.unwrap().is_none());
        }
        for id in [recent.id, running.id, scheduled.id] {
            assert!(backend.get(id).await.unwrap().is_some());
        }
        assert_eq!(
            backend
                .logs(completed.id, Pagination::default())
                .await
                .unwrap()
                .total,
            0
        );
    }
}
