//! Provides an in memory implementation of [`Backend`](super::Backend).
//!
//! It is not optimized, instead it is designed to be a correct implementation for use in tests
//! and single process setups where losing jobs on restart is acceptable.
use std::{
    collections::BTreeMap,
    sync::{
        atomic::{AtomicI64, Ordering},
        Arc, RwLock,
    },
};

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::{
    execution_log::{ExecutionLogEntry, NewLogEntry},
    job::{
        query::{JobQuery, Page, Pagination},
        Job, JobId, JobStatus,
    },
};

use super::{
    queryable::{Queryable, Sortable},
    JobStore, LogStore, NewJob, Statistics, StoreError,
};

/// An in memory implementation of [`Backend`](super::Backend).
///
/// Clones share the same underlying state.
#[derive(Clone, Default)]
pub struct InMemoryBackend {
    jobs: Arc<RwLock<BTreeMap<JobId, Job>>>,
    logs: Arc<RwLock<Vec<ExecutionLogEntry>>>,
    job_ids: Arc<AtomicI64>,
    log_ids: Arc<AtomicI64>,
}

impl InMemoryBackend {
    /// Creates a new instance of [`InMemoryBackend`].
    pub fn new() -> Self {
        Self::default()
    }

    fn matching_jobs(&self, predicate: impl Fn(&Job) -> bool) -> Result<Vec<Job>, StoreError> {
        Ok(self
            .jobs
            .read()
            .map_err(|_| StoreError::BadState)?
            .values()
            .filter(|job| predicate(job))
            .cloned()
            .collect())
    }
}

#[async_trait]
impl JobStore for InMemoryBackend {
    async fn insert(&self, job: NewJob) -> Result<Job, StoreError> {
        let mut jobs = self.jobs.write().map_err(|_| StoreError::BadState)?;
        if let Some(previous) = job.previous_occurrence {
            if let Some(existing) = jobs
                .values()
                .find(|existing| existing.previous_occurrence == Some(previous))
            {
                return Ok(existing.clone());
            }
        }
        let id = JobId::from(self.job_ids.fetch_add(1, Ordering::SeqCst) + 1);
        let job = job.into_job(id);
        jobs.insert(id, job.clone());
        Ok(job)
    }

    async fn get(&self, id: JobId) -> Result<Option<Job>, StoreError> {
        Ok(self
            .jobs
            .read()
            .map_err(|_| StoreError::BadState)?
            .get(&id)
            .cloned())
    }

    async fn compare_and_swap(
        &self,
        mut job: Job,
        expected_version: u64,
    ) -> Result<Job, StoreError> {
        let mut jobs = self.jobs.write().map_err(|_| StoreError::BadState)?;
        match jobs.get_mut(&job.id) {
            None => Err(StoreError::JobNotFound(job.id)),
            Some(current) if current.version != expected_version => {
                Err(StoreError::Conflict(job.id))
            }
            Some(current) => {
                job.version = expected_version + 1;
                *current = job.clone();
                Ok(job)
            }
        }
    }

    async fn delete(&self, id: JobId, expected_version: u64) -> Result<(), StoreError> {
        let mut jobs = self.jobs.write().map_err(|_| StoreError::BadState)?;
        match jobs.get(&id) {
            None => return Err(StoreError::JobNotFound(id)),
            Some(current) if current.version != expected_version => {
                return Err(StoreError::Conflict(id))
            }
            Some(_) => {
                jobs.remove(&id);
            }
        }
        self.logs
            .write()
            .map_err(|_| StoreError::BadState)?
            .retain(|entry| entry.job_id != id);
        Ok(())
    }

    async fn due_jobs(
        &self,
        status: JobStatus,
        now: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<Job>, StoreError> {
        let mut jobs =
            self.matching_jobs(|job| job.status == status && job.scheduled_at <= now)?;
        jobs.sort_by(|a, b| {
            b.priority
                .cmp(&a.priority)
                .then(a.scheduled_at.cmp(&b.scheduled_at))
                .then(a.id.cmp(&b.id))
        });
        jobs.truncate(limit);
        Ok(jobs)
    }

    async fn next_due_at(&self) -> Result<Option<DateTime<Utc>>, StoreError> {
        Ok(self
            .matching_jobs(|job| {
                matches!(job.status, JobStatus::Scheduled | JobStatus::Retrying)
            })?
            .into_iter()
            .map(|job| job.scheduled_at)
            .min())
    }

    async fn query(&self, query: &JobQuery) -> Result<Page<Job>, StoreError> {
        let mut jobs = self.matching_jobs(|job| query.filter.matches(job))?;
        jobs.sort_by(|a, b| query.sort.compare(a, b));
        Ok(Page::from_ordered(jobs, query.pagination))
    }

    async fn statistics(&self) -> Result<Statistics, StoreError> {
        let jobs = self.jobs.read().map_err(|_| StoreError::BadState)?;
        Ok(Statistics::from_counts(
            jobs.values().map(|job| (job.status, 1)),
            jobs.values().map(|job| (job.job_type, 1)),
        ))
    }

    async fn stuck_jobs(&self, started_before: DateTime<Utc>) -> Result<Vec<Job>, StoreError> {
        self.matching_jobs(|job| {
            job.status == JobStatus::Running
                && job
                    .started_at
                    .is_some_and(|started_at| started_at < started_before)
        })
    }

    async fn expired_jobs(
        &self,
        completed_before: DateTime<Utc>,
    ) -> Result<Vec<Job>, StoreError> {
        self.matching_jobs(|job| {
            job.is_terminal()
                && job
                    .completed_at
                    .is_some_and(|completed_at| completed_at < completed_before)
        })
    }
}

#[async_trait]
impl LogStore for InMemoryBackend {
    async fn append(&self, entry: NewLogEntry) -> Result<ExecutionLogEntry, StoreError> {
        let jobs = self.jobs.read().map_err(|_| StoreError::BadState)?;
        if !jobs.contains_key(&entry.job_id) {
            return Err(StoreError::JobNotFound(entry.job_id));
        }
        let mut logs = self.logs.write().map_err(|_| StoreError::BadState)?;
        let entry = entry.into_entry(self.log_ids.fetch_add(1, Ordering::SeqCst) + 1);
        logs.push(entry.clone());
        Ok(entry)
    }

    async fn logs(
        &self,
        job_id: JobId,
        pagination: Pagination,
    ) -> Result<Page<ExecutionLogEntry>, StoreError> {
        let mut entries = self
            .logs
            .read()
            .map_err(|_| StoreError::BadState)?
            .iter()
            .filter(|entry| entry.job_id == job_id)
            .cloned()
            .collect::<Vec<_>>();
        entries.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));
        Ok(Page::from_ordered(entries, pagination))
    }
}

#[cfg(test)]
mod test {
    use assert_matches::assert_matches;

    use crate::{execution_log::LogLevel, test_suite};

    use super::*;

    test_suite!(for: InMemoryBackend::new());

    #[tokio::test]
    async fn clones_share_state() {
        let backend = InMemoryBackend::new();
        let job = backend
            .clone()
            .insert(NewJob::mock_job())
            .await
            .unwrap();

        assert_eq!(backend.get(job.id).await.unwrap(), Some(job));
    }

    #[tokio::test]
    async fn poisoned_job_lock_is_bad_state() {
        let backend = InMemoryBackend::new();
        let job = backend.insert(NewJob::mock_job()).await.unwrap();

        tokio::task::spawn({
            let backend = backend.clone();
            async move {
                let _guard = backend.jobs.write();
                panic!()
            }
        })
        .await
        .unwrap_err();

        assert_matches!(
            backend.insert(NewJob::mock_job()).await,
            Err(StoreError::BadState)
        );
        assert_matches!(backend.get(job.id).await, Err(StoreError::BadState));
        assert_matches!(
            backend.compare_and_swap(job.clone(), job.version).await,
            Err(StoreError::BadState)
        );
        assert_matches!(
            backend.delete(job.id, job.version).await,
            Err(StoreError::BadState)
        );
        assert_matches!(
            backend
                .due_jobs(JobStatus::Scheduled, Utc::now(), 10)
                .await,
            Err(StoreError::BadState)
        );
        assert_matches!(backend.next_due_at().await, Err(StoreError::BadState));
        assert_matches!(
            backend.query(&JobQuery::default()).await,
            Err(StoreError::BadState)
        );
        assert_matches!(backend.statistics().await, Err(StoreError::BadState));
        assert_matches!(
            backend.stuck_jobs(Utc::now()).await,
            Err(StoreError::BadState)
        );
        assert_matches!(
            backend.expired_jobs(Utc::now()).await,
            Err(StoreError::BadState)
        );

        assert_matches!(
            backend
                .append(NewLogEntry::new(job.id, LogLevel::Info, "unreachable"))
                .await,
            Err(StoreError::BadState)
        );
        assert_matches!(
            backend.logs(job.id, Pagination::default()).await,
            Ok(page) if page.total == 0
        );
    }
}
