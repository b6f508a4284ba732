//! Conformance suite for [`Backend`] implementations.
use chrono::TimeDelta;

use crate::{
    execution_log::{LogLevel, NewLogEntry},
    job::{
        query::{JobFilter, JobQuery, Pagination, Sort, SortField},
        JobType,
    },
};

use super::*;

const DELTA: TimeDelta = TimeDelta::milliseconds(1);

impl NewJob {
    pub(crate) fn mock_job() -> Self {
        let now = Utc::now();
        Self {
            name: "job".to_owned(),
            description: None,
            job_type: JobType::Batch,
            payload: serde_json::json!({ "data": "value" }),
            priority: Priority::NORMAL,
            max_retries: 3,
            scheduled_at: now,
            schedule: None,
            previous_occurrence: None,
            created_by: None,
            created_at: now,
        }
    }

    pub(crate) fn mock_recurring(expression: &str) -> Self {
        let now = Utc::now();
        let cron: crate::trigger::CronExpression =
            expression.parse().expect("valid cron expression");
        let scheduled_at = cron.next_after(now).expect("cron expression fires");
        Self {
            job_type: JobType::Recurring,
            scheduled_at,
            schedule: Some(JobSchedule {
                cron,
                is_active: true,
                next_execution: Some(scheduled_at),
                last_execution: None,
            }),
            ..Self::mock_job()
        }
    }

    pub(crate) fn with_name(self, name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..self
        }
    }

    pub(crate) fn with_description(self, description: impl Into<String>) -> Self {
        Self {
            description: Some(description.into()),
            ..self
        }
    }

    pub(crate) fn with_payload(self, payload: serde_json::Value) -> Self {
        Self { payload, ..self }
    }

    pub(crate) fn with_priority(self, priority: Priority) -> Self {
        Self { priority, ..self }
    }

    pub(crate) fn with_scheduled_at(self, scheduled_at: DateTime<Utc>) -> Self {
        Self {
            scheduled_at,
            ..self
        }
    }

    pub(crate) fn with_created_by(self, created_by: impl Into<String>) -> Self {
        Self {
            created_by: Some(created_by.into()),
            ..self
        }
    }

    pub(crate) fn with_previous_occurrence(self, id: JobId) -> Self {
        Self {
            previous_occurrence: Some(id),
            ..self
        }
    }
}

/// Create test suite for a chronos backend.
///
/// For backend implementors, it is useful to include this as part of your test suites.
///
/// # Example
///
/// ```
/// use chronos::test_suite;
/// use chronos::backend::memory::InMemoryBackend;
/// test_suite!(for: InMemoryBackend::new());
/// ```
///
/// If you are using a different async test attribute you can configure the macro to use that
/// instead, several attributes can be given with `attrs`. For example when using `sqlx::test`:
///
/// ```ignore
/// use chronos::test_suite;
/// test_suite!(
///     attrs: { #[sqlx::test] },
///     args: (pool: PgPool),
///     backend: BackendImplementation::from(pool)
/// );
/// ```
#[macro_export]
macro_rules! test_suite {
    (for: $backend:expr) => {
        $crate::test_suite!(attr: tokio::test, args: (), backend: $backend);
    };
    (attr: $attr:meta, args: $args:tt, backend: $backend:expr) => {
        $crate::test_suite!(attrs: { #[$attr] }, args: $args, backend: $backend);
    };
    (attrs: $attrs:tt, args: $args:tt, backend: $backend:expr) => {
        $crate::test_suite!(
            @tests $attrs $args $backend;
            insert_assigns_ids_and_defaults,
            insert_keeps_schedule,
            insert_next_occurrence_is_idempotent,
            get_missing_job,
            compare_and_swap_updates_job,
            compare_and_swap_conflict,
            compare_and_swap_not_found,
            concurrent_claims_exactly_one_wins,
            due_jobs_ordered_by_priority_then_due_time,
            due_jobs_excludes_future_and_other_statuses,
            next_due_at_considers_scheduled_and_retrying,
            query_filters,
            query_sorts_and_paginates,
            statistics_counts_jobs,
            stuck_jobs_selects_running_started_before,
            expired_jobs_selects_terminal_completed_before,
            delete_removes_job_and_logs,
            delete_conflict_and_not_found,
            logs_are_paged_in_creation_order,
            append_to_missing_job_is_not_found
        );
    };
    (@tests $attrs:tt $args:tt $backend:expr; $name:ident) => {
        $crate::test_suite!(@test $attrs $args $backend; $name);
    };
    (@tests $attrs:tt $args:tt $backend:expr; $name:ident, $($rest:ident),+) => {
        $crate::test_suite!(@test $attrs $args $backend; $name);
        $crate::test_suite!(@tests $attrs $args $backend; $($rest),+);
    };
    (@test { $($attr:tt)* } $args:tt $backend:expr; $name:ident) => {
        $($attr)*
        async fn $name $args {
            let backend = $backend;
            $crate::backend::testing::$name(backend).await;
        }
    };
}

pub use test_suite;

async fn claimed(backend: &impl Backend, job: NewJob, at: DateTime<Utc>) -> Job {
    let mut job = backend.insert(job).await.unwrap();
    let version = job.version;
    job.claim(at).unwrap();
    backend.compare_and_swap(job, version).await.unwrap()
}

#[doc(hidden)]
pub async fn insert_assigns_ids_and_defaults(backend: impl Backend) {
    let job1 = backend.insert(NewJob::mock_job()).await.unwrap();
    let job2 = backend
        .insert(NewJob::mock_job().with_created_by("ops"))
        .await
        .unwrap();

    assert_ne!(job1.id, job2.id);
    assert_eq!(job1.status, JobStatus::Scheduled);
    assert_eq!(job1.retry_count, 0);
    assert!(!job1.cancel_requested);
    assert_eq!(job1.execution_token, Default::default());

    let stored = backend.get(job2.id).await.unwrap().unwrap();
    assert_eq!(stored.id, job2.id);
    assert_eq!(stored.version, job2.version);
    assert_eq!(stored.payload, NewJob::mock_job().payload);
    assert_eq!(stored.created_by.as_deref(), Some("ops"));
}

#[doc(hidden)]
pub async fn insert_keeps_schedule(backend: impl Backend) {
    let job = backend
        .insert(NewJob::mock_recurring("0 0 9 * * ?"))
        .await
        .unwrap();

    let stored = backend.get(job.id).await.unwrap().unwrap();
    assert_eq!(stored.job_type, JobType::Recurring);
    let schedule = stored.schedule.unwrap();
    assert_eq!(schedule.cron.as_str(), "0 0 9 * * ?");
    assert!(schedule.is_active);
    assert!(schedule.last_execution.is_none());
}

#[doc(hidden)]
pub async fn insert_next_occurrence_is_idempotent(backend: impl Backend) {
    let parent = backend.insert(NewJob::mock_job()).await.unwrap();

    let first = backend
        .insert(NewJob::mock_job().with_previous_occurrence(parent.id))
        .await
        .unwrap();
    let second = backend
        .insert(NewJob::mock_job().with_previous_occurrence(parent.id))
        .await
        .unwrap();

    assert_eq!(first.id, second.id);
    assert_eq!(
        backend.query(&JobQuery::default()).await.unwrap().total,
        2
    );
}

#[doc(hidden)]
pub async fn get_missing_job(backend: impl Backend) {
    assert!(backend.get(424242.into()).await.unwrap().is_none());
}

#[doc(hidden)]
pub async fn compare_and_swap_updates_job(backend: impl Backend) {
    let now = Utc::now();
    let mut job = backend.insert(NewJob::mock_job()).await.unwrap();
    let version = job.version;
    job.claim(now).unwrap();

    let updated = backend.compare_and_swap(job, version).await.unwrap();
    assert_eq!(updated.version, version + 1);

    let stored = backend.get(updated.id).await.unwrap().unwrap();
    assert_eq!(stored.status, JobStatus::Running);
    assert_eq!(stored.version, version + 1);
    assert_eq!(stored.execution_token, updated.execution_token);
    assert!((stored.started_at.unwrap() - now).abs() < DELTA);
}

#[doc(hidden)]
pub async fn compare_and_swap_conflict(backend: impl Backend) {
    let job = backend.insert(NewJob::mock_job()).await.unwrap();
    let version = job.version;

    let mut first = job.clone();
    first.priority = Priority::HIGH;
    backend.compare_and_swap(first, version).await.unwrap();

    let mut second = job;
    second.priority = Priority::LOW;
    assert!(matches!(
        backend.compare_and_swap(second, version).await,
        Err(StoreError::Conflict(_))
    ));
}

#[doc(hidden)]
pub async fn compare_and_swap_not_found(backend: impl Backend) {
    let job = NewJob::mock_job().into_job(424242.into());
    assert!(matches!(
        backend.compare_and_swap(job, 0).await,
        Err(StoreError::JobNotFound(_))
    ));
}

#[doc(hidden)]
pub async fn concurrent_claims_exactly_one_wins(backend: impl Backend) {
    let now = Utc::now();
    let job = backend.insert(NewJob::mock_job()).await.unwrap();
    let version = job.version;
    let mut first = job.clone();
    first.claim(now).unwrap();
    let mut second = job;
    second.claim(now).unwrap();

    let (first, second) = futures::future::join(
        backend.compare_and_swap(first, version),
        backend.compare_and_swap(second, version),
    )
    .await;

    let results = [first, second];
    assert_eq!(results.iter().filter(|result| result.is_ok()).count(), 1);
    assert_eq!(
        results
            .iter()
            .filter(|result| matches!(result, Err(StoreError::Conflict(_))))
            .count(),
        1
    );
}

#[doc(hidden)]
pub async fn due_jobs_ordered_by_priority_then_due_time(backend: impl Backend) {
    let now = Utc::now();
    let low = backend
        .insert(
            NewJob::mock_job()
                .with_priority(Priority::LOW)
                .with_scheduled_at(now - TimeDelta::seconds(10)),
        )
        .await
        .unwrap();
    let high_later = backend
        .insert(
            NewJob::mock_job()
                .with_priority(Priority::HIGH)
                .with_scheduled_at(now - TimeDelta::seconds(1)),
        )
        .await
        .unwrap();
    let high_earlier = backend
        .insert(
            NewJob::mock_job()
                .with_priority(Priority::HIGH)
                .with_scheduled_at(now - TimeDelta::seconds(5)),
        )
        .await
        .unwrap();
    let _future = backend
        .insert(
            NewJob::mock_job()
                .with_priority(Priority::CRITICAL)
                .with_scheduled_at(now + TimeDelta::hours(1)),
        )
        .await
        .unwrap();

    let due = backend
        .due_jobs(JobStatus::Scheduled, now, 10)
        .await
        .unwrap()
        .into_iter()
        .map(|job| job.id)
        .collect::<Vec<_>>();
    assert_eq!(due, vec![high_earlier.id, high_later.id, low.id]);

    let due = backend
        .due_jobs(JobStatus::Scheduled, now, 2)
        .await
        .unwrap()
        .into_iter()
        .map(|job| job.id)
        .collect::<Vec<_>>();
    assert_eq!(due, vec![high_earlier.id, high_later.id]);
}

#[doc(hidden)]
pub async fn due_jobs_excludes_future_and_other_statuses(backend: impl Backend) {
    let now = Utc::now();
    let running = claimed(&backend, NewJob::mock_job(), now).await;

    assert!(backend
        .due_jobs(JobStatus::Scheduled, now, 10)
        .await
        .unwrap()
        .is_empty());

    let version = running.version;
    let mut retrying = running;
    retrying
        .retry(1, now - TimeDelta::seconds(1), "boom", now)
        .unwrap();
    let retrying = backend.compare_and_swap(retrying, version).await.unwrap();

    let due = backend.due_jobs(JobStatus::Retrying, now, 10).await.unwrap();
    assert_eq!(due.len(), 1);
    assert_eq!(due[0].id, retrying.id);
    assert!(backend
        .due_jobs(JobStatus::Retrying, now - TimeDelta::minutes(1), 10)
        .await
        .unwrap()
        .is_empty());
}

#[doc(hidden)]
pub async fn next_due_at_considers_scheduled_and_retrying(backend: impl Backend) {
    let now = Utc::now();
    assert!(backend.next_due_at().await.unwrap().is_none());

    backend
        .insert(NewJob::mock_job().with_scheduled_at(now + TimeDelta::hours(1)))
        .await
        .unwrap();
    let next = backend.next_due_at().await.unwrap().unwrap();
    assert!((next - (now + TimeDelta::hours(1))).abs() < DELTA);

    let running = claimed(
        &backend,
        NewJob::mock_job().with_scheduled_at(now + TimeDelta::minutes(10)),
        now,
    )
    .await;
    let next = backend.next_due_at().await.unwrap().unwrap();
    assert!((next - (now + TimeDelta::hours(1))).abs() < DELTA);

    let version = running.version;
    let mut retrying = running;
    retrying
        .retry(1, now + TimeDelta::minutes(5), "boom", now)
        .unwrap();
    backend.compare_and_swap(retrying, version).await.unwrap();
    let next = backend.next_due_at().await.unwrap().unwrap();
    assert!((next - (now + TimeDelta::minutes(5))).abs() < DELTA);
}

#[doc(hidden)]
pub async fn query_filters(backend: impl Backend) {
    let report = backend
        .insert(
            NewJob::mock_job()
                .with_name("Nightly report")
                .with_description("Sends the sales digest")
                .with_created_by("ops"),
        )
        .await
        .unwrap();
    backend
        .insert(NewJob::mock_job().with_name("Invoices").with_created_by("billing"))
        .await
        .unwrap();
    let recurring = backend
        .insert(NewJob::mock_recurring("0 0 9 * * ?").with_name("Cleanup"))
        .await
        .unwrap();

    let search = |filter: JobFilter| {
        let backend = backend.clone();
        async move {
            backend
                .query(&JobQuery::new(filter))
                .await
                .unwrap()
                .items
                .into_iter()
                .map(|job| job.id)
                .collect::<Vec<_>>()
        }
    };

    assert_eq!(search(JobFilter::default()).await.len(), 3);
    assert_eq!(
        search(JobFilter::default().with_search("REPORT")).await,
        vec![report.id]
    );
    assert_eq!(
        search(JobFilter::default().with_search("sales")).await,
        vec![report.id]
    );
    assert_eq!(
        search(JobFilter::default().with_job_type(JobType::Recurring)).await,
        vec![recurring.id]
    );
    assert_eq!(
        search(
            JobFilter::default()
                .with_created_by("ops")
                .with_status(JobStatus::Scheduled)
        )
        .await,
        vec![report.id]
    );
    assert!(search(JobFilter::default().with_status(JobStatus::Failed))
        .await
        .is_empty());
}

#[doc(hidden)]
pub async fn query_sorts_and_paginates(backend: impl Backend) {
    for (name, priority) in [
        ("job-3", Priority::LOW),
        ("job-0", Priority::CRITICAL),
        ("job-4", Priority::NORMAL),
        ("job-1", Priority::HIGH),
        ("job-2", Priority::LOW),
    ] {
        backend
            .insert(NewJob::mock_job().with_name(name).with_priority(priority))
            .await
            .unwrap();
    }

    let page = backend
        .query(
            &JobQuery::default()
                .with_sort(Sort::asc(SortField::Name))
                .with_pagination(Pagination::new(1, 2)),
        )
        .await
        .unwrap();
    assert_eq!(page.total, 5);
    assert_eq!(page.total_pages(), 3);
    assert_eq!(
        page.items
            .iter()
            .map(|job| job.name.as_str())
            .collect::<Vec<_>>(),
        vec!["job-2", "job-3"]
    );

    let page = backend
        .query(&JobQuery::default().with_sort(Sort::desc(SortField::Priority)))
        .await
        .unwrap();
    assert_eq!(
        page.items
            .iter()
            .take(2)
            .map(|job| job.name.as_str())
            .collect::<Vec<_>>(),
        vec!["job-0", "job-1"]
    );
}

#[doc(hidden)]
pub async fn statistics_counts_jobs(backend: impl Backend) {
    let now = Utc::now();
    backend.insert(NewJob::mock_job()).await.unwrap();
    backend
        .insert(NewJob::mock_recurring("0 0 9 * * ?"))
        .await
        .unwrap();
    let running = claimed(&backend, NewJob::mock_job(), now).await;
    let version = running.version;
    let mut completed = running;
    completed.complete(now).unwrap();
    backend.compare_and_swap(completed, version).await.unwrap();

    let statistics = backend.statistics().await.unwrap();
    assert_eq!(statistics.total, 3);
    assert_eq!(statistics.status(JobStatus::Scheduled), 2);
    assert_eq!(statistics.status(JobStatus::Completed), 1);
    assert_eq!(statistics.status(JobStatus::Running), 0);
    assert_eq!(statistics.job_type(JobType::Batch), 2);
    assert_eq!(statistics.job_type(JobType::Recurring), 1);
    assert_eq!(statistics.job_type(JobType::OneTime), 0);
}

#[doc(hidden)]
pub async fn stuck_jobs_selects_running_started_before(backend: impl Backend) {
    let now = Utc::now();
    let stuck = claimed(&backend, NewJob::mock_job(), now - TimeDelta::minutes(45)).await;
    claimed(&backend, NewJob::mock_job(), now - TimeDelta::minutes(5)).await;
    backend.insert(NewJob::mock_job()).await.unwrap();

    let jobs = backend
        .stuck_jobs(now - TimeDelta::minutes(30))
        .await
        .unwrap();
    assert_eq!(jobs.len(), 1);
    assert_eq!(jobs[0].id, stuck.id);
}

#[doc(hidden)]
pub async fn expired_jobs_selects_terminal_completed_before(backend: impl Backend) {
    let now = Utc::now();
    let old_at = now - TimeDelta::days(10);
    let old = claimed(&backend, NewJob::mock_job(), old_at).await;
    let version = old.version;
    let mut old = old;
    old.complete(old_at).unwrap();
    let old = backend.compare_and_swap(old, version).await.unwrap();

    let recent_at = now - TimeDelta::days(1);
    let recent = claimed(&backend, NewJob::mock_job(), recent_at).await;
    let version = recent.version;
    let mut recent = recent;
    recent.fail("boom", recent_at).unwrap();
    let recent = backend.compare_and_swap(recent, version).await.unwrap();

    claimed(&backend, NewJob::mock_job(), old_at).await;
    backend.insert(NewJob::mock_job()).await.unwrap();

    let expired = backend
        .expired_jobs(now - TimeDelta::days(7))
        .await
        .unwrap()
        .into_iter()
        .map(|job| job.id)
        .collect::<Vec<_>>();
    assert_eq!(expired, vec![old.id]);

    let mut expired = backend
        .expired_jobs(now)
        .await
        .unwrap()
        .into_iter()
        .map(|job| job.id)
        .collect::<Vec<_>>();
    expired.sort();
    assert_eq!(expired, vec![old.id, recent.id]);
}

#[doc(hidden)]
pub async fn delete_removes_job_and_logs(backend: impl Backend) {
    let job = backend.insert(NewJob::mock_job()).await.unwrap();
    let other = backend.insert(NewJob::mock_job()).await.unwrap();
    backend
        .append(NewLogEntry::new(job.id, LogLevel::Info, "started"))
        .await
        .unwrap();
    backend
        .append(NewLogEntry::new(job.id, LogLevel::Info, "done"))
        .await
        .unwrap();
    backend
        .append(NewLogEntry::new(other.id, LogLevel::Info, "started"))
        .await
        .unwrap();

    backend.delete(job.id, job.version).await.unwrap();

    assert!(backend.get(job.id).await.unwrap().is_none());
    assert_eq!(
        backend
            .logs(job.id, Pagination::default())
            .await
            .unwrap()
            .total,
        0
    );
    assert_eq!(
        backend
            .logs(other.id, Pagination::default())
            .await
            .unwrap()
            .total,
        1
    );
}

#[doc(hidden)]
pub async fn delete_conflict_and_not_found(backend: impl Backend) {
    let job = backend.insert(NewJob::mock_job()).await.unwrap();
    let version = job.version;
    let mut updated = job.clone();
    updated.priority = Priority::HIGH;
    backend.compare_and_swap(updated, version).await.unwrap();

    assert!(matches!(
        backend.delete(job.id, version).await,
        Err(StoreError::Conflict(_))
    ));
    assert!(backend.get(job.id).await.unwrap().is_some());
    assert!(matches!(
        backend.delete(424242.into(), 0).await,
        Err(StoreError::JobNotFound(_))
    ));
}

#[doc(hidden)]
pub async fn logs_are_paged_in_creation_order(backend: impl Backend) {
    let now = Utc::now();
    let job = backend.insert(NewJob::mock_job()).await.unwrap();
    for (offset, message) in [(0, "first"), (1, "second"), (2, "third")] {
        let mut entry = NewLogEntry::new(job.id, LogLevel::Info, message)
            .with_slot("slot-0")
            .with_details(serde_json::json!({ "step": offset }));
        entry.created_at = now + TimeDelta::seconds(offset);
        backend.append(entry).await.unwrap();
    }

    let page = backend
        .logs(job.id, Pagination::new(0, 2))
        .await
        .unwrap();
    assert_eq!(page.total, 3);
    assert_eq!(
        page.items
            .iter()
            .map(|entry| entry.message.as_str())
            .collect::<Vec<_>>(),
        vec!["first", "second"]
    );
    assert_eq!(page.items[0].slot.as_deref(), Some("slot-0"));
    assert_eq!(
        page.items[1].details,
        Some(serde_json::json!({ "step": 1 }))
    );

    let page = backend
        .logs(job.id, Pagination::new(1, 2))
        .await
        .unwrap();
    assert_eq!(page.items.len(), 1);
    assert_eq!(page.items[0].message, "third");
    assert_eq!(page.items[0].level, LogLevel::Info);
}

#[doc(hidden)]
pub async fn append_to_missing_job_is_not_found(backend: impl Backend) {
    let job = backend.insert(NewJob::mock_job()).await.unwrap();
    backend.delete(job.id, job.version).await.unwrap();

    assert!(matches!(
        backend
            .append(NewLogEntry::new(job.id, LogLevel::Warn, "late entry"))
            .await,
        Err(StoreError::JobNotFound(id)) if id == job.id
    ));
    assert_eq!(
        backend
            .logs(job.id, Pagination::default())
            .await
            .unwrap()
            .total,
        0
    );
}
