use async_trait::async_trait;
use chrono::{DateTime, Utc};
use chronos::{
    backend::{JobStore, LogStore, NewJob, Statistics, StoreError},
    execution_log::{ExecutionLogEntry, NewLogEntry},
    job::{
        query::{JobQuery, Page, Pagination},
        Job, JobId, JobStatus,
    },
};
use tracing::instrument;

use crate::{store_error, types, PgBackend};

macro_rules! job_columns {
    () => {
        "id, name, description, job_type, status, payload, priority, max_retries, retry_count, \
         scheduled_at, cron_expression, schedule_active, next_execution, last_execution, \
         started_at, completed_at, error_message, cancel_requested, execution_token, version, \
         previous_occurrence, created_by, created_at, updated_at"
    };
}
pub(crate) use job_columns;

const LOG_COLUMNS: &str = "id, job_id, level, message, details, slot, duration_ms, created_at";

fn bigint(id: JobId, column: &str, value: u64) -> Result<i64, StoreError> {
    i64::try_from(value)
        .map_err(|_| StoreError::Corrupt(format!("job {id} has an invalid {column}: {value}")))
}

fn row_limit(value: usize) -> i64 {
    i64::try_from(value).unwrap_or(i64::MAX)
}

impl PgBackend {
    async fn exists(&self, id: JobId) -> Result<bool, StoreError> {
        sqlx::query_scalar("SELECT EXISTS(SELECT 1 FROM chronos_jobs WHERE id = $1)")
            .bind(i64::from(id))
            .fetch_one(&self.pool)
            .await
            .map_err(store_error)
    }

    /// Distinguishes a lost race from a missing job after a conditional write matched no row.
    async fn missed_write(&self, id: JobId) -> StoreError {
        match self.exists(id).await {
            Ok(true) => StoreError::Conflict(id),
            Ok(false) => StoreError::JobNotFound(id),
            Err(error) => error,
        }
    }

    async fn jobs_where(
        &self,
        condition: &str,
        at: DateTime<Utc>,
    ) -> Result<Vec<Job>, StoreError> {
        let sql = format!(
            concat!("SELECT ", job_columns!(), " FROM chronos_jobs WHERE {} ORDER BY id"),
            condition
        );
        sqlx::query_as::<_, types::Job>(&sql)
            .bind(at)
            .fetch_all(&self.pool)
            .await
            .map_err(store_error)?
            .into_iter()
            .map(TryFrom::try_from)
            .collect()
    }
}

#[async_trait]
impl JobStore for PgBackend {
    #[instrument(skip_all, fields(name = %job.name))]
    async fn insert(&self, job: NewJob) -> Result<Job, StoreError> {
        let schedule = job.schedule.as_ref();
        let inserted = sqlx::query_as::<_, types::Job>(concat!(
            "INSERT INTO chronos_jobs (
                name, description, job_type, status, payload, priority, max_retries,
                retry_count, scheduled_at, cron_expression, schedule_active, next_execution,
                last_execution, cancel_requested, execution_token, version,
                previous_occurrence, created_by, created_at, updated_at
            )
            VALUES ($1, $2, $3, 'scheduled', $4, $5, $6, 0, $7, $8, $9, $10, $11, FALSE, 0, 0,
                $12, $13, $14, $14)
            ON CONFLICT (previous_occurrence) DO NOTHING
            RETURNING ",
            job_columns!()
        ))
        .bind(&job.name)
        .bind(job.description.as_deref())
        .bind(types::JobType::from(job.job_type))
        .bind(&job.payload)
        .bind(i16::from(u8::from(job.priority)))
        .bind(i32::from(job.max_retries))
        .bind(job.scheduled_at)
        .bind(schedule.map(|schedule| schedule.cron.as_str()))
        .bind(schedule.map(|schedule| schedule.is_active))
        .bind(schedule.and_then(|schedule| schedule.next_execution))
        .bind(schedule.and_then(|schedule| schedule.last_execution))
        .bind(job.previous_occurrence.map(i64::from))
        .bind(job.created_by.as_deref())
        .bind(job.created_at)
        .fetch_optional(&self.pool)
        .await
        .map_err(store_error)?;

        match (inserted, job.previous_occurrence) {
            (Some(row), _) => row.try_into(),
            (None, Some(previous)) => {
                tracing::debug!(%previous, "Next occurrence already exists");
                sqlx::query_as::<_, types::Job>(concat!(
                    "SELECT ",
                    job_columns!(),
                    " FROM chronos_jobs WHERE previous_occurrence = $1"
                ))
                .bind(i64::from(previous))
                .fetch_one(&self.pool)
                .await
                .map_err(store_error)?
                .try_into()
            }
            (None, None) => Err(StoreError::BadState),
        }
    }

    async fn get(&self, id: JobId) -> Result<Option<Job>, StoreError> {
        sqlx::query_as::<_, types::Job>(concat!(
            "SELECT ",
            job_columns!(),
            " FROM chronos_jobs WHERE id = $1"
        ))
        .bind(i64::from(id))
        .fetch_optional(&self.pool)
        .await
        .map_err(store_error)?
        .map(TryFrom::try_from)
        .transpose()
    }

    #[instrument(skip(self, job), fields(job_id = %job.id))]
    async fn compare_and_swap(&self, job: Job, expected_version: u64) -> Result<Job, StoreError> {
        let schedule = job.schedule.as_ref();
        let updated = sqlx::query_as::<_, types::Job>(concat!(
            "UPDATE chronos_jobs
            SET
                name = $3,
                description = $4,
                job_type = $5,
                status = $6,
                payload = $7,
                priority = $8,
                max_retries = $9,
                retry_count = $10,
                scheduled_at = $11,
                cron_expression = $12,
                schedule_active = $13,
                next_execution = $14,
                last_execution = $15,
                started_at = $16,
                completed_at = $17,
                error_message = $18,
                cancel_requested = $19,
                execution_token = $20,
                previous_occurrence = $21,
                created_by = $22,
                updated_at = $23,
                version = version + 1
            WHERE id = $1 AND version = $2
            RETURNING ",
            job_columns!()
        ))
        .bind(i64::from(job.id))
        .bind(bigint(job.id, "version", expected_version)?)
        .bind(&job.name)
        .bind(job.description.as_deref())
        .bind(types::JobType::from(job.job_type))
        .bind(types::JobStatus::from(job.status))
        .bind(&job.payload)
        .bind(i16::from(u8::from(job.priority)))
        .bind(i32::from(job.max_retries))
        .bind(i32::from(job.retry_count))
        .bind(job.scheduled_at)
        .bind(schedule.map(|schedule| schedule.cron.as_str()))
        .bind(schedule.map(|schedule| schedule.is_active))
        .bind(schedule.and_then(|schedule| schedule.next_execution))
        .bind(schedule.and_then(|schedule| schedule.last_execution))
        .bind(job.started_at)
        .bind(job.completed_at)
        .bind(job.error_message.as_deref())
        .bind(job.cancel_requested)
        .bind(bigint(
            job.id,
            "execution token",
            u64::from(job.execution_token),
        )?)
        .bind(job.previous_occurrence.map(i64::from))
        .bind(job.created_by.as_deref())
        .bind(job.updated_at)
        .fetch_optional(&self.pool)
        .await
        .map_err(store_error)?;

        match updated {
            Some(row) => row.try_into(),
            None => Err(self.missed_write(job.id).await),
        }
    }

    #[instrument(skip(self))]
    async fn delete(&self, id: JobId, expected_version: u64) -> Result<(), StoreError> {
        let deleted = sqlx::query("DELETE FROM chronos_jobs WHERE id = $1 AND version = $2")
            .bind(i64::from(id))
            .bind(bigint(id, "version", expected_version)?)
            .execute(&self.pool)
            .await
            .map_err(store_error)?
            .rows_affected();
        match deleted {
            0 => Err(self.missed_write(id).await),
            1 => Ok(()),
            _ => Err(StoreError::BadState),
        }
    }

    async fn due_jobs(
        &self,
        status: JobStatus,
        now: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<Job>, StoreError> {
        sqlx::query_as::<_, types::Job>(concat!(
            "SELECT ",
            job_columns!(),
            " FROM chronos_jobs
            WHERE status = $1 AND scheduled_at <= $2
            ORDER BY priority DESC, scheduled_at ASC, id ASC
            LIMIT $3"
        ))
        .bind(types::JobStatus::from(status))
        .bind(now)
        .bind(row_limit(limit))
        .fetch_all(&self.pool)
        .await
        .map_err(store_error)?
        .into_iter()
        .map(TryFrom::try_from)
        .collect()
    }

    async fn next_due_at(&self) -> Result<Option<DateTime<Utc>>, StoreError> {
        sqlx::query_scalar(
            "SELECT MIN(scheduled_at) FROM chronos_jobs WHERE status IN ('scheduled', 'retrying')",
        )
        .fetch_one(&self.pool)
        .await
        .map_err(store_error)
    }

    async fn query(&self, query: &JobQuery) -> Result<Page<Job>, StoreError> {
        self.run_query(query).await
    }

    async fn statistics(&self) -> Result<Statistics, StoreError> {
        let statuses = sqlx::query_as::<_, (types::JobStatus, i64)>(
            "SELECT status, COUNT(*) FROM chronos_jobs GROUP BY status",
        )
        .fetch_all(&self.pool)
        .await
        .map_err(store_error)?;
        let job_types = sqlx::query_as::<_, (types::JobType, i64)>(
            "SELECT job_type, COUNT(*) FROM chronos_jobs GROUP BY job_type",
        )
        .fetch_all(&self.pool)
        .await
        .map_err(store_error)?;

        Ok(Statistics::from_counts(
            statuses
                .into_iter()
                .map(|(status, count)| (status.into(), count.unsigned_abs())),
            job_types
                .into_iter()
                .map(|(job_type, count)| (job_type.into(), count.unsigned_abs())),
        ))
    }

    async fn stuck_jobs(&self, started_before: DateTime<Utc>) -> Result<Vec<Job>, StoreError> {
        self.jobs_where("status = 'running' AND started_at < $1", started_before)
            .await
    }

    async fn expired_jobs(
        &self,
        completed_before: DateTime<Utc>,
    ) -> Result<Vec<Job>, StoreError> {
        self.jobs_where(
            "status IN ('completed', 'failed', 'cancelled') AND completed_at < $1",
            completed_before,
        )
        .await
    }
}

#[async_trait]
impl LogStore for PgBackend {
    async fn append(&self, entry: NewLogEntry) -> Result<ExecutionLogEntry, StoreError> {
        let sql = format!(
            "INSERT INTO chronos_execution_logs
                (job_id, level, message, details, slot, duration_ms, created_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7)
            RETURNING {LOG_COLUMNS}"
        );
        sqlx::query_as::<_, types::LogEntry>(&sql)
            .bind(i64::from(entry.job_id))
            .bind(types::LogLevel::from(entry.level))
            .bind(&entry.message)
            .bind(&entry.details)
            .bind(entry.slot.as_deref())
            .bind(entry.duration_ms)
            .bind(entry.created_at)
            .fetch_one(&self.pool)
            .await
            .map(Into::into)
            .map_err(|error| match error {
                sqlx::Error::Database(error) if error.is_foreign_key_violation() => {
                    StoreError::JobNotFound(entry.job_id)
                }
                error => store_error(error),
            })
    }

    async fn logs(
        &self,
        job_id: JobId,
        pagination: Pagination,
    ) -> Result<Page<ExecutionLogEntry>, StoreError> {
        let sql = format!(
            "SELECT {LOG_COLUMNS} FROM chronos_execution_logs
            WHERE job_id = $1
            ORDER BY created_at ASC, id ASC
            LIMIT $2 OFFSET $3"
        );
        let items = sqlx::query_as::<_, types::LogEntry>(&sql)
            .bind(i64::from(job_id))
            .bind(i64::from(pagination.size))
            .bind(i64::try_from(pagination.offset()).unwrap_or(i64::MAX))
            .fetch_all(&self.pool)
            .await
            .map_err(store_error)?
            .into_iter()
            .map(Into::into)
            .collect();
        let total: i64 =
            sqlx::query_scalar("SELECT COUNT(*) FROM chronos_execution_logs WHERE job_id = $1")
                .bind(i64::from(job_id))
                .fetch_one(&self.pool)
                .await
                .map_err(store_error)?;

        Ok(Page {
            items,
            page: pagination.page,
            size: pagination.size,
            total: total.unsigned_abs(),
        })
    }
}
