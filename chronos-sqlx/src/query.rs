use chronos::{
    backend::StoreError,
    job::{
        query::{JobFilter, JobQuery, Page, Sort, SortDirection, SortField},
        Job,
    },
};
use sqlx::{Postgres, QueryBuilder};

use crate::{backend::job_columns, store_error, types, PgBackend};

pub(crate) trait ToQuery {
    fn push_to<'a>(&'a self, builder: &mut QueryBuilder<'a, Postgres>);
}

impl ToQuery for JobFilter {
    fn push_to<'a>(&'a self, builder: &mut QueryBuilder<'a, Postgres>) {
        builder.push(" WHERE TRUE");
        if let Some(search) = &self.search {
            let pattern = format!("%{}%", escape_like(search));
            builder.push(" AND (name ILIKE ");
            builder.push_bind(pattern.clone());
            builder.push(" OR description ILIKE ");
            builder.push_bind(pattern);
            builder.push(")");
        }
        if let Some(status) = self.status {
            builder.push(" AND status = ");
            builder.push_bind(types::JobStatus::from(status));
        }
        if let Some(job_type) = self.job_type {
            builder.push(" AND job_type = ");
            builder.push_bind(types::JobType::from(job_type));
        }
        if let Some(created_by) = &self.created_by {
            builder.push(" AND created_by = ");
            builder.push_bind(created_by.as_str());
        }
    }
}

impl ToQuery for Sort {
    fn push_to<'a>(&'a self, builder: &mut QueryBuilder<'a, Postgres>) {
        let column = match self.field {
            SortField::CreatedAt => "created_at",
            SortField::UpdatedAt => "updated_at",
            SortField::ScheduledAt => "scheduled_at",
            SortField::Priority => "priority",
            SortField::Name => "name COLLATE \"C\"",
            SortField::Status => "status",
        };
        let direction = match self.direction {
            SortDirection::Asc => "ASC",
            SortDirection::Desc => "DESC",
        };
        builder.push(format!(" ORDER BY {column} {direction}, id {direction}"));
    }
}

impl ToQuery for JobQuery {
    fn push_to<'a>(&'a self, builder: &mut QueryBuilder<'a, Postgres>) {
        self.filter.push_to(builder);
        self.sort.push_to(builder);
        builder.push(" LIMIT ");
        builder.push_bind(i64::from(self.pagination.size));
        builder.push(" OFFSET ");
        builder.push_bind(i64::try_from(self.pagination.offset()).unwrap_or(i64::MAX));
    }
}

fn escape_like(value: &str) -> String {
    let mut escaped = String::with_capacity(value.len());
    for c in value.chars() {
        if matches!(c, '\\' | '%' | '_') {
            escaped.push('\\');
        }
        escaped.push(c);
    }
    escaped
}

fn select(query: &JobQuery) -> QueryBuilder<'_, Postgres> {
    let mut builder = QueryBuilder::new(concat!("SELECT ", job_columns!(), " FROM chronos_jobs"));
    query.push_to(&mut builder);
    builder
}

fn count(filter: &JobFilter) -> QueryBuilder<'_, Postgres> {
    let mut builder = QueryBuilder::new("SELECT COUNT(*) FROM chronos_jobs");
    filter.push_to(&mut builder);
    builder
}

impl PgBackend {
    pub(crate) async fn run_query(&self, query: &JobQuery) -> Result<Page<Job>, StoreError> {
        let mut jobs = select(query);
        let items = jobs
            .build_query_as::<types::Job>()
            .fetch_all(&self.pool)
            .await
            .map_err(store_error)?
            .into_iter()
            .map(TryFrom::try_from)
            .collect::<Result<Vec<_>, _>>()?;
        let mut matches = count(&query.filter);
        let total: i64 = matches
            .build_query_scalar()
            .fetch_one(&self.pool)
            .await
            .map_err(store_error)?;

        Ok(Page {
            items,
            page: query.pagination.page,
            size: query.pagination.size,
            total: total.unsigned_abs(),
        })
    }
}

#[cfg(test)]
mod test {
    use chronos::job::{
        query::{JobFilter, Pagination},
        JobStatus, JobType,
    };

    use super::*;

    #[test]
    fn like_patterns_are_escaped() {
        assert_eq!(escape_like("50%_off\\"), "50\\%\\_off\\\\");
        assert_eq!(escape_like("report"), "report");
    }

    #[test]
    fn unfiltered_query() {
        let query = JobQuery::default();
        let builder = select(&query);

        assert!(builder.sql().ends_with(
            " FROM chronos_jobs WHERE TRUE ORDER BY created_at DESC, id DESC LIMIT $1 OFFSET $2"
        ));
    }

    #[test]
    fn filtered_sorted_query() {
        let query = JobQuery::new(
            JobFilter::default()
                .with_search("report")
                .with_status(JobStatus::Failed)
                .with_job_type(JobType::Batch)
                .with_created_by("ops"),
        )
        .with_sort(Sort::asc(SortField::Name))
        .with_pagination(Pagination::new(2, 25));
        let builder = select(&query);

        assert!(builder.sql().ends_with(concat!(
            " WHERE TRUE AND (name ILIKE $1 OR description ILIKE $2)",
            " AND status = $3 AND job_type = $4 AND created_by = $5",
            " ORDER BY name COLLATE \"C\" ASC, id ASC LIMIT $6 OFFSET $7"
        )));
    }

    #[test]
    fn count_ignores_sort_and_pagination() {
        let filter = JobFilter::default().with_status(JobStatus::Running);
        let builder = count(&filter);

        assert_eq!(
            builder.sql(),
            "SELECT COUNT(*) FROM chronos_jobs WHERE TRUE AND status = $1"
        );
    }
}
