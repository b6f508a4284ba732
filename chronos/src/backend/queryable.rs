use std::cmp::Ordering;

use crate::job::{
    query::{JobFilter, Sort, SortDirection, SortField},
    Job,
};

pub(super) trait Queryable {
    fn matches(&self, job: &Job) -> bool;
}

impl Queryable for JobFilter {
    fn matches(&self, job: &Job) -> bool {
        self.search.as_deref().map_or(true, |search| {
            let search = search.to_lowercase();
            job.name.to_lowercase().contains(&search)
                || job
                    .description
                    .as_deref()
                    .is_some_and(|description| description.to_lowercase().contains(&search))
        }) && self.status.map_or(true, |status| job.status == status)
            && self.job_type.map_or(true, |job_type| job.job_type == job_type)
            && self
                .created_by
                .as_deref()
                .map_or(true, |created_by| job.created_by.as_deref() == Some(created_by))
    }
}

pub(super) trait Sortable {
    fn compare(&self, a: &Job, b: &Job) -> Ordering;
}

impl Sortable for Sort {
    fn compare(&self, a: &Job, b: &Job) -> Ordering {
        let ordering = match self.field {
            SortField::CreatedAt => a.created_at.cmp(&b.created_at),
            SortField::UpdatedAt => a.updated_at.cmp(&b.updated_at),
            SortField::ScheduledAt => a.scheduled_at.cmp(&b.scheduled_at),
            SortField::Priority => a.priority.cmp(&b.priority),
            SortField::Name => a.name.cmp(&b.name),
            SortField::Status => a.status.cmp(&b.status),
        }
        .then(a.id.cmp(&b.id));
        match self.direction {
            SortDirection::Asc => ordering,
            SortDirection::Desc => ordering.reverse(),
        }
    }
}
