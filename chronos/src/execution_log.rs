//! Append-only execution log entries recorded for every job.
use std::{sync::Arc, time::Instant};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::{
    backend::{LogStore, StoreError},
    job::JobId,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Ord, PartialOrd, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum LogLevel {
    Debug,
    Info,
    Warn,
    Error,
}

impl std::fmt::Display for LogLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            Self::Debug => "DEBUG",
            Self::Info => "INFO",
            Self::Warn => "WARN",
            Self::Error => "ERROR",
        })
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionLogEntry {
    pub id: i64,
    pub job_id: JobId,
    pub level: LogLevel,
    pub message: String,
    pub details: Option<serde_json::Value>,
    /// The runner slot that produced the entry.
    pub slot: Option<String>,
    pub duration_ms: Option<i64>,
    pub created_at: DateTime<Utc>,
}

/// An entry to be appended to a job's log.
#[derive(Debug, Clone, PartialEq)]
pub struct NewLogEntry {
    pub job_id: JobId,
    pub level: LogLevel,
    pub message: String,
    pub details: Option<serde_json::Value>,
    pub slot: Option<String>,
    pub duration_ms: Option<i64>,
    pub created_at: DateTime<Utc>,
}

impl NewLogEntry {
    pub fn new(job_id: JobId, level: LogLevel, message: impl Into<String>) -> Self {
        Self {
            job_id,
            level,
            message: message.into(),
            details: None,
            slot: None,
            duration_ms: None,
            created_at: Utc::now(),
        }
    }

    pub fn with_details(self, details: serde_json::Value) -> Self {
        Self {
            details: Some(details),
            ..self
        }
    }

    pub fn with_slot(self, slot: impl Into<String>) -> Self {
        Self {
            slot: Some(slot.into()),
            ..self
        }
    }

    pub fn with_duration(self, duration: std::time::Duration) -> Self {
        Self {
            duration_ms: Some(i64::try_from(duration.as_millis()).unwrap_or(i64::MAX)),
            ..self
        }
    }

    pub(crate) fn into_entry(self, id: i64) -> ExecutionLogEntry {
        ExecutionLogEntry {
            id,
            job_id: self.job_id,
            level: self.level,
            message: self.message,
            details: self.details,
            slot: self.slot,
            duration_ms: self.duration_ms,
            created_at: self.created_at,
        }
    }
}

/// Writes entries for one execution, stamping each with the slot and the elapsed time.
///
/// Failing to record an entry never fails the execution, the error is traced instead.
#[derive(Clone)]
pub(crate) struct LogReporter {
    store: Arc<dyn LogStore>,
    job_id: JobId,
    slot: String,
    started: Instant,
}

impl LogReporter {
    pub(crate) fn new(store: Arc<dyn LogStore>, job_id: JobId, slot: String) -> Self {
        Self {
            store,
            job_id,
            slot,
            started: Instant::now(),
        }
    }

    pub(crate) fn elapsed(&self) -> std::time::Duration {
        self.started.elapsed()
    }

    pub(crate) async fn record(
        &self,
        level: LogLevel,
        message: impl Into<String>,
        details: Option<serde_json::Value>,
    ) {
        let job_id = self.job_id;
        let mut entry = NewLogEntry::new(job_id, level, message)
            .with_slot(self.slot.clone())
            .with_duration(self.elapsed());
        entry.details = details;
        match self.store.append(entry).await {
            Ok(_) => {}
            Err(StoreError::JobNotFound(_)) => {
                tracing::debug!(%job_id, "Job {job_id} was deleted, dropping log entry")
            }
            Err(err) => tracing::error!(
                ?err,
                %job_id,
                "Failed to append execution log entry for job {job_id}: {err}"
            ),
        }
    }
}
