//! Events published when a job reaches a terminal state.
//!
//! The engine calls [`Notifier::notify`] once a job has durably become completed, failed or
//! cancelled. Delivery is best effort: a notifier must not fail the transition that triggered it.
use async_stream::stream;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::Stream;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

use crate::job::{Job, JobId, JobStatus, JobType};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobEvent {
    pub job_id: JobId,
    pub name: String,
    pub job_type: JobType,
    pub status: JobStatus,
    pub retry_count: u16,
    pub error_message: Option<String>,
    pub occurred_at: DateTime<Utc>,
}

impl From<&Job> for JobEvent {
    fn from(job: &Job) -> Self {
        Self {
            job_id: job.id,
            name: job.name.clone(),
            job_type: job.job_type,
            status: job.status,
            retry_count: job.retry_count,
            error_message: job.error_message.clone(),
            occurred_at: job.completed_at.unwrap_or(job.updated_at),
        }
    }
}

#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait Notifier: Send + Sync {
    async fn notify(&self, event: JobEvent);
}

/// Writes every event to the `tracing` subscriber, the default notifier.
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingNotifier;

#[async_trait]
impl Notifier for TracingNotifier {
    async fn notify(&self, event: JobEvent) {
        match event.status {
            JobStatus::Failed => tracing::warn!(
                job_id = %event.job_id,
                status = %event.status,
                error = event.error_message.as_deref(),
                "Job {} ({}) failed",
                event.job_id,
                event.name,
            ),
            status => tracing::info!(
                job_id = %event.job_id,
                %status,
                "Job {} ({}) is {status}",
                event.job_id,
                event.name,
            ),
        }
    }
}

/// Fans events out to any number of in process subscribers.
#[derive(Debug, Clone)]
pub struct BroadcastNotifier {
    sender: broadcast::Sender<JobEvent>,
}

impl BroadcastNotifier {
    /// `capacity` events are buffered per subscriber, slower subscribers skip the oldest.
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { sender }
    }

    pub fn subscribe(&self) -> impl Stream<Item = JobEvent> {
        let mut receiver = self.sender.subscribe();
        stream! {
            loop {
                match receiver.recv().await {
                    Ok(event) => yield event,
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        tracing::warn!(skipped, "Job event subscriber lagged, skipped {skipped} events");
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        }
    }
}

#[async_trait]
impl Notifier for BroadcastNotifier {
    async fn notify(&self, event: JobEvent) {
        // No subscribers is not an error.
        let _ = self.sender.send(event);
    }
}
