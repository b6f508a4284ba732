use std::{ops::Sub, time::Duration};

use chrono::{TimeDelta, Utc};
use futures::{stream::FuturesOrdered, StreamExt};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::{admin::Admin, backend::Backend, backend::StoreError};

use super::{Sweep, SweeperConfig};

pub(crate) struct SweeperRunner<B: Backend> {
    config: SweeperConfig,
    admin: Admin<B>,
}

impl<B> SweeperRunner<B>
where
    B: Backend,
{
    pub(crate) fn new(admin: Admin<B>, config: SweeperConfig) -> Self {
        Self { config, admin }
    }

    pub(crate) fn spawn(self, cancellation_token: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(async move {
            loop {
                let Some(next) = self.config.schedule.upcoming(Utc).next() else {
                    tracing::warn!("Sweeper schedule has no future occurrence, stopping");
                    break;
                };
                let delay = next
                    .sub(Utc::now())
                    .to_std()
                    .unwrap_or(Duration::ZERO);
                tokio::select! {
                    _ = tokio::time::sleep(delay) => {
                        self.sweep().await;
                        let delay = next - Utc::now();
                        if delay > TimeDelta::zero() {
                            tokio::time::sleep(delay.to_std().unwrap_or_default()).await;
                        }
                    }
                    _ = cancellation_token.cancelled() => {
                        tracing::debug!("Shutting down the sweeper");
                        break;
                    },
                }
            }
        })
    }

    pub(crate) async fn sweep(&self) {
        self.config
            .sweeps
            .iter()
            .map(|sweep| self.run_sweep(*sweep))
            .collect::<FuturesOrdered<_>>()
            .filter_map(|res| async { res.err() })
            .for_each(|err| async move {
                tracing::error!(?err, "Failed to run sweep with error {err}")
            })
            .await;
    }

    async fn run_sweep(&self, sweep: Sweep) -> Result<(), StoreError> {
        match sweep {
            Sweep::Retention { days_old } => {
                let removed = self.admin.cleanup(days_old).await?;
                tracing::info!(removed, days_old, "Removed {removed} finished jobs");
            }
            Sweep::DetectStuck { timeout_minutes } => {
                for job in self.admin.find_stuck(timeout_minutes).await? {
                    tracing::warn!(
                        job_id = %job.id,
                        started_at = ?job.started_at,
                        "Job {} has been running for more than {timeout_minutes} minutes",
                        job.id,
                    );
                }
            }
            Sweep::ResetStuck { timeout_minutes } => {
                self.admin.reset_stuck(timeout_minutes).await?;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use std::{str::FromStr, sync::Arc};

    use tokio::sync::Notify;

    use crate::{
        backend::{memory::InMemoryBackend, JobStore, NewJob},
        job::JobStatus,
    };

    use super::*;

    async fn finished(backend: &InMemoryBackend, completed_at: chrono::DateTime<Utc>) {
        let mut job = backend.insert(NewJob::mock_job()).await.unwrap();
        let version = job.version;
        job.claim(completed_at).unwrap();
        job.complete(completed_at).unwrap();
        backend.compare_and_swap(job, version).await.unwrap();
    }

    #[tokio::test]
    async fn sweep_runs_every_configured_sweep() {
        let backend = InMemoryBackend::new();
        let now = Utc::now();
        finished(&backend, now - TimeDelta::days(40)).await;
        finished(&backend, now - TimeDelta::days(2)).await;
        let mut stuck = backend.insert(NewJob::mock_job()).await.unwrap();
        let version = stuck.version;
        stuck.claim(now - TimeDelta::hours(2)).unwrap();
        let stuck = backend.compare_and_swap(stuck, version).await.unwrap();

        let config = SweeperConfig::new(cron::Schedule::from_str("0 0 * * * *").unwrap())
            .with_sweeps([
                Sweep::DetectStuck {
                    timeout_minutes: 30,
                },
                Sweep::Retention { days_old: 31 },
                Sweep::ResetStuck {
                    timeout_minutes: 30,
                },
            ]);
        let runner = SweeperRunner::new(
            Admin::new(backend.clone(), Arc::new(Notify::new())),
            config,
        );

        runner.sweep().await;

        let statistics = backend.statistics().await.unwrap();
        assert_eq!(statistics.status(JobStatus::Completed), 1);
        assert_eq!(
            backend.get(stuck.id).await.unwrap().unwrap().status,
            JobStatus::Scheduled
        );
    }

    #[tokio::test]
    async fn spawned_sweeper_stops_on_cancellation() {
        let backend = InMemoryBackend::new();
        let cancellation_token = CancellationToken::new();
        let handle = SweeperRunner::new(
            Admin::new(backend, Arc::new(Notify::new())),
            SweeperConfig::new(cron::Schedule::from_str("0 0 0 1 1 *").unwrap()),
        )
        .spawn(cancellation_token.clone());

        cancellation_token.cancel();

        tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .unwrap()
            .unwrap();
    }
}
