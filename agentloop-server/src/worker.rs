//! The job worker.
//!
//! Strictly sequential: lease one job, dispatch it through the handler table
//! under a timeout, commit the outcome, repeat. Expired leases are reaped on
//! start and every reap interval.

use std::sync::Arc;
use std::time::Duration;

use serde_json::json;
use tokio::sync::watch;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use crate::artifacts::{ArtifactKind, Artifacts};
use crate::config::Config;
use crate::error::{JobError, StoreError};
use crate::github::RepoHost;
use crate::handlers::HandlerTable;
use crate::http_client::CorrelationId;
use crate::queue::{unix_now, FailOutcome, Job, JobSpec, RepoTarget, RetryPolicy};
use crate::store::Store;

#[derive(Debug, Clone)]
pub struct WorkerSettings {
    pub worker_id: String,
    pub lease_duration: Duration,
    pub job_timeout: Duration,
    pub reap_interval: Duration,
    pub poll_interval: Duration,
    pub retry_policy: RetryPolicy,
    pub delivery_retention: Duration,
}

impl WorkerSettings {
    pub fn from_config(config: &Config, worker_id: impl Into<String>) -> Self {
        Self {
            worker_id: worker_id.into(),
            lease_duration: config.lease_duration,
            job_timeout: config.job_timeout,
            reap_interval: config.reap_interval,
            poll_interval: config.worker_poll_interval,
            retry_policy: config.retry_policy(),
            delivery_retention: config.delivery_retention,
        }
    }
}

/// A worker id unique enough to tell processes apart in lease columns.
pub fn default_worker_id() -> String {
    format!("worker-{}-{}", std::process::id(), &uuid::Uuid::new_v4().to_string()[..8])
}

pub struct Worker {
    store: Store,
    handlers: HandlerTable,
    artifacts: Artifacts,
    repo_host: Arc<dyn RepoHost>,
    settings: WorkerSettings,
}

impl Worker {
    pub fn new(
        store: Store,
        handlers: HandlerTable,
        artifacts: Artifacts,
        repo_host: Arc<dyn RepoHost>,
        settings: WorkerSettings,
    ) -> Self {
        Self {
            store,
            handlers,
            artifacts,
            repo_host,
            settings,
        }
    }

    /// Run until `shutdown` turns true. The in-flight job always finishes.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        info!("Worker {} started", self.settings.worker_id);
        let mut next_maintenance = Instant::now();

        loop {
            if *shutdown.borrow() {
                break;
            }
            if Instant::now() >= next_maintenance {
                self.maintenance().await;
                next_maintenance = Instant::now() + self.settings.reap_interval;
            }

            let worked = match self.run_once().await {
                Ok(worked) => worked,
                Err(e) => {
                    error!("Worker loop error: {}", e);
                    false
                }
            };
            if worked {
                continue;
            }

            tokio::select! {
                _ = tokio::time::sleep(self.settings.poll_interval) => {}
                Ok(()) = shutdown.changed() => {}
            }
        }
        info!("Worker {} stopped", self.settings.worker_id);
    }

    /// Reap expired leases and prune old delivery records.
    pub async fn maintenance(&self) {
        let now = unix_now();
        match self
            .store
            .reap_expired_leases(self.settings.retry_policy, now)
            .await
        {
            Ok(reaped) => {
                for job in reaped {
                    warn!("Reaped expired lease on job {}: {:?}", job.job_id, job.outcome);
                    if job.outcome == FailOutcome::Failed {
                        if let Ok(Some(failed)) = self.store.get_job(job.job_id).await {
                            let reason = failed
                                .last_error
                                .clone()
                                .unwrap_or_else(|| "lease expired".to_string());
                            self.write_failure_log(&failed, failed.attempt_count, true, &reason)
                                .await;
                            self.notify_terminal_failure(&failed, failed.attempt_count, &reason)
                                .await;
                        }
                    }
                }
            }
            Err(e) => error!("Failed to reap expired leases: {}", e),
        }

        let retention = i64::try_from(self.settings.delivery_retention.as_secs()).unwrap_or(i64::MAX);
        match self.store.prune_before(now.saturating_sub(retention)).await {
            Ok(0) => {}
            Ok(n) => info!("Pruned {} old delivery and timeline rows", n),
            Err(e) => warn!("Failed to prune deliveries: {}", e),
        }
    }

    /// Lease and process at most one job. `true` if a job was processed.
    pub async fn run_once(&self) -> Result<bool, StoreError> {
        let Some(job) = self
            .store
            .lease(
                &self.settings.worker_id,
                self.settings.lease_duration,
                unix_now(),
            )
            .await?
        else {
            return Ok(false);
        };

        info!(
            "Processing job {} ({}, attempt {})",
            job.job_id,
            job.kind(),
            job.attempt_count + 1
        );
        let outcome = self.execute(&job).await;
        self.commit(&job, outcome).await;
        Ok(true)
    }

    async fn execute(&self, job: &Job) -> Result<(), JobError> {
        let Some(handler) = self.handlers.get(&job.kind()) else {
            return Err(JobError::permanent(format!(
                "no handler for job kind {}",
                job.kind()
            )));
        };
        match tokio::time::timeout(self.settings.job_timeout, handler.handle(job)).await {
            Ok(result) => result,
            Err(_) => Err(JobError::transient(format!(
                "timed out after {}s",
                self.settings.job_timeout.as_secs()
            ))),
        }
    }

    async fn commit(&self, job: &Job, outcome: Result<(), JobError>) {
        let worker_id = &self.settings.worker_id;
        match outcome {
            Ok(()) => match self.store.complete(job.job_id, worker_id, unix_now()).await {
                Ok(()) => info!("Job {} done", job.job_id),
                Err(e @ StoreError::LeaseLost { .. }) => warn!("Discarding result: {}", e),
                Err(e) => error!("Failed to complete job {}: {}", job.job_id, e),
            },
            Err(err) => {
                warn!("Job {} failed: {}", job.job_id, err);
                self.write_failure_log(job, job.attempt_count + 1, err.is_retryable(), err.message())
                    .await;
                match self
                    .store
                    .fail(
                        job.job_id,
                        worker_id,
                        err.message(),
                        err.is_retryable(),
                        self.settings.retry_policy,
                        unix_now(),
                    )
                    .await
                {
                    Ok(FailOutcome::Retrying { available_at }) => {
                        info!(
                            "Job {} will be retried in {}s",
                            job.job_id,
                            available_at - unix_now()
                        );
                    }
                    Ok(FailOutcome::Failed) => {
                        error!("Job {} failed permanently: {}", job.job_id, err);
                        self.notify_terminal_failure(job, job.attempt_count + 1, &err.to_string())
                            .await;
                    }
                    Err(e @ StoreError::LeaseLost { .. }) => warn!("Discarding failure: {}", e),
                    Err(e) => error!("Failed to record failure of job {}: {}", job.job_id, e),
                }
            }
        }
    }

    async fn write_failure_log(&self, job: &Job, attempt: u32, retryable: bool, error: &str) {
        let entry = json!({
            "job_id": job.job_id,
            "kind": job.kind(),
            "attempt": attempt,
            "retryable": retryable,
            "error": error,
            "spec": job.spec,
            "worker_id": self.settings.worker_id,
            "at": unix_now(),
        });
        let bytes = match serde_json::to_vec_pretty(&entry) {
            Ok(bytes) => bytes,
            Err(e) => {
                warn!("Failed to serialise failure log for job {}: {}", job.job_id, e);
                return;
            }
        };
        if let Err(e) = self
            .artifacts
            .record(job.job_id, ArtifactKind::Log, &bytes)
            .await
        {
            warn!("Failed to record failure log for job {}: {:#}", job.job_id, e);
        }
    }

    /// Tell the humans on the originating thread. Best effort.
    async fn notify_terminal_failure(&self, job: &Job, attempts: u32, reason: &str) {
        let target = match &job.spec {
            JobSpec::CodeGen { target, .. } => target.clone(),
            other => {
                let Some(pr) = other.pr() else { return };
                match self.store.get_pr_state(pr).await {
                    Ok(Some(record)) => RepoTarget {
                        repo: pr.repo.clone(),
                        installation_id: record.installation_id,
                    },
                    Ok(None) => {
                        debug!("No installation known for {}; not commenting", pr);
                        return;
                    }
                    Err(e) => {
                        warn!("Failed to look up {}: {}", pr, e);
                        return;
                    }
                }
            }
        };

        let body = format!(
            "agentloop gave up on {} job {} after {} attempt(s):\n\n```\n{}\n```",
            job.kind(),
            job.job_id,
            attempts,
            reason
        );
        let cid = CorrelationId::for_job(job.job_id).0;
        if let Err(e) = self
            .repo_host
            .post_comment(Some(&cid), &target, job.spec.thread_number(), &body)
            .await
        {
            warn!("Failed to report failure of job {}: {:#}", job.job_id, e);
        }
    }
}
