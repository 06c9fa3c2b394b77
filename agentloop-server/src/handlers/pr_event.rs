use std::sync::Arc;

use async_trait::async_trait;
use tracing::{debug, info};

use super::{remote, unexpected_spec, JobHandler, Services};
use crate::error::JobError;
use crate::http_client::CorrelationId;
use crate::queue::{unix_now, Job, JobKind, JobSpec, PrActivity, RepoTarget};
use crate::state_machine::Event;
use crate::store::CiSnapshot;

/// Feeds PR lifecycle and CI activity into the state machine.
pub struct PrEventHandler {
    services: Arc<Services>,
}

impl PrEventHandler {
    pub fn new(services: Arc<Services>) -> Self {
        Self { services }
    }
}

#[async_trait]
impl JobHandler for PrEventHandler {
    async fn handle(&self, job: &Job) -> Result<(), JobError> {
        let JobSpec::PrEvent { pr, activity } = &job.spec else {
            return Err(unexpected_spec(job, JobKind::PrEvent));
        };
        let s = &self.services;

        let Some(record) = s.store.get_pr_state(pr).await? else {
            debug!("Ignoring activity on {}: not agent-managed", pr);
            return Ok(());
        };
        let cid = CorrelationId::for_job(job.job_id).0;
        let target = RepoTarget {
            repo: pr.repo.clone(),
            installation_id: record.installation_id,
        };

        let event = match activity {
            PrActivity::Opened { head_sha } => Event::PrOpened {
                head_sha: head_sha.clone(),
            },
            PrActivity::Pushed { before, after } => Event::HeadPushed {
                before: before.clone(),
                after: after.clone(),
            },
            PrActivity::Closed { merged } => Event::Closed { merged: *merged },
            PrActivity::CiActivity { head_sha } => {
                if !record.state.is_current(head_sha) {
                    debug!("Ignoring CI for {} at old head {}", pr, head_sha.short());
                    return Ok(());
                }
                let checks = s
                    .repo_host
                    .get_check_runs(Some(&cid), &target, head_sha)
                    .await
                    .map_err(remote("fetch check runs"))?;
                let status = s.settings.ci_policy.merged_status(head_sha, &checks);
                info!(
                    "CI for {} at {}: {} ({} checks)",
                    pr,
                    head_sha.short(),
                    status,
                    checks.len()
                );
                s.store
                    .upsert_ci_snapshot(
                        pr,
                        CiSnapshot {
                            head_sha: head_sha.clone(),
                            merged_status: status,
                            checks,
                            updated_at: unix_now(),
                        },
                    )
                    .await?;
                Event::CiCompleted {
                    head_sha: head_sha.clone(),
                    status,
                }
            }
        };

        let name = event.name();
        if let Some(applied) = s.store.apply_pr_event(pr, event, unix_now()).await? {
            if applied.changed() {
                info!(
                    "{} moved {} -> {} on {}",
                    pr,
                    applied.from,
                    applied.record.state.phase,
                    name
                );
            }
            s.execute_effects(&cid, &target, pr.number, &applied.effects)
                .await;
        }
        Ok(())
    }
}
