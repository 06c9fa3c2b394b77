use std::path::Path;
use std::sync::Arc;

use agentloop_core::{CommitSha, PrId};
use async_trait::async_trait;
use tracing::info;

use super::{git_failure, remote, unexpected_spec, JobHandler, Services};
use crate::agent::CodeTask;
use crate::artifacts::ArtifactKind;
use crate::error::JobError;
use crate::gateway::Role;
use crate::github::PullRequestInfo;
use crate::http_client::CorrelationId;
use crate::queue::{unix_now, Job, JobKind, JobSpec, RepoTarget};
use crate::state_machine::{Event, Phase};
use crate::store::PrRecord;
use crate::workspace::Workspace;

/// Pushes the Code Agent's answer to a review onto the PR branch.
pub struct FixIterationHandler {
    services: Arc<Services>,
}

impl FixIterationHandler {
    pub fn new(services: Arc<Services>) -> Self {
        Self { services }
    }
}

/// The job's view of one fix request.
struct FixRequest<'a> {
    pr: &'a PrId,
    head_sha: &'a CommitSha,
    iteration: u32,
    feedback: &'a str,
}

#[async_trait]
impl JobHandler for FixIterationHandler {
    async fn handle(&self, job: &Job) -> Result<(), JobError> {
        let JobSpec::FixIteration {
            pr,
            head_sha,
            iteration,
            feedback,
        } = &job.spec
        else {
            return Err(unexpected_spec(job, JobKind::FixIteration));
        };
        let s = &self.services;

        let Some(record) = s.store.get_pr_state(pr).await? else {
            info!("Skipping fix of {}: not agent-managed", pr);
            return Ok(());
        };
        if record.state.phase != Phase::FixRequested || !record.state.is_current(head_sha) {
            info!(
                "Skipping stale fix iteration {} of {} (now {})",
                iteration, pr, record.state.phase
            );
            return Ok(());
        }

        let cid = CorrelationId::for_job(job.job_id).0;
        let target = RepoTarget {
            repo: pr.repo.clone(),
            installation_id: record.installation_id,
        };
        let info = s
            .repo_host
            .get_pull_request(Some(&cid), &target, pr.number)
            .await
            .map_err(remote("fetch pull request"))?;

        let request = FixRequest {
            pr,
            head_sha,
            iteration: *iteration,
            feedback,
        };
        let dir = s.prepare_checkout(&target, job.job_id).await?;
        let result = self
            .run(job, &request, &record, &target, &info, &dir, &cid)
            .await;
        s.remove_checkout(&dir).await;
        result
    }
}

impl FixIterationHandler {
    #[allow(clippy::too_many_arguments)]
    async fn run(
        &self,
        job: &Job,
        request: &FixRequest<'_>,
        record: &PrRecord,
        target: &RepoTarget,
        info: &PullRequestInfo,
        dir: &Path,
        cid: &str,
    ) -> Result<(), JobError> {
        let s = &self.services;
        let branch = &info.head.ref_name;
        s.git
            .checkout_remote_branch(branch, dir)
            .await
            .map_err(git_failure("checkout"))?;

        let local_head = s
            .git
            .head_sha(dir)
            .await
            .map(CommitSha::from)
            .map_err(git_failure("rev-parse"))?;
        if &local_head != request.head_sha {
            // The branch moved since the review; the push event will
            // supersede this request.
            info!(
                "Branch {} is at {}, not {}; skipping fix",
                branch,
                local_head.short(),
                request.head_sha.short()
            );
            return Ok(());
        }

        let (title, body) = match record.issue_number {
            Some(number) => {
                let issue = s
                    .repo_host
                    .get_issue(Some(cid), target, number)
                    .await
                    .map_err(remote("fetch issue"))?;
                (issue.title, issue.body)
            }
            None => (info.title.clone(), info.body.clone()),
        };

        let workspace = Workspace::open(dir).map_err(|e| JobError::transient(e.to_string()))?;
        let gateway = s.gateway(
            Role::CodeAgent,
            target,
            workspace.clone(),
            record.issue_number,
            None,
            None,
            cid,
        );
        let run = s
            .agent
            .propose_change(CodeTask {
                issue_title: &title,
                issue_body: &body,
                feedback: Some(request.feedback),
                gateway: &gateway,
                correlation_id: cid,
            })
            .await?;
        s.record_transcript(job.job_id, &run.transcript).await;

        let proposal = run.output;
        if proposal.is_empty() {
            return Err(JobError::permanent(format!(
                "fix iteration {} of {} produced no edits: {}",
                request.iteration, request.pr, proposal.summary
            )));
        }
        s.apply_edits(&workspace, proposal.edits).await?;
        if !s.git.has_changes(dir).await.map_err(git_failure("status"))? {
            return Err(JobError::permanent(format!(
                "fix iteration {} of {} left the branch unchanged",
                request.iteration, request.pr
            )));
        }

        let diff = s.git.stage_all(dir).await.map_err(git_failure("stage"))?;
        s.record_artifact(job.job_id, ArtifactKind::Diff, diff.as_bytes())
            .await;
        let message = format!(
            "Address review feedback (iteration {})\n\n{}",
            request.iteration, proposal.summary
        );
        let after = s
            .git
            .commit(&message, dir)
            .await
            .map(CommitSha::from)
            .map_err(git_failure("commit"))?;
        s.git
            .push_branch(branch, dir)
            .await
            .map_err(git_failure("push"))?;
        info!(
            "Pushed fix iteration {} to {}: {} -> {}",
            request.iteration,
            request.pr,
            request.head_sha.short(),
            after.short()
        );

        let applied = s
            .store
            .apply_pr_event(
                request.pr,
                Event::HeadPushed {
                    before: request.head_sha.clone(),
                    after,
                },
                unix_now(),
            )
            .await?;
        if let Some(applied) = applied {
            s.execute_effects(cid, target, request.pr.number, &applied.effects)
                .await;
        }
        Ok(())
    }
}
