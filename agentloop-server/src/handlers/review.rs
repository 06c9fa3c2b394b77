use std::path::Path;
use std::sync::Arc;

use agentloop_core::{CommitSha, PrId, ReviewDecision, ReviewVerdict};
use async_trait::async_trait;
use serde_json::Value;
use tracing::{info, warn};

use super::{git_failure, remote, unexpected_spec, JobHandler, Services};
use crate::agent::{ReviewOutcome, ReviewTask};
use crate::error::JobError;
use crate::gateway::Role;
use crate::github::{PullRequestInfo, ReviewEvent};
use crate::http_client::CorrelationId;
use crate::queue::{unix_now, Job, JobKind, JobSpec, RepoTarget};
use crate::state_machine::{Event, Phase};
use crate::store::{CiSnapshot, PrRecord};
use crate::workspace::Workspace;

/// Runs the Reviewer Agent on the current head of a PR and reports its
/// decision to the state machine.
pub struct ReviewHandler {
    services: Arc<Services>,
}

impl ReviewHandler {
    pub fn new(services: Arc<Services>) -> Self {
        Self { services }
    }
}

/// CI as shown to the reviewer.
pub fn ci_summary(snapshot: Option<&CiSnapshot>) -> String {
    let Some(snapshot) = snapshot else {
        return "No CI result recorded for this commit.".to_string();
    };
    let mut summary = format!("Merged status: {}\n", snapshot.merged_status);
    for run in &snapshot.checks {
        let conclusion = match serde_json::to_value(run.conclusion) {
            Ok(Value::String(s)) => s,
            _ => "unknown".to_string(),
        };
        summary.push_str(&format!("- {}: {}\n", run.name, conclusion));
    }
    summary
}

#[async_trait]
impl JobHandler for ReviewHandler {
    async fn handle(&self, job: &Job) -> Result<(), JobError> {
        let JobSpec::Review { pr, head_sha } = &job.spec else {
            return Err(unexpected_spec(job, JobKind::Review));
        };
        let s = &self.services;

        let Some(record) = s.store.get_pr_state(pr).await? else {
            info!("Skipping review of {}: not agent-managed", pr);
            return Ok(());
        };
        if record.state.phase != Phase::UnderReview || !record.state.is_current(head_sha) {
            info!(
                "Skipping stale review of {} at {} (now {} at {:?})",
                pr,
                head_sha.short(),
                record.state.phase,
                record.state.head_sha.as_ref().map(CommitSha::short)
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

        let dir = s.prepare_checkout(&target, job.job_id).await?;
        let result = self
            .run(job, pr, head_sha, &record, &target, &info, &dir, &cid)
            .await;
        s.remove_checkout(&dir).await;
        result
    }
}

impl ReviewHandler {
    #[allow(clippy::too_many_arguments)]
    async fn run(
        &self,
        job: &Job,
        pr: &PrId,
        head_sha: &CommitSha,
        record: &PrRecord,
        target: &RepoTarget,
        info: &PullRequestInfo,
        dir: &Path,
        cid: &str,
    ) -> Result<(), JobError> {
        let s = &self.services;
        s.git
            .checkout_remote_branch(&info.head.ref_name, dir)
            .await
            .map_err(git_failure("checkout"))?;

        let (issue_title, issue_body) = match record.issue_number {
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
        let snapshot = s.store.get_ci_snapshot(pr, head_sha).await?;

        let workspace = Workspace::open(dir).map_err(|e| JobError::transient(e.to_string()))?;
        let gateway = s.gateway(
            Role::Reviewer,
            target,
            workspace,
            record.issue_number,
            Some(pr.number),
            Some(head_sha.clone()),
            cid,
        );
        let pr_label = pr.to_string();
        let run = s
            .agent
            .review(ReviewTask {
                pr_label: &pr_label,
                head_sha: head_sha.as_str(),
                issue_title: &issue_title,
                issue_body: &issue_body,
                ci_summary: &ci_summary(snapshot.as_ref()),
                gateway: &gateway,
                correlation_id: cid,
            })
            .await?;
        s.record_transcript(job.job_id, &run.transcript).await;

        let (decision, verdict): (ReviewDecision, ReviewVerdict) = match run.output {
            ReviewOutcome::Approve(v) => (ReviewDecision::Approve, v),
            ReviewOutcome::Fix(v) => (ReviewDecision::Fix, v),
            ReviewOutcome::Error(reason) => {
                return Err(JobError::transient(format!("reviewer failed: {}", reason)))
            }
        };
        info!("Reviewer decided {} on {} at {}", decision, pr, head_sha.short());

        let body = verdict.to_markdown();
        s.comment(cid, target, pr.number, &body).await;
        let event = match decision {
            ReviewDecision::Approve => ReviewEvent::Approve,
            ReviewDecision::Fix => ReviewEvent::RequestChanges,
        };
        if let Err(e) = s
            .repo_host
            .submit_review(Some(cid), target, pr.number, &body, event)
            .await
        {
            warn!("Failed to submit review on {}: {:#}", pr, e);
        }

        let applied = s
            .store
            .apply_pr_event(
                pr,
                Event::ReviewDecided {
                    head_sha: head_sha.clone(),
                    decision,
                    feedback: body,
                },
                unix_now(),
            )
            .await?;
        if let Some(applied) = applied {
            s.execute_effects(cid, target, pr.number, &applied.effects)
                .await;
        }
        Ok(())
    }
}
