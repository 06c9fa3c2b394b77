use std::path::Path;
use std::sync::Arc;

use agentloop_core::{CodeProposal, CommitSha, PrId};
use async_trait::async_trait;
use tracing::info;

use super::{git_failure, remote, unexpected_spec, JobHandler, Services};
use crate::agent::CodeTask;
use crate::artifacts::ArtifactKind;
use crate::error::JobError;
use crate::gateway::Role;
use crate::github::{IssueInfo, NewPullRequest, PullRequestInfo};
use crate::http_client::CorrelationId;
use crate::queue::{unix_now, Job, JobKind, JobSpec, RepoTarget};
use crate::store::NewPr;
use crate::workspace::Workspace;

/// Turns an issue into a pull request.
pub struct CodeGenHandler {
    services: Arc<Services>,
}

impl CodeGenHandler {
    pub fn new(services: Arc<Services>) -> Self {
        Self { services }
    }
}

pub fn branch_name(issue_number: u64, job_id: i64) -> String {
    format!("agent/issue-{}-{}", issue_number, job_id)
}

fn pr_body(issue_number: u64, proposal: &CodeProposal) -> String {
    let mut body = format!("Closes #{}\n\n{}\n", issue_number, proposal.summary);
    if !proposal.tests.is_empty() {
        body.push_str(&format!("\n**Testing:** {}\n", proposal.tests));
    }
    body
}

#[async_trait]
impl JobHandler for CodeGenHandler {
    async fn handle(&self, job: &Job) -> Result<(), JobError> {
        let JobSpec::CodeGen {
            target,
            issue_number,
        } = &job.spec
        else {
            return Err(unexpected_spec(job, JobKind::CodeGen));
        };
        let cid = CorrelationId::for_job(job.job_id).0;
        let s = &self.services;

        if let Some(existing) = s.store.pr_for_issue(&target.repo, *issue_number).await? {
            info!(
                "Issue #{} already has agent PR {}; skipping",
                issue_number, existing.pr
            );
            return Ok(());
        }

        let issue = s
            .repo_host
            .get_issue(Some(&cid), target, *issue_number)
            .await
            .map_err(remote("fetch issue"))?;
        let base = s
            .repo_host
            .get_default_branch(Some(&cid), target)
            .await
            .map_err(remote("fetch default branch"))?;

        let dir = s.prepare_checkout(target, job.job_id).await?;
        let result = self.run(job, target, &issue, &base, &dir, &cid).await;
        s.remove_checkout(&dir).await;
        result
    }
}

impl CodeGenHandler {
    async fn run(
        &self,
        job: &Job,
        target: &RepoTarget,
        issue: &IssueInfo,
        base: &str,
        dir: &Path,
        cid: &str,
    ) -> Result<(), JobError> {
        let s = &self.services;
        let branch = branch_name(issue.number, job.job_id);

        // An earlier attempt may have opened the PR and died before
        // registering it.
        let existing = s
            .repo_host
            .find_open_pull_request(Some(cid), target, &branch)
            .await
            .map_err(remote("look up pull request"))?;
        if let Some(pr) = existing {
            info!(
                "Adopting {}#{} opened by an earlier attempt",
                target.repo, pr.number
            );
            s.git
                .checkout_remote_branch(&branch, dir)
                .await
                .map_err(git_failure("checkout"))?;
            let sha = s
                .git
                .head_sha(dir)
                .await
                .map(CommitSha::from)
                .map_err(git_failure("rev-parse"))?;
            return self.register(target, issue, &pr, sha, cid).await;
        }

        s.git
            .create_branch(&branch, dir)
            .await
            .map_err(git_failure("create branch"))?;

        let workspace = Workspace::open(dir).map_err(|e| JobError::transient(e.to_string()))?;
        let gateway = s.gateway(
            Role::CodeAgent,
            target,
            workspace.clone(),
            Some(issue.number),
            None,
            None,
            cid,
        );
        let run = s
            .agent
            .propose_change(CodeTask {
                issue_title: &issue.title,
                issue_body: &issue.body,
                feedback: None,
                gateway: &gateway,
                correlation_id: cid,
            })
            .await?;
        s.record_transcript(job.job_id, &run.transcript).await;
        let proposal = run.output;

        if proposal.is_empty() {
            info!("Code agent proposed no changes for issue #{}", issue.number);
            let body = format!(
                "No changes were proposed for this issue.\n\n{}",
                proposal.summary
            );
            s.comment(cid, target, issue.number, &body).await;
            return Ok(());
        }

        s.apply_edits(&workspace, proposal.edits.clone()).await?;
        if !s.git.has_changes(dir).await.map_err(git_failure("status"))? {
            let body = format!(
                "The proposed edits left the repository unchanged.\n\n{}",
                proposal.summary
            );
            s.comment(cid, target, issue.number, &body).await;
            return Ok(());
        }

        let diff = s.git.stage_all(dir).await.map_err(git_failure("stage"))?;
        s.record_artifact(job.job_id, ArtifactKind::Diff, diff.as_bytes())
            .await;
        let message = format!("{}\n\nCloses #{}", issue.title, issue.number);
        let sha = s
            .git
            .commit(&message, dir)
            .await
            .map(CommitSha::from)
            .map_err(git_failure("commit"))?;
        // The branch belongs to this job; a push left by an earlier attempt
        // is replaced.
        s.git
            .force_push_branch(&branch, dir)
            .await
            .map_err(git_failure("push"))?;

        let pr = s
            .repo_host
            .create_pull_request(
                Some(cid),
                target,
                &NewPullRequest {
                    title: issue.title.clone(),
                    head: branch.clone(),
                    base: base.to_string(),
                    body: pr_body(issue.number, &proposal),
                },
            )
            .await
            .map_err(remote("open pull request"))?;
        info!(
            "Opened {}#{} for issue #{} at {}",
            target.repo,
            pr.number,
            issue.number,
            sha.short()
        );
        self.register(target, issue, &pr, sha, cid).await
    }

    /// Put the PR under management and point the issue at it.
    async fn register(
        &self,
        target: &RepoTarget,
        issue: &IssueInfo,
        pr: &PullRequestInfo,
        sha: CommitSha,
        cid: &str,
    ) -> Result<(), JobError> {
        let s = &self.services;
        let pr_id = PrId::new(target.repo.clone(), pr.number);
        let applied = s
            .store
            .create_pr_state(
                NewPr {
                    pr: pr_id,
                    issue_number: issue.number,
                    installation_id: target.installation_id,
                    max_iterations: s.settings.max_iterations,
                    head_sha: sha,
                },
                unix_now(),
            )
            .await?;
        s.execute_effects(cid, target, pr.number, &applied.effects)
            .await;

        let link = if pr.html_url.is_empty() {
            format!("#{}", pr.number)
        } else {
            pr.html_url.clone()
        };
        s.comment(cid, target, issue.number, &format!("Opened {}", link))
            .await;
        Ok(())
    }
}
