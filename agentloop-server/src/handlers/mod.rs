//! Job handlers, one per [`JobKind`].
//!
//! Handlers share a [`Services`] bundle. They re-check the PR state before
//! acting, so a job made stale by a newer push or a close is a no-op.

pub mod code_gen;
pub mod fix_iteration;
pub mod pr_event;
pub mod review;

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use agentloop_core::{CiPolicy, CommitSha, FileEdit, RepoId};
use async_trait::async_trait;
use tracing::{info, warn};

use crate::agent::{Agent, ChatMessage};
use crate::artifacts::{ArtifactKind, Artifacts};
use crate::error::{JobError, ToolError};
use crate::gateway::{Role, ToolContext, ToolGateway};
use crate::git::GitOps;
use crate::github::RepoHost;
use crate::http_client::classify_error;
use crate::queue::{Job, JobKind, RepoTarget};
use crate::state_machine::{Effect, LogLevel};
use crate::store::Store;
use crate::workspace::Workspace;

/// A handler for one job kind.
#[async_trait]
pub trait JobHandler: Send + Sync {
    async fn handle(&self, job: &Job) -> Result<(), JobError>;
}

pub type HandlerTable = HashMap<JobKind, Arc<dyn JobHandler>>;

#[derive(Debug, Clone)]
pub struct HandlerSettings {
    pub workdir_root: PathBuf,
    pub max_iterations: u32,
    pub ci_policy: CiPolicy,
    pub max_tool_output_chars: usize,
}

/// Everything the handlers talk to.
#[derive(Clone)]
pub struct Services {
    pub store: Store,
    pub artifacts: Artifacts,
    pub repo_host: Arc<dyn RepoHost>,
    pub agent: Arc<dyn Agent>,
    pub git: GitOps,
    pub settings: HandlerSettings,
}

pub fn handler_table(services: Arc<Services>) -> HandlerTable {
    let mut table: HandlerTable = HashMap::new();
    table.insert(
        JobKind::CodeGen,
        Arc::new(code_gen::CodeGenHandler::new(services.clone())),
    );
    table.insert(
        JobKind::Review,
        Arc::new(review::ReviewHandler::new(services.clone())),
    );
    table.insert(
        JobKind::FixIteration,
        Arc::new(fix_iteration::FixIterationHandler::new(services.clone())),
    );
    table.insert(
        JobKind::PrEvent,
        Arc::new(pr_event::PrEventHandler::new(services)),
    );
    table
}

pub(crate) fn remote(what: &str) -> impl Fn(anyhow::Error) -> JobError + '_ {
    move |e| classify_error(&e).context(what)
}

/// git failures are mostly network trouble against the remote.
pub(crate) fn git_failure(what: &str) -> impl Fn(anyhow::Error) -> JobError + '_ {
    move |e| JobError::transient(format!("{}: {:#}", what, e))
}

fn mirror_path(root: &Path, repo: &RepoId) -> PathBuf {
    root.join("mirrors")
        .join(&repo.owner)
        .join(format!("{}.git", repo.name))
}

fn checkout_path(root: &Path, job_id: i64) -> PathBuf {
    root.join("jobs").join(format!("job-{}", job_id))
}

impl Services {
    /// A fresh working copy for `job_id`, replacing any left by an earlier
    /// attempt.
    pub(crate) async fn prepare_checkout(
        &self,
        target: &RepoTarget,
        job_id: i64,
    ) -> Result<PathBuf, JobError> {
        let url = self
            .repo_host
            .authenticated_clone_url(target)
            .await
            .map_err(remote("clone url"))?;

        let root = &self.settings.workdir_root;
        let mirror = mirror_path(root, &target.repo);
        self.git
            .ensure_mirror(&url, &mirror)
            .await
            .map_err(git_failure("mirror"))?;

        let dest = checkout_path(root, job_id);
        if tokio::fs::try_exists(&dest).await.unwrap_or(false) {
            tokio::fs::remove_dir_all(&dest)
                .await
                .map_err(|e| JobError::transient(format!("remove stale checkout: {}", e)))?;
        }
        self.git
            .clone_from_mirror(&mirror, &url, &dest)
            .await
            .map_err(git_failure("clone"))?;
        Ok(dest)
    }

    pub(crate) async fn remove_checkout(&self, dir: &Path) {
        if let Err(e) = tokio::fs::remove_dir_all(dir).await {
            warn!("Failed to remove checkout {}: {}", dir.display(), e);
        }
    }

    #[allow(clippy::too_many_arguments)]
    pub(crate) fn gateway(
        &self,
        role: Role,
        target: &RepoTarget,
        workspace: Workspace,
        issue_number: Option<u64>,
        pr_number: Option<u64>,
        head_sha: Option<CommitSha>,
        correlation_id: &str,
    ) -> ToolGateway {
        ToolGateway::new(
            role,
            ToolContext {
                repo_host: self.repo_host.clone(),
                target: target.clone(),
                issue_number,
                pr_number,
                head_sha,
                workspace,
                git: self.git.clone(),
                ci_policy: self.settings.ci_policy.clone(),
                correlation_id: correlation_id.to_string(),
            },
            self.settings.max_tool_output_chars,
        )
    }

    /// Write the agent's edits into the checkout.
    pub(crate) async fn apply_edits(
        &self,
        workspace: &Workspace,
        edits: Vec<FileEdit>,
    ) -> Result<Vec<String>, JobError> {
        let workspace = workspace.clone();
        tokio::task::spawn_blocking(move || workspace.apply_edits(&edits))
            .await
            .map_err(|e| JobError::transient(format!("edit task failed: {}", e)))?
            .map_err(|e: ToolError| JobError::permanent(format!("rejected edits: {}", e)))
    }

    /// Artifacts are best effort: losing one never fails the job.
    pub(crate) async fn record_artifact(&self, job_id: i64, kind: ArtifactKind, bytes: &[u8]) {
        if let Err(e) = self.artifacts.record(job_id, kind, bytes).await {
            warn!("Failed to record {} artifact for job {}: {:#}", kind, job_id, e);
        }
    }

    pub(crate) async fn record_transcript(&self, job_id: i64, transcript: &[ChatMessage]) {
        match serde_json::to_vec_pretty(transcript) {
            Ok(bytes) => {
                self.record_artifact(job_id, ArtifactKind::ModelOutput, &bytes)
                    .await
            }
            Err(e) => warn!("Failed to serialise transcript for job {}: {}", job_id, e),
        }
    }

    pub(crate) async fn comment(
        &self,
        correlation_id: &str,
        target: &RepoTarget,
        number: u64,
        body: &str,
    ) {
        if let Err(e) = self
            .repo_host
            .post_comment(Some(correlation_id), target, number, body)
            .await
        {
            warn!(
                "Failed to comment on {}#{}: {:#}",
                target.repo, number, e
            );
        }
    }

    /// Execute the effects a transition left to the caller.
    pub(crate) async fn execute_effects(
        &self,
        correlation_id: &str,
        target: &RepoTarget,
        pr_number: u64,
        effects: &[Effect],
    ) {
        for effect in effects {
            match effect {
                Effect::PostComment { body } => {
                    self.comment(correlation_id, target, pr_number, body).await
                }
                Effect::Log {
                    level: LogLevel::Info,
                    message,
                } => info!("{}#{}: {}", target.repo, pr_number, message),
                Effect::Log {
                    level: LogLevel::Warn,
                    message,
                } => warn!("{}#{}: {}", target.repo, pr_number, message),
                Effect::EnqueueReview { .. } | Effect::EnqueueFix { .. } => {}
            }
        }
    }
}

pub(crate) fn unexpected_spec(job: &Job, expected: JobKind) -> JobError {
    JobError::permanent(format!(
        "job {} is {} but was routed to the {} handler",
        job.job_id,
        job.kind(),
        expected
    ))
}
