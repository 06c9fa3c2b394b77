//! The only way an agent touches the outside world.
//!
//! Tools form a closed set. Each agent role has an allowlist; a call to
//! anything else is answered with an error observation and never executed.

use std::sync::Arc;

use agentloop_core::{CiPolicy, CommitSha, ToolDescription};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::{debug, warn};

use crate::error::{JobError, ToolError};
use crate::git::GitOps;
use crate::github::RepoHost;
use crate::http_client::classify_error;
use crate::queue::RepoTarget;
use crate::workspace::Workspace;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Tool {
    IssueInfo,
    PrInfo,
    PrDiff,
    PrFiles,
    CiStatus,
    RepoTree,
    ReadFile,
    Search,
    GitDiff,
    GitLog,
}

impl Tool {
    pub const ALL: [Tool; 10] = [
        Self::IssueInfo,
        Self::PrInfo,
        Self::PrDiff,
        Self::PrFiles,
        Self::CiStatus,
        Self::RepoTree,
        Self::ReadFile,
        Self::Search,
        Self::GitDiff,
        Self::GitLog,
    ];

    pub fn name(&self) -> &'static str {
        match self {
            Self::IssueInfo => "issue_info",
            Self::PrInfo => "pr_info",
            Self::PrDiff => "pr_diff",
            Self::PrFiles => "pr_files",
            Self::CiStatus => "ci_status",
            Self::RepoTree => "repo_tree",
            Self::ReadFile => "read_file",
            Self::Search => "search",
            Self::GitDiff => "git_diff",
            Self::GitLog => "git_log",
        }
    }

    pub fn from_name(name: &str) -> Option<Self> {
        Self::ALL.iter().copied().find(|t| t.name() == name)
    }

    pub fn description(&self) -> ToolDescription {
        let usage = match self {
            Self::IssueInfo => "{} - title and body of the originating issue",
            Self::PrInfo => "{} - PR metadata",
            Self::PrDiff => "{} - unified diff of the PR",
            Self::PrFiles => "{} - changed files with patches",
            Self::CiStatus => "{} - check runs for the head commit and the merged verdict",
            Self::RepoTree => "{max_depth?} - directory listing",
            Self::ReadFile => "{path, start?, end?} - numbered lines of a file",
            Self::Search => "{query, glob?} - regex search over the repository",
            Self::GitDiff => "{ref?} - uncommitted changes, or changes since ref",
            Self::GitLog => "{max_count?} - recent commits",
        };
        ToolDescription {
            name: self.name(),
            usage,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    CodeAgent,
    Reviewer,
}

impl Role {
    pub fn allowed_tools(&self) -> &'static [Tool] {
        match self {
            Self::CodeAgent => &[
                Tool::IssueInfo,
                Tool::RepoTree,
                Tool::ReadFile,
                Tool::Search,
                Tool::GitDiff,
                Tool::GitLog,
            ],
            Self::Reviewer => &Tool::ALL,
        }
    }

    pub fn allows(&self, tool: Tool) -> bool {
        self.allowed_tools().contains(&tool)
    }
}

/// What the tools operate on for one agent run.
#[derive(Clone)]
pub struct ToolContext {
    pub repo_host: Arc<dyn RepoHost>,
    pub target: RepoTarget,
    pub issue_number: Option<u64>,
    pub pr_number: Option<u64>,
    pub head_sha: Option<CommitSha>,
    pub workspace: Workspace,
    pub git: GitOps,
    pub ci_policy: CiPolicy,
    pub correlation_id: String,
}

pub struct ToolGateway {
    role: Role,
    ctx: ToolContext,
    max_output_chars: usize,
}

#[derive(Deserialize)]
struct RepoTreeArgs {
    max_depth: Option<usize>,
}

#[derive(Deserialize)]
struct ReadFileArgs {
    path: String,
    start: Option<usize>,
    end: Option<usize>,
}

#[derive(Deserialize)]
struct SearchArgs {
    query: String,
    glob: Option<String>,
}

#[derive(Deserialize)]
struct GitDiffArgs {
    #[serde(rename = "ref")]
    git_ref: Option<String>,
}

#[derive(Deserialize)]
struct GitLogArgs {
    max_count: Option<usize>,
}

fn parse_args<T: DeserializeOwned>(args: &Value) -> Result<T, ToolError> {
    let args = if args.is_null() { json!({}) } else { args.clone() };
    serde_json::from_value(args).map_err(ToolError::invalid)
}

/// Cut `text` to at most `max_chars` characters, saying how much was dropped.
pub fn truncate_output(text: &str, max_chars: usize) -> String {
    match text.char_indices().nth(max_chars) {
        None => text.to_string(),
        Some((cut, _)) => {
            let dropped = text[cut..].chars().count();
            format!("{}\n... [truncated {} chars]", &text[..cut], dropped)
        }
    }
}

fn remote(err: anyhow::Error) -> ToolError {
    ToolError::Remote(classify_error(&err))
}

impl ToolGateway {
    pub fn new(role: Role, ctx: ToolContext, max_output_chars: usize) -> Self {
        Self {
            role,
            ctx,
            max_output_chars,
        }
    }

    pub fn role(&self) -> Role {
        self.role
    }

    pub fn descriptions(&self) -> Vec<ToolDescription> {
        self.role
            .allowed_tools()
            .iter()
            .map(Tool::description)
            .collect()
    }

    /// Run a tool and turn the outcome into the text the agent sees.
    ///
    /// Only a transient repository failure escapes as an error, so the job
    /// can be retried.
    pub async fn observe(&self, name: &str, args: &Value) -> Result<String, JobError> {
        match self.call(name, args).await {
            Ok(output) => Ok(truncate_output(&output, self.max_output_chars)),
            Err(ToolError::Remote(e)) if e.is_retryable() => Err(e.context(&format!("tool {}", name))),
            Err(e) => {
                debug!("Tool {} failed: {}", name, e);
                Ok(format!("ERROR: {}", e))
            }
        }
    }

    pub async fn call(&self, name: &str, args: &Value) -> Result<String, ToolError> {
        let Some(tool) = Tool::from_name(name) else {
            warn!("Agent asked for unknown tool '{}'", name);
            return Err(ToolError::NotAllowed(name.to_string()));
        };
        if !self.role.allows(tool) {
            warn!("{:?} asked for disallowed tool '{}'", self.role, name);
            return Err(ToolError::NotAllowed(name.to_string()));
        }

        let ctx = &self.ctx;
        let cid = Some(ctx.correlation_id.as_str());
        match tool {
            Tool::IssueInfo => {
                let number = ctx
                    .issue_number
                    .ok_or_else(|| ToolError::failed("no issue is linked to this run"))?;
                let issue = ctx
                    .repo_host
                    .get_issue(cid, &ctx.target, number)
                    .await
                    .map_err(remote)?;
                Ok(json!({"number": issue.number, "title": issue.title, "body": issue.body}).to_string())
            }
            Tool::PrInfo => {
                let pr = ctx
                    .repo_host
                    .get_pull_request(cid, &ctx.target, self.pr_number()?)
                    .await
                    .map_err(remote)?;
                Ok(json!({
                    "title": pr.title,
                    "body": pr.body,
                    "author": pr.user.map(|u| u.login),
                    "state": pr.state,
                    "base": pr.base.ref_name,
                    "head": pr.head.ref_name,
                    "head_sha": pr.head.sha,
                    "changed_files": pr.changed_files,
                    "additions": pr.additions,
                    "deletions": pr.deletions,
                })
                .to_string())
            }
            Tool::PrDiff => ctx
                .repo_host
                .get_pr_diff(cid, &ctx.target, self.pr_number()?)
                .await
                .map_err(remote),
            Tool::PrFiles => {
                let files = ctx
                    .repo_host
                    .get_pr_files(cid, &ctx.target, self.pr_number()?)
                    .await
                    .map_err(remote)?;
                serde_json::to_string(&files).map_err(ToolError::failed)
            }
            Tool::CiStatus => {
                let sha = ctx
                    .head_sha
                    .as_ref()
                    .ok_or_else(|| ToolError::failed("no head commit in this run"))?;
                let runs = ctx
                    .repo_host
                    .get_check_runs(cid, &ctx.target, sha)
                    .await
                    .map_err(remote)?;
                Ok(json!({
                    "head_sha": sha,
                    "merged_status": ctx.ci_policy.merged_status(sha, &runs),
                    "check_runs": runs,
                })
                .to_string())
            }
            Tool::RepoTree => {
                let args: RepoTreeArgs = parse_args(args)?;
                let depth = args.max_depth.unwrap_or(3);
                self.blocking(move |ws| ws.repo_tree(depth)).await
            }
            Tool::ReadFile => {
                let args: ReadFileArgs = parse_args(args)?;
                self.blocking(move |ws| ws.read_file(&args.path, args.start.unwrap_or(1), args.end))
                    .await
            }
            Tool::Search => {
                let args: SearchArgs = parse_args(args)?;
                self.blocking(move |ws| ws.search(&args.query, args.glob.as_deref()))
                    .await
            }
            Tool::GitDiff => {
                let args: GitDiffArgs = parse_args(args)?;
                let mut git_args = vec!["diff"];
                if let Some(git_ref) = args.git_ref.as_deref() {
                    if git_ref.starts_with('-') {
                        return Err(ToolError::invalid("ref must not start with '-'"));
                    }
                    git_args.push(git_ref);
                }
                self.git(&git_args).await
            }
            Tool::GitLog => {
                let args: GitLogArgs = parse_args(args)?;
                let count = format!("-n{}", args.max_count.unwrap_or(10).clamp(1, 50));
                self.git(&["log", &count, "--oneline"]).await
            }
        }
    }

    fn pr_number(&self) -> Result<u64, ToolError> {
        self.ctx
            .pr_number
            .ok_or_else(|| ToolError::failed("no pull request is linked to this run"))
    }

    async fn git(&self, args: &[&str]) -> Result<String, ToolError> {
        let output = self
            .ctx
            .git
            .read_only(args, self.ctx.workspace.root())
            .await
            .map_err(|e| ToolError::failed(format!("{:#}", e)))?;
        if output.trim().is_empty() {
            Ok("(no output)".to_string())
        } else {
            Ok(output)
        }
    }

    async fn blocking<F>(&self, op: F) -> Result<String, ToolError>
    where
        F: FnOnce(&Workspace) -> Result<String, ToolError> + Send + 'static,
    {
        let workspace = self.ctx.workspace.clone();
        tokio::task::spawn_blocking(move || op(&workspace))
            .await
            .map_err(|e| ToolError::failed(format!("tool task failed: {}", e)))?
    }
}
