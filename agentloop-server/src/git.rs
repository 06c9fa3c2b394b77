//! git subprocess wrappers.
//!
//! Job handlers use the mutating operations to prepare and publish a
//! workspace. Agent tools only reach git through [`GitOps::read_only`], which
//! refuses anything outside [`READ_ONLY_SUBCOMMANDS`].

use anyhow::{anyhow, bail, Context, Result};
use regex::Regex;
use std::path::Path;
use std::process::Stdio;
use std::sync::LazyLock;
use std::time::Duration;
use tokio::process::Command;
use tracing::{debug, info};

/// Subcommands an agent may run.
pub const READ_ONLY_SUBCOMMANDS: &[&str] = &["diff", "log", "show", "status", "ls-files"];

/// Author and committer used for agent commits.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GitIdentity {
    pub name: String,
    pub email: String,
}

#[derive(Debug, Clone)]
pub struct GitOps {
    identity: GitIdentity,
    timeout: Duration,
}

static CREDENTIALS_REGEX: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(https?://[^:/\s]+):[^@/\s]+@").unwrap());

/// Strip passwords and tokens from URLs in git output.
pub fn redact_credentials(text: &str) -> String {
    CREDENTIALS_REGEX
        .replace_all(text, "$1:***@")
        .into_owned()
}

impl GitOps {
    pub fn new(identity: GitIdentity, timeout: Duration) -> Self {
        Self { identity, timeout }
    }

    async fn run(&self, args: &[&str], cwd: &Path) -> Result<String> {
        debug!("git {}", redact_credentials(&args.join(" ")));

        let mut command = Command::new("git");
        command
            .args(args)
            .current_dir(cwd)
            .env("GIT_TERMINAL_PROMPT", "0")
            .env("GIT_AUTHOR_NAME", &self.identity.name)
            .env("GIT_AUTHOR_EMAIL", &self.identity.email)
            .env("GIT_COMMITTER_NAME", &self.identity.name)
            .env("GIT_COMMITTER_EMAIL", &self.identity.email)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let subcommand = args.first().copied().unwrap_or_default();
        let output = tokio::time::timeout(self.timeout, command.output())
            .await
            .map_err(|_| {
                anyhow!(
                    "git {} timed out after {}s",
                    subcommand,
                    self.timeout.as_secs()
                )
            })?
            .with_context(|| format!("Failed to spawn git {}", subcommand))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            bail!(
                "git {} failed ({}): {}",
                subcommand,
                output.status,
                redact_credentials(stderr.trim())
            );
        }

        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }

    /// Run a read-only subcommand on behalf of an agent.
    pub async fn read_only(&self, args: &[&str], cwd: &Path) -> Result<String> {
        let Some(subcommand) = args.first() else {
            bail!("git requires a subcommand");
        };
        if !READ_ONLY_SUBCOMMANDS.contains(subcommand) {
            bail!("git {} is not allowed", subcommand);
        }
        // Options that write files, run external programs or read outside
        // the repository.
        if args.iter().any(|a| {
            a.starts_with("--output")
                || a.starts_with("--ext-diff")
                || a.starts_with("--no-index")
                || a.starts_with("-c")
        }) {
            bail!("git option not allowed");
        }
        self.run(args, cwd).await
    }

    /// Create or refresh a bare mirror of the repository.
    pub async fn ensure_mirror(&self, url: &str, mirror_path: &Path) -> Result<()> {
        let parent = parent_of(mirror_path)?;
        tokio::fs::create_dir_all(parent)
            .await
            .with_context(|| format!("Failed to create {}", parent.display()))?;

        if tokio::fs::try_exists(mirror_path).await.unwrap_or(false) {
            self.run(&["remote", "set-url", "origin", url], mirror_path)
                .await?;
            self.run(&["fetch", "--prune", "origin"], mirror_path).await?;
        } else {
            info!("Creating mirror at {}", mirror_path.display());
            let dest = path_str(mirror_path)?;
            self.run(&["clone", "--mirror", url, dest], parent).await?;
        }
        Ok(())
    }

    /// Clone a working copy from the mirror, pointing `origin` at `url`.
    pub async fn clone_from_mirror(&self, mirror_path: &Path, url: &str, dest: &Path) -> Result<()> {
        let parent = parent_of(dest)?;
        tokio::fs::create_dir_all(parent)
            .await
            .with_context(|| format!("Failed to create {}", parent.display()))?;
        self.run(
            &["clone", "--shared", path_str(mirror_path)?, path_str(dest)?],
            parent,
        )
        .await?;
        self.run(&["remote", "set-url", "origin", url], dest).await?;
        Ok(())
    }

    pub async fn create_branch(&self, branch: &str, cwd: &Path) -> Result<()> {
        self.run(&["checkout", "-b", branch], cwd).await?;
        Ok(())
    }

    pub async fn checkout_remote_branch(&self, branch: &str, cwd: &Path) -> Result<()> {
        let remote = format!("origin/{}", branch);
        self.run(&["checkout", "-B", branch, &remote], cwd).await?;
        Ok(())
    }

    pub async fn head_sha(&self, cwd: &Path) -> Result<String> {
        Ok(self.run(&["rev-parse", "HEAD"], cwd).await?.trim().to_string())
    }

    /// Whether the working tree has any change, tracked or not.
    pub async fn has_changes(&self, cwd: &Path) -> Result<bool> {
        let status = self.run(&["status", "--porcelain"], cwd).await?;
        Ok(status.lines().any(|l| !l.trim().is_empty()))
    }

    /// Stage everything and return the staged diff.
    pub async fn stage_all(&self, cwd: &Path) -> Result<String> {
        self.run(&["add", "-A"], cwd).await?;
        self.run(&["diff", "--cached"], cwd).await
    }

    pub async fn commit(&self, message: &str, cwd: &Path) -> Result<String> {
        self.run(&["commit", "-m", message], cwd).await?;
        self.head_sha(cwd).await
    }

    pub async fn push_branch(&self, branch: &str, cwd: &Path) -> Result<()> {
        self.run(&["push", "-u", "origin", branch], cwd).await?;
        Ok(())
    }

    /// Push a branch this process owns outright, replacing whatever is there.
    pub async fn force_push_branch(&self, branch: &str, cwd: &Path) -> Result<()> {
        self.run(&["push", "--force", "-u", "origin", branch], cwd).await?;
        Ok(())
    }
}

fn parent_of(path: &Path) -> Result<&Path> {
    path.parent()
        .ok_or_else(|| anyhow!("{} has no parent directory", path.display()))
}

fn path_str(path: &Path) -> Result<&str> {
    path.to_str()
        .ok_or_else(|| anyhow!("{} is not valid UTF-8", path.display()))
}
