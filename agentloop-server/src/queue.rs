//! Job types for the durable queue.
//!
//! The queue operations themselves live on [`crate::store::Store`]; this module
//! defines what a job is, how its kind is encoded, and the retry policy that
//! decides what a failure does to it.

use std::fmt;
use std::str::FromStr;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use agentloop_core::{CommitSha, PrId, RepoId};
use serde::{Deserialize, Serialize};

/// Current unix time in seconds.
pub fn unix_now() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}

/// Closed set of job kinds. Dispatch is by this tag through the worker's
/// handler table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum JobKind {
    CodeGen,
    Review,
    FixIteration,
    PrEvent,
}

impl JobKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::CodeGen => "code-gen",
            Self::Review => "review",
            Self::FixIteration => "fix-iteration",
            Self::PrEvent => "pr-event",
        }
    }

    pub const ALL: [JobKind; 4] = [
        Self::CodeGen,
        Self::Review,
        Self::FixIteration,
        Self::PrEvent,
    ];
}

impl fmt::Display for JobKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .iter()
            .copied()
            .find(|k| k.as_str() == s)
            .ok_or_else(|| format!("unknown job kind '{}'", s))
    }
}

/// A repository reached through a specific GitHub App installation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RepoTarget {
    pub repo: RepoId,
    pub installation_id: u64,
}

/// Normalised PR lifecycle or CI activity, as received from a webhook.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum PrActivity {
    Opened { head_sha: CommitSha },
    Pushed { before: CommitSha, after: CommitSha },
    Closed { merged: bool },
    /// Some check on this commit changed; CI must be re-aggregated.
    CiActivity { head_sha: CommitSha },
}

/// What a job does, with everything its handler needs.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "kebab-case")]
pub enum JobSpec {
    CodeGen {
        target: RepoTarget,
        issue_number: u64,
    },
    Review {
        pr: PrId,
        head_sha: CommitSha,
    },
    FixIteration {
        pr: PrId,
        head_sha: CommitSha,
        iteration: u32,
        feedback: String,
    },
    /// PR activity for an agent-managed PR; the installation comes from the
    /// stored PR state.
    PrEvent { pr: PrId, activity: PrActivity },
}

impl JobSpec {
    pub fn kind(&self) -> JobKind {
        match self {
            Self::CodeGen { .. } => JobKind::CodeGen,
            Self::Review { .. } => JobKind::Review,
            Self::FixIteration { .. } => JobKind::FixIteration,
            Self::PrEvent { .. } => JobKind::PrEvent,
        }
    }

    pub fn repo(&self) -> &RepoId {
        match self {
            Self::CodeGen { target, .. } => &target.repo,
            Self::Review { pr, .. } | Self::FixIteration { pr, .. } | Self::PrEvent { pr, .. } => {
                &pr.repo
            }
        }
    }

    pub fn pr(&self) -> Option<&PrId> {
        match self {
            Self::CodeGen { .. } => None,
            Self::Review { pr, .. } | Self::FixIteration { pr, .. } | Self::PrEvent { pr, .. } => {
                Some(pr)
            }
        }
    }

    pub fn issue_number(&self) -> Option<u64> {
        match self {
            Self::CodeGen { issue_number, .. } => Some(*issue_number),
            _ => None,
        }
    }

    pub fn head_sha(&self) -> Option<&CommitSha> {
        match self {
            Self::CodeGen { .. } => None,
            Self::Review { head_sha, .. } | Self::FixIteration { head_sha, .. } => Some(head_sha),
            Self::PrEvent { activity, .. } => match activity {
                PrActivity::Opened { head_sha } | PrActivity::CiActivity { head_sha } => {
                    Some(head_sha)
                }
                PrActivity::Pushed { after, .. } => Some(after),
                PrActivity::Closed { .. } => None,
            },
        }
    }

    /// Where comments about this job belong: the PR, or the issue for code-gen.
    pub fn thread_number(&self) -> u64 {
        match self {
            Self::CodeGen { issue_number, .. } => *issue_number,
            Self::Review { pr, .. } | Self::FixIteration { pr, .. } | Self::PrEvent { pr, .. } => {
                pr.number
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Pending,
    Leased,
    Done,
    Failed,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Leased => "leased",
            Self::Done => "done",
            Self::Failed => "failed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Done | Self::Failed)
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "leased" => Ok(Self::Leased),
            "done" => Ok(Self::Done),
            "failed" => Ok(Self::Failed),
            other => Err(format!("unknown job status '{}'", other)),
        }
    }
}

/// A persisted job. Timestamps are unix seconds.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Job {
    pub job_id: i64,
    pub spec: JobSpec,
    pub status: JobStatus,
    pub lease_owner: Option<String>,
    pub lease_expires_at: Option<i64>,
    pub created_at: i64,
    pub updated_at: i64,
    pub available_at: i64,
    pub attempt_count: u32,
    pub last_error: Option<String>,
    pub delivery_id: Option<String>,
}

impl Job {
    pub fn kind(&self) -> JobKind {
        self.spec.kind()
    }
}

/// What a failure did to a job.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailOutcome {
    /// Back to pending, not leasable before `available_at`.
    Retrying { available_at: i64 },
    /// Terminal.
    Failed,
}

/// A job whose lease expired and was taken back by the reaper.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReapedJob {
    pub job_id: i64,
    pub outcome: FailOutcome,
}

/// Retry budget and backoff curve.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub backoff_base: Duration,
    pub backoff_cap: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            backoff_base: Duration::from_secs(10),
            backoff_cap: Duration::from_secs(15 * 60),
        }
    }
}

impl RetryPolicy {
    /// Delay before the next attempt after `attempt_count` failed attempts.
    pub fn backoff(&self, attempt_count: u32) -> Duration {
        let exponent = attempt_count.saturating_sub(1).min(31);
        let delay = self.backoff_base.saturating_mul(1u32 << exponent);
        delay.min(self.backoff_cap)
    }

    /// Outcome once `attempt_count` (already incremented) attempts have failed.
    pub fn after_failure(&self, attempt_count: u32, now: i64) -> FailOutcome {
        if attempt_count >= self.max_attempts {
            FailOutcome::Failed
        } else {
            let delay = i64::try_from(self.backoff(attempt_count).as_secs()).unwrap_or(i64::MAX);
            FailOutcome::Retrying {
                available_at: now.saturating_add(delay),
            }
        }
    }
}
