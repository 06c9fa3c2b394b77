//! State types for the iteration state machine.

use agentloop_core::{CommitSha, ReviewDecision};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Where a PR is in its review/fix lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    /// The Code Agent is producing the PR.
    AwaitingPr,
    /// Waiting for CI to finish on the current head commit.
    AwaitingCi,
    /// CI passed; a review job is queued or running.
    UnderReview,
    /// The Reviewer asked for changes; a fix-iteration job is queued or running.
    FixRequested,
    Approved,
    /// Maximum fix iterations reached without approval.
    Exhausted,
    /// PR closed or merged.
    Closed,
}

impl Phase {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::AwaitingPr => "awaiting_pr",
            Self::AwaitingCi => "awaiting_ci",
            Self::UnderReview => "under_review",
            Self::FixRequested => "fix_requested",
            Self::Approved => "approved",
            Self::Exhausted => "exhausted",
            Self::Closed => "closed",
        }
    }

    /// Terminal phases accept no further work. `Approved` and `Exhausted`
    /// can still be archived to `Closed`.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Approved | Self::Exhausted | Self::Closed)
    }

    pub const ALL: [Phase; 7] = [
        Self::AwaitingPr,
        Self::AwaitingCi,
        Self::UnderReview,
        Self::FixRequested,
        Self::Approved,
        Self::Exhausted,
        Self::Closed,
    ];
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Phase {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .iter()
            .copied()
            .find(|p| p.as_str() == s)
            .ok_or_else(|| format!("unknown phase '{}'", s))
    }
}

/// Iteration state of one agent-managed PR.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IterationState {
    pub phase: Phase,
    /// Tip of the PR branch as last recorded. None only before the PR exists.
    pub head_sha: Option<CommitSha>,
    /// Fix iterations started so far. Never exceeds `max_iterations`.
    pub iteration_count: u32,
    pub max_iterations: u32,
    pub last_decision: Option<ReviewDecision>,
}

impl IterationState {
    pub fn new(max_iterations: u32) -> Self {
        Self {
            phase: Phase::AwaitingPr,
            head_sha: None,
            iteration_count: 0,
            max_iterations,
            last_decision: None,
        }
    }

    /// True when `sha` is the recorded head. Events about any other commit
    /// are stale.
    pub fn is_current(&self, sha: &CommitSha) -> bool {
        self.head_sha.as_ref() == Some(sha)
    }

    pub fn with_phase(self, phase: Phase) -> Self {
        Self { phase, ..self }
    }
}
