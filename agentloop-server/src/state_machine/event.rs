//! Events that drive the iteration state machine.

use agentloop_core::{CommitSha, MergedStatus, ReviewDecision};
use serde::{Deserialize, Serialize};

/// Something that happened to a PR.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Event {
    /// The Code Agent's PR exists with this head.
    PrOpened { head_sha: CommitSha },
    /// CI finished (or was re-aggregated) for a commit.
    CiCompleted {
        head_sha: CommitSha,
        status: MergedStatus,
    },
    /// The Reviewer Agent decided on a commit. `feedback` is the rendered
    /// review handed to the next fix iteration.
    ReviewDecided {
        head_sha: CommitSha,
        decision: ReviewDecision,
        feedback: String,
    },
    /// The branch moved from `before` to `after`.
    HeadPushed { before: CommitSha, after: CommitSha },
    /// The PR was closed, merged or not.
    Closed { merged: bool },
}

impl Event {
    /// Short name for logs and the dashboard timeline.
    pub fn name(&self) -> &'static str {
        match self {
            Self::PrOpened { .. } => "pr_opened",
            Self::CiCompleted { .. } => "ci_completed",
            Self::ReviewDecided { .. } => "review_decided",
            Self::HeadPushed { .. } => "head_pushed",
            Self::Closed { .. } => "closed",
        }
    }

    /// The commit the event is about, if it is about one.
    pub fn head_sha(&self) -> Option<&CommitSha> {
        match self {
            Self::PrOpened { head_sha }
            | Self::CiCompleted { head_sha, .. }
            | Self::ReviewDecided { head_sha, .. } => Some(head_sha),
            Self::HeadPushed { after, .. } => Some(after),
            Self::Closed { .. } => None,
        }
    }
}
