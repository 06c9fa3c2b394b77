//! Effects (side effects as data).
//!
//! Job effects are applied by the store in the same transaction as the state
//! change, so a crash can never record a fix request without its job. The
//! remaining effects are executed by the caller after the commit.

use agentloop_core::CommitSha;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Effect {
    /// Queue a review job for this head.
    EnqueueReview { head_sha: CommitSha },

    /// Queue fix iteration number `iteration` against this head.
    EnqueueFix {
        head_sha: CommitSha,
        iteration: u32,
        feedback: String,
    },

    /// Post a comment on the PR.
    PostComment { body: String },

    Log { level: LogLevel, message: String },
}

impl Effect {
    /// Effects the store applies transactionally.
    pub fn is_job(&self) -> bool {
        matches!(self, Self::EnqueueReview { .. } | Self::EnqueueFix { .. })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum LogLevel {
    Info,
    Warn,
}
