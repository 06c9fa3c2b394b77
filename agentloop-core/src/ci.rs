//! CI aggregation.
//!
//! A commit usually has many check runs (one per workflow job, plus any
//! third-party status integrations). The state machine only cares about a
//! single verdict per head commit, so this module collapses the set into a
//! [`MergedStatus`]:
//!
//! - `Pending` if any considered run has not concluded yet
//! - otherwise `Failure` if any considered run failed, errored or was cancelled
//! - otherwise `Success`
//!
//! An empty set is `Pending`: CI that has not reported anything has not passed.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::ids::CommitSha;

/// The single verdict for one commit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MergedStatus {
    Pending,
    Success,
    Failure,
}

impl MergedStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Success => "success",
            Self::Failure => "failure",
        }
    }
}

impl fmt::Display for MergedStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for MergedStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "success" => Ok(Self::Success),
            "failure" => Ok(Self::Failure),
            other => Err(format!("unknown merged status '{}'", other)),
        }
    }
}

/// Outcome of one check run, normalised from GitHub's `status` + `conclusion`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CheckConclusion {
    Pending,
    Success,
    Neutral,
    Skipped,
    Failure,
    Error,
    Cancelled,
    TimedOut,
    ActionRequired,
}

impl CheckConclusion {
    /// Map a GitHub check run's `status` and `conclusion` fields.
    ///
    /// Anything not `completed` is pending. A completed run with a conclusion
    /// we do not recognise is treated as an error rather than silently passing.
    pub fn from_github(status: &str, conclusion: Option<&str>) -> Self {
        if status != "completed" {
            return Self::Pending;
        }
        match conclusion {
            None => Self::Pending,
            Some("success") => Self::Success,
            Some("neutral") => Self::Neutral,
            Some("skipped") => Self::Skipped,
            Some("failure") | Some("startup_failure") => Self::Failure,
            Some("cancelled") => Self::Cancelled,
            Some("timed_out") => Self::TimedOut,
            Some("action_required") => Self::ActionRequired,
            // GitHub marks superseded runs as stale; a fresh run will follow
            Some("stale") => Self::Pending,
            Some(_) => Self::Error,
        }
    }

    fn is_pending(&self) -> bool {
        matches!(self, Self::Pending)
    }

    fn is_failing(&self) -> bool {
        matches!(
            self,
            Self::Failure | Self::Error | Self::Cancelled | Self::TimedOut | Self::ActionRequired
        )
    }
}

/// One check run reported for a commit.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CheckRun {
    pub name: String,
    pub sha: CommitSha,
    pub conclusion: CheckConclusion,
}

impl CheckRun {
    pub fn new(name: impl Into<String>, sha: impl Into<CommitSha>, conclusion: CheckConclusion) -> Self {
        Self {
            name: name.into(),
            sha: sha.into(),
            conclusion,
        }
    }
}

/// Collapse a set of check runs into a single verdict, considering every run.
pub fn aggregate(runs: &[CheckRun]) -> MergedStatus {
    merge(runs.iter().map(|r| r.conclusion))
}

fn merge(conclusions: impl Iterator<Item = CheckConclusion>) -> MergedStatus {
    let mut seen_any = false;
    let mut failed = false;
    for conclusion in conclusions {
        seen_any = true;
        if conclusion.is_pending() {
            return MergedStatus::Pending;
        }
        failed |= conclusion.is_failing();
    }
    match (seen_any, failed) {
        (false, _) => MergedStatus::Pending,
        (true, true) => MergedStatus::Failure,
        (true, false) => MergedStatus::Success,
    }
}

/// Which check runs count towards the verdict.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CiPolicy {
    /// Names of required checks. Empty means every reported run counts.
    pub required: Vec<String>,
}

impl CiPolicy {
    pub fn new(required: Vec<String>) -> Self {
        Self { required }
    }

    /// Verdict for `head_sha`.
    ///
    /// Runs reported for any other commit are dropped, so results are never
    /// mixed across shas. With a required list, runs whose names are not on it
    /// are ignored, and a required check that has not reported yet counts as
    /// pending.
    pub fn merged_status(&self, head_sha: &CommitSha, runs: &[CheckRun]) -> MergedStatus {
        let for_head = runs.iter().filter(|r| &r.sha == head_sha);

        if self.required.is_empty() {
            return merge(for_head.map(|r| r.conclusion));
        }

        let for_head: Vec<&CheckRun> = for_head.collect();
        let mut conclusions = Vec::with_capacity(self.required.len());
        for name in &self.required {
            let mut matching = for_head.iter().filter(|r| &r.name == name).peekable();
            if matching.peek().is_none() {
                conclusions.push(CheckConclusion::Pending);
            }
            conclusions.extend(matching.map(|r| r.conclusion));
        }
        merge(conclusions.into_iter())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    const SHA: &str = "abc123";

    fn run(name: &str, conclusion: CheckConclusion) -> CheckRun {
        CheckRun::new(name, SHA, conclusion)
    }

    #[test]
    fn test_success_and_pending_is_pending() {
        let runs = vec![
            run("A", CheckConclusion::Success),
            run("B", CheckConclusion::Pending),
        ];
        assert_eq!(aggregate(&runs), MergedStatus::Pending);
    }

    #[test]
    fn test_success_and_failure_is_failure() {
        let runs = vec![
            run("A", CheckConclusion::Success),
            run("B", CheckConclusion::Failure),
        ];
        assert_eq!(aggregate(&runs), MergedStatus::Failure);
    }

    #[test]
    fn test_all_success_is_success() {
        let runs = vec![
            run("A", CheckConclusion::Success),
            run("B", CheckConclusion::Success),
        ];
        assert_eq!(aggregate(&runs), MergedStatus::Success);
    }

    #[test]
    fn test_empty_is_pending() {
        assert_eq!(aggregate(&[]), MergedStatus::Pending);
    }

    #[test]
    fn test_pending_beats_failure() {
        let runs = vec![
            run("A", CheckConclusion::Failure),
            run("B", CheckConclusion::Pending),
        ];
        assert_eq!(aggregate(&runs), MergedStatus::Pending);
    }

    #[test]
    fn test_error_and_cancelled_are_failures() {
        for conclusion in [
            CheckConclusion::Error,
            CheckConclusion::Cancelled,
            CheckConclusion::TimedOut,
            CheckConclusion::ActionRequired,
        ] {
            let runs = vec![run("A", CheckConclusion::Success), run("B", conclusion)];
            assert_eq!(aggregate(&runs), MergedStatus::Failure, "{:?}", conclusion);
        }
    }

    #[test]
    fn test_neutral_and_skipped_pass() {
        let runs = vec![
            run("A", CheckConclusion::Success),
            run("B", CheckConclusion::Neutral),
            run("C", CheckConclusion::Skipped),
        ];
        assert_eq!(aggregate(&runs), MergedStatus::Success);
    }

    #[test]
    fn test_from_github_mapping() {
        assert_eq!(
            CheckConclusion::from_github("in_progress", None),
            CheckConclusion::Pending
        );
        assert_eq!(
            CheckConclusion::from_github("queued", Some("success")),
            CheckConclusion::Pending
        );
        assert_eq!(
            CheckConclusion::from_github("completed", Some("success")),
            CheckConclusion::Success
        );
        assert_eq!(
            CheckConclusion::from_github("completed", Some("startup_failure")),
            CheckConclusion::Failure
        );
        assert_eq!(
            CheckConclusion::from_github("completed", Some("stale")),
            CheckConclusion::Pending
        );
        assert_eq!(
            CheckConclusion::from_github("completed", Some("something_new")),
            CheckConclusion::Error
        );
    }

    #[test]
    fn test_policy_ignores_other_shas() {
        let runs = vec![
            run("A", CheckConclusion::Success),
            CheckRun::new("B", "oldsha", CheckConclusion::Failure),
        ];
        let policy = CiPolicy::default();
        assert_eq!(
            policy.merged_status(&CommitSha::from(SHA), &runs),
            MergedStatus::Success
        );
    }

    #[test]
    fn test_policy_only_other_shas_is_pending() {
        let runs = vec![CheckRun::new("A", "oldsha", CheckConclusion::Success)];
        assert_eq!(
            CiPolicy::default().merged_status(&CommitSha::from(SHA), &runs),
            MergedStatus::Pending
        );
    }

    #[test]
    fn test_required_subset_ignores_unlisted_failures() {
        let runs = vec![
            run("build", CheckConclusion::Success),
            run("lint", CheckConclusion::Failure),
        ];
        let policy = CiPolicy::new(vec!["build".to_string()]);
        assert_eq!(
            policy.merged_status(&CommitSha::from(SHA), &runs),
            MergedStatus::Success
        );
    }

    #[test]
    fn test_required_check_not_yet_reported_is_pending() {
        let runs = vec![run("build", CheckConclusion::Success)];
        let policy = CiPolicy::new(vec!["build".to_string(), "test".to_string()]);
        assert_eq!(
            policy.merged_status(&CommitSha::from(SHA), &runs),
            MergedStatus::Pending
        );
    }

    #[test]
    fn test_required_check_failure_is_failure() {
        let runs = vec![
            run("build", CheckConclusion::Success),
            run("test", CheckConclusion::Cancelled),
        ];
        let policy = CiPolicy::new(vec!["build".to_string(), "test".to_string()]);
        assert_eq!(
            policy.merged_status(&CommitSha::from(SHA), &runs),
            MergedStatus::Failure
        );
    }

    #[test]
    fn test_merged_status_round_trips_through_str() {
        for status in [
            MergedStatus::Pending,
            MergedStatus::Success,
            MergedStatus::Failure,
        ] {
            assert_eq!(status.as_str().parse::<MergedStatus>(), Ok(status));
        }
        assert!("green".parse::<MergedStatus>().is_err());
    }

    fn arb_conclusion() -> impl Strategy<Value = CheckConclusion> {
        prop_oneof![
            Just(CheckConclusion::Pending),
            Just(CheckConclusion::Success),
            Just(CheckConclusion::Neutral),
            Just(CheckConclusion::Skipped),
            Just(CheckConclusion::Failure),
            Just(CheckConclusion::Error),
            Just(CheckConclusion::Cancelled),
            Just(CheckConclusion::TimedOut),
            Just(CheckConclusion::ActionRequired),
        ]
    }

    fn arb_runs() -> impl Strategy<Value = Vec<CheckRun>> {
        prop::collection::vec(
            ("[a-e]", arb_conclusion()).prop_map(|(name, c)| run(&name, c)),
            0..8,
        )
    }

    proptest! {
        #[test]
        fn prop_any_pending_run_means_pending(mut runs in arb_runs(), idx in any::<prop::sample::Index>()) {
            runs.push(run("late", CheckConclusion::Pending));
            let i = idx.index(runs.len());
            let last = runs.len() - 1;
            runs.swap(i, last);
            prop_assert_eq!(aggregate(&runs), MergedStatus::Pending);
        }

        #[test]
        fn prop_order_does_not_matter(runs in arb_runs()) {
            let mut reversed = runs.clone();
            reversed.reverse();
            prop_assert_eq!(aggregate(&runs), aggregate(&reversed));
        }

        #[test]
        fn prop_success_requires_no_failing_runs(runs in arb_runs()) {
            if aggregate(&runs) == MergedStatus::Success {
                prop_assert!(!runs.is_empty());
                prop_assert!(runs.iter().all(|r| !r.conclusion.is_failing() && !r.conclusion.is_pending()));
            }
        }
    }
}
