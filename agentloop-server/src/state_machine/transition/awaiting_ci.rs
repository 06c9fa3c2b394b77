//! Handler for the AwaitingCi phase.

use super::{head_moved, TransitionResult};
use crate::state_machine::effect::{Effect, LogLevel};
use crate::state_machine::event::Event;
use crate::state_machine::state::{IterationState, Phase};
use agentloop_core::MergedStatus;

pub fn handle(state: IterationState, event: Event) -> TransitionResult {
    match event {
        Event::CiCompleted { head_sha, status } if state.is_current(&head_sha) => match status {
            MergedStatus::Success => TransitionResult::new(
                state.with_phase(Phase::UnderReview),
                vec![Effect::EnqueueReview { head_sha }],
            ),
            MergedStatus::Failure => TransitionResult::new(
                state,
                vec![Effect::Log {
                    level: LogLevel::Warn,
                    message: format!("CI failed on {}; waiting for a new push", head_sha.short()),
                }],
            ),
            MergedStatus::Pending => TransitionResult::no_change(state),
        },
        Event::HeadPushed { before, after } if state.is_current(&before) => {
            head_moved(state, after)
        }
        _ => TransitionResult::no_change(state),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use agentloop_core::CommitSha;

    fn awaiting(sha: &str) -> IterationState {
        IterationState {
            phase: Phase::AwaitingCi,
            head_sha: Some(CommitSha::from(sha)),
            iteration_count: 0,
            max_iterations: 3,
            last_decision: None,
        }
    }

    #[test]
    fn test_ci_success_enqueues_review() {
        let result = handle(
            awaiting("abc"),
            Event::CiCompleted {
                head_sha: CommitSha::from("abc"),
                status: MergedStatus::Success,
            },
        );
        assert_eq!(result.state.phase, Phase::UnderReview);
        assert_eq!(
            result.effects,
            vec![Effect::EnqueueReview {
                head_sha: CommitSha::from("abc")
            }]
        );
    }

    #[test]
    fn test_ci_failure_stays_and_logs() {
        let result = handle(
            awaiting("abc"),
            Event::CiCompleted {
                head_sha: CommitSha::from("abc"),
                status: MergedStatus::Failure,
            },
        );
        assert_eq!(result.state, awaiting("abc"));
        assert!(matches!(
            result.effects.as_slice(),
            [Effect::Log {
                level: LogLevel::Warn,
                ..
            }]
        ));
    }

    #[test]
    fn test_ci_pending_is_noop() {
        let result = handle(
            awaiting("abc"),
            Event::CiCompleted {
                head_sha: CommitSha::from("abc"),
                status: MergedStatus::Pending,
            },
        );
        assert_eq!(result.state, awaiting("abc"));
        assert!(result.effects.is_empty());
    }

    #[test]
    fn test_ci_for_old_sha_is_stale() {
        let result = handle(
            awaiting("new"),
            Event::CiCompleted {
                head_sha: CommitSha::from("old"),
                status: MergedStatus::Success,
            },
        );
        assert_eq!(result.state, awaiting("new"));
        assert!(result.effects.is_empty());
    }

    #[test]
    fn test_human_push_moves_head() {
        let result = handle(
            awaiting("abc"),
            Event::HeadPushed {
                before: CommitSha::from("abc"),
                after: CommitSha::from("def"),
            },
        );
        assert_eq!(result.state, awaiting("def"));
    }
}
