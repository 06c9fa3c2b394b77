//! Handler for the UnderReview phase.
//!
//! This is where the iteration cap is enforced: a fix decision either starts
//! another fix iteration or exhausts the PR.

use super::{head_moved, TransitionResult};
use crate::state_machine::effect::{Effect, LogLevel};
use crate::state_machine::event::Event;
use crate::state_machine::state::{IterationState, Phase};
use agentloop_core::ReviewDecision;

pub fn handle(state: IterationState, event: Event) -> TransitionResult {
    match event {
        Event::ReviewDecided {
            head_sha,
            decision: ReviewDecision::Approve,
            ..
        } if state.is_current(&head_sha) => TransitionResult::new(
            IterationState {
                phase: Phase::Approved,
                last_decision: Some(ReviewDecision::Approve),
                ..state
            },
            vec![Effect::Log {
                level: LogLevel::Info,
                message: format!("approved at {}", head_sha.short()),
            }],
        ),

        Event::ReviewDecided {
            head_sha,
            decision: ReviewDecision::Fix,
            feedback,
        } if state.is_current(&head_sha) => {
            if state.iteration_count < state.max_iterations {
                let iteration = state.iteration_count + 1;
                TransitionResult::new(
                    IterationState {
                        phase: Phase::FixRequested,
                        iteration_count: iteration,
                        last_decision: Some(ReviewDecision::Fix),
                        ..state
                    },
                    vec![Effect::EnqueueFix {
                        head_sha,
                        iteration,
                        feedback,
                    }],
                )
            } else {
                let body = exhausted_comment(state.max_iterations);
                TransitionResult::new(
                    IterationState {
                        phase: Phase::Exhausted,
                        last_decision: Some(ReviewDecision::Fix),
                        ..state
                    },
                    vec![Effect::PostComment { body }],
                )
            }
        }

        Event::HeadPushed { before, after } if state.is_current(&before) => {
            head_moved(state, after)
        }

        _ => TransitionResult::no_change(state),
    }
}

fn exhausted_comment(max_iterations: u32) -> String {
    format!(
        "Reached the maximum of {} fix iterations without approval. Manual intervention needed.",
        max_iterations
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use agentloop_core::CommitSha;

    fn reviewing(count: u32, max: u32) -> IterationState {
        IterationState {
            phase: Phase::UnderReview,
            head_sha: Some(CommitSha::from("abc")),
            iteration_count: count,
            max_iterations: max,
            last_decision: None,
        }
    }

    fn decided(decision: ReviewDecision) -> Event {
        Event::ReviewDecided {
            head_sha: CommitSha::from("abc"),
            decision,
            feedback: "fix the tests".to_string(),
        }
    }

    #[test]
    fn test_approve() {
        let result = handle(reviewing(1, 3), decided(ReviewDecision::Approve));
        assert_eq!(result.state.phase, Phase::Approved);
        assert_eq!(result.state.last_decision, Some(ReviewDecision::Approve));
        assert_eq!(result.state.iteration_count, 1);
    }

    #[test]
    fn test_fix_below_cap_enqueues_next_iteration() {
        let result = handle(reviewing(1, 3), decided(ReviewDecision::Fix));
        assert_eq!(result.state.phase, Phase::FixRequested);
        assert_eq!(result.state.iteration_count, 2);
        assert_eq!(
            result.effects,
            vec![Effect::EnqueueFix {
                head_sha: CommitSha::from("abc"),
                iteration: 2,
                feedback: "fix the tests".to_string(),
            }]
        );
    }

    #[test]
    fn test_fix_at_cap_exhausts_without_job() {
        let result = handle(reviewing(3, 3), decided(ReviewDecision::Fix));
        assert_eq!(result.state.phase, Phase::Exhausted);
        assert_eq!(result.state.iteration_count, 3);
        assert!(result.effects.iter().all(|e| !e.is_job()));
        assert!(matches!(
            result.effects.as_slice(),
            [Effect::PostComment { body }] if body.contains("Manual intervention needed")
        ));
    }

    #[test]
    fn test_zero_max_iterations_exhausts_on_first_fix() {
        let result = handle(reviewing(0, 0), decided(ReviewDecision::Fix));
        assert_eq!(result.state.phase, Phase::Exhausted);
    }

    #[test]
    fn test_decision_for_old_sha_is_stale() {
        let state = reviewing(0, 3);
        let result = handle(
            state.clone(),
            Event::ReviewDecided {
                head_sha: CommitSha::from("old"),
                decision: ReviewDecision::Approve,
                feedback: String::new(),
            },
        );
        assert_eq!(result.state, state);
        assert!(result.effects.is_empty());
    }
}
