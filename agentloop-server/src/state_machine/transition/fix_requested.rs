//! Handler for the FixRequested phase.

use super::{head_moved, TransitionResult};
use crate::state_machine::event::Event;
use crate::state_machine::state::IterationState;

pub fn handle(state: IterationState, event: Event) -> TransitionResult {
    match event {
        Event::HeadPushed { before, after } if state.is_current(&before) => {
            head_moved(state, after)
        }
        _ => TransitionResult::no_change(state),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state_machine::state::Phase;
    use agentloop_core::CommitSha;

    fn fixing() -> IterationState {
        IterationState {
            phase: Phase::FixRequested,
            head_sha: Some(CommitSha::from("abc")),
            iteration_count: 1,
            max_iterations: 3,
            last_decision: None,
        }
    }

    #[test]
    fn test_push_from_head_returns_to_ci() {
        let result = handle(
            fixing(),
            Event::HeadPushed {
                before: CommitSha::from("abc"),
                after: CommitSha::from("def"),
            },
        );
        assert_eq!(result.state.phase, Phase::AwaitingCi);
        assert_eq!(result.state.head_sha, Some(CommitSha::from("def")));
        assert_eq!(result.state.iteration_count, 1);
    }

    #[test]
    fn test_push_from_other_sha_is_stale() {
        let result = handle(
            fixing(),
            Event::HeadPushed {
                before: CommitSha::from("zzz"),
                after: CommitSha::from("def"),
            },
        );
        assert_eq!(result.state, fixing());
    }
}
