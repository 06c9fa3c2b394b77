//! Handler for the AwaitingPr phase.

use super::TransitionResult;
use crate::state_machine::event::Event;
use crate::state_machine::state::{IterationState, Phase};

pub fn handle(state: IterationState, event: Event) -> TransitionResult {
    match event {
        Event::PrOpened { head_sha } => TransitionResult::new(
            IterationState {
                phase: Phase::AwaitingCi,
                head_sha: Some(head_sha),
                ..state
            },
            vec![],
        ),
        _ => TransitionResult::no_change(state),
    }
}
