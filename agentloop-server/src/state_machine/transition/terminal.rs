//! Handler for terminal phases (Approved, Exhausted, Closed).
//!
//! Nothing moves a terminal PR except closing, which `transition` handles
//! before dispatching here.

use super::TransitionResult;
use crate::state_machine::event::Event;
use crate::state_machine::state::IterationState;

pub fn handle(state: IterationState, _event: Event) -> TransitionResult {
    TransitionResult::no_change(state)
}
