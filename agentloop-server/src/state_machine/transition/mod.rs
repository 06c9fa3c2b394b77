//! Pure state transition function.
//!
//! Each phase has its own handler module with co-located tests:
//! - `awaiting_pr`: waiting for the Code Agent's PR
//! - `awaiting_ci`: waiting for CI on the current head
//! - `under_review`: review in flight, applies the iteration cap
//! - `fix_requested`: fix iteration in flight
//! - `terminal`: Approved/Exhausted/Closed

mod awaiting_pr;
mod awaiting_ci;
mod fix_requested;
mod terminal;
mod under_review;

use agentloop_core::CommitSha;

use super::effect::{Effect, LogLevel};
use super::event::Event;
use super::state::{IterationState, Phase};

/// Result of a state transition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransitionResult {
    /// The new state after the transition.
    pub state: IterationState,
    /// Effects to execute.
    pub effects: Vec<Effect>,
}

impl TransitionResult {
    pub fn new(state: IterationState, effects: Vec<Effect>) -> Self {
        Self { state, effects }
    }

    pub fn no_change(state: IterationState) -> Self {
        Self {
            state,
            effects: vec![],
        }
    }
}

/// Pure state transition function.
///
/// Given the current state and an event, returns the new state and effects to execute.
/// This function has NO side effects - all effects are returned as data.
pub fn transition(state: IterationState, event: Event) -> TransitionResult {
    if let Event::Closed { merged } = event {
        if state.phase == Phase::Closed {
            return TransitionResult::no_change(state);
        }
        let message = format!(
            "PR {} while {}",
            if merged { "merged" } else { "closed" },
            state.phase
        );
        return TransitionResult::new(
            state.with_phase(Phase::Closed),
            vec![Effect::Log {
                level: LogLevel::Info,
                message,
            }],
        );
    }

    match state.phase {
        Phase::AwaitingPr => awaiting_pr::handle(state, event),
        Phase::AwaitingCi => awaiting_ci::handle(state, event),
        Phase::UnderReview => under_review::handle(state, event),
        Phase::FixRequested => fix_requested::handle(state, event),
        Phase::Approved | Phase::Exhausted | Phase::Closed => terminal::handle(state, event),
    }
}

/// Shared by every phase that accepts a push from the recorded head: the new
/// commit needs fresh CI before anything else happens.
fn head_moved(state: IterationState, after: CommitSha) -> TransitionResult {
    TransitionResult::new(
        IterationState {
            phase: Phase::AwaitingCi,
            head_sha: Some(after),
            ..state
        },
        vec![],
    )
}
