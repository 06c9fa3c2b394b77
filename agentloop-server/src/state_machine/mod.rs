//! Per-PR iteration state machine.
//!
//! The design separates:
//! - **State**: what the system knows about one PR (`IterationState`)
//! - **Events**: what happened (`Event`)
//! - **Effects**: what to do about it (`Effect`)
//! - **Transition**: pure function `(State, Event) -> (State, Vec<Effect>)`
//!
//! Agents never set a PR's phase. They report decisions as events and only
//! the transition function applies policy, including the iteration cap.

pub mod effect;
pub mod event;
pub mod state;
pub mod transition;

pub use effect::*;
pub use event::*;
pub use state::*;
pub use transition::*;
