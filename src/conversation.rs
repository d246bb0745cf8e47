//! Conversation state machine
//!
//! Pure transitions in the Elm style: the runtime feeds replies in and gets
//! back the next state plus the single action to perform.

mod action;
mod event;
mod state;
mod transition;

#[cfg(test)]
mod proptests;

pub use action::{Action, ConversationError, Observation, PendingMessage};
pub use event::Reply;
pub use state::{ConversationContext, ConversationState, ConversationStep};
pub use transition::{resume_message, transition, TransitionResult};
