//! Actions and observations produced by transitions

use serde_json::Value;
use thiserror::Error;

/// An outbound request waiting to be sent. Immutable once built.
#[derive(Debug, Clone, PartialEq)]
pub struct PendingMessage {
    pub destination: String,
    pub operation: String,
    pub payload: Value,
}

impl PendingMessage {
    pub fn new(destination: impl Into<String>, operation: impl Into<String>, payload: Value) -> Self {
        Self {
            destination: destination.into(),
            operation: operation.into(),
            payload,
        }
    }
}

/// Error that ends the conversation. No transition currently produces one.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum ConversationError {
    #[error("Conversation cannot continue: {0}")]
    Unrecoverable(String),
}

/// What the runtime must do after a transition
#[derive(Debug, Clone, PartialEq)]
pub enum Action {
    /// Send this message next
    Advance(PendingMessage),
    /// Nothing to send; the chain is unaffected
    Ignore,
    /// Stop the conversation
    Fatal(ConversationError),
}

impl Action {
    pub fn message(&self) -> Option<&PendingMessage> {
        match self {
            Action::Advance(message) => Some(message),
            Action::Ignore | Action::Fatal(_) => None,
        }
    }
}

/// Things worth reporting about a reply. Purely informational.
#[derive(Debug, Clone, PartialEq)]
pub enum Observation {
    /// The start operation was acknowledged
    CounterStarted { already_running: bool },
    /// The service refused or failed the start operation
    StartRejected { payload: Value },
    /// A reply arrived before the chain started and was not the start reply
    IgnoredBeforeStart { operation: String },
    CountObserved { value: u64, client_elapsed_secs: u64 },
    /// The count jumped by more than one since the last observation
    CountSkipped { skipped: u64, value: u64, previous: u64 },
    UnexpectedOperation { operation: String },
    ErrorReply { operation: String, payload: Value },
    MalformedPayload { operation: String, payload: Value },
}
