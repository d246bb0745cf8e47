//! Conversation state types

use super::PendingMessage;
use crate::capability::{GET_COUNT, START_COUNT};
use serde_json::Value;
use tokio::time::Instant;

/// Which step of the request/reply chain comes next
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ConversationStep {
    /// The start request is in flight
    #[default]
    AwaitingStart,
    /// The chain is running; every reply triggers the next poll
    Polling,
}

/// Per-client conversation state. Only changed by `transition`.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct ConversationState {
    pub step: ConversationStep,
    /// Last count the service reported
    pub last_count: Option<u64>,
    /// When the chain first entered `Polling`; display only
    pub polling_since: Option<Instant>,
}

impl ConversationState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_polling(&self) -> bool {
        self.step == ConversationStep::Polling
    }
}

/// Immutable addressing for one conversation
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConversationContext {
    pub service_address: String,
}

impl ConversationContext {
    pub fn new(service_address: impl Into<String>) -> Self {
        Self {
            service_address: service_address.into(),
        }
    }

    pub fn start_message(&self) -> PendingMessage {
        PendingMessage::new(&self.service_address, START_COUNT, Value::Null)
    }

    pub fn poll_message(&self) -> PendingMessage {
        PendingMessage::new(&self.service_address, GET_COUNT, Value::Null)
    }
}
