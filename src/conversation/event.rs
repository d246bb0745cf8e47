//! Inbound replies that drive the conversation

use serde_json::Value;
use tokio::time::Instant;

/// A reply delivered by the transport
#[derive(Debug, Clone)]
pub struct Reply {
    pub source: String,
    pub operation: String,
    pub has_error: bool,
    pub payload: Value,
    pub received_at: Instant,
}

impl Reply {
    pub fn new(operation: impl Into<String>, payload: Value, received_at: Instant) -> Self {
        Self {
            source: String::new(),
            operation: operation.into(),
            has_error: false,
            payload,
            received_at,
        }
    }

    pub fn with_source(mut self, source: impl Into<String>) -> Self {
        self.source = source.into();
        self
    }

    pub fn with_error(mut self) -> Self {
        self.has_error = true;
        self
    }
}
