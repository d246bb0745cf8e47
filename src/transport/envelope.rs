//! Message envelope carried over the broker

use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

/// What an envelope is for; decides which topic suffix it travels on
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EnvelopeKind {
    Request,
    Reply,
    Status,
}

impl EnvelopeKind {
    pub fn channel(self) -> &'static str {
        match self {
            EnvelopeKind::Request => "request",
            EnvelopeKind::Reply => "response",
            EnvelopeKind::Status => "status",
        }
    }
}

/// A single message on the wire. Payloads are opaque JSON values.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    pub message_id: Uuid,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub in_reply_to: Option<Uuid>,
    pub kind: EnvelopeKind,
    pub source: String,
    pub destination: String,
    pub operation: String,
    #[serde(default)]
    pub has_error: bool,
    #[serde(default)]
    pub payload: Value,
}

impl Envelope {
    pub fn request(
        source: impl Into<String>,
        destination: impl Into<String>,
        operation: impl Into<String>,
        payload: Value,
    ) -> Self {
        Self {
            message_id: Uuid::new_v4(),
            in_reply_to: None,
            kind: EnvelopeKind::Request,
            source: source.into(),
            destination: destination.into(),
            operation: operation.into(),
            has_error: false,
            payload,
        }
    }

    /// Build the reply to this request, addressed back to its source
    pub fn reply(&self, responder: impl Into<String>, payload: Value, has_error: bool) -> Self {
        Self {
            message_id: Uuid::new_v4(),
            in_reply_to: Some(self.message_id),
            kind: EnvelopeKind::Reply,
            source: responder.into(),
            destination: self.source.clone(),
            operation: self.operation.clone(),
            has_error,
            payload,
        }
    }

    pub fn status(source: impl Into<String>, payload: Value) -> Self {
        let source = source.into();
        Self {
            message_id: Uuid::new_v4(),
            in_reply_to: None,
            kind: EnvelopeKind::Status,
            destination: source.clone(),
            source,
            operation: "status".to_string(),
            has_error: false,
            payload,
        }
    }

    /// Topic this envelope is published on
    pub fn topic(&self) -> String {
        topic(&self.destination, self.kind)
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>, serde_json::Error> {
        serde_json::to_vec(self)
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, serde_json::Error> {
        serde_json::from_slice(bytes)
    }
}

/// Map a dotted hierarchy address onto a topic: `a.b.c.-.name` -> `a/b/c/-/name/<channel>`
pub fn topic(address: &str, kind: EnvelopeKind) -> String {
    format!("{}/{}", address.replace('.', "/"), kind.channel())
}
