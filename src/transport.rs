//! Broker transport abstraction
//!
//! The runtimes only talk to a broker through these traits, so they can be
//! exercised against the in-memory cluster in tests and against MQTT in
//! production.

mod envelope;
pub mod mqtt;

#[cfg(test)]
pub mod memory;

pub use envelope::{topic, Envelope, EnvelopeKind};

use crate::config::Protocol;
use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::mpsc;

/// Transport failure with classification for retry decisions
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("No broker node reachable after {attempted} attempt(s): {last}")]
    Unreachable { attempted: usize, last: String },
    #[error("Not connected to a broker")]
    NotConnected,
    #[error("Connection lost: {0}")]
    ConnectionLost(String),
    #[error("Broker client error: {0}")]
    Client(String),
    #[error("Failed to encode envelope: {0}")]
    Encode(#[from] serde_json::Error),
    #[error("Protocol {0} is not supported by this build")]
    UnsupportedProtocol(Protocol),
}

impl TransportError {
    /// Whether a later attempt might succeed
    pub fn is_retryable(&self) -> bool {
        !matches!(
            self,
            TransportError::Encode(_) | TransportError::UnsupportedProtocol(_)
        )
    }
}

/// Something delivered by a connection, stamped with that connection's epoch
#[derive(Debug, Clone)]
pub struct Inbound {
    pub epoch: u64,
    pub event: InboundEvent,
}

#[derive(Debug, Clone)]
pub enum InboundEvent {
    Message(Envelope),
    /// The connection died underneath us; no further messages will arrive on it
    ConnectionLost { reason: String },
}

/// Factory for connections to a broker cluster. Node selection is its job.
#[async_trait]
pub trait Broker: Send + Sync + 'static {
    type Connection: Connection;

    /// Connect, subscribe to `subscription`, and forward everything received
    /// to `inbound` stamped with `epoch`.
    async fn connect(
        &self,
        subscription: &str,
        epoch: u64,
        inbound: mpsc::Sender<Inbound>,
    ) -> Result<Self::Connection, TransportError>;
}

/// A live connection to one cluster node
#[async_trait]
pub trait Connection: Send + Sync + 'static {
    /// Human-readable identity of the node this connection is attached to
    fn node(&self) -> &str;

    async fn send(&self, envelope: &Envelope) -> Result<(), TransportError>;

    /// Release the connection and stop forwarding inbound traffic
    async fn disconnect(self) -> Result<(), TransportError>;
}
