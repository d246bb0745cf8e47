//! Runtimes driving the counting client and the counting service
//!
//! Each runtime is a single task that owns its broker connection and reacts
//! to inbound traffic and timer ticks through one `tokio::select!` loop.

mod client;
mod reconnect;
mod service;


pub use client::ClientRuntime;
pub use reconnect::{ReconnectOutcome, Reconnector};
pub use service::ServiceRuntime;

use crate::conversation::ConversationError;
use crate::transport::TransportError;
use thiserror::Error;

/// Buffer between transport pumps and a runtime loop
const INBOUND_CAPACITY: usize = 256;

/// Errors that end a runtime. Everything else is recovered in place.
#[derive(Debug, Error)]
pub enum RuntimeError {
    #[error("Failed to connect to the broker at startup: {0}")]
    Startup(#[source] TransportError),
    #[error("Broker connection cannot be re-established: {0}")]
    Reconnect(#[source] TransportError),
    #[error(transparent)]
    Conversation(#[from] ConversationError),
    #[error("Inbound channel closed unexpectedly")]
    InboundClosed,
}
