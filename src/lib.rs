//! Cluster counter
//!
//! A counting service and a client that keeps a request/reply chain with it
//! alive across broker node failures. The client detects silence on its
//! connection, reconnects to another node and resumes the chain exactly where
//! it left off.

pub mod capability;
pub mod config;
pub mod conversation;
pub mod counter;
pub mod liveness;
pub mod logging;
pub mod runtime;
pub mod signal;
pub mod transport;
