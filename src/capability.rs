//! Counting capability: the operations the service exposes over the broker

use crate::counter::{CounterSnapshot, CounterStore};
use serde_json::{json, Value};
use thiserror::Error;

pub const CAPABILITY_NAME: &str = "CountingExample";
pub const START_COUNT: &str = "CountingExample.start_count";
pub const STOP_COUNT: &str = "CountingExample.stop_count";
pub const GET_COUNT: &str = "CountingExample.get_count";

#[derive(Debug, Error, PartialEq, Eq)]
pub enum CapabilityError {
    #[error("Unknown operation: {0}")]
    UnknownOperation(String),
    #[error("Failed to encode response: {0}")]
    Encode(String),
}

/// Operations of the counting capability, parsed from their wire names
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operation {
    StartCount,
    StopCount,
    GetCount,
}

impl Operation {
    pub fn parse(name: &str) -> Option<Self> {
        match name {
            START_COUNT => Some(Operation::StartCount),
            STOP_COUNT => Some(Operation::StopCount),
            GET_COUNT => Some(Operation::GetCount),
            _ => None,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            Operation::StartCount => START_COUNT,
            Operation::StopCount => STOP_COUNT,
            Operation::GetCount => GET_COUNT,
        }
    }
}

/// Counting capability backed by a shared counter
#[derive(Clone)]
pub struct CountingCapability {
    counter: CounterStore,
}

impl CountingCapability {
    /// Create the capability with its counter already running
    pub async fn start() -> Self {
        let counter = CounterStore::new();
        tracing::info!("Starting counter automatically at service startup");
        counter.start_counting().await;
        Self { counter }
    }

    pub fn with_counter(counter: CounterStore) -> Self {
        Self { counter }
    }

    /// Handle one request; the payload is ignored by every current operation
    pub async fn handle(&self, operation: &str, _payload: &Value) -> Result<Value, CapabilityError> {
        let op = Operation::parse(operation)
            .ok_or_else(|| CapabilityError::UnknownOperation(operation.to_string()))?;

        match op {
            Operation::StartCount => encode(&self.counter.start_counting().await),
            Operation::StopCount => encode(&self.counter.stop_counting().await),
            Operation::GetCount => {
                let count = self.counter.get_count().await;
                if count % 10 == 0 {
                    tracing::info!(count, "Client requested count");
                }
                Ok(json!(count))
            }
        }
    }

    pub async fn status(&self) -> CounterSnapshot {
        self.counter.snapshot().await
    }

    pub async fn shutdown(&self) {
        self.counter.shutdown().await;
    }
}

fn encode<T: serde::Serialize>(value: &T) -> Result<Value, CapabilityError> {
    serde_json::to_value(value).map_err(|e| CapabilityError::Encode(e.to_string()))
}
