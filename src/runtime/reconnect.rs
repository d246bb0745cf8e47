//! Connection ownership and atomic reconnect-and-resume

use crate::config::ReconnectPolicy;
use crate::transport::{Broker, Connection, Envelope, Inbound, TransportError};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

/// Result of one reconnect attempt
#[derive(Debug)]
pub enum ReconnectOutcome {
    /// Connected and, if asked to, sent the resume message
    Resumed { epoch: u64, node: String },
    /// Attempt failed; another is scheduled after `retry_in`
    Failed { error: TransportError, retry_in: Duration },
    /// Attempt failed in a way no retry can fix; nothing is scheduled
    Abandoned { error: TransportError },
    /// Shutdown was requested during the pause
    Cancelled,
}

/// Owns the single broker connection of a runtime.
///
/// Every connection gets a new epoch, and inbound traffic is stamped with the
/// epoch of the connection that received it, so callers can drop anything
/// that arrived on a connection that has since been replaced.
pub struct Reconnector<B: Broker> {
    broker: B,
    subscription: String,
    connection: Option<B::Connection>,
    epoch: u64,
    inbound_tx: mpsc::Sender<Inbound>,
    policy: ReconnectPolicy,
    failures: u32,
    retry_at: Option<Instant>,
}

impl<B: Broker> Reconnector<B> {
    pub fn new(
        broker: B,
        subscription: impl Into<String>,
        inbound_tx: mpsc::Sender<Inbound>,
        policy: ReconnectPolicy,
    ) -> Self {
        Self {
            broker,
            subscription: subscription.into(),
            connection: None,
            epoch: 0,
            inbound_tx,
            policy,
            failures: 0,
            retry_at: None,
        }
    }

    /// Initial connection. Failure here is not retried.
    pub async fn connect(&mut self) -> Result<String, TransportError> {
        self.establish().await
    }

    pub fn is_connected(&self) -> bool {
        self.connection.is_some()
    }

    pub fn current_epoch(&self) -> u64 {
        self.epoch
    }

    pub fn is_current(&self, epoch: u64) -> bool {
        epoch == self.epoch
    }

    /// Whether a scheduled retry should run now
    pub fn retry_due(&self, now: Instant) -> bool {
        self.retry_at.is_some_and(|at| now >= at)
    }

    pub async fn send(&self, envelope: &Envelope) -> Result<(), TransportError> {
        match &self.connection {
            Some(connection) => connection.send(envelope).await,
            None => Err(TransportError::NotConnected),
        }
    }

    /// Tear down, pause, connect again and send `resume` on the new
    /// connection. Never returns an error; retryable failures schedule a
    /// retry and the rest are handed back as `Abandoned`.
    pub async fn reconnect_and_resume(
        &mut self,
        resume: Option<&Envelope>,
        cancel: &CancellationToken,
    ) -> ReconnectOutcome {
        self.retry_at = None;

        if let Some(old) = self.connection.take() {
            let node = old.node().to_string();
            if let Err(e) = old.disconnect().await {
                tracing::warn!(node = %node, error = %e, "Error while disconnecting; continuing");
            }

            tokio::select! {
                () = cancel.cancelled() => return ReconnectOutcome::Cancelled,
                () = tokio::time::sleep(self.policy.pause) => {}
            }
        }

        let result = match self.establish().await {
            Ok(node) => match resume {
                Some(envelope) => self.send(envelope).await.map(|()| node),
                None => Ok(node),
            },
            Err(e) => Err(e),
        };

        match result {
            Ok(node) => {
                self.failures = 0;
                ReconnectOutcome::Resumed {
                    epoch: self.epoch,
                    node,
                }
            }
            Err(error) => {
                // A connection that could not carry the resume message is useless
                if let Some(connection) = self.connection.take() {
                    let node = connection.node().to_string();
                    if let Err(e) = connection.disconnect().await {
                        tracing::warn!(node = %node, error = %e, "Error while disconnecting after failed resume");
                    }
                }
                if !error.is_retryable() {
                    return ReconnectOutcome::Abandoned { error };
                }
                self.failures = self.failures.saturating_add(1);
                let retry_in = self.policy.backoff(self.failures);
                self.retry_at = Some(Instant::now() + retry_in);
                ReconnectOutcome::Failed { error, retry_in }
            }
        }
    }

    /// Release the connection, if any
    pub async fn shutdown(&mut self) {
        self.retry_at = None;
        if let Some(connection) = self.connection.take() {
            let node = connection.node().to_string();
            match connection.disconnect().await {
                Ok(()) => tracing::info!(node = %node, "Disconnected from broker"),
                Err(e) => tracing::warn!(node = %node, error = %e, "Error while disconnecting"),
            }
        }
    }

    async fn establish(&mut self) -> Result<String, TransportError> {
        self.epoch += 1;
        let connection = self
            .broker
            .connect(&self.subscription, self.epoch, self.inbound_tx.clone())
            .await?;
        let node = connection.node().to_string();
        self.connection = Some(connection);
        Ok(node)
    }
}
