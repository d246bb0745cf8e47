//! Service runtime: answers counting requests and publishes status

use super::reconnect::{ReconnectOutcome, Reconnector};
use super::{RuntimeError, INBOUND_CAPACITY};
use crate::capability::CountingCapability;
use crate::config::ServiceConfig;
use crate::transport::{topic, Broker, Envelope, EnvelopeKind, Inbound, InboundEvent};
use serde_json::json;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

pub struct ServiceRuntime<B: Broker> {
    address: String,
    capability: CountingCapability,
    reconnector: Reconnector<B>,
    inbound_rx: mpsc::Receiver<Inbound>,
    status_interval: Duration,
    tick_interval: Duration,
}

impl<B: Broker> ServiceRuntime<B> {
    pub fn new(config: &ServiceConfig, broker: B, capability: CountingCapability) -> Self {
        let (inbound_tx, inbound_rx) = mpsc::channel(INBOUND_CAPACITY);
        let address = config.service_address();
        let subscription = topic(&address, EnvelopeKind::Request);

        Self {
            address,
            capability,
            reconnector: Reconnector::new(broker, subscription, inbound_tx, config.reconnect),
            inbound_rx,
            status_interval: config.status_interval,
            tick_interval: config.tick_interval,
        }
    }

    pub async fn run(mut self, cancel: CancellationToken) -> Result<(), RuntimeError> {
        let node = match self.reconnector.connect().await {
            Ok(node) => node,
            Err(e) => {
                self.capability.shutdown().await;
                return Err(RuntimeError::Startup(e));
            }
        };
        tracing::info!(node = %node, address = %self.address, "Service connected; accepting requests");

        let now = Instant::now();
        let mut status = tokio::time::interval_at(now + self.status_interval, self.status_interval);
        status.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut ticker = tokio::time::interval_at(now + self.tick_interval, self.tick_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        let result = loop {
            tokio::select! {
                () = cancel.cancelled() => break Ok(()),
                inbound = self.inbound_rx.recv() => match inbound {
                    Some(inbound) => {
                        if let Err(e) = self.handle_inbound(inbound, &cancel).await {
                            break Err(e);
                        }
                    }
                    None => break Err(RuntimeError::InboundClosed),
                },
                _ = status.tick() => self.publish_status().await,
                _ = ticker.tick() => {
                    if self.reconnector.retry_due(Instant::now()) {
                        tracing::info!("Retrying broker connection");
                        if let Err(e) = self.reconnect(&cancel).await {
                            break Err(e);
                        }
                    }
                }
            }
        };

        self.capability.shutdown().await;
        self.reconnector.shutdown().await;
        tracing::info!("Service runtime stopped");
        result
    }

    async fn handle_inbound(&mut self, inbound: Inbound, cancel: &CancellationToken) -> Result<(), RuntimeError> {
        if !self.reconnector.is_current(inbound.epoch) {
            tracing::debug!(epoch = inbound.epoch, "Discarding traffic from a replaced connection");
            return Ok(());
        }

        match inbound.event {
            InboundEvent::ConnectionLost { reason } => {
                tracing::warn!(reason = %reason, "Broker connection lost; reconnecting");
                return self.reconnect(cancel).await;
            }
            InboundEvent::Message(request) if request.kind == EnvelopeKind::Request => {
                self.handle_request(&request).await;
            }
            InboundEvent::Message(other) => {
                tracing::debug!(kind = ?other.kind, "Ignoring non-request message");
            }
        }
        Ok(())
    }

    async fn handle_request(&self, request: &Envelope) {
        let (payload, has_error) = match self.capability.handle(&request.operation, &request.payload).await {
            Ok(payload) => (payload, false),
            Err(e) => {
                tracing::warn!(operation = %request.operation, source = %request.source, error = %e, "Request failed");
                (json!(e.to_string()), true)
            }
        };

        let reply = request.reply(&self.address, payload, has_error);
        if let Err(e) = self.reconnector.send(&reply).await {
            tracing::warn!(error = %e, operation = %request.operation, "Failed to send reply");
        }
    }

    async fn publish_status(&self) {
        if !self.reconnector.is_connected() {
            return;
        }
        let snapshot = self.capability.status().await;
        let payload = match serde_json::to_value(snapshot) {
            Ok(payload) => payload,
            Err(e) => {
                tracing::warn!(error = %e, "Failed to encode status");
                return;
            }
        };
        tracing::debug!(count = snapshot.count, counting = snapshot.counting, "Publishing status");
        if let Err(e) = self.reconnector.send(&Envelope::status(&self.address, payload)).await {
            tracing::warn!(error = %e, "Failed to publish status");
        }
    }

    async fn reconnect(&mut self, cancel: &CancellationToken) -> Result<(), RuntimeError> {
        match self.reconnector.reconnect_and_resume(None, cancel).await {
            ReconnectOutcome::Resumed { epoch, node } => {
                tracing::info!(node = %node, epoch, "Service reconnected");
            }
            ReconnectOutcome::Failed { error, retry_in } => {
                tracing::warn!(error = %error, retry_in_secs = retry_in.as_secs_f64(), "Reconnect failed; will retry");
            }
            ReconnectOutcome::Abandoned { error } => {
                tracing::error!(error = %error, "Reconnect failed and cannot be retried");
                return Err(RuntimeError::Reconnect(error));
            }
            ReconnectOutcome::Cancelled => tracing::debug!("Reconnect abandoned for shutdown"),
        }
        Ok(())
    }
}
