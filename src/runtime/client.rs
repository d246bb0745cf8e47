//! Client lifecycle driver
//!
//! One task owns the conversation state, the liveness monitor and the broker
//! connection. Replies and ticks are handled on that task in arrival order, so
//! there is never more than one request in flight.

use super::reconnect::{ReconnectOutcome, Reconnector};
use super::{RuntimeError, INBOUND_CAPACITY};
use crate::config::ClientConfig;
use crate::conversation::{
    resume_message, transition, Action, ConversationContext, ConversationState, Observation,
    PendingMessage, Reply,
};
use crate::liveness::{Liveness, LivenessMonitor};
use crate::transport::{topic, Broker, Envelope, EnvelopeKind, Inbound, InboundEvent};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

pub struct ClientRuntime<B: Broker> {
    context: ConversationContext,
    state: ConversationState,
    client_address: String,
    reconnector: Reconnector<B>,
    liveness: LivenessMonitor,
    inbound_rx: mpsc::Receiver<Inbound>,
    tick_interval: Duration,
    poll_interval: Duration,
    /// Id of the one request whose reply may drive the conversation
    outstanding: Option<Uuid>,
    /// Poll waiting for its send time when a poll interval is configured
    scheduled: Option<(Instant, PendingMessage)>,
}

impl<B: Broker> ClientRuntime<B> {
    pub fn new(config: &ClientConfig, broker: B) -> Self {
        let (inbound_tx, inbound_rx) = mpsc::channel(INBOUND_CAPACITY);
        let client_address = config.client_address();
        let subscription = topic(&client_address, EnvelopeKind::Reply);

        Self {
            context: ConversationContext::new(config.service_address()),
            state: ConversationState::new(),
            client_address,
            reconnector: Reconnector::new(broker, subscription, inbound_tx, config.reconnect),
            liveness: LivenessMonitor::new(config.stale_threshold, Instant::now()),
            inbound_rx,
            tick_interval: config.tick_interval,
            poll_interval: config.poll_interval,
            outstanding: None,
            scheduled: None,
        }
    }

    /// Run until `cancel` fires. Returns the final conversation state.
    pub async fn run(mut self, cancel: CancellationToken) -> Result<ConversationState, RuntimeError> {
        let node = self.reconnector.connect().await.map_err(RuntimeError::Startup)?;
        tracing::info!(
            node = %node,
            service = %self.context.service_address,
            threshold_secs = self.liveness.threshold().as_secs_f64(),
            "Client connected; starting conversation"
        );
        self.liveness.record_message(Instant::now());
        self.send(self.context.start_message()).await;

        let mut ticker = tokio::time::interval_at(Instant::now() + self.tick_interval, self.tick_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        let result = loop {
            let poll_at = self.scheduled.as_ref().map(|(at, _)| *at);

            tokio::select! {
                () = cancel.cancelled() => break Ok(()),
                inbound = self.inbound_rx.recv() => match inbound {
                    Some(inbound) => {
                        if let Err(e) = self.handle_inbound(inbound).await {
                            break Err(e);
                        }
                    }
                    None => break Err(RuntimeError::InboundClosed),
                },
                () = tokio::time::sleep_until(poll_at.unwrap_or_else(Instant::now)), if poll_at.is_some() => {
                    if let Some((_, message)) = self.scheduled.take() {
                        self.send(message).await;
                    }
                }
                _ = ticker.tick() => {
                    if let Err(e) = self.handle_tick(&cancel).await {
                        break Err(e);
                    }
                }
            }
        };

        self.reconnector.shutdown().await;
        tracing::info!(last_count = ?self.state.last_count, "Client runtime stopped");
        result.map(|()| self.state)
    }

    async fn handle_inbound(&mut self, inbound: Inbound) -> Result<(), RuntimeError> {
        if !self.reconnector.is_current(inbound.epoch) {
            tracing::debug!(
                epoch = inbound.epoch,
                current = self.reconnector.current_epoch(),
                "Discarding traffic from a replaced connection"
            );
            return Ok(());
        }

        let envelope = match inbound.event {
            InboundEvent::Message(envelope) => envelope,
            InboundEvent::ConnectionLost { reason } => {
                tracing::warn!(reason = %reason, "Broker connection lost; waiting for liveness check");
                return Ok(());
            }
        };

        self.liveness.record_message(Instant::now());

        if envelope.kind != EnvelopeKind::Reply {
            tracing::debug!(kind = ?envelope.kind, operation = %envelope.operation, "Ignoring non-reply message");
            return Ok(());
        }
        if envelope.in_reply_to.is_none() || envelope.in_reply_to != self.outstanding {
            tracing::debug!(
                operation = %envelope.operation,
                in_reply_to = ?envelope.in_reply_to,
                "Ignoring reply to a superseded request"
            );
            return Ok(());
        }
        self.outstanding = None;

        let mut reply = Reply::new(envelope.operation, envelope.payload, Instant::now())
            .with_source(envelope.source);
        if envelope.has_error {
            reply = reply.with_error();
        }

        let result = transition(&self.state, &self.context, reply);
        self.state = result.new_state;
        for observation in &result.observations {
            log_observation(observation);
        }

        match result.action {
            Action::Advance(message) => self.advance(message).await,
            Action::Ignore => {}
            Action::Fatal(e) => return Err(e.into()),
        }
        Ok(())
    }

    async fn handle_tick(&mut self, cancel: &CancellationToken) -> Result<(), RuntimeError> {
        let now = Instant::now();
        if self.reconnector.retry_due(now) {
            tracing::info!("Retrying broker connection");
            return self.reconnect(cancel).await;
        }
        // Disconnected and waiting for the retry; silence is expected
        if !self.reconnector.is_connected() {
            return Ok(());
        }

        if let Liveness::Stale { silent_for } = self.liveness.check(now) {
            tracing::warn!(
                silent_secs = silent_for.as_secs_f64(),
                "No message received within threshold; reconnecting"
            );
            return self.reconnect(cancel).await;
        }
        Ok(())
    }

    async fn reconnect(&mut self, cancel: &CancellationToken) -> Result<(), RuntimeError> {
        self.scheduled = None;
        let envelope = self.request(resume_message(&self.state, &self.context));
        self.outstanding = Some(envelope.message_id);

        match self.reconnector.reconnect_and_resume(Some(&envelope), cancel).await {
            ReconnectOutcome::Resumed { epoch, node } => {
                tracing::info!(
                    node = %node,
                    epoch,
                    operation = %envelope.operation,
                    "Reconnected and resumed conversation"
                );
                self.liveness.record_message(Instant::now());
            }
            ReconnectOutcome::Failed { error, retry_in } => {
                tracing::warn!(
                    error = %error,
                    retry_in_secs = retry_in.as_secs_f64(),
                    "Reconnect failed; will retry"
                );
            }
            ReconnectOutcome::Abandoned { error } => {
                tracing::error!(error = %error, "Reconnect failed and cannot be retried");
                return Err(RuntimeError::Reconnect(error));
            }
            ReconnectOutcome::Cancelled => {
                tracing::debug!("Reconnect abandoned for shutdown");
            }
        }
        Ok(())
    }

    async fn advance(&mut self, message: PendingMessage) {
        if self.poll_interval.is_zero() {
            self.send(message).await;
        } else {
            self.scheduled = Some((Instant::now() + self.poll_interval, message));
        }
    }

    /// Send a request. Failures are left to the liveness check to recover.
    async fn send(&mut self, message: PendingMessage) {
        let envelope = self.request(message);
        self.outstanding = Some(envelope.message_id);
        if let Err(e) = self.reconnector.send(&envelope).await {
            tracing::warn!(
                error = %e,
                operation = %envelope.operation,
                "Failed to send request; liveness check will recover"
            );
        }
    }

    fn request(&self, message: PendingMessage) -> Envelope {
        Envelope::request(
            &self.client_address,
            message.destination,
            message.operation,
            message.payload,
        )
    }
}

fn log_observation(observation: &Observation) {
    match observation {
        Observation::CounterStarted { already_running: true } => {
            tracing::info!("Counter was already running; starting to poll");
        }
        Observation::CounterStarted { already_running: false } => {
            tracing::info!("Counter started; starting to poll");
        }
        Observation::StartRejected { payload } => {
            tracing::warn!(payload = %payload, "Service failed the start request");
        }
        Observation::IgnoredBeforeStart { operation } => {
            tracing::debug!(operation = %operation, "Ignoring reply received before start");
        }
        Observation::CountObserved {
            value,
            client_elapsed_secs,
        } => {
            tracing::info!(count = value, client_elapsed_secs, "Count received");
        }
        Observation::CountSkipped {
            skipped,
            value,
            previous,
        } => {
            tracing::warn!(skipped, count = value, previous, "Counter skipped values");
        }
        Observation::UnexpectedOperation { operation } => {
            tracing::warn!(operation = %operation, "Reply for unexpected operation");
        }
        Observation::ErrorReply { operation, payload } => {
            tracing::warn!(operation = %operation, payload = %payload, "Service returned an error");
        }
        Observation::MalformedPayload { operation, payload } => {
            tracing::warn!(operation = %operation, payload = %payload, "Malformed reply payload");
        }
    }
}
