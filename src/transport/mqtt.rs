//! MQTT transport over a broker cluster
//!
//! Each `connect` walks the configured endpoints starting after the node used
//! last time, so a reconnect after a node failure lands on a different node.

use super::{Broker, Connection, Envelope, Inbound, InboundEvent, TransportError};
use crate::config::{BrokerConfig, BrokerEndpoint, Protocol};
use async_trait::async_trait;
use rumqttc::{AsyncClient, Event, EventLoop, MqttOptions, Packet, QoS};
use std::fmt;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

const REQUEST_CHANNEL_CAPACITY: usize = 10;
const KEEP_ALIVE: Duration = Duration::from_secs(30);
const PUMP_SHUTDOWN_GRACE: Duration = Duration::from_millis(500);

/// Connection factory for an MQTT broker cluster
pub struct MqttBroker {
    config: BrokerConfig,
    client_id_prefix: String,
    next_node: AtomicUsize,
}

impl MqttBroker {
    pub fn new(config: BrokerConfig, client_id_prefix: impl Into<String>) -> Result<Self, TransportError> {
        if config.protocol != Protocol::Mqtt311 {
            return Err(TransportError::UnsupportedProtocol(config.protocol));
        }
        if config.endpoints.is_empty() {
            return Err(TransportError::Unreachable {
                attempted: 0,
                last: "no endpoints configured".to_string(),
            });
        }
        Ok(Self {
            config,
            client_id_prefix: client_id_prefix.into(),
            next_node: AtomicUsize::new(0),
        })
    }

    fn options(&self, endpoint: &BrokerEndpoint) -> MqttOptions {
        let client_id = format!("{}-{}", self.client_id_prefix, uuid::Uuid::new_v4().simple());
        let mut options = MqttOptions::new(client_id, endpoint.host.clone(), endpoint.port);
        options.set_credentials(self.config.username.clone(), self.config.password.clone());
        options.set_keep_alive(KEEP_ALIVE);
        options.set_clean_session(true);
        options
    }

    /// Dial one node and wait for the broker to acknowledge the session
    async fn dial(&self, endpoint: &BrokerEndpoint) -> Result<(AsyncClient, EventLoop), String> {
        let (client, mut eventloop) =
            AsyncClient::new(self.options(endpoint), REQUEST_CHANNEL_CAPACITY);

        let handshake = async {
            loop {
                match eventloop.poll().await {
                    Ok(Event::Incoming(Packet::ConnAck(_))) => return Ok(()),
                    Ok(_) => {}
                    Err(e) => return Err(e.to_string()),
                }
            }
        };

        match tokio::time::timeout(self.config.connect_timeout, handshake).await {
            Ok(Ok(())) => Ok((client, eventloop)),
            Ok(Err(e)) => Err(e),
            Err(_) => Err(format!(
                "timed out after {:?}",
                self.config.connect_timeout
            )),
        }
    }
}

#[async_trait]
impl Broker for MqttBroker {
    type Connection = MqttConnection;

    async fn connect(
        &self,
        subscription: &str,
        epoch: u64,
        inbound: mpsc::Sender<Inbound>,
    ) -> Result<MqttConnection, TransportError> {
        let endpoints = &self.config.endpoints;
        let start = self.next_node.load(Ordering::SeqCst);
        let mut last_error = String::new();

        for offset in 0..endpoints.len() {
            let index = (start + offset) % endpoints.len();
            let endpoint = &endpoints[index];

            let (client, eventloop) = match self.dial(endpoint).await {
                Ok(pair) => pair,
                Err(e) => {
                    tracing::warn!(node = %endpoint, error = %e, "Broker node unavailable");
                    last_error = format!("{endpoint}: {e}");
                    continue;
                }
            };

            if let Err(e) = client.subscribe(subscription, QoS::AtLeastOnce).await {
                tracing::warn!(node = %endpoint, error = %e, "Subscribe failed");
                last_error = format!("{endpoint}: {e}");
                continue;
            }

            self.next_node.store((index + 1) % endpoints.len(), Ordering::SeqCst);
            let cancel = CancellationToken::new();
            let pump = tokio::spawn(pump(eventloop, epoch, inbound, cancel.clone()));

            tracing::info!(node = %endpoint, epoch, topic = %subscription, "Connected to MQTT broker");
            return Ok(MqttConnection {
                client,
                node: endpoint.to_string(),
                cancel,
                pump,
            });
        }

        Err(TransportError::Unreachable {
            attempted: endpoints.len(),
            last: last_error,
        })
    }
}

/// Drive the event loop, forwarding publishes until cancelled or the link dies
async fn pump(
    mut eventloop: EventLoop,
    epoch: u64,
    inbound: mpsc::Sender<Inbound>,
    cancel: CancellationToken,
) {
    loop {
        tokio::select! {
            () = cancel.cancelled() => break,
            event = eventloop.poll() => match event {
                Ok(Event::Incoming(Packet::Publish(publish))) => {
                    match Envelope::from_bytes(&publish.payload) {
                        Ok(envelope) => {
                            let message = Inbound { epoch, event: InboundEvent::Message(envelope) };
                            if !forward(&inbound, message, &cancel).await {
                                break;
                            }
                        }
                        Err(e) => {
                            tracing::warn!(topic = %publish.topic, error = %e, "Dropping undecodable message");
                        }
                    }
                }
                Ok(_) => {}
                Err(e) => {
                    tracing::warn!(epoch, error = %e, "MQTT connection error");
                    let lost = Inbound {
                        epoch,
                        event: InboundEvent::ConnectionLost { reason: e.to_string() },
                    };
                    forward(&inbound, lost, &cancel).await;
                    break;
                }
            }
        }
    }
    tracing::debug!(epoch, "MQTT event loop stopped");
}

/// Hand `message` to the runtime. A full channel must not hold up shutdown,
/// so the wait gives way to `cancel`. Returns false once nothing more can be
/// delivered.
async fn forward(inbound: &mpsc::Sender<Inbound>, message: Inbound, cancel: &CancellationToken) -> bool {
    tokio::select! {
        () = cancel.cancelled() => false,
        delivered = inbound.send(message) => delivered.is_ok(),
    }
}

pub struct MqttConnection {
    client: AsyncClient,
    node: String,
    cancel: CancellationToken,
    pump: JoinHandle<()>,
}

impl fmt::Debug for MqttConnection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MqttConnection")
            .field("node", &self.node)
            .field("pump_finished", &self.pump.is_finished())
            .finish_non_exhaustive()
    }
}

#[async_trait]
impl Connection for MqttConnection {
    fn node(&self) -> &str {
        &self.node
    }

    async fn send(&self, envelope: &Envelope) -> Result<(), TransportError> {
        if self.pump.is_finished() {
            return Err(TransportError::ConnectionLost(format!(
                "event loop for {} has stopped",
                self.node
            )));
        }
        let bytes = envelope.to_bytes()?;
        self.client
            .publish(envelope.topic(), QoS::AtLeastOnce, false, bytes)
            .await
            .map_err(|e| TransportError::Client(e.to_string()))
    }

    async fn disconnect(self) -> Result<(), TransportError> {
        let result = self
            .client
            .disconnect()
            .await
            .map_err(|e| TransportError::Client(e.to_string()));

        // Give the pump a moment to flush the DISCONNECT before tearing it down
        let mut pump = self.pump;
        if tokio::time::timeout(PUMP_SHUTDOWN_GRACE, &mut pump).await.is_err() {
            self.cancel.cancel();
            let _ = pump.await;
        }
        tracing::info!(node = %self.node, "Disconnected from MQTT broker");
        result
    }
}
