//! In-process broker cluster for tests
//!
//! Nodes can be partitioned (silently stop delivering) or crashed (attached
//! connections are told they were lost), and brought back later.

use super::{Broker, Connection, Envelope, Inbound, InboundEvent, TransportError};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;

#[derive(Debug)]
struct Node {
    name: String,
    up: bool,
}

#[derive(Debug)]
struct Subscriber {
    node: usize,
    topic: String,
    epoch: u64,
    inbound: mpsc::Sender<Inbound>,
}

#[derive(Debug, Default)]
struct ClusterState {
    nodes: Vec<Node>,
    next_node: usize,
    subscribers: HashMap<u64, Subscriber>,
    next_conn_id: u64,
    connect_attempts: usize,
    connects: usize,
    disconnects: usize,
    tap: Option<mpsc::UnboundedSender<Envelope>>,
}

/// Handle to a shared in-memory cluster; clones refer to the same cluster
#[derive(Debug, Clone)]
pub struct MemoryCluster {
    state: Arc<Mutex<ClusterState>>,
}

impl MemoryCluster {
    pub fn new(node_count: usize) -> Self {
        let nodes = (0..node_count)
            .map(|i| Node {
                name: format!("node{}", i + 1),
                up: true,
            })
            .collect();
        Self {
            state: Arc::new(Mutex::new(ClusterState {
                nodes,
                ..ClusterState::default()
            })),
        }
    }

    /// Receive a copy of every envelope successfully published from now on
    pub fn tap(&self) -> mpsc::UnboundedReceiver<Envelope> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.state.lock().unwrap().tap = Some(tx);
        rx
    }

    /// Node stops delivering without telling anyone
    pub fn partition_node(&self, index: usize) {
        let mut state = self.state.lock().unwrap();
        state.nodes[index].up = false;
        state.subscribers.retain(|_, sub| sub.node != index);
    }

    /// Node goes down and attached connections observe the loss
    pub fn crash_node(&self, index: usize) {
        let mut state = self.state.lock().unwrap();
        state.nodes[index].up = false;
        let reason = format!("{} crashed", state.nodes[index].name);
        let lost: Vec<u64> = state
            .subscribers
            .iter()
            .filter(|(_, sub)| sub.node == index)
            .map(|(id, _)| *id)
            .collect();
        for id in lost {
            if let Some(sub) = state.subscribers.remove(&id) {
                let _ = sub.inbound.try_send(Inbound {
                    epoch: sub.epoch,
                    event: InboundEvent::ConnectionLost {
                        reason: reason.clone(),
                    },
                });
            }
        }
    }

    pub fn restore_node(&self, index: usize) {
        self.state.lock().unwrap().nodes[index].up = true;
    }

    pub fn connect_attempts(&self) -> usize {
        self.state.lock().unwrap().connect_attempts
    }

    pub fn connects(&self) -> usize {
        self.state.lock().unwrap().connects
    }

    pub fn disconnects(&self) -> usize {
        self.state.lock().unwrap().disconnects
    }

    /// Number of live subscriptions on `topic`
    pub fn subscriber_count(&self, topic: &str) -> usize {
        self.state
            .lock()
            .unwrap()
            .subscribers
            .values()
            .filter(|sub| sub.topic == topic)
            .count()
    }
}

#[async_trait]
impl Broker for MemoryCluster {
    type Connection = MemoryConnection;

    async fn connect(
        &self,
        subscription: &str,
        epoch: u64,
        inbound: mpsc::Sender<Inbound>,
    ) -> Result<MemoryConnection, TransportError> {
        let mut state = self.state.lock().unwrap();
        state.connect_attempts += 1;

        let count = state.nodes.len();
        let chosen = (0..count)
            .map(|offset| (state.next_node + offset) % count)
            .find(|&i| state.nodes[i].up)
            .ok_or_else(|| TransportError::Unreachable {
                attempted: count,
                last: "all nodes down".to_string(),
            })?;

        state.next_node = (chosen + 1) % count;
        state.connects += 1;
        let conn_id = state.next_conn_id;
        state.next_conn_id += 1;
        state.subscribers.insert(
            conn_id,
            Subscriber {
                node: chosen,
                topic: subscription.to_string(),
                epoch,
                inbound,
            },
        );

        Ok(MemoryConnection {
            cluster: self.clone(),
            conn_id,
            node: chosen,
            node_name: state.nodes[chosen].name.clone(),
        })
    }
}

#[derive(Debug)]
pub struct MemoryConnection {
    cluster: MemoryCluster,
    conn_id: u64,
    node: usize,
    node_name: String,
}

#[async_trait]
impl Connection for MemoryConnection {
    fn node(&self) -> &str {
        &self.node_name
    }

    async fn send(&self, envelope: &Envelope) -> Result<(), TransportError> {
        let targets: Vec<(u64, mpsc::Sender<Inbound>)> = {
            let mut state = self.cluster.state.lock().unwrap();
            if !state.nodes[self.node].up || !state.subscribers.contains_key(&self.conn_id) {
                return Err(TransportError::ConnectionLost(format!(
                    "{} unavailable",
                    self.node_name
                )));
            }
            if let Some(tap) = &state.tap {
                let _ = tap.send(envelope.clone());
            }
            let topic = envelope.topic();
            state
                .subscribers
                .values()
                .filter(|sub| sub.topic == topic && state.nodes[sub.node].up)
                .map(|sub| (sub.epoch, sub.inbound.clone()))
                .collect()
        };

        for (epoch, inbound) in targets {
            let _ = inbound
                .send(Inbound {
                    epoch,
                    event: InboundEvent::Message(envelope.clone()),
                })
                .await;
        }
        Ok(())
    }

    async fn disconnect(self) -> Result<(), TransportError> {
        let mut state = self.cluster.state.lock().unwrap();
        state.disconnects += 1;
        state.subscribers.remove(&self.conn_id);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::EnvelopeKind;
    use serde_json::Value;

    fn request_to(dest: &str) -> Envelope {
        Envelope::request("o.f.s.-.client", dest, "X.op", Value::Null)
    }

    #[tokio::test]
    async fn test_routes_by_topic_across_nodes() {
        let cluster = MemoryCluster::new(2);
        let (tx_a, _rx_a) = mpsc::channel(8);
        let (tx_b, mut rx_b) = mpsc::channel(8);
        let svc_topic = crate::transport::topic("o.f.s.-.svc", EnvelopeKind::Request);

        let a = cluster.connect("o/f/s/-/client/response", 1, tx_a).await.unwrap();
        let b = cluster.connect(&svc_topic, 7, tx_b).await.unwrap();
        assert_ne!(a.node(), b.node());

        a.send(&request_to("o.f.s.-.svc")).await.unwrap();
        let inbound = rx_b.recv().await.unwrap();
        assert_eq!(inbound.epoch, 7);
        assert!(matches!(inbound.event, InboundEvent::Message(ref e) if e.operation == "X.op"));
    }

    #[tokio::test]
    async fn test_connect_skips_down_nodes_and_fails_when_all_down() {
        let cluster = MemoryCluster::new(2);
        cluster.partition_node(0);
        let (tx, _rx) = mpsc::channel(8);
        let conn = cluster.connect("t", 1, tx.clone()).await.unwrap();
        assert_eq!(conn.node(), "node2");

        cluster.partition_node(1);
        assert!(matches!(
            cluster.connect("t", 2, tx).await,
            Err(TransportError::Unreachable { attempted: 2, .. })
        ));
        assert!(conn.send(&request_to("x")).await.is_err());
        assert_eq!(cluster.connect_attempts(), 2);
        assert_eq!(cluster.connects(), 1);
    }

    #[tokio::test]
    async fn test_crash_notifies_attached_connections() {
        let cluster = MemoryCluster::new(1);
        let (tx, mut rx) = mpsc::channel(8);
        let _conn = cluster.connect("t", 3, tx).await.unwrap();
        cluster.crash_node(0);

        let inbound = rx.recv().await.unwrap();
        assert_eq!(inbound.epoch, 3);
        assert!(matches!(inbound.event, InboundEvent::ConnectionLost { .. }));
        assert_eq!(cluster.subscriber_count("t"), 0);
    }
}
