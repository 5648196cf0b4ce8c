// SPDX-License-Identifier: BSL-1.1 OR Apache-2.0
//! Message envelope and transport abstraction.
//!
//! Provides:
//! - `Message` / `Payload` exchanged between nodes
//! - `Transport` trait for outbound sends
//! - `MessageHandler` trait for inbound delivery
//! - `MemoryNetwork` for tests, with drop, duplicate and partition injection
//!
//! Delivery is at-most-once per send, unordered and lossy. Nothing above
//! this layer may assume a message arrived without an explicit reply.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::RwLock;
use rand::Rng;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::causal_store::ReplicationUpdate;
use crate::error::{CoreError, Result};
use crate::transaction::{Operation, TxOutcome, Vote};
use crate::tx_id::TxId;
use crate::{now_epoch_millis, EpochMillis, NodeId};

/// Envelope class.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MessageKind {
    Request,
    Response,
    Heartbeat,
}

/// Protocol content of a message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Payload {
    /// Phase 1 request.
    Prepare {
        tx_id: TxId,
        operations: Vec<Operation>,
    },
    /// Participant's answer to `Prepare`.
    Vote { tx_id: TxId, vote: Vote },
    Commit { tx_id: TxId },
    Abort { tx_id: TxId },
    /// Participant applied (or discarded) the decision.
    Ack { tx_id: TxId, outcome: TxOutcome },
    /// In-doubt participant asking the coordinator for the decision.
    DecisionQuery { tx_id: TxId },
    /// `None` while the coordinator is still deciding.
    DecisionReply {
        tx_id: TxId,
        outcome: Option<TxOutcome>,
    },
    Heartbeat { sender: NodeId, status: String },
    ReplicationUpdate(ReplicationUpdate),
}

impl Payload {
    pub fn tx_id(&self) -> Option<&TxId> {
        match self {
            Payload::Prepare { tx_id, .. }
            | Payload::Vote { tx_id, .. }
            | Payload::Commit { tx_id }
            | Payload::Abort { tx_id }
            | Payload::Ack { tx_id, .. }
            | Payload::DecisionQuery { tx_id }
            | Payload::DecisionReply { tx_id, .. } => Some(tx_id),
            Payload::Heartbeat { .. } | Payload::ReplicationUpdate(_) => None,
        }
    }

    /// Short label for logs.
    pub fn name(&self) -> &'static str {
        match self {
            Payload::Prepare { .. } => "prepare",
            Payload::Vote { .. } => "vote",
            Payload::Commit { .. } => "commit",
            Payload::Abort { .. } => "abort",
            Payload::Ack { .. } => "ack",
            Payload::DecisionQuery { .. } => "decision_query",
            Payload::DecisionReply { .. } => "decision_reply",
            Payload::Heartbeat { .. } => "heartbeat",
            Payload::ReplicationUpdate(_) => "replication_update",
        }
    }
}

/// A message as it travels between nodes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    pub id: Uuid,
    pub kind: MessageKind,
    pub sender: NodeId,
    /// `None` for broadcasts.
    pub receiver: Option<NodeId>,
    pub timestamp: EpochMillis,
    pub payload: Payload,
    /// Id of the request this answers.
    pub correlation_id: Option<Uuid>,
}

impl Message {
    pub fn request(sender: impl Into<NodeId>, receiver: impl Into<NodeId>, payload: Payload) -> Self {
        Self {
            id: Uuid::new_v4(),
            kind: MessageKind::Request,
            sender: sender.into(),
            receiver: Some(receiver.into()),
            timestamp: now_epoch_millis(),
            payload,
            correlation_id: None,
        }
    }

    /// Reply to `request`, addressed to its sender.
    pub fn response(request: &Message, sender: impl Into<NodeId>, payload: Payload) -> Self {
        Self {
            id: Uuid::new_v4(),
            kind: MessageKind::Response,
            sender: sender.into(),
            receiver: Some(request.sender.clone()),
            timestamp: now_epoch_millis(),
            payload,
            correlation_id: Some(request.id),
        }
    }

    pub fn heartbeat(sender: impl Into<NodeId>) -> Self {
        let sender = sender.into();
        Self {
            id: Uuid::new_v4(),
            kind: MessageKind::Heartbeat,
            sender: sender.clone(),
            receiver: None,
            timestamp: now_epoch_millis(),
            payload: Payload::Heartbeat {
                sender,
                status: "alive".to_string(),
            },
            correlation_id: None,
        }
    }

    /// Same message readdressed to `receiver`.
    #[must_use]
    pub fn addressed_to(mut self, receiver: impl Into<NodeId>) -> Self {
        self.receiver = Some(receiver.into());
        self
    }
}

/// Outbound half of the network.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Hand `msg` to the network for `to`. `Ok` means accepted, not delivered.
    async fn send(&self, to: &NodeId, msg: Message) -> Result<()>;

    fn local_id(&self) -> &NodeId;
}

/// Inbound half: receives every message addressed to this node.
#[async_trait]
pub trait MessageHandler: Send + Sync {
    async fn handle_message(&self, msg: Message);
}

/// Fault injection for one directed link.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct LinkFaults {
    pub drop_probability: f64,
    pub duplicate_probability: f64,
    /// Restrict the faults to payloads with this [`Payload::name`].
    pub payload: Option<&'static str>,
}

impl LinkFaults {
    pub fn dropping(probability: f64) -> Self {
        Self {
            drop_probability: probability,
            ..Self::default()
        }
    }

    pub fn duplicating(probability: f64) -> Self {
        Self {
            duplicate_probability: probability,
            ..Self::default()
        }
    }

    #[must_use]
    pub fn only(mut self, payload: &'static str) -> Self {
        self.payload = Some(payload);
        self
    }

    fn applies_to(&self, payload: &Payload) -> bool {
        self.payload.map_or(true, |name| name == payload.name())
    }
}

/// In-process network connecting [`MemoryTransport`]s.
///
/// Each delivery runs the receiver's handler on its own task.
#[derive(Default)]
pub struct MemoryNetwork {
    handlers: RwLock<HashMap<NodeId, Arc<dyn MessageHandler>>>,
    isolated: RwLock<HashSet<NodeId>>,
    faults: RwLock<HashMap<(NodeId, NodeId), LinkFaults>>,
    delivered: AtomicU64,
    dropped: AtomicU64,
}

impl MemoryNetwork {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn transport(self: &Arc<Self>, node_id: impl Into<NodeId>) -> Arc<MemoryTransport> {
        Arc::new(MemoryTransport {
            local_id: node_id.into(),
            network: Arc::clone(self),
        })
    }

    pub fn attach(&self, node_id: impl Into<NodeId>, handler: Arc<dyn MessageHandler>) {
        let node_id = node_id.into();
        tracing::debug!(node_id = %node_id, "Node attached to memory network");
        self.handlers.write().insert(node_id, handler);
    }

    /// Simulate a crash: sends to the node fail until it is attached again.
    pub fn detach(&self, node_id: &str) {
        self.handlers.write().remove(node_id);
    }

    /// Silently drop every message to or from the node.
    pub fn isolate(&self, node_id: impl Into<NodeId>) {
        let node_id = node_id.into();
        tracing::info!(node_id = %node_id, "Network partition simulated");
        self.isolated.write().insert(node_id);
    }

    pub fn heal(&self, node_id: &str) {
        tracing::info!(node_id = %node_id, "Network partition healed");
        self.isolated.write().remove(node_id);
    }

    pub fn set_link_faults(&self, from: &str, to: &str, faults: LinkFaults) {
        self.faults
            .write()
            .insert((from.to_string(), to.to_string()), faults);
    }

    pub fn delivered_count(&self) -> u64 {
        self.delivered.load(Ordering::Relaxed)
    }

    pub fn dropped_count(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    fn route(&self, from: &NodeId, to: &NodeId, msg: Message) -> Result<()> {
        let handler = self
            .handlers
            .read()
            .get(to)
            .cloned()
            .ok_or_else(|| CoreError::Transport(format!("{to} is unreachable")))?;

        {
            let isolated = self.isolated.read();
            if isolated.contains(from) || isolated.contains(to) {
                self.dropped.fetch_add(1, Ordering::Relaxed);
                return Ok(());
            }
        }

        let faults = self
            .faults
            .read()
            .get(&(from.clone(), to.clone()))
            .copied()
            .filter(|f| f.applies_to(&msg.payload))
            .unwrap_or_default();
        let (drop, duplicate) = {
            let mut rng = rand::thread_rng();
            (
                faults.drop_probability > 0.0 && rng.gen_bool(faults.drop_probability.min(1.0)),
                faults.duplicate_probability > 0.0
                    && rng.gen_bool(faults.duplicate_probability.min(1.0)),
            )
        };

        if drop {
            tracing::debug!(from = %from, to = %to, payload = msg.payload.name(), "Message dropped");
            self.dropped.fetch_add(1, Ordering::Relaxed);
            return Ok(());
        }

        let copies = if duplicate { 2 } else { 1 };
        for _ in 0..copies {
            let handler = Arc::clone(&handler);
            let msg = msg.clone();
            self.delivered.fetch_add(1, Ordering::Relaxed);
            tokio::spawn(async move { handler.handle_message(msg).await });
        }
        Ok(())
    }
}

/// A node's handle onto a [`MemoryNetwork`].
pub struct MemoryTransport {
    local_id: NodeId,
    network: Arc<MemoryNetwork>,
}

impl MemoryTransport {
    pub fn network(&self) -> &Arc<MemoryNetwork> {
        &self.network
    }
}

#[async_trait]
impl Transport for MemoryTransport {
    async fn send(&self, to: &NodeId, msg: Message) -> Result<()> {
        self.network.route(&self.local_id, to, msg)
    }

    fn local_id(&self) -> &NodeId {
        &self.local_id
    }
}

/// Send with bounded retry. Gives up with `DeliveryFailed` once every
/// attempt has been refused by the transport.
pub(crate) async fn send_with_retry(
    transport: &dyn Transport,
    to: &NodeId,
    msg: Message,
    attempts: u32,
    backoff: impl Fn(u32) -> std::time::Duration,
) -> Result<()> {
    let attempts = attempts.max(1);
    for attempt in 1..=attempts {
        match transport.send(to, msg.clone()).await {
            Ok(()) => return Ok(()),
            Err(e) => {
                tracing::debug!(
                    peer = %to,
                    attempt = attempt,
                    payload = msg.payload.name(),
                    error = %e,
                    "Send failed"
                );
                if attempt < attempts {
                    tokio::time::sleep(backoff(attempt)).await;
                }
            },
        }
    }
    Err(CoreError::DeliveryFailed {
        node: to.clone(),
        attempts,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tokio::sync::mpsc;

    struct Recorder(mpsc::UnboundedSender<Message>);

    #[async_trait]
    impl MessageHandler for Recorder {
        async fn handle_message(&self, msg: Message) {
            let _ = self.0.send(msg);
        }
    }

    fn recorder(network: &MemoryNetwork, node: &str) -> mpsc::UnboundedReceiver<Message> {
        let (tx, rx) = mpsc::unbounded_channel();
        network.attach(node, Arc::new(Recorder(tx)));
        rx
    }

    fn commit(tx: &str) -> Payload {
        Payload::Commit {
            tx_id: TxId::from(tx),
        }
    }

    #[tokio::test]
    async fn test_send_delivers() {
        let network = MemoryNetwork::new();
        let a = network.transport("a");
        let mut rx = recorder(&network, "b");

        a.send(&"b".to_string(), Message::request("a", "b", commit("t1")))
            .await
            .unwrap();

        let msg = rx.recv().await.unwrap();
        assert_eq!(msg.sender, "a");
        assert_eq!(msg.payload, commit("t1"));
        assert_eq!(network.delivered_count(), 1);
    }

    #[tokio::test]
    async fn test_send_to_detached_node_fails() {
        let network = MemoryNetwork::new();
        let a = network.transport("a");
        let err = a
            .send(&"ghost".to_string(), Message::request("a", "ghost", commit("t1")))
            .await
            .unwrap_err();
        assert!(matches!(err, CoreError::Transport(_)));
    }

    #[tokio::test]
    async fn test_isolated_node_drops_silently() {
        let network = MemoryNetwork::new();
        let a = network.transport("a");
        let mut rx = recorder(&network, "b");
        network.isolate("b");

        a.send(&"b".to_string(), Message::request("a", "b", commit("t1")))
            .await
            .unwrap();
        assert_eq!(network.dropped_count(), 1);
        assert!(rx.try_recv().is_err());

        network.heal("b");
        a.send(&"b".to_string(), Message::request("a", "b", commit("t2")))
            .await
            .unwrap();
        assert_eq!(rx.recv().await.unwrap().payload, commit("t2"));
    }

    #[tokio::test]
    async fn test_duplicate_injection() {
        let network = MemoryNetwork::new();
        let a = network.transport("a");
        let mut rx = recorder(&network, "b");
        network.set_link_faults("a", "b", LinkFaults::duplicating(1.0));

        let msg = Message::request("a", "b", commit("t1"));
        a.send(&"b".to_string(), msg.clone()).await.unwrap();
        assert_eq!(rx.recv().await.unwrap().id, msg.id);
        assert_eq!(rx.recv().await.unwrap().id, msg.id);
    }

    #[tokio::test]
    async fn test_drop_injection_is_directional() {
        let network = MemoryNetwork::new();
        let a = network.transport("a");
        let b = network.transport("b");
        let mut rx_a = recorder(&network, "a");
        let mut rx_b = recorder(&network, "b");
        network.set_link_faults("a", "b", LinkFaults::dropping(1.0));

        a.send(&"b".to_string(), Message::request("a", "b", commit("t1")))
            .await
            .unwrap();
        b.send(&"a".to_string(), Message::request("b", "a", commit("t2")))
            .await
            .unwrap();

        assert_eq!(rx_a.recv().await.unwrap().payload, commit("t2"));
        assert!(rx_b.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_faults_restricted_to_one_payload() {
        let network = MemoryNetwork::new();
        let a = network.transport("a");
        let mut rx = recorder(&network, "b");
        network.set_link_faults("a", "b", LinkFaults::dropping(1.0).only("commit"));

        a.send(&"b".to_string(), Message::request("a", "b", commit("t1")))
            .await
            .unwrap();
        let abort = Payload::Abort {
            tx_id: TxId::from("t2"),
        };
        a.send(&"b".to_string(), Message::request("a", "b", abort.clone()))
            .await
            .unwrap();

        assert_eq!(rx.recv().await.unwrap().payload, abort);
        assert!(rx.try_recv().is_err());
        assert_eq!(network.dropped_count(), 1);
    }

    #[test]
    fn test_response_correlates() {
        let req = Message::request("a", "b", Payload::DecisionQuery { tx_id: TxId::from("t") });
        let resp = Message::response(
            &req,
            "b",
            Payload::DecisionReply {
                tx_id: TxId::from("t"),
                outcome: Some(TxOutcome::Aborted),
            },
        );
        assert_eq!(resp.kind, MessageKind::Response);
        assert_eq!(resp.correlation_id, Some(req.id));
        assert_eq!(resp.receiver.as_deref(), Some("a"));
    }

    #[test]
    fn test_heartbeat_shape() {
        let hb = Message::heartbeat("n1");
        assert_eq!(hb.kind, MessageKind::Heartbeat);
        assert!(hb.receiver.is_none());
        match hb.payload {
            Payload::Heartbeat { sender, status } => {
                assert_eq!(sender, "n1");
                assert_eq!(status, "alive");
            },
            other => panic!("unexpected payload {other:?}"),
        }
    }

    #[test]
    fn test_message_bincode_roundtrip() {
        let msg = Message::request(
            "a",
            "b",
            Payload::Prepare {
                tx_id: TxId::generate(),
                operations: vec![Operation::put("k", b"v".to_vec())],
            },
        );
        let bytes = bincode::serialize(&msg).unwrap();
        let back: Message = bincode::deserialize(&bytes).unwrap();
        assert_eq!(msg, back);
    }

    #[tokio::test(start_paused = true)]
    async fn test_send_with_retry_gives_up() {
        let network = MemoryNetwork::new();
        let a = network.transport("a");
        let err = send_with_retry(
            &*a,
            &"ghost".to_string(),
            Message::request("a", "ghost", commit("t1")),
            3,
            |_| Duration::from_millis(10),
        )
        .await
        .unwrap_err();
        assert!(matches!(err, CoreError::DeliveryFailed { attempts: 3, .. }));
    }
}
