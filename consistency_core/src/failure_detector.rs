// SPDX-License-Identifier: BSL-1.1 OR Apache-2.0
//! Heartbeat failure detection with replacement selection.
//!
//! Every `heartbeat_interval` the detector sends a heartbeat to each
//! registered peer and checks how long each peer has been silent. A peer
//! silent for longer than `failure_timeout` goes inactive once per outage and
//! a replacement is chosen among the active peers: lowest priority first,
//! then lowest node id. [`FailoverListener`]s hear about it after the status
//! lock is released.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::RwLock;
use tokio::sync::broadcast;
use tokio::time::Instant;

use crate::config::FailureDetectorConfig;
use crate::network::{Message, Transport};
use crate::NodeId;

/// What the detector knows about one peer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeStatus {
    pub node_id: NodeId,
    pub active: bool,
    pub last_heartbeat: Instant,
    /// Lower wins when choosing a replacement.
    pub priority: u32,
    /// Times this node was chosen as a replacement.
    pub failover_count: u64,
}

impl NodeStatus {
    fn new(node_id: NodeId, priority: u32, now: Instant) -> Self {
        Self {
            node_id,
            active: true,
            last_heartbeat: now,
            priority,
            failover_count: 0,
        }
    }
}

/// A peer went inactive.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FailoverEvent {
    pub failed: NodeId,
    pub replacement: Option<NodeId>,
}

/// Callback for failure detector transitions.
pub trait FailoverListener: Send + Sync {
    fn on_failover(&self, failed: &NodeId, replacement: Option<&NodeId>);

    fn on_recovery(&self, _node: &NodeId) {}
}

pub struct FailureDetector {
    node_id: NodeId,
    config: FailureDetectorConfig,
    nodes: RwLock<HashMap<NodeId, NodeStatus>>,
    listeners: RwLock<Vec<Arc<dyn FailoverListener>>>,
    transport: Option<Arc<dyn Transport>>,
    shutdown_tx: broadcast::Sender<()>,
    stopped: AtomicBool,
    running: AtomicBool,
    failovers: AtomicU64,
}

impl FailureDetector {
    pub fn new(node_id: impl Into<NodeId>, config: FailureDetectorConfig) -> Self {
        let (shutdown_tx, _) = broadcast::channel(1);
        Self {
            node_id: node_id.into(),
            config,
            nodes: RwLock::new(HashMap::new()),
            listeners: RwLock::new(Vec::new()),
            transport: None,
            shutdown_tx,
            stopped: AtomicBool::new(false),
            running: AtomicBool::new(false),
            failovers: AtomicU64::new(0),
        }
    }

    /// Send heartbeats through `transport` from the background loop.
    #[must_use]
    pub fn with_transport(mut self, transport: Arc<dyn Transport>) -> Self {
        self.transport = Some(transport);
        self
    }

    pub fn node_id(&self) -> &NodeId {
        &self.node_id
    }

    /// Start monitoring `node_id`, treating it as heard from just now.
    pub fn register_node(&self, node_id: impl Into<NodeId>, priority: u32) {
        let node_id = node_id.into();
        let status = NodeStatus::new(node_id.clone(), priority, Instant::now());
        self.nodes.write().insert(node_id, status);
    }

    pub fn unregister_node(&self, node_id: &str) -> bool {
        self.nodes.write().remove(node_id).is_some()
    }

    pub fn subscribe(&self, listener: Arc<dyn FailoverListener>) {
        self.listeners.write().push(listener);
    }

    /// Record a heartbeat. Returns `true` if the node was inactive and is
    /// now active again. Unregistered nodes are ignored.
    pub fn record_heartbeat(&self, node_id: &str) -> bool {
        let recovered = {
            let mut nodes = self.nodes.write();
            let Some(status) = nodes.get_mut(node_id) else {
                tracing::debug!(peer = %node_id, "Heartbeat from unmonitored node");
                return false;
            };
            status.last_heartbeat = Instant::now();
            let recovered = !status.active;
            status.active = true;
            recovered
        };

        if recovered {
            tracing::info!(peer = %node_id, "Node recovered");
            let node_id = node_id.to_string();
            let listeners = self.listeners.read().clone();
            for listener in &listeners {
                listener.on_recovery(&node_id);
            }
        }
        recovered
    }

    pub fn check(&self) -> Vec<FailoverEvent> {
        self.check_at(Instant::now())
    }

    /// Mark peers silent past the timeout as failed and choose replacements.
    pub fn check_at(&self, now: Instant) -> Vec<FailoverEvent> {
        let timeout = self.config.failure_timeout();
        let mut events = Vec::new();
        {
            let mut nodes = self.nodes.write();
            let mut newly_failed: Vec<NodeId> = nodes
                .values()
                .filter(|s| s.active && now.saturating_duration_since(s.last_heartbeat) > timeout)
                .map(|s| s.node_id.clone())
                .collect();
            newly_failed.sort();

            for failed in newly_failed {
                if let Some(status) = nodes.get_mut(&failed) {
                    status.active = false;
                }
                let replacement = pick_replacement(&mut nodes, &failed);
                events.push(FailoverEvent {
                    failed,
                    replacement,
                });
            }
        }

        if events.is_empty() {
            return events;
        }
        self.failovers
            .fetch_add(events.len() as u64, Ordering::Relaxed);

        let listeners = self.listeners.read().clone();
        for event in &events {
            tracing::warn!(
                peer = %event.failed,
                replacement = ?event.replacement,
                "Node failed"
            );
            for listener in &listeners {
                listener.on_failover(&event.failed, event.replacement.as_ref());
            }
        }
        events
    }

    /// Best active node other than `excluding`, counting it as a failover.
    pub fn select_replacement(&self, excluding: &str) -> Option<NodeId> {
        pick_replacement(&mut self.nodes.write(), excluding)
    }

    pub fn is_active(&self, node_id: &str) -> bool {
        self.nodes.read().get(node_id).is_some_and(|s| s.active)
    }

    pub fn status(&self, node_id: &str) -> Option<NodeStatus> {
        self.nodes.read().get(node_id).cloned()
    }

    pub fn active_nodes(&self) -> Vec<NodeId> {
        self.nodes_where(|s| s.active)
    }

    pub fn failed_nodes(&self) -> Vec<NodeId> {
        self.nodes_where(|s| !s.active)
    }

    fn nodes_where(&self, pred: impl Fn(&NodeStatus) -> bool) -> Vec<NodeId> {
        let mut ids: Vec<NodeId> = self
            .nodes
            .read()
            .values()
            .filter(|s| pred(s))
            .map(|s| s.node_id.clone())
            .collect();
        ids.sort();
        ids
    }

    /// Total failover events since start.
    pub fn failover_total(&self) -> u64 {
        self.failovers.load(Ordering::Relaxed)
    }

    async fn send_heartbeats(&self) {
        let Some(transport) = &self.transport else {
            return;
        };
        let peers: Vec<NodeId> = self.nodes.read().keys().cloned().collect();
        for peer in peers {
            let msg = Message::heartbeat(self.node_id.clone()).addressed_to(peer.clone());
            if let Err(e) = transport.send(&peer, msg).await {
                tracing::debug!(peer = %peer, error = %e, "Heartbeat not sent");
            }
        }
    }

    /// Heartbeat and check loop. Returns after [`Self::shutdown`].
    pub async fn run(&self) {
        if self.running.swap(true, Ordering::SeqCst) {
            return;
        }
        let mut shutdown_rx = self.shutdown_tx.subscribe();
        // A shutdown sent before the subscription above is only visible here.
        if self.stopped.load(Ordering::SeqCst) {
            self.running.store(false, Ordering::SeqCst);
            return;
        }
        let interval = self.config.heartbeat_interval();
        tracing::info!(node_id = %self.node_id, "Failure detector started");

        loop {
            tokio::select! {
                _ = shutdown_rx.recv() => {
                    break;
                }
                _ = tokio::time::sleep(interval) => {
                    self.send_heartbeats().await;
                    self.check();
                }
            }
        }
        self.running.store(false, Ordering::SeqCst);
    }

    pub fn shutdown(&self) {
        tracing::info!(node_id = %self.node_id, "Failure detector shutting down");
        self.stopped.store(true, Ordering::SeqCst);
        let _ = self.shutdown_tx.send(());
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }
}

fn pick_replacement(nodes: &mut HashMap<NodeId, NodeStatus>, excluding: &str) -> Option<NodeId> {
    let chosen = nodes
        .values_mut()
        .filter(|s| s.active && s.node_id != excluding)
        .min_by(|a, b| (a.priority, &a.node_id).cmp(&(b.priority, &b.node_id)))?;
    chosen.failover_count += 1;
    Some(chosen.node_id.clone())
}
