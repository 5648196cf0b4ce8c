// SPDX-License-Identifier: BSL-1.1 OR Apache-2.0
//! Per-key replica sets with a single primary.
//!
//! Writes are pushed to every active replica except the writer through a
//! [`ReplicationSink`], or through the sink registered for that key with
//! [`ReplicationManager::register_replication_callback`]. A write counts as replicated once any replica has
//! acknowledged it; [`ReplicationReport::quorum_met`] tells callers that need
//! more whether a majority of the set now holds the value.
//!
//! The manager is a [`FailoverListener`]: when the failure detector reports a
//! node down, every key whose primary lived there gets a new primary. The
//! health loop does the same for primaries whose replica heartbeats stop.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tokio::time::Instant;

use crate::causal_store::ReplicationUpdate;
use crate::config::ReplicationConfig;
use crate::error::{CoreError, ProtocolError, Result};
use crate::failure_detector::FailoverListener;
use crate::network::{Message, Payload, Transport};
use crate::vector_clock::VectorClock;
use crate::{now_epoch_micros, NodeId};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ReplicationStrategy {
    /// Only the primary accepts writes.
    #[default]
    ActivePassive,
    /// Any replica accepts writes.
    ActiveActive,
    /// Any replica accepts writes; callers check `quorum_met`.
    Quorum,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Replica {
    pub replica_id: String,
    pub node_id: NodeId,
    pub is_primary: bool,
    pub is_active: bool,
    pub last_heartbeat: Instant,
    /// Last value this replica acknowledged for the key.
    pub snapshot: Option<Vec<u8>>,
}

/// Delivers an update to one replica. `Ok` is the replica's acknowledgement.
#[async_trait]
pub trait ReplicationSink: Send + Sync {
    async fn push(&self, replica: &Replica, update: &ReplicationUpdate) -> Result<()>;
}

/// Sink that ships updates as [`Payload::ReplicationUpdate`] messages.
pub struct TransportSink {
    transport: Arc<dyn Transport>,
}

impl TransportSink {
    pub fn new(transport: Arc<dyn Transport>) -> Self {
        Self { transport }
    }
}

#[async_trait]
impl ReplicationSink for TransportSink {
    async fn push(&self, replica: &Replica, update: &ReplicationUpdate) -> Result<()> {
        let msg = Message::request(
            self.transport.local_id().clone(),
            replica.node_id.clone(),
            Payload::ReplicationUpdate(update.clone()),
        );
        self.transport.send(&replica.node_id, msg).await
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReplicationReport {
    pub attempted: usize,
    pub acked: usize,
    /// A majority of the replica set, writer included, holds the value.
    pub quorum_met: bool,
}

#[derive(Debug, Default)]
pub struct ReplicationStats {
    pub pushed: AtomicU64,
    pub push_failures: AtomicU64,
    pub promotions: AtomicU64,
}

impl ReplicationStats {
    pub fn snapshot(&self) -> ReplicationStatsSnapshot {
        ReplicationStatsSnapshot {
            pushed: self.pushed.load(Ordering::Relaxed),
            push_failures: self.push_failures.load(Ordering::Relaxed),
            promotions: self.promotions.load(Ordering::Relaxed),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReplicationStatsSnapshot {
    pub pushed: u64,
    pub push_failures: u64,
    pub promotions: u64,
}

pub struct ReplicationManager {
    config: ReplicationConfig,
    sink: Arc<dyn ReplicationSink>,
    /// Per-key sinks used instead of `sink`.
    callbacks: RwLock<HashMap<String, Arc<dyn ReplicationSink>>>,
    /// Replicas hosted here never go stale.
    local_node: Option<NodeId>,
    sets: RwLock<HashMap<String, Vec<Replica>>>,
    shutdown_tx: broadcast::Sender<()>,
    stopped: AtomicBool,
    running: AtomicBool,
    stats: ReplicationStats,
}

impl ReplicationManager {
    pub fn new(config: ReplicationConfig, sink: Arc<dyn ReplicationSink>) -> Self {
        let (shutdown_tx, _) = broadcast::channel(1);
        Self {
            config,
            sink,
            callbacks: RwLock::new(HashMap::new()),
            local_node: None,
            sets: RwLock::new(HashMap::new()),
            shutdown_tx,
            stopped: AtomicBool::new(false),
            running: AtomicBool::new(false),
            stats: ReplicationStats::default(),
        }
    }

    #[must_use]
    pub fn with_local_node(mut self, node_id: impl Into<NodeId>) -> Self {
        self.local_node = Some(node_id.into());
        self
    }

    pub fn strategy(&self) -> ReplicationStrategy {
        self.config.strategy
    }

    pub fn stats(&self) -> &ReplicationStats {
        &self.stats
    }

    /// Add a replica of `key` on `node_id`. The first replica of a key
    /// becomes its primary.
    pub fn add_replica(
        &self,
        key: impl Into<String>,
        replica_id: impl Into<String>,
        node_id: impl Into<NodeId>,
    ) -> Result<()> {
        let key = key.into();
        let replica_id = replica_id.into();
        let mut sets = self.sets.write();
        let set = sets.entry(key.clone()).or_default();
        if set.iter().any(|r| r.replica_id == replica_id) {
            return Err(CoreError::InvalidOperation(format!(
                "replica {replica_id} already registered for {key}"
            )));
        }
        let is_primary = set.is_empty();
        set.push(Replica {
            replica_id,
            node_id: node_id.into(),
            is_primary,
            is_active: true,
            last_heartbeat: Instant::now(),
            snapshot: None,
        });
        Ok(())
    }

    /// Remove a replica. If it was the primary, the first active remaining
    /// replica takes over.
    pub fn remove_replica(&self, key: &str, replica_id: &str) -> Result<Replica> {
        let mut sets = self.sets.write();
        let set = sets.get_mut(key).ok_or_else(|| unknown_replica(key, replica_id))?;
        let pos = set
            .iter()
            .position(|r| r.replica_id == replica_id)
            .ok_or_else(|| unknown_replica(key, replica_id))?;
        let removed = set.remove(pos);

        if removed.is_primary {
            if let Some(next) = set.iter_mut().find(|r| r.is_active) {
                next.is_primary = true;
                tracing::info!(key = %key, primary = %next.node_id, "Primary reassigned after removal");
            }
        }
        if set.is_empty() {
            sets.remove(key);
        }
        Ok(removed)
    }

    /// Deliver updates of `key` through `sink` instead of the default one.
    /// Returns the sink it replaces.
    pub fn register_replication_callback(
        &self,
        key: impl Into<String>,
        sink: Arc<dyn ReplicationSink>,
    ) -> Option<Arc<dyn ReplicationSink>> {
        self.callbacks.write().insert(key.into(), sink)
    }

    pub fn unregister_replication_callback(&self, key: &str) -> bool {
        self.callbacks.write().remove(key).is_some()
    }

    pub fn replicas(&self, key: &str) -> Vec<Replica> {
        self.sets.read().get(key).cloned().unwrap_or_default()
    }

    pub fn keys(&self) -> Vec<String> {
        let mut keys: Vec<String> = self.sets.read().keys().cloned().collect();
        keys.sort();
        keys
    }

    pub fn get_primary(&self, key: &str) -> Option<NodeId> {
        self.sets
            .read()
            .get(key)?
            .iter()
            .find(|r| r.is_primary)
            .map(|r| r.node_id.clone())
    }

    /// Push `value` for `key`, written at `origin`, with no causal history.
    pub async fn replicate(&self, key: &str, value: Vec<u8>, origin: &NodeId) -> Result<bool> {
        let update = ReplicationUpdate {
            key: key.to_string(),
            value: Some(value),
            origin: origin.clone(),
            timestamp: now_epoch_micros(),
            vector_clock: VectorClock::new(),
        };
        self.replicate_update(&update).await
    }

    /// Push a store-produced update. `true` if any replica acknowledged.
    pub async fn replicate_update(&self, update: &ReplicationUpdate) -> Result<bool> {
        Ok(self.replicate_with_report(update).await?.acked > 0)
    }

    pub async fn replicate_with_report(&self, update: &ReplicationUpdate) -> Result<ReplicationReport> {
        let (targets, set_size, origin_holds) = {
            let sets = self.sets.read();
            let Some(set) = sets.get(&update.key) else {
                return Ok(ReplicationReport::default());
            };
            if self.config.strategy == ReplicationStrategy::ActivePassive {
                if let Some(primary) = set.iter().find(|r| r.is_primary) {
                    if primary.node_id != update.origin {
                        return Err(ProtocolError::NotPrimary {
                            key: update.key.clone(),
                            origin: update.origin.clone(),
                        }
                        .into());
                    }
                }
            }
            let targets: Vec<Replica> = set
                .iter()
                .filter(|r| r.is_active && r.node_id != update.origin)
                .cloned()
                .collect();
            let origin_holds = set.iter().any(|r| r.node_id == update.origin);
            (targets, set.len(), origin_holds)
        };

        let sink = self
            .callbacks
            .read()
            .get(&update.key)
            .cloned()
            .unwrap_or_else(|| Arc::clone(&self.sink));

        let mut acked = Vec::with_capacity(targets.len());
        for replica in &targets {
            match sink.push(replica, update).await {
                Ok(()) => {
                    self.stats.pushed.fetch_add(1, Ordering::Relaxed);
                    acked.push(replica.replica_id.clone());
                },
                Err(e) => {
                    self.stats.push_failures.fetch_add(1, Ordering::Relaxed);
                    tracing::warn!(
                        key = %update.key,
                        replica = %replica.replica_id,
                        peer = %replica.node_id,
                        error = %e,
                        "Replication push failed"
                    );
                },
            }
        }

        if !acked.is_empty() {
            let mut sets = self.sets.write();
            if let Some(set) = sets.get_mut(&update.key) {
                for replica in set.iter_mut().filter(|r| acked.contains(&r.replica_id)) {
                    replica.snapshot = update.value.clone();
                }
            }
        }

        let holders = acked.len() + usize::from(origin_holds);
        let report = ReplicationReport {
            attempted: targets.len(),
            acked: acked.len(),
            quorum_met: holders * 2 > set_size,
        };
        tracing::debug!(
            key = %update.key,
            attempted = report.attempted,
            acked = report.acked,
            quorum_met = report.quorum_met,
            "Update replicated"
        );
        Ok(report)
    }

    /// Make the replica on `node_id` the sole primary of `key`.
    pub fn promote_replica(&self, key: &str, node_id: &str) -> Result<()> {
        let mut sets = self.sets.write();
        let set = sets.get_mut(key).ok_or_else(|| unknown_replica(key, node_id))?;
        let target = set
            .iter()
            .find(|r| r.node_id == node_id)
            .ok_or_else(|| unknown_replica(key, node_id))?;
        if !target.is_active {
            return Err(CoreError::InvalidOperation(format!(
                "cannot promote inactive replica on {node_id} for {key}"
            )));
        }
        for replica in set.iter_mut() {
            replica.is_primary = replica.node_id == node_id;
        }
        self.stats.promotions.fetch_add(1, Ordering::Relaxed);
        tracing::info!(key = %key, primary = %node_id, "Replica promoted");
        Ok(())
    }

    /// Returns whether any replica had that id.
    pub fn record_heartbeat(&self, replica_id: &str) -> bool {
        let now = Instant::now();
        let mut found = false;
        for replica in self
            .sets
            .write()
            .values_mut()
            .flatten()
            .filter(|r| r.replica_id == replica_id)
        {
            replica.last_heartbeat = now;
            found = true;
        }
        found
    }

    /// Heartbeat for every replica hosted on `node_id`. Returns how many.
    pub fn record_node_heartbeat(&self, node_id: &str) -> usize {
        let now = Instant::now();
        let mut count = 0;
        for replica in self
            .sets
            .write()
            .values_mut()
            .flatten()
            .filter(|r| r.node_id == node_id)
        {
            replica.last_heartbeat = now;
            count += 1;
        }
        count
    }

    /// Mark replicas silent for longer than `timeout` inactive and
    /// reactivate fresh ones. Returns key to newly failed nodes.
    pub fn check_health(&self, timeout: Duration) -> HashMap<String, Vec<NodeId>> {
        let now = Instant::now();
        let mut failed: HashMap<String, Vec<NodeId>> = HashMap::new();
        let mut sets = self.sets.write();
        for (key, set) in sets.iter_mut() {
            for replica in set.iter_mut() {
                if self.local_node.as_ref() == Some(&replica.node_id) {
                    continue;
                }
                let stale = now.saturating_duration_since(replica.last_heartbeat) > timeout;
                if stale && replica.is_active {
                    replica.is_active = false;
                    tracing::warn!(key = %key, peer = %replica.node_id, "Replica went stale");
                    failed.entry(key.clone()).or_default().push(replica.node_id.clone());
                } else if !stale && !replica.is_active {
                    replica.is_active = true;
                    tracing::info!(key = %key, peer = %replica.node_id, "Replica reactivated");
                }
            }
        }
        failed
    }

    /// Deactivate every replica on `failed` and give each key it was primary
    /// for a new primary: `replacement` if it holds an active replica of the
    /// key, otherwise the first active replica. Returns the keys that moved.
    pub fn handle_node_failure(&self, failed: &str, replacement: Option<&str>) -> Vec<String> {
        let mut moved = Vec::new();
        let mut sets = self.sets.write();
        for (key, set) in sets.iter_mut() {
            let mut was_primary = false;
            for replica in set.iter_mut().filter(|r| r.node_id == failed) {
                replica.is_active = false;
                was_primary |= replica.is_primary;
            }
            if !was_primary {
                continue;
            }

            let Some(next) = reassign_primary(set, replacement) else {
                tracing::warn!(key = %key, failed = %failed, "No active replica to promote");
                continue;
            };
            self.stats.promotions.fetch_add(1, Ordering::Relaxed);
            tracing::warn!(
                key = %key,
                failed = %failed,
                primary = %set[next].node_id,
                "Primary failed over"
            );
            moved.push(key.clone());
        }
        moved.sort();
        moved
    }

    /// [`Self::check_health`], then move the primary of every key whose
    /// primary replica just went stale to the first active replica. Returns
    /// the keys that moved.
    pub fn fail_over_stale(&self, timeout: Duration) -> Vec<String> {
        let failed = self.check_health(timeout);
        if failed.is_empty() {
            return Vec::new();
        }

        let mut moved = Vec::new();
        let mut sets = self.sets.write();
        for (key, nodes) in failed {
            let Some(set) = sets.get_mut(&key) else {
                continue;
            };
            let primary_lost = set
                .iter()
                .any(|r| r.is_primary && !r.is_active && nodes.contains(&r.node_id));
            if !primary_lost {
                continue;
            }
            let Some(next) = reassign_primary(set, None) else {
                tracing::warn!(key = %key, "Stale primary has no active replica to promote");
                continue;
            };
            self.stats.promotions.fetch_add(1, Ordering::Relaxed);
            tracing::warn!(key = %key, primary = %set[next].node_id, "Stale primary replaced");
            moved.push(key);
        }
        moved.sort();
        moved
    }

    /// Periodic [`Self::fail_over_stale`] until [`Self::shutdown`].
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
        let interval = self.config.health_check_interval();
        let timeout = self.config.replica_timeout();

        loop {
            tokio::select! {
                _ = shutdown_rx.recv() => {
                    break;
                }
                _ = tokio::time::sleep(interval) => {
                    self.fail_over_stale(timeout);
                }
            }
        }
        self.running.store(false, Ordering::SeqCst);
    }

    pub fn shutdown(&self) {
        self.stopped.store(true, Ordering::SeqCst);
        let _ = self.shutdown_tx.send(());
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }
}

impl FailoverListener for ReplicationManager {
    fn on_failover(&self, failed: &NodeId, replacement: Option<&NodeId>) {
        self.handle_node_failure(failed, replacement.map(String::as_str));
    }

    fn on_recovery(&self, node: &NodeId) {
        self.record_node_heartbeat(node);
    }
}

/// Make `preferred` (if it holds an active replica) or else the first active
/// replica the sole primary. Returns its index.
fn reassign_primary(set: &mut [Replica], preferred: Option<&str>) -> Option<usize> {
    let preferred =
        preferred.and_then(|node| set.iter().position(|r| r.node_id == node && r.is_active));
    let next = preferred.or_else(|| set.iter().position(|r| r.is_active))?;
    for (i, replica) in set.iter_mut().enumerate() {
        replica.is_primary = i == next;
    }
    Some(next)
}

fn unknown_replica(key: &str, replica: &str) -> CoreError {
    ProtocolError::UnknownReplica {
        key: key.to_string(),
        replica: replica.to_string(),
    }
    .into()
}
