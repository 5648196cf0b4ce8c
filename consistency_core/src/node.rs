// SPDX-License-Identifier: BSL-1.1 OR Apache-2.0
//! One process worth of components, wired together.
//!
//! A [`Node`] owns the store, both halves of two-phase commit, the registry,
//! the failure detector and the replication manager. It is the
//! [`MessageHandler`] for its transport address and routes each payload to
//! the component that owns it:
//!
//! | Payload | Component |
//! |---------|-----------|
//! | `Vote`, `Ack`, `DecisionQuery` | coordinator |
//! | `Prepare`, `Commit`, `Abort`, `DecisionReply` | participant |
//! | `Heartbeat` | failure detector, replication |
//! | `ReplicationUpdate` | store |
//!
//! After [`Node::start`] a maintenance loop runs [`Node::maintain`] every
//! `maintenance_interval`: parked decisions are resent, transactions left
//! prepared past the prepare timeout query their coordinator, and idle
//! transactions expire.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;

use crate::causal_store::{ApplyOutcome, CausalEventStore, ReplicationUpdate};
use crate::config::NodeConfig;
use crate::coordinator::{CoordinatorStatsSnapshot, RecoveryStats, TransactionCoordinator};
use crate::error::{CoreError, ProtocolError, Result};
use crate::failure_detector::FailureDetector;
use crate::network::{Message, MessageHandler, Payload, Transport};
use crate::participant::{StoreResources, TxParticipant};
use crate::recovery_log::RecoveryLog;
use crate::registry::{RegistryStatsSnapshot, TransactionRegistry};
use crate::replication::{
    ReplicationManager, ReplicationReport, ReplicationStatsSnapshot, ReplicationStrategy,
    TransportSink,
};
use crate::transaction::Operation;
use crate::tx_id::TxId;
use crate::NodeId;

/// What [`Node::start`] recovered.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StartupReport {
    pub coordinator: RecoveryStats,
    /// Prepared here before the restart.
    pub in_doubt: Vec<TxId>,
    /// In-doubt transactions no coordinator could settle.
    pub unresolved: Vec<TxId>,
}

/// What one [`Node::maintain`] round did.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MaintenanceReport {
    /// Decisions still parked after the resend.
    pub parked: usize,
    /// Stalled prepared transactions settled by a decision query.
    pub resolved: Vec<TxId>,
    /// Idle transactions aborted.
    pub expired: Vec<TxId>,
}

/// Point-in-time copy of every component's counters.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct NodeMetricsSnapshot {
    pub coordinator: CoordinatorStatsSnapshot,
    pub registry: RegistryStatsSnapshot,
    pub replication: ReplicationStatsSnapshot,
    pub failovers: u64,
    pub participant_applied: u64,
}

pub struct Node {
    config: NodeConfig,
    transport: Arc<dyn Transport>,
    store: Arc<CausalEventStore>,
    coordinator: Arc<TransactionCoordinator>,
    participant: Arc<TxParticipant>,
    registry: TransactionRegistry,
    detector: Arc<FailureDetector>,
    replication: Arc<ReplicationManager>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    maintenance_tx: broadcast::Sender<()>,
    stopped: AtomicBool,
}

impl Node {
    /// Build a node. The coordinator and participant roles keep separate
    /// recovery logs.
    pub fn new(
        config: NodeConfig,
        transport: Arc<dyn Transport>,
        coordinator_log: Arc<RecoveryLog>,
        participant_log: Arc<RecoveryLog>,
    ) -> Result<Arc<Self>> {
        config.validate()?;
        if transport.local_id() != &config.node_id {
            return Err(CoreError::Config(format!(
                "transport address {} does not match node_id {}",
                transport.local_id(),
                config.node_id
            )));
        }

        let store = Arc::new(CausalEventStore::new(
            config.node_id.clone(),
            config.store.consistency_level,
        ));
        let coordinator = Arc::new(TransactionCoordinator::new(
            config.transaction.clone(),
            Arc::clone(&transport),
            coordinator_log,
        ));
        let participant = Arc::new(TxParticipant::new(
            Arc::new(StoreResources::new(Arc::clone(&store))),
            participant_log,
            Arc::clone(&transport),
        ));
        let registry =
            TransactionRegistry::new(Arc::clone(&coordinator), config.transaction.history_capacity);

        let detector = FailureDetector::new(config.node_id.clone(), config.failure.clone())
            .with_transport(Arc::clone(&transport));
        for peer in &config.peers {
            detector.register_node(peer.node_id.clone(), peer.priority);
        }
        let replication = Arc::new(
            ReplicationManager::new(
                config.replication.clone(),
                Arc::new(TransportSink::new(Arc::clone(&transport))),
            )
            .with_local_node(config.node_id.clone()),
        );
        detector.subscribe(replication.clone());
        let (maintenance_tx, _) = broadcast::channel(1);

        tracing::info!(
            node_id = %config.node_id,
            peers = config.peers.len(),
            consistency = ?config.store.consistency_level,
            "Node created"
        );

        Ok(Arc::new(Self {
            config,
            transport,
            store,
            coordinator,
            participant,
            registry,
            detector: Arc::new(detector),
            replication,
            tasks: Mutex::new(Vec::new()),
            maintenance_tx,
            stopped: AtomicBool::new(false),
        }))
    }

    /// Node with volatile recovery logs.
    pub fn in_memory(config: NodeConfig, transport: Arc<dyn Transport>) -> Result<Arc<Self>> {
        Self::new(
            config,
            transport,
            Arc::new(RecoveryLog::in_memory()),
            Arc::new(RecoveryLog::in_memory()),
        )
    }

    pub fn node_id(&self) -> &NodeId {
        &self.config.node_id
    }

    pub fn config(&self) -> &NodeConfig {
        &self.config
    }

    pub fn store(&self) -> &Arc<CausalEventStore> {
        &self.store
    }

    pub fn coordinator(&self) -> &Arc<TransactionCoordinator> {
        &self.coordinator
    }

    pub fn participant(&self) -> &Arc<TxParticipant> {
        &self.participant
    }

    pub fn registry(&self) -> &TransactionRegistry {
        &self.registry
    }

    pub fn detector(&self) -> &Arc<FailureDetector> {
        &self.detector
    }

    pub fn replication(&self) -> &Arc<ReplicationManager> {
        &self.replication
    }

    pub fn metrics_snapshot(&self) -> NodeMetricsSnapshot {
        NodeMetricsSnapshot {
            coordinator: self.coordinator.stats().snapshot(),
            registry: self.registry.stats().snapshot(),
            replication: self.replication.stats().snapshot(),
            failovers: self.detector.failover_total(),
            participant_applied: self.participant.applied_count(),
        }
    }

    /// Emit the metrics snapshot as one structured log event.
    pub fn emit_metrics_as_logs(&self) {
        let s = self.metrics_snapshot();
        tracing::info!(
            target: "consistency_core::metrics",
            node_id = %self.config.node_id,
            tx_started = s.coordinator.started,
            tx_committed = s.coordinator.committed,
            tx_aborted = s.coordinator.aborted,
            tx_timed_out = s.coordinator.timed_out,
            tx_parked = s.coordinator.parked,
            prepare_mean_us = s.coordinator.prepare_latency.mean_us,
            decision_mean_us = s.coordinator.decision_latency.mean_us,
            slow_prepares = s.coordinator.prepare_latency.slow,
            registry_failed = s.registry.failed,
            replication_pushed = s.replication.pushed,
            replication_push_failures = s.replication.push_failures,
            replication_promotions = s.replication.promotions,
            failovers = s.failovers,
            participant_applied = s.participant_applied,
            "Node metrics snapshot"
        );
    }

    /// Run the recovery sweep for both roles, then start the background
    /// loops.
    pub async fn start(self: &Arc<Self>) -> Result<StartupReport> {
        let coordinator = self.coordinator.recover().await?;

        let in_doubt = self.participant.recover();
        let unresolved = if in_doubt.is_empty() {
            Vec::new()
        } else {
            self.participant
                .resolve_in_doubt(self.config.transaction.prepare_timeout())
                .await
                .into_iter()
                .filter(|(_, result)| result.is_err())
                .map(|(tx_id, _)| tx_id)
                .collect()
        };

        let mut tasks = self.tasks.lock();
        let detector = Arc::clone(&self.detector);
        tasks.push(tokio::spawn(async move { detector.run().await }));
        let replication = Arc::clone(&self.replication);
        tasks.push(tokio::spawn(async move { replication.run().await }));
        let node = Arc::clone(self);
        tasks.push(tokio::spawn(async move { node.run_maintenance().await }));
        drop(tasks);

        tracing::info!(
            node_id = %self.config.node_id,
            presumed_aborted = coordinator.presumed_aborted,
            in_doubt = in_doubt.len(),
            unresolved = unresolved.len(),
            "Node started"
        );
        Ok(StartupReport {
            coordinator,
            in_doubt,
            unresolved,
        })
    }

    /// One round of redelivery and cleanup.
    pub async fn maintain(&self) -> MaintenanceReport {
        let config = &self.config.transaction;
        let parked = self.coordinator.retry_pending_decisions().await;
        let resolved = self
            .participant
            .resolve_stalled(config.prepare_timeout(), config.ack_timeout())
            .await
            .into_iter()
            .map(|(tx_id, _)| tx_id)
            .collect();
        let expired = self.registry.expire_idle(config.idle_timeout());

        let report = MaintenanceReport {
            parked,
            resolved,
            expired,
        };
        if report != MaintenanceReport::default() {
            tracing::debug!(
                node_id = %self.config.node_id,
                parked = report.parked,
                resolved = report.resolved.len(),
                expired = report.expired.len(),
                "Maintenance round"
            );
        }
        report
    }

    async fn run_maintenance(&self) {
        let mut shutdown_rx = self.maintenance_tx.subscribe();
        if self.stopped.load(Ordering::SeqCst) {
            return;
        }
        let interval = self.config.transaction.maintenance_interval();
        loop {
            tokio::select! {
                _ = shutdown_rx.recv() => {
                    break;
                }
                _ = tokio::time::sleep(interval) => {
                    self.maintain().await;
                }
            }
        }
    }

    /// Stop the background loops and wait for them.
    pub async fn shutdown(&self) {
        self.stopped.store(true, Ordering::SeqCst);
        let _ = self.maintenance_tx.send(());
        self.detector.shutdown();
        self.replication.shutdown();
        let tasks: Vec<JoinHandle<()>> = self.tasks.lock().drain(..).collect();
        for task in tasks {
            if let Err(e) = task.await {
                tracing::warn!(error = %e, "Background task ended abnormally");
            }
        }
        tracing::info!(node_id = %self.config.node_id, "Node stopped");
    }

    fn ensure_writable(&self, key: &str) -> Result<()> {
        if self.replication.strategy() != ReplicationStrategy::ActivePassive {
            return Ok(());
        }
        match self.replication.get_primary(key) {
            Some(primary) if &primary != self.node_id() => Err(ProtocolError::NotPrimary {
                key: key.to_string(),
                origin: self.node_id().clone(),
            }
            .into()),
            _ => Ok(()),
        }
    }

    /// Write locally and push the update to the key's replicas.
    pub async fn put(&self, key: &str, value: Vec<u8>) -> Result<ReplicationReport> {
        self.ensure_writable(key)?;
        let update = self.store.set(key, value);
        self.replication.replicate_with_report(&update).await
    }

    pub async fn delete(&self, key: &str) -> Result<ReplicationReport> {
        self.ensure_writable(key)?;
        let update = self.store.delete(key);
        self.replication.replicate_with_report(&update).await
    }

    pub fn get(&self, key: &str) -> Option<Vec<u8>> {
        self.store.get(key)
    }

    pub fn begin(&self, participants: &[NodeId]) -> Result<TxId> {
        self.registry.begin(participants)
    }

    pub async fn execute(&self, tx_id: &TxId, operations: Vec<Operation>) -> Result<bool> {
        self.registry.execute(tx_id, operations).await
    }

    pub fn abort(&self, tx_id: &TxId) -> Result<()> {
        self.registry.abort(tx_id)
    }

    fn apply_replicated(&self, update: &ReplicationUpdate) {
        match self.store.apply_remote(update.clone()) {
            Ok(ApplyOutcome::Applied) => {
                tracing::debug!(key = %update.key, origin = %update.origin, "Replicated update applied");
            },
            Ok(outcome) => {
                tracing::debug!(key = %update.key, outcome = ?outcome, "Replicated update not applied");
            },
            Err(e) => {
                tracing::warn!(key = %update.key, origin = %update.origin, error = %e, "Replicated update rejected");
            },
        }
    }
}

#[async_trait]
impl MessageHandler for Node {
    async fn handle_message(&self, msg: Message) {
        if let Some(receiver) = &msg.receiver {
            if receiver != self.node_id() {
                tracing::debug!(receiver = %receiver, "Message for another node ignored");
                return;
            }
        }

        let reply = match &msg.payload {
            Payload::Vote { .. } | Payload::Ack { .. } | Payload::DecisionQuery { .. } => {
                self.coordinator.handle(&msg)
            },
            Payload::Prepare { .. }
            | Payload::Commit { .. }
            | Payload::Abort { .. }
            | Payload::DecisionReply { .. } => self.participant.handle(&msg),
            Payload::Heartbeat { sender, .. } => {
                self.detector.record_heartbeat(sender);
                self.replication.record_node_heartbeat(sender);
                None
            },
            Payload::ReplicationUpdate(update) => {
                self.apply_replicated(update);
                None
            },
        };

        if let Some(reply) = reply {
            if let Err(e) = self.transport.send(&msg.sender, reply).await {
                tracing::debug!(
                    peer = %msg.sender,
                    payload = msg.payload.name(),
                    error = %e,
                    "Reply not sent"
                );
            }
        }
    }
}
