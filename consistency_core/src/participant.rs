// SPDX-License-Identifier: BSL-1.1 OR Apache-2.0
//! Participant side of two-phase commit.
//!
//! A participant validates without side effects, logs PREPARE before voting
//! COMMIT, and applies prepared operations exactly once when COMMIT arrives.
//! Keys touched by a prepared transaction stay locked until the decision, so
//! a second transaction over the same key votes ABORT instead of waiting.
//!
//! After a restart [`TxParticipant::recover`] rebuilds prepared state from the
//! log; such transactions are in doubt until the coordinator answers a
//! decision query. [`TxParticipant::resolve_stalled`] asks again for any
//! transaction left prepared too long, which covers a lost COMMIT or ABORT.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::oneshot;
use tokio::time::Instant;

use crate::causal_store::CausalEventStore;
use crate::error::{CoreError, ProtocolError, Result};
use crate::network::{Message, Payload, Transport};
use crate::recovery_log::{LogPhase, RecoveryLog, RecoveryLogEntry};
use crate::transaction::{Operation, TxOutcome, Vote};
use crate::tx_id::TxId;
use crate::NodeId;

/// The local state a participant protects.
pub trait ResourceManager: Send + Sync {
    /// Whether `operations` could be applied. Must not change anything.
    fn validate(&self, operations: &[Operation]) -> Result<()>;

    fn apply(&self, tx_id: &TxId, operations: &[Operation]) -> Result<()>;
}

/// Applies transaction operations to a [`CausalEventStore`].
pub struct StoreResources {
    store: Arc<CausalEventStore>,
}

impl StoreResources {
    pub fn new(store: Arc<CausalEventStore>) -> Self {
        Self { store }
    }
}

impl ResourceManager for StoreResources {
    fn validate(&self, operations: &[Operation]) -> Result<()> {
        if let Some(op) = operations.iter().find(|op| op.key().is_empty()) {
            return Err(CoreError::InvalidOperation(format!("empty key in {op:?}")));
        }
        Ok(())
    }

    fn apply(&self, tx_id: &TxId, operations: &[Operation]) -> Result<()> {
        for op in operations {
            match op {
                Operation::Put { key, value } => {
                    self.store.set(key.clone(), value.clone());
                },
                Operation::Delete { key } => {
                    self.store.delete(key.clone());
                },
            }
        }
        tracing::debug!(tx_id = %tx_id, count = operations.len(), "Operations applied to store");
        Ok(())
    }
}

#[derive(Debug, Clone)]
struct PreparedTx {
    coordinator: NodeId,
    operations: Vec<Operation>,
    prepared_at: Instant,
}

impl PreparedTx {
    fn new(coordinator: NodeId, operations: Vec<Operation>) -> Self {
        Self {
            coordinator,
            operations,
            prepared_at: Instant::now(),
        }
    }
}

#[derive(Default)]
struct ParticipantState {
    prepared: HashMap<TxId, PreparedTx>,
    /// Key to the prepared transaction holding it.
    locks: HashMap<String, TxId>,
}

impl ParticipantState {
    fn hold(&mut self, tx_id: &TxId, prepared: PreparedTx) {
        for op in &prepared.operations {
            self.locks.insert(op.key().to_string(), tx_id.clone());
        }
        self.prepared.insert(tx_id.clone(), prepared);
    }

    fn release(&mut self, tx_id: &TxId) -> Option<PreparedTx> {
        self.locks.retain(|_, holder| holder != tx_id);
        self.prepared.remove(tx_id)
    }

    fn conflicting(&self, operations: &[Operation]) -> Option<&TxId> {
        operations.iter().find_map(|op| self.locks.get(op.key()))
    }
}

/// Participant in transactions coordinated elsewhere.
pub struct TxParticipant {
    node_id: NodeId,
    resources: Arc<dyn ResourceManager>,
    log: Arc<RecoveryLog>,
    transport: Arc<dyn Transport>,
    state: Mutex<ParticipantState>,
    queries: Mutex<HashMap<TxId, oneshot::Sender<Option<TxOutcome>>>>,
    applied: AtomicU64,
}

impl TxParticipant {
    pub fn new(
        resources: Arc<dyn ResourceManager>,
        log: Arc<RecoveryLog>,
        transport: Arc<dyn Transport>,
    ) -> Self {
        Self {
            node_id: transport.local_id().clone(),
            resources,
            log,
            transport,
            state: Mutex::new(ParticipantState::default()),
            queries: Mutex::new(HashMap::new()),
            applied: AtomicU64::new(0),
        }
    }

    pub fn log(&self) -> &Arc<RecoveryLog> {
        &self.log
    }

    /// Number of transactions whose operations were applied here.
    pub fn applied_count(&self) -> u64 {
        self.applied.load(Ordering::Relaxed)
    }

    pub fn is_prepared(&self, tx_id: &TxId) -> bool {
        self.state.lock().prepared.contains_key(tx_id)
    }

    /// Prepared transactions still waiting for a decision.
    pub fn in_doubt(&self) -> Vec<TxId> {
        let mut ids: Vec<TxId> = self.state.lock().prepared.keys().cloned().collect();
        ids.sort();
        ids
    }

    fn entry(&self, tx_id: &TxId, phase: LogPhase, coordinator: Option<&NodeId>) -> RecoveryLogEntry {
        RecoveryLogEntry::new(tx_id.clone(), phase, &self.node_id)
            .with_peers(coordinator.into_iter().cloned().collect())
    }

    /// Vote on `operations`. Repeated PREPAREs get the vote already given.
    pub fn handle_prepare(
        &self,
        tx_id: &TxId,
        coordinator: &NodeId,
        operations: Vec<Operation>,
    ) -> Vote {
        let mut state = self.state.lock();

        match self.log.terminal_phase(tx_id) {
            Some(LogPhase::Commit) => return Vote::Commit,
            Some(_) => return Vote::Abort,
            None => {},
        }
        if state.prepared.contains_key(tx_id) {
            return Vote::Commit;
        }

        let refusal = match self.resources.validate(&operations) {
            Err(e) => Some(e.to_string()),
            Ok(()) => state
                .conflicting(&operations)
                .map(|holder| format!("keys held by {holder}")),
        };

        if let Some(reason) = refusal {
            tracing::debug!(tx_id = %tx_id, reason = %reason, "Voting abort");
            if let Err(e) = self.log.append(self.entry(tx_id, LogPhase::Abort, Some(coordinator))) {
                tracing::error!(tx_id = %tx_id, error = %e, "Failed to log abort vote");
            }
            return Vote::Abort;
        }

        let record = self
            .entry(tx_id, LogPhase::Prepare, Some(coordinator))
            .with_operations(operations.clone());
        if let Err(e) = self.log.append(record) {
            tracing::error!(tx_id = %tx_id, error = %e, "Failed to log prepare, voting abort");
            return Vote::Abort;
        }

        state.hold(tx_id, PreparedTx::new(coordinator.clone(), operations));
        tracing::debug!(tx_id = %tx_id, "Prepared, voting commit");
        Vote::Commit
    }

    /// Log COMMIT and apply the prepared operations. A repeated COMMIT is
    /// acknowledged without applying again.
    pub fn handle_commit(&self, tx_id: &TxId) -> Result<()> {
        let prepared = {
            let mut state = self.state.lock();
            match self.log.terminal_phase(tx_id) {
                Some(LogPhase::Commit) => return Ok(()),
                Some(_) => return Err(ProtocolError::AlreadyDecided(tx_id.clone()).into()),
                None => {},
            }
            let coordinator = state
                .prepared
                .get(tx_id)
                .map(|p| p.coordinator.clone())
                .ok_or_else(|| ProtocolError::UnknownTransaction(tx_id.clone()))?;

            self.log
                .append(self.entry(tx_id, LogPhase::Commit, Some(&coordinator)))?;
            state
                .release(tx_id)
                .ok_or_else(|| ProtocolError::UnknownTransaction(tx_id.clone()))?
        };

        if let Err(e) = self.resources.apply(tx_id, &prepared.operations) {
            tracing::error!(tx_id = %tx_id, error = %e, "Failed to apply committed operations");
            return Err(e);
        }
        self.applied.fetch_add(1, Ordering::Relaxed);
        tracing::info!(tx_id = %tx_id, "Participant committed");
        Ok(())
    }

    /// Log ABORT and drop any prepared state. Idempotent.
    pub fn handle_abort(&self, tx_id: &TxId) -> Result<()> {
        let mut state = self.state.lock();
        match self.log.terminal_phase(tx_id) {
            Some(LogPhase::Abort) => return Ok(()),
            Some(_) => return Err(ProtocolError::AlreadyDecided(tx_id.clone()).into()),
            None => {},
        }
        let coordinator = state.release(tx_id).map(|p| p.coordinator);
        self.log
            .append(self.entry(tx_id, LogPhase::Abort, coordinator.as_ref()))?;
        tracing::info!(tx_id = %tx_id, "Participant aborted");
        Ok(())
    }

    /// Rebuild prepared state from the log after a restart. Returns the
    /// in-doubt ids.
    pub fn recover(&self) -> Vec<TxId> {
        let in_doubt = self.log.in_doubt();
        let mut state = self.state.lock();
        for tx_id in &in_doubt {
            let Some(record) = self
                .log
                .entries_for(tx_id)
                .into_iter()
                .find(|e| e.phase == LogPhase::Prepare)
            else {
                continue;
            };
            let Some(coordinator) = record.peers.first().cloned() else {
                tracing::warn!(tx_id = %tx_id, "Prepare record without coordinator");
                continue;
            };
            state.hold(tx_id, PreparedTx::new(coordinator, record.operations));
        }
        if !in_doubt.is_empty() {
            tracing::warn!(count = in_doubt.len(), "In-doubt transactions recovered");
        }
        in_doubt
    }

    /// Send a decision query for a prepared transaction and wait up to
    /// `timeout` for the reply. `Ok(None)` means the coordinator is still
    /// deciding.
    pub async fn query_decision(&self, tx_id: &TxId, timeout: Duration) -> Result<Option<TxOutcome>> {
        let coordinator = self
            .state
            .lock()
            .prepared
            .get(tx_id)
            .map(|p| p.coordinator.clone())
            .ok_or_else(|| ProtocolError::UnknownTransaction(tx_id.clone()))?;

        let (reply_tx, reply_rx) = oneshot::channel();
        self.queries.lock().insert(tx_id.clone(), reply_tx);

        let query = Message::request(
            self.node_id.clone(),
            coordinator.clone(),
            Payload::DecisionQuery {
                tx_id: tx_id.clone(),
            },
        );
        if let Err(e) = self.transport.send(&coordinator, query).await {
            self.queries.lock().remove(tx_id);
            return Err(e);
        }

        let answer = tokio::time::timeout(timeout, reply_rx).await;
        self.queries.lock().remove(tx_id);

        match answer {
            Ok(Ok(outcome)) => Ok(outcome),
            Ok(Err(_)) | Err(_) => Err(CoreError::timeout(
                format!("decision on {tx_id} from {coordinator}"),
                timeout,
            )),
        }
    }

    /// Ask the coordinator how `tx_id` ended and act on the answer.
    pub async fn resolve(&self, tx_id: &TxId, timeout: Duration) -> Result<TxOutcome> {
        if let Some(outcome) = self.log.terminal_phase(tx_id).and_then(LogPhase::outcome) {
            return Ok(outcome);
        }

        let outcome = match self.query_decision(tx_id, timeout).await {
            Ok(Some(outcome)) => outcome,
            Ok(None) => {
                return Err(CoreError::RecoveryAmbiguity {
                    tx_id: tx_id.clone(),
                    reason: "coordinator has not decided yet".to_string(),
                })
            },
            Err(e @ CoreError::Protocol(_)) => return Err(e),
            Err(e) => {
                return Err(CoreError::RecoveryAmbiguity {
                    tx_id: tx_id.clone(),
                    reason: e.to_string(),
                })
            },
        };

        match outcome {
            TxOutcome::Committed => self.handle_commit(tx_id)?,
            TxOutcome::Aborted => self.handle_abort(tx_id)?,
        }
        tracing::info!(tx_id = %tx_id, outcome = ?outcome, "In-doubt transaction resolved");
        Ok(outcome)
    }

    /// Resolve every in-doubt transaction, one query at a time.
    pub async fn resolve_in_doubt(&self, timeout: Duration) -> Vec<(TxId, Result<TxOutcome>)> {
        let mut results = Vec::new();
        for tx_id in self.in_doubt() {
            let result = self.resolve(&tx_id, timeout).await;
            if let Err(e) = &result {
                tracing::warn!(tx_id = %tx_id, error = %e, "In-doubt transaction still blocked");
            }
            results.push((tx_id, result));
        }
        results
    }

    /// Query the coordinator for every transaction prepared at least
    /// `older_than` ago. Returns the ones that got an answer.
    pub async fn resolve_stalled(
        &self,
        older_than: Duration,
        timeout: Duration,
    ) -> Vec<(TxId, TxOutcome)> {
        let stalled: Vec<TxId> = self
            .state
            .lock()
            .prepared
            .iter()
            .filter(|(_, p)| p.prepared_at.elapsed() >= older_than)
            .map(|(id, _)| id.clone())
            .collect();

        let mut resolved = Vec::new();
        for tx_id in stalled {
            match self.resolve(&tx_id, timeout).await {
                Ok(outcome) => resolved.push((tx_id, outcome)),
                Err(e) => tracing::debug!(tx_id = %tx_id, error = %e, "Stalled transaction unresolved"),
            }
        }
        resolved
    }

    fn on_decision_reply(&self, tx_id: &TxId, outcome: Option<TxOutcome>) {
        if let Some(waiter) = self.queries.lock().remove(tx_id) {
            let _ = waiter.send(outcome);
        }
    }

    /// Participant-side handling of an inbound message. Returns the reply to
    /// send back, if any.
    pub fn handle(&self, msg: &Message) -> Option<Message> {
        let reply = match &msg.payload {
            Payload::Prepare { tx_id, operations } => Payload::Vote {
                tx_id: tx_id.clone(),
                vote: self.handle_prepare(tx_id, &msg.sender, operations.clone()),
            },
            Payload::Commit { tx_id } => match self.handle_commit(tx_id) {
                Ok(()) => Payload::Ack {
                    tx_id: tx_id.clone(),
                    outcome: TxOutcome::Committed,
                },
                Err(e) => {
                    tracing::debug!(tx_id = %tx_id, error = %e, "Commit not applied");
                    return None;
                },
            },
            Payload::Abort { tx_id } => match self.handle_abort(tx_id) {
                Ok(()) => Payload::Ack {
                    tx_id: tx_id.clone(),
                    outcome: TxOutcome::Aborted,
                },
                Err(e) => {
                    tracing::debug!(tx_id = %tx_id, error = %e, "Abort not applied");
                    return None;
                },
            },
            Payload::DecisionReply { tx_id, outcome } => {
                self.on_decision_reply(tx_id, *outcome);
                return None;
            },
            _ => return None,
        };
        Some(Message::response(msg, self.node_id.clone(), reply))
    }
}
