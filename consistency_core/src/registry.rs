// SPDX-License-Identifier: BSL-1.1 OR Apache-2.0
//! Transaction registry: the application-facing entry point for 2PC.
//!
//! Keeps every live [`Transaction`] by id, delegates the protocol to the
//! [`TransactionCoordinator`], and archives finished transactions into a
//! bounded history ring.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

use crate::coordinator::TransactionCoordinator;
use crate::error::{ProtocolError, Result};
use crate::transaction::{Operation, Transaction, TransactionSummary, TxOutcome, TxState};
use crate::tx_id::TxId;
use crate::NodeId;

#[derive(Debug, Default)]
pub struct RegistryStats {
    pub begun: AtomicU64,
    pub committed: AtomicU64,
    pub aborted: AtomicU64,
    /// Executions that ended in an error rather than a decision.
    pub failed: AtomicU64,
}

impl RegistryStats {
    pub fn snapshot(&self) -> RegistryStatsSnapshot {
        RegistryStatsSnapshot {
            begun: self.begun.load(Ordering::Relaxed),
            committed: self.committed.load(Ordering::Relaxed),
            aborted: self.aborted.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegistryStatsSnapshot {
    pub begun: u64,
    pub committed: u64,
    pub aborted: u64,
    pub failed: u64,
}

pub struct TransactionRegistry {
    coordinator: Arc<TransactionCoordinator>,
    active: RwLock<HashMap<TxId, Transaction>>,
    history: RwLock<VecDeque<TransactionSummary>>,
    capacity: usize,
    stats: RegistryStats,
}

impl TransactionRegistry {
    pub fn new(coordinator: Arc<TransactionCoordinator>, history_capacity: usize) -> Self {
        Self {
            coordinator,
            active: RwLock::new(HashMap::new()),
            history: RwLock::new(VecDeque::with_capacity(history_capacity.min(1024))),
            capacity: history_capacity.max(1),
            stats: RegistryStats::default(),
        }
    }

    pub fn coordinator(&self) -> &Arc<TransactionCoordinator> {
        &self.coordinator
    }

    pub fn stats(&self) -> &RegistryStats {
        &self.stats
    }

    /// Register a new transaction over `participants`.
    pub fn begin(&self, participants: &[NodeId]) -> Result<TxId> {
        let tx = self.coordinator.begin(participants)?;
        let id = tx.id.clone();
        self.active.write().insert(id.clone(), tx);
        self.stats.begun.fetch_add(1, Ordering::Relaxed);
        Ok(id)
    }

    /// Run the transaction to a decision. Returns `true` iff it committed.
    ///
    /// The transaction leaves the active set whatever happens; an execution
    /// error is archived as aborted and then returned.
    pub async fn execute(&self, tx_id: &TxId, operations: Vec<Operation>) -> Result<bool> {
        {
            let mut active = self.active.write();
            let tx = active
                .get_mut(tx_id)
                .ok_or_else(|| ProtocolError::UnknownTransaction(tx_id.clone()))?;
            tx.set_operations(operations.clone())?;
            tx.transition_to(TxState::Preparing)?;
        }

        let result = self.coordinator.execute(tx_id, operations).await;
        let outcome = match &result {
            Ok(outcome) => *outcome,
            Err(e) => {
                tracing::warn!(tx_id = %tx_id, error = %e, "Transaction execution failed");
                self.stats.failed.fetch_add(1, Ordering::Relaxed);
                TxOutcome::Aborted
            },
        };
        self.retire(tx_id, outcome);
        result.map(TxOutcome::is_committed)
    }

    /// Abort a transaction whose commit has not been decided.
    pub fn abort(&self, tx_id: &TxId) -> Result<()> {
        let idle = self
            .active
            .read()
            .get(tx_id)
            .map(|tx| tx.state() == TxState::Initial);
        self.coordinator.abort(tx_id)?;
        // A preparing transaction is retired by its own execute call.
        if idle == Some(true) {
            self.retire(tx_id, TxOutcome::Aborted);
        }
        Ok(())
    }

    /// Abort and archive transactions begun more than `max_age` ago that
    /// were never executed.
    pub fn expire_idle(&self, max_age: Duration) -> Vec<TxId> {
        let expired = self.coordinator.expire_idle(max_age);
        for tx_id in &expired {
            self.retire(tx_id, TxOutcome::Aborted);
        }
        expired
    }

    fn retire(&self, tx_id: &TxId, outcome: TxOutcome) {
        let Some(mut tx) = self.active.write().remove(tx_id) else {
            return;
        };
        if let Err(e) = tx.finish(outcome) {
            tracing::warn!(tx_id = %tx_id, error = %e, "Could not finish transaction state");
        }
        match outcome {
            TxOutcome::Committed => self.stats.committed.fetch_add(1, Ordering::Relaxed),
            TxOutcome::Aborted => self.stats.aborted.fetch_add(1, Ordering::Relaxed),
        };

        let summary = tx.summary();
        tracing::info!(
            tx_id = %tx_id,
            state = ?summary.state,
            duration_ms = summary.duration_ms,
            "Transaction archived"
        );

        let mut history = self.history.write();
        while history.len() >= self.capacity {
            history.pop_front();
        }
        history.push_back(summary);
    }

    /// Summary of a live or archived transaction.
    pub fn get(&self, tx_id: &TxId) -> Option<TransactionSummary> {
        if let Some(tx) = self.active.read().get(tx_id) {
            return Some(tx.summary());
        }
        self.history
            .read()
            .iter()
            .rev()
            .find(|s| &s.id == tx_id)
            .cloned()
    }

    pub fn is_active(&self, tx_id: &TxId) -> bool {
        self.active.read().contains_key(tx_id)
    }

    pub fn active_transactions(&self) -> Vec<TxId> {
        let mut ids: Vec<TxId> = self.active.read().keys().cloned().collect();
        ids.sort();
        ids
    }

    /// Finished transactions, oldest first.
    pub fn history(&self) -> Vec<TransactionSummary> {
        self.history.read().iter().cloned().collect()
    }
}
