// SPDX-License-Identifier: BSL-1.1 OR Apache-2.0
//! Transaction records and their state machine.

use serde::{Deserialize, Serialize};

use crate::error::{CoreError, ProtocolError, Result};
use crate::tx_id::TxId;
use crate::{now_epoch_millis, EpochMillis, NodeId};

/// A single write carried by a transaction.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Operation {
    Put { key: String, value: Vec<u8> },
    Delete { key: String },
}

impl Operation {
    pub fn put(key: impl Into<String>, value: impl Into<Vec<u8>>) -> Self {
        Operation::Put {
            key: key.into(),
            value: value.into(),
        }
    }

    pub fn delete(key: impl Into<String>) -> Self {
        Operation::Delete { key: key.into() }
    }

    #[must_use]
    pub fn key(&self) -> &str {
        match self {
            Operation::Put { key, .. } | Operation::Delete { key } => key,
        }
    }
}

/// A participant's answer to PREPARE.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Vote {
    Commit,
    Abort,
}

/// The coordinator's decision for a transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TxOutcome {
    Committed,
    Aborted,
}

impl TxOutcome {
    #[must_use]
    pub fn is_committed(self) -> bool {
        self == TxOutcome::Committed
    }
}

/// Lifecycle of a transaction on its coordinator.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[non_exhaustive]
pub enum TxState {
    #[default]
    Initial,
    Preparing,
    Prepared,
    Committing,
    Committed,
    Aborting,
    Aborted,
}

impl TxState {
    #[must_use]
    pub fn is_terminal(self) -> bool {
        matches!(self, TxState::Committed | TxState::Aborted)
    }

    fn can_transition_to(self, next: TxState) -> bool {
        use TxState::*;
        matches!(
            (self, next),
            (Initial, Preparing)
                | (Initial, Aborting)
                | (Preparing, Prepared)
                | (Preparing, Aborting)
                | (Prepared, Committing)
                | (Prepared, Aborting)
                | (Committing, Committed)
                | (Aborting, Aborted)
        )
    }
}

/// A multi-participant transaction owned by its coordinator.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Transaction {
    pub id: TxId,
    pub coordinator: NodeId,
    participants: Vec<NodeId>,
    operations: Vec<Operation>,
    state: TxState,
    pub started_at: EpochMillis,
    pub ended_at: Option<EpochMillis>,
}

impl Transaction {
    /// Create a transaction. Duplicate participants collapse, keeping the
    /// first occurrence.
    pub fn new(id: TxId, coordinator: impl Into<NodeId>, participants: &[NodeId]) -> Result<Self> {
        let mut unique: Vec<NodeId> = Vec::with_capacity(participants.len());
        for p in participants {
            if !unique.contains(p) {
                unique.push(p.clone());
            }
        }
        if unique.is_empty() {
            return Err(CoreError::InvalidParticipants(
                "transaction needs at least one participant".to_string(),
            ));
        }

        Ok(Self {
            id,
            coordinator: coordinator.into(),
            participants: unique,
            operations: Vec::new(),
            state: TxState::Initial,
            started_at: now_epoch_millis(),
            ended_at: None,
        })
    }

    pub fn participants(&self) -> &[NodeId] {
        &self.participants
    }

    pub fn operations(&self) -> &[Operation] {
        &self.operations
    }

    pub fn state(&self) -> TxState {
        self.state
    }

    /// Attach the operations. Rejected once phase 1 has begun.
    pub fn set_operations(&mut self, operations: Vec<Operation>) -> Result<()> {
        if self.state != TxState::Initial {
            return Err(CoreError::InvalidOperation(format!(
                "operations of {} are frozen in state {:?}",
                self.id, self.state
            )));
        }
        self.operations = operations;
        Ok(())
    }

    /// Move to `next`, refusing anything the state machine does not allow.
    pub fn transition_to(&mut self, next: TxState) -> Result<()> {
        if self.state.is_terminal() {
            return Err(ProtocolError::AlreadyDecided(self.id.clone()).into());
        }
        if !self.state.can_transition_to(next) {
            return Err(CoreError::InvalidOperation(format!(
                "{}: illegal transition {:?} -> {:?}",
                self.id, self.state, next
            )));
        }
        self.state = next;
        if next.is_terminal() {
            self.ended_at = Some(now_epoch_millis());
        }
        Ok(())
    }

    /// Drive to the terminal state for `outcome` from wherever we are.
    pub fn finish(&mut self, outcome: TxOutcome) -> Result<()> {
        let path: &[TxState] = match outcome {
            TxOutcome::Committed => &[
                TxState::Preparing,
                TxState::Prepared,
                TxState::Committing,
                TxState::Committed,
            ],
            TxOutcome::Aborted => &[TxState::Aborting, TxState::Aborted],
        };
        let start = path.iter().position(|s| *s == self.state).map_or(0, |i| i + 1);
        for next in &path[start..] {
            self.transition_to(*next)?;
        }
        Ok(())
    }

    pub fn summary(&self) -> TransactionSummary {
        let ended_at = self.ended_at.unwrap_or_else(now_epoch_millis);
        TransactionSummary {
            id: self.id.clone(),
            coordinator: self.coordinator.clone(),
            participants: self.participants.clone(),
            operations: self.operations.clone(),
            state: self.state,
            started_at: self.started_at,
            ended_at,
            duration_ms: ended_at.saturating_sub(self.started_at),
        }
    }
}

/// History record of a finished transaction.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransactionSummary {
    pub id: TxId,
    pub coordinator: NodeId,
    pub participants: Vec<NodeId>,
    pub operations: Vec<Operation>,
    pub state: TxState,
    pub started_at: EpochMillis,
    pub ended_at: EpochMillis,
    pub duration_ms: u64,
}
