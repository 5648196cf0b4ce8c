// SPDX-License-Identifier: BSL-1.1 OR Apache-2.0
//! Error types for consistency_core.

use thiserror::Error;

use crate::tx_id::TxId;
use crate::vector_clock::VectorClock;

/// Result type for consistency_core operations.
pub type Result<T> = std::result::Result<T, CoreError>;

/// Protocol violations: a message or call that does not fit the current
/// state of the transaction or replica set it names.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ProtocolError {
    #[error("unknown transaction {0}")]
    UnknownTransaction(TxId),

    #[error("vote for {tx_id} from {participant} arrived after the decision")]
    VoteAfterDecision { tx_id: TxId, participant: String },

    #[error("transaction {0} is already decided")]
    AlreadyDecided(TxId),

    #[error("{node} is not a participant of {tx_id}")]
    NotAParticipant { tx_id: TxId, node: String },

    #[error("no replica {replica} for key {key}")]
    UnknownReplica { key: String, replica: String },

    #[error("write to {key} from {origin} refused: not the primary")]
    NotPrimary { key: String, origin: String },
}

/// Errors that can occur in consistency_core operations.
#[derive(Debug, Error)]
pub enum CoreError {
    /// Message or call out of step with protocol state.
    #[error("protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    /// Participant list was empty or otherwise unusable.
    #[error("invalid participants: {0}")]
    InvalidParticipants(String),

    /// Operation list rejected before phase 1.
    #[error("invalid operation: {0}")]
    InvalidOperation(String),

    /// A bounded wait expired.
    #[error("timed out waiting for {what} after {elapsed_ms}ms")]
    Timeout { what: String, elapsed_ms: u64 },

    /// The transport refused or failed a send.
    #[error("transport error: {0}")]
    Transport(String),

    /// Delivery to a node failed after every retry.
    #[error("delivery to {node} failed after {attempts} attempts")]
    DeliveryFailed { node: String, attempts: u32 },

    /// A causal update raced an existing write.
    #[error("concurrent update on key {key}: local {local}, remote {remote}")]
    ConsistencyConflict {
        key: String,
        local: VectorClock,
        remote: VectorClock,
    },

    /// An in-doubt transaction could not be resolved.
    #[error("cannot resolve transaction {tx_id}: {reason}")]
    RecoveryAmbiguity { tx_id: TxId, reason: String },

    /// Durable log failure.
    #[error("storage error: {0}")]
    Storage(String),

    /// Serialization error.
    #[error("serialization error: {0}")]
    Serialization(String),

    /// Rejected configuration.
    #[error("config error: {0}")]
    Config(String),
}

impl CoreError {
    pub fn timeout(what: impl Into<String>, elapsed: std::time::Duration) -> Self {
        CoreError::Timeout {
            what: what.into(),
            elapsed_ms: elapsed.as_millis() as u64,
        }
    }
}

impl From<bincode::Error> for CoreError {
    fn from(err: bincode::Error) -> Self {
        CoreError::Serialization(err.to_string())
    }
}

impl From<std::io::Error> for CoreError {
    fn from(err: std::io::Error) -> Self {
        CoreError::Storage(err.to_string())
    }
}
