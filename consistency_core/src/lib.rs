// SPDX-License-Identifier: BSL-1.1 OR Apache-2.0
//! ConsistencyCore - transactional consistency and fault recovery for a
//! multi-node system.
//!
//! - Atomic multi-participant transactions via two-phase commit with a
//!   write-ahead recovery log
//! - Causally ordered key-value store stamped with vector clocks
//! - Heartbeat failure detection with replica promotion
//! - Causally ordered event history
//!
//! # Architecture
//!
//! ```text
//! Node
//!   ├── TransactionRegistry ─► TransactionCoordinator ─► RecoveryLog
//!   ├── TxParticipant ─► CausalEventStore ─► VectorClock
//!   ├── FailureDetector ─► (FailoverListener) ReplicationManager
//!   └── Transport (MemoryNetwork in-process)
//! ```
//!
//! # Quick Start
//!
//! ```ignore
//! use consistency_core::{MemoryNetwork, Node, NodeConfig, Operation};
//!
//! let network = MemoryNetwork::new();
//! let node = Node::in_memory(NodeConfig::new("a"), network.transport("a"))?;
//! network.attach("a", node.clone());
//! node.start().await?;
//!
//! let tx = node.begin(&["a".to_string(), "b".to_string()])?;
//! let committed = node.execute(&tx, vec![Operation::put("k", b"v".to_vec())]).await?;
//! ```

#![allow(clippy::missing_errors_doc)]
#![allow(clippy::must_use_candidate)]

pub mod causal_store;
pub mod config;
pub mod coordinator;
pub mod error;
pub mod event_log;
pub mod failure_detector;
pub mod metrics;
pub mod network;
pub mod node;
pub mod participant;
pub mod recovery_log;
pub mod registry;
pub mod replication;
pub mod transaction;
pub mod tx_id;
pub mod vector_clock;

use std::time::{SystemTime, UNIX_EPOCH};

pub use causal_store::{
    ApplyOutcome, CausalEventStore, ConsistencyLevel, ReplicationUpdate, StoreEntry,
    SubscriptionId, UpdateListener,
};
pub use config::{
    FailureDetectorConfig, NodeConfig, PeerConfig, ReplicationConfig, StoreConfig,
    TransactionConfig,
};
pub use coordinator::{
    CoordinatorStats, CoordinatorStatsSnapshot, RecoveryStats, TransactionCoordinator,
};
pub use error::{CoreError, ProtocolError, Result};
pub use event_log::{CausalEvent, EventLog};
pub use failure_detector::{FailoverEvent, FailoverListener, FailureDetector, NodeStatus};
pub use metrics::{LatencySummary, PhaseLatency};
pub use network::{
    LinkFaults, MemoryNetwork, MemoryTransport, Message, MessageHandler, MessageKind, Payload,
    Transport,
};
pub use node::{MaintenanceReport, Node, NodeMetricsSnapshot, StartupReport};
pub use participant::{ResourceManager, StoreResources, TxParticipant};
pub use recovery_log::{
    DurableLog, FileLog, LogPhase, MemoryLog, RecoveryLog, RecoveryLogEntry, RecoveryState,
};
pub use registry::{RegistryStats, RegistryStatsSnapshot, TransactionRegistry};
pub use replication::{
    Replica, ReplicationManager, ReplicationReport, ReplicationSink, ReplicationStats,
    ReplicationStatsSnapshot, ReplicationStrategy, TransportSink,
};
pub use transaction::{Operation, Transaction, TransactionSummary, TxOutcome, TxState, Vote};
pub use tx_id::TxId;
pub use vector_clock::{ClockOrdering, LogicalClock, VectorClock};

/// Node identifier.
pub type NodeId = String;

/// Milliseconds since the Unix epoch.
pub type EpochMillis = u64;

pub(crate) fn now_epoch_millis() -> EpochMillis {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as EpochMillis
}

pub(crate) fn now_epoch_micros() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_micros() as u64
}
