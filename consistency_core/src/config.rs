// SPDX-License-Identifier: BSL-1.1 OR Apache-2.0
//! Node configuration.
//!
//! Plain serde structs with defaults and `with_*` builders. Reading them from
//! a file or the command line is left to the embedding process.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::causal_store::ConsistencyLevel;
use crate::error::{CoreError, Result};
use crate::replication::ReplicationStrategy;
use crate::NodeId;

/// A peer this node monitors and may fail over to.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeerConfig {
    pub node_id: NodeId,
    /// Lower wins when choosing a replacement.
    #[serde(default = "default_priority")]
    pub priority: u32,
}

fn default_priority() -> u32 {
    1
}

impl PeerConfig {
    pub fn new(node_id: impl Into<NodeId>) -> Self {
        Self {
            node_id: node_id.into(),
            priority: default_priority(),
        }
    }

    #[must_use]
    pub fn with_priority(mut self, priority: u32) -> Self {
        self.priority = priority;
        self
    }
}

/// Two-phase commit timing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TransactionConfig {
    /// How long phase 1 waits for votes.
    pub prepare_timeout_ms: u64,
    /// How long each phase-2 round waits for acknowledgements.
    pub ack_timeout_ms: u64,
    /// Phase-2 rounds after the first before a decision is parked.
    pub max_decision_retries: u32,
    /// Send attempts per message before the peer is treated as unreachable.
    pub max_send_attempts: u32,
    pub retry_backoff_ms: u64,
    pub retry_backoff_cap_ms: u64,
    /// Finished transactions kept in the registry history.
    pub history_capacity: usize,
    /// Period of the node's background redelivery and cleanup sweep.
    pub maintenance_interval_ms: u64,
    /// Transactions begun but never executed are aborted after this long.
    pub idle_timeout_ms: u64,
    /// Parked decisions are given up after this long; participants can
    /// still learn the outcome with a decision query.
    pub parked_decision_ttl_ms: u64,
}

impl Default for TransactionConfig {
    fn default() -> Self {
        Self {
            prepare_timeout_ms: 5000,
            ack_timeout_ms: 1000,
            max_decision_retries: 5,
            max_send_attempts: 3,
            retry_backoff_ms: 50,
            retry_backoff_cap_ms: 2000,
            history_capacity: 1000,
            maintenance_interval_ms: 1000,
            idle_timeout_ms: 60_000,
            parked_decision_ttl_ms: 600_000,
        }
    }
}

impl TransactionConfig {
    #[must_use]
    pub fn with_prepare_timeout_ms(mut self, ms: u64) -> Self {
        self.prepare_timeout_ms = ms;
        self
    }

    #[must_use]
    pub fn with_ack_timeout_ms(mut self, ms: u64) -> Self {
        self.ack_timeout_ms = ms;
        self
    }

    #[must_use]
    pub fn with_max_decision_retries(mut self, retries: u32) -> Self {
        self.max_decision_retries = retries;
        self
    }

    #[must_use]
    pub fn with_retry_backoff_ms(mut self, ms: u64) -> Self {
        self.retry_backoff_ms = ms;
        self
    }

    #[must_use]
    pub fn with_history_capacity(mut self, capacity: usize) -> Self {
        self.history_capacity = capacity;
        self
    }

    #[must_use]
    pub fn with_maintenance_interval_ms(mut self, ms: u64) -> Self {
        self.maintenance_interval_ms = ms;
        self
    }

    #[must_use]
    pub fn with_idle_timeout_ms(mut self, ms: u64) -> Self {
        self.idle_timeout_ms = ms;
        self
    }

    #[must_use]
    pub fn with_parked_decision_ttl_ms(mut self, ms: u64) -> Self {
        self.parked_decision_ttl_ms = ms;
        self
    }

    pub fn prepare_timeout(&self) -> Duration {
        Duration::from_millis(self.prepare_timeout_ms)
    }

    pub fn ack_timeout(&self) -> Duration {
        Duration::from_millis(self.ack_timeout_ms)
    }

    pub fn maintenance_interval(&self) -> Duration {
        Duration::from_millis(self.maintenance_interval_ms)
    }

    pub fn idle_timeout(&self) -> Duration {
        Duration::from_millis(self.idle_timeout_ms)
    }

    pub fn parked_decision_ttl(&self) -> Duration {
        Duration::from_millis(self.parked_decision_ttl_ms)
    }

    /// Backoff before retry number `attempt` (1-based), doubling up to the cap.
    pub fn backoff(&self, attempt: u32) -> Duration {
        let factor = 1u64 << attempt.saturating_sub(1).min(16);
        let ms = self
            .retry_backoff_ms
            .saturating_mul(factor)
            .min(self.retry_backoff_cap_ms);
        Duration::from_millis(ms)
    }

    pub fn validate(&self) -> Result<()> {
        if self.prepare_timeout_ms == 0 {
            return Err(CoreError::Config("prepare_timeout_ms must be > 0".into()));
        }
        if self.ack_timeout_ms == 0 {
            return Err(CoreError::Config("ack_timeout_ms must be > 0".into()));
        }
        if self.max_send_attempts == 0 {
            return Err(CoreError::Config("max_send_attempts must be > 0".into()));
        }
        if self.history_capacity == 0 {
            return Err(CoreError::Config("history_capacity must be > 0".into()));
        }
        if self.maintenance_interval_ms == 0 {
            return Err(CoreError::Config("maintenance_interval_ms must be > 0".into()));
        }
        if self.idle_timeout_ms == 0 || self.parked_decision_ttl_ms == 0 {
            return Err(CoreError::Config(
                "idle_timeout_ms and parked_decision_ttl_ms must be > 0".into(),
            ));
        }
        Ok(())
    }
}

/// Heartbeat failure detection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct FailureDetectorConfig {
    pub heartbeat_interval_ms: u64,
    /// Silence longer than this marks a peer failed.
    pub failure_timeout_ms: u64,
}

impl Default for FailureDetectorConfig {
    fn default() -> Self {
        Self {
            heartbeat_interval_ms: 1000,
            failure_timeout_ms: 3000,
        }
    }
}

impl FailureDetectorConfig {
    #[must_use]
    pub fn with_heartbeat_interval_ms(mut self, ms: u64) -> Self {
        self.heartbeat_interval_ms = ms;
        self
    }

    #[must_use]
    pub fn with_failure_timeout_ms(mut self, ms: u64) -> Self {
        self.failure_timeout_ms = ms;
        self
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.heartbeat_interval_ms)
    }

    pub fn failure_timeout(&self) -> Duration {
        Duration::from_millis(self.failure_timeout_ms)
    }

    pub fn validate(&self) -> Result<()> {
        if self.heartbeat_interval_ms == 0 {
            return Err(CoreError::Config("heartbeat_interval_ms must be > 0".into()));
        }
        if self.failure_timeout_ms <= self.heartbeat_interval_ms {
            return Err(CoreError::Config(format!(
                "failure_timeout_ms ({}) must exceed heartbeat_interval_ms ({})",
                self.failure_timeout_ms, self.heartbeat_interval_ms
            )));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    pub consistency_level: ConsistencyLevel,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReplicationConfig {
    pub strategy: ReplicationStrategy,
    /// Replicas silent for longer than this are marked inactive.
    pub replica_timeout_ms: u64,
    pub health_check_interval_ms: u64,
}

impl Default for ReplicationConfig {
    fn default() -> Self {
        Self {
            strategy: ReplicationStrategy::default(),
            replica_timeout_ms: 3000,
            health_check_interval_ms: 1000,
        }
    }
}

impl ReplicationConfig {
    pub fn replica_timeout(&self) -> Duration {
        Duration::from_millis(self.replica_timeout_ms)
    }

    pub fn health_check_interval(&self) -> Duration {
        Duration::from_millis(self.health_check_interval_ms)
    }
}

/// Everything one node needs.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeConfig {
    pub node_id: NodeId,
    #[serde(default)]
    pub peers: Vec<PeerConfig>,
    #[serde(default)]
    pub transaction: TransactionConfig,
    #[serde(default)]
    pub failure: FailureDetectorConfig,
    #[serde(default)]
    pub store: StoreConfig,
    #[serde(default)]
    pub replication: ReplicationConfig,
}

impl NodeConfig {
    pub fn new(node_id: impl Into<NodeId>) -> Self {
        Self {
            node_id: node_id.into(),
            peers: Vec::new(),
            transaction: TransactionConfig::default(),
            failure: FailureDetectorConfig::default(),
            store: StoreConfig::default(),
            replication: ReplicationConfig::default(),
        }
    }

    #[must_use]
    pub fn with_peer(mut self, peer: PeerConfig) -> Self {
        self.peers.push(peer);
        self
    }

    #[must_use]
    pub fn with_transaction(mut self, config: TransactionConfig) -> Self {
        self.transaction = config;
        self
    }

    #[must_use]
    pub fn with_failure_detector(mut self, config: FailureDetectorConfig) -> Self {
        self.failure = config;
        self
    }

    #[must_use]
    pub fn with_consistency_level(mut self, level: ConsistencyLevel) -> Self {
        self.store.consistency_level = level;
        self
    }

    #[must_use]
    pub fn with_replication(mut self, config: ReplicationConfig) -> Self {
        self.replication = config;
        self
    }

    pub fn validate(&self) -> Result<()> {
        if self.node_id.is_empty() {
            return Err(CoreError::Config("node_id must not be empty".into()));
        }
        if self.peers.iter().any(|p| p.node_id == self.node_id) {
            return Err(CoreError::Config(format!(
                "node {} lists itself as a peer",
                self.node_id
            )));
        }
        self.transaction.validate()?;
        self.failure.validate()?;
        if self.replication.replica_timeout_ms == 0 {
            return Err(CoreError::Config("replica_timeout_ms must be > 0".into()));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = NodeConfig::new("n1");
        assert_eq!(config.transaction.prepare_timeout(), Duration::from_secs(5));
        assert_eq!(config.transaction.history_capacity, 1000);
        assert_eq!(config.transaction.maintenance_interval(), Duration::from_secs(1));
        assert_eq!(config.transaction.idle_timeout(), Duration::from_secs(60));
        assert_eq!(config.failure.heartbeat_interval(), Duration::from_secs(1));
        assert_eq!(config.failure.failure_timeout(), Duration::from_secs(3));
        assert_eq!(config.store.consistency_level, ConsistencyLevel::Weak);
        assert_eq!(config.replication.strategy, ReplicationStrategy::ActivePassive);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_builders() {
        let config = NodeConfig::new("n1")
            .with_peer(PeerConfig::new("n2").with_priority(0))
            .with_peer(PeerConfig::new("n3"))
            .with_consistency_level(ConsistencyLevel::Causal)
            .with_transaction(TransactionConfig::default().with_prepare_timeout_ms(200));
        assert_eq!(config.peers.len(), 2);
        assert_eq!(config.peers[0].priority, 0);
        assert_eq!(config.peers[1].priority, 1);
        assert_eq!(config.transaction.prepare_timeout_ms, 200);
        assert_eq!(config.store.consistency_level, ConsistencyLevel::Causal);
    }

    #[test]
    fn test_backoff_doubles_and_caps() {
        let config = TransactionConfig::default();
        assert_eq!(config.backoff(1), Duration::from_millis(50));
        assert_eq!(config.backoff(2), Duration::from_millis(100));
        assert_eq!(config.backoff(3), Duration::from_millis(200));
        assert_eq!(config.backoff(20), Duration::from_millis(2000));
    }

    #[test]
    fn test_self_peer_rejected() {
        let config = NodeConfig::new("n1").with_peer(PeerConfig::new("n1"));
        assert!(matches!(config.validate(), Err(CoreError::Config(_))));
    }

    #[test]
    fn test_failure_timeout_must_exceed_interval() {
        let config = FailureDetectorConfig::default()
            .with_heartbeat_interval_ms(500)
            .with_failure_timeout_ms(500);
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_zero_prepare_timeout_rejected() {
        let config = TransactionConfig::default().with_prepare_timeout_ms(0);
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_zero_maintenance_interval_rejected() {
        let config = TransactionConfig::default().with_maintenance_interval_ms(0);
        assert!(config.validate().is_err());
        let config = TransactionConfig::default().with_parked_decision_ttl_ms(0);
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_bincode_roundtrip() {
        let config = NodeConfig::new("n1").with_peer(PeerConfig::new("n2"));
        let bytes = bincode::serialize(&config).unwrap();
        let back: NodeConfig = bincode::deserialize(&bytes).unwrap();
        assert_eq!(config, back);
    }
}
