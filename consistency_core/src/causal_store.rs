// SPDX-License-Identifier: BSL-1.1 OR Apache-2.0
//! Shared key-value store with vector-clock stamped entries.
//!
//! Local writes tick the node clock and produce a [`ReplicationUpdate`] for
//! peers. Remote updates always fold their clock into ours first, then are
//! applied according to the store's [`ConsistencyLevel`]:
//!
//! | Level | Rule |
//! |-------|------|
//! | Weak | last writer wins by timestamp, larger origin id breaks ties |
//! | Causal | apply only if the update happened after the current entry |
//! | Strong | held back until the quorum layer acknowledges it |
//!
//! ## Lock Ordering
//!
//! `entries` is taken before the clock lock. Listeners run after both are
//! released.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

use crate::error::{CoreError, Result};
use crate::vector_clock::{ClockOrdering, LogicalClock, VectorClock};
use crate::{now_epoch_micros, NodeId};

/// How remote updates are reconciled with local state.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConsistencyLevel {
    #[default]
    Weak,
    Causal,
    Strong,
}

/// A stored value and the metadata used to order writes to it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoreEntry {
    pub key: String,
    /// `None` marks a deletion.
    pub value: Option<Vec<u8>>,
    /// Wall-clock microseconds assigned by the writer.
    pub timestamp: u64,
    pub origin: NodeId,
    pub clock: VectorClock,
    /// Number of updates applied to this key on this node.
    pub version: u64,
}

impl StoreEntry {
    #[must_use]
    pub fn is_tombstone(&self) -> bool {
        self.value.is_none()
    }

    fn lww_key(&self) -> (u64, &str) {
        (self.timestamp, &self.origin)
    }
}

/// A write as shipped between nodes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReplicationUpdate {
    pub key: String,
    pub value: Option<Vec<u8>>,
    pub origin: NodeId,
    pub timestamp: u64,
    pub vector_clock: VectorClock,
}

impl ReplicationUpdate {
    fn lww_key(&self) -> (u64, &str) {
        (self.timestamp, &self.origin)
    }
}

impl From<&StoreEntry> for ReplicationUpdate {
    fn from(entry: &StoreEntry) -> Self {
        Self {
            key: entry.key.clone(),
            value: entry.value.clone(),
            origin: entry.origin.clone(),
            timestamp: entry.timestamp,
            vector_clock: entry.clock.clone(),
        }
    }
}

/// Result of [`CausalEventStore::apply_remote`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApplyOutcome {
    Applied,
    /// Same write already applied.
    Duplicate,
    /// Older than, or causally before, the current entry.
    Superseded,
    /// Strong level: waiting for the quorum layer.
    AwaitingQuorum,
}

/// Notified after an update to a subscribed key has been applied.
pub trait UpdateListener: Send + Sync {
    fn on_update(&self, entry: &StoreEntry);
}

impl<F> UpdateListener for F
where
    F: Fn(&StoreEntry) + Send + Sync,
{
    fn on_update(&self, entry: &StoreEntry) {
        self(entry)
    }
}

/// Handle returned by [`CausalEventStore::subscribe`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(u64);

type ListenerList = Vec<(SubscriptionId, Arc<dyn UpdateListener>)>;

/// Vector-clock ordered key-value store owned by one node.
pub struct CausalEventStore {
    node_id: NodeId,
    level: ConsistencyLevel,
    clock: LogicalClock,
    entries: RwLock<HashMap<String, StoreEntry>>,
    listeners: RwLock<HashMap<String, ListenerList>>,
    next_subscription: AtomicU64,
}

impl CausalEventStore {
    pub fn new(node_id: impl Into<NodeId>, level: ConsistencyLevel) -> Self {
        let node_id = node_id.into();
        Self {
            clock: LogicalClock::new(node_id.clone()),
            node_id,
            level,
            entries: RwLock::new(HashMap::new()),
            listeners: RwLock::new(HashMap::new()),
            next_subscription: AtomicU64::new(1),
        }
    }

    pub fn node_id(&self) -> &str {
        &self.node_id
    }

    pub fn consistency_level(&self) -> ConsistencyLevel {
        self.level
    }

    /// Current node clock.
    pub fn vector_clock(&self) -> VectorClock {
        self.clock.snapshot()
    }

    /// Write `value` locally and return the update to propagate.
    pub fn set(&self, key: impl Into<String>, value: impl Into<Vec<u8>>) -> ReplicationUpdate {
        self.write_local(key.into(), Some(value.into()))
    }

    /// Delete `key` locally. The tombstone replicates like any write.
    pub fn delete(&self, key: impl Into<String>) -> ReplicationUpdate {
        self.write_local(key.into(), None)
    }

    fn write_local(&self, key: String, value: Option<Vec<u8>>) -> ReplicationUpdate {
        let entry = {
            let mut entries = self.entries.write();
            let previous = entries.get(&key);
            let version = previous.map_or(0, |e| e.version) + 1;
            // Keep our own writes ordered even if the wall clock steps back.
            let timestamp = previous
                .map_or(0, |e| e.timestamp.saturating_add(1))
                .max(now_epoch_micros());
            let entry = StoreEntry {
                key: key.clone(),
                value,
                timestamp,
                origin: self.node_id.clone(),
                clock: self.clock.tick(),
                version,
            };
            entries.insert(key, entry.clone());
            entry
        };

        tracing::debug!(key = %entry.key, version = entry.version, "Local write");
        self.notify(&entry);
        ReplicationUpdate::from(&entry)
    }

    pub fn get(&self, key: &str) -> Option<Vec<u8>> {
        self.entries.read().get(key).and_then(|e| e.value.clone())
    }

    /// Full entry including tombstones.
    pub fn get_entry(&self, key: &str) -> Option<StoreEntry> {
        self.entries.read().get(key).cloned()
    }

    /// Live keys, sorted.
    pub fn keys(&self) -> Vec<String> {
        let mut keys: Vec<String> = self
            .entries
            .read()
            .values()
            .filter(|e| !e.is_tombstone())
            .map(|e| e.key.clone())
            .collect();
        keys.sort();
        keys
    }

    /// Integrate an update from a peer.
    pub fn apply_remote(&self, update: ReplicationUpdate) -> Result<ApplyOutcome> {
        self.clock.merge(&update.vector_clock);

        let applied = match self.level {
            ConsistencyLevel::Strong => {
                tracing::debug!(key = %update.key, origin = %update.origin, "Update awaiting quorum");
                return Ok(ApplyOutcome::AwaitingQuorum);
            },
            ConsistencyLevel::Weak => self.apply_lww(update),
            ConsistencyLevel::Causal => self.apply_causal(update)?,
        };

        Ok(match applied {
            Ok(entry) => {
                self.notify(&entry);
                ApplyOutcome::Applied
            },
            Err(outcome) => outcome,
        })
    }

    /// Apply an update the quorum layer has acknowledged. Used at the strong
    /// level; ordering between acknowledged writes is last-writer-wins.
    pub fn apply_quorum_acknowledged(&self, update: ReplicationUpdate) -> ApplyOutcome {
        self.clock.merge(&update.vector_clock);
        match self.apply_lww(update) {
            Ok(entry) => {
                self.notify(&entry);
                ApplyOutcome::Applied
            },
            Err(outcome) => outcome,
        }
    }

    fn apply_lww(&self, update: ReplicationUpdate) -> std::result::Result<StoreEntry, ApplyOutcome> {
        let mut entries = self.entries.write();
        if let Some(current) = entries.get(&update.key) {
            match update.lww_key().cmp(&current.lww_key()) {
                std::cmp::Ordering::Equal => return Err(ApplyOutcome::Duplicate),
                std::cmp::Ordering::Less => {
                    tracing::debug!(key = %update.key, origin = %update.origin, "Stale remote write dropped");
                    return Err(ApplyOutcome::Superseded);
                },
                std::cmp::Ordering::Greater => {},
            }
        }
        Ok(Self::install(&mut entries, update))
    }

    fn apply_causal(
        &self,
        update: ReplicationUpdate,
    ) -> Result<std::result::Result<StoreEntry, ApplyOutcome>> {
        let mut entries = self.entries.write();
        if let Some(current) = entries.get(&update.key) {
            match update.vector_clock.compare(&current.clock) {
                ClockOrdering::After => {},
                ClockOrdering::Equal => return Ok(Err(ApplyOutcome::Duplicate)),
                ClockOrdering::Before => return Ok(Err(ApplyOutcome::Superseded)),
                ClockOrdering::Concurrent => {
                    tracing::warn!(
                        key = %update.key,
                        local = %current.clock,
                        remote = %update.vector_clock,
                        "Concurrent update detected"
                    );
                    return Err(CoreError::ConsistencyConflict {
                        key: update.key,
                        local: current.clock.clone(),
                        remote: update.vector_clock,
                    });
                },
            }
        }
        Ok(Ok(Self::install(&mut entries, update)))
    }

    fn install(entries: &mut HashMap<String, StoreEntry>, update: ReplicationUpdate) -> StoreEntry {
        let version = entries.get(&update.key).map_or(0, |e| e.version) + 1;
        let entry = StoreEntry {
            key: update.key,
            value: update.value,
            timestamp: update.timestamp,
            origin: update.origin,
            clock: update.vector_clock,
            version,
        };
        entries.insert(entry.key.clone(), entry.clone());
        entry
    }

    /// Call `listener` after every applied update to `key`.
    pub fn subscribe(
        &self,
        key: impl Into<String>,
        listener: Arc<dyn UpdateListener>,
    ) -> SubscriptionId {
        let id = SubscriptionId(self.next_subscription.fetch_add(1, Ordering::Relaxed));
        self.listeners
            .write()
            .entry(key.into())
            .or_default()
            .push((id, listener));
        id
    }

    /// Returns false if `id` was not subscribed.
    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        let mut listeners = self.listeners.write();
        let mut removed = false;
        listeners.retain(|_, list| {
            let before = list.len();
            list.retain(|(sid, _)| *sid != id);
            removed |= list.len() != before;
            !list.is_empty()
        });
        removed
    }

    fn notify(&self, entry: &StoreEntry) {
        let listeners: Vec<Arc<dyn UpdateListener>> = match self.listeners.read().get(&entry.key) {
            Some(list) => list.iter().map(|(_, l)| Arc::clone(l)).collect(),
            None => return,
        };
        for listener in listeners {
            listener.on_update(entry);
        }
    }
}
