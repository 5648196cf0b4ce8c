// SPDX-License-Identifier: BSL-1.1 OR Apache-2.0
//! Vector clocks for causal ordering.
//!
//! [`VectorClock`] is a plain value: node id to counter, absent entries read
//! as zero. [`LogicalClock`] is the per-node owner of one, serialising ticks
//! and merges behind a lock so concurrent callers see a linear history.

use std::cmp::Ordering;
use std::collections::BTreeMap;
use std::fmt;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use crate::NodeId;

/// Partial-order relation between two clocks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ClockOrdering {
    /// Left happened before right.
    Before,
    /// Right happened before left.
    After,
    Equal,
    Concurrent,
}

/// Map of node id to event counter.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct VectorClock {
    counters: BTreeMap<NodeId, u64>,
}

impl VectorClock {
    pub fn new() -> Self {
        Self::default()
    }

    /// Counter for `node`, zero if never seen.
    #[must_use]
    pub fn get(&self, node: &str) -> u64 {
        self.counters.get(node).copied().unwrap_or(0)
    }

    /// Increment the counter for `node` and return its new value.
    pub fn tick(&mut self, node: &str) -> u64 {
        let counter = self.counters.entry(node.to_string()).or_insert(0);
        *counter += 1;
        *counter
    }

    /// Component-wise maximum over the union of node ids.
    pub fn merge(&mut self, other: &VectorClock) {
        for (node, &remote) in &other.counters {
            let local = self.counters.entry(node.clone()).or_insert(0);
            if remote > *local {
                *local = remote;
            }
        }
    }

    /// Strict causal precedence: every entry `<=` and at least one `<`.
    #[must_use]
    pub fn happened_before(&self, other: &VectorClock) -> bool {
        self.compare(other) == ClockOrdering::Before
    }

    /// Neither clock precedes the other and they differ.
    #[must_use]
    pub fn concurrent(&self, other: &VectorClock) -> bool {
        self.compare(other) == ClockOrdering::Concurrent
    }

    /// `self` is at or after `other` on every entry.
    #[must_use]
    pub fn dominates(&self, other: &VectorClock) -> bool {
        matches!(
            self.compare(other),
            ClockOrdering::After | ClockOrdering::Equal
        )
    }

    pub fn compare(&self, other: &VectorClock) -> ClockOrdering {
        let mut less = false;
        let mut greater = false;

        let nodes = self.counters.keys().chain(other.counters.keys());
        for node in nodes {
            match self.get(node).cmp(&other.get(node)) {
                Ordering::Less => less = true,
                Ordering::Greater => greater = true,
                Ordering::Equal => {},
            }
            if less && greater {
                return ClockOrdering::Concurrent;
            }
        }

        match (less, greater) {
            (true, false) => ClockOrdering::Before,
            (false, true) => ClockOrdering::After,
            (false, false) => ClockOrdering::Equal,
            (true, true) => ClockOrdering::Concurrent,
        }
    }

    /// Entries with a non-zero counter, in node-id order.
    pub fn iter(&self) -> impl Iterator<Item = (&NodeId, u64)> {
        self.counters
            .iter()
            .filter(|(_, &count)| count > 0)
            .map(|(node, &count)| (node, count))
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.iter().next().is_none()
    }
}

impl fmt::Display for VectorClock {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("{")?;
        for (i, (node, count)) in self.iter().enumerate() {
            if i > 0 {
                f.write_str(", ")?;
            }
            write!(f, "{node}:{count}")?;
        }
        f.write_str("}")
    }
}

impl<S: Into<NodeId>> FromIterator<(S, u64)> for VectorClock {
    fn from_iter<I: IntoIterator<Item = (S, u64)>>(iter: I) -> Self {
        Self {
            counters: iter.into_iter().map(|(n, c)| (n.into(), c)).collect(),
        }
    }
}

/// A node's own clock.
#[derive(Debug)]
pub struct LogicalClock {
    node_id: NodeId,
    clock: Mutex<VectorClock>,
}

impl LogicalClock {
    pub fn new(node_id: impl Into<NodeId>) -> Self {
        Self {
            node_id: node_id.into(),
            clock: Mutex::new(VectorClock::new()),
        }
    }

    pub fn node_id(&self) -> &str {
        &self.node_id
    }

    /// Record a local event and return the clock that stamps it.
    pub fn tick(&self) -> VectorClock {
        let mut clock = self.clock.lock();
        clock.tick(&self.node_id);
        clock.clone()
    }

    /// Fold a remote clock into ours without recording a local event.
    pub fn merge(&self, remote: &VectorClock) {
        self.clock.lock().merge(remote);
    }

    pub fn snapshot(&self) -> VectorClock {
        self.clock.lock().clone()
    }
}
