// SPDX-License-Identifier: BSL-1.1 OR Apache-2.0
//! Causally ordered event history for one node.
//!
//! Local events tick the node's clock; remote events merge their clock into
//! it. [`EventLog::causal_order`] lists every event so that anything that
//! happened before another event comes first. Concurrent events are ordered
//! by clock weight, then origin, then id, so every node holding the same set
//! of events lists them identically.

use std::collections::HashSet;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use crate::error::{CoreError, Result};
use crate::vector_clock::{LogicalClock, VectorClock};
use crate::NodeId;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CausalEvent {
    pub event_id: String,
    pub origin: NodeId,
    pub data: Vec<u8>,
    pub clock: VectorClock,
}

impl CausalEvent {
    /// Sum of counters. Strictly grows along happened-before.
    fn weight(&self) -> u64 {
        self.clock.iter().fold(0u64, |acc, (_, c)| acc.saturating_add(c))
    }
}

#[derive(Default)]
struct Events {
    list: Vec<CausalEvent>,
    /// `(origin, event_id)` of every stored event.
    seen: HashSet<(NodeId, String)>,
}

pub struct EventLog {
    clock: LogicalClock,
    events: Mutex<Events>,
}

impl EventLog {
    pub fn new(node_id: impl Into<NodeId>) -> Self {
        Self {
            clock: LogicalClock::new(node_id),
            events: Mutex::new(Events::default()),
        }
    }

    pub fn node_id(&self) -> &str {
        self.clock.node_id()
    }

    /// Record a local event and return its clock, to be shipped with it.
    pub fn create_event(&self, event_id: impl Into<String>, data: Vec<u8>) -> Result<VectorClock> {
        let event_id = event_id.into();
        let origin = self.clock.node_id().to_string();
        let mut events = self.events.lock();
        if !events.seen.insert((origin.clone(), event_id.clone())) {
            return Err(CoreError::InvalidOperation(format!(
                "event {event_id} already recorded"
            )));
        }

        let clock = self.clock.tick();
        events.list.push(CausalEvent {
            event_id,
            origin,
            data,
            clock: clock.clone(),
        });
        Ok(clock)
    }

    /// Record an event created on `origin`. Returns `false` for a repeat
    /// delivery, which still merges the clock.
    pub fn receive_event(
        &self,
        event_id: impl Into<String>,
        origin: impl Into<NodeId>,
        data: Vec<u8>,
        clock: VectorClock,
    ) -> bool {
        let event_id = event_id.into();
        let origin = origin.into();
        self.clock.merge(&clock);

        let mut events = self.events.lock();
        if !events.seen.insert((origin.clone(), event_id.clone())) {
            tracing::debug!(event_id = %event_id, origin = %origin, "Duplicate event ignored");
            return false;
        }
        events.list.push(CausalEvent {
            event_id,
            origin,
            data,
            clock,
        });
        true
    }

    /// Every event, causes before effects.
    pub fn causal_order(&self) -> Vec<CausalEvent> {
        let mut list = self.events.lock().list.clone();
        list.sort_by(|a, b| {
            a.weight()
                .cmp(&b.weight())
                .then_with(|| a.origin.cmp(&b.origin))
                .then_with(|| a.event_id.cmp(&b.event_id))
        });
        list
    }

    pub fn vector_clock(&self) -> VectorClock {
        self.clock.snapshot()
    }

    pub fn len(&self) -> usize {
        self.events.lock().list.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
