// SPDX-License-Identifier: BSL-1.1 OR Apache-2.0
//! Two-phase commit coordinator.
//!
//! ## Protocol
//!
//! ```text
//! begin ──► START logged
//! execute ─► PREPARE logged ─► Prepare sent ─► votes awaited (prepare_timeout)
//!            └► decision taken ─► COMMIT/ABORT logged ─► decision sent
//!               └► acks awaited, resent with backoff ─► END logged
//!                  └► parked if acks still missing, END once they arrive
//! ```
//!
//! A missing vote at the deadline, an ABORT vote, or a participant the
//! transport cannot reach all decide ABORT. Every phase is written to the
//! recovery log before the coordinator acts on it, and the log is the only
//! authority used when answering decision queries (presumed abort: no record
//! means ABORT). A decision without END is redelivered after a restart.
//!
//! ## Lock Ordering
//!
//! `pending` before `undelivered`. The recovery log has its own lock and may
//! be taken while holding either. No lock is held across a send.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tokio::sync::Notify;
use tokio::task::JoinSet;
use tokio::time::Instant;

use crate::config::TransactionConfig;
use crate::error::{ProtocolError, Result};
use crate::metrics::{LatencySummary, PhaseLatency};
use crate::network::{send_with_retry, Message, Payload, Transport};
use crate::recovery_log::{LogPhase, RecoveryLog, RecoveryLogEntry};
use crate::transaction::{Operation, Transaction, TxOutcome, TxState, Vote};
use crate::tx_id::TxId;
use crate::NodeId;

/// Counters for coordinated transactions.
#[derive(Debug, Default)]
pub struct CoordinatorStats {
    pub started: AtomicU64,
    pub committed: AtomicU64,
    pub aborted: AtomicU64,
    /// Phase 1 ended at the deadline with votes missing.
    pub timed_out: AtomicU64,
    /// Participants the transport refused during phase 1.
    pub unreachable: AtomicU64,
    /// Decisions left without every acknowledgement.
    pub parked: AtomicU64,
    /// Parked decisions given up after their time to live.
    pub expired: AtomicU64,
    pub prepare_latency: PhaseLatency,
    pub decision_latency: PhaseLatency,
}

impl CoordinatorStats {
    pub fn commit_rate(&self) -> f32 {
        let started = self.started.load(Ordering::Relaxed);
        if started == 0 {
            return 0.0;
        }
        self.committed.load(Ordering::Relaxed) as f32 / started as f32
    }

    pub fn snapshot(&self) -> CoordinatorStatsSnapshot {
        CoordinatorStatsSnapshot {
            started: self.started.load(Ordering::Relaxed),
            committed: self.committed.load(Ordering::Relaxed),
            aborted: self.aborted.load(Ordering::Relaxed),
            timed_out: self.timed_out.load(Ordering::Relaxed),
            unreachable: self.unreachable.load(Ordering::Relaxed),
            parked: self.parked.load(Ordering::Relaxed),
            expired: self.expired.load(Ordering::Relaxed),
            prepare_latency: self.prepare_latency.summary(),
            decision_latency: self.decision_latency.summary(),
            commit_rate: self.commit_rate(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CoordinatorStatsSnapshot {
    pub started: u64,
    pub committed: u64,
    pub aborted: u64,
    pub timed_out: u64,
    pub unreachable: u64,
    pub parked: u64,
    pub expired: u64,
    pub prepare_latency: LatencySummary,
    pub decision_latency: LatencySummary,
    pub commit_rate: f32,
}

/// What a restart sweep found and did.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RecoveryStats {
    /// Transactions with no decision, now logged as ABORT.
    pub presumed_aborted: usize,
    /// Already decided before the restart.
    pub committed: usize,
    pub aborted: usize,
    /// Logged decisions without END, sent again.
    pub redriven: usize,
    /// Decisions still waiting for acknowledgements after the sweep.
    pub awaiting_ack: usize,
}

struct PendingTx {
    participants: Vec<NodeId>,
    state: TxState,
    votes: HashMap<NodeId, Vote>,
    decision: Option<TxOutcome>,
    acks: HashSet<NodeId>,
    notify: Arc<Notify>,
    created: Instant,
}

impl PendingTx {
    fn new(participants: Vec<NodeId>) -> Self {
        Self {
            participants,
            state: TxState::Initial,
            votes: HashMap::new(),
            decision: None,
            acks: HashSet::new(),
            notify: Arc::new(Notify::new()),
            created: Instant::now(),
        }
    }

    /// Store a vote; a unanimous COMMIT during phase 1 moves to `Prepared`.
    fn note_vote(&mut self, from: &NodeId, vote: Vote) -> Option<Vote> {
        let previous = self.votes.insert(from.clone(), vote);
        if self.state == TxState::Preparing && self.vote_outcome() == Some(TxOutcome::Committed) {
            self.state = TxState::Prepared;
        }
        previous
    }

    /// Decision implied by the votes so far, if any.
    fn vote_outcome(&self) -> Option<TxOutcome> {
        if let Some(decision) = self.decision {
            return Some(decision);
        }
        if self.votes.values().any(|v| *v == Vote::Abort) {
            return Some(TxOutcome::Aborted);
        }
        let all_commit = self
            .participants
            .iter()
            .all(|p| self.votes.get(p) == Some(&Vote::Commit));
        all_commit.then_some(TxOutcome::Committed)
    }

    fn unacked(&self) -> Vec<NodeId> {
        self.participants
            .iter()
            .filter(|p| !self.acks.contains(*p))
            .cloned()
            .collect()
    }
}

/// A decision some participants have not acknowledged.
#[derive(Debug, Clone)]
struct ParkedDecision {
    outcome: TxOutcome,
    participants: Vec<NodeId>,
    acked: HashSet<NodeId>,
    parked_at: Instant,
}

impl ParkedDecision {
    fn new(outcome: TxOutcome, participants: Vec<NodeId>, acked: HashSet<NodeId>) -> Self {
        Self {
            outcome,
            participants,
            acked,
            parked_at: Instant::now(),
        }
    }

    fn unacked(&self) -> Vec<NodeId> {
        self.participants
            .iter()
            .filter(|p| !self.acked.contains(*p))
            .cloned()
            .collect()
    }
}

fn decision_payload(tx_id: &TxId, outcome: TxOutcome) -> Payload {
    match outcome {
        TxOutcome::Committed => Payload::Commit {
            tx_id: tx_id.clone(),
        },
        TxOutcome::Aborted => Payload::Abort {
            tx_id: tx_id.clone(),
        },
    }
}

/// Drives transactions this node coordinates.
pub struct TransactionCoordinator {
    node_id: NodeId,
    config: TransactionConfig,
    transport: Arc<dyn Transport>,
    log: Arc<RecoveryLog>,
    pending: RwLock<HashMap<TxId, PendingTx>>,
    undelivered: RwLock<HashMap<TxId, ParkedDecision>>,
    stats: CoordinatorStats,
}

impl TransactionCoordinator {
    pub fn new(
        config: TransactionConfig,
        transport: Arc<dyn Transport>,
        log: Arc<RecoveryLog>,
    ) -> Self {
        Self {
            node_id: transport.local_id().clone(),
            config,
            transport,
            log,
            pending: RwLock::new(HashMap::new()),
            undelivered: RwLock::new(HashMap::new()),
            stats: CoordinatorStats::default(),
        }
    }

    pub fn node_id(&self) -> &NodeId {
        &self.node_id
    }

    pub fn stats(&self) -> &CoordinatorStats {
        &self.stats
    }

    pub fn log(&self) -> &Arc<RecoveryLog> {
        &self.log
    }

    /// Start a transaction over `participants` and log START.
    pub fn begin(&self, participants: &[NodeId]) -> Result<Transaction> {
        let tx = Transaction::new(TxId::generate(), self.node_id.clone(), participants)?;

        self.log.append(
            RecoveryLogEntry::new(tx.id.clone(), LogPhase::Start, &self.node_id)
                .with_peers(tx.participants().to_vec()),
        )?;
        self.pending
            .write()
            .insert(tx.id.clone(), PendingTx::new(tx.participants().to_vec()));
        self.stats.started.fetch_add(1, Ordering::Relaxed);

        tracing::info!(
            tx_id = %tx.id,
            participants = ?tx.participants(),
            "Transaction started"
        );
        Ok(tx)
    }

    /// Run both phases for `tx_id` and return the decision.
    ///
    /// Returns once the decision is durable and every participant has
    /// acknowledged it, or the phase-2 retry budget is spent. In the second
    /// case the decision is parked for [`Self::retry_pending_decisions`].
    pub async fn execute(&self, tx_id: &TxId, operations: Vec<Operation>) -> Result<TxOutcome> {
        let (participants, notify) = {
            let mut pending = self.pending.write();
            let tx = pending
                .get_mut(tx_id)
                .ok_or_else(|| ProtocolError::UnknownTransaction(tx_id.clone()))?;
            if tx.decision.is_some() || tx.state != TxState::Initial {
                return Err(ProtocolError::AlreadyDecided(tx_id.clone()).into());
            }
            tx.state = TxState::Preparing;
            (tx.participants.clone(), Arc::clone(&tx.notify))
        };

        let prepare_start = Instant::now();
        if let Err(e) = self.log.append(
            RecoveryLogEntry::new(tx_id.clone(), LogPhase::Prepare, &self.node_id)
                .with_peers(participants.clone())
                .with_operations(operations.clone()),
        ) {
            tracing::error!(tx_id = %tx_id, error = %e, "Failed to log prepare");
            self.set_decision(tx_id, TxOutcome::Aborted);
            self.finish(tx_id, TxOutcome::Aborted, true);
            return Err(e);
        }

        let prepare = Payload::Prepare {
            tx_id: tx_id.clone(),
            operations,
        };
        for unreachable in self.send_all(&participants, &prepare).await {
            self.stats.unreachable.fetch_add(1, Ordering::Relaxed);
            self.record_implicit_abort(tx_id, &unreachable);
        }

        let outcome = self.collect_votes(tx_id, &notify).await;
        let outcome = self.set_decision(tx_id, outcome);
        self.stats.prepare_latency.observe_since(prepare_start);

        let outcome = self.log_decision(tx_id, outcome, &participants);

        let commit_start = Instant::now();
        let acknowledged = self
            .deliver_decision(tx_id, outcome, &participants, &notify)
            .await;
        self.stats.decision_latency.observe_since(commit_start);

        self.finish(tx_id, outcome, acknowledged);
        Ok(outcome)
    }

    async fn collect_votes(&self, tx_id: &TxId, notify: &Notify) -> TxOutcome {
        let deadline = Instant::now() + self.config.prepare_timeout();
        loop {
            if let Some(outcome) = self.pending.read().get(tx_id).and_then(PendingTx::vote_outcome) {
                if outcome == TxOutcome::Aborted {
                    tracing::debug!(tx_id = %tx_id, "Abort vote received, short-circuiting");
                }
                return outcome;
            }

            if tokio::time::timeout_at(deadline, notify.notified())
                .await
                .is_err()
            {
                let missing: Vec<NodeId> = self
                    .pending
                    .read()
                    .get(tx_id)
                    .map(|tx| {
                        tx.participants
                            .iter()
                            .filter(|p| !tx.votes.contains_key(*p))
                            .cloned()
                            .collect()
                    })
                    .unwrap_or_default();
                tracing::warn!(
                    tx_id = %tx_id,
                    missing = ?missing,
                    "Prepare timed out, missing votes count as abort"
                );
                self.stats.timed_out.fetch_add(1, Ordering::Relaxed);
                return TxOutcome::Aborted;
            }
        }
    }

    /// Record `outcome` unless a decision already exists; returns the one in force.
    fn set_decision(&self, tx_id: &TxId, outcome: TxOutcome) -> TxOutcome {
        let mut pending = self.pending.write();
        let Some(tx) = pending.get_mut(tx_id) else {
            return outcome;
        };
        let decided = *tx.decision.get_or_insert(outcome);
        tx.state = match decided {
            TxOutcome::Committed => TxState::Committing,
            TxOutcome::Aborted => TxState::Aborting,
        };
        decided
    }

    /// Make the decision durable. A COMMIT that cannot be logged becomes an
    /// ABORT, which needs no record under presumed abort.
    fn log_decision(&self, tx_id: &TxId, outcome: TxOutcome, participants: &[NodeId]) -> TxOutcome {
        let entry = |phase: LogPhase| {
            RecoveryLogEntry::new(tx_id.clone(), phase, &self.node_id)
                .with_peers(participants.to_vec())
        };

        match self.log.append(entry(outcome.into())) {
            Ok(()) => outcome,
            Err(e) if outcome == TxOutcome::Committed => {
                tracing::error!(tx_id = %tx_id, error = %e, "Failed to log commit, aborting instead");
                if let Some(tx) = self.pending.write().get_mut(tx_id) {
                    tx.decision = Some(TxOutcome::Aborted);
                    tx.state = TxState::Aborting;
                }
                if let Err(e) = self.log.append(entry(LogPhase::Abort)) {
                    tracing::error!(tx_id = %tx_id, error = %e, "Failed to log abort");
                }
                TxOutcome::Aborted
            },
            Err(e) => {
                tracing::error!(tx_id = %tx_id, error = %e, "Failed to log abort");
                outcome
            },
        }
    }

    /// Send the decision until acknowledged or out of retries. Returns true
    /// if every participant acknowledged.
    async fn deliver_decision(
        &self,
        tx_id: &TxId,
        outcome: TxOutcome,
        participants: &[NodeId],
        notify: &Notify,
    ) -> bool {
        let payload = decision_payload(tx_id, outcome);
        let unacked = || {
            self.pending
                .read()
                .get(tx_id)
                .map_or_else(|| participants.to_vec(), PendingTx::unacked)
        };

        for round in 0..=self.config.max_decision_retries {
            let targets = unacked();
            if targets.is_empty() {
                return true;
            }
            if round > 0 {
                tracing::debug!(
                    tx_id = %tx_id,
                    round = round,
                    unacked = ?targets,
                    "Resending decision"
                );
                tokio::time::sleep(self.config.backoff(round)).await;
            }
            self.send_all(&targets, &payload).await;

            let deadline = Instant::now() + self.config.ack_timeout();
            loop {
                if unacked().is_empty() {
                    return true;
                }
                if tokio::time::timeout_at(deadline, notify.notified())
                    .await
                    .is_err()
                {
                    break;
                }
            }
        }
        unacked().is_empty()
    }

    fn finish(&self, tx_id: &TxId, outcome: TxOutcome, acknowledged: bool) {
        if acknowledged && self.log.terminal_phase(tx_id).is_some() {
            self.log_end(tx_id);
        }
        {
            let mut pending = self.pending.write();
            if let Some(tx) = pending.remove(tx_id) {
                if !acknowledged {
                    let parked = ParkedDecision::new(outcome, tx.participants, tx.acks);
                    tracing::warn!(
                        tx_id = %tx_id,
                        outcome = ?outcome,
                        unacked = ?parked.unacked(),
                        "Decision not acknowledged by every participant, parking for redelivery"
                    );
                    self.undelivered.write().insert(tx_id.clone(), parked);
                    self.stats.parked.fetch_add(1, Ordering::Relaxed);
                }
            }
        }

        match outcome {
            TxOutcome::Committed => {
                self.stats.committed.fetch_add(1, Ordering::Relaxed);
                tracing::info!(tx_id = %tx_id, "Transaction committed");
            },
            TxOutcome::Aborted => {
                self.stats.aborted.fetch_add(1, Ordering::Relaxed);
                tracing::info!(tx_id = %tx_id, "Transaction aborted");
            },
        }
    }

    fn log_end(&self, tx_id: &TxId) {
        if let Err(e) = self
            .log
            .append(RecoveryLogEntry::new(tx_id.clone(), LogPhase::End, &self.node_id))
        {
            tracing::warn!(tx_id = %tx_id, error = %e, "Failed to log end");
        }
    }

    /// Send `payload` to every target concurrently. Returns the targets the
    /// transport refused on every attempt.
    async fn send_all(&self, targets: &[NodeId], payload: &Payload) -> Vec<NodeId> {
        let mut sends = JoinSet::new();
        for target in targets {
            let transport = Arc::clone(&self.transport);
            let config = self.config.clone();
            let target = target.clone();
            let msg = Message::request(self.node_id.clone(), target.clone(), payload.clone());
            sends.spawn(async move {
                let result = send_with_retry(
                    transport.as_ref(),
                    &target,
                    msg,
                    config.max_send_attempts,
                    |attempt| config.backoff(attempt),
                )
                .await;
                (target, result)
            });
        }

        let mut failed = Vec::new();
        while let Some(joined) = sends.join_next().await {
            match joined {
                Ok((_, Ok(()))) => {},
                Ok((target, Err(e))) => {
                    tracing::warn!(peer = %target, error = %e, payload = payload.name(), "Peer unreachable");
                    failed.push(target);
                },
                Err(e) => tracing::warn!(error = %e, "Send task failed"),
            }
        }
        failed
    }

    fn record_implicit_abort(&self, tx_id: &TxId, participant: &NodeId) {
        let notify = {
            let mut pending = self.pending.write();
            let Some(tx) = pending.get_mut(tx_id) else {
                return;
            };
            if !tx.votes.contains_key(participant) {
                tx.note_vote(participant, Vote::Abort);
            }
            Arc::clone(&tx.notify)
        };
        notify.notify_one();
    }

    /// Count a participant's vote. Repeats overwrite while undecided.
    pub fn record_vote(&self, from: &NodeId, tx_id: &TxId, vote: Vote) -> Result<()> {
        let notify = {
            let mut pending = self.pending.write();
            let Some(tx) = pending.get_mut(tx_id) else {
                if self.log.terminal_phase(tx_id).is_some() {
                    return Err(ProtocolError::VoteAfterDecision {
                        tx_id: tx_id.clone(),
                        participant: from.clone(),
                    }
                    .into());
                }
                return Err(ProtocolError::UnknownTransaction(tx_id.clone()).into());
            };
            if !tx.participants.contains(from) {
                return Err(ProtocolError::NotAParticipant {
                    tx_id: tx_id.clone(),
                    node: from.clone(),
                }
                .into());
            }
            if tx.decision.is_some() {
                return Err(ProtocolError::VoteAfterDecision {
                    tx_id: tx_id.clone(),
                    participant: from.clone(),
                }
                .into());
            }
            if let Some(previous) = tx.note_vote(from, vote) {
                if previous != vote {
                    tracing::debug!(tx_id = %tx_id, participant = %from, vote = ?vote, "Vote replaced");
                }
            }
            Arc::clone(&tx.notify)
        };

        tracing::debug!(tx_id = %tx_id, participant = %from, vote = ?vote, "Vote recorded");
        notify.notify_one();
        Ok(())
    }

    /// Count a participant's acknowledgement of the decision.
    pub fn record_ack(&self, from: &NodeId, tx_id: &TxId, outcome: TxOutcome) {
        {
            let mut pending = self.pending.write();
            if let Some(tx) = pending.get_mut(tx_id) {
                if tx.decision == Some(outcome) && tx.participants.contains(from) {
                    tx.acks.insert(from.clone());
                    tx.notify.notify_one();
                }
                return;
            }
        }

        {
            let mut undelivered = self.undelivered.write();
            let Some(parked) = undelivered.get_mut(tx_id) else {
                return;
            };
            if parked.outcome != outcome || !parked.participants.contains(from) {
                return;
            }
            parked.acked.insert(from.clone());
            if !parked.unacked().is_empty() {
                return;
            }
            undelivered.remove(tx_id);
        }
        self.log_end(tx_id);
        tracing::info!(tx_id = %tx_id, "Parked decision fully acknowledged");
    }

    /// Abort a transaction whose commit decision has not been taken.
    pub fn abort(&self, tx_id: &TxId) -> Result<()> {
        let (was_idle, participants, notify) = {
            let mut pending = self.pending.write();
            let Some(tx) = pending.get_mut(tx_id) else {
                return match self.log.terminal_phase(tx_id) {
                    Some(LogPhase::Abort) => Ok(()),
                    Some(_) => Err(ProtocolError::AlreadyDecided(tx_id.clone()).into()),
                    None => Err(ProtocolError::UnknownTransaction(tx_id.clone()).into()),
                };
            };
            match tx.decision {
                Some(TxOutcome::Committed) => {
                    return Err(ProtocolError::AlreadyDecided(tx_id.clone()).into());
                },
                Some(TxOutcome::Aborted) => return Ok(()),
                None => {},
            }

            let was_idle = tx.state == TxState::Initial;
            tx.decision = Some(TxOutcome::Aborted);
            tx.state = TxState::Aborting;
            let participants = tx.participants.clone();
            let notify = Arc::clone(&tx.notify);
            if was_idle {
                pending.remove(tx_id);
            }
            (was_idle, participants, notify)
        };

        if was_idle {
            // Phase 1 never ran, so no participant holds state for it.
            self.log.append(
                RecoveryLogEntry::new(tx_id.clone(), LogPhase::Abort, &self.node_id)
                    .with_peers(participants),
            )?;
            self.stats.aborted.fetch_add(1, Ordering::Relaxed);
            tracing::info!(tx_id = %tx_id, "Transaction aborted before prepare");
        } else {
            tracing::info!(tx_id = %tx_id, "Abort requested during prepare");
            notify.notify_one();
        }
        Ok(())
    }

    /// Abort every transaction begun more than `max_age` ago and never
    /// executed. Returns the aborted ids.
    pub fn expire_idle(&self, max_age: Duration) -> Vec<TxId> {
        let stale: Vec<TxId> = self
            .pending
            .read()
            .iter()
            .filter(|(_, tx)| tx.state == TxState::Initial && tx.created.elapsed() >= max_age)
            .map(|(id, _)| id.clone())
            .collect();

        let mut expired = Vec::with_capacity(stale.len());
        for tx_id in stale {
            match self.abort(&tx_id) {
                Ok(()) => {
                    tracing::warn!(tx_id = %tx_id, "Idle transaction expired, aborted");
                    expired.push(tx_id);
                },
                Err(e) => tracing::debug!(tx_id = %tx_id, error = %e, "Idle expiry skipped"),
            }
        }
        expired
    }

    /// Lifecycle state of a transaction still in flight.
    pub fn tx_state(&self, tx_id: &TxId) -> Option<TxState> {
        self.pending.read().get(tx_id).map(|tx| tx.state)
    }

    /// Decision for an in-doubt participant: the logged outcome, `None`
    /// while still deciding, ABORT when nothing was ever logged.
    pub fn answer_decision_query(&self, tx_id: &TxId) -> Option<TxOutcome> {
        if let Some(phase) = self.log.terminal_phase(tx_id) {
            return phase.outcome();
        }
        if self.pending.read().contains_key(tx_id) {
            return None;
        }
        // Re-read: the transaction may have been decided and retired meanwhile.
        Some(
            self.log
                .terminal_phase(tx_id)
                .and_then(LogPhase::outcome)
                .unwrap_or(TxOutcome::Aborted),
        )
    }

    /// Restart sweep: every logged transaction without a decision is aborted
    /// and the abort is sent to its participants. Decisions logged after
    /// PREPARE but never followed by END are sent again.
    pub async fn recover(&self) -> Result<RecoveryStats> {
        let state = self.log.recovery_state();
        let mut stats = RecoveryStats {
            committed: state.committed.len(),
            aborted: state.aborted.len(),
            ..RecoveryStats::default()
        };

        for tx_id in state.started.iter().chain(state.in_doubt.iter()) {
            if self.pending.read().contains_key(tx_id) {
                continue;
            }
            let participants = self
                .log
                .entries_for(tx_id)
                .into_iter()
                .find(|e| e.phase == LogPhase::Start)
                .map(|e| e.peers)
                .unwrap_or_default();

            self.log.append(
                RecoveryLogEntry::new(tx_id.clone(), LogPhase::Abort, &self.node_id)
                    .with_peers(participants.clone()),
            )?;
            tracing::warn!(tx_id = %tx_id, "Undecided transaction found on restart, aborting");
            stats.presumed_aborted += 1;

            if !participants.is_empty() {
                self.undelivered.write().insert(
                    tx_id.clone(),
                    ParkedDecision::new(TxOutcome::Aborted, participants, HashSet::new()),
                );
            }
        }

        for tx_id in &state.unacknowledged {
            if self.pending.read().contains_key(tx_id) || self.undelivered.read().contains_key(tx_id) {
                continue;
            }
            let entries = self.log.entries_for(tx_id);
            let Some(outcome) = entries.iter().find_map(|e| e.phase.outcome()) else {
                continue;
            };
            let participants = entries
                .into_iter()
                .find(|e| e.phase == LogPhase::Prepare)
                .map(|e| e.peers)
                .unwrap_or_default();
            if participants.is_empty() {
                continue;
            }

            tracing::info!(tx_id = %tx_id, outcome = ?outcome, "Redelivering unacknowledged decision");
            self.undelivered.write().insert(
                tx_id.clone(),
                ParkedDecision::new(outcome, participants, HashSet::new()),
            );
            stats.redriven += 1;
        }

        stats.awaiting_ack = self.retry_pending_decisions().await;
        tracing::info!(
            presumed_aborted = stats.presumed_aborted,
            committed = stats.committed,
            aborted = stats.aborted,
            redriven = stats.redriven,
            "Coordinator recovery complete"
        );
        Ok(stats)
    }

    /// Resend every parked decision to the participants that have not
    /// acknowledged it. Decisions parked longer than the configured time to
    /// live are dropped first. Returns how many decisions are still parked.
    pub async fn retry_pending_decisions(&self) -> usize {
        let ttl = self.config.parked_decision_ttl();
        self.undelivered.write().retain(|tx_id, parked| {
            let keep = parked.parked_at.elapsed() < ttl;
            if !keep {
                tracing::warn!(
                    tx_id = %tx_id,
                    unacked = ?parked.unacked(),
                    "Giving up on parked decision"
                );
                self.stats.expired.fetch_add(1, Ordering::Relaxed);
            }
            keep
        });

        let work: Vec<(TxId, TxOutcome, Vec<NodeId>)> = self
            .undelivered
            .read()
            .iter()
            .map(|(id, parked)| (id.clone(), parked.outcome, parked.unacked()))
            .collect();

        for (tx_id, outcome, targets) in work {
            self.send_all(&targets, &decision_payload(&tx_id, outcome))
                .await;
        }
        self.undelivered.read().len()
    }

    /// Ids of parked decisions.
    pub fn pending_decisions(&self) -> Vec<TxId> {
        self.undelivered.read().keys().cloned().collect()
    }

    /// Ids started here and not yet finished.
    pub fn in_flight(&self) -> Vec<TxId> {
        self.pending.read().keys().cloned().collect()
    }

    /// Coordinator-side handling of an inbound message. Returns the reply to
    /// send back, if any.
    pub fn handle(&self, msg: &Message) -> Option<Message> {
        match &msg.payload {
            Payload::Vote { tx_id, vote } => {
                if let Err(e) = self.record_vote(&msg.sender, tx_id, *vote) {
                    tracing::debug!(tx_id = %tx_id, from = %msg.sender, error = %e, "Vote rejected");
                }
                None
            },
            Payload::Ack { tx_id, outcome } => {
                self.record_ack(&msg.sender, tx_id, *outcome);
                None
            },
            Payload::DecisionQuery { tx_id } => Some(Message::response(
                msg,
                self.node_id.clone(),
                Payload::DecisionReply {
                    tx_id: tx_id.clone(),
                    outcome: self.answer_decision_query(tx_id),
                },
            )),
            _ => None,
        }
    }
}
