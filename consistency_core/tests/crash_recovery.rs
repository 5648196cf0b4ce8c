// SPDX-License-Identifier: BSL-1.1 OR Apache-2.0
//! Restart recovery from file-backed recovery logs.
//!
//! A "crash" drops every in-memory structure of a node and keeps only its
//! log files; the restarted node is rebuilt from them.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use consistency_core::{
    FileLog, LogPhase, MemoryNetwork, Node, NodeConfig, Operation, RecoveryLog, RecoveryLogEntry,
    TransactionConfig, TxId, Vote,
};
use tempfile::tempdir;

fn open_log(path: &Path) -> Arc<RecoveryLog> {
    Arc::new(RecoveryLog::open(FileLog::open(path).unwrap()).unwrap())
}

fn start_node(network: &Arc<MemoryNetwork>, id: &str, dir: &Path) -> Arc<Node> {
    let config = NodeConfig::new(id).with_transaction(
        TransactionConfig::default()
            .with_prepare_timeout_ms(300)
            .with_ack_timeout_ms(50)
            .with_max_decision_retries(1),
    );
    let node = Node::new(
        config,
        network.transport(id),
        open_log(&dir.join(format!("{id}.coordinator.log"))),
        open_log(&dir.join(format!("{id}.participant.log"))),
    )
    .unwrap();
    network.attach(id, node.clone());
    node
}

/// Leave `b` prepared for `tx` in its participant log, as if it voted and
/// crashed before hearing the decision.
fn prepare_and_crash(network: &Arc<MemoryNetwork>, dir: &Path, tx: &TxId) {
    let b = start_node(network, "b", dir);
    let vote = b.participant().handle_prepare(
        tx,
        &"a".to_string(),
        vec![Operation::put("k", b"v".to_vec())],
    );
    assert_eq!(vote, Vote::Commit);
    network.detach("b");
}

fn log_coordinator_phases(dir: &Path, tx: &TxId, phases: &[LogPhase]) {
    let log = open_log(&dir.join("a.coordinator.log"));
    for phase in phases {
        log.append(
            RecoveryLogEntry::new(tx.clone(), *phase, "a").with_peers(vec!["b".to_string()]),
        )
        .unwrap();
    }
}

#[tokio::test(start_paused = true)]
async fn test_in_doubt_participant_learns_commit() {
    let dir = tempdir().unwrap();
    let network = MemoryNetwork::new();
    let tx = TxId::from("TXN_committed01");

    log_coordinator_phases(
        dir.path(),
        &tx,
        &[LogPhase::Start, LogPhase::Prepare, LogPhase::Commit],
    );
    prepare_and_crash(&network, dir.path(), &tx);

    let a = start_node(&network, "a", dir.path());
    let a_report = a.start().await.unwrap();
    assert_eq!(a_report.coordinator.committed, 1);
    assert_eq!(a_report.coordinator.presumed_aborted, 0);
    // No END record, so the COMMIT is resent; b is down and it stays parked.
    assert_eq!(a_report.coordinator.redriven, 1);
    assert_eq!(a.coordinator().pending_decisions(), vec![tx.clone()]);

    let b = start_node(&network, "b", dir.path());
    let report = b.start().await.unwrap();

    assert_eq!(report.in_doubt, vec![tx.clone()]);
    assert!(report.unresolved.is_empty());
    assert_eq!(b.get("k"), Some(b"v".to_vec()));
    assert_eq!(
        b.participant().log().terminal_phase(&tx),
        Some(LogPhase::Commit)
    );

    a.shutdown().await;
    b.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn test_restarted_coordinator_redelivers_commit() {
    let dir = tempdir().unwrap();
    let network = MemoryNetwork::new();
    let tx = TxId::from("TXN_redrive0001");

    // a crashed between logging COMMIT and hearing b's ack; b stayed up.
    log_coordinator_phases(
        dir.path(),
        &tx,
        &[LogPhase::Start, LogPhase::Prepare, LogPhase::Commit],
    );
    let b = start_node(&network, "b", dir.path());
    assert_eq!(
        b.participant().handle_prepare(
            &tx,
            &"a".to_string(),
            vec![Operation::put("k", b"v".to_vec())]
        ),
        Vote::Commit
    );

    let a = start_node(&network, "a", dir.path());
    let report = a.start().await.unwrap();
    assert_eq!(report.coordinator.redriven, 1);

    tokio::time::sleep(Duration::from_millis(10)).await;
    assert_eq!(b.get("k"), Some(b"v".to_vec()));
    assert!(!b.participant().is_prepared(&tx));
    assert!(a.coordinator().pending_decisions().is_empty());
    assert_eq!(
        a.coordinator().log().entries_for(&tx).last().map(|e| e.phase),
        Some(LogPhase::End)
    );

    // Acknowledged decisions are not resent after the next restart.
    a.shutdown().await;
    network.detach("a");
    let a = start_node(&network, "a", dir.path());
    assert_eq!(a.start().await.unwrap().coordinator.redriven, 0);
    assert_eq!(b.participant().applied_count(), 1);
    a.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn test_maintenance_delivers_commit_to_returning_participant() {
    let dir = tempdir().unwrap();
    let network = MemoryNetwork::new();
    let tx = TxId::from("TXN_redrive0002");

    log_coordinator_phases(
        dir.path(),
        &tx,
        &[LogPhase::Start, LogPhase::Prepare, LogPhase::Commit],
    );
    prepare_and_crash(&network, dir.path(), &tx);

    let a = start_node(&network, "a", dir.path());
    a.start().await.unwrap();
    assert_eq!(a.coordinator().pending_decisions(), vec![tx.clone()]);

    // b comes back without querying a; a's maintenance loop must reach it.
    let b = start_node(&network, "b", dir.path());
    assert_eq!(b.participant().recover(), vec![tx.clone()]);
    let interval = TransactionConfig::default().maintenance_interval();
    tokio::time::sleep(interval * 2).await;

    assert_eq!(b.get("k"), Some(b"v".to_vec()));
    assert!(a.coordinator().pending_decisions().is_empty());
    assert_eq!(
        a.coordinator().log().entries_for(&tx).last().map(|e| e.phase),
        Some(LogPhase::End)
    );
    a.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn test_undecided_coordinator_presumes_abort() {
    let dir = tempdir().unwrap();
    let network = MemoryNetwork::new();
    let tx = TxId::from("TXN_undecided1");

    log_coordinator_phases(dir.path(), &tx, &[LogPhase::Start, LogPhase::Prepare]);
    prepare_and_crash(&network, dir.path(), &tx);

    let a = start_node(&network, "a", dir.path());
    let a_report = a.start().await.unwrap();
    assert_eq!(a_report.coordinator.presumed_aborted, 1);
    assert_eq!(
        a.coordinator().log().terminal_phase(&tx),
        Some(LogPhase::Abort)
    );
    // b is down, so the ABORT waits for redelivery.
    assert_eq!(a.coordinator().pending_decisions(), vec![tx.clone()]);

    let b = start_node(&network, "b", dir.path());
    let report = b.start().await.unwrap();
    assert!(report.unresolved.is_empty());
    assert_eq!(b.get("k"), None);
    assert_eq!(
        b.participant().log().terminal_phase(&tx),
        Some(LogPhase::Abort)
    );

    a.coordinator().retry_pending_decisions().await;
    tokio::time::sleep(Duration::from_millis(10)).await;
    assert!(a.coordinator().pending_decisions().is_empty());

    a.shutdown().await;
    b.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn test_unreachable_coordinator_leaves_ambiguity() {
    let dir = tempdir().unwrap();
    let network = MemoryNetwork::new();
    let tx = TxId::from("TXN_ambiguous1");
    prepare_and_crash(&network, dir.path(), &tx);

    let b = start_node(&network, "b", dir.path());
    let report = b.start().await.unwrap();

    assert_eq!(report.unresolved, vec![tx.clone()]);
    assert!(b.participant().is_prepared(&tx));
    assert_eq!(b.get("k"), None);

    // Still locked: a new transaction over the same key votes abort.
    let other = TxId::from("TXN_other00001");
    assert_eq!(
        b.participant().handle_prepare(
            &other,
            &"a".to_string(),
            vec![Operation::put("k", b"x".to_vec())]
        ),
        Vote::Abort
    );
    b.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn test_completed_transaction_survives_restart() {
    let dir = tempdir().unwrap();
    let network = MemoryNetwork::new();

    let tx = {
        let a = start_node(&network, "a", dir.path());
        let b = start_node(&network, "b", dir.path());
        let tx = a.begin(&["a".to_string(), "b".to_string()]).unwrap();
        assert!(a
            .execute(&tx, vec![Operation::put("k", b"v".to_vec())])
            .await
            .unwrap());
        assert_eq!(b.get("k"), Some(b"v".to_vec()));
        network.detach("a");
        network.detach("b");
        tx
    };

    let a = start_node(&network, "a", dir.path());
    let report = a.start().await.unwrap();
    assert_eq!(report.coordinator.committed, 1);
    assert_eq!(report.coordinator.presumed_aborted, 0);
    assert_eq!(report.coordinator.redriven, 0);
    assert!(report.in_doubt.is_empty());
    assert_eq!(
        a.coordinator().answer_decision_query(&tx),
        Some(consistency_core::TxOutcome::Committed)
    );
    a.shutdown().await;
}
