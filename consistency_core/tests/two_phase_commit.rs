// SPDX-License-Identifier: BSL-1.1 OR Apache-2.0
//! Two-phase commit across in-process nodes.
//!
//! Every node runs the full stack (registry, coordinator, participant, store)
//! behind a `MemoryNetwork`, so votes and decisions travel as real messages.

use std::sync::Arc;
use std::time::Duration;

use consistency_core::{
    LinkFaults, LogPhase, MemoryNetwork, Node, NodeConfig, NodeId, Operation, PeerConfig,
    TransactionConfig, TxId, TxState, Vote,
};

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter("consistency_core=debug")
        .with_test_writer()
        .try_init();
}

fn cluster(ids: &[&str]) -> (Arc<MemoryNetwork>, Vec<Arc<Node>>) {
    init_tracing();
    let network = MemoryNetwork::new();
    let nodes = ids
        .iter()
        .map(|id| {
            let mut config = NodeConfig::new(*id).with_transaction(
                TransactionConfig::default()
                    .with_prepare_timeout_ms(500)
                    .with_ack_timeout_ms(100)
                    .with_max_decision_retries(2),
            );
            for peer in ids.iter().filter(|p| *p != id) {
                config = config.with_peer(PeerConfig::new(*peer));
            }
            let node = Node::in_memory(config, network.transport(*id)).unwrap();
            network.attach(*id, node.clone());
            node
        })
        .collect();
    (network, nodes)
}

fn ids(names: &[&str]) -> Vec<NodeId> {
    names.iter().map(|s| s.to_string()).collect()
}

fn phases(node: &Node, tx: &TxId) -> Vec<LogPhase> {
    node.coordinator()
        .log()
        .entries_for(tx)
        .iter()
        .map(|e| e.phase)
        .collect()
}

#[tokio::test(start_paused = true)]
async fn test_three_participants_commit() {
    let (_net, nodes) = cluster(&["a", "b", "c"]);
    let tx = nodes[0].begin(&ids(&["a", "b", "c"])).unwrap();

    let committed = nodes[0]
        .execute(
            &tx,
            vec![
                Operation::put("user:1", b"alice".to_vec()),
                Operation::put("user:2", b"bob".to_vec()),
            ],
        )
        .await
        .unwrap();

    assert!(committed);
    assert_eq!(
        phases(&nodes[0], &tx),
        vec![LogPhase::Start, LogPhase::Prepare, LogPhase::Commit, LogPhase::End]
    );
    assert!(nodes[0].registry().active_transactions().is_empty());
    for node in &nodes {
        assert_eq!(node.get("user:1"), Some(b"alice".to_vec()));
        assert_eq!(node.store().get_entry("user:2").unwrap().version, 1);
        assert_eq!(node.participant().applied_count(), 1);
        assert_eq!(
            node.participant().log().terminal_phase(&tx),
            Some(LogPhase::Commit)
        );
    }
}

#[tokio::test(start_paused = true)]
async fn test_one_abort_vote_aborts_everywhere() {
    let (_net, nodes) = cluster(&["a", "b", "c"]);

    // c already holds "k" for another prepared transaction.
    let blocker = TxId::from("TXN_blocker");
    assert_eq!(
        nodes[2]
            .participant()
            .handle_prepare(&blocker, &"z".to_string(), vec![Operation::delete("k")]),
        Vote::Commit
    );

    let tx = nodes[0].begin(&ids(&["a", "b", "c"])).unwrap();
    let committed = nodes[0]
        .execute(&tx, vec![Operation::put("k", b"v".to_vec())])
        .await
        .unwrap();

    assert!(!committed);
    assert_eq!(
        phases(&nodes[0], &tx),
        vec![LogPhase::Start, LogPhase::Prepare, LogPhase::Abort, LogPhase::End]
    );
    assert_eq!(nodes[0].registry().get(&tx).unwrap().state, TxState::Aborted);

    tokio::time::sleep(Duration::from_millis(10)).await;
    for node in &nodes {
        assert_eq!(node.get("k"), None);
        assert!(!node.participant().is_prepared(&tx));
    }
}

#[tokio::test(start_paused = true)]
async fn test_silent_participant_times_out() {
    let (net, nodes) = cluster(&["a", "b", "c"]);
    net.isolate("c");

    let started = tokio::time::Instant::now();
    let tx = nodes[0].begin(&ids(&["a", "b", "c"])).unwrap();
    let committed = nodes[0]
        .execute(&tx, vec![Operation::put("k", b"v".to_vec())])
        .await
        .unwrap();

    assert!(!committed);
    assert!(started.elapsed() >= Duration::from_millis(500));
    let stats = nodes[0].coordinator().stats().snapshot();
    assert_eq!(stats.timed_out, 1);
    assert_eq!(stats.aborted, 1);
    for node in &nodes[..2] {
        assert_eq!(node.get("k"), None);
    }

    // c never answered the ABORT either, so the decision stays parked.
    assert_eq!(nodes[0].coordinator().pending_decisions(), vec![tx.clone()]);
    net.heal("c");
    nodes[0].coordinator().retry_pending_decisions().await;
    tokio::time::sleep(Duration::from_millis(10)).await;
    assert!(nodes[0].coordinator().pending_decisions().is_empty());
    assert_eq!(
        nodes[2].participant().log().terminal_phase(&tx),
        Some(LogPhase::Abort)
    );
}

#[tokio::test(start_paused = true)]
async fn test_unreachable_participant_aborts() {
    let (net, nodes) = cluster(&["a", "b", "c"]);
    net.detach("c");

    let tx = nodes[0].begin(&ids(&["a", "b", "c"])).unwrap();
    let committed = nodes[0]
        .execute(&tx, vec![Operation::put("k", b"v".to_vec())])
        .await
        .unwrap();

    assert!(!committed);
    assert_eq!(nodes[0].coordinator().stats().snapshot().unreachable, 1);
    assert_eq!(nodes[1].get("k"), None);
}

#[tokio::test(start_paused = true)]
async fn test_duplicated_messages_apply_once() {
    let (net, nodes) = cluster(&["a", "b"]);
    let duplicate = LinkFaults::duplicating(1.0);
    net.set_link_faults("a", "b", duplicate);
    net.set_link_faults("b", "a", duplicate);

    let tx = nodes[0].begin(&ids(&["a", "b"])).unwrap();
    assert!(nodes[0]
        .execute(&tx, vec![Operation::put("k", b"v".to_vec())])
        .await
        .unwrap());

    tokio::time::sleep(Duration::from_millis(10)).await;
    assert_eq!(nodes[1].participant().applied_count(), 1);
    assert_eq!(nodes[1].store().get_entry("k").unwrap().version, 1);
}

#[tokio::test(start_paused = true)]
async fn test_concurrent_transactions_on_disjoint_keys() {
    let (_net, nodes) = cluster(&["a", "b", "c"]);
    let participants = ids(&["a", "b", "c"]);

    let mut handles = Vec::new();
    for i in 0..5 {
        let node = Arc::clone(&nodes[i % 3]);
        let participants = participants.clone();
        handles.push(tokio::spawn(async move {
            let tx = node.begin(&participants).unwrap();
            node.execute(&tx, vec![Operation::put(format!("key{i}"), vec![i as u8])])
                .await
                .unwrap()
        }));
    }
    for handle in handles {
        assert!(handle.await.unwrap());
    }

    for node in &nodes {
        assert_eq!(node.store().keys().len(), 5);
        assert_eq!(node.participant().applied_count(), 5);
    }
}

#[tokio::test(start_paused = true)]
async fn test_abort_before_execute() {
    let (_net, nodes) = cluster(&["a", "b"]);
    let tx = nodes[0].begin(&ids(&["a", "b"])).unwrap();

    nodes[0].abort(&tx).unwrap();

    assert_eq!(phases(&nodes[0], &tx), vec![LogPhase::Start, LogPhase::Abort]);
    assert!(nodes[0].execute(&tx, vec![]).await.is_err());
    assert_eq!(nodes[0].registry().history().len(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_lossy_commit_link_applies_once() {
    let (net, nodes) = cluster(&["a", "b"]);
    net.set_link_faults("a", "b", LinkFaults::dropping(0.5).only("commit"));

    let tx = nodes[0].begin(&ids(&["a", "b"])).unwrap();
    assert!(nodes[0]
        .execute(&tx, vec![Operation::put("k", b"v".to_vec())])
        .await
        .unwrap());

    for _ in 0..30 {
        if nodes[0].coordinator().pending_decisions().is_empty() {
            break;
        }
        nodes[0].coordinator().retry_pending_decisions().await;
        tokio::time::sleep(Duration::from_millis(10)).await;
    }

    assert!(nodes[0].coordinator().pending_decisions().is_empty());
    assert_eq!(nodes[1].get("k"), Some(b"v".to_vec()));
    assert_eq!(nodes[1].participant().applied_count(), 1);
    assert_eq!(phases(&nodes[0], &tx).last(), Some(&LogPhase::End));
}
