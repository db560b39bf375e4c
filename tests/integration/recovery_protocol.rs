#![allow(missing_docs)]

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use parking_lot::Mutex;
use strata::primitives::wal::{TxRecord, TxState};
use strata::recovery::{ConflictPolicy, Membership, RecoveryCoordinator, RecoveryMessage, Transport};
use strata::types::{CacheId, GroupId, NodeId, PartitionId, TxId};
use strata::{Engine, GroupSchema, RecoveryOptions, Result, RowOperation, RowScope, Schema, StorageConfig, StrataError};
use tempfile::TempDir;

const GROUP: GroupId = GroupId(1);
const NODE_A: NodeId = NodeId(1);
const NODE_B: NodeId = NodeId(2);
const NODE_C: NodeId = NodeId(3);

/// In-process cluster: delivers messages to the coordinators registered with
/// it. Members marked silent swallow everything sent to them.
#[derive(Default)]
struct Hub {
    nodes: Mutex<BTreeMap<NodeId, Arc<RecoveryCoordinator>>>,
    silent: Mutex<BTreeSet<NodeId>>,
    sent: Mutex<Vec<(NodeId, String)>>,
}

impl Hub {
    fn join(&self, coordinator: Arc<RecoveryCoordinator>) {
        self.nodes.lock().insert(coordinator.local(), coordinator);
    }

    fn join_silent(&self, node: NodeId) {
        self.silent.lock().insert(node);
    }

    fn leave(&self, node: NodeId) {
        self.nodes.lock().remove(&node);
        self.silent.lock().remove(&node);
    }
}

struct Link {
    hub: Arc<Hub>,
    from: NodeId,
}

impl Transport for Link {
    fn send(&self, to: NodeId, message: RecoveryMessage) -> Result<()> {
        // Messages cross the wire as JSON.
        let wire = message.to_json()?;
        self.hub.sent.lock().push((to, wire.clone()));
        if self.hub.silent.lock().contains(&to) {
            return Ok(());
        }
        let target = self.hub.nodes.lock().get(&to).cloned();
        let Some(target) = target else {
            return Err(StrataError::Recovery(format!("node {to} unreachable")));
        };
        target.on_message(self.from, RecoveryMessage::from_json(&wire)?);
        Ok(())
    }
}

impl Membership for Link {
    fn is_alive(&self, node: NodeId) -> bool {
        self.hub.nodes.lock().contains_key(&node) || self.hub.silent.lock().contains(&node)
    }
}

fn options(hub: &Arc<Hub>, node: NodeId, policy: ConflictPolicy) -> RecoveryOptions {
    let link = Arc::new(Link {
        hub: Arc::clone(hub),
        from: node,
    });
    RecoveryOptions::new(node, link.clone(), link, policy).timeout(Duration::from_secs(10))
}

fn config() -> StorageConfig {
    StorageConfig {
        page_size: 1024,
        region_pages: 256,
        checkpoint_buffer_pages: 64,
        checkpoint_frequency_ms: 3_600_000,
        checkpoint_threads: 1,
        ..StorageConfig::default()
    }
}

fn schema() -> Schema {
    Schema::new().group(GroupSchema::new(GROUP, "ledger", 1))
}

fn scope() -> RowScope {
    RowScope::new(GROUP, CacheId(1), PartitionId(0))
}

fn log(engine: &Engine, tx: u64, state: TxState, participants: &[NodeId]) -> Result<()> {
    engine.log_tx(TxRecord {
        tx: TxId(tx),
        state,
        participants: participants.to_vec(),
    })?;
    Ok(())
}

/// Node A prepared transactions 7, 8 and 9 with node B and wrote one row for
/// each, then crashed before learning the outcome.
fn crash_node_a(dir: &TempDir, peer: NodeId) -> Result<()> {
    let engine = Engine::open(dir.path(), config(), schema())?;
    let w = engine.worker("tx");
    for tx in [7u64, 8, 9] {
        log(&engine, tx, TxState::Prepared, &[NODE_A, peer])?;
        let op = RowOperation::put(scope(), format!("row-{tx}").into_bytes(), b"payload".to_vec()).tx(TxId(tx));
        engine.apply(&w, op)?;
    }
    Ok(())
}

/// Node B committed 7, rolled back 8 and never heard of 9.
fn seed_node_b(dir: &TempDir) -> Result<()> {
    let engine = Engine::open(dir.path(), config(), schema())?;
    log(&engine, 7, TxState::Committed, &[NODE_A, NODE_B])?;
    log(&engine, 8, TxState::RolledBack, &[NODE_A, NODE_B])?;
    engine.close()
}

fn present(engine: &Engine) -> Result<Vec<u64>> {
    let w = engine.worker("check");
    let mut found = Vec::new();
    for tx in [7u64, 8, 9] {
        if engine.get(&w, scope(), format!("row-{tx}").as_bytes())?.is_some() {
            found.push(tx);
        }
    }
    Ok(found)
}

#[test]
fn peer_answers_decide_prepared_transactions() -> Result<()> {
    let a_dir = tempfile::tempdir()?;
    let b_dir = tempfile::tempdir()?;
    crash_node_a(&a_dir, NODE_B)?;
    seed_node_b(&b_dir)?;

    let hub = Arc::new(Hub::default());
    let b_opts = options(&hub, NODE_B, ConflictPolicy::RollbackWins);
    hub.join(b_opts.coordinator());
    let node_b = Engine::open_with_recovery(b_dir.path(), config(), schema(), b_opts)?;

    let a_opts = options(&hub, NODE_A, ConflictPolicy::RollbackWins);
    hub.join(a_opts.coordinator());
    let node_a = Engine::open_with_recovery(a_dir.path(), config(), schema(), a_opts)?;

    let report = node_a.recovery_report();
    assert_eq!(report.skipped_transactions, 2);
    assert_eq!(report.records_skipped, 2);
    assert_eq!(present(&node_a)?, vec![7]);

    let requests: Vec<_> = hub.sent.lock().iter().filter(|(to, _)| *to == NODE_B).map(|(_, m)| m.clone()).collect();
    assert_eq!(requests, vec![r#"{"type":"tx_state_request","transaction_ids":[7,8,9]}"#.to_string()]);

    node_a.close()?;
    node_b.close()
}

#[test]
fn departed_peer_counts_as_answered() -> Result<()> {
    let a_dir = tempfile::tempdir()?;
    crash_node_a(&a_dir, NODE_C)?;

    let hub = Arc::new(Hub::default());
    hub.join_silent(NODE_C);
    let a_opts = options(&hub, NODE_A, ConflictPolicy::RollbackWins);
    let coordinator = a_opts.coordinator();
    hub.join(coordinator.clone());

    let leaver = {
        let hub = Arc::clone(&hub);
        thread::spawn(move || {
            // Wait until the request went out, then drop the peer.
            while hub.sent.lock().is_empty() {
                thread::sleep(Duration::from_millis(5));
            }
            hub.leave(NODE_C);
            coordinator.on_node_left(NODE_C);
        })
    };
    let node_a = Engine::open_with_recovery(a_dir.path(), config(), schema(), a_opts)?;
    leaver.join().expect("leaver thread");

    // Nobody reported a rollback, so every prepared transaction is replayed.
    assert_eq!(node_a.recovery_report().skipped_transactions, 0);
    assert_eq!(present(&node_a)?, vec![7, 8, 9]);
    node_a.close()
}

#[test]
fn silent_peer_fails_the_open_after_the_timeout() -> Result<()> {
    let a_dir = tempfile::tempdir()?;
    crash_node_a(&a_dir, NODE_C)?;

    let hub = Arc::new(Hub::default());
    hub.join_silent(NODE_C);
    let a_opts = options(&hub, NODE_A, ConflictPolicy::RollbackWins).timeout(Duration::from_millis(200));
    hub.join(a_opts.coordinator());

    match Engine::open_with_recovery(a_dir.path(), config(), schema(), a_opts) {
        Err(StrataError::Recovery(msg)) => assert!(msg.contains("200"), "{msg}"),
        Err(other) => panic!("unexpected error {other}"),
        Ok(_) => panic!("open should wait for the silent peer"),
    }
    Ok(())
}

#[test]
fn commit_wins_keeps_transactions_a_peer_committed() -> Result<()> {
    let a_dir = tempfile::tempdir()?;
    let b_dir = tempfile::tempdir()?;
    let c_dir = tempfile::tempdir()?;
    {
        let engine = Engine::open(a_dir.path(), config(), schema())?;
        let w = engine.worker("tx");
        log(&engine, 7, TxState::Prepared, &[NODE_A, NODE_B, NODE_C])?;
        engine.apply(&w, RowOperation::put(scope(), b"row-7".to_vec(), b"x".to_vec()).tx(TxId(7)))?;
    }
    {
        let engine = Engine::open(b_dir.path(), config(), schema())?;
        log(&engine, 7, TxState::Committed, &[NODE_A, NODE_B, NODE_C])?;
        engine.close()?;
    }
    // Node C has no record of 7 and answers rollback.
    Engine::open(c_dir.path(), config(), schema())?.close()?;

    let hub = Arc::new(Hub::default());
    let mut peers = Vec::new();
    for (node, dir) in [(NODE_B, &b_dir), (NODE_C, &c_dir)] {
        let opts = options(&hub, node, ConflictPolicy::RollbackWins);
        hub.join(opts.coordinator());
        peers.push(Engine::open_with_recovery(dir.path(), config(), schema(), opts)?);
    }
    let a_opts = options(&hub, NODE_A, ConflictPolicy::CommitWins);
    hub.join(a_opts.coordinator());
    let node_a = Engine::open_with_recovery(a_dir.path(), config(), schema(), a_opts)?;
    assert_eq!(present(&node_a)?, vec![7]);

    node_a.close()?;
    for peer in peers {
        peer.close()?;
    }
    Ok(())
}
