//! Transaction recovery on node start.
//!
//! The local WAL classifies every transaction. Transactions left `Preparing`
//! or `RolledBack` are skipped outright; transactions left `Prepared` may
//! have committed elsewhere, so their remote participants are asked. The
//! coordinator resolves once every asked peer answered or left and yields the
//! set of transactions logical replay must skip.

mod message;
mod state;

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};
use serde::{Deserialize, Serialize};
use tracing::{debug, error, info, warn};

use crate::types::{clone_error, NodeId, Result, StrataError, TxId, WalPointer};

pub use message::{RecoveryMessage, TxStateRequest, TxStateResponse};
pub use state::{LocalTxFate, TxWalState};

/// Delivers recovery messages to peers.
pub trait Transport: Send + Sync {
    /// Sends `message` to `to`. An error means the peer cannot be reached.
    fn send(&self, to: NodeId, message: RecoveryMessage) -> Result<()>;
}

/// Cluster membership oracle.
pub trait Membership: Send + Sync {
    /// Returns true while `node` still participates in the cluster.
    fn is_alive(&self, node: NodeId) -> bool;
}

/// Reaction to a failure the node cannot continue after.
pub trait FailureHandler: Send + Sync {
    /// Called once per failure; expected to stop the node.
    fn on_critical_failure(&self, err: &StrataError);
}

/// Collaborators for a node without peers: nothing is reachable and only the
/// local node is alive.
#[derive(Clone, Copy, Debug, Default)]
pub struct Standalone;

impl Transport for Standalone {
    fn send(&self, _to: NodeId, _message: RecoveryMessage) -> Result<()> {
        Err(StrataError::Recovery("no transport configured".into()))
    }
}

impl Membership for Standalone {
    fn is_alive(&self, _node: NodeId) -> bool {
        false
    }
}

/// How to resolve a transaction one peer rolled back and another committed.
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConflictPolicy {
    /// Any rollback answer skips the transaction.
    #[default]
    RollbackWins,
    /// A commit answer keeps the transaction even if another peer rolled it back.
    CommitWins,
}

impl fmt::Display for ConflictPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            ConflictPolicy::RollbackWins => "rollback_wins",
            ConflictPolicy::CommitWins => "commit_wins",
        })
    }
}

/// Input to logical replay.
#[derive(Clone, Debug, Default, Eq, PartialEq, Serialize)]
pub struct RecoveryContext {
    /// Where replay starts; `None` replays the whole log.
    pub init_pointer: Option<WalPointer>,
    /// Transactions whose data records must not be replayed.
    pub skip_txs: BTreeSet<TxId>,
}

impl RecoveryContext {
    /// Returns true when records of `tx` must be skipped.
    pub fn skips(&self, tx: TxId) -> bool {
        self.skip_txs.contains(&tx)
    }
}

struct FutureShared {
    result: Mutex<Option<Result<RecoveryContext>>>,
    cond: Condvar,
}

/// Completion handle of a [`RecoveryCoordinator`].
#[derive(Clone)]
pub struct RecoveryFuture {
    shared: Arc<FutureShared>,
}

impl RecoveryFuture {
    fn new() -> Self {
        Self {
            shared: Arc::new(FutureShared {
                result: Mutex::new(None),
                cond: Condvar::new(),
            }),
        }
    }

    /// Completes the future; later completions are ignored.
    fn complete(&self, result: Result<RecoveryContext>) -> bool {
        let mut slot = self.shared.result.lock();
        if slot.is_some() {
            return false;
        }
        *slot = Some(result);
        self.shared.cond.notify_all();
        true
    }

    fn read(slot: &Result<RecoveryContext>) -> Result<RecoveryContext> {
        match slot {
            Ok(ctx) => Ok(ctx.clone()),
            Err(err) => Err(clone_error(err)),
        }
    }

    /// Returns true once resolved or failed.
    pub fn is_done(&self) -> bool {
        self.shared.result.lock().is_some()
    }

    /// Blocks until every asked peer answered or left.
    pub fn wait(&self) -> Result<RecoveryContext> {
        let mut slot = self.shared.result.lock();
        loop {
            if let Some(result) = slot.as_ref() {
                return Self::read(result);
            }
            self.shared.cond.wait(&mut slot);
        }
    }

    /// Like [`RecoveryFuture::wait`], returning `None` on timeout.
    pub fn wait_timeout(&self, timeout: Duration) -> Result<Option<RecoveryContext>> {
        let deadline = Instant::now() + timeout;
        let mut slot = self.shared.result.lock();
        loop {
            if let Some(result) = slot.as_ref() {
                return Self::read(result).map(Some);
            }
            if self.shared.cond.wait_until(&mut slot, deadline).timed_out() {
                return Ok(None);
            }
        }
    }
}

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
enum Phase {
    Scanning,
    Waiting,
    Resolved,
}

struct Inner {
    phase: Phase,
    queued: Vec<(NodeId, RecoveryMessage)>,
    wal_state: TxWalState,
    init_pointer: Option<WalPointer>,
    skip: BTreeSet<TxId>,
    // Peers still to answer and the transactions each was asked about.
    remaining: BTreeMap<NodeId, BTreeSet<TxId>>,
    peer_rollback: BTreeSet<TxId>,
    peer_committed: BTreeSet<TxId>,
}

/// Runs the transaction-state exchange for one node.
///
/// Also answers peers' requests for as long as it lives.
pub struct RecoveryCoordinator {
    local: NodeId,
    transport: Arc<dyn Transport>,
    membership: Arc<dyn Membership>,
    failure: Arc<dyn FailureHandler>,
    policy: ConflictPolicy,
    inner: Mutex<Inner>,
    future: RecoveryFuture,
}

impl RecoveryCoordinator {
    pub fn new(
        local: NodeId,
        transport: Arc<dyn Transport>,
        membership: Arc<dyn Membership>,
        failure: Arc<dyn FailureHandler>,
        policy: ConflictPolicy,
    ) -> Self {
        Self {
            local,
            transport,
            membership,
            failure,
            policy,
            inner: Mutex::new(Inner {
                phase: Phase::Scanning,
                queued: Vec::new(),
                wal_state: TxWalState::new(),
                init_pointer: None,
                skip: BTreeSet::new(),
                remaining: BTreeMap::new(),
                peer_rollback: BTreeSet::new(),
                peer_committed: BTreeSet::new(),
            }),
            future: RecoveryFuture::new(),
        }
    }

    /// The local node.
    pub fn local(&self) -> NodeId {
        self.local
    }

    /// Handle resolving to the [`RecoveryContext`].
    pub fn future(&self) -> RecoveryFuture {
        self.future.clone()
    }

    /// Reports the finished WAL scan and asks peers about prepared transactions.
    ///
    /// Messages received earlier are processed now.
    pub fn on_wal_scanned(&self, init_pointer: Option<WalPointer>, states: TxWalState) -> Result<()> {
        let (requests, queued) = {
            let mut inner = self.inner.lock();
            if inner.phase != Phase::Scanning {
                return Err(StrataError::Invalid("recovery scan reported twice"));
            }
            inner.init_pointer = init_pointer;
            inner.skip = states.preparing();
            inner.skip.extend(states.rolled_back());

            let mut per_peer: BTreeMap<NodeId, BTreeSet<TxId>> = BTreeMap::new();
            for (tx, participants) in states.prepared() {
                for node in participants.into_iter().filter(|n| *n != self.local) {
                    per_peer.entry(node).or_default().insert(tx);
                }
            }
            for (node, txs) in per_peer {
                if self.membership.is_alive(node) {
                    inner.remaining.insert(node, txs);
                } else {
                    debug!(node = %node, txs = txs.len(), "recovery.peer.gone");
                }
            }
            info!(
                txs = states.len(),
                skipped = inner.skip.len(),
                peers = inner.remaining.len(),
                queued = inner.queued.len(),
                "recovery.scan.finished"
            );
            inner.wal_state = states;
            inner.phase = Phase::Waiting;
            let requests: Vec<(NodeId, Vec<TxId>)> = inner
                .remaining
                .iter()
                .map(|(node, txs)| (*node, txs.iter().copied().collect()))
                .collect();
            (requests, std::mem::take(&mut inner.queued))
        };

        for (node, transaction_ids) in requests {
            debug!(to = %node, txs = transaction_ids.len(), "recovery.tx_state.request");
            let request = RecoveryMessage::TxStateRequest(TxStateRequest { transaction_ids });
            if let Err(err) = self.transport.send(node, request) {
                warn!(to = %node, error = %err, "recovery.tx_state.request.unreachable");
                self.inner.lock().remaining.remove(&node);
            }
        }
        for (from, message) in queued {
            if let Err(err) = self.handle(from, message) {
                self.fail(err);
            }
        }
        self.try_resolve();
        Ok(())
    }

    /// Decodes and dispatches a JSON message. A payload that does not decode
    /// is a processing failure and stops the node.
    pub fn on_payload(&self, from: NodeId, payload: &str) {
        match RecoveryMessage::from_json(payload) {
            Ok(message) => self.on_message(from, message),
            Err(err) => self.fail(StrataError::Recovery(format!("undecodable message from {from}: {err}"))),
        }
    }

    /// Dispatches one inbound message. Processing failures stop the node; an
    /// answer that cannot be delivered is only logged.
    pub fn on_message(&self, from: NodeId, message: RecoveryMessage) {
        {
            let mut inner = self.inner.lock();
            if inner.phase == Phase::Scanning {
                debug!(from = %from, kind = message.kind(), "recovery.message.queued");
                inner.queued.push((from, message));
                return;
            }
        }
        if let Err(err) = self.handle(from, message) {
            self.fail(err);
        }
    }

    /// A peer left the cluster; it counts as having answered.
    pub fn on_node_left(&self, node: NodeId) {
        let was_pending = self.inner.lock().remaining.remove(&node).is_some();
        if was_pending {
            info!(node = %node, "recovery.peer.left");
            self.try_resolve();
        }
    }

    fn handle(&self, from: NodeId, message: RecoveryMessage) -> Result<()> {
        match message {
            RecoveryMessage::TxStateRequest(request) => {
                let response = self.answer(&request);
                debug!(
                    to = %from,
                    asked = request.transaction_ids.len(),
                    rollback = response.rollback_transaction_ids.len(),
                    "recovery.tx_state.response"
                );
                if let Err(err) = self.transport.send(from, RecoveryMessage::TxStateResponse(response)) {
                    warn!(to = %from, error = %err, "recovery.tx_state.response.unsent");
                }
                Ok(())
            }
            RecoveryMessage::TxStateResponse(response) => {
                self.on_response(from, response);
                Ok(())
            }
        }
    }

    fn answer(&self, request: &TxStateRequest) -> TxStateResponse {
        let inner = self.inner.lock();
        let mut response = TxStateResponse::default();
        for tx in &request.transaction_ids {
            match inner.wal_state.fate(*tx) {
                LocalTxFate::Preparing | LocalTxFate::RolledBack | LocalTxFate::Unknown => {
                    response.rollback_transaction_ids.push(*tx)
                }
                LocalTxFate::Committed => response.committed_transaction_ids.push(*tx),
                LocalTxFate::Prepared => {}
            }
        }
        response
    }

    fn on_response(&self, from: NodeId, response: TxStateResponse) {
        {
            let mut inner = self.inner.lock();
            let Some(asked) = inner.remaining.remove(&from) else {
                debug!(from = %from, "recovery.tx_state.response.unexpected");
                return;
            };
            let mut unsolicited = 0usize;
            for tx in response.rollback_transaction_ids {
                if asked.contains(&tx) {
                    inner.peer_rollback.insert(tx);
                } else {
                    unsolicited += 1;
                }
            }
            for tx in response.committed_transaction_ids {
                if asked.contains(&tx) {
                    inner.peer_committed.insert(tx);
                } else {
                    unsolicited += 1;
                }
            }
            if unsolicited > 0 {
                warn!(from = %from, unsolicited, "recovery.tx_state.response.unsolicited");
            }
            debug!(from = %from, left = inner.remaining.len(), "recovery.tx_state.answered");
        }
        self.try_resolve();
    }

    fn try_resolve(&self) {
        let ctx = {
            let mut inner = self.inner.lock();
            if inner.phase != Phase::Waiting || !inner.remaining.is_empty() {
                return;
            }
            let conflicts = inner.peer_rollback.intersection(&inner.peer_committed).count();
            if conflicts > 0 {
                warn!(conflicts, policy = %self.policy, "recovery.tx_state.conflict");
            }
            let extra: Vec<TxId> = match self.policy {
                ConflictPolicy::RollbackWins => inner.peer_rollback.iter().copied().collect(),
                ConflictPolicy::CommitWins => inner
                    .peer_rollback
                    .difference(&inner.peer_committed)
                    .copied()
                    .collect(),
            };
            inner.skip.extend(extra);
            inner.phase = Phase::Resolved;
            RecoveryContext {
                init_pointer: inner.init_pointer,
                skip_txs: inner.skip.clone(),
            }
        };
        info!(skip = ctx.skip_txs.len(), "recovery.resolved");
        self.future.complete(Ok(ctx));
    }

    fn fail(&self, err: StrataError) {
        error!(error = %err, "recovery.failed");
        self.failure.on_critical_failure(&err);
        self.future.complete(Err(err));
    }
}
