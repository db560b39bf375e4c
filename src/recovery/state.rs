use std::collections::{BTreeMap, BTreeSet};

use crate::primitives::wal::{TxRecord, TxState, Wal, WalRecord};
use crate::types::{NodeId, Result, TxId, WalPointer};

/// What the local log says about one transaction.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum LocalTxFate {
    /// Never seen in the log.
    Unknown,
    Preparing,
    Prepared,
    Committed,
    RolledBack,
}

#[derive(Clone, Debug)]
struct TxEntry {
    state: TxState,
    participants: BTreeSet<NodeId>,
}

/// Transaction states classified from WAL `Tx` records.
///
/// A later record always wins, except that nothing moves a transaction out
/// of `Committed` or `RolledBack`.
#[derive(Clone, Debug, Default)]
pub struct TxWalState {
    txs: BTreeMap<TxId, TxEntry>,
}

impl TxWalState {
    /// Empty state.
    pub fn new() -> Self {
        Self::default()
    }

    /// Scans the log from `from` (or its first retained record) and
    /// classifies every transaction. A checkpoint begin record contributes the
    /// states it carries, so a scan starting at one needs nothing older.
    pub fn scan(wal: &Wal, from: Option<WalPointer>) -> Result<Self> {
        let mut state = Self::new();
        for item in wal.replay(from)? {
            match item?.1 {
                WalRecord::Tx(record) => state.on_record(&record),
                WalRecord::CheckpointBegin { txs, .. } => {
                    for record in &txs {
                        state.on_record(record);
                    }
                }
                _ => {}
            }
        }
        Ok(state)
    }

    /// Applies one transaction record.
    pub fn on_record(&mut self, record: &TxRecord) {
        let entry = self.txs.entry(record.tx).or_insert_with(|| TxEntry {
            state: record.state,
            participants: BTreeSet::new(),
        });
        entry.participants.extend(record.participants.iter().copied());
        if !matches!(entry.state, TxState::Committed | TxState::RolledBack) {
            entry.state = record.state;
        }
    }

    /// Local fate of `tx`.
    pub fn fate(&self, tx: TxId) -> LocalTxFate {
        match self.txs.get(&tx).map(|e| e.state) {
            None => LocalTxFate::Unknown,
            Some(TxState::Preparing) => LocalTxFate::Preparing,
            Some(TxState::Prepared) => LocalTxFate::Prepared,
            Some(TxState::Committed) => LocalTxFate::Committed,
            Some(TxState::RolledBack) => LocalTxFate::RolledBack,
        }
    }

    fn with_state(&self, state: TxState) -> impl Iterator<Item = TxId> + '_ {
        self.txs
            .iter()
            .filter(move |(_, e)| e.state == state)
            .map(|(tx, _)| *tx)
    }

    /// Transactions left in `Preparing`.
    pub fn preparing(&self) -> BTreeSet<TxId> {
        self.with_state(TxState::Preparing).collect()
    }

    /// Transactions that rolled back.
    pub fn rolled_back(&self) -> BTreeSet<TxId> {
        self.with_state(TxState::RolledBack).collect()
    }

    /// Transactions that committed.
    pub fn committed(&self) -> BTreeSet<TxId> {
        self.with_state(TxState::Committed).collect()
    }

    /// Transactions left in `Prepared`, with their participants.
    pub fn prepared(&self) -> BTreeMap<TxId, BTreeSet<NodeId>> {
        self.txs
            .iter()
            .filter(|(_, e)| e.state == TxState::Prepared)
            .map(|(tx, e)| (*tx, e.participants.clone()))
            .collect()
    }

    /// Number of transactions seen.
    pub fn len(&self) -> usize {
        self.txs.len()
    }

    /// Returns true when no transaction record was seen.
    pub fn is_empty(&self) -> bool {
        self.txs.is_empty()
    }
}
