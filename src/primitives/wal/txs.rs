//! Transaction states known to the log.
//!
//! Open transactions are kept until they finish; finished ones are kept for a
//! bounded window. Every checkpoint begin record embeds a snapshot of this
//! table, so truncating the log before a checkpoint loses no open transaction.

use std::collections::{BTreeMap, VecDeque};

use super::record::{TxRecord, TxState, WalRecord};
use crate::types::{NodeId, TxId};

pub(super) struct TxTable {
    open: BTreeMap<TxId, TxRecord>,
    finished: VecDeque<TxRecord>,
    retain: usize,
}

impl TxTable {
    pub fn new(retain: usize) -> Self {
        Self {
            open: BTreeMap::new(),
            finished: VecDeque::new(),
            retain,
        }
    }

    /// Applies an appended or replayed record.
    pub fn on_record(&mut self, record: &WalRecord) {
        match record {
            WalRecord::Tx(rec) => self.apply(rec),
            WalRecord::CheckpointBegin { txs, .. } => {
                self.open.clear();
                self.finished.clear();
                for rec in txs {
                    self.apply(rec);
                }
            }
            _ => {}
        }
    }

    fn apply(&mut self, rec: &TxRecord) {
        match rec.state {
            TxState::Preparing | TxState::Prepared => {
                let entry = self.open.entry(rec.tx).or_insert_with(|| TxRecord {
                    tx: rec.tx,
                    state: rec.state,
                    participants: Vec::new(),
                });
                entry.state = rec.state;
                merge(&mut entry.participants, &rec.participants);
            }
            TxState::Committed | TxState::RolledBack => {
                let mut done = rec.clone();
                if let Some(open) = self.open.remove(&rec.tx) {
                    merge(&mut done.participants, &open.participants);
                }
                self.finished.push_back(done);
                while self.finished.len() > self.retain {
                    self.finished.pop_front();
                }
            }
        }
    }

    /// Finished transactions oldest first, then the open ones.
    pub fn snapshot(&self) -> Vec<TxRecord> {
        self.finished
            .iter()
            .chain(self.open.values())
            .cloned()
            .collect()
    }
}

fn merge(into: &mut Vec<NodeId>, from: &[NodeId]) {
    for node in from {
        if !into.contains(node) {
            into.push(*node);
        }
    }
}
