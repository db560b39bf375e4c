//! Logical WAL record types and their payload codec.

use serde::{Deserialize, Serialize};

use crate::primitives::bytes::buf::{self, Reader};
use crate::types::{
    CacheId, FullPageId, GroupId, NodeId, PageIdx, PartitionId, Result, StrataError, TxId,
};

/// Record type tags stored in the frame header.
pub mod tag {
    pub const DATA: u8 = 1;
    pub const TX: u8 = 2;
    pub const CHECKPOINT_BEGIN: u8 = 3;
    pub const PAGE_SNAPSHOT: u8 = 4;
    pub const CHECKPOINT_PAGES_LOGGED: u8 = 5;
    pub const CHECKPOINT_END: u8 = 6;
}

/// Row mutation kind.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub enum DataOp {
    /// Insert or replace.
    Put,
    /// Delete.
    Remove,
}

/// Secondary index change carried by a data record.
///
/// Keys are recorded rather than recomputed so replay does not need the index
/// key extractors; links are resolved when the record is applied.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct IndexUpdate {
    /// Catalog id of the index.
    pub index: u16,
    /// Index key derived from the previous row value.
    pub old_key: Option<Vec<u8>>,
    /// Index key derived from the new row value.
    pub new_key: Option<Vec<u8>>,
}

/// Logical row mutation.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct DataRecord {
    pub group: GroupId,
    pub cache: CacheId,
    pub partition: PartitionId,
    pub key: Vec<u8>,
    pub op: DataOp,
    pub value: Option<Vec<u8>>,
    /// Expiry time in milliseconds, 0 when the row never expires.
    pub expire_at: u64,
    /// Partition update counter assigned to this mutation.
    pub counter: u64,
    pub tx: Option<TxId>,
    pub index_updates: Vec<IndexUpdate>,
}

/// Transaction state transitions.
#[repr(u8)]
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
pub enum TxState {
    Preparing = 1,
    Prepared = 2,
    Committed = 3,
    RolledBack = 4,
}

impl TxState {
    fn from_u8(raw: u8) -> Result<Self> {
        match raw {
            1 => Ok(TxState::Preparing),
            2 => Ok(TxState::Prepared),
            3 => Ok(TxState::Committed),
            4 => Ok(TxState::RolledBack),
            _ => Err(StrataError::Corruption("unknown tx state")),
        }
    }
}

/// Transaction state record with the participant set.
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct TxRecord {
    pub tx: TxId,
    pub state: TxState,
    pub participants: Vec<NodeId>,
}

/// One WAL record.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum WalRecord {
    Data(DataRecord),
    Tx(TxRecord),
    /// Written under the checkpoint write lock; replay starts here. Carries
    /// the transaction states the log knew at that point, so that a scan
    /// starting at this record needs nothing older.
    CheckpointBegin { id: u64, txs: Vec<TxRecord> },
    /// Image of a page captured by checkpoint `id`.
    PageSnapshot { page: FullPageId, bytes: Vec<u8> },
    /// Every page image of checkpoint `id` is durable in the log.
    CheckpointPagesLogged { id: u64, pages: u64 },
    /// Every page of checkpoint `id` reached its store.
    CheckpointEnd { id: u64 },
}

impl WalRecord {
    /// Type tag written to the frame header.
    pub fn tag(&self) -> u8 {
        match self {
            WalRecord::Data(_) => tag::DATA,
            WalRecord::Tx(_) => tag::TX,
            WalRecord::CheckpointBegin { .. } => tag::CHECKPOINT_BEGIN,
            WalRecord::PageSnapshot { .. } => tag::PAGE_SNAPSHOT,
            WalRecord::CheckpointPagesLogged { .. } => tag::CHECKPOINT_PAGES_LOGGED,
            WalRecord::CheckpointEnd { .. } => tag::CHECKPOINT_END,
        }
    }

    /// Short name for logs and dumps.
    pub fn kind_name(&self) -> &'static str {
        match self {
            WalRecord::Data(_) => "data",
            WalRecord::Tx(_) => "tx",
            WalRecord::CheckpointBegin { .. } => "checkpoint_begin",
            WalRecord::PageSnapshot { .. } => "page_snapshot",
            WalRecord::CheckpointPagesLogged { .. } => "checkpoint_pages_logged",
            WalRecord::CheckpointEnd { .. } => "checkpoint_end",
        }
    }

    /// Encodes the payload (the tag travels in the frame header).
    pub fn encode_payload(&self, out: &mut Vec<u8>) {
        match self {
            WalRecord::Data(rec) => encode_data(rec, out),
            WalRecord::Tx(rec) => encode_tx(rec, out),
            WalRecord::CheckpointBegin { id, txs } => {
                out.extend_from_slice(&id.to_be_bytes());
                out.extend_from_slice(&(txs.len() as u32).to_be_bytes());
                for rec in txs {
                    encode_tx(rec, out);
                }
            }
            WalRecord::CheckpointEnd { id } => {
                out.extend_from_slice(&id.to_be_bytes());
            }
            WalRecord::PageSnapshot { page, bytes } => {
                out.extend_from_slice(&page.group.0.to_be_bytes());
                out.extend_from_slice(&page.partition.0.to_be_bytes());
                out.extend_from_slice(&page.index.0.to_be_bytes());
                buf::put_bytes(out, bytes);
            }
            WalRecord::CheckpointPagesLogged { id, pages } => {
                out.extend_from_slice(&id.to_be_bytes());
                out.extend_from_slice(&pages.to_be_bytes());
            }
        }
    }

    /// Decodes a payload for `tag`.
    pub fn decode(tag: u8, payload: &[u8]) -> Result<Self> {
        let mut rd = Reader::new(payload);
        let record = match tag {
            tag::DATA => WalRecord::Data(decode_data(&mut rd)?),
            tag::TX => WalRecord::Tx(decode_tx(&mut rd)?),
            tag::CHECKPOINT_BEGIN => {
                let id = rd.u64()?;
                let count = rd.u32()? as usize;
                // A tx record takes at least 13 bytes.
                if count > rd.remaining() / 13 {
                    return Err(StrataError::Corruption("checkpoint tx count too large"));
                }
                let mut txs = Vec::with_capacity(count);
                for _ in 0..count {
                    txs.push(decode_tx(&mut rd)?);
                }
                WalRecord::CheckpointBegin { id, txs }
            }
            tag::CHECKPOINT_END => WalRecord::CheckpointEnd { id: rd.u64()? },
            tag::PAGE_SNAPSHOT => {
                let page = FullPageId::new(
                    GroupId(rd.u32()?),
                    PartitionId(rd.u16()?),
                    PageIdx(rd.u32()?),
                );
                WalRecord::PageSnapshot {
                    page,
                    bytes: rd.bytes()?.to_vec(),
                }
            }
            tag::CHECKPOINT_PAGES_LOGGED => WalRecord::CheckpointPagesLogged {
                id: rd.u64()?,
                pages: rd.u64()?,
            },
            _ => return Err(StrataError::Corruption("unknown wal record type")),
        };
        rd.finish()?;
        Ok(record)
    }
}

fn encode_tx(rec: &TxRecord, out: &mut Vec<u8>) {
    out.extend_from_slice(&rec.tx.0.to_be_bytes());
    out.push(rec.state as u8);
    out.extend_from_slice(&(rec.participants.len() as u32).to_be_bytes());
    for node in &rec.participants {
        out.extend_from_slice(&node.0.to_be_bytes());
    }
}

fn decode_tx(rd: &mut Reader<'_>) -> Result<TxRecord> {
    let tx = TxId(rd.u64()?);
    let state = TxState::from_u8(rd.u8()?)?;
    let count = rd.u32()? as usize;
    if count > rd.remaining() / 8 {
        return Err(StrataError::Corruption("tx participant count too large"));
    }
    let mut participants = Vec::with_capacity(count);
    for _ in 0..count {
        participants.push(NodeId(rd.u64()?));
    }
    Ok(TxRecord {
        tx,
        state,
        participants,
    })
}

fn encode_data(rec: &DataRecord, out: &mut Vec<u8>) {
    out.extend_from_slice(&rec.group.0.to_be_bytes());
    out.extend_from_slice(&rec.cache.0.to_be_bytes());
    out.extend_from_slice(&rec.partition.0.to_be_bytes());
    out.push(match rec.op {
        DataOp::Put => 1,
        DataOp::Remove => 2,
    });
    out.extend_from_slice(&rec.expire_at.to_be_bytes());
    out.extend_from_slice(&rec.counter.to_be_bytes());
    match rec.tx {
        Some(tx) => {
            out.push(1);
            out.extend_from_slice(&tx.0.to_be_bytes());
        }
        None => out.push(0),
    }
    buf::put_bytes(out, &rec.key);
    buf::put_opt_bytes(out, rec.value.as_deref());
    out.extend_from_slice(&(rec.index_updates.len() as u16).to_be_bytes());
    for update in &rec.index_updates {
        out.extend_from_slice(&update.index.to_be_bytes());
        buf::put_opt_bytes(out, update.old_key.as_deref());
        buf::put_opt_bytes(out, update.new_key.as_deref());
    }
}

fn decode_data(rd: &mut Reader<'_>) -> Result<DataRecord> {
    let group = GroupId(rd.u32()?);
    let cache = CacheId(rd.u32()?);
    let partition = PartitionId(rd.u16()?);
    let op = match rd.u8()? {
        1 => DataOp::Put,
        2 => DataOp::Remove,
        _ => return Err(StrataError::Corruption("unknown data op")),
    };
    let expire_at = rd.u64()?;
    let counter = rd.u64()?;
    let tx = match rd.u8()? {
        0 => None,
        1 => Some(TxId(rd.u64()?)),
        _ => return Err(StrataError::Corruption("invalid tx flag")),
    };
    let key = rd.bytes()?.to_vec();
    let value = rd.opt_bytes()?.map(<[u8]>::to_vec);
    let updates = rd.u16()? as usize;
    let mut index_updates = Vec::with_capacity(updates);
    for _ in 0..updates {
        index_updates.push(IndexUpdate {
            index: rd.u16()?,
            old_key: rd.opt_bytes()?.map(<[u8]>::to_vec),
            new_key: rd.opt_bytes()?.map(<[u8]>::to_vec),
        });
    }
    Ok(DataRecord {
        group,
        cache,
        partition,
        key,
        op,
        value,
        expire_at,
        counter,
        tx,
        index_updates,
    })
}
