#![forbid(unsafe_code)]

//! Row storage on slotted data pages, addressed by [`Link`]s.

pub mod page;
mod reuse;

use std::sync::Arc;

use parking_lot::Mutex;
use tracing::trace;

use crate::primitives::bytes::buf::Reader;
use crate::primitives::concurrency::CheckpointReadGuard;
use crate::primitives::pager::PageMemory;
use crate::storage::btree::PageAllocator;
use crate::types::{CacheId, FullPageId, GroupId, Link, PageIdx, PartitionId, Result, StrataError};

pub use reuse::ReuseList;

/// Encoded row header: cache, version, expiry, key length, value length.
const ROW_HDR_LEN: usize = 4 + 8 + 8 + 2 + 4;

/// Logical row as stored on a data page.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Row {
    pub cache: CacheId,
    pub key: Vec<u8>,
    pub value: Vec<u8>,
    /// Update counter of the mutation that wrote this row.
    pub version: u64,
    /// Expiry time in milliseconds, 0 when the row never expires.
    pub expire_at: u64,
}

impl Row {
    /// Encoded length.
    pub fn encoded_len(&self) -> usize {
        ROW_HDR_LEN + self.key.len() + self.value.len()
    }

    /// Serializes the row into its page record.
    pub fn encode(&self) -> Result<Vec<u8>> {
        let key_len = u16::try_from(self.key.len()).map_err(|_| StrataError::RowTooLarge {
            len: self.encoded_len(),
            max: u16::MAX as usize,
        })?;
        let mut out = Vec::with_capacity(self.encoded_len());
        out.extend_from_slice(&self.cache.0.to_be_bytes());
        out.extend_from_slice(&self.version.to_be_bytes());
        out.extend_from_slice(&self.expire_at.to_be_bytes());
        out.extend_from_slice(&key_len.to_be_bytes());
        out.extend_from_slice(&(self.value.len() as u32).to_be_bytes());
        out.extend_from_slice(&self.key);
        out.extend_from_slice(&self.value);
        Ok(out)
    }

    /// Parses a page record.
    pub fn decode(rec: &[u8]) -> Result<Self> {
        let mut r = Reader::new(rec);
        let cache = CacheId(r.u32()?);
        let version = r.u64()?;
        let expire_at = r.u64()?;
        let key_len = r.u16()? as usize;
        let value_len = r.u32()? as usize;
        let key = r.take(key_len)?.to_vec();
        let value = r.take(value_len)?.to_vec();
        r.finish()?;
        Ok(Row {
            cache,
            key,
            value,
            version,
            expire_at,
        })
    }
}

/// Row heap of one data partition.
///
/// Inserts go to the current hint page until it is full; pages whose last row
/// is removed go back to the partition's reuse list. Updates stay in place
/// when the page has room and relocate otherwise.
pub struct RowStore {
    memory: Arc<PageMemory>,
    group: GroupId,
    partition: PartitionId,
    pages: Arc<ReuseList>,
    hint: Mutex<PageIdx>,
}

impl RowStore {
    /// Row store continuing to fill `hint`.
    pub fn new(
        memory: Arc<PageMemory>,
        group: GroupId,
        partition: PartitionId,
        pages: Arc<ReuseList>,
        hint: PageIdx,
    ) -> Self {
        Self {
            memory,
            group,
            partition,
            pages,
            hint: Mutex::new(hint),
        }
    }

    /// Data page currently receiving inserts.
    pub fn hint(&self) -> PageIdx {
        *self.hint.lock()
    }

    /// Largest encoded row the store accepts.
    pub fn max_row_len(&self) -> usize {
        page::max_record_len(self.memory.page_size())
    }

    fn page_id(&self, index: PageIdx) -> FullPageId {
        FullPageId::new(self.group, self.partition, index)
    }

    fn check_link(&self, link: Link) -> Result<FullPageId> {
        if link.is_none() || link.partition() != self.partition {
            return Err(StrataError::Invalid("link does not belong to this partition"));
        }
        Ok(link.page_id(self.group))
    }

    fn encode(&self, row: &Row) -> Result<Vec<u8>> {
        let max = self.max_row_len();
        let len = row.encoded_len();
        if len > max {
            return Err(StrataError::RowTooLarge { len, max });
        }
        row.encode()
    }

    /// Stores `row` and returns its link.
    pub fn insert(&self, guard: &CheckpointReadGuard, row: &Row) -> Result<Link> {
        let rec = self.encode(row)?;
        let mut hint = self.hint.lock();
        self.insert_record(guard, &mut hint, &rec)
    }

    fn insert_record(&self, guard: &CheckpointReadGuard, hint: &mut PageIdx, rec: &[u8]) -> Result<Link> {
        if !hint.is_none() {
            let id = self.page_id(*hint);
            let mut data = self.memory.write_page(guard, id)?;
            if let Some(slot) = page::insert(data.data_mut(), rec)? {
                return Ok(Link::new(self.partition, id.index, slot));
            }
        }
        let id = self.pages.allocate(guard)?;
        let mut data = self.memory.write_page(guard, id)?;
        page::init(data.data_mut(), id)?;
        let slot = page::insert(data.data_mut(), rec)?
            .ok_or(StrataError::Corruption("record does not fit an empty data page"))?;
        *hint = id.index;
        trace!(partition = self.partition.0, page = id.index.0, "rows.page.new");
        Ok(Link::new(self.partition, id.index, slot))
    }

    /// Reads the row at `link`.
    pub fn read(&self, guard: &CheckpointReadGuard, link: Link) -> Result<Row> {
        let id = self.check_link(link)?;
        let data = self.memory.read_page(guard, id)?;
        let rec = page::record(&data, link.slot())?
            .ok_or(StrataError::Corruption("link points at a free slot"))?;
        Row::decode(rec)
    }

    /// Rewrites the row at `link` in place.
    ///
    /// Returns false, leaving the old row untouched, when its page has no room;
    /// the caller then inserts the row elsewhere and removes the old one once
    /// nothing references it.
    pub fn try_update(&self, guard: &CheckpointReadGuard, link: Link, row: &Row) -> Result<bool> {
        let id = self.check_link(link)?;
        let rec = self.encode(row)?;
        let mut data = self.memory.write_page(guard, id)?;
        page::update(data.data_mut(), link.slot(), &rec)
    }

    /// Removes the row at `link`.
    pub fn remove(&self, guard: &CheckpointReadGuard, link: Link) -> Result<()> {
        self.check_link(link)?;
        let hint = self.hint.lock();
        let id = link.page_id(self.group);
        let left = {
            let mut data = self.memory.write_page(guard, id)?;
            page::remove(data.data_mut(), link.slot())?
        };
        if left == 0 && id.index != *hint {
            self.pages.release(guard, id.index)?;
            trace!(partition = self.partition.0, page = id.index.0, "rows.page.released");
        }
        Ok(())
    }
}
