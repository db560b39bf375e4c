use std::ops::Range;

use serde::Serialize;

use crate::primitives::bytes::be;
use crate::types::page::{self, PAGE_HDR_LEN};
use crate::types::{FullPageId, Link, PageIdx, PageIo, PageKind, Result, StrataError};

const META_STATE: usize = PAGE_HDR_LEN;
const META_ROW_COUNT: Range<usize> = PAGE_HDR_LEN + 8..PAGE_HDR_LEN + 16;
const META_COUNTER_LWM: Range<usize> = PAGE_HDR_LEN + 16..PAGE_HDR_LEN + 24;
const META_COUNTER_HWM: Range<usize> = PAGE_HDR_LEN + 24..PAGE_HDR_LEN + 32;
const META_GLOBAL_REMOVE_ID: Range<usize> = PAGE_HDR_LEN + 32..PAGE_HDR_LEN + 40;
const META_PRIMARY_TREE: Range<usize> = PAGE_HDR_LEN + 40..PAGE_HDR_LEN + 44;
const META_PENDING_TREE: Range<usize> = PAGE_HDR_LEN + 44..PAGE_HDR_LEN + 48;
const META_REUSE_HEAD: Range<usize> = PAGE_HDR_LEN + 48..PAGE_HDR_LEN + 52;
const META_REUSE_LEN: Range<usize> = PAGE_HDR_LEN + 52..PAGE_HDR_LEN + 56;
const META_DATA_HINT: Range<usize> = PAGE_HDR_LEN + 56..PAGE_HDR_LEN + 60;
// Version 2 fields.
const META_COUNTERS_HEAD: Range<usize> = PAGE_HDR_LEN + 60..PAGE_HDR_LEN + 64;
const META_GAPS_LINK: Range<usize> = PAGE_HDR_LEN + 64..PAGE_HDR_LEN + 72;

/// Lifecycle state of a partition as persisted in its meta page.
#[repr(u8)]
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq, Serialize)]
pub enum PartitionState {
    /// Serving reads and writes.
    #[default]
    Owning = 1,
    /// Being filled from another node.
    Moving = 2,
    /// Scheduled for removal.
    Evicted = 3,
}

impl PartitionState {
    fn from_u8(raw: u8) -> Result<Self> {
        match raw {
            1 => Ok(PartitionState::Owning),
            2 => Ok(PartitionState::Moving),
            3 => Ok(PartitionState::Evicted),
            _ => Err(StrataError::Corruption("unknown partition state")),
        }
    }
}

/// Decoded partition meta page.
#[derive(Clone, Debug, Default, PartialEq, Serialize)]
pub struct PartitionMeta {
    pub state: PartitionState,
    pub row_count: u64,
    /// Every counter up to and including this one has been applied.
    pub counter_lwm: u64,
    /// Highest counter applied so far.
    pub counter_hwm: u64,
    pub global_remove_id: u64,
    pub primary_tree: PageIdx,
    pub pending_tree: PageIdx,
    pub reuse_head: PageIdx,
    pub reuse_len: u32,
    /// Data page currently receiving inserts.
    pub data_hint: PageIdx,
    /// First page of the per-cache size chain.
    pub counters_head: PageIdx,
    /// Row holding the serialized out-of-order counter gaps.
    pub gaps_link: Link,
}

impl PartitionMeta {
    /// Writes a fresh version-2 meta page.
    pub fn init(page: &mut [u8], id: FullPageId, meta: &PartitionMeta) -> Result<()> {
        page::init_page(page, PageIo::PartitionMetaV2, id)?;
        meta.encode(page)
    }

    /// Decodes a meta page of either layout version.
    pub fn decode(page: &[u8]) -> Result<Self> {
        let io = PageIo::expect(page, PageKind::PartitionMeta)?;
        let mut meta = PartitionMeta {
            state: PartitionState::from_u8(page[META_STATE])?,
            row_count: u64_at(page, META_ROW_COUNT),
            counter_lwm: u64_at(page, META_COUNTER_LWM),
            counter_hwm: u64_at(page, META_COUNTER_HWM),
            global_remove_id: u64_at(page, META_GLOBAL_REMOVE_ID),
            primary_tree: PageIdx(be::u32_at(page, META_PRIMARY_TREE.start)),
            pending_tree: PageIdx(be::u32_at(page, META_PENDING_TREE.start)),
            reuse_head: PageIdx(be::u32_at(page, META_REUSE_HEAD.start)),
            reuse_len: be::u32_at(page, META_REUSE_LEN.start),
            data_hint: PageIdx(be::u32_at(page, META_DATA_HINT.start)),
            counters_head: PageIdx::NONE,
            gaps_link: Link::NONE,
        };
        if io == PageIo::PartitionMetaV2 {
            meta.counters_head = PageIdx(be::u32_at(page, META_COUNTERS_HEAD.start));
            meta.gaps_link = Link(u64_at(page, META_GAPS_LINK));
        }
        Ok(meta)
    }

    /// Encodes into an initialized meta page. Version 1 pages are upgraded in place.
    pub fn encode(&self, page: &mut [u8]) -> Result<()> {
        let io = PageIo::expect(page, PageKind::PartitionMeta)?;
        if io == PageIo::PartitionMetaV1 {
            be::put_u16(page, page::header::VERSION, PageIo::PartitionMetaV2.version());
        }
        page[META_STATE] = self.state as u8;
        page[META_ROW_COUNT].copy_from_slice(&self.row_count.to_be_bytes());
        page[META_COUNTER_LWM].copy_from_slice(&self.counter_lwm.to_be_bytes());
        page[META_COUNTER_HWM].copy_from_slice(&self.counter_hwm.to_be_bytes());
        page[META_GLOBAL_REMOVE_ID].copy_from_slice(&self.global_remove_id.to_be_bytes());
        page[META_PRIMARY_TREE].copy_from_slice(&self.primary_tree.0.to_be_bytes());
        page[META_PENDING_TREE].copy_from_slice(&self.pending_tree.0.to_be_bytes());
        page[META_REUSE_HEAD].copy_from_slice(&self.reuse_head.0.to_be_bytes());
        page[META_REUSE_LEN].copy_from_slice(&self.reuse_len.to_be_bytes());
        page[META_DATA_HINT].copy_from_slice(&self.data_hint.0.to_be_bytes());
        page[META_COUNTERS_HEAD].copy_from_slice(&self.counters_head.0.to_be_bytes());
        page[META_GAPS_LINK].copy_from_slice(&self.gaps_link.0.to_be_bytes());
        Ok(())
    }
}

fn u64_at(page: &[u8], range: Range<usize>) -> u64 {
    be::u64_at(page, range.start)
}
