//! Slotted data page layout.
//!
//! After the common header: slot count `u16`, free end `u16` (start of the
//! record area, which grows down from the page end), live count `u16` and
//! fragmented bytes `u16`. Slots follow, four bytes each: record offset and
//! record length. Offset zero marks a free slot. Slot numbers are stable for
//! the lifetime of a record, compaction only moves record bytes.

use crate::primitives::bytes::be;
use crate::types::page::{self, PAGE_HDR_LEN};
use crate::types::{FullPageId, PageIo, PageKind, Result, StrataError};

const SLOT_COUNT: usize = PAGE_HDR_LEN;
const FREE_END: usize = PAGE_HDR_LEN + 2;
const LIVE: usize = PAGE_HDR_LEN + 4;
const FRAG: usize = PAGE_HDR_LEN + 6;
const SLOTS: usize = PAGE_HDR_LEN + 8;
const SLOT_LEN: usize = 4;

/// Largest record a data page of `page_size` bytes can hold.
pub fn max_record_len(page_size: usize) -> usize {
    page_size - SLOTS - SLOT_LEN
}

/// Initializes an empty data page.
pub fn init(page: &mut [u8], id: FullPageId) -> Result<()> {
    page::init_page(page, PageIo::DataV1, id)?;
    let end = page.len() as u16;
    be::put_u16(page, FREE_END, end);
    Ok(())
}

fn check(page: &[u8]) -> Result<()> {
    PageIo::expect(page, PageKind::Data).map(drop)
}

fn slot_count(page: &[u8]) -> usize {
    be::u16_at(page, SLOT_COUNT) as usize
}

fn slot_at(page: &[u8], slot: usize) -> (usize, usize) {
    let off = SLOTS + slot * SLOT_LEN;
    (be::u16_at(page, off) as usize, be::u16_at(page, off + 2) as usize)
}

fn set_slot(page: &mut [u8], slot: usize, offset: usize, len: usize) {
    let off = SLOTS + slot * SLOT_LEN;
    be::put_u16(page, off, offset as u16);
    be::put_u16(page, off + 2, len as u16);
}

fn free_end(page: &[u8]) -> usize {
    be::u16_at(page, FREE_END) as usize
}

fn frag(page: &[u8]) -> usize {
    be::u16_at(page, FRAG) as usize
}

fn gap(page: &[u8]) -> usize {
    free_end(page).saturating_sub(SLOTS + slot_count(page) * SLOT_LEN)
}

/// Number of live records on the page.
pub fn live(page: &[u8]) -> usize {
    be::u16_at(page, LIVE) as usize
}

/// Bytes a new record could use, counting fragmented space and a new slot.
pub fn free_space(page: &[u8]) -> usize {
    let slot_cost = if first_free_slot(page).is_some() { 0 } else { SLOT_LEN };
    (gap(page) + frag(page)).saturating_sub(slot_cost)
}

/// Record bytes at `slot`, `None` for a free slot.
pub fn record(page: &[u8], slot: u16) -> Result<Option<&[u8]>> {
    check(page)?;
    let slot = slot as usize;
    if slot >= slot_count(page) {
        return Ok(None);
    }
    let (offset, len) = slot_at(page, slot);
    if offset == 0 {
        return Ok(None);
    }
    page.get(offset..offset + len)
        .map(Some)
        .ok_or(StrataError::Corruption("data slot outside page"))
}

/// Live `(slot, record)` pairs in slot order.
pub fn records(page: &[u8]) -> Result<Vec<(u16, &[u8])>> {
    check(page)?;
    let mut out = Vec::with_capacity(live(page));
    for slot in 0..slot_count(page) {
        if let Some(rec) = record(page, slot as u16)? {
            out.push((slot as u16, rec));
        }
    }
    Ok(out)
}

fn first_free_slot(page: &[u8]) -> Option<usize> {
    (0..slot_count(page)).find(|&slot| slot_at(page, slot).0 == 0)
}

/// Stores `rec` and returns its slot, or `None` when the page is too full.
pub fn insert(page: &mut [u8], rec: &[u8]) -> Result<Option<u16>> {
    check(page)?;
    let reuse = first_free_slot(page);
    let slot_cost = if reuse.is_some() { 0 } else { SLOT_LEN };
    if gap(page) + frag(page) < rec.len() + slot_cost {
        return Ok(None);
    }
    if gap(page) < rec.len() + slot_cost {
        compact(page)?;
    }
    let slot = match reuse {
        Some(slot) => slot,
        None => {
            let slot = slot_count(page);
            be::put_u16(page, SLOT_COUNT, (slot + 1) as u16);
            slot
        }
    };
    let offset = free_end(page) - rec.len();
    page[offset..offset + rec.len()].copy_from_slice(rec);
    be::put_u16(page, FREE_END, offset as u16);
    set_slot(page, slot, offset, rec.len());
    be::put_u16(page, LIVE, (live(page) + 1) as u16);
    Ok(Some(slot as u16))
}

/// Replaces the record at `slot`, keeping the slot number.
///
/// Returns false, leaving the page untouched, when the new record does not fit.
pub fn update(page: &mut [u8], slot: u16, rec: &[u8]) -> Result<bool> {
    check(page)?;
    let slot = slot as usize;
    if slot >= slot_count(page) {
        return Err(StrataError::Corruption("update of a missing data slot"));
    }
    let (offset, len) = slot_at(page, slot);
    if offset == 0 {
        return Err(StrataError::Corruption("update of a free data slot"));
    }
    if rec.len() <= len {
        page[offset..offset + rec.len()].copy_from_slice(rec);
        set_slot(page, slot, offset, rec.len());
        be::put_u16(page, FRAG, (frag(page) + len - rec.len()) as u16);
        return Ok(true);
    }
    if gap(page) + frag(page) + len < rec.len() {
        return Ok(false);
    }
    set_slot(page, slot, 0, 0);
    be::put_u16(page, FRAG, (frag(page) + len) as u16);
    if gap(page) < rec.len() {
        compact(page)?;
    }
    let offset = free_end(page) - rec.len();
    page[offset..offset + rec.len()].copy_from_slice(rec);
    be::put_u16(page, FREE_END, offset as u16);
    set_slot(page, slot, offset, rec.len());
    Ok(true)
}

/// Frees `slot`. Returns the number of live records left on the page.
pub fn remove(page: &mut [u8], slot: u16) -> Result<usize> {
    check(page)?;
    let slot = slot as usize;
    let (offset, len) = if slot < slot_count(page) {
        slot_at(page, slot)
    } else {
        (0, 0)
    };
    if offset == 0 {
        return Err(StrataError::Corruption("remove of a free data slot"));
    }
    set_slot(page, slot, 0, 0);
    be::put_u16(page, FRAG, (frag(page) + len) as u16);
    let left = live(page) - 1;
    be::put_u16(page, LIVE, left as u16);
    let mut count = slot_count(page);
    while count > 0 && slot_at(page, count - 1).0 == 0 {
        count -= 1;
    }
    be::put_u16(page, SLOT_COUNT, count as u16);
    if left == 0 {
        be::put_u16(page, FREE_END, page.len() as u16);
        be::put_u16(page, FRAG, 0);
    }
    Ok(left)
}

/// Moves live records to the end of the page, reclaiming fragmented space.
pub fn compact(page: &mut [u8]) -> Result<()> {
    check(page)?;
    let live_records: Vec<(usize, Vec<u8>)> = records(page)?
        .into_iter()
        .map(|(slot, rec)| (slot as usize, rec.to_vec()))
        .collect();
    let mut end = page.len();
    for (slot, rec) in &live_records {
        end -= rec.len();
        page[end..end + rec.len()].copy_from_slice(rec);
        set_slot(page, *slot, end, rec.len());
    }
    be::put_u16(page, FREE_END, end as u16);
    be::put_u16(page, FRAG, 0);
    Ok(())
}
