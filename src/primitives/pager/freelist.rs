//! Reuse-list page codec.
//!
//! A reuse list is a chain of `FreeList` pages; each holds the next page of the
//! chain and a stack of free page indexes. The chain head lives in the partition
//! meta page.

use crate::primitives::bytes::be;
use crate::types::page::PAGE_HDR_LEN;
use crate::types::{PageIdx, PageIo, PageKind, Result};

const NEXT: usize = PAGE_HDR_LEN;
const COUNT: usize = PAGE_HDR_LEN + 4;
const ENTRIES: usize = PAGE_HDR_LEN + 8;

/// Number of entries a reuse-list page can hold.
pub fn capacity(page_size: usize) -> usize {
    (page_size - ENTRIES) / 4
}

/// Initializes the body of a reuse-list page. The header must already be written.
pub fn init(page: &mut [u8], next: PageIdx) {
    be::put_u32(page, NEXT, next.0);
    be::put_u32(page, COUNT, 0);
}

/// Next page of the chain.
pub fn next(page: &[u8]) -> Result<PageIdx> {
    PageIo::expect(page, PageKind::FreeList)?;
    Ok(PageIdx(be::u32_at(page, NEXT)))
}

/// Entries stored on this page.
pub fn len(page: &[u8]) -> usize {
    be::u32_at(page, COUNT) as usize
}

/// Pushes a free page; returns false when the page is full.
pub fn push(page: &mut [u8], idx: PageIdx) -> bool {
    let count = len(page);
    if count >= capacity(page.len()) {
        return false;
    }
    be::put_u32(page, ENTRIES + count * 4, idx.0);
    be::put_u32(page, COUNT, (count + 1) as u32);
    true
}

/// Pops the most recently pushed entry.
pub fn pop(page: &mut [u8]) -> Option<PageIdx> {
    let count = len(page);
    if count == 0 {
        return None;
    }
    let idx = PageIdx(be::u32_at(page, ENTRIES + (count - 1) * 4));
    be::put_u32(page, COUNT, (count - 1) as u32);
    Some(idx)
}
