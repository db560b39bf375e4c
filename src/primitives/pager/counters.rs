//! Per-cache size counters page codec.
//!
//! Sizes of every cache in a partition are stored as `(cache id, size)` pairs in
//! a chain of `Counters` pages referenced from the partition meta page.

use crate::primitives::bytes::be;
use crate::types::page::PAGE_HDR_LEN;
use crate::types::{CacheId, PageIdx, PageIo, PageKind, Result};

const NEXT: usize = PAGE_HDR_LEN;
const COUNT: usize = PAGE_HDR_LEN + 4;
const ENTRIES: usize = PAGE_HDR_LEN + 8;
const ENTRY_LEN: usize = 12;

/// Number of `(cache, size)` pairs one page holds.
pub fn capacity(page_size: usize) -> usize {
    (page_size - ENTRIES) / ENTRY_LEN
}

/// Writes `entries` and the chain link into an initialized counters page.
pub fn write(page: &mut [u8], entries: &[(CacheId, i64)], next: PageIdx) {
    debug_assert!(entries.len() <= capacity(page.len()));
    be::put_u32(page, NEXT, next.0);
    be::put_u32(page, COUNT, entries.len() as u32);
    for (i, (cache, size)) in entries.iter().enumerate() {
        let at = ENTRIES + i * ENTRY_LEN;
        be::put_u32(page, at, cache.0);
        be::put_u64(page, at + 4, *size as u64);
    }
}

/// Reads the entries and the next page of the chain.
pub fn read(page: &[u8]) -> Result<(Vec<(CacheId, i64)>, PageIdx)> {
    PageIo::expect(page, PageKind::Counters)?;
    let count = (be::u32_at(page, COUNT) as usize).min(capacity(page.len()));
    let entries = (0..count)
        .map(|i| {
            let at = ENTRIES + i * ENTRY_LEN;
            (CacheId(be::u32_at(page, at)), be::u64_at(page, at + 4) as i64)
        })
        .collect();
    Ok((entries, PageIdx(be::u32_at(page, NEXT))))
}
