//! Slotted node layouts of the B+ tree.
//!
//! Both node kinds share a 16-byte node header after the common page header:
//! slot count, start of the record area and one page link (right sibling for
//! leaves, leftmost child for inner nodes). The slot directory grows up from the
//! node header, records grow down from the page end.

use std::cmp::Ordering;

use crate::primitives::bytes::be;
use crate::types::page::{self, PAGE_HDR_LEN};
use crate::types::{FullPageId, PageIdx, PageIo, Result, StrataError};

const COUNT: usize = PAGE_HDR_LEN;
const FREE_END: usize = PAGE_HDR_LEN + 2;
const LINK: usize = PAGE_HDR_LEN + 4;
/// Node header length, following the common page header.
pub const NODE_HDR_LEN: usize = 16;
const SLOTS: usize = PAGE_HDR_LEN + NODE_HDR_LEN;
/// Slot directory entry: record offset and length.
pub const SLOT_LEN: usize = 4;
const LEAF_RECORD_HDR: usize = 4;
const INNER_RECORD_HDR: usize = 6;

/// Largest `key.len() + value.len()` accepted for a tree entry.
///
/// Any four entries fit one node, so a split always produces two valid pages.
pub fn max_entry_len(page_size: usize) -> usize {
    (page_size - SLOTS) / 4 - SLOT_LEN - LEAF_RECORD_HDR
}

/// Bytes a leaf needs to hold `entries`.
pub fn leaf_space<'a>(entries: impl IntoIterator<Item = (&'a [u8], &'a [u8])>) -> usize {
    SLOTS
        + entries
            .into_iter()
            .map(|(k, v)| SLOT_LEN + LEAF_RECORD_HDR + k.len() + v.len())
            .sum::<usize>()
}

/// Bytes an inner node needs to hold `separators`.
pub fn inner_space<'a>(separators: impl IntoIterator<Item = &'a [u8]>) -> usize {
    SLOTS
        + separators
            .into_iter()
            .map(|k| SLOT_LEN + INNER_RECORD_HDR + k.len())
            .sum::<usize>()
}

fn slot(page: &[u8], idx: usize) -> Result<&[u8]> {
    let at = SLOTS + idx * SLOT_LEN;
    let off = be::u16_at(page, at) as usize;
    let len = be::u16_at(page, at + 2) as usize;
    if off < SLOTS || off + len > page.len() {
        return Err(StrataError::Corruption("tree slot out of page bounds"));
    }
    Ok(&page[off..off + len])
}

fn checked_count(page: &[u8]) -> Result<usize> {
    let count = be::u16_at(page, COUNT) as usize;
    let free_end = be::u16_at(page, FREE_END) as usize;
    if SLOTS + count * SLOT_LEN > free_end.max(SLOTS) || free_end > page.len() {
        return Err(StrataError::Corruption("tree node slot directory overflows"));
    }
    Ok(count)
}

/// Read-only view of a leaf node.
#[derive(Clone, Copy)]
pub struct LeafView<'a> {
    page: &'a [u8],
    count: usize,
}

impl<'a> LeafView<'a> {
    /// Validates the layout and wraps `page`.
    pub fn new(page: &'a [u8]) -> Result<Self> {
        match PageIo::of(page)? {
            Some(PageIo::TreeLeafV1) => {}
            _ => return Err(StrataError::Corruption("expected a tree leaf page")),
        }
        Ok(Self {
            page,
            count: checked_count(page)?,
        })
    }

    /// Number of entries.
    pub fn len(&self) -> usize {
        self.count
    }

    /// Returns true for a leaf without entries.
    pub fn is_empty(&self) -> bool {
        self.count == 0
    }

    /// Right sibling, `NONE` for the last leaf.
    pub fn right_sibling(&self) -> PageIdx {
        PageIdx(be::u32_at(self.page, LINK))
    }

    /// Entry `idx` as `(key, value)`.
    pub fn entry(&self, idx: usize) -> Result<(&'a [u8], &'a [u8])> {
        let rec = slot(self.page, idx)?;
        if rec.len() < LEAF_RECORD_HDR {
            return Err(StrataError::Corruption("leaf record truncated"));
        }
        let klen = be::u16_at(rec, 0) as usize;
        let vlen = be::u16_at(rec, 2) as usize;
        if LEAF_RECORD_HDR + klen + vlen != rec.len() {
            return Err(StrataError::Corruption("leaf record length mismatch"));
        }
        let key = &rec[LEAF_RECORD_HDR..LEAF_RECORD_HDR + klen];
        Ok((key, &rec[LEAF_RECORD_HDR + klen..]))
    }

    /// Key of entry `idx`.
    pub fn key(&self, idx: usize) -> Result<&'a [u8]> {
        self.entry(idx).map(|(k, _)| k)
    }

    /// Binary search: `Ok(idx)` on a hit, `Err(insert_at)` otherwise.
    pub fn search(&self, key: &[u8]) -> Result<std::result::Result<usize, usize>> {
        let (mut lo, mut hi) = (0, self.count);
        while lo < hi {
            let mid = (lo + hi) / 2;
            match self.key(mid)?.cmp(key) {
                Ordering::Less => lo = mid + 1,
                Ordering::Greater => hi = mid,
                Ordering::Equal => return Ok(Ok(mid)),
            }
        }
        Ok(Err(lo))
    }

    /// Copies every entry out of the page.
    pub fn to_entries(&self) -> Result<Vec<(Vec<u8>, Vec<u8>)>> {
        (0..self.count)
            .map(|i| self.entry(i).map(|(k, v)| (k.to_vec(), v.to_vec())))
            .collect()
    }
}

/// Read-only view of an inner node.
///
/// Child `0` holds keys below the first separator; child `i + 1` holds keys at or
/// above separator `i`.
#[derive(Clone, Copy)]
pub struct InnerView<'a> {
    page: &'a [u8],
    count: usize,
}

impl<'a> InnerView<'a> {
    /// Validates the layout and wraps `page`.
    pub fn new(page: &'a [u8]) -> Result<Self> {
        match PageIo::of(page)? {
            Some(PageIo::TreeInnerV1) => {}
            _ => return Err(StrataError::Corruption("expected a tree inner page")),
        }
        Ok(Self {
            page,
            count: checked_count(page)?,
        })
    }

    /// Number of separators.
    pub fn len(&self) -> usize {
        self.count
    }

    /// Returns true when the node only has its leftmost child.
    pub fn is_empty(&self) -> bool {
        self.count == 0
    }

    fn record(&self, idx: usize) -> Result<(&'a [u8], PageIdx)> {
        let rec = slot(self.page, idx)?;
        if rec.len() < INNER_RECORD_HDR {
            return Err(StrataError::Corruption("inner record truncated"));
        }
        let klen = be::u16_at(rec, 0) as usize;
        if INNER_RECORD_HDR + klen != rec.len() {
            return Err(StrataError::Corruption("inner record length mismatch"));
        }
        Ok((&rec[INNER_RECORD_HDR..], PageIdx(be::u32_at(rec, 2))))
    }

    /// Separator `idx`.
    pub fn separator(&self, idx: usize) -> Result<&'a [u8]> {
        self.record(idx).map(|(k, _)| k)
    }

    /// Child pointer `idx` in `0..=len()`.
    pub fn child(&self, idx: usize) -> Result<PageIdx> {
        if idx == 0 {
            Ok(PageIdx(be::u32_at(self.page, LINK)))
        } else {
            self.record(idx - 1).map(|(_, child)| child)
        }
    }

    /// Index of the child whose range contains `key`.
    pub fn child_slot(&self, key: &[u8]) -> Result<usize> {
        let (mut lo, mut hi) = (0, self.count);
        while lo < hi {
            let mid = (lo + hi) / 2;
            if self.separator(mid)? <= key {
                lo = mid + 1;
            } else {
                hi = mid;
            }
        }
        Ok(lo)
    }

    /// Child page for `key`.
    pub fn child_for(&self, key: &[u8]) -> Result<PageIdx> {
        self.child(self.child_slot(key)?)
    }

    /// Copies the node out as `(leftmost, [(separator, child)])`.
    pub fn to_entries(&self) -> Result<(PageIdx, Vec<(Vec<u8>, PageIdx)>)> {
        let entries = (0..self.count)
            .map(|i| self.record(i).map(|(k, c)| (k.to_vec(), c)))
            .collect::<Result<Vec<_>>>()?;
        Ok((self.child(0)?, entries))
    }
}

fn finish_node(page: &mut [u8], count: usize, free_end: usize, link: PageIdx) {
    be::put_u16(page, COUNT, count as u16);
    be::put_u16(page, FREE_END, free_end as u16);
    be::put_u32(page, LINK, link.0);
}

/// Rewrites `page` as a leaf holding `entries` in order.
pub fn write_leaf<K: AsRef<[u8]>, V: AsRef<[u8]>>(
    page: &mut [u8],
    id: FullPageId,
    entries: &[(K, V)],
    right: PageIdx,
) -> Result<()> {
    let need = leaf_space(entries.iter().map(|(k, v)| (k.as_ref(), v.as_ref())));
    if need > page.len() {
        return Err(StrataError::Invalid("leaf entries exceed page"));
    }
    page::init_page(page, PageIo::TreeLeafV1, id)?;
    let mut end = page.len();
    for (i, (k, v)) in entries.iter().enumerate() {
        let (k, v) = (k.as_ref(), v.as_ref());
        let len = LEAF_RECORD_HDR + k.len() + v.len();
        end -= len;
        be::put_u16(page, end, k.len() as u16);
        be::put_u16(page, end + 2, v.len() as u16);
        page[end + LEAF_RECORD_HDR..end + LEAF_RECORD_HDR + k.len()].copy_from_slice(k);
        page[end + LEAF_RECORD_HDR + k.len()..end + len].copy_from_slice(v);
        be::put_u16(page, SLOTS + i * SLOT_LEN, end as u16);
        be::put_u16(page, SLOTS + i * SLOT_LEN + 2, len as u16);
    }
    finish_node(page, entries.len(), end, right);
    Ok(())
}

/// Rewrites `page` as an inner node.
pub fn write_inner<K: AsRef<[u8]>>(
    page: &mut [u8],
    id: FullPageId,
    leftmost: PageIdx,
    entries: &[(K, PageIdx)],
) -> Result<()> {
    let need = inner_space(entries.iter().map(|(k, _)| k.as_ref()));
    if need > page.len() {
        return Err(StrataError::Invalid("inner entries exceed page"));
    }
    page::init_page(page, PageIo::TreeInnerV1, id)?;
    let mut end = page.len();
    for (i, (k, child)) in entries.iter().enumerate() {
        let k = k.as_ref();
        let len = INNER_RECORD_HDR + k.len();
        end -= len;
        be::put_u16(page, end, k.len() as u16);
        be::put_u32(page, end + 2, child.0);
        page[end + INNER_RECORD_HDR..end + len].copy_from_slice(k);
        be::put_u16(page, SLOTS + i * SLOT_LEN, end as u16);
        be::put_u16(page, SLOTS + i * SLOT_LEN + 2, len as u16);
    }
    finish_node(page, entries.len(), end, leftmost);
    Ok(())
}

/// Index where a full node should be split so both halves hold about the same bytes.
pub fn split_point(sizes: &[usize]) -> usize {
    let total: usize = sizes.iter().sum();
    let mut acc = 0;
    for (i, size) in sizes.iter().enumerate() {
        acc += size;
        if acc * 2 >= total {
            return (i + 1).clamp(1, sizes.len().saturating_sub(1).max(1));
        }
    }
    sizes.len() / 2
}

/// Space one leaf entry uses, slot included.
pub fn leaf_entry_space(key: &[u8], value: &[u8]) -> usize {
    SLOT_LEN + LEAF_RECORD_HDR + key.len() + value.len()
}

/// Space one separator uses, slot included.
pub fn inner_entry_space(key: &[u8]) -> usize {
    SLOT_LEN + INNER_RECORD_HDR + key.len()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{GroupId, PartitionId};

    fn id(i: u32) -> FullPageId {
        FullPageId::new(GroupId(1), PartitionId(0), PageIdx(i))
    }

    #[test]
    fn leaf_layout_roundtrip_and_search() -> Result<()> {
        let mut page = vec![0u8; 512];
        let entries = vec![
            (b"apple".to_vec(), b"1".to_vec()),
            (b"kiwi".to_vec(), b"".to_vec()),
            (b"pear".to_vec(), b"333".to_vec()),
        ];
        write_leaf(&mut page, id(3), &entries, PageIdx(9))?;
        let view = LeafView::new(&page)?;
        assert_eq!(view.len(), 3);
        assert_eq!(view.right_sibling(), PageIdx(9));
        assert_eq!(view.entry(2)?, (&b"pear"[..], &b"333"[..]));
        assert_eq!(view.search(b"kiwi")?, Ok(1));
        assert_eq!(view.search(b"banana")?, Err(1));
        assert_eq!(view.search(b"zzz")?, Err(3));
        assert_eq!(view.to_entries()?, entries);
        Ok(())
    }

    #[test]
    fn inner_child_routing() -> Result<()> {
        let mut page = vec![0u8; 512];
        let entries = vec![(b"g".to_vec(), PageIdx(20)), (b"p".to_vec(), PageIdx(30))];
        write_inner(&mut page, id(4), PageIdx(10), &entries)?;
        let view = InnerView::new(&page)?;
        assert_eq!(view.child_for(b"a")?, PageIdx(10));
        assert_eq!(view.child_for(b"g")?, PageIdx(20));
        assert_eq!(view.child_for(b"m")?, PageIdx(20));
        assert_eq!(view.child_for(b"p")?, PageIdx(30));
        assert_eq!(view.child_for(b"z")?, PageIdx(30));
        Ok(())
    }

    #[test]
    fn oversized_content_is_refused() {
        let mut page = vec![0u8; 512];
        let big = vec![(vec![1u8; 300], vec![2u8; 300])];
        assert!(write_leaf(&mut page, id(1), &big, PageIdx::NONE).is_err());
    }

    #[test]
    fn corrupt_slot_is_detected() -> Result<()> {
        let mut page = vec![0u8; 512];
        write_leaf(&mut page, id(3), &[(b"k".to_vec(), b"v".to_vec())], PageIdx::NONE)?;
        be::put_u16(&mut page, SLOTS, 510);
        let view = LeafView::new(&page)?;
        assert!(view.entry(0).is_err());
        Ok(())
    }

    #[test]
    fn four_max_entries_fit_a_node() {
        let max = max_entry_len(4096);
        let key = vec![0u8; max];
        let entries: Vec<(&[u8], &[u8])> = (0..4).map(|_| (&key[..], &[][..])).collect();
        assert!(leaf_space(entries) <= 4096);
    }

    #[test]
    fn split_point_balances_bytes() {
        assert_eq!(split_point(&[10, 10, 10, 10]), 2);
        assert_eq!(split_point(&[100, 1, 1, 1]), 1);
        assert_eq!(split_point(&[1, 1, 1, 100]), 3);
    }
}
