use std::collections::VecDeque;
use std::ops::Bound;

use crate::primitives::concurrency::CheckpointReadGuard;
use crate::types::Result;

use super::page::LeafView;
use super::tree::BTree;

/// Forward cursor over a key range of a [`BTree`].
///
/// The cursor buffers the entries of one leaf and holds no latch or structure
/// lock between calls; each refill re-descends from the last returned key, so
/// concurrent splits between calls are harmless.
pub struct Cursor<'a> {
    tree: &'a BTree,
    guard: &'a CheckpointReadGuard,
    lower: Bound<Vec<u8>>,
    upper: Bound<Vec<u8>>,
    buffer: VecDeque<(Vec<u8>, Vec<u8>)>,
    done: bool,
}

impl<'a> Cursor<'a> {
    pub(crate) fn new(
        tree: &'a BTree,
        guard: &'a CheckpointReadGuard,
        lower: Bound<&[u8]>,
        upper: Bound<&[u8]>,
    ) -> Self {
        let done = range_is_empty(&lower, &upper);
        Self {
            tree,
            guard,
            lower: lower.map(<[u8]>::to_vec),
            upper: upper.map(<[u8]>::to_vec),
            buffer: VecDeque::new(),
            done,
        }
    }

    /// Advances the cursor and returns the next entry, if any.
    pub fn next_entry(&mut self) -> Result<Option<(Vec<u8>, Vec<u8>)>> {
        loop {
            if let Some((key, value)) = self.buffer.pop_front() {
                self.lower = Bound::Excluded(key.clone());
                return Ok(Some((key, value)));
            }
            if self.done {
                return Ok(None);
            }
            self.refill()?;
        }
    }

    fn refill(&mut self) -> Result<()> {
        let tree = self.tree;
        let root = tree.read_root();
        let start = match &self.lower {
            Bound::Included(k) | Bound::Excluded(k) => Some(k.as_slice()),
            Bound::Unbounded => None,
        };
        let memory = tree.memory();
        let mut leaf_id = tree.find_leaf(self.guard, *root, start)?;
        loop {
            let page = memory.read_page(self.guard, leaf_id)?;
            let leaf = LeafView::new(&page)?;
            tree.stats().inc_leaf_searches();
            let mut idx = match &self.lower {
                Bound::Included(k) => leaf.search(k)?.unwrap_or_else(|i| i),
                Bound::Excluded(k) => match leaf.search(k)? {
                    Ok(i) => i + 1,
                    Err(i) => i,
                },
                Bound::Unbounded => 0,
            };
            while idx < leaf.len() {
                let (key, value) = leaf.entry(idx)?;
                if past_upper(&self.upper, key) {
                    self.done = true;
                    return Ok(());
                }
                self.buffer.push_back((key.to_vec(), value.to_vec()));
                idx += 1;
            }
            let next = leaf.right_sibling();
            if next.is_none() {
                self.done = true;
                return Ok(());
            }
            if !self.buffer.is_empty() {
                return Ok(());
            }
            leaf_id = leaf_id.with_index(next);
        }
    }
}

impl Iterator for Cursor<'_> {
    type Item = Result<(Vec<u8>, Vec<u8>)>;

    fn next(&mut self) -> Option<Self::Item> {
        self.next_entry().transpose()
    }
}

fn past_upper(upper: &Bound<Vec<u8>>, key: &[u8]) -> bool {
    match upper {
        Bound::Included(u) => key > u.as_slice(),
        Bound::Excluded(u) => key >= u.as_slice(),
        Bound::Unbounded => false,
    }
}

fn range_is_empty(lower: &Bound<&[u8]>, upper: &Bound<&[u8]>) -> bool {
    match (lower, upper) {
        (Bound::Included(l), Bound::Included(u)) => l > u,
        (Bound::Included(l), Bound::Excluded(u))
        | (Bound::Excluded(l), Bound::Included(u))
        | (Bound::Excluded(l), Bound::Excluded(u)) => l >= u,
        _ => false,
    }
}
