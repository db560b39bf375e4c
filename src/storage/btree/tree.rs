use std::ops::Bound;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::RwLock;
use tracing::{debug, trace};

use super::cursor::Cursor;
use super::page::{self, InnerView, LeafView};
use super::stats::{BTreeStats, BTreeStatsSnapshot};
use crate::primitives::bytes::be;
use crate::primitives::concurrency::{CancellationToken, CheckpointReadGuard};
use crate::primitives::pager::PageMemory;
use crate::types::page::{PageFlag, PAGE_HDR_LEN};
use crate::types::{FullPageId, GroupId, PageIdx, PageIo, PageKind, PartitionId, Result, StrataError};

const META_ROOT: usize = PAGE_HDR_LEN;
const META_HEIGHT: usize = PAGE_HDR_LEN + 4;

/// Source of fresh pages for a tree.
pub trait PageAllocator: Send + Sync {
    /// Returns an allocated page id; the caller initializes the page.
    fn allocate(&self, guard: &CheckpointReadGuard) -> Result<FullPageId>;
}

/// Allocator that always extends the partition's store.
pub struct StoreAllocator {
    memory: Arc<PageMemory>,
    group: GroupId,
    partition: PartitionId,
    flag: PageFlag,
}

impl StoreAllocator {
    /// Allocator for `(group, partition)` with pages of kind `flag`.
    pub fn new(memory: Arc<PageMemory>, group: GroupId, partition: PartitionId, flag: PageFlag) -> Arc<Self> {
        Arc::new(Self {
            memory,
            group,
            partition,
            flag,
        })
    }
}

impl PageAllocator for StoreAllocator {
    fn allocate(&self, guard: &CheckpointReadGuard) -> Result<FullPageId> {
        self.memory
            .allocate_page(guard, self.group, self.partition, self.flag)
    }
}

/// Options of [`BTree::visit`].
#[derive(Clone, Debug)]
pub struct VisitOptions {
    /// Hold time after which the checkpoint read lock is cycled between leaves.
    pub relock_after: Duration,
    /// Checked at every page boundary and around every relock.
    pub cancel: Option<CancellationToken>,
}

impl Default for VisitOptions {
    fn default() -> Self {
        Self {
            relock_after: Duration::from_millis(150),
            cancel: None,
        }
    }
}

/// Outcome of a [`BTree::visit`] call.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct VisitSummary {
    pub entries: u64,
    pub leaves: u64,
    pub relocks: u64,
    /// False when the visitor stopped the traversal.
    pub completed: bool,
}

#[derive(Clone, Copy, Debug)]
pub(crate) struct TreeRoot {
    pub root: PageIdx,
    pub height: u16,
}

#[derive(Clone, Copy)]
struct PathEntry {
    page_id: FullPageId,
    slot_index: usize,
}

/// Page-backed B+ tree over byte-string keys and values.
///
/// All operations run under a caller-held checkpoint read lock. Readers share
/// the structure lock, `put`/`remove` take it exclusively; the lock also guards
/// the cached root pointer. Removal never merges nodes.
pub struct BTree {
    name: String,
    memory: Arc<PageMemory>,
    allocator: Arc<dyn PageAllocator>,
    meta: FullPageId,
    structure: RwLock<TreeRoot>,
    stats: Arc<BTreeStats>,
}

impl BTree {
    /// Allocates a tree meta page and an empty root leaf.
    pub fn create(
        guard: &CheckpointReadGuard,
        memory: Arc<PageMemory>,
        allocator: Arc<dyn PageAllocator>,
        name: impl Into<String>,
    ) -> Result<Self> {
        let meta = allocator.allocate(guard)?;
        let root = allocator.allocate(guard)?;
        {
            let mut page = memory.write_page(guard, root)?;
            page::write_leaf::<&[u8], &[u8]>(page.data_mut(), root, &[], PageIdx::NONE)?;
        }
        let tree_root = TreeRoot {
            root: root.index,
            height: 1,
        };
        {
            let mut page = memory.write_page(guard, meta)?;
            page.init(PageIo::TreeMetaV1)?;
            write_meta(page.data_mut(), tree_root);
        }
        let name = name.into();
        debug!(tree = %name, meta = %meta, root = %root, "btree.create");
        Ok(Self {
            name,
            memory,
            allocator,
            meta,
            structure: RwLock::new(tree_root),
            stats: Arc::new(BTreeStats::default()),
        })
    }

    /// Opens the tree whose meta page is `meta`.
    pub fn open(
        guard: &CheckpointReadGuard,
        memory: Arc<PageMemory>,
        allocator: Arc<dyn PageAllocator>,
        meta: FullPageId,
        name: impl Into<String>,
    ) -> Result<Self> {
        let root = {
            let page = memory.read_page(guard, meta)?;
            PageIo::expect(&page, PageKind::TreeMeta)?;
            TreeRoot {
                root: PageIdx(be::u32_at(&page, META_ROOT)),
                height: be::u16_at(&page, META_HEIGHT),
            }
        };
        if root.root.is_none() || root.height == 0 {
            return Err(StrataError::Corruption("tree meta page without root"));
        }
        Ok(Self {
            name: name.into(),
            memory,
            allocator,
            meta,
            structure: RwLock::new(root),
            stats: Arc::new(BTreeStats::default()),
        })
    }

    /// Tree name used in logs.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Meta page of this tree.
    pub fn meta_page(&self) -> FullPageId {
        self.meta
    }

    /// Current root page.
    pub fn root_page(&self) -> FullPageId {
        self.meta.with_index(self.structure.read().root)
    }

    /// Number of levels, 1 for a single leaf.
    pub fn height(&self) -> u16 {
        self.structure.read().height
    }

    /// Live statistics counters.
    pub fn stats(&self) -> Arc<BTreeStats> {
        Arc::clone(&self.stats)
    }

    /// Snapshot of the statistics counters.
    pub fn stats_snapshot(&self) -> BTreeStatsSnapshot {
        self.stats.snapshot()
    }

    pub(crate) fn memory(&self) -> &Arc<PageMemory> {
        &self.memory
    }

    fn page_id(&self, index: PageIdx) -> FullPageId {
        self.meta.with_index(index)
    }

    /// Largest `key.len() + value.len()` an entry may have.
    pub fn max_entry_len(&self) -> usize {
        page::max_entry_len(self.memory.page_size())
    }

    fn check_entry(&self, key: &[u8], value: &[u8]) -> Result<()> {
        let len = key.len() + value.len();
        let max = self.max_entry_len();
        if len > max {
            return Err(StrataError::KeyTooLarge { len, max });
        }
        Ok(())
    }

    /// Descends to the leaf that covers `key`, or the leftmost leaf for `None`.
    pub(crate) fn find_leaf(
        &self,
        guard: &CheckpointReadGuard,
        root: TreeRoot,
        key: Option<&[u8]>,
    ) -> Result<FullPageId> {
        let mut current = self.page_id(root.root);
        for _ in 1..root.height {
            let page = self.memory.read_page(guard, current)?;
            let inner = InnerView::new(&page)?;
            self.stats.inc_inner_searches();
            let child = match key {
                Some(key) => inner.child_for(key)?,
                None => inner.child(0)?,
            };
            current = self.page_id(child);
        }
        Ok(current)
    }

    fn find_path(
        &self,
        guard: &CheckpointReadGuard,
        root: TreeRoot,
        key: &[u8],
    ) -> Result<(Vec<PathEntry>, FullPageId)> {
        let mut path = Vec::with_capacity(root.height as usize);
        let mut current = self.page_id(root.root);
        for _ in 1..root.height {
            let page = self.memory.read_page(guard, current)?;
            let inner = InnerView::new(&page)?;
            self.stats.inc_inner_searches();
            let slot_index = inner.child_slot(key)?;
            path.push(PathEntry {
                page_id: current,
                slot_index,
            });
            current = self.page_id(inner.child(slot_index)?);
        }
        Ok((path, current))
    }

    pub(crate) fn read_root(&self) -> parking_lot::RwLockReadGuard<'_, TreeRoot> {
        self.structure.read()
    }

    /// Point lookup.
    pub fn get(&self, guard: &CheckpointReadGuard, key: &[u8]) -> Result<Option<Vec<u8>>> {
        let root = self.structure.read();
        let leaf_id = self.find_leaf(guard, *root, Some(key))?;
        let page = self.memory.read_page(guard, leaf_id)?;
        let leaf = LeafView::new(&page)?;
        self.stats.inc_leaf_searches();
        match leaf.search(key)? {
            Ok(idx) => Ok(Some(leaf.entry(idx)?.1.to_vec())),
            Err(_) => Ok(None),
        }
    }

    /// Inserts or replaces `key`, returning the previous value.
    pub fn put(&self, guard: &CheckpointReadGuard, key: &[u8], value: &[u8]) -> Result<Option<Vec<u8>>> {
        self.check_entry(key, value)?;
        let mut root = self.structure.write();
        let (path, leaf_id) = self.find_path(guard, *root, key)?;
        let (old, split) = {
            let mut page = self.memory.write_page(guard, leaf_id)?;
            let (mut entries, right) = {
                let leaf = LeafView::new(&page)?;
                (leaf.to_entries()?, leaf.right_sibling())
            };
            self.stats.inc_leaf_searches();
            let old = match entries.binary_search_by(|(k, _)| k.as_slice().cmp(key)) {
                Ok(idx) => Some(std::mem::replace(&mut entries[idx].1, value.to_vec())),
                Err(idx) => {
                    entries.insert(idx, (key.to_vec(), value.to_vec()));
                    None
                }
            };
            let split = self.write_leaf_or_split(guard, &mut page, leaf_id, entries, right)?;
            (old, split)
        };
        if let Some((separator, new_page)) = split {
            self.propagate_split(guard, &mut root, path, separator, new_page)?;
        }
        Ok(old)
    }

    /// Inserts or replaces `key` without returning the previous value.
    pub fn putx(&self, guard: &CheckpointReadGuard, key: &[u8], value: &[u8]) -> Result<()> {
        self.put(guard, key, value).map(drop)
    }

    fn write_leaf_or_split(
        &self,
        guard: &CheckpointReadGuard,
        page: &mut crate::primitives::pager::PageWrite<'_>,
        leaf_id: FullPageId,
        entries: Vec<(Vec<u8>, Vec<u8>)>,
        right: PageIdx,
    ) -> Result<Option<(Vec<u8>, PageIdx)>> {
        let need = page::leaf_space(entries.iter().map(|(k, v)| (k.as_slice(), v.as_slice())));
        if need <= self.memory.page_size() {
            page::write_leaf(page.data_mut(), leaf_id, &entries, right)?;
            return Ok(None);
        }
        let sizes: Vec<usize> = entries
            .iter()
            .map(|(k, v)| page::leaf_entry_space(k, v))
            .collect();
        let mid = page::split_point(&sizes);
        let new_id = self.allocator.allocate(guard)?;
        let separator = entries[mid].0.clone();
        {
            let mut sibling = self.memory.write_page(guard, new_id)?;
            page::write_leaf(sibling.data_mut(), new_id, &entries[mid..], right)?;
        }
        page::write_leaf(page.data_mut(), leaf_id, &entries[..mid], new_id.index)?;
        self.stats.inc_leaf_splits();
        trace!(tree = %self.name, left = %leaf_id, right = %new_id, "btree.leaf.split");
        Ok(Some((separator, new_id.index)))
    }

    fn propagate_split(
        &self,
        guard: &CheckpointReadGuard,
        root: &mut TreeRoot,
        mut path: Vec<PathEntry>,
        mut separator: Vec<u8>,
        mut new_child: PageIdx,
    ) -> Result<()> {
        let mut left_child = None;
        while let Some(entry) = path.pop() {
            let mut page = self.memory.write_page(guard, entry.page_id)?;
            let (leftmost, mut entries) = InnerView::new(&page)?.to_entries()?;
            entries.insert(entry.slot_index, (separator, new_child));
            let need = page::inner_space(entries.iter().map(|(k, _)| k.as_slice()));
            if need <= self.memory.page_size() {
                page::write_inner(page.data_mut(), entry.page_id, leftmost, &entries)?;
                return Ok(());
            }
            let sizes: Vec<usize> = entries.iter().map(|(k, _)| page::inner_entry_space(k)).collect();
            let mid = page::split_point(&sizes);
            let new_id = self.allocator.allocate(guard)?;
            let (promoted, right_leftmost) = entries[mid].clone();
            {
                let mut sibling = self.memory.write_page(guard, new_id)?;
                page::write_inner(sibling.data_mut(), new_id, right_leftmost, &entries[mid + 1..])?;
            }
            page::write_inner(page.data_mut(), entry.page_id, leftmost, &entries[..mid])?;
            self.stats.inc_inner_splits();
            separator = promoted;
            new_child = new_id.index;
            left_child = Some(entry.page_id.index);
        }
        let old_root = left_child.unwrap_or(root.root);
        let new_root = self.allocator.allocate(guard)?;
        {
            let mut page = self.memory.write_page(guard, new_root)?;
            page::write_inner(page.data_mut(), new_root, old_root, &[(separator, new_child)])?;
        }
        root.root = new_root.index;
        root.height += 1;
        {
            let mut meta = self.memory.write_page(guard, self.meta)?;
            write_meta(meta.data_mut(), *root);
        }
        self.stats.inc_root_splits();
        debug!(tree = %self.name, root = %new_root, height = root.height, "btree.root.split");
        Ok(())
    }

    /// Removes `key`, returning its value.
    pub fn remove(&self, guard: &CheckpointReadGuard, key: &[u8]) -> Result<Option<Vec<u8>>> {
        let root = self.structure.write();
        let leaf_id = self.find_leaf(guard, *root, Some(key))?;
        let mut page = self.memory.write_page(guard, leaf_id)?;
        let (mut entries, right) = {
            let leaf = LeafView::new(&page)?;
            if leaf.search(key)?.is_err() {
                return Ok(None);
            }
            (leaf.to_entries()?, leaf.right_sibling())
        };
        self.stats.inc_leaf_searches();
        let idx = entries
            .binary_search_by(|(k, _)| k.as_slice().cmp(key))
            .map_err(|_| StrataError::Corruption("leaf entry vanished under latch"))?;
        let (_, old) = entries.remove(idx);
        page::write_leaf(page.data_mut(), leaf_id, &entries, right)?;
        Ok(Some(old))
    }

    /// Lazy forward cursor over `[lower, upper]` with arbitrary bounds.
    pub fn find<'a>(
        &'a self,
        guard: &'a CheckpointReadGuard,
        lower: Bound<&[u8]>,
        upper: Bound<&[u8]>,
    ) -> Cursor<'a> {
        Cursor::new(self, guard, lower, upper)
    }

    /// Cursor over every entry.
    pub fn iter<'a>(&'a self, guard: &'a CheckpointReadGuard) -> Cursor<'a> {
        self.find(guard, Bound::Unbounded, Bound::Unbounded)
    }

    /// Counts entries by walking the leaf chain.
    pub fn size(&self, guard: &CheckpointReadGuard) -> Result<u64> {
        let root = self.structure.read();
        let mut leaf_id = self.find_leaf(guard, *root, None)?;
        let mut total = 0u64;
        loop {
            let page = self.memory.read_page(guard, leaf_id)?;
            let leaf = LeafView::new(&page)?;
            total += leaf.len() as u64;
            let next = leaf.right_sibling();
            if next.is_none() {
                return Ok(total);
            }
            leaf_id = self.page_id(next);
        }
    }

    /// Walks every entry in key order.
    ///
    /// The visitor receives the caller's guard so it can read other pages
    /// under the same lock hold.
    ///
    /// Between leaves, once the checkpoint read lock has been held longer than
    /// `relock_after`, both the tree structure lock and the checkpoint read lock
    /// are released and reacquired; the walk then re-descends from the last
    /// delivered key. Leaf layouts are checked before interpretation.
    pub fn visit<F>(
        &self,
        guard: &mut CheckpointReadGuard,
        options: &VisitOptions,
        mut visitor: F,
    ) -> Result<VisitSummary>
    where
        F: FnMut(&CheckpointReadGuard, &[u8], &[u8]) -> Result<bool>,
    {
        let mut summary = VisitSummary::default();
        let mut resume: Option<Vec<u8>> = None;
        // Leaf to continue from when nothing was delivered before a relock.
        let mut pending: Option<FullPageId> = None;
        let check_cancel = || match &options.cancel {
            Some(token) => token.check(),
            None => Ok(()),
        };
        loop {
            check_cancel()?;
            let root = self.structure.read();
            let mut leaf_id = match (pending.take(), resume.as_deref()) {
                (Some(leaf), None) => leaf,
                (_, key) => self.find_leaf(guard, *root, key)?,
            };
            loop {
                let next = {
                    let page = self.memory.read_page(guard, leaf_id)?;
                    check_leaf_layout(&page)?;
                    let leaf = LeafView::new(&page)?;
                    let start = match resume.as_deref() {
                        Some(last) => match leaf.search(last)? {
                            Ok(idx) => idx + 1,
                            Err(idx) => idx,
                        },
                        None => 0,
                    };
                    for idx in start..leaf.len() {
                        let (key, value) = leaf.entry(idx)?;
                        summary.entries += 1;
                        if !visitor(guard, key, value)? {
                            return Ok(summary);
                        }
                        resume = Some(key.to_vec());
                    }
                    leaf.right_sibling()
                };
                summary.leaves += 1;
                self.stats.inc_visited_leaves();
                if next.is_none() {
                    summary.completed = true;
                    return Ok(summary);
                }
                check_cancel()?;
                leaf_id = self.page_id(next);
                if guard.held_for() >= options.relock_after {
                    pending = Some(leaf_id);
                    break;
                }
            }
            drop(root);
            if guard.relock() {
                summary.relocks += 1;
                self.stats.inc_visit_relocks();
                trace!(tree = %self.name, entries = summary.entries, "btree.visit.relock");
            }
        }
    }
}

fn write_meta(page: &mut [u8], root: TreeRoot) {
    be::put_u32(page, META_ROOT, root.root.0);
    be::put_u16(page, META_HEIGHT, root.height);
}

/// Fails with a data-format error unless `page` is a leaf of a supported layout.
pub(crate) fn check_leaf_layout(page: &[u8]) -> Result<()> {
    match PageIo::of(page) {
        Ok(Some(PageIo::TreeLeafV1)) => Ok(()),
        Ok(Some(other)) => Err(StrataError::DataFormat(format!(
            "expected a tree leaf, found {other:?}"
        ))),
        Ok(None) => Err(StrataError::DataFormat("tree leaf page is not initialized".into())),
        Err(StrataError::UnsupportedPageVersion { kind, version }) => Err(StrataError::DataFormat(
            format!("unsupported {kind:?} layout version {version}"),
        )),
        Err(err) => Err(err),
    }
}
