#![forbid(unsafe_code)]

//! Per-partition data store: primary tree, pending-expiry tree, row heap,
//! meta page, update counter and per-cache sizes.

mod counter;

use std::collections::BTreeMap;
use std::ops::Bound;
use std::sync::Arc;

use parking_lot::{Mutex, RwLock, RwLockWriteGuard};
use serde::Serialize;
use tracing::debug;

use crate::primitives::concurrency::CheckpointReadGuard;
use crate::primitives::pager::{counters, PageMemory, PartitionMeta, PartitionState};
use crate::storage::btree::{BTree, PageAllocator, VisitOptions, VisitSummary};
use crate::storage::rows::{ReuseList, Row, RowStore};
use crate::types::page::{self, PageFlag};
use crate::types::{
    CacheId, FullPageId, GroupId, Link, PageIdx, PageIo, PartitionId, Result, StrataError,
};

pub use counter::UpdateCounter;

const LINK_LEN: usize = 8;

/// Primary tree key: big-endian cache id followed by the row key.
pub fn primary_key(cache: CacheId, key: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(4 + key.len());
    out.extend_from_slice(&cache.0.to_be_bytes());
    out.extend_from_slice(key);
    out
}

/// Pending tree key: big-endian expiry followed by the row link.
pub fn pending_key(expire_at: u64, link: Link) -> [u8; 16] {
    let mut out = [0u8; 16];
    out[..8].copy_from_slice(&expire_at.to_be_bytes());
    out[8..].copy_from_slice(&link.to_be_bytes());
    out
}

/// Row replaced or removed by a mutation, with the link it lived at.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct StoredRow {
    pub link: Link,
    pub row: Row,
}

/// Result of [`PartitionWrite::put`].
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct PutOutcome {
    /// Link of the row as written.
    pub link: Link,
    pub old: Option<StoredRow>,
}

/// Row whose expiry time has passed.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct ExpiredRow {
    pub cache: CacheId,
    pub key: Vec<u8>,
    pub expire_at: u64,
}

/// Meta fields that defragmentation transplants into the new store.
#[derive(Clone, Debug, Default, PartialEq, Serialize)]
pub struct PartitionSnapshot {
    pub state: PartitionState,
    pub row_count: u64,
    pub counter: UpdateCounter,
    pub global_remove_id: u64,
    pub sizes: BTreeMap<CacheId, i64>,
}

/// Partition figures for reports.
#[derive(Clone, Debug, Serialize)]
pub struct PartitionStats {
    pub partition: u16,
    pub rows: u64,
    pub pages: u32,
    pub reusable_pages: u32,
    pub update_counter: u64,
    pub highest_counter: u64,
    pub counter_gaps: usize,
    pub global_remove_id: u64,
}

struct MetaState {
    snapshot: PartitionSnapshot,
    counters_head: PageIdx,
    gaps_link: Link,
    sizes_dirty: bool,
    gaps_dirty: bool,
}

/// Data store of one partition.
///
/// Mutations go through [`PartitionStore::write`], which serializes them; reads
/// share the same lock. Every mutation finishes by rewriting the meta page, so
/// a checkpoint always captures meta and trees of the same set of mutations.
pub struct PartitionStore {
    group: GroupId,
    partition: PartitionId,
    memory: Arc<PageMemory>,
    reuse: Arc<ReuseList>,
    rows: RowStore,
    primary: BTree,
    pending: BTree,
    state: Mutex<MetaState>,
    ops: RwLock<()>,
}

impl PartitionStore {
    /// Lays out a fresh partition in an empty, registered store.
    pub fn create(
        guard: &CheckpointReadGuard,
        memory: Arc<PageMemory>,
        group: GroupId,
        partition: PartitionId,
    ) -> Result<Self> {
        let meta_id = memory.allocate_page(guard, group, partition, PageFlag::Data)?;
        if meta_id.index != PageIdx::META {
            return Err(StrataError::Invalid("partition store is not empty"));
        }
        let reuse = ReuseList::new(Arc::clone(&memory), group, partition, PageIdx::NONE, 0);
        let alloc: Arc<dyn PageAllocator> = reuse.clone();
        let primary = BTree::create(guard, Arc::clone(&memory), Arc::clone(&alloc), tree_name(group, partition, "primary"))?;
        let pending = BTree::create(guard, Arc::clone(&memory), alloc, tree_name(group, partition, "pending"))?;
        let meta = PartitionMeta {
            primary_tree: primary.meta_page().index,
            pending_tree: pending.meta_page().index,
            ..PartitionMeta::default()
        };
        {
            let mut page = memory.write_page(guard, meta_id)?;
            PartitionMeta::init(page.data_mut(), meta_id, &meta)?;
        }
        let rows = RowStore::new(Arc::clone(&memory), group, partition, Arc::clone(&reuse), PageIdx::NONE);
        debug!(group = group.0, partition = partition.0, "partition.create");
        Ok(Self::assemble(
            memory,
            group,
            partition,
            reuse,
            rows,
            primary,
            pending,
            MetaState {
                snapshot: PartitionSnapshot::default(),
                counters_head: PageIdx::NONE,
                gaps_link: Link::NONE,
                sizes_dirty: false,
                gaps_dirty: false,
            },
        ))
    }

    /// Loads a partition from its meta page.
    pub fn open(
        guard: &CheckpointReadGuard,
        memory: Arc<PageMemory>,
        group: GroupId,
        partition: PartitionId,
    ) -> Result<Self> {
        let meta_id = FullPageId::new(group, partition, PageIdx::META);
        let meta = {
            let page = memory.read_page(guard, meta_id)?;
            PartitionMeta::decode(&page)?
        };
        let reuse = ReuseList::new(Arc::clone(&memory), group, partition, meta.reuse_head, meta.reuse_len);
        let alloc: Arc<dyn PageAllocator> = reuse.clone();
        let primary = BTree::open(
            guard,
            Arc::clone(&memory),
            Arc::clone(&alloc),
            meta_id.with_index(meta.primary_tree),
            tree_name(group, partition, "primary"),
        )?;
        let pending = BTree::open(
            guard,
            Arc::clone(&memory),
            alloc,
            meta_id.with_index(meta.pending_tree),
            tree_name(group, partition, "pending"),
        )?;
        let rows = RowStore::new(Arc::clone(&memory), group, partition, Arc::clone(&reuse), meta.data_hint);
        let ranges = if meta.gaps_link.is_none() {
            Vec::new()
        } else {
            UpdateCounter::decode_ranges(&rows.read(guard, meta.gaps_link)?.value)?
        };
        let sizes = read_sizes(guard, &memory, meta_id, meta.counters_head)?;
        debug!(
            group = group.0,
            partition = partition.0,
            rows = meta.row_count,
            counter = meta.counter_lwm,
            "partition.open"
        );
        Ok(Self::assemble(
            memory,
            group,
            partition,
            reuse,
            rows,
            primary,
            pending,
            MetaState {
                snapshot: PartitionSnapshot {
                    state: meta.state,
                    row_count: meta.row_count,
                    counter: UpdateCounter::new(meta.counter_lwm, meta.counter_hwm, ranges),
                    global_remove_id: meta.global_remove_id,
                    sizes,
                },
                counters_head: meta.counters_head,
                gaps_link: meta.gaps_link,
                sizes_dirty: false,
                gaps_dirty: false,
            },
        ))
    }

    /// Opens the partition, laying it out first when the store is empty.
    pub fn open_or_create(
        guard: &CheckpointReadGuard,
        memory: Arc<PageMemory>,
        group: GroupId,
        partition: PartitionId,
    ) -> Result<Self> {
        if memory.store(group, partition)?.allocated() <= PageIdx::META.0 {
            Self::create(guard, memory, group, partition)
        } else {
            Self::open(guard, memory, group, partition)
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn assemble(
        memory: Arc<PageMemory>,
        group: GroupId,
        partition: PartitionId,
        reuse: Arc<ReuseList>,
        rows: RowStore,
        primary: BTree,
        pending: BTree,
        state: MetaState,
    ) -> Self {
        Self {
            group,
            partition,
            memory,
            reuse,
            rows,
            primary,
            pending,
            state: Mutex::new(state),
            ops: RwLock::new(()),
        }
    }

    pub fn group(&self) -> GroupId {
        self.group
    }

    pub fn partition(&self) -> PartitionId {
        self.partition
    }

    /// Primary `(cache || key) -> link` tree.
    pub fn primary(&self) -> &BTree {
        &self.primary
    }

    /// Pending `(expiry || link)` tree.
    pub fn pending(&self) -> &BTree {
        &self.pending
    }

    fn meta_page(&self) -> FullPageId {
        FullPageId::new(self.group, self.partition, PageIdx::META)
    }

    /// Starts a serialized mutation.
    pub fn write(&self) -> PartitionWrite<'_> {
        PartitionWrite {
            store: self,
            _ops: self.ops.write(),
        }
    }

    /// Fails when a put of this shape could not be stored.
    pub fn check_put(&self, cache: CacheId, key: &[u8], value: &[u8]) -> Result<()> {
        let entry = 4 + key.len() + LINK_LEN;
        let max = self.primary.max_entry_len();
        if entry > max {
            return Err(StrataError::KeyTooLarge { len: entry, max });
        }
        let row = Row {
            cache,
            key: key.to_vec(),
            value: value.to_vec(),
            version: 0,
            expire_at: 0,
        };
        let len = row.encoded_len();
        let max = self.rows.max_row_len();
        if len > max {
            return Err(StrataError::RowTooLarge { len, max });
        }
        Ok(())
    }

    /// Point lookup.
    pub fn get(&self, guard: &CheckpointReadGuard, cache: CacheId, key: &[u8]) -> Result<Option<StoredRow>> {
        let _ops = self.ops.read();
        self.lookup(guard, &primary_key(cache, key))
    }

    fn lookup(&self, guard: &CheckpointReadGuard, pkey: &[u8]) -> Result<Option<StoredRow>> {
        match self.primary.get(guard, pkey)? {
            Some(raw) => {
                let link = Link::from_be_slice(&raw)?;
                let row = self.rows.read(guard, link)?;
                Ok(Some(StoredRow { link, row }))
            }
            None => Ok(None),
        }
    }

    /// Reads the row at `link`.
    pub fn read_row(&self, guard: &CheckpointReadGuard, link: Link) -> Result<Row> {
        let _ops = self.ops.read();
        self.rows.read(guard, link)
    }

    /// Rows of `cache` with keys inside the bounds, in key order.
    pub fn scan(
        &self,
        guard: &CheckpointReadGuard,
        cache: CacheId,
        lower: Bound<&[u8]>,
        upper: Bound<&[u8]>,
        limit: Option<usize>,
    ) -> Result<Vec<StoredRow>> {
        let _ops = self.ops.read();
        let prefixed = |bound: Bound<&[u8]>| bound.map(|k| primary_key(cache, k));
        let lower = match prefixed(lower) {
            Bound::Unbounded => Bound::Included(cache.0.to_be_bytes().to_vec()),
            other => other,
        };
        let upper = match prefixed(upper) {
            Bound::Unbounded => match cache.0.checked_add(1) {
                Some(next) => Bound::Excluded(next.to_be_bytes().to_vec()),
                None => Bound::Unbounded,
            },
            other => other,
        };
        let mut out = Vec::new();
        let cursor = self.primary.find(guard, as_ref(&lower), as_ref(&upper));
        for entry in cursor {
            if limit.is_some_and(|limit| out.len() >= limit) {
                break;
            }
            let (_, raw) = entry?;
            let link = Link::from_be_slice(&raw)?;
            out.push(StoredRow {
                link,
                row: self.rows.read(guard, link)?,
            });
        }
        Ok(out)
    }

    /// Visits every row in primary key order, cycling the checkpoint read lock
    /// as configured by `options`.
    ///
    /// Takes no mutation lock; callers keep writers away themselves.
    pub fn visit<F>(
        &self,
        guard: &mut CheckpointReadGuard,
        options: &VisitOptions,
        mut visitor: F,
    ) -> Result<VisitSummary>
    where
        F: FnMut(&CheckpointReadGuard, Link, Row) -> Result<bool>,
    {
        let rows = &self.rows;
        self.primary.visit(guard, options, |guard, _, raw| {
            let link = Link::from_be_slice(raw)?;
            visitor(guard, link, rows.read(guard, link)?)
        })
    }

    /// Rows whose expiry is at or before `now`, earliest first.
    pub fn expired(&self, guard: &CheckpointReadGuard, now: u64, limit: usize) -> Result<Vec<ExpiredRow>> {
        let _ops = self.ops.read();
        let upper = now.saturating_add(1).to_be_bytes();
        let mut out = Vec::new();
        for entry in self.pending.find(guard, Bound::Unbounded, Bound::Excluded(&upper[..])) {
            if out.len() >= limit {
                break;
            }
            let (key, _) = entry?;
            let link = Link::from_be_slice(&key[8..])?;
            let row = self.rows.read(guard, link)?;
            out.push(ExpiredRow {
                cache: row.cache,
                key: row.key,
                expire_at: row.expire_at,
            });
        }
        Ok(out)
    }

    /// Copy of the transplantable meta fields.
    pub fn snapshot(&self) -> PartitionSnapshot {
        self.state.lock().snapshot.clone()
    }

    /// Current meta page contents.
    pub fn meta(&self) -> PartitionMeta {
        let state = self.state.lock();
        self.build_meta(&state)
    }

    /// Rows per cache.
    pub fn cache_sizes(&self) -> BTreeMap<CacheId, i64> {
        self.state.lock().snapshot.sizes.clone()
    }

    /// Figures for reports.
    pub fn stats(&self) -> Result<PartitionStats> {
        let pages = self.memory.store(self.group, self.partition)?.allocated();
        let state = self.state.lock();
        let snapshot = &state.snapshot;
        Ok(PartitionStats {
            partition: self.partition.0,
            rows: snapshot.row_count,
            pages,
            reusable_pages: self.reuse.len(),
            update_counter: snapshot.counter.get(),
            highest_counter: snapshot.counter.hwm(),
            counter_gaps: snapshot.counter.gaps().len(),
            global_remove_id: snapshot.global_remove_id,
        })
    }

    fn build_meta(&self, state: &MetaState) -> PartitionMeta {
        let (reuse_head, reuse_len) = self.reuse.persisted();
        let snapshot = &state.snapshot;
        PartitionMeta {
            state: snapshot.state,
            row_count: snapshot.row_count,
            counter_lwm: snapshot.counter.get(),
            counter_hwm: snapshot.counter.hwm(),
            global_remove_id: snapshot.global_remove_id,
            primary_tree: self.primary.meta_page().index,
            pending_tree: self.pending.meta_page().index,
            reuse_head,
            reuse_len,
            data_hint: self.rows.hint(),
            counters_head: state.counters_head,
            gaps_link: state.gaps_link,
        }
    }

    fn flush_meta(&self, guard: &CheckpointReadGuard, state: &mut MetaState) -> Result<()> {
        if state.gaps_dirty {
            self.write_gaps(guard, state)?;
            state.gaps_dirty = false;
        }
        if state.sizes_dirty {
            state.counters_head = self.write_sizes(guard, state.counters_head, &state.snapshot.sizes)?;
            state.sizes_dirty = false;
        }
        let meta = self.build_meta(state);
        let mut page = self.memory.write_page(guard, self.meta_page())?;
        meta.encode(page.data_mut())
    }

    fn write_gaps(&self, guard: &CheckpointReadGuard, state: &mut MetaState) -> Result<()> {
        let counter = &state.snapshot.counter;
        if !counter.has_out_of_order() {
            if !state.gaps_link.is_none() {
                self.rows.remove(guard, state.gaps_link)?;
                state.gaps_link = Link::NONE;
            }
            return Ok(());
        }
        let row = Row {
            cache: CacheId(0),
            key: Vec::new(),
            value: counter.encode_ranges(),
            version: counter.hwm(),
            expire_at: 0,
        };
        if !state.gaps_link.is_none() && self.rows.try_update(guard, state.gaps_link, &row)? {
            return Ok(());
        }
        let link = self.rows.insert(guard, &row)?;
        if !state.gaps_link.is_none() {
            self.rows.remove(guard, state.gaps_link)?;
        }
        state.gaps_link = link;
        Ok(())
    }

    fn write_sizes(
        &self,
        guard: &CheckpointReadGuard,
        head: PageIdx,
        sizes: &BTreeMap<CacheId, i64>,
    ) -> Result<PageIdx> {
        let mut chain = chain_pages(guard, &self.memory, self.meta_page(), head)?;
        let entries: Vec<(CacheId, i64)> = sizes.iter().map(|(c, s)| (*c, *s)).collect();
        let chunks: Vec<&[(CacheId, i64)]> = entries.chunks(counters::capacity(self.memory.page_size())).collect();
        while chain.len() < chunks.len() {
            chain.push(self.reuse.allocate(guard)?.index);
        }
        for extra in chain.split_off(chunks.len()) {
            self.reuse.release(guard, extra)?;
        }
        for (i, chunk) in chunks.iter().enumerate() {
            let id = self.meta_page().with_index(chain[i]);
            let next = chain.get(i + 1).copied().unwrap_or(PageIdx::NONE);
            let mut page = self.memory.write_page(guard, id)?;
            page::init_page(page.data_mut(), PageIo::CountersV1, id)?;
            counters::write(page.data_mut(), chunk, next);
        }
        Ok(chain.first().copied().unwrap_or(PageIdx::NONE))
    }

    fn apply_counter(state: &mut MetaState, counter: u64) {
        let had_ranges = state.snapshot.counter.has_out_of_order();
        state.snapshot.counter.update(counter);
        if had_ranges || state.snapshot.counter.has_out_of_order() {
            state.gaps_dirty = true;
        }
    }
}

/// Exclusive mutation scope of a [`PartitionStore`].
pub struct PartitionWrite<'a> {
    store: &'a PartitionStore,
    _ops: RwLockWriteGuard<'a, ()>,
}

impl PartitionWrite<'_> {
    /// Counter to assign to the next locally originated mutation.
    pub fn next_counter(&self) -> u64 {
        self.store.state.lock().snapshot.counter.next()
    }

    /// Point lookup inside the mutation scope.
    pub fn current(&self, guard: &CheckpointReadGuard, cache: CacheId, key: &[u8]) -> Result<Option<StoredRow>> {
        self.store.lookup(guard, &primary_key(cache, key))
    }

    /// Inserts or replaces a row.
    ///
    /// A replacement that no longer fits its slot moves the row: the returned
    /// link differs from the old one and the old slot is freed.
    pub fn put(
        &self,
        guard: &CheckpointReadGuard,
        cache: CacheId,
        key: &[u8],
        value: &[u8],
        expire_at: u64,
        counter: u64,
    ) -> Result<PutOutcome> {
        let s = self.store;
        s.check_put(cache, key, value)?;
        let pkey = primary_key(cache, key);
        let row = Row {
            cache,
            key: key.to_vec(),
            value: value.to_vec(),
            version: counter,
            expire_at,
        };
        let old = s.lookup(guard, &pkey)?;
        let link = match &old {
            Some(old) => {
                if old.row.expire_at != 0 {
                    s.pending.remove(guard, &pending_key(old.row.expire_at, old.link))?;
                }
                if s.rows.try_update(guard, old.link, &row)? {
                    old.link
                } else {
                    let link = s.rows.insert(guard, &row)?;
                    s.primary.putx(guard, &pkey, &link.to_be_bytes())?;
                    s.rows.remove(guard, old.link)?;
                    link
                }
            }
            None => {
                let link = s.rows.insert(guard, &row)?;
                s.primary.putx(guard, &pkey, &link.to_be_bytes())?;
                link
            }
        };
        if expire_at != 0 {
            s.pending.putx(guard, &pending_key(expire_at, link), &[])?;
        }
        let mut state = s.state.lock();
        if old.is_none() {
            state.snapshot.row_count += 1;
            *state.snapshot.sizes.entry(cache).or_insert(0) += 1;
            state.sizes_dirty = true;
        }
        PartitionStore::apply_counter(&mut state, counter);
        s.flush_meta(guard, &mut state)?;
        Ok(PutOutcome { link, old })
    }

    /// Removes a row. The counter is consumed even when the key is absent.
    pub fn remove(
        &self,
        guard: &CheckpointReadGuard,
        cache: CacheId,
        key: &[u8],
        counter: u64,
    ) -> Result<Option<StoredRow>> {
        let s = self.store;
        let removed = match s.primary.remove(guard, &primary_key(cache, key))? {
            Some(raw) => {
                let link = Link::from_be_slice(&raw)?;
                let row = s.rows.read(guard, link)?;
                if row.expire_at != 0 {
                    s.pending.remove(guard, &pending_key(row.expire_at, link))?;
                }
                s.rows.remove(guard, link)?;
                Some(StoredRow { link, row })
            }
            None => None,
        };
        let mut state = s.state.lock();
        if removed.is_some() {
            state.snapshot.row_count = state.snapshot.row_count.saturating_sub(1);
            *state.snapshot.sizes.entry(cache).or_insert(0) -= 1;
            state.snapshot.global_remove_id += 1;
            state.sizes_dirty = true;
        }
        PartitionStore::apply_counter(&mut state, counter);
        s.flush_meta(guard, &mut state)?;
        Ok(removed)
    }

    /// Stores a row copied from another store, leaving meta untouched.
    pub fn insert_copy(&self, guard: &CheckpointReadGuard, row: &Row) -> Result<Link> {
        let s = self.store;
        let link = s.rows.insert(guard, row)?;
        s.primary.putx(guard, &primary_key(row.cache, &row.key), &link.to_be_bytes())?;
        if row.expire_at != 0 {
            s.pending.putx(guard, &pending_key(row.expire_at, link), &[])?;
        }
        Ok(link)
    }

    /// Replaces the transplantable meta fields verbatim.
    pub fn copy_meta(&self, guard: &CheckpointReadGuard, source: &PartitionSnapshot) -> Result<()> {
        let s = self.store;
        let mut state = s.state.lock();
        state.snapshot = source.clone();
        state.sizes_dirty = true;
        state.gaps_dirty = true;
        s.flush_meta(guard, &mut state)
    }

    /// Rewrites the meta page from the in-memory state.
    pub fn flush(&self, guard: &CheckpointReadGuard) -> Result<()> {
        let mut state = self.store.state.lock();
        self.store.flush_meta(guard, &mut state)
    }
}

fn tree_name(group: GroupId, partition: PartitionId, tree: &str) -> String {
    format!("grp-{}/part-{}/{tree}", group.0, partition.0)
}

fn as_ref(bound: &Bound<Vec<u8>>) -> Bound<&[u8]> {
    match bound {
        Bound::Included(k) => Bound::Included(k.as_slice()),
        Bound::Excluded(k) => Bound::Excluded(k.as_slice()),
        Bound::Unbounded => Bound::Unbounded,
    }
}

fn chain_pages(
    guard: &CheckpointReadGuard,
    memory: &PageMemory,
    meta: FullPageId,
    head: PageIdx,
) -> Result<Vec<PageIdx>> {
    let limit = memory.store(meta.group, meta.partition)?.allocated() as usize;
    let mut chain = Vec::new();
    let mut next = head;
    while !next.is_none() {
        if chain.len() >= limit {
            return Err(StrataError::Corruption("cycle in counters page chain"));
        }
        let page = memory.read_page(guard, meta.with_index(next))?;
        chain.push(next);
        next = counters::read(&page)?.1;
    }
    Ok(chain)
}

fn read_sizes(
    guard: &CheckpointReadGuard,
    memory: &PageMemory,
    meta: FullPageId,
    head: PageIdx,
) -> Result<BTreeMap<CacheId, i64>> {
    let mut sizes = BTreeMap::new();
    for index in chain_pages(guard, memory, meta, head)? {
        let page = memory.read_page(guard, meta.with_index(index))?;
        sizes.extend(counters::read(&page)?.0);
    }
    Ok(sizes)
}
