use std::collections::{HashMap, HashSet, VecDeque};
use std::fmt;
use std::ops::{Deref, DerefMut};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::lock_api::{ArcRwLockReadGuard, ArcRwLockWriteGuard};
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use tracing::{debug, warn};

use super::frame::Frame;
use super::store::PageStore;
use crate::primitives::concurrency::{CheckpointReadGuard, LatchMode, PageLockTracker};
use crate::types::page::{self, PageFlag};
use crate::types::{FullPageId, GroupId, PageIo, PartitionId, Result, StrataError, WorkerId};

/// Receives page-dirty events; implemented by the write throttle.
pub trait DirtyThrottle: Send + Sync {
    /// Called after a clean page became dirty, outside every page latch.
    fn on_mark_dirty(&self, page_in_checkpoint: bool);
}

/// Sizing of one memory region.
#[derive(Clone, Debug)]
pub struct RegionConfig {
    /// Region name used in logs and stats.
    pub name: String,
    /// Page size of every store registered in the region.
    pub page_size: u32,
    /// Target number of cached pages.
    pub capacity: usize,
    /// Pages the checkpoint buffer may hold before the throttle backs off hard.
    pub checkpoint_buffer: usize,
    /// Whether checkpoints of this region log page images to the WAL.
    pub wal_logged: bool,
}

/// Live counters shared with the throttle.
#[derive(Debug, Default)]
pub struct RegionCounters {
    dirty_pages: AtomicU64,
    total_pages: AtomicU64,
    cp_buffer_used: AtomicU64,
    cp_buffer_capacity: AtomicU64,
}

impl RegionCounters {
    /// Pages dirtied since the last checkpoint began.
    pub fn dirty_pages(&self) -> u64 {
        self.dirty_pages.load(Ordering::Relaxed)
    }

    /// Region size in pages.
    pub fn total_pages(&self) -> u64 {
        self.total_pages.load(Ordering::Relaxed).max(1)
    }

    /// Dirty pages over region size.
    pub fn dirty_ratio(&self) -> f64 {
        self.dirty_pages() as f64 / self.total_pages() as f64
    }

    /// Pages currently held by the checkpoint buffer.
    pub fn cp_buffer_used(&self) -> u64 {
        self.cp_buffer_used.load(Ordering::Relaxed)
    }

    /// Checkpoint buffer capacity in pages.
    pub fn cp_buffer_capacity(&self) -> u64 {
        self.cp_buffer_capacity.load(Ordering::Relaxed).max(1)
    }

    /// Checkpoint buffer fill ratio.
    pub fn cp_buffer_fill(&self) -> f64 {
        self.cp_buffer_used() as f64 / self.cp_buffer_capacity() as f64
    }

    /// Overrides the counters; used by throttle tests.
    pub fn set(&self, dirty: u64, total: u64, cp_used: u64, cp_capacity: u64) {
        self.dirty_pages.store(dirty, Ordering::Relaxed);
        self.total_pages.store(total, Ordering::Relaxed);
        self.cp_buffer_used.store(cp_used, Ordering::Relaxed);
        self.cp_buffer_capacity.store(cp_capacity, Ordering::Relaxed);
    }
}

/// Point-in-time view of a region.
#[derive(Clone, Debug, Default, Serialize)]
pub struct MemoryStats {
    pub region: String,
    pub capacity: usize,
    pub cached_pages: usize,
    pub dirty_pages: usize,
    pub checkpoint_pages: usize,
    pub cp_buffer_used: usize,
    pub cp_buffer_capacity: usize,
    pub hits: u64,
    pub misses: u64,
    pub evictions: u64,
    pub overflows: u64,
    pub stores: usize,
}

#[derive(Default)]
struct Inner {
    frames: HashMap<FullPageId, Arc<Frame>>,
    clock: VecDeque<FullPageId>,
    dirty: HashSet<FullPageId>,
    cp_pages: HashSet<FullPageId>,
    cp_buffer: HashMap<FullPageId, Box<[u8]>>,
    checkpoint_running: bool,
}

#[derive(Default)]
struct StoreTable {
    stores: HashMap<(GroupId, PartitionId), Arc<PageStore>>,
    retired: HashSet<(GroupId, PartitionId)>,
}

#[derive(Default)]
struct Metrics {
    hits: AtomicU64,
    misses: AtomicU64,
    evictions: AtomicU64,
    overflows: AtomicU64,
}

/// Page cache of one region.
///
/// Stores are looked up by `(group, partition)` in a side table so page memory
/// holds no references back into group state. Access goes through latch guards
/// that require a [`CheckpointReadGuard`].
pub struct PageMemory {
    config: RegionConfig,
    stores: RwLock<StoreTable>,
    inner: Mutex<Inner>,
    counters: Arc<RegionCounters>,
    tracker: Arc<PageLockTracker>,
    throttle: RwLock<Option<Arc<dyn DirtyThrottle>>>,
    metrics: Metrics,
}

impl PageMemory {
    /// Creates an empty region.
    pub fn new(config: RegionConfig, tracker: Arc<PageLockTracker>) -> Arc<Self> {
        let counters = Arc::new(RegionCounters::default());
        counters.set(
            0,
            config.capacity as u64,
            0,
            config.checkpoint_buffer as u64,
        );
        debug!(
            region = %config.name,
            capacity = config.capacity,
            checkpoint_buffer = config.checkpoint_buffer,
            "memory.region.create"
        );
        Arc::new(Self {
            config,
            stores: RwLock::new(StoreTable::default()),
            inner: Mutex::new(Inner::default()),
            counters,
            tracker,
            throttle: RwLock::new(None),
            metrics: Metrics::default(),
        })
    }

    /// Region configuration.
    pub fn config(&self) -> &RegionConfig {
        &self.config
    }

    /// Page size of the region.
    pub fn page_size(&self) -> usize {
        self.config.page_size as usize
    }

    /// Counters shared with the throttle.
    pub fn counters(&self) -> Arc<RegionCounters> {
        Arc::clone(&self.counters)
    }

    /// Latch tracker of this region.
    pub fn tracker(&self) -> &Arc<PageLockTracker> {
        &self.tracker
    }

    /// Installs the throttle charged on every clean-to-dirty transition.
    pub fn set_throttle(&self, throttle: Arc<dyn DirtyThrottle>) {
        *self.throttle.write() = Some(throttle);
    }

    /// Registers a store. Replaces any store previously registered for the same partition.
    pub fn register_store(&self, store: Arc<PageStore>) -> Result<()> {
        if store.page_size() != self.page_size() {
            return Err(StrataError::Invalid("store page size differs from region"));
        }
        let key = (store.group(), store.partition());
        let mut table = self.stores.write();
        table.retired.remove(&key);
        table.stores.insert(key, store);
        Ok(())
    }

    /// Store registered for `(group, partition)`.
    ///
    /// # Panics
    /// When the store was invalidated: using pages of an invalidated store is a
    /// caller bug.
    pub fn store(&self, group: GroupId, partition: PartitionId) -> Result<Arc<PageStore>> {
        let table = self.stores.read();
        if let Some(store) = table.stores.get(&(group, partition)) {
            return Ok(Arc::clone(store));
        }
        assert!(
            !table.retired.contains(&(group, partition)),
            "page store {group}/{partition} used after invalidation"
        );
        Err(StrataError::NotFound)
    }

    /// Store for `(group, partition)` if one is registered; never panics.
    pub fn registered_store(&self, group: GroupId, partition: PartitionId) -> Option<Arc<PageStore>> {
        self.stores.read().stores.get(&(group, partition)).cloned()
    }

    /// Every registered store.
    pub fn stores(&self) -> Vec<Arc<PageStore>> {
        let mut out: Vec<_> = self.stores.read().stores.values().cloned().collect();
        out.sort_by_key(|s| (s.group(), s.partition()));
        out
    }

    /// Acquires a page under the requested latch.
    pub fn acquire(
        &self,
        guard: &CheckpointReadGuard,
        id: FullPageId,
        mode: LatchMode,
    ) -> Result<PageHandle<'_>> {
        match mode {
            LatchMode::Shared => self.read_page(guard, id).map(PageHandle::Shared),
            LatchMode::Exclusive => self.write_page(guard, id).map(PageHandle::Exclusive),
        }
    }

    /// Acquires a page under a shared latch.
    pub fn read_page(&self, guard: &CheckpointReadGuard, id: FullPageId) -> Result<PageRead<'_>> {
        let frame = self.pin_frame(id)?;
        let latch = frame.buf.read_arc();
        self.tracker.on_lock(guard.worker(), id, LatchMode::Shared);
        Ok(PageRead {
            id,
            memory: self,
            frame,
            worker: guard.worker(),
            latch: Some(latch),
        })
    }

    /// Acquires a page under an exclusive latch.
    ///
    /// If the running checkpoint still needs the current image, it is copied into
    /// the checkpoint buffer before the caller can change it.
    pub fn write_page(&self, guard: &CheckpointReadGuard, id: FullPageId) -> Result<PageWrite<'_>> {
        let frame = self.pin_frame(id)?;
        let latch = frame.buf.write_arc();
        if frame.cp_pending.swap(false, Ordering::AcqRel) {
            self.copy_on_write(id, &latch[..]);
        }
        self.tracker.on_lock(guard.worker(), id, LatchMode::Exclusive);
        Ok(PageWrite {
            id,
            memory: self,
            frame,
            worker: guard.worker(),
            latch: Some(latch),
            touched: false,
        })
    }

    fn copy_on_write(&self, id: FullPageId, image: &[u8]) {
        let mut inner = self.inner.lock();
        inner.cp_buffer.insert(id, image.to_vec().into_boxed_slice());
        let used = inner.cp_buffer.len();
        self.counters.cp_buffer_used.store(used as u64, Ordering::Relaxed);
        if used > self.config.checkpoint_buffer {
            warn!(
                region = %self.config.name,
                used,
                capacity = self.config.checkpoint_buffer,
                "memory.cp_buffer.overflow"
            );
        }
    }

    fn pin_frame(&self, id: FullPageId) -> Result<Arc<Frame>> {
        if let Some(frame) = self.pin_cached(id) {
            self.metrics.hits.fetch_add(1, Ordering::Relaxed);
            return Ok(frame);
        }
        let store = self.store(id.group, id.partition)?;
        let mut data = vec![0u8; self.page_size()].into_boxed_slice();
        store.read_page(id.index, &mut data)?;
        self.metrics.misses.fetch_add(1, Ordering::Relaxed);

        let mut inner = self.inner.lock();
        if let Some(frame) = inner.frames.get(&id) {
            frame.pin();
            return Ok(Arc::clone(frame));
        }
        self.make_room(&mut inner);
        let frame = Arc::new(Frame::new(id, data));
        frame.pin();
        inner.frames.insert(id, Arc::clone(&frame));
        inner.clock.push_back(id);
        Ok(frame)
    }

    fn pin_cached(&self, id: FullPageId) -> Option<Arc<Frame>> {
        let inner = self.inner.lock();
        inner.frames.get(&id).map(|frame| {
            frame.pin();
            Arc::clone(frame)
        })
    }

    fn make_room(&self, inner: &mut Inner) {
        if inner.frames.len() < self.config.capacity {
            return;
        }
        let mut scanned = 0;
        let limit = inner.clock.len() * 2;
        while scanned < limit {
            scanned += 1;
            let Some(candidate) = inner.clock.pop_front() else {
                break;
            };
            let Some(frame) = inner.frames.get(&candidate) else {
                continue;
            };
            if frame.is_evictable() && !frame.reference.swap(false, Ordering::Relaxed) {
                inner.frames.remove(&candidate);
                self.metrics.evictions.fetch_add(1, Ordering::Relaxed);
                return;
            }
            inner.clock.push_back(candidate);
        }
        let overflow = self.metrics.overflows.fetch_add(1, Ordering::Relaxed);
        if overflow % 1024 == 0 {
            warn!(
                region = %self.config.name,
                cached = inner.frames.len(),
                capacity = self.config.capacity,
                "memory.region.grow"
            );
        }
        self.counters
            .total_pages
            .store((inner.frames.len() + 1) as u64, Ordering::Relaxed);
    }

    /// Registers `id` in the current dirty set and charges the throttle.
    pub fn mark_dirty(&self, id: FullPageId) -> Result<()> {
        let frame = self
            .inner
            .lock()
            .frames
            .get(&id)
            .cloned()
            .ok_or(StrataError::Invalid("mark_dirty on a page that is not cached"))?;
        self.mark_frame_dirty(&frame);
        Ok(())
    }

    fn mark_frame_dirty(&self, frame: &Frame) {
        if frame.dirty.swap(true, Ordering::AcqRel) {
            return;
        }
        let in_checkpoint = {
            let mut inner = self.inner.lock();
            inner.dirty.insert(frame.id);
            self.counters
                .dirty_pages
                .store(inner.dirty.len() as u64, Ordering::Relaxed);
            inner.checkpoint_running && inner.cp_pages.contains(&frame.id)
        };
        let throttle = self.throttle.read().clone();
        if let Some(throttle) = throttle {
            throttle.on_mark_dirty(in_checkpoint);
        }
    }

    /// Reserves a fresh page index at the end of the partition's store.
    ///
    /// Reuse of freed pages is handled by the partition's reuse list on top of this.
    pub fn allocate_page(
        &self,
        _guard: &CheckpointReadGuard,
        group: GroupId,
        partition: PartitionId,
        flag: PageFlag,
    ) -> Result<FullPageId> {
        flag.check(partition)?;
        let store = self.store(group, partition)?;
        Ok(FullPageId::new(group, partition, store.allocate()))
    }

    /// Drops every cached page of `group` (or one of its partitions) and
    /// deregisters the stores.
    ///
    /// # Panics
    /// When a page of the selection is still latched.
    pub fn invalidate(&self, group: GroupId, partition: Option<PartitionId>) -> usize {
        let matches = |id: &FullPageId| id.group == group && partition.map_or(true, |p| id.partition == p);
        let dropped = {
            let mut inner = self.inner.lock();
            for (id, frame) in inner.frames.iter() {
                assert!(
                    !(matches(id) && frame.is_pinned()),
                    "invalidate of pinned page {id}"
                );
            }
            let before = inner.frames.len();
            inner.frames.retain(|id, _| !matches(id));
            let dropped = before - inner.frames.len();
            inner.clock.retain(|id| !matches(id));
            inner.dirty.retain(|id| !matches(id));
            inner.cp_pages.retain(|id| !matches(id));
            inner.cp_buffer.retain(|id, _| !matches(id));
            self.counters
                .dirty_pages
                .store(inner.dirty.len() as u64, Ordering::Relaxed);
            self.counters
                .cp_buffer_used
                .store(inner.cp_buffer.len() as u64, Ordering::Relaxed);
            dropped
        };
        let mut table = self.stores.write();
        let keys: Vec<_> = table
            .stores
            .keys()
            .filter(|(g, p)| *g == group && partition.map_or(true, |want| *p == want))
            .copied()
            .collect();
        for key in keys {
            if let Some(store) = table.stores.remove(&key) {
                store.invalidate();
            }
            table.retired.insert(key);
        }
        debug!(
            region = %self.config.name,
            group = group.0,
            partition = ?partition.map(|p| p.0),
            dropped,
            "memory.invalidate"
        );
        dropped
    }

    /// Moves the dirty set into the checkpoint set and returns it sorted.
    ///
    /// Must run under the checkpoint write lock.
    pub fn begin_checkpoint(&self) -> Vec<FullPageId> {
        let mut inner = self.inner.lock();
        let pages = std::mem::take(&mut inner.dirty);
        for id in &pages {
            if let Some(frame) = inner.frames.get(id) {
                frame.dirty.store(false, Ordering::Release);
                frame.cp_pending.store(true, Ordering::Release);
            }
        }
        let mut sorted: Vec<_> = pages.iter().copied().collect();
        sorted.sort_unstable();
        inner.cp_pages = pages;
        inner.checkpoint_running = true;
        self.counters.dirty_pages.store(0, Ordering::Relaxed);
        sorted
    }

    /// Image of `id` as of the checkpoint begin, or `None` when the page was
    /// invalidated since.
    pub fn checkpoint_copy(&self, id: FullPageId) -> Result<Option<Box<[u8]>>> {
        let frame = {
            let inner = self.inner.lock();
            if !inner.cp_pages.contains(&id) {
                return Ok(None);
            }
            match inner.frames.get(&id) {
                Some(frame) => Arc::clone(frame),
                None => return Err(StrataError::CheckpointFailed(format!("page {id} left memory before it was written"))),
            }
        };
        let latch = frame.buf.read();
        if frame.cp_pending.swap(false, Ordering::AcqRel) {
            return Ok(Some(latch.to_vec().into_boxed_slice()));
        }
        drop(latch);
        let mut inner = self.inner.lock();
        let copy = inner.cp_buffer.remove(&id);
        self.counters
            .cp_buffer_used
            .store(inner.cp_buffer.len() as u64, Ordering::Relaxed);
        match copy {
            Some(copy) => Ok(Some(copy)),
            None if !inner.cp_pages.contains(&id) => Ok(None),
            None => Err(StrataError::CheckpointFailed(format!("checkpoint copy of {id} missing"))),
        }
    }

    /// Returns true when `id` belongs to the running checkpoint.
    pub fn is_in_checkpoint(&self, id: FullPageId) -> bool {
        let inner = self.inner.lock();
        inner.checkpoint_running && inner.cp_pages.contains(&id)
    }

    /// Ends the checkpoint cycle and releases checkpoint-buffer copies.
    pub fn finish_checkpoint(&self) {
        let mut inner = self.inner.lock();
        for id in inner.cp_pages.iter() {
            if let Some(frame) = inner.frames.get(id) {
                frame.cp_pending.store(false, Ordering::Release);
            }
        }
        inner.cp_pages.clear();
        inner.cp_buffer.clear();
        inner.checkpoint_running = false;
        self.counters.cp_buffer_used.store(0, Ordering::Relaxed);
    }

    /// Ends a failed checkpoint cycle: pages it did not persist become dirty again.
    pub fn abort_checkpoint(&self) {
        let mut guard = self.inner.lock();
        let inner = &mut *guard;
        let pages: Vec<FullPageId> = inner.cp_pages.drain().collect();
        for id in pages {
            if let Some(frame) = inner.frames.get(&id) {
                frame.cp_pending.store(false, Ordering::Release);
                frame.dirty.store(true, Ordering::Release);
                inner.dirty.insert(id);
            }
        }
        inner.cp_buffer.clear();
        inner.checkpoint_running = false;
        self.counters
            .dirty_pages
            .store(inner.dirty.len() as u64, Ordering::Relaxed);
        self.counters.cp_buffer_used.store(0, Ordering::Relaxed);
        warn!(region = %self.config.name, dirty = inner.dirty.len(), "memory.checkpoint.abort");
    }

    /// Number of dirty pages waiting for the next checkpoint.
    pub fn dirty_count(&self) -> usize {
        self.inner.lock().dirty.len()
    }

    /// Syncs every registered store.
    pub fn sync_stores(&self) -> Result<()> {
        for store in self.stores() {
            store.sync()?;
        }
        Ok(())
    }

    /// Snapshot of region statistics.
    pub fn stats(&self) -> MemoryStats {
        let inner = self.inner.lock();
        MemoryStats {
            region: self.config.name.clone(),
            capacity: self.config.capacity,
            cached_pages: inner.frames.len(),
            dirty_pages: inner.dirty.len(),
            checkpoint_pages: inner.cp_pages.len(),
            cp_buffer_used: inner.cp_buffer.len(),
            cp_buffer_capacity: self.config.checkpoint_buffer,
            hits: self.metrics.hits.load(Ordering::Relaxed),
            misses: self.metrics.misses.load(Ordering::Relaxed),
            evictions: self.metrics.evictions.load(Ordering::Relaxed),
            overflows: self.metrics.overflows.load(Ordering::Relaxed),
            stores: self.stores.read().stores.len(),
        }
    }
}

impl fmt::Debug for PageMemory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PageMemory")
            .field("region", &self.config.name)
            .field("capacity", &self.config.capacity)
            .finish()
    }
}

/// Page held under a shared latch.
pub struct PageRead<'a> {
    id: FullPageId,
    memory: &'a PageMemory,
    frame: Arc<Frame>,
    worker: WorkerId,
    latch: Option<ArcRwLockReadGuard<parking_lot::RawRwLock, Box<[u8]>>>,
}

impl PageRead<'_> {
    /// Page id.
    pub fn id(&self) -> FullPageId {
        self.id
    }

    /// Page bytes.
    pub fn data(&self) -> &[u8] {
        self.latch
            .as_ref()
            .map(|latch| &latch[..])
            .expect("page latch missing")
    }

    /// Layout of the page; fails for unused pages.
    pub fn io(&self) -> Result<PageIo> {
        PageIo::of(self.data())?.ok_or(StrataError::Corruption("page not initialized"))
    }
}

impl Deref for PageRead<'_> {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        self.data()
    }
}

impl Drop for PageRead<'_> {
    fn drop(&mut self) {
        drop(self.latch.take());
        self.memory.tracker.on_unlock(self.worker, self.id);
        self.frame.unpin();
    }
}

/// Page held under an exclusive latch. Marks the page dirty on drop if it was
/// mutated, after the latch is released.
pub struct PageWrite<'a> {
    id: FullPageId,
    memory: &'a PageMemory,
    frame: Arc<Frame>,
    worker: WorkerId,
    latch: Option<ArcRwLockWriteGuard<parking_lot::RawRwLock, Box<[u8]>>>,
    touched: bool,
}

impl PageWrite<'_> {
    /// Page id.
    pub fn id(&self) -> FullPageId {
        self.id
    }

    /// Page bytes.
    pub fn data(&self) -> &[u8] {
        self.latch
            .as_ref()
            .map(|latch| &latch[..])
            .expect("page latch missing")
    }

    /// Mutable page bytes; the page is marked dirty on release.
    pub fn data_mut(&mut self) -> &mut [u8] {
        self.touched = true;
        self.latch
            .as_mut()
            .map(|latch| &mut latch[..])
            .expect("page latch missing")
    }

    /// Layout of the page; fails for unused pages.
    pub fn io(&self) -> Result<PageIo> {
        PageIo::of(self.data())?.ok_or(StrataError::Corruption("page not initialized"))
    }

    /// Zeroes the page and writes a header for `io`.
    pub fn init(&mut self, io: PageIo) -> Result<()> {
        let id = self.id;
        page::init_page(self.data_mut(), io, id)
    }
}

impl Deref for PageWrite<'_> {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        self.data()
    }
}

impl DerefMut for PageWrite<'_> {
    fn deref_mut(&mut self) -> &mut [u8] {
        self.data_mut()
    }
}

impl Drop for PageWrite<'_> {
    fn drop(&mut self) {
        drop(self.latch.take());
        self.memory.tracker.on_unlock(self.worker, self.id);
        if self.touched {
            self.memory.mark_frame_dirty(&self.frame);
        }
        self.frame.unpin();
    }
}

/// Page handle returned by [`PageMemory::acquire`].
pub enum PageHandle<'a> {
    /// Shared latch.
    Shared(PageRead<'a>),
    /// Exclusive latch.
    Exclusive(PageWrite<'a>),
}

impl PageHandle<'_> {
    /// Page id.
    pub fn id(&self) -> FullPageId {
        match self {
            PageHandle::Shared(page) => page.id(),
            PageHandle::Exclusive(page) => page.id(),
        }
    }

    /// Latch mode held.
    pub fn mode(&self) -> LatchMode {
        match self {
            PageHandle::Shared(_) => LatchMode::Shared,
            PageHandle::Exclusive(_) => LatchMode::Exclusive,
        }
    }

    /// Page bytes.
    pub fn page(&self) -> &[u8] {
        match self {
            PageHandle::Shared(page) => page.data(),
            PageHandle::Exclusive(page) => page.data(),
        }
    }

    /// Mutable page bytes; only available under an exclusive latch.
    pub fn page_mut(&mut self) -> Result<&mut [u8]> {
        match self {
            PageHandle::Shared(_) => Err(StrataError::Invalid("page held under a shared latch")),
            PageHandle::Exclusive(page) => Ok(page.data_mut()),
        }
    }

    /// Explicit release; equivalent to dropping the handle.
    pub fn release(self) {}
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::primitives::concurrency::{CheckpointLock, Workers};
    use crate::types::PageIdx;
    use std::sync::atomic::AtomicUsize;
    use tempfile::tempdir;

    struct CountingThrottle {
        calls: AtomicUsize,
        in_cp: AtomicUsize,
    }

    impl DirtyThrottle for CountingThrottle {
        fn on_mark_dirty(&self, page_in_checkpoint: bool) {
            self.calls.fetch_add(1, Ordering::Relaxed);
            if page_in_checkpoint {
                self.in_cp.fetch_add(1, Ordering::Relaxed);
            }
        }
    }

    fn region(capacity: usize) -> Arc<PageMemory> {
        PageMemory::new(
            RegionConfig {
                name: "test".into(),
                page_size: 4096,
                capacity,
                checkpoint_buffer: 16,
                wal_logged: true,
            },
            PageLockTracker::new(),
        )
    }

    fn setup(capacity: usize) -> Result<(tempfile::TempDir, Arc<PageMemory>, Arc<PageStore>)> {
        let dir = tempdir()?;
        let store = PageStore::create(dir.path().join("part-0.bin"), GroupId(1), PartitionId(0), 4096, true)?;
        let memory = region(capacity);
        memory.register_store(Arc::clone(&store))?;
        Ok((dir, memory, store))
    }

    #[test]
    fn write_marks_dirty_and_charges_throttle() -> Result<()> {
        let (_dir, memory, _store) = setup(8)?;
        let throttle = Arc::new(CountingThrottle {
            calls: AtomicUsize::new(0),
            in_cp: AtomicUsize::new(0),
        });
        memory.set_throttle(throttle.clone());
        let workers = Workers::new();
        let worker = workers.register("w");
        let lock = CheckpointLock::new();
        let guard = lock.read(&worker);

        let id = memory.allocate_page(&guard, GroupId(1), PartitionId(0), PageFlag::Data)?;
        {
            let mut page = memory.write_page(&guard, id)?;
            page.init(PageIo::DataV1)?;
            assert_eq!(memory.tracker().held_by(worker.id()).len(), 1);
        }
        assert!(memory.tracker().held_by(worker.id()).is_empty());
        assert_eq!(memory.dirty_count(), 1);
        {
            let mut page = memory.write_page(&guard, id)?;
            page.data_mut()[100] = 1;
        }
        assert_eq!(throttle.calls.load(Ordering::Relaxed), 1);
        {
            let _untouched = memory.write_page(&guard, id)?;
        }
        assert_eq!(memory.dirty_count(), 1);
        Ok(())
    }

    #[test]
    fn checkpoint_sees_image_from_begin_despite_later_write() -> Result<()> {
        let (_dir, memory, _store) = setup(8)?;
        let workers = Workers::new();
        let worker = workers.register("w");
        let lock = CheckpointLock::new();
        let guard = lock.read(&worker);
        let id = memory.allocate_page(&guard, GroupId(1), PartitionId(0), PageFlag::Data)?;
        {
            let mut page = memory.write_page(&guard, id)?;
            page.init(PageIo::DataV1)?;
            page.data_mut()[64] = 1;
        }
        let pages = memory.begin_checkpoint();
        assert_eq!(pages, vec![id]);
        assert!(memory.is_in_checkpoint(id));
        {
            let mut page = memory.write_page(&guard, id)?;
            page.data_mut()[64] = 2;
        }
        assert_eq!(memory.stats().cp_buffer_used, 1);
        let copy = memory.checkpoint_copy(id)?.expect("copy present");
        assert_eq!(copy[64], 1);
        assert_eq!(memory.dirty_count(), 1);
        memory.finish_checkpoint();
        assert_eq!(memory.stats().cp_buffer_used, 0);
        let page = memory.read_page(&guard, id)?;
        assert_eq!(page[64], 2);
        Ok(())
    }

    #[test]
    fn clean_pages_are_evicted_and_reloaded() -> Result<()> {
        let (_dir, memory, store) = setup(2)?;
        let workers = Workers::new();
        let worker = workers.register("w");
        let lock = CheckpointLock::new();
        let guard = lock.read(&worker);
        let mut ids = Vec::new();
        for i in 0..4u8 {
            let id = memory.allocate_page(&guard, GroupId(1), PartitionId(0), PageFlag::Data)?;
            let mut page = vec![0u8; 4096];
            page::init_page(&mut page, PageIo::DataV1, id)?;
            page[50] = i;
            store.write_page(id.index, &mut page)?;
            ids.push(id);
        }
        for (i, id) in ids.iter().enumerate() {
            let page = memory.read_page(&guard, *id)?;
            assert_eq!(page[50], i as u8);
        }
        let stats = memory.stats();
        assert!(stats.evictions >= 2);
        assert!(stats.cached_pages <= 2);
        Ok(())
    }

    #[test]
    fn dirty_pages_grow_the_region_instead_of_evicting() -> Result<()> {
        let (_dir, memory, _store) = setup(1)?;
        let workers = Workers::new();
        let worker = workers.register("w");
        let lock = CheckpointLock::new();
        let guard = lock.read(&worker);
        for _ in 0..3 {
            let id = memory.allocate_page(&guard, GroupId(1), PartitionId(0), PageFlag::Data)?;
            let mut page = memory.write_page(&guard, id)?;
            page.init(PageIo::DataV1)?;
        }
        let stats = memory.stats();
        assert_eq!(stats.cached_pages, 3);
        assert!(stats.overflows > 0);
        Ok(())
    }

    #[test]
    fn shared_handle_refuses_mutation() -> Result<()> {
        let (_dir, memory, _store) = setup(4)?;
        let workers = Workers::new();
        let worker = workers.register("w");
        let lock = CheckpointLock::new();
        let guard = lock.read(&worker);
        let id = FullPageId::new(GroupId(1), PartitionId(0), PageIdx::STORE_HEADER);
        let mut handle = memory.acquire(&guard, id, LatchMode::Shared)?;
        assert_eq!(handle.mode(), LatchMode::Shared);
        assert!(handle.page_mut().is_err());
        handle.release();
        Ok(())
    }

    #[test]
    fn allocate_checks_page_flag() -> Result<()> {
        let (_dir, memory, _store) = setup(4)?;
        let workers = Workers::new();
        let worker = workers.register("w");
        let lock = CheckpointLock::new();
        let guard = lock.read(&worker);
        assert!(memory
            .allocate_page(&guard, GroupId(1), PartitionId(0), PageFlag::Index)
            .is_err());
        Ok(())
    }

    #[test]
    fn invalidate_drops_frames_and_stores() -> Result<()> {
        let (_dir, memory, _store) = setup(4)?;
        let workers = Workers::new();
        let worker = workers.register("w");
        let lock = CheckpointLock::new();
        let guard = lock.read(&worker);
        let id = memory.allocate_page(&guard, GroupId(1), PartitionId(0), PageFlag::Data)?;
        {
            let mut page = memory.write_page(&guard, id)?;
            page.init(PageIo::DataV1)?;
        }
        assert_eq!(memory.invalidate(GroupId(1), None), 1);
        assert_eq!(memory.dirty_count(), 0);
        assert!(memory.registered_store(GroupId(1), PartitionId(0)).is_none());
        Ok(())
    }

    #[test]
    #[should_panic(expected = "used after invalidation")]
    fn access_after_invalidate_panics() {
        let (_dir, memory, _store) = setup(4).unwrap();
        let workers = Workers::new();
        let worker = workers.register("w");
        let lock = CheckpointLock::new();
        let guard = lock.read(&worker);
        memory.invalidate(GroupId(1), Some(PartitionId(0)));
        let _ = memory.read_page(&guard, FullPageId::new(GroupId(1), PartitionId(0), PageIdx(1)));
    }
}
