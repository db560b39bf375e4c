//! Offline compaction of a cache group.
//!
//! Every partition is copied row by row into a fresh store of a temporary
//! `defrag` region, recording old link to new link in a per-partition
//! [`LinkMap`]. Index trees are then rebuilt through those maps. Finished
//! copies are published by renames guarded by on-disk markers, so a crash at
//! any point resumes or completes the run.

pub mod files;
mod link_map;

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::Serialize;
use tracing::{debug, info, warn};

use crate::checkpoint::{CheckpointState, Checkpointer};
use crate::primitives::concurrency::{CancellationToken, PageLockTracker, Workers};
use crate::primitives::io;
use crate::primitives::pager::{PageMemory, PageStore, PartitionMeta, RegionConfig};
use crate::storage::btree::VisitOptions;
use crate::storage::index::{self, IndexStore};
use crate::storage::PartitionStore;
use crate::types::{GroupId, PageIdx, PartitionId, Result, StrataError};

pub use link_map::LinkMap;

const PARTITION_REGION: &str = "defrag";
const MAPPING_REGION: &str = "defrag-mapping";

/// Outcome of one group's defragmentation.
#[derive(Clone, Debug, Default, Serialize)]
pub struct DefragReport {
    pub group: u32,
    /// Partitions copied by this run.
    pub partitions_processed: Vec<u16>,
    /// Partitions an earlier run already finished.
    pub partitions_skipped: Vec<u16>,
    pub rows_copied: u64,
    pub index_entries: u64,
    /// Pages of the copied partitions before and after.
    pub old_pages: u64,
    pub new_pages: u64,
    /// The group was already complete on disk; only the renames ran.
    pub already_completed: bool,
    pub duration_ms: u64,
}

/// Settings of a defragmentation run.
#[derive(Clone, Debug)]
pub struct DefragSettings {
    pub page_size: u32,
    /// Capacity of each temporary region.
    pub region_pages: usize,
    /// Longest checkpoint read lock hold before it is cycled.
    pub lock_hold: Duration,
    pub verify_checksums: bool,
}

/// The live stores of a frozen group.
pub struct DefragSource<'a> {
    pub group: GroupId,
    /// Group directory.
    pub dir: &'a Path,
    pub partitions: &'a BTreeMap<PartitionId, Arc<PartitionStore>>,
    pub index: &'a IndexStore,
}

/// Temporary region registered with the checkpointer for the run.
struct Lease<'a> {
    checkpointer: &'a Checkpointer,
    memory: Arc<PageMemory>,
    group: GroupId,
}

impl<'a> Lease<'a> {
    fn new(checkpointer: &'a Checkpointer, name: &str, settings: &DefragSettings, group: GroupId) -> Self {
        let memory = PageMemory::new(
            RegionConfig {
                name: name.to_string(),
                page_size: settings.page_size,
                capacity: settings.region_pages,
                checkpoint_buffer: (settings.region_pages / 4).max(16),
                wal_logged: false,
            },
            PageLockTracker::new(),
        );
        checkpointer.add_region(Arc::clone(&memory), None);
        Self {
            checkpointer,
            memory,
            group,
        }
    }
}

impl Drop for Lease<'_> {
    fn drop(&mut self) {
        self.checkpointer.remove_region(&self.memory.config().name);
        self.memory.invalidate(self.group, None);
    }
}

/// Compacts groups the engine has frozen.
pub struct DefragmentationManager<'a> {
    checkpointer: &'a Checkpointer,
    workers: &'a Arc<Workers>,
    settings: DefragSettings,
}

impl<'a> DefragmentationManager<'a> {
    pub fn new(checkpointer: &'a Checkpointer, workers: &'a Arc<Workers>, settings: DefragSettings) -> Self {
        Self {
            checkpointer,
            workers,
            settings,
        }
    }

    /// Copies every partition and the index of `source`, then swaps the
    /// copies in. The caller reopens the group's stores afterwards.
    ///
    /// Must not be called under a checkpoint read lock.
    pub fn defragment_group(&self, source: &DefragSource<'_>, token: &CancellationToken) -> Result<DefragReport> {
        let started = Instant::now();
        let partitions: Vec<PartitionId> = source.partitions.keys().copied().collect();
        let mut report = DefragReport {
            group: source.group.0,
            ..DefragReport::default()
        };
        if files::completed_marker(source.dir).exists() {
            info!(group = source.group.0, "defrag.group.already_completed");
            files::batch_rename(source.dir, &partitions)?;
            files::cleanup(source.dir, &partitions)?;
            report.already_completed = true;
            report.partitions_skipped = partitions.iter().map(|p| p.0).collect();
            report.duration_ms = started.elapsed().as_millis() as u64;
            return Ok(report);
        }
        info!(group = source.group.0, partitions = partitions.len(), "defrag.group.begin");

        let parts = Lease::new(self.checkpointer, PARTITION_REGION, &self.settings, source.group);
        let mappings = Lease::new(self.checkpointer, MAPPING_REGION, &self.settings, source.group);
        io::remove_if_exists(&files::index_tmp_file(source.dir))?;

        let mut maps = BTreeMap::new();
        for (partition, old) in source.partitions {
            token.check()?;
            let map = if self.finished_copy_current(source, *partition, old)? {
                report.partitions_skipped.push(partition.0);
                debug!(group = source.group.0, partition = partition.0, "defrag.partition.skipped");
                self.reopen_map(source, *partition, &mappings.memory)?
            } else {
                let map = self.copy_partition(source, *partition, old, &parts.memory, &mappings.memory, token, &mut report)?;
                report.partitions_processed.push(partition.0);
                map
            };
            maps.insert(*partition, map);
        }

        token.check()?;
        report.index_entries = self.rebuild_index(source, &maps, &parts.memory, token)?;

        drop(maps);
        drop(mappings);
        drop(parts);
        io::write_atomic(&files::completed_marker(source.dir), b"")?;
        files::batch_rename(source.dir, &partitions)?;
        files::cleanup(source.dir, &partitions)?;
        report.duration_ms = started.elapsed().as_millis() as u64;
        info!(
            group = source.group.0,
            processed = report.partitions_processed.len(),
            skipped = report.partitions_skipped.len(),
            rows = report.rows_copied,
            old_pages = report.old_pages,
            new_pages = report.new_pages,
            duration_ms = report.duration_ms,
            "defrag.group.completed"
        );
        Ok(report)
    }

    fn open_store(&self, memory: &PageMemory, path: &Path, source: &DefragSource<'_>, partition: PartitionId, create: bool) -> Result<()> {
        let s = &self.settings;
        let store = if create {
            PageStore::create(path, source.group, partition, s.page_size, s.verify_checksums)?
        } else {
            PageStore::open(path, source.group, partition, s.page_size, s.verify_checksums)?
        };
        memory.register_store(store)
    }

    /// Whether an earlier run left a finished copy of `partition` that still
    /// matches the live store. A copy the live partition moved past since is
    /// deleted together with its link map.
    fn finished_copy_current(&self, source: &DefragSource<'_>, partition: PartitionId, old: &PartitionStore) -> Result<bool> {
        let copy = files::defragmented_partition_file(source.dir, partition);
        if !copy.exists() {
            return Ok(false);
        }
        let mapping = files::mapping_file(source.dir, partition);
        let current = mapping.exists() && {
            let s = &self.settings;
            let store = PageStore::open(&copy, source.group, partition, s.page_size, s.verify_checksums)?;
            let mut page = vec![0u8; store.page_size()];
            store.read_page(PageIdx::META, &mut page)?;
            same_contents(&PartitionMeta::decode(&page)?, &old.meta())
        };
        if !current {
            warn!(group = source.group.0, partition = partition.0, "defrag.partition.stale_copy");
            io::remove_if_exists(&copy)?;
            io::remove_if_exists(&mapping)?;
        }
        Ok(current)
    }

    fn reopen_map(&self, source: &DefragSource<'_>, partition: PartitionId, memory: &Arc<PageMemory>) -> Result<LinkMap> {
        self.open_store(memory, &files::mapping_file(source.dir, partition), source, partition, false)?;
        let worker = self.workers.register("strata-defrag");
        let guard = self.checkpointer.checkpoint_read_lock(&worker);
        LinkMap::open(&guard, Arc::clone(memory), source.group, partition)
    }

    #[allow(clippy::too_many_arguments)]
    fn copy_partition(
        &self,
        source: &DefragSource<'_>,
        partition: PartitionId,
        old: &PartitionStore,
        parts: &Arc<PageMemory>,
        mappings: &Arc<PageMemory>,
        token: &CancellationToken,
        report: &mut DefragReport,
    ) -> Result<LinkMap> {
        let dir = source.dir;
        self.open_store(parts, &files::partition_tmp_file(dir, partition), source, partition, true)?;
        self.open_store(mappings, &files::mapping_file(dir, partition), source, partition, true)?;

        let worker = self.workers.register("strata-defrag");
        let (map, rows, new_pages) = {
            let mut guard = self.checkpointer.checkpoint_read_lock(&worker);
            let copy = PartitionStore::create(&guard, Arc::clone(parts), source.group, partition)?;
            let map = LinkMap::create(&guard, Arc::clone(mappings), source.group, partition)?;
            let options = VisitOptions {
                relock_after: self.settings.lock_hold,
                cancel: Some(token.clone()),
            };
            let mut rows = 0u64;
            let summary = {
                let write = copy.write();
                old.visit(&mut guard, &options, |guard, old_link, row| {
                    let new_link = write.insert_copy(guard, &row)?;
                    map.put(guard, old_link, new_link)?;
                    rows += 1;
                    Ok(true)
                })?
            };
            copy.write().copy_meta(&guard, &old.snapshot())?;
            debug!(
                group = source.group.0,
                partition = partition.0,
                rows,
                relocks = summary.relocks,
                "defrag.partition.copied"
            );
            (map, rows, parts.store(source.group, partition)?.allocated())
        };

        let info = self
            .checkpointer
            .force_checkpoint(&format!("defrag-part-{}", partition.0))
            .wait(CheckpointState::Finished)?;
        let old_pages = old.stats()?.pages;
        parts.invalidate(source.group, Some(partition));
        files::rename(
            &files::partition_tmp_file(dir, partition),
            &files::defragmented_partition_file(dir, partition),
        )?;
        report.rows_copied += rows;
        report.old_pages += u64::from(old_pages);
        report.new_pages += u64::from(new_pages);
        info!(
            group = source.group.0,
            partition = partition.0,
            rows,
            old_pages,
            new_pages,
            bytes_saved = (i64::from(old_pages) - i64::from(new_pages)) * i64::from(self.settings.page_size),
            checkpoint = info.id,
            "defrag.partition.completed"
        );
        Ok(map)
    }

    fn rebuild_index(
        &self,
        source: &DefragSource<'_>,
        maps: &BTreeMap<PartitionId, LinkMap>,
        parts: &Arc<PageMemory>,
        token: &CancellationToken,
    ) -> Result<u64> {
        let dir = source.dir;
        self.open_store(parts, &files::index_tmp_file(dir), source, PartitionId::INDEX, true)?;
        let worker = self.workers.register("strata-defrag");
        let mut entries = 0u64;
        {
            let mut guard = self.checkpointer.checkpoint_read_lock(&worker);
            let rebuilt = IndexStore::create(&guard, Arc::clone(parts), source.group)?;
            let options = VisitOptions {
                relock_after: self.settings.lock_hold,
                cancel: Some(token.clone()),
            };
            for def in source.index.definitions() {
                rebuilt.ensure_index(&guard, def.id, &def.name)?;
                let tree = source.index.tree(def.id)?;
                tree.visit(&mut guard, &options, |guard, entry, _| {
                    let (key, old_link) = index::split_entry(entry)?;
                    let map = maps
                        .get(&old_link.partition())
                        .ok_or(StrataError::Corruption("index entry points into an unknown partition"))?;
                    let new_link = map
                        .get(guard, old_link)?
                        .ok_or(StrataError::Corruption("index entry points at an unmapped row"))?;
                    rebuilt.insert(guard, def.id, key, new_link)?;
                    entries += 1;
                    Ok(true)
                })?;
                debug!(group = source.group.0, index = %def.name, "defrag.index.rebuilt");
            }
        }
        let info = self
            .checkpointer
            .force_checkpoint("defrag-index")
            .wait(CheckpointState::Finished)?;
        parts.invalidate(source.group, Some(PartitionId::INDEX));
        files::rename(&files::index_tmp_file(dir), &files::defragmented_index_file(dir))?;
        info!(group = source.group.0, entries, checkpoint = info.id, "defrag.index.completed");
        Ok(entries)
    }
}

/// Every mutation moves the update counter, so equal counters and row counts
/// mean no row changed since the copy was taken.
fn same_contents(copy: &PartitionMeta, live: &PartitionMeta) -> bool {
    copy.counter_lwm == live.counter_lwm
        && copy.counter_hwm == live.counter_hwm
        && copy.row_count == live.row_count
        && copy.global_remove_id == live.global_remove_id
}

#[cfg(test)]
mod tests;
