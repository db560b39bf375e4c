use std::sync::Arc;

use crate::primitives::concurrency::CheckpointReadGuard;
use crate::primitives::pager::PageMemory;
use crate::storage::btree::{BTree, PageAllocator, StoreAllocator};
use crate::types::page::PageFlag;
use crate::types::{FullPageId, GroupId, Link, PageIdx, PartitionId, Result, StrataError};

/// Old-link to new-link map of one partition copy, kept in its own store so
/// that an interrupted run can reopen it.
pub struct LinkMap {
    tree: BTree,
}

impl LinkMap {
    fn allocator(memory: &Arc<PageMemory>, group: GroupId, partition: PartitionId) -> Arc<dyn PageAllocator> {
        StoreAllocator::new(Arc::clone(memory), group, partition, PageFlag::Data)
    }

    fn name(group: GroupId, partition: PartitionId) -> String {
        format!("grp-{}/part-{}/link-map", group.0, partition.0)
    }

    /// Lays out an empty map in a fresh, registered store.
    pub fn create(
        guard: &CheckpointReadGuard,
        memory: Arc<PageMemory>,
        group: GroupId,
        partition: PartitionId,
    ) -> Result<Self> {
        let alloc = Self::allocator(&memory, group, partition);
        let tree = BTree::create(guard, memory, alloc, Self::name(group, partition))?;
        if tree.meta_page().index != PageIdx::META {
            return Err(StrataError::Invalid("mapping store is not empty"));
        }
        Ok(Self { tree })
    }

    /// Reopens a map written by an earlier run.
    pub fn open(
        guard: &CheckpointReadGuard,
        memory: Arc<PageMemory>,
        group: GroupId,
        partition: PartitionId,
    ) -> Result<Self> {
        let alloc = Self::allocator(&memory, group, partition);
        let meta = FullPageId::new(group, partition, PageIdx::META);
        let tree = BTree::open(guard, memory, alloc, meta, Self::name(group, partition))?;
        Ok(Self { tree })
    }

    pub fn put(&self, guard: &CheckpointReadGuard, old: Link, new: Link) -> Result<()> {
        self.tree.putx(guard, &old.to_be_bytes(), &new.to_be_bytes())
    }

    /// New link of the row that lived at `old`.
    pub fn get(&self, guard: &CheckpointReadGuard, old: Link) -> Result<Option<Link>> {
        match self.tree.get(guard, &old.to_be_bytes())? {
            Some(raw) => Ok(Some(Link::from_be_slice(&raw)?)),
            None => Ok(None),
        }
    }

    /// Number of mapped rows.
    pub fn len(&self, guard: &CheckpointReadGuard) -> Result<u64> {
        self.tree.size(guard)
    }

    /// Every `(old, new)` pair in old-link order.
    pub fn entries(&self, guard: &CheckpointReadGuard) -> Result<Vec<(Link, Link)>> {
        self.tree
            .iter(guard)
            .map(|item| {
                let (old, new) = item?;
                Ok((Link::from_be_slice(&old)?, Link::from_be_slice(&new)?))
            })
            .collect()
    }
}
