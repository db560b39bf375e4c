use std::sync::Arc;

use parking_lot::Mutex;
use tracing::trace;

use crate::primitives::concurrency::CheckpointReadGuard;
use crate::primitives::pager::{freelist, PageMemory};
use crate::storage::btree::PageAllocator;
use crate::types::page::{self, PageFlag};
use crate::types::{FullPageId, GroupId, PageIdx, PageIo, PartitionId, Result};

#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
struct ReuseState {
    head: PageIdx,
    len: u32,
}

/// Free-list-backed page allocator of one data partition.
///
/// Released pages are stacked on a chain of `FreeList` pages whose head lives
/// in the partition meta page; a chain page that runs empty is handed out
/// itself. Allocation falls back to extending the store.
pub struct ReuseList {
    memory: Arc<PageMemory>,
    group: GroupId,
    partition: PartitionId,
    state: Mutex<ReuseState>,
}

impl ReuseList {
    /// Reuse list restored from the meta page fields.
    pub fn new(
        memory: Arc<PageMemory>,
        group: GroupId,
        partition: PartitionId,
        head: PageIdx,
        len: u32,
    ) -> Arc<Self> {
        Arc::new(Self {
            memory,
            group,
            partition,
            state: Mutex::new(ReuseState { head, len }),
        })
    }

    /// `(head, len)` to persist in the meta page.
    pub fn persisted(&self) -> (PageIdx, u32) {
        let state = self.state.lock();
        (state.head, state.len)
    }

    /// Number of pages available for reuse.
    pub fn len(&self) -> u32 {
        self.state.lock().len
    }

    /// Returns true when no page is waiting for reuse.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn page_id(&self, index: PageIdx) -> FullPageId {
        FullPageId::new(self.group, self.partition, index)
    }

    /// Puts `index` on the list. The page must no longer be referenced.
    pub fn release(&self, guard: &CheckpointReadGuard, index: PageIdx) -> Result<()> {
        let mut state = self.state.lock();
        if !state.head.is_none() {
            let mut head = self.memory.write_page(guard, self.page_id(state.head))?;
            if freelist::push(head.data_mut(), index) {
                state.len += 1;
                trace!(partition = self.partition.0, page = index.0, "reuse.release");
                return Ok(());
            }
        }
        let id = self.page_id(index);
        let mut page = self.memory.write_page(guard, id)?;
        page::init_page(page.data_mut(), PageIo::FreeListV1, id)?;
        freelist::init(page.data_mut(), state.head);
        state.head = index;
        state.len += 1;
        trace!(partition = self.partition.0, page = index.0, "reuse.chain.grow");
        Ok(())
    }
}

impl PageAllocator for ReuseList {
    fn allocate(&self, guard: &CheckpointReadGuard) -> Result<FullPageId> {
        let mut state = self.state.lock();
        if state.head.is_none() {
            drop(state);
            return self
                .memory
                .allocate_page(guard, self.group, self.partition, PageFlag::Data);
        }
        let head_id = self.page_id(state.head);
        let mut head = self.memory.write_page(guard, head_id)?;
        let reused = match freelist::pop(head.data_mut()) {
            Some(index) => index,
            None => {
                let next = freelist::next(head.data())?;
                state.head = next;
                head_id.index
            }
        };
        state.len = state.len.saturating_sub(1);
        trace!(partition = self.partition.0, page = reused.0, "reuse.allocate");
        Ok(self.page_id(reused))
    }
}
