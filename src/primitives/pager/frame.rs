use parking_lot::RwLock;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;

use crate::types::FullPageId;

/// Cached page image plus its bookkeeping bits.
pub(crate) struct Frame {
    pub id: FullPageId,
    pub buf: Arc<RwLock<Box<[u8]>>>,
    pub pins: AtomicU32,
    /// Modified since the last checkpoint snapshot.
    pub dirty: AtomicBool,
    /// Captured by the running checkpoint and not yet copied out.
    pub cp_pending: AtomicBool,
    /// Clock reference bit.
    pub reference: AtomicBool,
}

impl Frame {
    pub fn new(id: FullPageId, data: Box<[u8]>) -> Self {
        Self {
            id,
            buf: Arc::new(RwLock::new(data)),
            pins: AtomicU32::new(0),
            dirty: AtomicBool::new(false),
            cp_pending: AtomicBool::new(false),
            reference: AtomicBool::new(true),
        }
    }

    pub fn pin(&self) {
        self.pins.fetch_add(1, Ordering::AcqRel);
        self.reference.store(true, Ordering::Relaxed);
    }

    pub fn unpin(&self) {
        let prev = self.pins.fetch_sub(1, Ordering::AcqRel);
        debug_assert!(prev > 0, "unpin of unpinned frame {}", self.id);
    }

    pub fn is_pinned(&self) -> bool {
        self.pins.load(Ordering::Acquire) > 0
    }

    /// Clean, unpinned frames that no checkpoint still needs may be dropped.
    pub fn is_evictable(&self) -> bool {
        !self.is_pinned()
            && !self.dirty.load(Ordering::Acquire)
            && !self.cp_pending.load(Ordering::Acquire)
    }
}
