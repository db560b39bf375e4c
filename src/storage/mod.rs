//! Structures built on the page buffer manager.
//!
//! Trees, row heaps and the per-partition and per-group stores that combine
//! them. Every operation here runs under a caller-held checkpoint read lock.

/// Page-backed B+ tree.
///
/// Used for primary rows, pending expiry, secondary indexes and link maps.
pub mod btree;

/// Secondary index catalog and trees of a group's index partition.
pub mod index;

/// Per-partition data store.
pub mod partition;

/// Slotted data pages and the row heap.
pub mod rows;

pub use btree::{BTree, Cursor, PageAllocator, StoreAllocator, VisitOptions, VisitSummary};
pub use index::{IndexDef, IndexStore};
pub use partition::{
    ExpiredRow, PartitionSnapshot, PartitionStats, PartitionStore, PartitionWrite, PutOutcome,
    StoredRow, UpdateCounter,
};
pub use rows::{ReuseList, Row, RowStore};
