#![forbid(unsafe_code)]

//! Page-backed B+ tree used for primary rows, pending expiry, secondary indexes
//! and defragmentation link maps.

/// Node page layouts.
pub mod page;

mod cursor;
mod stats;
mod tree;

pub use cursor::Cursor;
pub use stats::{BTreeStats, BTreeStatsSnapshot};
pub use tree::{BTree, PageAllocator, StoreAllocator, VisitOptions, VisitSummary};
