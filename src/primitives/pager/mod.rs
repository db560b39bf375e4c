#![forbid(unsafe_code)]

pub mod counters;
mod frame;
pub mod freelist;
mod memory;
mod meta;
mod store;

pub use memory::{
    DirtyThrottle, MemoryStats, PageHandle, PageMemory, PageRead, PageWrite, RegionConfig,
    RegionCounters,
};
pub use meta::{PartitionMeta, PartitionState};
pub use store::PageStore;
