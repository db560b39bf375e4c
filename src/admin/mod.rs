#![forbid(unsafe_code)]

//! Administration of a data directory: statistics, forced checkpoints,
//! defragmentation and WAL inspection.
//!
//! Every entry point opens the directory with the group layout found on disk,
//! does its work and closes the engine again.

mod checkpoint;
mod defrag;
mod error;
mod stats;
mod util;
mod wal_dump;

/// Forces a checkpoint and reports it.
pub use checkpoint::{checkpoint, CheckpointReport};

/// Defragments one group of a data directory.
pub use defrag::defrag;
pub use crate::defrag::DefragReport;

/// Error types for administrative operations.
pub use error::{AdminError, Result};

/// Statistics of the engine and of the files backing it.
pub use stats::{stats, FilesystemStats, GroupFiles, StatsReport};

/// Opens a data directory the way every admin command does.
pub use util::open_engine;

/// Lists WAL records without opening the engine.
pub use wal_dump::{wal_dump, WalDumpReport, WalEntry};
