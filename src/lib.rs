//! Strata: a persistent page storage engine.
//!
//! Rows live in partitioned page stores cached by a bounded buffer manager,
//! indexed by page-backed B+ trees and made durable by a write-ahead log plus
//! copy-on-write checkpoints throttled against the writers. Transaction
//! recovery consults peers before replay, and cache groups can be compacted
//! offline by the defragmentation manager.

#![warn(missing_docs)]

pub mod admin;
pub mod checkpoint;
pub mod config;
pub mod defrag;
pub mod engine;
pub mod primitives;
pub mod recovery;
pub mod storage;
pub mod types;

pub use config::StorageConfig;
pub use engine::{Engine, GroupSchema, RecoveryOptions, RowOperation, RowScope, Schema};
pub use types::{Result, StrataError};
