#![forbid(unsafe_code)]
//! Identifiers, errors and page layout definitions shared across strata.

pub mod checksum;
pub mod page;

use std::fmt;

use serde::{Deserialize, Serialize};

pub use page::{PageFlag, PageHeader, PageIo, PageKind, PAGE_HDR_LEN};

/// Cache group identifier. A group owns a set of partitions and one index partition.
#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Debug, Serialize, Deserialize)]
pub struct GroupId(pub u32);

/// Logical cache inside a group; rows of several caches may share partitions.
#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Debug, Serialize, Deserialize)]
pub struct CacheId(pub u32);

/// Partition number inside a group.
#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Debug, Serialize, Deserialize)]
pub struct PartitionId(pub u16);

impl PartitionId {
    /// The group's index partition.
    pub const INDEX: PartitionId = PartitionId(u16::MAX);

    /// Returns true for the index partition.
    pub const fn is_index(self) -> bool {
        self.0 == u16::MAX
    }
}

/// Page number inside one page store.
#[derive(Copy, Clone, Default, Eq, PartialEq, Ord, PartialOrd, Hash, Debug, Serialize, Deserialize)]
pub struct PageIdx(pub u32);

impl PageIdx {
    /// Page 0 always holds the store header.
    pub const STORE_HEADER: PageIdx = PageIdx(0);
    /// Page 1 holds the partition meta page (or the index catalog).
    pub const META: PageIdx = PageIdx(1);
    /// Sentinel for "no page" in on-page links.
    pub const NONE: PageIdx = PageIdx(0);

    /// Returns true when this is the sentinel value.
    pub const fn is_none(self) -> bool {
        self.0 == 0
    }
}

/// Fully qualified page identity: `(group, partition, page index)`.
#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Debug, Serialize, Deserialize)]
pub struct FullPageId {
    /// Owning group.
    pub group: GroupId,
    /// Owning partition.
    pub partition: PartitionId,
    /// Page index inside the partition's store.
    pub index: PageIdx,
}

impl FullPageId {
    /// Builds a page id.
    pub const fn new(group: GroupId, partition: PartitionId, index: PageIdx) -> Self {
        Self {
            group,
            partition,
            index,
        }
    }

    /// Returns a sibling page id in the same store.
    pub const fn with_index(self, index: PageIdx) -> Self {
        Self {
            group: self.group,
            partition: self.partition,
            index,
        }
    }
}

/// Opaque row locator: partition (16 bits), page index (32 bits), slot (16 bits).
#[derive(Copy, Clone, Default, Eq, PartialEq, Ord, PartialOrd, Hash, Debug, Serialize, Deserialize)]
pub struct Link(pub u64);

impl Link {
    /// The null link.
    pub const NONE: Link = Link(0);

    /// Packs a link.
    pub const fn new(partition: PartitionId, index: PageIdx, slot: u16) -> Self {
        Link(((partition.0 as u64) << 48) | ((index.0 as u64) << 16) | slot as u64)
    }

    /// Partition component.
    pub const fn partition(self) -> PartitionId {
        PartitionId((self.0 >> 48) as u16)
    }

    /// Page index component.
    pub const fn page_index(self) -> PageIdx {
        PageIdx(((self.0 >> 16) & 0xFFFF_FFFF) as u32)
    }

    /// Slot component.
    pub const fn slot(self) -> u16 {
        (self.0 & 0xFFFF) as u16
    }

    /// Page holding the row, qualified with its group.
    pub const fn page_id(self, group: GroupId) -> FullPageId {
        FullPageId::new(group, self.partition(), self.page_index())
    }

    /// Returns true for the null link.
    pub const fn is_none(self) -> bool {
        self.0 == 0
    }

    /// Big-endian bytes, used as tree values and key suffixes.
    pub const fn to_be_bytes(self) -> [u8; 8] {
        self.0.to_be_bytes()
    }

    /// Decodes a link from big-endian bytes.
    pub fn from_be_slice(src: &[u8]) -> Result<Self> {
        if src.len() != 8 {
            return Err(StrataError::Corruption("link must be 8 bytes"));
        }
        Ok(Link(crate::primitives::bytes::be::u64_at(src, 0)))
    }
}

/// Byte offset of a frame in the write-ahead log. Monotonic per node.
#[derive(Copy, Clone, Default, Eq, PartialEq, Ord, PartialOrd, Hash, Debug, Serialize, Deserialize)]
pub struct WalPointer(pub u64);

/// Distributed transaction identifier.
#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Debug, Serialize, Deserialize)]
pub struct TxId(pub u64);

/// Cluster node identifier.
#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Debug, Serialize, Deserialize)]
pub struct NodeId(pub u64);

/// Registered worker handle id; keys per-worker lock state.
#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Debug, Serialize, Deserialize)]
pub struct WorkerId(pub u64);

macro_rules! display_inner {
    ($($ty:ty),*) => {
        $(impl fmt::Display for $ty {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        })*
    };
}

display_inner!(GroupId, CacheId, PartitionId, PageIdx, TxId, NodeId, WorkerId);

impl fmt::Display for FullPageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}:{}", self.group.0, self.partition.0, self.index.0)
    }
}

impl fmt::Display for Link {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}/{}/{}",
            self.partition().0,
            self.page_index().0,
            self.slot()
        )
    }
}

impl fmt::Display for WalPointer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "@{}", self.0)
    }
}

/// Errors raised by the storage core.
#[derive(thiserror::Error, Debug)]
pub enum StrataError {
    /// Underlying file or OS failure.
    #[error("IO: {0}")]
    Io(#[from] std::io::Error),
    /// On-disk bytes failed validation.
    #[error("corruption: {0}")]
    Corruption(&'static str),
    /// Caller supplied an argument the engine cannot honor.
    #[error("invalid argument: {0}")]
    Invalid(&'static str),
    /// Requested object does not exist.
    #[error("not found")]
    NotFound,
    /// A known page kind carries a layout version this build cannot read.
    #[error("unsupported {kind:?} page layout version {version}")]
    UnsupportedPageVersion {
        /// Page kind found in the header.
        kind: PageKind,
        /// Layout version found in the header.
        version: u16,
    },
    /// Page kind byte is not one this build knows.
    #[error("unknown page kind {0}")]
    UnknownPageKind(u8),
    /// Structural data format error found while traversing pages.
    #[error("data format: {0}")]
    DataFormat(String),
    /// Tree entry larger than the page layout allows.
    #[error("key too large: {len} bytes (max {max})")]
    KeyTooLarge {
        /// Encoded entry length.
        len: usize,
        /// Maximum entry length.
        max: usize,
    },
    /// Row larger than a data page can hold.
    #[error("row too large: {len} bytes (max {max})")]
    RowTooLarge {
        /// Encoded row length.
        len: usize,
        /// Maximum row length.
        max: usize,
    },
    /// The group is frozen by maintenance (defragmentation).
    #[error("group {0} is unavailable")]
    GroupUnavailable(GroupId),
    /// The node was stopped after a critical failure.
    #[error("node stopped after a critical failure")]
    NodeStopped,
    /// A cooperative cancellation check fired.
    #[error("operation cancelled")]
    Cancelled,
    /// A checkpoint failed; the message carries the cause.
    #[error("checkpoint failed: {0}")]
    CheckpointFailed(String),
    /// Transaction recovery failed.
    #[error("recovery: {0}")]
    Recovery(String),
    /// Message or report (de)serialization failed.
    #[error("serialization: {0}")]
    Serde(String),
    /// Configuration could not be loaded.
    #[error("config: {0}")]
    Config(String),
}

/// Result alias used throughout the crate.
pub type Result<T, E = StrataError> = std::result::Result<T, E>;

impl From<serde_json::Error> for StrataError {
    fn from(err: serde_json::Error) -> Self {
        StrataError::Serde(err.to_string())
    }
}

/// Clones an error for fan-out to several waiters. IO errors keep their kind.
pub fn clone_error(err: &StrataError) -> StrataError {
    match err {
        StrataError::Io(io) => StrataError::Io(std::io::Error::new(io.kind(), io.to_string())),
        StrataError::Corruption(msg) => StrataError::Corruption(msg),
        StrataError::Invalid(msg) => StrataError::Invalid(msg),
        StrataError::NotFound => StrataError::NotFound,
        StrataError::UnsupportedPageVersion { kind, version } => {
            StrataError::UnsupportedPageVersion {
                kind: *kind,
                version: *version,
            }
        }
        StrataError::UnknownPageKind(kind) => StrataError::UnknownPageKind(*kind),
        StrataError::DataFormat(msg) => StrataError::DataFormat(msg.clone()),
        StrataError::KeyTooLarge { len, max } => StrataError::KeyTooLarge {
            len: *len,
            max: *max,
        },
        StrataError::RowTooLarge { len, max } => StrataError::RowTooLarge {
            len: *len,
            max: *max,
        },
        StrataError::GroupUnavailable(group) => StrataError::GroupUnavailable(*group),
        StrataError::NodeStopped => StrataError::NodeStopped,
        StrataError::Cancelled => StrataError::Cancelled,
        StrataError::CheckpointFailed(msg) => StrataError::CheckpointFailed(msg.clone()),
        StrataError::Recovery(msg) => StrataError::Recovery(msg.clone()),
        StrataError::Serde(msg) => StrataError::Serde(msg.clone()),
        StrataError::Config(msg) => StrataError::Config(msg.clone()),
    }
}
