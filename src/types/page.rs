//! Shared on-disk page header and the closed set of page layouts.

use core::convert::TryFrom;

use super::checksum::page_crc32;
use super::{FullPageId, GroupId, PageIdx, PartitionId, Result, StrataError};
use crate::primitives::bytes::be;

/// Magic prefix of every initialized page.
pub const PAGE_MAGIC: [u8; 4] = *b"STPG";
/// Default page size in bytes.
pub const DEFAULT_PAGE_SIZE: u32 = 4096;
/// Smallest page size accepted by stores.
pub const MIN_PAGE_SIZE: u32 = 512;
/// Length of the common page header.
pub const PAGE_HDR_LEN: usize = 24;

pub mod header {
    //! Byte offsets for fixed header fields.
    use core::ops::Range;

    pub const MAGIC: Range<usize> = 0..4;
    pub const KIND: usize = 4;
    pub const RESERVED: usize = 5;
    pub const VERSION: usize = 6;
    pub const PAGE_INDEX: usize = 8;
    pub const PARTITION: usize = 12;
    pub const GROUP: usize = 16;
    pub const CRC32: Range<usize> = 20..24;
}

/// Page kind tag stored in byte 4 of every page.
#[repr(u8)]
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash)]
pub enum PageKind {
    /// Store file header (page 0).
    StoreHeader = 1,
    /// Partition meta page (page 1 of data partitions).
    PartitionMeta = 2,
    /// Root pointer page of one tree.
    TreeMeta = 3,
    /// Inner tree node.
    TreeInner = 4,
    /// Leaf tree node.
    TreeLeaf = 5,
    /// Slotted row page.
    Data = 6,
    /// Page on the reuse list.
    FreeList = 7,
    /// Per-cache size counters.
    Counters = 8,
    /// Index catalog of the index partition (page 1).
    IndexCatalog = 9,
}

impl PageKind {
    /// Raw tag value.
    pub const fn as_u8(self) -> u8 {
        self as u8
    }
}

impl TryFrom<u8> for PageKind {
    type Error = StrataError;

    fn try_from(value: u8) -> Result<Self> {
        match value {
            1 => Ok(PageKind::StoreHeader),
            2 => Ok(PageKind::PartitionMeta),
            3 => Ok(PageKind::TreeMeta),
            4 => Ok(PageKind::TreeInner),
            5 => Ok(PageKind::TreeLeaf),
            6 => Ok(PageKind::Data),
            7 => Ok(PageKind::FreeList),
            8 => Ok(PageKind::Counters),
            9 => Ok(PageKind::IndexCatalog),
            other => Err(StrataError::UnknownPageKind(other)),
        }
    }
}

/// Every page layout this build understands, one variant per `(kind, version)`.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash)]
pub enum PageIo {
    StoreHeaderV1,
    /// Meta without per-cache counters and gaps.
    PartitionMetaV1,
    /// Adds the counters page chain head and the gaps link.
    PartitionMetaV2,
    TreeMetaV1,
    TreeInnerV1,
    TreeLeafV1,
    DataV1,
    FreeListV1,
    CountersV1,
    IndexCatalogV1,
}

impl PageIo {
    /// Kind tag of this layout.
    pub const fn kind(self) -> PageKind {
        match self {
            PageIo::StoreHeaderV1 => PageKind::StoreHeader,
            PageIo::PartitionMetaV1 | PageIo::PartitionMetaV2 => PageKind::PartitionMeta,
            PageIo::TreeMetaV1 => PageKind::TreeMeta,
            PageIo::TreeInnerV1 => PageKind::TreeInner,
            PageIo::TreeLeafV1 => PageKind::TreeLeaf,
            PageIo::DataV1 => PageKind::Data,
            PageIo::FreeListV1 => PageKind::FreeList,
            PageIo::CountersV1 => PageKind::Counters,
            PageIo::IndexCatalogV1 => PageKind::IndexCatalog,
        }
    }

    /// Layout version written to the header.
    pub const fn version(self) -> u16 {
        match self {
            PageIo::PartitionMetaV2 => 2,
            _ => 1,
        }
    }

    /// Version dispatch. Unknown versions of known kinds are an explicit error.
    pub fn resolve(kind: PageKind, version: u16) -> Result<PageIo> {
        let io = match (kind, version) {
            (PageKind::StoreHeader, 1) => PageIo::StoreHeaderV1,
            (PageKind::PartitionMeta, 1) => PageIo::PartitionMetaV1,
            (PageKind::PartitionMeta, 2) => PageIo::PartitionMetaV2,
            (PageKind::TreeMeta, 1) => PageIo::TreeMetaV1,
            (PageKind::TreeInner, 1) => PageIo::TreeInnerV1,
            (PageKind::TreeLeaf, 1) => PageIo::TreeLeafV1,
            (PageKind::Data, 1) => PageIo::DataV1,
            (PageKind::FreeList, 1) => PageIo::FreeListV1,
            (PageKind::Counters, 1) => PageIo::CountersV1,
            (PageKind::IndexCatalog, 1) => PageIo::IndexCatalogV1,
            (kind, version) => return Err(StrataError::UnsupportedPageVersion { kind, version }),
        };
        Ok(io)
    }

    /// Reads the layout of an initialized page. Returns `None` for a zeroed page.
    pub fn of(page: &[u8]) -> Result<Option<PageIo>> {
        if page.len() < PAGE_HDR_LEN {
            return Err(StrataError::Corruption("page shorter than header"));
        }
        if page[header::MAGIC].iter().all(|&b| b == 0) && page[header::KIND] == 0 {
            return Ok(None);
        }
        if page[header::MAGIC] != PAGE_MAGIC {
            return Err(StrataError::Corruption("invalid page magic"));
        }
        let kind = PageKind::try_from(page[header::KIND])?;
        PageIo::resolve(kind, be::u16_at(page, header::VERSION)).map(Some)
    }

    /// Like [`PageIo::of`] but fails unless the page has the expected kind.
    pub fn expect(page: &[u8], kind: PageKind) -> Result<PageIo> {
        match PageIo::of(page)? {
            Some(io) if io.kind() == kind => Ok(io),
            Some(_) => Err(StrataError::Corruption("unexpected page kind")),
            None => Err(StrataError::Corruption("page not initialized")),
        }
    }
}

/// Page allocation flag: data partitions hold data pages, the index partition index pages.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum PageFlag {
    /// Page of a data partition.
    Data,
    /// Page of the index partition.
    Index,
}

impl PageFlag {
    /// Checks the flag against the target partition.
    pub fn check(self, partition: PartitionId) -> Result<()> {
        match (self, partition.is_index()) {
            (PageFlag::Data, false) | (PageFlag::Index, true) => Ok(()),
            (PageFlag::Data, true) => Err(StrataError::Invalid(
                "data pages cannot be allocated in the index partition",
            )),
            (PageFlag::Index, false) => Err(StrataError::Invalid(
                "index pages must be allocated in the index partition",
            )),
        }
    }
}

/// Decoded common page header.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct PageHeader {
    /// Page layout.
    pub io: PageIo,
    /// Page identity the header was stamped with.
    pub id: FullPageId,
    /// Stored checksum.
    pub crc32: u32,
}

impl PageHeader {
    /// Creates a header for a page about to be initialized.
    pub fn new(io: PageIo, id: FullPageId) -> Self {
        Self { io, id, crc32: 0 }
    }

    /// Encodes into the first [`PAGE_HDR_LEN`] bytes of `dst`.
    pub fn encode(&self, dst: &mut [u8]) -> Result<()> {
        if dst.len() < PAGE_HDR_LEN {
            return Err(StrataError::Invalid("page header buffer too small"));
        }
        dst[header::MAGIC].copy_from_slice(&PAGE_MAGIC);
        dst[header::KIND] = self.io.kind().as_u8();
        dst[header::RESERVED] = 0;
        be::put_u16(dst, header::VERSION, self.io.version());
        be::put_u32(dst, header::PAGE_INDEX, self.id.index.0);
        be::put_u16(dst, header::PARTITION, self.id.partition.0);
        be::put_u16(dst, header::PARTITION + 2, 0);
        be::put_u32(dst, header::GROUP, self.id.group.0);
        dst[header::CRC32].copy_from_slice(&self.crc32.to_be_bytes());
        Ok(())
    }

    /// Decodes and validates a header.
    pub fn decode(src: &[u8]) -> Result<Self> {
        let io = PageIo::of(src)?.ok_or(StrataError::Corruption("page not initialized"))?;
        if src[header::RESERVED] != 0 {
            return Err(StrataError::Corruption("page header reserved byte not zero"));
        }
        let id = FullPageId::new(
            GroupId(be::u32_at(src, header::GROUP)),
            PartitionId(be::u16_at(src, header::PARTITION)),
            PageIdx(be::u32_at(src, header::PAGE_INDEX)),
        );
        Ok(Self {
            io,
            id,
            crc32: be::u32_at(src, header::CRC32.start),
        })
    }
}

/// Zeroes `page` and writes a fresh header for `io`.
pub fn init_page(page: &mut [u8], io: PageIo, id: FullPageId) -> Result<()> {
    page.fill(0);
    PageHeader::new(io, id).encode(page)
}

/// Rewrites the header identity; used when a page image moves between stores.
pub fn restamp_id(page: &mut [u8], id: FullPageId) {
    be::put_u32(page, header::PAGE_INDEX, id.index.0);
    be::put_u16(page, header::PARTITION, id.partition.0);
    be::put_u32(page, header::GROUP, id.group.0);
}

/// Computes and stores the page checksum. Zeroed pages are left untouched.
pub fn stamp_crc32(page: &mut [u8], id: FullPageId) {
    if page[header::MAGIC] != PAGE_MAGIC {
        return;
    }
    let crc = page_crc32(id, page);
    page[header::CRC32].copy_from_slice(&crc.to_be_bytes());
}

/// Validates the stored checksum of an initialized page.
pub fn verify_crc32(page: &[u8], id: FullPageId) -> Result<()> {
    if page[header::MAGIC] != PAGE_MAGIC {
        return Ok(());
    }
    let stored = be::u32_at(page, header::CRC32.start);
    if stored != page_crc32(id, page) {
        return Err(StrataError::Corruption("page checksum mismatch"));
    }
    Ok(())
}
