use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;

use tracing::debug;

use crate::primitives::bytes::be;
use crate::primitives::io::{FileIo, StdFileIo};
use crate::types::page::{self, MIN_PAGE_SIZE, PAGE_HDR_LEN};
use crate::types::{FullPageId, GroupId, PageIdx, PageIo, PageKind, PartitionId, Result, StrataError};

const STORE_FORMAT_VERSION: u16 = 1;
const HDR_FORMAT: usize = PAGE_HDR_LEN;
const HDR_PAGE_SIZE: usize = PAGE_HDR_LEN + 4;

/// File of fixed-size pages for one `(group, partition)`.
///
/// Page 0 is the store header; page `i` lives at `i * page_size`. The file only
/// grows: freed pages go to the partition's reuse list.
pub struct PageStore {
    path: PathBuf,
    io: Arc<dyn FileIo>,
    group: GroupId,
    partition: PartitionId,
    page_size: usize,
    allocated: AtomicU32,
    pages_written: AtomicU64,
    invalidated: AtomicBool,
    verify_checksums: bool,
}

impl PageStore {
    /// Creates (or truncates) a store file and writes its header page.
    pub fn create(
        path: impl AsRef<Path>,
        group: GroupId,
        partition: PartitionId,
        page_size: u32,
        verify_checksums: bool,
    ) -> Result<Arc<Self>> {
        if page_size < MIN_PAGE_SIZE || !page_size.is_power_of_two() {
            return Err(StrataError::Invalid("page size must be a power of two >= 512"));
        }
        let path = path.as_ref().to_path_buf();
        let io: Arc<dyn FileIo> = Arc::new(StdFileIo::create(&path)?);
        let store = Self {
            path,
            io,
            group,
            partition,
            page_size: page_size as usize,
            allocated: AtomicU32::new(1),
            pages_written: AtomicU64::new(0),
            invalidated: AtomicBool::new(false),
            verify_checksums,
        };
        let mut header = vec![0u8; store.page_size];
        page::init_page(&mut header, PageIo::StoreHeaderV1, store.page_id(PageIdx::STORE_HEADER))?;
        be::put_u16(&mut header, HDR_FORMAT, STORE_FORMAT_VERSION);
        be::put_u32(&mut header, HDR_PAGE_SIZE, page_size);
        store.write_page(PageIdx::STORE_HEADER, &mut header)?;
        store.sync()?;
        debug!(path = %store.path.display(), group = group.0, partition = partition.0, "store.create");
        Ok(Arc::new(store))
    }

    /// Opens an existing store and validates its header against the expected identity.
    pub fn open(
        path: impl AsRef<Path>,
        group: GroupId,
        partition: PartitionId,
        page_size: u32,
        verify_checksums: bool,
    ) -> Result<Arc<Self>> {
        let path = path.as_ref().to_path_buf();
        let io: Arc<dyn FileIo> = Arc::new(StdFileIo::open_existing(&path)?);
        let len = io.len()?;
        if len < u64::from(page_size) {
            return Err(StrataError::Corruption("page store shorter than its header"));
        }
        let mut header = vec![0u8; page_size as usize];
        io.read_at(0, &mut header)?;
        let decoded = page::PageHeader::decode(&header)?;
        if decoded.io.kind() != PageKind::StoreHeader {
            return Err(StrataError::Corruption("page store header has wrong kind"));
        }
        if be::u32_at(&header, HDR_PAGE_SIZE) != page_size {
            return Err(StrataError::Corruption("page store page size mismatch"));
        }
        if be::u16_at(&header, HDR_FORMAT) != STORE_FORMAT_VERSION {
            return Err(StrataError::Corruption("page store format version mismatch"));
        }
        if decoded.id.group != group || decoded.id.partition != partition {
            return Err(StrataError::Corruption("page store belongs to another partition"));
        }
        page::verify_crc32(&header, decoded.id)?;
        let pages = (len / u64::from(page_size)).max(1);
        let pages = u32::try_from(pages).map_err(|_| StrataError::Corruption("page store too large"))?;
        debug!(path = %path.display(), pages, "store.open");
        Ok(Arc::new(Self {
            path,
            io,
            group,
            partition,
            page_size: page_size as usize,
            allocated: AtomicU32::new(pages),
            pages_written: AtomicU64::new(0),
            invalidated: AtomicBool::new(false),
            verify_checksums,
        }))
    }

    /// Opens the store when the file exists, otherwise creates it.
    pub fn open_or_create(
        path: impl AsRef<Path>,
        group: GroupId,
        partition: PartitionId,
        page_size: u32,
        verify_checksums: bool,
    ) -> Result<Arc<Self>> {
        if path.as_ref().exists() {
            Self::open(path, group, partition, page_size, verify_checksums)
        } else {
            Self::create(path, group, partition, page_size, verify_checksums)
        }
    }

    fn page_id(&self, index: PageIdx) -> FullPageId {
        FullPageId::new(self.group, self.partition, index)
    }

    fn offset(&self, index: PageIdx) -> u64 {
        u64::from(index.0) * self.page_size as u64
    }

    /// Reads page `index`. Allocated pages that were never written read as zeros.
    pub fn read_page(&self, index: PageIdx, dst: &mut [u8]) -> Result<()> {
        if dst.len() != self.page_size {
            return Err(StrataError::Invalid("page buffer size mismatch"));
        }
        if index.0 >= self.allocated() {
            return Err(StrataError::Invalid("page index beyond allocation"));
        }
        let off = self.offset(index);
        if off + self.page_size as u64 > self.io.len()? {
            dst.fill(0);
            return Ok(());
        }
        self.io.read_at(off, dst)?;
        if self.verify_checksums {
            page::verify_crc32(dst, self.page_id(index))?;
        }
        Ok(())
    }

    /// Stamps the page checksum and writes the page.
    pub fn write_page(&self, index: PageIdx, page: &mut [u8]) -> Result<()> {
        if page.len() != self.page_size {
            return Err(StrataError::Invalid("page buffer size mismatch"));
        }
        page::stamp_crc32(page, self.page_id(index));
        self.io.write_at(self.offset(index), page)?;
        self.allocated.fetch_max(index.0 + 1, Ordering::AcqRel);
        self.pages_written.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    /// Reserves the next page index.
    pub fn allocate(&self) -> PageIdx {
        PageIdx(self.allocated.fetch_add(1, Ordering::AcqRel))
    }

    /// Number of page indexes handed out, header included.
    pub fn allocated(&self) -> u32 {
        self.allocated.load(Ordering::Acquire)
    }

    /// Pages physically present in the file.
    pub fn file_pages(&self) -> Result<u64> {
        Ok(self.io.len()? / self.page_size as u64)
    }

    /// Forces written pages to disk.
    pub fn sync(&self) -> Result<()> {
        self.io.sync_all()
    }

    /// Count of page writes since open.
    pub fn pages_written(&self) -> u64 {
        self.pages_written.load(Ordering::Relaxed)
    }

    /// Marks the store unusable; set when its pages are dropped from memory.
    pub fn invalidate(&self) {
        self.invalidated.store(true, Ordering::Release);
    }

    /// Returns true after [`PageStore::invalidate`].
    pub fn is_invalidated(&self) -> bool {
        self.invalidated.load(Ordering::Acquire)
    }

    /// Store file path.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Owning group.
    pub fn group(&self) -> GroupId {
        self.group
    }

    /// Owning partition.
    pub fn partition(&self) -> PartitionId {
        self.partition
    }

    /// Page size in bytes.
    pub fn page_size(&self) -> usize {
        self.page_size
    }
}

impl fmt::Debug for PageStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PageStore")
            .field("path", &self.path)
            .field("group", &self.group)
            .field("partition", &self.partition)
            .field("allocated", &self.allocated())
            .finish()
    }
}
