//! Segment files of the log.
//!
//! The log is a directory of `wal_<base>.log` files. `base` is the logical
//! offset of the segment's first byte, so a [`crate::types::WalPointer`] stays
//! monotonic across segments: the next segment's base is the previous base
//! plus the previous segment's length.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use tracing::debug;

use crate::primitives::bytes::be;
use crate::primitives::io::{self, FileIo, StdFileIo};
use crate::types::checksum::crc32_parts;
use crate::types::{Result, StrataError};

const WAL_MAGIC: [u8; 4] = *b"STWL";
const WAL_FORMAT_VERSION: u16 = 2;
pub(super) const SEGMENT_HEADER_LEN: u64 = 32;

/// Path of the segment starting at logical offset `base`.
pub fn segment_path(dir: &Path, base: u64) -> PathBuf {
    dir.join(format!("wal_{base:016x}.log"))
}

/// Base offset encoded in a segment file name.
pub fn parse_base(path: &Path) -> Option<u64> {
    if path.extension()? != "log" {
        return None;
    }
    let hex = path.file_stem()?.to_str()?.strip_prefix("wal_")?;
    u64::from_str_radix(hex, 16).ok()
}

/// Segment files under `dir`, ordered by base.
pub(super) fn list(dir: &Path) -> Result<Vec<(u64, PathBuf)>> {
    let mut found = Vec::new();
    for entry in fs::read_dir(dir)? {
        let path = entry?.path();
        if let Some(base) = parse_base(&path) {
            found.push((base, path));
        }
    }
    found.sort_by_key(|(base, _)| *base);
    Ok(found)
}

/// Bytes used by every segment under `dir`; 0 when the directory is missing.
pub fn disk_usage(dir: &Path) -> Result<u64> {
    if !dir.exists() {
        return Ok(0);
    }
    let mut total = 0;
    for (_, path) in list(dir)? {
        total += fs::metadata(path)?.len();
    }
    Ok(total)
}

struct SegmentHeader {
    salt: u64,
    base: u64,
}

impl SegmentHeader {
    fn encode(&self) -> [u8; SEGMENT_HEADER_LEN as usize] {
        let mut buf = [0u8; SEGMENT_HEADER_LEN as usize];
        buf[0..4].copy_from_slice(&WAL_MAGIC);
        be::put_u16(&mut buf, 4, WAL_FORMAT_VERSION);
        be::put_u64(&mut buf, 8, self.salt);
        be::put_u64(&mut buf, 16, self.base);
        let crc = crc32_parts(&[&buf[..28]]);
        be::put_u32(&mut buf, 28, crc);
        buf
    }

    fn decode(src: &[u8; SEGMENT_HEADER_LEN as usize]) -> Result<Self> {
        if src[0..4] != WAL_MAGIC {
            return Err(StrataError::Corruption("wal magic mismatch"));
        }
        if be::u16_at(src, 4) != WAL_FORMAT_VERSION {
            return Err(StrataError::Corruption("wal format version mismatch"));
        }
        if be::u32_at(src, 28) != crc32_parts(&[&src[..28]]) {
            return Err(StrataError::Corruption("wal header crc mismatch"));
        }
        Ok(Self {
            salt: be::u64_at(src, 8),
            base: be::u64_at(src, 16),
        })
    }
}

/// One segment file.
#[derive(Clone)]
pub(super) struct Segment {
    pub base: u64,
    pub path: PathBuf,
    pub io: Arc<dyn FileIo>,
}

impl Segment {
    /// Creates the segment starting at `base`. The header is written to a
    /// temporary name first, so a listed segment always has a whole header.
    pub fn create(dir: &Path, salt: u64, base: u64) -> Result<Self> {
        let path = segment_path(dir, base);
        let tmp = path.with_extension("log.tmp");
        {
            let file = StdFileIo::create(&tmp)?;
            file.write_at(0, &SegmentHeader { salt, base }.encode())?;
            file.sync_all()?;
        }
        fs::rename(&tmp, &path)?;
        io::sync_dir(dir)?;
        debug!(base, path = %path.display(), "wal.segment.create");
        Ok(Self {
            base,
            io: Arc::new(StdFileIo::open_existing(&path)?),
            path,
        })
    }

    /// Opens a listed segment and returns it with its salt.
    pub fn open(path: PathBuf, base: u64) -> Result<(Self, u64)> {
        let file = StdFileIo::open_existing(&path)?;
        if file.len()? < SEGMENT_HEADER_LEN {
            return Err(StrataError::Corruption("wal segment header torn"));
        }
        let mut buf = [0u8; SEGMENT_HEADER_LEN as usize];
        file.read_at(0, &mut buf)?;
        let header = SegmentHeader::decode(&buf)?;
        if header.base != base {
            return Err(StrataError::Corruption("wal segment base does not match its name"));
        }
        Ok((
            Self {
                base,
                path,
                io: Arc::new(file),
            },
            header.salt,
        ))
    }

    /// Offset of the first frame.
    pub fn first_frame(&self) -> u64 {
        self.base + SEGMENT_HEADER_LEN
    }
}
