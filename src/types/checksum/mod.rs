#![forbid(unsafe_code)]

use super::page::header::CRC32;
use super::FullPageId;

/// CRC32 over a page with its checksum field treated as zero, seeded with the
/// page identity so a page written at the wrong offset fails validation.
pub fn page_crc32(id: FullPageId, page: &[u8]) -> u32 {
    let mut hasher = crc32fast::Hasher::new();
    hasher.update(&id.group.0.to_be_bytes());
    hasher.update(&id.partition.0.to_be_bytes());
    hasher.update(&id.index.0.to_be_bytes());
    hasher.update(&page[..CRC32.start]);
    hasher.update(&[0u8; 4]);
    hasher.update(&page[CRC32.end..]);
    hasher.finalize()
}

/// CRC32 over several byte slices.
pub fn crc32_parts(parts: &[&[u8]]) -> u32 {
    let mut hasher = crc32fast::Hasher::new();
    for part in parts {
        hasher.update(part);
    }
    hasher.finalize()
}
