//! Checkpoint cookie and crash restore of page images.

use std::collections::BTreeMap;
use std::path::Path;

use tracing::{debug, info, warn};

use crate::primitives::bytes::be;
use crate::primitives::io;
use crate::primitives::pager::PageMemory;
use crate::primitives::wal::{Wal, WalRecord};
use crate::types::checksum::crc32_parts;
use crate::types::{FullPageId, Result, StrataError, WalPointer};

const COOKIE_MAGIC: [u8; 4] = *b"STCK";
const COOKIE_LEN: usize = 24;

/// Last finished checkpoint, persisted atomically after every checkpoint.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct CheckpointCookie {
    /// Checkpoint id.
    pub id: u64,
    /// Pointer of its `CheckpointBegin` record.
    pub begin: WalPointer,
}

impl CheckpointCookie {
    fn encode(&self) -> [u8; COOKIE_LEN] {
        let mut out = [0u8; COOKIE_LEN];
        out[..4].copy_from_slice(&COOKIE_MAGIC);
        be::put_u64(&mut out, 4, self.id);
        be::put_u64(&mut out, 12, self.begin.0);
        let crc = crc32_parts(&[&out[..20]]);
        be::put_u32(&mut out, 20, crc);
        out
    }

    fn decode(src: &[u8]) -> Result<Self> {
        if src.len() != COOKIE_LEN || src[..4] != COOKIE_MAGIC {
            return Err(StrataError::Corruption("checkpoint cookie malformed"));
        }
        if crc32_parts(&[&src[..20]]) != be::u32_at(src, 20) {
            return Err(StrataError::Corruption("checkpoint cookie checksum mismatch"));
        }
        Ok(Self {
            id: be::u64_at(src, 4),
            begin: WalPointer(be::u64_at(src, 12)),
        })
    }

    /// Reads the cookie at `path`; `None` when no checkpoint finished yet.
    pub fn load(path: &Path) -> Result<Option<Self>> {
        match std::fs::read(path) {
            Ok(bytes) => Self::decode(&bytes).map(Some),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(err) => Err(err.into()),
        }
    }

    /// Persists the cookie through an atomic rename.
    pub fn store(&self, path: &Path) -> Result<()> {
        io::write_atomic(path, &self.encode())
    }
}

/// Outcome of [`restore_pages`].
#[derive(Clone, Debug, Default)]
pub struct RestoreOutcome {
    /// Where logical replay starts; `None` replays the whole log.
    pub replay_from: Option<WalPointer>,
    /// Checkpoint whose images were applied.
    pub checkpoint: Option<u64>,
    /// Page images rewritten to stores.
    pub pages_restored: u64,
    /// Images skipped because their store is not registered.
    pub pages_skipped: u64,
}

struct Candidate {
    id: u64,
    begin: WalPointer,
    images: BTreeMap<FullPageId, Vec<u8>>,
}

/// Rewrites the page images of the newest checkpoint that logged all of them
/// and returns where logical replay has to start.
///
/// Stores must be registered in `memory` and nothing may be cached yet.
pub fn restore_pages(wal: &Wal, cookie: Option<CheckpointCookie>, memory: &PageMemory) -> Result<RestoreOutcome> {
    let mut current: Option<Candidate> = None;
    let mut complete: Option<Candidate> = None;
    for item in wal.replay(cookie.map(|c| c.begin))? {
        let (pointer, record) = item?;
        match record {
            WalRecord::CheckpointBegin { id, .. } => {
                current = Some(Candidate {
                    id,
                    begin: pointer,
                    images: BTreeMap::new(),
                });
            }
            WalRecord::PageSnapshot { page, bytes } => {
                if let Some(candidate) = current.as_mut() {
                    candidate.images.insert(page, bytes);
                }
            }
            WalRecord::CheckpointPagesLogged { id, pages } => match current.take() {
                Some(candidate) if candidate.id == id => {
                    if candidate.images.len() as u64 != pages {
                        warn!(id, logged = pages, found = candidate.images.len(), "checkpoint.restore.image_count");
                    }
                    complete = Some(candidate);
                }
                _ => return Err(StrataError::Corruption("checkpoint pages marker without its begin record")),
            },
            WalRecord::Data(_) | WalRecord::Tx(_) | WalRecord::CheckpointEnd { .. } => {}
        }
    }

    let Some(candidate) = complete else {
        debug!(from = ?cookie.map(|c| c.begin.0), "checkpoint.restore.none");
        return Ok(RestoreOutcome {
            replay_from: cookie.map(|c| c.begin),
            ..RestoreOutcome::default()
        });
    };
    let mut outcome = RestoreOutcome {
        replay_from: Some(candidate.begin),
        checkpoint: Some(candidate.id),
        ..RestoreOutcome::default()
    };
    let mut touched = Vec::new();
    for (page, mut bytes) in candidate.images {
        let Some(store) = memory.registered_store(page.group, page.partition) else {
            outcome.pages_skipped += 1;
            continue;
        };
        if bytes.len() != store.page_size() {
            return Err(StrataError::Corruption("page image size differs from its store"));
        }
        store.write_page(page.index, &mut bytes)?;
        outcome.pages_restored += 1;
        if !touched.iter().any(|s: &std::sync::Arc<_>| std::sync::Arc::ptr_eq(s, &store)) {
            touched.push(store);
        }
    }
    for store in touched {
        store.sync()?;
    }
    info!(
        checkpoint = candidate.id,
        begin = candidate.begin.0,
        restored = outcome.pages_restored,
        skipped = outcome.pages_skipped,
        "checkpoint.restore"
    );
    Ok(outcome)
}
