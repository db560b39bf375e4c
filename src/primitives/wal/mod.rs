#![forbid(unsafe_code)]

pub mod record;
mod segment;
mod txs;

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::primitives::bytes::be;
use crate::primitives::io::{self, FileIo};
use crate::types::checksum::crc32_parts;
use crate::types::{Result, StrataError, WalPointer};

pub use record::{DataOp, DataRecord, IndexUpdate, TxRecord, TxState, WalRecord};
pub use segment::{disk_usage, parse_base, segment_path};

use segment::{Segment, SEGMENT_HEADER_LEN};
use txs::TxTable;

const FRAME_HEADER_LEN: usize = 32;
/// Upper bound on one record payload; larger lengths mean a torn header.
const MAX_PAYLOAD_LEN: u32 = 64 << 20;

/// When row operations force the log to disk.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Synchronous {
    /// Sync after every row operation (most durable).
    #[default]
    Full,
    /// Sync when the last sync is older than the configured interval.
    Normal,
    /// Sync only at checkpoints.
    Off,
}

impl Synchronous {
    /// Returns the string representation of the synchronous mode.
    pub fn as_str(self) -> &'static str {
        match self {
            Synchronous::Full => "full",
            Synchronous::Normal => "normal",
            Synchronous::Off => "off",
        }
    }

    /// Parses a synchronous mode from a string (case-insensitive).
    pub fn parse(value: &str) -> Option<Self> {
        match value.to_ascii_lowercase().as_str() {
            "full" => Some(Synchronous::Full),
            "normal" => Some(Synchronous::Normal),
            "off" => Some(Synchronous::Off),
            _ => None,
        }
    }
}

/// Statistics tracking WAL operations.
#[derive(Clone, Debug, Default, Serialize)]
pub struct WalStats {
    /// Number of records appended since open.
    pub records_appended: u64,
    /// Total bytes written since open.
    pub bytes_appended: u64,
    /// Number of sync operations performed.
    pub syncs: u64,
    /// Bytes dropped from a torn tail at open.
    pub truncated_tail_bytes: u64,
    /// Segments started since open.
    pub segments_created: u64,
    /// Segments deleted by [`Wal::truncate_before`] since open.
    pub segments_removed: u64,
    /// Bytes deleted by [`Wal::truncate_before`] since open.
    pub bytes_removed: u64,
}

/// Segment and retention settings.
#[derive(Clone, Copy, Debug)]
pub struct WalOptions {
    /// A segment is sealed once the next frame would grow it past this size.
    pub segment_bytes: u64,
    /// Finished transactions remembered in checkpoint begin records.
    pub tx_retention: usize,
}

impl Default for WalOptions {
    fn default() -> Self {
        Self {
            segment_bytes: 16 << 20,
            tx_retention: 4096,
        }
    }
}

#[derive(Clone, Debug)]
struct FrameHeader {
    tag: u8,
    payload_len: u32,
    prev_chain: u64,
    payload_crc32: u32,
    salt: u64,
}

impl FrameHeader {
    fn encode(&self) -> [u8; FRAME_HEADER_LEN] {
        let mut buf = [0u8; FRAME_HEADER_LEN];
        buf[0] = self.tag;
        be::put_u32(&mut buf, 4, self.payload_len);
        be::put_u64(&mut buf, 8, self.prev_chain);
        be::put_u32(&mut buf, 16, self.payload_crc32);
        be::put_u64(&mut buf, 20, self.salt);
        let crc = crc32_parts(&[&buf[..28]]);
        be::put_u32(&mut buf, 28, crc);
        buf
    }

    fn decode(src: &[u8; FRAME_HEADER_LEN]) -> Option<Self> {
        if be::u32_at(src, 28) != crc32_parts(&[&src[..28]]) || src[1..4] != [0, 0, 0] {
            return None;
        }
        Some(Self {
            tag: src[0],
            payload_len: be::u32_at(src, 4),
            prev_chain: be::u64_at(src, 8),
            payload_crc32: be::u32_at(src, 16),
            salt: be::u64_at(src, 20),
        })
    }
}

fn chain_value(prev_chain: u64, header: &[u8], payload: &[u8]) -> u64 {
    let frame_size = (FRAME_HEADER_LEN + payload.len()) as u64;
    let crc = crc32_parts(&[&prev_chain.to_be_bytes(), header, payload]);
    (frame_size << 32) | u64::from(crc)
}

struct WalState {
    /// Oldest first; never empty. The last one takes appends.
    segments: Vec<Segment>,
    append_offset: u64,
    prev_chain: u64,
    last_sync: Instant,
    dirty: bool,
    txs: TxTable,
    stats: WalStats,
}

impl WalState {
    fn active(&self) -> &Segment {
        &self.segments[self.segments.len() - 1]
    }

    fn views(&self) -> Vec<SegmentView> {
        let mut views = Vec::with_capacity(self.segments.len());
        for (i, seg) in self.segments.iter().enumerate() {
            let end = self
                .segments
                .get(i + 1)
                .map_or(self.append_offset, |next| next.base);
            views.push(SegmentView {
                base: seg.base,
                len: end - seg.base,
                io: Arc::clone(&seg.io),
            });
        }
        views
    }
}

/// Append-only log of logical records, stored as a directory of segments.
///
/// Each frame carries a CRC chained over the previous frame, across segment
/// boundaries too, so replay stops at the first torn or foreign frame. A
/// [`WalPointer`] is the logical offset of a frame and can be used to restart
/// replay. Segments wholly before the last finished checkpoint are removed
/// with [`Wal::truncate_before`].
pub struct Wal {
    dir: PathBuf,
    salt: u64,
    options: WalOptions,
    state: Mutex<WalState>,
}

impl Wal {
    /// Opens or creates the log in `dir`. A torn tail left by a crash is
    /// truncated, together with every segment after it.
    pub fn open(dir: impl AsRef<Path>, options: WalOptions) -> Result<Self> {
        let dir = dir.as_ref().to_path_buf();
        fs::create_dir_all(&dir)?;
        let mut segments = Vec::new();
        let mut salt = None;
        for (base, path) in segment::list(&dir)? {
            let (seg, seg_salt) = Segment::open(path, base)?;
            if *salt.get_or_insert(seg_salt) != seg_salt {
                return Err(StrataError::Corruption("wal segment belongs to another log"));
            }
            segments.push(seg);
        }
        let salt = match salt {
            Some(salt) => salt,
            None => {
                let salt = rand::random::<u64>();
                segments.push(Segment::create(&dir, salt, 0)?);
                salt
            }
        };

        let mut views = Vec::with_capacity(segments.len());
        for seg in &segments {
            views.push(SegmentView {
                base: seg.base,
                len: seg.io.len()?,
                io: Arc::clone(&seg.io),
            });
        }
        let mut iter = WalIterator::new(views, 0, salt, segments[0].first_frame(), u64::MAX);
        let mut txs = TxTable::new(options.tx_retention);
        while let Some((_, tag, payload)) = iter.next_frame()? {
            if tag == record::tag::TX || tag == record::tag::CHECKPOINT_BEGIN {
                txs.on_record(&WalRecord::decode(tag, &payload)?);
            }
        }

        let valid_end = iter.offset;
        let mut stats = WalStats::default();
        for seg in segments.drain(iter.idx + 1..) {
            let len = seg.io.len()?;
            warn!(base = seg.base, len, "wal.open.drop_segment");
            io::remove_if_exists(&seg.path)?;
            stats.truncated_tail_bytes += len;
        }
        let active = &segments[iter.idx];
        let file_len = active.io.len()?;
        let valid_len = valid_end - active.base;
        if valid_len < file_len {
            warn!(
                valid_end,
                file_len,
                dropped = file_len - valid_len,
                "wal.open.truncate_tail"
            );
            active.io.truncate(valid_len)?;
            active.io.sync_all()?;
            stats.truncated_tail_bytes += file_len - valid_len;
        }
        if stats.truncated_tail_bytes > 0 {
            io::sync_dir(&dir)?;
        }
        debug!(
            first = segments[0].base,
            end = valid_end,
            segments = segments.len(),
            salt,
            "wal.open"
        );
        Ok(Self {
            dir,
            salt,
            options,
            state: Mutex::new(WalState {
                segments,
                append_offset: valid_end,
                prev_chain: iter.prev_chain.unwrap_or(0),
                last_sync: Instant::now(),
                dirty: false,
                txs,
                stats,
            }),
        })
    }

    /// Appends one record and returns its pointer. Does not sync.
    pub fn append(&self, record: &WalRecord) -> Result<WalPointer> {
        let mut payload = Vec::new();
        record.encode_payload(&mut payload);
        let mut state = self.state.lock();
        let pointer = self.write_frame(&mut state, record.tag(), &payload)?;
        state.txs.on_record(record);
        Ok(pointer)
    }

    /// Appends a checkpoint begin record carrying the transaction states
    /// known to the log.
    pub fn append_checkpoint_begin(&self, id: u64) -> Result<WalPointer> {
        let mut state = self.state.lock();
        let record = WalRecord::CheckpointBegin {
            id,
            txs: state.txs.snapshot(),
        };
        let mut payload = Vec::new();
        record.encode_payload(&mut payload);
        self.write_frame(&mut state, record.tag(), &payload)
    }

    fn write_frame(&self, state: &mut WalState, tag: u8, payload: &[u8]) -> Result<WalPointer> {
        if payload.len() as u64 > u64::from(MAX_PAYLOAD_LEN) {
            return Err(StrataError::Invalid("wal record payload too large"));
        }
        let frame_len = (FRAME_HEADER_LEN + payload.len()) as u64;
        let used = state.append_offset - state.active().base;
        if used > SEGMENT_HEADER_LEN && used + frame_len > self.options.segment_bytes {
            self.roll(state)?;
        }
        let header = FrameHeader {
            tag,
            payload_len: payload.len() as u32,
            prev_chain: state.prev_chain,
            payload_crc32: crc32_parts(&[payload]),
            salt: self.salt,
        }
        .encode();
        let mut frame = Vec::with_capacity(frame_len as usize);
        frame.extend_from_slice(&header);
        frame.extend_from_slice(payload);
        let pointer = WalPointer(state.append_offset);
        let active = state.active();
        active.io.write_at(pointer.0 - active.base, &frame)?;
        state.prev_chain = chain_value(state.prev_chain, &header, payload);
        state.append_offset += frame_len;
        state.dirty = true;
        state.stats.records_appended += 1;
        state.stats.bytes_appended += frame_len;
        Ok(pointer)
    }

    /// Seals the active segment and starts the next one at the current end.
    fn roll(&self, state: &mut WalState) -> Result<()> {
        state.active().io.sync_all()?;
        let next = Segment::create(&self.dir, self.salt, state.append_offset)?;
        debug!(base = next.base, "wal.segment.roll");
        state.append_offset = next.first_frame();
        state.segments.push(next);
        state.stats.segments_created += 1;
        Ok(())
    }

    /// Syncs all appended records to persistent storage.
    pub fn sync(&self) -> Result<()> {
        let active = Arc::clone(&self.state.lock().active().io);
        active.sync_all()?;
        let mut state = self.state.lock();
        state.stats.syncs += 1;
        state.last_sync = Instant::now();
        state.dirty = false;
        Ok(())
    }

    /// Syncs according to `mode`; `interval` applies to [`Synchronous::Normal`].
    pub fn sync_for(&self, mode: Synchronous, interval: Duration) -> Result<()> {
        let due = {
            let state = self.state.lock();
            match mode {
                Synchronous::Full => state.dirty,
                Synchronous::Normal => state.dirty && state.last_sync.elapsed() >= interval,
                Synchronous::Off => false,
            }
        };
        if due {
            self.sync()?;
        }
        Ok(())
    }

    /// Replays records starting at `from` (or the first retained record).
    ///
    /// `from` must be a pointer previously returned by [`Wal::append`] or by
    /// replay; anything else fails with `Corruption`. A pointer into a
    /// removed segment fails with `Invalid`.
    pub fn replay(&self, from: Option<WalPointer>) -> Result<WalIterator> {
        let state = self.state.lock();
        let first = state.segments[0].first_frame();
        let start = from.map_or(first, |ptr| ptr.0);
        if start < first {
            return Err(StrataError::Invalid("replay pointer precedes the retained log"));
        }
        if start > state.append_offset {
            return Err(StrataError::Invalid("replay pointer outside the log"));
        }
        let idx = state.segments.partition_point(|seg| seg.base <= start) - 1;
        let mut iter = WalIterator::new(state.views(), idx, self.salt, start, state.append_offset);
        iter.strict_first = from.is_some();
        Ok(iter)
    }

    /// Deletes every sealed segment that ends at or before `pointer`.
    /// Returns the number of segments removed.
    pub fn truncate_before(&self, pointer: WalPointer) -> Result<usize> {
        let mut state = self.state.lock();
        let mut removed = 0;
        while state.segments.len() > 1 && state.segments[1].base <= pointer.0 {
            let seg = state.segments.remove(0);
            let len = state.segments[0].base - seg.base;
            io::remove_if_exists(&seg.path)?;
            state.stats.segments_removed += 1;
            state.stats.bytes_removed += len;
            removed += 1;
        }
        if removed > 0 {
            io::sync_dir(&self.dir)?;
            info!(
                before = pointer.0,
                removed,
                first = state.segments[0].base,
                "wal.truncate"
            );
        }
        Ok(removed)
    }

    /// Pointer of the first retained record.
    pub fn first_pointer(&self) -> WalPointer {
        WalPointer(self.state.lock().segments[0].first_frame())
    }

    /// Pointer the next record will receive.
    pub fn end_pointer(&self) -> WalPointer {
        WalPointer(self.state.lock().append_offset)
    }

    /// Returns current statistics for this WAL instance.
    pub fn stats(&self) -> WalStats {
        self.state.lock().stats.clone()
    }

    /// Number of segment files.
    pub fn segment_count(&self) -> usize {
        self.state.lock().segments.len()
    }

    /// Directory holding the segments.
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Bytes held by the retained segments.
    pub fn len(&self) -> u64 {
        let state = self.state.lock();
        state.append_offset - state.segments[0].base
    }

    /// Returns true if the WAL contains no records.
    pub fn is_empty(&self) -> bool {
        let state = self.state.lock();
        state.segments.len() == 1 && state.append_offset == state.active().first_frame()
    }
}

struct SegmentView {
    base: u64,
    len: u64,
    io: Arc<dyn FileIo>,
}

/// Lazy, finite iterator over `(pointer, record)` pairs.
///
/// Stops at the end of the valid prefix of the log.
pub struct WalIterator {
    segments: Vec<SegmentView>,
    idx: usize,
    salt: u64,
    offset: u64,
    end: u64,
    prev_chain: Option<u64>,
    strict_first: bool,
}

impl WalIterator {
    fn new(segments: Vec<SegmentView>, idx: usize, salt: u64, offset: u64, end: u64) -> Self {
        Self {
            segments,
            idx,
            salt,
            offset,
            end,
            prev_chain: None,
            strict_first: false,
        }
    }

    /// Reads the next frame. Returns `None` at the end of the valid log.
    pub fn next_frame(&mut self) -> Result<Option<(WalPointer, u8, Vec<u8>)>> {
        let strict = self.prev_chain.is_none() && self.strict_first;
        let (base, limit, io) = loop {
            let Some(seg) = self.segments.get(self.idx) else {
                return Ok(None);
            };
            let seg_end = seg.base + seg.len;
            let limit = seg_end.min(self.end);
            if self.offset + FRAME_HEADER_LEN as u64 <= limit {
                break (seg.base, limit, Arc::clone(&seg.io));
            }
            // Only a segment consumed to its last byte continues into the next.
            let next_base = self.segments.get(self.idx + 1).map(|next| next.base);
            match next_base {
                Some(next) if self.offset == seg_end && next == seg_end && next < self.end => {
                    self.offset = next + SEGMENT_HEADER_LEN;
                    self.idx += 1;
                }
                _ => return self.stop(false),
            }
        };
        let mut raw = [0u8; FRAME_HEADER_LEN];
        io.read_at(self.offset - base, &mut raw)?;
        let header = match FrameHeader::decode(&raw) {
            Some(header)
                if header.salt == self.salt && header.payload_len <= MAX_PAYLOAD_LEN =>
            {
                header
            }
            _ => return self.stop(strict),
        };
        if let Some(prev) = self.prev_chain {
            if header.prev_chain != prev {
                return self.stop(false);
            }
        }
        let payload_off = self.offset + FRAME_HEADER_LEN as u64;
        if payload_off + u64::from(header.payload_len) > limit {
            return self.stop(strict);
        }
        let mut payload = vec![0u8; header.payload_len as usize];
        io.read_at(payload_off - base, &mut payload)?;
        if crc32_parts(&[&payload]) != header.payload_crc32 {
            return self.stop(strict);
        }
        let pointer = WalPointer(self.offset);
        self.prev_chain = Some(chain_value(header.prev_chain, &raw, &payload));
        self.offset = payload_off + payload.len() as u64;
        Ok(Some((pointer, header.tag, payload)))
    }

    fn stop<T>(&mut self, strict: bool) -> Result<Option<T>> {
        if strict {
            return Err(StrataError::Corruption(
                "replay pointer is not a frame boundary",
            ));
        }
        self.end = self.offset;
        Ok(None)
    }

    /// Offset up to which frames have been validated.
    pub fn valid_up_to(&self) -> u64 {
        self.offset
    }
}

impl Iterator for WalIterator {
    type Item = Result<(WalPointer, WalRecord)>;

    fn next(&mut self) -> Option<Self::Item> {
        match self.next_frame() {
            Ok(Some((ptr, tag, payload))) => {
                Some(WalRecord::decode(tag, &payload).map(|record| (ptr, record)))
            }
            Ok(None) => None,
            Err(err) => {
                self.end = self.offset;
                Some(Err(err))
            }
        }
    }
}
