use std::collections::BTreeMap;

use serde::Serialize;

use crate::primitives::bytes::buf::Reader;
use crate::types::Result;

/// Partition update counter tolerating out-of-order application.
///
/// `lwm` is the highest counter below which every update has been applied;
/// applied counters above it are kept as closed gap-free ranges until the
/// missing ones arrive.
#[derive(Clone, Debug, Default, Eq, PartialEq, Serialize)]
pub struct UpdateCounter {
    lwm: u64,
    hwm: u64,
    applied: BTreeMap<u64, u64>,
}

impl UpdateCounter {
    /// Counter restored from persisted state.
    pub fn new(lwm: u64, hwm: u64, applied: Vec<(u64, u64)>) -> Self {
        let applied: BTreeMap<u64, u64> = applied
            .into_iter()
            .filter(|(start, end)| start <= end && *start > lwm + 1)
            .collect();
        let top = applied.values().copied().max().unwrap_or(0);
        Self {
            lwm,
            hwm: hwm.max(lwm).max(top),
            applied,
        }
    }

    /// Low watermark.
    pub fn get(&self) -> u64 {
        self.lwm
    }

    /// Highest counter applied.
    pub fn hwm(&self) -> u64 {
        self.hwm
    }

    /// Counter to assign to the next local update.
    pub fn next(&self) -> u64 {
        self.hwm + 1
    }

    /// Applied ranges above the low watermark.
    pub fn out_of_order(&self) -> Vec<(u64, u64)> {
        self.applied.iter().map(|(s, e)| (*s, *e)).collect()
    }

    /// Returns true while some applied counter sits above the low watermark.
    pub fn has_out_of_order(&self) -> bool {
        !self.applied.is_empty()
    }

    /// Missing ranges between the low and high watermarks.
    pub fn gaps(&self) -> Vec<(u64, u64)> {
        let mut gaps = Vec::new();
        let mut from = self.lwm + 1;
        for (start, end) in &self.applied {
            if *start > from {
                gaps.push((from, start - 1));
            }
            from = end + 1;
        }
        gaps
    }

    /// Records `counter` as applied; returns false for a duplicate.
    pub fn update(&mut self, counter: u64) -> bool {
        if counter <= self.lwm || self.contains(counter) {
            return false;
        }
        self.hwm = self.hwm.max(counter);
        if counter == self.lwm + 1 {
            self.lwm = counter;
            while let Some((&start, &end)) = self.applied.iter().next() {
                if start != self.lwm + 1 {
                    break;
                }
                self.applied.remove(&start);
                self.lwm = end;
            }
            return true;
        }
        let mut start = counter;
        let mut end = counter;
        if let Some((&s, &e)) = self.applied.range(..counter).next_back() {
            if e + 1 == counter {
                self.applied.remove(&s);
                start = s;
            }
        }
        if let Some(&e) = self.applied.get(&(counter + 1)) {
            self.applied.remove(&(counter + 1));
            end = e;
        }
        self.applied.insert(start, end);
        true
    }

    fn contains(&self, counter: u64) -> bool {
        self.applied
            .range(..=counter)
            .next_back()
            .is_some_and(|(_, e)| counter <= *e)
    }

    /// Serialized applied ranges, stored as the partition's gaps row.
    pub fn encode_ranges(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(4 + self.applied.len() * 16);
        out.extend_from_slice(&(self.applied.len() as u32).to_be_bytes());
        for (start, end) in &self.applied {
            out.extend_from_slice(&start.to_be_bytes());
            out.extend_from_slice(&end.to_be_bytes());
        }
        out
    }

    /// Parses [`UpdateCounter::encode_ranges`] output.
    pub fn decode_ranges(src: &[u8]) -> Result<Vec<(u64, u64)>> {
        let mut r = Reader::new(src);
        let count = r.u32()? as usize;
        let mut ranges = Vec::with_capacity(count.min(4096));
        for _ in 0..count {
            ranges.push((r.u64()?, r.u64()?));
        }
        r.finish()?;
        Ok(ranges)
    }
}
