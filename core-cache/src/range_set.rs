//! # Byte Range Sets
//!
//! Which bytes of a resource are on disk, as a sorted list of disjoint,
//! non-adjacent half-open intervals.
//!
//! Every mutation keeps the list maximally coalesced, so two sets covering the
//! same bytes always compare equal and the list length stays proportional to
//! the number of holes, not the number of writes.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Half-open byte interval `[start, end)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ByteRange {
    pub start: u64,
    pub end: u64,
}

impl ByteRange {
    /// `start > end` is normalised to an empty range at `start`.
    pub fn new(start: u64, end: u64) -> Self {
        Self {
            start,
            end: end.max(start),
        }
    }

    /// `[offset, offset + length)`, or `None` on overflow.
    pub fn from_offset_len(offset: u64, length: u64) -> Option<Self> {
        offset.checked_add(length).map(|end| Self::new(offset, end))
    }

    pub fn len(&self) -> u64 {
        self.end - self.start
    }

    pub fn is_empty(&self) -> bool {
        self.start >= self.end
    }

    pub fn contains(&self, other: &ByteRange) -> bool {
        self.start <= other.start && other.end <= self.end
    }

    pub fn intersect(&self, other: &ByteRange) -> Option<ByteRange> {
        let start = self.start.max(other.start);
        let end = self.end.min(other.end);
        (start < end).then_some(ByteRange { start, end })
    }
}

impl fmt::Display for ByteRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}, {})", self.start, self.end)
    }
}

/// Cached byte ranges of one resource.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "Vec<ByteRange>", into = "Vec<ByteRange>")]
pub struct RangeSet {
    ranges: Vec<ByteRange>,
}

impl RangeSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add `range`, merging it with every range it overlaps or touches.
    pub fn insert(&mut self, range: ByteRange) {
        if range.is_empty() {
            return;
        }
        // First range that ends at or after our start (touching counts).
        let first = self.ranges.partition_point(|r| r.end < range.start);
        let mut merged = range;
        let mut last = first;
        while last < self.ranges.len() && self.ranges[last].start <= merged.end {
            merged.start = merged.start.min(self.ranges[last].start);
            merged.end = merged.end.max(self.ranges[last].end);
            last += 1;
        }
        self.ranges.splice(first..last, std::iter::once(merged));
    }

    /// Uncovered sub-ranges of `window`, ascending.
    pub fn gaps(&self, window: ByteRange) -> Vec<ByteRange> {
        let mut gaps = Vec::new();
        if window.is_empty() {
            return gaps;
        }
        let mut cursor = window.start;
        let first = self.ranges.partition_point(|r| r.end <= window.start);
        for range in &self.ranges[first..] {
            if range.start >= window.end {
                break;
            }
            if range.start > cursor {
                gaps.push(ByteRange::new(cursor, range.start));
            }
            cursor = cursor.max(range.end);
            if cursor >= window.end {
                break;
            }
        }
        if cursor < window.end {
            gaps.push(ByteRange::new(cursor, window.end));
        }
        gaps
    }

    /// Cached sub-ranges of `window`, ascending.
    pub fn intersections(&self, window: ByteRange) -> Vec<ByteRange> {
        let first = self.ranges.partition_point(|r| r.end <= window.start);
        self.ranges[first..]
            .iter()
            .take_while(|r| r.start < window.end)
            .filter_map(|r| r.intersect(&window))
            .collect()
    }

    /// Whether every byte of `range` is cached. Empty ranges are always covered.
    pub fn covers(&self, range: ByteRange) -> bool {
        if range.is_empty() {
            return true;
        }
        let idx = self.ranges.partition_point(|r| r.start <= range.start);
        idx > 0 && self.ranges[idx - 1].end >= range.end
    }

    /// Length of the cached run starting exactly at `offset`.
    pub fn contiguous_from(&self, offset: u64) -> u64 {
        let idx = self.ranges.partition_point(|r| r.start <= offset);
        match idx.checked_sub(1).map(|i| self.ranges[i]) {
            Some(r) if r.end > offset => r.end - offset,
            _ => 0,
        }
    }

    /// Total cached bytes.
    pub fn covered_len(&self) -> u64 {
        self.ranges.iter().map(ByteRange::len).sum()
    }

    /// Whether `[0, total)` is fully cached.
    pub fn is_complete(&self, total: u64) -> bool {
        total == 0 || self.covers(ByteRange::new(0, total))
    }

    /// End of the last cached range.
    pub fn max_end(&self) -> Option<u64> {
        self.ranges.last().map(|r| r.end)
    }

    pub fn iter(&self) -> impl Iterator<Item = &ByteRange> {
        self.ranges.iter()
    }

    pub fn as_slice(&self) -> &[ByteRange] {
        &self.ranges
    }

    pub fn len(&self) -> usize {
        self.ranges.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ranges.is_empty()
    }
}

impl TryFrom<Vec<ByteRange>> for RangeSet {
    type Error = String;

    /// Accepts only lists that already hold the set invariants.
    fn try_from(ranges: Vec<ByteRange>) -> Result<Self, Self::Error> {
        for (i, range) in ranges.iter().enumerate() {
            if range.is_empty() {
                return Err(format!("empty range {} at index {}", range, i));
            }
            if i > 0 && ranges[i - 1].end >= range.start {
                return Err(format!(
                    "range {} overlaps or touches {}",
                    range,
                    ranges[i - 1]
                ));
            }
        }
        Ok(Self { ranges })
    }
}

impl From<RangeSet> for Vec<ByteRange> {
    fn from(set: RangeSet) -> Self {
        set.ranges
    }
}
