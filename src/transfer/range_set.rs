//! Completed-range bookkeeping for resumable transfers.
//!
//! A [`RangeSet`] is the persisted source of truth for which byte ranges of
//! a transfer have completed. It stores sorted, merged, half-open intervals
//! so the on-disk representation stays small no matter how many chunks a
//! transfer has, and so resumption can enumerate the remaining gaps in
//! ascending offset order.

use serde::{Deserialize, Serialize};

/// A half-open byte range `[start, end)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ByteRange {
    /// Inclusive start offset.
    pub start: u64,
    /// Exclusive end offset.
    pub end: u64,
}

impl ByteRange {
    /// Creates a range. `start` must not exceed `end`; a zero-length range
    /// (`start == end`) is valid and used for empty objects.
    #[must_use]
    pub fn new(start: u64, end: u64) -> Self {
        debug_assert!(start <= end, "range start {start} exceeds end {end}");
        Self { start, end }
    }

    /// Length of the range in bytes.
    #[must_use]
    pub fn len(&self) -> u64 {
        self.end - self.start
    }

    /// Returns true for zero-length ranges.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.start == self.end
    }
}

/// Ordered set of completed byte ranges.
///
/// Invariant: ranges are sorted by start offset, non-overlapping, and
/// non-adjacent (adjacent inserts are merged). Zero-length ranges are
/// never stored.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RangeSet {
    ranges: Vec<ByteRange>,
}

impl RangeSet {
    /// Creates an empty set.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns true if no ranges have completed.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.ranges.is_empty()
    }

    /// Total number of bytes covered.
    #[must_use]
    pub fn total_len(&self) -> u64 {
        self.ranges.iter().map(ByteRange::len).sum()
    }

    /// The stored intervals, sorted ascending.
    #[must_use]
    pub fn ranges(&self) -> &[ByteRange] {
        &self.ranges
    }

    /// Inserts a range, merging with overlapping or adjacent entries.
    ///
    /// Zero-length ranges are ignored; completion of an empty object is
    /// tracked by transfer state, not by the range set.
    pub fn insert(&mut self, range: ByteRange) {
        if range.is_empty() {
            return;
        }

        // Find the insertion window: every stored range that overlaps or
        // touches the new one gets folded into it.
        let mut merged = range;
        let mut out = Vec::with_capacity(self.ranges.len() + 1);
        let mut placed = false;

        for existing in &self.ranges {
            if existing.end < merged.start {
                out.push(*existing);
            } else if existing.start > merged.end {
                if !placed {
                    out.push(merged);
                    placed = true;
                }
                out.push(*existing);
            } else {
                merged.start = merged.start.min(existing.start);
                merged.end = merged.end.max(existing.end);
            }
        }
        if !placed {
            out.push(merged);
        }

        self.ranges = out;
    }

    /// Returns true if `range` is fully covered by completed ranges.
    /// Zero-length ranges are trivially covered.
    #[must_use]
    pub fn covers(&self, range: &ByteRange) -> bool {
        if range.is_empty() {
            return true;
        }
        self.ranges
            .iter()
            .any(|r| r.start <= range.start && r.end >= range.end)
    }

    /// Enumerates the uncovered gaps within `within`, ascending.
    #[must_use]
    pub fn gaps(&self, within: &ByteRange) -> Vec<ByteRange> {
        let mut gaps = Vec::new();
        let mut cursor = within.start;

        for r in &self.ranges {
            if r.end <= cursor {
                continue;
            }
            if r.start >= within.end {
                break;
            }
            if r.start > cursor {
                gaps.push(ByteRange::new(cursor, r.start.min(within.end)));
            }
            cursor = cursor.max(r.end);
            if cursor >= within.end {
                return gaps;
            }
        }

        if cursor < within.end {
            gaps.push(ByteRange::new(cursor, within.end));
        }
        gaps
    }

    /// Serializes to the JSON column representation.
    ///
    /// # Errors
    ///
    /// Returns `serde_json::Error` if serialization fails (not expected for
    /// this type; surfaced rather than swallowed).
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    /// Parses the JSON column representation.
    ///
    /// # Errors
    ///
    /// Returns `serde_json::Error` for malformed JSON; the store treats this
    /// as a corrupt record and restarts the transfer from zero.
    pub fn from_json(json: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(json)
    }
}
