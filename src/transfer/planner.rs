//! Chunk planning: splitting a blob or file into ordered byte ranges.
//!
//! The planner is pure and lazy. Given a total length and a chunk size it
//! yields half-open ranges in ascending offset order; given the persisted
//! completed-range set it yields only the ranges still to transfer, which is
//! what makes transfers restartable without re-sending finished work.

use crate::error::TransferError;
use crate::transfer::range_set::{ByteRange, RangeSet};

/// Default chunk size: 4 MiB.
pub const DEFAULT_CHUNK_SIZE: u64 = 4 * 1024 * 1024;

/// Largest chunk the remote service accepts in a single request: 100 MiB.
pub const MAX_CHUNK_SIZE: u64 = 100 * 1024 * 1024;

/// Validates a chunk size against the service bounds.
///
/// # Errors
///
/// Returns [`TransferError::Validation`] for a zero chunk size or one above
/// [`MAX_CHUNK_SIZE`]. Surfaced before any network I/O.
pub fn validate_chunk_size(chunk_size: u64) -> Result<(), TransferError> {
    if chunk_size == 0 {
        return Err(TransferError::validation("chunk size must be non-zero"));
    }
    if chunk_size > MAX_CHUNK_SIZE {
        return Err(TransferError::validation(format!(
            "chunk size {chunk_size} exceeds service maximum {MAX_CHUNK_SIZE}"
        )));
    }
    Ok(())
}

/// Plans the full ordered chunk sequence for `[start_offset, start_offset + total_len)`.
///
/// A zero-length object yields a single zero-length range: metadata-only
/// objects still issue exactly one request. The final chunk may be shorter
/// than `chunk_size` and is never padded.
pub fn plan(
    start_offset: u64,
    total_len: u64,
    chunk_size: u64,
) -> impl Iterator<Item = ByteRange> {
    debug_assert!(chunk_size > 0, "chunk size validated upstream");
    let end = start_offset + total_len;
    let mut cursor = start_offset;
    let mut emitted_empty = false;

    std::iter::from_fn(move || {
        if total_len == 0 {
            if emitted_empty {
                return None;
            }
            emitted_empty = true;
            return Some(ByteRange::new(start_offset, start_offset));
        }
        if cursor >= end {
            return None;
        }
        let chunk_end = (cursor + chunk_size).min(end);
        let range = ByteRange::new(cursor, chunk_end);
        cursor = chunk_end;
        Some(range)
    })
}

/// Plans only the chunks not yet covered by `completed`, ascending.
///
/// Completed chunks align to plan boundaries (they were produced by this
/// planner), so coverage is checked per planned range.
pub fn remaining<'a>(
    start_offset: u64,
    total_len: u64,
    chunk_size: u64,
    completed: &'a RangeSet,
) -> impl Iterator<Item = ByteRange> + 'a {
    plan(start_offset, total_len, chunk_size).filter(move |range| !completed.covers(range))
}

/// Number of chunks the full plan contains.
#[must_use]
pub fn chunk_count(total_len: u64, chunk_size: u64) -> u64 {
    if total_len == 0 {
        1
    } else {
        total_len.div_ceil(chunk_size)
    }
}
