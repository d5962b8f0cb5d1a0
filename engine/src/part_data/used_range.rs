//! `UsedRange`: a soft reservation of intent to download a region
//! (spec.md §3, §4.3). Multiple `UsedRange`s may refer to the same chunk;
//! each increments that chunk's use count on construction and decrements it
//! on drop — the sole mechanism that releases the reservation, per spec.md
//! §9's "RAII lock objects" guidance.

use std::sync::Arc;

use super::{LockedRange, PartDataHandle};
use crate::range::Range;

/// Reference-counted (multiple downloaders may share one chunk) reservation
/// over a region of a [`super::PartData`].
pub struct UsedRange {
    pub(super) handle: PartDataHandle,
    pub(super) range: Range,
    /// `(chunk_size, index)` this reservation is pinned to, if any — a
    /// `UsedRange` constructed without a chunkmap (the no-bitmap
    /// `getRange(size)` path) has none.
    pub(super) chunk: Option<(u64, u64)>,
}

impl UsedRange {
    pub fn range(&self) -> Range {
        self.range
    }

    /// True iff this entire range is already complete.
    pub fn is_complete(&self) -> bool {
        self.handle.is_range_complete(self.range)
    }

    /// Acquires exclusive write access over the largest contiguous
    /// sub-interval of this `UsedRange` that is not yet complete or locked,
    /// clamped to `pref_size` bytes (spec.md §4.3).
    pub fn get_lock(self: &Arc<Self>, pref_size: u64) -> Option<LockedRange> {
        let interval = self.handle.acquire_lock(self.range, pref_size)?;
        Some(LockedRange {
            handle: self.handle.clone(),
            range: interval,
            used: Arc::clone(self),
        })
    }
}

impl Drop for UsedRange {
    fn drop(&mut self) {
        if let Some((chunk_size, index)) = self.chunk {
            self.handle.release_used_range(chunk_size, index);
        }
    }
}
