//! `LockedRange`: an exclusive write reservation over a sub-interval of a
//! `UsedRange` (spec.md §3, §4.3). No two `LockedRange`s of one `PartData`
//! ever overlap; dropping one removes exactly its interval from `locked`.

use std::sync::Arc;

use super::{PartDataHandle, UsedRange};
use crate::{error::LockError, range::Range};

pub struct LockedRange {
    pub(super) handle: PartDataHandle,
    pub(super) range: Range,
    /// Keeps the parent `UsedRange` (and thus its chunk's use-count
    /// reservation) alive for at least as long as this lock, so callers may
    /// drop the `UsedRange` immediately after acquiring locks from it.
    #[allow(dead_code)]
    pub(super) used: Arc<UsedRange>,
}

impl LockedRange {
    pub fn range(&self) -> Range {
        self.range
    }

    pub fn is_complete(&self) -> bool {
        self.handle.is_range_complete(self.range)
    }

    /// Writes `data` at absolute offset `begin`. Both `begin` and
    /// `begin + data.len() - 1` must fall inside this lock's range.
    pub fn write(&self, begin: u64, data: Vec<u8>) -> Result<(), LockError> {
        if data.is_empty() {
            return Ok(());
        }
        let end = begin + data.len() as u64 - 1;
        if begin < self.range.begin() || end > self.range.end() {
            return Err(LockError::OutOfLock {
                begin,
                end,
                lock_begin: self.range.begin(),
                lock_end: self.range.end(),
            });
        }
        self.handle.do_write(begin, data)
    }
}

impl Drop for LockedRange {
    fn drop(&mut self) {
        self.handle.release_lock(self.range);
    }
}
