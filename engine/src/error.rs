//! Error types at the boundaries described in spec.md §7: range/lock
//! violations are programmer errors and are raised to the caller; disk and
//! hash failures never propagate past [`crate::part_data::PartData`] — they
//! become events instead.

use std::path::PathBuf;

/// Raised when a caller asks for a byte range outside what is legal to
/// request (e.g. an upload read over bytes that are not yet `complete`).
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum RangeError {
    #[error("range [{begin}, {end}] is not covered by complete data")]
    Incomplete { begin: u64, end: u64 },

    #[error("range [{begin}, {end}] exceeds file size {size}")]
    OutOfBounds { begin: u64, end: u64, size: u64 },
}

/// Raised when a write through a [`crate::part_data::LockedRange`] is
/// rejected, either because it falls outside the range the lock authorized
/// or because the `PartData` isn't in a state that accepts writes (spec.md
/// §4.4.1 write precondition, §4.4.5 "writes... are rejected in non-Running
/// states").
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum LockError {
    #[error("write [{begin}, {end}] is outside locked range [{lock_begin}, {lock_end}]")]
    OutOfLock { begin: u64, end: u64, lock_begin: u64, lock_end: u64 },

    #[error("write rejected: PartData is {state:?}, not Running")]
    NotRunning { state: crate::part_data::State },
}

/// Transient conditions the caller is expected to retry, per spec.md §7.
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum TryAgainError {
    #[error("move to destination is in progress")]
    MoveInProgress,

    #[error("disk space allocation is in progress")]
    AllocationInProgress,

    #[error("chunk is mid-verification")]
    Verifying,
}

/// Disk and I/O errors surfaced from [`crate::io_thread`] jobs. These never
/// cross the `PartData` API boundary directly; they are logged and
/// translated into state transitions (auto-pause) and events.
#[derive(thiserror::Error, Debug)]
pub enum IoError {
    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error("expected to transfer {expected} bytes, transferred {actual}")]
    ShortTransfer { expected: u64, actual: u64 },

    #[error("file not found at {0} or any alternate location")]
    FileNotFound(PathBuf),
}

/// Errors writing or reading the `.dat` sidecar file (spec.md §4.4.6, §6).
#[derive(thiserror::Error, Debug)]
pub enum SidecarError {
    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error("unknown sidecar version byte {0}")]
    UnknownVersion(u8),

    #[error("corrupt sidecar: {0}")]
    Corrupt(String),
}

/// Top-level error returned by [`crate::files_list::FilesList`] operations.
#[derive(thiserror::Error, Debug)]
pub enum EngineError {
    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Sidecar(#[from] SidecarError),

    #[error(transparent)]
    Range(#[from] RangeError),

    #[error(transparent)]
    Lock(#[from] LockError),

    #[error(transparent)]
    TryAgain(#[from] TryAgainError),

    #[error("download with temp location {0:?} already exists")]
    DuplicateDownload(PathBuf),
}
