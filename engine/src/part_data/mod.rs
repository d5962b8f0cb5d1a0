//! `PartData`: the state machine behind one in-progress download (spec.md
//! §3, §4.3, §4.4). Grounded on `examples/original_source/hncore/partdata.h`
//! for the member layout and event sequence, and on the teacher's disk task
//! (`bittorrent/src/fs/mod.rs`) for how a single mutable resource is shared
//! across async callers: one `std::sync::Mutex`-guarded struct behind a
//! cheap-to-clone handle, so the RAII guards in [`used_range`]/[`locked_range`]
//! can release their reservations synchronously from `Drop`, which an async
//! mutex cannot support.

pub mod locked_range;
pub mod sidecar;
pub mod used_range;

pub use locked_range::LockedRange;
pub use used_range::UsedRange;

use std::{
    collections::{HashMap, HashSet},
    fs::OpenOptions,
    io::{Seek, SeekFrom, Write as _},
    path::{Path, PathBuf},
    sync::{Arc, Mutex, MutexGuard},
};

use tokio::sync::broadcast;

use crate::{
    chunk::{ChunkMap, Digest},
    config::Config,
    error::RangeError,
    events::{self, HashEvent, PartDataEvent},
    hash::{FileSpan, HashOutcome, HashWork},
    io_thread::{IoThreadHandle, Job},
    range::{Range, RangeList},
};

/// Background preallocation job (spec.md §4.4.2): extends the temp file to
/// its full size on the `IoThread` rather than blocking the caller of
/// [`PartDataHandle::new`] on a potentially large `set_len`.
struct AllocJob {
    path: PathBuf,
    size: u64,
}

impl Job for AllocJob {
    type Output = std::io::Result<()>;

    fn process(self) -> Self::Output {
        let file = OpenOptions::new().write(true).open(&self.path)?;
        file.set_len(self.size)
    }
}

/// Download lifecycle state (spec.md §4.4.5; `DownloadState` in
/// `partdata.h`, plus the distinct "auto-paused on disk error" state spec.md
/// §7 asks for).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum State {
    Running,
    Paused,
    Stopped,
    AutoPaused,
}

/// Shared, lockable state behind a [`PartDataHandle`].
pub struct PartData {
    temp_path: PathBuf,
    destination: Option<PathBuf>,
    size: u64,

    complete: RangeList,
    locked: RangeList,
    verified: RangeList,
    corrupt: RangeList,
    dont_download: RangeList,

    chunk_maps: HashMap<u64, ChunkMap>,
    pending_hash_checks: HashSet<(u64, u64)>,
    /// Invalidate handles for hash jobs submitted but not yet resolved,
    /// so `cancel` can abort them (spec.md §5 "Cancellation & timeouts").
    outstanding_hash_jobs: Vec<crate::io_thread::Invalidate>,

    source_cnt: u32,
    full_source_cnt: u32,

    state: State,
    dl_finished: bool,

    bytes_since_flush: u64,
    flush_threshold_bytes: u64,

    events: broadcast::Sender<PartDataEvent>,
    /// Per-chunk hash verdicts, carrying the full range and digest (spec.md
    /// §4.7) — a finer-grained companion to `PartDataEvent::Verified`/
    /// `Corruption`, which only carry `(chunk_size, index)`.
    hash_events: broadcast::Sender<HashEvent>,
    io: IoThreadHandle,
}

/// Cheap-to-clone handle over one [`PartData`]. All public mutation and
/// queries go through here; `PartData` itself has no public constructor.
#[derive(Clone)]
pub struct PartDataHandle(Arc<Mutex<PartData>>);

impl PartDataHandle {
    /// Creates a brand-new, empty download of `size` bytes backed by a file
    /// at `temp_path`. If `config.preallocate`, the file is extended to its
    /// full size via a background [`AllocJob`] rather than blocking this
    /// call (spec.md §4.4.2).
    pub fn new(config: &Config, temp_path: PathBuf, size: u64, io: IoThreadHandle) -> std::io::Result<Self> {
        OpenOptions::new().create(true).truncate(false).write(true).open(&temp_path)?;
        let (events, _rx) = events::event_bus();
        let (hash_events, _rx) = events::event_bus();
        let inner = PartData {
            temp_path,
            destination: None,
            size,
            complete: RangeList::new(),
            locked: RangeList::new(),
            verified: RangeList::new(),
            corrupt: RangeList::new(),
            dont_download: RangeList::new(),
            chunk_maps: HashMap::new(),
            pending_hash_checks: HashSet::new(),
            outstanding_hash_jobs: Vec::new(),
            source_cnt: 0,
            full_source_cnt: 0,
            state: State::Running,
            dl_finished: false,
            bytes_since_flush: 0,
            flush_threshold_bytes: config.flush_threshold_bytes,
            events,
            hash_events,
            io,
        };
        let handle = PartDataHandle(Arc::new(Mutex::new(inner)));
        events::publish(&handle.lock().events, PartDataEvent::Added);
        if config.preallocate {
            handle.dispatch_preallocate(size);
        }
        Ok(handle)
    }

    /// Submits an [`AllocJob`] and auto-pauses on failure, the same pattern
    /// [`PartDataHandle::do_write`] uses for a failed disk write.
    fn dispatch_preallocate(&self, size: u64) {
        let (path, io) = {
            let inner = self.lock();
            (inner.temp_path.clone(), inner.io.clone())
        };
        let (rx, _invalidate) = io.post_work(AllocJob { path, size });
        let handle = self.clone();
        tokio::spawn(async move {
            match rx.await {
                Ok(Err(e)) => {
                    tracing::error!("preallocation failed: {e}, auto-pausing");
                    handle.lock().state = State::AutoPaused;
                }
                Ok(Ok(())) => {}
                Err(_) => tracing::warn!("preallocation job dropped before completing"),
            }
        });
    }

    /// Reconstructs a `PartData` from its `.dat` sidecar (spec.md §4.4.6).
    /// If the file's on-disk mtime doesn't match what the sidecar expects,
    /// the caller should follow up with [`PartDataHandle::rehash_completed`];
    /// that decision lives in `files_list`, which knows the mtime policy.
    pub fn load(
        config: &Config,
        temp_path: PathBuf,
        size: u64,
        io: IoThreadHandle,
        sidecar_path: &Path,
    ) -> Result<Self, crate::error::SidecarError> {
        let saved = sidecar::load_with_fallback(sidecar_path)?;
        let (events, _rx) = events::event_bus();
        let (hash_events, _rx) = events::event_bus();
        let mut chunk_maps = HashMap::new();
        for (chunk_size, digests) in &saved.hash_sets {
            let map = chunk_maps
                .entry(*chunk_size)
                .or_insert_with(|| ChunkMap::new(*chunk_size, size));
            for (index, digest) in digests.iter().enumerate() {
                map.set_reference_hash(index as u64, *digest);
            }
        }
        let state = match saved.state {
            Some(sidecar::SavedState::Paused) => State::Paused,
            Some(sidecar::SavedState::Stopped) => State::Stopped,
            _ => State::Running,
        };
        let mut downloaded = saved.complete.clone();
        for r in saved.verified.iter() {
            downloaded.insert(*r);
        }
        for (chunk_size, map) in &mut chunk_maps {
            map.refresh(&downloaded, Range::new(0, size.saturating_sub(1)));
            let _ = chunk_size;
        }
        let inner = PartData {
            temp_path,
            destination: saved.destination,
            size,
            complete: saved.complete,
            locked: RangeList::new(),
            verified: saved.verified,
            corrupt: RangeList::new(),
            dont_download: RangeList::new(),
            chunk_maps,
            pending_hash_checks: HashSet::new(),
            outstanding_hash_jobs: Vec::new(),
            source_cnt: 0,
            full_source_cnt: 0,
            state,
            dl_finished: false,
            bytes_since_flush: 0,
            flush_threshold_bytes: config.flush_threshold_bytes,
            events,
            hash_events,
            io,
        };
        Ok(PartDataHandle(Arc::new(Mutex::new(inner))))
    }

    fn lock(&self) -> MutexGuard<'_, PartData> {
        self.0.lock().unwrap()
    }

    // ---- registration -----------------------------------------------

    /// Registers a per-chunk-size hash set (spec.md §4.4.3). Creates the
    /// `ChunkMap` for `chunk_size` if this is the first call for it.
    pub fn add_hash_set(&self, chunk_size: u64, digests: &[Digest]) {
        let mut inner = self.lock();
        let size = inner.size;
        let complete = inner.downloaded_ranges();
        let map = inner
            .chunk_maps
            .entry(chunk_size)
            .or_insert_with(|| ChunkMap::new(chunk_size, size));
        for (index, digest) in digests.iter().enumerate() {
            map.set_reference_hash(index as u64, *digest);
        }
        map.refresh(&complete, Range::new(0, size.saturating_sub(1)));
    }

    pub fn add_source_mask(&self, chunk_size: u64, bitmap: &[bool]) {
        let mut inner = self.lock();
        let size = inner.size;
        inner
            .chunk_maps
            .entry(chunk_size)
            .or_insert_with(|| ChunkMap::new(chunk_size, size))
            .apply_source_mask(bitmap, 1);
        inner.source_cnt += 1;
    }

    pub fn del_source_mask(&self, chunk_size: u64, bitmap: &[bool]) {
        let mut inner = self.lock();
        if let Some(map) = inner.chunk_maps.get_mut(&chunk_size) {
            map.apply_source_mask(bitmap, -1);
        }
        inner.source_cnt = inner.source_cnt.saturating_sub(1);
    }

    /// A full source has every chunk regardless of chunk size, so the delta
    /// applies to every registered `ChunkMap` (spec.md §4.4.4).
    pub fn add_full_source(&self) {
        let mut inner = self.lock();
        inner.full_source_cnt += 1;
        for map in inner.chunk_maps.values_mut() {
            map.apply_full_source(1);
        }
    }

    pub fn del_full_source(&self) {
        let mut inner = self.lock();
        inner.full_source_cnt = inner.full_source_cnt.saturating_sub(1);
        for map in inner.chunk_maps.values_mut() {
            map.apply_full_source(-1);
        }
    }

    pub fn source_cnt(&self) -> u32 {
        self.lock().source_cnt
    }

    pub fn full_source_cnt(&self) -> u32 {
        self.lock().full_source_cnt
    }

    // ---- ranges --------------------------------------------------------

    pub fn size(&self) -> u64 {
        self.lock().size
    }

    pub fn downloaded(&self) -> u64 {
        self.lock().downloaded_ranges().total_length()
    }

    pub fn is_complete(&self) -> bool {
        let inner = self.lock();
        inner.size > 0 && inner.downloaded_ranges().contains_full(&Range::new(0, inner.size - 1))
    }

    pub fn state(&self) -> State {
        self.lock().state
    }

    /// Reserves `range` without pinning it to a particular chunk map (the
    /// `getRange(Range)` path in `partdata.h`, used by plain HTTP-style
    /// sequential downloads).
    pub fn get_range(&self, range: Range) -> Result<Arc<UsedRange>, RangeError> {
        let inner = self.lock();
        if range.end() >= inner.size {
            return Err(RangeError::OutOfBounds { begin: range.begin(), end: range.end(), size: inner.size });
        }
        drop(inner);
        Ok(Arc::new(UsedRange { handle: self.clone(), range, chunk: None }))
    }

    /// Picks and reserves the next chunk to download for a peer advertising
    /// `bitmap` under `chunk_size` (spec.md §4.2 `pickChunk`). Returns `None`
    /// if the peer has nothing we want, or while paused/stopped.
    pub fn get_range_for_chunk(&self, chunk_size: u64, bitmap: &[bool], avoid_used: bool) -> Option<Arc<UsedRange>> {
        let mut inner = self.lock();
        if !matches!(inner.state, State::Running) {
            return None;
        }
        let index = {
            let map = inner.chunk_maps.get(&chunk_size)?;
            map.pick_chunk(bitmap, avoid_used)?
        };
        let map = inner.chunk_maps.get_mut(&chunk_size).unwrap();
        let range = map.chunk_range(index);
        map.inc_use_count(index);
        drop(inner);
        Some(Arc::new(UsedRange { handle: self.clone(), range, chunk: Some((chunk_size, index)) }))
    }

    pub(super) fn is_range_complete(&self, range: Range) -> bool {
        self.lock().downloaded_ranges().contains_full(&range)
    }

    /// True iff `range` is entirely within `complete` ∪ `verified` — the
    /// public check [`crate::shared_file::SharedFile::read`] uses to reject
    /// a read over bytes that haven't arrived yet (spec.md §4.6, §7
    /// `InvalidRange`).
    pub fn is_complete_range(&self, range: Range) -> bool {
        self.is_range_complete(range)
    }

    pub(super) fn release_used_range(&self, chunk_size: u64, index: u64) {
        let mut inner = self.lock();
        if let Some(map) = inner.chunk_maps.get_mut(&chunk_size) {
            map.dec_use_count(index);
        }
    }

    /// Largest contiguous sub-interval of `range` that is not already
    /// downloaded, locked, or excluded via `dont_download`, clamped to
    /// `pref_size` bytes (spec.md §4.3 `getLock`).
    pub(super) fn acquire_lock(&self, range: Range, pref_size: u64) -> Option<Range> {
        let mut inner = self.lock();
        let mut taken = inner.downloaded_ranges();
        for r in inner.locked.iter() {
            taken.insert(*r);
        }
        for r in inner.dont_download.iter() {
            taken.insert(*r);
        }
        let gap = taken.uncovered_within(range).into_iter().next()?;
        let len = gap.length().min(pref_size.max(1));
        let result = Range::new(gap.begin(), gap.begin() + len - 1);
        inner.locked.insert(result);
        Some(result)
    }

    pub(super) fn release_lock(&self, range: Range) {
        self.lock().locked.erase(range);
    }

    /// Applies a write authorized by a live [`LockedRange`]: persists it to
    /// the temp file, marks it `complete`, and — once a write completes a
    /// chunk that has a reference hash — kicks off a background verification
    /// (spec.md §4.4.2, §4.7).
    pub(super) fn do_write(&self, begin: u64, data: Vec<u8>) -> Result<(), crate::error::LockError> {
        let len = data.len() as u64;
        if len == 0 {
            return Ok(());
        }
        let range = Range::new(begin, begin + len - 1);

        {
            let mut inner = self.lock();
            if !matches!(inner.state, State::Running) {
                return Err(crate::error::LockError::NotRunning { state: inner.state });
            }
            if let Err(e) = inner.write_to_disk(begin, &data) {
                tracing::error!("write at {begin} failed: {e}, auto-pausing");
                inner.state = State::AutoPaused;
                return Ok(());
            }
            inner.complete.insert(range);
            let downloaded = inner.downloaded_ranges();
            for map in inner.chunk_maps.values_mut() {
                map.refresh(&downloaded, range);
            }
            events::publish(&inner.events, PartDataEvent::DataAdded { begin, len: len as u32 });

            inner.bytes_since_flush += len;
            if inner.bytes_since_flush >= inner.flush_threshold_bytes {
                inner.bytes_since_flush = 0;
                events::publish(&inner.events, PartDataEvent::DataFlushed);
            }
        }

        self.dispatch_completed_chunk_checks(range);
        self.maybe_finish_download();
        Ok(())
    }

    fn dispatch_completed_chunk_checks(&self, range: Range) {
        let jobs: Vec<(u64, u64, HashWork)> = {
            let mut inner = self.lock();
            let temp_path = inner.temp_path.clone();
            let verified = inner.verified.clone();
            let mut out = Vec::new();
            for (&chunk_size, map) in &inner.chunk_maps {
                let first = range.begin() / chunk_size;
                let last = (range.end() / chunk_size).min(map.chunk_count().saturating_sub(1));
                for index in first..=last {
                    if !map.is_completed(index) {
                        continue;
                    }
                    let chunk_range = map.chunk_range(index);
                    if verified.contains_full(&chunk_range) {
                        continue;
                    }
                    let Some(reference) = map.reference_hash(index) else { continue };
                    out.push((chunk_size, index, chunk_range, reference));
                }
            }
            out.retain(|(chunk_size, index, ..)| inner.pending_hash_checks.insert((*chunk_size, *index)));
            out.into_iter()
                .map(|(chunk_size, index, chunk_range, reference)| {
                    let span = FileSpan { path: temp_path.clone(), begin: chunk_range.begin(), end: chunk_range.end() };
                    (chunk_size, index, HashWork::new(vec![span], Some(reference)))
                })
                .collect()
        };

        for (chunk_size, index, work) in jobs {
            let handle = self.clone();
            let io = self.lock().io.clone();
            events::publish(&self.lock().events, PartDataEvent::Verifying { chunk_size, index });
            let (rx, invalidate) = io.post_work(work);
            self.lock().outstanding_hash_jobs.push(invalidate.clone());
            tokio::spawn(async move {
                if let Ok((outcome, digest)) = rx.await {
                    handle.apply_hash_outcome(chunk_size, index, outcome, digest, &invalidate);
                }
            });
        }
    }

    fn apply_hash_outcome(
        &self,
        chunk_size: u64,
        index: u64,
        outcome: HashOutcome,
        digest: Option<Digest>,
        invalidate: &crate::io_thread::Invalidate,
    ) {
        let mut inner = self.lock();
        inner.pending_hash_checks.remove(&(chunk_size, index));
        inner.outstanding_hash_jobs.retain(|i| !i.is_same_job(invalidate));
        let Some(map) = inner.chunk_maps.get(&chunk_size) else { return };
        let chunk_range = map.chunk_range(index);

        match outcome {
            HashOutcome::Verified => {
                inner.complete.erase(chunk_range);
                inner.verified.insert(chunk_range);
                events::publish(&inner.events, PartDataEvent::Verified { chunk_size, index });
                if let Some(digest) = digest {
                    events::publish(&inner.hash_events, HashEvent::Verified { range: chunk_range, digest });
                }
            }
            HashOutcome::Failed => {
                inner.complete.erase(chunk_range);
                inner.corrupt.insert(chunk_range);
                let downloaded = inner.downloaded_ranges();
                if let Some(map) = inner.chunk_maps.get_mut(&chunk_size) {
                    map.refresh(&downloaded, chunk_range);
                }
                events::publish(&inner.events, PartDataEvent::Corruption { range: chunk_range });
                events::publish(&inner.hash_events, HashEvent::Failed { range: chunk_range });
            }
            HashOutcome::FatalError(reason) => {
                tracing::error!("hash check for chunk {index} (size {chunk_size}) failed fatally: {reason}");
                events::publish(&inner.hash_events, HashEvent::FatalError { range: chunk_range, reason });
                inner.state = State::AutoPaused;
            }
        }
        drop(inner);
        self.maybe_finish_download();
    }

    fn maybe_finish_download(&self) {
        let mut inner = self.lock();
        if inner.dl_finished || inner.size == 0 {
            return;
        }
        if !inner.downloaded_ranges().contains_full(&Range::new(0, inner.size - 1)) {
            return;
        }
        let fully_verified = inner
            .chunk_maps
            .values()
            .all(|map| !map.has_hash_set() || (0..map.chunk_count()).all(|i| inner.verified.contains_full(&map.chunk_range(i))));
        if !fully_verified {
            return;
        }
        inner.dl_finished = true;
        events::publish(&inner.events, PartDataEvent::DlFinished);
        events::publish(&inner.events, PartDataEvent::Complete);
    }

    // ---- selective download & manual overrides ------------------------

    /// Marks `range` as data the caller trusts without hashing (e.g.
    /// importing an existing file): it goes straight into `verified`,
    /// skipping `complete` entirely, so the pairwise-disjoint invariant
    /// (spec.md §8 Testable Property 1) never sees it in both sets.
    pub fn set_complete(&self, range: Range) {
        let mut inner = self.lock();
        inner.verified.insert(range);
        let downloaded = inner.downloaded_ranges();
        for map in inner.chunk_maps.values_mut() {
            map.refresh(&downloaded, range);
        }
        drop(inner);
        self.maybe_finish_download();
    }

    /// Excludes `range` from future locking (selective download within a
    /// multi-file container, spec.md §4.5).
    pub fn dont_download(&self, range: Range) {
        self.lock().dont_download.insert(range);
    }

    pub fn do_download(&self, range: Range) {
        self.lock().dont_download.erase(range);
    }

    /// Drops the `verified` cache and re-checks every already-`complete`
    /// chunk that carries a reference hash. Used when a sidecar's mtime
    /// expectation doesn't match the file on disk (spec.md §4.4.6).
    pub fn rehash_completed(&self) {
        let whole = {
            let mut inner = self.lock();
            inner.verified = RangeList::new();
            inner.dl_finished = false;
            if inner.size == 0 { None } else { Some(Range::new(0, inner.size - 1)) }
        };
        if let Some(range) = whole {
            self.dispatch_completed_chunk_checks(range);
        }
    }

    // ---- lifecycle ------------------------------------------------------

    pub fn pause(&self) {
        let mut inner = self.lock();
        inner.state = State::Paused;
        events::publish(&inner.events, PartDataEvent::Paused);
    }

    pub fn resume(&self) {
        let mut inner = self.lock();
        inner.state = State::Running;
        events::publish(&inner.events, PartDataEvent::Resumed);
    }

    pub fn stop(&self) {
        let mut inner = self.lock();
        inner.state = State::Stopped;
        events::publish(&inner.events, PartDataEvent::Stopped);
    }

    /// Aborts pending hash jobs (spec.md §5 "Cancellation & timeouts": `cancel`
    /// aborts pending HashWorks tied to this PartData) before removing the
    /// temp file, so a verification result can't race the file's deletion.
    pub fn cancel(&self) {
        let mut inner = self.lock();
        for invalidate in inner.outstanding_hash_jobs.drain(..) {
            invalidate.invalidate();
        }
        events::publish(&inner.events, PartDataEvent::Canceled);
        let path = inner.temp_path.clone();
        drop(inner);
        if let Err(e) = std::fs::remove_file(&path) {
            tracing::warn!("failed to remove temp file {path:?} on cancel: {e}");
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<PartDataEvent> {
        self.lock().events.subscribe()
    }

    /// Subscribes to per-chunk hash verdicts, carrying the full range and
    /// digest rather than just `(chunk_size, index)` (spec.md §4.7).
    pub fn subscribe_hash(&self) -> broadcast::Receiver<HashEvent> {
        self.lock().hash_events.subscribe()
    }

    pub fn set_destination(&self, destination: PathBuf) {
        self.lock().destination = Some(destination);
    }

    pub fn destination(&self) -> Option<PathBuf> {
        self.lock().destination.clone()
    }

    pub fn temp_path(&self) -> PathBuf {
        self.lock().temp_path.clone()
    }

    /// Persists state to `sidecar_path` (spec.md §4.4.6, §6): backs up the
    /// existing sidecar first, then writes the new one atomically.
    pub fn save(&self, sidecar_path: &Path) -> Result<(), crate::error::SidecarError> {
        let inner = self.lock();
        let hash_sets = inner
            .chunk_maps
            .iter()
            .map(|(&chunk_size, map)| {
                let digests = (0..map.chunk_count())
                    .map(|i| map.reference_hash(i).unwrap_or([0u8; 20]))
                    .collect();
                (chunk_size, digests)
            })
            .collect();
        let state = match inner.state {
            State::Running | State::AutoPaused => sidecar::SavedState::Running,
            State::Paused => sidecar::SavedState::Paused,
            State::Stopped => sidecar::SavedState::Stopped,
        };
        let doc = sidecar::Sidecar {
            downloaded: inner.downloaded_ranges().total_length(),
            destination: inner.destination.clone(),
            complete: inner.complete.clone(),
            verified: inner.verified.clone(),
            hash_sets,
            state: Some(state),
        };
        drop(inner);
        sidecar::backup(sidecar_path)?;
        sidecar::save(sidecar_path, &doc)
    }
}

impl PartData {
    fn write_to_disk(&self, begin: u64, data: &[u8]) -> std::io::Result<()> {
        let mut file = OpenOptions::new().write(true).open(&self.temp_path)?;
        file.seek(SeekFrom::Start(begin))?;
        file.write_all(data)
    }

    /// Bytes that have actually landed on disk, whether or not they've been
    /// hashed yet — `complete` and `verified` are disjoint (spec.md §8
    /// Testable Property 1: a chunk's interval *moves* from `complete` into
    /// `verified`, it isn't copied), so downloaded progress and "is this
    /// file finished" both need their union, not `complete` alone.
    fn downloaded_ranges(&self) -> RangeList {
        let mut downloaded = self.complete.clone();
        for r in self.verified.iter() {
            downloaded.insert(*r);
        }
        downloaded
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::io_thread;

    fn handle(dir: &tempfile::TempDir, size: u64) -> PartDataHandle {
        let (_io_task, io) = io_thread::spawn();
        let config = Config::default();
        PartDataHandle::new(&config, dir.path().join("file.part"), size, io).unwrap()
    }

    #[tokio::test]
    async fn write_through_lock_marks_range_complete() {
        let dir = tempfile::tempdir().unwrap();
        let pd = handle(&dir, 100);
        let used = pd.get_range(Range::new(0, 49)).unwrap();
        let lock = used.get_lock(50).unwrap();
        lock.write(0, vec![b'A'; 50]).unwrap();
        assert!(pd.is_complete_range(Range::new(0, 49)));
    }

    #[tokio::test]
    async fn completed_chunk_with_hash_set_gets_verified() {
        let dir = tempfile::tempdir().unwrap();
        let pd = handle(&dir, 20);
        let data = vec![b'Z'; 20];
        let mut hasher = sha1::Sha1::new();
        use sha1::Digest as _;
        hasher.update(&data);
        let digest: Digest = hasher.finalize().into();
        pd.add_hash_set(20, &[digest]);

        let used = pd.get_range(Range::new(0, 19)).unwrap();
        let lock = used.get_lock(20).unwrap();
        lock.write(0, data).unwrap();
        drop(lock);
        drop(used);

        for _ in 0..20 {
            if pd.is_complete() {
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        }
        assert!(pd.is_complete());
    }

    #[tokio::test]
    async fn chunk_picking_reserves_and_releases_use_count() {
        let dir = tempfile::tempdir().unwrap();
        let pd = handle(&dir, 2048);
        pd.add_hash_set(1024, &[[0u8; 20], [0u8; 20]]);
        pd.add_full_source();
        let bitmap = [true, true];
        let used = pd.get_range_for_chunk(1024, &bitmap, false).unwrap();
        // Both chunks are equally eligible, so which one gets picked is a tie-break
        // decision (spec.md §8 Open Question); only the shape of the pick matters here.
        assert!(used.range() == Range::new(0, 1023) || used.range() == Range::new(1024, 2047));
        drop(used);
        // Use count released; picking again should still find a candidate.
        assert!(pd.get_range_for_chunk(1024, &bitmap, false).is_some());
    }

    #[tokio::test]
    async fn save_and_load_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let pd = handle(&dir, 100);
        let used = pd.get_range(Range::new(0, 49)).unwrap();
        let lock = used.get_lock(50).unwrap();
        lock.write(0, vec![b'B'; 50]).unwrap();
        drop(lock);
        drop(used);

        let sidecar_path = dir.path().join("file.part.dat");
        pd.save(&sidecar_path).unwrap();

        let (_io_task, io) = io_thread::spawn();
        let config = Config::default();
        let reloaded = PartDataHandle::load(&config, dir.path().join("file.part"), 100, io, &sidecar_path).unwrap();
        assert_eq!(reloaded.downloaded(), 50);
    }

    #[tokio::test]
    async fn verified_chunk_moves_out_of_complete() {
        let dir = tempfile::tempdir().unwrap();
        let pd = handle(&dir, 20);
        let data = vec![b'Z'; 20];
        let mut hasher = sha1::Sha1::new();
        use sha1::Digest as _;
        hasher.update(&data);
        let digest: Digest = hasher.finalize().into();
        pd.add_hash_set(20, &[digest]);

        let used = pd.get_range(Range::new(0, 19)).unwrap();
        let lock = used.get_lock(20).unwrap();
        lock.write(0, data).unwrap();
        drop(lock);
        drop(used);

        let whole = Range::new(0, 19);
        for _ in 0..20 {
            if pd.lock().verified.contains_full(&whole) {
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        }

        let inner = pd.lock();
        assert!(inner.verified.contains_full(&whole), "verified chunk should land in `verified`");
        assert!(!inner.complete.contains(&whole), "a verified chunk must not remain in `complete` too");
    }

    #[tokio::test]
    async fn write_rejected_when_not_running() {
        let dir = tempfile::tempdir().unwrap();
        let pd = handle(&dir, 100);
        let used = pd.get_range(Range::new(0, 49)).unwrap();
        let lock = used.get_lock(50).unwrap();
        pd.pause();
        let err = lock.write(0, vec![b'A'; 50]).unwrap_err();
        assert!(matches!(err, crate::error::LockError::NotRunning { state: State::Paused }));
    }

    #[tokio::test]
    async fn cancel_invalidates_outstanding_hash_job() {
        let dir = tempfile::tempdir().unwrap();
        let (_io_task, io) = io_thread::spawn();
        let config = Config::default();
        let pd = PartDataHandle::new(&config, dir.path().join("file.part"), 20, io.clone()).unwrap();
        pd.add_hash_set(20, &[[0u8; 20]]);

        // Pause the worker so the hash job dispatched by the write below is
        // still queued (not yet running) when `cancel` invalidates it.
        let pauser = io.pause().await;
        let used = pd.get_range(Range::new(0, 19)).unwrap();
        let lock = used.get_lock(20).unwrap();
        lock.write(0, vec![b'Q'; 20]).unwrap();
        drop(lock);
        drop(used);
        assert!(!pd.lock().outstanding_hash_jobs.is_empty(), "write should have dispatched a hash job");

        pd.cancel();
        assert!(pd.lock().outstanding_hash_jobs.is_empty(), "cancel should invalidate and drop every outstanding hash job");
        drop(pauser);

        // Give the (invalidated) job a chance to run; since it observes the
        // invalidation flag it must skip over rather than calling back into
        // `apply_hash_outcome` on a handle whose temp file is already gone.
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        assert_eq!(pd.state(), State::Running, "an invalidated job must never reach apply_hash_outcome");
    }
}
