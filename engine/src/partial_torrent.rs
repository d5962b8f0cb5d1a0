//! `PartialTorrent`: a composite [`PartData`] over contiguous sub-files,
//! with a `CacheFile` layer for hash chunks that straddle a sub-file
//! boundary (spec.md §4.5). Grounded on `examples/original_source/hncore/bt/bittorrent.cpp`
//! (`BTPartData`) for the child-list/cache-file shape, and on the teacher's
//! `bittorrent/src/fs/torrent.rs` for "multiple files presented as one
//! contiguous byte space".
//!
//! Each child is an ordinary [`PartData`]: it still owns its own file and
//! its own `complete`/`locked` bookkeeping, so a sub-file's progress can be
//! queried on its own. What a child does *not* do is verify hash chunks —
//! the torrent's chunk size is independent of file boundaries, so
//! `PartialTorrent` keeps its own [`ChunkMap`] over the torrent-wide byte
//! space and drives every chunk's verification itself, writing bytes into
//! children via [`PartData::set_complete`] (bypassing their own hash
//! dispatch) and, for chunks that straddle a boundary, mirroring the
//! relevant slice into a `CacheFile`.

use std::{
    collections::HashMap,
    fs::OpenOptions,
    io::{Seek, SeekFrom, Write as _},
    path::PathBuf,
    sync::{Arc, Mutex, MutexGuard},
};

use tokio::sync::broadcast;

use crate::{
    chunk::{ChunkMap, Digest},
    error::RangeError,
    events::{self, HashEvent, PartDataEvent},
    hash::{FileSpan, HashOutcome, HashWork},
    io_thread::IoThreadHandle,
    part_data::PartDataHandle,
    range::{Range, RangeList},
};

/// One sub-file's placement in the torrent's global byte space.
struct InternalFile {
    offset: u64,
    length: u64,
    handle: PartDataHandle,
    excluded: bool,
}

impl InternalFile {
    fn range(&self) -> Range {
        Range::new(self.offset, self.offset + self.length - 1)
    }

    fn to_local(&self, global: Range) -> Range {
        Range::new(global.begin() - self.offset, global.end() - self.offset)
    }
}

/// A small auxiliary file holding a copy of a hash chunk that straddles a
/// sub-file boundary (spec.md §4.5, Glossary). Filename encodes the chunk
/// index and an incrementing tie-breaker so concurrent torrents sharing a
/// cache directory never collide.
struct CacheFile {
    path: PathBuf,
}

impl CacheFile {
    fn ensure(&self, len: u64) -> std::io::Result<()> {
        let file = OpenOptions::new().create(true).truncate(false).write(true).open(&self.path)?;
        if file.metadata()?.len() < len {
            file.set_len(len)?;
        }
        Ok(())
    }

    fn write_at(&self, local_begin: u64, data: &[u8]) -> std::io::Result<()> {
        self.ensure(local_begin + data.len() as u64)?;
        let mut file = OpenOptions::new().write(true).open(&self.path)?;
        file.seek(SeekFrom::Start(local_begin))?;
        file.write_all(data)
    }
}

struct BoundaryChunk {
    cache: CacheFile,
    reference: Option<Digest>,
}

struct Inner {
    files: Vec<InternalFile>,
    size: u64,
    chunk_size: u64,
    chunk_map: ChunkMap,
    complete: RangeList,
    verified: RangeList,
    corrupt: RangeList,
    dont_download: RangeList,
    boundary: HashMap<u64, BoundaryChunk>,
    dl_finished: bool,
    events: broadcast::Sender<PartDataEvent>,
    /// Per-chunk hash verdicts in torrent-global offsets (spec.md §4.7;
    /// see `HashEvent`'s doc comment on offset translation).
    hash_events: broadcast::Sender<HashEvent>,
    io: IoThreadHandle,
}

impl Inner {
    /// Bytes actually written, whether or not hashed yet — `complete` and
    /// `verified` are disjoint (spec.md §8 Testable Property 1: a chunk
    /// *moves* from `complete` into `verified`), so "is this finished" and
    /// progress both need their union, not `complete` alone.
    fn downloaded_ranges(&self) -> RangeList {
        let mut downloaded = self.complete.clone();
        for r in self.verified.iter() {
            downloaded.insert(*r);
        }
        downloaded
    }
}

/// Composite [`PartData`]-alike over `N` sub-files (spec.md §4.5).
#[derive(Clone)]
pub struct PartialTorrentHandle(Arc<Mutex<Inner>>);

impl PartialTorrentHandle {
    /// Builds a torrent view over `files` (each `(sub-file PartData,
    /// length)`, in order) with a single torrent-wide `chunk_size`. Chunks
    /// whose byte range touches more than one sub-file are registered as
    /// boundary chunks backed by a `CacheFile` under `cache_dir`.
    pub fn new(
        files: Vec<(PartDataHandle, u64)>,
        chunk_size: u64,
        cache_dir: PathBuf,
        io: IoThreadHandle,
    ) -> std::io::Result<Self> {
        std::fs::create_dir_all(&cache_dir)?;
        let mut internal = Vec::with_capacity(files.len());
        let mut offset = 0u64;
        for (handle, length) in files {
            internal.push(InternalFile { offset, length, handle, excluded: false });
            offset += length;
        }
        let size = offset;
        let chunk_map = ChunkMap::new(chunk_size, size.max(1));
        let mut boundary = HashMap::new();
        let mut tiebreak = 0u64;
        for index in 0..chunk_map.chunk_count() {
            let chunk_range = chunk_map.chunk_range(index);
            let spanning = internal.iter().filter(|f| f.range().contains(&chunk_range)).count();
            if spanning > 1 {
                let path = cache_dir.join(format!("chunk_{index:08}_{tiebreak:04}.cache"));
                tiebreak += 1;
                boundary.insert(index, BoundaryChunk { cache: CacheFile { path }, reference: None });
            }
        }
        let mut dont_download = RangeList::new();
        if size == 0 {
            dont_download.insert(Range::new(0, 0));
        }
        let (events, _rx) = events::event_bus();
        let (hash_events, _rx) = events::event_bus();
        Ok(Self(Arc::new(Mutex::new(Inner {
            files: internal,
            size,
            chunk_size,
            chunk_map,
            complete: RangeList::new(),
            verified: RangeList::new(),
            corrupt: RangeList::new(),
            dont_download,
            boundary,
            dl_finished: false,
            events,
            hash_events,
            io,
        }))))
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.0.lock().unwrap()
    }

    pub fn size(&self) -> u64 {
        self.lock().size
    }

    pub fn is_complete(&self) -> bool {
        let inner = self.lock();
        inner.size > 0 && inner.downloaded_ranges().contains_full(&Range::new(0, inner.size - 1))
    }

    pub fn subscribe(&self) -> broadcast::Receiver<PartDataEvent> {
        self.lock().events.subscribe()
    }

    /// Subscribes to per-chunk hash verdicts in torrent-global offsets
    /// (spec.md §4.7).
    pub fn subscribe_hash(&self) -> broadcast::Receiver<HashEvent> {
        self.lock().hash_events.subscribe()
    }

    /// Registers the reference hash for chunk `index` (spec.md §4.4.3
    /// analog at torrent scope).
    pub fn set_reference_hash(&self, index: u64, digest: Digest) {
        let mut inner = self.lock();
        inner.chunk_map.set_reference_hash(index, digest);
        if let Some(boundary) = inner.boundary.get_mut(&index) {
            boundary.reference = Some(digest);
        }
    }

    /// Writes `data` at global offset `begin` (spec.md §4.5 "Write"):
    /// routes bytes to every sub-file the interval overlaps, updates each
    /// child's own `complete` via [`PartData::set_complete`] (the torrent
    /// drives verification, not the child), mirrors any boundary-chunk
    /// slice into its `CacheFile`, and dispatches verification once a
    /// chunk is newly fully covered.
    pub fn write(&self, begin: u64, data: &[u8]) -> Result<(), RangeError> {
        if data.is_empty() {
            return Ok(());
        }
        let write_range = Range::new(begin, begin + data.len() as u64 - 1);
        {
            let inner = self.lock();
            if write_range.end() >= inner.size {
                return Err(RangeError::OutOfBounds { begin, end: write_range.end(), size: inner.size });
            }
            if inner.dont_download.contains(&write_range) {
                return Err(RangeError::Incomplete { begin, end: write_range.end() });
            }
        }

        let overlaps: Vec<(usize, Range)> = {
            let inner = self.lock();
            inner
                .files
                .iter()
                .enumerate()
                .filter(|(_, f)| f.range().contains(&write_range))
                .map(|(i, f)| {
                    let overlap_begin = write_range.begin().max(f.offset);
                    let overlap_end = write_range.end().min(f.offset + f.length - 1);
                    (i, Range::new(overlap_begin, overlap_end))
                })
                .collect()
        };

        for (file_idx, overlap) in &overlaps {
            let slice_begin = (overlap.begin() - write_range.begin()) as usize;
            let slice_len = overlap.length() as usize;
            let slice = &data[slice_begin..slice_begin + slice_len];
            let (handle, local_range) = {
                let inner = self.lock();
                let file = &inner.files[*file_idx];
                (file.handle.clone(), file.to_local(*overlap))
            };
            handle.write_raw(local_range.begin(), slice)?;
            handle.set_complete(local_range);
        }

        let boundary_touches: Vec<u64> = {
            let inner = self.lock();
            let first = write_range.begin() / inner.chunk_size;
            let last = write_range.end() / inner.chunk_size;
            (first..=last.min(inner.chunk_map.chunk_count().saturating_sub(1)))
                .filter(|idx| inner.boundary.contains_key(idx))
                .collect()
        };
        for index in boundary_touches {
            self.mirror_into_cache(index, write_range, data)?;
        }

        {
            let mut inner = self.lock();
            inner.complete.insert(write_range);
            let downloaded = inner.downloaded_ranges();
            inner.chunk_map.refresh(&downloaded, write_range);
            events::publish(&inner.events, PartDataEvent::DataAdded { begin, len: data.len() as u32 });
        }
        self.dispatch_verification(write_range);
        self.maybe_finish();
        Ok(())
    }

    fn mirror_into_cache(&self, index: u64, write_range: Range, data: &[u8]) -> Result<(), RangeError> {
        let inner = self.lock();
        let chunk_range = inner.chunk_map.chunk_range(index);
        let cache_path = inner.boundary[&index].cache.path.clone();
        drop(inner);

        let overlap_begin = write_range.begin().max(chunk_range.begin());
        let overlap_end = write_range.end().min(chunk_range.end());
        if overlap_begin > overlap_end {
            return Ok(());
        }
        let slice_begin = (overlap_begin - write_range.begin()) as usize;
        let slice_len = (overlap_end - overlap_begin + 1) as usize;
        let slice = &data[slice_begin..slice_begin + slice_len];
        let local_begin = overlap_begin - chunk_range.begin();
        CacheFile { path: cache_path }
            .write_at(local_begin, slice)
            .map_err(|_| RangeError::OutOfBounds { begin: overlap_begin, end: overlap_end, size: chunk_range.length() })
    }

    fn dispatch_verification(&self, touched: Range) {
        let jobs: Vec<(u64, HashWork, bool)> = {
            let inner = self.lock();
            let first = touched.begin() / inner.chunk_size;
            let last = touched.end() / inner.chunk_size;
            let mut out = Vec::new();
            for index in first..=last.min(inner.chunk_map.chunk_count().saturating_sub(1)) {
                if !inner.chunk_map.is_completed(index) {
                    continue;
                }
                let chunk_range = inner.chunk_map.chunk_range(index);
                if inner.verified.contains_full(&chunk_range) {
                    continue;
                }
                let Some(reference) = inner.chunk_map.reference_hash(index) else { continue };

                if let Some(boundary) = inner.boundary.get(&index) {
                    let all_children_exist = inner
                        .files
                        .iter()
                        .filter(|f| f.range().contains(&chunk_range))
                        .all(|f| f.handle.temp_path().exists());
                    let work = if all_children_exist {
                        let spans = inner
                            .files
                            .iter()
                            .filter(|f| f.range().contains(&chunk_range))
                            .map(|f| {
                                let local = f.to_local(Range::new(
                                    chunk_range.begin().max(f.offset),
                                    chunk_range.end().min(f.offset + f.length - 1),
                                ));
                                FileSpan { path: f.handle.temp_path(), begin: local.begin(), end: local.end() }
                            })
                            .collect();
                        HashWork::new(spans, Some(reference))
                    } else {
                        HashWork::new(
                            vec![FileSpan { path: boundary.cache.path.clone(), begin: 0, end: chunk_range.length() - 1 }],
                            Some(reference),
                        )
                    };
                    out.push((index, work, true));
                } else {
                    let file = inner.files.iter().find(|f| f.range().contains_full(&chunk_range)).unwrap();
                    let local = file.to_local(chunk_range);
                    let span = FileSpan { path: file.handle.temp_path(), begin: local.begin(), end: local.end() };
                    out.push((index, HashWork::new(vec![span], Some(reference)), false));
                }
            }
            out
        };

        for (index, work, is_boundary) in jobs {
            let this = self.clone();
            let (io, chunk_size) = {
                let inner = self.lock();
                (inner.io.clone(), inner.chunk_size)
            };
            events::publish(&self.lock().events, PartDataEvent::Verifying { chunk_size, index });
            tokio::spawn(async move {
                let (rx, _invalidate) = io.post_work(work);
                if let Ok((outcome, digest)) = rx.await {
                    this.apply_hash_outcome(index, outcome, digest);
                    if is_boundary {
                        this.rehash_cache_for_diagnostics(index);
                    }
                }
            });
        }
    }

    /// Independently re-hashes the `CacheFile` copy of a boundary chunk
    /// (spec.md §4.5 "The CacheFile is also independently re-hashed for
    /// diagnostics"). Its outcome is logged only — it never overrides the
    /// authoritative verification computed from the child files.
    fn rehash_cache_for_diagnostics(&self, index: u64) {
        let (work, reference) = {
            let inner = self.lock();
            let Some(boundary) = inner.boundary.get(&index) else { return };
            let Some(reference) = boundary.reference else { return };
            let chunk_range = inner.chunk_map.chunk_range(index);
            (
                HashWork::new(vec![FileSpan { path: boundary.cache.path.clone(), begin: 0, end: chunk_range.length() - 1 }], Some(reference)),
                reference,
            )
        };
        let io = self.lock().io.clone();
        tokio::spawn(async move {
            let (rx, _invalidate) = io.post_work(work);
            if let Ok((outcome, _)) = rx.await {
                match outcome {
                    HashOutcome::Verified => tracing::trace!("cache diagnostic for chunk {index} matches reference {reference:02x?}"),
                    HashOutcome::Failed => tracing::warn!("cache diagnostic for chunk {index} diverges from child-file verification"),
                    HashOutcome::FatalError(reason) => tracing::warn!("cache diagnostic for chunk {index} failed: {reason}"),
                }
            }
        });
    }

    fn apply_hash_outcome(&self, index: u64, outcome: HashOutcome, digest: Option<Digest>) {
        let mut inner = self.lock();
        let chunk_range = inner.chunk_map.chunk_range(index);
        match outcome {
            HashOutcome::Verified => {
                inner.complete.erase(chunk_range);
                inner.verified.insert(chunk_range);
                events::publish(&inner.events, PartDataEvent::Verified { chunk_size: inner.chunk_size, index });
                if let Some(digest) = digest {
                    events::publish(&inner.hash_events, HashEvent::Verified { range: chunk_range, digest });
                }
            }
            HashOutcome::Failed => {
                inner.complete.erase(chunk_range);
                inner.corrupt.insert(chunk_range);
                let downloaded = inner.downloaded_ranges();
                inner.chunk_map.refresh(&downloaded, chunk_range);
                events::publish(&inner.events, PartDataEvent::Corruption { range: chunk_range });
                events::publish(&inner.hash_events, HashEvent::Failed { range: chunk_range });
            }
            HashOutcome::FatalError(reason) => {
                tracing::error!("boundary chunk {index} hash check failed fatally: {reason}");
                events::publish(&inner.hash_events, HashEvent::FatalError { range: chunk_range, reason });
            }
        }
        drop(inner);
        self.maybe_finish();
    }

    fn maybe_finish(&self) {
        let mut inner = self.lock();
        if inner.dl_finished || inner.size == 0 {
            return;
        }
        if !inner.downloaded_ranges().contains_full(&Range::new(0, inner.size - 1)) {
            return;
        }
        let all_verified = (0..inner.chunk_map.chunk_count())
            .all(|i| !inner.chunk_map.has_hash_set() || inner.verified.contains_full(&inner.chunk_map.chunk_range(i)));
        if !all_verified {
            return;
        }
        let children_complete = inner.files.iter().all(|f| f.excluded || f.handle.is_complete());
        if !children_complete {
            return;
        }
        inner.dl_finished = true;
        for boundary in inner.boundary.values() {
            if let Err(e) = std::fs::remove_file(&boundary.cache.path) {
                tracing::debug!("cache file {:?} already gone: {e}", boundary.cache.path);
            }
        }
        events::publish(&inner.events, PartDataEvent::DlFinished);
        events::publish(&inner.events, PartDataEvent::Complete);
    }

    /// Reads `[begin, end]` across however many sub-files it spans, for
    /// upload (spec.md §4.5 "Read").
    pub fn read(&self, begin: u64, end: u64) -> Result<Vec<u8>, RangeError> {
        let want = Range::new(begin, end);
        let inner = self.lock();
        if !inner.downloaded_ranges().contains_full(&want) {
            return Err(RangeError::Incomplete { begin, end });
        }
        let mut out = Vec::with_capacity(want.length() as usize);
        for file in &inner.files {
            if !file.range().contains(&want) {
                continue;
            }
            let overlap_begin = want.begin().max(file.offset);
            let overlap_end = want.end().min(file.offset + file.length - 1);
            let local = file.to_local(Range::new(overlap_begin, overlap_end));
            out.push((overlap_begin, file.handle.read_raw(local.begin(), local.end())));
        }
        out.sort_by_key(|(begin, _)| *begin);
        let mut result = Vec::with_capacity(want.length() as usize);
        for (_, bytes) in out {
            let bytes = bytes.map_err(|_| RangeError::OutOfBounds { begin, end, size: inner.size })?;
            result.extend(bytes);
        }
        Ok(result)
    }

    /// Excludes sub-file `index` from downloading: its interval joins
    /// `dont_download` (spec.md §4.5 "pausing a child marks its interval
    /// dontDownload").
    pub fn pause_subfile(&self, index: usize) {
        let mut inner = self.lock();
        let range = inner.files[index].range();
        inner.files[index].excluded = true;
        inner.dont_download.insert(range);
        inner.files[index].handle.pause();
    }

    pub fn resume_subfile(&self, index: usize) {
        let mut inner = self.lock();
        let range = inner.files[index].range();
        inner.files[index].excluded = false;
        inner.dont_download.erase(range);
        inner.files[index].handle.resume();
    }

    /// Pauses every sub-file (spec.md §9 `DownloadTarget`: a torrent is
    /// paused/resumed/stopped/canceled as a whole by fanning the call out to
    /// its children, same as a single-file download pauses its one child).
    pub fn pause(&self) {
        for file in &self.lock().files {
            file.handle.pause();
        }
    }

    pub fn resume(&self) {
        for file in &self.lock().files {
            file.handle.resume();
        }
    }

    pub fn stop(&self) {
        for file in &self.lock().files {
            file.handle.stop();
        }
    }

    pub fn cancel(&self) {
        for file in &self.lock().files {
            file.handle.cancel();
        }
    }
}

impl crate::shared_file::DownloadTarget for PartialTorrentHandle {
    fn size(&self) -> u64 {
        PartialTorrentHandle::size(self)
    }

    fn is_complete(&self) -> bool {
        PartialTorrentHandle::is_complete(self)
    }

    fn pause(&self) {
        PartialTorrentHandle::pause(self)
    }

    fn resume(&self) {
        PartialTorrentHandle::resume(self)
    }

    fn stop(&self) {
        PartialTorrentHandle::stop(self)
    }

    fn cancel(&self) {
        PartialTorrentHandle::cancel(self)
    }
}

impl PartDataHandle {
    /// Raw positioned write bypassing the lock/complete pipeline, used by
    /// [`PartialTorrentHandle`] which owns verification itself for the
    /// torrent's chunk grid.
    pub(crate) fn write_raw(&self, begin: u64, data: &[u8]) -> Result<(), RangeError> {
        let path = self.temp_path();
        let mut file = OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(false)
            .open(&path)
            .map_err(|_| RangeError::OutOfBounds { begin, end: begin + data.len() as u64 - 1, size: self.size() })?;
        file.seek(SeekFrom::Start(begin)).ok();
        file.write_all(data).ok();
        Ok(())
    }

    pub(crate) fn read_raw(&self, begin: u64, end: u64) -> std::io::Result<Vec<u8>> {
        use std::io::Read;
        let mut file = std::fs::File::open(self.temp_path())?;
        file.seek(SeekFrom::Start(begin))?;
        let mut buf = vec![0u8; (end - begin + 1) as usize];
        file.read_exact(&mut buf)?;
        Ok(buf)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{config::Config, io_thread};
    use sha1::{Digest as _, Sha1};

    fn digest_of(data: &[u8]) -> Digest {
        let mut hasher = Sha1::new();
        hasher.update(data);
        hasher.finalize().into()
    }

    #[tokio::test]
    async fn boundary_chunk_verifies_from_child_files() {
        let dir = tempfile::tempdir().unwrap();
        let (_io_task, io) = io_thread::spawn();
        let config = Config::default();

        let sub1 = PartDataHandle::new(&config, dir.path().join("sub1.part"), 1500, io.clone()).unwrap();
        let sub2 = PartDataHandle::new(&config, dir.path().join("sub2.part"), 1500, io.clone()).unwrap();

        let torrent = PartialTorrentHandle::new(
            vec![(sub1, 1500), (sub2, 1500)],
            1024,
            dir.path().join("cache"),
            io,
        )
        .unwrap();

        let mut expected_chunk1 = vec![b'A'; 476];
        expected_chunk1.extend(vec![b'B'; 548]);
        torrent.set_reference_hash(0, digest_of(&vec![b'A'; 1024]));
        torrent.set_reference_hash(1, digest_of(&expected_chunk1));
        torrent.set_reference_hash(2, digest_of(&vec![b'B'; 952]));

        torrent.write(0, &vec![b'A'; 1500]).unwrap();
        torrent.write(1500, &vec![b'B'; 1500]).unwrap();

        for _ in 0..50 {
            if torrent.is_complete() {
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        }
        assert!(torrent.is_complete(), "torrent should complete once every chunk verifies");
    }

    #[tokio::test]
    async fn read_spans_sub_file_boundary() {
        let dir = tempfile::tempdir().unwrap();
        let (_io_task, io) = io_thread::spawn();
        let config = Config::default();
        let sub1 = PartDataHandle::new(&config, dir.path().join("sub1.part"), 1500, io.clone()).unwrap();
        let sub2 = PartDataHandle::new(&config, dir.path().join("sub2.part"), 1500, io.clone()).unwrap();
        let torrent = PartialTorrentHandle::new(vec![(sub1, 1500), (sub2, 1500)], 1024, dir.path().join("cache"), io).unwrap();

        torrent.write(0, &vec![b'A'; 1500]).unwrap();
        torrent.write(1500, &vec![b'B'; 1500]).unwrap();

        let bytes = torrent.read(1400, 1599).unwrap();
        assert_eq!(&bytes[..100], &vec![b'A'; 100][..]);
        assert_eq!(&bytes[100..], &vec![b'B'; 100][..]);
    }

    #[tokio::test]
    async fn verified_chunks_move_out_of_complete() {
        let dir = tempfile::tempdir().unwrap();
        let (_io_task, io) = io_thread::spawn();
        let config = Config::default();
        let sub1 = PartDataHandle::new(&config, dir.path().join("sub1.part"), 1500, io.clone()).unwrap();
        let sub2 = PartDataHandle::new(&config, dir.path().join("sub2.part"), 1500, io.clone()).unwrap();
        let torrent = PartialTorrentHandle::new(vec![(sub1, 1500), (sub2, 1500)], 1024, dir.path().join("cache"), io).unwrap();

        torrent.set_reference_hash(0, digest_of(&vec![b'A'; 1024]));
        torrent.set_reference_hash(1, digest_of(&[vec![b'A'; 476], vec![b'B'; 548]].concat()));
        torrent.set_reference_hash(2, digest_of(&vec![b'B'; 952]));
        torrent.write(0, &vec![b'A'; 1500]).unwrap();
        torrent.write(1500, &vec![b'B'; 1500]).unwrap();

        let whole = Range::new(0, 2999);
        for _ in 0..50 {
            if torrent.lock().verified.contains_full(&whole) {
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        }

        let inner = torrent.lock();
        assert!(inner.verified.contains_full(&whole), "every chunk should have verified");
        assert!(inner.complete.iter().next().is_none(), "`complete` must be empty once every chunk has moved to `verified`");
    }

    #[tokio::test]
    async fn pause_subfile_marks_dont_download() {
        let dir = tempfile::tempdir().unwrap();
        let (_io_task, io) = io_thread::spawn();
        let config = Config::default();
        let sub1 = PartDataHandle::new(&config, dir.path().join("sub1.part"), 1500, io.clone()).unwrap();
        let sub2 = PartDataHandle::new(&config, dir.path().join("sub2.part"), 1500, io.clone()).unwrap();
        let torrent = PartialTorrentHandle::new(vec![(sub1, 1500), (sub2, 1500)], 1024, dir.path().join("cache"), io).unwrap();

        torrent.pause_subfile(0);
        let err = torrent.write(0, &[b'A'; 10]).unwrap_err();
        assert!(matches!(err, RangeError::Incomplete { .. }));
        torrent.resume_subfile(0);
        assert!(torrent.write(0, &[b'A'; 10]).is_ok());
    }
}
