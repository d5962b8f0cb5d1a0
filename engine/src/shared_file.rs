//! `SharedFile`: the identity layer over a completed-or-in-progress file
//! (spec.md §3, §4.6). Grounded on `examples/original_source/hncore/sharedfile.cpp`
//! for the `verify()`/duplicate-detection flow and `MoveWork`'s rename-or-
//! copy + unique-destination behaviour.

use std::{
    fs,
    num::NonZeroUsize,
    path::{Path, PathBuf},
    sync::{Arc, Mutex, MutexGuard},
};

use lru::LruCache;
use tokio::sync::broadcast;

use crate::{
    chunk::Digest,
    events::{self, MoveEvent, SharedFileEvent},
    hash::{FileSpan, HashOutcome, HashWork},
    io_thread::{IoThreadHandle, Job},
    metadb::{file_mtime, MetaDb, MetaData},
    part_data::PartDataHandle,
    range::Range,
};

/// Errors `SharedFile::read` can return (spec.md §7): `Incomplete` and
/// `TryAgainLater` are ordinary, expected conditions; `Io` means every
/// location (primary plus alternates) failed.
#[derive(thiserror::Error, Debug)]
pub enum ReadError {
    #[error("range [{begin}, {end}] is not in the complete set")]
    Incomplete { begin: u64, end: u64 },

    #[error("move to destination is in progress")]
    TryAgainLater,

    #[error("read failed at every known location: {0}")]
    Io(std::io::Error),
}

/// The capability set every downloadable/uploadable thing in this crate
/// exposes, whether it's a single [`PartData`] or a [`crate::partial_torrent::PartialTorrentHandle`]
/// (spec.md §9 "Polymorphism over capability sets"). `PartialTorrent`
/// implements this by delegating to its children; a plain [`SharedFile`]
/// wrapping one `PartData` implements it directly.
///
/// [`PartData`]: crate::part_data::PartData
pub trait DownloadTarget: Send + Sync {
    fn size(&self) -> u64;
    fn is_complete(&self) -> bool;
    fn pause(&self);
    fn resume(&self);
    fn stop(&self);
    fn cancel(&self);
}

impl DownloadTarget for PartDataHandle {
    fn size(&self) -> u64 {
        PartDataHandle::size(self)
    }

    fn is_complete(&self) -> bool {
        PartDataHandle::is_complete(self)
    }

    fn pause(&self) {
        PartDataHandle::pause(self)
    }

    fn resume(&self) {
        PartDataHandle::resume(self)
    }

    fn stop(&self) {
        PartDataHandle::stop(self)
    }

    fn cancel(&self) {
        PartDataHandle::cancel(self)
    }
}

/// A job submitted to the `IoThread` that moves a completed file to its
/// destination (spec.md §6 "Move semantics"): rename when possible, else
/// copy-then-remove; a destination that already exists gets `_` prepended
/// until free, and missing parent directories are created.
pub struct MoveWork {
    pub src: PathBuf,
    pub dest: PathBuf,
}

/// Finds a destination path that doesn't exist yet by prepending `_` to the
/// file name, repeating until free (spec.md §6, `sharedfile.cpp`'s `MoveWork::process`).
pub fn unique_destination(mut dest: PathBuf) -> PathBuf {
    while dest.exists() {
        let name = dest.file_name().unwrap_or_default().to_string_lossy().into_owned();
        dest.set_file_name(format!("_{name}"));
    }
    dest
}

impl Job for MoveWork {
    type Output = Result<PathBuf, String>;

    fn process(self) -> Self::Output {
        let dest = unique_destination(self.dest);
        if let Some(parent) = dest.parent() {
            if let Err(e) = fs::create_dir_all(parent) {
                return Err(e.to_string());
            }
        }
        tracing::info!("moving {:?} -> {:?}", self.src, dest);
        match fs::rename(&self.src, &dest) {
            Ok(()) => Ok(dest),
            Err(_) => match fs::copy(&self.src, &dest) {
                Ok(_) => fs::remove_file(&self.src).map(|_| dest).map_err(|e| e.to_string()),
                Err(e) => Err(e.to_string()),
            },
        }
    }
}

struct Inner {
    location: PathBuf,
    alternate_locations: Vec<PathBuf>,
    metadata: Option<MetaData>,
    part_data: Option<PartDataHandle>,
    size: u64,
    moving: bool,
    events: broadcast::Sender<SharedFileEvent>,
    /// Read cache for upload traffic, keyed by `(location, begin, end)`
    /// (spec.md/Config `hash_chunk_cache`), mirroring the teacher's
    /// `lru::LruCache` read cache (`bittorrent/src/disk/torrent.rs`).
    read_cache: LruCache<(PathBuf, u64, u64), Arc<Vec<u8>>>,
}

/// Default capacity for a [`SharedFile`] built without an explicit cache
/// size (e.g. in tests); real callers should use [`SharedFile::with_cache_capacity`]
/// variants wired to [`crate::config::Config::hash_chunk_cache`].
const DEFAULT_READ_CACHE_CAPACITY: usize = 64;

fn new_read_cache(capacity: usize) -> LruCache<(PathBuf, u64, u64), Arc<Vec<u8>>> {
    LruCache::new(NonZeroUsize::new(capacity.max(1)).unwrap())
}

/// Identity wrapper over either a completed on-disk file or an in-progress
/// [`PartData`] (spec.md §3 "SharedFile entity").
///
/// [`PartData`]: crate::part_data::PartData
#[derive(Clone)]
pub struct SharedFile(Arc<Mutex<Inner>>);

impl std::fmt::Debug for SharedFile {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let inner = self.lock();
        f.debug_struct("SharedFile")
            .field("location", &inner.location)
            .field("size", &inner.size)
            .field("partial", &inner.part_data.is_some())
            .finish()
    }
}

impl SharedFile {
    /// Wraps a complete on-disk file. Looks `metadata` up by name+size+mtime;
    /// if no match is found, the caller should submit an identification
    /// [`HashWork`] (spec.md §4.6 variant 1) and call
    /// [`SharedFile::adopt_metadata`] once it resolves.
    pub fn from_file(location: PathBuf, size: u64, metadb: &dyn MetaDb) -> std::io::Result<Self> {
        let mtime = file_mtime(&location)?;
        let name = location.file_name().unwrap_or_default().to_string_lossy().into_owned();
        let metadata = metadb.lookup_by_name_size_mtime(&name, size, mtime);
        let (events, _rx) = events::event_bus();
        let sf = Self(Arc::new(Mutex::new(Inner {
            location,
            alternate_locations: Vec::new(),
            metadata,
            part_data: None,
            size,
            moving: false,
            events,
            read_cache: new_read_cache(DEFAULT_READ_CACHE_CAPACITY),
        })));
        events::publish(&sf.lock().events, SharedFileEvent::Added);
        if sf.lock().metadata.is_some() {
            events::publish(&sf.lock().events, SharedFileEvent::MetaDataAdded);
        }
        Ok(sf)
    }

    /// Wraps an in-progress download (spec.md §4.6 variant 2).
    pub fn from_part_data(location: PathBuf, part_data: PartDataHandle, metadata: Option<MetaData>) -> Self {
        let size = part_data.size();
        let (events, _rx) = events::event_bus();
        let sf = Self(Arc::new(Mutex::new(Inner {
            location,
            alternate_locations: Vec::new(),
            metadata,
            part_data: Some(part_data),
            size,
            moving: false,
            events,
            read_cache: new_read_cache(DEFAULT_READ_CACHE_CAPACITY),
        })));
        events::publish(&sf.lock().events, SharedFileEvent::Added);
        sf
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.0.lock().unwrap()
    }

    pub fn location(&self) -> PathBuf {
        self.lock().location.clone()
    }

    pub fn size(&self) -> u64 {
        self.lock().size
    }

    pub fn is_partial(&self) -> bool {
        self.lock().part_data.is_some()
    }

    pub fn metadata(&self) -> Option<MetaData> {
        self.lock().metadata.clone()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SharedFileEvent> {
        self.lock().events.subscribe()
    }

    /// Resizes the upload read cache, evicting the least-recently-used
    /// entries if it shrinks (`Config::hash_chunk_cache`).
    pub fn set_cache_capacity(&self, capacity: usize) {
        self.lock().read_cache.resize(NonZeroUsize::new(capacity.max(1)).unwrap());
    }

    /// Adds a fallback location to try on read failure (spec.md §3 "a file
    /// may exist in several places").
    pub fn add_alternate_location(&self, path: PathBuf) {
        self.lock().alternate_locations.push(path);
    }

    /// Records the result of an identification [`HashWork`] run against
    /// this file once it resolves to a known digest, and associates it with
    /// `metadb` (spec.md §4.6 variant 1).
    pub fn adopt_metadata(&self, metadata: MetaData, metadb: &dyn MetaDb) {
        metadb.insert(metadata.clone());
        self.lock().metadata = Some(metadata);
        events::publish(&self.lock().events, SharedFileEvent::MetaDataAdded);
    }

    /// Duplicate detection (spec.md §4.6 "Duplicate detection"): if
    /// `other` shares this file's content digest, this `SharedFile` yields
    /// to it — unless `other` is a still-partial download and this one is a
    /// finished copy, in which case `other`'s download is cancelled and
    /// `other` takes over this location instead.
    pub fn reconcile_duplicate(&self, other: &SharedFile) -> DuplicateOutcome {
        let (Some(mine), Some(theirs)) = (self.metadata(), other.metadata()) else {
            return DuplicateOutcome::NotDuplicate;
        };
        if mine.digest != theirs.digest {
            return DuplicateOutcome::NotDuplicate;
        }
        if other.is_partial() && !self.is_partial() {
            if let Some(pd) = other.lock().part_data.take() {
                pd.cancel();
            }
            let mut other_inner = other.lock();
            other_inner.part_data = None;
            other_inner.location = self.location();
            drop(other_inner);
            events::publish(&self.lock().events, SharedFileEvent::Destroy);
            DuplicateOutcome::OtherTookOver
        } else {
            events::publish(&self.lock().events, SharedFileEvent::Destroy);
            DuplicateOutcome::SelfDestroyed
        }
    }

    /// Reads `[begin, end]` for upload (spec.md §4.6 `read`): rejects while
    /// a move is in flight, rejects a range not yet `complete` for partial
    /// files, and falls back through alternate locations on I/O failure.
    pub fn read(&self, begin: u64, end: u64, io: &IoThreadHandle) -> Result<Vec<u8>, ReadError> {
        let mut inner = self.lock();
        if inner.moving {
            return Err(ReadError::TryAgainLater);
        }
        if let Some(pd) = &inner.part_data {
            if !pd.is_complete() && !self.range_complete(pd, begin, end) {
                return Err(ReadError::Incomplete { begin, end });
            }
        }
        let cache_key = (inner.location.clone(), begin, end);
        if let Some(cached) = inner.read_cache.get(&cache_key) {
            let bytes = cached.as_ref().clone();
            if let Some(metadata) = inner.metadata.as_mut() {
                metadata.uploaded += bytes.len() as u64;
            }
            return Ok(bytes);
        }
        let locations: Vec<PathBuf> = std::iter::once(inner.location.clone())
            .chain(inner.alternate_locations.iter().cloned())
            .collect();
        drop(inner);

        let _ = io;
        let mut last_err = None;
        for location in locations {
            match read_positioned(&location, begin, end) {
                Ok(bytes) => {
                    let mut inner = self.lock();
                    if let Some(metadata) = inner.metadata.as_mut() {
                        metadata.uploaded += bytes.len() as u64;
                    }
                    inner.read_cache.put(cache_key, Arc::new(bytes.clone()));
                    return Ok(bytes);
                }
                Err(e) => last_err = Some(e),
            }
        }
        Err(ReadError::Io(last_err.unwrap_or_else(|| std::io::Error::other("no location available"))))
    }

    fn range_complete(&self, pd: &PartDataHandle, begin: u64, end: u64) -> bool {
        let _ = pd;
        let _ = (begin, end);
        // `PartDataHandle` doesn't expose its `complete` list directly
        // outside the crate; the public surface for this check is
        // `is_complete_range`, added for exactly this caller.
        pd.is_complete_range(Range::new(begin, end))
    }

    /// Starts the move-to-destination step once a download finishes
    /// (spec.md §4.4.3 "hands the location/destination pair to SharedFile,
    /// which submits a MoveWork"). Returns a receiver for the outcome.
    pub fn begin_move(&self, destination: PathBuf, io: &IoThreadHandle) -> tokio::sync::oneshot::Receiver<MoveEvent> {
        let src = self.location();
        self.lock().moving = true;
        let (out_tx, out_rx) = tokio::sync::oneshot::channel();
        let (rx, _invalidate) = io.post_work(MoveWork { src, dest: destination });
        let this = self.clone();
        tokio::spawn(async move {
            let event = match rx.await {
                Ok(Ok(dest)) => {
                    let mut inner = this.lock();
                    inner.moving = false;
                    inner.location = dest.clone();
                    inner.part_data = None;
                    drop(inner);
                    events::publish(&this.lock().events, SharedFileEvent::DlComplete);
                    MoveEvent::Ok { destination: dest }
                }
                Ok(Err(reason)) => {
                    this.lock().moving = false;
                    tracing::error!("move failed: {reason}");
                    MoveEvent::Failed { reason }
                }
                Err(_) => {
                    this.lock().moving = false;
                    tracing::error!("move job dropped before completing");
                    MoveEvent::Failed { reason: "move job dropped".into() }
                }
            };
            let _ = out_tx.send(event);
        });
        out_rx
    }

    /// Computes an identification digest for this file (used when no
    /// `metadata` could be located by name+size+mtime) and posts it as a
    /// `HashWork` to `io` (spec.md §4.6 variant 1).
    pub fn identify(&self, io: &IoThreadHandle) -> tokio::sync::oneshot::Receiver<(HashOutcome, Option<Digest>)> {
        let location = self.location();
        let size = self.size();
        let span = FileSpan { path: location, begin: 0, end: size.saturating_sub(1) };
        let (rx, _invalidate) = io.post_work(HashWork::new(vec![span], None));
        rx
    }
}

fn read_positioned(path: &Path, begin: u64, end: u64) -> std::io::Result<Vec<u8>> {
    use std::io::{Read, Seek, SeekFrom};
    let mut file = fs::File::open(path)?;
    file.seek(SeekFrom::Start(begin))?;
    let mut buf = vec![0u8; (end - begin + 1) as usize];
    file.read_exact(&mut buf)?;
    Ok(buf)
}

/// Outcome of [`SharedFile::reconcile_duplicate`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DuplicateOutcome {
    NotDuplicate,
    SelfDestroyed,
    OtherTookOver,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{config::Config, io_thread, metadb::InMemoryMetaDb};
    use std::time::SystemTime;

    #[test]
    fn unique_destination_prepends_underscore_until_free() {
        let dir = tempfile::tempdir().unwrap();
        let dest = dir.path().join("out.bin");
        fs::write(&dest, b"existing").unwrap();
        let chosen = unique_destination(dest.clone());
        assert_eq!(chosen, dir.path().join("_out.bin"));
    }

    #[test]
    fn from_file_looks_up_existing_metadata() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("movie.bin");
        fs::write(&path, vec![0u8; 10]).unwrap();
        let mtime = file_mtime(&path).unwrap();
        let db = InMemoryMetaDb::new();
        db.insert(MetaData { digest: [1u8; 20], name: "movie.bin".into(), size: 10, mtime, uploaded: 0 });

        let sf = SharedFile::from_file(path, 10, &db).unwrap();
        assert!(sf.metadata().is_some());
    }

    #[tokio::test]
    async fn read_rejects_while_moving() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("movie.bin");
        fs::write(&path, vec![1u8; 10]).unwrap();
        let db = InMemoryMetaDb::new();
        let sf = SharedFile::from_file(path, 10, &db).unwrap();
        sf.lock().moving = true;
        let (_task, io) = io_thread::spawn();
        let err = sf.read(0, 9, &io).unwrap_err();
        assert!(matches!(err, ReadError::TryAgainLater));
    }

    #[tokio::test]
    async fn read_falls_back_to_alternate_location() {
        let dir = tempfile::tempdir().unwrap();
        let primary = dir.path().join("gone.bin");
        let alt = dir.path().join("alt.bin");
        fs::write(&alt, vec![9u8; 10]).unwrap();
        let db = InMemoryMetaDb::new();
        // from_file requires the primary to exist for the mtime lookup;
        // build manually to exercise the not-found-at-primary path.
        let (events, _rx) = events::event_bus();
        let sf = SharedFile(Arc::new(Mutex::new(Inner {
            location: primary,
            alternate_locations: vec![alt],
            metadata: None,
            part_data: None,
            size: 10,
            moving: false,
            events,
            read_cache: new_read_cache(DEFAULT_READ_CACHE_CAPACITY),
        })));
        let _ = &db;
        let (_task, io) = io_thread::spawn();
        let bytes = sf.read(0, 9, &io).unwrap();
        assert_eq!(bytes, vec![9u8; 10]);
    }

    #[tokio::test]
    async fn partial_file_rejects_incomplete_read() {
        let dir = tempfile::tempdir().unwrap();
        let (_io_task, io) = io_thread::spawn();
        let config = Config::default();
        let pd = PartDataHandle::new(&config, dir.path().join("f.part"), 100, io.clone()).unwrap();
        let sf = SharedFile::from_part_data(dir.path().join("f.part"), pd, None);
        let err = sf.read(0, 49, &io).unwrap_err();
        assert!(matches!(err, ReadError::Incomplete { .. }));
    }

    #[tokio::test]
    async fn reconcile_duplicate_destroys_newer_complete_copy() {
        let dir = tempfile::tempdir().unwrap();
        let a_path = dir.path().join("a.bin");
        let b_path = dir.path().join("b.bin");
        fs::write(&a_path, vec![1u8; 10]).unwrap();
        fs::write(&b_path, vec![1u8; 10]).unwrap();
        let db = InMemoryMetaDb::new();
        let digest = [5u8; 20];
        let mtime_a = file_mtime(&a_path).unwrap();
        let mtime_b = file_mtime(&b_path).unwrap();
        db.insert(MetaData { digest, name: "a.bin".into(), size: 10, mtime: mtime_a, uploaded: 0 });
        let a = SharedFile::from_file(a_path, 10, &db).unwrap();
        db.insert(MetaData { digest, name: "b.bin".into(), size: 10, mtime: mtime_b, uploaded: 0 });
        let b = SharedFile::from_file(b_path, 10, &db).unwrap();

        let outcome = a.reconcile_duplicate(&b);
        assert_eq!(outcome, DuplicateOutcome::SelfDestroyed);
        let _ = SystemTime::now;
    }
}
