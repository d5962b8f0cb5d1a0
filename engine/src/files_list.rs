//! `FilesList`: the index of every [`SharedFile`] the engine knows about
//! (spec.md §2 table, §9). Grounded on `examples/original_source/hncore/fileslist.cpp`
//! for the three ways a download/file enters the list — `createDownload`,
//! startup scan of `*.dat` sidecars, and import of an already-complete file
//! — and on spec.md §9's "inject as explicit context; do not rely on
//! process-wide state": unlike the C++ singleton, this is a plain struct a
//! caller constructs and owns, so tests can build an isolated instance.

use std::{
    path::{Path, PathBuf},
    sync::Mutex,
};

use crate::{
    config::Config,
    error::EngineError,
    events::PartDataEvent,
    io_thread::IoThreadHandle,
    metadb::MetaDb,
    part_data::{sidecar, PartDataHandle},
    shared_file::SharedFile,
};

/// Index of every [`SharedFile`] under management, plus the directories it
/// scans/creates downloads in (spec.md §2 "temp-dir / shared-dir scanning").
pub struct FilesList {
    config: Config,
    io: IoThreadHandle,
    files: Mutex<Vec<SharedFile>>,
}

impl FilesList {
    pub fn new(config: Config, io: IoThreadHandle) -> Self {
        Self { config, io, files: Mutex::new(Vec::new()) }
    }

    pub fn files(&self) -> Vec<SharedFile> {
        self.files.lock().unwrap().clone()
    }

    fn push(&self, file: SharedFile) {
        self.files.lock().unwrap().push(file);
    }

    /// Starts a brand-new download: allocates a temp file under
    /// `config.temp_dir` and wraps it in a [`SharedFile`] (spec.md §2
    /// "creation of new downloads").
    pub fn create_download(&self, name: &str, size: u64, metadata: Option<crate::metadb::MetaData>) -> Result<SharedFile, EngineError> {
        std::fs::create_dir_all(&self.config.temp_dir)?;
        let temp_path = self.config.temp_dir.join(name);
        if temp_path.exists() {
            return Err(EngineError::DuplicateDownload(temp_path));
        }
        let part_data = PartDataHandle::new(&self.config, temp_path.clone(), size, self.io.clone())?;
        part_data.set_destination(self.config.incoming_dir.join(name));
        let shared = SharedFile::from_part_data(temp_path, part_data.clone(), metadata);
        shared.set_cache_capacity(self.config.hash_chunk_cache);
        self.push(shared.clone());
        self.spawn_completion_watcher(shared.clone(), part_data);
        Ok(shared)
    }

    /// Imports an already-complete file found elsewhere (e.g. the user
    /// pointed the client at an existing file) without going through the
    /// download path.
    pub fn import_file(&self, location: PathBuf, size: u64, metadb: &dyn MetaDb) -> std::io::Result<SharedFile> {
        let shared = SharedFile::from_file(location, size, metadb)?;
        shared.set_cache_capacity(self.config.hash_chunk_cache);
        self.push(shared.clone());
        Ok(shared)
    }

    /// Enumerates `*.dat` sidecars in `config.temp_dir` and reconstructs a
    /// [`PartDataHandle`] plus [`SharedFile`] for each, distinct from
    /// `create_download` (spec.md §2 table, `fileslist.cpp`'s startup
    /// scan). A sidecar whose temp file is missing is skipped and logged —
    /// it can't be recovered without the bytes it describes.
    pub async fn scan_temp_dir(&self) -> std::io::Result<Vec<SharedFile>> {
        if !self.config.temp_dir.exists() {
            return Ok(Vec::new());
        }
        let _pause = self.io.pause().await;
        let mut found = Vec::new();
        for entry in std::fs::read_dir(&self.config.temp_dir)? {
            let entry = entry?;
            let sidecar_path = entry.path();
            if sidecar_path.extension().and_then(|e| e.to_str()) != Some("dat") {
                continue;
            }
            let temp_path = sidecar_path.with_extension("");
            let Ok(metadata) = std::fs::metadata(&temp_path) else {
                tracing::warn!("sidecar {sidecar_path:?} has no matching temp file, skipping");
                continue;
            };
            let size = metadata.len();
            match PartDataHandle::load(&self.config, temp_path.clone(), size, self.io.clone(), &sidecar_path) {
                Ok(part_data) => {
                    if sidecar_mtime_stale(&sidecar_path, &temp_path) {
                        tracing::info!("temp file {temp_path:?} changed since last save, rehashing completed chunks");
                        part_data.rehash_completed();
                    }
                    let shared = SharedFile::from_part_data(temp_path, part_data.clone(), None);
                    shared.set_cache_capacity(self.config.hash_chunk_cache);
                    self.push(shared.clone());
                    self.spawn_completion_watcher(shared.clone(), part_data);
                    found.push(shared);
                }
                Err(e) => tracing::error!("failed to load sidecar {sidecar_path:?}: {e}"),
            }
        }
        Ok(found)
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn io(&self) -> &IoThreadHandle {
        &self.io
    }

    /// Watches `part_data` for completion and, once it fires, hands the
    /// finished file over to `SharedFile::begin_move` (spec.md §2 step 5,
    /// §4.4.3 "this step hands the location/destination pair to SharedFile,
    /// which submits a MoveWork"; Scenario A: "file moved to destination,
    /// sidecar deleted, SharedFile becomes non-partial"). Runs for the life
    /// of the download; exits once `Complete` fires or every sender/receiver
    /// is gone.
    fn spawn_completion_watcher(&self, shared: SharedFile, part_data: PartDataHandle) {
        let io = self.io.clone();
        tokio::spawn(async move {
            let mut events = part_data.subscribe();
            loop {
                match events.recv().await {
                    Ok(PartDataEvent::Complete) => break,
                    Ok(_) => continue,
                    Err(_) => return,
                }
            }
            let Some(destination) = part_data.destination() else {
                tracing::warn!("download {:?} finished with no destination set, leaving in place", shared.location());
                return;
            };
            let temp_path = part_data.temp_path();
            match shared.begin_move(destination, &io).await {
                Ok(crate::events::MoveEvent::Ok { destination }) => {
                    sidecar::remove(&sidecar_path_for(&temp_path));
                    tracing::info!("download moved to {destination:?}");
                }
                Ok(crate::events::MoveEvent::Failed { reason }) => {
                    tracing::error!("move to destination failed: {reason}");
                }
                Err(_) => tracing::error!("move task dropped before reporting an outcome"),
            }
        });
    }
}

/// The sidecar convention this crate uses alongside a temp file: its path
/// with `.dat` appended (spec.md §6; see `PartData::save`/`load`).
fn sidecar_path_for(temp_path: &Path) -> PathBuf {
    let mut name = temp_path.file_name().unwrap_or_default().to_os_string();
    name.push(".dat");
    temp_path.with_file_name(name)
}

/// Compares the sidecar's recorded mtime expectation against the temp
/// file's actual mtime (spec.md §4.4.6: "if the data file's modification
/// date on disk differs from the recorded value, all completed chunks are
/// re-hashed before being trusted"). The sidecar format in spec.md §6 has
/// no explicit mtime field of its own; this crate uses the sidecar file's
/// own mtime as the recorded value, set at the same moment `PartData::save`
/// last wrote it, so any later change to the temp file's mtime without an
/// accompanying save is the signal.
fn sidecar_mtime_stale(sidecar_path: &Path, temp_path: &Path) -> bool {
    let (Ok(sidecar_meta), Ok(temp_meta)) = (std::fs::metadata(sidecar_path), std::fs::metadata(temp_path)) else {
        return true;
    };
    let (Ok(sidecar_mtime), Ok(temp_mtime)) = (sidecar_meta.modified(), temp_meta.modified()) else {
        return true;
    };
    temp_mtime > sidecar_mtime
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::io_thread;

    fn list(dir: &tempfile::TempDir) -> FilesList {
        let (_io_task, io) = io_thread::spawn();
        let config = Config {
            temp_dir: dir.path().join("temp"),
            incoming_dir: dir.path().join("incoming"),
            ..Config::default()
        };
        FilesList::new(config, io)
    }

    #[tokio::test]
    async fn create_download_sets_destination_and_registers() {
        let dir = tempfile::tempdir().unwrap();
        let fl = list(&dir);
        let sf = fl.create_download("movie.bin", 1024, None).unwrap();
        assert!(sf.is_partial());
        assert_eq!(fl.files().len(), 1);
    }

    #[tokio::test]
    async fn create_download_rejects_duplicate_temp_path() {
        let dir = tempfile::tempdir().unwrap();
        let fl = list(&dir);
        fl.create_download("movie.bin", 1024, None).unwrap();
        let err = fl.create_download("movie.bin", 1024, None).unwrap_err();
        assert!(matches!(err, EngineError::DuplicateDownload(_)));
    }

    #[tokio::test]
    async fn scan_temp_dir_reconstructs_saved_download() {
        let dir = tempfile::tempdir().unwrap();
        let fl = list(&dir);
        let sf = fl.create_download("resume.bin", 100, None).unwrap();
        let temp_path = sf.location();
        // PartData's own `.dat` sidecar convention is `<temp_path>.dat`.
        let dat_path = PathBuf::from(format!("{}.dat", temp_path.display()));

        // There is no PartData handle reachable from SharedFile in this
        // crate boundary, so rebuild one with the same path to save a
        // sidecar for the scan to find.
        let (_io_task, io) = io_thread::spawn();
        let pd = PartDataHandle::new(fl.config(), temp_path.clone(), 100, io).unwrap();
        pd.save(&dat_path).unwrap();

        let fl2 = list(&dir);
        let found = fl2.scan_temp_dir().await.unwrap();
        assert_eq!(found.len(), 1);
    }

    #[tokio::test]
    async fn scan_temp_dir_on_missing_dir_returns_empty() {
        let dir = tempfile::tempdir().unwrap();
        let (_io_task, io) = io_thread::spawn();
        let config = Config { temp_dir: dir.path().join("nonexistent"), ..Config::default() };
        let fl = FilesList::new(config, io);
        assert!(fl.scan_temp_dir().await.unwrap().is_empty());
    }
}
