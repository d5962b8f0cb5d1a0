//! Engine-wide configuration, following the teacher's plain-struct-with-
//! `Default` style (`bittorrent/src/config.rs`) rather than a serde/toml
//! layer the teacher never reaches for.

use std::path::PathBuf;

#[derive(Debug, Clone)]
pub struct Config {
    /// Where in-progress files and their `.dat` sidecars live.
    pub temp_dir: PathBuf,

    /// Where completed files are moved to.
    pub incoming_dir: PathBuf,

    /// Buffer flush is triggered once pending writes exceed this many bytes,
    /// in addition to the per-chunk-completion trigger (spec.md §4.4.2).
    pub flush_threshold_bytes: u64,

    /// Whether to eagerly preallocate full file size on disk via a
    /// background `AllocJob`, versus writing sparse files lazily
    /// (spec.md §4.4.2).
    pub preallocate: bool,

    /// Read-cache capacity (chunks) for [`crate::shared_file::SharedFile`]
    /// uploads, mirroring the teacher's `lru::LruCache` read cache
    /// (`bittorrent/src/disk/torrent.rs`).
    pub hash_chunk_cache: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            temp_dir: PathBuf::from("temp"),
            incoming_dir: PathBuf::from("incoming"),
            flush_threshold_bytes: 1024 * 1024,
            preallocate: false,
            hash_chunk_cache: 256,
        }
    }
}
