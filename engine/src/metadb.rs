//! File identity storage: the `MetaDb` boundary this crate consumes but
//! does not own the persistence of (spec.md §1 "out of scope": "The MetaDb
//! persistence of file identities"). `SharedFile` looks identities up by
//! name/size/mtime and by content digest; this module defines the trait it
//! needs and ships an in-memory implementation for tests, the way
//! `original_source/hncore/metadb.h` is a singleton `SharedFile` never
//! constructs itself.

use std::{collections::HashMap, path::Path, sync::Mutex, time::SystemTime};

use crate::chunk::Digest;

/// A file's identity record: what `MetaDb` stores keyed by content digest,
/// and what `SharedFile` consults to validate its on-disk file hasn't
/// changed out from under it (spec.md §4.6 `read`).
#[derive(Debug, Clone)]
pub struct MetaData {
    pub digest: Digest,
    pub name: String,
    pub size: u64,
    pub mtime: SystemTime,
    pub uploaded: u64,
}

/// The identity-lookup boundary `SharedFile` depends on. Distinct from
/// in-progress state (`PartData` owns that); `MetaDb` only knows "this
/// digest belongs to this file with this size and mtime".
pub trait MetaDb: Send + Sync {
    fn lookup_by_name_size_mtime(&self, name: &str, size: u64, mtime: SystemTime) -> Option<MetaData>;
    fn lookup_by_digest(&self, digest: &Digest) -> Option<MetaData>;
    fn insert(&self, data: MetaData);
    fn remove(&self, digest: &Digest);
}

/// Reference in-memory implementation, used by this crate's own tests and
/// suitable as a starting point for an on-disk-backed one (out of scope
/// here per spec.md §1).
#[derive(Default)]
pub struct InMemoryMetaDb {
    by_digest: Mutex<HashMap<Digest, MetaData>>,
}

impl InMemoryMetaDb {
    pub fn new() -> Self {
        Self::default()
    }
}

impl MetaDb for InMemoryMetaDb {
    fn lookup_by_name_size_mtime(&self, name: &str, size: u64, mtime: SystemTime) -> Option<MetaData> {
        self.by_digest
            .lock()
            .unwrap()
            .values()
            .find(|m| m.name == name && m.size == size && m.mtime == mtime)
            .cloned()
    }

    fn lookup_by_digest(&self, digest: &Digest) -> Option<MetaData> {
        self.by_digest.lock().unwrap().get(digest).cloned()
    }

    fn insert(&self, data: MetaData) {
        self.by_digest.lock().unwrap().insert(data.digest, data);
    }

    fn remove(&self, digest: &Digest) {
        self.by_digest.lock().unwrap().remove(digest);
    }
}

/// Reads the filesystem mtime of `path`, the piece of metadata
/// `SharedFile::read` checks on every call (spec.md §4.6).
pub fn file_mtime(path: &Path) -> std::io::Result<SystemTime> {
    std::fs::metadata(path)?.modified()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn insert_then_lookup_by_digest() {
        let db = InMemoryMetaDb::new();
        let digest = [1u8; 20];
        db.insert(MetaData {
            digest,
            name: "a.bin".into(),
            size: 100,
            mtime: SystemTime::UNIX_EPOCH,
            uploaded: 0,
        });
        assert!(db.lookup_by_digest(&digest).is_some());
        assert_eq!(db.lookup_by_digest(&digest).unwrap().name, "a.bin");
    }

    #[test]
    fn lookup_by_name_size_mtime_matches_all_three() {
        let db = InMemoryMetaDb::new();
        let mtime = SystemTime::UNIX_EPOCH;
        db.insert(MetaData { digest: [2u8; 20], name: "b.bin".into(), size: 50, mtime, uploaded: 0 });
        assert!(db.lookup_by_name_size_mtime("b.bin", 50, mtime).is_some());
        assert!(db.lookup_by_name_size_mtime("b.bin", 51, mtime).is_none());
    }

    #[test]
    fn remove_drops_entry() {
        let db = InMemoryMetaDb::new();
        let digest = [3u8; 20];
        db.insert(MetaData { digest, name: "c.bin".into(), size: 1, mtime: SystemTime::UNIX_EPOCH, uploaded: 0 });
        db.remove(&digest);
        assert!(db.lookup_by_digest(&digest).is_none());
    }
}
