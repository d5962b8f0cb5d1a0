//! Binary `.dat` sidecar format (spec.md §6, §4.4.6): a version byte
//! followed by a tagged sequence of fields, little-endian throughout. Save
//! is atomic via write-to-`.tmp`-then-rename; load falls back to a `.bak`
//! copy if the primary file is corrupt, per spec.md §7's "user-visible
//! failure behaviour".

use std::{
    fs,
    io::{Read, Write},
    path::{Path, PathBuf},
};

use crate::{
    chunk::Digest,
    error::SidecarError,
    range::{Range, RangeList},
};

pub const CURRENT_VERSION: u8 = 1;

const OP_DOWNLOADED: u8 = 0x91;
const OP_DESTINATION: u8 = 0x92;
const OP_COMPLETED: u8 = 0x93;
const OP_HASHSET: u8 = 0x94;
const OP_STATE: u8 = 0x95;
const OP_VERIFIED: u8 = 0x96;

/// Sidecar-encoded download state (spec.md §6 `STATE(u8)`).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SavedState {
    Running = 0,
    Paused = 1,
    Stopped = 2,
}

impl SavedState {
    fn from_byte(b: u8) -> Option<Self> {
        match b {
            0 => Some(Self::Running),
            1 => Some(Self::Paused),
            2 => Some(Self::Stopped),
            _ => None,
        }
    }
}

/// Everything a sidecar file can hold, fully decoded.
#[derive(Debug, Clone, Default)]
pub struct Sidecar {
    pub downloaded: u64,
    pub destination: Option<PathBuf>,
    pub complete: RangeList,
    pub verified: RangeList,
    /// One hash set per registered chunk size: `(chunk_size, digests_by_index)`.
    pub hash_sets: Vec<(u64, Vec<Digest>)>,
    pub state: Option<SavedState>,
}

fn push_tag(buf: &mut Vec<u8>, opcode: u8, payload: &[u8]) {
    assert!(payload.len() <= u16::MAX as usize, "sidecar field too large for u16 length");
    buf.push(opcode);
    buf.extend_from_slice(&(payload.len() as u16).to_le_bytes());
    buf.extend_from_slice(payload);
}

fn encode_string(s: &str) -> Vec<u8> {
    let mut out = Vec::with_capacity(2 + s.len());
    out.extend_from_slice(&(s.len() as u16).to_le_bytes());
    out.extend_from_slice(s.as_bytes());
    out
}

fn encode_range_list(list: &RangeList) -> Vec<u8> {
    let mut out = Vec::with_capacity(2 + list.len() * 16);
    out.extend_from_slice(&(list.len() as u16).to_le_bytes());
    for r in list.iter() {
        out.extend_from_slice(&r.begin().to_le_bytes());
        out.extend_from_slice(&r.end().to_le_bytes());
    }
    out
}

fn encode_hash_set(chunk_size: u64, digests: &[Digest]) -> Vec<u8> {
    let mut out = Vec::with_capacity(8 + 2 + digests.len() * 20);
    out.extend_from_slice(&chunk_size.to_le_bytes());
    out.extend_from_slice(&(digests.len() as u16).to_le_bytes());
    for d in digests {
        out.extend_from_slice(d);
    }
    out
}

impl Sidecar {
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = vec![CURRENT_VERSION];
        push_tag(&mut buf, OP_DOWNLOADED, &self.downloaded.to_le_bytes());
        if let Some(dest) = &self.destination {
            push_tag(&mut buf, OP_DESTINATION, &encode_string(&dest.to_string_lossy()));
        }
        push_tag(&mut buf, OP_COMPLETED, &encode_range_list(&self.complete));
        push_tag(&mut buf, OP_VERIFIED, &encode_range_list(&self.verified));
        for (chunk_size, digests) in &self.hash_sets {
            push_tag(&mut buf, OP_HASHSET, &encode_hash_set(*chunk_size, digests));
        }
        if let Some(state) = self.state {
            push_tag(&mut buf, OP_STATE, &[state as u8]);
        }
        buf
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, SidecarError> {
        let mut cursor = bytes.iter();
        let version = *cursor
            .next()
            .ok_or_else(|| SidecarError::Corrupt("empty sidecar".into()))?;
        if version != CURRENT_VERSION {
            return Err(SidecarError::UnknownVersion(version));
        }

        let mut pos = 1usize;
        let mut sidecar = Sidecar::default();
        while pos < bytes.len() {
            if pos + 3 > bytes.len() {
                return Err(SidecarError::Corrupt("truncated tag header".into()));
            }
            let opcode = bytes[pos];
            let len = u16::from_le_bytes([bytes[pos + 1], bytes[pos + 2]]) as usize;
            let payload_start = pos + 3;
            let payload_end = payload_start + len;
            if payload_end > bytes.len() {
                return Err(SidecarError::Corrupt("truncated tag payload".into()));
            }
            let payload = &bytes[payload_start..payload_end];

            match opcode {
                OP_DOWNLOADED => {
                    sidecar.downloaded = u64::from_le_bytes(
                        payload.try_into().map_err(|_| SidecarError::Corrupt("bad DOWNLOADED".into()))?,
                    );
                }
                OP_DESTINATION => {
                    sidecar.destination = Some(PathBuf::from(decode_string(payload)?));
                }
                OP_COMPLETED => sidecar.complete = decode_range_list(payload)?,
                OP_VERIFIED => sidecar.verified = decode_range_list(payload)?,
                OP_HASHSET => sidecar.hash_sets.push(decode_hash_set(payload)?),
                OP_STATE => {
                    let byte = *payload.first().ok_or_else(|| SidecarError::Corrupt("empty STATE".into()))?;
                    sidecar.state = Some(
                        SavedState::from_byte(byte)
                            .ok_or_else(|| SidecarError::Corrupt(format!("bad state byte {byte}")))?,
                    );
                }
                other => {
                    tracing::warn!("ignoring unknown sidecar opcode {other:#x}");
                }
            }
            pos = payload_end;
        }
        Ok(sidecar)
    }
}

fn decode_string(payload: &[u8]) -> Result<String, SidecarError> {
    if payload.len() < 2 {
        return Err(SidecarError::Corrupt("truncated string".into()));
    }
    let len = u16::from_le_bytes([payload[0], payload[1]]) as usize;
    let bytes = payload
        .get(2..2 + len)
        .ok_or_else(|| SidecarError::Corrupt("truncated string payload".into()))?;
    Ok(String::from_utf8_lossy(bytes).into_owned())
}

fn decode_range_list(payload: &[u8]) -> Result<RangeList, SidecarError> {
    if payload.len() < 2 {
        return Err(SidecarError::Corrupt("truncated range list".into()));
    }
    let count = u16::from_le_bytes([payload[0], payload[1]]) as usize;
    let mut list = RangeList::new();
    let mut offset = 2;
    for _ in 0..count {
        let entry = payload
            .get(offset..offset + 16)
            .ok_or_else(|| SidecarError::Corrupt("truncated range entry".into()))?;
        let begin = u64::from_le_bytes(entry[0..8].try_into().unwrap());
        let end = u64::from_le_bytes(entry[8..16].try_into().unwrap());
        list.insert(Range::new(begin, end));
        offset += 16;
    }
    Ok(list)
}

fn decode_hash_set(payload: &[u8]) -> Result<(u64, Vec<Digest>), SidecarError> {
    if payload.len() < 10 {
        return Err(SidecarError::Corrupt("truncated hash set".into()));
    }
    let chunk_size = u64::from_le_bytes(payload[0..8].try_into().unwrap());
    let count = u16::from_le_bytes([payload[8], payload[9]]) as usize;
    let mut digests = Vec::with_capacity(count);
    let mut offset = 10;
    for _ in 0..count {
        let digest: Digest = payload
            .get(offset..offset + 20)
            .ok_or_else(|| SidecarError::Corrupt("truncated digest".into()))?
            .try_into()
            .unwrap();
        digests.push(digest);
        offset += 20;
    }
    Ok((chunk_size, digests))
}

/// Writes `sidecar` to `path` atomically: encode to `path.tmp`, then rename
/// over `path`.
pub fn save(path: &Path, sidecar: &Sidecar) -> Result<(), SidecarError> {
    let tmp_path = tmp_path(path);
    let mut file = fs::File::create(&tmp_path)?;
    file.write_all(&sidecar.encode())?;
    file.sync_all()?;
    fs::rename(&tmp_path, path)?;
    Ok(())
}

fn tmp_path(path: &Path) -> PathBuf {
    let mut name = path.file_name().unwrap_or_default().to_os_string();
    name.push(".tmp");
    path.with_file_name(name)
}

fn bak_path(path: &Path) -> PathBuf {
    let mut name = path.file_name().unwrap_or_default().to_os_string();
    name.push(".bak");
    path.with_file_name(name)
}

/// Loads the sidecar at `path`, falling back to `<path>.bak` if the primary
/// file is missing or fails to parse (spec.md §4.4.6, §7, Scenario E).
pub fn load_with_fallback(path: &Path) -> Result<Sidecar, SidecarError> {
    match read_and_decode(path) {
        Ok(sidecar) => Ok(sidecar),
        Err(primary_err) => {
            let bak = bak_path(path);
            tracing::warn!("primary sidecar {path:?} failed ({primary_err}), trying {bak:?}");
            read_and_decode(&bak)
        }
    }
}

fn read_and_decode(path: &Path) -> Result<Sidecar, SidecarError> {
    let mut file = fs::File::open(path)?;
    let mut bytes = Vec::new();
    file.read_to_end(&mut bytes)?;
    Sidecar::decode(&bytes)
}

/// Writes a `.bak` copy alongside the primary sidecar. Called before
/// overwriting the primary so a crash mid-save still leaves a loadable copy.
pub fn backup(path: &Path) -> Result<(), SidecarError> {
    if path.exists() {
        fs::copy(path, bak_path(path))?;
    }
    Ok(())
}

/// Removes the primary sidecar and its `.bak` copy, once the download they
/// describe has finished and moved (spec.md Scenario A: "sidecar deleted").
/// Missing files are not an error — there may never have been a backup.
pub fn remove(path: &Path) {
    for p in [path.to_path_buf(), bak_path(path)] {
        if let Err(e) = fs::remove_file(&p) {
            if e.kind() != std::io::ErrorKind::NotFound {
                tracing::warn!("failed to remove sidecar {p:?}: {e}");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_through_encode_decode() {
        let mut complete = RangeList::new();
        complete.insert(Range::new(0, 1023));
        let mut verified = RangeList::new();
        verified.insert(Range::new(0, 1023));

        let sidecar = Sidecar {
            downloaded: 1024,
            destination: Some(PathBuf::from("/tmp/out/file.bin")),
            complete,
            verified,
            hash_sets: vec![(1024, vec![[7u8; 20], [9u8; 20]])],
            state: Some(SavedState::Paused),
        };

        let decoded = Sidecar::decode(&sidecar.encode()).unwrap();
        assert_eq!(decoded.downloaded, 1024);
        assert_eq!(decoded.destination, Some(PathBuf::from("/tmp/out/file.bin")));
        assert_eq!(decoded.complete, sidecar.complete);
        assert_eq!(decoded.verified, sidecar.verified);
        assert_eq!(decoded.hash_sets, sidecar.hash_sets);
        assert_eq!(decoded.state, Some(SavedState::Paused));
    }

    #[test]
    fn unknown_version_is_rejected() {
        let bytes = vec![0xFF];
        assert!(matches!(Sidecar::decode(&bytes), Err(SidecarError::UnknownVersion(0xFF))));
    }

    #[test]
    fn save_then_load_round_trips_on_disk() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("file.dat");
        let mut complete = RangeList::new();
        complete.insert(Range::new(0, 99));
        let sidecar = Sidecar { downloaded: 100, complete, state: Some(SavedState::Running), ..Default::default() };
        save(&path, &sidecar).unwrap();
        let loaded = load_with_fallback(&path).unwrap();
        assert_eq!(loaded.downloaded, 100);
        assert_eq!(loaded.state, Some(SavedState::Running));
    }

    #[test]
    fn corrupt_primary_falls_back_to_bak() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("file.dat");
        let mut complete = RangeList::new();
        complete.insert(Range::new(0, 99));
        let good = Sidecar { downloaded: 100, complete, state: Some(SavedState::Paused), ..Default::default() };
        backup_good_copy(&path, &good);
        fs::write(&path, b"not a valid sidecar at all, much too short").unwrap();

        let loaded = load_with_fallback(&path).unwrap();
        assert_eq!(loaded.downloaded, 100);
        assert_eq!(loaded.state, Some(SavedState::Paused));
    }

    fn backup_good_copy(path: &Path, sidecar: &Sidecar) {
        save(path, sidecar).unwrap();
        backup(path).unwrap();
    }
}
