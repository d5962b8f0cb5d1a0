//! Background hashing of a byte range against a reference digest (spec.md
//! §4.7), grounded on the teacher's piece verification (`fs/piece.rs::Piece::verify_hash`,
//! `fs/mod.rs::read_piece`) but generalised from "whole piece, known file
//! layout" to "one or more file spans, known only as (path, local begin,
//! local end)" so [`crate::partial_torrent::PartialTorrent`] can reuse it
//! for boundary-crossing chunks.

use std::{
    fs::File,
    io::{Read, Seek, SeekFrom},
    path::PathBuf,
};

use sha1::{Digest as _, Sha1};

use crate::chunk::Digest;

/// Outcome of a [`HashWork`] run (spec.md §4.7).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HashOutcome {
    /// Computed digest matched the reference.
    Verified,
    /// Computed digest did not match the reference.
    Failed,
    /// I/O error prevented reading the data; unrecoverable for this attempt.
    FatalError(String),
}

/// One physical file's contribution to the span being hashed: the path and
/// the local (i.e. within-file) inclusive byte range to read.
#[derive(Debug, Clone)]
pub struct FileSpan {
    pub path: PathBuf,
    pub begin: u64,
    pub end: u64,
}

impl FileSpan {
    pub fn len(&self) -> u64 {
        self.end - self.begin + 1
    }

    pub fn is_empty(&self) -> bool {
        false
    }
}

/// A job: read `spans` in order, hash the concatenation, and compare against
/// `reference` (if any — omitting it turns this into an identification job
/// that only reports the computed digest).
#[derive(Debug, Clone)]
pub struct HashWork {
    pub spans: Vec<FileSpan>,
    pub reference: Option<Digest>,
}

impl HashWork {
    pub fn new(spans: Vec<FileSpan>, reference: Option<Digest>) -> Self {
        assert!(!spans.is_empty(), "hash work needs at least one file span");
        Self { spans, reference }
    }

    /// Reads every span sequentially, switching the underlying file handle
    /// at each boundary, and returns the outcome plus the computed digest
    /// (useful for identification jobs with no reference).
    pub fn process(&self) -> (HashOutcome, Option<Digest>) {
        let mut hasher = Sha1::new();
        for span in &self.spans {
            let mut file = match File::open(&span.path) {
                Ok(f) => f,
                Err(e) => return (HashOutcome::FatalError(e.to_string()), None),
            };
            if let Err(e) = file.seek(SeekFrom::Start(span.begin)) {
                return (HashOutcome::FatalError(e.to_string()), None);
            }
            let mut remaining = span.len();
            let mut buf = vec![0u8; 64 * 1024];
            while remaining > 0 {
                let want = remaining.min(buf.len() as u64) as usize;
                match file.read(&mut buf[..want]) {
                    Ok(0) => {
                        return (
                            HashOutcome::FatalError(format!(
                                "unexpected EOF reading {:?}, {remaining} bytes short",
                                span.path
                            )),
                            None,
                        )
                    }
                    Ok(n) => {
                        hasher.update(&buf[..n]);
                        remaining -= n as u64;
                    }
                    Err(e) => return (HashOutcome::FatalError(e.to_string()), None),
                }
            }
        }

        let computed: Digest = hasher.finalize().into();
        match self.reference {
            Some(reference) if reference == computed => (HashOutcome::Verified, Some(computed)),
            Some(_) => (HashOutcome::Failed, Some(computed)),
            None => (HashOutcome::Verified, Some(computed)),
        }
    }
}

impl crate::io_thread::Job for HashWork {
    type Output = (HashOutcome, Option<Digest>);

    fn process(self) -> Self::Output {
        HashWork::process(&self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn write_temp(dir: &tempfile::TempDir, name: &str, contents: &[u8]) -> PathBuf {
        let path = dir.path().join(name);
        let mut f = File::create(&path).unwrap();
        f.write_all(contents).unwrap();
        path
    }

    fn digest_of(data: &[u8]) -> Digest {
        let mut hasher = Sha1::new();
        hasher.update(data);
        hasher.finalize().into()
    }

    #[test]
    fn single_span_matches_reference() {
        let dir = tempfile::tempdir().unwrap();
        let data = vec![b'A'; 1024];
        let path = write_temp(&dir, "a", &data);
        let reference = digest_of(&data);
        let work = HashWork::new(vec![FileSpan { path, begin: 0, end: 1023 }], Some(reference));
        let (outcome, computed) = work.process();
        assert_eq!(outcome, HashOutcome::Verified);
        assert_eq!(computed, Some(reference));
    }

    #[test]
    fn mismatch_reports_failed() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_temp(&dir, "a", &vec![b'X'; 1024]);
        let reference = digest_of(&vec![b'A'; 1024]);
        let work = HashWork::new(vec![FileSpan { path, begin: 0, end: 1023 }], Some(reference));
        let (outcome, _) = work.process();
        assert_eq!(outcome, HashOutcome::Failed);
    }

    #[test]
    fn multi_file_span_concatenates_in_order() {
        let dir = tempfile::tempdir().unwrap();
        let a = write_temp(&dir, "a", &vec![b'A'; 476]);
        let b = write_temp(&dir, "b", &vec![b'B'; 548]);
        let mut expected = vec![b'A'; 476];
        expected.extend(vec![b'B'; 548]);
        let reference = digest_of(&expected);

        let work = HashWork::new(
            vec![
                FileSpan { path: a, begin: 0, end: 475 },
                FileSpan { path: b, begin: 0, end: 547 },
            ],
            Some(reference),
        );
        let (outcome, _) = work.process();
        assert_eq!(outcome, HashOutcome::Verified);
    }

    #[test]
    fn missing_file_is_fatal() {
        let work = HashWork::new(
            vec![FileSpan { path: PathBuf::from("/nonexistent/path/abc"), begin: 0, end: 9 }],
            None,
        );
        let (outcome, _) = work.process();
        assert!(matches!(outcome, HashOutcome::FatalError(_)));
    }
}
