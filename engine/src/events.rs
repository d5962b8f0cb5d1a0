//! Event taxonomy (spec.md §6) and the subscription mechanism spec.md §9
//! asks for: "model as subscription lists returning subscription handles...
//! removed automatically when either end is dropped." `tokio::sync::broadcast`
//! gives us exactly that for free — a dropped `Receiver` silently stops
//! counting against the channel, and a dropped `Sender` (the entity itself)
//! closes every outstanding subscription — so we lean on it rather than
//! hand-rolling a handler registry, the same way the teacher leans on
//! `mpsc` channels for every other cross-task notification
//! (`bittorrent/src/torrent.rs::CommandToTorrent`).

use tokio::sync::broadcast;

use crate::{chunk::Digest, range::Range};

const EVENT_CAPACITY: usize = 256;

/// Events emitted by [`crate::part_data::PartData`] (spec.md §6).
#[derive(Debug, Clone)]
pub enum PartDataEvent {
    Added,
    DataAdded { begin: u64, len: u32 },
    DataFlushed,
    Verifying { chunk_size: u64, index: u64 },
    Verified { chunk_size: u64, index: u64 },
    Corruption { range: Range },
    Moving,
    Complete,
    DlFinished,
    Canceled,
    Paused,
    Stopped,
    Resumed,
    Destroy,
}

/// Events emitted by [`crate::shared_file::SharedFile`] (spec.md §6).
#[derive(Debug, Clone)]
pub enum SharedFileEvent {
    Added,
    MetaDataAdded,
    DlComplete,
    Destroy,
}

/// Events emitted by a move job (spec.md §6 `MoveWork`).
#[derive(Debug, Clone)]
pub enum MoveEvent {
    Ok { destination: std::path::PathBuf },
    Failed { reason: String },
}

/// Terminal result of a [`crate::hash::HashWork`], as delivered to a
/// subscriber after offset translation (for [`crate::partial_torrent::PartialTorrent`],
/// local-file offsets become global torrent offsets before this is emitted).
#[derive(Debug, Clone)]
pub enum HashEvent {
    Verified { range: Range, digest: Digest },
    Failed { range: Range },
    FatalError { range: Range, reason: String },
}

pub fn event_bus<E: Clone + Send + 'static>() -> (broadcast::Sender<E>, broadcast::Receiver<E>) {
    broadcast::channel(EVENT_CAPACITY)
}

/// Publishes `event` on `bus`, swallowing the "no subscribers" error — a
/// download with nobody listening yet is normal, not a failure.
pub fn publish<E: Clone>(bus: &broadcast::Sender<E>, event: E) {
    let _ = bus.send(event);
}
