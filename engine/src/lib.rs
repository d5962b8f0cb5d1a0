//! `hydra-core`: the partial-download engine underneath a multi-protocol
//! file-sharing client — chunked verification, range locking, and sharing of
//! in-progress files, independent of any particular wire protocol.
//!
//! The transport/tracker/metainfo layers this engine serves are out of
//! scope here (see `DESIGN.md`); this crate owns everything from "a peer
//! asked for bytes [a, b]" down to the disk.

pub mod chunk;
pub mod config;
pub mod error;
pub mod events;
pub mod files_list;
pub mod hash;
pub mod io_thread;
pub mod metadb;
pub mod part_data;
pub mod partial_torrent;
pub mod range;
pub mod shared_file;

pub use config::Config;
pub use part_data::{PartData, PartDataHandle};
pub use range::{Range, RangeList};
