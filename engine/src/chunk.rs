//! Per-chunk-size availability and use-count bookkeeping (spec.md §4.2).
//!
//! In the original C++ the chunk size was a template parameter of
//! `ChunkMap`; per the REDESIGN FLAGS in spec.md §9 ("Template chunk-size
//! specialisation"), this is a runtime map instead: [`crate::part_data::PartData`]
//! keeps one `ChunkMap` per chunk size any caller has registered a hash set
//! or source mask for.

use rand::seq::IteratorRandom;

use crate::range::{Range, RangeList};

/// An opaque, fixed-width reference digest. Both MD4 (eDonkey) and SHA-1
/// (BitTorrent) are 20 bytes; spec.md §1 treats the hashing primitive as
/// opaque, so this crate fixes the width rather than adding a type
/// parameter nothing downstream varies on.
pub type Digest = [u8; 20];

#[derive(Debug, Clone, Default)]
struct Chunk {
    availability: u32,
    use_count: u32,
    reference_hash: Option<Digest>,
    completed: bool,
    partial: bool,
}

/// Availability/use-count/verification-cache view over a [`PartData`]'s
/// ranges for one particular chunk size.
///
/// [`PartData`]: crate::part_data::PartData
#[derive(Debug)]
pub struct ChunkMap {
    chunk_size: u64,
    file_size: u64,
    chunks: Vec<Chunk>,
}

impl ChunkMap {
    pub fn new(chunk_size: u64, file_size: u64) -> Self {
        assert!(chunk_size > 0 && file_size > 0);
        let count = chunk_count(chunk_size, file_size);
        Self {
            chunk_size,
            file_size,
            chunks: vec![Chunk::default(); count as usize],
        }
    }

    pub fn chunk_size(&self) -> u64 {
        self.chunk_size
    }

    pub fn chunk_count(&self) -> u64 {
        self.chunks.len() as u64
    }

    /// Byte range of chunk `index`, clamped to `file_size` for the final,
    /// possibly short, chunk.
    pub fn chunk_range(&self, index: u64) -> Range {
        let begin = index * self.chunk_size;
        let end = (begin + self.chunk_size - 1).min(self.file_size - 1);
        Range::new(begin, end)
    }

    pub fn reference_hash(&self, index: u64) -> Option<Digest> {
        self.chunks[index as usize].reference_hash
    }

    pub fn set_reference_hash(&mut self, index: u64, hash: Digest) {
        self.chunks[index as usize].reference_hash = Some(hash);
    }

    pub fn has_hash_set(&self) -> bool {
        self.chunks.iter().any(|c| c.reference_hash.is_some())
    }

    pub fn is_completed(&self, index: u64) -> bool {
        self.chunks[index as usize].completed
    }

    pub fn use_count(&self, index: u64) -> u32 {
        self.chunks[index as usize].use_count
    }

    pub fn inc_use_count(&mut self, index: u64) {
        self.chunks[index as usize].use_count += 1;
    }

    pub fn dec_use_count(&mut self, index: u64) {
        let count = &mut self.chunks[index as usize].use_count;
        *count = count.saturating_sub(1);
    }

    /// Registers a peer bitmap's contribution to availability
    /// (`addSourceMask`/`delSourceMask`, spec.md §4.4.4). `delta` is `+1` to
    /// add a source, `-1` to remove one.
    pub fn apply_source_mask(&mut self, bitmap: &[bool], delta: i32) {
        for (idx, has) in bitmap.iter().enumerate() {
            if *has {
                self.adjust_availability(idx as u64, delta);
            }
        }
    }

    /// `addFullSource`/`delFullSource`: O(1) in spirit (one pass, no bitmap
    /// allocation), applies `delta` to every chunk.
    pub fn apply_full_source(&mut self, delta: i32) {
        for chunk in &mut self.chunks {
            chunk.availability = (chunk.availability as i32 + delta).max(0) as u32;
        }
    }

    fn adjust_availability(&mut self, index: u64, delta: i32) {
        let chunk = &mut self.chunks[index as usize];
        chunk.availability = (chunk.availability as i32 + delta).max(0) as u32;
    }

    /// Refreshes the `completed`/`partial` cache for every chunk whose byte
    /// range intersects `range`, given the owning `PartData`'s authoritative
    /// `complete` list. Called on every `onDataAdded`/`onCorruption`
    /// transition (spec.md §4.2 `onDataAdded`).
    pub fn refresh(&mut self, complete: &RangeList, range: Range) {
        let first = range.begin() / self.chunk_size;
        let last = range.end() / self.chunk_size;
        for index in first..=last.min(self.chunk_count() - 1) {
            let chunk_range = self.chunk_range(index);
            let chunk = &mut self.chunks[index as usize];
            chunk.completed = complete.contains_full(&chunk_range);
            chunk.partial = !chunk.completed && complete.contains(&chunk_range);
        }
    }

    /// Picks the chunk to download next given a peer's availability bitmap
    /// (spec.md §4.2 `pickChunk`): rarest first, ties broken by
    /// partially-completed chunks first, then lowest use count, then random
    /// among what remains. `avoid_used` additionally excludes chunks that
    /// already have at least one live [`crate::part_data::UsedRange`].
    pub fn pick_chunk(&self, bitmap: &[bool], avoid_used: bool) -> Option<u64> {
        let candidates: Vec<u64> = (0..self.chunk_count())
            .filter(|&idx| {
                let has = bitmap.get(idx as usize).copied().unwrap_or(false);
                let chunk = &self.chunks[idx as usize];
                has && !chunk.completed && (!avoid_used || chunk.use_count == 0)
            })
            .collect();
        if candidates.is_empty() {
            return None;
        }

        let min_availability = candidates
            .iter()
            .map(|&idx| self.chunks[idx as usize].availability)
            .min()
            .unwrap();
        let rarest: Vec<u64> = candidates
            .into_iter()
            .filter(|&idx| self.chunks[idx as usize].availability == min_availability)
            .collect();

        let any_partial = rarest.iter().any(|&idx| self.chunks[idx as usize].partial);
        let partial_filtered: Vec<u64> = if any_partial {
            rarest
                .into_iter()
                .filter(|&idx| self.chunks[idx as usize].partial)
                .collect()
        } else {
            rarest
        };

        let min_use = partial_filtered
            .iter()
            .map(|&idx| self.chunks[idx as usize].use_count)
            .min()
            .unwrap();
        let least_used: Vec<u64> = partial_filtered
            .into_iter()
            .filter(|&idx| self.chunks[idx as usize].use_count == min_use)
            .collect();

        least_used.into_iter().choose(&mut rand::thread_rng())
    }
}

fn chunk_count(chunk_size: u64, file_size: u64) -> u64 {
    file_size.div_ceil(chunk_size)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn chunk_range_clamps_last_chunk() {
        let map = ChunkMap::new(1024, 2500);
        assert_eq!(map.chunk_count(), 3);
        assert_eq!(map.chunk_range(2), Range::new(2048, 2499));
    }

    #[test]
    fn pick_chunk_prefers_rarest() {
        let mut map = ChunkMap::new(1024, 3072);
        map.apply_source_mask(&[true, true, true], 1); // everyone has all 3
        map.apply_source_mask(&[true, false, false], 1); // extra source for 0
        let bitmap = [true, true, true];
        let picked = map.pick_chunk(&bitmap, false).unwrap();
        assert!(picked == 1 || picked == 2, "rarest chunks are 1 and 2, got {picked}");
    }

    #[test]
    fn pick_chunk_prefers_partial_among_rarest() {
        let mut map = ChunkMap::new(1024, 3072);
        map.apply_full_source(1);
        let mut complete = RangeList::new();
        complete.insert(Range::new(0, 100)); // chunk 0 partially complete
        map.refresh(&complete, Range::new(0, 100));
        let bitmap = [true, true, true];
        let picked = map.pick_chunk(&bitmap, false).unwrap();
        assert_eq!(picked, 0);
    }

    #[test]
    fn pick_chunk_none_when_peer_has_nothing_new() {
        let map = ChunkMap::new(1024, 2048);
        let bitmap = [false, false];
        assert_eq!(map.pick_chunk(&bitmap, false), None);
    }

    #[test]
    fn full_source_delta_affects_all_chunks() {
        let mut map = ChunkMap::new(1024, 2048);
        map.apply_full_source(1);
        map.apply_full_source(1);
        map.apply_full_source(-1);
        let bitmap = [true, true];
        // Both chunks equally available; just verify a pick succeeds.
        assert!(map.pick_chunk(&bitmap, false).is_some());
    }
}
