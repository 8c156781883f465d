//! The sparse set of in-progress pieces plus the set of completed ones
//! (spec.md §3 `TorrentPieceMap`).

use super::bitfield::Bitfield;
use crate::{block_count, block_len, error::Error, PieceIndex, Result};
use std::collections::{HashMap, HashSet};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BlockState {
    Missing,
    Requested,
    Received,
}

/// The in-progress state of a single piece: its blocks and their write
/// buffer, allocated lazily on first write.
#[derive(Debug)]
pub struct PieceState {
    pub piece_len: u32,
    block_states: Vec<BlockState>,
    buf: Option<Vec<u8>>,
}

impl PieceState {
    pub fn new(piece_len: u32) -> Self {
        Self {
            piece_len,
            block_states: vec![BlockState::Missing; block_count(piece_len)],
            buf: None,
        }
    }

    pub fn block_count(&self) -> usize {
        self.block_states.len()
    }

    pub fn block_state(&self, index_in_piece: usize) -> Option<BlockState> {
        self.block_states.get(index_in_piece).copied()
    }

    pub fn mark_requested(&mut self, index_in_piece: usize) {
        if let Some(s) = self.block_states.get_mut(index_in_piece) {
            if *s == BlockState::Missing {
                *s = BlockState::Requested;
            }
        }
    }

    /// Writes a block's payload into the piece's lazily-allocated buffer,
    /// marking it `Received`.
    pub fn receive_block(&mut self, offset: u32, data: &[u8]) {
        let buf = self.buf.get_or_insert_with(|| vec![0; self.piece_len as usize]);
        let start = offset as usize;
        let end = start + data.len();
        buf[start..end].copy_from_slice(data);
        let index_in_piece = (offset / crate::BLOCK_LEN) as usize;
        if let Some(s) = self.block_states.get_mut(index_in_piece) {
            *s = BlockState::Received;
        }
    }

    pub fn is_complete(&self) -> bool {
        self.block_states.iter().all(|s| *s == BlockState::Received)
    }

    pub fn data(&self) -> Option<&[u8]> {
        self.buf.as_deref()
    }

    /// Resets the piece to all-`Missing` and releases its buffer, as
    /// happens on a hash mismatch (spec.md §3 lifecycle).
    pub fn reset(&mut self) {
        for s in self.block_states.iter_mut() {
            *s = BlockState::Missing;
        }
        self.buf = None;
    }

    pub fn missing_block_offsets(&self) -> Vec<u32> {
        self.block_states
            .iter()
            .enumerate()
            .filter(|(_, s)| **s == BlockState::Missing)
            .map(|(i, _)| i as u32 * crate::BLOCK_LEN)
            .collect()
    }
}

/// Holds the sparse set of in-progress pieces plus completed indices, and
/// exports the global bitfield (spec.md §3 `TorrentPieceMap`).
pub struct TorrentPieceMap {
    piece_count: usize,
    piece_len: u32,
    last_piece_len: u32,
    in_progress: HashMap<PieceIndex, PieceState>,
    completed: HashSet<PieceIndex>,
}

impl TorrentPieceMap {
    pub fn new(piece_count: usize, piece_len: u32, last_piece_len: u32) -> Self {
        Self {
            piece_count,
            piece_len,
            last_piece_len,
            in_progress: HashMap::new(),
            completed: HashSet::new(),
        }
    }

    pub fn piece_len(&self, index: PieceIndex) -> Result<u32> {
        if index >= self.piece_count {
            return Err(Error::InvalidPieceIndex(index));
        }
        if index == self.piece_count - 1 {
            Ok(self.last_piece_len)
        } else {
            Ok(self.piece_len)
        }
    }

    /// Returns the piece state, creating it (on first interest) if absent.
    pub fn entry(&mut self, index: PieceIndex) -> Result<&mut PieceState> {
        let len = self.piece_len(index)?;
        Ok(self
            .in_progress
            .entry(index)
            .or_insert_with(|| PieceState::new(len)))
    }

    pub fn get(&self, index: PieceIndex) -> Option<&PieceState> {
        self.in_progress.get(&index)
    }

    pub fn is_completed(&self, index: PieceIndex) -> bool {
        self.completed.contains(&index)
    }

    /// Removes the in-progress piece and marks it completed.
    pub fn mark_completed(&mut self, index: PieceIndex) {
        self.in_progress.remove(&index);
        self.completed.insert(index);
    }

    /// Resets a piece after a hash mismatch, keeping it in progress.
    pub fn mark_failed(&mut self, index: PieceIndex) {
        if let Some(piece) = self.in_progress.get_mut(&index) {
            piece.reset();
        }
    }

    pub fn completed_count(&self) -> usize {
        self.completed.len()
    }

    pub fn piece_count(&self) -> usize {
        self.piece_count
    }

    pub fn progress(&self) -> f64 {
        if self.piece_count == 0 {
            return 1.0;
        }
        self.completed.len() as f64 / self.piece_count as f64
    }

    pub fn missing_count(&self) -> usize {
        self.piece_count - self.completed.len()
    }

    pub fn in_progress_indices(&self) -> impl Iterator<Item = PieceIndex> + '_ {
        self.in_progress.keys().copied()
    }

    /// Exports the global bitfield of completed pieces.
    pub fn bitfield(&self) -> Bitfield {
        let mut bf = Bitfield::allocate(self.piece_count);
        for &i in &self.completed {
            // completed indices are always in-bounds by construction
            bf.set(i).expect("completed index out of range");
        }
        bf
    }

    /// Seeds the completed set directly, e.g. from initial verification or
    /// from a persisted state file.
    pub fn set_completed(&mut self, indices: impl IntoIterator<Item = PieceIndex>) {
        self.completed.extend(indices);
    }
}

/// Returns the length of the block at `offset` within a piece of length
/// `piece_len`.
pub fn block_len_at(piece_len: u32, offset: u32) -> u32 {
    block_len(piece_len, (offset / crate::BLOCK_LEN) as usize)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn piece_completes_after_all_blocks_received() {
        let mut piece = PieceState::new(crate::BLOCK_LEN * 2);
        assert!(!piece.is_complete());
        piece.receive_block(0, &vec![1; crate::BLOCK_LEN as usize]);
        assert!(!piece.is_complete());
        piece.receive_block(crate::BLOCK_LEN, &vec![2; crate::BLOCK_LEN as usize]);
        assert!(piece.is_complete());
    }

    #[test]
    fn reset_clears_blocks_and_buffer() {
        let mut piece = PieceState::new(crate::BLOCK_LEN);
        piece.receive_block(0, &vec![9; crate::BLOCK_LEN as usize]);
        assert!(piece.is_complete());
        piece.reset();
        assert!(!piece.is_complete());
        assert!(piece.data().is_none());
    }

    #[test]
    fn bitfield_or_of_completed_matches_markings() {
        let mut map = TorrentPieceMap::new(4, 10, 10);
        map.mark_completed(0);
        map.mark_completed(2);
        let bf = map.bitfield();
        assert!(bf.test(0));
        assert!(!bf.test(1));
        assert!(bf.test(2));
        assert!(!bf.test(3));
        assert_eq!(bf.count_ones(), 2);
    }
}
