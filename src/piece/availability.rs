//! Tracks each connected peer's piece bitfield and the resulting rarity
//! counts (spec.md §3 `PieceAvailability`).

use super::bitfield::Bitfield;
use crate::PieceIndex;
use std::collections::HashMap;

#[derive(Debug, Default)]
pub struct PieceAvailability {
    piece_count: usize,
    per_peer: HashMap<usize, Bitfield>,
    /// The number of connected peers that have each piece.
    counts: Vec<usize>,
}

impl PieceAvailability {
    pub fn new(piece_count: usize) -> Self {
        Self {
            piece_count,
            per_peer: HashMap::new(),
            counts: vec![0; piece_count],
        }
    }

    /// Registers a newly connected peer's bitfield (or an empty one if it
    /// hasn't sent one yet), incrementing counts for every piece it has.
    pub fn add_peer(&mut self, peer: usize, bitfield: Bitfield) {
        for i in bitfield.iter_ones() {
            if let Some(c) = self.counts.get_mut(i) {
                *c += 1;
            }
        }
        self.per_peer.insert(peer, bitfield);
    }

    /// Registers a single `have` announcement from a peer we're already
    /// tracking.
    pub fn add_have(&mut self, peer: usize, index: PieceIndex) {
        let bitfield = self
            .per_peer
            .entry(peer)
            .or_insert_with(|| Bitfield::allocate(self.piece_count));
        if !bitfield.test(index) {
            let _ = bitfield.set(index);
            if let Some(c) = self.counts.get_mut(index) {
                *c += 1;
            }
        }
    }

    /// Removes a disconnected peer, decrementing counts for every piece it
    /// had.
    pub fn remove_peer(&mut self, peer: usize) {
        if let Some(bitfield) = self.per_peer.remove(&peer) {
            for i in bitfield.iter_ones() {
                if let Some(c) = self.counts.get_mut(i) {
                    *c = c.saturating_sub(1);
                }
            }
        }
    }

    pub fn peer_bitfield(&self, peer: usize) -> Option<&Bitfield> {
        self.per_peer.get(&peer)
    }

    pub fn count(&self, index: PieceIndex) -> usize {
        self.counts.get(index).copied().unwrap_or(0)
    }

    /// Returns all pieces with availability > 0, excluding those in
    /// `exclude`, sorted by `(count ascending, index ascending)`
    /// (spec.md §3).
    pub fn rarest_pieces(&self, exclude: &std::collections::HashSet<PieceIndex>) -> Vec<PieceIndex> {
        let mut pieces: Vec<PieceIndex> = self
            .counts
            .iter()
            .enumerate()
            .filter(|(i, &count)| count > 0 && !exclude.contains(i))
            .map(|(i, _)| i)
            .collect();
        pieces.sort_by_key(|&i| (self.counts[i], i));
        pieces
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn rarest_pieces_sorted_by_count_then_index() {
        let mut avail = PieceAvailability::new(4);
        // availability [3,1,2,1] per spec.md §8 seed values
        let mut bf0 = Bitfield::allocate(4);
        for i in 0..4 {
            bf0.set(i).unwrap();
        }
        avail.add_peer(0, bf0.clone());
        avail.add_peer(1, bf0.clone());
        avail.add_peer(2, bf0);
        let mut bf_one_two = Bitfield::allocate(4);
        bf_one_two.set(0).unwrap();
        bf_one_two.set(2).unwrap();
        avail.add_peer(3, bf_one_two);

        assert_eq!(avail.count(0), 4);
        assert_eq!(avail.count(1), 3);
        assert_eq!(avail.count(2), 4);
        assert_eq!(avail.count(3), 3);

        let order = avail.rarest_pieces(&HashSet::new());
        // pieces 1 and 3 tie at count 3, sorted by index next: 1 before 3
        assert_eq!(order, vec![1, 3, 0, 2]);
    }

    #[test]
    fn remove_peer_decrements_counts() {
        let mut avail = PieceAvailability::new(2);
        let mut bf = Bitfield::allocate(2);
        bf.set(0).unwrap();
        avail.add_peer(7, bf);
        assert_eq!(avail.count(0), 1);
        avail.remove_peer(7);
        assert_eq!(avail.count(0), 0);
    }
}
