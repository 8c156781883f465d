//! Chooses which piece(s) to request next (spec.md §4.4).

use super::{availability::PieceAvailability, bitfield::Bitfield};
use crate::PieceIndex;
use rand::seq::SliceRandom;
use std::collections::HashSet;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SelectStrategy {
    RarestFirst,
    Sequential,
    Random,
}

pub struct PieceSelector {
    pub availability: PieceAvailability,
    pub strategy: SelectStrategy,
    /// Below this many missing pieces, the session enters endgame: request
    /// all remaining pieces from every capable peer (spec.md §4.4).
    pub endgame_threshold: usize,
}

impl PieceSelector {
    pub fn new(piece_count: usize, strategy: SelectStrategy, endgame_threshold: usize) -> Self {
        Self {
            availability: PieceAvailability::new(piece_count),
            strategy,
            endgame_threshold,
        }
    }

    /// Chooses from `{i : !own[i] && peer[i] && i not in in_progress}`
    /// according to `self.strategy`. Returns `None` iff that set is empty.
    pub fn select_piece(
        &self,
        own: &Bitfield,
        peer: &Bitfield,
        in_progress: &HashSet<PieceIndex>,
    ) -> Option<PieceIndex> {
        let feasible: Vec<PieceIndex> = (0..own.len().max(peer.len()))
            .filter(|&i| !own.test(i) && peer.test(i) && !in_progress.contains(&i))
            .collect();
        if feasible.is_empty() {
            return None;
        }
        match self.strategy {
            SelectStrategy::Sequential => feasible.into_iter().min(),
            SelectStrategy::Random => feasible.choose(&mut rand::thread_rng()).copied(),
            SelectStrategy::RarestFirst => feasible
                .into_iter()
                .min_by_key(|&i| (self.availability.count(i), i)),
        }
    }

    /// Extends `in_progress` locally so repeated picks don't return
    /// duplicates, returning up to `count` indices without mutating the
    /// caller's set (spec.md §4.4).
    pub fn select_pieces(
        &self,
        own: &Bitfield,
        peer: &Bitfield,
        in_progress: &HashSet<PieceIndex>,
        count: usize,
    ) -> Vec<PieceIndex> {
        let mut picked = Vec::with_capacity(count);
        let mut excluded = in_progress.clone();
        for _ in 0..count {
            match self.select_piece(own, peer, &excluded) {
                Some(i) => {
                    excluded.insert(i);
                    picked.push(i);
                }
                None => break,
            }
        }
        picked
    }

    /// True if the torrent should enter endgame mode given the number of
    /// pieces still missing.
    pub fn is_endgame(&self, missing_count: usize) -> bool {
        missing_count > 0 && missing_count < self.endgame_threshold
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn bf_all(n: usize) -> Bitfield {
        let mut bf = Bitfield::allocate(n);
        for i in 0..n {
            bf.set(i).unwrap();
        }
        bf
    }

    #[test]
    fn rarest_first_matches_seed_scenario() {
        // availability [3,1,2,1]; own=empty; peer=all; inProgress=empty
        let mut selector =
            PieceSelector::new(4, SelectStrategy::RarestFirst, 0);
        // fabricate availability counts via distinct fake peers
        let peer_bitfields: Vec<Bitfield> = vec![
            { let mut b = Bitfield::allocate(4); for i in [0,1,2] { b.set(i).unwrap(); } b },
            { let mut b = Bitfield::allocate(4); b.set(0).unwrap(); b },
            { let mut b = Bitfield::allocate(4); for i in [0,2,3] { b.set(i).unwrap(); } b },
        ];
        for (id, bf) in peer_bitfields.into_iter().enumerate() {
            selector.availability.add_peer(id, bf);
        }
        assert_eq!(selector.availability.count(0), 3);
        assert_eq!(selector.availability.count(1), 1);
        assert_eq!(selector.availability.count(2), 2);
        assert_eq!(selector.availability.count(3), 1);

        let own = Bitfield::allocate(4);
        let peer = bf_all(4);
        let mut in_progress = HashSet::new();
        let first = selector.select_piece(&own, &peer, &in_progress).unwrap();
        assert_eq!(first, 1);

        in_progress.insert(first);
        let second = selector.select_piece(&own, &peer, &in_progress).unwrap();
        assert_eq!(second, 3);
    }

    #[test]
    fn returns_none_when_feasible_set_empty() {
        let selector = PieceSelector::new(2, SelectStrategy::RarestFirst, 0);
        let own = bf_all(2);
        let peer = bf_all(2);
        assert!(selector.select_piece(&own, &peer, &HashSet::new()).is_none());
    }

    #[test]
    fn sequential_picks_minimum_index() {
        let selector = PieceSelector::new(4, SelectStrategy::Sequential, 0);
        let own = Bitfield::allocate(4);
        let peer = bf_all(4);
        assert_eq!(selector.select_piece(&own, &peer, &HashSet::new()), Some(0));
    }

    #[test]
    fn select_pieces_does_not_mutate_callers_set_and_has_no_duplicates() {
        let mut selector = PieceSelector::new(4, SelectStrategy::Sequential, 0);
        selector.availability.add_peer(0, bf_all(4));
        let own = Bitfield::allocate(4);
        let peer = bf_all(4);
        let in_progress = HashSet::new();
        let picked = selector.select_pieces(&own, &peer, &in_progress, 3);
        assert_eq!(picked, vec![0, 1, 2]);
        assert!(in_progress.is_empty());
    }

    #[test]
    fn endgame_threshold() {
        let selector = PieceSelector::new(100, SelectStrategy::RarestFirst, 10);
        assert!(!selector.is_endgame(0));
        assert!(!selector.is_endgame(50));
        assert!(selector.is_endgame(5));
    }
}
