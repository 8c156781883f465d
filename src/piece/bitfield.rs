//! A compact bit vector representing piece availability (spec.md §3).
//!
//! Bit `i` is the high bit of byte `i / 8`, shifted right by `i % 8`: the
//! first piece is the most significant bit of the first byte. This matches
//! the wire representation of the `bitfield` message (spec.md §4.5).

use crate::{error::Error, Result};
use bitvec::prelude::{bitvec, BitVec, Msb0};

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Bitfield(BitVec<Msb0, u8>);

impl Bitfield {
    /// Allocates a bitfield with `len` bits, all clear.
    pub fn allocate(len: usize) -> Self {
        Self(bitvec![Msb0, u8; 0; len])
    }

    /// Builds a bitfield from the raw wire bytes, one bit per byte-boundary
    /// position. The caller doesn't generally know the torrent's logical
    /// piece count yet at this point (e.g. the codec decodes a message
    /// before any session has matched it to a torrent), so this keeps the
    /// full byte-aligned length; use [`Bitfield::into_truncated`] once the
    /// real piece count is known.
    pub fn from_wire_bytes(bytes: &[u8]) -> Self {
        Self(BitVec::from_slice(bytes))
    }

    /// Truncates a wire-decoded bitfield to `piece_count` logical bits,
    /// rejecting a set pad bit past that point as a protocol violation
    /// (spec.md §4.5: trailing pad bits must be zero).
    pub fn into_truncated(self, piece_count: usize) -> Result<Self> {
        let mut bits = self.0;
        for i in piece_count..bits.len() {
            if bits.get(i).map(|b| *b).unwrap_or(false) {
                return Err(Error::Protocol("bitfield pad bits must be zero".into()));
            }
        }
        bits.resize(piece_count, false);
        Ok(Self(bits))
    }

    /// Returns the wire representation: `ceil(len / 8)` bytes, padded with
    /// zero bits.
    pub fn to_wire_bytes(&self) -> Vec<u8> {
        let mut bits = self.0.clone();
        let padded_len = (bits.len() + 7) / 8 * 8;
        bits.resize(padded_len, false);
        bits.into_vec()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Returns whether bit `i` is set. Out-of-range reads return `false`
    /// (spec.md §3).
    pub fn test(&self, i: usize) -> bool {
        self.0.get(i).map(|b| *b).unwrap_or(false)
    }

    /// Sets bit `i`. Out-of-range writes are an error (spec.md §3).
    pub fn set(&mut self, i: usize) -> Result<()> {
        self.0
            .get_mut(i)
            .map(|mut b| *b = true)
            .ok_or(Error::InvalidPieceIndex(i))
    }

    /// Clears bit `i`. Out-of-range writes are an error (spec.md §3).
    pub fn clear(&mut self, i: usize) -> Result<()> {
        self.0
            .get_mut(i)
            .map(|mut b| *b = false)
            .ok_or(Error::InvalidPieceIndex(i))
    }

    /// The number of set bits.
    pub fn count_ones(&self) -> usize {
        self.0.count_ones()
    }

    /// True if every bit is set (a seed's bitfield).
    pub fn is_all_set(&self) -> bool {
        self.0.all()
    }

    pub fn iter_ones(&self) -> impl Iterator<Item = usize> + '_ {
        self.0.iter().enumerate().filter_map(|(i, b)| if *b { Some(i) } else { None })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn set_then_clear_equals_set() {
        let mut a = Bitfield::allocate(8);
        a.set(3).unwrap();
        let mut b = a.clone();
        b.clear(3).unwrap();
        b.set(3).unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn popcount_matches_set_bit_count() {
        let mut bf = Bitfield::allocate(10);
        for i in [0, 2, 9] {
            bf.set(i).unwrap();
        }
        assert_eq!(bf.count_ones(), 3);
        let manual = (0..10).filter(|&i| bf.test(i)).count();
        assert_eq!(bf.count_ones(), manual);
    }

    #[test]
    fn out_of_range_test_is_false() {
        let bf = Bitfield::allocate(4);
        assert!(!bf.test(100));
    }

    #[test]
    fn out_of_range_set_is_error() {
        let mut bf = Bitfield::allocate(4);
        assert!(bf.set(100).is_err());
    }

    #[test]
    fn wire_round_trip_preserves_logical_bits() {
        let mut bf = Bitfield::allocate(10);
        bf.set(0).unwrap();
        bf.set(7).unwrap();
        bf.set(9).unwrap();
        let wire = bf.to_wire_bytes();
        assert_eq!(wire.len(), 2);
        let back = Bitfield::from_wire_bytes(&wire).into_truncated(10).unwrap();
        assert_eq!(bf, back);
    }

    #[test]
    fn wire_have_example() {
        // `0b1100_0001` would mean pieces 0, 1, and 7 are present.
        let bf = Bitfield::from_wire_bytes(&[0b1100_0001]).into_truncated(8).unwrap();
        assert!(bf.test(0));
        assert!(bf.test(1));
        assert!(bf.test(7));
        assert!(!bf.test(2));
    }

    #[test]
    fn into_truncated_rejects_nonzero_pad_bits() {
        // piece_count 5 leaves bits 5..8 as wire padding; bit 6 is set here.
        let bf = Bitfield::from_wire_bytes(&[0b0000_0010]);
        assert!(bf.into_truncated(5).is_err());
    }

    #[test]
    fn into_truncated_accepts_zero_pad_bits() {
        let bf = Bitfield::from_wire_bytes(&[0b1000_0000]);
        let truncated = bf.into_truncated(5).unwrap();
        assert_eq!(truncated.len(), 5);
        assert!(truncated.test(0));
    }
}
