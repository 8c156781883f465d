//! Helpers for splitting a piece's non-contiguous block buffers into the
//! vectored I/O slices `nix`'s `pwritev`/`preadv` expect, without copying the
//! underlying bytes, even when a piece's write buffer spans more than one
//! file on disk.

use nix::sys::uio::IoVec as NixIoVec;

/// A single vectored I/O buffer: a borrowed, contiguous byte slice.
pub(crate) type IoVec<'a> = NixIoVec<&'a [u8]>;

/// An ordered, splittable list of [`IoVec`]s representing a piece's blocks.
///
/// Blocks are appended to a piece's write buffer in arbitrary order, so by
/// the time a piece is complete its blocks may not be physically adjacent in
/// memory; `IoVecs` lets the disk writer hand the whole list to a single
/// vectored write/read syscall instead of copying everything into one
/// contiguous buffer first.
pub(crate) struct IoVecs<'a> {
    bufs: Vec<IoVec<'a>>,
}

impl<'a> IoVecs<'a> {
    pub fn new(bufs: Vec<IoVec<'a>>) -> Self {
        Self { bufs }
    }

    pub fn is_empty(&self) -> bool {
        self.bufs.is_empty()
    }

    pub fn total_len(&self) -> usize {
        self.bufs.iter().map(|b| b.as_slice().len()).sum()
    }

    /// Returns the current buffer list, ready to be passed to `pwritev` or
    /// `preadv`.
    pub fn buffers(&self) -> &[IoVec<'a>] {
        &self.bufs
    }

    /// Takes ownership of up to `limit` bytes' worth of buffers from the
    /// front, splitting the final one if it straddles the boundary, and
    /// leaves the rest in `self` for the next file the piece overlaps with.
    pub fn take_bounded(&mut self, limit: u64) -> IoVecs<'a> {
        let mut remaining = limit;
        let mut window = Vec::new();
        while remaining > 0 && !self.bufs.is_empty() {
            let slice = self.bufs[0].as_slice();
            let slice_len = slice.len() as u64;
            if slice_len <= remaining {
                remaining -= slice_len;
                window.push(self.bufs.remove(0));
            } else {
                let at = remaining as usize;
                window.push(IoVec::from_slice(&slice[..at]));
                self.bufs[0] = IoVec::from_slice(&slice[at..]);
                remaining = 0;
            }
        }
        IoVecs::new(window)
    }

    /// Drops `n` bytes from the front, across as many buffers as necessary.
    /// Used after a partial vectored write/read to advance past the bytes
    /// the kernel already accepted.
    pub fn advance(&mut self, mut n: usize) {
        while n > 0 && !self.bufs.is_empty() {
            let len = self.bufs[0].as_slice().len();
            if n >= len {
                n -= len;
                self.bufs.remove(0);
            } else {
                let rest = &self.bufs[0].as_slice()[n..];
                self.bufs[0] = IoVec::from_slice(rest);
                n = 0;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn take_bounded_splits_across_buffers() {
        let a = vec![1u8; 10];
        let b = vec![2u8; 10];
        let bufs = vec![IoVec::from_slice(&a), IoVec::from_slice(&b)];
        let mut iovecs = IoVecs::new(bufs);

        let first_file = iovecs.take_bounded(15);
        assert_eq!(first_file.total_len(), 15);
        assert_eq!(iovecs.total_len(), 5);

        let second_file = iovecs.take_bounded(5);
        assert_eq!(second_file.total_len(), 5);
        assert!(iovecs.is_empty());
    }

    #[test]
    fn advance_consumes_whole_and_partial_buffers() {
        let a = vec![1u8; 4];
        let b = vec![2u8; 4];
        let mut iovecs = IoVecs::new(vec![IoVec::from_slice(&a), IoVec::from_slice(&b)]);
        iovecs.advance(6);
        assert_eq!(iovecs.total_len(), 2);
        iovecs.advance(2);
        assert!(iovecs.is_empty());
    }
}
