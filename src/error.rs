//! The engine's unified error type.
//!
//! Every fallible operation in the crate returns [`Result`], whose error
//! variant is [`Error`]. The variants correspond to the error kinds listed in
//! the design document: some are local to a single peer or tracker and don't
//! bring down the owning torrent session, others are fatal to the session,
//! and a few (`Cancelled`, `Timeout`) are structural and may appear anywhere
//! a suspension point exists.

use crate::{PeerId, PieceIndex, TorrentId};
use std::path::PathBuf;

/// The crate-wide result type.
pub type Result<T, E = Error> = std::result::Result<T, E>;

#[derive(thiserror::Error, Debug)]
pub enum Error {
    /// The `.torrent` file or magnet link could not be parsed, or violates an
    /// invariant in spec.md §3 (e.g. non-multiple-of-20 piece hashes, path
    /// traversal, duplicate `files`/`length` keys).
    #[error("invalid torrent metadata: {0}")]
    Metadata(String),

    /// A tracker announce failed. Local to the offending tracker URL; the
    /// session degrades only once every tier has failed.
    #[error("tracker error ({url}): {msg}")]
    Tracker { url: String, msg: String },

    /// A peer violated the wire protocol or failed in a way that's local to
    /// that one connection.
    #[error("peer {peer_id:?} error: {msg}")]
    Peer { peer_id: Option<PeerId>, msg: String },

    /// A disk IO error that isn't `ENOSPC`. Fatal to the owning session.
    #[error("disk error at {path:?}: {msg}")]
    Disk { path: PathBuf, msg: String },

    /// The disk ran out of space. Recoverable: writes queue up until
    /// `spaceAvailable` fires.
    #[error("disk full: need {required} bytes, {available} available")]
    DiskFull { required: u64, available: u64 },

    /// A generic networking failure (connect, read, write) not otherwise
    /// classified as a protocol violation.
    #[error("network error: {0}")]
    Network(String),

    /// A BitTorrent wire protocol violation (bad handshake, malformed
    /// message, bitfield sent out of turn, oversized request, etc).
    #[error("protocol violation: {0}")]
    Protocol(String),

    /// An illegal session state transition was attempted.
    #[error("illegal state transition for torrent {id}: {msg}")]
    State { id: TorrentId, msg: String },

    /// The operation was cancelled by its owner before completing.
    #[error("operation cancelled")]
    Cancelled,

    /// The operation did not complete within its deadline.
    #[error("operation timed out")]
    Timeout,

    /// A piece index was referenced that doesn't exist in the torrent.
    #[error("invalid piece index: {0}")]
    InvalidPieceIndex(PieceIndex),

    /// A torrent id was referenced that the engine doesn't know about.
    #[error("invalid torrent id: {0}")]
    InvalidTorrentId(TorrentId),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error("malformed URL: {0}")]
    Url(#[from] url::ParseError),

    #[error("channel closed")]
    ChannelClosed,
}

impl<T> From<tokio::sync::mpsc::error::SendError<T>> for Error {
    fn from(_: tokio::sync::mpsc::error::SendError<T>) -> Self {
        Error::ChannelClosed
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn disk_full_reports_counts() {
        let e = Error::DiskFull {
            required: 100,
            available: 10,
        };
        assert!(e.to_string().contains("100"));
        assert!(e.to_string().contains("10"));
    }
}
