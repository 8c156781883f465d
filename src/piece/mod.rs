//! Piece and block level data model: bitfields, per-piece block state,
//! availability/rarity tracking and piece selection (spec.md §3, §4.4).

pub mod availability;
pub mod bitfield;
pub mod download;
pub mod piece_map;
pub mod selector;

pub use availability::PieceAvailability;
pub use bitfield::Bitfield;
pub use download::PieceDownload;
pub use piece_map::{BlockState, PieceState, TorrentPieceMap};
pub use selector::{PieceSelector, SelectStrategy};
