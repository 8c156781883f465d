//! Piece verification: SHA-1 of a piece's payload against its expected hash
//! (spec.md §4.3).

use crate::{error::Error, metainfo::TorrentMetadata, PieceIndex, Result};
use sha1::{Digest, Sha1};

fn expected_hash(metadata: &TorrentMetadata, index: PieceIndex) -> Result<&[u8]> {
    let start = index * 20;
    let end = start + 20;
    metadata
        .piece_hashes
        .get(start..end)
        .ok_or(Error::InvalidPieceIndex(index))
}

/// Synchronously hashes `data` and compares it against the expected hash for
/// piece `index`.
pub fn verify(metadata: &TorrentMetadata, index: PieceIndex, data: &[u8]) -> Result<bool> {
    let expected = expected_hash(metadata, index)?;
    let digest = Sha1::digest(data);
    Ok(digest.as_slice() == expected)
}

/// Same as [`verify`], but yields to the executor before hashing so that a
/// tight verification loop (e.g. initial torrent checking) doesn't starve
/// other tasks (spec.md §5 suspension points).
pub async fn verify_async(
    metadata: &TorrentMetadata,
    index: PieceIndex,
    data: &[u8],
) -> Result<bool> {
    tokio::task::yield_now().await;
    verify(metadata, index, data)
}

/// Verifies a batch of (index, data) pairs, yielding between each. An
/// out-of-range index is a fatal error for the whole batch, per spec.md
/// §4.3.
pub async fn verify_batch(
    metadata: &TorrentMetadata,
    pieces: &[(PieceIndex, Vec<u8>)],
) -> Result<Vec<bool>> {
    let mut results = Vec::with_capacity(pieces.len());
    for (index, data) in pieces {
        results.push(verify_async(metadata, *index, data).await?);
    }
    Ok(results)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bencode::{self, build, Value};
    use std::collections::BTreeMap;

    fn metadata_with_piece(piece: &[u8], piece_len: u32) -> TorrentMetadata {
        let digest = Sha1::digest(piece);
        let mut info = BTreeMap::new();
        info.insert(b"name".to_vec(), build::bytestring("x"));
        info.insert(b"piece length".to_vec(), Value::Integer(piece_len as i64));
        info.insert(b"pieces".to_vec(), Value::ByteString(digest.to_vec()));
        info.insert(b"length".to_vec(), Value::Integer(piece.len() as i64));
        let mut top = BTreeMap::new();
        top.insert(b"info".to_vec(), Value::Dict(info));
        let bytes = bencode::encode(&Value::Dict(top));
        TorrentMetadata::from_bytes(&bytes).unwrap()
    }

    #[test]
    fn verify_accepts_matching_piece() {
        let piece = vec![7u8; 32];
        let metadata = metadata_with_piece(&piece, 32);
        assert!(verify(&metadata, 0, &piece).unwrap());
    }

    #[test]
    fn verify_rejects_corrupted_piece() {
        let piece = vec![7u8; 32];
        let metadata = metadata_with_piece(&piece, 32);
        let mut corrupted = piece.clone();
        corrupted[0] ^= 1;
        assert!(!verify(&metadata, 0, &corrupted).unwrap());
    }

    #[test]
    fn verify_out_of_range_index_is_error() {
        let piece = vec![7u8; 32];
        let metadata = metadata_with_piece(&piece, 32);
        assert!(verify(&metadata, 5, &piece).is_err());
    }

    #[tokio::test]
    async fn verify_batch_reports_each_piece() {
        let piece = vec![1u8; 16];
        let metadata = metadata_with_piece(&piece, 16);
        let mut bad = piece.clone();
        bad[0] ^= 0xff;
        let results = verify_batch(&metadata, &[(0, piece), (0, bad)]).await.unwrap();
        assert_eq!(results, vec![true, false]);
    }
}
