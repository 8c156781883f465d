//! Parses `.torrent` files (BEP 3) and magnet URIs into [`TorrentMetadata`].

use crate::{
    bencode::{self, Value},
    error::Error,
    storage_info::FileInfo,
    Result, Sha1Hash,
};
use sha1::{Digest, Sha1};
use std::path::{Component, Path, PathBuf};

/// An immutable, fully parsed torrent descriptor (spec.md §3).
#[derive(Debug, Clone)]
pub struct TorrentMetadata {
    pub info_hash: Sha1Hash,
    pub name: String,
    pub piece_len: u32,
    pub piece_count: usize,
    /// Concatenated SHA-1 hashes of all pieces, `20 * piece_count` bytes.
    pub piece_hashes: Vec<u8>,
    pub files: Vec<FileInfo>,
    /// True if this torrent was described via the multi-file `files` key,
    /// even if that list happens to contain a single entry. Distinguishes
    /// "single logical file in the download dir" from "archive named after
    /// the torrent, containing one file" (spec.md §3/§4.2).
    pub is_multi_file: bool,
    pub total_len: u64,
    pub is_private: bool,
    pub announce: Option<String>,
    pub announce_list: Option<Vec<Vec<String>>>,
    pub creation_date: Option<i64>,
    pub created_by: Option<String>,
    pub comment: Option<String>,
    /// The raw, canonical bencoding of the `info` dict, retained to
    /// reproduce `info_hash` and to re-serve the value verbatim if needed.
    pub raw_info: Vec<u8>,
}

impl TorrentMetadata {
    /// Parses a `.torrent` file's raw bytes.
    pub fn from_bytes(buf: &[u8]) -> Result<Self> {
        let top = bencode::decode(buf)
            .map_err(|e| Error::Metadata(format!("bencode decode error: {}", e)))?;
        let top = top
            .as_dict()
            .ok_or_else(|| Error::Metadata("top-level value is not a dict".into()))?;

        let info_value = top
            .get(&b"info"[..])
            .ok_or_else(|| Error::Metadata("missing required key 'info'".into()))?;
        let info_dict = info_value
            .as_dict()
            .ok_or_else(|| Error::Metadata("'info' is not a dict".into()))?;

        let raw_info = bencode::encode(info_value);
        let info_hash = {
            let digest = Sha1::digest(&raw_info);
            let mut h = [0u8; 20];
            h.copy_from_slice(&digest);
            h
        };

        let name = info_dict
            .get(&b"name"[..])
            .and_then(Value::as_str)
            .ok_or_else(|| Error::Metadata("'info.name' missing or not a string".into()))?
            .to_owned();

        let piece_len = info_dict
            .get(&b"piece length"[..])
            .and_then(Value::as_int)
            .ok_or_else(|| Error::Metadata("'info.piece length' missing".into()))?;
        if piece_len <= 0 {
            return Err(Error::Metadata("piece length must be positive".into()));
        }
        let piece_len = piece_len as u32;

        let piece_hashes = info_dict
            .get(&b"pieces"[..])
            .and_then(Value::as_bytes)
            .ok_or_else(|| Error::Metadata("'info.pieces' missing".into()))?
            .to_vec();
        if piece_hashes.len() % 20 != 0 {
            return Err(Error::Metadata(
                "'info.pieces' length is not a multiple of 20".into(),
            ));
        }

        let length = info_dict.get(&b"length"[..]).and_then(Value::as_int);
        let files_list = info_dict.get(&b"files"[..]).and_then(Value::as_list);

        let is_multi_file = files_list.is_some();
        let files = match (length, files_list) {
            (Some(_), Some(_)) => {
                return Err(Error::Metadata(
                    "torrent has both 'length' and 'files'".into(),
                ));
            }
            (None, None) => {
                return Err(Error::Metadata(
                    "torrent has neither 'length' nor 'files'".into(),
                ));
            }
            (Some(len), None) => {
                if len < 0 {
                    return Err(Error::Metadata("negative file length".into()));
                }
                vec![FileInfo {
                    path: PathBuf::from(&name),
                    len: len as u64,
                    torrent_offset: 0,
                }]
            }
            (None, Some(list)) => {
                let mut files = Vec::with_capacity(list.len());
                let mut offset = 0u64;
                for entry in list {
                    let entry = entry
                        .as_dict()
                        .ok_or_else(|| Error::Metadata("file entry is not a dict".into()))?;
                    let len = entry
                        .get(&b"length"[..])
                        .and_then(Value::as_int)
                        .ok_or_else(|| Error::Metadata("file entry missing 'length'".into()))?;
                    if len < 0 {
                        return Err(Error::Metadata("negative file length".into()));
                    }
                    let path_parts = entry
                        .get(&b"path"[..])
                        .and_then(Value::as_list)
                        .ok_or_else(|| Error::Metadata("file entry missing 'path'".into()))?;
                    let mut path = PathBuf::new();
                    for part in path_parts {
                        let part = part
                            .as_str()
                            .ok_or_else(|| Error::Metadata("path component not a string".into()))?;
                        validate_path_component(part)?;
                        path.push(part);
                    }
                    files.push(FileInfo {
                        path,
                        len: len as u64,
                        torrent_offset: offset,
                    });
                    offset += len as u64;
                }
                files
            }
        };

        let total_len: u64 = files.iter().map(|f| f.len).sum();
        let piece_count = ((total_len + piece_len as u64 - 1) / piece_len as u64).max(1) as usize;
        if piece_hashes.len() != 20 * piece_count {
            return Err(Error::Metadata(format!(
                "piece hash count mismatch: expected {} pieces ({} bytes), got {} bytes",
                piece_count,
                20 * piece_count,
                piece_hashes.len()
            )));
        }

        let is_private = info_dict
            .get(&b"private"[..])
            .and_then(Value::as_int)
            .map(|v| v != 0)
            .unwrap_or(false);

        let announce = top.get(&b"announce"[..]).and_then(Value::as_str).map(str::to_owned);
        let announce_list = top.get(&b"announce-list"[..]).and_then(Value::as_list).map(|tiers| {
            tiers
                .iter()
                .filter_map(Value::as_list)
                .map(|tier| {
                    tier.iter()
                        .filter_map(Value::as_str)
                        .map(str::to_owned)
                        .collect()
                })
                .collect()
        });
        let creation_date = top.get(&b"creation date"[..]).and_then(Value::as_int);
        let created_by = top.get(&b"created by"[..]).and_then(Value::as_str).map(str::to_owned);
        let comment = top.get(&b"comment"[..]).and_then(Value::as_str).map(str::to_owned);

        Ok(Self {
            info_hash,
            name,
            piece_len,
            piece_count,
            piece_hashes,
            files,
            is_multi_file,
            total_len,
            is_private,
            announce,
            announce_list,
            creation_date,
            created_by,
            comment,
            raw_info,
        })
    }

    pub fn info_hash_hex(&self) -> String {
        hex::encode(self.info_hash)
    }
}

/// Rejects path segments that are empty, `.`, or `..`, to prevent a
/// malicious torrent from writing outside the download directory.
fn validate_path_component(part: &str) -> Result<()> {
    if part.is_empty() {
        return Err(Error::Metadata("empty path component".into()));
    }
    let path = Path::new(part);
    for component in path.components() {
        match component {
            Component::Normal(_) => {}
            _ => {
                return Err(Error::Metadata(format!(
                    "unsafe path component: {:?}",
                    part
                )))
            }
        }
    }
    Ok(())
}

/// A magnet URI's decoded fields (spec.md §4.2).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MagnetLink {
    pub info_hash: Sha1Hash,
    pub display_name: Option<String>,
    pub trackers: Vec<String>,
    pub web_seeds: Vec<String>,
    pub exact_source: Option<String>,
}

/// Parses a `magnet:?xt=urn:btih:...` URI.
pub fn parse_magnet(uri: &str) -> Result<MagnetLink> {
    let url = url::Url::parse(uri).map_err(Error::Url)?;
    if url.scheme() != "magnet" {
        return Err(Error::Metadata("not a magnet URI".into()));
    }

    let mut info_hash = None;
    let mut display_name = None;
    let mut trackers = Vec::new();
    let mut web_seeds = Vec::new();
    let mut exact_source = None;

    for (key, value) in url.query_pairs() {
        match key.as_ref() {
            "xt" => {
                let value = value.strip_prefix("urn:btih:").ok_or_else(|| {
                    Error::Metadata("unsupported 'xt' namespace in magnet URI".into())
                })?;
                info_hash = Some(decode_btih(value)?);
            }
            "dn" => display_name = Some(value.into_owned()),
            "tr" => trackers.push(value.into_owned()),
            "ws" => web_seeds.push(value.into_owned()),
            "xs" => exact_source = Some(value.into_owned()),
            _ => {}
        }
    }

    let info_hash = info_hash.ok_or_else(|| Error::Metadata("magnet URI missing 'xt'".into()))?;
    Ok(MagnetLink {
        info_hash,
        display_name,
        trackers,
        web_seeds,
        exact_source,
    })
}

/// Decodes a 40-char hex or 32-char base32 BitTorrent info-hash string.
fn decode_btih(s: &str) -> Result<Sha1Hash> {
    let bytes = if s.len() == 40 {
        hex::decode(s).map_err(|_| Error::Metadata("invalid hex info-hash".into()))?
    } else if s.len() == 32 {
        base32_decode(s).ok_or_else(|| Error::Metadata("invalid base32 info-hash".into()))?
    } else {
        return Err(Error::Metadata(format!(
            "info-hash must be 40 hex or 32 base32 chars, got {}",
            s.len()
        )));
    };
    if bytes.len() != 20 {
        return Err(Error::Metadata("decoded info-hash is not 20 bytes".into()));
    }
    let mut out = [0u8; 20];
    out.copy_from_slice(&bytes);
    Ok(out)
}

/// Minimal RFC 4648 base32 decoder (no padding), sufficient for BEP 9/44
/// style 32-character info-hash encodings.
fn base32_decode(s: &str) -> Option<Vec<u8>> {
    const ALPHABET: &[u8] = b"ABCDEFGHIJKLMNOPQRSTUVWXYZ234567";
    let mut bits: u64 = 0;
    let mut bit_count = 0;
    let mut out = Vec::new();
    for c in s.to_ascii_uppercase().bytes() {
        let val = ALPHABET.iter().position(|&b| b == c)? as u64;
        bits = (bits << 5) | val;
        bit_count += 5;
        if bit_count >= 8 {
            bit_count -= 8;
            out.push((bits >> bit_count) as u8);
        }
    }
    Some(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bencode::build;
    use std::collections::BTreeMap;

    fn sample_bytes(piece_len: i64, total_len: i64) -> Vec<u8> {
        let piece_count = ((total_len + piece_len - 1) / piece_len).max(1) as usize;
        let pieces = vec![0u8; 20 * piece_count];
        let mut info = BTreeMap::new();
        info.insert(b"name".to_vec(), build::bytestring("test.bin"));
        info.insert(b"piece length".to_vec(), Value::Integer(piece_len));
        info.insert(b"pieces".to_vec(), Value::ByteString(pieces));
        info.insert(b"length".to_vec(), Value::Integer(total_len));
        let mut top = BTreeMap::new();
        top.insert(b"info".to_vec(), Value::Dict(info));
        top.insert(
            b"announce".to_vec(),
            build::bytestring("http://tracker.example/announce"),
        );
        bencode::encode(&Value::Dict(top))
    }

    #[test]
    fn parses_single_file_torrent() {
        let bytes = sample_bytes(1000, 1500);
        let meta = TorrentMetadata::from_bytes(&bytes).unwrap();
        assert_eq!(meta.piece_count, 2);
        assert_eq!(meta.total_len, 1500);
        assert_eq!(meta.files.len(), 1);
        assert_eq!(meta.announce.as_deref(), Some("http://tracker.example/announce"));
    }

    #[test]
    fn rejects_path_traversal() {
        let mut info = BTreeMap::new();
        info.insert(b"name".to_vec(), build::bytestring("archive"));
        info.insert(b"piece length".to_vec(), Value::Integer(16));
        info.insert(b"pieces".to_vec(), Value::ByteString(vec![0u8; 20]));
        info.insert(
            b"files".to_vec(),
            Value::List(vec![Value::Dict({
                let mut m = BTreeMap::new();
                m.insert(b"length".to_vec(), Value::Integer(10));
                m.insert(
                    b"path".to_vec(),
                    Value::List(vec![build::bytestring(".."), build::bytestring("evil")]),
                );
                m
            })]),
        );
        let mut top = BTreeMap::new();
        top.insert(b"info".to_vec(), Value::Dict(info));
        let bytes = bencode::encode(&Value::Dict(top));
        assert!(TorrentMetadata::from_bytes(&bytes).is_err());
    }

    #[test]
    fn parses_magnet_with_hex_hash() {
        let uri = "magnet:?xt=urn:btih:dd8255ecdc7ca55fb0bbf81323d87062db1f6d1c&dn=Big+Buck+Bunny";
        let magnet = parse_magnet(uri).unwrap();
        assert_eq!(hex::encode(magnet.info_hash), "dd8255ecdc7ca55fb0bbf81323d87062db1f6d1c");
        assert_eq!(magnet.display_name.as_deref(), Some("Big Buck Bunny"));
    }

    #[test]
    fn rejects_both_length_and_files() {
        let mut info = BTreeMap::new();
        info.insert(b"name".to_vec(), build::bytestring("x"));
        info.insert(b"piece length".to_vec(), Value::Integer(16));
        info.insert(b"pieces".to_vec(), Value::ByteString(vec![0u8; 20]));
        info.insert(b"length".to_vec(), Value::Integer(16));
        info.insert(b"files".to_vec(), Value::List(vec![]));
        let mut top = BTreeMap::new();
        top.insert(b"info".to_vec(), Value::Dict(info));
        let bytes = bencode::encode(&Value::Dict(top));
        assert!(TorrentMetadata::from_bytes(&bytes).is_err());
    }
}
