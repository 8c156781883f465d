//! File-level I/O: opens a torrent's files according to its [`StorageInfo`],
//! and reads/writes pieces and blocks across however many files they
//! overlap using vectored I/O (spec.md §4.9).

use std::{
    collections::BTreeMap,
    fs::{self, File, OpenOptions},
    ops::Range,
    os::unix::io::AsRawFd,
    sync::Mutex,
};

use nix::sys::uio::{preadv, pwritev};
use sha1::{Digest, Sha1};

use super::iovecs::{IoVec, IoVecs};
use crate::{
    block_count,
    conf::DiskAllocation,
    error::Error,
    storage_info::{FileInfo, FsStructure, StorageInfo},
    BlockInfo, FileIndex, PieceIndex, Result, Sha1Hash,
};

/// A single open file belonging to a torrent.
pub(super) struct TorrentFile {
    pub info: FileInfo,
    pub handle: File,
}

impl TorrentFile {
    fn open(info: FileInfo, allocation: DiskAllocation) -> Result<Self> {
        if let Some(parent) = info.path.parent() {
            if !parent.as_os_str().is_empty() && !parent.exists() {
                fs::create_dir_all(parent).map_err(|e| Error::Disk {
                    path: parent.to_path_buf(),
                    msg: e.to_string(),
                })?;
            }
        }

        let handle = OpenOptions::new()
            .create(true)
            .read(true)
            .write(true)
            .open(&info.path)
            .map_err(|e| Error::Disk {
                path: info.path.clone(),
                msg: e.to_string(),
            })?;

        match allocation {
            DiskAllocation::Sparse => {
                handle.set_len(info.len).map_err(|e| Error::Disk {
                    path: info.path.clone(),
                    msg: e.to_string(),
                })?;
            }
            DiskAllocation::Full => {
                handle.set_len(info.len).map_err(|e| Error::Disk {
                    path: info.path.clone(),
                    msg: e.to_string(),
                })?;
                if let Err(e) = nix::fcntl::posix_fallocate(handle.as_raw_fd(), 0, info.len as i64) {
                    if e != nix::Error::Sys(nix::errno::Errno::EOPNOTSUPP) {
                        return Err(Error::Disk {
                            path: info.path.clone(),
                            msg: e.to_string(),
                        });
                    }
                }
            }
            DiskAllocation::Compact => {
                // no pre-allocation; the file grows as blocks are written
            }
        }

        Ok(Self { info, handle })
    }

    fn write_vectored_at(&self, iovecs: &mut IoVecs<'_>, offset: u64) -> Result<usize> {
        let mut total = 0;
        while !iovecs.buffers().is_empty() {
            let n = pwritev(self.handle.as_raw_fd(), iovecs.buffers(), offset as i64).map_err(|e| {
                Error::Disk {
                    path: self.info.path.clone(),
                    msg: e.to_string(),
                }
            })?;
            iovecs.advance(n);
            total += n;
        }
        Ok(total)
    }

    fn read_vectored_at(
        &self,
        bufs: &mut [nix::sys::uio::IoVec<&mut [u8]>],
        offset: u64,
    ) -> Result<usize> {
        preadv(self.handle.as_raw_fd(), bufs, offset as i64).map_err(|e| Error::Disk {
            path: self.info.path.clone(),
            msg: e.to_string(),
        })
    }
}

/// An in-progress piece write buffer: the blocks received so far, keyed by
/// their offset within the piece so they can be hashed and written in
/// order.
struct WritePiece {
    expected_hash: Sha1Hash,
    len: u32,
    blocks: BTreeMap<u32, Vec<u8>>,
    files: Range<FileIndex>,
}

impl WritePiece {
    fn is_complete(&self) -> bool {
        self.blocks.len() == block_count(self.len)
    }

    fn matches_hash(&self) -> bool {
        debug_assert_eq!(self.blocks.len(), block_count(self.len));
        let mut hasher = Sha1::new();
        for block in self.blocks.values() {
            hasher.input(block);
        }
        hasher.result().as_slice() == self.expected_hash
    }
}

/// The result of flushing a completed piece's write buffer to disk.
pub(super) struct BatchWrite {
    pub blocks: Vec<BlockInfo>,
    pub is_piece_valid: bool,
}

/// The file-level view of a single torrent: its open file handles and
/// in-progress piece write buffers.
pub(super) struct DiskTorrent {
    info: StorageInfo,
    files: Vec<Mutex<TorrentFile>>,
    piece_hashes: Vec<u8>,
    write_buffers: BTreeMap<PieceIndex, WritePiece>,
}

impl DiskTorrent {
    pub fn new(info: StorageInfo, piece_hashes: Vec<u8>, allocation: DiskAllocation) -> Result<Self> {
        if !info.download_dir.exists() {
            fs::create_dir_all(&info.download_dir).map_err(|e| Error::Disk {
                path: info.download_dir.clone(),
                msg: e.to_string(),
            })?;
        }

        let files = match &info.structure {
            FsStructure::File(file) => {
                let file = FileInfo {
                    path: info.download_dir.join(file.path.file_name().unwrap_or_default()),
                    ..file.clone()
                };
                vec![Mutex::new(TorrentFile::open(file, allocation)?)]
            }
            FsStructure::Archive { files } => {
                let mut handles = Vec::with_capacity(files.len());
                for file in files {
                    let file = FileInfo {
                        path: info.download_dir.join(&file.path),
                        ..file.clone()
                    };
                    handles.push(Mutex::new(TorrentFile::open(file, allocation)?));
                }
                handles
            }
        };

        Ok(Self {
            info,
            files,
            piece_hashes,
            write_buffers: BTreeMap::new(),
        })
    }

    fn expected_hash(&self, index: PieceIndex) -> Result<Sha1Hash> {
        let pos = index * 20;
        let slice = self
            .piece_hashes
            .get(pos..pos + 20)
            .ok_or(Error::InvalidPieceIndex(index))?;
        let mut hash = [0; 20];
        hash.copy_from_slice(slice);
        Ok(hash)
    }

    /// Buffers `data` as the block at `info`, hashing and flushing the whole
    /// piece to disk once every block has arrived.
    pub fn write_block(&mut self, info: BlockInfo, data: Vec<u8>) -> Result<Option<BatchWrite>> {
        if !self.write_buffers.contains_key(&info.piece_index) {
            let len = self.info.piece_len(info.piece_index)?;
            let files = self.info.files_intersecting_piece(info.piece_index)?;
            self.write_buffers.insert(
                info.piece_index,
                WritePiece {
                    expected_hash: self.expected_hash(info.piece_index)?,
                    len,
                    blocks: BTreeMap::new(),
                    files,
                },
            );
        }

        let piece = self.write_buffers.get_mut(&info.piece_index).expect("just inserted");
        piece.blocks.entry(info.offset).or_insert(data);

        if !piece.is_complete() {
            return Ok(None);
        }

        let piece = self.write_buffers.remove(&info.piece_index).expect("checked above");
        let is_valid = piece.matches_hash();
        let blocks: Vec<BlockInfo> = piece
            .blocks
            .iter()
            .map(|(offset, block)| BlockInfo {
                piece_index: info.piece_index,
                offset: *offset,
                len: block.len() as u32,
            })
            .collect();

        if is_valid {
            let piece_torrent_offset = info.piece_index as u64 * self.info.piece_len as u64;
            self.write_piece(&piece, piece_torrent_offset)?;
        }

        Ok(Some(BatchWrite {
            blocks,
            is_piece_valid: is_valid,
        }))
    }

    fn write_piece(&self, piece: &WritePiece, piece_torrent_offset: u64) -> Result<usize> {
        let bufs: Vec<IoVec> = piece.blocks.values().map(|b| IoVec::from_slice(b)).collect();
        let mut iovecs = IoVecs::new(bufs);
        let files = &self.files[piece.files.clone()];
        debug_assert!(!files.is_empty());

        let mut total: u64 = 0;
        let mut write_offset = piece_torrent_offset;
        for file in files.iter() {
            let file = file.lock().expect("file mutex poisoned");
            let slice = file.info.get_slice(write_offset, piece.len as u64 - total);
            let mut window = iovecs.take_bounded(slice.len);
            total += file.write_vectored_at(&mut window, slice.offset)? as u64;
            write_offset += slice.len;
        }
        debug_assert!(iovecs.is_empty());
        Ok(total as usize)
    }

    pub fn piece_count(&self) -> usize {
        self.info.piece_count
    }

    /// Reads piece `index` back from disk and checks it against its
    /// expected hash, for initial verification.
    pub fn verify_piece(&self, index: PieceIndex) -> Result<bool> {
        let data = self.read_piece(index)?;
        let expected = self.expected_hash(index)?;
        Ok(Sha1::digest(&data).as_slice() == expected)
    }

    /// Reads an arbitrary block's bytes back from disk, used to serve
    /// requests from peers we're seeding to.
    pub fn read_block(&self, info: BlockInfo) -> Result<Vec<u8>> {
        let piece_torrent_offset = info.piece_index as u64 * self.info.piece_len as u64;
        let start = piece_torrent_offset + info.offset as u64;
        self.read_range(start, info.len as usize)
    }

    /// Reads an entire piece's bytes back from disk, used for initial
    /// verification.
    pub fn read_piece(&self, index: PieceIndex) -> Result<Vec<u8>> {
        let len = self.info.piece_len(index)?;
        let start = index as u64 * self.info.piece_len as u64;
        self.read_range(start, len as usize)
    }

    fn read_range(&self, start: u64, len: usize) -> Result<Vec<u8>> {
        let mut out = vec![0u8; len];
        let file_range = self.info.structure.files_intersecting_bytes(start..start + len as u64);
        let mut filled = 0usize;
        let mut offset = start;
        for file in &self.files[file_range] {
            let file = file.lock().expect("file mutex poisoned");
            let slice = file.info.get_slice(offset, len as u64 - filled as u64);
            let mut remaining = slice.len as usize;
            let mut file_offset = slice.offset;
            while remaining > 0 {
                let buf = &mut out[filled..filled + remaining];
                let mut bufs = [nix::sys::uio::IoVec::from_mut_slice(buf)];
                let n = file.read_vectored_at(&mut bufs, file_offset)?;
                if n == 0 {
                    return Err(Error::Disk {
                        path: file.info.path.clone(),
                        msg: "unexpected end of file".into(),
                    });
                }
                remaining -= n;
                file_offset += n as u64;
                filled += n;
            }
            offset += slice.len;
        }
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage_info::FileInfo;
    use std::path::PathBuf;
    use tempfile::tempdir;

    fn single_file_storage(dir: &std::path::Path, len: u64, piece_len: u32) -> StorageInfo {
        let piece_count = ((len + piece_len as u64 - 1) / piece_len as u64) as usize;
        let remainder = len % piece_len as u64;
        let last_piece_len = if remainder == 0 { piece_len } else { remainder as u32 };
        StorageInfo {
            piece_count,
            piece_len,
            last_piece_len,
            download_len: len,
            download_dir: dir.to_path_buf(),
            structure: FsStructure::File(FileInfo {
                path: PathBuf::from("movie.mp4"),
                torrent_offset: 0,
                len,
            }),
        }
    }

    #[test]
    fn write_then_read_single_file_piece_round_trips() {
        let dir = tempdir().unwrap();
        let piece_len = 32;
        let data = vec![42u8; piece_len as usize];
        let hash = Sha1::digest(&data);
        let info = single_file_storage(dir.path(), piece_len as u64, piece_len);
        let mut torrent = DiskTorrent::new(info, hash.to_vec(), DiskAllocation::Sparse).unwrap();

        let block = BlockInfo {
            piece_index: 0,
            offset: 0,
            len: piece_len,
        };
        let result = torrent.write_block(block, data.clone()).unwrap().unwrap();
        assert!(result.is_piece_valid);

        let read_back = torrent.read_piece(0).unwrap();
        assert_eq!(read_back, data);
    }

    #[test]
    fn corrupted_piece_is_reported_invalid() {
        let dir = tempdir().unwrap();
        let piece_len = 16;
        let data = vec![1u8; piece_len as usize];
        let wrong_hash = Sha1::digest(b"totally-different-bytes");
        let info = single_file_storage(dir.path(), piece_len as u64, piece_len);
        let mut torrent = DiskTorrent::new(info, wrong_hash.to_vec(), DiskAllocation::Sparse).unwrap();
        let block = BlockInfo {
            piece_index: 0,
            offset: 0,
            len: piece_len,
        };
        let result = torrent.write_block(block, data).unwrap().unwrap();
        assert!(!result.is_piece_valid);
    }

    #[test]
    fn multi_file_piece_splits_write_across_files() {
        let dir = tempdir().unwrap();
        let files = vec![
            FileInfo { path: PathBuf::from("a.bin"), torrent_offset: 0, len: 10 },
            FileInfo { path: PathBuf::from("b.bin"), torrent_offset: 10, len: 10 },
        ];
        let info = StorageInfo {
            piece_count: 1,
            piece_len: 20,
            last_piece_len: 20,
            download_len: 20,
            download_dir: dir.path().to_path_buf(),
            structure: FsStructure::Archive { files },
        };
        let data = (0u8..20).collect::<Vec<u8>>();
        let hash = Sha1::digest(&data);
        let mut torrent = DiskTorrent::new(info, hash.to_vec(), DiskAllocation::Sparse).unwrap();
        let block = BlockInfo { piece_index: 0, offset: 0, len: 20 };
        let result = torrent.write_block(block, data.clone()).unwrap().unwrap();
        assert!(result.is_piece_valid);
        assert_eq!(torrent.read_piece(0).unwrap(), data);
    }
}
