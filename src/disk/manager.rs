//! The disk task: owns every torrent's open file handles, queues writes,
//! serves cached reads, and runs initial verification in bounded batches
//! (spec.md §4.9).

use std::collections::{HashMap, VecDeque};

use lru::LruCache;
use tokio::sync::{mpsc, RwLock};

use super::{
    io::DiskTorrent, Alert, AlertReceiver, AlertSender, BatchWriteAlert, Command, CommandReceiver,
    CommandSender, NewTorrentError, TorrentAlert, TorrentAlertReceiver, TorrentAlertSender,
    TorrentAllocation,
};
use crate::{conf::DiskConf, error::Error, BlockInfo, PieceIndex, Result, TorrentId};

/// A write that couldn't be flushed to disk due to `ENOSPC` and is waiting
/// for a `SpaceAvailable` alert to be retried.
struct PendingWrite {
    info: BlockInfo,
    data: Vec<u8>,
}

struct ManagedTorrent {
    disk: RwLock<DiskTorrent>,
    alert_chan: TorrentAlertSender,
    read_cache: RwLock<LruCache<PieceIndex, Vec<u8>>>,
    pending_writes: VecDeque<PendingWrite>,
}

/// The entity responsible for reading and writing torrent data and running
/// initial verification, driven from its own task via [`super::DiskHandle`].
pub(crate) struct Disk {
    torrents: HashMap<TorrentId, ManagedTorrent>,
    cmd_port: CommandReceiver,
    alert_chan: AlertSender,
    conf: DiskConf,
    /// Set once a write has failed with `ENOSPC`, so the task knows to
    /// periodically recheck rather than just failing every subsequent
    /// write outright.
    disk_full: bool,
}

impl Disk {
    pub(crate) fn new(conf: DiskConf) -> (Self, CommandSender, AlertReceiver) {
        let (alert_chan, alert_port) = mpsc::unbounded_channel();
        let (cmd_chan, cmd_port) = mpsc::unbounded_channel();
        (
            Self {
                torrents: HashMap::new(),
                cmd_port,
                alert_chan,
                conf,
                disk_full: false,
            },
            cmd_chan,
            alert_port,
        )
    }

    pub(crate) async fn start(&mut self) -> Result<()> {
        log::info!("Starting disk IO event loop");
        while let Some(cmd) = self.cmd_port.recv().await {
            match cmd {
                Command::NewTorrent { id, info, piece_hashes } => {
                    self.new_torrent(id, info, piece_hashes)?;
                }
                Command::RemoveTorrent { id, delete_files } => {
                    self.remove_torrent(id, delete_files);
                }
                Command::WriteBlock { id, info, data } => {
                    self.write_block(id, info, data).await?;
                }
                Command::ReadBlock { id, info } => {
                    self.read_block(id, info).await?;
                }
                Command::VerifyTorrent { id } => {
                    self.verify_torrent(id).await?;
                }
                Command::RetryPendingWrites => {
                    self.retry_pending_writes().await?;
                }
                Command::Shutdown => {
                    log::info!("Shutting down disk event loop");
                    break;
                }
            }
        }
        Ok(())
    }

    fn new_torrent(&mut self, id: TorrentId, info: crate::storage_info::StorageInfo, piece_hashes: Vec<u8>) -> Result<()> {
        if self.torrents.contains_key(&id) {
            self.alert_chan
                .send(Alert::TorrentAllocation(Err(NewTorrentError::AlreadyExists(id))))?;
            return Ok(());
        }

        match DiskTorrent::new(info, piece_hashes, self.conf.allocation) {
            Ok(disk) => {
                let (alert_chan, alert_port) = mpsc::unbounded_channel();
                self.torrents.insert(
                    id,
                    ManagedTorrent {
                        disk: RwLock::new(disk),
                        alert_chan,
                        read_cache: RwLock::new(LruCache::new(self.conf.read_cache_capacity)),
                        pending_writes: VecDeque::new(),
                    },
                );
                self.alert_chan
                    .send(Alert::TorrentAllocation(Ok(TorrentAllocation { id, alert_port })))?;
            }
            Err(e) => {
                log::warn!("Torrent {} disk allocation failed: {}", id, e);
                self.alert_chan
                    .send(Alert::TorrentAllocation(Err(NewTorrentError::Io(e))))?;
            }
        }
        Ok(())
    }

    fn remove_torrent(&mut self, id: TorrentId, delete_files: bool) {
        // stop queueing further writes for this torrent before anything else
        if let Some(torrent) = self.torrents.remove(&id) {
            drop(torrent);
        }
        if delete_files {
            // files are cleaned up by the engine via the torrent's
            // StorageInfo, which it retains independently of the disk task.
            log::info!("Torrent {} disk state removed, file deletion requested", id);
        }
    }

    async fn write_block(&mut self, id: TorrentId, info: BlockInfo, data: Vec<u8>) -> Result<()> {
        let torrent = self.torrents.get_mut(&id).ok_or(Error::InvalidTorrentId(id))?;

        if self.disk_full || torrent.pending_writes.len() >= self.conf.write_queue_capacity {
            torrent.pending_writes.push_back(PendingWrite { info, data });
            return Ok(());
        }

        Self::flush_block(torrent, info, data, &mut self.disk_full).await
    }

    async fn flush_block(
        torrent: &mut ManagedTorrent,
        info: BlockInfo,
        data: Vec<u8>,
        disk_full: &mut bool,
    ) -> Result<()> {
        let mut disk = torrent.disk.write().await;
        match disk.write_block(info, data) {
            Ok(Some(batch)) => {
                torrent.read_cache.write().await.pop(&info.piece_index);
                torrent.alert_chan.send(TorrentAlert::BatchWrite(BatchWriteAlert {
                    blocks: batch.blocks,
                    is_piece_valid: batch.is_piece_valid,
                }))?;
            }
            Ok(None) => {}
            Err(Error::Disk { path, msg }) if is_disk_full(&msg) => {
                *disk_full = true;
                torrent.alert_chan.send(TorrentAlert::DiskFull {
                    required: info.len as u64,
                    available: 0,
                })?;
                log::warn!("Disk full writing to {:?}: {}", path, msg);
            }
            Err(e) => {
                log::warn!("Disk write error for torrent: {}", e);
                return Err(e);
            }
        }
        Ok(())
    }

    /// Retries queued writes across every torrent once space is believed to
    /// be available again; called on the `disk_full_recheck_interval` tick.
    async fn retry_pending_writes(&mut self) -> Result<()> {
        for (_, torrent) in self.torrents.iter_mut() {
            while let Some(pending) = torrent.pending_writes.pop_front() {
                Self::flush_block(torrent, pending.info, pending.data, &mut self.disk_full).await?;
                if self.disk_full {
                    break;
                }
            }
        }
        if !self.disk_full {
            for (_, torrent) in self.torrents.iter() {
                torrent.alert_chan.send(TorrentAlert::SpaceAvailable)?;
            }
        }
        Ok(())
    }

    async fn read_block(&self, id: TorrentId, info: BlockInfo) -> Result<()> {
        let torrent = self.torrents.get(&id).ok_or(Error::InvalidTorrentId(id))?;

        if let Some(piece) = torrent.read_cache.write().await.get(&info.piece_index) {
            let start = info.offset as usize;
            let end = start + info.len as usize;
            if let Some(slice) = piece.get(start..end) {
                torrent
                    .alert_chan
                    .send(TorrentAlert::BlockRead(Ok((info, slice.to_vec()))))?;
                return Ok(());
            }
        }

        let disk = torrent.disk.read().await;
        let result = disk.read_piece(info.piece_index).map(|piece| {
            let start = info.offset as usize;
            let end = start + info.len as usize;
            let block = piece[start..end].to_vec();
            (piece, block)
        });
        let result = match result {
            Ok((piece, block)) => {
                torrent.read_cache.write().await.put(info.piece_index, piece);
                Ok((info, block))
            }
            Err(e) => Err(e),
        };
        torrent.alert_chan.send(TorrentAlert::BlockRead(result))?;
        Ok(())
    }

    async fn verify_torrent(&self, id: TorrentId) -> Result<()> {
        let torrent = self.torrents.get(&id).ok_or(Error::InvalidTorrentId(id))?;
        let disk = torrent.disk.read().await;
        let piece_count = disk.piece_count();
        let mut good_pieces = Vec::new();
        let mut index = 0;
        while index < piece_count {
            let batch_end = (index + self.conf.verification_concurrency).min(piece_count);
            for i in index..batch_end {
                // yield between pieces so a large initial verification pass
                // doesn't starve the rest of the disk task's command loop
                tokio::task::yield_now().await;
                if disk.verify_piece(i).unwrap_or(false) {
                    good_pieces.push(i);
                }
            }
            torrent.alert_chan.send(TorrentAlert::VerificationProgress {
                verified: batch_end,
                total: piece_count,
            })?;
            index = batch_end;
        }
        torrent
            .alert_chan
            .send(TorrentAlert::VerificationComplete { good_pieces })?;
        Ok(())
    }
}

fn is_disk_full(msg: &str) -> bool {
    msg.contains("No space left on device") || msg.contains("ENOSPC")
}
