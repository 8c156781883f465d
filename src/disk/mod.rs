//! The disk I/O subsystem: per-torrent file handles, a bounded write queue,
//! an LRU read cache, and batch initial verification (spec.md §4.9).
//!
//! The public entry point is [`DiskHandle`], a cheap-to-clone command sender
//! that torrent sessions use to queue block writes/reads without blocking on
//! the actual (potentially slow) file system work, which happens on a
//! dedicated task driven by [`manager::Disk`].

mod io;
mod iovecs;
mod manager;

use tokio::sync::mpsc::{UnboundedReceiver, UnboundedSender};

use crate::{
    conf::DiskConf, storage_info::StorageInfo, BlockInfo, PieceIndex, Result, TorrentId,
};

pub(crate) use manager::Disk;

/// Commands accepted by the disk task.
pub(crate) enum Command {
    /// Registers a new torrent's storage, opening/creating its files.
    NewTorrent {
        id: TorrentId,
        info: StorageInfo,
        piece_hashes: Vec<u8>,
    },
    /// Removes a torrent's disk state. If `delete_files` is set, the
    /// underlying files are deleted too; otherwise only the in-memory state
    /// is dropped.
    RemoveTorrent { id: TorrentId, delete_files: bool },
    /// Queues a downloaded block for writing.
    WriteBlock {
        id: TorrentId,
        info: BlockInfo,
        data: Vec<u8>,
    },
    /// Requests a block's bytes to serve to a peer we're seeding to.
    ReadBlock { id: TorrentId, info: BlockInfo },
    /// Requests the initial hash-check of every piece already on disk.
    VerifyTorrent { id: TorrentId },
    /// Retries every torrent's queued writes, e.g. on the engine's
    /// `disk_full_recheck_interval` tick after a `DiskFull` alert.
    RetryPendingWrites,
    Shutdown,
}

/// Alerts the disk task sends back to the engine, not tied to one torrent.
pub(crate) enum Alert {
    TorrentAllocation(Result<TorrentAllocation, NewTorrentError>),
}

pub(crate) struct TorrentAllocation {
    pub id: TorrentId,
    pub alert_port: TorrentAlertReceiver,
}

#[derive(thiserror::Error, Debug)]
pub(crate) enum NewTorrentError {
    #[error("torrent {0} already has disk state allocated")]
    AlreadyExists(TorrentId),
    #[error(transparent)]
    Io(#[from] crate::error::Error),
}

/// Per-torrent alerts: block/piece completion, read results, verification
/// progress, and disk-full/space-available transitions.
pub(crate) enum TorrentAlert {
    BatchWrite(BatchWriteAlert),
    BlockRead(Result<(BlockInfo, Vec<u8>), crate::error::Error>),
    VerificationProgress { verified: usize, total: usize },
    VerificationComplete { good_pieces: Vec<PieceIndex> },
    DiskFull { required: u64, available: u64 },
    SpaceAvailable,
}

pub(crate) struct BatchWriteAlert {
    pub blocks: Vec<BlockInfo>,
    pub is_piece_valid: bool,
}

pub(crate) type CommandSender = UnboundedSender<Command>;
pub(crate) type CommandReceiver = UnboundedReceiver<Command>;
pub(crate) type AlertSender = UnboundedSender<Alert>;
pub(crate) type AlertReceiver = UnboundedReceiver<Alert>;
pub(crate) type TorrentAlertSender = UnboundedSender<TorrentAlert>;
pub(crate) type TorrentAlertReceiver = UnboundedReceiver<TorrentAlert>;

/// A cheap handle to the disk task, held by every torrent session and peer
/// session that needs to read or write blocks.
#[derive(Clone)]
pub(crate) struct DiskHandle {
    cmd_chan: CommandSender,
}

impl DiskHandle {
    /// Spawns the disk task and returns a handle to it along with the
    /// channel on which it emits torrent-independent alerts.
    pub fn spawn(conf: DiskConf) -> (Self, AlertReceiver) {
        let (mut disk, cmd_chan, alert_port) = Disk::new(conf);
        tokio::spawn(async move {
            if let Err(e) = disk.start().await {
                log::error!("Disk event loop exited with error: {}", e);
            }
        });
        (Self { cmd_chan }, alert_port)
    }

    pub fn new_torrent(&self, id: TorrentId, info: StorageInfo, piece_hashes: Vec<u8>) -> Result<()> {
        Ok(self.cmd_chan.send(Command::NewTorrent { id, info, piece_hashes })?)
    }

    pub fn remove_torrent(&self, id: TorrentId, delete_files: bool) -> Result<()> {
        Ok(self.cmd_chan.send(Command::RemoveTorrent { id, delete_files })?)
    }

    pub fn write_block(&self, id: TorrentId, info: BlockInfo, data: Vec<u8>) -> Result<()> {
        Ok(self.cmd_chan.send(Command::WriteBlock { id, info, data })?)
    }

    pub fn read_block(&self, id: TorrentId, info: BlockInfo) -> Result<()> {
        Ok(self.cmd_chan.send(Command::ReadBlock { id, info })?)
    }

    pub fn verify_torrent(&self, id: TorrentId) -> Result<()> {
        Ok(self.cmd_chan.send(Command::VerifyTorrent { id })?)
    }

    pub fn retry_pending_writes(&self) -> Result<()> {
        Ok(self.cmd_chan.send(Command::RetryPendingWrites)?)
    }

    pub fn shutdown(&self) -> Result<()> {
        Ok(self.cmd_chan.send(Command::Shutdown)?)
    }
}
