//! This module defines types used to configure the engine and its parts.
//!
//! It mirrors the recognized options enumerated in spec.md §6: connection
//! caps, bandwidth limits, disk allocation strategy, and the per-torrent
//! defaults applied unless a torrent overrides them.

use std::{path::PathBuf, time::Duration};

use crate::{error::Error, PeerId, Result};

/// The default client id this engine announces to trackers and peers.
pub const CLIENT_ID: &PeerId = b"-TD0001-000000000000";

/// The global configuration for the torrent engine and all its parts.
#[derive(Clone, Debug)]
pub struct Conf {
    pub engine: EngineConf,
    pub torrent: TorrentConf,
    pub disk: DiskConf,
}

impl Conf {
    /// Returns a configuration with reasonable defaults, except for the data
    /// and download directories, which aren't sensible to guess for the
    /// user. Uses the default client id, [`CLIENT_ID`].
    pub fn new(data_dir: impl Into<PathBuf>, download_dir: impl Into<PathBuf>) -> Self {
        Self {
            engine: EngineConf::new(data_dir),
            torrent: TorrentConf::new(download_dir),
            disk: DiskConf::default(),
        }
    }
}

/// Configuration related to the engine itself, rather than to any one
/// torrent.
#[derive(Clone, Debug)]
pub struct EngineConf {
    /// The ID of the client to announce to trackers and other peers.
    pub client_id: PeerId,
    /// Directory under which per-torrent state files are persisted
    /// (`<data_dir>/torrents/<info-hash>.json`, spec.md §6).
    pub data_dir: PathBuf,
    /// The inclusive range of ports the peer listener tries to bind to.
    pub port_range: (u16, u16),
    /// The maximum number of simultaneously connected peers, summed across
    /// all torrents.
    pub max_connections: usize,
    /// The maximum number of torrents in `Downloading`/`Seeding` state at
    /// once; the rest are `Queued`.
    pub max_active_torrents: usize,
    /// Global outbound bandwidth cap in bytes/sec. `0` means unlimited.
    pub max_upload_speed: u64,
    /// Global inbound bandwidth cap in bytes/sec. `0` means unlimited.
    pub max_download_speed: u64,
    /// The message-stream-encryption posture. `Require` is rejected by
    /// [`EngineConf::validate`] in this version of the engine.
    pub encryption_mode: EncryptionMode,
}

impl EngineConf {
    pub fn new(data_dir: impl Into<PathBuf>) -> Self {
        Self {
            client_id: *CLIENT_ID,
            data_dir: data_dir.into(),
            port_range: (6881, 6889),
            max_connections: 50,
            max_active_torrents: 5,
            max_upload_speed: 0,
            max_download_speed: 0,
            encryption_mode: EncryptionMode::Prefer,
        }
    }

    /// Validates the configuration, rejecting combinations this engine
    /// version doesn't support (spec.md §6: `encryptionMode = require`).
    pub fn validate(&self) -> Result<()> {
        if self.encryption_mode == EncryptionMode::Require {
            return Err(Error::Protocol(
                "encryptionMode = require is not supported in this engine version"
                    .into(),
            ));
        }
        Ok(())
    }
}

/// Message-stream-encryption posture. A hook for future extension; only
/// `Prefer` and `Disabled` are functional today (spec.md §6).
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum EncryptionMode {
    Prefer,
    Require,
    Disabled,
}

/// Configuration for a torrent.
///
/// The engine applies a default instance of this to all torrents, but
/// individual torrents may override it.
#[derive(Clone, Debug)]
pub struct TorrentConf {
    /// The directory in which a torrent's files are placed upon download and
    /// from which they are seeded.
    pub download_dir: PathBuf,

    /// The minimum number of peers we want to keep in torrent at all times.
    pub min_requested_peer_count: usize,

    /// The max number of connected peers the torrent should have.
    pub max_connected_peer_count: usize,

    /// If the tracker doesn't provide a minimum announce interval, default
    /// to announcing at this interval.
    pub announce_interval: Duration,

    /// After this many consecutive announce failures the session stops
    /// announcing to that tracker tier.
    pub tracker_error_threshold: usize,

    /// Whether newly added torrents are hash-checked before starting.
    pub verify_on_add: bool,

    /// Whether newly added torrents are started immediately.
    pub start_on_add: bool,

    /// The number of pieces from the end of the torrent below which the
    /// piece selector enters endgame mode (spec.md §4.4).
    pub endgame_threshold: usize,
}

impl TorrentConf {
    /// Returns the torrent configuration with reasonable defaults, except
    /// for the download directory, as it is not sensible to guess that for
    /// the user.
    pub fn new(download_dir: impl Into<PathBuf>) -> Self {
        Self {
            download_dir: download_dir.into(),
            // We always request at least 10 peers as anything less is a
            // waste of network round trip and it allows us to buffer up a
            // bit more than needed.
            min_requested_peer_count: 10,
            // This value is mostly picked for performance while keeping in
            // mind not to overwhelm the host.
            max_connected_peer_count: 30,
            announce_interval: Duration::from_secs(30 * 60),
            tracker_error_threshold: 15,
            verify_on_add: true,
            start_on_add: true,
            endgame_threshold: 20,
        }
    }
}

/// How a torrent's files are created and grown on disk (spec.md §4.9).
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DiskAllocation {
    /// Create zero-length files lazily; rely on the filesystem for holes.
    Sparse,
    /// Pre-allocate each file to its declared length before any writes.
    Full,
    /// Create the file structure but leave growth to the first write.
    Compact,
}

impl Default for DiskAllocation {
    fn default() -> Self {
        Self::Sparse
    }
}

/// Disk manager tuning knobs (spec.md §4.9).
#[derive(Clone, Debug)]
pub struct DiskConf {
    pub allocation: DiskAllocation,
    /// Maximum number of queued pending writes before backpressure kicks in.
    pub write_queue_capacity: usize,
    /// Number of pieces kept in the LRU read cache.
    pub read_cache_capacity: usize,
    /// Number of pieces hashed concurrently during initial verification.
    pub verification_concurrency: usize,
    /// How often to recheck available disk space after a `DiskFull` alert.
    pub disk_full_recheck_interval: Duration,
}

impl Default for DiskConf {
    fn default() -> Self {
        Self {
            allocation: DiskAllocation::Sparse,
            write_queue_capacity: 64,
            read_cache_capacity: 16,
            verification_concurrency: 8,
            disk_full_recheck_interval: Duration::from_secs(30),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn require_encryption_is_rejected() {
        let mut conf = EngineConf::new("/tmp/data");
        conf.encryption_mode = EncryptionMode::Require;
        assert!(conf.validate().is_err());
    }

    #[test]
    fn prefer_and_disabled_are_accepted() {
        let mut conf = EngineConf::new("/tmp/data");
        conf.encryption_mode = EncryptionMode::Prefer;
        assert!(conf.validate().is_ok());
        conf.encryption_mode = EncryptionMode::Disabled;
        assert!(conf.validate().is_ok());
    }
}
