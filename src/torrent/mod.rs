//! A single torrent's session state machine (spec.md §4.11): owns the piece
//! map, coordinates the peer manager, tracker client, and disk handle for
//! one torrent, and emits progress at a fixed rate.

use std::collections::HashSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::RwLock;

use crate::{
    conf::TorrentConf,
    counter::RateCounter,
    disk::DiskHandle,
    error::Error,
    metainfo::TorrentMetadata,
    piece::{PieceSelector, SelectStrategy, TorrentPieceMap},
    storage_info::StorageInfo,
    PieceIndex, Result, TorrentId,
};

pub(crate) const STATS_TICK: Duration = Duration::from_secs(1);

/// The session's current lifecycle state (spec.md §4.11).
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum State {
    Queued,
    Checking,
    Downloading,
    Seeding,
    Paused,
    Error,
}

/// Counters and rate trackers shared between the torrent session and every
/// one of its peer sessions, so peers can report progress without routing
/// every byte through the session's own task.
pub(crate) struct SharedStatus {
    pub info_hash: crate::Sha1Hash,
    pub client_id: crate::PeerId,
    pub storage: StorageInfo,
    pub downloaded: AtomicU64,
    pub uploaded: AtomicU64,
    pub download_rate: RwLock<RateCounter>,
    pub upload_rate: RwLock<RateCounter>,
    pub piece_map: RwLock<TorrentPieceMap>,
    pub selector: RwLock<PieceSelector>,
}

impl SharedStatus {
    fn new(metadata: &TorrentMetadata, storage: StorageInfo, conf: &TorrentConf) -> Self {
        let piece_map = TorrentPieceMap::new(
            metadata.piece_count,
            metadata.piece_len,
            storage.last_piece_len,
        );
        let selector = PieceSelector::new(
            metadata.piece_count,
            SelectStrategy::RarestFirst,
            conf.endgame_threshold,
        );
        Self {
            info_hash: metadata.info_hash,
            client_id: conf_client_id(),
            storage,
            downloaded: AtomicU64::new(0),
            uploaded: AtomicU64::new(0),
            download_rate: RwLock::new(RateCounter::new()),
            upload_rate: RwLock::new(RateCounter::new()),
            piece_map: RwLock::new(piece_map),
            selector: RwLock::new(selector),
        }
    }

    pub fn left(&self) -> u64 {
        let completed = self
            .downloaded
            .load(Ordering::Relaxed)
            .min(self.storage.download_len);
        self.storage.download_len - completed
    }
}

fn conf_client_id() -> crate::PeerId {
    *crate::conf::CLIENT_ID
}

/// A snapshot of a torrent's progress, suitable for exposing through a
/// status API or progress event (spec.md §4.11).
#[derive(Clone, Debug)]
pub struct Progress {
    pub id: TorrentId,
    pub state: State,
    pub downloaded: u64,
    pub uploaded: u64,
    pub total_len: u64,
    pub download_rate: f64,
    pub upload_rate: f64,
    pub connected_peers: usize,
    pub progress: f64,
}

/// A single torrent's session: state machine, shared status, and the
/// plumbing needed to drive it through its lifecycle.
pub(crate) struct TorrentSession {
    pub id: TorrentId,
    pub metadata: TorrentMetadata,
    pub conf: TorrentConf,
    pub status: Arc<SharedStatus>,
    state: State,
    disk: DiskHandle,
    connected_peers: usize,
    last_stats_tick: Instant,
    completed_at: Option<Instant>,
}

impl TorrentSession {
    pub fn new(
        id: TorrentId,
        metadata: TorrentMetadata,
        download_dir: std::path::PathBuf,
        conf: TorrentConf,
        disk: DiskHandle,
    ) -> Self {
        let storage = StorageInfo::new(&metadata, download_dir);
        let status = Arc::new(SharedStatus::new(&metadata, storage, &conf));
        Self {
            id,
            metadata,
            conf,
            status,
            state: State::Queued,
            disk,
            connected_peers: 0,
            last_stats_tick: Instant::now(),
            completed_at: None,
        }
    }

    pub fn state(&self) -> State {
        self.state
    }

    /// Transitions `Queued|Paused|Error -> Checking` and kicks off initial
    /// verification on the disk task (spec.md §4.11).
    pub fn start(&mut self) -> Result<()> {
        match self.state {
            State::Queued | State::Paused | State::Error => {
                self.state = State::Checking;
                self.disk.new_torrent(
                    self.id,
                    self.status.storage.clone(),
                    self.metadata.piece_hashes.clone(),
                )?;
                Ok(())
            }
            other => Err(Error::State {
                id: self.id,
                msg: format!("cannot start from state {:?}", other),
            }),
        }
    }

    /// Applies the result of initial verification: pieces that hashed
    /// correctly are marked completed, and the session transitions to
    /// `Seeding` if every piece checked out, `Downloading` otherwise.
    pub async fn apply_verification(&mut self, good_pieces: Vec<PieceIndex>) -> Result<()> {
        if self.state != State::Checking {
            return Err(Error::State {
                id: self.id,
                msg: "verification result received outside Checking".into(),
            });
        }
        let complete = {
            let mut map = self.status.piece_map.write().await;
            map.set_completed(good_pieces);
            map.completed_count() == map.piece_count()
        };
        if complete {
            self.status
                .downloaded
                .store(self.status.storage.download_len, Ordering::Relaxed);
            self.transition_to_seeding();
        } else {
            self.state = State::Downloading;
        }
        Ok(())
    }

    fn transition_to_seeding(&mut self) {
        self.state = State::Seeding;
        self.completed_at = Some(Instant::now());
    }

    /// Called whenever a piece passes its hash check while downloading;
    /// transitions to `Seeding` once every piece is accounted for.
    pub async fn on_piece_verified(&mut self, index: PieceIndex) -> Result<bool> {
        if self.state != State::Downloading {
            return Ok(false);
        }
        let complete = {
            let mut map = self.status.piece_map.write().await;
            map.mark_completed(index);
            map.completed_count() == map.piece_count()
        };
        if complete {
            self.transition_to_seeding();
        }
        Ok(complete)
    }

    pub async fn on_piece_failed(&mut self, index: PieceIndex) {
        let mut map = self.status.piece_map.write().await;
        map.mark_failed(index);
    }

    pub fn pause(&mut self) -> Result<()> {
        match self.state {
            State::Downloading | State::Seeding | State::Checking => {
                self.state = State::Paused;
                Ok(())
            }
            other => Err(Error::State {
                id: self.id,
                msg: format!("cannot pause from state {:?}", other),
            }),
        }
    }

    pub fn fail(&mut self, _msg: impl Into<String>) {
        self.state = State::Error;
    }

    pub fn set_connected_peers(&mut self, count: usize) {
        self.connected_peers = count;
    }

    /// Advances the rate counters and returns a progress snapshot if
    /// `STATS_TICK` has elapsed since the last one.
    pub async fn tick_stats(&mut self, now: Instant) -> Option<Progress> {
        if now.duration_since(self.last_stats_tick) < STATS_TICK {
            return None;
        }
        self.last_stats_tick = now;
        let mut dl = self.status.download_rate.write().await;
        let mut ul = self.status.upload_rate.write().await;
        dl.tick(now);
        ul.tick(now);
        let downloaded = self.status.downloaded.load(Ordering::Relaxed);
        let uploaded = self.status.uploaded.load(Ordering::Relaxed);
        let progress = {
            let map = self.status.piece_map.read().await;
            map.progress()
        };
        Some(Progress {
            id: self.id,
            state: self.state,
            downloaded,
            uploaded,
            total_len: self.status.storage.download_len,
            download_rate: dl.rate(),
            upload_rate: ul.rate(),
            connected_peers: self.connected_peers,
            progress,
        })
    }

    pub fn is_active(&self) -> bool {
        matches!(self.state, State::Downloading | State::Seeding | State::Checking)
    }

    /// Graceful stop: the disk queue drain and tracker `Stopped` announce
    /// are driven by the caller (engine/peer manager); this only updates
    /// local bookkeeping.
    pub fn mark_stopped(&mut self) {
        if self.state != State::Error {
            self.state = State::Paused;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bencode::{self, build, Value};
    use std::collections::BTreeMap;

    fn sample_metadata() -> TorrentMetadata {
        let piece_len = 16;
        let total_len = 32;
        let mut info = BTreeMap::new();
        info.insert(b"name".to_vec(), build::bytestring("t.bin"));
        info.insert(b"piece length".to_vec(), Value::Integer(piece_len));
        info.insert(b"pieces".to_vec(), Value::ByteString(vec![0u8; 40]));
        info.insert(b"length".to_vec(), Value::Integer(total_len));
        let mut top = BTreeMap::new();
        top.insert(b"info".to_vec(), Value::Dict(info));
        let bytes = bencode::encode(&Value::Dict(top));
        TorrentMetadata::from_bytes(&bytes).unwrap()
    }

    fn session() -> TorrentSession {
        let metadata = sample_metadata();
        let conf = TorrentConf::new("/tmp/downloads");
        let (disk, _alerts) = DiskHandle::spawn(crate::conf::DiskConf::default());
        TorrentSession::new(1, metadata, "/tmp/downloads".into(), conf, disk)
    }

    #[test]
    fn starts_from_queued_into_checking() {
        let mut session = session();
        session.start().unwrap();
        assert_eq!(session.state(), State::Checking);
    }

    #[test]
    fn cannot_start_twice_without_pause_or_error() {
        let mut session = session();
        session.start().unwrap();
        assert!(session.start().is_err());
    }

    #[tokio::test]
    async fn full_verification_result_transitions_to_seeding() {
        let mut session = session();
        session.start().unwrap();
        session.apply_verification(vec![0, 1]).await.unwrap();
        assert_eq!(session.state(), State::Seeding);
    }

    #[tokio::test]
    async fn partial_verification_result_transitions_to_downloading() {
        let mut session = session();
        session.start().unwrap();
        session.apply_verification(vec![0]).await.unwrap();
        assert_eq!(session.state(), State::Downloading);
    }

    #[tokio::test]
    async fn last_piece_completes_transition_to_seeding() {
        let mut session = session();
        session.start().unwrap();
        session.apply_verification(vec![0]).await.unwrap();
        let completed = session.on_piece_verified(1).await.unwrap();
        assert!(completed);
        assert_eq!(session.state(), State::Seeding);
    }

    #[test]
    fn pause_from_error_is_rejected() {
        let mut session = session();
        session.fail("boom");
        assert!(session.pause().is_err());
    }
}
