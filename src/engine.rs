//! The session manager: the crate's single public entry point (spec.md
//! §4.12). Owns the `PeerManager`, `BandwidthLimiter`, and disk task
//! singletons, the `TorrentId -> TorrentSession` map, the queued-torrent
//! FIFO bounded by `maxActiveTorrents`, and the background loops that drive
//! choking, bandwidth refill, aggregate stats, disk-full recheck, and disk
//! alert delivery.
//!
//! This is the stable library API a daemon's IPC layer marshals (spec.md
//! §9): `add_torrent`, `remove_torrent`, `pause_torrent`, `resume_torrent`,
//! `torrents`, `peers`, `config`, `update_config`, `status`, `shutdown`,
//! plus the typed [`EngineEvent`] stream replacing an untyped `on(name, fn)`
//! callback API.

use std::collections::{HashMap, VecDeque};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;

use crate::bandwidth::{BandwidthLimiter, Direction};
use crate::choke;
use crate::conf::Conf;
use crate::disk::{Alert, DiskHandle, TorrentAlert, TorrentAllocation};
use crate::error::Error;
use crate::metainfo::TorrentMetadata;
use crate::peer::PeerManager;
use crate::persist::{self, PersistedState, PersistedTorrent};
use crate::torrent::{Progress, State, TorrentSession};
use crate::tracker::{self, AnnounceParams, TierAnnouncer};
use crate::{Result, Sha1Hash, TorrentId};

/// Events pushed out of the engine as they happen, mirroring spec.md §9's
/// `{torrent:added|removed|progress|completed, engine:stopped}` push-event
/// set with a typed enum instead of untyped name/payload pairs.
#[derive(Debug, Clone)]
pub enum EngineEvent {
    TorrentAdded { id: TorrentId },
    TorrentRemoved { id: TorrentId },
    TorrentCompleted { id: TorrentId },
    TorrentErrored { id: TorrentId, msg: String },
    Progress(Progress),
    Stopped,
}

/// A connected peer's choking-relevant state, exposed through
/// [`Engine::peers`].
#[derive(Debug, Clone, Copy)]
pub struct PeerInfo {
    pub addr: SocketAddr,
    pub download_rate: f64,
    pub upload_rate: f64,
    pub am_choking: bool,
    pub peer_choking: bool,
    pub peer_interested: bool,
    pub am_interested: bool,
}

/// A snapshot of the engine as a whole, exposed through [`Engine::status`].
#[derive(Debug, Clone)]
pub struct EngineStatus {
    pub active_torrents: usize,
    pub queued_torrents: usize,
    pub listen_addr: Option<SocketAddr>,
    pub total_download_rate: f64,
    pub total_upload_rate: f64,
}

/// Everything the engine keeps about one torrent beyond its session: the
/// tiered tracker client, the handle of its announce task, and the bits of
/// bookkeeping needed to persist and re-derive its state.
struct TorrentEntry {
    session: TorrentSession,
    tracker: TierAnnouncer,
    announce_task: Option<JoinHandle<()>>,
    labels: Vec<String>,
    optimistic_candidate: Option<SocketAddr>,
    last_optimistic_rotate: Instant,
    added_at: i64,
    completed_at: Option<i64>,
}

struct EngineInner {
    conf: Mutex<Conf>,
    peer_manager: Arc<Mutex<PeerManager>>,
    bandwidth: Arc<BandwidthLimiter>,
    disk: DiskHandle,
    torrents: Mutex<HashMap<TorrentId, TorrentEntry>>,
    queue: Mutex<VecDeque<TorrentId>>,
    events: mpsc::UnboundedSender<EngineEvent>,
    listen_addr: Mutex<Option<SocketAddr>>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    /// Holds the disk task's torrent-independent alert receiver between
    /// [`Engine::new`] and [`Engine::start`], which is when it starts
    /// being drained.
    disk_alerts: Mutex<Option<crate::disk::AlertReceiver>>,
    /// Previously persisted torrent state, indexed by info hash, loaded
    /// once at startup so a re-added torrent recovers its labels without
    /// an extra disk read.
    known: Mutex<HashMap<Sha1Hash, PersistedTorrent>>,
}

/// The engine: a cheap-to-clone-free handle around the shared state above.
/// `start`/`shutdown` own the singletons' lifecycle; a double `start` or a
/// `shutdown` on a non-running engine is a [`Error::State`] error (torrent
/// id `0`, reserved for engine-level errors not tied to any one torrent).
pub struct Engine {
    inner: Arc<EngineInner>,
    started: AtomicBool,
}

fn rate_opt(bytes_per_sec: u64) -> Option<u64> {
    if bytes_per_sec == 0 {
        None
    } else {
        Some(bytes_per_sec)
    }
}

fn unix_now() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}

/// Picks a random non-zero [`TorrentId`] not already in use. `0` is
/// reserved as the engine's own sentinel id, so it's never handed out here.
fn random_torrent_id(existing: &HashMap<TorrentId, TorrentEntry>) -> TorrentId {
    loop {
        let id: TorrentId = rand::random();
        if id != 0 && !existing.contains_key(&id) {
            return id;
        }
    }
}

impl Engine {
    /// Builds the engine and spawns its always-on singletons (the disk task
    /// and the peer manager's event loop), but does not yet bind the
    /// listening socket or start the periodic loops -- that's [`Engine::start`].
    /// Returns the event stream's receiving end alongside the engine.
    pub fn new(conf: Conf) -> Result<(Self, mpsc::UnboundedReceiver<EngineEvent>)> {
        conf.engine.validate()?;

        let known: HashMap<Sha1Hash, PersistedTorrent> = persist::load_all(&conf.engine.data_dir)
            .into_iter()
            .filter_map(|p| {
                let bytes = hex::decode(&p.info_hash).ok()?;
                let hash: Sha1Hash = bytes.try_into().ok()?;
                Some((hash, p))
            })
            .collect();
        if !known.is_empty() {
            log::info!(
                "Loaded {} persisted torrent state(s) from {:?}",
                known.len(),
                conf.engine.data_dir
            );
        }

        let (disk, disk_alerts) = DiskHandle::spawn(conf.disk.clone());
        let bandwidth = Arc::new(BandwidthLimiter::new());
        let (peer_manager, peer_events) = PeerManager::new(
            conf.engine.client_id,
            conf.engine.max_connections,
            conf.torrent.max_connected_peer_count,
            disk.clone(),
            bandwidth.clone(),
        );
        let peer_manager = Arc::new(Mutex::new(peer_manager));
        tokio::spawn(PeerManager::run_event_loop(peer_manager.clone(), peer_events));

        let (events, events_port) = mpsc::unbounded_channel();

        let inner = Arc::new(EngineInner {
            conf: Mutex::new(conf),
            peer_manager,
            bandwidth,
            disk,
            torrents: Mutex::new(HashMap::new()),
            queue: Mutex::new(VecDeque::new()),
            events,
            listen_addr: Mutex::new(None),
            tasks: Mutex::new(Vec::new()),
            disk_alerts: Mutex::new(Some(disk_alerts)),
            known: Mutex::new(known),
        });

        Ok((
            Self {
                inner,
                started: AtomicBool::new(false),
            },
            events_port,
        ))
    }

    /// Binds the inbound peer listener and starts every background loop.
    /// Idempotent calls are rejected: starting an already-started engine is
    /// a [`Error::State`] error.
    pub async fn start(&self) -> Result<()> {
        if self.started.swap(true, Ordering::SeqCst) {
            return Err(Error::State {
                id: 0,
                msg: "engine already started".into(),
            });
        }

        let (port_range, client_id, max_upload, max_download) = {
            let conf = self.inner.conf.lock().await;
            (
                conf.engine.port_range,
                conf.engine.client_id,
                conf.engine.max_upload_speed,
                conf.engine.max_download_speed,
            )
        };
        self.inner
            .bandwidth
            .set_global_limit(Direction::Upload, rate_opt(max_upload))
            .await;
        self.inner
            .bandwidth
            .set_global_limit(Direction::Download, rate_opt(max_download))
            .await;

        let addr = PeerManager::listen(self.inner.peer_manager.clone(), port_range, client_id).await?;
        *self.inner.listen_addr.lock().await = Some(addr);
        log::info!("Listening for inbound peer connections on {}", addr);

        let mut tasks = vec![
            tokio::spawn(Self::run_choke_loop(self.inner.clone())),
            tokio::spawn(Self::run_bandwidth_loop(self.inner.clone())),
            tokio::spawn(Self::run_stats_loop(self.inner.clone())),
            tokio::spawn(Self::run_disk_retry_loop(self.inner.clone())),
        ];
        if let Some(disk_alerts) = self.inner.disk_alerts.lock().await.take() {
            tasks.push(tokio::spawn(Self::run_alert_pump(self.inner.clone(), disk_alerts)));
        }
        *self.inner.tasks.lock().await = tasks;

        self.fill_active_queue().await;
        Ok(())
    }

    /// Stops every torrent (persisting its last known state but leaving its
    /// files and persisted JSON alone -- that's what [`Engine::remove_torrent`]
    /// is for), aborts every background task, and shuts down the disk task.
    pub async fn shutdown(&self) -> Result<()> {
        if !self.started.swap(false, Ordering::SeqCst) {
            return Err(Error::State {
                id: 0,
                msg: "engine is not running".into(),
            });
        }

        let ids: Vec<TorrentId> = self.inner.torrents.lock().await.keys().copied().collect();
        for id in ids {
            self.stop_torrent_for_shutdown(id).await;
        }

        for task in self.inner.tasks.lock().await.drain(..) {
            task.abort();
        }
        let _ = self.inner.disk.shutdown();
        let _ = self.inner.events.send(EngineEvent::Stopped);
        Ok(())
    }

    async fn stop_torrent_for_shutdown(&self, id: TorrentId) {
        let mut torrents = self.inner.torrents.lock().await;
        let Some(entry) = torrents.get_mut(&id) else { return };
        if let Some(task) = entry.announce_task.take() {
            task.abort();
        }
        entry.session.mark_stopped();
        let persisted = Self::snapshot_for_persistence(entry).await;
        drop(torrents);
        let data_dir = self.inner.conf.lock().await.engine.data_dir.clone();
        if let Err(e) = persist::save(&data_dir, &persisted) {
            log::warn!("Failed to persist torrent {} state on shutdown: {}", id, e);
        }
    }

    /// Parses `torrent_bytes` as a `.torrent` file, registers a new session
    /// for it, and either starts it immediately or queues it, depending on
    /// [`crate::conf::TorrentConf::start_on_add`].
    pub async fn add_torrent(&self, torrent_bytes: &[u8]) -> Result<TorrentId> {
        let metadata = TorrentMetadata::from_bytes(torrent_bytes)?;

        let (torrent_conf, download_dir) = {
            let conf = self.inner.conf.lock().await;
            (conf.torrent.clone(), conf.torrent.download_dir.clone())
        };
        let tracker = Self::build_tracker(&metadata, torrent_conf.tracker_error_threshold)?;

        let labels = self
            .inner
            .known
            .lock()
            .await
            .get(&metadata.info_hash)
            .map(|p| p.labels.clone())
            .unwrap_or_default();

        let id = {
            let mut torrents = self.inner.torrents.lock().await;
            let id = random_torrent_id(&torrents);
            let session = TorrentSession::new(
                id,
                metadata,
                download_dir,
                torrent_conf.clone(),
                self.inner.disk.clone(),
            );
            self.inner.peer_manager.lock().await.add_torrent(id, session.status.clone());
            torrents.insert(
                id,
                TorrentEntry {
                    session,
                    tracker,
                    announce_task: None,
                    labels,
                    optimistic_candidate: None,
                    last_optimistic_rotate: Instant::now(),
                    added_at: unix_now(),
                    completed_at: None,
                },
            );
            id
        };

        let _ = self.inner.events.send(EngineEvent::TorrentAdded { id });

        if torrent_conf.start_on_add {
            self.start_or_queue(id).await?;
        } else {
            self.inner.queue.lock().await.push_back(id);
        }

        Ok(id)
    }

    fn build_tracker(metadata: &TorrentMetadata, error_threshold: usize) -> Result<TierAnnouncer> {
        if let Some(list) = &metadata.announce_list {
            if !list.is_empty() {
                return TierAnnouncer::new(list.clone(), error_threshold);
            }
        }
        let url = metadata
            .announce
            .clone()
            .ok_or_else(|| Error::Metadata("torrent has no announce URL".into()))?;
        TierAnnouncer::single(&url)
    }

    /// Removes a torrent entirely: disconnects its peers, drops its disk
    /// state, deletes its persisted JSON state file, and -- if
    /// `delete_files` is set -- deletes its downloaded content too.
    pub async fn remove_torrent(&self, id: TorrentId, delete_files: bool) -> Result<()> {
        let entry = {
            let mut torrents = self.inner.torrents.lock().await;
            torrents.remove(&id).ok_or(Error::InvalidTorrentId(id))?
        };
        if let Some(task) = entry.announce_task {
            task.abort();
        }
        self.inner.queue.lock().await.retain(|qid| *qid != id);

        self.inner.peer_manager.lock().await.remove_torrent(id);
        self.inner.bandwidth.remove_torrent(id).await;
        self.inner.disk.remove_torrent(id, delete_files)?;

        if delete_files {
            let download_dir = &entry.session.status.storage.download_dir;
            for file in &entry.session.metadata.files {
                let path = download_dir.join(&file.path);
                if let Err(e) = std::fs::remove_file(&path) {
                    if e.kind() != std::io::ErrorKind::NotFound {
                        log::warn!("Failed to delete {:?} for torrent {}: {}", path, id, e);
                    }
                }
            }
        }

        let info_hash = entry.session.status.info_hash;
        let data_dir = self.inner.conf.lock().await.engine.data_dir.clone();
        let _ = persist::remove(&data_dir, &info_hash);
        self.inner.known.lock().await.remove(&info_hash);

        let _ = self.inner.events.send(EngineEvent::TorrentRemoved { id });
        self.fill_active_queue().await;
        Ok(())
    }

    /// Pauses a torrent: releases its disk allocation (files stay on disk;
    /// only the disk task's in-memory bookkeeping for it is dropped, so a
    /// later resume re-opens them cleanly) and aborts its announce task.
    pub async fn pause_torrent(&self, id: TorrentId) -> Result<()> {
        {
            let mut torrents = self.inner.torrents.lock().await;
            let entry = torrents.get_mut(&id).ok_or(Error::InvalidTorrentId(id))?;
            entry.session.pause()?;
            if let Some(task) = entry.announce_task.take() {
                task.abort();
            }
        }
        self.inner.disk.remove_torrent(id, false)?;
        self.fill_active_queue().await;
        Ok(())
    }

    /// Resumes a paused torrent, subject to the same `maxActiveTorrents`
    /// cap as a fresh [`Engine::add_torrent`] (spec.md §6).
    pub async fn resume_torrent(&self, id: TorrentId) -> Result<()> {
        {
            let torrents = self.inner.torrents.lock().await;
            torrents.get(&id).ok_or(Error::InvalidTorrentId(id))?;
        }
        self.start_or_queue(id).await
    }

    async fn start_or_queue(&self, id: TorrentId) -> Result<()> {
        let max_active = self.inner.conf.lock().await.engine.max_active_torrents;
        let active_count = {
            let torrents = self.inner.torrents.lock().await;
            torrents.values().filter(|e| e.session.is_active()).count()
        };
        if active_count >= max_active {
            let mut queue = self.inner.queue.lock().await;
            if !queue.contains(&id) {
                queue.push_back(id);
            }
            return Ok(());
        }
        self.force_start(id).await
    }

    /// Starts `id` unconditionally (the caller is responsible for capacity
    /// checks) and spawns its announce loop.
    async fn force_start(&self, id: TorrentId) -> Result<()> {
        {
            let mut torrents = self.inner.torrents.lock().await;
            let entry = torrents.get_mut(&id).ok_or(Error::InvalidTorrentId(id))?;
            entry.session.start()?;
        }
        let listen_port = self.inner.listen_addr.lock().await.map(|a| a.port()).unwrap_or(0);
        let handle = tokio::spawn(Self::run_announce_loop(self.inner.clone(), id, listen_port));
        let mut torrents = self.inner.torrents.lock().await;
        if let Some(entry) = torrents.get_mut(&id) {
            entry.announce_task = Some(handle);
        }
        Ok(())
    }

    /// Promotes queued torrents into active slots until `maxActiveTorrents`
    /// is reached or the queue drains.
    async fn fill_active_queue(&self) {
        loop {
            let max_active = self.inner.conf.lock().await.engine.max_active_torrents;
            let active_count = {
                let torrents = self.inner.torrents.lock().await;
                torrents.values().filter(|e| e.session.is_active()).count()
            };
            if active_count >= max_active {
                break;
            }
            let Some(id) = self.inner.queue.lock().await.pop_front() else { break };
            if let Err(e) = self.force_start(id).await {
                log::warn!("Failed to start queued torrent {}: {}", id, e);
            }
        }
    }

    /// A snapshot of every tracked torrent's progress (spec.md §9
    /// `getTorrents`). Unlike the `Progress` events emitted by the stats
    /// loop, this always returns a value per torrent rather than only once
    /// the periodic tick has elapsed.
    pub async fn torrents(&self) -> Vec<Progress> {
        let ids: Vec<TorrentId> = self.inner.torrents.lock().await.keys().copied().collect();
        let mut out = Vec::with_capacity(ids.len());
        for id in ids {
            let connected = self.inner.peer_manager.lock().await.connected_peer_count(id);
            let torrents = self.inner.torrents.lock().await;
            if let Some(entry) = torrents.get(&id) {
                out.push(Self::progress_snapshot(entry, connected).await);
            }
        }
        out
    }

    /// The connected peers for one torrent (spec.md §9 `getPeers`).
    pub async fn peers(&self, id: TorrentId) -> Vec<PeerInfo> {
        self.inner
            .peer_manager
            .lock()
            .await
            .peer_snapshots(id, Instant::now(), choke::SNUB_THRESHOLD)
            .into_iter()
            .map(|s| PeerInfo {
                addr: s.id,
                download_rate: s.download_rate,
                upload_rate: s.upload_rate,
                am_choking: s.am_choking,
                peer_choking: s.peer_choking,
                peer_interested: s.peer_interested,
                am_interested: s.am_interested,
            })
            .collect()
    }

    pub async fn config(&self) -> Conf {
        self.inner.conf.lock().await.clone()
    }

    /// Applies `f` to the engine's configuration, validates the result, and
    /// re-applies any global bandwidth limits it changed (spec.md §9
    /// `updateConfig`).
    pub async fn update_config(&self, f: impl FnOnce(&mut Conf)) -> Result<()> {
        let (upload, download) = {
            let mut conf = self.inner.conf.lock().await;
            f(&mut conf);
            conf.engine.validate()?;
            (conf.engine.max_upload_speed, conf.engine.max_download_speed)
        };
        self.inner
            .bandwidth
            .set_global_limit(Direction::Upload, rate_opt(upload))
            .await;
        self.inner
            .bandwidth
            .set_global_limit(Direction::Download, rate_opt(download))
            .await;
        Ok(())
    }

    pub async fn status(&self) -> EngineStatus {
        let torrents = self.inner.torrents.lock().await;
        let active_torrents = torrents.values().filter(|e| e.session.is_active()).count();
        let mut total_download_rate = 0.0;
        let mut total_upload_rate = 0.0;
        for entry in torrents.values() {
            total_download_rate += entry.session.status.download_rate.read().await.rate();
            total_upload_rate += entry.session.status.upload_rate.read().await.rate();
        }
        EngineStatus {
            active_torrents,
            queued_torrents: self.inner.queue.lock().await.len(),
            listen_addr: *self.inner.listen_addr.lock().await,
            total_download_rate,
            total_upload_rate,
        }
    }

    async fn progress_snapshot(entry: &TorrentEntry, connected_peers: usize) -> Progress {
        let status = &entry.session.status;
        Progress {
            id: entry.session.id,
            state: entry.session.state(),
            downloaded: status.downloaded.load(Ordering::Relaxed),
            uploaded: status.uploaded.load(Ordering::Relaxed),
            total_len: status.storage.download_len,
            download_rate: status.download_rate.read().await.rate(),
            upload_rate: status.upload_rate.read().await.rate(),
            connected_peers,
            progress: status.piece_map.read().await.progress(),
        }
    }

    async fn snapshot_for_persistence(entry: &TorrentEntry) -> PersistedTorrent {
        let status = &entry.session.status;
        let completed_pieces = hex::encode(status.piece_map.read().await.bitfield().to_wire_bytes());
        PersistedTorrent {
            version: persist::SCHEMA_VERSION,
            info_hash: hex::encode(status.info_hash),
            name: entry.session.metadata.name.clone(),
            state: PersistedState::from(entry.session.state()),
            download_dir: status.storage.download_dir.clone(),
            total_len: status.storage.download_len,
            piece_len: entry.session.metadata.piece_len,
            piece_count: entry.session.metadata.piece_count,
            downloaded: status.downloaded.load(Ordering::Relaxed),
            uploaded: status.uploaded.load(Ordering::Relaxed),
            added_at: entry.added_at,
            completed_at: entry.completed_at,
            completed_pieces,
            labels: entry.labels.clone(),
        }
    }

    /// Drives one torrent's tracker announces for as long as it stays
    /// active: an initial `started` announce, periodic re-announces at the
    /// tracker-provided (or configured default) interval, and a one-time
    /// `completed` announce the first time the torrent finishes.
    async fn run_announce_loop(inner: Arc<EngineInner>, id: TorrentId, listen_port: u16) {
        let Some((info_hash, client_id)) = ({
            let torrents = inner.torrents.lock().await;
            torrents.get(&id).map(|e| (e.session.status.info_hash, e.session.status.client_id))
        }) else {
            return;
        };

        let mut event = tracker::Event::Started;
        let mut announced_completed = false;

        loop {
            let Some((downloaded, uploaded, left, state)) = ({
                let torrents = inner.torrents.lock().await;
                torrents.get(&id).map(|e| {
                    (
                        e.session.status.downloaded.load(Ordering::Relaxed),
                        e.session.status.uploaded.load(Ordering::Relaxed),
                        e.session.status.left(),
                        e.session.state(),
                    )
                })
            }) else {
                return;
            };

            if state == State::Seeding && !announced_completed {
                event = tracker::Event::Completed;
            }

            let params = AnnounceParams {
                info_hash,
                peer_id: client_id,
                port: listen_port,
                uploaded,
                downloaded,
                left,
                event,
                num_want: Some(50),
            };

            let default_interval = inner.conf.lock().await.torrent.announce_interval;
            let announce_result = {
                let mut torrents = inner.torrents.lock().await;
                let Some(entry) = torrents.get_mut(&id) else { return };
                entry.tracker.announce(&params).await
            };

            let sleep_for = match announce_result {
                Ok(response) => {
                    if event == tracker::Event::Completed {
                        announced_completed = true;
                    }
                    event = tracker::Event::None;
                    {
                        let mut manager = inner.peer_manager.lock().await;
                        manager.enqueue_addrs(id, response.peers);
                        manager.fill_outbound_slots(id);
                    }
                    response
                        .min_interval
                        .map(Duration::from_secs)
                        .unwrap_or_else(|| Duration::from_secs(response.interval).max(default_interval))
                }
                Err(e) => {
                    log::debug!("Announce failed for torrent {}: {}", id, e);
                    let exhausted = {
                        let torrents = inner.torrents.lock().await;
                        torrents.get(&id).map(|e| e.tracker.is_exhausted()).unwrap_or(true)
                    };
                    if exhausted {
                        let mut torrents = inner.torrents.lock().await;
                        if let Some(entry) = torrents.get_mut(&id) {
                            entry.session.fail("every tracker tier exhausted");
                        }
                        let _ = inner.events.send(EngineEvent::TorrentErrored {
                            id,
                            msg: "every tracker tier exhausted".into(),
                        });
                        return;
                    }
                    default_interval
                }
            };

            tokio::time::sleep(sleep_for).await;

            let still_active = {
                let torrents = inner.torrents.lock().await;
                torrents.get(&id).map(|e| e.session.is_active()).unwrap_or(false)
            };
            if !still_active {
                return;
            }
        }
    }

    /// Recalculates the choke/unchoke set for every torrent on
    /// [`choke::RECALC_INTERVAL`], rotating the optimistic-unchoke
    /// candidate every [`choke::OPTIMISTIC_ROTATE_INTERVAL`].
    async fn run_choke_loop(inner: Arc<EngineInner>) {
        let mut ticker = tokio::time::interval(choke::RECALC_INTERVAL);
        loop {
            ticker.tick().await;
            let now = Instant::now();
            let ids: Vec<TorrentId> = inner.torrents.lock().await.keys().copied().collect();

            for id in ids {
                let Some((mode, rotate, stored_candidate)) = ({
                    let mut torrents = inner.torrents.lock().await;
                    torrents.get_mut(&id).map(|entry| {
                        let mode = if entry.session.state() == State::Seeding {
                            choke::Mode::Seed
                        } else {
                            choke::Mode::Leech
                        };
                        let rotate =
                            now.duration_since(entry.last_optimistic_rotate) >= choke::OPTIMISTIC_ROTATE_INTERVAL;
                        if rotate {
                            entry.last_optimistic_rotate = now;
                        }
                        (mode, rotate, entry.optimistic_candidate)
                    })
                }) else {
                    continue;
                };

                let snapshots = inner.peer_manager.lock().await.peer_snapshots(id, now, choke::SNUB_THRESHOLD);

                // `reconcile` re-derives the regular set internally and
                // only honors the optimistic candidate if it falls outside
                // it, so picking from the full interested pool here (rather
                // than excluding the regular set ourselves) is sufficient.
                let candidate = if rotate {
                    choke::pick_optimistic_candidate(&snapshots, &[])
                } else {
                    stored_candidate
                };
                if rotate {
                    let mut torrents = inner.torrents.lock().await;
                    if let Some(entry) = torrents.get_mut(&id) {
                        entry.optimistic_candidate = candidate;
                    }
                }

                let actions = choke::reconcile(&snapshots, mode, candidate);
                if let Err(e) = inner.peer_manager.lock().await.apply_choke_actions(id, actions) {
                    log::debug!("Failed to apply choke actions for torrent {}: {}", id, e);
                }
            }
        }
    }

    async fn run_bandwidth_loop(inner: Arc<EngineInner>) {
        let mut ticker = tokio::time::interval(BandwidthLimiter::tick_interval());
        loop {
            ticker.tick().await;
            inner.bandwidth.tick().await;
        }
    }

    /// Advances every torrent's rate counters, emits a `Progress` event
    /// whenever one is due, and persists the torrent's state (spec.md §6)
    /// on the same ~1s tick.
    async fn run_stats_loop(inner: Arc<EngineInner>) {
        let mut ticker = tokio::time::interval(crate::torrent::STATS_TICK);
        loop {
            ticker.tick().await;
            let now = Instant::now();
            let ids: Vec<TorrentId> = inner.torrents.lock().await.keys().copied().collect();

            for id in ids {
                let connected = inner.peer_manager.lock().await.connected_peer_count(id);

                let Some((progress, persisted)) = ({
                    let mut torrents = inner.torrents.lock().await;
                    match torrents.get_mut(&id) {
                        Some(entry) => {
                            entry.session.set_connected_peers(connected);
                            let progress = entry.session.tick_stats(now).await;
                            if entry.completed_at.is_none() && entry.session.state() == State::Seeding {
                                entry.completed_at = Some(unix_now());
                            }
                            Some((progress, Self::snapshot_for_persistence(entry).await))
                        }
                        None => None,
                    }
                }) else {
                    continue;
                };

                if let Some(progress) = progress {
                    let _ = inner.events.send(EngineEvent::Progress(progress));
                }

                let data_dir = inner.conf.lock().await.engine.data_dir.clone();
                if let Err(e) = persist::save(&data_dir, &persisted) {
                    log::warn!("Failed to persist torrent {} state: {}", id, e);
                }
            }
        }
    }

    /// Retries every torrent's queued writes on
    /// [`crate::conf::DiskConf::disk_full_recheck_interval`].
    async fn run_disk_retry_loop(inner: Arc<EngineInner>) {
        let interval = inner.conf.lock().await.disk.disk_full_recheck_interval;
        let mut ticker = tokio::time::interval(interval);
        loop {
            ticker.tick().await;
            if let Err(e) = inner.disk.retry_pending_writes() {
                log::warn!("Failed to trigger disk write retry: {}", e);
            }
        }
    }

    /// Drains the disk task's torrent-independent alert channel for the
    /// engine's entire lifetime. Each `TorrentAllocation` spawns a
    /// dedicated pump for that torrent's own alert stream.
    async fn run_alert_pump(inner: Arc<EngineInner>, mut alert_port: crate::disk::AlertReceiver) {
        while let Some(alert) = alert_port.recv().await {
            match alert {
                Alert::TorrentAllocation(Ok(TorrentAllocation { id, alert_port })) => {
                    let verify_on_add = {
                        let torrents = inner.torrents.lock().await;
                        torrents.get(&id).map(|e| e.session.conf.verify_on_add).unwrap_or(true)
                    };
                    if verify_on_add {
                        if let Err(e) = inner.disk.verify_torrent(id) {
                            log::warn!("Failed to queue verification for torrent {}: {}", id, e);
                        }
                    } else {
                        let mut torrents = inner.torrents.lock().await;
                        if let Some(entry) = torrents.get_mut(&id) {
                            let _ = entry.session.apply_verification(Vec::new()).await;
                        }
                    }
                    tokio::spawn(Self::run_torrent_alert_pump(inner.clone(), id, alert_port));
                }
                Alert::TorrentAllocation(Err(e)) => {
                    log::warn!("Disk allocation failed: {}", e);
                }
            }
        }
    }

    /// Drains one torrent's alert stream until the disk task drops its
    /// sender, which happens as soon as the torrent is removed or paused
    /// (both release the disk task's in-memory state for it).
    async fn run_torrent_alert_pump(
        inner: Arc<EngineInner>,
        id: TorrentId,
        mut alert_port: crate::disk::TorrentAlertReceiver,
    ) {
        while let Some(alert) = alert_port.recv().await {
            match alert {
                TorrentAlert::BlockRead(result) => {
                    inner.peer_manager.lock().await.dispatch_block_read(id, result);
                }
                TorrentAlert::BatchWrite(batch) => {
                    let Some(index) = batch.blocks.first().map(|b| b.piece_index) else { continue };
                    let became_complete = {
                        let mut torrents = inner.torrents.lock().await;
                        let Some(entry) = torrents.get_mut(&id) else { continue };
                        if batch.is_piece_valid {
                            entry.session.on_piece_verified(index).await.unwrap_or(false)
                        } else {
                            entry.session.on_piece_failed(index).await;
                            false
                        }
                    };
                    if became_complete {
                        let _ = inner.events.send(EngineEvent::TorrentCompleted { id });
                    }
                }
                TorrentAlert::VerificationProgress { verified, total } => {
                    log::debug!("Torrent {} verification progress: {}/{}", id, verified, total);
                }
                TorrentAlert::VerificationComplete { good_pieces } => {
                    let became_complete = {
                        let mut torrents = inner.torrents.lock().await;
                        let Some(entry) = torrents.get_mut(&id) else { continue };
                        let was_seeding = entry.session.state() == State::Seeding;
                        let _ = entry.session.apply_verification(good_pieces).await;
                        !was_seeding && entry.session.state() == State::Seeding
                    };
                    if became_complete {
                        let _ = inner.events.send(EngineEvent::TorrentCompleted { id });
                    }
                }
                TorrentAlert::DiskFull { required, available } => {
                    // The disk task's own `pending_writes` queue already
                    // retries internally; nothing to do here but log.
                    log::warn!(
                        "Torrent {} write queue backed up: disk full (need {} bytes, {} available)",
                        id,
                        required,
                        available
                    );
                }
                TorrentAlert::SpaceAvailable => {
                    log::info!("Torrent {} resuming writes: disk space available again", id);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bencode::{self, build, Value};
    use std::collections::BTreeMap;

    fn sample_torrent_bytes() -> Vec<u8> {
        let piece_len = 16;
        let total_len = 16;
        let mut info = BTreeMap::new();
        info.insert(b"name".to_vec(), build::bytestring("t.bin"));
        info.insert(b"piece length".to_vec(), Value::Integer(piece_len));
        info.insert(b"pieces".to_vec(), Value::ByteString(vec![0u8; 20]));
        info.insert(b"length".to_vec(), Value::Integer(total_len));
        let mut top = BTreeMap::new();
        top.insert(b"info".to_vec(), Value::Dict(info));
        top.insert(
            b"announce".to_vec(),
            build::bytestring("http://tracker.example/announce"),
        );
        bencode::encode(&Value::Dict(top))
    }

    fn test_conf() -> Conf {
        let dir = tempfile::tempdir().unwrap();
        let mut conf = Conf::new(dir.path().join("data"), dir.path().join("downloads"));
        // keep the directory alive for the duration of the test by leaking
        // it into the conf's paths; tempdir cleans up on process exit only,
        // which is fine for these short-lived unit tests.
        std::mem::forget(dir);
        conf.torrent.start_on_add = false;
        // port 0 lets the OS assign an ephemeral port so parallel test runs
        // started via `engine.start()` never collide on a fixed range.
        conf.engine.port_range = (0, 0);
        conf
    }

    #[tokio::test]
    async fn add_torrent_without_autostart_queues_it() {
        let (engine, mut events) = Engine::new(test_conf()).unwrap();
        let id = engine.add_torrent(&sample_torrent_bytes()).await.unwrap();
        assert!(matches!(events.recv().await, Some(EngineEvent::TorrentAdded { id: added }) if added == id));
        let status = engine.status().await;
        assert_eq!(status.queued_torrents, 1);
        assert_eq!(status.active_torrents, 0);
    }

    #[tokio::test]
    async fn double_start_is_rejected() {
        let (engine, _events) = Engine::new(test_conf()).unwrap();
        engine.start().await.unwrap();
        assert!(engine.start().await.is_err());
    }

    #[tokio::test]
    async fn shutdown_without_start_is_rejected() {
        let (engine, _events) = Engine::new(test_conf()).unwrap();
        assert!(engine.shutdown().await.is_err());
    }

    #[tokio::test]
    async fn remove_unknown_torrent_is_an_error() {
        let (engine, _events) = Engine::new(test_conf()).unwrap();
        assert!(engine.remove_torrent(1, false).await.is_err());
    }

    #[tokio::test]
    async fn add_then_remove_torrent_round_trips() {
        let (engine, mut events) = Engine::new(test_conf()).unwrap();
        let id = engine.add_torrent(&sample_torrent_bytes()).await.unwrap();
        let _ = events.recv().await;
        engine.remove_torrent(id, false).await.unwrap();
        assert!(matches!(events.recv().await, Some(EngineEvent::TorrentRemoved { id: removed }) if removed == id));
        assert!(engine.torrents().await.is_empty());
    }
}
