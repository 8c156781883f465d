//! Manages every peer connection across every torrent: the outbound
//! connection queue, per-peer backoff and banning, inbound accept loop, and
//! forwarding of disk-read results back to the session that requested them
//! (spec.md §4.6).

use std::collections::{HashMap, VecDeque};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures::{SinkExt, StreamExt};
use rand::Rng;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, Mutex};
use tokio_util::codec::{Framed, FramedParts};

use super::codec::{Handshake, HandshakeCodec, PeerCodec};
use super::connection::DEFAULT_CONNECT_TIMEOUT;
use super::session::{Command, PeerSession, PeerStats};
use crate::bandwidth::BandwidthLimiter;
use crate::choke::PeerSnapshot;
use crate::disk::DiskHandle;
use crate::error::Error;
use crate::torrent::SharedStatus;
use crate::{BlockInfo, PeerId, Result, Sha1Hash, TorrentId};

const INITIAL_BACKOFF: Duration = Duration::from_secs(30);
const MAX_BACKOFF: Duration = Duration::from_secs(15 * 60);
const BAN_THRESHOLD: u32 = 3;
/// How long we'll wait for an accepted connection's handshake before giving
/// up on it, reusing the outbound connect timeout as a reasonable default.
const INBOUND_HANDSHAKE_TIMEOUT: Duration = DEFAULT_CONNECT_TIMEOUT;

/// Tracks one outbound address's consecutive failures and next-retry time.
struct RetryState {
    consecutive_failures: u32,
    next_attempt_at: Instant,
    banned: bool,
}

impl RetryState {
    fn fresh() -> Self {
        Self {
            consecutive_failures: 0,
            next_attempt_at: Instant::now(),
            banned: false,
        }
    }

    fn on_failure(&mut self, now: Instant) {
        self.consecutive_failures += 1;
        if self.consecutive_failures >= BAN_THRESHOLD {
            self.banned = true;
            return;
        }
        let exp = 1u32 << (self.consecutive_failures.min(8) - 1);
        let backoff = (INITIAL_BACKOFF * exp).min(MAX_BACKOFF);
        let jitter_ms = rand::thread_rng().gen_range(0..1000);
        self.next_attempt_at = now + backoff + Duration::from_millis(jitter_ms);
    }

    fn on_success(&mut self) {
        self.consecutive_failures = 0;
        self.banned = false;
    }
}

/// A connected or connecting peer's command channel, keyed by address, used
/// to forward choke decisions and disk-read results to its session task.
struct ConnectedPeer {
    cmd_chan: mpsc::UnboundedSender<Command>,
    stats: Arc<PeerStats>,
}

/// Notifications a running [`PeerSession`] sends back to the manager, since
/// the manager (not the session) owns cross-peer bookkeeping like the
/// outbound retry schedule and the disk-read FIFO.
pub(crate) enum PeerEvent {
    ReadRequested { torrent_id: TorrentId, addr: SocketAddr },
    Disconnected { torrent_id: TorrentId, addr: SocketAddr, had_error: bool },
}

/// Per-torrent bookkeeping: the outbound queue, connected peers, and the
/// FIFO of in-flight disk reads so alerts can be routed back to their
/// requesting session without carrying the address through the disk task.
struct ManagedTorrent {
    status: Arc<SharedStatus>,
    outbound_queue: VecDeque<SocketAddr>,
    connected: HashMap<SocketAddr, ConnectedPeer>,
    pending_reads: VecDeque<SocketAddr>,
}

/// Owns every peer connection, enforcing the global and per-torrent
/// connection caps, outbound connection attempts with backoff, and a single
/// inbound listening socket (spec.md §4.6).
pub(crate) struct PeerManager {
    client_id: PeerId,
    max_connections: usize,
    max_connections_per_torrent: usize,
    retry_state: HashMap<SocketAddr, RetryState>,
    torrents: HashMap<TorrentId, ManagedTorrent>,
    /// Reverse lookup used by the inbound listener to match an incoming
    /// handshake's info hash to its torrent.
    info_hashes: HashMap<Sha1Hash, TorrentId>,
    disk: DiskHandle,
    bandwidth: Arc<BandwidthLimiter>,
    total_connections: usize,
    events_chan: mpsc::UnboundedSender<PeerEvent>,
}

impl PeerManager {
    /// Returns the manager plus the receiving end of the event channel
    /// every spawned [`PeerSession`] reports to; the caller is expected to
    /// drive [`PeerManager::run_event_loop`] on it.
    pub fn new(
        client_id: PeerId,
        max_connections: usize,
        max_connections_per_torrent: usize,
        disk: DiskHandle,
        bandwidth: Arc<BandwidthLimiter>,
    ) -> (Self, mpsc::UnboundedReceiver<PeerEvent>) {
        let (events_chan, events_port) = mpsc::unbounded_channel();
        (
            Self {
                client_id,
                max_connections,
                max_connections_per_torrent,
                retry_state: HashMap::new(),
                torrents: HashMap::new(),
                info_hashes: HashMap::new(),
                disk,
                bandwidth,
                total_connections: 0,
                events_chan,
            },
            events_port,
        )
    }

    /// Drains `events_port` forever, applying each [`PeerEvent`] to the
    /// shared manager. Intended to be spawned once as its own task.
    pub async fn run_event_loop(
        manager: Arc<Mutex<PeerManager>>,
        mut events_port: mpsc::UnboundedReceiver<PeerEvent>,
    ) {
        while let Some(event) = events_port.recv().await {
            let mut manager = manager.lock().await;
            match event {
                PeerEvent::ReadRequested { torrent_id, addr } => {
                    manager.record_pending_read(torrent_id, addr);
                }
                PeerEvent::Disconnected { torrent_id, addr, had_error } => {
                    manager.on_disconnected(torrent_id, addr, had_error);
                }
            }
        }
    }

    pub fn add_torrent(&mut self, id: TorrentId, status: Arc<SharedStatus>) {
        self.info_hashes.insert(status.info_hash, id);
        self.torrents.insert(
            id,
            ManagedTorrent {
                status,
                outbound_queue: VecDeque::new(),
                connected: HashMap::new(),
                pending_reads: VecDeque::new(),
            },
        );
    }

    pub fn remove_torrent(&mut self, id: TorrentId) {
        if let Some(torrent) = self.torrents.remove(&id) {
            self.info_hashes.remove(&torrent.status.info_hash);
            self.total_connections = self.total_connections.saturating_sub(torrent.connected.len());
            for (_, peer) in torrent.connected {
                let _ = peer.cmd_chan.send(Command::Shutdown);
            }
        }
    }

    /// Looks up the torrent an inbound handshake's info hash belongs to.
    pub fn resolve_info_hash(&self, info_hash: &Sha1Hash) -> Option<(TorrentId, Arc<SharedStatus>)> {
        let id = *self.info_hashes.get(info_hash)?;
        let status = self.torrents.get(&id)?.status.clone();
        Some((id, status))
    }

    /// Registers an inbound connection that already passed its handshake,
    /// enforcing the same global/per-torrent caps as outbound dialing.
    /// Returns `false` if the connection must be rejected.
    pub fn register_inbound(
        &mut self,
        id: TorrentId,
        addr: SocketAddr,
        cmd_chan: mpsc::UnboundedSender<Command>,
        stats: Arc<PeerStats>,
    ) -> bool {
        if self.total_connections >= self.max_connections {
            return false;
        }
        let Some(torrent) = self.torrents.get_mut(&id) else { return false };
        if torrent.connected.len() >= self.max_connections_per_torrent
            || torrent.connected.contains_key(&addr)
        {
            return false;
        }
        torrent.connected.insert(addr, ConnectedPeer { cmd_chan, stats });
        self.total_connections += 1;
        true
    }

    /// Binds the inbound listening socket to the first available port in
    /// `port_range` (spec.md §4.6) and spawns the accept loop as its own
    /// task. Returns the bound address so the engine can report it.
    pub async fn listen(
        manager: Arc<Mutex<PeerManager>>,
        port_range: (u16, u16),
        our_peer_id: PeerId,
    ) -> Result<SocketAddr> {
        let mut last_err = None;
        for port in port_range.0..=port_range.1 {
            match TcpListener::bind(("0.0.0.0", port)).await {
                Ok(listener) => {
                    let addr = listener.local_addr()?;
                    tokio::spawn(Self::run_listener(manager, listener, our_peer_id));
                    return Ok(addr);
                }
                Err(e) => last_err = Some(e),
            }
        }
        Err(last_err
            .map(Error::Io)
            .unwrap_or_else(|| Error::Network("empty listen port range".into())))
    }

    async fn run_listener(manager: Arc<Mutex<PeerManager>>, listener: TcpListener, our_peer_id: PeerId) {
        loop {
            let (stream, addr) = match listener.accept().await {
                Ok(pair) => pair,
                Err(e) => {
                    log::warn!("Inbound accept failed: {}", e);
                    continue;
                }
            };
            let manager = manager.clone();
            tokio::spawn(async move {
                if let Err(e) = Self::handle_inbound(manager, stream, addr, our_peer_id).await {
                    log::debug!("Inbound connection from {} rejected: {}", addr, e);
                }
            });
        }
    }

    /// Performs the handshake-first side of the exchange (we accepted the
    /// connection, so the peer speaks first), resolves the torrent, then
    /// hands the connection off to a freshly constructed [`PeerSession`].
    async fn handle_inbound(
        manager: Arc<Mutex<PeerManager>>,
        stream: TcpStream,
        addr: SocketAddr,
        our_peer_id: PeerId,
    ) -> Result<()> {
        let mut socket = Framed::new(stream, HandshakeCodec);
        let peer_handshake = tokio::time::timeout(INBOUND_HANDSHAKE_TIMEOUT, socket.next())
            .await
            .map_err(|_| Error::Timeout)?
            .ok_or_else(|| Error::Peer {
                peer_id: None,
                msg: "connection closed during handshake".into(),
            })??;

        let (torrent_id, status, disk, bandwidth, events_chan) = {
            let manager = manager.lock().await;
            let Some((id, status)) = manager.resolve_info_hash(&peer_handshake.info_hash) else {
                return Err(Error::Peer {
                    peer_id: Some(peer_handshake.peer_id),
                    msg: "unknown info hash".into(),
                });
            };
            (id, status, manager.disk.clone(), manager.bandwidth.clone(), manager.events_chan.clone())
        };

        socket.send(Handshake::new(status.info_hash, our_peer_id)).await?;

        let parts = socket.into_parts();
        let parts = FramedParts::new(parts.io, PeerCodec);
        let socket = Framed::from_parts(parts);

        let (mut session, cmd_chan, stats) = PeerSession::inbound(
            addr,
            peer_handshake.peer_id,
            our_peer_id,
            torrent_id,
            status,
            disk,
            bandwidth,
            events_chan,
        );

        {
            let mut manager = manager.lock().await;
            if !manager.register_inbound(torrent_id, addr, cmd_chan, stats) {
                return Err(Error::Peer {
                    peer_id: Some(peer_handshake.peer_id),
                    msg: "connection cap reached".into(),
                });
            }
        }

        session.start_inbound(socket).await
    }

    /// Queues addresses received from a tracker announce for this torrent,
    /// to be dialed as slots free up.
    pub fn enqueue_addrs(&mut self, id: TorrentId, addrs: impl IntoIterator<Item = SocketAddr>) {
        if let Some(torrent) = self.torrents.get_mut(&id) {
            for addr in addrs {
                if !torrent.connected.contains_key(&addr) && !torrent.outbound_queue.contains(&addr)
                {
                    torrent.outbound_queue.push_back(addr);
                }
            }
        }
    }

    pub fn connected_peer_count(&self, id: TorrentId) -> usize {
        self.torrents.get(&id).map(|t| t.connected.len()).unwrap_or(0)
    }

    /// Dials as many queued addresses as current caps and backoff schedules
    /// allow, spawning a session task per connection.
    pub fn fill_outbound_slots(&mut self, id: TorrentId) {
        if self.total_connections >= self.max_connections {
            return;
        }
        let Some(torrent) = self.torrents.get_mut(&id) else { return };
        let now = Instant::now();
        let mut retry = Vec::new();

        while torrent.connected.len() < self.max_connections_per_torrent
            && self.total_connections < self.max_connections
        {
            let Some(addr) = torrent.outbound_queue.pop_front() else { break };

            let state = self.retry_state.entry(addr).or_insert_with(RetryState::fresh);
            if state.banned {
                continue;
            }
            if state.next_attempt_at > now {
                retry.push(addr);
                continue;
            }

            let (mut session, cmd_chan, stats) = PeerSession::outbound(
                addr,
                self.client_id,
                id,
                torrent.status.clone(),
                self.disk.clone(),
                self.bandwidth.clone(),
                self.events_chan.clone(),
            );
            torrent.connected.insert(addr, ConnectedPeer { cmd_chan, stats });
            self.total_connections += 1;

            tokio::spawn(async move {
                if let Err(e) = session.start().await {
                    log::debug!("Peer session for {} ended: {}", addr, e);
                }
            });
        }

        // addresses still under backoff go back on the queue for a later pass
        for addr in retry {
            torrent.outbound_queue.push_back(addr);
        }
    }

    /// Records that a connection to `addr` ended, updating backoff state
    /// and freeing its slot.
    pub fn on_disconnected(&mut self, id: TorrentId, addr: SocketAddr, had_error: bool) {
        if let Some(torrent) = self.torrents.get_mut(&id) {
            if torrent.connected.remove(&addr).is_some() {
                self.total_connections = self.total_connections.saturating_sub(1);
            }
        }
        let state = self.retry_state.entry(addr).or_insert_with(RetryState::fresh);
        if had_error {
            state.on_failure(Instant::now());
        } else {
            state.on_success();
        }
    }

    pub fn send_choke(&self, id: TorrentId, addr: SocketAddr, choke: bool) -> Result<()> {
        if let Some(torrent) = self.torrents.get(&id) {
            if let Some(peer) = torrent.connected.get(&addr) {
                let cmd = if choke { Command::Choke } else { Command::Unchoke };
                peer.cmd_chan.send(cmd)?;
            }
        }
        Ok(())
    }

    /// A choking-algorithm-ready snapshot of every connected peer for one
    /// torrent (spec.md §4.7). `snub_threshold` is passed in rather than
    /// imported from `choke` to keep this module independent of it.
    pub fn peer_snapshots(
        &self,
        id: TorrentId,
        now: Instant,
        snub_threshold: Duration,
    ) -> Vec<PeerSnapshot<SocketAddr>> {
        let Some(torrent) = self.torrents.get(&id) else { return Vec::new() };
        torrent
            .connected
            .iter()
            .map(|(addr, peer)| PeerSnapshot {
                id: *addr,
                download_rate: peer.stats.download_rate(),
                upload_rate: peer.stats.upload_rate(),
                am_choking: peer.stats.am_choking.load(std::sync::atomic::Ordering::Relaxed),
                peer_interested: peer.stats.peer_interested.load(std::sync::atomic::Ordering::Relaxed),
                am_interested: peer.stats.am_interested.load(std::sync::atomic::Ordering::Relaxed),
                peer_choking: peer.stats.peer_choking.load(std::sync::atomic::Ordering::Relaxed),
                snubbed: peer.stats.is_snubbed(now, snub_threshold),
            })
            .collect()
    }

    /// Records that `addr` just issued a disk read for one of its peer's
    /// requests, so the eventual `BlockRead` alert (which carries no peer
    /// identity of its own) can be routed back to it. Reads for a torrent
    /// are served FIFO by the single-task disk manager, so a plain queue
    /// here reproduces the original request order (spec.md §5).
    pub fn record_pending_read(&mut self, id: TorrentId, addr: SocketAddr) {
        if let Some(torrent) = self.torrents.get_mut(&id) {
            torrent.pending_reads.push_back(addr);
        }
    }

    /// Forwards a `BlockRead` alert to whichever peer's read is longest
    /// outstanding for this torrent.
    pub fn dispatch_block_read(
        &mut self,
        id: TorrentId,
        result: Result<(BlockInfo, Vec<u8>), Error>,
    ) {
        let Some(torrent) = self.torrents.get_mut(&id) else { return };
        let Some(addr) = torrent.pending_reads.pop_front() else { return };
        if let Some(peer) = torrent.connected.get(&addr) {
            let _ = peer.cmd_chan.send(Command::BlockReady(result));
        }
    }

    /// Applies a batch of choke/unchoke decisions produced by
    /// [`crate::choke::reconcile`].
    pub fn apply_choke_actions(
        &self,
        id: TorrentId,
        actions: Vec<crate::choke::ChokeAction<SocketAddr>>,
    ) -> Result<()> {
        for action in actions {
            self.send_choke(id, action.peer_id, action.verb == crate::choke::Verb::Choke)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_doubles_until_cap_then_bans() {
        let mut state = RetryState::fresh();
        let now = Instant::now();
        state.on_failure(now);
        assert_eq!(state.consecutive_failures, 1);
        assert!(!state.banned);
        state.on_failure(now);
        assert_eq!(state.consecutive_failures, 2);
        state.on_failure(now);
        assert!(state.banned);
    }

    #[test]
    fn success_resets_failure_count_and_ban() {
        let mut state = RetryState::fresh();
        let now = Instant::now();
        state.on_failure(now);
        state.on_failure(now);
        state.on_failure(now);
        assert!(state.banned);
        state.on_success();
        assert_eq!(state.consecutive_failures, 0);
        assert!(!state.banned);
    }
}
