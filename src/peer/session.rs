//! A single peer connection's session: handshake, message dispatch, request
//! pipelining, and choke/interest bookkeeping for both the download and
//! upload paths (spec.md §3, §4.5).
//!
//! Generalized from an earlier download-only prototype that drove the
//! handshake and message loop inline; this version separates connection
//! setup ([`super::connection::ConnectionHandle`]) from wire framing
//! ([`super::codec`]) and adds the upload (seed) side the prototype never
//! implemented.

use std::collections::{HashSet, VecDeque};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::{Duration, Instant};

use futures::future::FutureExt;
use futures::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_util::codec::{Framed, FramedParts};

use super::codec::{Handshake, HandshakeCodec, Message, PeerCodec};
use super::connection::{ConnectionConf, ConnectionHandle, ConnectionState};
use super::manager::PeerEvent;
use crate::bandwidth::{BandwidthLimiter, Direction};
use crate::counter::RateCounter;
use crate::disk::DiskHandle;
use crate::piece::{Bitfield, PieceDownload};
use crate::torrent::SharedStatus;
use crate::{error::Error, BlockInfo, PeerId, PieceIndex, Result, Sha1Hash, TorrentId};

/// The maximum number of outstanding block requests kept in flight to one
/// peer at a time.
const MAX_REQUEST_QUEUE: usize = 8;

/// Commands the owning peer manager/choking algorithm sends to a running
/// session.
#[derive(Debug)]
pub(crate) enum Command {
    Choke,
    Unchoke,
    /// Forwards a block read back from the disk task, in response to an
    /// earlier `serve_request` read, ready to send to the peer.
    BlockReady(Result<(BlockInfo, Vec<u8>), Error>),
    Shutdown,
}

/// A peer's interest/choke status from both sides, plus the data needed by
/// the choking algorithm and snub detection (spec.md §4.7).
#[derive(Debug)]
pub(crate) struct Status {
    pub am_choking: bool,
    pub am_interested: bool,
    pub peer_choking: bool,
    pub peer_interested: bool,
    pub last_block_received_at: Option<Instant>,
}

impl Default for Status {
    fn default() -> Self {
        Self {
            am_choking: true,
            am_interested: false,
            peer_choking: true,
            peer_interested: false,
            last_block_received_at: None,
        }
    }
}

impl Status {
    /// A peer is snubbed if we're interested, it isn't choking us, and we
    /// haven't received a block from it in `threshold` (spec.md §4.7).
    pub fn is_snubbed(&self, now: Instant, threshold: Duration) -> bool {
        self.am_interested
            && !self.peer_choking
            && match self.last_block_received_at {
                Some(at) => now.duration_since(at) >= threshold,
                None => true,
            }
    }
}

/// A lock-light snapshot of a peer's choke-relevant state, shared between a
/// running [`PeerSession`] and [`super::manager::PeerManager`] so the
/// choking algorithm can read it without routing through the session's own
/// task (spec.md §4.7).
#[derive(Debug, Default)]
pub(crate) struct PeerStats {
    pub am_choking: AtomicBool,
    pub am_interested: AtomicBool,
    pub peer_choking: AtomicBool,
    pub peer_interested: AtomicBool,
    pub last_block_received_at: StdMutex<Option<Instant>>,
    pub download_rate: StdMutex<RateCounter>,
    pub upload_rate: StdMutex<RateCounter>,
}

impl PeerStats {
    fn new() -> Self {
        Self {
            am_choking: AtomicBool::new(true),
            am_interested: AtomicBool::new(false),
            peer_choking: AtomicBool::new(true),
            peer_interested: AtomicBool::new(false),
            last_block_received_at: StdMutex::new(None),
            download_rate: StdMutex::new(RateCounter::new()),
            upload_rate: StdMutex::new(RateCounter::new()),
        }
    }

    pub fn download_rate(&self) -> f64 {
        self.download_rate.lock().unwrap().rate()
    }

    pub fn upload_rate(&self) -> f64 {
        self.upload_rate.lock().unwrap().rate()
    }

    /// Mirrors [`Status::is_snubbed`]'s rule against the shared snapshot.
    pub fn is_snubbed(&self, now: Instant, threshold: Duration) -> bool {
        self.am_interested.load(Ordering::Relaxed)
            && !self.peer_choking.load(Ordering::Relaxed)
            && match *self.last_block_received_at.lock().unwrap() {
                Some(at) => now.duration_since(at) >= threshold,
                None => true,
            }
    }
}

pub(crate) struct PeerSession {
    addr: SocketAddr,
    is_outbound: bool,
    peer_id: Option<PeerId>,
    our_peer_id: PeerId,
    info_hash: Sha1Hash,
    torrent_id: TorrentId,
    conn: ConnectionHandle,
    status: Status,
    stats: Arc<PeerStats>,
    status_shared: Arc<SharedStatus>,
    disk: DiskHandle,
    bandwidth: Arc<BandwidthLimiter>,
    peer_pieces: Bitfield,
    in_progress: std::collections::HashMap<PieceIndex, PieceDownload>,
    pending_uploads: VecDeque<BlockInfo>,
    cmd_port: mpsc::UnboundedReceiver<Command>,
    events: mpsc::UnboundedSender<PeerEvent>,
}

impl PeerSession {
    pub fn outbound(
        addr: SocketAddr,
        our_peer_id: PeerId,
        torrent_id: TorrentId,
        status_shared: Arc<SharedStatus>,
        disk: DiskHandle,
        bandwidth: Arc<BandwidthLimiter>,
        events: mpsc::UnboundedSender<PeerEvent>,
    ) -> (Self, mpsc::UnboundedSender<Command>, Arc<PeerStats>) {
        let (cmd_chan, cmd_port) = mpsc::unbounded_channel();
        let piece_count = status_shared.storage.piece_count;
        let info_hash = status_shared.info_hash;
        let stats = Arc::new(PeerStats::new());
        (
            Self {
                addr,
                is_outbound: true,
                peer_id: None,
                our_peer_id,
                info_hash,
                torrent_id,
                conn: ConnectionHandle::new(ConnectionConf::default()),
                status: Status::default(),
                stats: stats.clone(),
                status_shared,
                disk,
                bandwidth,
                peer_pieces: Bitfield::allocate(piece_count),
                in_progress: std::collections::HashMap::new(),
                pending_uploads: VecDeque::new(),
                cmd_port,
                events,
            },
            cmd_chan,
            stats,
        )
    }

    /// Constructs a session for a connection we accepted, whose handshake
    /// has already been read and matched to `torrent_id` by the caller
    /// (`PeerManager`'s listener, which alone knows every torrent's info
    /// hash). Unlike [`PeerSession::outbound`], the wire socket itself is
    /// handed to [`PeerSession::start_inbound`] rather than dialed here.
    pub fn inbound(
        addr: SocketAddr,
        peer_id: PeerId,
        our_peer_id: PeerId,
        torrent_id: TorrentId,
        status_shared: Arc<SharedStatus>,
        disk: DiskHandle,
        bandwidth: Arc<BandwidthLimiter>,
        events: mpsc::UnboundedSender<PeerEvent>,
    ) -> (Self, mpsc::UnboundedSender<Command>, Arc<PeerStats>) {
        let (cmd_chan, cmd_port) = mpsc::unbounded_channel();
        let piece_count = status_shared.storage.piece_count;
        let info_hash = status_shared.info_hash;
        let stats = Arc::new(PeerStats::new());
        (
            Self {
                addr,
                is_outbound: false,
                peer_id: Some(peer_id),
                our_peer_id,
                info_hash,
                torrent_id,
                conn: ConnectionHandle::new(ConnectionConf::default()),
                status: Status::default(),
                stats: stats.clone(),
                status_shared,
                disk,
                bandwidth,
                peer_pieces: Bitfield::allocate(piece_count),
                in_progress: std::collections::HashMap::new(),
                pending_uploads: VecDeque::new(),
                cmd_port,
                events,
            },
            cmd_chan,
            stats,
        )
    }

    /// Runs the full session lifecycle: connect, handshake, availability
    /// exchange, then the steady-state message loop, until the peer
    /// disconnects or we're told to shut down.
    pub async fn start(&mut self) -> Result<()> {
        let result = self.run_lifecycle().await;
        let _ = self.events.send(PeerEvent::Disconnected {
            torrent_id: self.torrent_id,
            addr: self.addr,
            had_error: result.is_err(),
        });
        result
    }

    /// Runs an already-handshaken inbound connection: sends our bitfield
    /// and enters the steady-state loop. The handshake exchange itself
    /// happens before this session is even constructed (see
    /// [`PeerSession::inbound`]).
    pub async fn start_inbound(&mut self, mut socket: Framed<TcpStream, PeerCodec>) -> Result<()> {
        let result = self.run_inbound(&mut socket).await;
        let _ = self.events.send(PeerEvent::Disconnected {
            torrent_id: self.torrent_id,
            addr: self.addr,
            had_error: result.is_err(),
        });
        result
    }

    async fn run_inbound(&mut self, socket: &mut Framed<TcpStream, PeerCodec>) -> Result<()> {
        self.conn.set_state(ConnectionState::AvailabilityExchange);
        let our_bitfield = {
            let map = self.status_shared.piece_map.read().await;
            map.bitfield()
        };
        socket.send(Message::Bitfield(our_bitfield)).await?;
        // state stays `AvailabilityExchange` until the peer's first message
        // is handled; `run` advances it to `Connected` from there.
        self.run(socket).await
    }

    async fn run_lifecycle(&mut self) -> Result<()> {
        log::info!("Connecting to peer {}", self.addr);
        self.conn.set_state(ConnectionState::Connecting);
        let socket = tokio::time::timeout(
            self.conn.conf().connect_timeout,
            TcpStream::connect(self.addr),
        )
        .await
        .map_err(|_| Error::Timeout)??;
        log::info!("Connected to peer {}", self.addr);

        let mut socket = Framed::new(socket, HandshakeCodec);

        self.conn.set_state(ConnectionState::Handshaking);
        let handshake = Handshake::new(self.info_hash, self.our_peer_id);
        socket.send(handshake).await?;

        let peer_handshake = socket
            .next()
            .await
            .ok_or_else(|| Error::Peer { peer_id: None, msg: "connection closed during handshake".into() })??;

        if peer_handshake.info_hash != self.info_hash {
            return Err(Error::Peer {
                peer_id: Some(peer_handshake.peer_id),
                msg: "info hash mismatch".into(),
            });
        }
        self.peer_id = Some(peer_handshake.peer_id);

        self.conn.set_state(ConnectionState::AvailabilityExchange);

        let parts = socket.into_parts();
        let mut parts = FramedParts::new(parts.io, PeerCodec);
        parts.read_buf = parts.read_buf;
        parts.write_buf = parts.write_buf;
        let mut socket = Framed::from_parts(parts);

        // we always send our current bitfield, even if empty, so the peer
        // doesn't have to guess we have nothing yet
        let our_bitfield = {
            let map = self.status_shared.piece_map.read().await;
            map.bitfield()
        };
        socket.send(Message::Bitfield(our_bitfield)).await?;

        // state stays `AvailabilityExchange` until the peer's first message
        // is handled; `run` advances it to `Connected` from there.
        self.run(&mut socket).await
    }

    async fn run(&mut self, socket: &mut Framed<TcpStream, PeerCodec>) -> Result<()> {
        let idle_timeout = self.conn.conf().idle_timeout;
        loop {
            let idle_sleep = if idle_timeout.is_zero() {
                futures::future::pending().left_future()
            } else {
                tokio::time::sleep(idle_timeout).right_future()
            };

            tokio::select! {
                cmd = self.cmd_port.recv() => {
                    match cmd {
                        Some(Command::Choke) => {
                            self.status.am_choking = true;
                            self.stats.am_choking.store(true, Ordering::Relaxed);
                            socket.send(Message::Choke).await?;
                        }
                        Some(Command::Unchoke) => {
                            self.status.am_choking = false;
                            self.stats.am_choking.store(false, Ordering::Relaxed);
                            socket.send(Message::Unchoke).await?;
                        }
                        Some(Command::BlockReady(result)) => {
                            self.send_ready_block(socket, result).await?;
                        }
                        Some(Command::Shutdown) | None => {
                            self.conn.close();
                            return Ok(());
                        }
                    }
                }
                msg = socket.next() => {
                    match msg {
                        Some(msg) => {
                            self.handle_message(socket, msg?).await?;
                            // the first message after the handshake is the
                            // only point at which a bitfield is valid; once
                            // any message has been handled, we're steady
                            // state.
                            if self.conn.state() == ConnectionState::AvailabilityExchange {
                                self.conn.set_state(ConnectionState::Connected);
                            }
                        }
                        None => {
                            self.conn.close();
                            return Ok(());
                        }
                    }
                }
                _ = idle_sleep => {
                    return Err(Error::Timeout);
                }
            }
        }
    }

    async fn handle_message(
        &mut self,
        socket: &mut Framed<TcpStream, PeerCodec>,
        msg: Message,
    ) -> Result<()> {
        match msg {
            Message::KeepAlive => {}
            Message::Choke => {
                self.status.peer_choking = true;
                self.stats.peer_choking.store(true, Ordering::Relaxed);
            }
            Message::Unchoke => {
                self.status.peer_choking = false;
                self.stats.peer_choking.store(false, Ordering::Relaxed);
                self.fill_request_queue(socket).await?;
            }
            Message::Interested => {
                self.status.peer_interested = true;
                self.stats.peer_interested.store(true, Ordering::Relaxed);
            }
            Message::NotInterested => {
                self.status.peer_interested = false;
                self.stats.peer_interested.store(false, Ordering::Relaxed);
            }
            Message::Have { piece_index } => {
                let _ = self.peer_pieces.set(piece_index);
                self.maybe_become_interested(socket).await?;
            }
            Message::Bitfield(bitfield) => {
                if self.conn.state() != ConnectionState::AvailabilityExchange {
                    return Err(Error::Protocol("bitfield message must be the first message".into()));
                }
                let piece_count = self.status_shared.piece_map.read().await.piece_count();
                self.peer_pieces = bitfield.into_truncated(piece_count)?;
                self.maybe_become_interested(socket).await?;
            }
            Message::Request(block) => self.serve_request(socket, block).await?,
            Message::Block { piece_index, offset, data } => {
                self.receive_block(socket, piece_index, offset, data).await?;
            }
            Message::Cancel(block) => {
                if let Some(download) = self.in_progress.get_mut(&block.piece_index) {
                    download.cancel_block(block);
                }
            }
        }
        Ok(())
    }

    async fn maybe_become_interested(
        &mut self,
        socket: &mut Framed<TcpStream, PeerCodec>,
    ) -> Result<()> {
        if self.status.am_interested {
            return Ok(());
        }
        let own = {
            let map = self.status_shared.piece_map.read().await;
            map.bitfield()
        };
        let has_wanted_piece = (0..own.len().max(self.peer_pieces.len()))
            .any(|i| self.peer_pieces.test(i) && !own.test(i));
        if has_wanted_piece {
            self.status.am_interested = true;
            self.stats.am_interested.store(true, Ordering::Relaxed);
            socket.send(Message::Interested).await?;
        }
        Ok(())
    }

    async fn fill_request_queue(&mut self, socket: &mut Framed<TcpStream, PeerCodec>) -> Result<()> {
        if self.status.peer_choking {
            return Ok(());
        }
        let mut pending: usize = self
            .in_progress
            .values()
            .map(|d| d.count_missing_blocks())
            .sum();
        while pending < MAX_REQUEST_QUEUE {
            let own = {
                let map = self.status_shared.piece_map.read().await;
                map.bitfield()
            };
            let in_progress_indices: HashSet<PieceIndex> = self.in_progress.keys().copied().collect();
            let picked = {
                let selector = self.status_shared.selector.read().await;
                selector.select_piece(&own, &self.peer_pieces, &in_progress_indices)
            };
            let Some(piece_index) = picked else { break };
            let piece_len = {
                let map = self.status_shared.piece_map.read().await;
                map.piece_len(piece_index)?
            };
            let download = self
                .in_progress
                .entry(piece_index)
                .or_insert_with(|| PieceDownload::new(piece_index, piece_len));
            let mut blocks = Vec::new();
            download.pick_blocks(MAX_REQUEST_QUEUE - pending, &mut blocks);
            if blocks.is_empty() {
                break;
            }
            for block in &blocks {
                socket.send(Message::Request(*block)).await?;
            }
            pending += blocks.len();
        }
        Ok(())
    }

    async fn receive_block(
        &mut self,
        socket: &mut Framed<TcpStream, PeerCodec>,
        piece_index: PieceIndex,
        offset: u32,
        data: Vec<u8>,
    ) -> Result<()> {
        let info = BlockInfo {
            piece_index,
            offset,
            len: data.len() as u32,
        };
        let Some(download) = self.in_progress.get_mut(&piece_index) else {
            // unrequested block; silently dropped
            return Ok(());
        };

        if !download.received_block(info) {
            // block wasn't in `Requested` state: either never requested, or
            // a duplicate arrival from another peer racing us in endgame.
            // Drop it rather than double-counting or re-writing the block.
            return Ok(());
        }

        self.bandwidth
            .request(data.len() as u64, Direction::Download, Some(self.torrent_id))
            .await;

        let now = Instant::now();
        self.status.last_block_received_at = Some(now);
        *self.stats.last_block_received_at.lock().unwrap() = Some(now);
        self.status_shared.downloaded.fetch_add(data.len() as u64, Ordering::Relaxed);
        self.status_shared.download_rate.write().await.update(data.len() as u64);
        {
            let mut rate = self.stats.download_rate.lock().unwrap();
            rate.update(data.len() as u64);
            rate.tick(now);
        }

        self.disk.write_block(self.torrent_id, info, data)?;

        if download.count_missing_blocks() == 0 {
            self.in_progress.remove(&piece_index);
        }
        self.fill_request_queue(socket).await
    }

    async fn serve_request(
        &mut self,
        _socket: &mut Framed<TcpStream, PeerCodec>,
        block: BlockInfo,
    ) -> Result<()> {
        if self.status.am_choking {
            return Ok(());
        }
        self.pending_uploads.push_back(block);
        let _ = self.events.send(PeerEvent::ReadRequested {
            torrent_id: self.torrent_id,
            addr: self.addr,
        });
        self.disk.read_block(self.torrent_id, block)?;
        Ok(())
    }

    /// Sends a block we finished reading from disk to the peer, in the FIFO
    /// order its request arrived (spec.md §5 ordering guarantees).
    async fn send_ready_block(
        &mut self,
        socket: &mut Framed<TcpStream, PeerCodec>,
        result: Result<(BlockInfo, Vec<u8>), Error>,
    ) -> Result<()> {
        let Some(requested) = self.pending_uploads.pop_front() else {
            return Ok(());
        };
        match result {
            Ok((info, data)) if info == requested => {
                self.bandwidth
                    .request(data.len() as u64, Direction::Upload, Some(self.torrent_id))
                    .await;
                self.status_shared.uploaded.fetch_add(data.len() as u64, Ordering::Relaxed);
                self.status_shared.upload_rate.write().await.update(data.len() as u64);
                {
                    let mut rate = self.stats.upload_rate.lock().unwrap();
                    rate.update(data.len() as u64);
                    rate.tick(Instant::now());
                }
                socket
                    .send(Message::Block {
                        piece_index: info.piece_index,
                        offset: info.offset,
                        data,
                    })
                    .await?;
            }
            Ok(_) => {}
            Err(e) => log::warn!("Failed to read block for peer {}: {}", self.addr, e),
        }
        Ok(())
    }
}
