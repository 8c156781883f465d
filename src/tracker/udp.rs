//! UDP tracker client (BEP 15) (spec.md §4.10).
//!
//! Two round trips: connect, then announce, both keyed by a random
//! transaction id that must match in the reply. The connection id the
//! tracker hands back is cached for up to 60 s and reused across announces.

use std::convert::TryInto;
use std::net::{SocketAddr, ToSocketAddrs};
use std::time::{Duration, Instant};

use rand::RngCore;
use tokio::net::UdpSocket;

use super::{AnnounceParams, AnnounceResponse};
use crate::error::Error;
use crate::Result;

const PROTOCOL_ID: u64 = 0x41727101980;
const ACTION_CONNECT: u32 = 0;
const ACTION_ANNOUNCE: u32 = 1;
const ACTION_ERROR: u32 = 3;

const CONNECTION_ID_TTL: Duration = Duration::from_secs(60);
const BASE_TIMEOUT: Duration = Duration::from_secs(15);
const MAX_RETRIES: u32 = 3;

struct CachedConnection {
    id: u64,
    obtained_at: Instant,
}

pub(crate) struct UdpTracker {
    pub url: String,
    addr: SocketAddr,
    connection: Option<CachedConnection>,
}

impl UdpTracker {
    pub fn new(url: &str) -> Result<Self> {
        let stripped = url
            .strip_prefix("udp://")
            .ok_or_else(|| Error::Tracker { url: url.to_string(), msg: "not a udp:// url".into() })?;
        let host_port = stripped.split('/').next().unwrap_or(stripped);
        let addr = host_port
            .to_socket_addrs()
            .map_err(|e| Error::Tracker { url: url.to_string(), msg: e.to_string() })?
            .next()
            .ok_or_else(|| Error::Tracker { url: url.to_string(), msg: "no address resolved".into() })?;
        Ok(Self { url: url.to_string(), addr, connection: None })
    }

    pub async fn announce(&mut self, params: &AnnounceParams) -> Result<AnnounceResponse> {
        let socket = UdpSocket::bind(("0.0.0.0", 0))
            .await
            .map_err(|e| Error::Tracker { url: self.url.clone(), msg: e.to_string() })?;
        socket
            .connect(self.addr)
            .await
            .map_err(|e| Error::Tracker { url: self.url.clone(), msg: e.to_string() })?;

        let connection_id = self.connection_id(&socket).await?;

        let transaction_id = rand::thread_rng().next_u32();
        let request = build_announce_request(connection_id, transaction_id, params);
        let response = self.send_with_retries(&socket, &request).await?;
        parse_announce_response(&self.url, transaction_id, &response)
    }

    async fn connection_id(&mut self, socket: &UdpSocket) -> Result<u64> {
        if let Some(cached) = &self.connection {
            if cached.obtained_at.elapsed() < CONNECTION_ID_TTL {
                return Ok(cached.id);
            }
        }
        let transaction_id = rand::thread_rng().next_u32();
        let request = build_connect_request(transaction_id);
        let response = self.send_with_retries(socket, &request).await?;
        let id = parse_connect_response(&self.url, transaction_id, &response)?;
        self.connection = Some(CachedConnection { id, obtained_at: Instant::now() });
        Ok(id)
    }

    /// `15·2^n` second backoff per the BEP, capped at `MAX_RETRIES` attempts.
    async fn send_with_retries(&self, socket: &UdpSocket, request: &[u8]) -> Result<Vec<u8>> {
        let mut last_err = None;
        for attempt in 0..=MAX_RETRIES {
            let timeout = BASE_TIMEOUT * 2u32.pow(attempt);
            match self.send_once(socket, request, timeout).await {
                Ok(bytes) => return Ok(bytes),
                Err(e) => last_err = Some(e),
            }
        }
        Err(last_err.unwrap_or(Error::Timeout))
    }

    async fn send_once(
        &self,
        socket: &UdpSocket,
        request: &[u8],
        timeout: Duration,
    ) -> Result<Vec<u8>> {
        socket
            .send(request)
            .await
            .map_err(|e| Error::Tracker { url: self.url.clone(), msg: e.to_string() })?;
        let mut buf = vec![0u8; 2048];
        let len = tokio::time::timeout(timeout, socket.recv(&mut buf))
            .await
            .map_err(|_| Error::Timeout)?
            .map_err(|e| Error::Tracker { url: self.url.clone(), msg: e.to_string() })?;
        buf.truncate(len);
        Ok(buf)
    }
}

fn build_connect_request(transaction_id: u32) -> [u8; 16] {
    let mut buf = [0u8; 16];
    buf[0..8].copy_from_slice(&PROTOCOL_ID.to_be_bytes());
    buf[8..12].copy_from_slice(&ACTION_CONNECT.to_be_bytes());
    buf[12..16].copy_from_slice(&transaction_id.to_be_bytes());
    buf
}

fn parse_connect_response(url: &str, transaction_id: u32, buf: &[u8]) -> Result<u64> {
    let err = |msg: &str| Error::Tracker { url: url.to_string(), msg: msg.to_string() };
    if buf.len() < 16 {
        return Err(err("connect response too short"));
    }
    let action = u32::from_be_bytes(buf[0..4].try_into().unwrap());
    let got_transaction_id = u32::from_be_bytes(buf[4..8].try_into().unwrap());
    if got_transaction_id != transaction_id {
        return Err(err("transaction id mismatch"));
    }
    if action == ACTION_ERROR {
        return Err(err(&String::from_utf8_lossy(&buf[8..])));
    }
    if action != ACTION_CONNECT {
        return Err(err("unexpected action in connect response"));
    }
    Ok(u64::from_be_bytes(buf[8..16].try_into().unwrap()))
}

fn build_announce_request(connection_id: u64, transaction_id: u32, params: &AnnounceParams) -> [u8; 98] {
    let mut buf = [0u8; 98];
    buf[0..8].copy_from_slice(&connection_id.to_be_bytes());
    buf[8..12].copy_from_slice(&ACTION_ANNOUNCE.to_be_bytes());
    buf[12..16].copy_from_slice(&transaction_id.to_be_bytes());
    buf[16..36].copy_from_slice(&params.info_hash);
    buf[36..56].copy_from_slice(&params.peer_id);
    buf[56..64].copy_from_slice(&params.downloaded.to_be_bytes());
    buf[64..72].copy_from_slice(&params.left.to_be_bytes());
    buf[72..80].copy_from_slice(&params.uploaded.to_be_bytes());
    buf[80..84].copy_from_slice(&params.event.as_u32().to_be_bytes());
    buf[84..88].copy_from_slice(&0u32.to_be_bytes()); // ip: 0 = tracker infers
    buf[88..92].copy_from_slice(&rand::thread_rng().next_u32().to_be_bytes()); // key
    let num_want = params.num_want.unwrap_or(-1);
    buf[92..96].copy_from_slice(&num_want.to_be_bytes());
    buf[96..98].copy_from_slice(&params.port.to_be_bytes());
    buf
}

fn parse_announce_response(url: &str, transaction_id: u32, buf: &[u8]) -> Result<AnnounceResponse> {
    let err = |msg: &str| Error::Tracker { url: url.to_string(), msg: msg.to_string() };
    if buf.len() < 20 {
        return Err(err("announce response too short"));
    }
    let action = u32::from_be_bytes(buf[0..4].try_into().unwrap());
    let got_transaction_id = u32::from_be_bytes(buf[4..8].try_into().unwrap());
    if got_transaction_id != transaction_id {
        return Err(err("transaction id mismatch"));
    }
    if action == ACTION_ERROR {
        return Err(err(&String::from_utf8_lossy(&buf[8..])));
    }
    if action != ACTION_ANNOUNCE {
        return Err(err("unexpected action in announce response"));
    }
    let interval = u32::from_be_bytes(buf[8..12].try_into().unwrap()) as u64;
    let leechers = u32::from_be_bytes(buf[12..16].try_into().unwrap());
    let seeders = u32::from_be_bytes(buf[16..20].try_into().unwrap());

    let mut peers = Vec::new();
    for chunk in buf[20..].chunks_exact(6) {
        let port = u16::from_be_bytes([chunk[4], chunk[5]]);
        if port == 0 {
            continue;
        }
        let ip = std::net::Ipv4Addr::new(chunk[0], chunk[1], chunk[2], chunk[3]);
        peers.push(SocketAddr::from((ip, port)));
    }

    Ok(AnnounceResponse {
        interval,
        min_interval: None,
        peers,
        leechers: Some(leechers),
        seeders: Some(seeders),
        warning: None,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tracker::Event;

    fn params() -> AnnounceParams {
        AnnounceParams {
            info_hash: [0x11; 20],
            peer_id: [0x22; 20],
            port: 6881,
            uploaded: 0,
            downloaded: 0,
            left: 100,
            event: Event::Started,
            num_want: None,
        }
    }

    #[test]
    fn connect_request_matches_bep_example() {
        let req = build_connect_request(0x1234_5678);
        assert_eq!(
            req,
            [
                0x00, 0x00, 0x04, 0x17, 0x27, 0x10, 0x19, 0x80, 0x00, 0x00, 0x00, 0x00, 0x12, 0x34,
                0x56, 0x78
            ]
        );
    }

    #[test]
    fn announce_request_starts_with_connection_id() {
        let req = build_announce_request(0xABCD_EF01_2345_6789, 1, &params());
        assert_eq!(req[0..8], [0xAB, 0xCD, 0xEF, 0x01, 0x23, 0x45, 0x67, 0x89]);
        assert_eq!(req.len(), 98);
    }

    #[test]
    fn announce_request_defaults_num_want_to_negative_one() {
        let req = build_announce_request(1, 1, &params());
        let num_want = i32::from_be_bytes(req[92..96].try_into().unwrap());
        assert_eq!(num_want, -1);
    }

    #[test]
    fn parse_connect_response_rejects_transaction_mismatch() {
        let mut buf = [0u8; 16];
        buf[8..12].copy_from_slice(&999u32.to_be_bytes());
        assert!(parse_connect_response("udp://t", 1, &buf).is_err());
    }

    #[test]
    fn parse_connect_response_extracts_connection_id() {
        let mut buf = [0u8; 16];
        buf[4..8].copy_from_slice(&1u32.to_be_bytes());
        buf[8..16].copy_from_slice(&0xABCD_EF01_2345_6789u64.to_be_bytes());
        let id = parse_connect_response("udp://t", 1, &buf).unwrap();
        assert_eq!(id, 0xABCD_EF01_2345_6789);
    }

    #[test]
    fn parse_announce_response_skips_zero_port_peers() {
        let mut buf = vec![0u8; 20];
        buf[0..4].copy_from_slice(&ACTION_ANNOUNCE.to_be_bytes());
        buf[4..8].copy_from_slice(&7u32.to_be_bytes());
        buf[8..12].copy_from_slice(&1800u32.to_be_bytes());
        buf.extend_from_slice(&[127, 0, 0, 1, 0x1A, 0xE1]);
        buf.extend_from_slice(&[127, 0, 0, 2, 0, 0]);
        let resp = parse_announce_response("udp://t", 7, &buf).unwrap();
        assert_eq!(resp.peers.len(), 1);
        assert_eq!(resp.peers[0], "127.0.0.1:6881".parse().unwrap());
    }

    #[test]
    fn parse_announce_response_surfaces_error_action() {
        let mut buf = vec![0u8; 8];
        buf[0..4].copy_from_slice(&ACTION_ERROR.to_be_bytes());
        buf[4..8].copy_from_slice(&7u32.to_be_bytes());
        buf.extend_from_slice(b"bad request");
        let err = parse_announce_response("udp://t", 7, &buf).unwrap_err();
        assert!(err.to_string().contains("bad request"));
    }
}
