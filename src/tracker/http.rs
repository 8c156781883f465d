//! HTTP tracker client (BEP 3) (spec.md §4.10).

use std::net::{Ipv4Addr, SocketAddr};
use std::time::Duration;

use percent_encoding::{percent_encode, AsciiSet, NON_ALPHANUMERIC};

use super::{AnnounceParams, AnnounceResponse, Event};
use crate::bencode;
use crate::error::Error;
use crate::Result;

/// BEP 3's percent-encoding rule is narrower than `NON_ALPHANUMERIC`: it
/// leaves `.`, `-`, `_`, `~` unescaped too.
const QUERY_SAFE: &AsciiSet = &NON_ALPHANUMERIC
    .remove(b'.')
    .remove(b'-')
    .remove(b'_')
    .remove(b'~');

const REQUEST_TIMEOUT: Duration = Duration::from_secs(15);

pub(crate) struct HttpTracker {
    pub url: String,
    client: reqwest::Client,
}

impl HttpTracker {
    pub fn new(url: &str) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .map_err(|e| Error::Network(e.to_string()))?;
        Ok(Self { url: url.to_string(), client })
    }

    pub async fn announce(&mut self, params: &AnnounceParams) -> Result<AnnounceResponse> {
        let url = build_url(&self.url, params);
        let resp = self
            .client
            .get(&url)
            .send()
            .await
            .map_err(|e| Error::Tracker { url: self.url.clone(), msg: e.to_string() })?;
        let bytes = resp
            .bytes()
            .await
            .map_err(|e| Error::Tracker { url: self.url.clone(), msg: e.to_string() })?;
        parse_response(&self.url, &bytes)
    }
}

fn build_url(base: &str, params: &AnnounceParams) -> String {
    let sep = if base.contains('?') { '&' } else { '?' };
    let mut url = format!(
        "{base}{sep}info_hash={info_hash}&peer_id={peer_id}&port={port}&uploaded={uploaded}&\
         downloaded={downloaded}&left={left}&compact=1",
        base = base,
        sep = sep,
        info_hash = percent_encode(&params.info_hash, QUERY_SAFE),
        peer_id = percent_encode(&params.peer_id, QUERY_SAFE),
        port = params.port,
        uploaded = params.uploaded,
        downloaded = params.downloaded,
        left = params.left,
    );
    if let Some(event) = event_param(params.event) {
        url.push_str("&event=");
        url.push_str(event);
    }
    if let Some(num_want) = params.num_want {
        url.push_str("&numwant=");
        url.push_str(&num_want.to_string());
    }
    url
}

fn event_param(event: Event) -> Option<&'static str> {
    match event {
        Event::None => None,
        Event::Completed => Some("completed"),
        Event::Started => Some("started"),
        Event::Stopped => Some("stopped"),
    }
}

fn parse_response(url: &str, body: &[u8]) -> Result<AnnounceResponse> {
    let tracker_err = |msg: String| Error::Tracker { url: url.to_string(), msg };
    let value = bencode::decode(body).map_err(|e| tracker_err(e.to_string()))?;
    let dict = value
        .as_dict()
        .ok_or_else(|| tracker_err("response is not a dict".into()))?;

    if let Some(reason) = dict.get(b"failure reason".as_ref()).and_then(|v| v.as_str()) {
        return Err(tracker_err(reason.to_string()));
    }

    let interval = value
        .get("interval")
        .and_then(|v| v.as_int())
        .ok_or_else(|| tracker_err("missing interval".into()))? as u64;
    let min_interval = value.get("min interval").and_then(|v| v.as_int()).map(|i| i as u64);
    let warning = value
        .get("warning message")
        .and_then(|v| v.as_str())
        .map(|s| s.to_string());
    let leechers = value.get("incomplete").and_then(|v| v.as_int()).map(|i| i as u32);
    let seeders = value.get("complete").and_then(|v| v.as_int()).map(|i| i as u32);

    let peers = match value.get("peers") {
        Some(bencode::Value::ByteString(bytes)) => parse_compact_peers(bytes)?,
        Some(bencode::Value::List(list)) => parse_dict_peers(list)?,
        Some(_) => return Err(tracker_err("malformed peers field".into())),
        None => Vec::new(),
    };

    Ok(AnnounceResponse { interval, min_interval, peers, leechers, seeders, warning })
}

fn parse_compact_peers(bytes: &[u8]) -> Result<Vec<SocketAddr>> {
    if bytes.len() % 6 != 0 {
        return Err(Error::Protocol("compact peer list length not a multiple of 6".into()));
    }
    Ok(bytes
        .chunks_exact(6)
        .map(|chunk| {
            let ip = Ipv4Addr::new(chunk[0], chunk[1], chunk[2], chunk[3]);
            let port = u16::from_be_bytes([chunk[4], chunk[5]]);
            SocketAddr::from((ip, port))
        })
        .collect())
}

fn parse_dict_peers(list: &[bencode::Value]) -> Result<Vec<SocketAddr>> {
    let mut peers = Vec::with_capacity(list.len());
    for entry in list {
        let ip = entry
            .get("ip")
            .and_then(|v| v.as_str())
            .ok_or_else(|| Error::Protocol("peer dict missing ip".into()))?;
        let port = entry
            .get("port")
            .and_then(|v| v.as_int())
            .ok_or_else(|| Error::Protocol("peer dict missing port".into()))? as u16;
        let ip: std::net::IpAddr = ip
            .parse()
            .map_err(|_| Error::Protocol("peer dict has malformed ip".into()))?;
        peers.push(SocketAddr::from((ip, port)));
    }
    Ok(peers)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn params() -> AnnounceParams {
        AnnounceParams {
            info_hash: [1u8; 20],
            peer_id: [2u8; 20],
            port: 6881,
            uploaded: 0,
            downloaded: 0,
            left: 100,
            event: Event::Started,
            num_want: Some(50),
        }
    }

    #[test]
    fn builds_url_with_encoded_hashes_and_event() {
        let url = build_url("http://tracker.example/announce", &params());
        assert!(url.starts_with("http://tracker.example/announce?info_hash=%01%01"));
        assert!(url.contains("&event=started"));
        assert!(url.contains("&numwant=50"));
        assert!(url.contains("&compact=1"));
    }

    #[test]
    fn appends_with_ampersand_when_base_has_query() {
        let url = build_url("http://tracker.example/announce?x=1", &params());
        assert!(url.contains("?x=1&info_hash="));
    }

    #[test]
    fn parses_compact_peer_list() {
        let body = bencode::encode(&bencode::build::dict(vec![
            ("interval", bencode::Value::Integer(1800)),
            (
                "peers",
                bencode::Value::ByteString(vec![127, 0, 0, 1, 0x1A, 0xE1]),
            ),
        ]));
        let resp = parse_response("http://t", &body).unwrap();
        assert_eq!(resp.interval, 1800);
        assert_eq!(resp.peers, vec!["127.0.0.1:6881".parse().unwrap()]);
    }

    #[test]
    fn surfaces_failure_reason_as_tracker_error() {
        let body = bencode::encode(&bencode::build::dict(vec![(
            "failure reason",
            bencode::Value::ByteString(b"banned".to_vec()),
        )]));
        let err = parse_response("http://t", &body).unwrap_err();
        assert!(err.to_string().contains("banned"));
    }
}
