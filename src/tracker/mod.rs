//! Tracker clients: HTTP (BEP 3), UDP (BEP 15), and a tiered announcer
//! that drives both over an announce-list (BEP 12) (spec.md §4.10).

pub(crate) mod http;
pub(crate) mod udp;

use rand::seq::SliceRandom;

use crate::{PeerId, Result, Sha1Hash};

/// The announce event, sent on every request (spec.md §4.10).
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum Event {
    None,
    Completed,
    Started,
    Stopped,
}

impl Event {
    pub fn as_u32(self) -> u32 {
        match self {
            Event::None => 0,
            Event::Completed => 1,
            Event::Started => 2,
            Event::Stopped => 3,
        }
    }
}

/// Parameters common to every announce, regardless of tracker transport.
#[derive(Clone, Debug)]
pub(crate) struct AnnounceParams {
    pub info_hash: Sha1Hash,
    pub peer_id: PeerId,
    pub port: u16,
    pub uploaded: u64,
    pub downloaded: u64,
    pub left: u64,
    pub event: Event,
    pub num_want: Option<i32>,
}

#[derive(Clone, Debug, Default)]
pub(crate) struct AnnounceResponse {
    pub interval: u64,
    pub min_interval: Option<u64>,
    pub peers: Vec<std::net::SocketAddr>,
    pub leechers: Option<u32>,
    pub seeders: Option<u32>,
    pub warning: Option<String>,
}

/// A single tracker, either HTTP or UDP, picked by URL scheme.
pub(crate) enum Tracker {
    Http(http::HttpTracker),
    Udp(udp::UdpTracker),
}

impl Tracker {
    pub fn from_url(url: &str) -> Result<Self> {
        if url.starts_with("udp://") {
            Ok(Tracker::Udp(udp::UdpTracker::new(url)?))
        } else {
            Ok(Tracker::Http(http::HttpTracker::new(url)?))
        }
    }

    pub async fn announce(&mut self, params: &AnnounceParams) -> Result<AnnounceResponse> {
        match self {
            Tracker::Http(t) => t.announce(params).await,
            Tracker::Udp(t) => t.announce(params).await,
        }
    }

    pub fn url(&self) -> &str {
        match self {
            Tracker::Http(t) => &t.url,
            Tracker::Udp(t) => &t.url,
        }
    }
}

/// Drives an announce-list's tiers per BEP 12: within a tier, addresses are
/// shuffled and tried in order; on success the winner is promoted to the
/// tier's head so it's preferred next time.
pub(crate) struct TierAnnouncer {
    tiers: Vec<Vec<Tracker>>,
    error_counts: Vec<usize>,
    error_threshold: usize,
}

impl TierAnnouncer {
    pub fn new(announce_list: Vec<Vec<String>>, error_threshold: usize) -> Result<Self> {
        let mut tiers = Vec::with_capacity(announce_list.len());
        for tier_urls in announce_list {
            let mut tier: Vec<Tracker> = tier_urls
                .iter()
                .filter_map(|url| Tracker::from_url(url).ok())
                .collect();
            tier.shuffle(&mut rand::thread_rng());
            tiers.push(tier);
        }
        let error_counts = vec![0; tiers.len()];
        Ok(Self { tiers, error_counts, error_threshold })
    }

    /// Single-tracker convenience constructor for torrents with only an
    /// `announce` key and no `announce-list`.
    pub fn single(url: &str) -> Result<Self> {
        Ok(Self {
            tiers: vec![vec![Tracker::from_url(url)?]],
            error_counts: vec![0],
            error_threshold: usize::MAX,
        })
    }

    /// Tries each tier in order; within a tier, tries each tracker in
    /// order, promoting the first success to the tier's head. Returns the
    /// first successful response, or the last error if every tier failed.
    pub async fn announce(&mut self, params: &AnnounceParams) -> Result<AnnounceResponse> {
        let mut last_err = None;
        for (tier_index, tier) in self.tiers.iter_mut().enumerate() {
            for i in 0..tier.len() {
                match tier[i].announce(params).await {
                    Ok(response) => {
                        if i != 0 {
                            tier.swap(0, i);
                        }
                        self.error_counts[tier_index] = 0;
                        return Ok(response);
                    }
                    Err(e) => {
                        last_err = Some(e);
                    }
                }
            }
            self.error_counts[tier_index] += 1;
        }
        Err(last_err.unwrap_or(crate::error::Error::Tracker {
            url: String::new(),
            msg: "no trackers configured".into(),
        }))
    }

    /// True once every tier has failed at least `error_threshold` times in
    /// a row (spec.md §6 `trackerErrorThreshold`).
    pub fn is_exhausted(&self) -> bool {
        !self.error_counts.is_empty()
            && self.error_counts.iter().all(|&c| c >= self.error_threshold)
    }
}
