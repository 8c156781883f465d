//! Token-bucket bandwidth limiting (spec.md §4.8): a global download and
//! upload bucket, plus optional per-torrent buckets layered on top of them.
//!
//! A transfer is allowed to proceed only once it has drawn tokens from
//! every applicable bucket, so a per-torrent limit and the global limit
//! both apply simultaneously, whichever is stricter.

use std::collections::VecDeque;
use std::time::{Duration, Instant};

use tokio::sync::{oneshot, Mutex};

use crate::TorrentId;

const REFILL_TICK: Duration = Duration::from_millis(100);
const MIN_BURST: u64 = 1024;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum Direction {
    Download,
    Upload,
}

/// Computes the default burst size for a given rate: `max(1024, 1.5*rate)`.
fn default_burst(rate: u64) -> u64 {
    MIN_BURST.max((rate as f64 * 1.5) as u64)
}

struct Waiter {
    need: u64,
    granted: u64,
    done: oneshot::Sender<()>,
}

/// A single token bucket. `rate == None` means unlimited: requests against
/// it are granted immediately and no tokens are tracked.
struct TokenBucket {
    rate: Option<u64>,
    burst: u64,
    tokens: u64,
    last_refill: Instant,
    waiters: VecDeque<Waiter>,
}

impl TokenBucket {
    fn unlimited() -> Self {
        Self {
            rate: None,
            burst: 0,
            tokens: 0,
            last_refill: Instant::now(),
            waiters: VecDeque::new(),
        }
    }

    fn limited(rate: u64) -> Self {
        let burst = default_burst(rate);
        Self {
            rate: Some(rate),
            burst,
            tokens: burst,
            last_refill: Instant::now(),
            waiters: VecDeque::new(),
        }
    }

    fn is_unlimited(&self) -> bool {
        self.rate.is_none()
    }

    /// Changes the configured rate while preserving the tokens-to-burst
    /// ratio, so a bucket that was half-full stays half-full of its new,
    /// larger or smaller burst.
    fn set_rate(&mut self, rate: Option<u64>) {
        match rate {
            None => {
                self.rate = None;
                self.tokens = 0;
                self.burst = 0;
            }
            Some(rate) => {
                let ratio = if self.burst > 0 {
                    self.tokens as f64 / self.burst as f64
                } else {
                    1.0
                };
                let burst = default_burst(rate);
                self.rate = Some(rate);
                self.burst = burst;
                self.tokens = (burst as f64 * ratio) as u64;
            }
        }
    }

    /// Advances the refill clock, adding tokens earned since the last tick,
    /// then grants waiters in FIFO order. Each round a waiter may receive at
    /// most a fair share of the pool (`tokens / waiters.len()`) so one huge
    /// request doesn't starve everyone behind it.
    fn tick(&mut self, now: Instant) {
        let Some(rate) = self.rate else { return };
        let elapsed = now.saturating_duration_since(self.last_refill);
        self.last_refill = now;
        let earned = (rate as f64 * elapsed.as_secs_f64()) as u64;
        self.tokens = (self.tokens + earned).min(self.burst);

        while let Some(front) = self.waiters.front_mut() {
            if self.tokens == 0 {
                break;
            }
            let share = (self.tokens / self.waiters.len() as u64).max(1);
            let take = share.min(front.need - front.granted).min(self.tokens);
            front.granted += take;
            self.tokens -= take;
            if front.granted >= front.need {
                let waiter = self.waiters.pop_front().unwrap();
                let _ = waiter.done.send(());
            } else {
                break;
            }
        }
    }

    /// Attempts to draw `bytes` tokens immediately. Returns `true` if
    /// granted, `false` if the caller must wait.
    fn try_take(&mut self, bytes: u64) -> bool {
        if self.is_unlimited() {
            return true;
        }
        if self.tokens >= bytes {
            self.tokens -= bytes;
            true
        } else {
            false
        }
    }

    fn enqueue(&mut self, bytes: u64) -> oneshot::Receiver<()> {
        let (tx, rx) = oneshot::channel();
        self.waiters.push_back(Waiter { need: bytes, granted: 0, done: tx });
        rx
    }

    /// Completes every outstanding waiter unconditionally, used when a
    /// torrent is removed so its in-flight requests don't hang forever.
    fn release_all_waiters(&mut self) {
        for waiter in self.waiters.drain(..) {
            let _ = waiter.done.send(());
        }
    }
}

struct Buckets {
    download: TokenBucket,
    upload: TokenBucket,
}

impl Buckets {
    fn unlimited() -> Self {
        Self { download: TokenBucket::unlimited(), upload: TokenBucket::unlimited() }
    }

    fn bucket_mut(&mut self, direction: Direction) -> &mut TokenBucket {
        match direction {
            Direction::Download => &mut self.download,
            Direction::Upload => &mut self.upload,
        }
    }

    fn tick(&mut self, now: Instant) {
        self.download.tick(now);
        self.upload.tick(now);
    }
}

struct Inner {
    global: Buckets,
    per_torrent: std::collections::HashMap<TorrentId, Buckets>,
}

/// Shared bandwidth limiter: global download/upload buckets plus optional
/// per-torrent buckets, refilled on a fixed tick by whoever calls [`tick`].
pub(crate) struct BandwidthLimiter {
    inner: Mutex<Inner>,
}

impl BandwidthLimiter {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(Inner {
                global: Buckets::unlimited(),
                per_torrent: std::collections::HashMap::new(),
            }),
        }
    }

    pub async fn set_global_limit(&self, direction: Direction, rate: Option<u64>) {
        let mut inner = self.inner.lock().await;
        inner.global.bucket_mut(direction).set_rate(rate);
    }

    pub async fn set_torrent_limit(&self, id: TorrentId, direction: Direction, rate: Option<u64>) {
        let mut inner = self.inner.lock().await;
        let buckets = inner.per_torrent.entry(id).or_insert_with(Buckets::unlimited);
        buckets.bucket_mut(direction).set_rate(rate);
    }

    pub async fn remove_torrent(&self, id: TorrentId) {
        let mut inner = self.inner.lock().await;
        if let Some(mut buckets) = inner.per_torrent.remove(&id) {
            buckets.download.release_all_waiters();
            buckets.upload.release_all_waiters();
        }
    }

    /// Refills every bucket's tokens based on elapsed time; intended to be
    /// driven by a loop sleeping [`REFILL_TICK`] between calls.
    pub async fn tick(&self) {
        let now = Instant::now();
        let mut inner = self.inner.lock().await;
        inner.global.tick(now);
        for buckets in inner.per_torrent.values_mut() {
            buckets.tick(now);
        }
    }

    pub fn tick_interval() -> Duration {
        REFILL_TICK
    }

    /// Requests `bytes` worth of bandwidth for `direction`, optionally
    /// scoped to a torrent's own limit as well as the global one. Resolves
    /// once both applicable buckets have granted the request.
    pub async fn request(&self, bytes: u64, direction: Direction, torrent: Option<TorrentId>) {
        let global_wait = {
            let mut inner = self.inner.lock().await;
            let bucket = inner.global.bucket_mut(direction);
            if bucket.try_take(bytes) {
                None
            } else {
                Some(bucket.enqueue(bytes))
            }
        };
        if let Some(rx) = global_wait {
            let _ = rx.await;
        }

        if let Some(id) = torrent {
            let torrent_wait = {
                let mut inner = self.inner.lock().await;
                let buckets = inner.per_torrent.entry(id).or_insert_with(Buckets::unlimited);
                let bucket = buckets.bucket_mut(direction);
                if bucket.try_take(bytes) {
                    None
                } else {
                    Some(bucket.enqueue(bytes))
                }
            };
            if let Some(rx) = torrent_wait {
                let _ = rx.await;
            }
        }
    }
}

impl Default for BandwidthLimiter {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn unlimited_bucket_grants_immediately() {
        let limiter = BandwidthLimiter::new();
        limiter.request(1_000_000, Direction::Download, None).await;
    }

    #[tokio::test]
    async fn limited_bucket_grants_within_burst() {
        let limiter = BandwidthLimiter::new();
        limiter.set_global_limit(Direction::Download, Some(10_000)).await;
        // default burst = max(1024, 1.5*10000) = 15000, so a 10000-byte
        // request should be satisfied immediately out of the initial burst.
        limiter.request(10_000, Direction::Download, None).await;
    }

    #[tokio::test]
    async fn torrent_removal_releases_waiters() {
        let limiter = BandwidthLimiter::new();
        limiter.set_torrent_limit(7, Direction::Upload, Some(1)).await;
        // drain the tiny burst first
        limiter.request(default_burst(1), Direction::Upload, Some(7)).await;

        let limiter_ref = &limiter;
        let waiter = async move {
            limiter_ref.request(1_000_000, Direction::Upload, Some(7)).await;
        };
        tokio::pin!(waiter);

        // give the waiter a chance to enqueue
        tokio::select! {
            _ = &mut waiter => panic!("should not have resolved yet"),
            _ = tokio::time::sleep(Duration::from_millis(10)) => {}
        }

        limiter.remove_torrent(7).await;
        waiter.await;
    }

    #[test]
    fn default_burst_matches_formula() {
        assert_eq!(default_burst(0), MIN_BURST);
        assert_eq!(default_burst(10_000), 15_000);
    }

    #[test]
    fn rate_change_preserves_token_ratio() {
        let mut bucket = TokenBucket::limited(1000);
        bucket.tokens = bucket.burst / 2;
        bucket.set_rate(Some(2000));
        let new_ratio = bucket.tokens as f64 / bucket.burst as f64;
        assert!((new_ratio - 0.5).abs() < 0.01);
    }
}
