//! An exponentially weighted moving average rate counter, used for per-peer,
//! per-session, and per-engine byte-rate statistics (spec.md §4.6/§4.11's
//! "EWMA download/upload rates").

use std::time::{Duration, Instant};

/// Smoothing factor for the EWMA: higher weights recent samples more
/// heavily. This value gives roughly a 5-tick (5s, at the statistics tick
/// rate) half-life, matching the ~1s tick spec.md §5 specifies.
const ALPHA: f64 = 0.3;

#[derive(Debug, Clone)]
pub struct RateCounter {
    /// Bytes accumulated since the last `tick`.
    pending_bytes: u64,
    /// The current smoothed rate, in bytes/sec.
    rate: f64,
    last_tick: Instant,
    total: u64,
}

impl RateCounter {
    pub fn new() -> Self {
        Self {
            pending_bytes: 0,
            rate: 0.0,
            last_tick: Instant::now(),
            total: 0,
        }
    }

    /// Records `n` bytes transferred since the last tick.
    pub fn update(&mut self, n: u64) {
        self.pending_bytes += n;
        self.total += n;
    }

    /// Folds pending bytes into the smoothed rate. Should be called on a
    /// roughly-fixed schedule (spec.md's ~1s statistics tick).
    pub fn tick(&mut self, now: Instant) {
        let elapsed = now.saturating_duration_since(self.last_tick);
        let secs = elapsed.as_secs_f64().max(1e-3);
        let instantaneous = self.pending_bytes as f64 / secs;
        self.rate = ALPHA * instantaneous + (1.0 - ALPHA) * self.rate;
        self.pending_bytes = 0;
        self.last_tick = now;
    }

    /// The current smoothed rate, in bytes/sec.
    pub fn rate(&self) -> f64 {
        self.rate
    }

    /// The total number of bytes ever recorded.
    pub fn total(&self) -> u64 {
        self.total
    }

    /// Time since the last sample was recorded, ignoring ticks.
    pub fn idle_for(&self, now: Instant) -> Duration {
        now.saturating_duration_since(self.last_tick)
    }
}

impl Default for RateCounter {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tick_folds_pending_bytes_into_rate() {
        let mut counter = RateCounter::new();
        let t0 = Instant::now();
        counter.update(1000);
        let t1 = t0 + Duration::from_secs(1);
        counter.tick(t1);
        assert!(counter.rate() > 0.0);
        assert_eq!(counter.total(), 1000);
    }

    #[test]
    fn rate_decays_without_new_bytes() {
        let mut counter = RateCounter::new();
        let t0 = Instant::now();
        counter.update(10_000);
        counter.tick(t0 + Duration::from_secs(1));
        let after_burst = counter.rate();
        counter.tick(t0 + Duration::from_secs(2));
        assert!(counter.rate() < after_burst);
    }
}
