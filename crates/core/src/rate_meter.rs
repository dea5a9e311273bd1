//! Per-peer transfer rate estimation.
//!
//! Unlike a fixed-window estimator, `RateMeter` recomputes an exponentially
//! blended rate on every `update()` call and only needs a single `Instant`
//! plus a handful of fields, which keeps it cheap enough to call on every
//! byte written or received.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use parking_lot::Mutex;

const WINDOW: Duration = Duration::from_secs(20);
const MAX_NEXT_EXPECTED_SECS: f64 = 5.0;
const RATE_EPSILON: f64 = 1e-9;

struct Inner {
    rate: f64,
    total: u64,
    next_expected: Instant,
    last_update: Instant,
    rate_since: Instant,
}

/// Tracks bytes/s for a single direction of a single peer.
///
/// `update(0, now)` is a cheap poll: it returns without touching any state
/// as long as `now` hasn't reached `next_expected`, so callers can invoke it
/// on every loop tick without contending the lock.
pub struct RateMeter {
    inner: Mutex<Inner>,
    rate_bits: AtomicU64,
}

impl RateMeter {
    pub fn new() -> Self {
        Self::new_at(Instant::now())
    }

    fn new_at(now: Instant) -> Self {
        // Fudge rate_since back by a second so a peer's very first update
        // doesn't divide by a near-zero elapsed time and read as infinite.
        let rate_since = now - Duration::from_secs(1);
        Self {
            inner: Mutex::new(Inner {
                rate: 0.0,
                total: 0,
                next_expected: now,
                last_update: rate_since,
                rate_since,
            }),
            rate_bits: AtomicU64::new(0),
        }
    }

    /// Folds `amount` bytes observed at `now` into the running rate.
    pub fn update(&self, amount: u64, now: Instant) {
        let mut g = self.inner.lock();
        if now < g.next_expected && amount == 0 {
            return;
        }

        let denom = (now - g.rate_since).as_secs_f64();
        let new_rate = if denom > RATE_EPSILON {
            let numerator = g.rate * (g.last_update - g.rate_since).as_secs_f64() + amount as f64;
            numerator / denom
        } else {
            0.0
        };

        let next_delta = (amount as f64 / new_rate.max(RATE_EPSILON)).min(MAX_NEXT_EXPECTED_SECS);

        g.rate = new_rate;
        g.total += amount;
        g.next_expected = now + Duration::from_secs_f64(next_delta);
        g.last_update = now;
        let floor = now.checked_sub(WINDOW).unwrap_or(now);
        if floor > g.rate_since {
            g.rate_since = floor;
        }

        self.rate_bits.store(new_rate.to_bits(), Ordering::Relaxed);
    }

    /// Last computed bytes/s. Lock-free.
    pub fn rate(&self) -> f64 {
        f64::from_bits(self.rate_bits.load(Ordering::Relaxed))
    }

    pub fn total(&self) -> u64 {
        self.inner.lock().total
    }
}

impl Default for RateMeter {
    fn default() -> Self {
        Self::new()
    }
}
