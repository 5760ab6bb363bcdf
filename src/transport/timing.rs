//! Time sources and beacon jitter.
//!
//! The receiver's teardown timeout and the sender's deadline both consult a
//! [`Clock`], so every timeout in the transport can be unit tested with a
//! [`MockClock`] instead of sleeping.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use rand::Rng;

use crate::core::constants::BEACON_JITTER_PERCENT;

/// A monotonic microsecond time source.
pub trait Clock: Send + Sync {
    /// The current time in microseconds.
    fn now_us(&self) -> u64;
}

/// A clock backed by the system's monotonic time, anchored at construction.
#[derive(Debug)]
pub struct RealClock {
    origin: Instant,
}

impl RealClock {
    /// Create a clock reading zero at this instant.
    pub fn new() -> Self {
        Self { origin: Instant::now() }
    }
}

impl Default for RealClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for RealClock {
    fn now_us(&self) -> u64 {
        self.origin.elapsed().as_micros() as u64
    }
}

/// A clock that only moves when told to.
#[derive(Debug, Default)]
pub struct MockClock {
    time_us: AtomicU64,
}

impl MockClock {
    /// Create a mock clock starting at time zero.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the current time of the clock.
    pub fn set_time_us(&self, time_us: u64) {
        self.time_us.store(time_us, Ordering::Relaxed);
    }

    /// Advance the clock by `delta_us` microseconds.
    pub fn advance_us(&self, delta_us: u64) {
        self.time_us.fetch_add(delta_us, Ordering::Relaxed);
    }
}

impl Clock for MockClock {
    fn now_us(&self) -> u64 {
        self.time_us.load(Ordering::Relaxed)
    }
}

/// Draw a beacon interval with ±10 % uniform jitter, so that co-located
/// stations with the same configuration do not beacon in lockstep.
pub fn jittered_interval(interval: Duration) -> Duration {
    let interval_us = interval.as_micros() as u64;
    let jitter_us = interval_us * BEACON_JITTER_PERCENT / 100;
    let jittered =
        rand::thread_rng().gen_range(interval_us - jitter_us..=interval_us + jitter_us);
    Duration::from_micros(jittered)
}
