//! Injected clock and random source.
//!
//! Cooldowns, stale-message filtering and reply pacing all read time through
//! [`Clock`] and draw pauses through [`RandomSource`], so tests can run them on
//! virtual time with fixed pauses.

use chrono::{DateTime, TimeDelta, Utc};
use rand::Rng;
use std::sync::Mutex;
use std::time::Duration;
use tokio::time::Instant;

pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

/// Wall clock that advances with the tokio timer.
///
/// Anchored to `Utc::now()` at construction and advanced by tokio's
/// monotonic clock, so it stays consistent with `tokio::time::sleep` even
/// when the runtime's time is paused.
pub struct TokioClock {
    wall: DateTime<Utc>,
    origin: Instant,
}

impl TokioClock {
    pub fn new() -> Self {
        Self {
            wall: Utc::now(),
            origin: Instant::now(),
        }
    }
}

impl Default for TokioClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for TokioClock {
    fn now(&self) -> DateTime<Utc> {
        let elapsed = TimeDelta::from_std(self.origin.elapsed()).unwrap_or(TimeDelta::zero());
        self.wall + elapsed
    }
}

/// Clock that only moves when told to.
pub struct ManualClock {
    now: Mutex<DateTime<Utc>>,
}

impl ManualClock {
    pub fn new(start: DateTime<Utc>) -> Self {
        Self {
            now: Mutex::new(start),
        }
    }

    pub fn advance(&self, by: TimeDelta) {
        let mut now = self.now.lock().unwrap_or_else(|e| e.into_inner());
        *now += by;
    }
}

impl Clock for ManualClock {
    fn now(&self) -> DateTime<Utc> {
        *self.now.lock().unwrap_or_else(|e| e.into_inner())
    }
}

pub trait RandomSource: Send + Sync {
    /// A duration in `[min, max]`.
    fn between(&self, min: Duration, max: Duration) -> Duration;
}

/// Uniform pauses from the thread-local generator.
pub struct ThreadRandom;

impl RandomSource for ThreadRandom {
    fn between(&self, min: Duration, max: Duration) -> Duration {
        let (lo, hi) = (min.as_millis() as u64, max.as_millis() as u64);
        if hi <= lo {
            return min;
        }
        Duration::from_millis(rand::rng().random_range(lo..=hi))
    }
}

/// Always the same pause, clamped into the requested range.
pub struct FixedRandom(pub Duration);

impl RandomSource for FixedRandom {
    fn between(&self, min: Duration, max: Duration) -> Duration {
        self.0.clamp(min, max.max(min))
    }
}
