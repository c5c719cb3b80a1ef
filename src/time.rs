// SPDX-License-Identifier: MPL-2.0

//! Time handling.
//!
//! The source counts wall-clock time in whole microseconds since boot; all
//! EEVDF arithmetic is exact integer arithmetic in that unit, so we use plain
//! `u64` newtypes instead of `core::time::Duration` to avoid repeated
//! nanosecond conversions on the hot path.

use core::ops::{Add, Sub};

/// A monotonic instant, in microseconds since some arbitrary epoch (boot).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Default)]
pub struct Instant(pub u64);

/// A span of wall-clock time, in microseconds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Default)]
pub struct Duration(pub u64);

impl Duration {
    pub const ZERO: Duration = Duration(0);

    pub const fn from_micros(us: u64) -> Self {
        Duration(us)
    }

    pub const fn from_millis(ms: u64) -> Self {
        Duration(ms * 1_000)
    }

    pub const fn as_micros(self) -> u64 {
        self.0
    }

    pub fn saturating_sub(self, rhs: Duration) -> Duration {
        Duration(self.0.saturating_sub(rhs.0))
    }
}

impl Add<Duration> for Instant {
    type Output = Instant;
    fn add(self, rhs: Duration) -> Instant {
        Instant(self.0.saturating_add(rhs.0))
    }
}

impl Sub<Instant> for Instant {
    type Output = Duration;
    fn sub(self, rhs: Instant) -> Duration {
        // Two instants can be observed out of order across CPUs under
        // relaxed cross-CPU ordering guarantees; never panic on underflow,
        // just report zero elapsed time.
        Duration(self.0.saturating_sub(rhs.0))
    }
}

impl Add<Duration> for Duration {
    type Output = Duration;
    fn add(self, rhs: Duration) -> Duration {
        Duration(self.0.saturating_add(rhs.0))
    }
}

impl Sub<Duration> for Duration {
    type Output = Duration;
    fn sub(self, rhs: Duration) -> Duration {
        Duration(self.0.saturating_sub(rhs.0))
    }
}

/// The injected monotonic time source.
pub trait Clock: Send + Sync {
    fn now(&self) -> Instant;
}
