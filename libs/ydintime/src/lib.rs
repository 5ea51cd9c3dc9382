//! Temporal quantification.
//!
//! The kernel clock is a monotonic millisecond counter starting at boot.
//! This is deliberately coarse: the scheduler timeslice and the timer list
//! both work in milliseconds, and nothing in the kernel needs better
//! resolution.

#![no_std]

use core::fmt;
use core::ops::{Add, AddAssign, Sub};

pub use core::time::Duration;

use serde::{Deserialize, Serialize};

/// A measurement of the monotonically nondecreasing kernel clock.
/// Opaque and useful only together with `Duration`.
#[derive(
    Debug, Copy, Clone, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub struct Instant(u64);

impl Instant {
    /// Clock value at boot
    pub const ZERO: Self = Self(0);

    /// Used by the system clock as a constructor.
    /// User code should only obtain instants from the kernel.
    pub const fn from_millis(ms: u64) -> Self {
        Self(ms)
    }

    pub const fn as_millis(self) -> u64 {
        self.0
    }

    /// Returns the amount of time elapsed from another instant to this one.
    /// Panics if `earlier` is later than `self`.
    pub fn duration_since(self, earlier: Instant) -> Duration {
        Duration::from_millis(
            self.0
                .checked_sub(earlier.0)
                .expect("specified instant was later than self"),
        )
    }

    pub fn checked_add(self, d: Duration) -> Option<Instant> {
        let ms = d.as_millis();
        if ms > u64::MAX as u128 {
            return None;
        }
        self.0.checked_add(ms as u64).map(Instant)
    }
}

impl Add<Duration> for Instant {
    type Output = Instant;

    fn add(self, other: Duration) -> Instant {
        self.checked_add(other)
            .expect("overflow when adding duration to instant")
    }
}

impl AddAssign<Duration> for Instant {
    fn add_assign(&mut self, other: Duration) {
        *self = *self + other;
    }
}

impl Sub<Instant> for Instant {
    type Output = Duration;

    fn sub(self, other: Instant) -> Duration {
        self.duration_since(other)
    }
}

impl fmt::Display for Instant {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}ms", self.0)
    }
}
