//! # Tick Arithmetic
//!
//! The global tick counter wraps on overflow, so two tick values are only
//! ordered relative to each other: `a` is at or after `b` when the wrapping
//! difference `a - b` lies in the lower half of the `u32` range. Timeouts
//! longer than [`TICK_MAX_WAIT`] are therefore rejected.

use core::fmt;

use crate::config::TICK_HZ;

/// Longest relative timeout that still orders correctly after wrap.
pub const TICK_MAX_WAIT: u32 = u32::MAX / 2;

/// An absolute point on the wrapping tick line.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Hash)]
pub struct Tick(pub u32);

impl Tick {
    pub const ZERO: Tick = Tick(0);

    #[inline]
    pub const fn get(self) -> u32 {
        self.0
    }

    /// Tick `n` ticks later, wrapping.
    #[inline]
    pub const fn after(self, n: u32) -> Tick {
        Tick(self.0.wrapping_add(n))
    }

    /// True when `self` has been reached by `now`, i.e. `self <= now` on
    /// the wrapping line.
    #[inline]
    pub const fn is_due(self, now: Tick) -> bool {
        now.0.wrapping_sub(self.0) <= TICK_MAX_WAIT
    }

    /// True when `self` is strictly later than `other`.
    #[inline]
    pub const fn is_after(self, other: Tick) -> bool {
        !self.is_due(other)
    }

    /// Ticks from `earlier` to `self`, wrapping.
    #[inline]
    pub const fn since(self, earlier: Tick) -> u32 {
        self.0.wrapping_sub(earlier.0)
    }

    /// Milliseconds represented by this tick count since boot.
    ///
    /// Only exact when `1000` is a multiple of `TICK_HZ`; otherwise a
    /// higher-resolution clock source is needed and `None` is returned.
    pub const fn as_millis(self) -> Option<u32> {
        if 1000 % TICK_HZ == 0 {
            Some(self.0.wrapping_mul(1000 / TICK_HZ))
        } else {
            None
        }
    }
}

impl fmt::Display for Tick {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}t", self.0)
    }
}

/// How long a blocking kernel call may wait.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Wait {
    /// Fail immediately with `Timeout` if the resource is unavailable.
    NoWait,
    /// Wait at most this many ticks.
    Ticks(u32),
    /// Wait until the resource becomes available.
    Forever,
}

/// Convert milliseconds to a wait duration, rounding partial ticks up.
///
/// A negative value waits forever, zero does not wait.
pub fn tick_from_millisecond(ms: i32) -> Wait {
    if ms < 0 {
        return Wait::Forever;
    }
    let ms = ms as u32;
    let ticks = TICK_HZ * (ms / 1000) + (TICK_HZ * (ms % 1000) + 999) / 1000;
    if ticks == 0 {
        Wait::NoWait
    } else {
        Wait::Ticks(ticks)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_due_across_wrap() {
        let expiry = Tick(u32::MAX - 2);
        assert!(!expiry.is_due(Tick(u32::MAX - 3)));
        assert!(expiry.is_due(Tick(u32::MAX - 2)));
        // Counter wrapped past zero: still due.
        assert!(expiry.is_due(Tick(4)));
        assert_eq!(Tick(4).since(expiry), 7);
    }

    #[test]
    fn test_after_wraps() {
        let t = Tick(u32::MAX).after(3);
        assert_eq!(t, Tick(2));
        assert!(t.is_after(Tick(u32::MAX)));
        assert!(!Tick(u32::MAX).is_after(t));
    }

    #[test]
    fn test_millisecond_conversion() {
        // TICK_HZ = 1000: one tick per millisecond.
        assert_eq!(tick_from_millisecond(-1), Wait::Forever);
        assert_eq!(tick_from_millisecond(0), Wait::NoWait);
        assert_eq!(tick_from_millisecond(1), Wait::Ticks(1));
        assert_eq!(tick_from_millisecond(2500), Wait::Ticks(2500));
        assert_eq!(Tick(42).as_millis(), Some(42));
    }
}
