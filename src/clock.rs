//! Time sources for window bookkeeping.
//!
//! All time-dependent logic in this crate, from window bounds to rotation
//! deadlines, is driven by a pluggable [`Clock`] so that it can be exercised
//! deterministically in tests.
//!
//! Time is expressed in **microseconds** on an arbitrary per-clock scale and
//! must be **monotonic** (non-decreasing). Nothing in the crate interprets
//! the absolute value; only differences between readings matter.

use std::time::Instant;

/// A source of time used by the limiter's window bookkeeping.
///
/// Implementations must ensure that the returned value is:
///
/// - Monotonic (non-decreasing)
/// - Cheap to compute, as it is read on every rate-limit decision
pub trait Clock: Send + Sync {
    /// Returns a monotonic timestamp in microseconds.
    fn now_micros(&self) -> u64;
}

/// Monotonic system clock backed by `Instant`.
///
/// Uses an internal start anchor and returns elapsed microseconds since that
/// anchor. This avoids wall-clock jumps (NTP, manual adjustments, etc.), so
/// a backward system-clock step can never delay or double-fire a window
/// rotation.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl SystemClock {
    #[inline]
    fn anchor() -> Instant {
        // `Instant::now()` is cheap and monotonic.
        // We want a stable anchor shared across calls.
        // Using `OnceLock` gives us a process-wide start point.
        static START: std::sync::OnceLock<Instant> = std::sync::OnceLock::new();
        *START.get_or_init(Instant::now)
    }
}

impl Clock for SystemClock {
    #[inline]
    fn now_micros(&self) -> u64 {
        let elapsed = Self::anchor().elapsed();
        elapsed
            .as_micros()
            .try_into()
            .unwrap_or(u64::MAX)
    }
}

#[cfg(test)]
pub(crate) mod test_utils {
    use std::sync::{Arc, Mutex};
    use std::time::Duration;
    use super::Clock;

    /// A hand-driven clock for deterministic window tests.
    #[derive(Debug, Clone, Default)]
    pub(crate) struct ManualClock {
        now_micros: Arc<Mutex<u64>>,
    }

    impl ManualClock {
        pub(crate) fn new() -> Self {
            Self::default()
        }

        pub(crate) fn advance(&self, step: Duration) {
            let mut now = self.now_micros.lock().unwrap();
            *now += step.as_micros() as u64;
        }
    }

    impl Clock for ManualClock {
        fn now_micros(&self) -> u64 {
            *self.now_micros.lock().unwrap()
        }
    }
}
