//! Tools and data structures for the two-window sliding rate limiter.

use std::sync::{
    atomic::{AtomicU64, Ordering::*},
    Arc, OnceLock, RwLock,
};
use std::time::Duration;

use crate::clock::{Clock, SystemClock};
use crate::error::Error;

use self::rotation::RotationTask;
use self::window::WindowCounter;

mod rotation;
mod window;

/// Recommended lower bound for the configured window length.
///
/// This is a business rule rather than a mechanical constraint: shorter
/// windows are accepted, but leave the interpolation little room to smooth
/// anything. Configuring below the floor logs a warning when the `tracing`
/// feature is enabled; it is never an error.
pub const RECOMMENDED_MIN_WINDOW: Duration = Duration::from_secs(5 * 60);

/// The `current` and `previous` window slots.
///
/// Exactly one counter accepts increments (`current`) and at most one
/// retired counter contributes to interpolation (`previous`). The slots
/// only ever change together, under [`Windows::refresh`]'s write lock.
#[derive(Debug)]
struct WindowPair {
    current: Arc<WindowCounter>,
    previous: Arc<WindowCounter>,
}

/// Shared rotation state: the guarded window pair plus the fixed span.
///
/// Readers clone the two `Arc` handles under a brief read lock, so all
/// counting happens on the windows themselves with no pair-wide lock held.
/// The write lock is taken only for the pointer swap in
/// [`refresh`](Windows::refresh). Shared between the limiter and its
/// background rotation task.
#[derive(Debug)]
struct Windows {
    pair: RwLock<WindowPair>,

    /// Window span in microseconds; fixed for the limiter's lifetime.
    span_micros: u64,
}

impl Windows {
    fn new(now_micros: u64, span_micros: u64) -> Self {
        Self {
            pair: RwLock::new(WindowPair {
                current: Arc::new(WindowCounter::new(now_micros, span_micros)),
                previous: Arc::new(WindowCounter::unstarted()),
            }),
            span_micros,
        }
    }

    /// Clones both window handles for a consistent read.
    #[inline]
    fn snapshot(&self) -> (Arc<WindowCounter>, Arc<WindowCounter>) {
        let pair = self.pair.read().unwrap_or_else(|e| e.into_inner());
        (pair.current.clone(), pair.previous.clone())
    }

    /// End of the current window: the next rotation deadline.
    fn current_end_micros(&self) -> u64 {
        self.pair
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .current
            .end_micros()
    }

    /// Retires `current` into the `previous` slot and opens a fresh window,
    /// if the current window has expired at `now_micros`.
    ///
    /// The swap happens under the write lock: no reader can observe a
    /// missing `current` or both slots aliasing one counter. Returns
    /// whether a rotation happened; a still-open window is a no-op.
    fn refresh(&self, now_micros: u64) -> bool {
        let mut pair = self.pair.write().unwrap_or_else(|e| e.into_inner());
        if now_micros < pair.current.end_micros() {
            return false;
        }

        // The fresh window opens at `now`, not at the old end: time where
        // no window was open stays uncounted rather than being back-dated.
        let fresh = Arc::new(WindowCounter::new(now_micros, self.span_micros));
        pair.previous = std::mem::replace(&mut pair.current, fresh);

        #[cfg(feature = "tracing")]
        tracing::debug!(
            "rotated counting windows: current spans [{}..{}), {} keys retired",
            now_micros,
            now_micros.saturating_add(self.span_micros),
            pair.previous.tracked_keys()
        );

        true
    }
}

/// A per-client sliding-window request rate limiter.
///
/// For every incoming request the limiter answers one question: has the
/// client behind `key` exceeded `max_requests` within the trailing
/// `window_length`? It keeps two fixed counting windows, a `current` one
/// that absorbs increments and a frozen `previous` one, and blends them
/// into a sliding estimate instead of storing per-request timestamps.
///
/// A background task retires `current` into the `previous` slot at each
/// window deadline. That slot swap is the only state transition in the
/// limiter and happens under a write lock, so decisions always see one
/// coherent pair of windows.
///
/// ## Characteristics
///
/// - **Smooth limiting** across window boundaries via linear interpolation.
/// - **Bounded memory**: O(distinct keys) per window, two windows total,
///   no request log.
/// - **Lock-light hot path**: a brief read lock to snapshot the window
///   pair, then one sharded map update.
/// - **Approximate**: requests are assumed uniform within a window, so the
///   estimate can deviate from an exact sliding log, most visibly for
///   bursty traffic near a rotation.
///
/// ## Algorithm
///
/// For a given `key`, with `f` the elapsed fraction of the current window
/// clamped to `[0.0, 1.0]`:
///
/// ```text
/// estimate = round(current_count * f) + round(previous_count * (1 - f))
/// ```
///
/// Each term is rounded half away from zero before the terms are summed.
/// A request is blocked when `estimate > max_requests`, strictly: the
/// request that lands exactly on the ceiling is still allowed.
///
/// ## Sharing
///
/// One limiter instance is meant to be shared across the whole request
/// pipeline, typically behind an `Arc`. All operations take `&self`.
///
/// ## Example
///
/// ```no_run
/// use std::time::Duration;
/// use weir::RateLimiter;
///
/// #[tokio::main]
/// async fn main() -> Result<(), weir::Error> {
///     let limiter = RateLimiter::setup(Duration::from_secs(5 * 60), 1_000)?;
///
///     if limiter.should_block("203.0.113.7") {
///         // tell the caller to back off, e.g. with a 429
///     }
///
///     limiter.shutdown().await;
///     Ok(())
/// }
/// ```
#[derive(Debug)]
pub struct RateLimiter<C: Clock = SystemClock> {
    /// The two counting windows and the span they cover.
    windows: Arc<Windows>,

    /// Configured length of one counting window.
    window_length: Duration,

    /// Ceiling of allowed requests per window per key.
    max_requests: AtomicU64,

    /// Time source for window bounds and interpolation weights.
    clock: C,

    /// Background rotation task, present once started.
    rotation: OnceLock<RotationTask>,
}

impl RateLimiter {
    /// Creates a limiter on the system clock and starts the background
    /// window rotation.
    ///
    /// The initial `current` window opens at the time of the call; the
    /// `previous` slot starts out empty, so a fresh limiter estimates zero
    /// for every key regardless of how far the first window has elapsed.
    ///
    /// # Parameters
    ///
    /// - `window_length`: span of one counting window. See
    ///   [`RECOMMENDED_MIN_WINDOW`] for the practical lower bound.
    /// - `max_requests`: ceiling of allowed requests per window per key.
    ///
    /// # Errors
    ///
    /// Returns [`Error::ZeroWindowLength`] if `window_length` is shorter
    /// than one microsecond.
    ///
    /// # Panics
    ///
    /// Panics if called outside a Tokio runtime, which the rotation task is
    /// spawned on. Use [`with_clock`](Self::with_clock) and
    /// [`start_rotation`](Self::start_rotation) to defer the spawn.
    #[inline]
    pub fn setup(window_length: Duration, max_requests: u64) -> Result<Self, Error> {
        let limiter = Self::with_clock(window_length, max_requests, SystemClock)?;
        limiter.start_rotation();
        Ok(limiter)
    }
}

impl<C: Clock> RateLimiter<C> {
    /// Creates a [`RateLimiter`] with a custom [`Clock`], without starting
    /// the background rotation.
    ///
    /// This is primarily useful for testing and for embedders that drive
    /// [`refresh_windows`](Self::refresh_windows) themselves. Call
    /// [`start_rotation`](Self::start_rotation) to attach the background
    /// task later.
    ///
    /// # Errors
    ///
    /// Returns [`Error::ZeroWindowLength`] if `window_length` is shorter
    /// than one microsecond.
    #[inline]
    pub fn with_clock(window_length: Duration, max_requests: u64, clock: C) -> Result<Self, Error> {
        let span_micros: u64 = window_length
            .as_micros()
            .try_into()
            .unwrap_or(u64::MAX);
        if span_micros == 0 {
            return Err(Error::ZeroWindowLength);
        }

        #[cfg(feature = "tracing")]
        if window_length < RECOMMENDED_MIN_WINDOW {
            tracing::warn!(
                "window length {window_length:?} is below the recommended minimum of \
                 {RECOMMENDED_MIN_WINDOW:?}; the sliding estimate smooths less the shorter the window"
            );
        }

        let now = clock.now_micros();
        Ok(Self {
            windows: Arc::new(Windows::new(now, span_micros)),
            window_length,
            max_requests: AtomicU64::new(max_requests),
            clock,
            rotation: OnceLock::new(),
        })
    }

    /// Records a request for `key` and decides whether it should block.
    ///
    /// The count is incremented unconditionally: blocked requests still
    /// weigh on future decisions. The decision then compares the estimate,
    /// including this request, against the ceiling with a strict `>`, so
    /// the request that lands exactly on `max_requests` is allowed and the
    /// next one blocks.
    ///
    /// # Notes
    ///
    /// - Safe for concurrent use from many threads and tasks; once a call
    ///   returns, its increment is visible to every subsequent call.
    /// - An increment is never dropped by a concurrent rotation: it lands
    ///   in the snapshot's window, which the rotation either keeps as
    ///   `current` or retires into `previous`.
    /// - Completes in map-access time and never waits on I/O, timers, or
    ///   the rotation task.
    #[inline]
    pub fn should_block(&self, key: &str) -> bool {
        let (current, previous) = self.windows.snapshot();
        current.increment(key);

        self.interpolate(&current, &previous, key) > self.max_requests.load(Acquire)
    }

    /// Estimates the number of requests from `key` within the trailing
    /// `window_length` interval ending now.
    ///
    /// The two discrete windows are blended linearly, each term rounded
    /// half away from zero before the sum (see the type-level docs for the
    /// formula). A pure read with no side effects, taken over a consistent
    /// snapshot of both windows.
    #[inline]
    pub fn interpolated_count(&self, key: &str) -> u64 {
        let (current, previous) = self.windows.snapshot();
        self.interpolate(&current, &previous, key)
    }

    /// Two-point linear interpolation over an already-taken snapshot.
    ///
    /// [`should_block`](Self::should_block) must evaluate the estimate on
    /// the same snapshot its increment went into, so snapshotting is the
    /// caller's job.
    fn interpolate(&self, current: &WindowCounter, previous: &WindowCounter, key: &str) -> u64 {
        let now = self.clock.now_micros();

        // The clamp covers both edges: a clock reading before the window
        // opened and an overdue rotation past its end.
        let elapsed = now.saturating_sub(current.start_micros());
        let elapsed_fraction = (elapsed as f64 / self.windows.span_micros as f64).clamp(0.0, 1.0);
        let remaining_fraction = 1.0 - elapsed_fraction;

        let current_part = (current.count(key) as f64 * elapsed_fraction).round() as u64;
        let previous_part = (previous.count(key) as f64 * remaining_fraction).round() as u64;

        current_part.saturating_add(previous_part)
    }

    /// Rotates the windows if the current one has expired.
    ///
    /// Retires `current` into the `previous` slot with its counts frozen,
    /// and opens a fresh `current` spanning `[now, now + window_length)`.
    /// Returns whether a rotation occurred: `false` while the current
    /// window is still open, and at most one `true` per genuine expiry.
    ///
    /// The background task calls this at window deadlines; limiters built
    /// via [`with_clock`](Self::with_clock) without
    /// [`start_rotation`](Self::start_rotation) drive it manually.
    #[inline]
    pub fn refresh_windows(&self) -> bool {
        self.windows.refresh(self.clock.now_micros())
    }

    /// Configured length of one counting window.
    #[inline(always)]
    pub fn window_length(&self) -> Duration {
        self.window_length
    }

    /// Current ceiling of allowed requests per window per key.
    #[inline(always)]
    pub fn max_requests(&self) -> u64 {
        self.max_requests.load(Acquire)
    }

    /// Replaces the request ceiling, effective for the next decision.
    ///
    /// In-flight [`should_block`](Self::should_block) calls may still
    /// compare against the old value; there is no fencing beyond the
    /// atomic itself.
    #[inline]
    pub fn set_max_requests(&self, max_requests: u64) {
        self.max_requests.store(max_requests, Release);
    }

    /// Stops the background rotation task and waits for it to exit.
    ///
    /// Intended for graceful teardown and deterministic tests. Dropping
    /// the limiter without calling this still cancels the task; it just
    /// does not wait for the exit.
    pub async fn shutdown(mut self) {
        if let Some(task) = self.rotation.take() {
            task.stop().await;
        }
    }
}

impl<C: Clock + Clone + 'static> RateLimiter<C> {
    /// Spawns the background rotation task on the current Tokio runtime.
    ///
    /// At most one task is ever attached: the first call returns `true`,
    /// every later call is a no-op returning `false`. The task sleeps
    /// until the current window's deadline, rotates, and recomputes the
    /// next deadline from the clock.
    ///
    /// # Panics
    ///
    /// Panics if called outside a Tokio runtime.
    pub fn start_rotation(&self) -> bool {
        let mut started = false;
        self.rotation.get_or_init(|| {
            started = true;
            RotationTask::spawn(self.windows.clone(), self.clock.clone())
        });
        started
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::test_utils::ManualClock;

    const WINDOW: Duration = Duration::from_secs(20 * 60);

    fn limiter_at_zero(max_requests: u64) -> (RateLimiter<ManualClock>, ManualClock) {
        let clock = ManualClock::new();
        let limiter = RateLimiter::with_clock(WINDOW, max_requests, clock.clone()).unwrap();
        (limiter, clock)
    }

    #[test]
    fn it_rejects_a_zero_window_length() {
        let result = RateLimiter::with_clock(Duration::ZERO, 10, ManualClock::new());

        assert_eq!(result.unwrap_err(), Error::ZeroWindowLength);
    }

    #[test]
    fn it_rejects_a_sub_microsecond_window() {
        // 999ns truncates to zero microseconds, leaving no span to
        // interpolate over.
        let result = RateLimiter::with_clock(Duration::from_nanos(999), 10, ManualClock::new());

        assert_eq!(result.unwrap_err(), Error::ZeroWindowLength);
    }

    #[test]
    fn an_unseen_key_estimates_zero() {
        let (limiter, clock) = limiter_at_zero(100);

        clock.advance(Duration::from_secs(7 * 60));

        assert_eq!(limiter.interpolated_count("203.0.113.7"), 0);
    }

    #[test]
    fn the_first_check_records_exactly_one_request() {
        let (limiter, _clock) = limiter_at_zero(100);

        limiter.should_block("203.0.113.7");

        let (current, _) = limiter.windows.snapshot();
        assert_eq!(current.count("203.0.113.7"), 1);
    }

    #[test]
    fn it_interpolates_halfway_through_the_window() {
        // 50 requests in the previous window, 100 in the current one, and
        // the current window half elapsed:
        // round(100 * 0.5) + round(50 * 0.5) = 75.
        let (limiter, clock) = limiter_at_zero(1_000);
        let key = "203.0.113.7";

        for _ in 0..50 {
            limiter.should_block(key);
        }
        clock.advance(WINDOW);
        assert!(limiter.refresh_windows());

        for _ in 0..100 {
            limiter.should_block(key);
        }
        clock.advance(WINDOW / 2);

        assert_eq!(limiter.interpolated_count(key), 75);
    }

    #[test]
    fn it_blocks_strictly_above_the_ceiling() {
        let (limiter, clock) = limiter_at_zero(74);
        let key = "203.0.113.7";

        for _ in 0..50 {
            limiter.should_block(key);
        }
        clock.advance(WINDOW);
        limiter.refresh_windows();
        for _ in 0..100 {
            limiter.should_block(key);
        }
        clock.advance(WINDOW / 2);

        // The check itself lifts the current count to 101, so the
        // comparison sees round(101 * 0.5) + round(50 * 0.5) = 76.
        assert!(limiter.should_block(key), "76 > 74 must block");

        limiter.set_max_requests(76);

        // Same shape with 102 in the current window: the estimate is
        // still 76, and 76 > 76 is false.
        assert!(!limiter.should_block(key), "76 > 76 must not block");
    }

    #[test]
    fn refresh_is_a_no_op_before_expiry() {
        let (limiter, clock) = limiter_at_zero(100);

        clock.advance(WINDOW - Duration::from_secs(1));

        assert!(!limiter.refresh_windows());
    }

    #[test]
    fn it_rotates_an_expired_window_once() {
        let (limiter, clock) = limiter_at_zero(100);
        let key = "203.0.113.7";

        for _ in 0..7 {
            limiter.should_block(key);
        }
        let (retiring, _) = limiter.windows.snapshot();

        clock.advance(WINDOW + Duration::from_secs(3));

        assert!(limiter.refresh_windows());
        let (current, previous) = limiter.windows.snapshot();

        // The retired window moved into the previous slot unchanged.
        assert!(Arc::ptr_eq(&previous, &retiring));
        assert!(!Arc::ptr_eq(&current, &retiring));
        assert_eq!(previous.count(key), 7);
        assert_eq!(current.count(key), 0);

        // The fresh window opens at the rotation instant, not at the old
        // window's end.
        assert_eq!(current.start_micros(), clock.now_micros());

        // Idempotent until the next genuine expiry.
        assert!(!limiter.refresh_windows());
        assert!(!limiter.refresh_windows());

        clock.advance(WINDOW);
        assert!(limiter.refresh_windows());
    }

    #[test]
    fn a_fresh_limiter_has_an_empty_previous_window() {
        let (limiter, clock) = limiter_at_zero(100);
        let key = "203.0.113.7";

        for _ in 0..10 {
            limiter.should_block(key);
        }

        // 30% into the first window only the current term contributes:
        // round(10 * 0.3) + round(0 * 0.7) = 3.
        clock.advance(WINDOW * 3 / 10);

        assert_eq!(limiter.interpolated_count(key), 3);
    }

    #[test]
    fn the_elapsed_fraction_clamps_while_a_rotation_is_overdue() {
        let (limiter, clock) = limiter_at_zero(100);
        let key = "203.0.113.7";

        for _ in 0..9 {
            limiter.should_block(key);
        }

        // Twice the window has passed with no rotation: the fraction pins
        // at 1.0 and the estimate equals the raw current count.
        clock.advance(WINDOW * 2);

        assert_eq!(limiter.interpolated_count(key), 9);
    }

    #[test]
    fn it_tracks_keys_independently() {
        let (limiter, clock) = limiter_at_zero(2);

        clock.advance(WINDOW - Duration::from_secs(1));

        assert!(!limiter.should_block("10.0.0.1"));
        assert!(!limiter.should_block("10.0.0.1"));
        assert!(limiter.should_block("10.0.0.1"));

        assert!(!limiter.should_block("10.0.0.2"));
    }

    #[test]
    fn concurrent_checks_lose_no_updates() {
        use std::thread;

        let clock = ManualClock::new();
        let limiter = Arc::new(RateLimiter::with_clock(WINDOW, u64::MAX, clock.clone()).unwrap());
        let key = "203.0.113.7";

        let mut handles = vec![];

        for _ in 0..8 {
            let limiter = limiter.clone();
            handles.push(thread::spawn(move || {
                for _ in 0..250 {
                    limiter.should_block(key);
                }
            }));
        }

        for handle in handles {
            handle.join().unwrap();
        }

        // At a fully elapsed window the estimate is the exact count.
        clock.advance(WINDOW);
        assert_eq!(limiter.interpolated_count(key), 2_000);
    }

    #[tokio::test]
    async fn setup_starts_on_the_system_clock() {
        let limiter = RateLimiter::setup(Duration::from_secs(10 * 60), 500).unwrap();

        assert_eq!(limiter.window_length(), Duration::from_secs(10 * 60));
        assert_eq!(limiter.max_requests(), 500);
        assert!(!limiter.should_block("203.0.113.7"));

        limiter.shutdown().await;
    }

    #[tokio::test]
    async fn rotation_starts_at_most_once() {
        let (limiter, _clock) = limiter_at_zero(100);

        assert!(limiter.start_rotation());
        assert!(!limiter.start_rotation());

        limiter.shutdown().await;
    }
}
