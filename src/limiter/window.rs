//! Tools and data structures for per-key request counting within one window.

use dashmap::DashMap;

/// Per-key request counts bounded to one fixed time span.
///
/// A counter covers `[start_micros, end_micros)` on the limiter's clock.
/// Keys appear lazily on the first [`increment`](WindowCounter::increment);
/// a key that was never incremented has a logical count of zero.
///
/// All methods are safe to call concurrently: counts live in a sharded
/// [`DashMap`], so increments for the same key serialize on a shard lock
/// and never lose updates, while different keys rarely contend at all.
#[derive(Debug)]
pub(crate) struct WindowCounter {
    /// Request count per client key.
    counts: DashMap<String, u64>,

    /// Start of the window span, in microseconds on the limiter's clock.
    start_micros: u64,

    /// End of the window span: `start_micros` plus the window length.
    end_micros: u64,
}

impl WindowCounter {
    /// Creates an empty counter spanning `[start_micros, start_micros + span_micros)`.
    pub(crate) fn new(start_micros: u64, span_micros: u64) -> Self {
        Self {
            counts: DashMap::new(),
            start_micros,
            end_micros: start_micros.saturating_add(span_micros),
        }
    }

    /// Creates the degenerate zero-span counter that fills the `previous`
    /// slot before the first rotation. It holds no keys, so it contributes
    /// nothing to any estimate.
    pub(crate) fn unstarted() -> Self {
        Self::new(0, 0)
    }

    /// Adds one request for `key`, creating the entry on first touch.
    #[inline]
    pub(crate) fn increment(&self, key: &str) {
        // Fast path: avoid allocating the key when the entry exists.
        if let Some(mut count) = self.counts.get_mut(key) {
            *count += 1;
            return;
        }
        *self.counts.entry(key.to_owned()).or_insert(0) += 1;
    }

    /// Returns the recorded count for `key`, or zero if it was never seen.
    #[inline]
    pub(crate) fn count(&self, key: &str) -> u64 {
        self.counts.get(key).map(|count| *count).unwrap_or(0)
    }

    /// Start of the window span in microseconds.
    #[inline(always)]
    pub(crate) fn start_micros(&self) -> u64 {
        self.start_micros
    }

    /// End of the window span in microseconds.
    #[inline(always)]
    pub(crate) fn end_micros(&self) -> u64 {
        self.end_micros
    }

    /// Number of distinct keys recorded in this window.
    #[cfg(feature = "tracing")]
    pub(crate) fn tracked_keys(&self) -> usize {
        self.counts.len()
    }
}
