//! # Weir
//!
//! > In-process, per-client request rate limiting over two rotating
//! > counting windows, with a linearly interpolated sliding estimate of
//! > each client's trailing request count.
//!
//! The limiter sits inside a request-handling pipeline and answers, for
//! each incoming request, whether the originating client (any opaque
//! string key, typically an IP or host header) has exceeded the allowed
//! request rate. Counts are kept in two adjacent fixed windows that a
//! background task rotates; the decision blends both windows instead of
//! replaying a per-request log, so memory stays proportional to the
//! number of distinct keys.
//!
//! ## Features
//! * Sliding-window estimate from two rotating counting windows
//! * Safe under concurrent callers: sharded counters, atomic window swap
//! * Cancellable background rotation on the [Tokio](https://tokio.rs/) runtime
//! * Pluggable clock for deterministic tests
//! * Runs on stable Rust 1.80+
//!
//! ## Example
//! ```toml
//! [dependencies]
//! weir = "0.1.0"
//! tokio = { version = "1", features = ["full"] }
//! ```
//! ```no_run
//! use std::time::Duration;
//! use weir::RateLimiter;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), weir::Error> {
//!     // One limiter, shared by the whole pipeline
//!     let limiter = RateLimiter::setup(Duration::from_secs(5 * 60), 1_000)?;
//!
//!     // Per request: record it and decide
//!     if limiter.should_block("203.0.113.7") {
//!         // respond with 429 / Retry-After
//!     }
//!
//!     limiter.shutdown().await;
//!     Ok(())
//! }
//! ```

#![forbid(unsafe_code)]
#![deny(unreachable_pub)]

mod clock;
mod error;
mod limiter;

pub use clock::{Clock, SystemClock};
pub use error::Error;
pub use limiter::{RateLimiter, RECOMMENDED_MIN_WINDOW};
