//! Describes limiter configuration errors

use std::fmt::{Display, Formatter};

/// Errors produced when a limiter is constructed with invalid parameters.
///
/// Construction is the only fallible operation in this crate: once a
/// [`RateLimiter`](crate::RateLimiter) exists, its decision and rotation
/// operations are total.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Error {
    /// The configured window length was zero.
    ///
    /// A zero-length window has no interior to interpolate over, so the
    /// limiter refuses to exist rather than divide by it later.
    ZeroWindowLength,
}

impl Display for Error {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Error::ZeroWindowLength => write!(f, "Rate Limiter Error: window length must be greater than zero"),
        }
    }
}

impl std::error::Error for Error {}
