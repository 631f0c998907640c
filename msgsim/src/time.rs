//! Simulation time.
//!
//! The engine never reads a wall clock: the current time is handed to every
//! entry point through its [`Context`](crate::engine::Context), and every
//! delay it produces is a [`Duration`] relative to that time.

use std::time::Duration;

pub use tai_time::MonotonicTime;

/// Converts a nanosecond count to a `Duration`.
pub(crate) const fn from_ns(ns: u64) -> Duration {
    Duration::from_nanos(ns)
}

/// Converts a picosecond count to a `Duration`, rounding down to the
/// nanosecond.
pub(crate) const fn from_ps(ps: u64) -> Duration {
    Duration::from_nanos(ps / 1000)
}
