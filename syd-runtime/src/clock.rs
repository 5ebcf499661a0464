//! Monotonic runtime clock in 100 ms ticks.
//!
//! Timeout bookkeeping runs at sub-second granularity over thousands of connections, so the
//! scanner compares cheap integer ticks instead of `Instant` values. The epoch is anchored at
//! first use and shared by all workers.

use std::sync::OnceLock;
use std::time::Instant;

static EPOCH: OnceLock<Instant> = OnceLock::new();

fn epoch() -> Instant {
    *EPOCH.get_or_init(Instant::now)
}

/// Returns the number of 100 ms ticks elapsed since the process clock epoch.
#[must_use]
pub fn ticks() -> i64 {
    i64::try_from(epoch().elapsed().as_millis() / 100).unwrap_or(i64::MAX)
}

/// Returns whole seconds elapsed since the process clock epoch.
#[must_use]
pub fn monotonic_secs() -> i64 {
    i64::try_from(epoch().elapsed().as_secs()).unwrap_or(i64::MAX)
}
