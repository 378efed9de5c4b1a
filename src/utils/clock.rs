//! Monotonic time source for pool and session accounting.
//!
//! quanta calibrates against the TSC where available, so the per-release
//! timestamping on the pool hot path stays in the low nanoseconds.

use once_cell::sync::Lazy;
use quanta::Clock;

static CLOCK: Lazy<Clock> = Lazy::new(Clock::new);

/// Current instant from the calibrated clock.
#[inline]
pub fn now() -> quanta::Instant {
    CLOCK.now()
}

/// Nanoseconds elapsed since `earlier`, saturating at zero.
#[inline]
pub fn elapsed_ns(earlier: quanta::Instant) -> u64 {
    CLOCK.now().duration_since(earlier).as_nanos() as u64
}
