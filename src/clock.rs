//! Clock Source
//!
//! Monotonic time reads, native sleeps and busy-spins. Every deadline in the
//! crate is an `Instant`, so wall-clock jumps never disturb a pulse train.

use std::sync::OnceLock;
use std::time::{Duration, Instant};

/// Number of clock ticks sampled when probing resolution.
const RESOLUTION_SAMPLES: usize = 16;

/// Upper bound on reads per sample before the clock is declared stuck.
const MAX_READS_PER_SAMPLE: usize = 1_000_000;

static RESOLUTION: OnceLock<Duration> = OnceLock::new();

/// Current monotonic time.
#[inline]
pub fn now() -> Instant {
    Instant::now()
}

/// Block the thread for `d` using the OS sleep, with no spin correction.
#[inline]
pub fn native_sleep(d: Duration) {
    if !d.is_zero() {
        spin_sleep::native_sleep(d);
    }
}

/// Busy-poll the clock until `deadline`. Returns the first time read at or
/// after the deadline.
#[inline]
pub fn spin_until(deadline: Instant) -> Instant {
    loop {
        let t = Instant::now();
        if t >= deadline {
            return t;
        }
        std::hint::spin_loop();
    }
}

/// Time left until `deadline`, clamped to zero once it has passed.
#[inline]
pub fn remaining(deadline: Instant, now: Instant) -> Duration {
    deadline.saturating_duration_since(now)
}

/// Smallest observable step of the monotonic clock.
///
/// Probed once per process and cached. A clock that never advances within
/// the probe budget reports `Duration::MAX`.
pub fn resolution() -> Duration {
    *RESOLUTION.get_or_init(probe_resolution)
}

fn probe_resolution() -> Duration {
    let mut best = Duration::MAX;
    for _ in 0..RESOLUTION_SAMPLES {
        let start = Instant::now();
        for _ in 0..MAX_READS_PER_SAMPLE {
            let t = Instant::now();
            if t > start {
                best = best.min(t - start);
                break;
            }
        }
    }
    best
}
