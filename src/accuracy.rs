//! Accuracy Strategy - how the worker reaches each phase deadline
//!
//! - `SleepOnly`: trust the OS sleep. Cheap, but may overshoot by the
//!   scheduler granularity (often a millisecond or more).
//! - `SleepAndSpin`: sleep until `turnaround` before the deadline, then
//!   busy-poll the clock. Uses `spin_sleep` with the turnaround as its
//!   native accuracy.
//! - `SleepAndOrSpin`: like `SleepAndSpin`, but the sleep is skipped when
//!   the thread is already running late, so a pre-empted thread never
//!   oversleeps.

use crate::clock;
use crate::error::ConfigError;
use spin_sleep::{SpinSleeper, SpinStrategy};
use std::time::{Duration, Instant};

/// How long before a deadline the spinning modes stop sleeping.
///
/// Fixed for the lifetime of a task; tasks built with a different
/// turnaround must be reconstructed.
pub const SLEEP_TURNAROUND: Duration = Duration::from_micros(200);

/// Wait algorithm used to hit phase deadlines.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum AccuracyMode {
    SleepOnly,
    #[default]
    SleepAndSpin,
    SleepAndOrSpin,
}

impl AccuracyMode {
    /// Numeric accuracy level (0, 1 or 2).
    pub fn level(self) -> i32 {
        match self {
            AccuracyMode::SleepOnly => 0,
            AccuracyMode::SleepAndSpin => 1,
            AccuracyMode::SleepAndOrSpin => 2,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            AccuracyMode::SleepOnly => "sleep-only",
            AccuracyMode::SleepAndSpin => "sleep-and-spin",
            AccuracyMode::SleepAndOrSpin => "sleep-and-or-spin",
        }
    }

    /// Whether the mode busy-polls the clock near the deadline.
    pub fn spins(self) -> bool {
        !matches!(self, AccuracyMode::SleepOnly)
    }
}

impl TryFrom<i32> for AccuracyMode {
    type Error = ConfigError;

    fn try_from(level: i32) -> Result<Self, Self::Error> {
        match level {
            0 => Ok(AccuracyMode::SleepOnly),
            1 => Ok(AccuracyMode::SleepAndSpin),
            2 => Ok(AccuracyMode::SleepAndOrSpin),
            other => Err(ConfigError::UnsupportedAccuracyMode(other)),
        }
    }
}

/// Check that a clock with `available` resolution can serve `mode`.
///
/// Spinning modes must be able to resolve the turnaround window; sleep-only
/// makes no promise finer than the OS sleep and always passes.
pub fn check_resolution(
    mode: AccuracyMode,
    turnaround: Duration,
    available: Duration,
) -> Result<(), ConfigError> {
    if mode.spins() && available > turnaround {
        return Err(ConfigError::TimerResolution {
            mode: mode.name(),
            required: turnaround,
            available,
        });
    }
    Ok(())
}

/// A configured wait algorithm. Owned by one task and used only from its
/// worker thread.
#[derive(Clone, Debug)]
pub struct AccuracyStrategy {
    mode: AccuracyMode,
    turnaround: Duration,
    sleeper: SpinSleeper,
}

impl AccuracyStrategy {
    /// Build a strategy, probing the monotonic clock for the resolution the
    /// mode needs.
    pub fn new(mode: AccuracyMode, turnaround: Duration) -> Result<Self, ConfigError> {
        check_resolution(mode, turnaround, clock::resolution())?;
        let accuracy_ns = u32::try_from(turnaround.as_nanos()).unwrap_or(u32::MAX);
        Ok(Self {
            mode,
            turnaround,
            sleeper: SpinSleeper::new(accuracy_ns).with_spin_strategy(SpinStrategy::SpinLoopHint),
        })
    }

    pub fn mode(&self) -> AccuracyMode {
        self.mode
    }

    pub fn turnaround(&self) -> Duration {
        self.turnaround
    }

    /// Block until `deadline` (best effort) and return the actual wake time.
    ///
    /// Never fails: a deadline already in the past yields a zero-length
    /// sleep, and lateness is left to the caller to report.
    pub fn wait_until(&self, deadline: Instant) -> Instant {
        let now = clock::now();
        match self.mode {
            AccuracyMode::SleepOnly => {
                clock::native_sleep(clock::remaining(deadline, now));
                clock::now()
            }
            AccuracyMode::SleepAndSpin => {
                self.sleeper.sleep(clock::remaining(deadline, now));
                clock::spin_until(deadline)
            }
            AccuracyMode::SleepAndOrSpin => {
                if now >= deadline {
                    return now;
                }
                let margin = deadline - now;
                if margin > self.turnaround {
                    clock::native_sleep(margin - self.turnaround);
                }
                clock::spin_until(deadline)
            }
        }
    }
}
