//! Pulse Timer - timing parameters of one pulsed task
//!
//! A pulse is a HIGH phase followed by a LOW phase. A train is `train_length`
//! pulses sharing one set of durations (`0` means the train never ends).
//!
//! Two equivalent descriptions are supported:
//! - pulse-based: high duration, low duration, number of pulses
//! - train-based: frequency (Hz), duty cycle, train duration (seconds)
//!
//! Durations are held at microsecond resolution and capped at `u32::MAX`
//! microseconds (a little over 71 minutes) per phase.

use crate::error::ConfigError;
use std::time::{Duration, Instant};

/// Train length value meaning "repeat until stopped".
pub const INFINITE_TRAIN: u32 = 0;

/// Longest phase the timer accepts, in microseconds.
const MAX_PHASE_MICROS: u64 = u32::MAX as u64;

/// One half of a pulse cycle.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Phase {
    High,
    Low,
}

/// High/low durations and train length of a task.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PulseTiming {
    high: Duration,
    low: Duration,
    train_length: u32,
}

impl Default for PulseTiming {
    fn default() -> Self {
        Self {
            high: Duration::from_millis(10),
            low: Duration::from_millis(10),
            train_length: 1,
        }
    }
}

/// Convert seconds to a whole-microsecond `Duration`, rejecting negative,
/// non-finite and oversized values.
pub fn secs_to_duration(field: &'static str, secs: f64) -> Result<Duration, ConfigError> {
    if !secs.is_finite() || secs < 0.0 {
        return Err(ConfigError::InvalidDuration { field, value: secs });
    }
    let micros = (secs * 1e6).round();
    if micros > MAX_PHASE_MICROS as f64 {
        return Err(ConfigError::DurationOverflow { field, value: secs });
    }
    Ok(Duration::from_micros(micros as u64))
}

/// Round a `Duration` to whole microseconds, saturating at the phase cap.
fn to_micros_resolution(d: Duration) -> Duration {
    let micros = (d.as_nanos() + 500) / 1_000;
    Duration::from_micros(micros.min(MAX_PHASE_MICROS as u128) as u64)
}

impl PulseTiming {
    /// Build from the pulse-based description.
    pub fn from_pulses(high: Duration, low: Duration, train_length: u32) -> Self {
        Self {
            high: to_micros_resolution(high),
            low: to_micros_resolution(low),
            train_length,
        }
    }

    /// Build from high and low durations given in seconds.
    pub fn from_secs(
        high_secs: f64,
        low_secs: f64,
        train_length: u32,
    ) -> Result<Self, ConfigError> {
        Ok(Self {
            high: secs_to_duration("high duration", high_secs)?,
            low: secs_to_duration("low duration", low_secs)?,
            train_length,
        })
    }

    /// Build from the train-based description.
    ///
    /// A `train_secs` of 0 gives an infinite train.
    pub fn from_train(
        frequency: f64,
        duty_cycle: f64,
        train_secs: f64,
    ) -> Result<Self, ConfigError> {
        if !frequency.is_finite() || frequency <= 0.0 {
            return Err(ConfigError::InvalidFrequency(frequency));
        }
        if !(duty_cycle > 0.0 && duty_cycle <= 1.0) {
            return Err(ConfigError::InvalidDutyCycle(duty_cycle));
        }
        if !train_secs.is_finite() || train_secs < 0.0 {
            return Err(ConfigError::InvalidTrainDuration(train_secs));
        }

        let period_secs = 1.0 / frequency;
        let high = secs_to_duration("high duration", period_secs * duty_cycle)?;
        let low = secs_to_duration("low duration", period_secs * (1.0 - duty_cycle))?;

        let pulses = (train_secs / period_secs).round();
        if pulses > u32::MAX as f64 {
            return Err(ConfigError::TrainTooLong(train_secs));
        }

        Ok(Self {
            high,
            low,
            train_length: pulses as u32,
        })
    }

    pub fn high(&self) -> Duration {
        self.high
    }

    pub fn low(&self) -> Duration {
        self.low
    }

    pub fn train_length(&self) -> u32 {
        self.train_length
    }

    pub fn set_high(&mut self, high: Duration) {
        self.high = to_micros_resolution(high);
    }

    pub fn set_low(&mut self, low: Duration) {
        self.low = to_micros_resolution(low);
    }

    pub fn set_train_length(&mut self, train_length: u32) {
        self.train_length = train_length;
    }

    /// Whether trains run until explicitly stopped.
    pub fn is_infinite(&self) -> bool {
        self.train_length == INFINITE_TRAIN
    }

    /// Duration of the given phase.
    pub fn duration(&self, phase: Phase) -> Duration {
        match phase {
            Phase::High => self.high,
            Phase::Low => self.low,
        }
    }

    /// Deadline of a phase that begins at `from`.
    ///
    /// A zero-length phase ends where it begins, so the next edge fires
    /// without any enforced wait.
    pub fn next_deadline(&self, phase: Phase, from: Instant) -> Instant {
        from + self.duration(phase)
    }

    /// Length of one full HIGH+LOW cycle.
    pub fn period(&self) -> Duration {
        self.high + self.low
    }

    /// Pulses per second. Infinite for a zero-length period.
    pub fn frequency(&self) -> f64 {
        let period = self.period().as_secs_f64();
        if period > 0.0 {
            1.0 / period
        } else {
            f64::INFINITY
        }
    }

    /// Fraction of the period spent HIGH. Zero for a zero-length period.
    pub fn duty_cycle(&self) -> f64 {
        let period = self.period().as_secs_f64();
        if period > 0.0 {
            self.high.as_secs_f64() / period
        } else {
            0.0
        }
    }

    /// Length of one train in seconds, 0 for an infinite train.
    pub fn train_duration(&self) -> f64 {
        self.period().as_secs_f64() * self.train_length as f64
    }

    /// Same duty cycle and train duration at a new frequency.
    pub fn with_frequency(&self, frequency: f64) -> Result<Self, ConfigError> {
        // an infinite train reports a zero duration, so it stays infinite
        Self::from_train(frequency, self.duty_cycle(), self.train_duration())
    }

    /// Same frequency and train length with a new duty cycle.
    pub fn with_duty_cycle(&self, duty_cycle: f64) -> Result<Self, ConfigError> {
        let retimed = Self::from_train(self.frequency(), duty_cycle, 0.0)?;
        Ok(Self {
            train_length: self.train_length,
            ..retimed
        })
    }

    /// Same frequency and duty cycle with a new train duration in seconds.
    pub fn with_train_duration(&self, train_secs: f64) -> Result<Self, ConfigError> {
        Self::from_train(self.frequency(), self.duty_cycle(), train_secs)
    }
}
