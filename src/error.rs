//! Error types
//!
//! Configuration and state errors are returned synchronously to the caller.
//! Callback errors never escape the worker thread; they are recorded in the
//! task's sticky last-error slot instead.

use crate::task::TaskState;
use std::fmt;
use std::time::Duration;
use thiserror::Error;

/// Result alias for pulsed-thread operations.
pub type Result<T> = std::result::Result<T, PulseError>;

/// Top-level error for task construction and control.
#[derive(Error, Debug)]
pub enum PulseError {
    /// Invalid construction parameters or setter values.
    #[error("invalid configuration: {0}")]
    Config(#[from] ConfigError),

    /// The operation is not valid in the task's current state.
    #[error("cannot {op} while task is {state:?}")]
    State { op: &'static str, state: TaskState },

    /// A callback failed. Only surfaced through `last_error()`.
    #[error(transparent)]
    Callback(#[from] CallbackError),

    /// The worker thread could not be spawned.
    #[error("failed to spawn worker thread: {0}")]
    Resource(#[source] std::io::Error),
}

/// Invalid timing or accuracy parameters.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ConfigError {
    #[error("{field} must be a finite, non-negative number of seconds (got {value})")]
    InvalidDuration { field: &'static str, value: f64 },

    #[error("{field} of {value} seconds does not fit in the microsecond timer")]
    DurationOverflow { field: &'static str, value: f64 },

    #[error("train frequency must be finite and > 0 Hz (got {0})")]
    InvalidFrequency(f64),

    #[error("duty cycle must be in (0, 1] (got {0})")]
    InvalidDutyCycle(f64),

    #[error("train duration must be finite and >= 0 seconds (got {0})")]
    InvalidTrainDuration(f64),

    #[error("train duration of {0} seconds needs more pulses than a train can hold")]
    TrainTooLong(f64),

    #[error("duty-cycle table must hold at least one value")]
    EmptyTable,

    #[error("unsupported accuracy mode {0} (expected 0, 1 or 2)")]
    UnsupportedAccuracyMode(i32),

    #[error("accuracy mode {mode} needs {required:?} timer resolution, clock has {available:?}")]
    TimerResolution {
        mode: &'static str,
        required: Duration,
        available: Duration,
    },
}

/// Where in the pulse cycle a callback was running.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CallbackSite {
    High,
    Low,
    End,
}

impl fmt::Display for CallbackSite {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CallbackSite::High => write!(f, "high"),
            CallbackSite::Low => write!(f, "low"),
            CallbackSite::End => write!(f, "end-of-train"),
        }
    }
}

/// A failed high, low or end-of-train callback.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CallbackError {
    /// The callback reported a failure.
    #[error("{site} callback failed: {message}")]
    Failed { site: CallbackSite, message: String },

    /// The callback panicked; the panic was caught at the adapter boundary.
    #[error("{site} callback panicked: {message}")]
    Panicked { site: CallbackSite, message: String },

    /// The foreign object behind the callback has been dropped.
    #[error("{site} callback object was released")]
    Released { site: CallbackSite },
}

impl CallbackError {
    /// Build a `Failed` error from anything displayable.
    pub fn failed(site: CallbackSite, message: impl fmt::Display) -> Self {
        CallbackError::Failed {
            site,
            message: message.to_string(),
        }
    }

    /// The cycle position the failing callback ran at.
    pub fn site(&self) -> CallbackSite {
        match self {
            CallbackError::Failed { site, .. }
            | CallbackError::Panicked { site, .. }
            | CallbackError::Released { site } => *site,
        }
    }
}
