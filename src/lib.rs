//! Pulsed Thread
//!
//! A pulsed-timing engine: each task owns a worker thread that emits
//! HIGH/LOW phases with microsecond-resolution deadlines, with:
//! - Three accuracy modes (sleep, sleep then spin, sleep-or-spin)
//! - Trains of N pulses (or infinite), repeated on request
//! - High, low and end-of-train hooks, native closures or shared objects
//! - Live retiming, committed at train boundaries without tearing a train

pub mod clock;
pub mod timer;
pub mod accuracy;
pub mod callback;
pub mod error;
pub mod task;
mod worker;

#[cfg(test)]
mod timing_tests;

pub use accuracy::{AccuracyMode, AccuracyStrategy, SLEEP_TURNAROUND};
pub use callback::{
    DutyCycleTable, EndArgs, EndCallback, EndFuncMode, NextTrain, ObjectError, ObjectResult,
    PhaseAction, PulseObject, TimingChange, TrainEnd,
};
pub use error::{CallbackError, CallbackSite, ConfigError, PulseError, Result};
pub use task::{PulseTask, TaskConfig, TaskHandle, TaskState, TaskStats};
pub use timer::{Phase, PulseTiming, INFINITE_TRAIN};
