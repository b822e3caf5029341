//! Callback Adapter - high/low edge actions and the end-of-train hook
//!
//! Each hook is a tagged variant: nothing, a native closure, a duty-cycle
//! table (end hook only), or a foreign object implementing `PulseObject`.
//! Foreign objects are held weakly: the task never keeps one alive, and a
//! released object is reported as a callback failure.
//!
//! Every invocation runs under `catch_unwind`, so a panicking callback is
//! reported the same way as one that returns an error. The worker never
//! holds the task lock while a hook runs.

use crate::error::{CallbackError, CallbackSite, ConfigError};
use crate::timer::PulseTiming;
use std::any::Any;
use std::f64::consts::PI;
use std::fmt;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::{Arc, Weak};
use std::time::Duration;

/// Error type returned by foreign-object methods.
pub type ObjectError = Box<dyn std::error::Error + Send + Sync>;

/// Result of a foreign-object method.
pub type ObjectResult<T> = Result<T, ObjectError>;

/// Which description of the finished train a foreign end function receives.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum EndFuncMode {
    /// frequency (Hz), duty cycle, train duration (s), trains remaining
    #[default]
    Frequency,
    /// low (µs), high (µs), pulses per train, trains remaining
    Pulse,
}

/// Arguments handed to a foreign end function.
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum EndArgs {
    Frequency {
        frequency: f64,
        duty_cycle: f64,
        train_duration: f64,
        trains_remaining: u32,
    },
    Pulse {
        low_micros: u64,
        high_micros: u64,
        train_length: u32,
        trains_remaining: u32,
    },
}

/// Snapshot of a train that has just finished.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct TrainEnd {
    /// Timing the finished train ran with.
    pub timing: PulseTiming,
    /// Trains still requested after this one. An infinite train reports 1
    /// for as long as it keeps running.
    pub trains_remaining: u32,
    /// Trains finished since the task was last started, this one included.
    pub trains_completed: u64,
}

impl TrainEnd {
    /// Describe the train the way `mode` asks for.
    pub fn args(&self, mode: EndFuncMode) -> EndArgs {
        match mode {
            EndFuncMode::Frequency => EndArgs::Frequency {
                frequency: self.timing.frequency(),
                duty_cycle: self.timing.duty_cycle(),
                train_duration: self.timing.train_duration(),
                trains_remaining: self.trains_remaining,
            },
            EndFuncMode::Pulse => EndArgs::Pulse {
                low_micros: self.timing.low().as_micros() as u64,
                high_micros: self.timing.high().as_micros() as u64,
                train_length: self.timing.train_length(),
                trains_remaining: self.trains_remaining,
            },
        }
    }
}

/// A change to apply to the timing of the next train.
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum TimingChange {
    Timing(PulseTiming),
    HighDuration(Duration),
    LowDuration(Duration),
    TrainLength(u32),
    Frequency(f64),
    DutyCycle(f64),
    TrainDuration(f64),
}

impl TimingChange {
    /// Compute the timing that results from applying this change to `current`.
    pub fn apply(&self, current: &PulseTiming) -> Result<PulseTiming, ConfigError> {
        let mut next = *current;
        match *self {
            TimingChange::Timing(t) => next = t,
            TimingChange::HighDuration(d) => next.set_high(d),
            TimingChange::LowDuration(d) => next.set_low(d),
            TimingChange::TrainLength(n) => next.set_train_length(n),
            TimingChange::Frequency(f) => next = current.with_frequency(f)?,
            TimingChange::DutyCycle(d) => next = current.with_duty_cycle(d)?,
            TimingChange::TrainDuration(s) => next = current.with_train_duration(s)?,
        }
        Ok(next)
    }
}

/// What the end-of-train hook wants to happen next.
#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub enum NextTrain {
    /// Carry on with the current (or staged) timing.
    #[default]
    Continue,
    /// Halt the task after this train.
    Stop,
    /// Carry on with adjusted timing.
    Retime(TimingChange),
}

/// A foreign object driving a task's edges and/or end-of-train hook.
///
/// Every method is optional; the defaults do nothing. Methods take `&self`
/// and may be called from the task's worker thread, so state must live
/// behind interior mutability.
pub trait PulseObject: Send + Sync {
    fn hi_func(&self) -> ObjectResult<()> {
        Ok(())
    }

    fn lo_func(&self) -> ObjectResult<()> {
        Ok(())
    }

    fn end_func(&self, _args: EndArgs) -> ObjectResult<NextTrain> {
        Ok(NextTrain::Continue)
    }
}

/// Action run on a HIGH or LOW edge.
#[derive(Default)]
pub enum PhaseAction {
    #[default]
    None,
    Native(Box<dyn FnMut() + Send>),
    Foreign(Weak<dyn PulseObject>),
}

impl PhaseAction {
    pub fn native(f: impl FnMut() + Send + 'static) -> Self {
        PhaseAction::Native(Box::new(f))
    }

    pub fn foreign<T: PulseObject + 'static>(object: &Arc<T>) -> Self {
        let weak: Weak<dyn PulseObject> = Arc::downgrade(object) as Weak<dyn PulseObject>;
        PhaseAction::Foreign(weak)
    }

    pub fn is_set(&self) -> bool {
        !matches!(self, PhaseAction::None)
    }

    /// Fire the action for the edge at `site`.
    pub(crate) fn invoke(&mut self, site: CallbackSite) -> Result<(), CallbackError> {
        match self {
            PhaseAction::None => Ok(()),
            PhaseAction::Native(f) => guarded(site, || {
                f();
                Ok(())
            }),
            PhaseAction::Foreign(weak) => {
                let object = weak.upgrade().ok_or(CallbackError::Released { site })?;
                guarded(site, || match site {
                    CallbackSite::Low => object.lo_func(),
                    _ => object.hi_func(),
                })
            }
        }
    }
}

impl fmt::Debug for PhaseAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PhaseAction::None => write!(f, "PhaseAction::None"),
            PhaseAction::Native(_) => write!(f, "PhaseAction::Native(..)"),
            PhaseAction::Foreign(_) => write!(f, "PhaseAction::Foreign(..)"),
        }
    }
}

/// Round-robin table of duty cycles, one per finished train.
#[derive(Clone, Debug, PartialEq)]
pub struct DutyCycleTable {
    values: Vec<f64>,
    index: usize,
}

impl DutyCycleTable {
    /// Build a table; every value must be a valid duty cycle in (0, 1].
    pub fn new(values: Vec<f64>) -> Result<Self, ConfigError> {
        if values.is_empty() {
            return Err(ConfigError::EmptyTable);
        }
        if let Some(&bad) = values.iter().find(|&&v| !(v > 0.0 && v <= 1.0)) {
            return Err(ConfigError::InvalidDutyCycle(bad));
        }
        Ok(Self { values, index: 0 })
    }

    /// One period of `0.5 - 0.3 * cos(2πi / period)`, a slow sinusoidal
    /// modulation between 20% and 80% duty.
    pub fn cosine(period: usize) -> Result<Self, ConfigError> {
        let values = (0..period)
            .map(|i| 0.5 - 0.3 * (2.0 * PI * i as f64 / period as f64).cos())
            .collect();
        Self::new(values)
    }

    /// Index of the value the next call will return.
    pub fn index(&self) -> usize {
        self.index
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    /// Read the current value and advance, wrapping at the end.
    pub fn next_value(&mut self) -> f64 {
        let v = self.values[self.index];
        self.index = (self.index + 1) % self.values.len();
        v
    }
}

/// Hook run after the last pulse of each train.
#[derive(Default)]
pub enum EndCallback {
    #[default]
    None,
    Native(Box<dyn FnMut(&TrainEnd) -> NextTrain + Send>),
    Table(DutyCycleTable),
    Foreign {
        object: Weak<dyn PulseObject>,
        mode: EndFuncMode,
    },
}

impl EndCallback {
    pub fn native(f: impl FnMut(&TrainEnd) -> NextTrain + Send + 'static) -> Self {
        EndCallback::Native(Box::new(f))
    }

    pub fn table(table: DutyCycleTable) -> Self {
        EndCallback::Table(table)
    }

    pub fn foreign<T: PulseObject + 'static>(object: &Arc<T>, mode: EndFuncMode) -> Self {
        let object: Weak<dyn PulseObject> = Arc::downgrade(object) as Weak<dyn PulseObject>;
        EndCallback::Foreign { object, mode }
    }

    pub fn is_set(&self) -> bool {
        !matches!(self, EndCallback::None)
    }

    /// Run the hook for a finished train.
    pub(crate) fn invoke(&mut self, end: &TrainEnd) -> Result<NextTrain, CallbackError> {
        let site = CallbackSite::End;
        match self {
            EndCallback::None => Ok(NextTrain::Continue),
            EndCallback::Native(f) => guarded(site, || Ok(f(end))),
            EndCallback::Table(table) => Ok(NextTrain::Retime(TimingChange::DutyCycle(
                table.next_value(),
            ))),
            EndCallback::Foreign { object, mode } => {
                let object = object.upgrade().ok_or(CallbackError::Released { site })?;
                let args = end.args(*mode);
                guarded(site, || object.end_func(args))
            }
        }
    }
}

impl fmt::Debug for EndCallback {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EndCallback::None => write!(f, "EndCallback::None"),
            EndCallback::Native(_) => write!(f, "EndCallback::Native(..)"),
            EndCallback::Table(t) => {
                write!(f, "EndCallback::Table(len={}, index={})", t.len(), t.index())
            }
            EndCallback::Foreign { mode, .. } => write!(f, "EndCallback::Foreign({:?})", mode),
        }
    }
}

/// The three hooks of one task.
#[derive(Debug, Default)]
pub(crate) struct Hooks {
    pub high: PhaseAction,
    pub low: PhaseAction,
    pub end: EndCallback,
}

/// Hook replacements requested while the worker was holding the hooks.
#[derive(Debug, Default)]
pub(crate) struct StagedHooks {
    pub high: Option<PhaseAction>,
    pub low: Option<PhaseAction>,
    pub end: Option<EndCallback>,
}

impl StagedHooks {
    pub fn is_empty(&self) -> bool {
        self.high.is_none() && self.low.is_none() && self.end.is_none()
    }

    /// Move every staged replacement into `hooks`.
    pub fn commit_into(&mut self, hooks: &mut Hooks) {
        if let Some(high) = self.high.take() {
            hooks.high = high;
        }
        if let Some(low) = self.low.take() {
            hooks.low = low;
        }
        if let Some(end) = self.end.take() {
            hooks.end = end;
        }
    }
}

/// Run `f`, converting errors and panics into a `CallbackError` for `site`.
pub(crate) fn guarded<T>(
    site: CallbackSite,
    f: impl FnOnce() -> ObjectResult<T>,
) -> Result<T, CallbackError> {
    match catch_unwind(AssertUnwindSafe(f)) {
        Ok(Ok(v)) => Ok(v),
        Ok(Err(e)) => Err(CallbackError::failed(site, e)),
        Err(payload) => Err(CallbackError::Panicked {
            site,
            message: panic_message(payload.as_ref()),
        }),
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}
