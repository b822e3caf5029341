//! Task Engine - the control surface of one pulsed task
//!
//! A `PulseTask` owns the worker thread; a `TaskHandle` is a cheap, cloneable
//! view onto the same lock-guarded state and is what callbacks capture when
//! they need to re-enter the engine.
//!
//! State machine:
//! ```text
//! Idle --start--> Running --stop / end hook halts--> Stopping --> Stopped
//!                    \---- train budget exhausted ---------------/
//! Stopped --start--> Running   (a fresh worker thread is spawned)
//! ```
//!
//! Timing setters write straight into the committed timing while the task
//! is idle. While it is busy they write into a staged copy that the worker
//! commits at the next train boundary; getters always report the committed
//! values.

use crate::accuracy::{AccuracyMode, AccuracyStrategy, SLEEP_TURNAROUND};
use crate::callback::{
    EndCallback, EndFuncMode, Hooks, PhaseAction, PulseObject, StagedHooks, TimingChange,
};
use crate::error::{CallbackError, ConfigError, PulseError, Result};
use crate::timer::{secs_to_duration, PulseTiming};
use crate::worker;
use parking_lot::{Condvar, Mutex};
use std::ops::Deref;
use std::sync::Arc;
use std::thread::{self, JoinHandle, ThreadId};
use std::time::{Duration, Instant};
use tracing::{debug, warn};

/// Lifecycle state of a task.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TaskState {
    /// Constructed, never started.
    Idle,
    Running,
    /// Stop requested; the worker has not reached a safe point yet.
    Stopping,
    /// The worker has exited. The task can be started again.
    Stopped,
}

impl TaskState {
    pub fn is_busy(self) -> bool {
        matches!(self, TaskState::Running | TaskState::Stopping)
    }
}

/// Configuration for building a task.
#[derive(Clone, Debug)]
pub struct TaskConfig {
    /// Used for the worker thread name and log spans.
    pub name: String,
    pub accuracy: AccuracyMode,
    pub timing: PulseTiming,
    /// Pre-deadline margin for the spinning accuracy modes.
    pub turnaround: Duration,
}

impl Default for TaskConfig {
    fn default() -> Self {
        Self {
            name: "pulsed-thread".to_string(),
            accuracy: AccuracyMode::default(),
            timing: PulseTiming::default(),
            turnaround: SLEEP_TURNAROUND,
        }
    }
}

impl TaskConfig {
    /// Config from the train-based description (Hz, duty cycle, seconds).
    pub fn from_train(
        frequency: f64,
        duty_cycle: f64,
        train_secs: f64,
        accuracy: AccuracyMode,
    ) -> std::result::Result<Self, ConfigError> {
        Ok(Self {
            accuracy,
            timing: PulseTiming::from_train(frequency, duty_cycle, train_secs)?,
            ..Default::default()
        })
    }
}

/// Counters accumulated over the task's lifetime.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct TaskStats {
    pub high_edges: u64,
    pub low_edges: u64,
    /// Train boundaries passed. Every cycle of an infinite train counts.
    pub trains_completed: u64,
    pub callback_failures: u64,
    /// Worst observed overshoot of a phase deadline.
    pub max_lateness: Duration,
}

/// Lock-guarded state shared between the caller side and the worker.
pub(crate) struct TaskInner {
    pub status: TaskState,
    /// Committed timing, the one the worker is running with.
    pub timing: PulseTiming,
    /// Timing requested while busy, committed at the next train boundary.
    pub staged: Option<PulseTiming>,
    /// `None` while the worker has borrowed the hooks for a run.
    pub hooks: Option<Hooks>,
    pub staged_hooks: StagedHooks,
    /// Whether the most recently requested end hook is a real one.
    pub end_installed: bool,
    pub stop_requested: bool,
    pub trains_remaining: u32,
    pub last_error: Option<CallbackError>,
    pub stats: TaskStats,
    pub worker_thread: Option<ThreadId>,
    /// Edits from `modify_at_boundary`, run in order after `staged`.
    pub staged_edits: Vec<TimingEdit>,
}

/// A deferred edit to the timing of the next train.
pub(crate) type TimingEdit = Box<dyn FnOnce(&mut PulseTiming) + Send>;

pub(crate) struct Shared {
    pub name: String,
    pub strategy: AccuracyStrategy,
    pub state: Mutex<TaskInner>,
    /// Signalled whenever the worker reaches a terminal state.
    pub idle: Condvar,
}

/// Cloneable control handle onto a task.
///
/// Everything except starting the task is available here, so callbacks can
/// stage timing changes, swap hooks or stop the task from the worker thread.
#[derive(Clone)]
pub struct TaskHandle {
    shared: Arc<Shared>,
}

impl TaskHandle {
    pub fn name(&self) -> &str {
        &self.shared.name
    }

    pub fn accuracy(&self) -> AccuracyMode {
        self.shared.strategy.mode()
    }

    pub fn state(&self) -> TaskState {
        self.shared.state.lock().status
    }

    /// True while the task is Running or Stopping.
    pub fn is_busy(&self) -> bool {
        self.state().is_busy()
    }

    /// Trains still to run, counting the one in flight.
    pub fn trains_remaining(&self) -> u32 {
        let inner = self.shared.state.lock();
        if inner.status.is_busy() {
            inner.trains_remaining
        } else {
            0
        }
    }

    /// Ask the worker to stop at its next safe point. Idempotent.
    pub fn stop(&self) {
        let mut inner = self.shared.state.lock();
        if inner.status == TaskState::Running {
            inner.status = TaskState::Stopping;
            inner.stop_requested = true;
            debug!(task = %self.shared.name, "stop requested");
        }
    }

    /// Block until the task is no longer busy or `timeout` elapses.
    ///
    /// Returns the still-busy flag; a timeout never cancels the task. Called
    /// from the task's own worker (from inside a callback) it returns at
    /// once rather than waiting on itself.
    pub fn wait_on_busy(&self, timeout: Duration) -> bool {
        let mut inner = self.shared.state.lock();
        if inner.worker_thread == Some(thread::current().id()) {
            warn!(task = %self.shared.name, "wait_on_busy called from the worker thread");
            return inner.status.is_busy();
        }
        if inner.status.is_busy() {
            self.shared
                .idle
                .wait_while_for(&mut inner, |i| i.status.is_busy(), timeout);
        }
        inner.status.is_busy()
    }

    /// Wait by polling `is_busy` every `interval` until idle or `timeout`.
    ///
    /// For callers that must not park on the task's condition variable,
    /// e.g. a host holding a global interpreter lock that the task's own
    /// callbacks need. A timeout too large to represent as an `Instant` polls until idle.
    pub fn wait_on_busy_polling(&self, timeout: Duration, interval: Duration) -> bool {
        let end = Instant::now().checked_add(timeout);
        loop {
            if !self.is_busy() {
                return false;
            }
            let pause = match end {
                Some(end) => {
                    let now = Instant::now();
                    if now >= end {
                        return true;
                    }
                    interval.min(end - now)
                }
                None => interval,
            };
            thread::sleep(pause);
        }
    }

    // --- timing getters (committed values) ---

    /// Committed timing.
    pub fn timing(&self) -> PulseTiming {
        self.shared.state.lock().timing
    }

    /// Timing waiting for the next train boundary, if any.
    pub fn pending_timing(&self) -> Option<PulseTiming> {
        self.shared.state.lock().staged
    }

    /// High phase in seconds.
    pub fn high_duration(&self) -> f64 {
        self.timing().high().as_secs_f64()
    }

    /// Low phase (delay) in seconds.
    pub fn low_duration(&self) -> f64 {
        self.timing().low().as_secs_f64()
    }

    /// Pulses per train, 0 for an infinite train.
    pub fn train_length(&self) -> u32 {
        self.timing().train_length()
    }

    pub fn train_frequency(&self) -> f64 {
        self.timing().frequency()
    }

    pub fn train_duty_cycle(&self) -> f64 {
        self.timing().duty_cycle()
    }

    /// Train duration in seconds, 0 for an infinite train.
    pub fn train_duration(&self) -> f64 {
        self.timing().train_duration()
    }

    // --- timing setters (staged while busy) ---

    /// Set the high phase in seconds.
    pub fn set_high_duration(&self, secs: f64) -> Result<()> {
        let d = secs_to_duration("high duration", secs)?;
        self.change_timing(TimingChange::HighDuration(d))
    }

    /// Set the low phase (delay) in seconds.
    pub fn set_low_duration(&self, secs: f64) -> Result<()> {
        let d = secs_to_duration("low duration", secs)?;
        self.change_timing(TimingChange::LowDuration(d))
    }

    /// Set pulses per train; 0 makes trains infinite.
    pub fn set_train_length(&self, pulses: u32) -> Result<()> {
        self.change_timing(TimingChange::TrainLength(pulses))
    }

    /// Change frequency, keeping duty cycle and train duration.
    pub fn set_train_frequency(&self, frequency: f64) -> Result<()> {
        self.change_timing(TimingChange::Frequency(frequency))
    }

    /// Change duty cycle, keeping frequency and train length.
    pub fn set_train_duty_cycle(&self, duty_cycle: f64) -> Result<()> {
        self.change_timing(TimingChange::DutyCycle(duty_cycle))
    }

    /// Change train duration in seconds, keeping frequency and duty cycle.
    pub fn set_train_duration(&self, secs: f64) -> Result<()> {
        self.change_timing(TimingChange::TrainDuration(secs))
    }

    /// Replace the whole timing at once.
    pub fn set_timing(&self, timing: PulseTiming) -> Result<()> {
        self.change_timing(TimingChange::Timing(timing))
    }

    /// Apply `change` now if idle, otherwise stage it on top of any earlier
    /// staged change. Invalid values are rejected here, not at the boundary.
    pub fn change_timing(&self, change: TimingChange) -> Result<()> {
        let mut inner = self.shared.state.lock();
        if inner.status.is_busy() {
            let base = inner.staged.unwrap_or(inner.timing);
            inner.staged = Some(change.apply(&base)?);
            debug!(task = %self.shared.name, ?change, "staged timing change");
        } else {
            inner.timing = change.apply(&inner.timing)?;
        }
        Ok(())
    }

    /// Run `edit` on the timing of the next train.
    ///
    /// Idle tasks are edited at once. While busy, edits queue up and the
    /// worker runs them at the next train boundary, after any staged
    /// setter values, with the task lock held: `edit` must not call back
    /// into the task. Edits still queued when a stop request ends the run
    /// are dropped.
    pub fn modify_at_boundary(&self, edit: impl FnOnce(&mut PulseTiming) + Send + 'static) {
        let mut inner = self.shared.state.lock();
        if inner.status.is_busy() {
            inner.staged_edits.push(Box::new(edit));
        } else {
            edit(&mut inner.timing);
        }
    }

    /// Whether edits from `modify_at_boundary` are still waiting for the
    /// worker.
    pub fn has_pending_edits(&self) -> bool {
        !self.shared.state.lock().staged_edits.is_empty()
    }

    // --- hooks ---

    pub fn set_high_action(&self, action: PhaseAction) {
        let mut inner = self.shared.state.lock();
        match inner.hooks.as_mut() {
            Some(hooks) => hooks.high = action,
            None => inner.staged_hooks.high = Some(action),
        }
    }

    pub fn set_low_action(&self, action: PhaseAction) {
        let mut inner = self.shared.state.lock();
        match inner.hooks.as_mut() {
            Some(hooks) => hooks.low = action,
            None => inner.staged_hooks.low = Some(action),
        }
    }

    /// Install the end-of-train hook. While busy, the swap happens at the
    /// next train boundary.
    pub fn set_end_callback(&self, end: EndCallback) {
        let mut inner = self.shared.state.lock();
        inner.end_installed = end.is_set();
        match inner.hooks.as_mut() {
            Some(hooks) => hooks.end = end,
            None => inner.staged_hooks.end = Some(end),
        }
    }

    pub fn clear_end_callback(&self) {
        self.set_end_callback(EndCallback::None);
    }

    /// Whether the most recently installed end hook is not `None`.
    pub fn has_end_callback(&self) -> bool {
        self.shared.state.lock().end_installed
    }

    /// Route both edges to `object`'s `hi_func` and `lo_func`.
    pub fn set_pulse_object<T: PulseObject + 'static>(&self, object: &Arc<T>) {
        self.set_high_action(PhaseAction::foreign(object));
        self.set_low_action(PhaseAction::foreign(object));
    }

    /// Use `object.end_func` as the end-of-train hook.
    pub fn set_end_function_object<T: PulseObject + 'static>(
        &self,
        object: &Arc<T>,
        mode: EndFuncMode,
    ) {
        self.set_end_callback(EndCallback::foreign(object, mode));
    }

    // --- diagnostics ---

    /// Most recent callback failure, kept until cleared.
    pub fn last_error(&self) -> Option<CallbackError> {
        self.shared.state.lock().last_error.clone()
    }

    pub fn clear_last_error(&self) -> Option<CallbackError> {
        self.shared.state.lock().last_error.take()
    }

    pub fn stats(&self) -> TaskStats {
        self.shared.state.lock().stats
    }
}

/// A pulsed task and its worker thread.
///
/// Dropping the task requests a stop and joins the worker, so no callback
/// runs after the task is gone.
pub struct PulseTask {
    handle: TaskHandle,
    worker: Option<JoinHandle<()>>,
}

impl PulseTask {
    /// Build a task. Fails if the clock cannot serve the accuracy mode.
    pub fn new(config: TaskConfig) -> Result<Self> {
        let strategy = AccuracyStrategy::new(config.accuracy, config.turnaround)?;
        let inner = TaskInner {
            status: TaskState::Idle,
            timing: config.timing,
            staged: None,
            hooks: Some(Hooks::default()),
            staged_hooks: StagedHooks::default(),
            end_installed: false,
            stop_requested: false,
            trains_remaining: 0,
            last_error: None,
            stats: TaskStats::default(),
            worker_thread: None,
            staged_edits: Vec::new(),
        };
        debug!(
            task = %config.name,
            accuracy = config.accuracy.name(),
            timing = ?config.timing,
            "task created"
        );
        Ok(Self {
            handle: TaskHandle {
                shared: Arc::new(Shared {
                    name: config.name,
                    strategy,
                    state: Mutex::new(inner),
                    idle: Condvar::new(),
                }),
            },
            worker: None,
        })
    }

    /// Build a task from high/low durations in seconds.
    pub fn create(
        accuracy: AccuracyMode,
        high_secs: f64,
        low_secs: f64,
        train_length: u32,
    ) -> Result<Self> {
        Self::new(TaskConfig {
            accuracy,
            timing: PulseTiming::from_secs(high_secs, low_secs, train_length)?,
            ..Default::default()
        })
    }

    /// A control handle sharing this task's state.
    pub fn handle(&self) -> TaskHandle {
        self.handle.clone()
    }

    /// Run one train (or an infinite train until stopped).
    pub fn start(&mut self) -> Result<()> {
        self.start_trains(1)
    }

    /// Run `trains` trains back to back. Zero is a no-op.
    pub fn start_trains(&mut self, trains: u32) -> Result<()> {
        let state = self.handle.state();
        if state.is_busy() {
            return Err(PulseError::State { op: "start", state });
        }
        if trains == 0 {
            return Ok(());
        }

        // The previous worker has published Stopped; let it finish unwinding.
        if let Some(previous) = self.worker.take() {
            self.reap(previous);
        }

        let shared = Arc::clone(&self.handle.shared);
        let mut inner = shared.state.lock();
        let timing = inner.timing;
        let hooks = inner.hooks.take().unwrap_or_default();
        inner.staged = None;
        inner.stop_requested = false;
        inner.trains_remaining = trains;
        inner.status = TaskState::Running;

        let worker_shared = Arc::clone(&shared);
        let spawned = thread::Builder::new()
            .name(format!("pulse-{}", shared.name))
            .spawn(move || worker::run(worker_shared, timing, hooks));

        match spawned {
            Ok(join) => {
                inner.worker_thread = Some(join.thread().id());
                debug!(task = %shared.name, trains, ?timing, "task started");
                self.worker = Some(join);
                Ok(())
            }
            Err(e) => {
                // the closure (and the hooks it owned) is gone
                inner.hooks = Some(Hooks::default());
                inner.end_installed = false;
                inner.trains_remaining = 0;
                inner.status = state;
                Err(PulseError::Resource(e))
            }
        }
    }
}

impl PulseTask {
    fn reap(&self, join: JoinHandle<()>) {
        if join.join().is_err() {
            warn!(task = %self.handle.name(), "worker thread panicked");
        }
    }
}

impl Deref for PulseTask {
    type Target = TaskHandle;

    fn deref(&self) -> &TaskHandle {
        &self.handle
    }
}

impl Drop for PulseTask {
    fn drop(&mut self) {
        self.handle.stop();
        if let Some(join) = self.worker.take() {
            if join.thread().id() == thread::current().id() {
                warn!(task = %self.handle.name(), "task dropped on its own worker; not joining");
                return;
            }
            self.reap(join);
        }

        // Hooks may hold a `TaskHandle`; release them so the shared state
        // is freed. Dropped outside the lock in case a hook's drop re-enters.
        let released = {
            let mut inner = self.handle.shared.state.lock();
            (
                inner.hooks.take(),
                std::mem::take(&mut inner.staged_hooks),
                std::mem::take(&mut inner.staged_edits),
            )
        };
        drop(released);
    }
}
