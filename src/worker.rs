//! Worker loop
//!
//! One thread per run. Each cycle fires the high hook, waits out the HIGH
//! phase, fires the low hook and waits out the LOW phase. Deadlines are
//! accumulated from the previous deadline rather than the wake time, so
//! lateness in one phase is recovered in the next instead of drifting.
//!
//! The shared lock is taken at two kinds of safe point: the top of every
//! cycle (stop check, stats flush) and each train boundary (staged commits,
//! train budget). Callbacks always run with the lock released.

use crate::callback::{guarded, Hooks, NextTrain, TrainEnd};
use crate::clock;
use crate::error::{CallbackError, CallbackSite};
use crate::task::{Shared, TaskInner, TaskState};
use crate::timer::{Phase, PulseTiming};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info_span, trace, warn};

/// Why the worker left its loop.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Exit {
    /// A stop request was observed mid-train.
    Cancelled,
    /// Stopped at a train boundary.
    Boundary,
}

/// Counters gathered lock-free during a cycle.
#[derive(Default)]
struct CycleReport {
    high_edges: u64,
    low_edges: u64,
    max_lateness: Duration,
    failures: u64,
    last_failure: Option<CallbackError>,
}

impl CycleReport {
    fn fail(&mut self, err: CallbackError) {
        warn!(site = %err.site(), error = %err, "callback failed");
        self.failures += 1;
        self.last_failure = Some(err);
    }

    fn flush_into(&mut self, inner: &mut TaskInner) {
        let stats = &mut inner.stats;
        stats.high_edges += self.high_edges;
        stats.low_edges += self.low_edges;
        stats.callback_failures += self.failures;
        stats.max_lateness = stats.max_lateness.max(self.max_lateness);
        if let Some(err) = self.last_failure.take() {
            inner.last_error = Some(err);
        }
        *self = CycleReport::default();
    }
}

struct Worker {
    shared: Arc<Shared>,
    timing: PulseTiming,
    hooks: Hooks,
    pulses_left: u32,
    trains_completed: u64,
    report: CycleReport,
}

/// Thread entry point. `timing` and `hooks` were taken from the shared
/// state when the task was started.
pub(crate) fn run(shared: Arc<Shared>, timing: PulseTiming, hooks: Hooks) {
    let span = info_span!("pulse_task", name = %shared.name);
    let _enter = span.enter();
    Worker {
        shared,
        timing,
        hooks,
        pulses_left: timing.train_length(),
        trains_completed: 0,
        report: CycleReport::default(),
    }
    .run();
}

impl Worker {
    fn run(mut self) {
        debug!(
            timing = ?self.timing,
            accuracy = self.shared.strategy.mode().name(),
            "worker started"
        );
        let mut deadline = clock::now();

        let exit = loop {
            if self.stop_requested() {
                break Exit::Cancelled;
            }

            deadline = self.phase(Phase::High, deadline);
            deadline = self.phase(Phase::Low, deadline);

            let finite = !self.timing.is_infinite();
            if finite {
                self.pulses_left = self.pulses_left.saturating_sub(1);
                if self.pulses_left > 0 {
                    continue;
                }
            }

            if let Some(exit) = self.train_boundary() {
                break exit;
            }
            self.pulses_left = self.timing.train_length();
            if finite {
                // each finite train is timed from its own start
                deadline = clock::now();
            }
        };

        self.finish(exit);
    }

    /// Top-of-cycle safe point.
    fn stop_requested(&mut self) -> bool {
        let mut inner = self.shared.state.lock();
        self.report.flush_into(&mut inner);
        inner.stop_requested
    }

    /// Fire the edge hook for `phase`, then wait out the phase that starts
    /// at `start`. Returns the phase deadline.
    fn phase(&mut self, phase: Phase, start: Instant) -> Instant {
        let result = match phase {
            Phase::High => {
                self.report.high_edges += 1;
                self.hooks.high.invoke(CallbackSite::High)
            }
            Phase::Low => {
                self.report.low_edges += 1;
                self.hooks.low.invoke(CallbackSite::Low)
            }
        };
        if let Err(err) = result {
            self.report.fail(err);
        }

        let deadline = self.timing.next_deadline(phase, start);
        let strategy = &self.shared.strategy;
        let woke = strategy.wait_until(deadline);
        let lateness = woke.saturating_duration_since(deadline);
        self.report.max_lateness = self.report.max_lateness.max(lateness);

        trace!(?phase, lateness_us = lateness.as_micros() as u64, "phase elapsed");
        if strategy.mode().spins() && lateness > strategy.turnaround() {
            debug!(?phase, lateness_us = lateness.as_micros() as u64, "phase deadline overshot");
        }
        deadline
    }

    /// Train boundary. Returns `Some` when the worker should exit.
    fn train_boundary(&mut self) -> Option<Exit> {
        self.trains_completed += 1;
        let infinite = self.timing.is_infinite();
        let shared = Arc::clone(&self.shared);

        let end = {
            let mut inner = shared.state.lock();
            self.report.flush_into(&mut inner);
            inner.stats.trains_completed += 1;
            if !infinite {
                inner.trains_remaining = inner.trains_remaining.saturating_sub(1);
            }
            if inner.stop_requested {
                return Some(Exit::Boundary);
            }
            TrainEnd {
                timing: self.timing,
                trains_remaining: inner.trains_remaining,
                trains_completed: self.trains_completed,
            }
        };

        let next = match self.hooks.end.invoke(&end) {
            Ok(next) => next,
            Err(err) => {
                self.report.fail(err);
                NextTrain::Continue
            }
        };

        let mut inner = shared.state.lock();
        if inner.stop_requested {
            // no next train; finish() drops whatever was staged
            return Some(Exit::Boundary);
        }
        self.commit_staged(&mut inner);
        if let NextTrain::Retime(change) = next {
            match change.apply(&self.timing) {
                Ok(timing) => {
                    trace!(?change, "end hook retimed next train");
                    self.timing = timing;
                    inner.timing = timing;
                }
                Err(err) => self.report.fail(CallbackError::failed(CallbackSite::End, err)),
            }
        }
        self.report.flush_into(&mut inner);

        let halt = matches!(next, NextTrain::Stop) || inner.trains_remaining == 0;
        if halt {
            if matches!(next, NextTrain::Stop) {
                debug!(trains = self.trains_completed, "end hook halted the task");
            }
            inner.status = TaskState::Stopping;
            return Some(Exit::Boundary);
        }
        None
    }

    /// Move staged timing and hooks into effect.
    fn commit_staged(&mut self, inner: &mut TaskInner) {
        if let Some(timing) = inner.staged.take() {
            debug!(?timing, "committed staged timing");
            self.timing = timing;
            inner.timing = timing;
        }
        if !inner.staged_edits.is_empty() {
            let mut timing = self.timing;
            for edit in inner.staged_edits.drain(..) {
                match guarded(CallbackSite::End, move || {
                    let mut edited = timing;
                    edit(&mut edited);
                    Ok(edited)
                }) {
                    Ok(next) => timing = next,
                    Err(err) => self.report.fail(err),
                }
            }
            debug!(?timing, "applied boundary edits");
            self.timing = timing;
            inner.timing = timing;
        }
        if !inner.staged_hooks.is_empty() {
            inner.staged_hooks.commit_into(&mut self.hooks);
            debug!("committed staged callbacks");
        }
    }

    /// Hand the hooks back and publish the terminal state.
    fn finish(mut self, exit: Exit) {
        let mut inner = self.shared.state.lock();
        self.report.flush_into(&mut inner);
        if let Some(timing) = inner.staged.take() {
            debug!(?timing, "stopped before the next train; dropping staged timing");
        }
        if !inner.staged_edits.is_empty() {
            debug!(count = inner.staged_edits.len(), "dropping boundary edits");
            inner.staged_edits.clear();
        }
        inner.staged_hooks.commit_into(&mut self.hooks);
        inner.hooks = Some(self.hooks);
        inner.status = TaskState::Stopped;
        inner.stop_requested = false;
        inner.trains_remaining = 0;
        inner.worker_thread = None;
        drop(inner);

        debug!(?exit, trains = self.trains_completed, "worker exited");
        self.shared.idle.notify_all();
    }
}
