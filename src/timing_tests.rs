//! Pulse Timing Test Suite
//!
//! End-to-end runs of real worker threads against the wall clock.
//!
//! The suite relies on these guarantees:
//! 1) A train of N pulses takes at least N * (high + low). Deadlines are
//!    accumulated, so per-phase lateness does not add up across the train.
//! 2) Timing changes made while busy never touch the train in flight; they
//!    are committed at the next train boundary.
//! 3) A stop request is observed at the top of the next cycle.
//!
//! Upper bounds are loose because CI machines are noisy. Lower bounds are
//! strict.

#[cfg(test)]
mod tests {
    use crate::accuracy::AccuracyMode;
    use crate::callback::{
        DutyCycleTable, EndArgs, EndCallback, EndFuncMode, NextTrain, ObjectResult, PhaseAction,
        PulseObject, TimingChange,
    };
    use crate::error::{CallbackError, CallbackSite, PulseError};
    use crate::task::{PulseTask, TaskConfig, TaskState};
    use crate::timer::PulseTiming;
    use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
    use std::sync::mpsc;
    use std::sync::{Arc, Mutex};
    use std::time::{Duration, Instant};

    const ALL_MODES: [AccuracyMode; 3] = [
        AccuracyMode::SleepOnly,
        AccuracyMode::SleepAndSpin,
        AccuracyMode::SleepAndOrSpin,
    ];

    /// Generous bound for anything that should finish "soon".
    const WAIT: Duration = Duration::from_secs(5);

    /// Allowed overshoot of a whole run, per accuracy mode.
    struct TestTolerances {
        sleep_only: Duration,
        spinning: Duration,
    }

    impl Default for TestTolerances {
        fn default() -> Self {
            Self {
                sleep_only: Duration::from_millis(60),
                spinning: Duration::from_millis(40),
            }
        }
    }

    impl TestTolerances {
        fn for_mode(&self, mode: AccuracyMode) -> Duration {
            if mode.spins() {
                self.spinning
            } else {
                self.sleep_only
            }
        }
    }

    fn task(mode: AccuracyMode, high_ms: u64, low_ms: u64, pulses: u32) -> PulseTask {
        PulseTask::new(TaskConfig {
            name: format!("test-{}", mode.name()),
            accuracy: mode,
            timing: PulseTiming::from_pulses(
                Duration::from_millis(high_ms),
                Duration::from_millis(low_ms),
                pulses,
            ),
            ..Default::default()
        })
        .unwrap()
    }

    fn counter() -> (Arc<AtomicU64>, PhaseAction) {
        let count = Arc::new(AtomicU64::new(0));
        let c = Arc::clone(&count);
        let action = PhaseAction::native(move || {
            c.fetch_add(1, Ordering::SeqCst);
        });
        (count, action)
    }

    /// Start, wait, and return the wall-clock time the run took.
    fn run_to_completion(task: &mut PulseTask, trains: u32) -> Duration {
        let t0 = Instant::now();
        task.start_trains(trains).unwrap();
        assert!(!task.wait_on_busy(WAIT), "task still busy after {:?}", WAIT);
        t0.elapsed()
    }

    fn assert_elapsed(label: &str, elapsed: Duration, expected: Duration, tolerance: Duration) {
        assert!(
            elapsed >= expected,
            "[{}] finished early: {:?} < {:?}",
            label,
            elapsed,
            expected
        );
        assert!(
            elapsed <= expected + tolerance,
            "[{}] finished late: {:?} > {:?} + {:?}",
            label,
            elapsed,
            expected,
            tolerance
        );
    }

    // =========================================================================
    // Elapsed time
    // =========================================================================

    #[test]
    fn test_train_elapsed_time_all_modes() {
        let tol = TestTolerances::default();
        for mode in ALL_MODES {
            let mut t = task(mode, 2, 3, 10);
            let elapsed = run_to_completion(&mut t, 1);

            assert_eq!(t.state(), TaskState::Stopped);
            assert_elapsed(mode.name(), elapsed, Duration::from_millis(50), tol.for_mode(mode));

            let stats = t.stats();
            assert_eq!(stats.high_edges, 10);
            assert_eq!(stats.low_edges, 10);
            assert_eq!(stats.trains_completed, 1);
        }
    }

    #[test]
    fn test_repeated_trains_elapsed_time() {
        let tol = TestTolerances::default();
        let mut t = task(AccuracyMode::SleepAndSpin, 1, 1, 5);
        let elapsed = run_to_completion(&mut t, 4);
        assert_elapsed("4 trains", elapsed, Duration::from_millis(40), tol.spinning);
        assert_eq!(t.stats().trains_completed, 4);
        assert_eq!(t.stats().high_edges, 20);
    }

    #[test]
    fn test_zero_length_phases_run_back_to_back() {
        let mut t = task(AccuracyMode::SleepAndOrSpin, 0, 0, 100);
        let elapsed = run_to_completion(&mut t, 1);
        assert!(elapsed < Duration::from_millis(500));
        assert_eq!(t.stats().high_edges, 100);
    }

    /// 0.25 s high, 1 s low, 5 pulses.
    #[test]
    #[ignore = "takes over six seconds of wall time"]
    fn test_long_train_scenario() {
        let mut t = PulseTask::create(AccuracyMode::SleepAndSpin, 0.25, 1.0, 5).unwrap();
        let t0 = Instant::now();
        t.start().unwrap();
        assert!(!t.wait_on_busy(Duration::from_secs(10)));
        assert_elapsed(
            "6.25s train",
            t0.elapsed(),
            Duration::from_millis(6250),
            TestTolerances::default().spinning,
        );
    }

    // =========================================================================
    // Train boundaries
    // =========================================================================

    #[test]
    fn test_train_length_change_waits_for_next_train() {
        let mut t = task(AccuracyMode::SleepAndSpin, 2, 2, 20);
        let (highs, action) = counter();
        t.set_high_action(action);

        t.start_trains(2).unwrap();
        std::thread::sleep(Duration::from_millis(10));
        t.set_train_length(5).unwrap();

        // committed value is still the in-flight one
        assert_eq!(t.train_length(), 20);
        assert_eq!(t.pending_timing().map(|p| p.train_length()), Some(5));

        assert!(!t.wait_on_busy(WAIT));
        assert_eq!(highs.load(Ordering::SeqCst), 25);
        assert_eq!(t.train_length(), 5);
        assert_eq!(t.pending_timing(), None);
    }

    #[test]
    fn test_end_callback_sees_remaining_trains() {
        let mut t = task(AccuracyMode::SleepOnly, 1, 1, 2);
        let seen = Arc::new(Mutex::new(Vec::new()));
        let s = Arc::clone(&seen);
        t.set_end_callback(EndCallback::native(move |end| {
            s.lock().unwrap().push((end.trains_remaining, end.trains_completed));
            NextTrain::Continue
        }));

        run_to_completion(&mut t, 3);
        assert_eq!(*seen.lock().unwrap(), vec![(2, 1), (1, 2), (0, 3)]);
    }

    #[test]
    fn test_stop_from_end_callback_runs_one_train() {
        let mut t = task(AccuracyMode::SleepAndOrSpin, 1, 1, 3);
        let (highs, high) = counter();
        let (lows, low) = counter();
        t.set_high_action(high);
        t.set_low_action(low);
        t.set_end_callback(EndCallback::native(|_| NextTrain::Stop));

        run_to_completion(&mut t, 10);
        assert_eq!(highs.load(Ordering::SeqCst), 3);
        assert_eq!(lows.load(Ordering::SeqCst), 3);
        assert_eq!(t.stats().trains_completed, 1);
        assert_eq!(t.state(), TaskState::Stopped);
    }

    #[test]
    fn test_infinite_train_calls_end_every_cycle() {
        let mut t = task(AccuracyMode::SleepAndSpin, 1, 1, 0);
        let calls = Arc::new(AtomicU64::new(0));
        let c = Arc::clone(&calls);
        t.set_end_callback(EndCallback::native(move |end| {
            assert_eq!(end.trains_remaining, 1);
            if c.fetch_add(1, Ordering::SeqCst) + 1 == 5 {
                NextTrain::Stop
            } else {
                NextTrain::Continue
            }
        }));

        run_to_completion(&mut t, 1);
        assert_eq!(calls.load(Ordering::SeqCst), 5);
        assert_eq!(t.stats().high_edges, 5);
    }

    #[test]
    fn test_end_callback_retimes_next_train() {
        let mut t = task(AccuracyMode::SleepOnly, 1, 1, 2);
        t.set_end_callback(EndCallback::native(|end| {
            if end.trains_completed == 1 {
                NextTrain::Retime(TimingChange::TrainLength(4))
            } else {
                NextTrain::Continue
            }
        }));

        run_to_completion(&mut t, 2);
        assert_eq!(t.stats().high_edges, 6);
        assert_eq!(t.train_length(), 4);
    }

    #[test]
    fn test_duty_cycle_table_retimes_each_train() {
        // 500 Hz, 2 pulses per train
        let mut t = PulseTask::new(
            TaskConfig::from_train(500.0, 0.5, 0.004, AccuracyMode::SleepAndSpin).unwrap(),
        )
        .unwrap();
        let table = DutyCycleTable::new(vec![0.25, 0.75]).unwrap();
        t.set_end_callback(EndCallback::table(table));

        run_to_completion(&mut t, 2);
        // first boundary applied 0.25, second 0.75
        assert!((t.train_duty_cycle() - 0.75).abs() < 1e-6);
        assert_eq!(t.timing().high(), Duration::from_micros(1500));
        assert_eq!(t.train_length(), 2);
    }

    #[test]
    fn test_edges_and_end_hook_order() {
        let mut t = task(AccuracyMode::SleepAndSpin, 1, 1, 2);
        let log = Arc::new(Mutex::new(Vec::new()));
        let (h, l, e) = (Arc::clone(&log), Arc::clone(&log), Arc::clone(&log));
        t.set_high_action(PhaseAction::native(move || h.lock().unwrap().push("H")));
        t.set_low_action(PhaseAction::native(move || l.lock().unwrap().push("L")));
        t.set_end_callback(EndCallback::native(move |_| {
            e.lock().unwrap().push("E");
            NextTrain::Continue
        }));

        run_to_completion(&mut t, 2);
        assert_eq!(
            *log.lock().unwrap(),
            vec!["H", "L", "H", "L", "E", "H", "L", "H", "L", "E"]
        );
    }

    /// Polls `done` until it holds or `WAIT` runs out.
    fn eventually(mut done: impl FnMut() -> bool) -> bool {
        let end = Instant::now() + WAIT;
        while Instant::now() < end {
            if done() {
                return true;
            }
            std::thread::sleep(Duration::from_millis(1));
        }
        done()
    }

    #[test]
    fn test_staged_change_reaches_infinite_train() {
        let mut t = task(AccuracyMode::SleepAndOrSpin, 1, 1, 0);
        t.start().unwrap();
        std::thread::sleep(Duration::from_millis(5));

        t.set_high_duration(0.002).unwrap();
        assert!(eventually(|| {
            t.pending_timing().is_none() && t.timing().high() == Duration::from_millis(2)
        }));
        assert!(t.is_busy());
        assert_eq!(t.high_duration(), 0.002);

        t.stop();
        assert!(!t.wait_on_busy(WAIT));
    }

    #[test]
    fn test_boundary_edit_waits_for_next_train() {
        let mut t = task(AccuracyMode::SleepAndSpin, 2, 2, 10);
        let (highs, action) = counter();
        t.set_high_action(action);

        t.start_trains(2).unwrap();
        std::thread::sleep(Duration::from_millis(5));
        t.modify_at_boundary(|timing| {
            timing.set_train_length(3);
            timing.set_low(Duration::from_millis(1));
        });
        assert!(t.has_pending_edits());
        assert_eq!(t.train_length(), 10);

        assert!(!t.wait_on_busy(WAIT));
        assert!(!t.has_pending_edits());
        assert_eq!(highs.load(Ordering::SeqCst), 13);
        assert_eq!(t.train_length(), 3);
        assert_eq!(t.timing().low(), Duration::from_millis(1));
    }

    #[test]
    fn test_panicking_boundary_edit_is_skipped() {
        let mut t = task(AccuracyMode::SleepOnly, 2, 2, 5);
        t.start_trains(2).unwrap();
        t.modify_at_boundary(|_| panic!("bad edit"));
        t.modify_at_boundary(|timing| timing.set_train_length(1));

        assert!(!t.wait_on_busy(WAIT));
        assert_eq!(t.stats().high_edges, 6);
        assert!(matches!(t.last_error(), Some(CallbackError::Panicked { .. })));
    }

    // =========================================================================
    // Re-entrancy
    // =========================================================================

    #[test]
    fn test_callback_can_restage_through_handle() {
        let mut t = task(AccuracyMode::SleepAndSpin, 1, 1, 4);
        let handle = t.handle();
        let waited_busy = Arc::new(AtomicBool::new(false));
        let w = Arc::clone(&waited_busy);
        t.set_end_callback(EndCallback::native(move |end| {
            if end.trains_completed == 1 {
                handle.set_train_length(2).unwrap();
                // waiting on itself must not deadlock
                w.store(handle.wait_on_busy(Duration::from_secs(1)), Ordering::SeqCst);
            }
            NextTrain::Continue
        }));

        run_to_completion(&mut t, 2);
        assert_eq!(t.stats().high_edges, 6);
        assert!(waited_busy.load(Ordering::SeqCst));
    }

    #[test]
    fn test_hook_swap_from_callback_takes_effect_next_train() {
        let mut t = task(AccuracyMode::SleepOnly, 1, 1, 5);
        let (first, action) = counter();
        let (second, replacement) = counter();
        t.set_high_action(action);

        let handle = t.handle();
        let mut replacement = Some(replacement);
        t.set_end_callback(EndCallback::native(move |_| {
            if let Some(next) = replacement.take() {
                handle.set_high_action(next);
            }
            NextTrain::Continue
        }));

        run_to_completion(&mut t, 2);
        assert_eq!(first.load(Ordering::SeqCst), 5);
        assert_eq!(second.load(Ordering::SeqCst), 5);
    }

    // =========================================================================
    // Callback failures
    // =========================================================================

    #[test]
    fn test_panicking_callback_is_recorded_and_loop_continues() {
        let mut t = task(AccuracyMode::SleepAndOrSpin, 1, 1, 5);
        t.set_high_action(PhaseAction::native(|| panic!("line stuck high")));
        let (lows, low) = counter();
        t.set_low_action(low);

        run_to_completion(&mut t, 1);
        assert_eq!(lows.load(Ordering::SeqCst), 5);
        assert_eq!(t.stats().callback_failures, 5);
        assert_eq!(
            t.last_error(),
            Some(CallbackError::Panicked {
                site: CallbackSite::High,
                message: "line stuck high".to_string(),
            })
        );

        // sticky until cleared
        assert!(t.clear_last_error().is_some());
        assert_eq!(t.last_error(), None);
    }

    struct Pin {
        highs: AtomicU64,
        last_end: Mutex<Option<EndArgs>>,
    }

    impl PulseObject for Pin {
        fn hi_func(&self) -> ObjectResult<()> {
            self.highs.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        fn end_func(&self, args: EndArgs) -> ObjectResult<NextTrain> {
            *self.last_end.lock().unwrap() = Some(args);
            Err("end of line".into())
        }
    }

    #[test]
    fn test_pulse_object_drives_edges_and_end() {
        let mut t = task(AccuracyMode::SleepAndSpin, 1, 2, 3);
        let pin = Arc::new(Pin {
            highs: AtomicU64::new(0),
            last_end: Mutex::new(None),
        });
        t.set_pulse_object(&pin);
        t.set_end_function_object(&pin, EndFuncMode::Pulse);

        run_to_completion(&mut t, 2);
        assert_eq!(pin.highs.load(Ordering::SeqCst), 6);
        assert_eq!(
            *pin.last_end.lock().unwrap(),
            Some(EndArgs::Pulse {
                low_micros: 2000,
                high_micros: 1000,
                train_length: 3,
                trains_remaining: 0,
            })
        );
        // a failing end function is treated as "continue unchanged"
        assert_eq!(t.stats().trains_completed, 2);
        assert!(matches!(
            t.last_error(),
            Some(CallbackError::Failed {
                site: CallbackSite::End,
                ..
            })
        ));
    }

    #[test]
    fn test_released_object_reports_error() {
        let mut t = task(AccuracyMode::SleepOnly, 1, 1, 3);
        let pin = Arc::new(Pin {
            highs: AtomicU64::new(0),
            last_end: Mutex::new(None),
        });
        t.set_pulse_object(&pin);
        drop(pin);

        run_to_completion(&mut t, 1);
        assert_eq!(t.stats().high_edges, 3);
        assert_eq!(t.stats().callback_failures, 6);
        assert!(matches!(t.last_error(), Some(CallbackError::Released { .. })));
    }

    // =========================================================================
    // Lifecycle
    // =========================================================================

    #[test]
    fn test_stop_latency_is_one_cycle() {
        // 10 ms cycle, 10 s train
        let mut t = task(AccuracyMode::SleepAndSpin, 5, 5, 1000);
        t.start().unwrap();
        std::thread::sleep(Duration::from_millis(35));

        let t0 = Instant::now();
        t.stop();
        assert!(!t.wait_on_busy(WAIT));
        let latency = t0.elapsed();

        let cycle = Duration::from_millis(10);
        assert!(latency < cycle + Duration::from_millis(40), "stop took {:?}", latency);
        assert_eq!(t.state(), TaskState::Stopped);
        assert!(t.stats().high_edges < 1000);
        assert_eq!(t.stats().trains_completed, 0);
    }

    #[test]
    fn test_start_while_busy_rejected() {
        let mut t = task(AccuracyMode::SleepOnly, 5, 5, 1000);
        t.start().unwrap();
        assert!(t.is_busy());

        let err = t.start().unwrap_err();
        assert!(matches!(
            err,
            PulseError::State {
                op: "start",
                state: TaskState::Running
            }
        ));

        t.stop();
        t.stop();
        assert!(!t.wait_on_busy(WAIT));
    }

    #[test]
    fn test_restart_after_stop() {
        let mut t = task(AccuracyMode::SleepAndOrSpin, 1, 1, 3);
        run_to_completion(&mut t, 1);
        assert_eq!(t.state(), TaskState::Stopped);

        t.set_high_duration(0.002).unwrap();
        run_to_completion(&mut t, 1);
        assert_eq!(t.state(), TaskState::Stopped);
        assert_eq!(t.stats().high_edges, 6);
        assert_eq!(t.timing().high(), Duration::from_millis(2));
    }

    #[test]
    fn test_wait_on_busy_times_out_without_cancelling() {
        let mut t = task(AccuracyMode::SleepOnly, 5, 5, 1000);
        t.start().unwrap();
        assert!(t.wait_on_busy(Duration::from_millis(20)));
        assert!(t.wait_on_busy_polling(Duration::from_millis(20), Duration::from_millis(5)));
        assert!(t.is_busy());
        t.stop();
        assert!(!t.wait_on_busy_polling(WAIT, Duration::from_millis(1)));
    }

    #[test]
    fn test_change_while_stopping_is_dropped() {
        let mut t = task(AccuracyMode::SleepOnly, 1, 1, 1000);
        let (entered_tx, entered_rx) = mpsc::channel();
        let (release_tx, release_rx) = mpsc::channel::<()>();
        t.set_high_action(PhaseAction::native(move || {
            let _ = entered_tx.send(());
            let _ = release_rx.recv_timeout(Duration::from_secs(2));
        }));

        t.start().unwrap();
        entered_rx.recv_timeout(WAIT).unwrap();

        t.stop();
        assert_eq!(t.state(), TaskState::Stopping);
        t.set_train_length(7).unwrap();
        assert_eq!(t.pending_timing().map(|p| p.train_length()), Some(7));

        drop(release_tx);
        assert!(!t.wait_on_busy(WAIT));
        assert_eq!(t.train_length(), 1000);
        assert_eq!(t.pending_timing(), None);
        assert_eq!(t.stats().high_edges, 1);
    }

    #[test]
    fn test_boundary_edit_dropped_on_stop() {
        let mut t = task(AccuracyMode::SleepOnly, 5, 5, 1000);
        t.start().unwrap();
        t.modify_at_boundary(|timing| timing.set_train_length(2));
        t.stop();
        assert!(!t.wait_on_busy(WAIT));
        assert!(!t.has_pending_edits());
        assert_eq!(t.train_length(), 1000);
    }

    #[test]
    fn test_drop_stops_and_joins_worker() {
        let mut t = task(AccuracyMode::SleepAndSpin, 2, 2, 1000);
        let (highs, action) = counter();
        t.set_high_action(action);
        t.start().unwrap();
        std::thread::sleep(Duration::from_millis(10));

        let t0 = Instant::now();
        drop(t);
        assert!(t0.elapsed() < Duration::from_millis(100));

        let after_drop = highs.load(Ordering::SeqCst);
        std::thread::sleep(Duration::from_millis(20));
        assert_eq!(highs.load(Ordering::SeqCst), after_drop);
    }

    #[test]
    fn test_staged_hooks_applied_on_exit() {
        let mut t = task(AccuracyMode::SleepOnly, 5, 5, 1000);
        t.start().unwrap();
        t.set_end_callback(EndCallback::native(|_| NextTrain::Stop));
        assert!(t.has_end_callback());
        t.stop();
        assert!(!t.wait_on_busy(WAIT));

        // the staged hook is now installed for the next run
        t.set_train_length(2).unwrap();
        run_to_completion(&mut t, 5);
        assert_eq!(t.stats().trains_completed, 1);
    }
}
