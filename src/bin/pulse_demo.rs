//! Pulsed Thread Demo
//!
//! Runs pulse trains on a worker thread and logs every edge.
//!
//! Usage:
//!   cargo run --bin pulse_demo -- --demo 1                 # Greeter
//!   cargo run --bin pulse_demo -- --demo 2 --accuracy 2    # Cosine duty cycle, sleep-or-spin
//!   RUST_LOG=pulsed_thread=trace cargo run --bin pulse_demo -- --demo 1
//!
//! Demos:
//!   1. Greeter      - says hello on HIGH, goodbye on LOW, counts trains down
//!   2. Cosine duty  - 10 Hz train whose duty cycle follows a cosine table

use pulsed_thread::{
    AccuracyMode, DutyCycleTable, EndArgs, EndCallback, EndFuncMode, NextTrain, ObjectResult,
    PhaseAction, PulseObject, PulseTask, PulseTiming, TaskConfig,
};
use std::env;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::info;
use tracing_subscriber::EnvFilter;

/// Says hello and goodbye, and reports each finished train.
#[derive(Default)]
struct Greeter {
    hellos: AtomicU64,
}

impl PulseObject for Greeter {
    fn hi_func(&self) -> ObjectResult<()> {
        let n = self.hellos.fetch_add(1, Ordering::Relaxed) + 1;
        info!(n, "hello");
        Ok(())
    }

    fn lo_func(&self) -> ObjectResult<()> {
        info!("goodbye");
        Ok(())
    }

    fn end_func(&self, args: EndArgs) -> ObjectResult<NextTrain> {
        if let EndArgs::Frequency {
            frequency,
            duty_cycle,
            train_duration,
            trains_remaining,
        } = args
        {
            info!(frequency, duty_cycle, train_duration, trains_remaining, "train done");
        }
        Ok(NextTrain::Continue)
    }
}

fn run_greeter(accuracy: AccuracyMode, trains: u32) -> Result<(), Box<dyn std::error::Error>> {
    println!("=== Greeter ===");
    println!("0.25s high, 0.5s low, 3 pulses per train, {} trains\n", trains);

    let mut task = PulseTask::new(TaskConfig {
        name: "greeter".to_string(),
        accuracy,
        timing: PulseTiming::from_secs(0.25, 0.5, 3)?,
        ..Default::default()
    })?;
    let greeter = Arc::new(Greeter::default());
    task.set_pulse_object(&greeter);
    task.set_end_function_object(&greeter, EndFuncMode::Frequency);

    let t0 = Instant::now();
    task.start_trains(trains)?;
    task.wait_on_busy(Duration::from_secs(60));
    report(&task, t0);
    Ok(())
}

fn run_cosine_duty(accuracy: AccuracyMode, trains: u32) -> Result<(), Box<dyn std::error::Error>> {
    println!("=== Cosine duty cycle ===");
    println!("10 Hz, 0.5s trains, duty cycle from a 20-step cosine table, {} trains\n", trains);

    let mut task = PulseTask::new(TaskConfig {
        name: "cosine".to_string(),
        ..TaskConfig::from_train(10.0, 0.5, 0.5, accuracy)?
    })?;
    let edges = Arc::new(AtomicU64::new(0));
    let e = Arc::clone(&edges);
    task.set_high_action(PhaseAction::native(move || {
        e.fetch_add(1, Ordering::Relaxed);
    }));
    task.set_end_callback(EndCallback::table(DutyCycleTable::cosine(20)?));

    let t0 = Instant::now();
    task.start_trains(trains)?;
    while task.wait_on_busy(Duration::from_millis(500)) {
        info!(
            duty_cycle = task.train_duty_cycle(),
            high_edges = edges.load(Ordering::Relaxed),
            "running"
        );
    }
    report(&task, t0);
    Ok(())
}

fn report(task: &PulseTask, t0: Instant) {
    let stats = task.stats();
    println!();
    println!("elapsed:          {:.3}s", t0.elapsed().as_secs_f64());
    println!("high/low edges:   {}/{}", stats.high_edges, stats.low_edges);
    println!("trains completed: {}", stats.trains_completed);
    println!("max lateness:     {:?}", stats.max_lateness);
    if let Some(err) = task.last_error() {
        println!("last error:       {}", err);
    }
}

fn print_usage() {
    println!("Pulsed Thread Demo");
    println!("==================");
    println!();
    println!("Usage:");
    println!("  cargo run --bin pulse_demo -- --demo N [--accuracy A] [--trains T]");
    println!();
    println!("Demos:");
    println!("  1: Greeter      - hello on HIGH, goodbye on LOW");
    println!("  2: Cosine duty  - duty cycle modulated by a cosine table");
    println!();
    println!("Accuracy: 0 = sleep only, 1 = sleep and spin (default), 2 = sleep or spin");
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_thread_names(true)
        .init();

    let args: Vec<String> = env::args().collect();

    let mut demo: Option<usize> = None;
    let mut accuracy = AccuracyMode::default();
    let mut trains: u32 = 2;

    let mut i = 1;
    while i < args.len() {
        match args[i].as_str() {
            "--demo" | "-d" => {
                i += 1;
                if i < args.len() {
                    demo = args[i].parse().ok();
                }
            }
            "--accuracy" | "-a" => {
                i += 1;
                if i < args.len() {
                    accuracy = AccuracyMode::try_from(args[i].parse::<i32>()?)?;
                }
            }
            "--trains" | "-t" => {
                i += 1;
                if i < args.len() {
                    trains = args[i].parse()?;
                }
            }
            "--help" | "-h" => {
                print_usage();
                return Ok(());
            }
            _ => {}
        }
        i += 1;
    }

    match demo {
        Some(1) => run_greeter(accuracy, trains)?,
        Some(2) => run_cosine_duty(accuracy, trains)?,
        Some(d) => return Err(format!("Invalid demo {}. Must be 1 or 2.", d).into()),
        None => {
            print_usage();
            return Err("Missing --demo argument".into());
        }
    }

    println!("\nDemo complete.");
    Ok(())
}
