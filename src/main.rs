//! # Async Loader Demo
//!
//! A terminal stand-in for a loading screen: a handful of simulated asset
//! loads run on worker threads while a cooperative tick loop drives the
//! dispatcher and the progress monitor, exactly the way a frame loop would.
//!
//! ## Usage
//!
//! ```bash
//! RUST_LOG=info cargo run
//! ```

use std::sync::Arc;
use std::thread;
use std::time::Duration;

use async_loader::{
    DriverSchedule, ProgressGauge, ProgressMonitor, ProgressProbe, TaskDispatcher, TaskOutcome,
    WorkerPool,
};

const FRAME: Duration = Duration::from_millis(16);

fn main() {
    let mut log_builder = env_logger::Builder::new();
    log_builder
        .target(env_logger::Target::Stdout)
        .parse_env("RUST_LOG")
        .init();

    let pool = Arc::new(WorkerPool::new(3));
    let schedule = DriverSchedule::new();
    let dispatcher = TaskDispatcher::new(pool);
    let monitor = ProgressMonitor::new();

    // Dispatcher first: per-task callbacks run before the batch completion
    // callback within one frame.
    schedule.attach(dispatcher.clone());
    schedule.attach(monitor.clone());

    let assets = [
        ("sun-texture", 120u64),
        ("mercury-mesh", 40),
        ("venus-mesh", 60),
        ("earth-mesh", 80),
        ("starfield", 150),
        ("orbit-lines", 30),
    ];

    let mut probes: Vec<Box<dyn ProgressProbe>> = Vec::new();
    for (name, millis) in assets {
        let handle = dispatcher
            .submit_with(
                move || {
                    thread::sleep(Duration::from_millis(millis));
                    Ok(name)
                },
                move |outcome| match outcome {
                    TaskOutcome::Completed(asset) => log::info!("{asset} ready"),
                    TaskOutcome::Failed(err) => log::warn!("{name} unavailable: {err}"),
                    TaskOutcome::Cancelled => {}
                },
            )
            .expect("pool is running");
        probes.push(handle.probe());
    }

    // One load that fails, to show fault isolation: the frame loop keeps
    // running and the batch still completes.
    let broken = dispatcher
        .submit_with(
            || {
                thread::sleep(Duration::from_millis(50));
                Err::<&str, _>("corrupt archive".to_string().into())
            },
            |outcome| {
                if let TaskOutcome::Failed(err) = outcome {
                    log::warn!("skipping asset: {err}");
                }
            },
        )
        .expect("pool is running");
    probes.push(broken.probe());

    let gauge = ProgressGauge::new();
    monitor
        .monitor(
            "startup",
            probes,
            gauge.clone(),
            Some(Box::new(|| log::info!("loading screen dismissed"))),
        )
        .expect("batch is not empty");

    // The frame loop. Both components detach themselves once their work is
    // done, so an empty schedule means loading has finished.
    let mut last_shown = -1.0f32;
    while schedule.attached_count() > 0 {
        schedule.run_tick();
        let progress = gauge.progress();
        if progress != last_shown {
            println!("progress: {:>3.0}%", progress * 100.0);
            last_shown = progress;
        }
        thread::sleep(FRAME);
    }

    dispatcher.pool().shutdown();
    println!("all assets loaded, gauge visible: {}", gauge.is_visible());
}
