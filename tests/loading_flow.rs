//! End-to-end loading scenarios: real worker pool, real schedule, with task
//! completion gated by channels so tick timing is deterministic.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::mpsc::{channel, Receiver, Sender};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use async_loader::{
    DriverSchedule, ProgressGauge, ProgressMonitor, TaskDispatcher, TaskHandle, TaskOutcome,
    TickState, WorkerPool,
};

/// Submits an operation that blocks until the returned sender fires (or is
/// dropped), then completes with `value`.
fn gated_task(
    dispatcher: &Arc<TaskDispatcher>,
    value: u32,
    calls: &Arc<AtomicUsize>,
) -> (TaskHandle<u32>, Sender<()>) {
    let (gate_tx, gate_rx): (Sender<()>, Receiver<()>) = channel();
    let calls = calls.clone();
    let handle = dispatcher
        .submit_with(
            move || {
                let _ = gate_rx.recv();
                Ok(value)
            },
            move |outcome| {
                assert!(
                    matches!(outcome, TaskOutcome::Completed(v) if v == value),
                    "callback must see the task's own completed value"
                );
                calls.fetch_add(1, Ordering::SeqCst);
            },
        )
        .expect("pool is running");
    (handle, gate_tx)
}

fn wait_done<T>(handle: &TaskHandle<T>) {
    let deadline = Instant::now() + Duration::from_secs(5);
    while !handle.is_done() {
        assert!(Instant::now() < deadline, "task did not finish in time");
        thread::sleep(Duration::from_millis(1));
    }
}

/// Three-task timeline: A completes before tick 1, B before tick 2, C is
/// cancelled before tick 1. Cancelled tasks never see their callback, and the
/// dispatcher detaches on its first idle tick.
#[test]
fn three_task_timeline() {
    let pool = Arc::new(WorkerPool::new(3));
    let schedule = DriverSchedule::new();
    let dispatcher = TaskDispatcher::new(pool);
    schedule.attach(dispatcher.clone());

    let a_calls = Arc::new(AtomicUsize::new(0));
    let b_calls = Arc::new(AtomicUsize::new(0));
    let c_calls = Arc::new(AtomicUsize::new(0));
    let (a, a_gate) = gated_task(&dispatcher, 1, &a_calls);
    let (b, b_gate) = gated_task(&dispatcher, 2, &b_calls);
    let (c, _c_gate) = gated_task(&dispatcher, 3, &c_calls);

    assert!(c.cancel());
    a_gate.send(()).unwrap();
    wait_done(&a);

    // Tick 1: A's callback fires, C is pruned silently.
    schedule.run_tick();
    assert_eq!(a_calls.load(Ordering::SeqCst), 1);
    assert_eq!(b_calls.load(Ordering::SeqCst), 0);
    assert_eq!(c_calls.load(Ordering::SeqCst), 0);
    assert_eq!(dispatcher.pending_tasks(), 1);

    b_gate.send(()).unwrap();
    wait_done(&b);

    // Tick 2: B's callback fires and the queue drains.
    schedule.run_tick();
    assert_eq!(b_calls.load(Ordering::SeqCst), 1);
    assert_eq!(dispatcher.pending_tasks(), 0);
    assert!(schedule.has_attached(dispatcher.id()));

    // Tick 3 begins idle: the dispatcher detaches itself.
    schedule.run_tick();
    assert!(!schedule.has_attached(dispatcher.id()));

    // Nothing fired twice, C never fired.
    assert_eq!(a_calls.load(Ordering::SeqCst), 1);
    assert_eq!(b_calls.load(Ordering::SeqCst), 1);
    assert_eq!(c_calls.load(Ordering::SeqCst), 0);
}

/// Batch timeline: four handles, half done by tick 2, all by tick 3.
/// Progress is non-decreasing, reads 1.0 on tick 3, and the completion
/// callback fires on tick 4.
#[test]
fn batch_progress_timeline() {
    let pool = Arc::new(WorkerPool::new(4));
    let schedule = DriverSchedule::new();
    let dispatcher = TaskDispatcher::new(pool);
    let monitor = ProgressMonitor::new();
    schedule.attach(dispatcher.clone());
    schedule.attach(monitor.clone());

    let calls = Arc::new(AtomicUsize::new(0));
    let tasks: Vec<(TaskHandle<u32>, Sender<()>)> = (0..4)
        .map(|i| gated_task(&dispatcher, i, &calls))
        .collect();

    let gauge = ProgressGauge::new();
    let completions = Arc::new(AtomicUsize::new(0));
    let completions_in_cb = completions.clone();
    monitor
        .monitor(
            "scene assets",
            tasks.iter().map(|(h, _)| h.probe()).collect(),
            gauge.clone(),
            Some(Box::new(move || {
                completions_in_cb.fetch_add(1, Ordering::SeqCst);
            })),
        )
        .unwrap();

    let mut readings = Vec::new();

    // Tick 1: nothing finished yet.
    schedule.run_tick();
    readings.push(gauge.progress());

    for (handle, gate) in &tasks[..2] {
        gate.send(()).unwrap();
        wait_done(handle);
    }
    // Tick 2: half done.
    schedule.run_tick();
    readings.push(gauge.progress());

    for (handle, gate) in &tasks[2..] {
        gate.send(()).unwrap();
        wait_done(handle);
    }
    // Tick 3: all done, indicator reads 100%, callback not yet fired.
    schedule.run_tick();
    readings.push(gauge.progress());
    assert_eq!(readings, vec![0.0, 0.5, 1.0]);
    assert_eq!(completions.load(Ordering::SeqCst), 0);
    assert!(gauge.is_visible());

    // Tick 4: completion callback fires exactly once, after the indicator
    // spent a full tick at 100%.
    schedule.run_tick();
    assert_eq!(completions.load(Ordering::SeqCst), 1);

    for window in readings.windows(2) {
        assert!(window[0] <= window[1], "progress regressed: {readings:?}");
    }

    // Both components eventually detach and the frame loop can go quiet.
    schedule.run_tick();
    schedule.run_tick();
    assert_eq!(schedule.attached_count(), 0);
    assert_eq!(calls.load(Ordering::SeqCst), 4);
}

/// N submissions with callbacks produce exactly N invocations, each after its
/// task reported terminal, regardless of worker interleaving.
#[test]
fn every_callback_fires_exactly_once() {
    let pool = Arc::new(WorkerPool::new(4));
    let schedule = DriverSchedule::new();
    let dispatcher = TaskDispatcher::new(pool);
    schedule.attach(dispatcher.clone());

    const N: usize = 24;
    let calls = Arc::new(AtomicUsize::new(0));
    for i in 0..N {
        let calls = calls.clone();
        dispatcher
            .submit_with(
                move || Ok(i),
                move |outcome| {
                    assert!(matches!(outcome, TaskOutcome::Completed(v) if v == i));
                    calls.fetch_add(1, Ordering::SeqCst);
                },
            )
            .expect("pool is running");
    }

    let deadline = Instant::now() + Duration::from_secs(10);
    while dispatcher.pending_tasks() > 0 {
        assert!(Instant::now() < deadline, "tasks did not drain in time");
        schedule.run_tick();
        thread::sleep(Duration::from_millis(1));
    }
    schedule.run_tick();
    assert_eq!(calls.load(Ordering::SeqCst), N);
    // The idle dispatcher is no longer enrolled.
    assert!(!schedule.has_attached(dispatcher.id()));
}
