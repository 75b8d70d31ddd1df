//! # Task Management System
//!
//! This module provides the worker pool that runs blocking load operations
//! off the driver thread.
//!
//! ## Architecture Overview
//!
//! The pool consists of several key components:
//! - `WorkerPool`: Central coordinator for job distribution and worker lifecycle
//! - `TaskHandle`: Shared observation point for an operation's eventual outcome
//! - One mpsc channel pair per worker thread for job delivery and completion
//!   accounting
//!
//! ## Job Lifecycle
//! 1. A caller submits a blocking closure via `WorkerPool::submit()`
//! 2. The pool picks the least-loaded worker channel (round-robin tie-break)
//!    and sends the job; the caller immediately receives a `TaskHandle`
//! 3. The worker runs the closure under `catch_unwind` and writes the outcome
//!    into the handle's slot, unless the handle was cancelled first
//! 4. The worker reports completion so the pool can keep its per-channel load
//!    counters accurate
//!
//! ## Thread Safety
//! - `submit()` is safe from any thread and never blocks on worker progress
//! - Worker panics are contained in the job and surfaced as a failed outcome
//! - Dropping the pool closes the job channels; workers drain what they have
//!   and exit

pub mod handle;

use std::any::Any;
use std::panic::{self, AssertUnwindSafe};
use std::sync::mpsc::{channel, Receiver, Sender};
use std::sync::Mutex;
use std::thread::{self, JoinHandle};

use thiserror::Error;

use handle::{OperationError, TaskError, TaskHandle, TaskOutcome};

/// A type-erased job sent to a worker thread.
type Job = Box<dyn FnOnce() + Send + 'static>;

/// Synchronous submission failure, reported to the caller at submit time.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum SubmitError {
    /// The pool has been shut down; no further work is accepted.
    #[error("worker pool has been shut down")]
    PoolShutDown,
}

/// A communication channel between the pool and one worker thread.
///
/// Each channel is backed by an OS thread. `jobs_in_flight` counts jobs sent
/// but not yet reported complete and is what the pool balances on.
struct WorkerChannel {
    job_sender: Sender<Job>,
    done_receiver: Receiver<()>,
    jobs_in_flight: usize,
    _worker: JoinHandle<()>,
}

struct PoolInner {
    channels: Vec<WorkerChannel>,
    current_channel: usize,
    shut_down: bool,
}

/// Manages a pool of worker threads that run blocking load operations.
///
/// # Examples
///
/// ```no_run
/// use async_loader::task_management::WorkerPool;
///
/// let pool = WorkerPool::new(4);
/// let handle = pool
///     .submit(|| Ok::<_, Box<dyn std::error::Error + Send + Sync>>(21 * 2))
///     .unwrap();
/// while !handle.is_done() {
///     std::thread::yield_now();
/// }
/// ```
pub struct WorkerPool {
    inner: Mutex<PoolInner>,
}

impl WorkerPool {
    /// Creates a pool with the specified number of worker threads.
    ///
    /// # Arguments
    /// * `num_workers` - Number of worker threads to create; clamped to at
    ///   least 1.
    ///
    /// # Panics
    /// Panics if the underlying thread creation fails.
    pub fn new(num_workers: usize) -> Self {
        let num_workers = num_workers.max(1);
        let mut channels = Vec::with_capacity(num_workers);

        for _ in 0..num_workers {
            let (job_tx, job_rx) = channel::<Job>();
            let (done_tx, done_rx) = channel::<()>();

            let worker = thread::spawn(move || {
                while let Ok(job) = job_rx.recv() {
                    job();
                    let _ = done_tx.send(());
                }
            });

            channels.push(WorkerChannel {
                job_sender: job_tx,
                done_receiver: done_rx,
                jobs_in_flight: 0,
                _worker: worker,
            });
        }

        log::info!(
            "worker pool started with {num_workers} workers (available parallelism: {:?})",
            thread::available_parallelism()
        );

        WorkerPool {
            inner: Mutex::new(PoolInner {
                channels,
                current_channel: 0,
                shut_down: false,
            }),
        }
    }

    /// Submits a blocking operation for execution.
    ///
    /// Non-blocking: the job is handed to the least-loaded worker channel and
    /// a pending [`TaskHandle`] is returned immediately. The operation runs
    /// under `catch_unwind`; a panic becomes [`TaskError::Panicked`] and an
    /// `Err` return becomes [`TaskError::Failed`]. If the handle is cancelled
    /// before the worker reaches the job, the operation is skipped entirely.
    ///
    /// # Errors
    /// Returns [`SubmitError::PoolShutDown`] if the pool has been shut down.
    pub fn submit<T, F>(&self, op: F) -> Result<TaskHandle<T>, SubmitError>
    where
        T: Send + 'static,
        F: FnOnce() -> Result<T, OperationError> + Send + 'static,
    {
        let task_handle = TaskHandle::new();
        let job_handle = task_handle.clone();
        let job: Job = Box::new(move || {
            if job_handle.is_cancelled() {
                return;
            }
            match panic::catch_unwind(AssertUnwindSafe(op)) {
                Ok(Ok(value)) => job_handle.complete(TaskOutcome::Completed(value)),
                Ok(Err(err)) => job_handle.complete(TaskOutcome::Failed(TaskError::Failed(err))),
                Err(payload) => job_handle.complete(TaskOutcome::Failed(TaskError::Panicked(
                    panic_message(payload),
                ))),
            }
        });

        let mut inner = self.inner.lock().unwrap();
        if inner.shut_down {
            return Err(SubmitError::PoolShutDown);
        }
        inner.drain_completions();
        let channel_idx = inner.pick_channel();
        match inner.channels[channel_idx].job_sender.send(job) {
            Ok(()) => {
                inner.channels[channel_idx].jobs_in_flight += 1;
                inner.current_channel = (channel_idx + 1) % inner.channels.len();
                Ok(task_handle)
            }
            Err(_) => {
                // Worker thread is gone; treat the pool as closed.
                inner.shut_down = true;
                Err(SubmitError::PoolShutDown)
            }
        }
    }

    /// Drains completion notifications to keep per-channel load counters
    /// accurate.
    ///
    /// Called opportunistically by `submit()`; a frame driver may also call it
    /// once per tick. Correctness never depends on it.
    pub fn pump(&self) {
        self.inner.lock().unwrap().drain_completions();
    }

    /// Shuts the pool down.
    ///
    /// Job channels are closed; workers finish the jobs already queued to
    /// them and exit. Subsequent `submit()` calls fail with
    /// [`SubmitError::PoolShutDown`]. Worker threads are detached, not
    /// joined.
    pub fn shutdown(&self) {
        let mut inner = self.inner.lock().unwrap();
        inner.shut_down = true;
        inner.channels.clear();
    }

    /// Whether `shutdown()` has been called.
    pub fn is_shut_down(&self) -> bool {
        self.inner.lock().unwrap().shut_down
    }

    /// Number of worker threads in the pool.
    pub fn workers(&self) -> usize {
        self.inner.lock().unwrap().channels.len()
    }
}

impl Default for WorkerPool {
    /// A pool with a single worker thread.
    fn default() -> Self {
        Self::new(1)
    }
}

impl PoolInner {
    fn drain_completions(&mut self) {
        for channel in &mut self.channels {
            while channel.done_receiver.try_recv().is_ok() {
                channel.jobs_in_flight = channel.jobs_in_flight.saturating_sub(1);
            }
        }
    }

    /// Picks the least-loaded channel, scanning round-robin from the channel
    /// after the last one used so ties distribute evenly.
    fn pick_channel(&self) -> usize {
        let len = self.channels.len();
        let start = self.current_channel % len;
        let mut best = start;
        for offset in 1..len {
            let idx = (start + offset) % len;
            if self.channels[idx].jobs_in_flight < self.channels[best].jobs_in_flight {
                best = idx;
            }
        }
        best
    }
}

fn panic_message(payload: Box<dyn Any + Send>) -> String {
    if let Some(msg) = payload.downcast_ref::<&str>() {
        (*msg).to_string()
    } else if let Some(msg) = payload.downcast_ref::<String>() {
        msg.clone()
    } else {
        "non-string panic payload".to_string()
    }
}
