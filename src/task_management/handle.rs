//! # Task Handles
//!
//! This module defines the shared handle through which the rest of the crate
//! observes an asynchronous operation running on a worker thread.
//!
//! ## Handle Lifecycle
//! 1. The worker pool creates a handle when an operation is submitted
//! 2. The worker thread writes the terminal outcome into the handle's slot
//! 3. Any holder can poll `is_done()`/`is_cancelled()` without blocking
//! 4. Exactly one holder takes the outcome via `try_take()`
//!
//! Cancellation is an external signal: `cancel()` only succeeds while the
//! operation has not yet produced a result, and a cancelled handle never
//! later transitions to completed or failed.

use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc, Mutex,
};

use thiserror::Error;

/// Error type produced by a submitted operation itself.
pub type OperationError = Box<dyn std::error::Error + Send + Sync>;

/// Why a task ended without producing a value.
#[derive(Debug, Error)]
pub enum TaskError {
    /// The operation returned an error on the worker thread.
    #[error("operation failed: {0}")]
    Failed(#[source] OperationError),
    /// The operation panicked on the worker thread. The payload message is
    /// preserved when it is a string.
    #[error("operation panicked: {0}")]
    Panicked(String),
}

/// The terminal result of a task, passed by value into callbacks.
#[derive(Debug)]
pub enum TaskOutcome<T> {
    /// The operation produced a value.
    Completed(T),
    /// The operation returned an error or panicked.
    Failed(TaskError),
    /// The task was cancelled before it produced a result.
    Cancelled,
}

enum Slot<T> {
    Pending,
    Ready(TaskOutcome<T>),
    Taken,
}

struct Shared<T> {
    slot: Mutex<Slot<T>>,
    done: AtomicBool,
    cancelled: AtomicBool,
}

/// A cloneable, opaque reference to an in-flight or completed asynchronous
/// operation yielding a `T`.
///
/// All state queries are non-blocking. The outcome can be taken exactly once;
/// after that the handle still reports `is_done()` but `try_take()` returns
/// `None`.
pub struct TaskHandle<T> {
    shared: Arc<Shared<T>>,
}

impl<T> Clone for TaskHandle<T> {
    fn clone(&self) -> Self {
        Self {
            shared: self.shared.clone(),
        }
    }
}

impl<T> TaskHandle<T> {
    /// Creates a pending handle. The worker pool pairs this with the job it
    /// sends to a worker thread.
    pub(crate) fn new() -> Self {
        Self {
            shared: Arc::new(Shared {
                slot: Mutex::new(Slot::Pending),
                done: AtomicBool::new(false),
                cancelled: AtomicBool::new(false),
            }),
        }
    }

    /// Stores the terminal outcome, unless the task was cancelled first or an
    /// outcome is already present.
    pub(crate) fn complete(&self, outcome: TaskOutcome<T>) {
        let mut slot = self.shared.slot.lock().unwrap();
        if matches!(*slot, Slot::Pending) && !self.shared.cancelled.load(Ordering::Acquire) {
            *slot = Slot::Ready(outcome);
            self.shared.done.store(true, Ordering::Release);
        }
    }

    /// Whether the task has reached a terminal state (completed, failed, or
    /// cancelled).
    pub fn is_done(&self) -> bool {
        self.shared.done.load(Ordering::Acquire)
    }

    /// Whether the task was cancelled.
    pub fn is_cancelled(&self) -> bool {
        self.shared.cancelled.load(Ordering::Acquire)
    }

    /// Requests cancellation.
    ///
    /// Succeeds (returns `true`) only while no outcome has been produced yet.
    /// A worker that has not started the operation will skip it entirely; a
    /// worker already running it will finish, but the result is discarded.
    pub fn cancel(&self) -> bool {
        let slot = self.shared.slot.lock().unwrap();
        if matches!(*slot, Slot::Pending) {
            self.shared.cancelled.store(true, Ordering::Release);
            self.shared.done.store(true, Ordering::Release);
            true
        } else {
            false
        }
    }

    /// Takes the terminal outcome, if one is available and not yet taken.
    ///
    /// Non-blocking. Returns `Some(TaskOutcome::Cancelled)` exactly once for
    /// a cancelled task. Returns `None` while the task is still pending or
    /// after the outcome has been taken.
    pub fn try_take(&self) -> Option<TaskOutcome<T>> {
        let mut slot = self.shared.slot.lock().unwrap();
        if matches!(*slot, Slot::Ready(_)) {
            match std::mem::replace(&mut *slot, Slot::Taken) {
                Slot::Ready(outcome) => Some(outcome),
                _ => None,
            }
        } else if matches!(*slot, Slot::Pending) && self.shared.cancelled.load(Ordering::Acquire) {
            *slot = Slot::Taken;
            Some(TaskOutcome::Cancelled)
        } else {
            None
        }
    }
}

impl<T> std::fmt::Debug for TaskHandle<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaskHandle")
            .field("done", &self.is_done())
            .field("cancelled", &self.is_cancelled())
            .finish()
    }
}
