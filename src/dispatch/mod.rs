//! # Task Dispatcher
//!
//! Frame-synchronized callback execution for asynchronous load operations.
//!
//! ## Architecture
//!
//! Workers complete operations at arbitrary times, but every user-visible
//! side effect must happen on the single driver thread. The dispatcher owns a
//! queue of (handle, callback) pairs; each driver tick it polls the handles,
//! runs the callbacks of the finished ones synchronously and in submission
//! order, and prunes them. Callbacks registered for cancelled tasks are
//! pruned without being invoked.
//!
//! The dispatcher manages its own enrollment in the driver schedule: once its
//! queue has drained it detaches on the next tick, and a later submission
//! re-attaches it to the schedule it last saw. Hosts that prefer to drive
//! `run_tick()` unconditionally can disable this with
//! [`TaskDispatcher::set_auto_managed`].
//!
//! ## Fault Isolation
//!
//! A failed operation is logged here and still delivered to its callback as a
//! [`TaskOutcome::Failed`]; a callback that panics is caught and logged. In
//! neither case are the remaining entries of the tick, or the dispatcher's
//! attachment state, affected.

use std::panic::{self, AssertUnwindSafe};
use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc, Mutex, Weak,
};

use crate::driver::{DriverSchedule, StateId, TickState};
use crate::task_management::handle::{OperationError, TaskHandle, TaskOutcome};
use crate::task_management::{SubmitError, WorkerPool};

/// A queued pairing of a task handle and the callback to run once the task
/// reaches a terminal state.
trait PendingEntry: Send {
    fn is_done(&self) -> bool;
    fn is_cancelled(&self) -> bool;
    fn fire(self: Box<Self>);
}

struct HandleCallback<T> {
    handle: TaskHandle<T>,
    callback: Box<dyn FnOnce(TaskOutcome<T>) + Send>,
}

impl<T: Send + 'static> PendingEntry for HandleCallback<T> {
    fn is_done(&self) -> bool {
        self.handle.is_done()
    }

    fn is_cancelled(&self) -> bool {
        self.handle.is_cancelled()
    }

    fn fire(self: Box<Self>) {
        let Some(outcome) = self.handle.try_take() else {
            log::error!("task finished but its outcome was already taken; callback skipped");
            return;
        };
        if let TaskOutcome::Failed(err) = &outcome {
            log::error!("async operation failed: {err}");
        }
        let callback = self.callback;
        if panic::catch_unwind(AssertUnwindSafe(move || callback(outcome))).is_err() {
            log::error!("task callback panicked");
        }
    }
}

/// Polls pending task handles once per driver tick and runs their callbacks
/// on the driver thread.
///
/// # Examples
///
/// ```no_run
/// use std::sync::Arc;
/// use async_loader::dispatch::TaskDispatcher;
/// use async_loader::driver::DriverSchedule;
/// use async_loader::task_management::handle::TaskOutcome;
/// use async_loader::task_management::WorkerPool;
///
/// let pool = Arc::new(WorkerPool::new(2));
/// let schedule = DriverSchedule::new();
/// let dispatcher = TaskDispatcher::new(pool);
/// schedule.attach(dispatcher.clone());
///
/// dispatcher
///     .submit_with(
///         || Ok::<_, Box<dyn std::error::Error + Send + Sync>>("mesh"),
///         |outcome| {
///             if let TaskOutcome::Completed(name) = outcome {
///                 println!("loaded {name}");
///             }
///         },
///     )
///     .unwrap();
///
/// // Host frame loop:
/// schedule.run_tick();
/// ```
pub struct TaskDispatcher {
    pool: Arc<WorkerPool>,
    queue: Mutex<Vec<Box<dyn PendingEntry>>>,
    auto_managed: AtomicBool,
    id: StateId,
    schedule: Mutex<Option<Weak<DriverSchedule>>>,
    // Needed to enroll ourselves as an Arc<dyn TickState> on re-attach.
    this: Weak<TaskDispatcher>,
}

impl TaskDispatcher {
    /// Creates a dispatcher that submits operations to the given pool.
    pub fn new(pool: Arc<WorkerPool>) -> Arc<Self> {
        Arc::new_cyclic(|this| Self {
            pool,
            queue: Mutex::new(Vec::new()),
            auto_managed: AtomicBool::new(true),
            id: StateId::next(),
            schedule: Mutex::new(None),
            this: this.clone(),
        })
    }

    /// Submits an operation without a callback.
    ///
    /// The caller observes the task through the returned handle only; nothing
    /// is queued on the dispatcher.
    ///
    /// # Errors
    /// Returns [`SubmitError::PoolShutDown`] if the pool is closed.
    pub fn submit<T, F>(&self, op: F) -> Result<TaskHandle<T>, SubmitError>
    where
        T: Send + 'static,
        F: FnOnce() -> Result<T, OperationError> + Send + 'static,
    {
        self.pool.submit(op)
    }

    /// Submits an operation and registers a callback to run on the driver
    /// thread once the task finishes.
    ///
    /// Safe to call from any thread, including while a tick is executing.
    ///
    /// # Errors
    /// Returns [`SubmitError::PoolShutDown`] if the pool is closed; nothing
    /// is queued in that case.
    pub fn submit_with<T, F, C>(&self, op: F, callback: C) -> Result<TaskHandle<T>, SubmitError>
    where
        T: Send + 'static,
        F: FnOnce() -> Result<T, OperationError> + Send + 'static,
        C: FnOnce(TaskOutcome<T>) + Send + 'static,
    {
        let handle = self.pool.submit(op)?;
        self.watch(handle.clone(), callback);
        Ok(handle)
    }

    /// Registers a callback for a task that was submitted elsewhere.
    ///
    /// The callback runs on the driver thread once the handle reports a
    /// terminal state. The dispatcher must be attached to a schedule for
    /// callbacks to execute; with auto-manage enabled it re-attaches itself
    /// to the schedule it was last attached to.
    pub fn watch<T, C>(&self, handle: TaskHandle<T>, callback: C)
    where
        T: Send + 'static,
        C: FnOnce(TaskOutcome<T>) + Send + 'static,
    {
        self.queue.lock().unwrap().push(Box::new(HandleCallback {
            handle,
            callback: Box::new(callback),
        }));
        self.reattach_if_needed();
    }

    /// Runs one dispatcher tick on the driver thread.
    ///
    /// Entries whose handles are terminal are removed from the queue in
    /// submission order: cancelled ones are dropped silently, the rest have
    /// their callbacks invoked after the queue lock is released, so slow user
    /// code never blocks submitters.
    ///
    /// With auto-manage enabled, a tick that begins with an empty queue
    /// detaches the dispatcher, which means detachment happens one tick after
    /// the queue drains. Hosts normally call this through the schedule rather
    /// than directly.
    pub fn run_tick(&self) {
        let mut fired: Vec<Box<dyn PendingEntry>> = Vec::new();
        let idle = {
            let mut queue = self.queue.lock().unwrap();
            let idle = queue.is_empty();
            if !idle {
                let mut retained = Vec::with_capacity(queue.len());
                for entry in queue.drain(..) {
                    if entry.is_cancelled() {
                        // Cancelled tasks are pruned without notification.
                        drop(entry);
                    } else if entry.is_done() {
                        fired.push(entry);
                    } else {
                        retained.push(entry);
                    }
                }
                *queue = retained;
            }
            idle
        };

        self.pool.pump();

        for entry in fired {
            entry.fire();
        }

        if idle {
            self.detach_if_auto();
        }
    }

    /// Number of entries currently waiting for their tasks to finish.
    pub fn pending_tasks(&self) -> usize {
        self.queue.lock().unwrap().len()
    }

    /// The pool this dispatcher submits to.
    pub fn pool(&self) -> &Arc<WorkerPool> {
        &self.pool
    }

    /// Whether the dispatcher manages its own schedule enrollment.
    pub fn auto_managed(&self) -> bool {
        self.auto_managed.load(Ordering::Relaxed)
    }

    /// Enables or disables self-managed schedule enrollment. Default: `true`.
    ///
    /// When disabled the dispatcher never attaches or detaches itself; the
    /// host is expected to drive `run_tick()` unconditionally.
    pub fn set_auto_managed(&self, auto_managed: bool) {
        self.auto_managed.store(auto_managed, Ordering::Relaxed);
    }

    fn recorded_schedule(&self) -> Option<Arc<DriverSchedule>> {
        self.schedule
            .lock()
            .unwrap()
            .as_ref()
            .and_then(Weak::upgrade)
    }

    fn reattach_if_needed(&self) {
        if !self.auto_managed() {
            return;
        }
        let Some(this) = self.this.upgrade() else {
            return;
        };
        if let Some(schedule) = self.recorded_schedule() {
            if !schedule.has_attached(self.id) {
                schedule.attach(this);
            }
        }
    }

    fn detach_if_auto(&self) {
        if !self.auto_managed() {
            return;
        }
        if let Some(schedule) = self.recorded_schedule() {
            schedule.detach(self.id);
            // A submission may have raced the idle decision: it saw the
            // dispatcher still attached and skipped re-attaching. Undo.
            if !self.queue.lock().unwrap().is_empty() {
                self.reattach_if_needed();
            }
        }
    }
}

impl TickState for TaskDispatcher {
    fn id(&self) -> StateId {
        self.id
    }

    fn tick(self: Arc<Self>) {
        self.run_tick();
    }

    fn on_attach(&self, schedule: &Arc<DriverSchedule>) {
        *self.schedule.lock().unwrap() = Some(Arc::downgrade(schedule));
    }

    fn on_detach(&self, schedule: &Arc<DriverSchedule>) {
        // Keep the reference so a later submission can re-attach.
        *self.schedule.lock().unwrap() = Some(Arc::downgrade(schedule));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    fn test_dispatcher() -> Arc<TaskDispatcher> {
        TaskDispatcher::new(Arc::new(WorkerPool::new(1)))
    }

    /// A handle completed by the test itself, so tick timing is fully
    /// deterministic.
    fn manual_handle() -> TaskHandle<u32> {
        TaskHandle::new()
    }

    #[test]
    fn callback_runs_once_after_completion() {
        let dispatcher = test_dispatcher();
        let handle = manual_handle();
        let calls = Arc::new(AtomicUsize::new(0));
        let calls_in_cb = calls.clone();
        dispatcher.watch(handle.clone(), move |outcome| {
            assert!(matches!(outcome, TaskOutcome::Completed(5)));
            calls_in_cb.fetch_add(1, Ordering::SeqCst);
        });

        dispatcher.run_tick();
        assert_eq!(calls.load(Ordering::SeqCst), 0);
        assert_eq!(dispatcher.pending_tasks(), 1);

        handle.complete(TaskOutcome::Completed(5));
        dispatcher.run_tick();
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(dispatcher.pending_tasks(), 0);

        dispatcher.run_tick();
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn callbacks_run_in_submission_order() {
        let dispatcher = test_dispatcher();
        let order = Arc::new(Mutex::new(Vec::new()));
        let mut handles = Vec::new();
        for i in 0..4u32 {
            let handle = manual_handle();
            let order_in_cb = order.clone();
            dispatcher.watch(handle.clone(), move |_| {
                order_in_cb.lock().unwrap().push(i);
            });
            handles.push(handle);
        }
        // Complete in reverse; execution order must still follow submission.
        for handle in handles.iter().rev() {
            handle.complete(TaskOutcome::Completed(0));
        }
        dispatcher.run_tick();
        assert_eq!(*order.lock().unwrap(), vec![0, 1, 2, 3]);
    }

    #[test]
    fn cancelled_task_never_invokes_callback() {
        let dispatcher = test_dispatcher();
        let handle = manual_handle();
        let calls = Arc::new(AtomicUsize::new(0));
        let calls_in_cb = calls.clone();
        dispatcher.watch(handle.clone(), move |_| {
            calls_in_cb.fetch_add(1, Ordering::SeqCst);
        });

        assert!(handle.cancel());
        dispatcher.run_tick();
        assert_eq!(calls.load(Ordering::SeqCst), 0);
        assert_eq!(dispatcher.pending_tasks(), 0);
    }

    #[test]
    fn failed_task_still_reaches_callback() {
        let dispatcher = test_dispatcher();
        let handle = manual_handle();
        let saw_failure = Arc::new(AtomicBool::new(false));
        let saw_in_cb = saw_failure.clone();
        dispatcher.watch(handle.clone(), move |outcome| {
            if matches!(outcome, TaskOutcome::Failed(_)) {
                saw_in_cb.store(true, Ordering::SeqCst);
            }
        });

        handle.complete(TaskOutcome::Failed(
            crate::task_management::handle::TaskError::Panicked("worker died".into()),
        ));
        dispatcher.run_tick();
        assert!(saw_failure.load(Ordering::SeqCst));
    }

    #[test]
    fn panicking_callback_does_not_disturb_others() {
        let dispatcher = test_dispatcher();
        let first = manual_handle();
        let second = manual_handle();
        let second_ran = Arc::new(AtomicBool::new(false));

        dispatcher.watch(first.clone(), |_| panic!("bad callback"));
        let ran_in_cb = second_ran.clone();
        dispatcher.watch(second.clone(), move |_| {
            ran_in_cb.store(true, Ordering::SeqCst);
        });

        first.complete(TaskOutcome::Completed(0));
        second.complete(TaskOutcome::Completed(0));
        dispatcher.run_tick();

        assert!(second_ran.load(Ordering::SeqCst));
        assert_eq!(dispatcher.pending_tasks(), 0);
    }

    #[test]
    fn submit_is_rejected_after_pool_shutdown() {
        let dispatcher = test_dispatcher();
        dispatcher.pool().shutdown();
        let result = dispatcher.submit_with(|| Ok(0u32), |_| {});
        assert_eq!(result.unwrap_err(), SubmitError::PoolShutDown);
        // Nothing was queued for the rejected submission.
        assert_eq!(dispatcher.pending_tasks(), 0);
    }

    #[test]
    fn auto_detach_and_reattach() {
        let schedule = DriverSchedule::new();
        let dispatcher = test_dispatcher();
        schedule.attach(dispatcher.clone());

        let handle = manual_handle();
        dispatcher.watch(handle.clone(), |_| {});
        handle.complete(TaskOutcome::Completed(0));

        // The tick that fires the last callback leaves the dispatcher
        // attached; the next (idle) tick detaches it.
        schedule.run_tick();
        assert!(schedule.has_attached(dispatcher.id));
        schedule.run_tick();
        assert!(!schedule.has_attached(dispatcher.id));

        // A new registration re-attaches to the recorded schedule.
        let next = manual_handle();
        dispatcher.watch(next.clone(), |_| {});
        assert!(schedule.has_attached(dispatcher.id));
    }

    #[test]
    fn manual_mode_never_touches_the_schedule() {
        let schedule = DriverSchedule::new();
        let dispatcher = test_dispatcher();
        dispatcher.set_auto_managed(false);
        schedule.attach(dispatcher.clone());

        schedule.run_tick();
        schedule.run_tick();
        assert!(schedule.has_attached(dispatcher.id));

        dispatcher.set_auto_managed(true);
        schedule.run_tick();
        assert!(!schedule.has_attached(dispatcher.id));
    }

    #[test]
    fn concurrent_watch_during_ticks_loses_nothing() {
        let dispatcher = test_dispatcher();
        let calls = Arc::new(AtomicUsize::new(0));
        const PER_THREAD: usize = 50;

        let mut threads = Vec::new();
        for _ in 0..4 {
            let dispatcher = dispatcher.clone();
            let calls = calls.clone();
            threads.push(std::thread::spawn(move || {
                for _ in 0..PER_THREAD {
                    let handle = TaskHandle::new();
                    let calls = calls.clone();
                    dispatcher.watch(handle.clone(), move |_| {
                        calls.fetch_add(1, Ordering::SeqCst);
                    });
                    handle.complete(TaskOutcome::Completed(0u32));
                }
            }));
        }

        // Tick concurrently with the submitting threads.
        for _ in 0..200 {
            dispatcher.run_tick();
            std::thread::yield_now();
        }
        for thread in threads {
            thread.join().unwrap();
        }
        while dispatcher.pending_tasks() > 0 {
            dispatcher.run_tick();
        }
        dispatcher.run_tick();
        assert_eq!(calls.load(Ordering::SeqCst), 4 * PER_THREAD);
    }
}
