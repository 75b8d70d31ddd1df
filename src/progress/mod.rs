//! # Batch Progress Monitor
//!
//! Tracks named batches of task handles and reports each batch's aggregate
//! completion ratio to a progress indicator once per driver tick.
//!
//! ## Two-Phase Finalization
//!
//! A batch whose ratio reaches 1.0 is not discarded immediately. It is
//! flagged, and its completion callback runs at the start of the *next* tick.
//! The indicator therefore reads 100% for at least one full frame before the
//! batch disappears and downstream effects (hiding the loading screen,
//! swapping scenes) run. This one-tick delay is deliberate; do not collapse
//! the two phases.
//!
//! ## Lifecycle
//!
//! Like the dispatcher, the monitor enrolls itself in the driver schedule
//! while it has batches to watch and detaches on the first tick it begins
//! with none, re-attaching when a new batch is registered.

pub mod indicator;

use std::panic::{self, AssertUnwindSafe};
use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc, Mutex, Weak,
};

use thiserror::Error;

use crate::driver::{DriverSchedule, StateId, TickState};
use crate::task_management::handle::TaskHandle;
use indicator::ProgressIndicator;

/// Synchronous batch registration failure.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum MonitorError {
    /// A batch must contain at least one task; an empty batch would never
    /// complete and its ratio would be undefined.
    #[error("a batch must contain at least one task")]
    EmptyBatch,
}

/// Non-blocking terminal-state probe for a task tracked in a batch.
///
/// `TaskHandle<T>` implements this for every `T`; use [`TaskHandle::probe`]
/// to enroll a handle in a batch. A probe is settled once its task is
/// completed, failed, or cancelled.
pub trait ProgressProbe: Send + Sync {
    /// Whether the underlying task has reached a terminal state.
    fn is_settled(&self) -> bool;
}

impl<T: Send + 'static> ProgressProbe for TaskHandle<T> {
    fn is_settled(&self) -> bool {
        self.is_done()
    }
}

impl<T: Send + 'static> TaskHandle<T> {
    /// An erased probe for this handle, ready to enroll in a batch.
    pub fn probe(&self) -> Box<dyn ProgressProbe> {
        Box::new(self.clone())
    }
}

struct Batch {
    name: String,
    probes: Vec<Box<dyn ProgressProbe>>,
    indicator: Arc<dyn ProgressIndicator>,
    on_complete: Option<Box<dyn FnOnce() + Send>>,
}

impl Batch {
    /// Completion ratio in `[0, 1]`. Monotonically non-decreasing across
    /// ticks, since probes only ever move toward settled.
    fn ratio(&self) -> f32 {
        if self.probes.is_empty() {
            return 0.0;
        }
        let settled = self.probes.iter().filter(|p| p.is_settled()).count();
        (settled as f32 / self.probes.len() as f32).clamp(0.0, 1.0)
    }
}

struct MonitorQueues {
    active: Vec<Batch>,
    finalize: Vec<Batch>,
}

/// Watches batches of task handles and drives their progress indicators.
///
/// Attach the monitor to the schedule *after* the dispatcher so that, within
/// one driver cycle, per-task callbacks run before any batch completion
/// callback for the same tasks.
pub struct ProgressMonitor {
    queues: Mutex<MonitorQueues>,
    auto_managed: AtomicBool,
    id: StateId,
    schedule: Mutex<Option<Weak<DriverSchedule>>>,
    // Needed to enroll ourselves as an Arc<dyn TickState> on re-attach.
    this: Weak<ProgressMonitor>,
}

impl ProgressMonitor {
    /// Creates a monitor with no batches.
    pub fn new() -> Arc<Self> {
        Arc::new_cyclic(|this| Self {
            queues: Mutex::new(MonitorQueues {
                active: Vec::new(),
                finalize: Vec::new(),
            }),
            auto_managed: AtomicBool::new(true),
            id: StateId::next(),
            schedule: Mutex::new(None),
            this: this.clone(),
        })
    }

    /// Registers a batch of tasks to track.
    ///
    /// Each tick the monitor pushes the batch's completion ratio to
    /// `indicator`; one tick after the ratio first reaches 1.0 it runs
    /// `on_complete` (if any) and discards the batch. Probes shared with
    /// other batches are counted independently per batch.
    ///
    /// # Errors
    /// Returns [`MonitorError::EmptyBatch`] if `probes` is empty.
    pub fn monitor(
        &self,
        name: impl Into<String>,
        probes: Vec<Box<dyn ProgressProbe>>,
        indicator: Arc<dyn ProgressIndicator>,
        on_complete: Option<Box<dyn FnOnce() + Send>>,
    ) -> Result<(), MonitorError> {
        if probes.is_empty() {
            return Err(MonitorError::EmptyBatch);
        }
        let name = name.into();
        log::debug!("monitoring batch '{name}' with {} tasks", probes.len());
        self.queues.lock().unwrap().active.push(Batch {
            name,
            probes,
            indicator,
            on_complete,
        });
        self.reattach_if_needed();
        Ok(())
    }

    /// Runs one monitor tick on the driver thread.
    ///
    /// Phase one finalizes the batches flagged on the previous tick: each
    /// completion callback runs (panics caught and logged) and the batch is
    /// discarded. Phase two recomputes every remaining batch's ratio, pushes
    /// it to the indicator outside the queue lock, and flags batches that
    /// reached 1.0. A tick that begins with no batches detaches the monitor
    /// when auto-manage is enabled.
    pub fn run_tick(&self) {
        let (to_finalize, idle) = {
            let mut queues = self.queues.lock().unwrap();
            let idle = queues.active.is_empty() && queues.finalize.is_empty();
            (std::mem::take(&mut queues.finalize), idle)
        };

        for batch in to_finalize {
            log::info!("batch '{}' finished loading", batch.name);
            if let Some(callback) = batch.on_complete {
                if panic::catch_unwind(AssertUnwindSafe(callback)).is_err() {
                    log::error!("completion callback for batch '{}' panicked", batch.name);
                }
            }
        }

        let mut updates: Vec<(Arc<dyn ProgressIndicator>, f32)> = Vec::new();
        {
            let mut queues = self.queues.lock().unwrap();
            let mut remaining = Vec::with_capacity(queues.active.len());
            for batch in std::mem::take(&mut queues.active) {
                let ratio = batch.ratio();
                updates.push((batch.indicator.clone(), ratio));
                if ratio >= 1.0 {
                    queues.finalize.push(batch);
                } else {
                    remaining.push(batch);
                }
            }
            queues.active = remaining;
        }
        for (indicator, ratio) in updates {
            indicator.set_progress(ratio);
        }

        if idle {
            self.detach_if_auto();
        }
    }

    /// Number of batches still counting toward completion (excludes batches
    /// already flagged for finalization).
    pub fn active_batches(&self) -> usize {
        self.queues.lock().unwrap().active.len()
    }

    /// Whether the monitor manages its own schedule enrollment.
    pub fn auto_managed(&self) -> bool {
        self.auto_managed.load(Ordering::Relaxed)
    }

    /// Enables or disables self-managed schedule enrollment. Default: `true`.
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
            // A registration may have raced the idle decision: it saw the
            // monitor still attached and skipped re-attaching. Undo.
            let has_work = {
                let queues = self.queues.lock().unwrap();
                !queues.active.is_empty() || !queues.finalize.is_empty()
            };
            if has_work {
                self.reattach_if_needed();
            }
        }
    }
}

impl TickState for ProgressMonitor {
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
        // Keep the reference so a later registration can re-attach.
        *self.schedule.lock().unwrap() = Some(Arc::downgrade(schedule));
    }
}
