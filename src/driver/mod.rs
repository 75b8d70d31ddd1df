//! # Driver Schedule
//!
//! The cooperative tick loop that drives every frame-synchronized component.
//!
//! ## Key Components
//!
//! * `DriverSchedule` - The host-side registry of attached states, ticked once per frame
//! * `TickState` - Trait implemented by components that want a per-frame `tick()`
//! * `StateId` - Stable, process-unique identity for attached states
//!
//! ## Architecture
//!
//! The schedule owns a list of attached states and walks it once per driver
//! cycle. States are identified by a `StateId` rather than by pointer so that
//! attach and detach are idempotent: attaching a state that is already
//! enrolled is a no-op, as is detaching one that is not. `run_tick()` operates
//! on a snapshot of the attached list, so a state may attach or detach
//! anything (including itself) from inside its own `tick()` without
//! invalidating the iteration.
//!
//! Components that manage their own lifecycle record the schedule they were
//! last attached to via the `on_attach`/`on_detach` hooks and later re-attach
//! themselves through it when new work arrives.

use std::sync::{
    atomic::{AtomicU64, Ordering},
    Arc, Mutex, Weak,
};

/// Process-unique identity for a state attached to a [`DriverSchedule`].
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct StateId(u64);

impl StateId {
    /// Allocates a fresh id. Every call returns a distinct value for the
    /// lifetime of the process.
    pub fn next() -> Self {
        static NEXT_ID: AtomicU64 = AtomicU64::new(1);
        StateId(NEXT_ID.fetch_add(1, Ordering::Relaxed))
    }
}

/// A unit of per-frame work that can be enrolled in a [`DriverSchedule`].
///
/// Implementations must be cheap inside `tick()`: the driver thread never
/// blocks, so all polling has to be a non-blocking state check.
pub trait TickState: Send + Sync + 'static {
    /// The stable identity of this state. Must not change after construction.
    fn id(&self) -> StateId;

    /// Invoked once per driver cycle, on the driver thread only.
    fn tick(self: Arc<Self>);

    /// Hook invoked when this state is enrolled in a schedule.
    ///
    /// Self-managing states record the schedule here so that a later
    /// submission can re-attach to the correct schedule.
    fn on_attach(&self, _schedule: &Arc<DriverSchedule>) {}

    /// Hook invoked when this state is removed from a schedule.
    fn on_detach(&self, _schedule: &Arc<DriverSchedule>) {}
}

/// The per-frame schedule run by the single driver thread.
///
/// # Examples
///
/// ```
/// use async_loader::driver::DriverSchedule;
///
/// let schedule = DriverSchedule::new();
/// // In the host frame loop:
/// schedule.run_tick();
/// ```
pub struct DriverSchedule {
    states: Mutex<Vec<Arc<dyn TickState>>>,
    // Handed to attach/detach hooks so states can record where to re-attach.
    this: Weak<DriverSchedule>,
}

impl DriverSchedule {
    /// Creates an empty schedule.
    pub fn new() -> Arc<Self> {
        Arc::new_cyclic(|this| Self {
            states: Mutex::new(Vec::new()),
            this: this.clone(),
        })
    }

    /// Enrolls a state in the schedule.
    ///
    /// Idempotent: if a state with the same id is already attached this does
    /// nothing. Otherwise the state is appended (states tick in attachment
    /// order) and its `on_attach` hook runs.
    pub fn attach(&self, state: Arc<dyn TickState>) {
        {
            let mut states = self.states.lock().unwrap();
            if states.iter().any(|s| s.id() == state.id()) {
                return;
            }
            states.push(state.clone());
        }
        log::debug!("attached state {:?}", state.id());
        if let Some(this) = self.this.upgrade() {
            state.on_attach(&this);
        }
    }

    /// Removes a state from the schedule.
    ///
    /// Idempotent: detaching an id that is not attached does nothing. The
    /// removed state's `on_detach` hook runs outside the schedule lock.
    pub fn detach(&self, id: StateId) {
        let removed = {
            let mut states = self.states.lock().unwrap();
            states
                .iter()
                .position(|s| s.id() == id)
                .map(|idx| states.remove(idx))
        };
        if let Some(state) = removed {
            log::debug!("detached state {:?}", id);
            if let Some(this) = self.this.upgrade() {
                state.on_detach(&this);
            }
        }
    }

    /// Returns whether a state with the given id is currently enrolled.
    pub fn has_attached(&self, id: StateId) -> bool {
        self.states.lock().unwrap().iter().any(|s| s.id() == id)
    }

    /// Number of currently attached states.
    pub fn attached_count(&self) -> usize {
        self.states.lock().unwrap().len()
    }

    /// Runs one driver cycle: ticks every attached state in attachment order.
    ///
    /// Operates on a snapshot of the attached list, so states may attach or
    /// detach during the tick. A state detached mid-cycle by an earlier state
    /// still receives the tick it was snapshotted into.
    pub fn run_tick(&self) {
        let snapshot: Vec<Arc<dyn TickState>> = self.states.lock().unwrap().clone();
        for state in snapshot {
            state.tick();
        }
    }
}
