#![warn(missing_docs)]
#![warn(rustdoc::invalid_rust_codeblocks)]

//! # Async Loader
//!
//! Asynchronous resource loading with frame-synchronized callback dispatch.
//!
//! Blocking load operations run concurrently on a pool of worker threads,
//! while every user-visible side effect - touching shared scene state,
//! updating a loading indicator - happens only on the single driver thread,
//! at well-defined points in its cooperative tick loop.
//!
//! ## Key Modules
//!
//! * `driver` - The per-frame schedule and the attach/detach lifecycle contract
//! * `task_management` - Worker pool and the task handles it produces
//! * `dispatch` - Per-task completion callbacks, executed on the driver thread
//! * `progress` - Named batches with aggregate progress reporting
//!
//! ## Architecture
//!
//! A caller submits a blocking operation through the [`TaskDispatcher`] and
//! immediately receives a [`TaskHandle`]. The worker pool runs the operation
//! in the background; each driver tick the dispatcher polls its pending
//! handles and runs finished callbacks in submission order. Handles can also
//! be grouped into named batches on the [`ProgressMonitor`], which updates a
//! [`ProgressIndicator`] every tick and fires a batch completion callback one
//! tick after the batch first reads 100%.
//!
//! Both components manage their own enrollment in the [`DriverSchedule`]:
//! they stay attached only while they have pending work and re-attach
//! themselves when new work arrives.
//!
//! ## Usage
//!
//! ```no_run
//! use std::sync::Arc;
//! use async_loader::{
//!     DriverSchedule, ProgressGauge, ProgressMonitor, TaskDispatcher, TaskOutcome, WorkerPool,
//! };
//!
//! let pool = Arc::new(WorkerPool::new(3));
//! let schedule = DriverSchedule::new();
//! let dispatcher = TaskDispatcher::new(pool);
//! let monitor = ProgressMonitor::new();
//! // Dispatcher before monitor: per-task callbacks order before batch
//! // completion within one driver cycle.
//! schedule.attach(dispatcher.clone());
//! schedule.attach(monitor.clone());
//!
//! let gauge = ProgressGauge::new();
//! let handle = dispatcher
//!     .submit_with(
//!         || Ok::<_, Box<dyn std::error::Error + Send + Sync>>("planet mesh"),
//!         |outcome| {
//!             if let TaskOutcome::Completed(asset) = outcome {
//!                 println!("attach {asset} to the scene");
//!             }
//!         },
//!     )
//!     .unwrap();
//! monitor
//!     .monitor(
//!         "startup",
//!         vec![handle.probe()],
//!         gauge,
//!         Some(Box::new(|| println!("loading screen done"))),
//!     )
//!     .unwrap();
//!
//! // Host frame loop:
//! loop {
//!     schedule.run_tick();
//!     # break;
//! }
//! ```

pub mod dispatch;
pub mod driver;
pub mod progress;
pub mod task_management;

pub use dispatch::TaskDispatcher;
pub use driver::{DriverSchedule, StateId, TickState};
pub use progress::indicator::{ProgressGauge, ProgressIndicator};
pub use progress::{MonitorError, ProgressMonitor, ProgressProbe};
pub use task_management::handle::{OperationError, TaskError, TaskHandle, TaskOutcome};
pub use task_management::{SubmitError, WorkerPool};
