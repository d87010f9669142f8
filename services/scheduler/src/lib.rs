//! recur scheduler library.
//!
//! This crate primarily ships a `recur-scheduler` binary, but the controller
//! is exposed as a library so it can be embedded and integration tested.
//!
//! ## Architecture
//!
//! ```text
//! Controller
//! ├── Dispatcher        (store watch, executor notifications, resync ticks)
//! ├── WorkQueue         (deduplicated keys, per-key exclusion and backoff)
//! └── worker × N        (one reconciliation pass per dequeued key)
//! ```
//!
//! ## Modules
//!
//! - `model`: schedules, run records and reconciler-owned status
//! - `store`: the schedule store seam and its in-memory implementation
//! - `executor`: the run executor seam and a mock executor
//! - `controller`: work queue, dispatcher, reconciler and worker pool
//! - `retention`: applies retention plans against the store

pub mod clock;
pub mod config;
pub mod controller;
pub mod error;
pub mod events;
pub mod executor;
pub mod model;
pub mod retention;
pub mod store;

// Re-export commonly used types
pub use clock::{Clock, FakeClock, SystemClock};
pub use controller::{Controller, ControllerConfig, PassStats, Reconciler, ReconcilerConfig};
pub use error::ReconcileError;
pub use events::{ControllerMetrics, EventSink, MemoryEventSink, TracingEventSink};
pub use executor::{Executor, MockExecutor, RunStatusChanged};
pub use model::{
    RunRecord, Schedule, SchedulePhase, ScheduleSpec, ScheduleStatus, MAX_CANCEL_REISSUES,
};
pub use store::{InMemoryStore, ScheduleStore};
