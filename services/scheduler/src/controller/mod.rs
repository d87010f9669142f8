//! Schedule controller.
//!
//! The controller is level-triggered: every pass reads the schedule and its
//! run records from the store and converges them, whatever woke it up. Wake
//! ups come from store watch events, executor status notifications and a
//! periodic full resync, all funneled through one deduplicating work queue
//! so a schedule is never reconciled by two workers at once.

mod dispatcher;
mod inbox;
mod queue;
mod reconciler;
mod worker;

pub use dispatcher::Dispatcher;
pub use inbox::StatusInbox;
pub use queue::WorkQueue;
pub use reconciler::{PassStats, Reconciler, ReconcilerConfig};
pub use worker::{Controller, ControllerConfig};
