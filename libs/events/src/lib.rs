//! # recur-events
//!
//! Run status and observability event types for the recurring workflow
//! scheduler.
//!
//! ## Design Principles
//!
//! - Events describe decisions the controller already made; they are emitted
//!   after the corresponding store write, never instead of it
//! - Every event belongs to exactly one schedule
//! - Payloads are versioned by `event_type` for downstream consumers
//!
//! ## Event Types
//!
//! - Trigger decisions (`trigger.*`)
//! - Run lifecycle side effects (`run.*`)
//! - Retention (`retention.*`)
//! - Schedule health (`schedule.*`)

mod envelope;
mod error;
mod types;

pub use envelope::*;
pub use error::EventError;
pub use types::*;
