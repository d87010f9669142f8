//! # recur-id
//!
//! Identifier types for the recurring workflow scheduler.
//!
//! ## ID Formats
//!
//! - Schedules are addressed by a [`ScheduleKey`]: `{namespace}/{name}`, the
//!   same identity the API layer exposes to users.
//! - Runs use a prefixed ULID: `run_01HV4Z2WQXKJNM8GPQY6VBKC3D`. Run IDs are
//!   derived from `(schedule, scheduled instant)` rather than generated, so
//!   re-delivering a trigger always lands on the same ID.
//! - Reconciliation passes get a fresh `pass_{ulid}` for log correlation.
//! - Controller events carry a process-local monotonic [`EventId`].

mod error;
mod key;
mod macros;
mod types;

pub use error::IdError;
pub use key::ScheduleKey;
pub use types::*;

/// Re-export ulid for consumers that need raw ULID operations
pub use ulid::Ulid;
