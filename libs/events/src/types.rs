//! Run status and controller event payloads.

use std::str::FromStr;

use chrono::{DateTime, Utc};
use recur_id::RunId;
use serde::{Deserialize, Serialize};

use crate::EventError;

// =============================================================================
// Event Type Constants
// =============================================================================

/// All event type names as constants.
pub mod event_types {
    // Trigger decisions
    pub const TRIGGER_FIRED: &str = "trigger.fired";
    pub const TRIGGER_SKIPPED: &str = "trigger.skipped";
    pub const TRIGGER_FAILED: &str = "trigger.failed";

    // Run side effects
    pub const RUN_SUPERSEDED: &str = "run.superseded";

    // Retention
    pub const RETENTION_PRUNED: &str = "retention.pruned";

    // Schedule health
    pub const SCHEDULE_INVALID: &str = "schedule.invalid";
    pub const SCHEDULE_DEGRADED: &str = "schedule.degraded";
    pub const SCHEDULE_DELETED: &str = "schedule.deleted";
}

// =============================================================================
// Run Status
// =============================================================================

/// Lifecycle status of a materialized run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Pending,
    Running,
    Succeeded,
    Failed,
    Cancelled,
}

impl RunStatus {
    /// Returns true once the run can no longer change.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Succeeded | Self::Failed | Self::Cancelled)
    }

    /// Whether moving from `self` to `next` is a legal transition.
    ///
    /// Pending may skip straight to a terminal result (fast runs report only
    /// their outcome). Any non-terminal run may be cancelled. Terminal
    /// statuses never change, and re-reporting the current status is a no-op
    /// rather than a transition.
    pub fn can_transition_to(&self, next: RunStatus) -> bool {
        match (self, next) {
            (Self::Pending, Self::Running) => true,
            (Self::Pending | Self::Running, Self::Succeeded | Self::Failed | Self::Cancelled) => {
                true
            }
            _ => false,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Succeeded => "succeeded",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        }
    }
}

impl std::fmt::Display for RunStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RunStatus {
    type Err = EventError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "running" => Ok(Self::Running),
            "succeeded" => Ok(Self::Succeeded),
            "failed" => Ok(Self::Failed),
            "cancelled" => Ok(Self::Cancelled),
            other => Err(EventError::UnknownRunStatus(other.to_string())),
        }
    }
}

// =============================================================================
// Reason Enums
// =============================================================================

/// Why trigger instants were not realized as runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SkipReason {
    /// Forbid policy with a run still active.
    ConcurrencyForbidden,
    /// Older than the catch-up bound allows.
    CatchupExceeded,
}

/// Why a trigger instant was permanently given up on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TriggerFailureKind {
    /// The executor refused the run specification.
    ExecutorRejected,
    /// Submission kept failing transiently past the retry bound.
    RetriesExhausted,
}

// =============================================================================
// Payloads
// =============================================================================

/// A run was created and accepted by the executor.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TriggerFiredPayload {
    pub run_id: RunId,
    pub scheduled_for: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
}

/// One or more instants were skipped.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TriggerSkippedPayload {
    /// Latest skipped instant.
    pub scheduled_for: DateTime<Utc>,
    pub count: u64,
    pub reason: SkipReason,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TriggerFailedPayload {
    pub run_id: RunId,
    pub scheduled_for: DateTime<Utc>,
    pub attempts: u32,
    pub kind: TriggerFailureKind,
    pub reason: String,
}

/// An active run was cancelled to make room for a newer trigger.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunSupersededPayload {
    pub run_id: RunId,
    pub superseded_by: RunId,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetentionPrunedPayload {
    pub deleted: Vec<RunId>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScheduleInvalidPayload {
    pub message: String,
}

/// The schedule's next trigger is older than one reconcile interval.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScheduleDegradedPayload {
    pub next_trigger: DateTime<Utc>,
    pub lag_secs: i64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScheduleDeletedPayload {
    pub cancelled: Vec<RunId>,
    pub deleted: usize,
}

// =============================================================================
// Event
// =============================================================================

/// A controller observability event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ControllerEvent {
    TriggerFired(TriggerFiredPayload),
    TriggerSkipped(TriggerSkippedPayload),
    TriggerFailed(TriggerFailedPayload),
    RunSuperseded(RunSupersededPayload),
    RetentionPruned(RetentionPrunedPayload),
    ScheduleInvalid(ScheduleInvalidPayload),
    ScheduleDegraded(ScheduleDegradedPayload),
    ScheduleDeleted(ScheduleDeletedPayload),
}

impl ControllerEvent {
    /// The dotted event type name.
    pub fn event_type(&self) -> &'static str {
        match self {
            Self::TriggerFired(_) => event_types::TRIGGER_FIRED,
            Self::TriggerSkipped(_) => event_types::TRIGGER_SKIPPED,
            Self::TriggerFailed(_) => event_types::TRIGGER_FAILED,
            Self::RunSuperseded(_) => event_types::RUN_SUPERSEDED,
            Self::RetentionPruned(_) => event_types::RETENTION_PRUNED,
            Self::ScheduleInvalid(_) => event_types::SCHEDULE_INVALID,
            Self::ScheduleDegraded(_) => event_types::SCHEDULE_DEGRADED,
            Self::ScheduleDeleted(_) => event_types::SCHEDULE_DELETED,
        }
    }
}
