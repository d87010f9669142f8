//! Schedules, run records and the status the reconciler maintains.

use chrono::{DateTime, Utc};
use recur_events::RunStatus;
use recur_id::{RunId, ScheduleKey};
use recur_reconcile::{
    ConcurrencyPolicy, RetentionClass, RetentionLimits, ScheduleWindow, SpecHash, TriggerError,
    TriggerSpec,
};
use serde::{Deserialize, Serialize};

/// Most recent permanently failed triggers kept in status.
pub const MAX_FAILED_TRIGGERS: usize = 10;

/// Cancel re-issues answered "already terminal" before a superseded run is
/// settled as cancelled without a status notification.
pub const MAX_CANCEL_REISSUES: u32 = 3;

// =============================================================================
// Schedule
// =============================================================================

/// User-declared intent for a recurring workflow.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScheduleSpec {
    pub trigger: TriggerSpec,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub start_time: Option<DateTime<Utc>>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub end_time: Option<DateTime<Utc>>,

    #[serde(default)]
    pub concurrency_policy: ConcurrencyPolicy,

    /// Succeeded runs to keep. 0 keeps none.
    #[serde(default = "default_succeeded_history")]
    pub max_succeeded_history: u32,

    /// Failed and cancelled runs to keep. 0 keeps none.
    #[serde(default = "default_failed_history")]
    pub max_failed_history: u32,

    #[serde(default = "default_true")]
    pub enabled: bool,

    /// When false, only the most recent elapsed instant is realized after a
    /// pause.
    #[serde(default = "default_true")]
    pub catchup: bool,

    /// Passed verbatim to the executor.
    #[serde(default)]
    pub run_template: serde_json::Value,
}

fn default_succeeded_history() -> u32 {
    3
}

fn default_failed_history() -> u32 {
    1
}

fn default_true() -> bool {
    true
}

impl ScheduleSpec {
    pub fn new(trigger: TriggerSpec) -> Self {
        Self {
            trigger,
            start_time: None,
            end_time: None,
            concurrency_policy: ConcurrencyPolicy::default(),
            max_succeeded_history: default_succeeded_history(),
            max_failed_history: default_failed_history(),
            enabled: true,
            catchup: true,
            run_template: serde_json::Value::Null,
        }
    }

    pub fn with_policy(mut self, policy: ConcurrencyPolicy) -> Self {
        self.concurrency_policy = policy;
        self
    }

    pub fn with_history(mut self, succeeded: u32, failed: u32) -> Self {
        self.max_succeeded_history = succeeded;
        self.max_failed_history = failed;
        self
    }

    pub fn with_window(
        mut self,
        start: Option<DateTime<Utc>>,
        end: Option<DateTime<Utc>>,
    ) -> Self {
        self.start_time = start;
        self.end_time = end;
        self
    }

    pub fn window(&self, created_at: DateTime<Utc>) -> ScheduleWindow {
        ScheduleWindow {
            created_at,
            start_time: self.start_time,
            end_time: self.end_time,
        }
    }

    pub fn retention_limits(&self) -> RetentionLimits {
        RetentionLimits {
            max_succeeded: self.max_succeeded_history as usize,
            max_failed: self.max_failed_history as usize,
        }
    }

    /// Check that the spec can ever produce triggers.
    pub fn validate(&self) -> Result<(), TriggerError> {
        self.trigger.validate()?;
        // The creation time does not affect window validity.
        self.window(DateTime::<Utc>::UNIX_EPOCH).validate()
    }

    pub fn spec_hash(&self) -> SpecHash {
        SpecHash::of(self).unwrap_or_else(|_| SpecHash::from_json(&serde_json::Value::Null))
    }
}

/// A schedule as held by the store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Schedule {
    pub key: ScheduleKey,

    /// Bumped by every write; status writes are conditional on it.
    pub version: u64,

    pub created_at: DateTime<Utc>,
    pub spec: ScheduleSpec,

    #[serde(default)]
    pub status: ScheduleStatus,
}

impl Schedule {
    pub fn window(&self) -> ScheduleWindow {
        self.spec.window(self.created_at)
    }
}

// =============================================================================
// Status
// =============================================================================

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SchedulePhase {
    #[default]
    Enabled,
    Disabled,
    /// Past the end of the window; no further triggers.
    Ended,
    /// The spec is malformed.
    Error,
    /// The next trigger lags behind the clock.
    Degraded,
}

impl SchedulePhase {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Enabled => "enabled",
            Self::Disabled => "disabled",
            Self::Ended => "ended",
            Self::Error => "error",
            Self::Degraded => "degraded",
        }
    }
}

impl std::fmt::Display for SchedulePhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FailedTrigger {
    pub scheduled_for: DateTime<Utc>,
    pub reason: String,
}

/// Observed state of a schedule, written only by the reconciler.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ScheduleStatus {
    /// Latest instant that was realized or deliberately given up on.
    pub last_trigger: Option<DateTime<Utc>>,
    pub next_trigger: Option<DateTime<Utc>>,
    pub active_runs: Vec<RunId>,
    pub active_count: usize,
    pub last_terminal_status: Option<RunStatus>,
    pub phase: SchedulePhase,
    pub message: Option<String>,

    /// Hash of the spec last found malformed.
    pub invalid_spec_hash: Option<SpecHash>,

    pub skipped_triggers: u64,
    pub failed_triggers: Vec<FailedTrigger>,
    pub last_reconciled_at: Option<DateTime<Utc>>,
}

impl ScheduleStatus {
    /// Move `last_trigger` forward; it never moves back.
    pub fn advance(&mut self, instant: DateTime<Utc>) {
        if self.last_trigger.map_or(true, |last| instant > last) {
            self.last_trigger = Some(instant);
        }
    }

    pub fn record_failed_trigger(&mut self, scheduled_for: DateTime<Utc>, reason: impl Into<String>) {
        self.failed_triggers.push(FailedTrigger {
            scheduled_for,
            reason: reason.into(),
        });
        if self.failed_triggers.len() > MAX_FAILED_TRIGGERS {
            let excess = self.failed_triggers.len() - MAX_FAILED_TRIGGERS;
            self.failed_triggers.drain(..excess);
        }
    }
}

// =============================================================================
// Run Record
// =============================================================================

/// One materialized execution of a schedule.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunRecord {
    pub id: RunId,
    pub schedule: ScheduleKey,
    pub scheduled_for: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
    pub status: RunStatus,

    /// Whether the executor accepted the run.
    pub submitted: bool,

    /// Transient submission failures so far.
    pub submit_attempts: u32,
    pub last_error: Option<String>,

    /// Set once cancellation was requested; `status` stays non-terminal
    /// until the executor confirms.
    pub cancel_requested_at: Option<DateTime<Utc>>,

    /// Re-issued cancels the executor answered with "already terminal".
    #[serde(default)]
    pub cancel_reissues: u32,
}

impl RunRecord {
    /// A fresh pending record for `schedule`'s trigger at `scheduled_for`.
    pub fn new(schedule: ScheduleKey, scheduled_for: DateTime<Utc>, now: DateTime<Utc>) -> Self {
        Self {
            id: RunId::for_trigger(&schedule, scheduled_for.timestamp_millis()),
            schedule,
            scheduled_for,
            created_at: now,
            status: RunStatus::Pending,
            submitted: false,
            submit_attempts: 0,
            last_error: None,
            cancel_requested_at: None,
            cancel_reissues: 0,
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    pub fn is_cancel_pending(&self) -> bool {
        !self.is_terminal() && self.cancel_requested_at.is_some()
    }

    /// Counts against the concurrency policy.
    pub fn is_active(&self) -> bool {
        !self.is_terminal() && self.cancel_requested_at.is_none()
    }

    pub fn retention_class(&self) -> Option<RetentionClass> {
        match self.status {
            RunStatus::Succeeded => Some(RetentionClass::Succeeded),
            RunStatus::Failed | RunStatus::Cancelled => Some(RetentionClass::Failed),
            RunStatus::Pending | RunStatus::Running => None,
        }
    }
}
