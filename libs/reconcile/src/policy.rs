//! Concurrency policy admission.
//!
//! Decides whether a newly due trigger may start a run while earlier runs of
//! the same schedule are still active.

use serde::{Deserialize, Serialize};

/// What to do when a trigger fires while runs are still active.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConcurrencyPolicy {
    /// Start the new run alongside the active ones.
    #[default]
    Allow,
    /// Skip the new trigger.
    Forbid,
    /// Cancel the active runs, then start the new one.
    Replace,
}

impl ConcurrencyPolicy {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Allow => "allow",
            Self::Forbid => "forbid",
            Self::Replace => "replace",
        }
    }
}

impl std::fmt::Display for ConcurrencyPolicy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Admission outcome for one trigger.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Decision<T> {
    Accept,
    Reject,
    /// Accept once every listed run has been asked to cancel.
    AcceptAndSupersede(Vec<T>),
}

impl<T> Decision<T> {
    pub fn accepts(&self) -> bool {
        !matches!(self, Self::Reject)
    }
}

/// Decide admission of a trigger given the schedule's active runs.
///
/// Callers pass only runs that count as active: non-terminal runs whose
/// cancellation has not already been requested.
pub fn admit<T: Clone>(policy: ConcurrencyPolicy, active: &[T]) -> Decision<T> {
    if active.is_empty() {
        return Decision::Accept;
    }
    match policy {
        ConcurrencyPolicy::Allow => Decision::Accept,
        ConcurrencyPolicy::Forbid => Decision::Reject,
        ConcurrencyPolicy::Replace => Decision::AcceptAndSupersede(active.to_vec()),
    }
}
