//! Run executor interface.
//!
//! The executor runs workloads on the controller's behalf. Submissions and
//! cancellations are requests; the executor reports the resulting status
//! changes asynchronously as [`RunStatusChanged`] messages.

mod mock;

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use recur_events::RunStatus;
use recur_id::{RunId, ScheduleKey};
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub use mock::{MockCall, MockExecutor};

/// A run handed to the executor.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunRequest {
    /// Stable across retries; the executor deduplicates on it.
    pub run_id: RunId,
    pub schedule: ScheduleKey,
    pub scheduled_for: DateTime<Utc>,
    pub template: serde_json::Value,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SubmitOutcome {
    Accepted,
    /// Permanently refused; retrying will not help.
    Rejected(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CancelOutcome {
    Cancelled,
    NotFound,
    AlreadyTerminal,
}

/// Transient executor failures.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ExecutorError {
    #[error("executor unavailable: {0}")]
    Unavailable(String),

    #[error("executor call timed out after {0:?}")]
    Timeout(Duration),
}

/// Status notification from the executor.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunStatusChanged {
    pub run_id: RunId,
    pub status: RunStatus,
}

#[async_trait]
pub trait Executor: Send + Sync {
    /// Submit a run. Submitting an id the executor already knows is accepted
    /// without starting a second run.
    async fn submit_run(&self, request: RunRequest) -> Result<SubmitOutcome, ExecutorError>;

    async fn cancel_run(&self, run_id: RunId) -> Result<CancelOutcome, ExecutorError>;
}
