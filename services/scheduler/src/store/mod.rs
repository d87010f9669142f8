//! Schedule store interface.
//!
//! The store is the single source of truth for schedules and run records.
//! The controller holds no durable state of its own; after a restart it
//! rebuilds its work queue from [`ScheduleStore::list_schedules`].

mod memory;

use std::time::Duration;

use async_trait::async_trait;
use recur_id::{RunId, ScheduleKey};
use thiserror::Error;
use tokio::sync::broadcast;

use crate::model::{RunRecord, Schedule, ScheduleStatus};

pub use memory::{InMemoryStore, WATCH_CAPACITY};

/// Errors returned by store operations.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StoreError {
    #[error("schedule {0} not found")]
    ScheduleNotFound(ScheduleKey),

    #[error("run record {0} not found")]
    RunNotFound(RunId),

    #[error("version conflict on {key}: expected {expected}, found {actual}")]
    VersionConflict {
        key: ScheduleKey,
        expected: u64,
        actual: u64,
    },

    #[error("store unavailable: {0}")]
    Unavailable(String),

    #[error("store call timed out after {0:?}")]
    Timeout(Duration),
}

impl StoreError {
    /// Whether retrying the same call later may succeed.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Unavailable(_) | Self::Timeout(_))
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum CreateOutcome {
    Created,
    /// A record with the same id exists; it is returned unchanged.
    AlreadyExists(RunRecord),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeleteOutcome {
    Deleted,
    NotFound,
}

/// Which run records of a schedule to list.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum RunFilter {
    #[default]
    All,
    NonTerminal,
    Terminal,
}

impl RunFilter {
    pub fn matches(&self, record: &RunRecord) -> bool {
        match self {
            Self::All => true,
            Self::NonTerminal => !record.is_terminal(),
            Self::Terminal => record.is_terminal(),
        }
    }
}

/// Change feed entry. Status writes are not reported.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ScheduleWatchEvent {
    Applied(ScheduleKey),
    Deleted(ScheduleKey),
}

impl ScheduleWatchEvent {
    pub fn key(&self) -> &ScheduleKey {
        match self {
            Self::Applied(key) | Self::Deleted(key) => key,
        }
    }
}

/// Persistent schedule and run record storage.
#[async_trait]
pub trait ScheduleStore: Send + Sync {
    /// Fetch a schedule; `None` once it has been deleted.
    async fn get_schedule(&self, key: &ScheduleKey) -> Result<Option<Schedule>, StoreError>;

    async fn list_schedules(&self) -> Result<Vec<ScheduleKey>, StoreError>;

    /// Run records owned by `key`, ordered by scheduled time.
    async fn list_run_records(
        &self,
        key: &ScheduleKey,
        filter: RunFilter,
    ) -> Result<Vec<RunRecord>, StoreError>;

    async fn get_run_record(&self, id: RunId) -> Result<Option<RunRecord>, StoreError>;

    async fn create_run_record(&self, record: RunRecord) -> Result<CreateOutcome, StoreError>;

    /// Replace an existing record. Fails with `RunNotFound` if it is gone.
    async fn update_run_record(&self, record: &RunRecord) -> Result<(), StoreError>;

    /// Write status if the schedule is still at `expected_version`.
    ///
    /// Returns the new version.
    async fn update_schedule_status(
        &self,
        key: &ScheduleKey,
        status: ScheduleStatus,
        expected_version: u64,
    ) -> Result<u64, StoreError>;

    async fn delete_run_record(&self, id: RunId) -> Result<DeleteOutcome, StoreError>;

    /// Subscribe to spec changes and deletions.
    fn watch(&self) -> broadcast::Receiver<ScheduleWatchEvent>;
}
