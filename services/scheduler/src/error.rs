//! Reconciliation error taxonomy.

use recur_id::ScheduleKey;
use recur_reconcile::TriggerError;
use thiserror::Error;

use crate::executor::ExecutorError;
use crate::store::StoreError;

/// Result type for reconciliation.
pub type ReconcileResult<T> = Result<T, ReconcileError>;

/// Errors that can occur during a reconciliation pass.
#[derive(Debug, Clone, Error)]
pub enum ReconcileError {
    #[error("store error: {0}")]
    TransientStore(#[source] StoreError),

    #[error("executor error: {0}")]
    TransientExecutor(#[source] ExecutorError),

    #[error("status write for {0} lost a version race")]
    VersionConflict(ScheduleKey),

    #[error("malformed spec: {source}")]
    MalformedSpec {
        key: ScheduleKey,
        #[source]
        source: TriggerError,
    },
}

/// How the worker should requeue a key after a failed pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Requeue {
    /// Retry promptly.
    Immediate,
    /// Retry with per-key exponential backoff.
    Backoff,
    /// Nothing to retry until the schedule changes.
    Never,
}

impl ReconcileError {
    pub fn requeue(&self) -> Requeue {
        match self {
            Self::VersionConflict(_) => Requeue::Immediate,
            Self::TransientStore(_) | Self::TransientExecutor(_) => Requeue::Backoff,
            Self::MalformedSpec { .. } => Requeue::Never,
        }
    }
}

impl From<StoreError> for ReconcileError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::VersionConflict { key, .. } => Self::VersionConflict(key),
            other => Self::TransientStore(other),
        }
    }
}

impl From<ExecutorError> for ReconcileError {
    fn from(err: ExecutorError) -> Self {
        Self::TransientExecutor(err)
    }
}
