//! Applies retention plans to the store.

use std::time::Duration;

use recur_id::RunId;
use recur_reconcile::{plan_prune, RetentionLimits};
use tracing::debug;

use crate::model::RunRecord;
use crate::store::{DeleteOutcome, ScheduleStore, StoreError};

/// Delete the terminal records that fall outside `limits`.
///
/// Records already gone count as deleted, so running this twice is a no-op
/// the second time.
pub async fn prune(
    store: &dyn ScheduleStore,
    records: &[RunRecord],
    limits: RetentionLimits,
    call_timeout: Duration,
) -> Result<Vec<RunId>, StoreError> {
    let doomed = plan_prune(records, limits, |r| {
        r.retention_class().map(|class| (class, r.scheduled_for))
    });

    let mut deleted = Vec::with_capacity(doomed.len());
    for record in doomed {
        let outcome = tokio::time::timeout(call_timeout, store.delete_run_record(record.id))
            .await
            .map_err(|_| StoreError::Timeout(call_timeout))??;
        if outcome == DeleteOutcome::NotFound {
            debug!(run_id = %record.id, "Pruned run record already gone");
        }
        deleted.push(record.id);
    }
    Ok(deleted)
}
