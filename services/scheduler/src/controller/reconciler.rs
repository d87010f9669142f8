//! Schedule reconciler.
//!
//! One pass converges one schedule:
//! 1. Apply buffered executor status changes to the schedule's run records
//! 2. Load the schedule; cascade deletion or suspend malformed specs
//! 3. Retry unaccepted submissions and re-issue pending cancellations
//! 4. Realize due trigger instants, gated by the concurrency policy
//! 5. Prune terminal history beyond the retention limits
//! 6. Write status, conditional on the version the pass started from
//!
//! Run ids are derived from `(schedule, instant)`, so a pass that is retried
//! after a lost status write finds its earlier runs instead of duplicating
//! them.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, TimeDelta, Utc};
use recur_events::{
    ControllerEvent, RetentionPrunedPayload, RunStatus, RunSupersededPayload, ScheduleDegradedPayload,
    ScheduleDeletedPayload, ScheduleInvalidPayload, SkipReason, TriggerFailedPayload,
    TriggerFailureKind, TriggerFiredPayload, TriggerSkippedPayload,
};
use recur_id::{PassId, RunId, ScheduleKey};
use recur_reconcile::{
    admit, Decision, ScheduleWindow, TriggerError, DEFAULT_MAX_CATCHUP,
    DEFAULT_MAX_SUBMIT_RETRIES, DEFAULT_RESYNC_INTERVAL,
};
use tracing::{debug, field, info, instrument, warn, Span};

use super::inbox::StatusInbox;
use crate::clock::Clock;
use crate::error::{ReconcileError, ReconcileResult};
use crate::events::{ControllerMetrics, EventEmitter, EventSink};
use crate::executor::{CancelOutcome, Executor, ExecutorError, RunRequest, SubmitOutcome};
use crate::model::{RunRecord, Schedule, SchedulePhase, ScheduleStatus, MAX_CANCEL_REISSUES};
use crate::retention;
use crate::store::{CreateOutcome, RunFilter, ScheduleStore, StoreError};

/// Reconciler tuning.
#[derive(Debug, Clone)]
pub struct ReconcilerConfig {
    /// Most elapsed instants realized in one pass.
    pub max_catchup: usize,

    /// Transient submit failures tolerated per instant before giving up.
    pub max_submit_retries: u32,

    /// Deadline for each store or executor call.
    pub call_timeout: Duration,

    /// Also the lag after which a schedule reports `Degraded`.
    pub resync_interval: Duration,
}

impl Default for ReconcilerConfig {
    fn default() -> Self {
        Self {
            max_catchup: DEFAULT_MAX_CATCHUP,
            max_submit_retries: DEFAULT_MAX_SUBMIT_RETRIES,
            call_timeout: Duration::from_secs(5),
            resync_interval: DEFAULT_RESYNC_INTERVAL,
        }
    }
}

/// Statistics from one reconciliation pass.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PassStats {
    pub fired: u64,
    pub skipped: u64,
    pub superseded: u64,
    pub pruned: u64,
    pub failed: u64,
    /// Executor status changes applied.
    pub transitions: u64,
    /// A submission failed transiently; retry with backoff.
    pub retry_pending: bool,
    /// Time until the next trigger, when the schedule is live.
    pub next_due_in: Option<Duration>,
}

impl PassStats {
    pub fn has_activity(&self) -> bool {
        self.fired + self.skipped + self.superseded + self.pruned + self.failed > 0
    }
}

enum Submission {
    Accepted,
    Failed,
    RetryLater,
}

/// Working state of one pass.
struct Pass<'a> {
    key: &'a ScheduleKey,
    id: PassId,
    now: DateTime<Utc>,
    stats: PassStats,
}

/// The schedule reconciler.
pub struct Reconciler {
    store: Arc<dyn ScheduleStore>,
    executor: Arc<dyn Executor>,
    events: EventEmitter,
    metrics: Arc<ControllerMetrics>,
    clock: Arc<dyn Clock>,
    inbox: Arc<StatusInbox>,
    config: ReconcilerConfig,
}

impl Reconciler {
    pub fn new(
        store: Arc<dyn ScheduleStore>,
        executor: Arc<dyn Executor>,
        sink: Arc<dyn EventSink>,
        metrics: Arc<ControllerMetrics>,
        clock: Arc<dyn Clock>,
        inbox: Arc<StatusInbox>,
        config: ReconcilerConfig,
    ) -> Self {
        Self {
            store,
            executor,
            events: EventEmitter::new(sink),
            metrics,
            clock,
            inbox,
            config,
        }
    }

    /// Run one pass for `key`.
    #[instrument(skip_all, fields(schedule = %key, pass_id = field::Empty, stage = field::Empty))]
    pub async fn reconcile(&self, key: &ScheduleKey) -> ReconcileResult<PassStats> {
        let mut pass = Pass {
            key,
            id: PassId::new(),
            now: self.clock.now(),
            stats: PassStats::default(),
        };
        Span::current().record("pass_id", field::display(pass.id));
        stage("evaluating");

        let changes = self.inbox.take(key);
        if let Err(e) = self.apply_status_changes(&mut pass, &changes).await {
            self.inbox.restore(key, changes);
            return Err(e);
        }

        let Some(schedule) = self.store_call(self.store.get_schedule(key)).await? else {
            self.cascade_delete(&mut pass).await?;
            return Ok(pass.stats);
        };

        if let Err(source) = schedule.spec.validate() {
            self.suspend_invalid(&mut pass, &schedule, source).await?;
            return Ok(pass.stats);
        }

        let mut runs = self
            .store_call(self.store.list_run_records(key, RunFilter::All))
            .await?;
        let mut status = schedule.status.clone();

        stage("applying");
        self.retry_outstanding(&mut pass, &schedule, &mut runs, &mut status)
            .await?;
        if schedule.spec.enabled && !pass.stats.retry_pending {
            self.realize_due(&mut pass, &schedule, &mut runs, &mut status)
                .await?;
        }
        self.prune_history(&mut pass, &schedule, &mut runs).await?;

        stage("reporting");
        self.write_status(&mut pass, &schedule, &runs, status).await?;

        stage("idle");
        Ok(pass.stats)
    }

    // -------------------------------------------------------------------------
    // Steps
    // -------------------------------------------------------------------------

    async fn apply_status_changes(
        &self,
        pass: &mut Pass<'_>,
        changes: &[crate::executor::RunStatusChanged],
    ) -> ReconcileResult<()> {
        for change in changes {
            let Some(mut record) = self
                .store_call(self.store.get_run_record(change.run_id))
                .await?
            else {
                debug!(run_id = %change.run_id, "Status change for unknown run");
                continue;
            };
            if record.schedule != *pass.key || record.status == change.status {
                continue;
            }
            if !record.status.can_transition_to(change.status) {
                warn!(
                    run_id = %record.id,
                    from = %record.status,
                    to = %change.status,
                    "Ignoring illegal run status transition"
                );
                continue;
            }

            debug!(run_id = %record.id, from = %record.status, to = %change.status, "Run status changed");
            record.status = change.status;
            if self.update_record(&record).await? {
                pass.stats.transitions += 1;
            }
        }
        Ok(())
    }

    /// The schedule is gone: cancel its live runs and remove every record.
    async fn cascade_delete(&self, pass: &mut Pass<'_>) -> ReconcileResult<()> {
        let runs = self
            .store_call(self.store.list_run_records(pass.key, RunFilter::All))
            .await?;
        if runs.is_empty() {
            self.inbox.take(pass.key);
            return Ok(());
        }

        stage("applying");
        let mut cancelled = Vec::new();
        for run in runs.iter().filter(|r| !r.is_terminal()) {
            let outcome = self.exec_call(self.executor.cancel_run(run.id)).await?;
            if outcome == CancelOutcome::Cancelled {
                cancelled.push(run.id);
            }
        }
        for run in &runs {
            self.store_call(self.store.delete_run_record(run.id)).await?;
        }
        self.inbox.take(pass.key);

        info!(
            cancelled = cancelled.len(),
            deleted = runs.len(),
            "Schedule deleted, run records removed"
        );
        self.emit(
            pass,
            ControllerEvent::ScheduleDeleted(ScheduleDeletedPayload {
                cancelled,
                deleted: runs.len(),
            }),
        );
        Ok(())
    }

    /// Park a malformed schedule in `Error` until its spec changes.
    async fn suspend_invalid(
        &self,
        pass: &mut Pass<'_>,
        schedule: &Schedule,
        source: TriggerError,
    ) -> ReconcileResult<()> {
        let hash = schedule.spec.spec_hash();
        if schedule.status.phase == SchedulePhase::Error
            && schedule.status.invalid_spec_hash.as_ref() == Some(&hash)
        {
            debug!("Spec unchanged since it was found malformed");
            return Ok(());
        }

        let err = ReconcileError::MalformedSpec {
            key: pass.key.clone(),
            source,
        };
        warn!(error = %err, "Suspending schedule with malformed spec");

        let mut status = schedule.status.clone();
        status.phase = SchedulePhase::Error;
        status.message = Some(err.to_string());
        status.invalid_spec_hash = Some(hash);
        status.next_trigger = None;
        status.last_reconciled_at = Some(pass.now);

        stage("reporting");
        self.store_call(
            self.store
                .update_schedule_status(pass.key, status, schedule.version),
        )
        .await?;
        self.emit(
            pass,
            ControllerEvent::ScheduleInvalid(ScheduleInvalidPayload {
                message: err.to_string(),
            }),
        );
        Ok(())
    }

    /// Finish work an earlier pass started.
    async fn retry_outstanding(
        &self,
        pass: &mut Pass<'_>,
        schedule: &Schedule,
        runs: &mut [RunRecord],
        status: &mut ScheduleStatus,
    ) -> ReconcileResult<()> {
        for record in runs.iter_mut() {
            if record.is_cancel_pending() {
                self.reissue_cancel(record).await?;
                continue;
            }
            if !schedule.spec.enabled || record.is_terminal() || record.submitted {
                continue;
            }

            debug!(run_id = %record.id, attempts = record.submit_attempts, "Resubmitting run");
            if let Submission::RetryLater = self.submit(pass, schedule, record, status).await? {
                pass.stats.retry_pending = true;
            }
        }
        Ok(())
    }

    async fn reissue_cancel(&self, record: &mut RunRecord) -> ReconcileResult<()> {
        match self.exec_call(self.executor.cancel_run(record.id)).await? {
            CancelOutcome::Cancelled => {
                debug!(run_id = %record.id, "Cancellation re-issued");
            }
            CancelOutcome::AlreadyTerminal => {
                // The terminal notification was lost; stop asking eventually.
                record.cancel_reissues += 1;
                if record.cancel_reissues >= MAX_CANCEL_REISSUES {
                    warn!(
                        run_id = %record.id,
                        reissues = record.cancel_reissues,
                        "No terminal status received, settling run as cancelled"
                    );
                    record.status = RunStatus::Cancelled;
                }
                self.update_record(record).await?;
            }
            CancelOutcome::NotFound => {
                // The executor never ran it; nothing will confirm.
                record.status = RunStatus::Cancelled;
                self.update_record(record).await?;
            }
        }
        Ok(())
    }

    async fn realize_due(
        &self,
        pass: &mut Pass<'_>,
        schedule: &Schedule,
        runs: &mut Vec<RunRecord>,
        status: &mut ScheduleStatus,
    ) -> ReconcileResult<()> {
        let max_catchup = if schedule.spec.catchup {
            self.config.max_catchup
        } else {
            self.config.max_catchup.min(1)
        };
        let due = schedule
            .spec
            .trigger
            .next_instants(&schedule.window(), status.last_trigger, pass.now, max_catchup)
            .map_err(|source| self.malformed(pass, source))?;

        if due.dropped > 0 {
            status.skipped_triggers += due.dropped;
            pass.stats.skipped += due.dropped;
            ControllerMetrics::add(&self.metrics.triggers_skipped, due.dropped);
            if let Some(latest) = due.latest_dropped {
                status.advance(latest);
                info!(
                    dropped = due.dropped,
                    latest_dropped = %latest,
                    "Missed triggers beyond the catch-up bound were skipped"
                );
                self.emit(
                    pass,
                    ControllerEvent::TriggerSkipped(TriggerSkippedPayload {
                        scheduled_for: latest,
                        count: due.dropped,
                        reason: SkipReason::CatchupExceeded,
                    }),
                );
            }
        }

        for instant in due.instants {
            let run_id = RunId::for_trigger(pass.key, instant.timestamp_millis());
            if runs.iter().any(|r| r.id == run_id) {
                debug!(run_id = %run_id, scheduled_for = %instant, "Trigger already realized");
                status.advance(instant);
                continue;
            }

            let active: Vec<RunId> = runs.iter().filter(|r| r.is_active()).map(|r| r.id).collect();
            match admit(schedule.spec.concurrency_policy, &active) {
                Decision::Reject => {
                    info!(
                        scheduled_for = %instant,
                        active = active.len(),
                        "Trigger skipped, a run is still active"
                    );
                    status.skipped_triggers += 1;
                    status.advance(instant);
                    pass.stats.skipped += 1;
                    ControllerMetrics::incr(&self.metrics.triggers_skipped);
                    self.emit(
                        pass,
                        ControllerEvent::TriggerSkipped(TriggerSkippedPayload {
                            scheduled_for: instant,
                            count: 1,
                            reason: SkipReason::ConcurrencyForbidden,
                        }),
                    );
                    continue;
                }
                Decision::AcceptAndSupersede(victims) => {
                    for victim in victims {
                        self.supersede(pass, runs, victim, run_id).await?;
                    }
                }
                Decision::Accept => {}
            }

            let mut record = RunRecord::new(pass.key.clone(), instant, pass.now);
            if let CreateOutcome::AlreadyExists(existing) = self
                .store_call(self.store.create_run_record(record.clone()))
                .await?
            {
                debug!(run_id = %existing.id, "Run record already exists");
                runs.push(existing);
                status.advance(instant);
                continue;
            }

            let outcome = self.submit(pass, schedule, &mut record, status).await?;
            runs.push(record);
            match outcome {
                Submission::Accepted | Submission::Failed => status.advance(instant),
                Submission::RetryLater => {
                    // Later instants wait until this one is resolved.
                    pass.stats.retry_pending = true;
                    break;
                }
            }
        }
        Ok(())
    }

    /// Request cancellation of an active run ahead of its successor.
    async fn supersede(
        &self,
        pass: &mut Pass<'_>,
        runs: &mut [RunRecord],
        victim: RunId,
        successor: RunId,
    ) -> ReconcileResult<()> {
        let Some(record) = runs.iter_mut().find(|r| r.id == victim) else {
            return Ok(());
        };

        let outcome = self.exec_call(self.executor.cancel_run(victim)).await?;
        record.cancel_requested_at = Some(pass.now);
        if outcome == CancelOutcome::NotFound {
            record.status = RunStatus::Cancelled;
        }
        self.update_record(record).await?;

        info!(run_id = %victim, superseded_by = %successor, "Superseding active run");
        pass.stats.superseded += 1;
        ControllerMetrics::incr(&self.metrics.runs_superseded);
        self.emit(
            pass,
            ControllerEvent::RunSuperseded(RunSupersededPayload {
                run_id: victim,
                superseded_by: successor,
            }),
        );
        Ok(())
    }

    async fn submit(
        &self,
        pass: &mut Pass<'_>,
        schedule: &Schedule,
        record: &mut RunRecord,
        status: &mut ScheduleStatus,
    ) -> ReconcileResult<Submission> {
        let request = RunRequest {
            run_id: record.id,
            schedule: record.schedule.clone(),
            scheduled_for: record.scheduled_for,
            template: schedule.spec.run_template.clone(),
        };

        match self.exec_call(self.executor.submit_run(request)).await {
            Ok(SubmitOutcome::Accepted) => {
                record.submitted = true;
                record.last_error = None;
                self.update_record(record).await?;

                info!(run_id = %record.id, scheduled_for = %record.scheduled_for, "Run fired");
                pass.stats.fired += 1;
                ControllerMetrics::incr(&self.metrics.runs_fired);
                self.emit(
                    pass,
                    ControllerEvent::TriggerFired(TriggerFiredPayload {
                        run_id: record.id,
                        scheduled_for: record.scheduled_for,
                        created_at: record.created_at,
                    }),
                );
                Ok(Submission::Accepted)
            }
            Ok(SubmitOutcome::Rejected(reason)) => {
                warn!(run_id = %record.id, reason = %reason, "Run rejected by executor");
                let message = format!("executor rejected run {}: {reason}", record.id);
                self.fail_trigger(pass, record, status, TriggerFailureKind::ExecutorRejected, message)
                    .await?;
                Ok(Submission::Failed)
            }
            Err(e) => {
                ControllerMetrics::incr(&self.metrics.transient_executor_errors);
                record.submit_attempts += 1;
                record.last_error = Some(e.to_string());

                if record.submit_attempts > self.config.max_submit_retries {
                    warn!(
                        run_id = %record.id,
                        attempts = record.submit_attempts,
                        error = %e,
                        "Run submission retries exhausted"
                    );
                    let reason = format!("gave up after {} attempts: {e}", record.submit_attempts);
                    self.fail_trigger(pass, record, status, TriggerFailureKind::RetriesExhausted, reason)
                        .await?;
                    Ok(Submission::Failed)
                } else {
                    warn!(
                        run_id = %record.id,
                        attempt = record.submit_attempts,
                        error = %e,
                        "Run submission failed, will retry"
                    );
                    self.update_record(record).await?;
                    Ok(Submission::RetryLater)
                }
            }
        }
    }

    async fn fail_trigger(
        &self,
        pass: &mut Pass<'_>,
        record: &mut RunRecord,
        status: &mut ScheduleStatus,
        kind: TriggerFailureKind,
        reason: String,
    ) -> ReconcileResult<()> {
        record.status = RunStatus::Failed;
        record.last_error = Some(reason.clone());
        self.update_record(record).await?;

        status.record_failed_trigger(record.scheduled_for, reason.clone());
        pass.stats.failed += 1;
        ControllerMetrics::incr(&self.metrics.triggers_failed);
        self.emit(
            pass,
            ControllerEvent::TriggerFailed(TriggerFailedPayload {
                run_id: record.id,
                scheduled_for: record.scheduled_for,
                attempts: record.submit_attempts,
                kind,
                reason,
            }),
        );
        Ok(())
    }

    async fn prune_history(
        &self,
        pass: &mut Pass<'_>,
        schedule: &Schedule,
        runs: &mut Vec<RunRecord>,
    ) -> ReconcileResult<()> {
        let deleted = retention::prune(
            self.store.as_ref(),
            runs,
            schedule.spec.retention_limits(),
            self.config.call_timeout,
        )
        .await?;
        if deleted.is_empty() {
            return Ok(());
        }

        runs.retain(|r| !deleted.contains(&r.id));
        debug!(pruned = deleted.len(), "Pruned run history");
        pass.stats.pruned += deleted.len() as u64;
        ControllerMetrics::add(&self.metrics.runs_pruned, deleted.len() as u64);
        self.emit(
            pass,
            ControllerEvent::RetentionPruned(RetentionPrunedPayload { deleted }),
        );
        Ok(())
    }

    async fn write_status(
        &self,
        pass: &mut Pass<'_>,
        schedule: &Schedule,
        runs: &[RunRecord],
        mut status: ScheduleStatus,
    ) -> ReconcileResult<()> {
        let window = schedule.window();

        let mut active: Vec<&RunRecord> = runs.iter().filter(|r| !r.is_terminal()).collect();
        active.sort_by_key(|r| r.scheduled_for);
        status.active_runs = active.iter().map(|r| r.id).collect();
        status.active_count = active.len();
        if let Some(latest) = runs
            .iter()
            .filter(|r| r.is_terminal())
            .max_by_key(|r| r.scheduled_for)
        {
            status.last_terminal_status = Some(latest.status);
        }

        status.next_trigger = schedule
            .spec
            .trigger
            .next_instant(&window, status.last_trigger)
            .map_err(|source| self.malformed(pass, source))?;

        let lag_limit = TimeDelta::from_std(self.config.resync_interval).unwrap_or(TimeDelta::zero());
        let (phase, message) = evaluate_phase(
            schedule.spec.enabled,
            &window,
            status.next_trigger,
            pass.now,
            lag_limit,
        );

        if phase == SchedulePhase::Degraded && schedule.status.phase != SchedulePhase::Degraded {
            if let Some(next) = status.next_trigger {
                let lag_secs = (pass.now - next).num_seconds();
                warn!(next_trigger = %next, lag_secs, "Schedule is lagging");
                self.emit(
                    pass,
                    ControllerEvent::ScheduleDegraded(ScheduleDegradedPayload {
                        next_trigger: next,
                        lag_secs,
                    }),
                );
            }
        }

        pass.stats.next_due_in = match phase {
            SchedulePhase::Enabled => status
                .next_trigger
                .and_then(|next| (next - pass.now).to_std().ok()),
            _ => None,
        };

        status.phase = phase;
        status.message = message;
        status.invalid_spec_hash = None;
        status.last_reconciled_at = Some(pass.now);

        let version = self
            .store_call(
                self.store
                    .update_schedule_status(pass.key, status, schedule.version),
            )
            .await?;
        debug!(version, phase = %phase, "Status written");
        Ok(())
    }

    // -------------------------------------------------------------------------
    // Helpers
    // -------------------------------------------------------------------------

    /// Update a record, reporting `false` if it no longer exists.
    async fn update_record(&self, record: &RunRecord) -> ReconcileResult<bool> {
        match self.store_call(self.store.update_run_record(record)).await {
            Ok(()) => Ok(true),
            Err(StoreError::RunNotFound(id)) => {
                debug!(run_id = %id, "Run record vanished before update");
                Ok(false)
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn store_call<T>(
        &self,
        call: impl Future<Output = Result<T, StoreError>>,
    ) -> Result<T, StoreError> {
        let timeout = self.config.call_timeout;
        tokio::time::timeout(timeout, call)
            .await
            .map_err(|_| StoreError::Timeout(timeout))?
    }

    async fn exec_call<T>(
        &self,
        call: impl Future<Output = Result<T, ExecutorError>>,
    ) -> Result<T, ExecutorError> {
        let timeout = self.config.call_timeout;
        tokio::time::timeout(timeout, call)
            .await
            .map_err(|_| ExecutorError::Timeout(timeout))?
    }

    fn malformed(&self, pass: &Pass<'_>, source: TriggerError) -> ReconcileError {
        ReconcileError::MalformedSpec {
            key: pass.key.clone(),
            source,
        }
    }

    fn emit(&self, pass: &Pass<'_>, event: ControllerEvent) {
        self.events.emit(pass.key, pass.id, pass.now, event);
    }
}

fn stage(name: &'static str) {
    Span::current().record("stage", name);
}

/// Phase of a schedule with a valid spec.
fn evaluate_phase(
    enabled: bool,
    window: &ScheduleWindow,
    next_trigger: Option<DateTime<Utc>>,
    now: DateTime<Utc>,
    lag_limit: TimeDelta,
) -> (SchedulePhase, Option<String>) {
    if !enabled {
        return (SchedulePhase::Disabled, None);
    }
    let Some(next) = next_trigger else {
        return (SchedulePhase::Ended, None);
    };
    if window.has_ended(now) {
        return (SchedulePhase::Ended, None);
    }
    if next < now - lag_limit {
        let lag = (now - next).num_seconds();
        return (
            SchedulePhase::Degraded,
            Some(format!("next trigger {next} is {lag}s behind")),
        );
    }
    (SchedulePhase::Enabled, None)
}
