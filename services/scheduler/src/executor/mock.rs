//! Mock executor for testing and standalone runs.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use recur_events::RunStatus;
use recur_id::RunId;
use tokio::sync::mpsc;
use tracing::{debug, info};

use super::{CancelOutcome, Executor, ExecutorError, RunRequest, RunStatusChanged, SubmitOutcome};

/// A call observed by the mock, in arrival order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MockCall {
    Submit(RunId),
    Cancel(RunId),
}

#[derive(Default)]
struct MockState {
    runs: HashMap<RunId, (RunRequest, RunStatus)>,
    calls: Vec<MockCall>,
    fail_submits: u32,
    fail_cancels: u32,
    reject_reason: Option<String>,
}

/// Executor that keeps runs in memory and reports status on a channel.
pub struct MockExecutor {
    state: Arc<Mutex<MockState>>,
    notify: mpsc::UnboundedSender<RunStatusChanged>,
    /// Simulated run duration; `None` leaves runs pending until completed
    /// by hand.
    auto_complete: Option<Duration>,
}

fn lock(state: &Mutex<MockState>) -> MutexGuard<'_, MockState> {
    state.lock().unwrap_or_else(|e| e.into_inner())
}

impl MockExecutor {
    /// Create a mock executor and the receiving end of its notifications.
    pub fn new() -> (Self, mpsc::UnboundedReceiver<RunStatusChanged>) {
        let (notify, rx) = mpsc::unbounded_channel();
        let executor = Self {
            state: Arc::new(Mutex::new(MockState::default())),
            notify,
            auto_complete: None,
        };
        (executor, rx)
    }

    /// Run every accepted submission to success after `duration`.
    pub fn with_auto_complete(mut self, duration: Duration) -> Self {
        self.auto_complete = Some(duration);
        self
    }

    /// Fail the next `n` submissions with a transient error.
    pub fn fail_next_submits(&self, n: u32) {
        lock(&self.state).fail_submits = n;
    }

    /// Fail the next `n` cancellations with a transient error.
    pub fn fail_next_cancels(&self, n: u32) {
        lock(&self.state).fail_cancels = n;
    }

    /// Reject every submission with `reason` until cleared with `None`.
    pub fn reject_with(&self, reason: Option<&str>) {
        lock(&self.state).reject_reason = reason.map(str::to_string);
    }

    /// Move a known run to `status` and notify. Returns false for unknown
    /// runs and illegal transitions.
    pub fn complete(&self, run_id: RunId, status: RunStatus) -> bool {
        transition(&self.state, &self.notify, run_id, status)
    }

    pub fn calls(&self) -> Vec<MockCall> {
        lock(&self.state).calls.clone()
    }

    pub fn status_of(&self, run_id: RunId) -> Option<RunStatus> {
        lock(&self.state).runs.get(&run_id).map(|(_, status)| *status)
    }

    pub fn request_of(&self, run_id: RunId) -> Option<RunRequest> {
        lock(&self.state).runs.get(&run_id).map(|(req, _)| req.clone())
    }

    /// Number of distinct runs accepted.
    pub fn run_count(&self) -> usize {
        lock(&self.state).runs.len()
    }
}

fn transition(
    state: &Mutex<MockState>,
    notify: &mpsc::UnboundedSender<RunStatusChanged>,
    run_id: RunId,
    status: RunStatus,
) -> bool {
    {
        let mut state = lock(state);
        let Some((_, current)) = state.runs.get_mut(&run_id) else {
            return false;
        };
        if !current.can_transition_to(status) {
            return false;
        }
        *current = status;
    }

    debug!(run_id = %run_id, status = %status, "[MOCK] Run status changed");
    // The receiver going away only means nobody is listening any more.
    let _ = notify.send(RunStatusChanged { run_id, status });
    true
}

#[async_trait]
impl Executor for MockExecutor {
    async fn submit_run(&self, request: RunRequest) -> Result<SubmitOutcome, ExecutorError> {
        let run_id = request.run_id;
        {
            let mut state = lock(&self.state);
            state.calls.push(MockCall::Submit(run_id));

            if state.fail_submits > 0 {
                state.fail_submits -= 1;
                return Err(ExecutorError::Unavailable("injected submit failure".to_string()));
            }
            if let Some(reason) = &state.reject_reason {
                return Ok(SubmitOutcome::Rejected(reason.clone()));
            }
            if state.runs.contains_key(&run_id) {
                return Ok(SubmitOutcome::Accepted);
            }

            info!(
                run_id = %run_id,
                schedule = %request.schedule,
                scheduled_for = %request.scheduled_for,
                "[MOCK] Starting run"
            );
            state.runs.insert(run_id, (request, RunStatus::Pending));
        }

        if let Some(duration) = self.auto_complete {
            let state = Arc::clone(&self.state);
            let notify = self.notify.clone();
            tokio::spawn(async move {
                transition(&state, &notify, run_id, RunStatus::Running);
                tokio::time::sleep(duration).await;
                transition(&state, &notify, run_id, RunStatus::Succeeded);
            });
        }

        Ok(SubmitOutcome::Accepted)
    }

    async fn cancel_run(&self, run_id: RunId) -> Result<CancelOutcome, ExecutorError> {
        {
            let mut state = lock(&self.state);
            state.calls.push(MockCall::Cancel(run_id));

            if state.fail_cancels > 0 {
                state.fail_cancels -= 1;
                return Err(ExecutorError::Unavailable("injected cancel failure".to_string()));
            }
            match state.runs.get(&run_id) {
                None => return Ok(CancelOutcome::NotFound),
                Some((_, status)) if status.is_terminal() => {
                    return Ok(CancelOutcome::AlreadyTerminal)
                }
                Some(_) => {}
            }
        }

        info!(run_id = %run_id, "[MOCK] Cancelling run");
        transition(&self.state, &self.notify, run_id, RunStatus::Cancelled);
        Ok(CancelOutcome::Cancelled)
    }
}

#[cfg(test)]
mod tests {
    use chrono::DateTime;
    use recur_id::ScheduleKey;

    use super::*;

    fn request(secs: i64) -> RunRequest {
        let schedule = ScheduleKey::new("default", "mock").unwrap();
        let scheduled_for = DateTime::from_timestamp(secs, 0).unwrap();
        RunRequest {
            run_id: RunId::for_trigger(&schedule, scheduled_for.timestamp_millis()),
            schedule,
            scheduled_for,
            template: serde_json::json!({"image": "busybox"}),
        }
    }

    #[tokio::test]
    async fn test_submit_is_idempotent() {
        let (executor, _rx) = MockExecutor::new();
        let req = request(1_700_000_000);

        assert_eq!(executor.submit_run(req.clone()).await.unwrap(), SubmitOutcome::Accepted);
        assert_eq!(executor.submit_run(req.clone()).await.unwrap(), SubmitOutcome::Accepted);
        assert_eq!(executor.run_count(), 1);
        assert_eq!(executor.request_of(req.run_id).unwrap().template["image"], "busybox");
    }

    #[tokio::test]
    async fn test_cancel_outcomes_and_notifications() {
        let (executor, mut rx) = MockExecutor::new();
        let req = request(1_700_000_000);
        executor.submit_run(req.clone()).await.unwrap();

        assert_eq!(executor.cancel_run(req.run_id).await.unwrap(), CancelOutcome::Cancelled);
        assert_eq!(
            rx.recv().await.unwrap(),
            RunStatusChanged {
                run_id: req.run_id,
                status: RunStatus::Cancelled
            }
        );
        assert_eq!(
            executor.cancel_run(req.run_id).await.unwrap(),
            CancelOutcome::AlreadyTerminal
        );
        assert_eq!(
            executor.cancel_run(request(1).run_id).await.unwrap(),
            CancelOutcome::NotFound
        );
    }

    #[tokio::test]
    async fn test_scripted_failures_and_rejections() {
        let (executor, _rx) = MockExecutor::new();
        executor.fail_next_submits(1);
        assert!(executor.submit_run(request(10)).await.is_err());
        assert!(executor.submit_run(request(10)).await.is_ok());

        executor.reject_with(Some("quota exceeded"));
        assert_eq!(
            executor.submit_run(request(20)).await.unwrap(),
            SubmitOutcome::Rejected("quota exceeded".to_string())
        );
        executor.reject_with(None);

        executor.fail_next_cancels(1);
        assert!(executor.cancel_run(request(10).run_id).await.is_err());
    }

    #[tokio::test]
    async fn test_auto_complete_reports_lifecycle() {
        let (executor, mut rx) = MockExecutor::new();
        let executor = executor.with_auto_complete(Duration::from_millis(10));
        let req = request(1_700_000_000);
        executor.submit_run(req.clone()).await.unwrap();

        assert_eq!(rx.recv().await.unwrap().status, RunStatus::Running);
        assert_eq!(rx.recv().await.unwrap().status, RunStatus::Succeeded);
        assert_eq!(executor.status_of(req.run_id), Some(RunStatus::Succeeded));
        assert!(!executor.complete(req.run_id, RunStatus::Failed));
    }
}
