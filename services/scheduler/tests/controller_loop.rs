//! End-to-end tests of the running controller: dispatcher, work queue and
//! workers together, with the mock executor completing runs on its own.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, TimeDelta, Utc};
use recur_events::{event_types, RunStatus};
use recur_id::{RunId, ScheduleKey};
use recur_reconcile::{BackoffPolicy, TriggerSpec};
use recur_scheduler::executor::{CancelOutcome, ExecutorError, RunRequest, SubmitOutcome};
use recur_scheduler::{
    Controller, ControllerConfig, Executor, FakeClock, InMemoryStore, MemoryEventSink,
    MockExecutor, ReconcilerConfig, RunStatusChanged, ScheduleSpec,
};
use tokio::sync::{mpsc, watch, Notify};
use tokio::task::JoinHandle;

struct Running {
    clock: FakeClock,
    store: Arc<InMemoryStore>,
    sink: Arc<MemoryEventSink>,
    shutdown: watch::Sender<bool>,
    handle: JoinHandle<()>,
}

/// Holds every submission for `delay`, announcing when one starts.
struct SlowExecutor {
    inner: MockExecutor,
    delay: Duration,
    started: Arc<Notify>,
}

#[async_trait]
impl Executor for SlowExecutor {
    async fn submit_run(&self, request: RunRequest) -> Result<SubmitOutcome, ExecutorError> {
        self.started.notify_one();
        tokio::time::sleep(self.delay).await;
        self.inner.submit_run(request).await
    }

    async fn cancel_run(&self, run_id: RunId) -> Result<CancelOutcome, ExecutorError> {
        self.inner.cancel_run(run_id).await
    }
}

fn t0() -> DateTime<Utc> {
    DateTime::from_timestamp(1_700_000_000, 0).unwrap()
}

fn key(name: &str) -> ScheduleKey {
    ScheduleKey::new("default", name).unwrap()
}

fn config() -> ControllerConfig {
    ControllerConfig {
        workers: 2,
        shutdown_grace: Duration::from_secs(1),
        backoff: BackoffPolicy::fixed(Duration::from_millis(10), Duration::from_millis(100)),
        reconciler: ReconcilerConfig {
            resync_interval: Duration::from_millis(100),
            call_timeout: Duration::from_secs(1),
            ..ReconcilerConfig::default()
        },
    }
}

fn start() -> Running {
    let (executor, notifications) = MockExecutor::new();
    let executor = executor.with_auto_complete(Duration::from_millis(20));
    launch(Arc::new(executor), notifications, config())
}

fn launch(
    executor: Arc<dyn Executor>,
    notifications: mpsc::UnboundedReceiver<RunStatusChanged>,
    config: ControllerConfig,
) -> Running {
    let clock = FakeClock::new(t0());
    let store = Arc::new(InMemoryStore::new(Arc::new(clock.clone())));
    let sink = Arc::new(MemoryEventSink::new());
    let controller = Controller::new(
        store.clone(),
        executor,
        sink.clone(),
        Arc::new(clock.clone()),
        config,
    );

    let (shutdown, shutdown_rx) = watch::channel(false);
    let handle = tokio::spawn(controller.run(notifications, shutdown_rx));
    Running {
        clock,
        store,
        sink,
        shutdown,
        handle,
    }
}

/// Start with submissions held for `delay` and wait until the first pass is
/// inside one.
async fn start_mid_submission(delay: Duration, config: ControllerConfig) -> (Running, ScheduleKey) {
    let (inner, notifications) = MockExecutor::new();
    let started = Arc::new(Notify::new());
    let executor = SlowExecutor {
        inner,
        delay,
        started: started.clone(),
    };
    let running = launch(Arc::new(executor), notifications, config);

    let schedule = key("slow-submit");
    running
        .store
        .apply_schedule(schedule.clone(), ScheduleSpec::new(TriggerSpec::every(60)));
    running.clock.advance(TimeDelta::seconds(60));
    tokio::time::timeout(Duration::from_secs(2), started.notified())
        .await
        .expect("no submission started");
    (running, schedule)
}

/// Poll `check` until it holds or two seconds pass.
async fn eventually(mut check: impl FnMut() -> bool) -> bool {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
    while tokio::time::Instant::now() < deadline {
        if check() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    check()
}

async fn stop(running: Running) {
    running.shutdown.send(true).unwrap();
    tokio::time::timeout(Duration::from_secs(3), running.handle)
        .await
        .expect("controller did not stop")
        .unwrap();
}

#[tokio::test]
async fn test_controller_fires_and_tracks_runs_to_completion() {
    let running = start();
    let schedule = key("hourly-sync");
    running
        .store
        .apply_schedule(schedule.clone(), ScheduleSpec::new(TriggerSpec::every(60)));

    running.clock.advance(TimeDelta::seconds(125));

    // Resync picks up the elapsed instants.
    assert!(eventually(|| running.store.runs(&schedule).len() == 2).await);

    // Auto-completed runs flow back through the inbox.
    assert!(
        eventually(|| {
            running.store.schedule(&schedule).is_some_and(|s| {
                s.status.active_count == 0
                    && s.status.last_terminal_status == Some(RunStatus::Succeeded)
            })
        })
        .await
    );
    assert!(running
        .store
        .runs(&schedule)
        .iter()
        .all(|r| r.status == RunStatus::Succeeded));
    assert_eq!(running.sink.of_type(event_types::TRIGGER_FIRED).len(), 2);

    stop(running).await;
}

#[tokio::test]
async fn test_controller_cascades_schedule_deletion() {
    let running = start();
    let schedule = key("cleanup");
    running
        .store
        .apply_schedule(schedule.clone(), ScheduleSpec::new(TriggerSpec::every(60)));
    running.clock.advance(TimeDelta::seconds(60));
    assert!(eventually(|| running.store.runs(&schedule).len() == 1).await);

    running.store.delete_schedule(&schedule);
    assert!(eventually(|| running.store.runs(&schedule).is_empty()).await);
    assert!(
        eventually(|| !running
            .sink
            .of_type(event_types::SCHEDULE_DELETED)
            .is_empty())
        .await
    );

    stop(running).await;
}

#[tokio::test]
async fn test_shutdown_lets_in_flight_pass_finish_within_grace() {
    let (running, schedule) = start_mid_submission(Duration::from_millis(200), config()).await;

    running.shutdown.send(true).unwrap();
    tokio::time::timeout(Duration::from_secs(3), running.handle)
        .await
        .expect("controller did not stop")
        .unwrap();

    let status = running.store.schedule(&schedule).unwrap().status;
    assert_eq!(status.last_trigger, Some(t0() + TimeDelta::seconds(60)));
    let runs = running.store.runs(&schedule);
    assert_eq!(runs.len(), 1);
    assert!(runs[0].submitted);
}

#[tokio::test]
async fn test_shutdown_aborts_passes_outliving_grace() {
    let mut config = config();
    config.shutdown_grace = Duration::from_millis(100);
    config.reconciler.call_timeout = Duration::from_secs(30);
    let (running, schedule) = start_mid_submission(Duration::from_secs(10), config).await;

    let stopping = tokio::time::Instant::now();
    running.shutdown.send(true).unwrap();
    tokio::time::timeout(Duration::from_secs(2), running.handle)
        .await
        .expect("controller waited for the stuck pass")
        .unwrap();
    assert!(stopping.elapsed() < Duration::from_secs(2));

    // The aborted pass never reached its status write.
    let status = running.store.schedule(&schedule).unwrap().status;
    assert_eq!(status.last_trigger, None);
    assert!(running.store.runs(&schedule).iter().all(|r| !r.submitted));
}

#[tokio::test]
async fn test_controller_stops_promptly_when_idle() {
    let running = start();
    tokio::time::sleep(Duration::from_millis(50)).await;
    stop(running).await;
}
