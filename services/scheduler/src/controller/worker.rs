//! Controller worker pool.
//!
//! Runs the dispatcher and a fixed number of workers draining the work queue
//! until shutdown is signaled, then gives in-flight passes a grace period to
//! finish.

use std::sync::Arc;
use std::time::Duration;

use recur_id::ScheduleKey;
use recur_reconcile::BackoffPolicy;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinSet;
use tracing::{debug, error, info, instrument, warn};

use super::dispatcher::Dispatcher;
use super::inbox::StatusInbox;
use super::queue::WorkQueue;
use super::reconciler::{Reconciler, ReconcilerConfig};
use crate::clock::Clock;
use crate::error::{ReconcileError, Requeue};
use crate::events::{ControllerMetrics, EventSink};
use crate::executor::{Executor, RunStatusChanged};
use crate::store::ScheduleStore;

/// Controller configuration.
#[derive(Debug, Clone)]
pub struct ControllerConfig {
    /// Concurrent reconciliation passes.
    pub workers: usize,

    /// How long in-flight passes get to finish on shutdown.
    pub shutdown_grace: Duration,

    /// Requeue backoff for failed passes.
    pub backoff: BackoffPolicy,

    pub reconciler: ReconcilerConfig,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            workers: 4,
            shutdown_grace: Duration::from_secs(10),
            backoff: BackoffPolicy::default(),
            reconciler: ReconcilerConfig::default(),
        }
    }
}

/// The schedule controller.
pub struct Controller {
    store: Arc<dyn ScheduleStore>,
    executor: Arc<dyn Executor>,
    sink: Arc<dyn EventSink>,
    clock: Arc<dyn Clock>,
    metrics: Arc<ControllerMetrics>,
    config: ControllerConfig,
}

impl Controller {
    pub fn new(
        store: Arc<dyn ScheduleStore>,
        executor: Arc<dyn Executor>,
        sink: Arc<dyn EventSink>,
        clock: Arc<dyn Clock>,
        config: ControllerConfig,
    ) -> Self {
        Self {
            store,
            executor,
            sink,
            clock,
            metrics: Arc::new(ControllerMetrics::default()),
            config,
        }
    }

    pub fn metrics(&self) -> Arc<ControllerMetrics> {
        Arc::clone(&self.metrics)
    }

    /// Run the controller until shutdown is signaled.
    #[instrument(skip_all)]
    pub async fn run(
        self,
        notifications: mpsc::UnboundedReceiver<RunStatusChanged>,
        mut shutdown: watch::Receiver<bool>,
    ) {
        let config = self.config;
        let queue = Arc::new(WorkQueue::new(config.backoff.clone()));
        let inbox = Arc::new(StatusInbox::new());
        let reconciler = Arc::new(Reconciler::new(
            Arc::clone(&self.store),
            self.executor,
            self.sink,
            Arc::clone(&self.metrics),
            self.clock,
            Arc::clone(&inbox),
            config.reconciler.clone(),
        ));

        let dispatcher = Dispatcher::new(
            self.store,
            Arc::clone(&queue),
            inbox,
            config.reconciler.resync_interval,
            config.reconciler.call_timeout,
        );
        let dispatcher_handle = tokio::spawn(dispatcher.run(notifications, shutdown.clone()));

        let worker_count = config.workers.max(1);
        let mut workers = JoinSet::new();
        for id in 0..worker_count {
            workers.spawn(worker_loop(
                id,
                Arc::clone(&queue),
                Arc::clone(&reconciler),
                Arc::clone(&self.metrics),
                config.reconciler.resync_interval,
            ));
        }
        info!(workers = worker_count, "Controller started");

        loop {
            if *shutdown.borrow() {
                break;
            }
            if shutdown.changed().await.is_err() {
                break;
            }
        }

        info!("Controller shutting down");
        queue.shut_down();

        let drained = tokio::time::timeout(config.shutdown_grace, async {
            while let Some(result) = workers.join_next().await {
                if let Err(e) = result {
                    error!(error = %e, "Worker task failed");
                }
            }
        })
        .await;
        if drained.is_err() {
            warn!(
                remaining = workers.len(),
                grace_secs = config.shutdown_grace.as_secs(),
                "Workers did not drain in time, aborting"
            );
            workers.abort_all();
        }

        if tokio::time::timeout(config.shutdown_grace, dispatcher_handle)
            .await
            .is_err()
        {
            warn!("Dispatcher did not shut down in time");
        }

        info!("Controller shutdown complete");
    }
}

async fn worker_loop(
    id: usize,
    queue: Arc<WorkQueue<ScheduleKey>>,
    reconciler: Arc<Reconciler>,
    metrics: Arc<ControllerMetrics>,
    resync_interval: Duration,
) {
    debug!(worker = id, "Worker started");
    while let Some(key) = queue.get().await {
        process(&queue, &reconciler, &metrics, resync_interval, &key).await;
        queue.done(&key);
    }
    debug!(worker = id, "Worker stopped");
}

async fn process(
    queue: &Arc<WorkQueue<ScheduleKey>>,
    reconciler: &Reconciler,
    metrics: &ControllerMetrics,
    resync_interval: Duration,
    key: &ScheduleKey,
) {
    ControllerMetrics::incr(&metrics.passes);

    match reconciler.reconcile(key).await {
        Ok(stats) => {
            if stats.retry_pending {
                queue.add_rate_limited(key.clone());
            } else {
                queue.forget(key);
                // Triggers due before the next resync get their own wakeup.
                if let Some(due) = stats.next_due_in.filter(|d| *d < resync_interval) {
                    queue.add_after(key.clone(), due);
                }
            }

            if stats.has_activity() {
                info!(
                    schedule = %key,
                    fired = stats.fired,
                    skipped = stats.skipped,
                    superseded = stats.superseded,
                    pruned = stats.pruned,
                    failed = stats.failed,
                    "Reconciliation pass complete"
                );
            }
        }
        Err(e) => {
            ControllerMetrics::incr(&metrics.pass_errors);
            match &e {
                ReconcileError::TransientStore(_) => {
                    ControllerMetrics::incr(&metrics.transient_store_errors)
                }
                ReconcileError::TransientExecutor(_) => {
                    ControllerMetrics::incr(&metrics.transient_executor_errors)
                }
                ReconcileError::VersionConflict(_) => {
                    ControllerMetrics::incr(&metrics.version_conflicts)
                }
                ReconcileError::MalformedSpec { .. } => {}
            }

            match e.requeue() {
                Requeue::Immediate => {
                    debug!(schedule = %key, error = %e, "Retrying pass");
                    queue.add(key.clone());
                }
                Requeue::Backoff => {
                    warn!(
                        schedule = %key,
                        attempt = queue.num_requeues(key) + 1,
                        error = %e,
                        "Reconciliation failed, requeueing with backoff"
                    );
                    queue.add_rate_limited(key.clone());
                }
                Requeue::Never => {
                    warn!(schedule = %key, error = %e, "Reconciliation failed permanently");
                    queue.forget(key);
                }
            }
        }
    }
}
