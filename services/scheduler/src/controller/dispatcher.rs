//! Turns store watch events, executor notifications and resync ticks into
//! work queue entries.

use std::sync::Arc;
use std::time::Duration;

use recur_id::ScheduleKey;
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, instrument, warn};

use super::inbox::StatusInbox;
use super::queue::WorkQueue;
use crate::executor::RunStatusChanged;
use crate::store::{ScheduleStore, StoreError};

pub struct Dispatcher {
    store: Arc<dyn ScheduleStore>,
    queue: Arc<WorkQueue<ScheduleKey>>,
    inbox: Arc<StatusInbox>,
    resync_interval: Duration,
    call_timeout: Duration,
    /// Notifications whose owner could not be looked up yet.
    unresolved: Vec<RunStatusChanged>,
}

impl Dispatcher {
    pub fn new(
        store: Arc<dyn ScheduleStore>,
        queue: Arc<WorkQueue<ScheduleKey>>,
        inbox: Arc<StatusInbox>,
        resync_interval: Duration,
        call_timeout: Duration,
    ) -> Self {
        Self {
            store,
            queue,
            inbox,
            resync_interval,
            call_timeout,
            unresolved: Vec::new(),
        }
    }

    /// Dispatch until shutdown is signaled.
    #[instrument(skip_all)]
    pub async fn run(
        mut self,
        mut notifications: mpsc::UnboundedReceiver<RunStatusChanged>,
        mut shutdown: watch::Receiver<bool>,
    ) {
        info!(
            resync_interval_secs = self.resync_interval.as_secs(),
            "Starting dispatcher"
        );

        // Subscribe before the initial resync so no change falls in between.
        let mut changes = self.store.watch();
        self.resync().await;

        let mut ticker = tokio::time::interval(self.resync_interval);
        ticker.tick().await;

        loop {
            tokio::select! {
                event = changes.recv() => match event {
                    Ok(event) => {
                        debug!(schedule = %event.key(), "Schedule changed");
                        self.queue.add(event.key().clone());
                    }
                    Err(RecvError::Lagged(missed)) => {
                        warn!(missed, "Watch feed lagged, resyncing");
                        self.resync().await;
                    }
                    Err(RecvError::Closed) => {
                        warn!("Watch feed closed, dispatcher stopping");
                        break;
                    }
                },
                Some(change) = notifications.recv() => {
                    self.route(change).await;
                }
                _ = ticker.tick() => {
                    self.resync().await;
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        info!("Dispatcher shutting down");
                        break;
                    }
                }
            }
        }
    }

    /// Enqueue every schedule in the store.
    pub async fn resync(&mut self) {
        let pending = std::mem::take(&mut self.unresolved);
        for change in pending {
            self.route(change).await;
        }

        match self.list_schedules().await {
            Ok(keys) => {
                debug!(schedules = keys.len(), "Resync");
                for key in keys {
                    self.queue.add(key);
                }
            }
            Err(e) => warn!(error = %e, "Resync failed to list schedules"),
        }
    }

    /// Park a status change with its owning schedule and enqueue the owner.
    pub async fn route(&mut self, change: RunStatusChanged) {
        let lookup = tokio::time::timeout(self.call_timeout, self.store.get_run_record(change.run_id))
            .await
            .map_err(|_| StoreError::Timeout(self.call_timeout))
            .and_then(|r| r);

        match lookup {
            Ok(Some(record)) => {
                self.inbox.push(record.schedule.clone(), change);
                self.queue.add(record.schedule);
            }
            Ok(None) => {
                debug!(run_id = %change.run_id, "Dropping status change for unknown run");
            }
            Err(e) => {
                warn!(run_id = %change.run_id, error = %e, "Could not resolve run owner, will retry");
                self.unresolved.push(change);
            }
        }
    }

    async fn list_schedules(&self) -> Result<Vec<ScheduleKey>, StoreError> {
        tokio::time::timeout(self.call_timeout, self.store.list_schedules())
            .await
            .map_err(|_| StoreError::Timeout(self.call_timeout))?
    }
}
