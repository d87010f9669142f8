//! In-memory schedule store.
//!
//! Backs the standalone binary and tests. Also carries the API-side writes
//! (`apply_schedule`, `delete_schedule`) and fault injection hooks.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use recur_id::{RunId, ScheduleKey};
use tokio::sync::broadcast;
use tracing::debug;

use super::{
    CreateOutcome, DeleteOutcome, RunFilter, ScheduleStore, ScheduleWatchEvent, StoreError,
};
use crate::clock::{Clock, SystemClock};
use crate::model::{RunRecord, Schedule, ScheduleSpec, ScheduleStatus};

/// Watch events buffered per subscriber before it lags.
pub const WATCH_CAPACITY: usize = 1024;

#[derive(Default)]
struct Inner {
    schedules: HashMap<ScheduleKey, Schedule>,
    runs: HashMap<RunId, RunRecord>,
    next_version: u64,
    runs_created: u64,
    status_writes: u64,
}

impl Inner {
    fn bump_version(&mut self) -> u64 {
        self.next_version += 1;
        self.next_version
    }
}

#[derive(Default)]
struct Faults {
    status_conflicts: u32,
    unavailable_calls: u32,
}

/// Store holding everything in process memory.
pub struct InMemoryStore {
    inner: Mutex<Inner>,
    faults: Mutex<Faults>,
    watch_tx: broadcast::Sender<ScheduleWatchEvent>,
    clock: Arc<dyn Clock>,
}

impl InMemoryStore {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        let (watch_tx, _) = broadcast::channel(WATCH_CAPACITY);
        Self {
            inner: Mutex::new(Inner::default()),
            faults: Mutex::new(Faults::default()),
            watch_tx,
            clock,
        }
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn faults(&self) -> MutexGuard<'_, Faults> {
        self.faults.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn check_available(&self) -> Result<(), StoreError> {
        let mut faults = self.faults();
        if faults.unavailable_calls > 0 {
            faults.unavailable_calls -= 1;
            return Err(StoreError::Unavailable("injected fault".to_string()));
        }
        Ok(())
    }

    fn publish(&self, event: ScheduleWatchEvent) {
        // No subscribers is fine.
        let _ = self.watch_tx.send(event);
    }

    // -------------------------------------------------------------------------
    // API-side writes
    // -------------------------------------------------------------------------

    /// Create a schedule or replace its spec, keeping status and creation time.
    pub fn apply_schedule(&self, key: ScheduleKey, spec: ScheduleSpec) -> Schedule {
        let schedule = {
            let mut inner = self.lock();
            let version = inner.bump_version();
            let now = self.clock.now();
            let schedule = inner
                .schedules
                .entry(key.clone())
                .and_modify(|s| {
                    s.spec = spec.clone();
                    s.version = version;
                })
                .or_insert_with(|| Schedule {
                    key: key.clone(),
                    version,
                    created_at: now,
                    spec,
                    status: ScheduleStatus::default(),
                });
            schedule.clone()
        };

        debug!(schedule = %key, version = schedule.version, "Schedule applied");
        self.publish(ScheduleWatchEvent::Applied(key));
        schedule
    }

    /// Remove a schedule. Its run records are left for the controller to
    /// cascade.
    pub fn delete_schedule(&self, key: &ScheduleKey) -> bool {
        let removed = self.lock().schedules.remove(key).is_some();
        if removed {
            debug!(schedule = %key, "Schedule deleted");
            self.publish(ScheduleWatchEvent::Deleted(key.clone()));
        }
        removed
    }

    // -------------------------------------------------------------------------
    // Inspection
    // -------------------------------------------------------------------------

    pub fn schedule(&self, key: &ScheduleKey) -> Option<Schedule> {
        self.lock().schedules.get(key).cloned()
    }

    /// All run records of a schedule, ordered by scheduled time.
    pub fn runs(&self, key: &ScheduleKey) -> Vec<RunRecord> {
        let inner = self.lock();
        collect_runs(&inner, key, RunFilter::All)
    }

    /// Number of run records ever created.
    pub fn runs_created(&self) -> u64 {
        self.lock().runs_created
    }

    /// Number of successful status writes.
    pub fn status_writes(&self) -> u64 {
        self.lock().status_writes
    }

    // -------------------------------------------------------------------------
    // Fault injection
    // -------------------------------------------------------------------------

    /// Fail the next `n` status writes with a version conflict.
    pub fn conflict_next_status_writes(&self, n: u32) {
        self.faults().status_conflicts = n;
    }

    /// Fail the next `n` store calls as unavailable.
    pub fn fail_next_calls(&self, n: u32) {
        self.faults().unavailable_calls = n;
    }
}

impl Default for InMemoryStore {
    fn default() -> Self {
        Self::new(Arc::new(SystemClock))
    }
}

fn collect_runs(inner: &Inner, key: &ScheduleKey, filter: RunFilter) -> Vec<RunRecord> {
    let mut runs: Vec<RunRecord> = inner
        .runs
        .values()
        .filter(|r| &r.schedule == key && filter.matches(r))
        .cloned()
        .collect();
    runs.sort_by_key(|r| (r.scheduled_for, r.id));
    runs
}

#[async_trait]
impl ScheduleStore for InMemoryStore {
    async fn get_schedule(&self, key: &ScheduleKey) -> Result<Option<Schedule>, StoreError> {
        self.check_available()?;
        Ok(self.lock().schedules.get(key).cloned())
    }

    async fn list_schedules(&self) -> Result<Vec<ScheduleKey>, StoreError> {
        self.check_available()?;
        let mut keys: Vec<ScheduleKey> = self.lock().schedules.keys().cloned().collect();
        keys.sort();
        Ok(keys)
    }

    async fn list_run_records(
        &self,
        key: &ScheduleKey,
        filter: RunFilter,
    ) -> Result<Vec<RunRecord>, StoreError> {
        self.check_available()?;
        let inner = self.lock();
        Ok(collect_runs(&inner, key, filter))
    }

    async fn get_run_record(&self, id: RunId) -> Result<Option<RunRecord>, StoreError> {
        self.check_available()?;
        Ok(self.lock().runs.get(&id).cloned())
    }

    async fn create_run_record(&self, record: RunRecord) -> Result<CreateOutcome, StoreError> {
        self.check_available()?;
        let mut inner = self.lock();
        if let Some(existing) = inner.runs.get(&record.id) {
            return Ok(CreateOutcome::AlreadyExists(existing.clone()));
        }
        inner.runs.insert(record.id, record);
        inner.runs_created += 1;
        Ok(CreateOutcome::Created)
    }

    async fn update_run_record(&self, record: &RunRecord) -> Result<(), StoreError> {
        self.check_available()?;
        let mut inner = self.lock();
        match inner.runs.get_mut(&record.id) {
            Some(slot) => {
                *slot = record.clone();
                Ok(())
            }
            None => Err(StoreError::RunNotFound(record.id)),
        }
    }

    async fn update_schedule_status(
        &self,
        key: &ScheduleKey,
        status: ScheduleStatus,
        expected_version: u64,
    ) -> Result<u64, StoreError> {
        self.check_available()?;

        let injected_conflict = {
            let mut faults = self.faults();
            if faults.status_conflicts > 0 {
                faults.status_conflicts -= 1;
                true
            } else {
                false
            }
        };

        let mut inner = self.lock();
        let actual = inner
            .schedules
            .get(key)
            .map(|s| s.version)
            .ok_or_else(|| StoreError::ScheduleNotFound(key.clone()))?;

        if injected_conflict || actual != expected_version {
            return Err(StoreError::VersionConflict {
                key: key.clone(),
                expected: expected_version,
                actual,
            });
        }

        let version = inner.bump_version();
        inner.status_writes += 1;
        if let Some(schedule) = inner.schedules.get_mut(key) {
            schedule.status = status;
            schedule.version = version;
        }
        Ok(version)
    }

    async fn delete_run_record(&self, id: RunId) -> Result<DeleteOutcome, StoreError> {
        self.check_available()?;
        Ok(match self.lock().runs.remove(&id) {
            Some(_) => DeleteOutcome::Deleted,
            None => DeleteOutcome::NotFound,
        })
    }

    fn watch(&self) -> broadcast::Receiver<ScheduleWatchEvent> {
        self.watch_tx.subscribe()
    }
}

#[cfg(test)]
mod tests {
    use chrono::DateTime;
    use recur_events::RunStatus;
    use recur_reconcile::TriggerSpec;

    use super::*;
    use crate::clock::FakeClock;

    fn store() -> InMemoryStore {
        let clock = FakeClock::new(DateTime::from_timestamp(1_700_000_000, 0).unwrap());
        InMemoryStore::new(Arc::new(clock))
    }

    fn key(name: &str) -> ScheduleKey {
        ScheduleKey::new("default", name).unwrap()
    }

    #[tokio::test]
    async fn test_apply_and_watch() {
        let store = store();
        let mut watch = store.watch();

        let created = store.apply_schedule(key("a"), ScheduleSpec::new(TriggerSpec::every(60)));
        let updated = store.apply_schedule(key("a"), ScheduleSpec::new(TriggerSpec::every(120)));

        assert!(updated.version > created.version);
        assert_eq!(updated.created_at, created.created_at);
        assert_eq!(watch.recv().await.unwrap(), ScheduleWatchEvent::Applied(key("a")));
        assert_eq!(watch.recv().await.unwrap(), ScheduleWatchEvent::Applied(key("a")));

        assert!(store.delete_schedule(&key("a")));
        assert!(!store.delete_schedule(&key("a")));
        assert_eq!(watch.recv().await.unwrap(), ScheduleWatchEvent::Deleted(key("a")));
        assert!(store.get_schedule(&key("a")).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_status_write_is_version_guarded() {
        let store = store();
        let schedule = store.apply_schedule(key("a"), ScheduleSpec::new(TriggerSpec::every(60)));

        let v2 = store
            .update_schedule_status(&key("a"), ScheduleStatus::default(), schedule.version)
            .await
            .unwrap();
        assert!(v2 > schedule.version);

        let stale = store
            .update_schedule_status(&key("a"), ScheduleStatus::default(), schedule.version)
            .await;
        assert!(matches!(stale, Err(StoreError::VersionConflict { .. })));

        let missing = store
            .update_schedule_status(&key("b"), ScheduleStatus::default(), 1)
            .await;
        assert_eq!(missing, Err(StoreError::ScheduleNotFound(key("b"))));
    }

    #[tokio::test]
    async fn test_run_record_lifecycle() {
        let store = store();
        let at = DateTime::from_timestamp(1_700_000_060, 0).unwrap();
        let mut record = RunRecord::new(key("a"), at, at);

        assert_eq!(store.create_run_record(record.clone()).await.unwrap(), CreateOutcome::Created);
        assert!(matches!(
            store.create_run_record(record.clone()).await.unwrap(),
            CreateOutcome::AlreadyExists(_)
        ));
        assert_eq!(store.runs_created(), 1);

        record.status = RunStatus::Succeeded;
        store.update_run_record(&record).await.unwrap();
        let terminal = store.list_run_records(&key("a"), RunFilter::Terminal).await.unwrap();
        assert_eq!(terminal, vec![record.clone()]);
        assert!(store
            .list_run_records(&key("a"), RunFilter::NonTerminal)
            .await
            .unwrap()
            .is_empty());

        assert_eq!(store.delete_run_record(record.id).await.unwrap(), DeleteOutcome::Deleted);
        assert_eq!(store.delete_run_record(record.id).await.unwrap(), DeleteOutcome::NotFound);
        assert_eq!(
            store.update_run_record(&record).await,
            Err(StoreError::RunNotFound(record.id))
        );
    }

    #[tokio::test]
    async fn test_injected_faults() {
        let store = store();
        let schedule = store.apply_schedule(key("a"), ScheduleSpec::new(TriggerSpec::every(60)));

        store.fail_next_calls(1);
        let err = store.list_schedules().await.unwrap_err();
        assert!(err.is_transient());
        assert_eq!(store.list_schedules().await.unwrap(), vec![key("a")]);

        store.conflict_next_status_writes(1);
        let err = store
            .update_schedule_status(&key("a"), ScheduleStatus::default(), schedule.version)
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::VersionConflict { .. }));
        assert!(store
            .update_schedule_status(&key("a"), ScheduleStatus::default(), schedule.version)
            .await
            .is_ok());
    }
}
