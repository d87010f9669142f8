//! Per-schedule buffer of executor status notifications.
//!
//! The dispatcher resolves each notification to its owning schedule and
//! parks it here; the schedule's next reconciliation pass applies it. This
//! keeps every run record write on the pass that holds the schedule's key.

use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};

use recur_id::ScheduleKey;

use crate::executor::RunStatusChanged;

#[derive(Debug, Default)]
pub struct StatusInbox {
    pending: Mutex<HashMap<ScheduleKey, Vec<RunStatusChanged>>>,
}

impl StatusInbox {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<ScheduleKey, Vec<RunStatusChanged>>> {
        self.pending.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn push(&self, key: ScheduleKey, change: RunStatusChanged) {
        self.lock().entry(key).or_default().push(change);
    }

    /// Take everything pending for `key`, oldest first.
    pub fn take(&self, key: &ScheduleKey) -> Vec<RunStatusChanged> {
        self.lock().remove(key).unwrap_or_default()
    }

    /// Put back changes that could not be applied, ahead of newer ones.
    pub fn restore(&self, key: &ScheduleKey, mut changes: Vec<RunStatusChanged>) {
        if changes.is_empty() {
            return;
        }
        let mut pending = self.lock();
        let slot = pending.entry(key.clone()).or_default();
        changes.append(slot);
        *slot = changes;
    }

    pub fn pending(&self, key: &ScheduleKey) -> usize {
        self.lock().get(key).map_or(0, Vec::len)
    }
}

#[cfg(test)]
mod tests {
    use recur_events::RunStatus;
    use recur_id::RunId;

    use super::*;

    fn change(status: RunStatus) -> RunStatusChanged {
        RunStatusChanged {
            run_id: RunId::from_parts(1, 1),
            status,
        }
    }

    #[test]
    fn test_restore_keeps_order() {
        let inbox = StatusInbox::new();
        let key = ScheduleKey::new("default", "a").unwrap();

        inbox.push(key.clone(), change(RunStatus::Running));
        let taken = inbox.take(&key);
        inbox.push(key.clone(), change(RunStatus::Succeeded));
        inbox.restore(&key, taken);

        let statuses: Vec<_> = inbox.take(&key).into_iter().map(|c| c.status).collect();
        assert_eq!(statuses, vec![RunStatus::Running, RunStatus::Succeeded]);
        assert_eq!(inbox.pending(&key), 0);
    }
}
