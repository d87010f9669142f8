//! Controller observability: event sinks and counters.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use recur_events::{ControllerEvent, EventEnvelope};
use recur_id::{EventId, PassId, ScheduleKey};
use serde::Serialize;
use tracing::{info, warn};

/// Destination for controller events.
pub trait EventSink: Send + Sync {
    fn emit(&self, event: EventEnvelope);
}

/// Logs every event as a structured tracing record.
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingEventSink;

impl EventSink for TracingEventSink {
    fn emit(&self, event: EventEnvelope) {
        match serde_json::to_string(&event.payload) {
            Ok(payload) => info!(
                event_id = %event.event_id,
                event_type = %event.event_type,
                schedule = %event.schedule,
                pass_id = ?event.pass_id.map(|p| p.to_string()),
                payload = %payload,
                "Controller event"
            ),
            Err(e) => warn!(
                event_type = %event.event_type,
                error = %e,
                "Failed to serialize controller event"
            ),
        }
    }
}

/// Keeps events in memory for inspection.
#[derive(Debug, Default)]
pub struct MemoryEventSink {
    events: Mutex<Vec<EventEnvelope>>,
}

impl MemoryEventSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<EventEnvelope> {
        self.events.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    pub fn of_type(&self, event_type: &str) -> Vec<EventEnvelope> {
        self.events()
            .into_iter()
            .filter(|e| e.event_type == event_type)
            .collect()
    }

    pub fn clear(&self) {
        self.events.lock().unwrap_or_else(|e| e.into_inner()).clear();
    }
}

impl EventSink for MemoryEventSink {
    fn emit(&self, event: EventEnvelope) {
        self.events
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(event);
    }
}

/// Wraps events in envelopes with process-local ids.
pub struct EventEmitter {
    sink: Arc<dyn EventSink>,
    next_id: AtomicU64,
}

impl EventEmitter {
    pub fn new(sink: Arc<dyn EventSink>) -> Self {
        Self {
            sink,
            next_id: AtomicU64::new(1),
        }
    }

    pub fn emit(
        &self,
        schedule: &ScheduleKey,
        pass_id: PassId,
        occurred_at: DateTime<Utc>,
        event: ControllerEvent,
    ) {
        let id = EventId::new(self.next_id.fetch_add(1, Ordering::Relaxed));
        self.sink.emit(EventEnvelope::wrap(
            id,
            schedule.clone(),
            Some(pass_id),
            occurred_at,
            event,
        ));
    }
}

/// Controller counters.
#[derive(Debug, Default)]
pub struct ControllerMetrics {
    pub passes: AtomicU64,
    pub pass_errors: AtomicU64,
    pub runs_fired: AtomicU64,
    pub triggers_skipped: AtomicU64,
    pub triggers_failed: AtomicU64,
    pub runs_superseded: AtomicU64,
    pub runs_pruned: AtomicU64,
    pub transient_store_errors: AtomicU64,
    pub transient_executor_errors: AtomicU64,
    pub version_conflicts: AtomicU64,
}

/// Point-in-time copy of [`ControllerMetrics`].
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct MetricsSnapshot {
    pub passes: u64,
    pub pass_errors: u64,
    pub runs_fired: u64,
    pub triggers_skipped: u64,
    pub triggers_failed: u64,
    pub runs_superseded: u64,
    pub runs_pruned: u64,
    pub transient_store_errors: u64,
    pub transient_executor_errors: u64,
    pub version_conflicts: u64,
}

impl ControllerMetrics {
    pub fn incr(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn add(counter: &AtomicU64, n: u64) {
        if n > 0 {
            counter.fetch_add(n, Ordering::Relaxed);
        }
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        let get = |c: &AtomicU64| c.load(Ordering::Relaxed);
        MetricsSnapshot {
            passes: get(&self.passes),
            pass_errors: get(&self.pass_errors),
            runs_fired: get(&self.runs_fired),
            triggers_skipped: get(&self.triggers_skipped),
            triggers_failed: get(&self.triggers_failed),
            runs_superseded: get(&self.runs_superseded),
            runs_pruned: get(&self.runs_pruned),
            transient_store_errors: get(&self.transient_store_errors),
            transient_executor_errors: get(&self.transient_executor_errors),
            version_conflicts: get(&self.version_conflicts),
        }
    }
}
