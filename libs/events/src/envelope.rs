//! Event envelope - the common wrapper for all controller events.

use chrono::{DateTime, Utc};
use recur_id::{EventId, PassId, ScheduleKey};
use serde::{Deserialize, Serialize};

use crate::{ControllerEvent, EventError};

/// Common metadata around a controller event.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventEnvelope<P = ControllerEvent> {
    /// Process-local monotonic identifier.
    pub event_id: EventId,

    /// When the event occurred, per the controller clock.
    pub occurred_at: DateTime<Utc>,

    /// The schedule the event belongs to.
    pub schedule: ScheduleKey,

    /// The event type (e.g., "trigger.fired").
    pub event_type: String,

    /// Reconciliation pass that produced the event.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pass_id: Option<PassId>,

    /// Event-specific payload.
    pub payload: P,
}

impl EventEnvelope<ControllerEvent> {
    /// Wraps a controller event, taking the event type from the payload.
    pub fn wrap(
        event_id: EventId,
        schedule: ScheduleKey,
        pass_id: Option<PassId>,
        occurred_at: DateTime<Utc>,
        event: ControllerEvent,
    ) -> Self {
        Self {
            event_id,
            occurred_at,
            schedule,
            event_type: event.event_type().to_string(),
            pass_id,
            payload: event,
        }
    }
}

impl<P: Serialize> EventEnvelope<P> {
    /// Serializes the envelope to a JSON value.
    pub fn to_json(&self) -> Result<serde_json::Value, EventError> {
        Ok(serde_json::to_value(self)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{event_types, RetentionPrunedPayload};

    fn key() -> ScheduleKey {
        ScheduleKey::new("default", "hourly").unwrap()
    }

    #[test]
    fn test_wrap_takes_type_from_payload() {
        let pass = PassId::new();
        let envelope = EventEnvelope::wrap(
            EventId::new(9),
            key(),
            Some(pass),
            Utc::now(),
            ControllerEvent::RetentionPruned(RetentionPrunedPayload { deleted: vec![] }),
        );

        assert_eq!(envelope.event_type, event_types::RETENTION_PRUNED);

        let json = envelope.to_json().unwrap();
        assert_eq!(json["schedule"], "default/hourly");
        assert_eq!(json["pass_id"], pass.to_string());
        assert_eq!(json["payload"]["kind"], "retention_pruned");
    }
}
