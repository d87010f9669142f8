//! Typed ID definitions.

use sha2::{Digest, Sha256};

use crate::{define_id, ScheduleKey};

define_id!(RunId, "run");
define_id!(PassId, "pass");

impl RunId {
    /// Deterministic ID for the run realizing `schedule`'s trigger at
    /// `scheduled_ms` (Unix milliseconds).
    ///
    /// The ULID timestamp is the scheduled instant, so run IDs of one schedule
    /// sort by scheduled time. The random part is the first 80 bits of
    /// SHA-256 over the schedule key. Instants before the Unix epoch clamp to
    /// 0; schedule windows reject them, so realized instants never clamp.
    #[must_use]
    pub fn for_trigger(schedule: &ScheduleKey, scheduled_ms: i64) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(schedule.namespace().as_bytes());
        hasher.update(b"/");
        hasher.update(schedule.name().as_bytes());
        let digest = hasher.finalize();

        let mut random = [0u8; 16];
        random[6..].copy_from_slice(&digest[..10]);

        Self::from_parts(scheduled_ms.max(0) as u64, u128::from_be_bytes(random))
    }
}

// =============================================================================
// Events
// =============================================================================

/// Process-local, monotonically increasing controller event identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct EventId(u64);

impl EventId {
    #[must_use]
    pub const fn new(id: u64) -> Self {
        Self(id)
    }

    #[must_use]
    pub const fn value(&self) -> u64 {
        self.0
    }
}

impl std::fmt::Display for EventId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<u64> for EventId {
    fn from(id: u64) -> Self {
        Self(id)
    }
}

impl serde::Serialize for EventId {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.serialize_u64(self.0)
    }
}

impl<'de> serde::Deserialize<'de> for EventId {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        u64::deserialize(deserializer).map(Self)
    }
}
