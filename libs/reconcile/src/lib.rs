//! Reconciliation primitives for recurring schedules.
//!
//! Everything in this crate is pure: given the same inputs it makes the same
//! decision and it never performs I/O. The controller feeds it observed state
//! and applies the returned decisions.
//!
//! - [`trigger`]: which trigger instants have elapsed and are due.
//! - [`policy`]: whether a due trigger may start a run given active runs.
//! - [`retention`]: which terminal runs fall out of the history window.
//! - [`backoff`]: retry delays for failed reconciliation.
//!
//! # Invariants
//!
//! - Trigger instants are produced in ascending order and never exceed `now`
//! - Missed instants beyond the catch-up bound are dropped, never queued
//! - Retention never selects a non-terminal run

use std::time::Duration;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

pub mod backoff;
pub mod policy;
pub mod retention;
pub mod trigger;

pub use backoff::BackoffPolicy;
pub use policy::{admit, ConcurrencyPolicy, Decision};
pub use retention::{plan_prune, RetentionClass, RetentionLimits};
pub use trigger::{DueTriggers, ScheduleWindow, TriggerError, TriggerSpec};

/// A spec hash for deterministic comparison.
///
/// Used to detect whether a schedule spec changed since it was last judged
/// malformed.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SpecHash(String);

impl SpecHash {
    /// Compute a spec hash from canonical JSON.
    pub fn from_json(json: &serde_json::Value) -> Self {
        let canonical = canonical_json(json);
        let mut hasher = Sha256::new();
        hasher.update(canonical.as_bytes());
        let result = hasher.finalize();
        Self(format!("sha256:{}", hex::encode(&result[..16]))) // First 16 bytes (128 bits)
    }

    /// Hash any serializable spec.
    pub fn of<T: Serialize>(spec: &T) -> Result<Self, serde_json::Error> {
        Ok(Self::from_json(&serde_json::to_value(spec)?))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for SpecHash {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Produce canonical JSON (sorted keys, no extra whitespace).
fn canonical_json(value: &serde_json::Value) -> String {
    match value {
        serde_json::Value::Object(map) => {
            let mut pairs: Vec<_> = map.iter().collect();
            pairs.sort_by_key(|(k, _)| *k);
            let inner: Vec<String> = pairs
                .iter()
                .map(|(k, v)| format!("{}:{}", quote(k), canonical_json(v)))
                .collect();
            format!("{{{}}}", inner.join(","))
        }
        serde_json::Value::Array(arr) => {
            let inner: Vec<String> = arr.iter().map(canonical_json).collect();
            format!("[{}]", inner.join(","))
        }
        serde_json::Value::String(s) => quote(s),
        other => other.to_string(),
    }
}

fn quote(s: &str) -> String {
    serde_json::Value::String(s.to_string()).to_string()
}

/// Default interval between full resyncs of every schedule.
pub const DEFAULT_RESYNC_INTERVAL: Duration = Duration::from_secs(10);

/// Default number of missed instants realized after a pause.
pub const DEFAULT_MAX_CATCHUP: usize = 10;

/// Default number of transient submit failures tolerated per instant.
pub const DEFAULT_MAX_SUBMIT_RETRIES: u32 = 3;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_spec_hash_deterministic() {
        let json1 = serde_json::json!({"b": 2, "a": {"y": [1, 2], "x": "q\"uote"}});
        let json2 = serde_json::json!({"a": {"x": "q\"uote", "y": [1, 2]}, "b": 2});

        assert_eq!(SpecHash::from_json(&json1), SpecHash::from_json(&json2));
        assert!(SpecHash::from_json(&json1).as_str().starts_with("sha256:"));
    }

    #[test]
    fn test_spec_hash_changes_with_content() {
        let a = SpecHash::from_json(&serde_json::json!({"interval_secs": 60}));
        let b = SpecHash::from_json(&serde_json::json!({"interval_secs": 61}));
        assert_ne!(a, b);
    }

    #[test]
    fn test_canonical_json_escapes_keys() {
        let json = serde_json::json!({"a\"b": "line\nbreak"});
        assert_eq!(canonical_json(&json), r#"{"a\"b":"line\nbreak"}"#);
    }
}
