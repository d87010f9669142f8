//! History retention planning.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Retention bucket of a terminal run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RetentionClass {
    Succeeded,
    /// Failed and cancelled runs.
    Failed,
}

/// How many terminal runs of each class to keep.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetentionLimits {
    pub max_succeeded: usize,
    pub max_failed: usize,
}

impl Default for RetentionLimits {
    fn default() -> Self {
        Self {
            max_succeeded: 3,
            max_failed: 1,
        }
    }
}

impl RetentionLimits {
    pub fn limit(&self, class: RetentionClass) -> usize {
        match class {
            RetentionClass::Succeeded => self.max_succeeded,
            RetentionClass::Failed => self.max_failed,
        }
    }
}

/// Select the records to delete so each class keeps only its newest runs by
/// scheduled time.
///
/// `classify` returns `None` for records that are not terminal; those are
/// never selected. Ties on scheduled time keep input order.
pub fn plan_prune<T, F>(records: &[T], limits: RetentionLimits, classify: F) -> Vec<T>
where
    T: Clone,
    F: Fn(&T) -> Option<(RetentionClass, DateTime<Utc>)>,
{
    let mut doomed = Vec::new();
    for class in [RetentionClass::Succeeded, RetentionClass::Failed] {
        let mut members: Vec<(DateTime<Utc>, &T)> = records
            .iter()
            .filter_map(|r| match classify(r) {
                Some((c, at)) if c == class => Some((at, r)),
                _ => None,
            })
            .collect();

        let keep = limits.limit(class);
        if members.len() <= keep {
            continue;
        }

        // Newest first; everything past the limit goes.
        members.sort_by(|a, b| b.0.cmp(&a.0));
        doomed.extend(members.into_iter().skip(keep).map(|(_, r)| r.clone()));
    }
    doomed
}
