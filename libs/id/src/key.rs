//! Schedule identity.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::IdError;

/// Maximum length of a namespace or name segment.
pub const MAX_SEGMENT_LEN: usize = 63;

/// Stable identity of a schedule: `{namespace}/{name}`.
///
/// Both segments follow DNS label rules: lowercase ASCII alphanumerics and
/// `-`, starting and ending with an alphanumeric, at most 63 characters.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct ScheduleKey {
    namespace: String,
    name: String,
}

impl ScheduleKey {
    /// Builds a key, validating both segments.
    pub fn new(namespace: impl Into<String>, name: impl Into<String>) -> Result<Self, IdError> {
        let namespace = namespace.into();
        let name = name.into();
        validate_segment("namespace", &namespace)?;
        validate_segment("name", &name)?;
        Ok(Self { namespace, name })
    }

    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    pub fn name(&self) -> &str {
        &self.name
    }
}

fn validate_segment(segment: &'static str, value: &str) -> Result<(), IdError> {
    let invalid = |reason| IdError::InvalidName {
        segment,
        value: value.to_string(),
        reason,
    };

    if value.is_empty() {
        return Err(IdError::Empty);
    }
    if value.len() > MAX_SEGMENT_LEN {
        return Err(invalid("longer than 63 characters"));
    }
    if !value
        .bytes()
        .all(|b| b.is_ascii_lowercase() || b.is_ascii_digit() || b == b'-')
    {
        return Err(invalid("only lowercase alphanumerics and '-' are allowed"));
    }
    if value.starts_with('-') || value.ends_with('-') {
        return Err(invalid("must start and end with an alphanumeric"));
    }
    Ok(())
}

impl fmt::Display for ScheduleKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.namespace, self.name)
    }
}

impl FromStr for ScheduleKey {
    type Err = IdError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.is_empty() {
            return Err(IdError::Empty);
        }
        let (namespace, name) = s.split_once('/').ok_or(IdError::MissingSeparator('/'))?;
        Self::new(namespace, name)
    }
}

impl TryFrom<String> for ScheduleKey {
    type Error = IdError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<ScheduleKey> for String {
    fn from(key: ScheduleKey) -> Self {
        key.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_key_roundtrip() {
        let key = ScheduleKey::new("team-a", "nightly-etl").unwrap();
        assert_eq!(key.to_string(), "team-a/nightly-etl");

        let parsed: ScheduleKey = "team-a/nightly-etl".parse().unwrap();
        assert_eq!(parsed, key);
        assert_eq!(parsed.namespace(), "team-a");
        assert_eq!(parsed.name(), "nightly-etl");
    }

    #[test]
    fn test_key_missing_separator() {
        let result: Result<ScheduleKey, _> = "nightly-etl".parse();
        assert_eq!(result.unwrap_err(), IdError::MissingSeparator('/'));
    }

    #[test]
    fn test_key_rejects_bad_segments() {
        assert!(ScheduleKey::new("Team", "etl").is_err());
        assert!(ScheduleKey::new("team", "-etl").is_err());
        assert!(ScheduleKey::new("team", "etl_job").is_err());
        assert!(ScheduleKey::new("team", "a".repeat(64)).is_err());
        assert!(ScheduleKey::new("", "etl").unwrap_err().is_empty());
    }

    #[test]
    fn test_key_json_is_string() {
        let key = ScheduleKey::new("default", "hourly").unwrap();
        let json = serde_json::to_string(&key).unwrap();
        assert_eq!(json, "\"default/hourly\"");

        let parsed: ScheduleKey = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed, key);
        assert!(serde_json::from_str::<ScheduleKey>("\"default\"").is_err());
    }
}
