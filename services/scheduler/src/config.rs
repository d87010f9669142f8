//! Scheduler configuration (env-driven).

use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use anyhow::{ensure, Context, Result};
use recur_id::ScheduleKey;
use recur_reconcile::{BackoffPolicy, DEFAULT_MAX_CATCHUP, DEFAULT_MAX_SUBMIT_RETRIES};
use serde::Deserialize;

use crate::controller::{ControllerConfig, ReconcilerConfig};
use crate::model::ScheduleSpec;

/// Scheduler configuration.
#[derive(Debug, Clone)]
pub struct Config {
    /// Log level (trace, debug, info, warn, error).
    pub log_level: String,

    /// Concurrent reconciliation workers.
    pub workers: usize,

    /// Interval between full resyncs of every schedule.
    pub resync_interval: Duration,

    /// Most missed instants realized per pass after a pause.
    pub max_catchup: usize,

    /// Transient submit failures tolerated per instant.
    pub max_submit_retries: u32,

    /// Deadline for each store and executor call.
    pub call_timeout: Duration,

    /// Grace period for in-flight passes on shutdown.
    pub shutdown_grace: Duration,

    /// Optional JSON file of schedules to load at startup.
    pub schedules_file: Option<PathBuf>,

    /// How long mock runs take in standalone mode.
    pub simulated_run: Duration,
}

impl Config {
    /// Load configuration from environment variables.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Load configuration from an arbitrary variable source.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let log_level = lookup("RECUR_LOG_LEVEL").unwrap_or_else(|| "info".to_string());

        let workers: usize = parse_var(&lookup, "RECUR_WORKERS")?.unwrap_or(4);
        ensure!(workers >= 1, "RECUR_WORKERS must be at least 1.");

        let resync_secs: u64 = parse_var(&lookup, "RECUR_RESYNC_INTERVAL_SECS")?.unwrap_or(10);
        ensure!(resync_secs >= 1, "RECUR_RESYNC_INTERVAL_SECS must be at least 1.");

        let max_catchup = parse_var(&lookup, "RECUR_MAX_CATCHUP")?.unwrap_or(DEFAULT_MAX_CATCHUP);

        let max_submit_retries =
            parse_var(&lookup, "RECUR_MAX_SUBMIT_RETRIES")?.unwrap_or(DEFAULT_MAX_SUBMIT_RETRIES);

        let call_timeout_ms: u64 = parse_var(&lookup, "RECUR_CALL_TIMEOUT_MS")?.unwrap_or(5_000);
        let shutdown_grace_secs: u64 =
            parse_var(&lookup, "RECUR_SHUTDOWN_GRACE_SECS")?.unwrap_or(10);
        let simulated_run_secs: u64 = parse_var(&lookup, "RECUR_SIMULATED_RUN_SECS")?.unwrap_or(5);

        let schedules_file = lookup("RECUR_SCHEDULES_FILE").map(PathBuf::from);

        Ok(Self {
            log_level,
            workers,
            resync_interval: Duration::from_secs(resync_secs),
            max_catchup,
            max_submit_retries,
            call_timeout: Duration::from_millis(call_timeout_ms.max(10)),
            shutdown_grace: Duration::from_secs(shutdown_grace_secs),
            schedules_file,
            simulated_run: Duration::from_secs(simulated_run_secs),
        })
    }

    pub fn reconciler(&self) -> ReconcilerConfig {
        ReconcilerConfig {
            max_catchup: self.max_catchup,
            max_submit_retries: self.max_submit_retries,
            call_timeout: self.call_timeout,
            resync_interval: self.resync_interval,
        }
    }

    pub fn controller(&self) -> ControllerConfig {
        ControllerConfig {
            workers: self.workers,
            shutdown_grace: self.shutdown_grace,
            backoff: BackoffPolicy::default(),
            reconciler: self.reconciler(),
        }
    }
}

fn parse_var<T>(lookup: &impl Fn(&str) -> Option<String>, name: &str) -> Result<Option<T>>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    lookup(name)
        .map(|v| v.trim().parse::<T>())
        .transpose()
        .with_context(|| format!("{name} must be a non-negative integer."))
}

/// A schedule declared in the seed file.
#[derive(Debug, Clone, Deserialize)]
pub struct SeedSchedule {
    pub namespace: String,
    pub name: String,
    pub spec: ScheduleSpec,
}

impl SeedSchedule {
    pub fn key(&self) -> Result<ScheduleKey> {
        ScheduleKey::new(self.namespace.clone(), self.name.clone())
            .with_context(|| format!("invalid schedule key {}/{}", self.namespace, self.name))
    }
}

/// Parse a JSON array of seed schedules.
pub fn parse_seeds(json: &str) -> Result<Vec<(ScheduleKey, ScheduleSpec)>> {
    let seeds: Vec<SeedSchedule> =
        serde_json::from_str(json).context("schedules file must be a JSON array of schedules")?;
    seeds
        .into_iter()
        .map(|seed| Ok((seed.key()?, seed.spec)))
        .collect()
}

pub fn load_seeds(path: &Path) -> Result<Vec<(ScheduleKey, ScheduleSpec)>> {
    let json = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read schedules file {}", path.display()))?;
    parse_seeds(&json)
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use recur_reconcile::{ConcurrencyPolicy, TriggerSpec};

    use super::*;

    fn config(vars: &[(&str, &str)]) -> Result<Config> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        Config::from_lookup(|name| vars.get(name).cloned())
    }

    #[test]
    fn test_defaults() {
        let config = config(&[]).unwrap();
        assert_eq!(config.log_level, "info");
        assert_eq!(config.workers, 4);
        assert_eq!(config.resync_interval, Duration::from_secs(10));
        assert_eq!(config.max_catchup, DEFAULT_MAX_CATCHUP);
        assert_eq!(config.max_submit_retries, DEFAULT_MAX_SUBMIT_RETRIES);
        assert!(config.schedules_file.is_none());
    }

    #[test]
    fn test_overrides_flow_into_controller_config() {
        let config = config(&[
            ("RECUR_WORKERS", "8"),
            ("RECUR_MAX_CATCHUP", "3"),
            ("RECUR_CALL_TIMEOUT_MS", "250"),
            ("RECUR_SCHEDULES_FILE", "/etc/recur/schedules.json"),
        ])
        .unwrap();

        let controller = config.controller();
        assert_eq!(controller.workers, 8);
        assert_eq!(controller.reconciler.max_catchup, 3);
        assert_eq!(controller.reconciler.call_timeout, Duration::from_millis(250));
        assert_eq!(
            config.schedules_file,
            Some(PathBuf::from("/etc/recur/schedules.json"))
        );
    }

    #[test]
    fn test_invalid_values_are_reported() {
        let err = config(&[("RECUR_WORKERS", "many")]).unwrap_err();
        assert!(err.to_string().contains("RECUR_WORKERS"));

        assert!(config(&[("RECUR_WORKERS", "0")]).is_err());
    }

    #[test]
    fn test_parse_seeds() {
        let seeds = parse_seeds(
            r#"[
                {"namespace": "default", "name": "nightly",
                 "spec": {"trigger": {"kind": "cron", "expression": "0 3 * * *"},
                          "concurrency_policy": "forbid"}},
                {"namespace": "ops", "name": "heartbeat",
                 "spec": {"trigger": {"kind": "periodic", "interval_secs": 30}}}
            ]"#,
        )
        .unwrap();

        assert_eq!(seeds.len(), 2);
        assert_eq!(seeds[0].0.to_string(), "default/nightly");
        assert_eq!(seeds[0].1.concurrency_policy, ConcurrencyPolicy::Forbid);
        assert_eq!(seeds[1].1.trigger, TriggerSpec::every(30));

        assert!(parse_seeds(r#"[{"namespace": "Bad_NS", "name": "x", "spec": {"trigger": {"kind": "periodic", "interval_secs": 1}}}]"#).is_err());
    }
}
