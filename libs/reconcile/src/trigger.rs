//! Trigger instant calculation.
//!
//! Given a trigger spec, the schedule's validity window, the last realized
//! trigger and the current time, compute which instants are due. Cron and
//! periodic triggers are variants of one [`TriggerSpec`] enum; adding a
//! trigger kind means adding a variant and its arm in [`CompiledTrigger`].

use std::str::FromStr;

use chrono::{DateTime, TimeDelta, Utc};
use cron::Schedule;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Most dropped cron instants counted in one pass. Longer pauses report
/// this many.
pub const CRON_SCAN_LIMIT: usize = 100_000;

/// Longest accepted periodic interval (100 years).
pub const MAX_INTERVAL_SECS: u64 = 100 * 366 * 24 * 60 * 60;

/// Errors for trigger specs that can never produce instants.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TriggerError {
    #[error("invalid cron expression '{expression}': {message}")]
    InvalidCron { expression: String, message: String },

    #[error("periodic interval must be at least one second")]
    ZeroInterval,

    #[error("periodic interval of {0}s exceeds the maximum of {MAX_INTERVAL_SECS}s")]
    IntervalTooLarge(u64),

    #[error("window bound {0} is before the Unix epoch")]
    BeforeEpoch(DateTime<Utc>),

    #[error("start time {start} is not before end time {end}")]
    InvertedWindow {
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    },
}

/// How a schedule decides its trigger instants.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum TriggerSpec {
    /// Cron expression with a seconds field (6 or 7 fields). Standard
    /// 5-field expressions fire at second zero.
    Cron { expression: String },

    /// Fixed interval counted from the anchor.
    Periodic { interval_secs: u64 },
}

/// The time bounds a schedule's triggers must fall in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ScheduleWindow {
    /// Anchor used when there is neither a last trigger nor a start time.
    pub created_at: DateTime<Utc>,

    /// Instants before this are suppressed.
    pub start_time: Option<DateTime<Utc>>,

    /// Instants after this are suppressed.
    pub end_time: Option<DateTime<Utc>>,
}

impl ScheduleWindow {
    pub fn new(created_at: DateTime<Utc>) -> Self {
        Self {
            created_at,
            start_time: None,
            end_time: None,
        }
    }

    pub fn with_start(mut self, start: DateTime<Utc>) -> Self {
        self.start_time = Some(start);
        self
    }

    pub fn with_end(mut self, end: DateTime<Utc>) -> Self {
        self.end_time = Some(end);
        self
    }

    pub fn validate(&self) -> Result<(), TriggerError> {
        // Run ids encode trigger instants as unsigned milliseconds.
        if let Some(bound) = [self.start_time, self.end_time]
            .into_iter()
            .flatten()
            .find(|t| *t < DateTime::<Utc>::UNIX_EPOCH)
        {
            return Err(TriggerError::BeforeEpoch(bound));
        }
        match (self.start_time, self.end_time) {
            (Some(start), Some(end)) if start >= end => {
                Err(TriggerError::InvertedWindow { start, end })
            }
            _ => Ok(()),
        }
    }

    pub fn contains(&self, instant: DateTime<Utc>) -> bool {
        self.start_time.map_or(true, |s| instant >= s) && self.end_time.map_or(true, |e| instant <= e)
    }

    /// True once `now` is past the end of the window.
    pub fn has_ended(&self, now: DateTime<Utc>) -> bool {
        self.end_time.is_some_and(|e| now > e)
    }

    /// Instants are computed strictly after this point.
    fn anchor(&self, last_trigger: Option<DateTime<Utc>>) -> DateTime<Utc> {
        last_trigger.or(self.start_time).unwrap_or(self.created_at)
    }

    /// Latest instant that may be returned at time `now`.
    fn horizon(&self, now: DateTime<Utc>) -> DateTime<Utc> {
        self.end_time.map_or(now, |e| e.min(now))
    }
}

/// Trigger instants due in one reconciliation pass.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DueTriggers {
    /// Instants to realize, ascending, each `<= now`.
    pub instants: Vec<DateTime<Utc>>,

    /// Elapsed instants dropped by the catch-up bound.
    pub dropped: u64,

    /// The newest dropped instant, if any.
    pub latest_dropped: Option<DateTime<Utc>>,
}

impl DueTriggers {
    pub fn is_empty(&self) -> bool {
        self.instants.is_empty() && self.dropped == 0
    }

    /// The newest elapsed instant, realized or dropped.
    pub fn latest(&self) -> Option<DateTime<Utc>> {
        self.instants.last().copied().max(self.latest_dropped)
    }
}

impl TriggerSpec {
    pub fn cron(expression: impl Into<String>) -> Self {
        Self::Cron {
            expression: expression.into(),
        }
    }

    pub fn every(interval_secs: u64) -> Self {
        Self::Periodic { interval_secs }
    }

    /// Check the spec can produce instants.
    pub fn validate(&self) -> Result<(), TriggerError> {
        self.compile().map(|_| ())
    }

    /// Elapsed instants strictly after the last trigger (or the window's
    /// start, or its creation time) and no later than `now`.
    ///
    /// Only the newest `max_catchup` instants are returned; older ones are
    /// reported as dropped.
    pub fn next_instants(
        &self,
        window: &ScheduleWindow,
        last_trigger: Option<DateTime<Utc>>,
        now: DateTime<Utc>,
        max_catchup: usize,
    ) -> Result<DueTriggers, TriggerError> {
        window.validate()?;
        let compiled = self.compile()?;
        let anchor = window.anchor(last_trigger);
        let horizon = window.horizon(now);
        if horizon <= anchor {
            return Ok(DueTriggers::default());
        }

        Ok(match compiled {
            CompiledTrigger::Periodic { interval_ms } => {
                periodic_due(interval_ms, anchor, window.start_time, horizon, max_catchup)
            }
            CompiledTrigger::Cron(schedule) => {
                let from = scan_start(anchor, window.start_time);
                cron_due(&schedule, from, horizon, max_catchup, CRON_SCAN_LIMIT)
            }
        })
    }

    /// The first instant after the last trigger that lies in the window, or
    /// `None` when the schedule will never fire again.
    pub fn next_instant(
        &self,
        window: &ScheduleWindow,
        last_trigger: Option<DateTime<Utc>>,
    ) -> Result<Option<DateTime<Utc>>, TriggerError> {
        window.validate()?;
        let anchor = window.anchor(last_trigger);

        let next = match self.compile()? {
            CompiledTrigger::Periodic { interval_ms } => {
                let k = first_step(interval_ms, anchor, window.start_time);
                offset(anchor, k.saturating_mul(interval_ms))
            }
            CompiledTrigger::Cron(schedule) => schedule
                .after(&scan_start(anchor, window.start_time))
                .next(),
        };

        Ok(next.filter(|t| window.contains(*t)))
    }

    fn compile(&self) -> Result<CompiledTrigger, TriggerError> {
        match self {
            Self::Cron { expression } => Schedule::from_str(&normalize_cron(expression))
                .map(CompiledTrigger::Cron)
                .map_err(|e| TriggerError::InvalidCron {
                    expression: expression.clone(),
                    message: e.to_string(),
                }),
            Self::Periodic { interval_secs: 0 } => Err(TriggerError::ZeroInterval),
            Self::Periodic { interval_secs } if *interval_secs > MAX_INTERVAL_SECS => {
                Err(TriggerError::IntervalTooLarge(*interval_secs))
            }
            Self::Periodic { interval_secs } => Ok(CompiledTrigger::Periodic {
                interval_ms: (*interval_secs as i64) * 1000,
            }),
        }
    }
}

enum CompiledTrigger {
    Cron(Schedule),
    Periodic { interval_ms: i64 },
}

/// Prefix a seconds field onto standard 5-field expressions.
fn normalize_cron(expression: &str) -> String {
    let trimmed = expression.trim();
    if trimmed.split_whitespace().count() == 5 {
        format!("0 {trimmed}")
    } else {
        trimmed.to_string()
    }
}

/// Point to enumerate cron instants after, so that the first candidate is
/// both after the anchor and not before the start time.
fn scan_start(anchor: DateTime<Utc>, start: Option<DateTime<Utc>>) -> DateTime<Utc> {
    match start {
        Some(s) if s > anchor => s - TimeDelta::milliseconds(1),
        _ => anchor,
    }
}

fn offset(anchor: DateTime<Utc>, ms: i64) -> Option<DateTime<Utc>> {
    anchor.checked_add_signed(TimeDelta::try_milliseconds(ms)?)
}

/// Smallest `k >= 1` with `anchor + k * interval >= start`.
fn first_step(interval_ms: i64, anchor: DateTime<Utc>, start: Option<DateTime<Utc>>) -> i64 {
    match start {
        Some(s) if s > anchor => {
            let gap = (s - anchor).num_milliseconds();
            ((gap + interval_ms - 1) / interval_ms).max(1)
        }
        _ => 1,
    }
}

fn periodic_due(
    interval_ms: i64,
    anchor: DateTime<Utc>,
    start: Option<DateTime<Utc>>,
    horizon: DateTime<Utc>,
    max_catchup: usize,
) -> DueTriggers {
    let first = first_step(interval_ms, anchor, start);
    let last = (horizon - anchor).num_milliseconds() / interval_ms;
    if last < first {
        return DueTriggers::default();
    }

    let total = (last - first + 1) as u64;
    let keep = total.min(max_catchup as u64) as i64;
    let dropped = total - keep as u64;

    let instants = ((last - keep + 1)..=last)
        .filter_map(|k| offset(anchor, k * interval_ms))
        .collect();
    let latest_dropped = (dropped > 0)
        .then(|| offset(anchor, (last - keep) * interval_ms))
        .flatten();

    DueTriggers {
        instants,
        dropped,
        latest_dropped,
    }
}

/// Newest `max_catchup` cron instants in `(from, horizon]`.
///
/// Walks backwards from the horizon, so the cost is bounded by
/// `max_catchup + scan_limit` regardless of how long the pause was or how
/// the expression spaces its instants. Dropped instants are counted up to
/// `scan_limit`.
fn cron_due(
    schedule: &Schedule,
    from: DateTime<Utc>,
    horizon: DateTime<Utc>,
    max_catchup: usize,
    scan_limit: usize,
) -> DueTriggers {
    // Reverse iteration yields instants strictly before its starting point.
    let Some(upper) = horizon.checked_add_signed(TimeDelta::milliseconds(1)) else {
        return DueTriggers::default();
    };

    let mut newest_first = schedule
        .after(&upper)
        .rev()
        .skip_while(|t| *t > horizon)
        .take_while(|t| *t > from);

    let mut instants: Vec<DateTime<Utc>> = newest_first.by_ref().take(max_catchup).collect();
    instants.reverse();

    let latest_dropped = newest_first.next();
    let dropped = match latest_dropped {
        Some(_) => 1 + newest_first.take(scan_limit.saturating_sub(1)).count() as u64,
        None => 0,
    };

    DueTriggers {
        instants,
        dropped,
        latest_dropped,
    }
}

#[cfg(test)]
mod tests {
    use proptest::prelude::*;
    use rstest::rstest;

    use super::*;

    fn t0() -> DateTime<Utc> {
        DateTime::from_timestamp(1_700_000_000, 0).unwrap()
    }

    fn secs(n: i64) -> TimeDelta {
        TimeDelta::seconds(n)
    }

    #[test]
    fn test_periodic_first_pass_after_creation() {
        let window = ScheduleWindow::new(t0());
        let due = TriggerSpec::every(60)
            .next_instants(&window, None, t0() + secs(185), 10)
            .unwrap();

        assert_eq!(
            due.instants,
            vec![t0() + secs(60), t0() + secs(120), t0() + secs(180)]
        );
        assert_eq!(due.dropped, 0);
        assert_eq!(due.latest(), Some(t0() + secs(180)));
    }

    #[test]
    fn test_periodic_catchup_bound_keeps_newest() {
        let window = ScheduleWindow::new(t0());
        let due = TriggerSpec::every(60)
            .next_instants(&window, Some(t0()), t0() + secs(630), 3)
            .unwrap();

        assert_eq!(
            due.instants,
            vec![t0() + secs(480), t0() + secs(540), t0() + secs(600)]
        );
        assert_eq!(due.dropped, 7);
        assert_eq!(due.latest_dropped, Some(t0() + secs(420)));
    }

    #[test]
    fn test_periodic_nothing_due_yet() {
        let window = ScheduleWindow::new(t0());
        let due = TriggerSpec::every(60)
            .next_instants(&window, Some(t0() + secs(60)), t0() + secs(119), 10)
            .unwrap();
        assert!(due.is_empty());
        assert_eq!(due.latest(), None);
    }

    #[test]
    fn test_periodic_respects_start_time() {
        let window = ScheduleWindow::new(t0()).with_start(t0() + secs(150));
        let due = TriggerSpec::every(60)
            .next_instants(&window, None, t0() + secs(400), 10)
            .unwrap();

        // Anchored on the start time, first instant strictly after it.
        assert_eq!(
            due.instants,
            vec![t0() + secs(210), t0() + secs(270), t0() + secs(330), t0() + secs(390)]
        );
    }

    #[test]
    fn test_periodic_last_trigger_before_start() {
        let window = ScheduleWindow::new(t0()).with_start(t0() + secs(150));
        let due = TriggerSpec::every(60)
            .next_instants(&window, Some(t0()), t0() + secs(250), 10)
            .unwrap();
        assert_eq!(due.instants, vec![t0() + secs(180), t0() + secs(240)]);
    }

    #[test]
    fn test_periodic_respects_end_time() {
        let window = ScheduleWindow::new(t0()).with_end(t0() + secs(130));
        let due = TriggerSpec::every(60)
            .next_instants(&window, None, t0() + secs(600), 10)
            .unwrap();
        assert_eq!(due.instants, vec![t0() + secs(60), t0() + secs(120)]);

        let next = TriggerSpec::every(60)
            .next_instant(&window, Some(t0() + secs(120)))
            .unwrap();
        assert_eq!(next, None);
        assert!(window.has_ended(t0() + secs(131)));
    }

    #[test]
    fn test_zero_catchup_drops_everything() {
        let window = ScheduleWindow::new(t0());
        let due = TriggerSpec::every(60)
            .next_instants(&window, None, t0() + secs(300), 0)
            .unwrap();
        assert!(due.instants.is_empty());
        assert_eq!(due.dropped, 5);
        assert_eq!(due.latest_dropped, Some(t0() + secs(300)));
    }

    #[test]
    fn test_cron_five_field_expression() {
        // 2023-11-14T22:13:20Z; every 15 minutes.
        let window = ScheduleWindow::new(t0());
        let due = TriggerSpec::cron("*/15 * * * *")
            .next_instants(&window, None, t0() + secs(3600), 10)
            .unwrap();

        let expected: Vec<_> = ["22:15:00", "22:30:00", "22:45:00", "23:00:00"]
            .iter()
            .map(|hms| format!("2023-11-14T{hms}Z").parse::<DateTime<Utc>>().unwrap())
            .collect();
        assert_eq!(due.instants, expected);
    }

    #[test]
    fn test_cron_catchup_bound() {
        let window = ScheduleWindow::new(t0());
        let due = TriggerSpec::cron("0 * * * * *")
            .next_instants(&window, None, t0() + secs(600), 3)
            .unwrap();

        assert_eq!(due.instants.len(), 3);
        assert_eq!(due.dropped, 7);
        assert!(due.latest_dropped.unwrap() < due.instants[0]);
        assert!(due.instants.windows(2).all(|w| w[0] < w[1]));
    }

    #[test]
    fn test_cron_dropped_count_is_capped() {
        let schedule = Schedule::from_str("* * * * * *").unwrap();
        let due = cron_due(&schedule, t0(), t0() + secs(3600), 5, 100);

        let expected: Vec<_> = (3596..=3600).map(|s| t0() + secs(s)).collect();
        assert_eq!(due.instants, expected);
        assert_eq!(due.dropped, 100);
        assert_eq!(due.latest_dropped, Some(t0() + secs(3595)));
    }

    #[test]
    fn test_cron_irregular_spacing_after_long_pause() {
        // Every second during office hours, paused for a month and resumed
        // before the day's first instant.
        let window = ScheduleWindow::new(t0());
        let now: DateTime<Utc> = "2023-12-14T08:00:00Z".parse().unwrap();
        let due = TriggerSpec::cron("* * 9-17 * * *")
            .next_instants(&window, Some(t0()), now, 3)
            .unwrap();

        let expected: Vec<DateTime<Utc>> = ["17:59:57", "17:59:58", "17:59:59"]
            .iter()
            .map(|hms| format!("2023-12-13T{hms}Z").parse().unwrap())
            .collect();
        assert_eq!(due.instants, expected);
        assert_eq!(due.latest_dropped, Some("2023-12-13T17:59:56Z".parse().unwrap()));
        assert_eq!(due.dropped, CRON_SCAN_LIMIT as u64);
    }

    #[test]
    fn test_cron_hourly_office_hours_exact_count() {
        let window = ScheduleWindow::new(t0());
        let now: DateTime<Utc> = "2023-11-17T12:00:00Z".parse().unwrap();
        let due = TriggerSpec::cron("0 0 9-17 * * *")
            .next_instants(&window, Some(t0()), now, 2)
            .unwrap();

        assert_eq!(
            due.instants,
            vec![
                "2023-11-17T11:00:00Z".parse::<DateTime<Utc>>().unwrap(),
                "2023-11-17T12:00:00Z".parse().unwrap(),
            ]
        );
        // Nine a day on the 15th and 16th, two earlier on the 17th.
        assert_eq!(due.dropped, 20);
        assert_eq!(due.latest_dropped, Some("2023-11-17T10:00:00Z".parse().unwrap()));
    }

    #[test]
    fn test_next_instant_cron() {
        let window = ScheduleWindow::new(t0());
        let next = TriggerSpec::cron("0 0 * * * *")
            .next_instant(&window, Some(t0()))
            .unwrap();
        assert_eq!(next, Some("2023-11-14T23:00:00Z".parse().unwrap()));
    }

    #[test]
    fn test_next_instant_periodic() {
        let window = ScheduleWindow::new(t0());
        assert_eq!(
            TriggerSpec::every(90).next_instant(&window, None).unwrap(),
            Some(t0() + secs(90))
        );
        assert_eq!(
            TriggerSpec::every(90)
                .next_instant(&window, Some(t0() + secs(900)))
                .unwrap(),
            Some(t0() + secs(990))
        );
    }

    #[rstest]
    #[case(TriggerSpec::cron("not a cron"))]
    #[case(TriggerSpec::cron("61 * * * * *"))]
    #[case(TriggerSpec::every(0))]
    #[case(TriggerSpec::every(MAX_INTERVAL_SECS + 1))]
    fn test_malformed_specs_rejected(#[case] spec: TriggerSpec) {
        assert!(spec.validate().is_err());
        let window = ScheduleWindow::new(t0());
        assert!(spec.next_instants(&window, None, t0() + secs(60), 1).is_err());
    }

    #[test]
    fn test_inverted_window_rejected() {
        let window = ScheduleWindow::new(t0())
            .with_start(t0() + secs(60))
            .with_end(t0());
        let err = TriggerSpec::every(60)
            .next_instants(&window, None, t0() + secs(600), 1)
            .unwrap_err();
        assert!(matches!(err, TriggerError::InvertedWindow { .. }));
    }

    #[test]
    fn test_window_before_epoch_rejected() {
        let before_epoch = DateTime::<Utc>::UNIX_EPOCH - secs(1);
        let window = ScheduleWindow::new(t0()).with_start(before_epoch);
        assert_eq!(window.validate(), Err(TriggerError::BeforeEpoch(before_epoch)));
        assert!(TriggerSpec::every(60)
            .next_instants(&window, None, t0(), 1)
            .is_err());

        let window = ScheduleWindow::new(t0()).with_end(before_epoch);
        assert!(window.validate().is_err());

        let window = ScheduleWindow::new(t0()).with_start(DateTime::<Utc>::UNIX_EPOCH);
        assert!(window.validate().is_ok());
    }

    #[test]
    fn test_trigger_spec_serde_shape() {
        let json = serde_json::to_value(TriggerSpec::every(60)).unwrap();
        assert_eq!(json, serde_json::json!({"kind": "periodic", "interval_secs": 60}));

        let spec: TriggerSpec =
            serde_json::from_value(serde_json::json!({"kind": "cron", "expression": "@hourly"}))
                .unwrap();
        assert_eq!(spec, TriggerSpec::cron("@hourly"));
        assert!(spec.validate().is_ok());
    }

    proptest! {
        #[test]
        fn prop_periodic_due_is_bounded_and_ordered(
            interval in 1u64..3_600,
            last_offset in 0i64..10_000,
            elapsed in 0i64..200_000,
            max_catchup in 0usize..20,
        ) {
            let window = ScheduleWindow::new(t0());
            let last = t0() + secs(last_offset);
            let now = last + secs(elapsed);
            let due = TriggerSpec::every(interval)
                .next_instants(&window, Some(last), now, max_catchup)
                .unwrap();

            let total = (elapsed as u64) / interval;
            prop_assert_eq!(due.instants.len() as u64 + due.dropped, total);
            prop_assert!(due.instants.len() <= max_catchup);
            prop_assert!(due.instants.windows(2).all(|w| w[0] < w[1]));
            for instant in &due.instants {
                prop_assert!(*instant > last && *instant <= now);
                prop_assert_eq!((*instant - last).num_seconds() as u64 % interval, 0);
            }
            if let (Some(dropped), Some(first)) = (due.latest_dropped, due.instants.first()) {
                prop_assert!(dropped < *first);
            }
        }

        #[test]
        fn prop_cron_due_matches_forward_scan(
            expression in prop::sample::select(vec![
                "*/7 * * * * *",
                "13,47 * * * * *",
                "0 */5 9-17 * * *",
                "30 0 * * * *",
            ]),
            from_offset in 0i64..86_400,
            elapsed in 0i64..20_000,
            max_catchup in 0usize..10,
        ) {
            let schedule = Schedule::from_str(expression).unwrap();
            let from = t0() + secs(from_offset);
            let horizon = from + secs(elapsed);

            let all: Vec<_> = schedule.after(&from).take_while(|t| *t <= horizon).collect();
            let keep = all.len().min(max_catchup);
            let split = all.len() - keep;

            let due = cron_due(&schedule, from, horizon, max_catchup, usize::MAX);
            prop_assert_eq!(&due.instants, &all[split..].to_vec());
            prop_assert_eq!(due.dropped, split as u64);
            prop_assert_eq!(due.latest_dropped, split.checked_sub(1).map(|i| all[i]));
        }
    }
}
