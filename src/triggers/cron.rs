//! Cron schedule parsing and the scheduler task that walks the index of
//! cron triggers, firing each when its next instant arrives.

use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use chrono_tz::Tz;
use serde_json::Value;
use tokio::time::sleep;
use tracing::warn;
use uuid::Uuid;

use super::{FireCause, KindState, TriggerEngine};
use crate::database::types::TriggerStatus;
use crate::error::{ServiceError, ServiceResult};

/// Idle wake-up when no cron trigger is loaded.
const IDLE_WAKE: Duration = Duration::from_secs(60);

/// A cron expression bound to its evaluation timezone. Five-field
/// schedules get a seconds field of `0` prepended; six- and seven-field
/// expressions pass through.
pub struct ParsedSchedule {
    schedule: cron::Schedule,
    timezone: Tz,
}

impl ParsedSchedule {
    pub fn parse(expression: &str, timezone: &str) -> ServiceResult<Self> {
        let timezone: Tz = timezone
            .parse()
            .map_err(|_| ServiceError::invalid(format!("unknown timezone {timezone:?}")))?;

        let fields = expression.split_whitespace().count();
        let normalized = match fields {
            5 => format!("0 {expression}"),
            6 | 7 => expression.to_string(),
            _ => {
                return Err(ServiceError::invalid(format!(
                    "cron expression must have 5 or 6 fields, got {fields}"
                )))
            }
        };

        let schedule = cron::Schedule::from_str(&normalized)
            .map_err(|err| ServiceError::invalid(format!("invalid cron expression: {err}")))?;

        Ok(Self { schedule, timezone })
    }

    /// The next fire instant strictly after `after`.
    #[must_use]
    pub fn next_after(&self, after: DateTime<Utc>) -> Option<DateTime<Utc>> {
        self.schedule
            .after(&after.with_timezone(&self.timezone))
            .next()
            .map(|at| at.with_timezone(&Utc))
    }

    /// Rejects schedules that fire more often than the configured
    /// minimum interval, judged over the next few occurrences.
    pub fn enforce_min_interval(&self, min_interval: Duration) -> ServiceResult<()> {
        let occurrences: Vec<DateTime<Tz>> =
            self.schedule.upcoming(self.timezone).take(4).collect();

        for pair in occurrences.windows(2) {
            let gap = pair[1] - pair[0];
            if gap < chrono::Duration::from_std(min_interval).unwrap_or_default() {
                return Err(ServiceError::invalid(format!(
                    "schedule fires every {}s, minimum interval is {}s",
                    gap.num_seconds(),
                    min_interval.as_secs()
                )));
            }
        }

        Ok(())
    }
}

/// The cron wheel: computes due triggers, fires them, and sleeps until
/// the earliest next instant (or a change to the trigger set). Runs until
/// cancelled by the task monitor.
pub async fn run_cron_scheduler(engine: Arc<TriggerEngine>) -> anyhow::Result<()> {
    loop {
        let now = Utc::now();
        let mut due: Vec<(Uuid, Value)> = Vec::new();
        let mut next_wake: Option<DateTime<Utc>> = None;

        {
            let mut index = engine.index.lock().await;
            for active in index.values_mut() {
                if active.status != TriggerStatus::Active {
                    continue;
                }

                let KindState::Cron {
                    schedule,
                    params,
                    next_fire,
                } = &mut active.state
                else {
                    continue;
                };

                if next_fire.is_none() {
                    *next_fire = schedule.next_after(now);
                }

                if let Some(at) = *next_fire {
                    if at <= now {
                        due.push((active.id, params.clone()));
                        *next_fire = schedule.next_after(now);
                    }
                }

                if let Some(at) = *next_fire {
                    next_wake = Some(next_wake.map_or(at, |current| current.min(at)));
                }
            }
        }

        for (trigger_id, params) in due {
            if let Err(err) = engine.fire(trigger_id, params, FireCause::Schedule).await {
                warn!(trigger = %trigger_id, ?err, "Cron fire failed");
            }
        }

        let sleep_for = next_wake
            .and_then(|at| (at - Utc::now()).to_std().ok())
            .unwrap_or(IDLE_WAKE)
            .min(IDLE_WAKE);

        tokio::select! {
            () = sleep(sleep_for) => {}
            () = engine.cron_wake.notified() => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use chrono::TimeZone;

    use super::*;

    #[test]
    fn five_field_expressions_gain_a_seconds_field() {
        let schedule = ParsedSchedule::parse("*/5 * * * *", "UTC").unwrap();

        let after = Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 30).unwrap();
        let next = schedule.next_after(after).unwrap();

        assert_eq!(next, Utc.with_ymd_and_hms(2024, 5, 1, 12, 5, 0).unwrap());
    }

    #[test]
    fn six_field_expressions_pass_through() {
        let schedule = ParsedSchedule::parse("*/10 * * * * *", "UTC").unwrap();

        let after = Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 5).unwrap();
        let next = schedule.next_after(after).unwrap();

        assert_eq!(next, Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 10).unwrap());
    }

    #[test]
    fn rejects_wrong_field_counts() {
        assert!(ParsedSchedule::parse("* * *", "UTC").is_err());
        assert!(ParsedSchedule::parse("not a cron", "UTC").is_err());
        assert!(ParsedSchedule::parse("0 * * * *", "Mars/Olympus").is_err());
    }

    #[test]
    fn min_interval_is_enforced() {
        let every_10s = ParsedSchedule::parse("*/10 * * * * *", "UTC").unwrap();
        assert!(every_10s
            .enforce_min_interval(Duration::from_secs(60))
            .is_err());
        assert!(every_10s
            .enforce_min_interval(Duration::from_secs(10))
            .is_ok());

        let hourly = ParsedSchedule::parse("0 0 * * * *", "UTC").unwrap();
        assert!(hourly.enforce_min_interval(Duration::from_secs(60)).is_ok());
    }

    #[test]
    fn timezone_is_honoured() {
        // 09:00 in New York is 13:00/14:00 UTC depending on DST.
        let schedule = ParsedSchedule::parse("0 0 9 * * *", "America/New_York").unwrap();

        let after = Utc.with_ymd_and_hms(2024, 1, 15, 0, 0, 0).unwrap();
        let next = schedule.next_after(after).unwrap();

        assert_eq!(next, Utc.with_ymd_and_hms(2024, 1, 15, 14, 0, 0).unwrap());
    }
}
