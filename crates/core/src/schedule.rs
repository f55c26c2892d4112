//! Job schedules and next-occurrence calculation.
//!
//! A schedule is either a one-shot timestamp, a fixed interval, or a
//! standard 5-field cron expression evaluated in the job's IANA timezone.
//! All timing state lives in the store (`next_run_at`); this module only
//! computes the next wall-clock occurrence.

use std::str::FromStr;

use chrono::{DateTime, Duration, Utc};
use chrono_tz::Tz;
use croner::Cron;
use serde::{Deserialize, Serialize};

use crate::error::{DomainError, DomainResult};

/// Smallest accepted recurrence interval (1 second).
pub const MIN_INTERVAL_MS: i64 = 1_000;
/// Largest accepted recurrence interval (30 days).
pub const MAX_INTERVAL_MS: i64 = 2_592_000_000;

/// When a job runs.
///
/// The variants make "exactly one of scheduleTime, cronExpression,
/// interval" a type-level rule rather than a validation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Schedule {
    /// Run once at an absolute time.
    Once { at: DateTime<Utc> },
    /// Run every `interval_ms` milliseconds, measured from completion.
    Every { interval_ms: i64 },
    /// Run on a standard 5-field cron expression.
    Cron { expr: String },
}

impl Schedule {
    pub fn is_recurring(&self) -> bool {
        !matches!(self, Schedule::Once { .. })
    }

    /// Validate the schedule together with the job's timezone name.
    pub fn validate(&self, timezone: &str) -> DomainResult<()> {
        parse_timezone(timezone)?;
        match self {
            Schedule::Once { .. } => Ok(()),
            Schedule::Every { interval_ms } => {
                if !(MIN_INTERVAL_MS..=MAX_INTERVAL_MS).contains(interval_ms) {
                    return Err(DomainError::validation(format!(
                        "interval must be between {MIN_INTERVAL_MS} and {MAX_INTERVAL_MS} ms, got {interval_ms}"
                    )));
                }
                Ok(())
            }
            Schedule::Cron { expr } => {
                Cron::from_str(expr).map_err(|e| {
                    DomainError::validation(format!("invalid cron expression '{expr}': {e}"))
                })?;
                Ok(())
            }
        }
    }

    /// Next occurrence strictly after `now`, or `None` when the schedule
    /// has no further occurrence.
    ///
    /// Cron expressions are evaluated in `tz` and the result converted back
    /// to UTC. Callers apply any `end_time` bound themselves.
    pub fn next_occurrence(&self, now: DateTime<Utc>, tz: Tz) -> Option<DateTime<Utc>> {
        match self {
            Schedule::Once { at } => (*at > now).then_some(*at),
            Schedule::Every { interval_ms } => Some(now + Duration::milliseconds(*interval_ms)),
            Schedule::Cron { expr } => {
                let cron = Cron::from_str(expr).ok()?;
                let now_in_tz = now.with_timezone(&tz);
                cron.find_next_occurrence(&now_in_tz, false)
                    .ok()
                    .map(|next| next.with_timezone(&Utc))
            }
        }
    }
}

/// Parse an IANA timezone name.
pub fn parse_timezone(name: &str) -> DomainResult<Tz> {
    name.parse::<Tz>()
        .map_err(|_| DomainError::validation(format!("unknown timezone '{name}'")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn interval_bounds_are_enforced() {
        assert!(Schedule::Every { interval_ms: 999 }.validate("UTC").is_err());
        assert!(Schedule::Every { interval_ms: 1_000 }.validate("UTC").is_ok());
        assert!(Schedule::Every {
            interval_ms: MAX_INTERVAL_MS
        }
        .validate("UTC")
        .is_ok());
        assert!(Schedule::Every {
            interval_ms: MAX_INTERVAL_MS + 1
        }
        .validate("UTC")
        .is_err());
    }

    #[test]
    fn bad_cron_and_bad_timezone_are_rejected() {
        let bad = Schedule::Cron {
            expr: "not a cron".into(),
        };
        assert!(bad.validate("UTC").is_err());

        let ok = Schedule::Cron {
            expr: "*/5 * * * *".into(),
        };
        assert!(ok.validate("UTC").is_ok());
        assert!(ok.validate("Mars/Olympus").is_err());
    }

    #[test]
    fn interval_next_occurrence_advances_from_now() {
        let now = Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap();
        let sched = Schedule::Every { interval_ms: 5_000 };
        let next = sched.next_occurrence(now, chrono_tz::UTC).unwrap();
        assert_eq!(next, now + Duration::seconds(5));
    }

    #[test]
    fn once_in_the_past_has_no_next_occurrence() {
        let now = Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap();
        let sched = Schedule::Once {
            at: now - Duration::hours(1),
        };
        assert_eq!(sched.next_occurrence(now, chrono_tz::UTC), None);
    }

    #[test]
    fn cron_next_occurrence_is_strictly_after_now() {
        // Every 15 minutes on the hour grid.
        let sched = Schedule::Cron {
            expr: "*/15 * * * *".into(),
        };
        // Exactly on a match boundary: the next occurrence must be the
        // following slot, not the current instant.
        let now = Utc.with_ymd_and_hms(2024, 5, 1, 12, 15, 0).unwrap();
        let next = sched.next_occurrence(now, chrono_tz::UTC).unwrap();
        assert_eq!(next, Utc.with_ymd_and_hms(2024, 5, 1, 12, 30, 0).unwrap());
    }

    #[test]
    fn cron_respects_job_timezone() {
        // 09:00 every day, in New York. In UTC that is 13:00 (EDT, May).
        let sched = Schedule::Cron {
            expr: "0 9 * * *".into(),
        };
        let tz: Tz = "America/New_York".parse().unwrap();
        let now = Utc.with_ymd_and_hms(2024, 5, 1, 0, 0, 0).unwrap();
        let next = sched.next_occurrence(now, tz).unwrap();
        assert_eq!(next, Utc.with_ymd_and_hms(2024, 5, 1, 13, 0, 0).unwrap());
    }
}
