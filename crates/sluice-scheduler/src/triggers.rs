//! Schedule evaluation: validation and next-fire computation.
//!
//! Cron expressions are evaluated in UTC. Classic five-field expressions
//! (`min hour dom month dow`) are accepted and run at second zero.

use chrono::{DateTime, TimeDelta, Utc};
use sluice_core::pipeline::{CatchUp, Schedule};
use std::str::FromStr;

/// Longest accepted interval: one hundred years.
pub const MAX_INTERVAL_SECS: u64 = 100 * 365 * 24 * 60 * 60;

/// Parse a cron expression, accepting five, six or seven fields.
pub fn parse_cron(expression: &str) -> Result<cron::Schedule, String> {
    let fields = expression.split_whitespace().count();
    let normalized = match fields {
        5 => format!("0 {}", expression.trim()),
        6 | 7 => expression.trim().to_string(),
        n => return Err(format!("expected 5 to 7 cron fields, got {}", n)),
    };
    cron::Schedule::from_str(&normalized).map_err(|e| e.to_string())
}

/// Check that a schedule can produce fire times.
pub fn validate(schedule: &Schedule) -> Result<(), String> {
    match schedule {
        Schedule::Cron { expression } => parse_cron(expression).map(|_| ()),
        Schedule::Interval { every_secs, .. } if *every_secs == 0 => {
            Err("interval must be at least one second".to_string())
        }
        Schedule::Interval { every_secs, .. } if *every_secs > MAX_INTERVAL_SECS => Err(format!(
            "interval must be at most {} seconds, got {}",
            MAX_INTERVAL_SECS, every_secs
        )),
        Schedule::Interval { .. } | Schedule::Manual => Ok(()),
    }
}

/// First fire time for a freshly registered trigger.
///
/// `None` for manual triggers and for times past the representable range.
pub fn first_fire(schedule: &Schedule, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
    match schedule {
        Schedule::Cron { expression } => next_cron(expression, now),
        Schedule::Interval {
            every_secs,
            start_at,
            ..
        } => match start_at {
            Some(start_at) => Some(*start_at),
            None => now.checked_add_signed(interval(*every_secs)?),
        },
        Schedule::Manual => None,
    }
}

/// Next fire time after a trigger due at `scheduled_for` fired at `now`.
///
/// A trigger fires at most once per tick however many occurrences were
/// missed. With [`CatchUp::Skip`] an interval stays on its original grid;
/// with [`CatchUp::FireOnce`] it restarts from `now`.
pub fn next_fire(
    schedule: &Schedule,
    scheduled_for: DateTime<Utc>,
    now: DateTime<Utc>,
) -> Option<DateTime<Utc>> {
    match schedule {
        Schedule::Cron { expression } => next_cron(expression, now),
        Schedule::Interval {
            every_secs,
            catch_up,
            ..
        } => {
            let step = interval(*every_secs)?;
            match catch_up {
                CatchUp::FireOnce => now.checked_add_signed(step),
                CatchUp::Skip => {
                    let step_ms = step.num_milliseconds().max(1);
                    let behind_ms = now
                        .signed_duration_since(scheduled_for)
                        .num_milliseconds()
                        .max(0);
                    let steps = behind_ms / step_ms + 1;
                    let ahead = TimeDelta::try_milliseconds(steps.checked_mul(step_ms)?)?;
                    scheduled_for.checked_add_signed(ahead)
                }
            }
        }
        Schedule::Manual => None,
    }
}

fn next_cron(expression: &str, after: DateTime<Utc>) -> Option<DateTime<Utc>> {
    parse_cron(expression).ok()?.after(&after).next()
}

fn interval(every_secs: u64) -> Option<TimeDelta> {
    TimeDelta::try_seconds(i64::try_from(every_secs.max(1)).ok()?)
}
