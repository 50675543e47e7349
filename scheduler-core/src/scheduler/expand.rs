//! Pure cron expansion over timezone-aware windows.
//!
//! `expand` enumerates UTC fire times within `[window_start, window_end]`;
//! `next_after` returns the first fire strictly after a reference instant.
//! Both convert the window into the task's declared IANA zone before
//! iterating the cron calendar, and convert results back to UTC — this is
//! what makes DST forward-gaps and backward-folds fall out naturally rather
//! than needing special-case handling.

use std::str::FromStr;

use chrono::{DateTime, Duration, TimeZone, Utc};
use chrono_tz::Tz;
use cron::Schedule;

use crate::error::ScheduleError;
use crate::ledger::ScheduleKind;

/// Expand a cron schedule into every UTC instant in `[window_start, window_end]`.
pub fn expand(
    kind: ScheduleKind,
    expr: &str,
    timezone: &str,
    window_start: DateTime<Utc>,
    window_end: DateTime<Utc>,
) -> Result<Vec<DateTime<Utc>>, ScheduleError> {
    if kind != ScheduleKind::Cron {
        return Err(ScheduleError::UnsupportedSchedule(kind));
    }

    let tz = parse_timezone(timezone)?;
    let schedule = parse_cron(expr)?;

    let start_local = window_start.with_timezone(&tz);
    let end_local = window_end.with_timezone(&tz);

    let mut due = Vec::new();
    for candidate in schedule.after(&(start_local - Duration::seconds(1))) {
        if candidate > end_local {
            break;
        }
        if candidate < start_local {
            continue;
        }
        due.push(candidate.with_timezone(&Utc));
    }
    Ok(due)
}

/// First fire strictly after `reference`, used only to populate
/// `Task.next_run_at` for observability.
pub fn next_after(
    kind: ScheduleKind,
    expr: &str,
    timezone: &str,
    reference: DateTime<Utc>,
) -> Result<DateTime<Utc>, ScheduleError> {
    if kind != ScheduleKind::Cron {
        return Err(ScheduleError::UnsupportedSchedule(kind));
    }

    let tz = parse_timezone(timezone)?;
    let schedule = parse_cron(expr)?;
    let reference_local = reference.with_timezone(&tz);

    schedule
        .after(&reference_local)
        .next()
        .map(|next_local| next_local.with_timezone(&Utc))
        .ok_or(ScheduleError::Exhausted)
}

/// Schedule expressions are accepted in the standard 5-field UNIX form
/// (`min hour day month weekday`), matching the reference cron semantics
/// the source this was distilled from expects. The `cron` crate requires a
/// leading seconds field, so a 5-field expression is widened to 6 fields by
/// pinning seconds to `0`.
fn parse_cron(expr: &str) -> Result<Schedule, ScheduleError> {
    let field_count = expr.split_whitespace().count();
    let normalized = if field_count == 5 {
        format!("0 {expr}")
    } else {
        expr.to_string()
    };
    Schedule::from_str(&normalized).map_err(|source| ScheduleError::InvalidCron {
        expr: expr.to_string(),
        source,
    })
}

fn parse_timezone(name: &str) -> Result<Tz, ScheduleError> {
    Tz::from_str(name).map_err(|_| ScheduleError::UnknownTimezone(name.to_string()))
}
