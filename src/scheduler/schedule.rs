//! Timezone-aware schedule evaluation.
//!
//! These are the pure functions the rest of the platform calls from request
//! handlers: they never touch the job store. The cron search runs on the job's
//! local wall clock and the result is converted back to UTC for storage.

use super::{Result, SchedulerError};
use crate::cron::{self, CronError, CronExpression};
use chrono::{DateTime, LocalResult, TimeZone, Utc};
use chrono_tz::Tz;
use serde::Serialize;

/// Upper bound on [`upcoming_runs`] results.
pub const MAX_PREVIEW_RUNS: usize = 100;

// Local candidates skipped while stepping over a DST gap or fold.
const MAX_LOCAL_CANDIDATES: usize = 24 * 60;

// Search windows tried at dispatch time. Eight cover the longest Gregorian
// gap between two February 29ths (2096 to 2104).
const LEAP_CYCLE_WINDOWS: usize = 8;

/// Result of validating a schedule string.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Validation {
    pub valid: bool,
    pub error: Option<String>,
}

pub fn parse_timezone(name: &str) -> Result<Tz> {
    name.parse::<Tz>()
        .map_err(|_| SchedulerError::InvalidTimezone(name.to_string()))
}

/// Validate a schedule: it must parse, have an upcoming run, and keep
/// having one every year.
pub fn validate_cron_expression(schedule: &str) -> Validation {
    let outcome = cron::parse(schedule).and_then(|expr| {
        cron::next_run(&expr, Utc::now().naive_utc())?;
        ensure_recurring(&expr)
    });
    match outcome {
        Ok(()) => Validation {
            valid: true,
            error: None,
        },
        Err(e) => Validation {
            valid: false,
            error: Some(e.to_string()),
        },
    }
}

pub fn describe_cron_schedule(schedule: &str) -> String {
    cron::describe(schedule)
}

/// Next run of `schedule` in `timezone`, strictly after now.
pub fn parse_next_run(schedule: &str, timezone: &str) -> Result<DateTime<Utc>> {
    compute_next_run(schedule, timezone, Utc::now())
}

/// Next run of `schedule` in `timezone`, strictly after `after`.
pub fn compute_next_run(schedule: &str, timezone: &str, after: DateTime<Utc>) -> Result<DateTime<Utc>> {
    let expr = cron::parse(schedule)?;
    let tz = parse_timezone(timezone)?;
    let next = next_occurrence(&expr, tz, after)?;
    ensure_recurring(&expr)?;
    Ok(next)
}

/// A schedule confined to February 29 would fire once and then find nothing
/// within the search window, so it is refused before it is ever stored.
fn ensure_recurring(expr: &CronExpression) -> std::result::Result<(), CronError> {
    if expr.recurs_every_year() {
        Ok(())
    } else {
        Err(CronError::LeapDayOnly)
    }
}

/// The next `count` runs (capped at [`MAX_PREVIEW_RUNS`]) after `after`.
pub fn upcoming_runs(
    schedule: &str,
    timezone: &str,
    after: DateTime<Utc>,
    count: usize,
) -> Result<Vec<DateTime<Utc>>> {
    let expr = cron::parse(schedule)?;
    let tz = parse_timezone(timezone)?;

    let mut runs = Vec::new();
    let mut cursor = after;
    for _ in 0..count.min(MAX_PREVIEW_RUNS) {
        match next_occurrence(&expr, tz, cursor) {
            Ok(next) => {
                runs.push(next);
                cursor = next;
            }
            // An empty preview is still a valid answer for a far-off schedule.
            Err(CronError::NoRunFound) if !runs.is_empty() => break,
            Err(e) => return Err(e.into()),
        }
    }
    ensure_recurring(&expr)?;
    Ok(runs)
}

/// Search in local time and map back to UTC.
///
/// Local times that fall in a spring-forward gap do not exist and are skipped.
/// Local times repeated by a fall-back resolve to the earliest instant that is
/// still strictly after `after`; each wall-clock minute fires at most once.
pub(crate) fn next_occurrence(
    expr: &CronExpression,
    tz: Tz,
    after: DateTime<Utc>,
) -> std::result::Result<DateTime<Utc>, CronError> {
    let mut local = after.with_timezone(&tz).naive_local();
    for _ in 0..MAX_LOCAL_CANDIDATES {
        let candidate = cron::next_run(expr, local)?;
        let resolved = match tz.from_local_datetime(&candidate) {
            LocalResult::Single(t) => vec![t],
            LocalResult::Ambiguous(early, late) => vec![early, late],
            LocalResult::None => Vec::new(),
        };
        if let Some(t) = resolved
            .into_iter()
            .map(|t| t.with_timezone(&Utc))
            .find(|t| *t > after)
        {
            return Ok(t);
        }
        local = candidate;
    }
    Err(CronError::NoRunFound)
}

/// [`next_occurrence`] that keeps searching past the one-year window, for
/// stored schedules that predate the every-year check.
pub(crate) fn next_occurrence_across_years(
    expr: &CronExpression,
    tz: Tz,
    after: DateTime<Utc>,
) -> std::result::Result<DateTime<Utc>, CronError> {
    // Consecutive windows overlap by a day so no local minute is skipped.
    let stride = chrono::Duration::minutes(cron::MAX_SEARCH_MINUTES - 24 * 60);
    let mut cursor = after;
    for _ in 0..LEAP_CYCLE_WINDOWS {
        match next_occurrence(expr, tz, cursor) {
            Err(CronError::NoRunFound) => cursor += stride,
            found => return found,
        }
    }
    Err(CronError::NoRunFound)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn utc(s: &str) -> DateTime<Utc> {
        DateTime::parse_from_rfc3339(s).unwrap().with_timezone(&Utc)
    }

    #[test]
    fn test_validate() {
        assert_eq!(
            validate_cron_expression("*/5 * * * *"),
            Validation {
                valid: true,
                error: None
            }
        );

        let v = validate_cron_expression("*/0 * * * *");
        assert!(!v.valid);
        assert_eq!(v.error.as_deref(), Some("invalid step value in minute: 0"));

        let v = validate_cron_expression("0 0 31 2 *");
        assert!(!v.valid);
        assert!(v.error.unwrap().starts_with("no matching time found"));
    }

    #[test]
    fn test_leap_day_only_schedule_is_refused() {
        // Feb 29 is inside the search window from here, but not every year.
        let err = compute_next_run("0 0 29 2 *", "UTC", utc("2024-01-10T00:00:00Z")).unwrap_err();
        assert!(matches!(err, SchedulerError::Cron(CronError::LeapDayOnly)));
        assert!(err.is_client_error());

        let err = upcoming_runs("0 0 29 2 *", "UTC", utc("2024-01-10T00:00:00Z"), 3).unwrap_err();
        assert!(matches!(err, SchedulerError::Cron(CronError::LeapDayOnly)));

        assert!(!validate_cron_expression("0 0 29 2 *").valid);
        assert!(validate_cron_expression("0 0 29 2 mon").valid);
    }

    #[test]
    fn test_search_across_years_reaches_next_leap_day() {
        let expr = cron::parse("0 0 29 2 *").unwrap();
        let after = utc("2024-02-29T00:00:10Z");
        assert_eq!(next_occurrence(&expr, Tz::UTC, after), Err(CronError::NoRunFound));
        assert_eq!(
            next_occurrence_across_years(&expr, Tz::UTC, after),
            Ok(utc("2028-02-29T00:00:00Z"))
        );
        // 2100 is not a leap year.
        assert_eq!(
            next_occurrence_across_years(&expr, Tz::UTC, utc("2096-03-01T00:00:00Z")),
            Ok(utc("2104-02-29T00:00:00Z"))
        );

        let never = cron::parse("0 0 31 2 *").unwrap();
        assert_eq!(
            next_occurrence_across_years(&never, Tz::UTC, after),
            Err(CronError::NoRunFound)
        );
    }

    #[test]
    fn test_describe_passthrough() {
        assert_eq!(describe_cron_schedule("* * * * *"), "Every minute");
    }

    #[test]
    fn test_utc_next_run() {
        let next = compute_next_run("0 0 1 * *", "UTC", utc("2024-01-15T10:00:00Z")).unwrap();
        assert_eq!(next, utc("2024-02-01T00:00:00Z"));
    }

    #[test]
    fn test_next_run_in_local_timezone() {
        // 09:00 in New York during EST is 14:00 UTC.
        let next = compute_next_run("0 9 * * *", "America/New_York", utc("2024-01-15T15:00:00Z")).unwrap();
        assert_eq!(next, utc("2024-01-16T14:00:00Z"));

        // Midnight in Tokyo is 15:00 UTC the previous day.
        let next = compute_next_run("0 0 * * *", "Asia/Tokyo", utc("2024-01-15T10:00:00Z")).unwrap();
        assert_eq!(next, utc("2024-01-15T15:00:00Z"));
    }

    #[test]
    fn test_spring_forward_gap_is_skipped() {
        // 2024-03-10 02:30 does not exist in New York.
        let next = compute_next_run("30 2 * * *", "America/New_York", utc("2024-03-10T05:00:00Z")).unwrap();
        // Next 02:30 local is on the 11th, now EDT (UTC-4).
        assert_eq!(next, utc("2024-03-11T06:30:00Z"));
    }

    #[test]
    fn test_fall_back_second_pass_keeps_its_offset() {
        // 2024-11-03 01:00-02:00 repeats in New York.
        let first = utc("2024-11-03T05:30:00Z"); // 01:30 EDT
        let next = compute_next_run("* * * * *", "America/New_York", first).unwrap();
        assert_eq!(next, utc("2024-11-03T05:31:00Z"));

        let second_pass = utc("2024-11-03T06:30:00Z"); // 01:30 EST
        let next = compute_next_run("* * * * *", "America/New_York", second_pass).unwrap();
        assert_eq!(next, utc("2024-11-03T06:31:00Z"));
    }

    #[test]
    fn test_fall_back_fold_fires_fixed_time_once() {
        // 01:30 EDT has run; the repeated 01:30 EST does not fire again.
        let first = utc("2024-11-03T05:30:00Z");
        let next = compute_next_run("30 1 * * *", "America/New_York", first).unwrap();
        assert_eq!(next, utc("2024-11-04T06:30:00Z"));

        // From before the fold, the earliest of the two 01:30s is taken.
        let before = utc("2024-11-03T04:00:00Z"); // 00:00 EDT
        let next = compute_next_run("30 1 * * *", "America/New_York", before).unwrap();
        assert_eq!(next, first);
    }

    #[test]
    fn test_invalid_timezone() {
        let err = compute_next_run("* * * * *", "Mars/Olympus", Utc::now()).unwrap_err();
        assert!(matches!(err, SchedulerError::InvalidTimezone(_)));
        assert!(err.is_client_error());
    }

    #[test]
    fn test_upcoming_runs() {
        let runs = upcoming_runs("0 */6 * * *", "UTC", utc("2024-01-01T00:00:00Z"), 4).unwrap();
        assert_eq!(
            runs,
            vec![
                utc("2024-01-01T06:00:00Z"),
                utc("2024-01-01T12:00:00Z"),
                utc("2024-01-01T18:00:00Z"),
                utc("2024-01-02T00:00:00Z"),
            ]
        );

        let capped = upcoming_runs("* * * * *", "UTC", Utc::now(), 1000).unwrap();
        assert_eq!(capped.len(), MAX_PREVIEW_RUNS);
    }

    #[test]
    fn test_parse_next_run_is_in_future() {
        let now = Utc::now();
        let next = parse_next_run("* * * * *", "Europe/Berlin").unwrap();
        assert!(next > now);
    }
}
