//! Next-run search.
//!
//! Field-carry search over local wall-clock time: an unmatched month jumps to
//! the next admissible month, an unmatched day to the next midnight, an
//! unmatched hour to the next admissible hour, an unmatched minute to the next
//! admissible minute. Every step moves the candidate strictly forward.

use super::{CronError, CronExpression};
use chrono::{Datelike, Duration, NaiveDate, NaiveDateTime, Timelike};

/// Upper bound of the search window, in minutes after the first candidate.
pub const MAX_SEARCH_MINUTES: i64 = 366 * 24 * 60;

/// Next instant strictly after `after` at which `expr` fires, truncated to the
/// minute.
pub fn next_run(expr: &CronExpression, after: NaiveDateTime) -> Result<NaiveDateTime, CronError> {
    let start = truncate_to_minute(after)
        .checked_add_signed(Duration::minutes(1))
        .ok_or(CronError::NoRunFound)?;
    let limit = start
        .checked_add_signed(Duration::minutes(MAX_SEARCH_MINUTES))
        .ok_or(CronError::NoRunFound)?;

    let mut current = start;
    while current < limit {
        let date = current.date();

        if !expr.month.contains(date.month()) {
            current = next_month_start(expr, date)?;
            continue;
        }

        if !expr.day_matches(date.day(), date.weekday().num_days_from_sunday()) {
            current = next_midnight(date)?;
            continue;
        }

        let hour = current.hour();
        if !expr.hour.contains(hour) {
            current = match expr.hour.next_at_or_after(hour + 1) {
                Some(h) => at(date, h, 0)?,
                None => next_midnight(date)?,
            };
            continue;
        }

        let minute = current.minute();
        if !expr.minute.contains(minute) {
            current = match expr.minute.next_at_or_after(minute + 1) {
                Some(m) => at(date, hour, m)?,
                // Carry into the next hour and re-check it from the top.
                None => at(date, hour, 0)?
                    .checked_add_signed(Duration::hours(1))
                    .ok_or(CronError::NoRunFound)?,
            };
            continue;
        }

        return Ok(current);
    }

    Err(CronError::NoRunFound)
}

/// True when `instant` (seconds ignored) satisfies every field of `expr`.
pub fn matches(expr: &CronExpression, instant: NaiveDateTime) -> bool {
    expr.minute.contains(instant.minute())
        && expr.hour.contains(instant.hour())
        && expr.month.contains(instant.month())
        && expr.day_matches(instant.day(), instant.weekday().num_days_from_sunday())
}

fn truncate_to_minute(t: NaiveDateTime) -> NaiveDateTime {
    t - Duration::seconds(i64::from(t.second())) - Duration::nanoseconds(i64::from(t.nanosecond()))
}

fn at(date: NaiveDate, hour: u32, minute: u32) -> Result<NaiveDateTime, CronError> {
    date.and_hms_opt(hour, minute, 0).ok_or(CronError::NoRunFound)
}

fn next_midnight(date: NaiveDate) -> Result<NaiveDateTime, CronError> {
    let next = date.succ_opt().ok_or(CronError::NoRunFound)?;
    at(next, 0, 0)
}

fn next_month_start(expr: &CronExpression, date: NaiveDate) -> Result<NaiveDateTime, CronError> {
    let (year, month) = match expr.month.next_at_or_after(date.month() + 1) {
        Some(m) => (date.year(), m),
        None => (date.year() + 1, expr.month.first()),
    };
    let first = NaiveDate::from_ymd_opt(year, month, 1).ok_or(CronError::NoRunFound)?;
    at(first, 0, 0)
}
