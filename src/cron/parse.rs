//! Expression parser.
//!
//! Per comma-separated element: `*`, `a`, `a-b`, `*/n`, `a-b/n` and `a/n`
//! (shorthand for `a-max/n`). Month and day-of-week accept three-letter
//! English names in any case.

use super::{CronError, CronExpression, Field, FieldKind};
use std::collections::BTreeSet;

const MONTH_NAMES: [&str; 12] = [
    "jan", "feb", "mar", "apr", "may", "jun", "jul", "aug", "sep", "oct", "nov", "dec",
];
const WEEKDAY_NAMES: [&str; 7] = ["sun", "mon", "tue", "wed", "thu", "fri", "sat"];

/// Parse a five-field cron expression.
pub fn parse(expression: &str) -> Result<CronExpression, CronError> {
    let fields: Vec<&str> = expression.split_whitespace().collect();
    if fields.len() != 5 {
        return Err(CronError::FieldCount {
            found: fields.len(),
        });
    }

    Ok(CronExpression {
        minute: parse_field(fields[0], FieldKind::Minute)?,
        hour: parse_field(fields[1], FieldKind::Hour)?,
        day_of_month: parse_field(fields[2], FieldKind::DayOfMonth)?,
        month: parse_field(fields[3], FieldKind::Month)?,
        day_of_week: parse_field(fields[4], FieldKind::DayOfWeek)?,
    })
}

fn parse_field(raw: &str, kind: FieldKind) -> Result<Field, CronError> {
    let mut values = BTreeSet::new();
    for element in raw.split(',') {
        parse_element(element, kind, &mut values)?;
    }
    if values.is_empty() {
        return Err(CronError::EmptyField { field: kind });
    }
    Ok(Field::new(values, raw == "*"))
}

fn parse_element(element: &str, kind: FieldKind, out: &mut BTreeSet<u32>) -> Result<(), CronError> {
    let (min, max) = kind.bounds();

    let (base, step) = match element.split_once('/') {
        Some((base, step)) => (base, Some(parse_step(step, kind)?)),
        None => (element, None),
    };

    let (start, end) = if base == "*" {
        (min, max)
    } else if let Some((lo, hi)) = base.split_once('-') {
        let start = parse_value(lo, kind)?;
        let end = parse_value(hi, kind)?;
        if start > end {
            return Err(CronError::InvertedRange {
                field: kind,
                start,
                end,
            });
        }
        (start, end)
    } else {
        let value = parse_value(base, kind)?;
        match step {
            Some(_) => (value, max),
            None => (value, value),
        }
    };

    let step = step.unwrap_or(1);
    out.extend((start..=end).step_by(step as usize));
    Ok(())
}

fn parse_step(raw: &str, kind: FieldKind) -> Result<u32, CronError> {
    let invalid = || CronError::InvalidStep {
        field: kind,
        step: raw.to_string(),
    };
    if raw.is_empty() || !raw.bytes().all(|b| b.is_ascii_digit()) {
        return Err(invalid());
    }
    match raw.parse::<u32>() {
        Ok(step) if step >= 1 => Ok(step),
        _ => Err(invalid()),
    }
}

fn parse_value(raw: &str, kind: FieldKind) -> Result<u32, CronError> {
    let (min, max) = kind.bounds();

    if !raw.is_empty() && raw.bytes().all(|b| b.is_ascii_digit()) {
        let value = raw.parse::<u32>().map_err(|_| CronError::InvalidToken {
            field: kind,
            token: raw.to_string(),
        })?;
        if value < min || value > max {
            return Err(CronError::OutOfRange {
                field: kind,
                value,
                min,
                max,
            });
        }
        return Ok(value);
    }

    let names: &[&str] = match kind {
        FieldKind::Month => &MONTH_NAMES,
        FieldKind::DayOfWeek => &WEEKDAY_NAMES,
        _ => &[],
    };
    let lower = raw.to_ascii_lowercase();
    names
        .iter()
        .position(|name| *name == lower)
        .map(|idx| idx as u32 + min)
        .ok_or_else(|| CronError::InvalidToken {
            field: kind,
            token: raw.to_string(),
        })
}
