//! Human-readable schedule descriptions. Display only, never used for dispatch.

use super::{parse, Field};

const MONTHS: [&str; 12] = [
    "January", "February", "March", "April", "May", "June", "July", "August", "September",
    "October", "November", "December",
];
const WEEKDAYS: [&str; 7] = [
    "Sunday", "Monday", "Tuesday", "Wednesday", "Thursday", "Friday", "Saturday",
];

/// Describe a cron expression in plain English. Invalid input yields a
/// description of the error instead of failing.
pub fn describe(expression: &str) -> String {
    let expr = match parse(expression) {
        Ok(expr) => expr,
        Err(e) => return format!("Invalid cron expression: {e}"),
    };
    let raw: Vec<&str> = expression.split_whitespace().collect();

    let mut out = describe_time(&expr.minute, &expr.hour, raw[0]);

    let dom = !expr.day_of_month.is_wildcard();
    let dow = !expr.day_of_week.is_wildcard();
    let days_of_month = || format!("day {} of the month", ranges(&expr.day_of_month, |v| v.to_string()));
    let weekdays = || ranges(&expr.day_of_week, |v| WEEKDAYS[v as usize].to_string());
    match (dom, dow) {
        (true, true) => {
            out.push_str(&format!(", on {} or on {}", days_of_month(), weekdays()));
        }
        (true, false) => out.push_str(&format!(", on {}", days_of_month())),
        (false, true) => out.push_str(&format!(", on {}", weekdays())),
        (false, false) => {}
    }

    if !expr.month.is_wildcard() {
        let months = ranges(&expr.month, |v| MONTHS[(v - 1) as usize].to_string());
        out.push_str(&format!(", in {months}"));
    }

    out
}

fn describe_time(minute: &Field, hour: &Field, raw_minute: &str) -> String {
    let every_hour = hour.is_wildcard();

    if every_hour {
        if minute.is_wildcard() {
            return "Every minute".to_string();
        }
        // Only steps that divide the hour keep an even interval across `:00`.
        let even_step = raw_minute
            .strip_prefix("*/")
            .and_then(|step| step.parse::<u32>().ok())
            .filter(|n| *n < 60 && 60 % n == 0);
        match even_step {
            Some(1) => return "Every minute".to_string(),
            Some(n) => return format!("Every {n} minutes"),
            None => {}
        }
        if minute.len() == 1 {
            return format!("At minute {} past every hour", minute.first());
        }
        return format!("At minutes {} past every hour", ranges(minute, |v| v.to_string()));
    }

    if minute.len() == 1 && hour.len() <= 6 {
        let m = minute.first();
        let times: Vec<String> = hour.values().map(|h| format!("{h:02}:{m:02}")).collect();
        return format!("At {}", join(&times));
    }

    let minutes = if minute.is_wildcard() {
        "every minute".to_string()
    } else {
        format!("minute {}", ranges(minute, |v| v.to_string()))
    };
    format!("At {minutes} past hour {}", ranges(hour, |v| v.to_string()))
}

/// Collapse consecutive values into `a through b` runs.
fn ranges(field: &Field, name: impl Fn(u32) -> String) -> String {
    let mut runs: Vec<(u32, u32)> = Vec::new();
    for v in field.values() {
        match runs.last_mut() {
            Some((_, end)) if *end + 1 == v => *end = v,
            _ => runs.push((v, v)),
        }
    }

    let parts: Vec<String> = runs
        .into_iter()
        .flat_map(|(start, end)| match end - start {
            0 => vec![name(start)],
            1 => vec![name(start), name(end)],
            _ => vec![format!("{} through {}", name(start), name(end))],
        })
        .collect();
    join(&parts)
}

fn join(parts: &[String]) -> String {
    match parts {
        [] => String::new(),
        [one] => one.clone(),
        [init @ .., last] => format!("{} and {}", init.join(", "), last),
    }
}
