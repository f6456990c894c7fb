//! Five-field cron expressions: parsing, matching, next-run search and
//! human-readable descriptions.
//!
//! Fields are `minute hour day-of-month month day-of-week`. Everything in this
//! module is pure and operates on local wall-clock time (`NaiveDateTime`);
//! timezone handling lives in [`crate::scheduler::schedule`].

mod describe;
mod next;
mod parse;

pub use self::describe::describe;
pub use self::next::{matches, next_run, MAX_SEARCH_MINUTES};
pub use self::parse::parse;

use std::collections::BTreeSet;
use std::fmt;
use thiserror::Error;

/// Which of the five positions a field occupies.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FieldKind {
    Minute,
    Hour,
    DayOfMonth,
    Month,
    DayOfWeek,
}

impl FieldKind {
    /// Inclusive `(min, max)` domain of the field.
    pub fn bounds(self) -> (u32, u32) {
        match self {
            FieldKind::Minute => (0, 59),
            FieldKind::Hour => (0, 23),
            FieldKind::DayOfMonth => (1, 31),
            FieldKind::Month => (1, 12),
            FieldKind::DayOfWeek => (0, 6),
        }
    }
}

impl fmt::Display for FieldKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FieldKind::Minute => write!(f, "minute"),
            FieldKind::Hour => write!(f, "hour"),
            FieldKind::DayOfMonth => write!(f, "day-of-month"),
            FieldKind::Month => write!(f, "month"),
            FieldKind::DayOfWeek => write!(f, "day-of-week"),
        }
    }
}

/// Errors produced while parsing an expression or searching for its next run.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CronError {
    #[error("expected 5 fields (minute hour day-of-month month day-of-week), found {found}")]
    FieldCount { found: usize },

    #[error("value out of range in {field}: {value} (allowed {min}-{max})")]
    OutOfRange {
        field: FieldKind,
        value: u32,
        min: u32,
        max: u32,
    },

    #[error("invalid range in {field}: {start}-{end}")]
    InvertedRange { field: FieldKind, start: u32, end: u32 },

    #[error("invalid step value in {field}: {step}")]
    InvalidStep { field: FieldKind, step: String },

    #[error("invalid value in {field}: {token:?}")]
    InvalidToken { field: FieldKind, token: String },

    #[error("{field} matches no values")]
    EmptyField { field: FieldKind },

    #[error("no matching time found within {} days", MAX_SEARCH_MINUTES / (24 * 60))]
    NoRunFound,

    #[error("schedule only matches February 29 and cannot run every year")]
    LeapDayOnly,
}

impl CronError {
    /// True for malformed-expression errors, false for an unsatisfiable schedule.
    pub fn is_invalid_expression(&self) -> bool {
        !matches!(self, CronError::NoRunFound | CronError::LeapDayOnly)
    }
}

/// One parsed field: the sorted set of admissible values.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Field {
    values: BTreeSet<u32>,
    wildcard: bool,
}

impl Field {
    pub(crate) fn new(values: BTreeSet<u32>, wildcard: bool) -> Self {
        Self { values, wildcard }
    }

    /// True when the field was written as a bare `*`.
    pub fn is_wildcard(&self) -> bool {
        self.wildcard
    }

    pub fn contains(&self, value: u32) -> bool {
        self.values.contains(&value)
    }

    /// Smallest admissible value that is `>= from`.
    pub fn next_at_or_after(&self, from: u32) -> Option<u32> {
        self.values.range(from..).next().copied()
    }

    pub fn first(&self) -> u32 {
        // Parsing rejects empty fields.
        self.values.iter().next().copied().unwrap_or_default()
    }

    pub fn values(&self) -> impl Iterator<Item = u32> + '_ {
        self.values.iter().copied()
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }
}

/// A validated five-field cron expression.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CronExpression {
    pub minute: Field,
    pub hour: Field,
    pub day_of_month: Field,
    pub month: Field,
    pub day_of_week: Field,
}

impl CronExpression {
    /// Cron's day rule. A bare `*` field does not take part; when both
    /// day-of-month and day-of-week are restricted, either one matching is
    /// enough.
    pub fn day_matches(&self, day_of_month: u32, day_of_week: u32) -> bool {
        let dom = self.day_of_month.contains(day_of_month);
        let dow = self.day_of_week.contains(day_of_week);
        match (self.day_of_month.is_wildcard(), self.day_of_week.is_wildcard()) {
            (true, true) => true,
            (false, true) => dom,
            (true, false) => dow,
            (false, false) => dom || dow,
        }
    }

    /// Whether some admissible day exists in every year, leap or not.
    ///
    /// Only a restricted day-of-month with a bare `*` day-of-week can be
    /// confined to February 29; every other combination admits days in
    /// every month the expression names.
    pub fn recurs_every_year(&self) -> bool {
        const COMMON_YEAR_DAYS: [u32; 12] = [31, 28, 31, 30, 31, 30, 31, 31, 30, 31, 30, 31];
        if self.day_of_month.is_wildcard() || !self.day_of_week.is_wildcard() {
            return true;
        }
        let earliest_day = self.day_of_month.first();
        self.month
            .values()
            .any(|m| earliest_day <= COMMON_YEAR_DAYS[(m - 1) as usize])
    }
}

impl std::str::FromStr for CronExpression {
    type Err = CronError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        parse(s)
    }
}
