//! Cron expression evaluation.
//!
//! Supports four shapes: the classic five fields (minute, hour, day-of-month,
//! month, day-of-week), six fields with a leading seconds field, six fields
//! with a trailing year field, and seven fields with both. Day fields carry
//! the Quartz-style modifiers `L`, `L-n`, `W`, `LW` and `n#k`; month and
//! weekday names are accepted and weekday ranges may wrap (`SAT-MON`).
//!
//! Next-occurrence search runs in a target time zone and handles DST: local
//! times that do not exist (spring-forward gap) are skipped, ambiguous local
//! times (fall-back overlap) resolve to the instant with the larger UTC
//! offset, i.e. the earlier real instant.

mod field;
mod parser;
mod schedule;

use std::collections::HashSet;

pub use field::CronField;
pub use schedule::Occurrences;

/// Malformed cron expression, carrying the offending substring.
#[derive(Debug, Clone, thiserror::Error, PartialEq, Eq)]
#[error("invalid cron expression: {reason} (at \"{substring}\")")]
pub struct CronFormatError {
    pub substring: String,
    pub reason: String,
}

impl CronFormatError {
    pub(crate) fn new(substring: impl Into<String>, reason: impl Into<String>) -> Self {
        Self {
            substring: substring.into(),
            reason: reason.into(),
        }
    }
}

/// Day-of-month constraint.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum DayOfMonthSpec {
    /// `*` or `?`.
    Any,
    Days(CronField),
    /// `L` (offset 0) or `L-n`: n days before the last day of the month.
    Last { offset: u32 },
    /// `LW`: last weekday of the month.
    LastWeekday,
    /// `nW`: weekday nearest to day n, within the same month.
    NearestWeekday(u32),
}

/// Day-of-week constraint. Weekdays are 0 (Sunday) through 6; 7 normalizes
/// to 0.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum DayOfWeekSpec {
    Any,
    Days(CronField),
    /// `nL`: last occurrence of weekday n in the month.
    LastOfMonth(u8),
    /// `n#k`: the k-th occurrence of weekday n (1 ≤ k ≤ 5).
    Nth { weekday: u8, nth: u8 },
}

/// A parsed cron expression.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CronSchedule {
    pub(crate) seconds: CronField,
    pub(crate) minutes: CronField,
    pub(crate) hours: CronField,
    pub(crate) day_of_month: DayOfMonthSpec,
    pub(crate) months: CronField,
    pub(crate) day_of_week: DayOfWeekSpec,
    /// Year values; a hash set because the range exceeds 64 bits. `None`
    /// means unconstrained.
    pub(crate) years: Option<HashSet<i32>>,
    expression: String,
}

impl CronSchedule {
    pub fn expression(&self) -> &str {
        &self.expression
    }

    pub(crate) fn with_expression(mut self, expression: &str) -> Self {
        self.expression = expression.to_string();
        self
    }
}

impl std::str::FromStr for CronSchedule {
    type Err = CronFormatError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        CronSchedule::parse(s)
    }
}
