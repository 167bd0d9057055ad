//! Cron expression parsing.

use std::collections::HashSet;

use super::field::CronField;
use super::{CronFormatError, CronSchedule, DayOfMonthSpec, DayOfWeekSpec};

const MONTH_NAMES: [&str; 12] = [
    "JAN", "FEB", "MAR", "APR", "MAY", "JUN", "JUL", "AUG", "SEP", "OCT", "NOV", "DEC",
];
const DAY_NAMES: [&str; 7] = ["SUN", "MON", "TUE", "WED", "THU", "FRI", "SAT"];

const MIN_YEAR: i32 = 1970;
const MAX_YEAR: i32 = 2099;

struct FieldSpec {
    label: &'static str,
    min: u8,
    max: u8,
    names: Option<&'static [&'static str]>,
    /// Whether `a-b` with a > b wraps around the range end (weekdays only).
    allow_wrap: bool,
}

const SECONDS: FieldSpec = FieldSpec {
    label: "seconds",
    min: 0,
    max: 59,
    names: None,
    allow_wrap: false,
};
const MINUTES: FieldSpec = FieldSpec {
    label: "minutes",
    min: 0,
    max: 59,
    names: None,
    allow_wrap: false,
};
const HOURS: FieldSpec = FieldSpec {
    label: "hours",
    min: 0,
    max: 23,
    names: None,
    allow_wrap: false,
};
const DAYS_OF_MONTH: FieldSpec = FieldSpec {
    label: "day-of-month",
    min: 1,
    max: 31,
    names: None,
    allow_wrap: false,
};
const MONTHS: FieldSpec = FieldSpec {
    label: "months",
    min: 1,
    max: 12,
    names: Some(&MONTH_NAMES),
    allow_wrap: false,
};
const DAYS_OF_WEEK: FieldSpec = FieldSpec {
    label: "day-of-week",
    min: 0,
    max: 6,
    names: Some(&DAY_NAMES),
    allow_wrap: true,
};

impl CronSchedule {
    /// Parse one of the four supported shapes. Six-field expressions are
    /// year-form when the final field contains a four-digit number,
    /// seconds-form otherwise.
    pub fn parse(expression: &str) -> Result<Self, CronFormatError> {
        let fields: Vec<&str> = expression.split_whitespace().collect();

        let (sec, min, hour, dom, mon, dow, year) = match fields.len() {
            5 => (None, fields[0], fields[1], fields[2], fields[3], fields[4], None),
            6 => {
                if looks_like_year_field(fields[5]) {
                    (
                        None, fields[0], fields[1], fields[2], fields[3], fields[4],
                        Some(fields[5]),
                    )
                } else {
                    (
                        Some(fields[0]),
                        fields[1],
                        fields[2],
                        fields[3],
                        fields[4],
                        fields[5],
                        None,
                    )
                }
            }
            7 => (
                Some(fields[0]),
                fields[1],
                fields[2],
                fields[3],
                fields[4],
                fields[5],
                Some(fields[6]),
            ),
            n => {
                return Err(CronFormatError::new(
                    expression.trim(),
                    format!("expected 5, 6 or 7 fields, found {}", n),
                ))
            }
        };

        let seconds = match sec {
            Some(text) => parse_plain_field(text, &SECONDS)?,
            None => CronField::from_value(0),
        };

        let schedule = CronSchedule {
            seconds,
            minutes: parse_plain_field(min, &MINUTES)?,
            hours: parse_plain_field(hour, &HOURS)?,
            day_of_month: parse_day_of_month(dom)?,
            months: parse_plain_field(mon, &MONTHS)?,
            day_of_week: parse_day_of_week(dow)?,
            years: match year {
                Some(text) => parse_year_field(text)?,
                None => None,
            },
            expression: String::new(),
        };
        Ok(schedule.with_expression(expression))
    }
}

/// A six-field expression is year-form iff the last field contains a
/// four-digit number.
fn looks_like_year_field(text: &str) -> bool {
    let mut digits = 0usize;
    for c in text.chars() {
        if c.is_ascii_digit() {
            digits += 1;
            if digits >= 4 {
                return true;
            }
        } else {
            digits = 0;
        }
    }
    false
}

fn parse_plain_field(text: &str, spec: &FieldSpec) -> Result<CronField, CronFormatError> {
    if text == "*" || text == "?" {
        return Ok(CronField::from_range(spec.min, spec.max));
    }

    let mut field = CronField::empty();
    for item in text.split(',') {
        if item.is_empty() {
            return Err(CronFormatError::new(
                text,
                format!("empty list item in {} field", spec.label),
            ));
        }
        field = field.union(parse_item(item, spec)?);
    }
    Ok(field)
}

fn parse_item(item: &str, spec: &FieldSpec) -> Result<CronField, CronFormatError> {
    let (range_part, step) = match item.split_once('/') {
        Some((range, step_text)) => {
            let step: u8 = step_text.parse().map_err(|_| {
                CronFormatError::new(item, format!("invalid step in {} field", spec.label))
            })?;
            if step == 0 {
                return Err(CronFormatError::new(
                    item,
                    format!("step must be at least 1 in {} field", spec.label),
                ));
            }
            (range, Some(step))
        }
        None => (item, None),
    };

    if range_part == "*" || range_part == "?" {
        return Ok(CronField::from_step_range(
            spec.min,
            spec.max,
            step.unwrap_or(1),
        ));
    }

    if let Some((start_text, end_text)) = range_part.split_once('-') {
        let start = parse_value(start_text, spec)?;
        let end = parse_value(end_text, spec)?;
        let step = step.unwrap_or(1);
        if start <= end {
            return Ok(CronField::from_step_range(start, end, step));
        }
        if !spec.allow_wrap {
            return Err(CronFormatError::new(
                item,
                format!("range start exceeds end in {} field", spec.label),
            ));
        }
        // Wrapped range (e.g. SAT-MON): step over the concatenated sequence.
        let sequence = (start..=spec.max).chain(spec.min..=end);
        let mut field = CronField::empty();
        for (i, v) in sequence.enumerate() {
            if i % step as usize == 0 {
                field.insert(v);
            }
        }
        return Ok(field);
    }

    let value = parse_value(range_part, spec)?;
    match step {
        // `a/step` runs from a to the end of the range.
        Some(step) => Ok(CronField::from_step_range(value, spec.max, step)),
        None => Ok(CronField::from_value(value)),
    }
}

fn parse_value(text: &str, spec: &FieldSpec) -> Result<u8, CronFormatError> {
    if let Some(names) = spec.names {
        let upper = text.to_ascii_uppercase();
        if let Some(idx) = names.iter().position(|n| *n == upper) {
            return Ok(spec.min + idx as u8);
        }
    }

    let value: u8 = text.parse().map_err(|_| {
        CronFormatError::new(text, format!("invalid value in {} field", spec.label))
    })?;

    // Both 0 and 7 mean Sunday.
    if spec.label == "day-of-week" && value == 7 {
        return Ok(0);
    }
    if value < spec.min || value > spec.max {
        return Err(CronFormatError::new(
            text,
            format!(
                "value out of range {}-{} in {} field",
                spec.min, spec.max, spec.label
            ),
        ));
    }
    Ok(value)
}

fn parse_day_of_month(text: &str) -> Result<DayOfMonthSpec, CronFormatError> {
    match text {
        "*" | "?" => Ok(DayOfMonthSpec::Any),
        "L" => Ok(DayOfMonthSpec::Last { offset: 0 }),
        "LW" => Ok(DayOfMonthSpec::LastWeekday),
        _ if text.starts_with("L-") => {
            let offset: u32 = text[2..].parse().map_err(|_| {
                CronFormatError::new(text, "invalid offset after L- in day-of-month field")
            })?;
            if offset > 30 {
                return Err(CronFormatError::new(
                    text,
                    "L- offset must be at most 30 in day-of-month field",
                ));
            }
            Ok(DayOfMonthSpec::Last { offset })
        }
        _ if text.ends_with('W') => {
            let day: u32 = text[..text.len() - 1].parse().map_err(|_| {
                CronFormatError::new(text, "invalid day before W in day-of-month field")
            })?;
            if !(1..=31).contains(&day) {
                return Err(CronFormatError::new(
                    text,
                    "W day must be between 1 and 31 in day-of-month field",
                ));
            }
            Ok(DayOfMonthSpec::NearestWeekday(day))
        }
        _ => Ok(DayOfMonthSpec::Days(parse_plain_field(
            text,
            &DAYS_OF_MONTH,
        )?)),
    }
}

fn parse_day_of_week(text: &str) -> Result<DayOfWeekSpec, CronFormatError> {
    match text {
        "*" | "?" => Ok(DayOfWeekSpec::Any),
        _ if text.contains('#') => {
            let (weekday_text, nth_text) = text.split_once('#').unwrap();
            let weekday = parse_value(weekday_text, &DAYS_OF_WEEK)?;
            let nth: u8 = nth_text.parse().map_err(|_| {
                CronFormatError::new(text, "invalid occurrence after # in day-of-week field")
            })?;
            if !(1..=5).contains(&nth) {
                return Err(CronFormatError::new(
                    text,
                    "occurrence after # must be between 1 and 5",
                ));
            }
            Ok(DayOfWeekSpec::Nth { weekday, nth })
        }
        _ if text.len() > 1 && text.ends_with('L') => {
            let weekday = parse_value(&text[..text.len() - 1], &DAYS_OF_WEEK)?;
            Ok(DayOfWeekSpec::LastOfMonth(weekday))
        }
        _ => Ok(DayOfWeekSpec::Days(parse_plain_field(
            text,
            &DAYS_OF_WEEK,
        )?)),
    }
}

/// Years use a hash set because their range does not fit a 64-bit mask.
/// `*` (optionally with a step) stays unconstrained only for plain `*`.
fn parse_year_field(text: &str) -> Result<Option<HashSet<i32>>, CronFormatError> {
    if text == "*" || text == "?" {
        return Ok(None);
    }

    let mut years = HashSet::new();
    for item in text.split(',') {
        let (range_part, step) = match item.split_once('/') {
            Some((range, step_text)) => {
                let step: u32 = step_text
                    .parse()
                    .map_err(|_| CronFormatError::new(item, "invalid step in year field"))?;
                if step == 0 {
                    return Err(CronFormatError::new(item, "step must be at least 1"));
                }
                (range, step)
            }
            None => (item, 1),
        };

        let (start, end) = if range_part == "*" {
            (MIN_YEAR, MAX_YEAR)
        } else if let Some((a, b)) = range_part.split_once('-') {
            (parse_year(a)?, parse_year(b)?)
        } else {
            let v = parse_year(range_part)?;
            if step > 1 {
                (v, MAX_YEAR)
            } else {
                (v, v)
            }
        };
        if start > end {
            return Err(CronFormatError::new(
                item,
                "range start exceeds end in year field",
            ));
        }
        let mut y = start;
        while y <= end {
            years.insert(y);
            y += step as i32;
        }
    }
    Ok(Some(years))
}

fn parse_year(text: &str) -> Result<i32, CronFormatError> {
    let year: i32 = text
        .parse()
        .map_err(|_| CronFormatError::new(text, "invalid value in year field"))?;
    if !(MIN_YEAR..=MAX_YEAR).contains(&year) {
        return Err(CronFormatError::new(
            text,
            format!("year must be between {} and {}", MIN_YEAR, MAX_YEAR),
        ));
    }
    Ok(year)
}
