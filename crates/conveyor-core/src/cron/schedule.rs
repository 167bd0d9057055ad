//! Next-occurrence search.

use chrono::{DateTime, Datelike, Duration, LocalResult, NaiveDate, NaiveDateTime, TimeZone,
             Timelike, Weekday};

use super::{CronSchedule, DayOfMonthSpec, DayOfWeekSpec};

/// Search horizon in years. Expressions with no occurrence within it (e.g.
/// `0 0 30 2 *`) resolve to `None`.
const MAX_HORIZON_YEARS: i32 = 4;

impl CronSchedule {
    /// Earliest occurrence strictly after `after`, in `after`'s time zone,
    /// or `None` when no occurrence exists within the search horizon.
    pub fn next_after<Tz: TimeZone>(&self, after: &DateTime<Tz>) -> Option<DateTime<Tz>> {
        let tz = after.timezone();
        let horizon_year = after.year() + MAX_HORIZON_YEARS;
        let mut naive = (after.naive_local() + Duration::seconds(1)).with_nanosecond(0)?;

        loop {
            if naive.year() > horizon_year {
                return None;
            }

            // Year constraint: jump to Jan 1 of the next valid year.
            if let Some(years) = &self.years {
                if !years.contains(&naive.year()) {
                    let next = years.iter().copied().filter(|&y| y > naive.year()).min()?;
                    naive = start_of_year(next)?;
                    continue;
                }
            }

            // Month.
            match self.months.next_at_or_after(naive.month() as u8) {
                Some(m) if m as u32 == naive.month() => {}
                Some(m) => {
                    naive = NaiveDate::from_ymd_opt(naive.year(), m as u32, 1)?
                        .and_hms_opt(0, 0, 0)?;
                    continue;
                }
                None => {
                    naive = start_of_year(naive.year() + 1)?;
                    continue;
                }
            }

            // Day within the month.
            let last = last_day_of_month(naive.year(), naive.month());
            let mut day = naive.day();
            while day <= last && !self.day_matches(naive.year(), naive.month(), day) {
                day += 1;
            }
            if day > last {
                naive = start_of_next_month(naive.year(), naive.month())?;
                continue;
            }
            if day != naive.day() {
                naive = NaiveDate::from_ymd_opt(naive.year(), naive.month(), day)?
                    .and_hms_opt(0, 0, 0)?;
            }

            // Hour; on exhaustion move to the next day, resetting below.
            match self.hours.next_at_or_after(naive.hour() as u8) {
                Some(h) if h as u32 == naive.hour() => {}
                Some(h) => {
                    naive = naive.date().and_hms_opt(h as u32, 0, 0)?;
                }
                None => {
                    naive = naive.date().succ_opt()?.and_hms_opt(0, 0, 0)?;
                    continue;
                }
            }

            // Minute.
            match self.minutes.next_at_or_after(naive.minute() as u8) {
                Some(m) if m as u32 == naive.minute() => {}
                Some(m) => {
                    naive = naive.date().and_hms_opt(naive.hour(), m as u32, 0)?;
                }
                None => {
                    naive = naive.date().and_hms_opt(naive.hour(), 0, 0)?
                        + Duration::hours(1);
                    continue;
                }
            }

            // Second.
            match self.seconds.next_at_or_after(naive.second() as u8) {
                Some(s) if s as u32 == naive.second() => {}
                Some(s) => {
                    naive = naive
                        .date()
                        .and_hms_opt(naive.hour(), naive.minute(), s as u32)?;
                }
                None => {
                    naive = naive.date().and_hms_opt(naive.hour(), naive.minute(), 0)?
                        + Duration::minutes(1);
                    continue;
                }
            }

            // All fields match; resolve the local time in the target zone.
            match tz.from_local_datetime(&naive) {
                LocalResult::Single(dt) => return Some(dt),
                // Fall-back overlap: the instant with the larger UTC offset
                // is the earlier one.
                LocalResult::Ambiguous(earliest, _latest) => return Some(earliest),
                // Spring-forward gap: this local time does not exist.
                LocalResult::None => {
                    naive += Duration::minutes(1);
                    continue;
                }
            }
        }
    }

    /// Successive occurrences in `(from, to]`.
    pub fn occurrences<Tz: TimeZone>(
        &self,
        from: DateTime<Tz>,
        to: DateTime<Tz>,
    ) -> Occurrences<'_, Tz> {
        Occurrences {
            schedule: self,
            current: from,
            to,
        }
    }

    /// Classic cron day semantics: with both day fields unrestricted any day
    /// matches, a single restricted field constrains alone, and two
    /// restricted fields combine with OR.
    fn day_matches(&self, year: i32, month: u32, day: u32) -> bool {
        let date = match NaiveDate::from_ymd_opt(year, month, day) {
            Some(d) => d,
            None => return false,
        };
        let weekday = date.weekday().num_days_from_sunday() as u8;
        let last = last_day_of_month(year, month);

        let dom_restricted = !matches!(self.day_of_month, DayOfMonthSpec::Any);
        let dow_restricted = !matches!(self.day_of_week, DayOfWeekSpec::Any);

        let dom_match = match &self.day_of_month {
            DayOfMonthSpec::Any => true,
            DayOfMonthSpec::Days(field) => field.contains(day as u8),
            DayOfMonthSpec::Last { offset } => day + offset == last,
            DayOfMonthSpec::LastWeekday => Some(day) == last_weekday_of_month(year, month),
            DayOfMonthSpec::NearestWeekday(n) => {
                Some(day) == nearest_weekday(year, month, *n)
            }
        };
        let dow_match = match &self.day_of_week {
            DayOfWeekSpec::Any => true,
            DayOfWeekSpec::Days(field) => field.contains(weekday),
            DayOfWeekSpec::LastOfMonth(w) => weekday == *w && day + 7 > last,
            DayOfWeekSpec::Nth { weekday: w, nth } => {
                weekday == *w && (day - 1) / 7 + 1 == *nth as u32
            }
        };

        match (dom_restricted, dow_restricted) {
            (false, false) => true,
            (true, false) => dom_match,
            (false, true) => dow_match,
            (true, true) => dom_match || dow_match,
        }
    }
}

/// Iterator over successive occurrences; ends past `to`.
pub struct Occurrences<'a, Tz: TimeZone> {
    schedule: &'a CronSchedule,
    current: DateTime<Tz>,
    to: DateTime<Tz>,
}

impl<'a, Tz: TimeZone> Iterator for Occurrences<'a, Tz> {
    type Item = DateTime<Tz>;

    fn next(&mut self) -> Option<Self::Item> {
        let next = self.schedule.next_after(&self.current)?;
        if next > self.to {
            return None;
        }
        self.current = next.clone();
        Some(next)
    }
}

fn start_of_year(year: i32) -> Option<NaiveDateTime> {
    NaiveDate::from_ymd_opt(year, 1, 1)?.and_hms_opt(0, 0, 0)
}

fn start_of_next_month(year: i32, month: u32) -> Option<NaiveDateTime> {
    if month == 12 {
        start_of_year(year + 1)
    } else {
        NaiveDate::from_ymd_opt(year, month + 1, 1)?.and_hms_opt(0, 0, 0)
    }
}

fn last_day_of_month(year: i32, month: u32) -> u32 {
    let first_of_next = if month == 12 {
        NaiveDate::from_ymd_opt(year + 1, 1, 1)
    } else {
        NaiveDate::from_ymd_opt(year, month + 1, 1)
    };
    first_of_next
        .and_then(|d| d.pred_opt())
        .map(|d| d.day())
        .unwrap_or(28)
}

fn last_weekday_of_month(year: i32, month: u32) -> Option<u32> {
    let last = last_day_of_month(year, month);
    let date = NaiveDate::from_ymd_opt(year, month, last)?;
    Some(match date.weekday() {
        Weekday::Sat => last - 1,
        Weekday::Sun => last - 2,
        _ => last,
    })
}

/// Weekday nearest to day `n`, never leaving the month.
fn nearest_weekday(year: i32, month: u32, n: u32) -> Option<u32> {
    let last = last_day_of_month(year, month);
    let target = n.min(last);
    let date = NaiveDate::from_ymd_opt(year, month, target)?;
    Some(match date.weekday() {
        Weekday::Sat => {
            if target == 1 {
                target + 2
            } else {
                target - 1
            }
        }
        Weekday::Sun => {
            if target >= last {
                target - 2
            } else {
                target + 1
            }
        }
        _ => target,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use chrono_tz::America::New_York;
    use chrono_tz::Tz;

    fn local(tz: Tz, y: i32, mo: u32, d: u32, h: u32, mi: u32, s: u32) -> DateTime<Tz> {
        tz.with_ymd_and_hms(y, mo, d, h, mi, s).unwrap()
    }

    #[test]
    fn skips_spring_forward_gap() {
        // America/New_York jumps 02:00 -> 03:00 on 2024-03-10; 02:30 does
        // not exist that day.
        let schedule = CronSchedule::parse("0 30 2 * * *").unwrap();
        let from = local(New_York, 2024, 3, 10, 0, 0, 0);
        let next = schedule.next_after(&from).unwrap();
        assert_eq!(next, local(New_York, 2024, 3, 11, 2, 30, 0));
    }

    #[test]
    fn day_before_the_gap_still_fires() {
        let schedule = CronSchedule::parse("0 30 2 * * *").unwrap();
        let from = local(New_York, 2024, 3, 9, 0, 0, 0);
        let next = schedule.next_after(&from).unwrap();
        assert_eq!(next, local(New_York, 2024, 3, 9, 2, 30, 0));
    }

    #[test]
    fn ambiguous_fall_back_picks_larger_offset() {
        // 01:30 occurs twice on 2024-11-03; the EDT (-04:00) instant is the
        // earlier one and must win.
        let schedule = CronSchedule::parse("0 30 1 * * *").unwrap();
        let from = local(New_York, 2024, 11, 3, 0, 0, 0);
        let next = schedule.next_after(&from).unwrap();
        assert_eq!(
            next.with_timezone(&Utc),
            Utc.with_ymd_and_hms(2024, 11, 3, 5, 30, 0).unwrap()
        );
    }

    #[test]
    fn last_weekday_of_month_prefers_friday() {
        // August 2024 ends on a Saturday; LW resolves to Friday the 30th.
        let schedule = CronSchedule::parse("0 0 LW * ?").unwrap();
        let from = local(New_York, 2024, 8, 1, 0, 0, 0);
        let next = schedule.next_after(&from).unwrap();
        assert_eq!(next, local(New_York, 2024, 8, 30, 0, 0, 0));
    }

    #[test]
    fn last_day_offset() {
        let schedule = CronSchedule::parse("0 0 L-3 * ?").unwrap();
        let from = local(New_York, 2024, 1, 1, 0, 0, 0);
        let next = schedule.next_after(&from).unwrap();
        assert_eq!(next, local(New_York, 2024, 1, 28, 0, 0, 0));
    }

    #[test]
    fn nearest_weekday_rolls_off_weekends() {
        // 2024-06-15 is a Saturday; 15W resolves to Friday the 14th.
        let schedule = CronSchedule::parse("0 0 15W * ?").unwrap();
        let from = local(New_York, 2024, 6, 1, 0, 0, 0);
        let next = schedule.next_after(&from).unwrap();
        assert_eq!(next, local(New_York, 2024, 6, 14, 0, 0, 0));

        // 2024-09-15 is a Sunday; 15W resolves to Monday the 16th.
        let from = local(New_York, 2024, 9, 1, 0, 0, 0);
        let next = schedule.next_after(&from).unwrap();
        assert_eq!(next, local(New_York, 2024, 9, 16, 0, 0, 0));
    }

    #[test]
    fn nth_weekday() {
        let schedule = CronSchedule::parse("0 0 ? * MON#2").unwrap();
        let from = local(New_York, 2024, 1, 1, 0, 0, 0);
        let next = schedule.next_after(&from).unwrap();
        assert_eq!(next, local(New_York, 2024, 1, 8, 0, 0, 0));
    }

    #[test]
    fn last_weekday_of_month_in_dow_field() {
        // Last Friday of June 2024 is the 28th.
        let schedule = CronSchedule::parse("0 0 ? * 5L").unwrap();
        let from = local(New_York, 2024, 6, 1, 0, 0, 0);
        let next = schedule.next_after(&from).unwrap();
        assert_eq!(next, local(New_York, 2024, 6, 28, 0, 0, 0));
    }

    #[test]
    fn specific_dom_and_dow_combine_with_or() {
        let schedule = CronSchedule::parse("0 0 13 * FRI").unwrap();
        let from = local(New_York, 2024, 9, 1, 0, 0, 0);
        let first = schedule.next_after(&from).unwrap();
        assert_eq!(first, local(New_York, 2024, 9, 6, 0, 0, 0)); // Friday
        let second = schedule.next_after(&first).unwrap();
        assert_eq!(second, local(New_York, 2024, 9, 13, 0, 0, 0)); // Friday the 13th
        let third = schedule.next_after(&second).unwrap();
        assert_eq!(third, local(New_York, 2024, 9, 20, 0, 0, 0)); // Friday
    }

    #[test]
    fn year_constraint_jumps_and_runs_dry() {
        let schedule = CronSchedule::parse("0 0 1 1 ? 2026").unwrap();
        let from = Utc.with_ymd_and_hms(2024, 5, 1, 0, 0, 0).unwrap();
        let next = schedule.next_after(&from).unwrap();
        assert_eq!(next, Utc.with_ymd_and_hms(2026, 1, 1, 0, 0, 0).unwrap());
        assert!(schedule.next_after(&next).is_none());
    }

    #[test]
    fn impossible_date_exceeds_horizon() {
        let schedule = CronSchedule::parse("0 0 30 2 *").unwrap();
        let from = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        assert!(schedule.next_after(&from).is_none());
    }

    #[test]
    fn occurrences_are_strictly_increasing_and_match_fields() {
        let schedule = CronSchedule::parse("*/20 15 3 * * *").unwrap();
        let from = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        let to = Utc.with_ymd_and_hms(2024, 1, 3, 0, 0, 0).unwrap();
        let all: Vec<_> = schedule.occurrences(from, to).collect();
        // Two days, three per day (seconds 0, 20, 40).
        assert_eq!(all.len(), 6);
        for pair in all.windows(2) {
            assert!(pair[0] < pair[1]);
        }
        for occurrence in &all {
            assert_eq!(occurrence.hour(), 3);
            assert_eq!(occurrence.minute(), 15);
            assert_eq!(occurrence.second() % 20, 0);
        }
    }

    #[test]
    fn next_is_strictly_after_input() {
        let schedule = CronSchedule::parse("* * * * *").unwrap();
        let from = Utc.with_ymd_and_hms(2024, 1, 1, 12, 30, 0).unwrap();
        let next = schedule.next_after(&from).unwrap();
        assert!(next > from);
        assert_eq!(next, Utc.with_ymd_and_hms(2024, 1, 1, 12, 31, 0).unwrap());
    }
}
