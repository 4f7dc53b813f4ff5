//! Cron expression parsing and evaluation.
//!
//! Supports the classic 5-field format: `minute hour day month weekday`.
//! Each field accepts `*`, a single integer, a range `a-b`, a step `*/n` or
//! `a-b/n`, and comma-separated lists of those. Named months and weekdays
//! are not recognized. All evaluation happens in UTC.

use chrono::{DateTime, Datelike, Days, Duration, NaiveDate, TimeZone, Timelike, Utc};
use thiserror::Error;

/// Error produced when a cron expression fails to parse.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("invalid {field} field: {reason}")]
pub struct ParseError {
    /// The field that failed (`minute`, `hour`, `day-of-month`, `month`,
    /// `day-of-week`, or `expression` for shape errors).
    pub field: &'static str,
    /// Human-readable description of the problem.
    pub reason: String,
}

impl ParseError {
    fn new(field: &'static str, reason: impl Into<String>) -> Self {
        Self {
            field,
            reason: reason.into(),
        }
    }
}

/// A single field of a cron expression, stored as a bitmask of allowed
/// values so matching and scanning stay cheap.
#[derive(Debug, Clone, Copy)]
struct CronField {
    mask: u64,
    /// Whether the source text was anything other than a bare `*`.
    /// Drives the classic day-of-month/day-of-week OR rule.
    restricted: bool,
}

impl CronField {
    fn matches(self, value: u32) -> bool {
        value < 64 && self.mask & (1 << value) != 0
    }
}

/// A parsed cron expression.
///
/// # Examples
///
/// ```rust,ignore
/// let expr = CronExpression::parse("*/5 9-17 * * 1-5")?;
/// let next = expr.next_after(Utc::now());
/// ```
#[derive(Debug, Clone)]
pub struct CronExpression {
    minute: CronField,
    hour: CronField,
    day: CronField,
    month: CronField,
    weekday: CronField,
}

/// How far `next_after` scans before concluding the expression never
/// matches (e.g. `0 0 30 2 *`). Four years covers every leap-day schedule.
const SEARCH_HORIZON_DAYS: u64 = 4 * 366;

impl CronExpression {
    /// Parse a 5-field cron expression.
    ///
    /// # Errors
    ///
    /// Returns a [`ParseError`] naming the offending field when the shape
    /// is wrong, a value is out of range, or a step/range is malformed.
    pub fn parse(expr: &str) -> Result<Self, ParseError> {
        let parts: Vec<&str> = expr.split_whitespace().collect();
        if parts.len() != 5 {
            return Err(ParseError::new(
                "expression",
                format!("expected 5 fields, found {}", parts.len()),
            ));
        }

        Ok(Self {
            minute: parse_field(parts[0], "minute", 0, 59)?,
            hour: parse_field(parts[1], "hour", 0, 23)?,
            day: parse_field(parts[2], "day-of-month", 1, 31)?,
            month: parse_field(parts[3], "month", 1, 12)?,
            weekday: parse_weekday_field(parts[4])?,
        })
    }

    /// Whether the expression matches the given instant (minute precision).
    pub fn matches(&self, time: DateTime<Utc>) -> bool {
        self.minute.matches(time.minute())
            && self.hour.matches(time.hour())
            && self.month.matches(time.month())
            && self.day_matches(time.date_naive())
    }

    /// The smallest instant strictly after `after` that matches.
    ///
    /// Returns `None` only for expressions with no occurrence within the
    /// search horizon (parseable but unsatisfiable schedules).
    pub fn next_after(&self, after: DateTime<Utc>) -> Option<DateTime<Utc>> {
        // Candidates are whole minutes; start at the minute after `after`.
        let start = after
            .with_second(0)
            .and_then(|t| t.with_nanosecond(0))
            .unwrap_or(after)
            + Duration::minutes(1);
        let first_day = start.date_naive();
        let horizon = first_day.checked_add_days(Days::new(SEARCH_HORIZON_DAYS))?;

        let mut day = first_day;
        while day <= horizon {
            if self.month.matches(day.month()) && self.day_matches(day) {
                let (hour_floor, minute_floor) = if day == first_day {
                    (start.hour(), start.minute())
                } else {
                    (0, 0)
                };
                if let Some(found) = self.first_time_on(day, hour_floor, minute_floor) {
                    return Some(found);
                }
            }
            day = day.succ_opt()?;
        }
        None
    }

    /// Classic cron day rule: when both day-of-month and day-of-week are
    /// restricted, a day matching either fires; otherwise both must match
    /// (an unrestricted field matches every day anyway).
    fn day_matches(&self, date: NaiveDate) -> bool {
        let dom = self.day.matches(date.day());
        let dow = self.weekday.matches(date.weekday().num_days_from_sunday());
        if self.day.restricted && self.weekday.restricted {
            dom || dow
        } else {
            dom && dow
        }
    }

    /// First matching hour/minute on `date`, at or after the given floor.
    fn first_time_on(
        &self,
        date: NaiveDate,
        hour_floor: u32,
        minute_floor: u32,
    ) -> Option<DateTime<Utc>> {
        for hour in hour_floor..24 {
            if !self.hour.matches(hour) {
                continue;
            }
            let floor = if hour == hour_floor { minute_floor } else { 0 };
            if let Some(minute) = (floor..60).find(|m| self.minute.matches(*m)) {
                return date
                    .and_hms_opt(hour, minute, 0)
                    .map(|naive| Utc.from_utc_datetime(&naive));
            }
        }
        None
    }
}

fn parse_field(text: &str, field: &'static str, min: u32, max: u32) -> Result<CronField, ParseError> {
    let text = text.trim();
    if text.is_empty() {
        return Err(ParseError::new(field, "empty field"));
    }

    let mut mask = 0u64;
    for item in text.split(',') {
        mask |= parse_item(item, field, min, max)?;
    }
    Ok(CronField {
        mask,
        restricted: text != "*",
    })
}

/// Day-of-week accepts 0-7 with 7 meaning Sunday; the extra bit is folded
/// into 0 after parsing.
fn parse_weekday_field(text: &str) -> Result<CronField, ParseError> {
    let mut parsed = parse_field(text, "day-of-week", 0, 7)?;
    if parsed.mask & (1 << 7) != 0 {
        parsed.mask = (parsed.mask & !(1 << 7)) | 1;
    }
    Ok(parsed)
}

fn parse_item(item: &str, field: &'static str, min: u32, max: u32) -> Result<u64, ParseError> {
    let item = item.trim();
    if item.is_empty() {
        return Err(ParseError::new(field, "empty list entry"));
    }

    let (range, step) = match item.split_once('/') {
        Some((range, step_text)) => {
            let step: u32 = step_text
                .parse()
                .map_err(|_| ParseError::new(field, format!("bad step `{step_text}`")))?;
            if step == 0 {
                return Err(ParseError::new(field, "step must be positive"));
            }
            (range, step)
        }
        None => (item, 1),
    };

    let (start, end) = if range == "*" {
        (min, max)
    } else if let Some((low, high)) = range.split_once('-') {
        let low = parse_value(low, field, min, max)?;
        let high = parse_value(high, field, min, max)?;
        if low > high {
            return Err(ParseError::new(
                field,
                format!("range start {low} exceeds end {high}"),
            ));
        }
        (low, high)
    } else {
        if step != 1 {
            return Err(ParseError::new(field, "step requires a range or `*`"));
        }
        let value = parse_value(range, field, min, max)?;
        (value, value)
    };

    let mut mask = 0u64;
    let mut value = start;
    while value <= end {
        mask |= 1 << value;
        value += step;
    }
    Ok(mask)
}

fn parse_value(text: &str, field: &'static str, min: u32, max: u32) -> Result<u32, ParseError> {
    let value: u32 = text
        .trim()
        .parse()
        .map_err(|_| ParseError::new(field, format!("bad value `{}`", text.trim())))?;
    if value < min || value > max {
        return Err(ParseError::new(
            field,
            format!("value {value} out of range {min}-{max}"),
        ));
    }
    Ok(value)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn at(y: i32, mo: u32, d: u32, h: u32, mi: u32, s: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(y, mo, d, h, mi, s).unwrap()
    }

    #[test]
    fn rejects_malformed_expressions() {
        assert!(CronExpression::parse("* * *").is_err());
        assert!(CronExpression::parse("nope * * * *").is_err());
        assert!(CronExpression::parse("60 * * * *").is_err());
        assert!(CronExpression::parse("* 24 * * *").is_err());
        assert!(CronExpression::parse("* * 0 * *").is_err());
        assert!(CronExpression::parse("* * * 13 *").is_err());
        assert!(CronExpression::parse("* * * * 8").is_err());
        assert!(CronExpression::parse("*/0 * * * *").is_err());
        assert!(CronExpression::parse("10-5 * * * *").is_err());
        assert!(CronExpression::parse("5/2 * * * *").is_err());
        assert!(CronExpression::parse("* * * JAN *").is_err());
    }

    #[test]
    fn parse_error_names_the_field() {
        let err = CronExpression::parse("* 99 * * *").unwrap_err();
        assert_eq!(err.field, "hour");
    }

    #[test]
    fn every_minute_advances_one_minute() {
        let expr = CronExpression::parse("*/1 * * * *").unwrap();
        let next = expr.next_after(at(2025, 1, 16, 12, 0, 0)).unwrap();
        assert_eq!(next, at(2025, 1, 16, 12, 1, 0));
    }

    #[test]
    fn strictly_after_even_when_matching() {
        let expr = CronExpression::parse("0 * * * *").unwrap();
        let next = expr.next_after(at(2025, 1, 16, 12, 0, 0)).unwrap();
        assert_eq!(next, at(2025, 1, 16, 13, 0, 0));
    }

    #[test]
    fn seconds_round_up_to_the_next_minute() {
        let expr = CronExpression::parse("*/1 * * * *").unwrap();
        let next = expr.next_after(at(2025, 1, 16, 12, 0, 30)).unwrap();
        assert_eq!(next, at(2025, 1, 16, 12, 1, 0));
    }

    #[test]
    fn hour_list_picks_the_next_entry() {
        let expr = CronExpression::parse("0 0,9,12,15,18,21 * * *").unwrap();
        let next = expr.next_after(at(2025, 1, 16, 10, 0, 0)).unwrap();
        assert_eq!(next, at(2025, 1, 16, 12, 0, 0));
    }

    #[test]
    fn dom_and_dow_match_as_union() {
        // 2025-01-16 is a Thursday. Day 20 (Monday) and weekday 5 (Friday)
        // are both restricted, so the earlier of the two wins: Friday the 17th.
        let expr = CronExpression::parse("0 0 20 * 5").unwrap();
        let next = expr.next_after(at(2025, 1, 16, 0, 0, 0)).unwrap();
        assert_eq!(next, at(2025, 1, 17, 0, 0, 0));

        // With only day-of-month restricted the weekday is ignored.
        let dom_only = CronExpression::parse("0 0 20 * *").unwrap();
        let next = dom_only.next_after(at(2025, 1, 16, 0, 0, 0)).unwrap();
        assert_eq!(next, at(2025, 1, 20, 0, 0, 0));
    }

    #[test]
    fn seven_is_sunday() {
        let expr = CronExpression::parse("0 0 * * 7").unwrap();
        let next = expr.next_after(at(2025, 1, 16, 0, 0, 0)).unwrap();
        // 2025-01-19 is a Sunday.
        assert_eq!(next, at(2025, 1, 19, 0, 0, 0));
    }

    #[test]
    fn leap_day_resolves_through_date_arithmetic() {
        let expr = CronExpression::parse("0 0 29 2 *").unwrap();
        let next = expr.next_after(at(2025, 1, 1, 0, 0, 0)).unwrap();
        assert_eq!(next, at(2028, 2, 29, 0, 0, 0));
    }

    #[test]
    fn rolls_over_month_and_year() {
        let expr = CronExpression::parse("0 0 1 1 *").unwrap();
        let next = expr.next_after(at(2025, 1, 1, 0, 0, 0)).unwrap();
        assert_eq!(next, at(2026, 1, 1, 0, 0, 0));
    }

    #[test]
    fn stepped_range_hits_every_step() {
        let expr = CronExpression::parse("10-30/5 * * * *").unwrap();
        let mut t = at(2025, 1, 16, 12, 0, 0);
        let mut minutes = Vec::new();
        for _ in 0..5 {
            t = expr.next_after(t).unwrap();
            minutes.push(t.minute());
        }
        assert_eq!(minutes, vec![10, 15, 20, 25, 30]);
    }

    #[test]
    fn unsatisfiable_schedule_yields_none() {
        let expr = CronExpression::parse("0 0 30 2 *").unwrap();
        assert!(expr.next_after(at(2025, 1, 1, 0, 0, 0)).is_none());
    }

    #[test]
    fn weekday_workhours_expression() {
        let expr = CronExpression::parse("0 9-17 * * 1-5").unwrap();
        // Saturday evening rolls forward to Monday 09:00.
        let next = expr.next_after(at(2025, 1, 18, 20, 0, 0)).unwrap();
        assert_eq!(next, at(2025, 1, 20, 9, 0, 0));
    }
}
