//! Timestamp helpers
//!
//! Documents carry timestamps as strings. Both RFC 3339 (`2017-10-02T10:56:33Z`)
//! and the dataset's `2017-10-02 10:56:33` form are accepted; everything this
//! crate writes uses RFC 3339 in UTC with second precision.

use crate::error::{Result, StoreLensError};
use chrono::format::{Item, StrftimeItems};
use chrono::{
    DateTime, Datelike, Duration, Months, NaiveDate, NaiveDateTime, SecondsFormat, TimeZone,
    Timelike, Utc,
};
use serde_json::Value;

const NAIVE_FORMATS: [&str; 3] = ["%Y-%m-%d %H:%M:%S", "%Y-%m-%dT%H:%M:%S", "%Y-%m-%d %H:%M:%S%.f"];

/// Cheap shape check so plain strings are not run through the parsers
pub fn looks_like_timestamp(s: &str) -> bool {
    let bytes = s.as_bytes();
    bytes.len() >= 10
        && bytes[..4].iter().all(u8::is_ascii_digit)
        && bytes[4] == b'-'
        && bytes[5..7].iter().all(u8::is_ascii_digit)
        && bytes[7] == b'-'
        && bytes[8..10].iter().all(u8::is_ascii_digit)
}

pub fn parse_timestamp(s: &str) -> Option<DateTime<Utc>> {
    if !looks_like_timestamp(s) {
        return None;
    }
    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return Some(dt.with_timezone(&Utc));
    }
    for format in NAIVE_FORMATS {
        if let Ok(naive) = NaiveDateTime::parse_from_str(s, format) {
            return Some(Utc.from_utc_datetime(&naive));
        }
    }
    if s.len() == 10 {
        let date = NaiveDate::parse_from_str(s, "%Y-%m-%d").ok()?;
        return Some(Utc.from_utc_datetime(&date.and_hms_opt(0, 0, 0)?));
    }
    None
}

/// Timestamp from a document value: a date string or epoch milliseconds
pub fn value_to_timestamp(value: &Value) -> Option<DateTime<Utc>> {
    match value {
        Value::String(s) => parse_timestamp(s),
        Value::Number(n) => n
            .as_i64()
            .and_then(|millis| Utc.timestamp_millis_opt(millis).single()),
        _ => None,
    }
}

pub fn format_timestamp(dt: &DateTime<Utc>) -> String {
    dt.to_rfc3339_opts(SecondsFormat::Secs, true)
}

pub fn timestamp_value(dt: &DateTime<Utc>) -> Value {
    Value::String(format_timestamp(dt))
}

pub fn now_string() -> String {
    format_timestamp(&Utc::now())
}

/// Render with a `$dateToString` style format (`%Y-%m`, `%d`, `%H`, `%L` ...)
pub fn format_with_pattern(dt: &DateTime<Utc>, pattern: &str) -> Result<String> {
    let translated = pattern.replace("%L", "%3f");
    if StrftimeItems::new(&translated).any(|item| matches!(item, Item::Error)) {
        return Err(StoreLensError::AggregationError(format!(
            "Invalid date format: {}",
            pattern
        )));
    }
    Ok(dt.format(&translated).to_string())
}

pub fn years_before(dt: &DateTime<Utc>, years: u32) -> DateTime<Utc> {
    dt.checked_sub_months(Months::new(years.saturating_mul(12)))
        .unwrap_or(*dt)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimeUnit {
    Millisecond,
    Second,
    Minute,
    Hour,
    Day,
    Week,
    Month,
    Year,
}

impl TimeUnit {
    pub fn from_str(s: &str) -> Option<TimeUnit> {
        match s {
            "millisecond" => Some(TimeUnit::Millisecond),
            "second" => Some(TimeUnit::Second),
            "minute" => Some(TimeUnit::Minute),
            "hour" => Some(TimeUnit::Hour),
            "day" => Some(TimeUnit::Day),
            "week" => Some(TimeUnit::Week),
            "month" => Some(TimeUnit::Month),
            "year" => Some(TimeUnit::Year),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            TimeUnit::Millisecond => "millisecond",
            TimeUnit::Second => "second",
            TimeUnit::Minute => "minute",
            TimeUnit::Hour => "hour",
            TimeUnit::Day => "day",
            TimeUnit::Week => "week",
            TimeUnit::Month => "month",
            TimeUnit::Year => "year",
        }
    }
}

/// Signed number of whole units elapsed from `start` to `end`
///
/// Fixed-length units truncate toward zero. Months and years count calendar
/// months: Jan 31 to Feb 28 is 0 months, Jan 31 to Mar 1 is 1 month.
pub fn whole_units_between(start: &DateTime<Utc>, end: &DateTime<Utc>, unit: TimeUnit) -> i64 {
    let elapsed: Duration = *end - *start;
    match unit {
        TimeUnit::Millisecond => elapsed.num_milliseconds(),
        TimeUnit::Second => elapsed.num_seconds(),
        TimeUnit::Minute => elapsed.num_minutes(),
        TimeUnit::Hour => elapsed.num_hours(),
        TimeUnit::Day => elapsed.num_days(),
        TimeUnit::Week => elapsed.num_weeks(),
        TimeUnit::Month => whole_months(start, end),
        TimeUnit::Year => whole_months(start, end) / 12,
    }
}

fn whole_months(start: &DateTime<Utc>, end: &DateTime<Utc>) -> i64 {
    if end < start {
        return -whole_months(end, start);
    }
    let mut months = (end.year() as i64 - start.year() as i64) * 12
        + (end.month() as i64 - start.month() as i64);
    let end_rest = (end.day(), end.num_seconds_from_midnight(), end.nanosecond());
    let start_rest = (start.day(), start.num_seconds_from_midnight(), start.nanosecond());
    if end_rest < start_rest {
        months -= 1;
    }
    months
}

/// Truncate to the start of the unit (weeks start on Sunday)
pub fn truncate(dt: &DateTime<Utc>, unit: TimeUnit) -> DateTime<Utc> {
    let date = dt.date_naive();
    let midnight = |d: NaiveDate| -> DateTime<Utc> {
        d.and_hms_opt(0, 0, 0)
            .map(|naive| Utc.from_utc_datetime(&naive))
            .unwrap_or(*dt)
    };
    match unit {
        TimeUnit::Millisecond => *dt,
        TimeUnit::Second => dt.with_nanosecond(0).unwrap_or(*dt),
        TimeUnit::Minute => dt
            .with_nanosecond(0)
            .and_then(|d| d.with_second(0))
            .unwrap_or(*dt),
        TimeUnit::Hour => dt
            .with_nanosecond(0)
            .and_then(|d| d.with_second(0))
            .and_then(|d| d.with_minute(0))
            .unwrap_or(*dt),
        TimeUnit::Day => midnight(date),
        TimeUnit::Week => {
            let back = date.weekday().num_days_from_sunday() as i64;
            midnight(date - Duration::days(back))
        }
        TimeUnit::Month => midnight(date.with_day(1).unwrap_or(date)),
        TimeUnit::Year => midnight(
            date.with_day(1)
                .and_then(|d| d.with_month(1))
                .unwrap_or(date),
        ),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ts(s: &str) -> DateTime<Utc> {
        parse_timestamp(s).unwrap()
    }

    #[test]
    fn test_parse_both_layouts() {
        assert_eq!(ts("2017-10-02 10:56:33"), ts("2017-10-02T10:56:33Z"));
        assert_eq!(ts("2017-10-02"), ts("2017-10-02T00:00:00Z"));
        assert!(parse_timestamp("delivered").is_none());
        assert!(parse_timestamp("2017-13-45 99:00:00").is_none());
    }

    #[test]
    fn test_format_round_trips_through_parse() {
        let dt = ts("2018-01-05 08:00:00");
        assert_eq!(format_timestamp(&dt), "2018-01-05T08:00:00Z");
    }

    #[test]
    fn test_whole_days_truncate_toward_zero() {
        let a = ts("2018-01-01 12:00:00");
        let b = ts("2018-01-04 11:59:59");
        assert_eq!(whole_units_between(&a, &b, TimeUnit::Day), 2);
        assert_eq!(whole_units_between(&b, &a, TimeUnit::Day), -2);
    }

    #[test]
    fn test_calendar_months() {
        let jan31 = ts("2018-01-31 00:00:00");
        assert_eq!(whole_units_between(&jan31, &ts("2018-02-28 00:00:00"), TimeUnit::Month), 0);
        assert_eq!(whole_units_between(&jan31, &ts("2018-03-01 00:00:00"), TimeUnit::Month), 1);
        assert_eq!(whole_units_between(&jan31, &ts("2020-02-01 00:00:00"), TimeUnit::Year), 2);
        assert_eq!(whole_units_between(&ts("2020-02-01 00:00:00"), &jan31, TimeUnit::Year), -2);
    }

    #[test]
    fn test_format_with_pattern() {
        let dt = ts("2017-10-02 10:56:33");
        assert_eq!(format_with_pattern(&dt, "%Y-%m").unwrap(), "2017-10");
        assert_eq!(format_with_pattern(&dt, "%Y-%m-%d").unwrap(), "2017-10-02");
        assert!(format_with_pattern(&dt, "%Q%").is_err());
    }

    #[test]
    fn test_years_before_and_truncate() {
        let dt = ts("2024-02-29 10:00:00");
        assert_eq!(format_timestamp(&years_before(&dt, 5)), "2019-02-28T10:00:00Z");
        assert_eq!(format_timestamp(&truncate(&dt, TimeUnit::Month)), "2024-02-01T00:00:00Z");
    }
}
