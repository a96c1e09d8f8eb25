//! Parsing of user-entered times and timezone helpers.

use chrono::{DateTime, Datelike, Duration, LocalResult, NaiveDate, NaiveDateTime, NaiveTime, TimeZone, Timelike, Utc};
use chrono_tz::{Tz, TZ_VARIANTS};
use thiserror::Error;

#[derive(Debug, Error, PartialEq)]
pub enum TimeParseError {
    #[error("unknown timezone {0}")]
    InvalidTimezone(String),
    #[error("unrecognised time {0:?}")]
    Format(String),
    #[error("date does not exist")]
    InvalidDate,
}

/// Looks up an IANA zone name, ignoring case.
pub fn parse_timezone(name: &str) -> Result<Tz, TimeParseError> {
    let name = name.trim();
    if let Ok(tz) = name.parse::<Tz>() {
        return Ok(tz);
    }
    TZ_VARIANTS
        .iter()
        .find(|tz| tz.name().eq_ignore_ascii_case(name))
        .copied()
        .ok_or_else(|| TimeParseError::InvalidTimezone(name.to_string()))
}

/// Zone names containing `query` (case-insensitive), at most `limit` of them.
pub fn timezone_suggestions(query: &str, limit: usize) -> Vec<&'static str> {
    let query = query.trim().to_ascii_lowercase();
    TZ_VARIANTS
        .iter()
        .map(|tz| tz.name())
        .filter(|name| name.to_ascii_lowercase().contains(&query))
        .take(limit)
        .collect()
}

/// Resolves a wall-clock time in `tz`. Ambiguous times take the earlier instant and times
/// skipped by a DST jump are moved forward by an hour.
pub fn localize(tz: &Tz, naive: NaiveDateTime) -> Option<DateTime<Tz>> {
    match tz.from_local_datetime(&naive) {
        LocalResult::Single(dt) => Some(dt),
        LocalResult::Ambiguous(earliest, _) => Some(earliest),
        LocalResult::None => tz.from_local_datetime(&(naive + Duration::hours(1))).earliest(),
    }
}

/// Parses `23:30`, `7pm`, `11:15 am` and similar.
pub fn parse_clock(input: &str) -> Option<NaiveTime> {
    let text = input.trim().to_ascii_lowercase().replace(' ', "");
    let (body, meridiem) = if let Some(rest) = text.strip_suffix("am") {
        (rest, Some(false))
    } else if let Some(rest) = text.strip_suffix("pm") {
        (rest, Some(true))
    } else {
        (text.as_str(), None)
    };

    let (hour, minute) = match body.split_once(':') {
        Some((h, m)) if m.len() == 2 => (h.parse::<u32>().ok()?, m.parse::<u32>().ok()?),
        Some(_) => return None,
        None if meridiem.is_some() => (body.parse::<u32>().ok()?, 0),
        None => return None,
    };

    let hour = match meridiem {
        Some(_) if !(1..=12).contains(&hour) => return None,
        Some(false) => hour % 12,
        Some(true) => hour % 12 + 12,
        None => hour,
    };
    NaiveTime::from_hms_opt(hour, minute, 0)
}

/// Bedtime as minutes after local midnight.
pub fn parse_bedtime(input: &str) -> Result<u32, TimeParseError> {
    parse_clock(input)
        .map(|t| t.hour() * 60 + t.minute())
        .ok_or_else(|| TimeParseError::Format(input.to_string()))
}

pub fn format_bedtime(minutes: u32) -> String {
    format!("{:02}:{:02}", minutes / 60, minutes % 60)
}

/// Parses a reminder time relative to `now`, reading absolute values in `tz`.
///
/// Accepted: `10m`, `in 2h 30m`, `5m ago`, `tomorrow 9:00`, `2025-01-31 18:00`,
/// `2025-01-31`, `18:00`, `6pm`. A bare clock time that already passed today means tomorrow.
/// The result may lie in the past; callers decide what to do with that.
pub fn parse_reminder_time(input: &str, tz: &Tz, now: DateTime<Utc>) -> Result<DateTime<Utc>, TimeParseError> {
    let text = input.trim().to_ascii_lowercase();
    let format_error = || TimeParseError::Format(input.to_string());
    if text.is_empty() {
        return Err(format_error());
    }

    if let Some(ago) = text.strip_suffix(" ago") {
        let duration = relative(ago).ok_or_else(format_error)?;
        return now.checked_sub_signed(duration).ok_or_else(format_error);
    }
    let relative_text = text.strip_prefix("in ").unwrap_or(&text);
    if let Some(duration) = relative(relative_text) {
        return now.checked_add_signed(duration).ok_or_else(format_error);
    }

    let local_now = now.with_timezone(tz);
    if let Some(rest) = text.strip_prefix("tomorrow") {
        let time = match rest.trim() {
            "" => NaiveTime::from_hms_opt(9, 0, 0).ok_or_else(format_error)?,
            clock => parse_clock(clock).ok_or_else(format_error)?,
        };
        let date = local_now.date_naive() + Duration::days(1);
        return to_utc(tz, date.and_time(time)).ok_or_else(format_error);
    }

    for format in ["%Y-%m-%d %H:%M", "%Y-%m-%dT%H:%M", "%Y/%m/%d %H:%M"] {
        if let Ok(naive) = NaiveDateTime::parse_from_str(&text, format) {
            return to_utc(tz, naive).ok_or_else(format_error);
        }
    }
    if let Ok(date) = NaiveDate::parse_from_str(&text, "%Y-%m-%d") {
        return date.and_hms_opt(0, 0, 0).and_then(|naive| to_utc(tz, naive)).ok_or_else(format_error);
    }

    let time = parse_clock(&text).ok_or_else(format_error)?;
    let today = to_utc(tz, local_now.date_naive().and_time(time)).ok_or_else(format_error)?;
    if today > now {
        return Ok(today);
    }
    let tomorrow = local_now.date_naive() + Duration::days(1);
    to_utc(tz, tomorrow.and_time(time)).ok_or_else(format_error)
}

fn relative(text: &str) -> Option<Duration> {
    let std = humantime::parse_duration(text.trim()).ok()?;
    Duration::from_std(std).ok()
}

fn to_utc(tz: &Tz, naive: NaiveDateTime) -> Option<DateTime<Utc>> {
    localize(tz, naive).map(|dt| dt.with_timezone(&Utc))
}

/// Whether `month`/`day` is a real calendar day in some year (29 February allowed).
pub fn valid_birthday(month: u32, day: u32) -> bool {
    NaiveDate::from_ymd_opt(2000, month, day).is_some()
}

/// Adds whole years, rolling 29 February into 1 March in non-leap years.
pub fn add_years(date: NaiveDate, years: i32) -> Option<NaiveDate> {
    let year = date.year() + years;
    NaiveDate::from_ymd_opt(year, date.month(), date.day()).or_else(|| {
        NaiveDate::from_ymd_opt(year, date.month(), 1)
            .and_then(|first| first.checked_add_signed(Duration::days(date.day() as i64 - 1)))
    })
}

/// Local midnight of the next occurrence of a birthday, as UTC. Today counts until midnight passes.
pub fn next_birthday(month: u32, day: u32, tz: &Tz, now: DateTime<Utc>) -> Result<DateTime<Utc>, TimeParseError> {
    if !valid_birthday(month, day) {
        return Err(TimeParseError::InvalidDate);
    }
    let local_now = now.with_timezone(tz);
    let anchor = NaiveDate::from_ymd_opt(2000, month, day).ok_or(TimeParseError::InvalidDate)?;
    let this_year = add_years(anchor, local_now.year() - 2000).ok_or(TimeParseError::InvalidDate)?;
    let candidate = local_midnight(tz, this_year).ok_or(TimeParseError::InvalidDate)?;
    if now <= candidate {
        return Ok(candidate);
    }
    let next_year = add_years(anchor, local_now.year() + 1 - 2000).ok_or(TimeParseError::InvalidDate)?;
    local_midnight(tz, next_year).ok_or(TimeParseError::InvalidDate)
}

fn local_midnight(tz: &Tz, date: NaiveDate) -> Option<DateTime<Utc>> {
    to_utc(tz, date.and_hms_opt(0, 0, 0)?)
}

/// The same instant one calendar year later.
pub fn one_year_after(at: DateTime<Utc>) -> DateTime<Utc> {
    add_years(at.date_naive(), 1)
        .map(|date| Utc.from_utc_datetime(&date.and_time(at.time())))
        .unwrap_or(at + Duration::days(365))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn utc(y: i32, mo: u32, d: u32, h: u32, mi: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(y, mo, d, h, mi, 0).unwrap()
    }

    #[test]
    fn test_parse_timezone() {
        assert_eq!(parse_timezone("America/New_York").unwrap(), Tz::America__New_York);
        assert_eq!(parse_timezone("europe/paris").unwrap(), Tz::Europe__Paris);
        assert!(matches!(parse_timezone("Mars/Olympus"), Err(TimeParseError::InvalidTimezone(_))));
    }

    #[test]
    fn test_timezone_suggestions() {
        let found = timezone_suggestions("york", 10);
        assert!(found.contains(&"America/New_York"));
        assert!(timezone_suggestions("a", 10).len() <= 10);
    }

    #[test]
    fn test_parse_clock() {
        assert_eq!(parse_clock("23:30"), NaiveTime::from_hms_opt(23, 30, 0));
        assert_eq!(parse_clock("7pm"), NaiveTime::from_hms_opt(19, 0, 0));
        assert_eq!(parse_clock("12 am"), NaiveTime::from_hms_opt(0, 0, 0));
        assert_eq!(parse_clock("11:15 PM"), NaiveTime::from_hms_opt(23, 15, 0));
        assert_eq!(parse_clock("25:00"), None);
        assert_eq!(parse_clock("13pm"), None);
        assert_eq!(parse_clock("7"), None);
        assert_eq!(parse_bedtime("10:45pm").unwrap(), 22 * 60 + 45);
        assert_eq!(format_bedtime(22 * 60 + 5), "22:05");
    }

    #[test]
    fn test_relative_reminders() {
        let now = utc(2024, 6, 1, 12, 0);
        let tz = Tz::America__New_York;
        assert_eq!(parse_reminder_time("10m", &tz, now).unwrap(), now + Duration::minutes(10));
        assert_eq!(
            parse_reminder_time("in 2h 30m", &tz, now).unwrap(),
            now + Duration::minutes(150)
        );
        assert_eq!(parse_reminder_time("5m ago", &tz, now).unwrap(), now - Duration::minutes(5));
        assert!(parse_reminder_time("whenever", &tz, now).is_err());
    }

    #[test]
    fn test_out_of_range_reminders_are_format_errors() {
        let now = utc(2024, 6, 1, 12, 0);
        let tz = Tz::America__New_York;
        assert!(matches!(
            parse_reminder_time("1000000y", &tz, now),
            Err(TimeParseError::Format(_))
        ));
        assert!(matches!(
            parse_reminder_time("1000000y ago", &tz, now),
            Err(TimeParseError::Format(_))
        ));
    }

    #[test]
    fn test_absolute_reminders_use_user_zone() {
        // 12:00 UTC is 08:00 in New York (EDT).
        let now = utc(2024, 6, 1, 12, 0);
        let tz = Tz::America__New_York;
        assert_eq!(parse_reminder_time("2024-06-01 09:00", &tz, now).unwrap(), utc(2024, 6, 1, 13, 0));
        // Already past locally: tomorrow.
        assert_eq!(parse_reminder_time("7:00", &tz, now).unwrap(), utc(2024, 6, 2, 11, 0));
        assert_eq!(parse_reminder_time("9am", &tz, now).unwrap(), utc(2024, 6, 1, 13, 0));
        assert_eq!(parse_reminder_time("tomorrow 6pm", &tz, now).unwrap(), utc(2024, 6, 2, 22, 0));
        // Explicit dates may be in the past.
        assert!(parse_reminder_time("2024-05-01", &tz, now).unwrap() < now);
    }

    #[test]
    fn test_birthdays() {
        assert!(valid_birthday(2, 29));
        assert!(!valid_birthday(4, 31));
        let tz = Tz::UTC;
        let now = utc(2023, 6, 1, 0, 0);
        assert_eq!(next_birthday(7, 4, &tz, now).unwrap(), utc(2023, 7, 4, 0, 0));
        assert_eq!(next_birthday(1, 4, &tz, now).unwrap(), utc(2024, 1, 4, 0, 0));
        assert_eq!(next_birthday(2, 29, &tz, now).unwrap(), utc(2024, 2, 29, 0, 0));
        assert_eq!(next_birthday(2, 30, &tz, now), Err(TimeParseError::InvalidDate));

        let tokyo = Tz::Asia__Tokyo;
        assert_eq!(next_birthday(7, 4, &tokyo, now).unwrap(), utc(2023, 7, 3, 15, 0));
    }

    #[test]
    fn test_one_year_after() {
        assert_eq!(one_year_after(utc(2023, 7, 3, 15, 0)), utc(2024, 7, 3, 15, 0));
        assert_eq!(one_year_after(utc(2024, 2, 29, 5, 0)), utc(2025, 3, 1, 5, 0));
    }
}
