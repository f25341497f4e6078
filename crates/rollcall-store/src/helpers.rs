use crate::SqliteError;
use chrono::{DateTime, NaiveDate, NaiveTime, SecondsFormat, Utc, Weekday};
use rollcall_attendance::{EndReason, SessionStatus};
use rollcall_core::IdentityStatus;

const TIME_FORMAT: &str = "%H:%M:%S";

fn corrupt(field: &'static str, value: impl Into<String>) -> SqliteError {
    SqliteError::Corrupt {
        field,
        value: value.into(),
    }
}

/// Fixed-width RFC 3339 so that text order matches time order.
pub fn format_datetime(value: &DateTime<Utc>) -> String {
    value.to_rfc3339_opts(SecondsFormat::Micros, true)
}

pub fn parse_datetime(value: &str, field: &'static str) -> Result<DateTime<Utc>, SqliteError> {
    DateTime::parse_from_rfc3339(value)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|_| corrupt(field, value))
}

pub fn parse_optional_datetime(value: Option<String>, field: &'static str) -> Result<Option<DateTime<Utc>>, SqliteError> {
    value.map(|raw| parse_datetime(&raw, field)).transpose()
}

pub fn parse_date(value: &str) -> Result<NaiveDate, SqliteError> {
    value.parse().map_err(|_| corrupt("date", value))
}

pub fn format_time(value: &NaiveTime) -> String {
    value.format(TIME_FORMAT).to_string()
}

pub fn parse_time(value: &str, field: &'static str) -> Result<NaiveTime, SqliteError> {
    NaiveTime::parse_from_str(value, TIME_FORMAT).map_err(|_| corrupt(field, value))
}

pub fn weekday_to_i64(day: Weekday) -> i64 {
    day.num_days_from_monday() as i64
}

pub fn weekday_from_i64(value: i64) -> Result<Weekday, SqliteError> {
    match value {
        0 => Ok(Weekday::Mon),
        1 => Ok(Weekday::Tue),
        2 => Ok(Weekday::Wed),
        3 => Ok(Weekday::Thu),
        4 => Ok(Weekday::Fri),
        5 => Ok(Weekday::Sat),
        6 => Ok(Weekday::Sun),
        other => Err(corrupt("day", other.to_string())),
    }
}

pub fn parse_identity_status(value: &str) -> Result<IdentityStatus, SqliteError> {
    IdentityStatus::parse(value).ok_or_else(|| corrupt("identity status", value))
}

pub fn parse_session_status(value: &str) -> Result<SessionStatus, SqliteError> {
    SessionStatus::parse(value).ok_or_else(|| corrupt("session status", value))
}

pub fn parse_end_reason(value: Option<String>) -> Result<Option<EndReason>, SqliteError> {
    value
        .map(|raw| EndReason::parse(&raw).ok_or_else(|| corrupt("end reason", raw)))
        .transpose()
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_datetime_text_sorts_chronologically() {
        let a = Utc.with_ymd_and_hms(2024, 1, 1, 9, 0, 0).unwrap();
        let b = a + chrono::Duration::milliseconds(1500);
        assert!(format_datetime(&a) < format_datetime(&b));
        assert_eq!(parse_datetime(&format_datetime(&b), "t").unwrap(), b);
    }

    #[test]
    fn test_weekday_index() {
        for day in [Weekday::Mon, Weekday::Thu, Weekday::Sun] {
            assert_eq!(weekday_from_i64(weekday_to_i64(day)).unwrap(), day);
        }
        assert!(weekday_from_i64(7).is_err());
    }

    #[test]
    fn test_rejects_unknown_status() {
        assert!(matches!(
            parse_session_status("paused"),
            Err(SqliteError::Corrupt { field: "session status", .. })
        ));
    }
}
