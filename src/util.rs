//! Shared utility functions used across the codebase.

use chrono::{DateTime, NaiveDate, NaiveTime, SecondsFormat, TimeZone, Utc};

/// Parse an environment variable as a boolean, returning `default` if unset.
///
/// Recognises `1`, `true`, `yes`, `y`, `on` (case-insensitive) as `true`;
/// everything else maps to `false`.
pub fn env_var_bool(name: &str, default: bool) -> bool {
    match std::env::var(name) {
        Ok(value) => parse_bool(&value),
        Err(_) => default,
    }
}

fn parse_bool(value: &str) -> bool {
    matches!(
        value.trim().to_lowercase().as_str(),
        "1" | "true" | "yes" | "y" | "on"
    )
}

/// Current time in the storage timestamp format.
pub fn now_string() -> String {
    format_timestamp(Utc::now())
}

/// Format a timestamp with fixed microsecond precision so that stored
/// strings sort in time order.
pub fn format_timestamp(ts: DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Micros, true)
}

/// Parse a user-supplied date bound.
///
/// Accepts a full RFC 3339 timestamp or a bare `YYYY-MM-DD` date. A bare
/// date resolves to the start of the day, or to its last microsecond when
/// `end_of_day` is set, so that date-only ranges are inclusive.
pub fn parse_date_bound(value: &str, end_of_day: bool) -> Option<DateTime<Utc>> {
    let trimmed = value.trim();
    if let Ok(ts) = DateTime::parse_from_rfc3339(trimmed) {
        return Some(ts.with_timezone(&Utc));
    }
    let date = NaiveDate::parse_from_str(trimmed, "%Y-%m-%d").ok()?;
    let time = if end_of_day {
        NaiveTime::from_hms_micro_opt(23, 59, 59, 999_999)?
    } else {
        NaiveTime::MIN
    };
    Some(Utc.from_utc_datetime(&date.and_time(time)))
}

/// Count whitespace-delimited words.
pub fn count_words(text: &str) -> u64 {
    text.split_whitespace().count() as u64
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_bool_accepts_common_truthy_values() {
        for v in ["1", "true", "YES", " y ", "On"] {
            assert!(parse_bool(v), "{v} should be true");
        }
        for v in ["0", "false", "", "nope"] {
            assert!(!parse_bool(v), "{v} should be false");
        }
    }

    #[test]
    fn timestamps_sort_lexically() {
        let a = Utc.with_ymd_and_hms(2024, 1, 1, 9, 0, 0).unwrap();
        let b = a + chrono::Duration::microseconds(1);
        assert!(format_timestamp(a) < format_timestamp(b));
        assert_eq!(format_timestamp(a), "2024-01-01T09:00:00.000000Z");
    }

    #[test]
    fn date_bounds_cover_the_whole_day() {
        let start = parse_date_bound("2024-03-05", false).unwrap();
        let end = parse_date_bound("2024-03-05", true).unwrap();
        assert_eq!(format_timestamp(start), "2024-03-05T00:00:00.000000Z");
        assert_eq!(format_timestamp(end), "2024-03-05T23:59:59.999999Z");
        assert!(parse_date_bound("2024-03-05T10:00:00+02:00", false).is_some());
        assert!(parse_date_bound("yesterday", false).is_none());
    }

    #[test]
    fn count_words_splits_on_any_whitespace() {
        assert_eq!(count_words(""), 0);
        assert_eq!(count_words("  hello \n world\tagain "), 3);
    }
}
