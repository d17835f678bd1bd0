//! Epoch-millisecond clock helpers and the time argument parser used by the
//! `query` CLI.
//!
//! Accepted inputs:
//! - epoch milliseconds: `1738944000000`
//! - relative to a base instant: `-1h`, `-30m`, `-2d`, `-90s`
//! - ISO 8601 (UTC unless an offset is given): `2026-02-07T17:00:00`, `2026-02-07T17:00`
//! - date:time (UTC): `2026-02-07:07:00`, `2026-02-07:07:00:00`

use chrono::{DateTime, NaiveDate, NaiveDateTime, NaiveTime, TimeZone, Utc};

const MS_PER_SEC: i64 = 1000;

/// Current wall-clock time in epoch milliseconds.
pub fn now_millis() -> i64 {
    Utc::now().timestamp_millis()
}

/// Renders epoch milliseconds as `YYYY-MM-DD HH:MM:SS.mmm` UTC.
pub fn format_millis(ms: i64) -> String {
    match Utc.timestamp_millis_opt(ms).single() {
        Some(dt) => dt.format("%Y-%m-%d %H:%M:%S%.3f").to_string(),
        None => format!("{}ms", ms),
    }
}

#[derive(Debug, Clone)]
pub struct TimeParseError {
    pub input: String,
    pub message: String,
}

impl std::fmt::Display for TimeParseError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Failed to parse time '{}': {}", self.input, self.message)
    }
}

impl std::error::Error for TimeParseError {}

/// Parses a time argument into epoch milliseconds; relative forms count back
/// from `base_ms`.
pub fn parse_millis(input: &str, base_ms: i64) -> Result<i64, TimeParseError> {
    let input = input.trim();
    let err = |message: &str| TimeParseError {
        input: input.to_string(),
        message: message.to_string(),
    };

    if !input.is_empty() && input.chars().all(|c| c.is_ascii_digit()) {
        return input.parse::<i64>().map_err(|_| err("epoch milliseconds out of range"));
    }

    if let Some(delta) = relative_millis(input) {
        return base_ms
            .checked_sub(delta)
            .ok_or_else(|| err("relative time overflow"));
    }

    if let Some(ms) = iso8601_millis(input).or_else(|| date_colon_time_millis(input)) {
        return Ok(ms);
    }

    Err(err(
        "unrecognized format. Use: epoch ms (1738944000000), relative (-1h, -30m, -2d), \
         ISO 8601 (2026-02-07T17:00:00) or date:time (2026-02-07:07:00)",
    ))
}

/// `-<n><unit>` to a positive millisecond offset.
fn relative_millis(input: &str) -> Option<i64> {
    let rest = input.strip_prefix('-')?;
    let unit = rest.chars().last()?;
    let number: i64 = rest[..rest.len() - unit.len_utf8()].parse().ok()?;

    let seconds = match unit {
        's' => number,
        'm' => number.checked_mul(60)?,
        'h' => number.checked_mul(3600)?,
        'd' => number.checked_mul(86400)?,
        'w' => number.checked_mul(604800)?,
        _ => return None,
    };
    seconds.checked_mul(MS_PER_SEC)
}

fn iso8601_millis(input: &str) -> Option<i64> {
    if !input.contains('T') {
        return None;
    }
    if let Ok(dt) = DateTime::parse_from_rfc3339(input) {
        return Some(dt.with_timezone(&Utc).timestamp_millis());
    }
    ["%Y-%m-%dT%H:%M:%S", "%Y-%m-%dT%H:%M"]
        .iter()
        .find_map(|fmt| NaiveDateTime::parse_from_str(input, fmt).ok())
        .map(|ndt| Utc.from_utc_datetime(&ndt).timestamp_millis())
}

fn date_colon_time_millis(input: &str) -> Option<i64> {
    let date_part = input.get(..10)?;
    let time_part = input.get(10..)?.strip_prefix(':')?;

    let date = NaiveDate::parse_from_str(date_part, "%Y-%m-%d").ok()?;
    let time = match time_part.len() {
        5 => NaiveTime::parse_from_str(time_part, "%H:%M").ok()?,
        8 => NaiveTime::parse_from_str(time_part, "%H:%M:%S").ok()?,
        _ => return None,
    };
    Some(
        Utc.from_utc_datetime(&NaiveDateTime::new(date, time))
            .timestamp_millis(),
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    fn utc_ms(y: i32, mo: u32, d: u32, h: u32, mi: u32) -> i64 {
        Utc.with_ymd_and_hms(y, mo, d, h, mi, 0)
            .single()
            .unwrap()
            .timestamp_millis()
    }

    #[test]
    fn test_epoch_millis() {
        assert_eq!(parse_millis("1738944000000", 0).unwrap(), 1_738_944_000_000);
        assert_eq!(parse_millis("0", 5).unwrap(), 0);
    }

    #[test]
    fn test_relative_to_base() {
        let base = utc_ms(2026, 2, 8, 10, 0);
        assert_eq!(parse_millis("-1h", base).unwrap(), base - 3_600_000);
        assert_eq!(parse_millis("-30m", base).unwrap(), base - 1_800_000);
        assert_eq!(parse_millis("-2d", base).unwrap(), base - 172_800_000);
        assert_eq!(parse_millis("-90s", base).unwrap(), base - 90_000);
    }

    #[test]
    fn test_absolute_forms() {
        let expected = utc_ms(2026, 2, 7, 17, 0);
        assert_eq!(parse_millis("2026-02-07T17:00:00", 0).unwrap(), expected);
        assert_eq!(parse_millis("2026-02-07T17:00", 0).unwrap(), expected);
        assert_eq!(parse_millis("2026-02-07T18:00:00+01:00", 0).unwrap(), expected);
        assert_eq!(parse_millis("2026-02-07:17:00", 0).unwrap(), expected);
        assert_eq!(parse_millis("2026-02-07:17:00:00", 0).unwrap(), expected);
    }

    #[test]
    fn test_invalid_formats() {
        assert!(parse_millis("", 0).is_err());
        assert!(parse_millis("yesterday", 0).is_err());
        assert!(parse_millis("2026-02-07", 0).is_err());
        assert!(parse_millis("-abc", 0).is_err());
        assert!(parse_millis("-5x", 0).is_err());
    }

    #[test]
    fn test_format_millis() {
        assert_eq!(
            format_millis(utc_ms(2026, 2, 7, 17, 0) + 42),
            "2026-02-07 17:00:00.042"
        );
    }
}
