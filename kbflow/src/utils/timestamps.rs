//! Timestamp helpers.
//!
//! Content sources report post times in several shapes: RFC 3339, the
//! legacy `Wed Oct 10 20:19:24 +0000 2018` form used by the X API, and
//! bare Unix numbers in seconds or milliseconds.

use chrono::{DateTime, TimeZone, Utc};
use thiserror::Error;

/// Represents a timestamp that can be serialized/deserialized.
pub type Timestamp = DateTime<Utc>;

const LEGACY_POST_FORMAT: &str = "%a %b %d %H:%M:%S %z %Y";

/// Errors that can occur during timestamp parsing.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum TimestampError {
    /// The timestamp string is empty.
    #[error("Empty timestamp string")]
    EmptyString,

    /// The timestamp value is invalid.
    #[error("Invalid timestamp: {0}")]
    InvalidFormat(String),
}

/// Returns the current UTC time as an ISO 8601 formatted string.
#[must_use]
pub fn iso_timestamp() -> String {
    Utc::now().format("%Y-%m-%dT%H:%M:%S%.6f+00:00").to_string()
}

/// Returns the current UTC timestamp.
#[must_use]
pub fn now_utc() -> Timestamp {
    Utc::now()
}

/// Parses a post timestamp from any of the supported shapes.
pub fn parse_timestamp(input: &str) -> Result<Timestamp, TimestampError> {
    let trimmed = input.trim();

    if trimmed.is_empty() {
        return Err(TimestampError::EmptyString);
    }

    if let Ok(num) = trimmed.parse::<i64>() {
        return parse_unix(num).ok_or_else(|| TimestampError::InvalidFormat(trimmed.to_string()));
    }

    if let Ok(dt) = DateTime::parse_from_rfc3339(trimmed) {
        return Ok(dt.with_timezone(&Utc));
    }

    if let Ok(dt) = DateTime::parse_from_str(trimmed, LEGACY_POST_FORMAT) {
        return Ok(dt.with_timezone(&Utc));
    }

    Err(TimestampError::InvalidFormat(trimmed.to_string()))
}

// More than 11 digits is milliseconds.
fn parse_unix(value: i64) -> Option<Timestamp> {
    if value.unsigned_abs() >= 100_000_000_000 {
        Utc.timestamp_millis_opt(value).single()
    } else {
        Utc.timestamp_opt(value, 0).single()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Datelike, Timelike};

    #[test]
    fn test_parse_rfc3339() {
        let dt = parse_timestamp("2023-10-05T14:30:00Z").unwrap();
        assert_eq!(dt.year(), 2023);
        assert_eq!(dt.month(), 10);
        assert_eq!(dt.day(), 5);
    }

    #[test]
    fn test_parse_legacy_post_format() {
        let dt = parse_timestamp("Wed Oct 10 20:19:24 +0000 2018").unwrap();
        assert_eq!(dt.year(), 2018);
        assert_eq!(dt.hour(), 20);
    }

    #[test]
    fn test_parse_unix_seconds_and_millis() {
        let secs = parse_timestamp("1696512000").unwrap();
        let millis = parse_timestamp("1696512000000").unwrap();
        assert_eq!(secs, millis);
    }

    #[test]
    fn test_parse_empty_and_garbage() {
        assert_eq!(parse_timestamp("  "), Err(TimestampError::EmptyString));
        assert!(matches!(
            parse_timestamp("yesterday"),
            Err(TimestampError::InvalidFormat(_))
        ));
    }

    #[test]
    fn test_iso_timestamp_format() {
        let ts = iso_timestamp();
        assert!(ts.contains('T'));
        assert!(ts.ends_with("+00:00"));
    }
}
