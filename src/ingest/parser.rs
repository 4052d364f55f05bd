//! Line parsing
//!
//! Turns one raw text line into a `LogRecord`. Parsing never fails: a line without
//! a level is INFO, a line without a timestamp is stamped with the ingestion time.

use crate::events::{LogLevel, LogRecord, Timestamp};
use chrono::{NaiveDateTime, Utc};
use once_cell::sync::Lazy;
use regex::Regex;

static LEVEL_PATTERN: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"\[(?:ERROR|WARNING|WARN|INFO|DEBUG|FATAL)\]|\b(?:ERROR|WARNING|WARN|INFO|DEBUG|FATAL)\b")
        .expect("level pattern is valid")
});

static TIMESTAMP_PATTERN: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(\d{4}-\d{2}-\d{2}[T ]\d{2}:\d{2}:\d{2})(?:[.,]\d+)?(?:Z|[+-]\d{2}:?\d{2})?")
        .expect("timestamp pattern is valid")
});

const TIMESTAMP_LAYOUTS: [&str; 2] = ["%Y-%m-%dT%H:%M:%S", "%Y-%m-%d %H:%M:%S"];

/// Parse a line, stamping it with the current time when it carries no timestamp
pub fn parse_line(stream_id: &str, line: &str) -> LogRecord {
    parse_line_at(stream_id, line, Utc::now())
}

/// Parse a line, using `now` when it carries no timestamp
pub fn parse_line_at(stream_id: &str, line: &str, now: Timestamp) -> LogRecord {
    let level = LEVEL_PATTERN
        .find(line)
        .and_then(|m| LogLevel::from_token(m.as_str()))
        .unwrap_or(LogLevel::Info);

    let timestamp = TIMESTAMP_PATTERN
        .captures(line)
        .and_then(|caps| caps.get(1))
        .and_then(|m| parse_timestamp(m.as_str()))
        .unwrap_or(now);

    let stripped = LEVEL_PATTERN.replace_all(line, "");
    let stripped = TIMESTAMP_PATTERN.replace_all(&stripped, "");
    let message = stripped.trim();

    let mut record = LogRecord::new(stream_id, line)
        .with_level(level)
        .with_timestamp(timestamp);
    if !message.is_empty() {
        record.message = message.to_string();
    }
    record
}

/// Second-resolution timestamp in either accepted layout, read as UTC
fn parse_timestamp(text: &str) -> Option<Timestamp> {
    TIMESTAMP_LAYOUTS
        .iter()
        .find_map(|layout| NaiveDateTime::parse_from_str(text, layout).ok())
        .map(|naive| naive.and_utc())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn now() -> Timestamp {
        Utc.with_ymd_and_hms(2030, 1, 1, 0, 0, 0).unwrap()
    }

    #[test]
    fn test_bracketed_level_and_iso_timestamp() {
        let line = "2024-03-05T14:22:01 [ERROR] connection refused to db";
        let record = parse_line_at("s1", line, now());

        assert_eq!(record.level, LogLevel::Error);
        assert_eq!(
            record.timestamp,
            Utc.with_ymd_and_hms(2024, 3, 5, 14, 22, 1).unwrap()
        );
        assert_eq!(record.message, "connection refused to db");
        assert_eq!(record.raw, line);
        assert_eq!(record.stream_id, "s1");
    }

    #[test]
    fn test_bare_level_and_space_timestamp() {
        let record = parse_line_at("s1", "2024-03-05 08:00:00 WARN disk at 91%", now());
        assert_eq!(record.level, LogLevel::Warn);
        assert_eq!(
            record.timestamp,
            Utc.with_ymd_and_hms(2024, 3, 5, 8, 0, 0).unwrap()
        );
        assert_eq!(record.message, "disk at 91%");
    }

    #[test]
    fn test_bracketed_warning_is_stripped_whole() {
        let record = parse_line_at("s1", "[WARNING] disk at 91%", now());
        assert_eq!(record.level, LogLevel::Warn);
        assert_eq!(record.message, "disk at 91%");
    }

    #[test]
    fn test_fraction_and_zone_are_stripped() {
        let record = parse_line_at("s1", "2024-03-05T08:00:00.123Z INFO ready", now());
        assert_eq!(record.message, "ready");
        assert_eq!(
            record.timestamp,
            Utc.with_ymd_and_hms(2024, 3, 5, 8, 0, 0).unwrap()
        );
    }

    #[test]
    fn test_defaults_without_level_or_timestamp() {
        let record = parse_line_at("s1", "just some text", now());
        assert_eq!(record.level, LogLevel::Info);
        assert_eq!(record.timestamp, now());
        assert_eq!(record.message, "just some text");
    }

    #[test]
    fn test_message_falls_back_to_raw() {
        let record = parse_line_at("s1", "[FATAL]", now());
        assert_eq!(record.level, LogLevel::Fatal);
        assert_eq!(record.message, "[FATAL]");
    }

    #[test]
    fn test_first_level_wins_and_all_are_stripped() {
        let record = parse_line_at("s1", "DEBUG retrying after ERROR", now());
        assert_eq!(record.level, LogLevel::Debug);
        assert_eq!(record.message, "retrying after");
    }

    #[test]
    fn test_lowercase_words_are_not_levels() {
        let record = parse_line_at("s1", "an error occurred", now());
        assert_eq!(record.level, LogLevel::Info);
        assert_eq!(record.message, "an error occurred");
    }

    #[test]
    fn test_invalid_date_keeps_ingestion_time() {
        let record = parse_line_at("s1", "2024-13-45T99:00:00 ERROR bad clock", now());
        assert_eq!(record.timestamp, now());
        assert_eq!(record.level, LogLevel::Error);
    }
}
