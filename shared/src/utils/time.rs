//! Time-related utilities

use chrono::{TimeZone, Utc};
use std::time::{SystemTime, UNIX_EPOCH};

/// Get the current system time in milliseconds since UNIX epoch
pub fn system_time_millis() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .expect("system time before UNIX epoch")
        .as_millis() as i64
}

/// Render a capture time (ms since epoch) as RFC 3339 for log output
pub fn format_capture_time(capture_time: i64) -> String {
    match Utc.timestamp_millis_opt(capture_time).single() {
        Some(t) => t.to_rfc3339(),
        None => capture_time.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_system_time() {
        // After 2020
        assert!(system_time_millis() > 1_600_000_000_000);
    }

    #[test]
    fn test_format_capture_time() {
        assert_eq!(format_capture_time(60_000), "1970-01-01T00:01:00+00:00");
    }
}
