//! Wall-clock helpers. Timestamps are milliseconds since the Unix epoch.

use std::time::SystemTime;

use time::OffsetDateTime;

/// Current time in epoch milliseconds.
pub fn now_millis() -> i64 {
    to_millis(OffsetDateTime::now_utc())
}

/// Convert a filesystem timestamp into epoch milliseconds.
pub fn system_time_millis(value: SystemTime) -> i64 {
    to_millis(OffsetDateTime::from(value))
}

fn to_millis(value: OffsetDateTime) -> i64 {
    (value.unix_timestamp_nanos() / 1_000_000) as i64
}

/// Whole seconds elapsed between `since` and `now`, clamped at zero.
pub fn elapsed_seconds(since: i64, now: i64) -> u64 {
    u64::try_from(now.saturating_sub(since) / 1000).unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use std::time::{Duration, UNIX_EPOCH};

    use super::*;

    #[test]
    fn system_time_converts_to_millis() {
        let at = UNIX_EPOCH + Duration::from_millis(1_704_153_600_123);
        assert_eq!(system_time_millis(at), 1_704_153_600_123);
    }

    #[test]
    fn elapsed_seconds_floors_and_clamps() {
        assert_eq!(elapsed_seconds(1_000, 61_999), 60);
        assert_eq!(elapsed_seconds(1_000, 61_000), 60);
        assert_eq!(elapsed_seconds(5_000, 1_000), 0);
    }

    #[test]
    fn now_is_after_2024() {
        assert!(now_millis() > 1_704_067_200_000);
    }
}
