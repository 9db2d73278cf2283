//! Conversions between wall-clock times and the Unix-millisecond timestamps the feed uses.

use chrono::{DateTime, TimeZone, Utc};

pub fn to_unix_millis(time: DateTime<Utc>) -> i64 {
    time.timestamp_millis()
}

/// Returns None when `millis` is outside the range chrono can represent.
pub fn from_unix_millis(millis: i64) -> Option<DateTime<Utc>> {
    Utc.timestamp_millis_opt(millis).single()
}
