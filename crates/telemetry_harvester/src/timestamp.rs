//! Wall-clock helpers for the wire format (epoch milliseconds, UTC).

use std::time::{Duration, SystemTime, UNIX_EPOCH};

/// Milliseconds since the Unix epoch. Times before the epoch are negative.
pub fn epoch_millis(t: SystemTime) -> i64 {
    match t.duration_since(UNIX_EPOCH) {
        Ok(d) => d.as_millis() as i64,
        Err(e) => -(e.duration().as_millis() as i64),
    }
}

/// Whole milliseconds in `d`.
pub fn duration_millis(d: Duration) -> i64 {
    d.as_millis() as i64
}

/// Fractional milliseconds in `d`, as span durations are reported.
pub fn duration_millis_f64(d: Duration) -> f64 {
    d.as_secs_f64() * 1000.0
}
