//! Wall-clock access.
//!
//! Wire timestamps are Unix epoch seconds as `f64`, matching what the
//! deployed receivers expect. Everything that reasons about time takes an
//! explicit `now` argument so tests can inject it; this module is the single
//! place the real clock is read.

use chrono::Utc;

/// Current Unix time in seconds, with sub-second precision.
pub fn unix_now() -> f64 {
    Utc::now().timestamp_micros() as f64 / 1_000_000.0
}

/// RFC 3339 timestamp used in persisted rows.
pub fn rfc3339_now() -> String {
    Utc::now().to_rfc3339()
}
