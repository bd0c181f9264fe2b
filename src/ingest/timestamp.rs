//! Timestamp cell parsing.
//!
//! Accepted forms, tried in order:
//! - RFC 3339 (`2025-04-05T14:03:11.250Z`, with offset)
//! - naive ISO date-time with `T` or space separator, optional fraction (UTC)
//! - numeric epoch, seconds or milliseconds (values above 1e11 are millis)

use chrono::{DateTime, NaiveDateTime, Utc};

const NAIVE_FORMATS: [&str; 4] = [
    "%Y-%m-%dT%H:%M:%S%.f",
    "%Y-%m-%d %H:%M:%S%.f",
    "%Y-%m-%dT%H:%M",
    "%Y-%m-%d %H:%M",
];

/// Epoch values above this are interpreted as milliseconds.
const EPOCH_MILLIS_CUTOFF: f64 = 1e11;

/// Parse one timestamp cell. Empty or unrecognized cells yield `None`.
pub fn parse_timestamp(raw: &str) -> Option<DateTime<Utc>> {
    let s = raw.trim();
    if s.is_empty() {
        return None;
    }

    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return Some(dt.with_timezone(&Utc));
    }

    for fmt in NAIVE_FORMATS {
        if let Ok(naive) = NaiveDateTime::parse_from_str(s, fmt) {
            return Some(naive.and_utc());
        }
    }

    let epoch: f64 = s.parse().ok()?;
    if !epoch.is_finite() {
        return None;
    }
    let millis = if epoch.abs() > EPOCH_MILLIS_CUTOFF {
        epoch
    } else {
        epoch * 1000.0
    };
    DateTime::<Utc>::from_timestamp_millis(millis.round() as i64)
}
