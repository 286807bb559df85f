//! Pure duration arithmetic shared by every timer in the engine.

use chrono::{DateTime, Utc};

/// Whole seconds between two instants, floored and never negative.
pub fn elapsed_seconds(start: DateTime<Utc>, end: DateTime<Utc>) -> u64 {
    elapsed_millis(start, end) / 1000
}

pub fn elapsed_millis(start: DateTime<Utc>, end: DateTime<Utc>) -> u64 {
    (end - start).num_milliseconds().max(0) as u64
}

/// Renders `H:MM:SS` from one hour up, `MM:SS` from one minute up, otherwise
/// two-digit seconds.
pub fn format_progressive(seconds: u64) -> String {
    let hours = seconds / 3600;
    let minutes = (seconds % 3600) / 60;
    let secs = seconds % 60;
    if hours > 0 {
        format!("{hours}:{minutes:02}:{secs:02}")
    } else if seconds >= 60 {
        format!("{minutes:02}:{secs:02}")
    } else {
        format!("{secs:02}")
    }
}

pub fn rounded_minutes(seconds: u64) -> u64 {
    (seconds as f64 / 60.0).round() as u64
}
