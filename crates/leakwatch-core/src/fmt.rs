//! Human-readable formatting for log messages.
//!
//! Structured log fields always carry raw numbers; these helpers only feed the
//! message text.

use chrono::TimeDelta;

const KIB: f64 = 1024.0;
const MIB: f64 = 1024.0 * 1024.0;
const GIB: f64 = 1024.0 * 1024.0 * 1024.0;

/// Format byte count as human-readable size.
///
/// `"1.5 GiB"`, `"100.3 MiB"`, `"50.0 KiB"`, `"512 B"`
pub fn format_bytes(bytes: u64) -> String {
    let f = bytes as f64;
    if f >= GIB {
        format!("{:.1} GiB", f / GIB)
    } else if f >= MIB {
        format!("{:.1} MiB", f / MIB)
    } else if f >= KIB {
        format!("{:.1} KiB", f / KIB)
    } else {
        format!("{} B", bytes)
    }
}

/// Format a signed byte delta, always with an explicit sign.
///
/// `"+1.5 MiB"`, `"-512 B"`, `"+0 B"`
pub fn format_signed_bytes(delta: i64) -> String {
    let sign = if delta < 0 { '-' } else { '+' };
    format!("{}{}", sign, format_bytes(delta.unsigned_abs()))
}

/// Format an hourly byte rate, e.g. `"+12.0 MiB/h"`.
pub fn format_rate_per_hour(rate: f64) -> String {
    if !rate.is_finite() {
        return "n/a".to_string();
    }
    format!("{}/h", format_signed_bytes(rate.round() as i64))
}

/// Format a time delta as `"3m 5s"`; negative deltas render as `"0s"`.
pub fn format_duration(delta: TimeDelta) -> String {
    let secs = delta.num_seconds();
    if secs <= 0 {
        let ms = delta.num_milliseconds();
        return if ms > 0 { format!("{}ms", ms) } else { "0s".to_string() };
    }
    if secs < 60 {
        format!("{}s", secs)
    } else if secs < 3600 {
        format!("{}m {}s", secs / 60, secs % 60)
    } else if secs < 86400 {
        format!("{}h {}m", secs / 3600, (secs % 3600) / 60)
    } else {
        format!("{}d {}h", secs / 86400, (secs % 86400) / 3600)
    }
}
