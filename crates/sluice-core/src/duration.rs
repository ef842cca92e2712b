//! # Duration Parsing
//!
//! Window sizes arrive as short human strings: `15m`, `2h`, `500ms`. Only the
//! first `<integer><unit>` token is read.

use crate::error::DurationError;
use regex::Regex;
use std::sync::OnceLock;
use std::time::Duration;

const NANOS_PER_MICRO: u64 = 1_000;
const NANOS_PER_MILLI: u64 = 1_000_000;
const NANOS_PER_SEC: u64 = 1_000_000_000;

fn duration_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(\d+)(\w+)").expect("duration pattern is valid"))
}

/// Nanoseconds per unit, or `None` for unknown unit text. Case-sensitive.
fn unit_nanos(unit: &str) -> Option<u64> {
    let nanos = match unit {
        "h" | "hr" | "hour" | "hours" => 3600 * NANOS_PER_SEC,
        "m" | "min" | "minute" | "minutes" => 60 * NANOS_PER_SEC,
        "s" | "sec" | "second" | "seconds" => NANOS_PER_SEC,
        "us" | "usec" | "microsecond" | "microseconds" => NANOS_PER_MICRO,
        "ms" | "msec" | "millisecond" | "milliseconds" => NANOS_PER_MILLI,
        "ns" | "nsec" | "nanosecond" | "nanoseconds" => 1,
        "d" | "day" | "days" => 24 * 3600 * NANOS_PER_SEC,
        _ => return None,
    };
    Some(nanos)
}

/// Parse a `<integer><unit>` expression into a [`Duration`].
pub fn parse_duration(expr: &str) -> Result<Duration, DurationError> {
    let caps = duration_re()
        .captures(expr)
        .ok_or_else(|| DurationError::Format(expr.to_string()))?;
    let (num, unit) = (&caps[1], &caps[2]);

    let scale = unit_nanos(unit).ok_or_else(|| DurationError::Unit(unit.to_string()))?;
    let count: u64 = num
        .parse()
        .map_err(|_| DurationError::Overflow(expr.to_string()))?;
    let nanos = count
        .checked_mul(scale)
        .ok_or_else(|| DurationError::Overflow(expr.to_string()))?;

    Ok(Duration::from_nanos(nanos))
}
