//! Timestamp parsing and formatting shared by every operation.

use crate::{CoreError, Result};
use chrono::{DateTime, Duration, NaiveDateTime, TimeZone, Utc};

/// Output format of every timestamp an operation reports.
pub const OUTPUT_FORMAT: &str = "%Y-%m-%dT%H:%M:%SZ";
/// Format Blazar expects on lease create.
pub const BLAZAR_FORMAT: &str = "%Y-%m-%d %H:%M";

pub const MIN_DURATION_MINUTES: u32 = 1;
/// 31 days.
pub const MAX_DURATION_MINUTES: u32 = 44_640;

const NAIVE_FORMATS: [&str; 5] = [
    "%Y-%m-%dT%H:%M:%S%.f",
    "%Y-%m-%dT%H:%M:%S",
    "%Y-%m-%d %H:%M:%S",
    "%Y-%m-%dT%H:%M",
    "%Y-%m-%d %H:%M",
];

/// Parses an ISO-8601-ish timestamp. Inputs without an offset are UTC.
pub fn parse_utc(raw: &str) -> Result<DateTime<Utc>> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return Err(CoreError::Validation("start time is required".to_string()));
    }

    if let Ok(with_offset) = DateTime::parse_from_rfc3339(trimmed) {
        return Ok(with_offset.with_timezone(&Utc));
    }

    let without_zone = trimmed.strip_suffix('Z').unwrap_or(trimmed);
    NAIVE_FORMATS
        .iter()
        .find_map(|format| NaiveDateTime::parse_from_str(without_zone, format).ok())
        .map(|naive| Utc.from_utc_datetime(&naive))
        .ok_or_else(|| {
            CoreError::Validation(format!(
                "invalid start time '{raw}' (expected ISO-8601, e.g. 2026-01-01T00:00:00Z)"
            ))
        })
}

pub fn format_utc(at: &DateTime<Utc>) -> String {
    at.format(OUTPUT_FORMAT).to_string()
}

pub fn format_blazar(at: &DateTime<Utc>) -> String {
    at.format(BLAZAR_FORMAT).to_string()
}

/// Re-renders a backend timestamp in the output format; unparseable values pass through.
pub fn normalize(raw: &str) -> String {
    parse_utc(raw)
        .map(|at| format_utc(&at))
        .unwrap_or_else(|_| raw.to_string())
}

pub fn validate_duration(minutes: u32) -> Result<()> {
    if !(MIN_DURATION_MINUTES..=MAX_DURATION_MINUTES).contains(&minutes) {
        return Err(CoreError::Validation(format!(
            "duration must be between {MIN_DURATION_MINUTES} and {MAX_DURATION_MINUTES} minutes, got {minutes}"
        )));
    }
    Ok(())
}

/// Half-open interval `[start, end)` a reservation occupies.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReservationWindow {
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
    pub duration_minutes: u32,
}

impl ReservationWindow {
    pub fn parse(start: &str, duration_minutes: u32) -> Result<Self> {
        validate_duration(duration_minutes)?;
        let start = parse_utc(start)?;
        Ok(Self::from_start(start, duration_minutes))
    }

    pub fn from_start(start: DateTime<Utc>, duration_minutes: u32) -> Self {
        Self {
            start,
            end: start + Duration::minutes(i64::from(duration_minutes)),
            duration_minutes,
        }
    }

    pub fn overlaps(&self, start: &DateTime<Utc>, end: &DateTime<Utc>) -> bool {
        *start < self.end && *end > self.start
    }

    pub fn start_str(&self) -> String {
        format_utc(&self.start)
    }

    pub fn end_str(&self) -> String {
        format_utc(&self.end)
    }
}
