//! Group keys derived from a record's pickup timestamp.

use std::fmt;
use std::hash::Hash;

use chrono::{DateTime, Datelike, NaiveDate, NaiveDateTime};
use serde::Serialize;

use crate::error::RecordError;

/// Formats accepted for textual pickup timestamps, tried in order.
const TIMESTAMP_FORMATS: &[&str] = &[
    "%Y-%m-%d %H:%M:%S",
    "%Y-%m-%d %H:%M:%S%.f",
    "%Y-%m-%dT%H:%M:%S",
    "%Y-%m-%dT%H:%M:%S%.f",
    "%Y-%m-%d %H:%M",
];

/// A key that identifies one group of an aggregation table.
pub trait GroupKey: Copy + Ord + Hash + fmt::Debug + Send + 'static {
    /// Column name of the key in the published table.
    const COLUMN: &'static str;

    fn from_timestamp(ts: &NaiveDateTime) -> Self;

    /// Canonical text form handed to downstream consumers.
    fn render(&self) -> String;
}

/// Calendar year and month.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
pub struct MonthKey {
    pub year: i32,
    pub month: u32,
}

impl MonthKey {
    /// First day of the month, the representative date of the group.
    pub fn first_day(&self) -> Option<NaiveDate> {
        NaiveDate::from_ymd_opt(self.year, self.month, 1)
    }
}

impl fmt::Display for MonthKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:04}-{:02}", self.year, self.month)
    }
}

pub fn day_key(ts: &NaiveDateTime) -> NaiveDate {
    ts.date()
}

pub fn month_key(ts: &NaiveDateTime) -> MonthKey {
    MonthKey {
        year: ts.year(),
        month: ts.month(),
    }
}

impl GroupKey for NaiveDate {
    const COLUMN: &'static str = "trip_date";

    fn from_timestamp(ts: &NaiveDateTime) -> Self {
        day_key(ts)
    }

    fn render(&self) -> String {
        self.format("%Y-%m-%d").to_string()
    }
}

impl GroupKey for MonthKey {
    const COLUMN: &'static str = "trip_month";

    fn from_timestamp(ts: &NaiveDateTime) -> Self {
        month_key(ts)
    }

    fn render(&self) -> String {
        // month is always 1..=12 when built from a timestamp
        match self.first_day() {
            Some(day) => day.and_time(chrono::NaiveTime::MIN).format("%Y-%m-%d %H:%M:%S").to_string(),
            None => format!("{self}-01 00:00:00"),
        }
    }
}

/// Converts microseconds since the Unix epoch into a UTC wall-clock timestamp.
pub fn timestamp_from_micros(micros: i64) -> Result<NaiveDateTime, RecordError> {
    DateTime::from_timestamp_micros(micros)
        .map(|dt| dt.naive_utc())
        .ok_or(RecordError::InvalidTimestamp)
}

/// Parses a textual pickup timestamp.
///
/// Accepts the naive formats in [`TIMESTAMP_FORMATS`], RFC 3339 (converted to
/// UTC) and bare dates (taken as midnight).
pub fn parse_timestamp(raw: &str) -> Result<NaiveDateTime, RecordError> {
    let raw = raw.trim();

    for format in TIMESTAMP_FORMATS {
        if let Ok(ts) = NaiveDateTime::parse_from_str(raw, format) {
            return Ok(ts);
        }
    }

    if let Ok(ts) = DateTime::parse_from_rfc3339(raw) {
        return Ok(ts.naive_utc());
    }

    NaiveDate::parse_from_str(raw, "%Y-%m-%d")
        .map(|d| d.and_time(chrono::NaiveTime::MIN))
        .map_err(|_| RecordError::InvalidTimestamp)
}
