//! Date windows for metric queries.

use chrono::{Duration, NaiveDate, NaiveTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use crate::Time;

/// Invalid input supplied by a caller.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ValidationError {
    /// Window start is after its end
    #[error("start ({start}) must not be after end ({end})")]
    InvertedWindow {
        /// Requested start
        start: Time,
        /// Requested end
        end: Time,
    },

    /// Date string is not `YYYY-MM-DD`
    #[error("invalid date '{0}', expected YYYY-MM-DD")]
    InvalidDate(String),

    /// Look-back period must be at least one day
    #[error("days_back must be positive, got {0}")]
    InvalidDaysBack(i64),
}

/// A closed time interval `[start, end]`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DateWindow {
    /// Inclusive start
    pub start: Time,
    /// Inclusive end
    pub end: Time,
}

impl DateWindow {
    /// Create a window, rejecting `start > end`.
    pub fn new(start: Time, end: Time) -> Result<Self, ValidationError> {
        if start > end {
            return Err(ValidationError::InvertedWindow { start, end });
        }
        Ok(Self { start, end })
    }

    /// Parse two `YYYY-MM-DD` dates; the end is extended to 23:59:59 of its day.
    pub fn from_dates(start: &str, end: &str) -> Result<Self, ValidationError> {
        let start_day = parse_day(start)?;
        let end_day = parse_day(end)?;
        let end_of_day = NaiveTime::from_hms_opt(23, 59, 59).unwrap_or(NaiveTime::MIN);

        Self::new(
            Utc.from_utc_datetime(&start_day.and_time(NaiveTime::MIN)),
            Utc.from_utc_datetime(&end_day.and_time(end_of_day)),
        )
    }

    /// The `days` days ending at `now`.
    pub fn trailing(days: i64, now: Time) -> Result<Self, ValidationError> {
        if days <= 0 {
            return Err(ValidationError::InvalidDaysBack(days));
        }
        Self::new(now - Duration::days(days), now)
    }

    /// Whole days covered, floored, never less than one.
    pub fn days(&self) -> i64 {
        (self.end - self.start).num_days().max(1)
    }

    /// Whether `t` lies inside the window (both ends inclusive).
    pub fn contains(&self, t: Time) -> bool {
        self.start <= t && t <= self.end
    }
}

/// Signed elapsed time from `from` to `to`, in fractional hours.
pub fn hours_between(from: Time, to: Time) -> f64 {
    (to - from).num_milliseconds() as f64 / 3_600_000.0
}

fn parse_day(s: &str) -> Result<NaiveDate, ValidationError> {
    NaiveDate::parse_from_str(s.trim(), "%Y-%m-%d")
        .map_err(|_| ValidationError::InvalidDate(s.to_string()))
}
