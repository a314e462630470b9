//! Common types shared across the extraction pipeline.

use chrono::{DateTime, Duration, NaiveDate, Utc};
use serde::{Deserialize, Serialize};

use crate::errors::{Error, Result};

/// Half-open time range `[start, end)` an extraction run covers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DateRange {
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
}

impl DateRange {
    pub fn new(start: DateTime<Utc>, end: DateTime<Utc>) -> Result<Self> {
        if end <= start {
            return Err(Error::BadRequest {
                message: format!("date range end {end} must be after start {start}"),
            });
        }
        Ok(Self { start, end })
    }

    /// Build a range from calendar days, `end` exclusive, both at midnight UTC.
    pub fn from_dates(start: NaiveDate, end: NaiveDate) -> Result<Self> {
        Self::new(midnight(start), midnight(end))
    }

    /// The `days` whole days ending at (and excluding) `today`.
    pub fn trailing_days(today: NaiveDate, days: u32) -> Result<Self> {
        Self::from_dates(today - Duration::days(i64::from(days)), today)
    }

    pub fn duration(&self) -> Duration {
        self.end - self.start
    }

    /// Split into consecutive ranges no longer than `max_span`.
    pub fn chunks(&self, max_span: Duration) -> Vec<DateRange> {
        if max_span <= Duration::zero() || self.duration() <= max_span {
            return vec![*self];
        }

        let mut chunks = Vec::new();
        let mut start = self.start;
        while start < self.end {
            let end = (start + max_span).min(self.end);
            chunks.push(DateRange { start, end });
            start = end;
        }
        chunks
    }
}

fn midnight(date: NaiveDate) -> DateTime<Utc> {
    date.and_hms_opt(0, 0, 0).unwrap_or_default().and_utc()
}
