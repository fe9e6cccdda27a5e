//! Closed-open ranges of instants

use std::fmt::{Display, Formatter};

use chrono::{DateTime, Duration, TimeZone, Utc};
use serde::{Deserialize, Serialize};

/// A `[start, end)` range of instants.
///
/// A range whose end is not after its start is empty.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DateRange {
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
}

impl DateRange {
    pub fn new(start: DateTime<Utc>, end: DateTime<Utc>) -> Self {
        Self { start, end }
    }

    /// Build a range from epoch milliseconds, as found in the persisted meta rows
    pub fn from_millis(start: i64, end: i64) -> Option<Self> {
        let start = Utc.timestamp_millis_opt(start).single()?;
        let end = Utc.timestamp_millis_opt(end).single()?;
        Some(Self { start, end })
    }

    /// A range of `before` before and `after` after `center`
    pub fn around(center: DateTime<Utc>, before: Duration, after: Duration) -> Self {
        Self { start: center - before, end: center + after }
    }

    pub fn duration(&self) -> Duration {
        if self.is_empty() {
            Duration::zero()
        } else {
            self.end - self.start
        }
    }

    pub fn is_empty(&self) -> bool {
        self.end <= self.start
    }

    pub fn contains(&self, instant: DateTime<Utc>) -> bool {
        self.start <= instant && instant < self.end
    }

    /// Whether `other` lies entirely within this range.
    /// An empty `other` is only covered when its start lies within this range.
    pub fn covers(&self, other: &DateRange) -> bool {
        if other.is_empty() {
            return self.start <= other.start && other.start <= self.end;
        }
        self.start <= other.start && other.end <= self.end
    }

    pub fn intersects(&self, other: &DateRange) -> bool {
        self.start < other.end && other.start < self.end
    }

    /// Whether the two ranges overlap or touch, so that their union is contiguous
    pub fn touches(&self, other: &DateRange) -> bool {
        self.start <= other.end && other.start <= self.end
    }

    pub fn intersection(&self, other: &DateRange) -> Option<DateRange> {
        let start = self.start.max(other.start);
        let end = self.end.min(other.end);
        if start < end {
            Some(DateRange { start, end })
        } else {
            None
        }
    }

    /// The smallest range covering both ranges (gaps included)
    pub fn hull(&self, other: &DateRange) -> DateRange {
        DateRange {
            start: self.start.min(other.start),
            end: self.end.max(other.end),
        }
    }

    /// Remove `other` from this range.
    ///
    /// Returns `None` when nothing is left. When `other` sits strictly inside
    /// this range the result would not be contiguous: the larger remaining
    /// side is kept.
    pub fn subtract(&self, other: &DateRange) -> Option<DateRange> {
        if !self.intersects(other) {
            return Some(*self);
        }
        let before = DateRange { start: self.start, end: other.start };
        let after = DateRange { start: other.end, end: self.end };
        match (before.is_empty(), after.is_empty()) {
            (true, true) => None,
            (false, true) => Some(before),
            (true, false) => Some(after),
            (false, false) => {
                if before.duration() >= after.duration() {
                    Some(before)
                } else {
                    Some(after)
                }
            }
        }
    }
}

impl Display for DateRange {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "[{} → {})", self.start.to_rfc3339(), self.end.to_rfc3339())
    }
}
