//! Time and sample windows used by the moving statistics.
//!
//! Sum windows are aligned to UTC: hours and days are multiples of their
//! length since the Unix epoch, months follow the calendar.

use chrono::{DateTime, Datelike, NaiveDate, Utc};

/// Length of the hour window in milliseconds.
pub const HOUR_MILLIS: i64 = 3_600_000;

/// Length of the day window in milliseconds.
pub const DAY_MILLIS: i64 = 24 * HOUR_MILLIS;

/// Time window of a [`MovingSum`](crate::MovingSum).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(rename_all = "lowercase"))]
pub enum SumWindow {
    /// Clock hour.
    Hour,
    /// UTC day.
    Day,
    /// UTC calendar month.
    Month,
}

impl SumWindow {
    /// All windows in rollover order.
    pub const ALL: [SumWindow; 3] = [SumWindow::Hour, SumWindow::Day, SumWindow::Month];

    /// Sequence number of the window bucket containing `millis`.
    ///
    /// Consecutive buckets have consecutive numbers, so the difference between
    /// two bucket numbers is the count of boundaries crossed between them.
    pub fn bucket(self, millis: i64) -> i64 {
        match self {
            SumWindow::Hour => millis.div_euclid(HOUR_MILLIS),
            SumWindow::Day => millis.div_euclid(DAY_MILLIS),
            SumWindow::Month => {
                let date = utc(millis);
                i64::from(date.year()) * 12 + i64::from(date.month0())
            }
        }
    }

    /// Fraction of the bucket containing `millis` that has already elapsed,
    /// in the range `[0, 1)`.
    pub fn elapsed_fraction(self, millis: i64) -> f64 {
        match self {
            SumWindow::Hour => millis.rem_euclid(HOUR_MILLIS) as f64 / HOUR_MILLIS as f64,
            SumWindow::Day => millis.rem_euclid(DAY_MILLIS) as f64 / DAY_MILLIS as f64,
            SumWindow::Month => match month_span(millis) {
                Some((start, end)) => (millis - start) as f64 / (end - start) as f64,
                None => 0.0,
            },
        }
    }
}

/// Sample window of a [`MovingAverage`](crate::MovingAverage).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(rename_all = "lowercase"))]
pub enum AverageWindow {
    /// Roughly the last 10 samples.
    Short,
    /// Roughly the last 100 samples.
    Medium,
    /// Roughly the last 1000 samples.
    Long,
}

impl AverageWindow {
    /// All windows, shortest first.
    pub const ALL: [AverageWindow; 3] = [
        AverageWindow::Short,
        AverageWindow::Medium,
        AverageWindow::Long,
    ];

    /// Nominal number of samples in the window.
    pub const fn size(self) -> u32 {
        match self {
            AverageWindow::Short => 10,
            AverageWindow::Medium => 100,
            AverageWindow::Long => 1000,
        }
    }

    /// Decay ratio applied to each new sample.
    pub fn ratio(self) -> f64 {
        1.0 / f64::from(self.size())
    }
}

fn utc(millis: i64) -> DateTime<Utc> {
    DateTime::from_timestamp_millis(millis).unwrap_or_default()
}

/// Start and end (exclusive) of the calendar month containing `millis`.
fn month_span(millis: i64) -> Option<(i64, i64)> {
    let date = utc(millis);
    let (year, month) = (date.year(), date.month());
    let (next_year, next_month) = if month == 12 {
        (year + 1, 1)
    } else {
        (year, month + 1)
    };
    Some((
        month_start(year, month)?,
        month_start(next_year, next_month)?,
    ))
}

fn month_start(year: i32, month: u32) -> Option<i64> {
    NaiveDate::from_ymd_opt(year, month, 1)?
        .and_hms_opt(0, 0, 0)
        .map(|dt| dt.and_utc().timestamp_millis())
}
