//! Moving sum over hour, day and month windows.

use crate::record::{fixed, round, RecordError, MOVING_SUM_RECORD_LEN};
use crate::SumWindow;

/// Totals for one window: the bucket being filled and the one before it.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
struct Bucket {
    current: f64,
    previous: f64,
}

impl Bucket {
    /// Shift the bucket forward from `from` to `to`.
    ///
    /// Returns true if at least one window boundary was crossed.
    fn roll(&mut self, window: SumWindow, from: i64, to: i64) -> bool {
        let crossed = window.bucket(to) - window.bucket(from);
        if crossed <= 0 {
            return false;
        }
        // Anything older than the immediately preceding bucket has decayed away.
        self.previous = if crossed == 1 { self.current } else { 0.0 };
        self.current = 0.0;
        true
    }
}

/// A constant-memory approximation of sliding-window totals.
///
/// Each window keeps the total of the bucket in progress and the total of
/// the bucket before it. The value of a window is the current total plus the
/// not-yet-elapsed share of the previous total, which approximates a sum over
/// the last full window length.
///
/// Values are only moved between buckets by [`move_to`](Self::move_to);
/// [`add`](Self::add) never rolls over. Callers that add values as they occur
/// should move the sum to the current time first.
///
/// # Example
///
/// ```rust
/// use callframe_types::{MovingSum, SumWindow, HOUR_MILLIS};
///
/// let mut sum = MovingSum::new(0);
/// sum.add(100.0);
/// sum.move_to(3 * HOUR_MILLIS);
///
/// // More than one hour boundary passed, so the hour window is empty.
/// assert_eq!(sum.value_for(SumWindow::Hour), 0.0);
/// // The day window still holds the total.
/// assert_eq!(sum.value_for(SumWindow::Day), 100.0);
/// ```
#[derive(Debug, Clone, Copy, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(
    feature = "serde",
    serde(into = "[i64; 7]", try_from = "Vec<i64>")
)]
pub struct MovingSum {
    timestamp: i64,
    hour: Bucket,
    day: Bucket,
    month: Bucket,
}

impl MovingSum {
    /// Create an empty sum positioned at `now` (Unix milliseconds).
    pub fn new(now: i64) -> Self {
        Self {
            timestamp: now,
            hour: Bucket::default(),
            day: Bucket::default(),
            month: Bucket::default(),
        }
    }

    /// Timestamp the sum was last moved to.
    pub fn timestamp(&self) -> i64 {
        self.timestamp
    }

    /// Add a value to the current bucket of every window.
    pub fn add(&mut self, value: f64) {
        self.hour.current += value;
        self.day.current += value;
        self.month.current += value;
    }

    /// Advance the clock to `now`, rolling buckets over as needed.
    ///
    /// Moving backwards is ignored. The day window is only checked when the
    /// hour rolled over, and the month only when the day did; window
    /// boundaries are aligned so a longer window never ends inside a shorter
    /// one.
    pub fn move_to(&mut self, now: i64) {
        if now <= self.timestamp {
            return;
        }
        let before = self.timestamp;
        self.timestamp = now;
        if !self.hour.roll(SumWindow::Hour, before, now) {
            return;
        }
        if !self.day.roll(SumWindow::Day, before, now) {
            return;
        }
        self.month.roll(SumWindow::Month, before, now);
    }

    /// Approximate total over the window ending at the current timestamp.
    pub fn value_for(&self, window: SumWindow) -> f64 {
        let bucket = self.bucket(window);
        let remaining = 1.0 - window.elapsed_fraction(self.timestamp);
        bucket.current + bucket.previous * remaining
    }

    /// Total of the bucket in progress.
    pub fn current(&self, window: SumWindow) -> f64 {
        self.bucket(window).current
    }

    /// Total of the bucket preceding the one in progress.
    pub fn previous(&self, window: SumWindow) -> f64 {
        self.bucket(window).previous
    }

    /// Encode as `[timestamp, hour, hour_prev, day, day_prev, month, month_prev]`,
    /// with totals rounded to integers.
    pub fn to_record(&self) -> [i64; MOVING_SUM_RECORD_LEN] {
        [
            self.timestamp,
            round(self.hour.current),
            round(self.hour.previous),
            round(self.day.current),
            round(self.day.previous),
            round(self.month.current),
            round(self.month.previous),
        ]
    }

    /// Decode a record produced by [`to_record`](Self::to_record).
    pub fn from_record(record: &[i64]) -> Result<Self, RecordError> {
        let [timestamp, h0, h1, d0, d1, m0, m1] =
            fixed::<MOVING_SUM_RECORD_LEN>("moving sum", record)?;
        let bucket = |current: i64, previous: i64| Bucket {
            current: current as f64,
            previous: previous as f64,
        };
        Ok(Self {
            timestamp,
            hour: bucket(h0, h1),
            day: bucket(d0, d1),
            month: bucket(m0, m1),
        })
    }

    fn bucket(&self, window: SumWindow) -> &Bucket {
        match window {
            SumWindow::Hour => &self.hour,
            SumWindow::Day => &self.day,
            SumWindow::Month => &self.month,
        }
    }
}

impl From<MovingSum> for [i64; MOVING_SUM_RECORD_LEN] {
    fn from(sum: MovingSum) -> Self {
        sum.to_record()
    }
}

impl TryFrom<Vec<i64>> for MovingSum {
    type Error = RecordError;

    fn try_from(record: Vec<i64>) -> Result<Self, Self::Error> {
        Self::from_record(&record)
    }
}
