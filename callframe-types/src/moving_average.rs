//! Exponential moving averages over three sample windows.

use crate::record::{fixed, round, RecordError, MOVING_AVERAGE_RECORD_LEN};
use crate::AverageWindow;

/// Three exponential moving averages with window sizes of about 10, 100 and
/// 1000 samples.
///
/// Each new sample moves every average towards it by `1 / size` of the
/// distance, so the short average reacts quickly and the long one smooths
/// out bursts.
///
/// # Example
///
/// ```rust
/// use callframe_types::{AverageWindow, MovingAverage};
///
/// let mut avg = MovingAverage::new(0.0);
/// avg.add(100.0);
///
/// assert_eq!(avg.value_for(AverageWindow::Short), 10.0);
/// assert_eq!(avg.value_for(AverageWindow::Long), 0.1);
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(
    feature = "serde",
    serde(into = "[i64; 3]", try_from = "Vec<i64>")
)]
pub struct MovingAverage {
    short: f64,
    medium: f64,
    long: f64,
}

impl MovingAverage {
    /// Create averages that all start at `initial`.
    pub fn new(initial: f64) -> Self {
        Self {
            short: initial,
            medium: initial,
            long: initial,
        }
    }

    /// Fold a sample into every window.
    pub fn add(&mut self, value: f64) {
        for window in AverageWindow::ALL {
            let avg = self.slot(window);
            *avg += window.ratio() * (value - *avg);
        }
    }

    /// Current average for a window.
    pub fn value_for(&self, window: AverageWindow) -> f64 {
        match window {
            AverageWindow::Short => self.short,
            AverageWindow::Medium => self.medium,
            AverageWindow::Long => self.long,
        }
    }

    /// Encode as `[short * 10, medium * 100, long * 1000]` rounded to integers.
    ///
    /// Scaling by the window size keeps the precision that matters for each
    /// window without storing floats.
    pub fn to_record(&self) -> [i64; MOVING_AVERAGE_RECORD_LEN] {
        AverageWindow::ALL.map(|w| round(self.value_for(w) * f64::from(w.size())))
    }

    /// Decode a record produced by [`to_record`](Self::to_record).
    pub fn from_record(record: &[i64]) -> Result<Self, RecordError> {
        let [short, medium, long] = fixed::<MOVING_AVERAGE_RECORD_LEN>("moving average", record)?;
        let unscale = |value: i64, window: AverageWindow| value as f64 / f64::from(window.size());
        Ok(Self {
            short: unscale(short, AverageWindow::Short),
            medium: unscale(medium, AverageWindow::Medium),
            long: unscale(long, AverageWindow::Long),
        })
    }

    fn slot(&mut self, window: AverageWindow) -> &mut f64 {
        match window {
            AverageWindow::Short => &mut self.short,
            AverageWindow::Medium => &mut self.medium,
            AverageWindow::Long => &mut self.long,
        }
    }
}

impl From<MovingAverage> for [i64; MOVING_AVERAGE_RECORD_LEN] {
    fn from(avg: MovingAverage) -> Self {
        avg.to_record()
    }
}

impl TryFrom<Vec<i64>> for MovingAverage {
    type Error = RecordError;

    fn try_from(record: Vec<i64>) -> Result<Self, Self::Error> {
        Self::from_record(&record)
    }
}
