//! Per-resource usage statistics.

use crate::{MovingAverage, MovingSum, SumWindow};

/// Decayed usage statistics for one procedure or connection.
///
/// Every use counts as one call; failed uses are also counted separately and
/// leave their message in `last_error`. Durations are in milliseconds.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct UsageStats {
    /// Number of uses per window.
    pub calls: MovingSum,

    /// Number of failed uses per window.
    pub failures: MovingSum,

    /// Duration of each use in milliseconds.
    pub duration: MovingAverage,

    /// Unix timestamp in milliseconds of the most recent use.
    pub last_used: i64,

    /// Message of the most recent failure, if any.
    #[cfg_attr(feature = "serde", serde(skip_serializing_if = "Option::is_none"))]
    pub last_error: Option<String>,
}

impl UsageStats {
    /// Create empty statistics positioned at `now`.
    pub fn new(now: i64) -> Self {
        Self {
            calls: MovingSum::new(now),
            failures: MovingSum::new(now),
            duration: MovingAverage::default(),
            last_used: now,
            last_error: None,
        }
    }

    /// Record one use that ended at `now`.
    pub fn record(&mut self, now: i64, duration_ms: f64, error: Option<&str>) {
        self.move_to(now);
        self.calls.add(1.0);
        self.duration.add(duration_ms);
        self.last_used = self.last_used.max(now);
        if let Some(message) = error {
            self.failures.add(1.0);
            self.last_error = Some(message.to_string());
        }
    }

    /// Roll both sums forward to `now`.
    pub fn move_to(&mut self, now: i64) {
        self.calls.move_to(now);
        self.failures.move_to(now);
    }

    /// Share of uses in the window that failed, or 0 when there were none.
    pub fn failure_ratio(&self, window: SumWindow) -> f64 {
        let calls = self.calls.value_for(window);
        if calls <= 0.0 {
            return 0.0;
        }
        self.failures.value_for(window) / calls
    }
}
