//! Fixed-size integer records used to persist statistics.

use thiserror::Error;

/// Number of integers in a persisted [`MovingSum`](crate::MovingSum).
pub const MOVING_SUM_RECORD_LEN: usize = 7;

/// Number of integers in a persisted [`MovingAverage`](crate::MovingAverage).
pub const MOVING_AVERAGE_RECORD_LEN: usize = 3;

/// Errors raised when decoding a persisted statistic.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RecordError {
    /// The record does not have the fixed length of its statistic.
    #[error("{kind} record must hold {expected} values, found {found}")]
    Length {
        /// Statistic being decoded.
        kind: &'static str,
        /// Required number of values.
        expected: usize,
        /// Number of values supplied.
        found: usize,
    },
}

/// Copy a record into a fixed-size array, checking its length.
pub(crate) fn fixed<const N: usize>(
    kind: &'static str,
    record: &[i64],
) -> Result<[i64; N], RecordError> {
    record.try_into().map_err(|_| RecordError::Length {
        kind,
        expected: N,
        found: record.len(),
    })
}

/// Round a statistic value for storage.
pub(crate) fn round(value: f64) -> i64 {
    value.round() as i64
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fixed_accepts_exact_length() {
        let array: [i64; 3] = fixed("test", &[1, 2, 3]).unwrap();
        assert_eq!(array, [1, 2, 3]);
    }

    #[test]
    fn fixed_rejects_wrong_length() {
        let err = fixed::<3>("test", &[1, 2]).unwrap_err();
        assert_eq!(
            err,
            RecordError::Length {
                kind: "test",
                expected: 3,
                found: 2
            }
        );
        assert_eq!(err.to_string(), "test record must hold 3 values, found 2");
    }

    #[test]
    fn round_is_half_away_from_zero() {
        assert_eq!(round(2.5), 3);
        assert_eq!(round(-2.5), -3);
        assert_eq!(round(2.49), 2);
    }
}
