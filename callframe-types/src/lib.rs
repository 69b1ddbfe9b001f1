//! # callframe-types
//!
//! Constant-memory usage statistics for the callframe engine. The types in this
//! crate approximate sliding-window aggregates without keeping any history:
//! a [`MovingSum`] keeps two buckets per time window and decays the older one
//! linearly, a [`MovingAverage`] keeps three exponential averages of different
//! lengths.
//!
//! ## Features
//!
//! - `serde`: serialize the statistics as their fixed-size integer records
//!
//! ## Example
//!
//! ```rust
//! use callframe_types::{MovingSum, SumWindow, HOUR_MILLIS};
//!
//! let mut sum = MovingSum::new(0);
//! sum.add(100.0);
//!
//! // One hour boundary later the old total becomes the previous bucket...
//! sum.move_to(HOUR_MILLIS);
//! // ...and halfway through the next hour only half of it still counts.
//! sum.move_to(HOUR_MILLIS + HOUR_MILLIS / 2);
//! assert_eq!(sum.value_for(SumWindow::Hour), 50.0);
//! ```
//!
//! ## Persistence
//!
//! Both statistics convert to and from a fixed-size sequence of integers so
//! that stores without exact float support can hold them. See
//! [`MovingSum::to_record`] and [`MovingAverage::to_record`].

mod moving_average;
mod moving_sum;
mod record;
mod usage;
mod window;

pub use moving_average::*;
pub use moving_sum::*;
pub use record::*;
pub use usage::*;
pub use window::*;
