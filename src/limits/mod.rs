//! Algorithms for controlling concurrency limits.

mod vegas;
mod window;

use crate::limiter::Outcome;

pub use vegas::{Completion, Vegas, VegasOptions, VegasStats};
