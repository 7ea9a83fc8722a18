//! Adaptive admission control for protecting a shared resource from overload.
//!
//! Combines a concurrency limit which tunes itself from observed latency ([limits::Vegas]) with
//! a bounded wait queue which sheds work when queueing delay stays high ([queue::DelayQueue]).

#![deny(missing_docs)]

#[cfg(doctest)]
use doc_comment::doctest;
#[cfg(doctest)]
doctest!("../README.md");

mod clock;
mod error;
pub mod limiter;
pub mod limits;
pub mod queue;

pub use error::Error;
pub use limiter::{Limiter, LimiterOptions, Outcome, Stats, Token};
