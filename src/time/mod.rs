// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! Timers: a hierarchical timing wheel shared by all workers, and the
//! [`sleep`]/[`timeout`] futures built on top of it.
//!
//! The wheel is driven opportunistically: every worker turns it when it runs
//! out of tasks, and the earliest pending deadline bounds how long a worker
//! is allowed to block in the reactor or on its parker.

mod clock;
mod sleep;
mod timeout;
mod timer;

use core::fmt;
use core::time::Duration;

pub(crate) use clock::Clock;
pub use sleep::{Sleep, sleep, sleep_until};
pub use timeout::{Elapsed, Timeout, timeout};
pub(crate) use timer::{Deadline, Timer};

/// A point in time, measured in timer ticks from the runtime's start.
///
/// Obtained from [`now`] and consumed by [`sleep_until`]. Only meaningful
/// relative to the runtime that produced it.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Ord, PartialOrd)]
pub struct Instant(pub(crate) Ticks);

/// A duration measured in timer ticks.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Ord, PartialOrd)]
pub(crate) struct Ticks(pub(crate) u64);

/// Returns the current instant on the current runtime's timer.
///
/// # Panics
///
/// Panics if called outside a runtime, or if the runtime was built with
/// timers disabled.
pub fn now() -> Instant {
    let handle = crate::runtime::Handle::current();
    let timer = handle.timer();
    Instant(timer.clock().now_ticks())
}

/// Errors returned by the timer.
#[derive(Debug, Eq, PartialEq)]
#[non_exhaustive]
pub enum TimeError {
    /// The requested duration (or deadline distance) exceeds what the timer
    /// wheel can represent.
    DurationTooLong {
        /// The duration that was requested.
        requested: Duration,
        /// The maximum duration supported by the timer.
        max: Duration,
    },
}

impl fmt::Display for TimeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TimeError::DurationTooLong { requested, max } => {
                write!(f, "duration too long: {requested:?}, maximum {max:?}")
            }
        }
    }
}

impl core::error::Error for TimeError {}
