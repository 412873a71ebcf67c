// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

use core::fmt;
use core::time::Duration;

use crate::time::{Ticks, TimeError};

/// A monotonic tick source: wall time quantized to the timer's granularity,
/// anchored at runtime construction.
///
/// One tick is one `tick_duration`; the wheel tracks deadlines purely in
/// ticks, so the tick duration is in effect the timer's precision. The
/// default of 1 ms gives the wheel a range of roughly two years.
#[derive(Clone)]
pub(crate) struct Clock {
    anchor: std::time::Instant,
    tick_duration: Duration,
}

impl Clock {
    pub(crate) const DEFAULT_TICK: Duration = Duration::from_millis(1);

    pub(crate) fn new(tick_duration: Duration) -> Self {
        assert!(!tick_duration.is_zero(), "tick duration must be non-zero");
        Self {
            anchor: std::time::Instant::now(),
            tick_duration,
        }
    }

    pub(crate) fn tick_duration(&self) -> Duration {
        self.tick_duration
    }

    /// The longest duration the timer wheel can represent with this clock.
    pub(crate) fn max_duration(&self) -> Duration {
        self.tick_duration.saturating_mul(u32::MAX)
    }

    pub(crate) fn now_ticks(&self) -> Ticks {
        let elapsed = self.anchor.elapsed();
        let ticks = elapsed.as_nanos() / self.tick_duration.as_nanos();
        Ticks(u64::try_from(ticks).unwrap_or(u64::MAX))
    }

    pub(crate) fn duration_to_ticks(&self, duration: Duration) -> Result<Ticks, TimeError> {
        let ticks = duration.as_nanos().div_ceil(self.tick_duration.as_nanos());

        match u64::try_from(ticks) {
            Ok(ticks) if ticks <= u64::from(u32::MAX) => Ok(Ticks(ticks)),
            _ => Err(TimeError::DurationTooLong {
                requested: duration,
                max: self.max_duration(),
            }),
        }
    }

    pub(crate) fn ticks_to_duration(&self, ticks: Ticks) -> Duration {
        self.tick_duration.saturating_mul(
            u32::try_from(ticks.0).unwrap_or(u32::MAX),
        )
    }
}

impl fmt::Debug for Clock {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Clock")
            .field("tick_duration", &self.tick_duration)
            .field("now", &self.now_ticks())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ticks_round_up() {
        let clock = Clock::new(Duration::from_millis(1));
        assert_eq!(
            clock.duration_to_ticks(Duration::from_micros(1)).unwrap(),
            Ticks(1)
        );
        assert_eq!(
            clock.duration_to_ticks(Duration::from_millis(5)).unwrap(),
            Ticks(5)
        );
    }

    #[test]
    fn absurd_duration_is_rejected() {
        let clock = Clock::new(Duration::from_millis(1));
        assert!(matches!(
            clock.duration_to_ticks(Duration::from_secs(u64::MAX)),
            Err(TimeError::DurationTooLong { .. })
        ));
    }

    #[test]
    fn clock_advances() {
        let clock = Clock::new(Duration::from_micros(10));
        let a = clock.now_ticks();
        std::thread::sleep(Duration::from_millis(2));
        let b = clock.now_ticks();
        assert!(b > a);
    }
}
