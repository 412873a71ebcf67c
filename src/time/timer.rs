// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

mod entry;
mod wheel;

use core::pin::Pin;
use core::ptr::NonNull;
use core::task::Poll;

use cordyceps::List;

use crate::loom::sync::Mutex;
use crate::loom::sync::atomic::Ordering;
use crate::time::{Clock, Ticks};
use wheel::Wheel;

pub(in crate::time) use entry::Entry;

/// The next point at which a timer will fire, with its wheel coordinates.
#[derive(Copy, Clone, Debug)]
pub(crate) struct Deadline {
    pub(crate) ticks: Ticks,
    slot: usize,
    wheel: usize,
}

/// The timer: a hierarchical timing wheel of [`Sleep`][crate::time::Sleep]
/// entries, shared by all workers and advanced by whichever of them turns it
/// next.
#[derive(Debug)]
pub(crate) struct Timer {
    clock: Clock,
    core: Mutex<Core>,
}

/// The wheels themselves; guarded by the timer's mutex.
#[derive(Debug)]
pub(in crate::time) struct Core {
    /// The tick the wheel has been advanced to.
    now: Ticks,
    /// One wheel per level, each 64 slots, with a precision multiplier of
    /// `64^level` ticks per slot:
    ///
    /// | wheel | slot width | range           |
    /// |-------|------------|-----------------|
    /// | 0     | 1 ms       | 64 ms           |
    /// | 1     | 64 ms      | ~4 s            |
    /// | 2     | ~4 s       | ~4 min          |
    /// | 3     | ~4 min     | ~4.5 hr         |
    /// | 4     | ~4.5 hr    | ~12 days        |
    /// | 5     | ~12 days   | ~2 years        |
    ///
    /// (widths shown for the default 1 ms tick)
    wheels: [Wheel; Core::WHEELS],
}

// === impl Timer ===

impl Timer {
    pub(crate) fn new(clock: Clock) -> Self {
        Self {
            clock,
            core: Mutex::new(Core::new()),
        }
    }

    #[inline]
    pub(crate) fn clock(&self) -> &Clock {
        &self.clock
    }

    /// Advance the wheel if no other worker is currently advancing it.
    ///
    /// Returns the number of fired entries and the next pending deadline.
    #[inline]
    pub(crate) fn try_turn(&self) -> Option<(usize, Option<Deadline>)> {
        let mut lock = self.core.try_lock().ok()?;
        Some(self.turn_locked(&mut lock))
    }

    /// Register a sleep entry, advancing the wheel first so the entry lands
    /// relative to fresh time.
    ///
    /// Fires the entry immediately (returning `Ready`) if its deadline has
    /// already passed.
    ///
    /// # Safety
    ///
    /// `entry` must stay pinned and valid until it fires or is cancelled via
    /// [`Timer::cancel`].
    pub(in crate::time) unsafe fn register(&self, entry: NonNull<Entry>) -> Poll<()> {
        let mut core = self.core.lock().unwrap();
        // while we hold the lock anyway, advance the wheel; this keeps time
        // moving even when every worker is busy polling.
        self.turn_locked(&mut core);
        // Safety: forwarded to the caller.
        unsafe { core.register(entry) }
    }

    /// Unlink a cancelled (dropped) sleep entry.
    pub(in crate::time) fn cancel(&self, entry: Pin<&mut Entry>) {
        let mut core = self.core.lock().unwrap();
        core.cancel(entry);
    }

    /// The next pending deadline, if any, without advancing the wheel.
    pub(crate) fn next_deadline(&self) -> Option<Deadline> {
        self.core.lock().unwrap().next_deadline()
    }

    /// Time remaining until `deadline`, saturating to zero.
    pub(crate) fn time_until(&self, deadline: &Deadline) -> core::time::Duration {
        let now = self.clock.now_ticks();
        let remaining = Ticks(deadline.ticks.0.saturating_sub(now.0));
        self.clock.ticks_to_duration(remaining)
    }

    fn turn_locked(&self, core: &mut Core) -> (usize, Option<Deadline>) {
        let mut now = self.clock.now_ticks();

        if now < core.now {
            tracing::warn!("time went backwards!");
            now = core.now;
        }

        let mut expired = 0;
        loop {
            let (fired, next_deadline) = core.advance_to(now);
            expired += fired;
            if let Some(next) = next_deadline {
                now = self.clock.now_ticks();
                if now >= next.ticks {
                    // we advanced past the next deadline while processing;
                    // go around again.
                    continue;
                }
            }

            return (expired, next_deadline);
        }
    }
}

// === impl Core ===

impl Core {
    pub(in crate::time) const WHEELS: usize = Wheel::BITS;

    const fn new() -> Self {
        Self {
            now: Ticks(0),
            wheels: [
                Wheel::new(0),
                Wheel::new(1),
                Wheel::new(2),
                Wheel::new(3),
                Wheel::new(4),
                Wheel::new(5),
            ],
        }
    }

    /// Advance the wheel to `now`, firing every entry whose deadline has
    /// passed. Returns the count fired and the next pending deadline.
    fn advance_to(&mut self, now: Ticks) -> (usize, Option<Deadline>) {
        // entries that need to drop down to a lower-level wheel are collected
        // and reinserted only after the turn, to avoid processing them twice
        // in the same sweep.
        let mut pending_reschedule = List::<Entry>::new();

        let mut expired = 0;

        let mut next_deadline = self.next_deadline();
        while let Some(deadline) = next_deadline {
            if deadline.ticks > now {
                break;
            }

            // all entries are taken off the slot before any are processed:
            // an entry on the top-level wheel whose true deadline is more
            // than one rotation away gets reinserted into the *same* slot,
            // and must not be seen again by this sweep.
            let entries = self.wheels[deadline.wheel].take_slot(deadline.slot);
            for entry in entries {
                // Safety: the registration contract guarantees linked
                // entries stay valid.
                let entry_deadline = unsafe { entry.as_ref().deadline };

                if entry_deadline > now {
                    debug_assert_ne!(
                        deadline.wheel, 0,
                        "an entry rescheduled to a finer wheel cannot come from the finest one"
                    );
                    tracing::trace!(
                        entry = ?entry,
                        deadline = ?entry_deadline,
                        "rescheduling entry on a lower wheel"
                    );
                    pending_reschedule.push_front(entry);
                } else {
                    // Safety: as above.
                    unsafe {
                        expired += 1;
                        entry.as_ref().fire();
                    }
                }
            }

            self.now = deadline.ticks;
            next_deadline = self.next_deadline();
        }

        self.now = now;

        let any_rescheduled = !pending_reschedule.is_empty();

        for entry in pending_reschedule {
            // Safety: as above.
            let entry_deadline = unsafe { entry.as_ref().deadline };

            debug_assert!(entry_deadline > self.now);
            self.insert_at(entry_deadline, entry);
        }

        if any_rescheduled {
            next_deadline = self.next_deadline();
        }

        (expired, next_deadline)
    }

    fn next_deadline(&self) -> Option<Deadline> {
        self.wheels
            .iter()
            .find_map(|wheel| wheel.next_deadline(self.now))
    }

    fn cancel(&mut self, entry: Pin<&mut Entry>) {
        // the entry may have fired between the caller's registered-check and
        // this lock acquisition; firing unlinks, so there is nothing left to
        // remove. the registered bit only changes under this lock, so the
        // re-check is authoritative.
        if !entry.is_registered.load(Ordering::Acquire) {
            return;
        }

        let deadline = entry.deadline;
        tracing::trace!(?deadline, now = ?self.now, "cancelling timer entry");
        let wheel = self.wheel_index(deadline);
        self.wheels[wheel].remove(deadline, entry);
    }

    /// # Safety
    ///
    /// `entry` must stay pinned and valid while linked.
    unsafe fn register(&mut self, ptr: NonNull<Entry>) -> Poll<()> {
        let deadline = {
            // Safety: ensured by caller.
            let entry = unsafe { ptr.as_ref() };

            tracing::trace!(entry = ?entry, now = ?self.now, "registering timer entry");

            if entry.deadline <= self.now {
                tracing::trace!("deadline already passed, firing immediately");
                entry.fire();
                return Poll::Ready(());
            }

            let _did_link = entry.is_registered.compare_exchange(
                false,
                true,
                Ordering::AcqRel,
                Ordering::Acquire,
            );
            debug_assert!(
                _did_link.is_ok(),
                "tried to register an entry that was already registered"
            );

            entry.deadline
        };

        self.insert_at(deadline, ptr);
        Poll::Pending
    }

    fn insert_at(&mut self, deadline: Ticks, entry: NonNull<Entry>) {
        let wheel = self.wheel_index(deadline);
        self.wheels[wheel].insert(deadline, entry);
    }

    #[inline]
    fn wheel_index(&self, ticks: Ticks) -> usize {
        wheel_index(self.now, ticks)
    }
}

/// The wheel level a deadline belongs on, given the current time: the level
/// whose slot width covers the highest bit in which `now` and the deadline
/// differ.
fn wheel_index(now: Ticks, ticks: Ticks) -> usize {
    const WHEEL_MASK: u64 = (1 << Wheel::BITS) - 1;
    const MAX_SLEEP_TICKS: u64 = (1 << (Wheel::BITS * Core::WHEELS)) - 1;

    // mask out the bits representing the index in the wheel
    let mut wheel_indices = now.0 ^ ticks.0 | WHEEL_MASK;

    // deadlines beyond the whole wheel's range go on the top level, wrapping
    // around as many times as needed.
    if wheel_indices >= MAX_SLEEP_TICKS {
        wheel_indices = MAX_SLEEP_TICKS - 1;
    }

    let zeros = wheel_indices.leading_zeros();
    let rest = u64::BITS - 1 - zeros;

    rest as usize / Core::WHEELS
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::time::Clock;
    use core::time::Duration;

    #[test]
    fn wheel_index_matches_levels() {
        let now = Ticks(0);
        assert_eq!(wheel_index(now, Ticks(1)), 0);
        assert_eq!(wheel_index(now, Ticks(63)), 0);
        assert_eq!(wheel_index(now, Ticks(64)), 1);
        assert_eq!(wheel_index(now, Ticks(64 * 64)), 2);
        assert_eq!(wheel_index(now, Ticks(u64::MAX)), Core::WHEELS - 1);
    }

    #[test]
    fn register_and_fire() {
        let timer = Timer::new(Clock::new(Duration::from_micros(100)));

        // a heap-pinned entry so the intrusive link target is stable
        let mut entry = Box::pin(Entry::new(Ticks(timer.clock().now_ticks().0 + 20)));

        {
            let ptr = NonNull::from(
                // Safety: only used to link the entry; the Box keeps it pinned
                unsafe { Pin::into_inner_unchecked(entry.as_mut()) },
            );
            // Safety: the entry outlives its registration (cancelled below if
            // it has not fired)
            assert!(unsafe { timer.register(ptr) }.is_pending());
        }

        assert!(entry.is_registered.load(Ordering::Acquire));

        // spin-turn until the deadline passes
        let mut fired = 0;
        for _ in 0..1000 {
            std::thread::sleep(Duration::from_millis(1));
            if let Some((expired, _)) = timer.try_turn() {
                fired += expired;
            }
            if fired > 0 {
                break;
            }
        }

        assert_eq!(fired, 1);
        assert!(!entry.is_registered.load(Ordering::Acquire));
        // firing closed the entry's wait cell
        assert!(entry.waker.is_closed());
    }

    #[test]
    fn expired_deadline_fires_immediately() {
        let timer = Timer::new(Clock::new(Duration::from_micros(100)));

        let mut entry = Box::pin(Entry::new(Ticks(0)));
        std::thread::sleep(Duration::from_millis(1));

        let ptr = NonNull::from(
            // Safety: only used to link the entry
            unsafe { Pin::into_inner_unchecked(entry.as_mut()) },
        );
        // Safety: the entry is not linked when `register` returns `Ready`
        assert!(unsafe { timer.register(ptr) }.is_ready());
        assert!(entry.waker.is_closed());
    }

    #[test]
    fn cancel_unlinks() {
        let timer = Timer::new(Clock::new(Duration::from_millis(1)));

        let mut entry = Box::pin(Entry::new(Ticks(timer.clock().now_ticks().0 + 1000)));

        let ptr = NonNull::from(
            // Safety: only used to link the entry
            unsafe { Pin::into_inner_unchecked(entry.as_mut()) },
        );
        // Safety: cancelled before the entry is dropped
        assert!(unsafe { timer.register(ptr) }.is_pending());
        assert!(timer.next_deadline().is_some());

        timer.cancel(entry.as_mut());
        assert!(!entry.is_registered.load(Ordering::Acquire));
        assert!(timer.next_deadline().is_none());
    }
}
