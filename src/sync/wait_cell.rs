// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

use core::fmt;
use core::task::{Context, Poll, Waker};

use bitflags::bitflags;
use static_assertions::const_assert_eq;

use crate::loom::cell::UnsafeCell;
use crate::loom::sync::atomic::{AtomicUsize, Ordering};
use crate::util::{CachePadded, loom_const_fn};

/// An atomically registered [`Waker`].
///
/// The cell stores the waker of a single task, registered by calling
/// [`poll_wait`]; once stored, the waker can be invoked from any thread with
/// [`wake`], or with an error with [`close`]. Registration and wake race
/// freely; the state bits arbitrate who may touch the waker slot.
///
/// The synchronization strategy follows the `AtomicWaker` type used in
/// Tokio's synchronization primitives, with an additional "closed" bit.
///
/// [`poll_wait`]: Self::poll_wait
/// [`wake`]: Self::wake
/// [`close`]: Self::close
pub struct WaitCell {
    state: CachePadded<AtomicUsize>,
    waker: UnsafeCell<Option<Waker>>,
}

bitflags! {
    #[derive(Copy, Clone, Debug, PartialEq, Eq)]
    struct State: usize {
        const WAITING = 0b0000;
        const REGISTERING = 0b0001;
        const WAKING = 0b0010;
        const WOKEN = 0b0100;
        const CLOSED = 0b1000;
    }
}
// WAITING must be zero: it is the state every other bit pattern resets to.
const_assert_eq!(State::WAITING.bits(), 0);

/// An error indicating that a [`WaitCell`] was closed or busy while
/// attempting to register a [`Waker`].
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum PollWaitError {
    /// The waker was not registered because the cell has been
    /// [closed](WaitCell::close).
    Closed,

    /// The waker was not registered because another task was concurrently
    /// storing its own waker in the cell.
    Busy,
}

// === impl WaitCell ===

impl WaitCell {
    loom_const_fn! {
        pub const fn new() -> Self {
            Self {
                state: CachePadded(AtomicUsize::new(State::WAITING.bits())),
                waker: UnsafeCell::new(None),
            }
        }
    }

    /// Register the waker from `cx` to be woken by the next call to
    /// [`wake`](Self::wake).
    ///
    /// Returns `Ready(Ok(()))` if a wakeup was already pending (the wakeup is
    /// consumed), `Pending` if the waker was registered, and an error if the
    /// cell is closed or another registration is in flight.
    pub fn poll_wait(&self, cx: &mut Context<'_>) -> Poll<Result<(), PollWaitError>> {
        match self.compare_exchange(State::WAITING, State::REGISTERING, Ordering::Acquire) {
            Err(actual) if actual.contains(State::CLOSED) => {
                return Poll::Ready(Err(PollWaitError::Closed));
            }
            Err(actual) if actual.contains(State::WOKEN) => {
                // consume the pending wakeup
                self.fetch_and(!State::WOKEN, Ordering::Release);
                return Poll::Ready(Ok(()));
            }
            // someone is waking right now; don't go to sleep
            Err(actual) if actual.contains(State::WAKING) => {
                return Poll::Ready(Ok(()));
            }
            Err(_) => return Poll::Ready(Err(PollWaitError::Busy)),
            Ok(_) => {}
        }

        let waker = cx.waker();
        tracing::trace!(wait_cell = ?self, ?waker, "registering waker");

        if let Some(prev_waker) = self.replace_waker(waker.clone()) {
            tracing::debug!("replaced an old waker in cell, waking");
            prev_waker.wake();
        }

        if let Err(actual) =
            self.compare_exchange(State::REGISTERING, State::WAITING, Ordering::AcqRel)
        {
            // the cell was woken or closed while we were registering; bail
            // out of the registration and report which it was.
            tracing::trace!(state = ?actual, "notified during registration");

            // Safety: no other thread touches the waker while the
            // registering bit is ours.
            let waker = self.waker.with_mut(|waker| unsafe { (*waker).take() });

            // reset to WAITING, preserving only the closed bit.
            let state = self.fetch_and(State::CLOSED, Ordering::AcqRel);
            debug_assert!(
                state == actual || state == actual | State::CLOSED,
                "state changed unexpectedly while registering!"
            );

            if let Some(waker) = waker {
                waker.wake();
            }

            if state.contains(State::CLOSED) {
                return Poll::Ready(Err(PollWaitError::Closed));
            }

            return Poll::Ready(Ok(()));
        }

        // waker registered; time to yield!
        Poll::Pending
    }

    /// Wake the waker stored in this cell.
    ///
    /// Returns `true` if a waker was woken, `false` if the cell was empty (in
    /// which case the wakeup is recorded and consumed by the next
    /// [`poll_wait`](Self::poll_wait)).
    pub fn wake(&self) -> bool {
        if let Some(waker) = self.take_waker(false) {
            waker.wake();
            true
        } else {
            false
        }
    }

    /// Close the cell, waking any waiting task with an error.
    ///
    /// Subsequent registrations fail with [`PollWaitError::Closed`].
    pub fn close(&self) -> bool {
        if let Some(waker) = self.take_waker(true) {
            waker.wake();
            true
        } else {
            false
        }
    }

    /// Returns `true` if this cell has been [closed](Self::close).
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.current_state().contains(State::CLOSED)
    }

    fn take_waker(&self, close: bool) -> Option<Waker> {
        // set WAKING (we're touching the waker) and WOKEN (a wakeup is
        // intended), plus CLOSED when closing.
        let state = {
            let mut bits = State::WAKING | State::WOKEN;
            if close {
                bits |= State::CLOSED;
            }
            self.fetch_or(bits, Ordering::AcqRel)
        };

        // only proceed if no one else was touching the waker.
        if !state.intersects(State::WAKING | State::REGISTERING | State::CLOSED) {
            // Safety: we won the race for the WAKING bit, so the slot is ours.
            let waker = self.waker.with_mut(|waker| unsafe { (*waker).take() });

            // release the "lock".
            self.fetch_and(!State::WAKING, Ordering::Release);

            if let Some(waker) = waker {
                tracing::trace!(wait_cell = ?self, ?close, ?waker, "took waker");
                return Some(waker);
            }
        }

        None
    }

    fn replace_waker(&self, waker: Waker) -> Option<Waker> {
        let state = self.fetch_or(State::WAKING, Ordering::AcqRel);

        if !state.intersects(State::WAKING | State::CLOSED) {
            // Safety: we won the race for the WAKING bit, so the slot is
            // ours; the REGISTERING bit keeps other registrants out.
            let prev_waker = self.waker.with_mut(|old_waker| unsafe {
                match &mut *old_waker {
                    Some(old_waker) if waker.will_wake(old_waker) => None,
                    old => old.replace(waker.clone()),
                }
            });

            self.fetch_and(!State::WAKING, Ordering::Release);

            return prev_waker;
        }

        None
    }

    #[inline(always)]
    fn compare_exchange(&self, curr: State, new: State, success: Ordering) -> Result<State, State> {
        self.state
            .0
            .compare_exchange(curr.bits(), new.bits(), success, Ordering::Acquire)
            .map(State::from_bits_retain)
            .map_err(State::from_bits_retain)
    }

    #[inline(always)]
    fn fetch_and(&self, state: State, order: Ordering) -> State {
        State::from_bits_retain(self.state.0.fetch_and(state.bits(), order))
    }

    #[inline(always)]
    fn fetch_or(&self, state: State, order: Ordering) -> State {
        State::from_bits_retain(self.state.0.fetch_or(state.bits(), order))
    }

    #[inline(always)]
    fn current_state(&self) -> State {
        State::from_bits_retain(self.state.0.load(Ordering::Acquire))
    }
}

impl Default for WaitCell {
    fn default() -> Self {
        WaitCell::new()
    }
}

// Safety: `WaitCell` synchronizes all access through atomic operations
unsafe impl Send for WaitCell {}
// Safety: `WaitCell` synchronizes all access through atomic operations
unsafe impl Sync for WaitCell {}

impl fmt::Debug for WaitCell {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WaitCell")
            .field("state", &self.current_state())
            .finish_non_exhaustive()
    }
}

impl Drop for WaitCell {
    fn drop(&mut self) {
        self.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::future::poll_fn;
    use futures::task::noop_waker_ref;

    fn cx() -> Context<'static> {
        Context::from_waker(noop_waker_ref())
    }

    #[test]
    fn wake_before_register_is_consumed() {
        let cell = WaitCell::new();

        // no waker registered yet, the wakeup is recorded
        assert!(!cell.wake());

        // the pending wakeup completes the next poll immediately
        assert_eq!(cell.poll_wait(&mut cx()), Poll::Ready(Ok(())));

        // and is consumed by it
        assert_eq!(cell.poll_wait(&mut cx()), Poll::Pending);
    }

    #[test]
    fn close_wakes_with_error() {
        let cell = WaitCell::new();

        assert_eq!(cell.poll_wait(&mut cx()), Poll::Pending);
        assert!(cell.close());
        assert!(cell.is_closed());

        assert_eq!(
            cell.poll_wait(&mut cx()),
            Poll::Ready(Err(PollWaitError::Closed))
        );
    }

    #[test]
    fn wake_invokes_registered_waker() {
        use futures::executor::block_on;
        use std::sync::Arc;
        use std::sync::atomic::{AtomicBool, Ordering};

        let cell = Arc::new(WaitCell::new());
        let done = Arc::new(AtomicBool::new(false));

        let waker_cell = cell.clone();
        let waker_done = done.clone();
        let thread = crate::loom::thread::spawn(move || {
            // keep waking until a waker was actually taken, or the waiter
            // observed the recorded wakeup and finished on its own
            while !waker_cell.wake() && !waker_done.load(Ordering::Acquire) {
                std::thread::yield_now();
            }
        });

        block_on(async {
            poll_fn(|cx| cell.poll_wait(cx)).await.unwrap();
        });

        done.store(true, Ordering::Release);
        thread.join().unwrap();
    }
}
