// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

use core::fmt;
use core::future::Future;
use core::pin::Pin;
use core::ptr::NonNull;
use core::task::{Context, Poll, ready};
use core::time::Duration;

use pin_project::{pin_project, pinned_drop};

use crate::loom::sync::Arc;
use crate::loom::sync::atomic::Ordering;
use crate::runtime::Handle;
use crate::time::timer::Entry;
use crate::time::{Instant, TimeError, Ticks, Timer};

/// Wait until `duration` has elapsed on the current runtime's timer.
///
/// # Errors
///
/// Fails with [`TimeError::DurationTooLong`] if the duration exceeds the
/// timer's range.
///
/// # Panics
///
/// Panics if called outside a runtime, or on a runtime built with timers
/// disabled.
pub fn sleep(duration: Duration) -> Result<Sleep, TimeError> {
    let handle = Handle::current();
    let timer = handle.timer();
    Sleep::new(timer, Some(handle), duration)
}

/// Wait until `deadline` has been reached on the current runtime's timer.
///
/// Completes immediately if the deadline has already passed.
///
/// # Errors
///
/// Fails with [`TimeError::DurationTooLong`] if the deadline lies beyond the
/// timer's range.
///
/// # Panics
///
/// Panics if called outside a runtime, or on a runtime built with timers
/// disabled.
pub fn sleep_until(deadline: Instant) -> Result<Sleep, TimeError> {
    let handle = Handle::current();
    let timer = handle.timer();

    let now = timer.clock().now_ticks();
    let ticks = Ticks(deadline.0.0.saturating_sub(now.0));
    let duration = timer.clock().ticks_to_duration(ticks);

    Sleep::new_with_now(timer, Some(handle), now, duration)
}

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
enum State {
    Unregistered,
    Registered,
    Completed,
}

/// Future returned by [`sleep`] and [`sleep_until`].
#[pin_project(PinnedDrop)]
#[must_use = "futures do nothing unless `.await`ed or `poll`ed"]
pub struct Sleep {
    state: State,
    timer: Arc<Timer>,
    /// Used to nudge a parked worker into refreshing its park deadline after
    /// this sleep registers a new (possibly earlier) one.
    handle: Option<Handle>,
    ticks: Ticks,
    #[pin]
    entry: Entry,
}

impl Sleep {
    pub(crate) fn new(
        timer: Arc<Timer>,
        handle: Option<Handle>,
        duration: Duration,
    ) -> Result<Self, TimeError> {
        let now = timer.clock().now_ticks();
        Self::new_with_now(timer, handle, now, duration)
    }

    fn new_with_now(
        timer: Arc<Timer>,
        handle: Option<Handle>,
        now: Ticks,
        duration: Duration,
    ) -> Result<Self, TimeError> {
        let ticks = timer.clock().duration_to_ticks(duration)?;
        let deadline = Ticks(now.0 + ticks.0);

        Ok(Self {
            state: State::Unregistered,
            timer,
            handle,
            ticks,
            entry: Entry::new(deadline),
        })
    }
}

impl Future for Sleep {
    type Output = ();

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        tracing::trace!(sleep = ?self, "Sleep::poll");
        let mut me = self.as_mut().project();

        match me.state {
            State::Unregistered => {
                // Safety: the timer treats the pointer as pinned, and the
                // pinned-drop impl below unlinks the entry before it can go
                // away.
                let ptr = unsafe { NonNull::from(Pin::into_inner_unchecked(me.entry.as_mut())) };

                // Safety: see above.
                match unsafe { me.timer.register(ptr) } {
                    Poll::Ready(()) => {
                        *me.state = State::Completed;
                        return Poll::Ready(());
                    }
                    Poll::Pending => {
                        *me.state = State::Registered;
                        // a parked worker may be waiting with a stale (later
                        // or absent) deadline; wake one so it re-reads the
                        // wheel.
                        if let Some(handle) = me.handle {
                            handle.notify_timer();
                        }
                    }
                }
            }
            State::Registered if me.entry.is_registered.load(Ordering::Acquire) => {}
            _ => return Poll::Ready(()),
        }

        let _poll = ready!(me.entry.waker.poll_wait(cx));
        debug_assert!(
            _poll.is_err(),
            "a Sleep's wait cell should only be woken by closing"
        );
        *me.state = State::Completed;
        Poll::Ready(())
    }
}

#[pinned_drop]
impl PinnedDrop for Sleep {
    fn drop(mut self: Pin<&mut Self>) {
        let this = self.project();
        // unlink only if the entry is actually in the wheel: an unpolled or
        // already-fired sleep has nothing to cancel.
        if this.entry.is_registered.load(Ordering::Acquire) {
            this.timer.cancel(this.entry);
        }
    }
}

impl fmt::Debug for Sleep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Sleep")
            .field(
                "duration",
                &self.timer.clock().ticks_to_duration(self.ticks),
            )
            .field("state", &self.state)
            .finish_non_exhaustive()
    }
}
