// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

use core::fmt;
use core::task::{Context, Poll};
use std::os::unix::io::RawFd;

use bitflags::bitflags;

use crate::loom::sync::atomic::{AtomicUsize, Ordering};
use crate::sync::{PollWaitError, WaitCell};

bitflags! {
    /// The I/O directions a source wants to be notified about.
    #[derive(Copy, Clone, Debug, PartialEq, Eq)]
    pub struct Interest: usize {
        const READABLE = 0b01;
        const WRITABLE = 0b10;
    }
}

bitflags! {
    /// Observed readiness of a registered source.
    #[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
    pub struct Ready: usize {
        const READABLE = 0b01;
        const WRITABLE = 0b10;
    }
}

impl From<Interest> for Ready {
    fn from(interest: Interest) -> Self {
        Ready::from_bits_truncate(interest.bits())
    }
}

/// Per-source reactor state: the sticky readiness bits and one waker slot per
/// direction.
///
/// Readiness is *sticky*: a bit set by an OS event stays set until the I/O
/// wrapper observes `WouldBlock` on the actual syscall and calls
/// [`clear_readiness`]. This preserves the one-wake-per-edge guarantee
/// without ever losing a wake.
///
/// [`clear_readiness`]: ScheduledIo::clear_readiness
pub(super) struct ScheduledIo {
    /// The reactor token (slab key) of this source.
    pub(super) key: usize,
    /// The OS handle, kept for re-arming the poller from the dispatch loop.
    pub(super) raw: RawFd,
    /// Sticky [`Ready`] bits.
    readiness: AtomicUsize,
    /// Directions with a registered waker; the union is what the source is
    /// armed for in the poller.
    waiters: AtomicUsize,
    read_waker: WaitCell,
    write_waker: WaitCell,
}

impl ScheduledIo {
    pub(super) fn new(key: usize, raw: RawFd) -> Self {
        Self {
            key,
            raw,
            readiness: AtomicUsize::new(0),
            waiters: AtomicUsize::new(0),
            read_waker: WaitCell::new(),
            write_waker: WaitCell::new(),
        }
    }

    pub(super) fn readiness(&self) -> Ready {
        Ready::from_bits_truncate(self.readiness.load(Ordering::Acquire))
    }

    /// Directions that currently have a waker waiting; what the poller should
    /// be armed for.
    pub(super) fn wanted(&self) -> Interest {
        Interest::from_bits_truncate(self.waiters.load(Ordering::Acquire))
    }

    /// Record readiness reported by the OS and wake the affected directions.
    ///
    /// Returns the number of wakers invoked.
    pub(super) fn set_readiness(&self, ready: Ready) -> usize {
        self.readiness.fetch_or(ready.bits(), Ordering::AcqRel);
        // the woken directions no longer need the poller armed.
        self.waiters.fetch_and(!ready.bits(), Ordering::AcqRel);

        let mut woken = 0;
        if ready.contains(Ready::READABLE) && self.read_waker.wake() {
            woken += 1;
        }
        if ready.contains(Ready::WRITABLE) && self.write_waker.wake() {
            woken += 1;
        }
        woken
    }

    /// Clear sticky readiness for `interest`; called by the I/O wrapper after
    /// the syscall reported `WouldBlock`.
    pub(super) fn clear_readiness(&self, interest: Interest) {
        self.readiness
            .fetch_and(!Ready::from(interest).bits(), Ordering::AcqRel);
    }

    /// Poll for readiness in one direction, registering the context's waker
    /// if the source is not ready.
    ///
    /// Returns `Ready` with the matching readiness bits, `Pending` with the
    /// waker registered (the caller must then re-arm the poller for
    /// [`wanted`][Self::wanted]), or an error if the source was deregistered.
    pub(super) fn poll_ready(
        &self,
        interest: Interest,
        cx: &mut Context<'_>,
    ) -> Poll<std::io::Result<Ready>> {
        debug_assert_eq!(
            interest.bits().count_ones(),
            1,
            "poll_ready takes a single direction"
        );
        let cell = if interest == Interest::READABLE {
            &self.read_waker
        } else {
            &self.write_waker
        };

        loop {
            let ready = self.readiness() & Ready::from(interest);
            if !ready.is_empty() {
                return Poll::Ready(Ok(ready));
            }

            match cell.poll_wait(cx) {
                // a wakeup was already pending; re-check the readiness it
                // announced.
                Poll::Ready(Ok(())) => {}
                Poll::Ready(Err(PollWaitError::Closed)) => {
                    return Poll::Ready(Err(std::io::Error::new(
                        std::io::ErrorKind::BrokenPipe,
                        "I/O source was deregistered",
                    )));
                }
                Poll::Ready(Err(PollWaitError::Busy)) => {
                    // another task is registering for the same direction;
                    // yield and retry so the two don't livelock.
                    cx.waker().wake_by_ref();
                    return Poll::Pending;
                }
                Poll::Pending => {
                    self.waiters.fetch_or(interest.bits(), Ordering::AcqRel);

                    // re-check: an event may have fired between the readiness
                    // check above and the waker registration. the sticky bits
                    // make this race harmless.
                    let ready = self.readiness() & Ready::from(interest);
                    if !ready.is_empty() {
                        return Poll::Ready(Ok(ready));
                    }
                    return Poll::Pending;
                }
            }
        }
    }

    /// Close both waker slots, failing all waiting tasks (deregistration).
    pub(super) fn close(&self) {
        self.read_waker.close();
        self.write_waker.close();
    }
}

impl fmt::Debug for ScheduledIo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ScheduledIo")
            .field("key", &self.key)
            .field("raw", &self.raw)
            .field("readiness", &self.readiness())
            .field("wanted", &self.wanted())
            .finish()
    }
}
