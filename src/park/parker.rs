// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

use core::fmt;
use core::task::{RawWaker, RawWakerVTable, Waker};
use core::time::Duration;

use static_assertions::assert_impl_all;

use crate::loom::sync::Arc;
use crate::loom::sync::atomic::{AtomicUsize, Ordering};
use crate::park::Park;

const STATE_EMPTY: usize = 0;
const STATE_PARKED: usize = 1;
const STATE_NOTIFIED: usize = 2;

/// Wraps a [`Park`] implementation in an EMPTY → PARKED → NOTIFIED state
/// machine so that a notification delivered at *any* point (before, during
/// or after the blocking call) wakes exactly one park.
pub struct Parker<P>(Arc<Inner<P>>);

/// A cloneable, `Send` token that can unpark the [`Parker`] it was created
/// from.
#[derive(Clone)]
pub struct UnparkToken<P>(Parker<P>);
assert_impl_all!(UnparkToken<crate::park::StdPark>: Send, Sync);

struct Inner<P> {
    state: AtomicUsize,
    park_impl: P,
}

// === impl Parker ===

impl<P> fmt::Debug for Parker<P> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Parker")
            .field("state", &self.0.describe_state())
            .finish_non_exhaustive()
    }
}

impl<P> Clone for Parker<P> {
    fn clone(&self) -> Self {
        Self(Arc::clone(&self.0))
    }
}

impl<P: Park> Parker<P> {
    pub fn new(park_impl: P) -> Self {
        Self(Arc::new(Inner {
            state: AtomicUsize::new(STATE_EMPTY),
            park_impl,
        }))
    }

    /// Block the calling context until notified.
    ///
    /// Returns immediately if a notification is already pending. May also
    /// return spuriously; callers are expected to re-check their condition.
    #[inline]
    pub fn park(&self) {
        self.0.park(None);
    }

    /// Like [`Self::park`], but gives up after `duration`.
    #[inline]
    pub fn park_timeout(&self, duration: Duration) {
        self.0.park(Some(duration));
    }

    /// Notifies the parker, waking its current (or next) `park`.
    #[inline]
    pub fn unpark(&self) {
        self.0.unpark();
    }

    /// Convert this [`Parker`] into an [`UnparkToken`] which can be sent to
    /// other threads to wake this one up.
    #[inline]
    pub fn into_unpark(self) -> UnparkToken<P> {
        UnparkToken(self)
    }
}

impl<P: Park + Send + Sync + 'static> Parker<P> {
    /// Convert self into a [`Waker`] that unparks this parker when woken.
    ///
    /// This is how a `block_on` caller's root future gets to wake the
    /// blocked thread.
    #[inline]
    pub fn into_waker(self) -> Waker {
        Inner::into_waker(self.0)
    }
}

// === impl UnparkToken ===

impl<P> fmt::Debug for UnparkToken<P> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("UnparkToken")
            .field("parker", &self.0)
            .finish()
    }
}

impl<P: Park> UnparkToken<P> {
    /// Unparks the target.
    #[inline]
    pub fn unpark(&self) {
        self.0.0.unpark();
    }
}

// === impl Inner ===

impl<P> Inner<P> {
    fn describe_state(&self) -> &'static str {
        match self.state.load(Ordering::Acquire) {
            STATE_EMPTY => "<empty>",
            STATE_PARKED => "<parked>",
            STATE_NOTIFIED => "<notified>",
            _ => "<unknown>",
        }
    }
}

impl<P: Park> Inner<P> {
    fn park(&self, timeout: Option<Duration>) {
        // consume a pending notification without blocking at all.
        if self
            .state
            .compare_exchange(
                STATE_NOTIFIED,
                STATE_EMPTY,
                Ordering::SeqCst,
                Ordering::SeqCst,
            )
            .is_ok()
        {
            return;
        }

        match self.state.compare_exchange(
            STATE_EMPTY,
            STATE_PARKED,
            Ordering::SeqCst,
            Ordering::SeqCst,
        ) {
            Ok(_) => {}
            Err(STATE_NOTIFIED) => {
                // We must read here, even though we know the value will be
                // `NOTIFIED`: `unpark` may have raced us since the first
                // compare-exchange, and reading from its write to `state` is
                // what synchronizes with everything the un-parker did before
                // notifying.
                let old = self.state.swap(STATE_EMPTY, Ordering::SeqCst);
                debug_assert_eq!(old, STATE_NOTIFIED, "park state changed unexpectedly");

                return;
            }
            Err(actual) => panic!("inconsistent park state; actual = {actual}"),
        }

        // The underlying `Park` impls are sticky, so a notification arriving
        // between the transition above and this call still wakes us. Spurious
        // returns are allowed; the caller re-checks its condition.
        match timeout {
            Some(duration) => self.park_impl.park_timeout(duration),
            None => self.park_impl.park(),
        }

        // leave NOTIFIED→EMPTY, PARKED→EMPTY; either way the park is over.
        self.state.swap(STATE_EMPTY, Ordering::SeqCst);
    }

    fn unpark(&self) {
        match self.state.swap(STATE_NOTIFIED, Ordering::SeqCst) {
            // not parked (yet): the NOTIFIED state will short-circuit the
            // next park.
            STATE_EMPTY | STATE_NOTIFIED => {}
            STATE_PARKED => self.park_impl.unpark(),
            actual => panic!("inconsistent park state; actual = {actual}"),
        }
    }

    fn into_raw(this: Arc<Self>) -> *const () {
        Arc::into_raw(this).cast::<()>()
    }

    unsafe fn from_raw(ptr: *const ()) -> Arc<Self> {
        // Safety: ensured by caller
        unsafe { Arc::from_raw(ptr.cast::<Self>()) }
    }
}

impl<P: Park + Send + Sync + 'static> Inner<P> {
    // === waker functionality ===

    unsafe fn waker_clone(raw: *const ()) -> RawWaker {
        // Safety: ensured by the raw waker contract
        unsafe {
            Arc::increment_strong_count(raw.cast::<Self>());
            Self::into_raw_waker(Self::from_raw(raw))
        }
    }

    unsafe fn waker_drop(raw: *const ()) {
        // Safety: ensured by the raw waker contract
        unsafe {
            drop(Self::from_raw(raw));
        }
    }

    unsafe fn waker_wake(raw: *const ()) {
        // Safety: ensured by the raw waker contract
        let unparker = unsafe { Self::from_raw(raw) };
        unparker.unpark();
    }

    unsafe fn waker_wake_by_ref(raw: *const ()) {
        let raw = raw.cast::<Self>();
        // Safety: ensured by the raw waker contract
        unsafe {
            (*raw).unpark();
        }
    }

    // `Waker::will_wake` compares data and vtable pointers; keeping this out
    // of line keeps the vtable reference unique across clone boundaries. See
    // the matching comment on the task waker.
    #[inline(never)]
    fn into_raw_waker(this: Arc<Self>) -> RawWaker {
        RawWaker::new(
            Self::into_raw(this),
            &RawWakerVTable::new(
                Self::waker_clone,
                Self::waker_wake,
                Self::waker_wake_by_ref,
                Self::waker_drop,
            ),
        )
    }

    fn into_waker(this: Arc<Self>) -> Waker {
        // Safety: the vtable functions above uphold the raw waker contract
        unsafe {
            let raw = Self::into_raw_waker(this);
            Waker::from_raw(raw)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::loom::sync::atomic::AtomicBool;
    use crate::loom::sync::mpsc;
    use crate::loom::thread;
    use crate::park::StdPark;
    use core::pin::pin;
    use core::task::{Context, Poll};

    #[test]
    fn parking_basically_works() {
        // Thread A parks itself after handing an `UnparkToken` to thread B
        // through a channel; B unparks it.
        crate::loom::model(|| {
            crate::loom::lazy_static! {
                static ref A_UNPARKED: AtomicBool = AtomicBool::new(false);
            }
            let (tx, rx) = mpsc::channel();

            let a = thread::spawn(move || {
                let parker = Parker::new(StdPark::for_current());

                tx.send(parker.clone().into_unpark()).unwrap();

                parker.park();

                A_UNPARKED.store(true, Ordering::Release);
            });

            let b = thread::spawn(move || {
                let unpark = rx.recv().unwrap();
                unpark.unpark();
            });

            let _ = a.join();
            let _ = b.join();

            assert!(A_UNPARKED.load(Ordering::Acquire));
        });
    }

    #[test]
    fn unpark_before_park_does_not_block() {
        let parker = Parker::new(StdPark::for_current());
        parker.unpark();
        // a pending notification short-circuits the park entirely
        parker.park();
    }

    #[test]
    fn waker_round_trip() {
        // the same as `parking_basically_works`, but through the `Waker`
        // indirection and a simulated future poll loop.
        crate::loom::model(|| {
            crate::loom::lazy_static! {
                static ref NUM_POLLS: AtomicUsize = AtomicUsize::new(0);
                static ref COMPLETED: AtomicBool = AtomicBool::new(false);
            }

            let (tx, rx) = mpsc::channel();

            let a = thread::spawn(move || {
                struct Yield {
                    done: bool,
                    tx: mpsc::Sender<core::task::Waker>,
                }
                impl Future for Yield {
                    type Output = ();

                    fn poll(
                        mut self: core::pin::Pin<&mut Self>,
                        cx: &mut Context<'_>,
                    ) -> Poll<Self::Output> {
                        if !self.done {
                            self.done = true;
                            self.tx.send(cx.waker().clone()).unwrap();
                            Poll::Pending
                        } else {
                            Poll::Ready(())
                        }
                    }
                }

                let parker = Parker::new(StdPark::for_current());
                let waker = parker.clone().into_waker();

                let mut cx = Context::from_waker(&waker);
                let mut future = pin!(Yield { done: false, tx });

                loop {
                    NUM_POLLS.fetch_add(1, Ordering::Release);
                    if let Poll::Ready(v) = future.as_mut().poll(&mut cx) {
                        COMPLETED.store(true, Ordering::Release);
                        return v;
                    }

                    parker.park();
                }
            });

            let b = thread::spawn(move || {
                let waker = rx.recv().unwrap();
                waker.wake();
            });

            let _ = a.join();
            let _ = b.join();

            assert!(COMPLETED.load(Ordering::Acquire));
            assert_eq!(NUM_POLLS.load(Ordering::Acquire), 2);
        });
    }
}
