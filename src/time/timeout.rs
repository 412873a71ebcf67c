// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

use core::fmt;
use core::future::{Future, IntoFuture};
use core::pin::Pin;
use core::task::{Context, Poll};
use core::time::Duration;

use pin_project::pin_project;

use crate::time::sleep::{Sleep, sleep};
use crate::time::TimeError;

/// Requires a future to complete before `duration` has elapsed.
///
/// On expiry the inner future is dropped where it stands; its destructors
/// (and through them any reactor or timer registrations it holds) run
/// normally.
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
pub fn timeout<F>(duration: Duration, future: F) -> Result<Timeout<F::IntoFuture>, TimeError>
where
    F: IntoFuture,
{
    Ok(Timeout {
        sleep: sleep(duration)?,
        future: future.into_future(),
    })
}

/// Future returned by [`timeout`].
#[pin_project]
#[must_use = "futures do nothing unless `.await`ed or `poll`ed"]
pub struct Timeout<F> {
    #[pin]
    sleep: Sleep,
    #[pin]
    future: F,
}

/// Error returned when a [`Timeout`] elapses before its inner future
/// completes.
#[derive(Debug, Eq, PartialEq)]
pub struct Elapsed(pub(crate) ());

impl<F> Timeout<F> {
    /// Gets a reference to the underlying future.
    pub fn get_ref(&self) -> &F {
        &self.future
    }

    /// Gets a mutable reference to the underlying future.
    pub fn get_mut(&mut self) -> &mut F {
        &mut self.future
    }

    /// Consumes this timeout, returning the underlying future.
    pub fn into_inner(self) -> F {
        self.future
    }
}

impl<F: Future> Future for Timeout<F> {
    type Output = Result<F::Output, Elapsed>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let me = self.project();

        // the inner future gets the first chance, so a ready result beats a
        // simultaneously expired timer.
        if let Poll::Ready(v) = me.future.poll(cx) {
            return Poll::Ready(Ok(v));
        }

        match me.sleep.poll(cx) {
            Poll::Ready(()) => Poll::Ready(Err(Elapsed(()))),
            Poll::Pending => Poll::Pending,
        }
    }
}

impl fmt::Display for Elapsed {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.pad("deadline has elapsed")
    }
}

impl core::error::Error for Elapsed {}
