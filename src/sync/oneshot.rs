// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

use core::fmt;
use core::future::Future;
use core::pin::Pin;
use core::task::{Context, Poll, ready};

use crate::loom::cell::UnsafeCell;
use crate::loom::sync::Arc;
use crate::sync::WaitCell;

/// Creates a channel for sending a single value between asynchronous (or
/// blocking) contexts.
pub fn channel<T>() -> (Sender<T>, Receiver<T>) {
    let inner = Arc::new(Inner {
        value: UnsafeCell::new(None),
        rx_waker: WaitCell::new(),
    });

    let tx = Sender {
        inner: Some(inner.clone()),
    };
    let rx = Receiver { inner };

    (tx, rx)
}

#[derive(Debug)]
pub struct Sender<T> {
    inner: Option<Arc<Inner<T>>>,
}

#[derive(Debug)]
pub struct Receiver<T> {
    inner: Arc<Inner<T>>,
}

#[derive(Debug)]
struct Inner<T> {
    value: UnsafeCell<Option<T>>,
    rx_waker: WaitCell,
}

// Safety: access to `value` is handed off through the `rx_waker` cell: the
// sender writes before waking, the receiver reads only after being woken.
unsafe impl<T: Send> Send for Inner<T> {}
// Safety: see above
unsafe impl<T: Send> Sync for Inner<T> {}

/// Error returned when the sender was dropped without sending a value.
#[derive(Debug, Eq, PartialEq, Clone)]
pub struct RecvError(pub(crate) ());

// === impl Sender ===

impl<T> Sender<T> {
    /// Returns `true` if the associated [`Receiver`] has been dropped, in
    /// which case [`send`][Self::send] is guaranteed to fail.
    ///
    /// This method never blocks.
    pub fn is_closed(&self) -> bool {
        let inner = self.inner.as_ref().expect("sender already consumed");
        inner.rx_waker.is_closed()
    }

    /// Attempts to send a value on this channel, returning it back if the
    /// receiver has already hung up.
    ///
    /// This method never blocks.
    ///
    /// # Errors
    ///
    /// If the channel is closed, the value is handed back in the `Err`
    /// variant.
    pub fn send(mut self, value: T) -> Result<(), T> {
        let inner = self.inner.take().expect("sender already consumed");

        if inner.rx_waker.is_closed() {
            return Err(value);
        }

        inner.value.with_mut(|ptr| {
            // Safety: the receiver does not read the cell until the wake
            // below.
            unsafe {
                *ptr = Some(value);
            }
        });

        inner.rx_waker.wake();

        Ok(())
    }
}

impl<T> Drop for Sender<T> {
    fn drop(&mut self) {
        // a sender dropped without sending closes the cell, failing the
        // receiver with `RecvError` instead of hanging it forever.
        if let Some(inner) = self.inner.take() {
            inner.rx_waker.close();
        }
    }
}

// === impl Receiver ===

impl<T> Receiver<T> {
    /// Poll for the sent value, registering the waker from `cx` to be woken
    /// when one arrives.
    pub fn poll_recv(&self, cx: &mut Context<'_>) -> Poll<Result<T, RecvError>> {
        let res = self.inner.rx_waker.poll_wait(cx);

        match ready!(res) {
            Ok(()) => {}
            Err(_) => {
                // closed; the value may still have been sent right before the
                // sender was dropped.
                let value = self.inner.value.with_mut(|ptr| {
                    // Safety: the cell is closed, so the sender (if it wrote
                    // at all) has finished writing and will never touch the
                    // slot again.
                    unsafe { (*ptr).take() }
                });
                return Poll::Ready(value.ok_or(RecvError(())));
            }
        }

        let value = self.inner.value.with_mut(|ptr| {
            // Safety: being woken means the sender finished its write.
            unsafe { (*ptr).take() }
        });

        Poll::Ready(value.ok_or(RecvError(())))
    }
}

impl<T> Future for Receiver<T> {
    type Output = Result<T, RecvError>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        self.poll_recv(cx)
    }
}

impl<T> Drop for Receiver<T> {
    fn drop(&mut self) {
        self.inner.rx_waker.close();
    }
}

impl fmt::Display for RecvError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.pad("sender dropped without sending")
    }
}

impl core::error::Error for RecvError {}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::executor::block_on;

    #[test]
    fn send_then_recv() {
        let (tx, rx) = channel::<u32>();
        tx.send(42).unwrap();
        assert_eq!(block_on(rx), Ok(42));
    }

    #[test]
    fn recv_across_threads() {
        let (tx, rx) = channel::<&'static str>();

        let sender = crate::loom::thread::spawn(move || {
            std::thread::sleep(core::time::Duration::from_millis(10));
            tx.send("hello").unwrap();
        });

        assert_eq!(block_on(rx), Ok("hello"));
        sender.join().unwrap();
    }

    #[test]
    fn sender_dropped_without_sending() {
        let (tx, rx) = channel::<u32>();
        drop(tx);
        assert_eq!(block_on(rx), Err(RecvError(())));
    }

    #[test]
    fn receiver_dropped_fails_send() {
        let (tx, rx) = channel::<u32>();
        drop(rx);
        assert!(tx.is_closed());
        assert_eq!(tx.send(1), Err(1));
    }
}
