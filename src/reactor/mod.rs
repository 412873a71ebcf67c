// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! The I/O reactor: drives the OS readiness source and dispatches events to
//! task wakers.
//!
//! The reactor owns a [`polling::Poller`] (epoll / kqueue / event ports /
//! IOCP, chosen by the platform) and a registration table mapping tokens to
//! per-source [`ScheduledIo`] state. I/O wrappers register their raw handles
//! with [`Reactor::register`] and poll the returned [`Registration`] from
//! inside their futures; whichever worker is about to go idle drives
//! [`turn`], which waits on the poller and wakes the tasks whose sources
//! became ready.
//!
//! There is no dedicated reactor thread: holding the lock on the event
//! buffer *is* the exclusive right to poll I/O, and a worker that cannot get
//! it simply parks on its thread parker instead. A [`notify`] from any other
//! thread interrupts the current (or next) wait.
//!
//! [`turn`]: Reactor::try_turn
//! [`notify`]: Reactor::notify

mod scheduled_io;

use core::fmt;
use core::task::{Context, Poll};
use core::time::Duration;
use std::io;
use std::os::unix::io::AsRawFd;

use slab::Slab;

use crate::loom::sync::{Arc, Mutex};

pub use scheduled_io::{Interest, Ready};
use scheduled_io::ScheduledIo;

/// Hard bound on concurrently registered sources; slab keys double as poller
/// tokens and must stay well clear of the keys `polling` reserves
/// internally.
const TOKEN_LIMIT: usize = usize::MAX >> 8;

/// Error returned by [`Reactor::register`].
#[derive(Debug)]
#[non_exhaustive]
pub enum RegisterError {
    /// The registration table is full; no more tokens can be allocated.
    TokenExhausted,
    /// The OS event source rejected the registration.
    Io(io::Error),
}

impl From<io::Error> for RegisterError {
    fn from(err: io::Error) -> Self {
        Self::Io(err)
    }
}

impl fmt::Display for RegisterError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::TokenExhausted => f.write_str("reactor token space exhausted"),
            Self::Io(err) => write!(f, "failed to register I/O source: {err}"),
        }
    }
}

impl core::error::Error for RegisterError {}

/// Handle to the reactor; cheap to clone.
#[derive(Clone)]
pub(crate) struct Reactor(Arc<Shared>);

struct Shared {
    /// Portable bindings to the OS readiness source.
    poller: polling::Poller,
    /// Registered sources, indexed by token.
    sources: Mutex<Slab<Arc<ScheduledIo>>>,
    /// Event buffer for [`Reactor::try_turn`]. Holding this lock implies the
    /// exclusive right to poll I/O.
    events: Mutex<Vec<polling::Event>>,
}

/// A source's registration with the reactor; the I/O wrapper's side of the
/// readiness protocol.
///
/// Dropping the registration deregisters the source and fails any still-
/// waiting readiness polls.
pub struct Registration {
    reactor: Reactor,
    io: Arc<ScheduledIo>,
}

// === impl Reactor ===

impl Reactor {
    pub(crate) fn new() -> io::Result<Self> {
        Ok(Self(Arc::new(Shared {
            poller: polling::Poller::new()?,
            sources: Mutex::new(Slab::new()),
            events: Mutex::new(Vec::with_capacity(1024)),
        })))
    }

    /// Register `source` for `interest`, returning the [`Registration`] the
    /// I/O wrapper polls readiness through.
    pub(crate) fn register(
        &self,
        source: &impl AsRawFd,
        interest: Interest,
    ) -> Result<Registration, RegisterError> {
        let raw = source.as_raw_fd();

        let io = {
            let mut sources = self.0.sources.lock().unwrap();
            let entry = sources.vacant_entry();
            let key = entry.key();
            if key >= TOKEN_LIMIT {
                return Err(RegisterError::TokenExhausted);
            }
            let io = Arc::new(ScheduledIo::new(key, raw));
            entry.insert(io.clone());
            io
        };

        if let Err(err) = self.0.poller.add(raw, event_for(io.key, interest)) {
            self.0.sources.lock().unwrap().remove(io.key);
            return Err(err.into());
        }

        tracing::trace!(token = io.key, fd = raw, ?interest, "registered I/O source");
        Ok(Registration {
            reactor: self.clone(),
            io,
        })
    }

    /// Interrupt the current (or next) blocking [`try_turn`][Self::try_turn]
    /// from another thread.
    pub(crate) fn notify(&self) {
        if let Err(err) = self.0.poller.notify() {
            tracing::warn!(?err, "failed to notify poller");
        }
    }

    /// Poll the OS source for up to `timeout` (forever if `None`) and
    /// dispatch readiness to the registered wakers.
    ///
    /// Returns `None` without blocking when another thread is already
    /// driving the reactor; otherwise the number of wakers invoked.
    pub(crate) fn try_turn(&self, timeout: Option<Duration>) -> Option<io::Result<usize>> {
        let Ok(mut events) = self.0.events.try_lock() else {
            return None;
        };
        Some(self.turn_locked(&mut events, timeout))
    }

    fn turn_locked(
        &self,
        events: &mut Vec<polling::Event>,
        timeout: Option<Duration>,
    ) -> io::Result<usize> {
        events.clear();

        tracing::trace!(?timeout, "turning reactor");
        match self.0.poller.wait(events, timeout) {
            Ok(_) => {}
            // interrupted waits just end the turn early; the worker loop
            // comes back around.
            Err(err) if err.kind() == io::ErrorKind::Interrupted => return Ok(0),
            Err(err) => return Err(err),
        }

        let mut woken = 0;
        for event in events.iter() {
            let io = self.0.sources.lock().unwrap().get(event.key).cloned();
            let Some(io) = io else {
                // raced with a deregistration; stale event.
                continue;
            };

            let mut ready = Ready::empty();
            if event.readable {
                ready |= Ready::READABLE;
            }
            if event.writable {
                ready |= Ready::WRITABLE;
            }

            tracing::trace!(token = event.key, ?ready, "I/O event");
            woken += io.set_readiness(ready);

            // the poller delivers oneshot notifications: re-arm the source
            // for any direction that still has a waiter.
            let remaining = io.wanted();
            if !remaining.is_empty() {
                if let Err(err) = self.0.poller.modify(io.raw, event_for(io.key, remaining)) {
                    tracing::warn!(token = io.key, ?err, "failed to re-arm I/O source");
                }
            }
        }

        Ok(woken)
    }

    /// Number of currently registered sources.
    #[cfg(test)]
    fn registered(&self) -> usize {
        self.0.sources.lock().unwrap().len()
    }
}

impl fmt::Debug for Reactor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Reactor")
            .field("sources", &self.0.sources.lock().unwrap().len())
            .finish_non_exhaustive()
    }
}

fn event_for(key: usize, interest: Interest) -> polling::Event {
    polling::Event {
        key,
        readable: interest.contains(Interest::READABLE),
        writable: interest.contains(Interest::WRITABLE),
    }
}

// === impl Registration ===

impl Registration {
    /// The token identifying this source in the reactor.
    pub fn token(&self) -> usize {
        self.io.key
    }

    /// Poll for readiness in one direction.
    ///
    /// Called from inside an I/O wrapper's `poll`: returns the readiness
    /// bits if the direction is ready, otherwise stores the context's waker
    /// to be invoked when the OS reports the source ready and re-arms the
    /// poller.
    pub fn poll_ready(
        &self,
        interest: Interest,
        cx: &mut Context<'_>,
    ) -> Poll<io::Result<Ready>> {
        match self.io.poll_ready(interest, cx) {
            Poll::Pending => {
                // the waker is parked in the slot; make sure the OS has the
                // source armed for every direction someone waits on.
                let wanted = self.io.wanted();
                if let Err(err) = self
                    .reactor
                    .0
                    .poller
                    .modify(self.io.raw, event_for(self.io.key, wanted))
                {
                    return Poll::Ready(Err(err));
                }
                Poll::Pending
            }
            ready => ready,
        }
    }

    /// Change the interest set this source is armed for in the OS.
    ///
    /// [`poll_ready`][Self::poll_ready] re-arms automatically for whatever
    /// directions have waiters, so this is only needed for sources that want
    /// to change interest eagerly (e.g. dropping write interest after a
    /// flush).
    ///
    /// # Errors
    ///
    /// Propagates the OS error if the poller rejects the change.
    pub fn reregister(&self, interest: Interest) -> io::Result<()> {
        self.reactor
            .0
            .poller
            .modify(self.io.raw, event_for(self.io.key, interest))
    }

    /// Clear sticky readiness for `interest`.
    ///
    /// Must be called after the underlying syscall reports `WouldBlock`, so
    /// the next [`poll_ready`][Self::poll_ready] waits for a fresh edge
    /// instead of spinning on stale readiness.
    pub fn clear_readiness(&self, interest: Interest) {
        self.io.clear_readiness(interest);
    }

    /// Current sticky readiness without registering interest.
    pub fn readiness(&self) -> Ready {
        self.io.readiness()
    }
}

impl Drop for Registration {
    fn drop(&mut self) {
        let removed = {
            let mut sources = self.reactor.0.sources.lock().unwrap();
            sources.try_remove(self.io.key)
        };

        if removed.is_some() {
            if let Err(err) = self.reactor.0.poller.delete(self.io.raw) {
                tracing::debug!(
                    token = self.io.key,
                    ?err,
                    "failed to deregister I/O source (fd may already be closed)"
                );
            }
        }

        // fail any tasks still waiting on this source.
        self.io.close();
        tracing::trace!(token = self.io.key, "deregistered I/O source");
    }
}

impl fmt::Debug for Registration {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Registration")
            .field("io", &self.io)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::task::noop_waker_ref;
    use std::io::{Read, Write};
    use std::os::unix::net::UnixStream;

    fn cx() -> Context<'static> {
        Context::from_waker(noop_waker_ref())
    }

    #[test]
    fn writable_stream_reports_ready() {
        let reactor = Reactor::new().unwrap();
        let (a, _b) = UnixStream::pair().unwrap();
        a.set_nonblocking(true).unwrap();

        let reg = reactor.register(&a, Interest::WRITABLE).unwrap();

        // a fresh socket pair has buffer space; one turn must surface the
        // writable event.
        let mut ready = reg.poll_ready(Interest::WRITABLE, &mut cx());
        for _ in 0..100 {
            if ready.is_ready() {
                break;
            }
            reactor
                .try_turn(Some(Duration::from_millis(50)))
                .expect("no other driver")
                .unwrap();
            ready = reg.poll_ready(Interest::WRITABLE, &mut cx());
        }

        match ready {
            Poll::Ready(Ok(bits)) => assert!(bits.contains(Ready::WRITABLE)),
            other => panic!("expected writable readiness, got {other:?}"),
        }
    }

    #[test]
    fn readable_after_peer_writes() {
        let reactor = Reactor::new().unwrap();
        let (a, mut b) = UnixStream::pair().unwrap();
        a.set_nonblocking(true).unwrap();

        let reg = reactor.register(&a, Interest::READABLE).unwrap();

        // not readable yet: this registers the (noop) waker
        assert!(reg.poll_ready(Interest::READABLE, &mut cx()).is_pending());

        b.write_all(b"ping").unwrap();
        b.flush().unwrap();

        let mut ready = Poll::Pending;
        for _ in 0..100 {
            reactor
                .try_turn(Some(Duration::from_millis(50)))
                .expect("no other driver")
                .unwrap();
            ready = reg.poll_ready(Interest::READABLE, &mut cx());
            if ready.is_ready() {
                break;
            }
        }

        match ready {
            Poll::Ready(Ok(bits)) => assert!(bits.contains(Ready::READABLE)),
            other => panic!("expected readable readiness, got {other:?}"),
        }

        // readiness is sticky until the wrapper sees WouldBlock
        let mut buf = [0u8; 16];
        let mut a_ref = &a;
        let n = a_ref.read(&mut buf).unwrap();
        assert_eq!(&buf[..n], b"ping");

        reg.clear_readiness(Interest::READABLE);
        assert!(reg.poll_ready(Interest::READABLE, &mut cx()).is_pending());
    }

    #[test]
    fn notify_interrupts_wait() {
        let reactor = Reactor::new().unwrap();

        let remote = reactor.clone();
        let notifier = crate::loom::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(20));
            remote.notify();
        });

        let start = std::time::Instant::now();
        // without the notify this would block for the full two seconds
        reactor
            .try_turn(Some(Duration::from_secs(2)))
            .expect("no other driver")
            .unwrap();
        assert!(start.elapsed() < Duration::from_secs(1));

        notifier.join().unwrap();
    }

    #[test]
    fn drop_deregisters() {
        let reactor = Reactor::new().unwrap();
        let (a, _b) = UnixStream::pair().unwrap();
        a.set_nonblocking(true).unwrap();

        let reg = reactor.register(&a, Interest::READABLE).unwrap();
        assert_eq!(reactor.registered(), 1);

        drop(reg);
        assert_eq!(reactor.registered(), 0);
    }
}
