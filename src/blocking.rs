// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! The blocking pool: a small cache of plain OS threads that run synchronous
//! closures on behalf of [`spawn_blocking`][crate::spawn_blocking], so
//! blocking work never ties up an async worker.
//!
//! Threads are spawned lazily up to a cap, parked on a condvar while idle,
//! and retire after sitting idle for a while. Results travel back through a
//! [oneshot][crate::sync::oneshot] channel; a panicking closure is caught
//! and surfaced as a [`JoinError`], the same way task panics are.

use core::fmt;
use core::future::Future;
use core::panic::AssertUnwindSafe;
use core::pin::Pin;
use core::task::{Context, Poll};
use core::time::Duration;

use std::collections::VecDeque;
use std::sync::{Arc, Condvar, Mutex};

use crate::sync::oneshot;
use crate::task::{Id, JoinError};

/// How long an idle pool thread hangs around before retiring.
const IDLE_TIMEOUT: Duration = Duration::from_secs(10);

/// Upper bound on pool threads; blocking closures beyond this queue up.
const MAX_THREADS: usize = 512;

type Job = Box<dyn FnOnce() + Send + 'static>;

pub(crate) struct BlockingPool {
    shared: Arc<Shared>,
}

pub(crate) struct Shared {
    state: Mutex<State>,
    condvar: Condvar,
    stack_size: Option<usize>,
}

struct State {
    queue: VecDeque<Job>,
    /// Threads currently alive.
    threads: usize,
    /// Threads currently waiting on the condvar.
    idle: usize,
    /// Monotonic counter for thread names.
    spawned_total: usize,
    shutdown: bool,
    /// Join handles of pool threads, collected at shutdown.
    handles: Vec<std::thread::JoinHandle<()>>,
}

// === impl BlockingPool ===

impl BlockingPool {
    pub(crate) fn new(stack_size: Option<usize>) -> Self {
        Self {
            shared: Arc::new(Shared {
                state: Mutex::new(State {
                    queue: VecDeque::new(),
                    threads: 0,
                    idle: 0,
                    spawned_total: 0,
                    shutdown: false,
                    handles: Vec::new(),
                }),
                condvar: Condvar::new(),
                stack_size,
            }),
        }
    }

    pub(crate) fn shared(&self) -> &Arc<Shared> {
        &self.shared
    }

    /// Shut the pool down: pending jobs are dropped (their receivers observe
    /// cancellation), running jobs finish, threads exit and are joined.
    pub(crate) fn shutdown(&self) {
        let handles = {
            let mut state = self.shared.state.lock().unwrap();
            state.shutdown = true;
            state.queue.clear();
            self.shared.condvar.notify_all();
            core::mem::take(&mut state.handles)
        };

        for handle in handles {
            if let Err(err) = handle.join() {
                tracing::warn!(?err, "blocking pool thread panicked");
            }
        }
    }
}

impl Drop for BlockingPool {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl fmt::Debug for BlockingPool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.shared.state.lock().unwrap();
        f.debug_struct("BlockingPool")
            .field("threads", &state.threads)
            .field("idle", &state.idle)
            .field("queued", &state.queue.len())
            .finish_non_exhaustive()
    }
}

// === impl Shared ===

impl Shared {
    /// Run `f` on the pool, returning a future for its result.
    pub(crate) fn spawn_blocking<F, R>(self: &Arc<Self>, f: F) -> Blocking<R>
    where
        F: FnOnce() -> R + Send + 'static,
        R: Send + 'static,
    {
        let id = Id::next();
        let (tx, rx) = oneshot::channel();

        let job: Job = Box::new(move || {
            let result = std::panic::catch_unwind(AssertUnwindSafe(f));
            // a dropped receiver is fine; the result is discarded.
            let _ = tx.send(result);
        });

        let mut state = self.state.lock().unwrap();
        if state.shutdown {
            // dropping the job here drops `tx`, which fails the receiver
            // with a cancellation.
            return Blocking { rx, id };
        }

        state.queue.push_back(job);

        if state.idle > 0 {
            self.condvar.notify_one();
        } else if state.threads < MAX_THREADS {
            self.spawn_thread(&mut state);
        }

        Blocking { rx, id }
    }

    fn spawn_thread(self: &Arc<Self>, state: &mut State) {
        let shared = self.clone();
        let n = state.spawned_total;
        state.spawned_total += 1;
        state.threads += 1;

        let mut builder = std::thread::Builder::new().name(format!("blocking-{n}"));
        if let Some(stack_size) = self.stack_size {
            builder = builder.stack_size(stack_size);
        }

        match builder.spawn(move || shared.thread_main()) {
            Ok(handle) => state.handles.push(handle),
            Err(err) => {
                state.threads -= 1;
                tracing::error!(?err, "failed to spawn blocking pool thread");
            }
        }
    }

    fn thread_main(self: Arc<Self>) {
        let mut state = self.state.lock().unwrap();
        loop {
            while let Some(job) = state.queue.pop_front() {
                drop(state);
                job();
                state = self.state.lock().unwrap();
            }

            if state.shutdown {
                break;
            }

            state.idle += 1;
            let (guard, timeout) = self
                .condvar
                .wait_timeout(state, IDLE_TIMEOUT)
                .expect("blocking pool mutex poisoned");
            state = guard;
            state.idle -= 1;

            if timeout.timed_out() && state.queue.is_empty() {
                break;
            }
        }

        state.threads -= 1;
    }
}

/// Future returned by [`spawn_blocking`][crate::spawn_blocking]; resolves to
/// the closure's return value once a pool thread has run it.
#[must_use = "futures do nothing unless `.await`ed or `poll`ed"]
pub struct Blocking<R> {
    rx: oneshot::Receiver<std::thread::Result<R>>,
    id: Id,
}

impl<R> Future for Blocking<R> {
    type Output = Result<R, JoinError<R>>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.get_mut();
        match core::task::ready!(this.rx.poll_recv(cx)) {
            Ok(Ok(value)) => Poll::Ready(Ok(value)),
            Ok(Err(panic)) => Poll::Ready(Err(JoinError::panic(this.id, panic))),
            // the pool shut down before the closure ran.
            Err(_) => Poll::Ready(Err(JoinError::cancelled(false, this.id).with_output(None))),
        }
    }
}

impl<R> fmt::Debug for Blocking<R> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Blocking").field("id", &self.id).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::executor::block_on;

    #[test]
    fn runs_closure_and_returns_result() {
        let pool = BlockingPool::new(None);
        let result = block_on(pool.shared().spawn_blocking(|| 2 + 2)).unwrap();
        assert_eq!(result, 4);
        pool.shutdown();
    }

    #[test]
    fn reuses_idle_threads() {
        let pool = BlockingPool::new(None);

        for _ in 0..8 {
            block_on(pool.shared().spawn_blocking(|| ())).unwrap();
            // give the pool thread a moment to go idle again
            std::thread::sleep(Duration::from_millis(5));
        }

        // sequential jobs should not have needed 8 distinct threads
        let spawned = pool.shared.state.lock().unwrap().spawned_total;
        assert!(spawned < 8, "spawned {spawned} threads for sequential jobs");

        pool.shutdown();
    }

    #[test]
    fn panic_is_reported() {
        let pool = BlockingPool::new(None);
        let err = block_on(pool.shared().spawn_blocking(|| panic!("kaboom"))).unwrap_err();
        assert!(err.is_panic());
        pool.shutdown();
    }

    #[test]
    fn spawn_after_shutdown_is_cancelled() {
        let pool = BlockingPool::new(None);
        pool.shutdown();

        let err = block_on(pool.shared().spawn_blocking(|| 1)).unwrap_err();
        assert!(err.is_cancelled());
    }
}
