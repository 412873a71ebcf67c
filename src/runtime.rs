// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! The runtime facade: ties the scheduler, reactor, timer and blocking pool
//! together behind a single owning [`Runtime`] value, built from a validated
//! [`Builder`] configuration.

use core::fmt;
use core::future::Future;
use core::pin::pin;
use core::task::{Context as PollContext, Poll};
use core::time::Duration;
use std::io;
use std::os::unix::io::AsRawFd;

use crate::blocking::{Blocking, BlockingPool};
use crate::error::SpawnError;
use crate::executor::{Context, ContextGuard, Executor, ExecutorConfig, Worker, with_context};
use crate::loom::sync::Arc;
use crate::park::{Parker, StdPark};
use crate::reactor::{Interest, Reactor, RegisterError, Registration};
use crate::task::{JoinHandle, Schedule, TaskBuilder, TaskRef};
use crate::time::{Clock, Timer};

/// Configures and builds a [`Runtime`].
///
/// ```
/// let rt = riptide::Builder::new()
///     .worker_threads(2)
///     .local_queue_capacity(256)
///     .build()
///     .unwrap();
/// # drop(rt);
/// ```
#[derive(Debug, Clone)]
pub struct Builder {
    worker_threads: Option<usize>,
    local_queue_capacity: usize,
    global_queue_interval: u32,
    event_interval: u32,
    enable_io: bool,
    enable_time: bool,
    thread_stack_size: Option<usize>,
    shutdown_timeout: Duration,
}

/// Error returned by [`Builder::build`] for invalid configurations.
#[derive(Debug)]
#[non_exhaustive]
pub enum BuildError {
    /// `worker_threads` must be at least 1.
    WorkerThreads(usize),
    /// `local_queue_capacity` must be a power of two (and at least 2).
    QueueCapacity(usize),
    /// Scheduler intervals must be non-zero.
    Interval(&'static str),
    /// The OS event source could not be created.
    Io(io::Error),
    /// A worker thread could not be spawned.
    Thread(io::Error),
}

impl fmt::Display for BuildError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::WorkerThreads(n) => write!(f, "invalid worker thread count: {n}"),
            Self::QueueCapacity(n) => {
                write!(f, "local queue capacity must be a power of two, got {n}")
            }
            Self::Interval(name) => write!(f, "{name} must be non-zero"),
            Self::Io(err) => write!(f, "failed to create I/O reactor: {err}"),
            Self::Thread(err) => write!(f, "failed to spawn worker thread: {err}"),
        }
    }
}

impl core::error::Error for BuildError {}

/// Error returned by [`Runtime::try_block_on`] when the runtime went down
/// before the future completed.
#[derive(Debug)]
#[non_exhaustive]
pub enum RuntimeError {
    /// The OS event source failed persistently; the runtime shut itself
    /// down.
    Driver(io::Error),
    /// The runtime shut down for another reason (e.g. a concurrent caller
    /// already consumed the driver failure).
    Shutdown,
}

impl fmt::Display for RuntimeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Driver(err) => write!(f, "the runtime's event source failed: {err}"),
            Self::Shutdown => f.write_str("the runtime shut down before the future completed"),
        }
    }
}

impl core::error::Error for RuntimeError {
    fn source(&self) -> Option<&(dyn core::error::Error + 'static)> {
        match self {
            Self::Driver(err) => Some(err),
            Self::Shutdown => None,
        }
    }
}

impl Default for Builder {
    fn default() -> Self {
        Self::new()
    }
}

impl Builder {
    pub fn new() -> Self {
        Self {
            worker_threads: None,
            local_queue_capacity: 256,
            global_queue_interval: 61,
            event_interval: 61,
            enable_io: true,
            enable_time: true,
            thread_stack_size: None,
            shutdown_timeout: Duration::from_secs(5),
        }
    }

    /// Number of worker threads. Defaults to the number of logical CPUs,
    /// clamped to `[1, 1024]`.
    pub fn worker_threads(mut self, n: usize) -> Self {
        self.worker_threads = Some(n);
        self
    }

    /// Capacity of each worker's local run queue; must be a power of two.
    /// Defaults to 256.
    pub fn local_queue_capacity(mut self, capacity: usize) -> Self {
        self.local_queue_capacity = capacity;
        self
    }

    /// Dequeues between forced injection-queue probes (anti-starvation).
    /// Defaults to 61.
    pub fn global_queue_interval(mut self, interval: u32) -> Self {
        self.global_queue_interval = interval;
        self
    }

    /// Tasks polled per scheduling batch before the worker re-checks the
    /// timer and reactor. Defaults to 61.
    pub fn event_interval(mut self, interval: u32) -> Self {
        self.event_interval = interval;
        self
    }

    /// Whether to build the I/O reactor. Defaults to `true`.
    pub fn enable_io(mut self, enable: bool) -> Self {
        self.enable_io = enable;
        self
    }

    /// Whether to build the timer wheel. Defaults to `true`.
    pub fn enable_time(mut self, enable: bool) -> Self {
        self.enable_time = enable;
        self
    }

    /// Stack size for worker (and blocking pool) threads.
    pub fn thread_stack_size(mut self, size: usize) -> Self {
        self.thread_stack_size = Some(size);
        self
    }

    /// How long [`Runtime`] shutdown waits for workers to drain before
    /// detaching them. Defaults to five seconds.
    pub fn shutdown_timeout(mut self, timeout: Duration) -> Self {
        self.shutdown_timeout = timeout;
        self
    }

    /// Build the runtime: create the reactor and timer, then spawn the
    /// worker threads.
    ///
    /// # Errors
    ///
    /// Returns a [`BuildError`] for invalid configuration values, or when
    /// the event source or worker threads cannot be created.
    pub fn build(&self) -> Result<Runtime, BuildError> {
        let num_workers = match self.worker_threads {
            Some(0) => return Err(BuildError::WorkerThreads(0)),
            Some(n) => n.min(1024),
            None => std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(1)
                .clamp(1, 1024),
        };

        if !self.local_queue_capacity.is_power_of_two()
            || self.local_queue_capacity < 2
            || self.local_queue_capacity > (1 << 16)
        {
            return Err(BuildError::QueueCapacity(self.local_queue_capacity));
        }
        if self.global_queue_interval == 0 {
            return Err(BuildError::Interval("global_queue_interval"));
        }
        if self.event_interval == 0 {
            return Err(BuildError::Interval("event_interval"));
        }

        let reactor = if self.enable_io {
            Some(Reactor::new().map_err(BuildError::Io)?)
        } else {
            None
        };
        let timer = self
            .enable_time
            .then(|| Arc::new(Timer::new(Clock::new(Clock::DEFAULT_TICK))));

        let executor = Arc::new(Executor::new(
            ExecutorConfig {
                num_workers,
                local_queue_capacity: self.local_queue_capacity,
                global_queue_interval: self.global_queue_interval,
                event_interval: self.event_interval,
            },
            reactor,
            timer,
        ));

        let blocking = BlockingPool::new(self.thread_stack_size);
        let handle = Handle {
            executor,
            blocking: blocking.shared().clone(),
        };

        let mut workers = Vec::with_capacity(num_workers);
        for i in 0..num_workers {
            let mut thread = std::thread::Builder::new().name(format!("riptide-worker-{i}"));
            if let Some(stack_size) = self.thread_stack_size {
                thread = thread.stack_size(stack_size);
            }

            let worker_handle = handle.clone();
            let join = match thread.spawn(move || Worker::new(worker_handle, i).run()) {
                Ok(join) => join,
                Err(err) => {
                    // bring down whatever already started before bailing.
                    handle.executor.stop();
                    return Err(BuildError::Thread(err));
                }
            };
            workers.push(join);
        }

        Ok(Runtime {
            handle,
            blocking,
            workers,
            shutdown_timeout: self.shutdown_timeout,
        })
    }
}

/// A handle to a running [`Runtime`]: spawns tasks and blocking closures,
/// and registers I/O sources. Cheap to clone; usable from any thread.
#[derive(Clone)]
pub struct Handle {
    pub(crate) executor: Arc<Executor>,
    pub(crate) blocking: Arc<crate::blocking::Shared>,
}

impl Schedule for Handle {
    fn schedule(&self, task: TaskRef) {
        self.executor.schedule_wake(task);
    }
}

impl Handle {
    /// The handle of the runtime the current thread belongs to (a worker
    /// thread, or a thread inside [`Runtime::block_on`]).
    ///
    /// # Panics
    ///
    /// Panics when the current thread is not running inside a runtime; use
    /// [`Handle::try_current`] for the fallible version.
    pub fn current() -> Handle {
        Self::try_current().expect("not running inside a riptide runtime")
    }

    /// Like [`Handle::current`], returning `None` outside a runtime.
    pub fn try_current() -> Option<Handle> {
        with_context(|ctx| ctx.map(|ctx| ctx.handle.clone()))
    }

    /// Spawn a future onto the runtime, returning a [`JoinHandle`] for its
    /// output.
    ///
    /// # Errors
    ///
    /// Fails with [`SpawnError::Shutdown`] when the runtime has begun
    /// shutting down.
    #[track_caller]
    pub fn spawn<F>(&self, future: F) -> Result<JoinHandle<F::Output>, SpawnError>
    where
        F: Future + Send + 'static,
        F::Output: Send + 'static,
    {
        if self.executor.is_shutdown() {
            return Err(SpawnError::Shutdown);
        }

        let (task, join) = self.build_task().build(future);
        self.executor.schedule_spawn(task);
        Ok(join)
    }

    /// Returns a [`TaskBuilder`] for configuring a task (name, kind,
    /// location) before spawning it onto this runtime.
    pub fn build_task(&self) -> TaskBuilder<'_, Handle> {
        TaskBuilder::new(self.clone())
    }

    /// Run a blocking closure on the blocking pool, returning a future that
    /// resolves to its result.
    pub fn spawn_blocking<F, R>(&self, f: F) -> Blocking<R>
    where
        F: FnOnce() -> R + Send + 'static,
        R: Send + 'static,
    {
        self.blocking.spawn_blocking(f)
    }

    /// Register an I/O source with the runtime's reactor.
    ///
    /// # Errors
    ///
    /// Fails when the token space is exhausted or the OS rejects the
    /// registration.
    ///
    /// # Panics
    ///
    /// Panics when the runtime was built with I/O disabled.
    pub fn register_io(
        &self,
        source: &impl AsRawFd,
        interest: Interest,
    ) -> Result<Registration, RegisterError> {
        self.executor
            .reactor()
            .expect("I/O is disabled on this runtime")
            .register(source, interest)
    }

    pub(crate) fn timer(&self) -> Arc<Timer> {
        self.executor
            .timer()
            .expect("timers are disabled on this runtime")
            .clone()
    }

    /// Nudge one parked worker so it re-reads the timer wheel; called after
    /// a sleep registers a deadline that may be earlier than what any
    /// sleeper is waiting for.
    pub(crate) fn notify_timer(&self) {
        self.executor.parking_lot.unpark_one();
    }
}

impl fmt::Debug for Handle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Handle")
            .field("executor", &self.executor)
            .finish_non_exhaustive()
    }
}

/// A handle to the whole runtime; dropping it shuts everything down.
pub struct Runtime {
    handle: Handle,
    blocking: BlockingPool,
    workers: Vec<std::thread::JoinHandle<()>>,
    shutdown_timeout: Duration,
}

impl Runtime {
    /// Build a runtime with default settings.
    ///
    /// # Errors
    ///
    /// See [`Builder::build`].
    pub fn new() -> Result<Self, BuildError> {
        Builder::new().build()
    }

    pub fn handle(&self) -> &Handle {
        &self.handle
    }

    /// See [`Handle::spawn`].
    ///
    /// # Errors
    ///
    /// Fails with [`SpawnError::Shutdown`] when the runtime has begun
    /// shutting down.
    #[track_caller]
    pub fn spawn<F>(&self, future: F) -> Result<JoinHandle<F::Output>, SpawnError>
    where
        F: Future + Send + 'static,
        F::Output: Send + 'static,
    {
        self.handle.spawn(future)
    }

    /// See [`Handle::spawn_blocking`].
    pub fn spawn_blocking<F, R>(&self, f: F) -> Blocking<R>
    where
        F: FnOnce() -> R + Send + 'static,
        R: Send + 'static,
    {
        self.handle.spawn_blocking(f)
    }

    /// Drive `future` to completion on the calling thread.
    ///
    /// The caller becomes a temporary worker while it waits: it runs queued
    /// tasks, steals from the workers, and drives the reactor and timer
    /// between polls of `future`. (If another thread is already blocked on
    /// this runtime, subsequent callers fall back to just polling and
    /// parking.)
    ///
    /// # Panics
    ///
    /// Panics when called from inside a runtime context (a worker thread or
    /// another `block_on`), or when the runtime goes down before the future
    /// completes (a persistently failing event source shuts the runtime
    /// down); use [`Runtime::try_block_on`] to handle the latter instead.
    pub fn block_on<F: Future>(&self, future: F) -> F::Output {
        match self.try_block_on(future) {
            Ok(output) => output,
            Err(err) => panic!("runtime failed while blocking: {err}"),
        }
    }

    /// Like [`Runtime::block_on`], but surfaces a runtime-wide failure as an
    /// error instead of panicking.
    ///
    /// # Errors
    ///
    /// Fails with [`RuntimeError::Driver`] when the OS event source failed
    /// persistently and took the runtime down, or [`RuntimeError::Shutdown`]
    /// when the runtime stopped for another reason before `future`
    /// completed.
    ///
    /// # Panics
    ///
    /// Panics when called from inside a runtime context (a worker thread or
    /// another `block_on`).
    pub fn try_block_on<F: Future>(&self, future: F) -> Result<F::Output, RuntimeError> {
        with_context(|ctx| {
            assert!(
                ctx.is_none(),
                "cannot call `block_on` from within a runtime context"
            );
        });

        match self.handle.executor.claim_block_on_slot() {
            Some(id) => {
                let _slot = BlockOnSlotGuard {
                    executor: &self.handle.executor,
                };
                let mut worker = Worker::new(self.handle.clone(), id);
                worker.block_on(future)
            }
            None => self.block_on_simple(future),
        }
    }

    /// The degraded `block_on` used when the temporary-worker slot is taken:
    /// poll the root future and park until its waker fires.
    fn block_on_simple<F: Future>(&self, future: F) -> Result<F::Output, RuntimeError> {
        let _ctx = ContextGuard::enter(Context {
            handle: self.handle.clone(),
            worker: None,
        });

        let parker = Parker::new(StdPark::for_current());
        let waker = parker.clone().into_waker();
        let mut cx = PollContext::from_waker(&waker);

        let mut future = pin!(future);
        loop {
            if let Poll::Ready(v) = future.as_mut().poll(&mut cx) {
                return Ok(v);
            }
            if self.handle.executor.is_shutdown() {
                return Err(self.handle.executor.shutdown_error());
            }
            parker.park();
        }
    }
}

struct BlockOnSlotGuard<'rt> {
    executor: &'rt Arc<Executor>,
}

impl Drop for BlockOnSlotGuard<'_> {
    fn drop(&mut self) {
        self.executor.release_block_on_slot();
    }
}

impl fmt::Debug for Runtime {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Runtime")
            .field("handle", &self.handle)
            .field("workers", &self.workers.len())
            .finish_non_exhaustive()
    }
}

impl Drop for Runtime {
    fn drop(&mut self) {
        tracing::debug!("shutting down runtime");
        self.handle.executor.stop();
        self.blocking.shutdown();

        let deadline = std::time::Instant::now() + self.shutdown_timeout;
        let mut all_joined = true;
        for worker in self.workers.drain(..) {
            loop {
                if worker.is_finished() {
                    let _ = worker.join();
                    break;
                }
                if std::time::Instant::now() >= deadline {
                    tracing::warn!("shutdown timeout elapsed, detaching worker thread");
                    all_joined = false;
                    break;
                }
                // workers observe the stop flag promptly; the unpark storm
                // from `stop` means this loop rarely spins more than once.
                self.handle.executor.parking_lot.unpark_all();
                std::thread::sleep(Duration::from_millis(1));
            }
        }

        // everything still queued is dropped without being polled. a
        // detached worker's local ring stays with that worker; it drains it
        // itself when it finally sees the stop flag.
        self.handle.executor.drain_queues(all_joined);
    }
}

/// Spawn a future onto the current runtime.
///
/// # Errors
///
/// Fails with [`SpawnError::Shutdown`] when the runtime has begun shutting
/// down.
///
/// # Panics
///
/// Panics when called outside a runtime; see [`Handle::current`].
#[track_caller]
pub fn spawn<F>(future: F) -> Result<JoinHandle<F::Output>, SpawnError>
where
    F: Future + Send + 'static,
    F::Output: Send + 'static,
{
    Handle::current().spawn(future)
}

/// Run a blocking closure on the current runtime's blocking pool.
///
/// # Panics
///
/// Panics when called outside a runtime; see [`Handle::current`].
pub fn spawn_blocking<F, R>(f: F) -> Blocking<R>
where
    F: FnOnce() -> R + Send + 'static,
    R: Send + 'static,
{
    Handle::current().spawn_blocking(f)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::time::{sleep, timeout};
    use core::sync::atomic::{AtomicUsize, Ordering};
    use core::task::Waker;
    use std::sync::Mutex;
    use tracing_subscriber::EnvFilter;
    use tracing_subscriber::util::SubscriberInitExt;

    fn trace() -> tracing::subscriber::DefaultGuard {
        tracing_subscriber::fmt()
            .with_env_filter(EnvFilter::from_default_env())
            .with_test_writer()
            .set_default()
    }

    fn runtime(workers: usize) -> Runtime {
        Builder::new().worker_threads(workers).build().unwrap()
    }

    #[test]
    fn block_on_ready_future() {
        let _trace = trace();
        let rt = runtime(1);
        assert_eq!(rt.block_on(async { 42u32 }), 42);
    }

    #[test]
    fn block_on_sleep() {
        let _trace = trace();
        let rt = runtime(1);

        let begin = std::time::Instant::now();
        let out = rt.block_on(async {
            sleep(Duration::from_millis(100)).unwrap().await;
            7u32
        });
        let elapsed = begin.elapsed();

        assert_eq!(out, 7);
        assert!(
            elapsed >= Duration::from_millis(100),
            "woke after {elapsed:?}"
        );
        assert!(elapsed < Duration::from_millis(300), "woke after {elapsed:?}");
    }

    #[test]
    fn spawn_and_join_all() {
        let _trace = trace();
        let rt = runtime(2);

        let outputs = rt.block_on(async {
            let handles: Vec<_> = (0..10u32)
                .map(|i| crate::spawn(async move { i * i }).unwrap())
                .collect();

            let mut outputs = std::collections::BTreeSet::new();
            for handle in handles {
                outputs.insert(handle.await.unwrap());
            }
            outputs
        });

        let expected: std::collections::BTreeSet<u32> =
            (0..10u32).map(|i| i * i).collect();
        assert_eq!(outputs, expected);
    }

    #[test]
    fn wake_from_another_thread() {
        let _trace = trace();
        let rt = runtime(1);

        struct Shared {
            waker: Mutex<Option<Waker>>,
            woken: AtomicUsize,
            polls: AtomicUsize,
        }

        let shared = std::sync::Arc::new(Shared {
            waker: Mutex::new(None),
            woken: AtomicUsize::new(0),
            polls: AtomicUsize::new(0),
        });

        let remote = shared.clone();
        let thread = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(50));
            remote.woken.store(1, Ordering::SeqCst);
            remote
                .waker
                .lock()
                .unwrap()
                .take()
                .expect("future was never polled")
                .wake();
        });

        let fut_shared = shared.clone();
        let out = rt.block_on(futures::future::poll_fn(move |cx| {
            fut_shared.polls.fetch_add(1, Ordering::SeqCst);
            if fut_shared.woken.load(Ordering::SeqCst) == 1 {
                Poll::Ready("done")
            } else {
                *fut_shared.waker.lock().unwrap() = Some(cx.waker().clone());
                Poll::Pending
            }
        }));

        thread.join().unwrap();
        assert_eq!(out, "done");
        assert_eq!(shared.polls.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn cancellation() {
        let _trace = trace();
        let rt = runtime(1);

        struct DropTracker(std::sync::Arc<AtomicUsize>);
        impl Drop for DropTracker {
            fn drop(&mut self) {
                self.0.fetch_add(1, Ordering::SeqCst);
            }
        }

        let drops = std::sync::Arc::new(AtomicUsize::new(0));
        let polls = std::sync::Arc::new(AtomicUsize::new(0));

        let err = rt.block_on(async {
            let tracker = DropTracker(drops.clone());
            let poll_count = polls.clone();
            let handle = crate::spawn(async move {
                let _tracker = tracker;
                futures::future::poll_fn(|_| {
                    poll_count.fetch_add(1, Ordering::SeqCst);
                    Poll::<()>::Pending
                })
                .await;
            })
            .unwrap();

            // let the task get polled at least once
            crate::task::yield_now().await;

            handle.cancel();
            handle.await.unwrap_err()
        });

        assert!(err.is_cancelled());

        // the future's destructor runs when the last reference goes away,
        // which may trail the join by a moment.
        let deadline = std::time::Instant::now() + Duration::from_secs(1);
        while drops.load(Ordering::SeqCst) == 0 {
            assert!(std::time::Instant::now() < deadline, "future never dropped");
            std::thread::yield_now();
        }
        assert_eq!(drops.load(Ordering::SeqCst), 1);

        let polls_at_cancel = polls.load(Ordering::SeqCst);
        std::thread::sleep(Duration::from_millis(20));
        assert_eq!(
            polls.load(Ordering::SeqCst),
            polls_at_cancel,
            "task polled after cancellation"
        );
    }

    #[test]
    fn local_queue_overflows_into_injector() {
        let _trace = trace();
        let rt = Builder::new()
            .worker_threads(1)
            .local_queue_capacity(4)
            .build()
            .unwrap();

        let counter = std::sync::Arc::new(AtomicUsize::new(0));

        let spawn_counter = counter.clone();
        rt.block_on(async move {
            let handles: Vec<_> = (0..100)
                .map(|_| {
                    let counter = spawn_counter.clone();
                    crate::spawn(async move {
                        counter.fetch_add(1, Ordering::SeqCst);
                    })
                    .unwrap()
                })
                .collect();

            for handle in handles {
                handle.await.unwrap();
            }
        });

        assert_eq!(counter.load(Ordering::SeqCst), 100);
        assert!(
            rt.handle().executor.overflow_count() >= 1,
            "expected at least one overflow batch"
        );
    }

    #[test]
    fn wake_coalescing() {
        let _trace = trace();
        let rt = runtime(1);

        let polls = std::sync::Arc::new(AtomicUsize::new(0));

        let task_polls = polls.clone();
        rt.block_on(async move {
            let poll_count = task_polls.clone();
            let handle = crate::spawn(futures::future::poll_fn(move |cx| {
                let n = poll_count.fetch_add(1, Ordering::SeqCst);
                if n == 0 {
                    // many wakes before the next poll coalesce into one
                    for _ in 0..5 {
                        cx.waker().wake_by_ref();
                    }
                    Poll::Pending
                } else {
                    Poll::Ready(())
                }
            }))
            .unwrap();

            handle.await.unwrap();
        });

        assert_eq!(polls.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn spawn_blocking_round_trip() {
        let _trace = trace();
        let rt = runtime(1);

        let out = rt.block_on(async {
            crate::spawn_blocking(|| {
                std::thread::sleep(Duration::from_millis(10));
                7u32
            })
            .await
            .unwrap()
        });

        assert_eq!(out, 7);
    }

    #[test]
    fn timeout_elapses_and_completes() {
        let _trace = trace();
        let rt = runtime(1);

        rt.block_on(async {
            let err = timeout(Duration::from_millis(50), futures::future::pending::<()>())
                .unwrap()
                .await;
            assert!(err.is_err());

            let ok = timeout(Duration::from_secs(5), async { 5u32 }).unwrap().await;
            assert_eq!(ok.unwrap(), 5);
        });
    }

    #[test]
    fn task_panic_is_contained() {
        let _trace = trace();
        let rt = runtime(1);

        let err = rt.block_on(async {
            let handle = crate::spawn(async {
                panic!("boom");
            })
            .unwrap();
            handle.await.unwrap_err()
        });

        assert!(err.is_panic());
        assert_eq!(
            err.try_into_panic()
                .unwrap()
                .downcast_ref::<&'static str>(),
            Some(&"boom")
        );

        // the worker survives and keeps scheduling
        assert_eq!(rt.block_on(async { 1 + 1 }), 2);
    }

    #[test]
    fn io_readiness_end_to_end() {
        use std::io::Write;
        use std::os::unix::net::UnixStream;

        let _trace = trace();
        let rt = runtime(1);

        let (a, mut b) = UnixStream::pair().unwrap();
        a.set_nonblocking(true).unwrap();

        let writer = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(50));
            b.write_all(b"ready").unwrap();
        });

        let got = rt.block_on(async move {
            let reg = Handle::current()
                .register_io(&a, Interest::READABLE)
                .unwrap();

            futures::future::poll_fn(|cx| reg.poll_ready(Interest::READABLE, cx))
                .await
                .unwrap()
        });

        assert!(got.contains(crate::reactor::Ready::READABLE));
        writer.join().unwrap();
    }

    #[test]
    fn shutdown_drops_queued_tasks() {
        let _trace = trace();

        struct DropTracker(std::sync::Arc<AtomicUsize>);
        impl Drop for DropTracker {
            fn drop(&mut self) {
                self.0.fetch_add(1, Ordering::SeqCst);
            }
        }

        let drops = std::sync::Arc::new(AtomicUsize::new(0));

        let rt = runtime(1);
        let tracker = DropTracker(drops.clone());
        // a task that yields forever is re-queued after every poll, so it is
        // guaranteed to be sitting in a queue when the runtime goes down.
        let _handle = rt
            .spawn(async move {
                let _tracker = tracker;
                loop {
                    crate::task::yield_now().await;
                }
            })
            .unwrap();

        // let the task get going
        rt.block_on(async {
            sleep(Duration::from_millis(20)).unwrap().await;
        });

        drop(rt);
        // the shutdown drain retired the task, dropping its future even
        // though the join handle is still alive.
        assert_eq!(drops.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn driver_failure_surfaces_as_error() {
        let _trace = trace();
        let rt = runtime(1);

        // simulate the reactor giving up after persistent `wait` failures
        rt.handle()
            .executor
            .fail(io::Error::other("event source closed"));

        let err = rt
            .try_block_on(futures::future::pending::<()>())
            .unwrap_err();
        assert!(matches!(err, RuntimeError::Driver(_)));

        // a second blocked caller finds the failure already consumed
        let err = rt.try_block_on(futures::future::pending::<()>()).unwrap_err();
        assert!(matches!(err, RuntimeError::Shutdown));
    }

    #[test]
    fn spawn_after_shutdown_fails() {
        let _trace = trace();
        let rt = runtime(1);
        let handle = rt.handle().clone();

        drop(rt);

        assert!(matches!(
            handle.spawn(async {}),
            Err(SpawnError::Shutdown)
        ));
    }

    #[test]
    fn many_yielding_tasks_across_workers() {
        let _trace = trace();
        let rt = runtime(3);

        let counter = std::sync::Arc::new(AtomicUsize::new(0));

        let task_counter = counter.clone();
        rt.block_on(async move {
            let handles: Vec<_> = (0..100)
                .map(|_| {
                    let counter = task_counter.clone();
                    crate::spawn(async move {
                        for _ in 0..10 {
                            crate::task::yield_now().await;
                        }
                        counter.fetch_add(1, Ordering::SeqCst);
                    })
                    .unwrap()
                })
                .collect();

            for handle in handles {
                handle.await.unwrap();
            }
        });

        assert_eq!(counter.load(Ordering::SeqCst), 100);
    }

    #[test]
    fn nested_block_on_panics() {
        let _trace = trace();
        let rt = runtime(1);

        let result = rt.block_on(async {
            std::panic::catch_unwind(|| {
                let inner = runtime(1);
                inner.block_on(async {})
            })
            .is_err()
        });

        assert!(result, "nested block_on should panic");
    }

    #[test]
    fn invalid_configurations_are_rejected() {
        assert!(matches!(
            Builder::new().worker_threads(0).build(),
            Err(BuildError::WorkerThreads(0))
        ));
        assert!(matches!(
            Builder::new().local_queue_capacity(100).build(),
            Err(BuildError::QueueCapacity(100))
        ));
        assert!(matches!(
            Builder::new().global_queue_interval(0).build(),
            Err(BuildError::Interval(_))
        ));
    }
}
