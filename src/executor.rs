// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! The work-stealing scheduler core: shared executor state and the per-thread
//! worker loop.
//!
//! Each worker owns a bounded local run queue plus a one-task LIFO slot for
//! wake-to-run locality; tasks spawned or woken from outside any worker land
//! on the global [`Injector`]. A worker's loop pulls from the LIFO slot, then
//! its local queue, probing the injector every
//! [`global_queue_interval`][ExecutorConfig::global_queue_interval] dequeues
//! so injector tasks cannot starve behind a busy local queue. A worker that
//! runs dry steals half of a random peer's queue; one that finds nothing
//! parks: either on its thread parker or, if it wins the driver right,
//! inside the I/O reactor with a wait bounded by the next timer deadline.

pub(crate) mod queue;
pub(crate) mod steal;

use core::cell::RefCell;
use core::fmt;
use core::future::Future;
use core::pin::pin;
use core::task::{Context as PollContext, Poll};
use core::time::Duration;

use crate::loom::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use crate::loom::sync::{Arc, Mutex};
use crate::park::{Park, Parker, ParkingLot, StdPark};
use crate::reactor::Reactor;
use crate::runtime::{Handle, RuntimeError};
use crate::task::{PollResult, TaskRef};
use crate::time::{Deadline, Timer};

pub(crate) use steal::Injector;

/// Scheduler configuration, validated by the runtime builder.
#[derive(Debug, Clone)]
pub(crate) struct ExecutorConfig {
    /// Number of dedicated worker threads.
    pub(crate) num_workers: usize,
    /// Capacity of each worker's local queue (a power of two).
    pub(crate) local_queue_capacity: usize,
    /// Dequeues between forced injector probes.
    pub(crate) global_queue_interval: u32,
    /// Tasks polled per scheduling batch, between reactor/timer checks.
    pub(crate) event_interval: u32,
}

/// Shared scheduler state; lives in an `Arc` behind [`Handle`].
pub(crate) struct Executor {
    /// Per-worker queues. One slot per dedicated worker, plus a reserved
    /// trailing slot claimed by a `block_on` caller acting as a temporary
    /// worker.
    workers: Box<[WorkerShared]>,
    pub(crate) injector: Injector,
    pub(crate) parking_lot: ParkingLot<WorkerPark>,
    shutdown: AtomicBool,
    /// A fatal error (reactor failure) that brought the runtime down.
    failure: Mutex<Option<std::io::Error>>,
    /// Number of workers currently in the steal loop; used to throttle
    /// contention when most workers are idle-spinning.
    num_stealing: AtomicUsize,
    /// Number of live workers (dedicated + temporary).
    active_workers: AtomicUsize,
    /// Whether the reserved `block_on` worker slot is taken.
    block_on_slot_claimed: AtomicBool,
    /// Cumulative count of local-queue overflow spills into the injector.
    overflows: AtomicUsize,
    config: ExecutorConfig,
    timer: Option<Arc<Timer>>,
    reactor: Option<Reactor>,
}

struct WorkerShared {
    /// Owner half of the local queue; only touched by the worker thread
    /// occupying this slot.
    local: queue::Local,
    /// Stealer half, used by every other worker.
    steal: queue::Steal,
    /// LIFO slot: the most recently woken task, run before the local queue.
    /// Exempt from stealing.
    lifo: Mutex<Option<TaskRef>>,
}

/// What happened during one scheduling batch.
#[derive(Debug, Default)]
#[non_exhaustive]
pub(crate) struct Tick {
    /// `true` if the batch ended with tasks still queued locally.
    pub(crate) has_remaining: bool,
    /// Tasks polled in this batch.
    pub(crate) polled: usize,
    /// Polled tasks that completed.
    pub(crate) completed: usize,
}

// === thread-local context ===

/// Scheduler context of the current thread: which runtime it belongs to and,
/// if it is a worker, which queue slot it owns.
#[derive(Clone)]
pub(crate) struct Context {
    pub(crate) handle: Handle,
    pub(crate) worker: Option<usize>,
}

std::thread_local! {
    static CONTEXT: RefCell<Option<Context>> = const { RefCell::new(None) };
}

pub(crate) fn with_context<R>(f: impl FnOnce(Option<&Context>) -> R) -> R {
    CONTEXT.with(|cx| f(cx.borrow().as_ref()))
}

/// Installs a scheduler context for the current thread, restoring the
/// previous one on drop.
pub(crate) struct ContextGuard {
    prev: Option<Context>,
}

impl ContextGuard {
    pub(crate) fn enter(ctx: Context) -> Self {
        let prev = CONTEXT.with(|cell| cell.borrow_mut().replace(ctx));
        Self { prev }
    }
}

impl Drop for ContextGuard {
    fn drop(&mut self) {
        CONTEXT.with(|cell| {
            *cell.borrow_mut() = self.prev.take();
        });
    }
}

// === impl Executor ===

impl Executor {
    pub(crate) fn new(
        config: ExecutorConfig,
        reactor: Option<Reactor>,
        timer: Option<Arc<Timer>>,
    ) -> Self {
        // one slot per worker thread, plus the reserved block_on slot.
        let workers = (0..=config.num_workers)
            .map(|_| {
                let (steal, local) = queue::local(config.local_queue_capacity);
                WorkerShared {
                    local,
                    steal,
                    lifo: Mutex::new(None),
                }
            })
            .collect();

        Self {
            workers,
            injector: Injector::new(),
            parking_lot: ParkingLot::with_capacity(config.num_workers + 1),
            shutdown: AtomicBool::new(false),
            failure: Mutex::new(None),
            num_stealing: AtomicUsize::new(0),
            active_workers: AtomicUsize::new(0),
            block_on_slot_claimed: AtomicBool::new(false),
            overflows: AtomicUsize::new(0),
            config,
            timer,
            reactor,
        }
    }

    pub(crate) fn timer(&self) -> Option<&Arc<Timer>> {
        self.timer.as_ref()
    }

    pub(crate) fn reactor(&self) -> Option<&Reactor> {
        self.reactor.as_ref()
    }

    pub(crate) fn is_shutdown(&self) -> bool {
        self.shutdown.load(Ordering::Acquire)
    }

    /// Begin shutting down: no new tasks are accepted, all workers are woken
    /// so they observe the flag, drain and exit.
    pub(crate) fn stop(&self) {
        tracing::debug!("stopping executor");
        self.shutdown.store(true, Ordering::Release);
        if let Some(reactor) = &self.reactor {
            reactor.notify();
        }
        self.parking_lot.unpark_all();
    }

    /// Bring the runtime down because of a fatal error.
    pub(crate) fn fail(&self, err: std::io::Error) {
        tracing::error!(?err, "fatal runtime error, shutting down");
        let mut failure = self.failure.lock().unwrap();
        if failure.is_none() {
            *failure = Some(err);
        }
        drop(failure);
        self.stop();
    }

    pub(crate) fn take_failure(&self) -> Option<std::io::Error> {
        self.failure.lock().unwrap().take()
    }

    /// The error a blocked caller surfaces when the executor shut down
    /// underneath it.
    pub(crate) fn shutdown_error(&self) -> RuntimeError {
        match self.take_failure() {
            Some(err) => RuntimeError::Driver(err),
            None => RuntimeError::Shutdown,
        }
    }

    /// Schedule a woken task.
    ///
    /// From a worker thread of this executor the task goes into the worker's
    /// LIFO slot (displacing its previous occupant into the local queue);
    /// from anywhere else it goes onto the injector. Either way one sleeping
    /// worker is woken.
    pub(crate) fn schedule_wake(self: &Arc<Self>, task: TaskRef) {
        if self.is_shutdown() {
            // the queues are draining: retire the task in place. marking it
            // cancelled and "polling" it once makes the scheduler drop the
            // future without running it and wake any `JoinHandle`.
            task.mark_cancelled();
            task.poll();
            drop(task);
            return;
        }

        let in_worker = with_context(|ctx| match ctx {
            Some(ctx) if Arc::ptr_eq(&ctx.handle.executor, self) => ctx.worker,
            _ => None,
        });

        match in_worker {
            Some(idx) => self.push_lifo(idx, task),
            None => self.injector.push_task(task),
        }

        self.parking_lot.unpark_one();
    }

    /// Schedule a freshly spawned task: local queue when on a worker,
    /// injector otherwise. Spawns skip the LIFO slot so a spawn burst cannot
    /// keep displacing woken tasks.
    pub(crate) fn schedule_spawn(self: &Arc<Self>, task: TaskRef) {
        let in_worker = with_context(|ctx| match ctx {
            Some(ctx) if Arc::ptr_eq(&ctx.handle.executor, self) => ctx.worker,
            _ => None,
        });

        match in_worker {
            Some(idx) => self.push_local(idx, task),
            None => self.injector.push_task(task),
        }

        self.parking_lot.unpark_one();
    }

    fn push_lifo(&self, idx: usize, task: TaskRef) {
        let displaced = {
            let mut lifo = self.workers[idx].lifo.lock().unwrap();
            lifo.replace(task)
        };
        if let Some(displaced) = displaced {
            self.push_local(idx, displaced);
        }
    }

    fn push_local(&self, idx: usize, task: TaskRef) {
        if self.workers[idx]
            .local
            .push_back_or_overflow(task, &self.injector)
        {
            self.overflows.fetch_add(1, Ordering::Relaxed);
        }
    }

    /// Cumulative number of local-queue overflow spills.
    pub(crate) fn overflow_count(&self) -> usize {
        self.overflows.load(Ordering::Relaxed)
    }

    /// Claim the reserved temporary-worker slot for a `block_on` caller.
    /// Returns its index, or `None` if another `block_on` holds it.
    pub(crate) fn claim_block_on_slot(&self) -> Option<usize> {
        self.block_on_slot_claimed
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
            .then_some(self.config.num_workers)
    }

    pub(crate) fn release_block_on_slot(&self) {
        // hand queued-but-unfinished tasks to the dedicated workers; without
        // this they would sit in a slot no one services.
        let slot = &self.workers[self.config.num_workers];
        let lifo = slot.lifo.lock().unwrap().take();
        let mut moved = 0;
        if let Some(task) = lifo {
            self.injector.push_task(task);
            moved += 1;
        }
        while let Some(task) = slot.local.pop() {
            self.injector.push_task(task);
            moved += 1;
        }
        if moved > 0 {
            self.parking_lot.unpark_one();
        }

        self.block_on_slot_claimed.store(false, Ordering::Release);
    }

    /// Drop everything still queued at final shutdown.
    ///
    /// `include_locals` must only be `true` once every worker thread has
    /// exited: the ring queues' owner half is otherwise still in use on the
    /// worker threads. The injector and the LIFO slots are safe to drain
    /// concurrently either way (a detached worker drains its own ring when
    /// it eventually observes the stop flag).
    pub(crate) fn drain_queues(&self, include_locals: bool) {
        let drain_task = |task: TaskRef| {
            // retire in place: the future is dropped without being run and
            // any `JoinHandle` observes cancellation.
            task.mark_cancelled();
            task.poll();
            drop(task);
        };

        while let Ok(stealer) = self.injector.try_steal() {
            while let Some(task) = stealer.pop() {
                drain_task(task);
            }
        }

        for worker in &self.workers {
            if let Some(task) = worker.lifo.lock().unwrap().take() {
                drain_task(task);
            }
            if include_locals {
                while let Some(task) = worker.local.pop() {
                    drain_task(task);
                }
            }
        }
    }
}

impl fmt::Debug for Executor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Executor")
            .field("workers", &self.workers.len())
            .field("injector", &self.injector)
            .field("shutdown", &self.is_shutdown())
            .finish_non_exhaustive()
    }
}

// === impl WorkerPark ===

/// The [`Park`] implementation workers block on.
///
/// An idle worker first tries to become the I/O driver: if it wins the
/// reactor's driver right, its "park" is a blocking [`Reactor::try_turn`]
/// bounded by the caller's timeout, interruptible by
/// [`notify`][Reactor::notify]. Otherwise (or with no reactor) it parks its
/// thread. `unpark` pokes both mechanisms; both are sticky, so whichever one
/// the target ends up blocking on sees the wakeup.
pub(crate) struct WorkerPark {
    reactor: Option<Reactor>,
    executor: std::sync::Weak<Executor>,
    thread: StdPark,
    /// Consecutive reactor failures; a persistently failing event source
    /// takes the runtime down.
    turn_errors: AtomicUsize,
}

const MAX_TURN_ERRORS: usize = 3;

impl WorkerPark {
    fn new(reactor: Option<Reactor>, executor: std::sync::Weak<Executor>) -> Self {
        Self {
            reactor,
            executor,
            thread: StdPark::for_current(),
            turn_errors: AtomicUsize::new(0),
        }
    }

    fn drive_io(&self, timeout: Option<Duration>) -> bool {
        let Some(reactor) = &self.reactor else {
            return false;
        };

        match reactor.try_turn(timeout) {
            None => false,
            Some(Ok(_)) => {
                self.turn_errors.store(0, Ordering::Relaxed);
                true
            }
            Some(Err(err)) => {
                tracing::warn!(?err, "reactor turn failed");
                let errors = self.turn_errors.fetch_add(1, Ordering::Relaxed) + 1;
                if errors >= MAX_TURN_ERRORS {
                    if let Some(executor) = self.executor.upgrade() {
                        executor.fail(err);
                    }
                }
                true
            }
        }
    }
}

impl Park for WorkerPark {
    fn park(&self) {
        if !self.drive_io(None) {
            self.thread.park();
        }
    }

    fn park_timeout(&self, duration: Duration) {
        if !self.drive_io(Some(duration)) {
            self.thread.park_timeout(duration);
        }
    }

    fn unpark(&self) {
        if let Some(reactor) = &self.reactor {
            reactor.notify();
        }
        self.thread.unpark();
    }
}

// === impl Worker ===

/// A worker: the poll loop run by each runtime thread (and by `block_on`
/// callers acting as temporary workers).
pub(crate) struct Worker {
    id: usize,
    handle: Handle,
    parker: Parker<WorkerPark>,
    rng: fastrand::Rng,
    /// Dequeues since the last forced injector probe.
    tick: u32,
    is_stealing: bool,
}

impl Worker {
    /// Create a worker bound to queue slot `id`. Must be called on the thread
    /// that will run it.
    pub(crate) fn new(handle: Handle, id: usize) -> Self {
        let executor = &handle.executor;
        executor.active_workers.fetch_add(1, Ordering::AcqRel);

        let park = WorkerPark::new(executor.reactor.clone(), Arc::downgrade(executor));

        // a cheap per-worker seed; only steal-victim rotation depends on it.
        let seed = 0x9E37_79B9_7F4A_7C15_u64.wrapping_mul(id as u64 + 1);

        Self {
            id,
            handle,
            parker: Parker::new(park),
            rng: fastrand::Rng::with_seed(seed),
            tick: 0,
            is_stealing: false,
        }
    }

    fn executor(&self) -> &Arc<Executor> {
        &self.handle.executor
    }

    fn shared(&self) -> &WorkerShared {
        &self.handle.executor.workers[self.id]
    }

    /// The dedicated worker main loop; returns when the executor shuts down.
    pub(crate) fn run(&mut self) {
        let _span = tracing::debug_span!("worker", worker = self.id).entered();
        let _ctx = ContextGuard::enter(Context {
            handle: self.handle.clone(),
            worker: Some(self.id),
        });

        loop {
            let tick = self.tick_n(self.executor().config.event_interval);
            tracing::trace!(worker = self.id, ?tick, "worker tick");

            if self.executor().is_shutdown() {
                tracing::debug!(worker = self.id, "stop signal received, shutting down");
                break;
            }

            if tick.has_remaining {
                // the batch budget ran out with work left over: give the
                // drivers a non-blocking turn anyway, so a saturated runtime
                // cannot starve timers or I/O.
                self.turn_drivers_nonblocking();
                continue;
            }

            // advance the timer; if anything fired there may be new work.
            let next_deadline = match self.turn_timer() {
                Ok(deadline) => deadline,
                Err(Fired) => continue,
            };

            // out of local work: try to take someone else's.
            if let Some(task) = self.try_steal() {
                self.run_task(task);
                continue;
            }

            self.park(next_deadline);
        }

        self.drain_on_shutdown();
    }

    /// Drive `future` to completion on this thread, servicing the runtime's
    /// queues, timer, and reactor in between polls.
    ///
    /// # Errors
    ///
    /// Fails with the executor's shutdown error when the runtime goes down
    /// (e.g. a persistently failing event source) before the future
    /// completes.
    pub(crate) fn block_on<F: Future>(&mut self, future: F) -> Result<F::Output, RuntimeError> {
        let _span = tracing::debug_span!("block_on", worker = self.id).entered();
        let _ctx = ContextGuard::enter(Context {
            handle: self.handle.clone(),
            worker: Some(self.id),
        });

        let waker = self.parker.clone().into_waker();
        let mut cx = PollContext::from_waker(&waker);

        let mut future = pin!(future);

        loop {
            if let Poll::Ready(v) = future.as_mut().poll(&mut cx) {
                return Ok(v);
            }

            if self.executor().is_shutdown() {
                return Err(self.executor().shutdown_error());
            }

            let tick = self.tick_n(self.executor().config.event_interval);
            if tick.has_remaining {
                self.turn_drivers_nonblocking();
                continue;
            }

            let next_deadline = match self.turn_timer() {
                Ok(deadline) => deadline,
                Err(Fired) => continue,
            };

            if let Some(task) = self.try_steal() {
                self.run_task(task);
                continue;
            }

            self.park(next_deadline);
        }
    }

    /// Poll up to `n` tasks from this worker's queues.
    fn tick_n(&mut self, n: u32) -> Tick {
        let mut tick = Tick::default();

        for _ in 0..n {
            let Some(task) = self.next_task() else { break };

            tick.polled += 1;
            if self.run_task(task) {
                tick.completed += 1;
            }
        }

        tick.has_remaining =
            !self.shared().local.is_empty() || self.shared().lifo.lock().unwrap().is_some();
        tick
    }

    /// Poll one task; returns `true` if it completed.
    fn run_task(&mut self, task: TaskRef) -> bool {
        let _span = tracing::trace_span!("poll", task.id = %task.id()).entered();

        match task.poll() {
            PollResult::Ready | PollResult::ReadyJoined => true,
            PollResult::Pending => false,
            PollResult::PendingSchedule => {
                // the task woke itself (e.g. `yield_now`); it goes to the
                // back of the local queue, not the LIFO slot, so it cannot
                // monopolize this worker.
                self.executor().push_local(self.id, task);
                false
            }
        }
    }

    fn next_task(&mut self) -> Option<TaskRef> {
        self.tick = self.tick.wrapping_add(1);

        // anti-starvation: periodically give the injector priority over
        // local work.
        if self.tick % self.executor().config.global_queue_interval == 0 {
            if let Some(task) = self.take_from_injector() {
                return Some(task);
            }
        }

        if let Some(task) = self.shared().lifo.lock().unwrap().take() {
            return Some(task);
        }

        if let Some(task) = self.shared().local.pop() {
            return Some(task);
        }

        self.take_from_injector()
    }

    /// Pop one injector task for immediate execution, pulling a fair share of
    /// the backlog into the local queue while the consumer lock is held.
    fn take_from_injector(&mut self) -> Option<TaskRef> {
        let executor = self.executor();
        let stealer = executor.injector.try_steal().ok()?;

        let first = stealer.pop()?;

        // already holding the consumer side: batch up a share of what's left
        // so the next tasks don't pay for the lock again.
        let share = (stealer.backlog() / (executor.config.num_workers + 1))
            .min(executor.config.local_queue_capacity / 2);
        stealer.take_n(share, |task| {
            executor.push_local(self.id, task);
        });

        Some(first)
    }

    /// Attempt to steal work from a sibling worker (or, failing that, the
    /// injector), returning a task to run now.
    fn try_steal(&mut self) -> Option<TaskRef> {
        const ROUNDS: usize = 4;

        if !self.transition_to_stealing() {
            return None;
        }

        let mut stolen = None;

        'rounds: for round in 0..ROUNDS {
            let num_slots = self.executor().workers.len();
            let start = self.rng.usize(0..num_slots);

            for i in 0..num_slots {
                let i = (start + i) % num_slots;

                // don't steal from ourselves; we know we have nothing.
                if i == self.id {
                    continue;
                }

                let victim = &self.executor().workers[i].steal;
                if let Some(task) = victim.steal_into(&self.shared().local) {
                    tracing::trace!(victim = i, "stole tasks from worker");
                    stolen = Some(task);
                    break 'rounds;
                }
            }

            if round + 1 < ROUNDS {
                std::thread::yield_now();
            }
        }

        if stolen.is_none() {
            // as a last resort check the injector once more.
            stolen = self.take_from_injector();
        }

        self.transition_from_stealing();
        stolen
    }

    /// Throttle the steal loop: once half the non-parked workers are already
    /// out stealing, an empty worker goes to sleep instead of joining the
    /// scrum.
    fn transition_to_stealing(&mut self) -> bool {
        debug_assert!(!self.is_stealing);

        let executor = self.executor();
        let num_stealing = executor.num_stealing.load(Ordering::Acquire);
        let num_parked = executor.parking_lot.num_parked();
        let active = executor.active_workers.load(Ordering::Acquire);

        if active > 1 && 2 * num_stealing >= active.saturating_sub(num_parked) {
            return false;
        }

        executor.num_stealing.fetch_add(1, Ordering::AcqRel);
        self.is_stealing = true;
        true
    }

    fn transition_from_stealing(&mut self) {
        debug_assert!(self.is_stealing);
        self.is_stealing = false;

        let prev = self.executor().num_stealing.fetch_sub(1, Ordering::AcqRel);
        debug_assert!(prev > 0);
    }

    /// A zero-cost pass over timer and reactor while the worker still has
    /// queued tasks: fire due timers and collect already-pending I/O events
    /// without blocking.
    fn turn_drivers_nonblocking(&self) {
        if let Some(timer) = &self.executor().timer {
            let _ = timer.try_turn();
        }
        if let Some(reactor) = &self.executor().reactor {
            if let Some(Err(err)) = reactor.try_turn(Some(Duration::ZERO)) {
                tracing::warn!(?err, "reactor turn failed");
            }
        }
    }

    /// Advance the timer. `Err(Fired)` means entries expired and the caller
    /// should look for runnable tasks again; `Ok` carries the next pending
    /// deadline for bounding the park.
    fn turn_timer(&self) -> Result<Option<Deadline>, Fired> {
        let Some(timer) = &self.executor().timer else {
            return Ok(None);
        };

        match timer.try_turn() {
            Some((expired, _)) if expired > 0 => Err(Fired),
            Some((_, next_deadline)) => Ok(next_deadline),
            // another worker is mid-turn; it will surface any expirations.
            None => Ok(timer.next_deadline()),
        }
    }

    fn park(&mut self, next_deadline: Option<Deadline>) {
        let timeout = match (&next_deadline, &self.executor().timer) {
            (Some(deadline), Some(timer)) => Some(timer.time_until(deadline)),
            _ => None,
        };

        tracing::trace!(worker = self.id, ?timeout, "parking");
        let executor = self.executor().clone();
        let id = self.id;
        executor
            .parking_lot
            .park_unless(id, &self.parker, timeout, || {
                executor.is_shutdown()
                    || !executor.workers[id].local.is_empty()
                    || executor.workers[id].lifo.lock().unwrap().is_some()
                    || !executor.injector.is_empty()
            });
        tracing::trace!(worker = self.id, "unparked");
    }

    /// Release queued tasks on shutdown: everything still in this worker's
    /// queues is cancelled and dropped without being polled.
    fn drain_on_shutdown(&mut self) {
        let mut dropped = 0;

        if let Some(task) = self.shared().lifo.lock().unwrap().take() {
            task.mark_cancelled();
            task.poll();
            drop(task);
            dropped += 1;
        }

        while let Some(task) = self.shared().local.pop() {
            task.mark_cancelled();
            task.poll();
            drop(task);
            dropped += 1;
        }

        if dropped > 0 {
            tracing::debug!(worker = self.id, dropped, "dropped queued tasks on shutdown");
        }
    }
}

impl Drop for Worker {
    fn drop(&mut self) {
        self.executor().active_workers.fetch_sub(1, Ordering::AcqRel);
    }
}

/// Marker: the timer fired entries, go look for work.
struct Fired;

impl fmt::Debug for Worker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Worker")
            .field("id", &self.id)
            .field("tick", &self.tick)
            .field("is_stealing", &self.is_stealing)
            .finish_non_exhaustive()
    }
}

