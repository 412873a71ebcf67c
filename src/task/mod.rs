// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! Task representation and lifecycle.
//!
//! A spawned future is wrapped in a heap-allocated [`Task`] together with its
//! atomic lifecycle state, intrusive queue links and a slot for its eventual
//! output. The scheduler only ever sees type-erased, reference-counted
//! [`TaskRef`]s; the concrete future type is reached through a vtable.
//!
//! # Cancellation
//!
//! When a task is cancelled through [`JoinHandle::cancel`], it is woken one
//! final time; the next time a worker dequeues it, the future is dropped in
//! place without being polled and the task retires. Cancellation is
//! cooperative: a task that is mid-poll finishes that poll first, and a task
//! blocked on I/O is only retired once the scheduler sees it again. In every
//! case the task **is guaranteed not to be polled again** after the
//! cancellation is observed, and awaiting the [`JoinHandle`] yields a
//! [cancelled error].
//!
//! # Blocking & yielding
//!
//! Code running inside a task must not block its worker thread: no
//! synchronous I/O, no sleeping, no long-running computation without
//! [`yield_now`] breaks. Blocking closures belong on the blocking pool via
//! [`spawn_blocking`][crate::spawn_blocking].
//!
//! [cancelled error]: JoinError::is_cancelled

mod builder;
mod id;
mod join_handle;
mod state;
mod yield_now;

use core::any::type_name;
use core::mem::{self, MaybeUninit, offset_of};
use core::panic::AssertUnwindSafe;
use core::pin::Pin;
use core::ptr::NonNull;
use core::task::{Context, Poll, RawWaker, RawWakerVTable, Waker};
use core::{fmt, future::Future};

use cordyceps::{Linked, mpsc_queue};

use crate::loom::cell::UnsafeCell;
use crate::loom::sync::atomic::Ordering;
use crate::task::state::{JoinAction, StartPollAction, State, WakeByRefAction, WakeByValAction};
use crate::util::CachePadded;

pub use builder::TaskBuilder;
pub use id::Id;
pub use join_handle::{JoinError, JoinHandle};
pub use yield_now::yield_now;

/// A scheduler that tasks can be woken onto.
///
/// Cloned into every task at spawn time; the task's waker calls
/// [`Schedule::schedule`] to make the task eligible for another poll.
pub(crate) trait Schedule: Clone + Send + Sync + 'static {
    /// Make `task` eligible to be polled again.
    ///
    /// The `TaskRef` passed here owns one reference; the scheduler either
    /// enqueues it (the queue holds the reference) or drops it (e.g. during
    /// shutdown).
    fn schedule(&self, task: TaskRef);
}

/// Outcome of calling [`TaskRef::poll`].
///
/// Tells the scheduler how to proceed with the polled task.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum PollResult {
    /// The task has completed without a registered join waker.
    ///
    /// The scheduler can drop its [`TaskRef`].
    Ready,

    /// The task has completed and its join waker has been woken.
    ///
    /// The scheduler can drop its [`TaskRef`].
    ReadyJoined,

    /// The task is pending and was not woken during the poll.
    ///
    /// The scheduler can drop its [`TaskRef`]; whoever intends to wake the
    /// task later holds a clone of its [`Waker`].
    Pending,

    /// The task woke itself while it was being polled.
    ///
    /// The scheduler must re-enqueue the task rather than dropping the
    /// [`TaskRef`].
    PendingSchedule,
}

/// A type-erased, reference-counted pointer to a spawned [`Task`].
///
/// Once spawned, a `Task` is pinned in memory (futures must not move between
/// polls), so the scheduler passes around `TaskRef`s, plain pointers to the
/// pinned allocation, instead of the tasks themselves. All operations on the
/// underlying task go through its vtable, which keeps the scheduler
/// monomorphization-free: every spawned `async` block is its own unique type,
/// and without erasure each one would drag a full copy of the runtime's queue
/// and poll machinery through codegen.
///
/// The task is deallocated when the last `TaskRef` (including those hidden
/// inside [`Waker`]s and [`JoinHandle`]s) is dropped.
#[derive(Eq, PartialEq)]
pub(crate) struct TaskRef(NonNull<Header>);

#[repr(C)]
pub(crate) struct Task<F: Future, S>(CachePadded<TaskInner<F, S>>);

#[repr(C)]
struct TaskInner<F: Future, S> {
    /// This must be the first field of the `Task` struct!
    schedulable: Schedulable<S>,

    /// The future, or its output once it has completed.
    ///
    /// If `COMPLETE` is set, the `JoinHandle` has exclusive access to this
    /// field. Otherwise the `POLLING` bit functions as a lock: only the
    /// thread that set it may access the stage.
    stage: UnsafeCell<Stage<F>>,

    /// The waker of whoever is awaiting this task's [`JoinHandle`].
    ///
    /// Two sides race on this field: a worker completing the task *reads* it
    /// to wake the joiner, while the `JoinHandle` being polled *writes* it.
    /// The `JOIN_WAKER` sub-state of the task's state word arbitrates:
    ///
    /// 1. While it is `Empty`, the `JoinHandle` has exclusive (mutable)
    ///    access to the slot.
    /// 2. The `JoinHandle` writes by moving `Empty`/`Waiting` → `Registering`
    ///    (claiming the slot), storing the waker, then publishing with
    ///    `Registering` → `Waiting`.
    /// 3. A completing worker that observes `Waiting` consumes the slot
    ///    (resetting to `Empty`) and wakes the stored waker.
    /// 4. A completing worker that observes `Registering` spins until the
    ///    registration is published, then consumes the slot; the `JoinHandle`
    ///    only ever registers while `COMPLETE` is unset, so the window is a
    ///    few instructions.
    join_waker: UnsafeCell<Option<Waker>>,
}

#[repr(C)]
struct Schedulable<S> {
    /// This must be the first field of the `Schedulable` struct!
    header: Header,
    scheduler: S,
}

/// The current lifecycle stage of the future: the future itself, or its
/// output.
#[repr(C)] // https://github.com/rust-lang/miri/issues/3780
enum Stage<F: Future> {
    /// The future is still pending.
    Pending(F),

    /// The future has completed; its output (or panic payload) is ready to be
    /// taken by a `JoinHandle`, if one exists.
    Ready(Result<F::Output, JoinError<F::Output>>),

    /// The future has completed and the output has been taken, or the future
    /// was dropped on cancellation.
    Consumed,
}

#[derive(Debug)]
pub(crate) struct Header {
    /// The task's state word; accessed only with atomic instructions.
    state: State,
    /// The vtable for this task's concrete future type.
    vtable: &'static VTable,
    /// The task's ID.
    id: Id,
    /// Links into the intrusive injection queue.
    run_queue_links: mpsc_queue::Links<Self>,
    /// The tracing span associated with this task.
    span: tracing::Span,
}

#[derive(Debug)]
struct VTable {
    /// Poll the future, returning what the scheduler should do with the task.
    poll: unsafe fn(NonNull<Header>) -> PollResult,

    /// Poll for the task's completion on behalf of its `JoinHandle`, writing
    /// the output to `outptr` if it has completed; otherwise the waker from
    /// `cx` is registered to be woken on completion.
    #[expect(clippy::type_complexity, reason = "splitting into aliases obscures more than it helps")]
    poll_join: unsafe fn(
        ptr: NonNull<Header>,
        outptr: NonNull<()>,
        cx: &mut Context<'_>,
    ) -> Poll<Result<(), JoinError<()>>>,

    /// Drops the task and deallocates its memory.
    deallocate: unsafe fn(NonNull<Header>),

    /// The `wake_by_ref` function from the task's [`RawWakerVTable`].
    ///
    /// Duplicated here so cancelled tasks can be woken through a [`TaskRef`]
    /// or [`JoinHandle`] without constructing a full waker.
    wake_by_ref: unsafe fn(*const ()),
}

// === impl TaskRef ===

impl TaskRef {
    #[track_caller]
    pub(crate) fn new_allocated<F, S>(task: Box<Task<F, S>>) -> (Self, JoinHandle<F::Output>)
    where
        F: Future,
        S: Schedule,
    {
        assert_eq!(task.state().load(Ordering::Relaxed).ref_count(), 1);
        let ptr = Box::into_raw(task);

        // Safety: we just allocated the ptr so it is never null
        let task = Self(unsafe { NonNull::new_unchecked(ptr).cast() });
        let join = JoinHandle::new(task.clone());

        (task, join)
    }

    /// Allocate the placeholder node an intrusive MPSC run queue needs to
    /// seed itself with.
    ///
    /// Unlike a real spawn this hands out no [`JoinHandle`]: nothing ever
    /// polls or joins the stub, the queue merely owns (and eventually frees)
    /// it.
    pub(crate) fn new_stub() -> Self {
        let stub = Box::into_raw(Box::new(Task::new_stub()));

        // Safety: `Box::into_raw` never returns null
        Self(unsafe { NonNull::new_unchecked(stub).cast() })
    }

    /// Returns the task's unique[^1] identifier.
    ///
    /// [^1]: Unique among all tasks spawned by this process.
    pub(crate) fn id(&self) -> Id {
        self.header().id
    }

    /// Returns `true` when this task has run to completion (or has been
    /// retired after cancellation).
    pub(crate) fn is_complete(&self) -> bool {
        self.state()
            .load(Ordering::Acquire)
            .get(state::Snapshot::COMPLETE)
    }

    /// Cancels the task.
    ///
    /// Returns `true` if this call cancelled the task.
    pub(crate) fn cancel(&self) -> bool {
        let cancelled = self.state().cancel();

        // wake the task so a worker dequeues it and retires it, dropping the
        // future.
        if cancelled {
            tracing::trace!(task.id = %self.id(), "woke cancelled task");
            self.wake_by_ref();
        }

        cancelled
    }

    /// Set the cancelled bit without waking the task; used on shutdown
    /// paths, where the task is about to be dropped rather than re-enqueued.
    pub(crate) fn mark_cancelled(&self) {
        self.state().cancel();
    }

    /// Record that this task is about to be enqueued for the first time; see
    /// [`state::State::mark_spawned`].
    pub(crate) fn mark_spawned(&self) {
        self.state().mark_spawned();
    }

    pub(crate) fn header_ptr(&self) -> NonNull<Header> {
        self.0
    }

    pub(crate) fn header(&self) -> &Header {
        // Safety: the constructors ensure the pointer is always valid
        unsafe { self.0.as_ref() }
    }

    pub(crate) fn state(&self) -> &State {
        &self.header().state
    }

    pub(crate) fn wake_by_ref(&self) {
        let wake_by_ref_fn = self.header().vtable.wake_by_ref;
        // Safety: called through the task's vtable, which matches its type
        unsafe { wake_by_ref_fn(self.0.as_ptr().cast::<()>()) }
    }

    pub(crate) fn poll(&self) -> PollResult {
        let poll_fn = self.header().vtable.poll;
        // Safety: called through the task's vtable, which matches its type
        unsafe { poll_fn(self.0) }
    }

    /// # Safety
    ///
    /// `T` must be the output type this `TaskRef` was created with.
    pub(crate) unsafe fn poll_join<T>(
        &self,
        cx: &mut Context<'_>,
    ) -> Poll<Result<T, JoinError<T>>> {
        let poll_join_fn = self.header().vtable.poll_join;
        let mut slot = MaybeUninit::<Result<T, JoinError<T>>>::uninit();

        // Safety: the caller promises `T` is the right type, and the slot
        // pointer is valid for the duration of the call
        let result = unsafe { poll_join_fn(self.0, NonNull::from(&mut slot).cast::<()>(), cx) };

        result.map(|result| match result {
            // Safety: `Ok` means the output was written to the slot.
            Ok(()) => unsafe { slot.assume_init_read() },
            Err(e) => {
                let output = if e.is_completed() {
                    // Safety: the task completed before it was cancelled, so
                    // the output was still written to the slot.
                    match unsafe { slot.assume_init_read() } {
                        Ok(output) => Some(output),
                        // the future panicked before the cancellation landed;
                        // the cancellation error wins.
                        Err(_) => None,
                    }
                } else {
                    None
                };
                Err(e.with_output(output))
            }
        })
    }
}

impl fmt::Debug for TaskRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TaskRef")
            .field("id", &self.id())
            .field("addr", &self.0)
            .finish()
    }
}

impl fmt::Pointer for TaskRef {
    #[inline]
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Pointer::fmt(&self.0, f)
    }
}

impl Clone for TaskRef {
    #[inline]
    #[track_caller]
    fn clone(&self) -> Self {
        self.state().clone_ref();
        Self(self.0)
    }
}

impl Drop for TaskRef {
    #[inline]
    #[track_caller]
    fn drop(&mut self) {
        if !self.state().drop_ref() {
            return;
        }

        let deallocate = self.header().vtable.deallocate;
        // Safety: `drop_ref` returning `true` means we held the last
        // reference, so nothing can observe the task anymore
        unsafe {
            deallocate(self.0);
        }
    }
}

// Safety: the state protocol synchronizes all access to the inner task
unsafe impl Send for TaskRef {}
// Safety: the state protocol synchronizes all access to the inner task
unsafe impl Sync for TaskRef {}

// === impl Task ===

impl<F, S> Task<F, S>
where
    F: Future,
    S: Schedule,
{
    const TASK_VTABLE: VTable = VTable {
        poll: Self::poll,
        poll_join: Self::poll_join,
        deallocate: Self::deallocate,
        wake_by_ref: Schedulable::<S>::wake_by_ref,
    };

    pub(crate) fn new(scheduler: S, future: F, task_id: Id, span: tracing::Span) -> Self {
        let inner = TaskInner {
            schedulable: Schedulable {
                header: Header {
                    state: State::new(),
                    vtable: &Self::TASK_VTABLE,
                    id: task_id,
                    run_queue_links: mpsc_queue::Links::new(),
                    span,
                },
                scheduler,
            },
            stage: UnsafeCell::new(Stage::Pending(future)),
            join_waker: UnsafeCell::new(None),
        };
        Self(CachePadded(inner))
    }

    /// Poll the future, returning what the scheduler should do with the task.
    ///
    /// This is a type-erased function called through the task's [`VTable`].
    ///
    /// # Safety
    ///
    /// `ptr` must point to the [`Header`] of a task with the same `F` and `S`
    /// type parameters as `Self`.
    unsafe fn poll(ptr: NonNull<Header>) -> PollResult {
        // Safety: ensured by caller
        unsafe {
            let this = ptr.cast::<Self>().as_ref();

            tracing::trace!(
                task.addr = ?ptr,
                task.output = type_name::<F::Output>(),
                task.id = %this.id(),
                "Task::poll",
            );

            match this.state().start_poll() {
                StartPollAction::Poll => {}
                StartPollAction::DontPoll => {
                    tracing::warn!(task.addr = ?ptr, "failed to transition to polling");
                    return PollResult::Ready;
                }
                StartPollAction::Cancelled { wake_join_waker } => {
                    tracing::trace!(task.addr = ?ptr, "task cancelled, dropping future");
                    // the winner of the cancelled transition has exclusive
                    // stage access; drop the future in place without polling.
                    this.0.0.stage.with_mut(|stage| {
                        *stage = Stage::Consumed;
                    });
                    return if wake_join_waker {
                        this.wake_join_waker();
                        PollResult::ReadyJoined
                    } else {
                        PollResult::Ready
                    };
                }
            }

            // wrap the waker in `ManuallyDrop`: it is converted from the
            // existing task ref rather than a fresh reference, so if the
            // future consumes it during the poll we must not decrement the
            // count when the poll ends.
            let waker = {
                let raw = Schedulable::<S>::raw_waker(ptr.as_ptr().cast());
                mem::ManuallyDrop::new(Waker::from_raw(raw))
            };

            let poll = {
                let cx = Context::from_waker(&waker);
                this.poll_inner(cx)
            };

            let result = this.state().end_poll(poll.is_ready());

            if result == PollResult::ReadyJoined {
                this.wake_join_waker();
            }

            result
        }
    }

    /// Poll for the task's completion on behalf of its [`JoinHandle`], taking
    /// the output if the task has completed.
    ///
    /// This is a type-erased function called through the task's [`VTable`].
    ///
    /// # Safety
    ///
    /// - `ptr` must point to the [`Header`] of a task with the same `F` and
    ///   `S` type parameters as `Self`.
    /// - `outptr` must point to a valid
    ///   `MaybeUninit<Result<F::Output, JoinError<F::Output>>>`.
    unsafe fn poll_join(
        ptr: NonNull<Header>,
        outptr: NonNull<()>,
        cx: &mut Context<'_>,
    ) -> Poll<Result<(), JoinError<()>>> {
        // Safety: ensured by caller
        unsafe {
            let this = ptr.cast::<Self>().as_ref();
            tracing::trace!(
                task.addr = ?ptr,
                task.output = type_name::<F::Output>(),
                task.id = %this.id(),
                "Task::poll_join"
            );

            match this.state().try_join() {
                JoinAction::TakeOutput => {
                    // Safety: `TakeOutput` grants exclusive permission to
                    // read the output.
                    this.take_output(outptr);
                    return Poll::Ready(Ok(()));
                }
                JoinAction::Canceled { completed } => {
                    // if the task completed before it was cancelled, the
                    // output can still be salvaged into the `JoinError`.
                    if completed {
                        this.take_output(outptr);
                    }
                    return Poll::Ready(Err(JoinError::cancelled(completed, this.id())));
                }
                JoinAction::Register => {
                    this.0.0.join_waker.with_mut(|waker| {
                        (*waker) = Some(cx.waker().clone());
                    });
                }
                JoinAction::Reregister => {
                    this.0.0.join_waker.with_mut(|waker| {
                        let waker = (*waker).as_mut().expect("join waker must be registered");

                        let new_waker = cx.waker();
                        if !waker.will_wake(new_waker) {
                            *waker = new_waker.clone();
                        }
                    });
                }
            }
            this.state().join_waker_registered();
            Poll::Pending
        }
    }

    /// Drops the task and deallocates its memory.
    ///
    /// This is a type-erased function called through the task's [`VTable`].
    ///
    /// # Safety
    ///
    /// `ptr` must point to the [`Header`] of a task with the same `F` and `S`
    /// type parameters as `Self`, and the task's reference count must be
    /// zero.
    unsafe fn deallocate(ptr: NonNull<Header>) {
        // Safety: ensured by caller
        unsafe {
            let this = ptr.cast::<Self>();
            tracing::trace!(
                task.addr = ?ptr,
                task.id = %this.as_ref().id(),
                "Task::deallocate",
            );
            debug_assert_eq!(
                ptr.as_ref().state.load(Ordering::Acquire).ref_count(),
                0,
                "a task may not be deallocated while its ref count is greater than zero!"
            );
            drop(Box::from_raw(this.as_ptr()));
        }
    }

    /// Polls the future, writing the output (or the caught panic) into the
    /// stage field on completion.
    ///
    /// # Safety
    ///
    /// The caller must have exclusive access to the task's stage field, i.e.
    /// it must have won the transition to `POLLING`.
    unsafe fn poll_inner(&self, mut cx: Context<'_>) -> Poll<()> {
        let _span = self.span().enter();

        self.0.0.stage.with_mut(|stage| {
            // Safety: ensured by caller
            let stage = unsafe { &mut *stage };
            stage.poll(&mut cx, self.id())
        })
    }

    /// Wakes the task's join waker, if one is registered.
    ///
    /// # Safety
    ///
    /// The caller must have consumed the `JOIN_WAKER` sub-state (the state
    /// transitions guarantee exclusive access to the slot).
    unsafe fn wake_join_waker(&self) {
        self.0.0.join_waker.with_mut(|waker| {
            // Safety: ensured by caller
            if let Some(join_waker) = unsafe { (*waker).take() } {
                tracing::trace!(task.id = %self.id(), "waking join waker");
                join_waker.wake();
            } else {
                tracing::trace!(task.id = %self.id(), "no join waker registered");
            }
        });
    }

    /// # Safety
    ///
    /// The caller must have exclusive permission to take the output, and
    /// `dst` must point to a valid
    /// `MaybeUninit<Result<F::Output, JoinError<F::Output>>>`.
    unsafe fn take_output(&self, dst: NonNull<()>) {
        self.0.0.stage.with_mut(|stage| {
            // Safety: ensured by caller
            unsafe {
                match mem::replace(&mut *stage, Stage::Consumed) {
                    Stage::Ready(output) => {
                        let dst = dst
                            .cast::<MaybeUninit<Result<F::Output, JoinError<F::Output>>>>()
                            .as_mut();

                        dst.write(output);
                    }
                    _ => panic!("JoinHandle polled after completion"),
                }
            }
        });
    }

    fn id(&self) -> Id {
        self.0.0.schedulable.header.id
    }

    fn state(&self) -> &State {
        &self.0.0.schedulable.header.state
    }

    #[inline]
    fn span(&self) -> &tracing::Span {
        &self.0.0.schedulable.header.span
    }
}

// === impl Stage ===

impl<F> Stage<F>
where
    F: Future,
{
    fn poll(&mut self, cx: &mut Context<'_>, id: Id) -> Poll<()> {
        struct Guard<'a, T: Future> {
            stage: &'a mut Stage<T>,
        }
        impl<T: Future> Drop for Guard<'_, T> {
            fn drop(&mut self) {
                // if the future panics during the poll, it is dropped inside
                // the panic guard rather than poisoning the stage.
                *self.stage = Stage::Consumed;
            }
        }

        let poll = AssertUnwindSafe(|| -> Poll<F::Output> {
            let guard = Guard { stage: self };

            let Stage::Pending(future) = guard.stage else {
                unreachable!("polled a task whose future no longer exists");
            };

            // Safety: tasks are pinned in their heap allocation and never
            // moved out of it.
            let future = unsafe { Pin::new_unchecked(future) };
            let res = future.poll(cx);
            mem::forget(guard);
            res
        });

        // panics raised by user futures stop here; the worker is not
        // poisoned and the payload travels to the `JoinHandle`.
        match std::panic::catch_unwind(poll) {
            Ok(Poll::Pending) => Poll::Pending,
            Ok(Poll::Ready(ready)) => {
                *self = Stage::Ready(Ok(ready));
                Poll::Ready(())
            }
            Err(err) => {
                *self = Stage::Ready(Err(JoinError::panic(id, err)));
                Poll::Ready(())
            }
        }
    }
}

// === impl Schedulable ===

impl<S: Schedule> Schedulable<S> {
    const WAKER_VTABLE: RawWakerVTable = RawWakerVTable::new(
        Self::clone_waker,
        Self::wake_by_val,
        Self::wake_by_ref,
        Self::drop_waker,
    );

    // `Waker::will_wake` is used all over the place to optimize waker code
    // (e.g. only replace a stored waker when it targets a different task).
    // `will_wake` compares vtable pointers, and if this function were inlined
    // the `WAKER_VTABLE` reference could be duplicated per call site, making
    // a waker compare unequal to its own clone. Not a correctness problem,
    // but a lot of unnecessary wakeups; the `inline(never)` is load-bearing.
    #[inline(never)]
    fn raw_waker(this: *const Self) -> RawWaker {
        RawWaker::new(this.cast::<()>(), &Self::WAKER_VTABLE)
    }

    #[inline(always)]
    fn state(&self) -> &State {
        &self.header.state
    }

    unsafe fn schedule(this: TaskRef) {
        // Safety: ensured by caller
        unsafe {
            this.header_ptr()
                .cast::<Self>()
                .as_ref()
                .scheduler
                .schedule(this);
        }
    }

    #[inline]
    unsafe fn drop_ref(this: NonNull<Self>) {
        // Safety: ensured by caller
        unsafe {
            if !this.as_ref().state().drop_ref() {
                return;
            }

            let deallocate = this.as_ref().header.vtable.deallocate;
            deallocate(this.cast::<Header>());
        }
    }

    // === waker vtable methods ===

    unsafe fn wake_by_val(ptr: *const ()) {
        // Safety: called through the raw waker vtable
        unsafe {
            let ptr = ptr.cast::<Self>();
            tracing::trace!(
                target: "riptide::waker",
                { task.addr = ?ptr, task.id = (*ptr).header.id.as_u64() },
                "Task::wake_by_val"
            );

            let this = NonNull::new_unchecked(ptr.cast_mut());
            match this.as_ref().header.state.wake_by_val() {
                WakeByValAction::Enqueue => {
                    // the state transition does *not* decrement the reference
                    // count: the waker's reference is handed to the queue so
                    // the task cannot be freed while it is being scheduled.
                    Self::schedule(TaskRef(this.cast::<Header>()));
                }
                WakeByValAction::Release => Self::drop_ref(this),
                WakeByValAction::None => {}
            }
        }
    }

    unsafe fn wake_by_ref(ptr: *const ()) {
        // Safety: called through the raw waker vtable
        unsafe {
            let this = ptr.cast::<Self>();
            tracing::trace!(
                target: "riptide::waker",
                { task.addr = ?this, task.id = (*this).header.id.as_u64() },
                "Task::wake_by_ref"
            );

            let this = NonNull::new_unchecked(this.cast_mut());
            if this.as_ref().state().wake_by_ref() == WakeByRefAction::Enqueue {
                // the `Enqueue` transition added a reference for the queue.
                Self::schedule(TaskRef(this.cast::<Header>()));
            }
        }
    }

    unsafe fn clone_waker(ptr: *const ()) -> RawWaker {
        // Safety: called through the raw waker vtable
        unsafe {
            let ptr = ptr.cast::<Self>();
            (*ptr).header.state.clone_ref();
            Self::raw_waker(ptr)
        }
    }

    unsafe fn drop_waker(ptr: *const ()) {
        // Safety: called through the raw waker vtable
        unsafe {
            let ptr = ptr.cast::<Self>();
            Self::drop_ref(NonNull::new_unchecked(ptr.cast_mut()));
        }
    }
}

// === impl Header ===

// Safety: tasks are pinned in memory (a requirement for polling them), and
// enqueuing transfers ownership of one reference to the queue, so the
// allocation outlives its queue membership.
unsafe impl Linked<mpsc_queue::Links<Header>> for Header {
    type Handle = TaskRef;

    fn into_ptr(task: Self::Handle) -> NonNull<Self> {
        let ptr = task.0;
        // enqueuing hands the `TaskRef`'s reference to the queue; don't run
        // its `Drop`.
        mem::forget(task);
        ptr
    }

    unsafe fn from_ptr(ptr: NonNull<Self>) -> Self::Handle {
        TaskRef(ptr)
    }

    unsafe fn links(ptr: NonNull<Self>) -> NonNull<mpsc_queue::Links<Self>> {
        // Safety: `ptr` points to a live `Header` per the trait contract
        ptr.map_addr(|addr| {
            let offset = offset_of!(Self, run_queue_links);
            addr.checked_add(offset).unwrap()
        })
        .cast()
    }
}

/// The future type of the heap-allocated queue stub task. Never polled; it
/// only exists to give the stub task's generics something to chew on.
#[derive(Copy, Clone, Debug)]
pub(crate) struct Stub;

impl Future for Stub {
    type Output = ();
    fn poll(self: Pin<&mut Self>, _: &mut Context<'_>) -> Poll<Self::Output> {
        unreachable!("the stub task should never be polled!")
    }
}

impl Schedule for Stub {
    fn schedule(&self, _: TaskRef) {
        unimplemented!("the stub scheduler should never be called!");
    }
}

impl Task<Stub, Stub> {
    const STUB_VTABLE: VTable = VTable {
        poll: stub_poll,
        poll_join: stub_poll_join,
        // heap-allocated stub tasks *do* need to be deallocated: the queue
        // drops its stub when the queue itself is dropped.
        deallocate: Self::deallocate,
        wake_by_ref: stub_wake_by_ref,
    };

    /// Create a new stub task for seeding an intrusive MPSC queue.
    pub(crate) fn new_stub() -> Self {
        let inner = TaskInner {
            schedulable: Schedulable {
                header: Header {
                    state: State::new(),
                    vtable: &Self::STUB_VTABLE,
                    id: Id::stub(),
                    run_queue_links: mpsc_queue::Links::new_stub(),
                    span: tracing::Span::none(),
                },
                scheduler: Stub,
            },
            stage: UnsafeCell::new(Stage::Pending(Stub)),
            join_waker: UnsafeCell::new(None),
        };

        Self(CachePadded(inner))
    }
}

unsafe fn stub_poll(ptr: NonNull<Header>) -> PollResult {
    // Safety: this method should never be called
    unsafe {
        debug_assert!(ptr.as_ref().id.is_stub());
        unreachable!("stub task ({ptr:?}) should never be polled!");
    }
}

unsafe fn stub_poll_join(
    ptr: NonNull<Header>,
    _outptr: NonNull<()>,
    _cx: &mut Context<'_>,
) -> Poll<Result<(), JoinError<()>>> {
    // Safety: this method should never be called
    unsafe {
        debug_assert!(ptr.as_ref().id.is_stub());
        unreachable!("stub task ({ptr:?}) should never be polled!");
    }
}

unsafe fn stub_wake_by_ref(ptr: *const ()) {
    unreachable!("stub task ({ptr:p}) has no waker and should never be woken!");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::loom::sync::Mutex;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering as AtomicOrdering};

    /// A scheduler that drops every task handed to it; for tests that drive
    /// tasks manually through their `TaskRef`.
    #[derive(Clone)]
    struct NopSchedule;

    impl Schedule for NopSchedule {
        fn schedule(&self, task: TaskRef) {
            drop(task);
        }
    }

    fn harness<F>(future: F) -> (TaskRef, JoinHandle<F::Output>)
    where
        F: Future + Send + 'static,
        F::Output: Send,
    {
        let task = Box::new(Task::new(
            NopSchedule,
            future,
            Id::next(),
            tracing::Span::none(),
        ));
        TaskRef::new_allocated(task)
    }

    #[test]
    fn ready_future_completes_in_one_poll() {
        let (task, join) = harness(async { 42u32 });

        assert!(!task.is_complete());
        assert_eq!(task.poll(), PollResult::ReadyJoined);
        assert!(task.is_complete());

        drop(join);
    }

    #[test]
    fn yield_now_reschedules_once() {
        let (task, _join) = harness(async {
            yield_now().await;
        });

        // the yield wakes the task from inside its own poll
        assert_eq!(task.poll(), PollResult::PendingSchedule);
        // and only once
        assert_eq!(task.poll(), PollResult::ReadyJoined);
    }

    #[test]
    fn waker_clones_balance_refcount() {
        let wakers: Arc<Mutex<Vec<std::task::Waker>>> = Arc::new(Mutex::new(Vec::new()));

        let stash = wakers.clone();
        let (task, _join) = harness(async move {
            futures::future::poll_fn(move |cx| {
                let mut stash = stash.lock().unwrap();
                if stash.is_empty() {
                    for _ in 0..3 {
                        stash.push(cx.waker().clone());
                    }
                    Poll::Pending
                } else {
                    Poll::Ready(())
                }
            })
            .await;
        });

        let before = task.state().load(Ordering::Relaxed).ref_count();
        assert_eq!(task.poll(), PollResult::Pending);
        assert_eq!(
            task.state().load(Ordering::Relaxed).ref_count(),
            before + 3,
            "each waker clone holds a reference"
        );

        wakers.lock().unwrap().clear();
        assert_eq!(
            task.state().load(Ordering::Relaxed).ref_count(),
            before,
            "dropping all clones restores the count"
        );
    }

    #[test]
    fn cancelled_task_drops_future_without_polling() {
        struct DropTracker(Arc<AtomicUsize>);
        impl Drop for DropTracker {
            fn drop(&mut self) {
                self.0.fetch_add(1, AtomicOrdering::SeqCst);
            }
        }

        let drops = Arc::new(AtomicUsize::new(0));
        let polls = Arc::new(AtomicUsize::new(0));

        let tracker = DropTracker(drops.clone());
        let poll_count = polls.clone();
        let (task, _join) = harness(async move {
            let _tracker = tracker;
            futures::future::poll_fn(|_| {
                poll_count.fetch_add(1, AtomicOrdering::SeqCst);
                Poll::<()>::Pending
            })
            .await;
        });

        assert_eq!(task.poll(), PollResult::Pending);
        assert_eq!(polls.load(AtomicOrdering::SeqCst), 1);
        assert_eq!(drops.load(AtomicOrdering::SeqCst), 0);

        assert!(task.cancel());

        // retiring the task drops the future in place without polling it
        assert_eq!(task.poll(), PollResult::Ready);
        assert_eq!(polls.load(AtomicOrdering::SeqCst), 1);
        assert_eq!(drops.load(AtomicOrdering::SeqCst), 1);
    }

    #[test]
    fn panic_is_contained() {
        let (task, _join) = harness(async {
            panic!("boom");
        });

        // the panic is caught at the task boundary; the worker would carry on
        assert_eq!(task.poll(), PollResult::ReadyJoined);
        assert!(task.is_complete());
    }
}
