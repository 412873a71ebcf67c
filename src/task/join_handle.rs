// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

use core::any::Any;
use core::fmt;
use core::future::Future;
use core::marker::PhantomData;
use core::panic::{RefUnwindSafe, UnwindSafe};
use core::pin::Pin;
use core::task::{Context, Poll};

use crate::task::{Id, TaskRef};

/// An owned permission to await (and cancel) a spawned task.
///
/// Awaiting the handle yields the task's output, or a [`JoinError`] if the
/// task was cancelled or its future panicked. Dropping the handle *detaches*
/// the task: it keeps running to completion and its output is discarded.
pub struct JoinHandle<T> {
    state: JoinHandleState,
    id: Id,
    _p: PhantomData<T>,
}
static_assertions::assert_impl_all!(JoinHandle<()>: Send);

#[derive(Debug)]
enum JoinHandleState {
    /// The handle refers to a live (or completed but unconsumed) task.
    Task(TaskRef),
    /// The output has been consumed; the handle is spent.
    Empty,
}

/// Error returned by awaiting a [`JoinHandle`].
pub struct JoinError<T> {
    kind: JoinErrorKind,
    id: Id,
    output: Option<T>,
}

#[derive(Debug)]
enum JoinErrorKind {
    Cancelled { completed: bool },
    Panic(Box<dyn Any + Send + 'static>),
}

// === impl JoinHandle ===

impl<T> UnwindSafe for JoinHandle<T> {}

impl<T> RefUnwindSafe for JoinHandle<T> {}

impl<T> Unpin for JoinHandle<T> {}

impl<T> JoinHandle<T> {
    pub(crate) fn new(task: TaskRef) -> Self {
        task.state().create_join_handle();

        Self {
            id: task.id(),
            state: JoinHandleState::Task(task),
            _p: PhantomData,
        }
    }

    /// Cancels the task this handle refers to.
    ///
    /// The task will not be polled again; the next time the scheduler sees
    /// it, its future is dropped in place. Awaiting the handle afterwards
    /// yields a [cancelled `JoinError`][JoinError::is_cancelled].
    ///
    /// Returns `true` if this call cancelled the task (i.e. it had not
    /// already completed or been cancelled).
    pub fn cancel(&self) -> bool {
        match self.state {
            JoinHandleState::Task(ref task) => task.cancel(),
            JoinHandleState::Empty => false,
        }
    }

    /// Alias for [`JoinHandle::cancel`].
    pub fn abort(&self) -> bool {
        self.cancel()
    }

    /// Returns `true` when the task has run to completion (or was retired
    /// after cancellation).
    #[inline]
    #[must_use]
    pub fn is_complete(&self) -> bool {
        match self.state {
            JoinHandleState::Task(ref task) => task.is_complete(),
            // the `TaskRef` is only consumed when the handle's poll returned
            // `Ready`, so the task has definitely completed.
            JoinHandleState::Empty => true,
        }
    }

    /// Returns the [`Id`] of the task this handle refers to.
    pub fn id(&self) -> Id {
        self.id
    }
}

impl<T> Drop for JoinHandle<T> {
    fn drop(&mut self) {
        // if the handle was not consumed, clear the join-interest flag so the
        // completing side doesn't try to wake anyone.
        if let JoinHandleState::Task(ref task) = self.state {
            tracing::trace!(task.id = %task.id(), consumed = false, "drop JoinHandle");
            task.state().drop_join_handle();
        }
    }
}

impl<T> fmt::Debug for JoinHandle<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("JoinHandle")
            .field("output", &core::any::type_name::<T>())
            .field("task", &self.state)
            .field("id", &self.id)
            .finish()
    }
}

impl<T> Future for JoinHandle<T> {
    type Output = Result<T, JoinError<T>>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.get_mut();
        let task = match core::mem::replace(&mut this.state, JoinHandleState::Empty) {
            JoinHandleState::Task(task) => task,
            JoinHandleState::Empty => {
                panic!("JoinHandle polled after completion")
            }
        };

        // Safety: the `JoinHandle` was constructed with the task's actual
        // output type.
        let poll = unsafe { task.poll_join::<T>(cx) };

        if poll.is_pending() {
            this.state = JoinHandleState::Task(task);
        } else {
            // the output (or error) has been taken; release join interest.
            task.state().drop_join_handle();
        }
        poll
    }
}

// === impl JoinError ===

impl JoinError<()> {
    pub(crate) fn cancelled(completed: bool, id: Id) -> Self {
        Self {
            kind: JoinErrorKind::Cancelled { completed },
            id,
            output: None,
        }
    }

    pub(crate) fn with_output<T>(self, output: Option<T>) -> JoinError<T> {
        JoinError {
            kind: self.kind,
            id: self.id,
            output,
        }
    }
}

impl<T> JoinError<T> {
    pub(crate) fn panic(id: Id, err: Box<dyn Any + Send + 'static>) -> Self {
        Self {
            kind: JoinErrorKind::Panic(err),
            id,
            output: None,
        }
    }

    /// Returns `true` if the task completed successfully *before* the
    /// cancellation was observed; its output is available via
    /// [`JoinError::output`].
    pub fn is_completed(&self) -> bool {
        matches!(&self.kind, JoinErrorKind::Cancelled { completed: true })
    }

    /// Returns `true` if the error was caused by the task being cancelled.
    pub fn is_cancelled(&self) -> bool {
        matches!(&self.kind, JoinErrorKind::Cancelled { .. })
    }

    /// Returns `true` if the error was caused by the task's future panicking.
    pub fn is_panic(&self) -> bool {
        matches!(&self.kind, JoinErrorKind::Panic(_))
    }

    /// Consumes the error, returning the payload the task panicked with.
    ///
    /// # Panics
    ///
    /// Panics if the error does not represent a panicked task; check with
    /// [`JoinError::is_panic`] first, or use [`JoinError::try_into_panic`].
    #[track_caller]
    pub fn into_panic(self) -> Box<dyn Any + Send + 'static> {
        self.try_into_panic()
            .expect("`JoinError` reason is not a panic")
    }

    /// Consumes the error, returning the panic payload if the task panicked,
    /// or `self` otherwise.
    pub fn try_into_panic(self) -> Result<Box<dyn Any + Send + 'static>, Self> {
        match self.kind {
            JoinErrorKind::Panic(p) => Ok(p),
            JoinErrorKind::Cancelled { .. } => Err(self),
        }
    }

    /// Returns the [`Id`] of the task that errored.
    pub fn id(&self) -> Id {
        self.id
    }

    /// Returns the task's output, if it completed successfully before it was
    /// cancelled.
    pub fn output(self) -> Option<T> {
        self.output
    }
}

fn payload_as_str<'a>(payload: &'a (dyn Any + Send + 'static)) -> &'a str {
    if let Some(s) = payload.downcast_ref::<&'static str>() {
        s
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.as_str()
    } else {
        "<non-string panic payload>"
    }
}

impl<T> fmt::Display for JoinError<T> {
    fn fmt(&self, fmt: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.kind {
            JoinErrorKind::Cancelled { completed: false } => {
                write!(fmt, "task {} was cancelled before completion", self.id)
            }
            JoinErrorKind::Cancelled { completed: true } => {
                write!(fmt, "task {} was cancelled after completion", self.id)
            }
            JoinErrorKind::Panic(p) => {
                write!(
                    fmt,
                    "task {} panicked with message {:?}",
                    self.id,
                    payload_as_str(&**p)
                )
            }
        }
    }
}

impl<T> fmt::Debug for JoinError<T> {
    fn fmt(&self, fmt: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.kind {
            JoinErrorKind::Cancelled { completed } => write!(
                fmt,
                "JoinError::Cancelled({:?}, completed: {completed})",
                self.id
            ),
            JoinErrorKind::Panic(p) => {
                write!(
                    fmt,
                    "JoinError::Panic({:?}, {:?}, ...)",
                    self.id,
                    payload_as_str(&**p)
                )
            }
        }
    }
}

impl<T> core::error::Error for JoinError<T> {}
