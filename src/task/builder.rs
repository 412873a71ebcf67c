// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

use core::any::type_name;
use core::future::Future;
use core::panic::Location;

use crate::task::id::Id;
use crate::task::join_handle::JoinHandle;
use crate::task::{Schedule, Task, TaskRef};

/// Configures tasks prior to spawning them: name, kind, and source location
/// metadata that ends up in the task's tracing span.
pub struct TaskBuilder<'a, S> {
    location: Option<Location<'a>>,
    name: Option<&'a str>,
    kind: &'a str,
    scheduler: S,
}

impl<'a, S> TaskBuilder<'a, S> {
    /// Override the name of tasks spawned by this builder.
    ///
    /// By default, tasks are unnamed.
    pub fn name(mut self, name: &'a str) -> Self {
        self.name = Some(name);
        self
    }

    /// Override the kind string of tasks spawned by this builder; this only
    /// shows up in debug messages and spans.
    ///
    /// By default, tasks are of kind `"task"`.
    pub fn kind(mut self, kind: &'a str) -> Self {
        self.kind = kind;
        self
    }

    /// Override the source code location associated with tasks spawned by
    /// this builder.
    ///
    /// By default, tasks record the location they were first spawned from.
    pub fn location(mut self, location: Location<'a>) -> Self {
        self.location = Some(location);
        self
    }
}

impl<'a, S> TaskBuilder<'a, S>
where
    S: Schedule,
{
    pub(crate) fn new(scheduler: S) -> Self {
        Self {
            location: None,
            name: None,
            kind: "task",
            scheduler,
        }
    }

    /// Allocate a task for `future`, returning the [`TaskRef`] to hand to a
    /// scheduler together with the [`JoinHandle`] for its output.
    #[inline]
    #[track_caller]
    pub(crate) fn build<F>(&self, future: F) -> (TaskRef, JoinHandle<F::Output>)
    where
        F: Future + Send,
        F::Output: Send,
    {
        let id = Id::next();

        let loc = self.location.as_ref().unwrap_or(Location::caller());
        let span = tracing::trace_span!(
            "task",
            task.id = id.as_u64(),
            task.name = ?self.name,
            task.kind = self.kind,
            task.output = %type_name::<F::Output>(),
            loc.file = loc.file(),
            loc.line = loc.line(),
            loc.col = loc.column(),
        );

        let task = Box::new(Task::new(self.scheduler.clone(), future, id, span));
        let (task, join) = TaskRef::new_allocated(task);

        // the caller enqueues the returned `TaskRef`; the woken bit keeps a
        // concurrent wake (e.g. an early cancellation) from enqueueing the
        // task a second time before its first poll.
        task.mark_spawned();

        (task, join)
    }
}

impl TaskBuilder<'_, crate::runtime::Handle> {
    /// Spawn `future` onto the runtime with this builder's configuration.
    ///
    /// # Errors
    ///
    /// Fails with [`SpawnError`][crate::SpawnError] when the runtime has
    /// begun shutting down.
    #[inline]
    #[track_caller]
    pub fn spawn<F>(
        self,
        future: F,
    ) -> Result<JoinHandle<F::Output>, crate::SpawnError>
    where
        F: Future + Send + 'static,
        F::Output: Send + 'static,
    {
        if self.scheduler.executor.is_shutdown() {
            return Err(crate::SpawnError::Shutdown);
        }

        let (task, join) = self.build(future);
        self.scheduler.executor.schedule_spawn(task);
        Ok(join)
    }
}
