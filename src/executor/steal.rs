// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

use core::fmt::Debug;

use cordyceps::{MpscQueue, mpsc_queue};

use crate::loom::sync::atomic::{AtomicUsize, Ordering};
use crate::task::{Header, TaskRef};

#[derive(Debug, Clone, Eq, PartialEq)]
pub(crate) enum TryStealError {
    /// Another worker currently holds the consumer side of the queue.
    Busy,
    /// There was nothing to steal.
    Empty,
}

/// The global injection queue: an unbounded MPSC queue of tasks spawned from
/// outside the runtime or spilled out of a full local queue.
///
/// Any thread may push; consumption goes through [`Injector::try_steal`],
/// which grants one worker at a time exclusive dequeue access.
///
/// The queue links tasks intrusively and needs a resident placeholder node,
/// so construction allocates one stub task up front.
#[derive(Debug)]
pub(crate) struct Injector {
    run_queue: MpscQueue<Header>,
    /// Approximate queue length, maintained alongside the intrusive queue
    /// (which cannot count its own nodes without walking them).
    queued: AtomicUsize,
}

impl Injector {
    pub(crate) fn new() -> Self {
        Self {
            run_queue: MpscQueue::new_with_stub(TaskRef::new_stub()),
            queued: AtomicUsize::new(0),
        }
    }

    pub(crate) fn push_task(&self, task: TaskRef) {
        self.push_batch(core::iter::once(task));
    }

    /// Enqueue a batch of tasks in one go (used by local-queue overflow).
    ///
    /// The length counter is bumped up front, so a concurrent stealer's
    /// snapshot never undercounts what the batch made available.
    pub(crate) fn push_batch(&self, tasks: impl ExactSizeIterator<Item = TaskRef>) {
        self.queued.fetch_add(tasks.len(), Ordering::SeqCst);
        for task in tasks {
            self.run_queue.enqueue(task);
        }
    }

    /// Attempt to begin stealing from this `Injector`; the returned
    /// [`Stealer`] grants exclusive dequeue access until it is dropped.
    ///
    /// The emptiness check happens *before* contending for the consumer
    /// side, so workers that merely probe an idle injector never fight over
    /// it.
    ///
    /// # Errors
    ///
    /// Fails with [`TryStealError::Empty`] when there is nothing queued, or
    /// [`TryStealError::Busy`] when another worker already holds the
    /// consumer side.
    pub(crate) fn try_steal(&self) -> Result<Stealer<'_>, TryStealError> {
        let snapshot = self.queued.load(Ordering::SeqCst);
        if snapshot == 0 {
            return Err(TryStealError::Empty);
        }

        let consumer = self
            .run_queue
            .try_consume()
            .ok_or(TryStealError::Busy)?;

        Ok(Stealer {
            consumer,
            injector: self,
            snapshot,
        })
    }

    /// Number of tasks currently queued.
    pub(crate) fn len(&self) -> usize {
        self.queued.load(Ordering::SeqCst)
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Exclusive dequeue access to an [`Injector`], released on drop.
pub(crate) struct Stealer<'injector> {
    consumer: mpsc_queue::Consumer<'injector, Header>,
    injector: &'injector Injector,
    /// The queue length observed when stealing began; at least 1.
    snapshot: usize,
}

impl Stealer<'_> {
    /// The queue length observed when this `Stealer` was created; what a
    /// fair-share policy divides up.
    pub(crate) fn backlog(&self) -> usize {
        self.snapshot
    }

    /// Dequeue a single task.
    pub(crate) fn pop(&self) -> Option<TaskRef> {
        let task = self.consumer.dequeue()?;
        self.injector.queued.fetch_sub(1, Ordering::SeqCst);
        Some(task)
    }

    /// Dequeue up to `max` tasks, handing them to `f`.
    ///
    /// Returns the number of tasks taken.
    pub(crate) fn take_n(&self, max: usize, mut f: impl FnMut(TaskRef)) -> usize {
        let mut taken = 0;
        while taken < max {
            let Some(task) = self.pop() else { break };
            f(task);
            taken += 1;
        }
        taken
    }
}

impl Debug for Stealer<'_> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Stealer")
            .field("snapshot", &self.snapshot)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::task::{Schedule, TaskBuilder};

    #[derive(Clone)]
    struct NopSchedule;
    impl Schedule for NopSchedule {
        fn schedule(&self, task: TaskRef) {
            drop(task);
        }
    }

    fn spawn_task() -> TaskRef {
        let (task, join) = TaskBuilder::new(NopSchedule).build(async {});
        // detach; the test only shuffles the task around queues
        drop(join);
        task
    }

    #[test]
    fn push_pop_fifo() {
        let injector = Injector::new();
        let a = spawn_task();
        let b = spawn_task();
        let (a_id, b_id) = (a.id(), b.id());

        injector.push_task(a);
        injector.push_task(b);
        assert_eq!(injector.len(), 2);

        let stealer = injector.try_steal().unwrap();
        assert_eq!(stealer.backlog(), 2);
        assert_eq!(stealer.pop().unwrap().id(), a_id);
        assert_eq!(stealer.pop().unwrap().id(), b_id);
        assert!(stealer.pop().is_none());
        drop(stealer);

        assert!(injector.is_empty());
    }

    #[test]
    fn only_one_stealer_at_a_time() {
        let injector = Injector::new();
        injector.push_task(spawn_task());

        let stealer = injector.try_steal().unwrap();
        assert!(matches!(injector.try_steal(), Err(TryStealError::Busy)));
        drop(stealer);

        // dropping the stealer releases the consumer
        let stealer = injector.try_steal().unwrap();
        assert!(stealer.pop().is_some());
    }

    #[test]
    fn empty_injector_cannot_be_stolen_from() {
        let injector = Injector::new();
        assert!(matches!(injector.try_steal(), Err(TryStealError::Empty)));
    }

    #[test]
    fn take_n_respects_max() {
        let injector = Injector::new();
        for _ in 0..5 {
            injector.push_task(spawn_task());
        }

        let stealer = injector.try_steal().unwrap();
        let mut taken = Vec::new();
        assert_eq!(stealer.take_n(3, |task| taken.push(task)), 3);
        drop(stealer);

        assert_eq!(taken.len(), 3);
        assert_eq!(injector.len(), 2);
    }
}
