// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! A worker's bounded local run queue.
//!
//! A fixed-capacity (power-of-two) ring buffer indexed by two wrapping `u32`
//! counters. The owning worker pushes at the tail; dequeues, both the
//! owner's pop and foreign steals, come off the head, oldest first, which
//! spreads long-untouched work to thieves. Hot wake-to-run locality is
//! provided by the worker's LIFO slot, not by this queue.
//!
//! The head word packs *two* `u32` indices: the `steal` index marks the start
//! of a range currently being copied out by a thief, while `real` marks the
//! first slot available for dequeue. While a steal is in flight the two
//! differ, which keeps a second thief out and keeps the owner's `push` from
//! reusing the claimed slots. A full `push` spills half the queue into the
//! global [`Injector`] in one batch.

use core::fmt;
use core::mem::MaybeUninit;

use crate::executor::steal::Injector;
use crate::loom::cell::UnsafeCell;
use crate::loom::sync::Arc;
use crate::loom::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use crate::task::TaskRef;

/// Create a new local run queue with the given capacity (must be a power of
/// two), returning the owner and stealer halves.
pub(crate) fn local(capacity: usize) -> (Steal, Local) {
    assert!(capacity.is_power_of_two(), "queue capacity must be a power of two");
    assert!(capacity <= (1 << 16), "queue capacity too large");

    let mut buffer = Vec::with_capacity(capacity);
    for _ in 0..capacity {
        buffer.push(UnsafeCell::new(MaybeUninit::uninit()));
    }

    let inner = Arc::new(Inner {
        head: AtomicU64::new(0),
        tail: AtomicU32::new(0),
        buffer: buffer.into_boxed_slice(),
    });

    (Steal(inner.clone()), Local(inner))
}

/// Owner handle: push and pop. Must only be used from the worker thread that
/// owns the queue.
pub(crate) struct Local(Arc<Inner>);

/// Stealer handle: visible to all workers, used to move half of the victim's
/// queue into the thief's.
#[derive(Clone)]
pub(crate) struct Steal(Arc<Inner>);

struct Inner {
    /// Packed `(steal, real)` head indices; see the module docs.
    head: AtomicU64,
    /// Only the owner writes the tail.
    tail: AtomicU32,
    buffer: Box<[UnsafeCell<MaybeUninit<TaskRef>>]>,
}

// Safety: slot access is arbitrated by the head/tail indices; a slot is
// written only by the owner while it is outside [steal, tail) and read only
// by whoever moved an index past it.
unsafe impl Send for Inner {}
// Safety: see above
unsafe impl Sync for Inner {}

#[inline]
fn pack(steal: u32, real: u32) -> u64 {
    u64::from(steal) | (u64::from(real) << 32)
}

#[inline]
#[expect(clippy::cast_possible_truncation, reason = "intentional unpack of packed u32 halves")]
fn unpack(packed: u64) -> (u32, u32) {
    (packed as u32, (packed >> 32) as u32)
}

// === impl Inner ===

impl Inner {
    #[inline]
    fn capacity(&self) -> u32 {
        u32::try_from(self.buffer.len()).expect("capacity checked at construction")
    }

    #[inline]
    fn mask(&self) -> u32 {
        self.capacity() - 1
    }

    fn len(&self) -> u32 {
        let (_, real) = unpack(self.head.load(Ordering::Acquire));
        let tail = self.tail.load(Ordering::Acquire);
        tail.wrapping_sub(real)
    }
}

// === impl Local ===

impl Local {
    pub(crate) fn is_empty(&self) -> bool {
        self.0.len() == 0
    }

    pub(crate) fn len(&self) -> usize {
        self.0.len() as usize
    }

    pub(crate) fn capacity(&self) -> usize {
        self.0.buffer.len()
    }

    /// Push `task` onto the tail of the queue.
    ///
    /// If the queue is full, half of it (plus `task` itself) is moved to the
    /// `injector` in one batch. Returns `true` when tasks spilled over.
    pub(crate) fn push_back_or_overflow(&self, mut task: TaskRef, injector: &Injector) -> bool {
        let tail = loop {
            let packed = self.0.head.load(Ordering::Acquire);
            let (steal, _real) = unpack(packed);
            // the tail is only written by us, so a relaxed load is enough.
            let tail = self.0.tail.load(Ordering::Relaxed);

            // slots in [steal, tail) are occupied, including any currently
            // being copied out by a thief.
            if tail.wrapping_sub(steal) < self.0.capacity() {
                break tail;
            }

            match self.push_overflow(task, packed, tail, injector) {
                Ok(()) => return true,
                // a thief appeared mid-overflow; it is freeing up slots, so
                // retry the fast path.
                Err(returned) => task = returned,
            }
        };

        let idx = (tail & self.0.mask()) as usize;
        self.0.buffer[idx].with_mut(|slot| {
            // Safety: slot `tail` is outside [steal, tail) and thus
            // unoccupied; only the owner writes slots.
            unsafe {
                slot.write(MaybeUninit::new(task));
            }
        });

        // the release store publishes the slot write to stealers.
        self.0.tail.store(tail.wrapping_add(1), Ordering::Release);
        false
    }

    /// Move the front half of the (full) queue plus `task` to the injector.
    fn push_overflow(
        &self,
        task: TaskRef,
        prev_packed: u64,
        tail: u32,
        injector: &Injector,
    ) -> Result<(), TaskRef> {
        let (steal, real) = unpack(prev_packed);
        if steal != real {
            // a steal is in flight; the fast path will have room once it
            // commits.
            return Err(task);
        }
        debug_assert_eq!(tail.wrapping_sub(real), self.0.capacity());

        let n = self.0.capacity() / 2;

        // claim the front half by advancing both indices past it.
        let claimed = real.wrapping_add(n);
        if self
            .0
            .head
            .compare_exchange(
                prev_packed,
                pack(claimed, claimed),
                Ordering::Release,
                Ordering::Relaxed,
            )
            .is_err()
        {
            return Err(task);
        }

        let mut batch = Vec::with_capacity(n as usize + 1);
        for i in 0..n {
            let idx = (real.wrapping_add(i) & self.0.mask()) as usize;
            let task = self.0.buffer[idx].with_mut(|slot| {
                // Safety: the compare-exchange above moved the head past
                // these slots, so neither the owner nor a thief will touch
                // them again.
                unsafe { (*slot).assume_init_read() }
            });
            batch.push(task);
        }
        batch.push(task);

        tracing::trace!(spilled = batch.len(), "local queue overflowed into injector");
        injector.push_batch(batch.into_iter());

        Ok(())
    }

    /// Pop a task off the head of the queue.
    pub(crate) fn pop(&self) -> Option<TaskRef> {
        let mut packed = self.0.head.load(Ordering::Acquire);

        let idx = loop {
            let (steal, real) = unpack(packed);
            // the tail is only written by us.
            let tail = self.0.tail.load(Ordering::Relaxed);

            if real == tail {
                return None;
            }

            let next_real = real.wrapping_add(1);
            // preserve the steal index of an in-flight thief; its claimed
            // range is disjoint from slot `real`.
            let next = if steal == real {
                pack(next_real, next_real)
            } else {
                pack(steal, next_real)
            };

            match self
                .0
                .head
                .compare_exchange(packed, next, Ordering::AcqRel, Ordering::Acquire)
            {
                Ok(_) => break (real & self.0.mask()) as usize,
                Err(actual) => packed = actual,
            }
        };

        let task = self.0.buffer[idx].with_mut(|slot| {
            // Safety: the compare-exchange moved `real` past this slot, so it
            // is exclusively ours to read.
            unsafe { (*slot).assume_init_read() }
        });
        Some(task)
    }

    /// Drain the queue, dropping remaining tasks.
    #[cfg(test)]
    pub(crate) fn drain(&self) -> usize {
        let mut drained = 0;
        while let Some(task) = self.pop() {
            drop(task);
            drained += 1;
        }
        drained
    }
}

impl fmt::Debug for Local {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Local")
            .field("len", &self.0.len())
            .field("capacity", &self.0.buffer.len())
            .finish()
    }
}

// === impl Steal ===

impl Steal {
    /// Steal half of this queue's tasks, moving them into `dst` (the thief's
    /// own, empty queue) and returning the first one for immediate
    /// execution.
    ///
    /// Fails (returns `None`) when the queue is empty or when another thief
    /// is already copying from it.
    pub(crate) fn steal_into(&self, dst: &Local) -> Option<TaskRef> {
        debug_assert!(
            dst.len() <= dst.capacity() / 2,
            "stealing into a non-empty queue"
        );

        // the dst tail is only written by its owner, which is us.
        let dst_tail = dst.0.tail.load(Ordering::Relaxed);

        // phase one: claim [real, real + n) by advancing `real` while leaving
        // `steal` in place; the gap marks the claim.
        let mut prev_packed = self.0.head.load(Ordering::Acquire);
        let (first_idx, n) = loop {
            let (src_steal, src_real) = unpack(prev_packed);

            if src_steal != src_real {
                // another thief has a claim in flight.
                return None;
            }

            let src_tail = self.0.tail.load(Ordering::Acquire);
            let len = src_tail.wrapping_sub(src_real);
            if len == 0 || len > self.0.capacity() {
                // empty, or a torn read while the owner was mid-update.
                return None;
            }

            // take the half rounded up, so a single task can be stolen.
            let n = len - len / 2;

            let next_packed = pack(src_steal, src_real.wrapping_add(n));
            match self.0.head.compare_exchange(
                prev_packed,
                next_packed,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => break (src_real, n),
                Err(actual) => prev_packed = actual,
            }
        };

        debug_assert!(n <= dst.0.capacity() - u32::try_from(dst.len()).unwrap());

        // phase two: copy the claimed slots. the first task is handed to the
        // caller, the rest land in `dst`.
        let mut first = None;
        for i in 0..n {
            let src_idx = (first_idx.wrapping_add(i) & self.0.mask()) as usize;
            let task = self.0.buffer[src_idx].with_mut(|slot| {
                // Safety: the claim gives us exclusive access to these slots;
                // the owner's push counts them as occupied until `steal`
                // catches up with `real` below.
                unsafe { (*slot).assume_init_read() }
            });

            if i == 0 {
                first = Some(task);
            } else {
                let dst_idx = (dst_tail.wrapping_add(i - 1) & dst.0.mask()) as usize;
                dst.0.buffer[dst_idx].with_mut(|slot| {
                    // Safety: `dst` is our own queue and these slots are
                    // unoccupied.
                    unsafe {
                        slot.write(MaybeUninit::new(task));
                    }
                });
            }
        }

        // phase three: release the claim by catching `steal` up to `real`.
        // the owner may have popped concurrently, so re-read until the CAS
        // lands.
        let mut prev_packed = pack(first_idx, first_idx.wrapping_add(n));
        loop {
            let (_, real_now) = unpack(prev_packed);
            let next_packed = pack(real_now, real_now);
            match self.0.head.compare_exchange(
                prev_packed,
                next_packed,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => break,
                Err(actual) => prev_packed = actual,
            }
        }

        if n > 1 {
            // publish the copied tasks to our own queue.
            dst.0
                .tail
                .store(dst_tail.wrapping_add(n - 1), Ordering::Release);
        }

        tracing::trace!(stolen = n, "stole tasks");
        first
    }
}

impl fmt::Debug for Steal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Steal").field("len", &self.0.len()).finish()
    }
}

impl Drop for Local {
    fn drop(&mut self) {
        debug_assert!(self.is_empty(), "local queue dropped with queued tasks");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::task::{Schedule, TaskBuilder, TaskRef};

    #[derive(Clone)]
    struct NopSchedule;
    impl Schedule for NopSchedule {
        fn schedule(&self, task: TaskRef) {
            drop(task);
        }
    }

    fn spawn_task(tag: u64) -> TaskRef {
        let (task, join) = TaskBuilder::new(NopSchedule).build(async move {
            let _ = tag;
        });
        drop(join);
        task
    }

    #[test]
    fn fifo_order() {
        let injector = Injector::new();
        let (_steal, local) = local(4);

        let ids: Vec<_> = (0..3)
            .map(|i| {
                let task = spawn_task(i);
                let id = task.id();
                assert!(!local.push_back_or_overflow(task, &injector));
                id
            })
            .collect();

        for id in ids {
            assert_eq!(local.pop().unwrap().id(), id);
        }
        assert!(local.pop().is_none());
        assert!(injector.is_empty());
    }

    #[test]
    fn overflow_spills_half_plus_task_to_injector() {
        let injector = Injector::new();
        let (_steal, local) = local(4);

        for i in 0..4 {
            assert!(!local.push_back_or_overflow(spawn_task(i), &injector));
        }
        assert_eq!(local.len(), 4);

        // the fifth push overflows: half the queue (2 tasks) plus the new
        // task spill to the injector.
        assert!(local.push_back_or_overflow(spawn_task(4), &injector));
        assert_eq!(local.len(), 2);
        assert_eq!(injector.len(), 3);

        local.drain();
        let stealer = injector.try_steal().unwrap();
        while stealer.pop().is_some() {}
    }

    #[test]
    fn steal_takes_half_rounded_up() {
        let injector = Injector::new();
        let (steal_a, local_a) = local(8);
        let (_steal_b, local_b) = local(8);

        for i in 0..5 {
            local_a.push_back_or_overflow(spawn_task(i), &injector);
        }

        // 5 tasks: the thief takes ceil(5/2) = 3: one to run, two queued.
        let first = steal_a.steal_into(&local_b).unwrap();
        assert_eq!(local_b.len(), 2);
        assert_eq!(local_a.len(), 2);

        drop(first);
        local_a.drain();
        local_b.drain();
    }

    #[test]
    fn steal_single_task() {
        let injector = Injector::new();
        let (steal_a, local_a) = local(8);
        let (_steal_b, local_b) = local(8);

        local_a.push_back_or_overflow(spawn_task(0), &injector);

        let first = steal_a.steal_into(&local_b).unwrap();
        assert!(local_a.is_empty());
        assert!(local_b.is_empty());
        drop(first);

        // nothing left to steal
        assert!(steal_a.steal_into(&local_b).is_none());
    }

    #[test]
    fn stealers_and_owner_conserve_tasks() {
        use std::collections::HashSet;
        use std::sync::Mutex;

        crate::loom::model(|| {
            const TASKS: u64 = 64;

            let injector = Arc::new(Injector::new());
            let (steal_a, local_a) = local(16);
            let (_steal_b, local_b) = local(16);

            let seen = Arc::new(Mutex::new(HashSet::new()));
            let mut expected = HashSet::new();

            let thief = {
                let seen = seen.clone();
                let steal_a = steal_a.clone();
                crate::loom::thread::spawn(move || {
                    for _ in 0..64 {
                        if let Some(task) = steal_a.steal_into(&local_b) {
                            seen.lock().unwrap().insert(task.id());
                        }
                        while let Some(task) = local_b.pop() {
                            seen.lock().unwrap().insert(task.id());
                        }
                        std::thread::yield_now();
                    }
                    while let Some(task) = local_b.pop() {
                        seen.lock().unwrap().insert(task.id());
                    }
                })
            };

            for i in 0..TASKS {
                let task = spawn_task(i);
                expected.insert(task.id());
                local_a.push_back_or_overflow(task, &injector);
                if i % 3 == 0 {
                    if let Some(task) = local_a.pop() {
                        seen.lock().unwrap().insert(task.id());
                    }
                }
            }
            while let Some(task) = local_a.pop() {
                seen.lock().unwrap().insert(task.id());
            }

            thief.join().unwrap();

            // drain whatever spilled to the injector
            if let Ok(stealer) = injector.try_steal() {
                while let Some(task) = stealer.pop() {
                    seen.lock().unwrap().insert(task.id());
                }
            }

            // every task pushed was seen exactly once (HashSet insert would
            // not catch duplicates, so compare the full sets)
            assert_eq!(*seen.lock().unwrap(), expected);
        });
    }
}
