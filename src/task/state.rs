// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

#![allow(
    impl_trait_overcaptures,
    reason = "mycelium_bitfield is not updated to edition 2024 yet"
)]

use core::fmt;

use crate::loom::sync::atomic::{self, AtomicUsize, Ordering};
use crate::task::PollResult;
use crate::util::loom_const_fn;

/// A task's lifecycle state, packed into a single atomic word.
///
/// Every transition is a CAS loop over a [`Snapshot`] of the word; see
/// [`State::transition`]. The layout is:
///
/// ```text
/// | 63      8 | 7          7 | 6        5 | 4               4 | 3         3 | 2     2 | 1        1 | 0       0 |
/// | ref count | has output   | join waker | has join handle   | cancelled   | woken   | complete   | polling   |
/// ```
pub(crate) struct State {
    val: AtomicUsize,
}

mycelium_bitfield::bitfield! {
    /// One observed value of a task's state word.
    #[derive(PartialEq, Eq)]
    pub(crate) struct Snapshot<usize> {
        /// If set, this task is currently being polled. While this bit is set,
        /// the polling thread has exclusive access to the task's future.
        pub(crate) const POLLING: bool;

        /// If set, this task's future has returned `Poll::Ready` (or the task
        /// was cancelled and retired). The future itself no longer exists.
        pub(crate) const COMPLETE: bool;

        /// If set, this task's waker has been invoked since the last poll
        /// began. A wake while `POLLING` is set is recorded here and consumed
        /// when the poll ends, so that any number of wakes between two polls
        /// coalesce into exactly one re-poll.
        pub(crate) const WOKEN: bool;

        /// If set, this task has been cancelled. The task will not be polled
        /// again; the next time the scheduler dequeues it, it retires it.
        pub(crate) const CANCELLED: bool;

        /// If set, a `JoinHandle` for this task exists.
        ///
        /// This only tracks the handle's existence; whether a waker is stored
        /// in the join-waker slot is tracked by `JOIN_WAKER`.
        pub(crate) const HAS_JOIN_HANDLE: bool;

        /// Access state of the join-waker slot.
        const JOIN_WAKER: JoinWakerState;

        /// If set, the task's output is stored and may be taken by a
        /// `JoinHandle`.
        const HAS_OUTPUT: bool;

        /// The number of currently live references to this task. When this
        /// reaches zero, the task is deallocated.
        const REFS = ..;
    }
}

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
#[repr(u8)]
enum JoinWakerState {
    /// No join waker; the slot is uninitialized.
    Empty = 0b00,
    /// The `JoinHandle` is currently writing a waker to the slot.
    Registering = 0b01,
    /// A join waker is registered; the slot is initialized.
    Waiting = 0b10,
}

/// What to do after attempting the idle → polling transition.
#[must_use]
pub(super) enum StartPollAction {
    /// The transition succeeded, poll the future.
    Poll,
    /// The task is already being polled elsewhere or has completed; skip it.
    DontPoll,
    /// The task was cancelled before this poll; retire it without polling.
    Cancelled {
        /// If `true`, a registered join waker must be woken.
        wake_join_waker: bool,
    },
}

/// What a `JoinHandle` should do after polling the task's state.
#[must_use]
pub(super) enum JoinAction {
    /// The output is stored and this caller has exclusive permission to take
    /// it.
    TakeOutput,

    /// The task was cancelled; it cannot be joined normally.
    Canceled {
        /// If `true`, the task completed before the cancellation was observed
        /// and its output may still be taken.
        completed: bool,
    },

    /// Store the first join waker; the slot is uninitialized.
    Register,

    /// A previous join waker is registered; replace it if it would wake a
    /// different task.
    Reregister,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub(super) enum WakeByRefAction {
    /// The task should be enqueued.
    Enqueue,
    /// The task does not need to be enqueued.
    None,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub(super) enum WakeByValAction {
    /// The task should be enqueued; the waker's reference is handed to the
    /// queue.
    Enqueue,
    /// Nothing to do; the waker's reference was consumed by the transition.
    None,
    /// No enqueue needed; the caller still has to release the waker's
    /// reference (and deallocate if it was the last one).
    Release,
}

const REF_ONE: usize = Snapshot::REFS.first_bit();
const REF_MAX: usize = Snapshot::REFS.raw_mask();

impl State {
    loom_const_fn! {
        /// Returns a task's initial state: not scheduled, not complete, one
        /// reference (held by whoever allocated the task).
        pub(super) const fn new() -> State {
            State {
                val: AtomicUsize::new(REF_ONE),
            }
        }
    }

    pub(super) fn load(&self, ordering: Ordering) -> Snapshot {
        Snapshot(self.val.load(ordering))
    }

    /// Attempt to transition the task from idle to `POLLING`.
    ///
    /// Must always be paired with a call to [`Self::end_poll`] when the poll
    /// completes (unless the returned action says not to poll at all).
    pub(super) fn start_poll(&self) -> StartPollAction {
        let mut wait_for_registration = false;
        let action = self.transition(|s| {
            // cannot start polling a task that is being polled on another
            // thread, or one that has already completed
            if s.get(Snapshot::POLLING) || s.get(Snapshot::COMPLETE) {
                return StartPollAction::DontPoll;
            }

            if s.get(Snapshot::CANCELLED) {
                // retire the task instead of polling it. setting COMPLETE here
                // keeps a second dequeue (e.g. a task woken twice racing two
                // workers) from retiring it twice.
                let wake_join_waker = s.has_join_waker(&mut wait_for_registration);
                s.set(Snapshot::COMPLETE, true);
                return StartPollAction::Cancelled { wake_join_waker };
            }

            s
                // the task is now being polled,
                .set(Snapshot::POLLING, true)
                // and any pending wakeup is consumed by this poll.
                .set(Snapshot::WOKEN, false);

            StartPollAction::Poll
        });

        if wait_for_registration {
            debug_assert!(matches!(action, StartPollAction::Cancelled { .. }));
            self.wait_for_join_waker();
        }

        action
    }

    /// Transition the task from `POLLING` back to idle (or to `COMPLETE` when
    /// `completed` is set); the returned [`PollResult`] tells the scheduler
    /// what to do with the task next.
    pub(super) fn end_poll(&self, completed: bool) -> PollResult {
        let mut wait_for_registration = false;
        let action = self.transition(|s| {
            debug_assert!(s.get(Snapshot::POLLING), "ended a poll that never started");
            debug_assert!(!s.get(Snapshot::COMPLETE));
            debug_assert!(
                s.ref_count() > 0,
                "polled a task that has zero references; this is a bug"
            );

            s.set(Snapshot::POLLING, false)
                .set(Snapshot::COMPLETE, completed);

            // the task woke itself during the poll; it must be re-enqueued
            // rather than dropped.
            if !completed && s.get(Snapshot::WOKEN) {
                return PollResult::PendingSchedule;
            }

            let had_join_waker = if completed {
                // publishing the output flag is what makes it safe for the
                // `JoinHandle` to read the output slot.
                s.set(Snapshot::HAS_OUTPUT, true);
                s.has_join_waker(&mut wait_for_registration)
            } else {
                false
            };

            if had_join_waker {
                PollResult::ReadyJoined
            } else if completed {
                PollResult::Ready
            } else {
                PollResult::Pending
            }
        });

        if wait_for_registration {
            debug_assert_eq!(action, PollResult::ReadyJoined);
            self.wait_for_join_waker();
        }

        action
    }

    pub(super) fn try_join(&self) -> JoinAction {
        fn should_register(s: &mut Snapshot) -> JoinAction {
            let action = match s.get(Snapshot::JOIN_WAKER) {
                JoinWakerState::Empty => JoinAction::Register,
                JoinWakerState::Waiting => JoinAction::Reregister,
                JoinWakerState::Registering => {
                    unreachable!("a JoinHandle cannot observe its own registration in progress")
                }
            };
            s.set(Snapshot::JOIN_WAKER, JoinWakerState::Registering);

            action
        }

        self.transition(|s| {
            let has_output = s.get(Snapshot::HAS_OUTPUT);

            if s.get(Snapshot::CANCELLED) {
                return JoinAction::Canceled {
                    completed: has_output,
                };
            }

            // not complete yet (or completed without an output, which cannot
            // happen today but costs nothing to guard): register for a wakeup.
            if !s.get(Snapshot::COMPLETE) || !has_output {
                return should_register(s);
            }

            *s = s.with(Snapshot::HAS_OUTPUT, false);
            JoinAction::TakeOutput
        })
    }

    /// Publish a completed join-waker registration started by
    /// [`Self::try_join`].
    pub(super) fn join_waker_registered(&self) {
        self.transition(|s| {
            debug_assert_eq!(s.get(Snapshot::JOIN_WAKER), JoinWakerState::Registering);
            s.set(Snapshot::HAS_JOIN_HANDLE, true)
                .set(Snapshot::JOIN_WAKER, JoinWakerState::Waiting);
        });
    }

    pub(super) fn wake_by_val(&self) -> WakeByValAction {
        self.transition(|s| {
            // a wake during the task's own poll is recorded and re-applied by
            // the scheduler when the poll ends; don't enqueue now.
            if s.get(Snapshot::POLLING) {
                *s = s.with(Snapshot::WOKEN, true).drop_ref();
                assert!(s.ref_count() > 0);

                return WakeByValAction::None;
            }

            // an already-completed or already-woken task doesn't need another
            // enqueue. the waker's reference is released *outside* the
            // transition, so a last-reference deallocation goes through the
            // one common drop path.
            if s.get(Snapshot::COMPLETE) || s.get(Snapshot::WOKEN) {
                return WakeByValAction::Release;
            }

            // the wake-by-value consumes the waker's reference, and enqueuing
            // the task creates one; they cancel out, so the count is unchanged.
            *s = s.with(Snapshot::WOKEN, true);
            WakeByValAction::Enqueue
        })
    }

    pub(super) fn wake_by_ref(&self) -> WakeByRefAction {
        self.transition(|s| {
            if s.get(Snapshot::COMPLETE) || s.get(Snapshot::WOKEN) {
                return WakeByRefAction::None;
            }

            if s.get(Snapshot::POLLING) {
                s.set(Snapshot::WOKEN, true);
                return WakeByRefAction::None;
            }

            // the queue holds a reference while the task is enqueued.
            *s = s.with(Snapshot::WOKEN, true).clone_ref();
            WakeByRefAction::Enqueue
        })
    }

    /// Mark a freshly built task as woken before its first enqueue.
    ///
    /// A task may only ever sit in one queue, and the queues link tasks
    /// intrusively, so "queued implies `WOKEN`" is the invariant that stops a
    /// wake racing the first poll from enqueueing the task a second time.
    pub(super) fn mark_spawned(&self) {
        self.transition(|s| {
            debug_assert!(!s.get(Snapshot::WOKEN), "task already spawned");
            debug_assert!(!s.get(Snapshot::COMPLETE));
            s.set(Snapshot::WOKEN, true);
        });
    }

    pub(super) fn clone_ref(&self) {
        // Incrementing the count needs no ordering: new references can only be
        // created from an existing one, and passing a reference between
        // threads already synchronizes.
        let old_refs = self.val.fetch_add(REF_ONE, Ordering::Relaxed);

        // Guard against overflow from `mem::forget`-ed references: saturating
        // would require another atomic op on every clone, so abort instead;
        // a program leaking 2^56 references has bigger problems.
        assert!(old_refs < REF_MAX, "task reference count overflow");
    }

    /// Drop one reference; returns `true` if this was the last one and the
    /// task must be deallocated.
    pub(super) fn drop_ref(&self) -> bool {
        // Release so that all prior uses of the reference happen-before the
        // deallocation; the acquire fence below pairs with it.
        let old_refs = self.val.fetch_sub(REF_ONE, Ordering::Release);
        let old_refs = Snapshot::REFS.unpack(old_refs);

        if old_refs > 1 {
            return false;
        }

        atomic::fence(Ordering::Acquire);
        true
    }

    /// Cancel the task.
    ///
    /// Returns `true` if this call cancelled it (i.e. it was not cancelled
    /// already and had not completed).
    pub(super) fn cancel(&self) -> bool {
        self.transition(|s| {
            if s.get(Snapshot::CANCELLED) || s.get(Snapshot::COMPLETE) {
                return false;
            }

            s.set(Snapshot::CANCELLED, true);
            true
        })
    }

    pub(super) fn create_join_handle(&self) {
        self.transition(|s| {
            debug_assert!(
                !s.get(Snapshot::HAS_JOIN_HANDLE),
                "task already has a join handle! state={s:?}"
            );

            *s = s.with(Snapshot::HAS_JOIN_HANDLE, true);
        });
    }

    pub(super) fn drop_join_handle(&self) {
        const MASK: usize = !Snapshot::HAS_JOIN_HANDLE.raw_mask();
        let _prev = self.val.fetch_and(MASK, Ordering::Release);
        debug_assert!(
            Snapshot(_prev).get(Snapshot::HAS_JOIN_HANDLE),
            "dropped a join handle the task did not have! state={:?}",
            Snapshot(_prev),
        );
    }

    /// Wait out a concurrent join-waker registration.
    ///
    /// Called after a transition observed `JOIN_WAKER == Registering`: the
    /// `JoinHandle` is in the middle of writing the waker on another thread
    /// and will publish it with [`Self::join_waker_registered`] in a few
    /// instructions. Spin until it does so the completing side can safely
    /// read the slot.
    fn wait_for_join_waker(&self) {
        let mut spins = 0u32;
        loop {
            let s = self.load(Ordering::Acquire);
            if s.get(Snapshot::JOIN_WAKER) != JoinWakerState::Registering {
                return;
            }

            if spins < 6 {
                for _ in 0..(1 << spins) {
                    core::hint::spin_loop();
                }
                spins += 1;
            } else {
                std::thread::yield_now();
            }
        }
    }

    fn transition<T>(&self, mut transition: impl FnMut(&mut Snapshot) -> T) -> T {
        let mut current = self.load(Ordering::Acquire);
        loop {
            let mut next = current;
            let res = transition(&mut next);

            if current.0 == next.0 {
                return res;
            }

            match self.val.compare_exchange_weak(
                current.0,
                next.0,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return res,
                Err(actual) => current = Snapshot(actual),
            }
        }
    }
}

impl fmt::Debug for State {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.load(Ordering::Relaxed).fmt(f)
    }
}

impl Snapshot {
    pub(crate) fn ref_count(self) -> usize {
        Snapshot::REFS.unpack(self.0)
    }

    fn drop_ref(self) -> Self {
        Self(self.0 - REF_ONE)
    }

    fn clone_ref(self) -> Self {
        Self(self.0 + REF_ONE)
    }

    /// Whether a join waker exists that the completing side must wake.
    ///
    /// If the waker is mid-registration, `wait_for_registration` is set and
    /// the caller must call [`State::wait_for_join_waker`] after its
    /// transition commits, before touching the slot.
    fn has_join_waker(&mut self, wait_for_registration: &mut bool) -> bool {
        match self.get(Snapshot::JOIN_WAKER) {
            JoinWakerState::Empty => false,
            JoinWakerState::Registering => {
                *wait_for_registration = true;
                true
            }
            JoinWakerState::Waiting => {
                *wait_for_registration = false;
                self.set(Snapshot::JOIN_WAKER, JoinWakerState::Empty);
                true
            }
        }
    }
}

impl mycelium_bitfield::FromBits<usize> for JoinWakerState {
    type Error = core::convert::Infallible;

    const BITS: u32 = 2;

    #[inline]
    fn try_from_bits(bits: usize) -> Result<Self, Self::Error> {
        match bits {
            b if b == Self::Registering as usize => Ok(Self::Registering),
            b if b == Self::Waiting as usize => Ok(Self::Waiting),
            _ => Ok(Self::Empty),
        }
    }

    #[inline]
    fn into_bits(self) -> usize {
        self as u8 as usize
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn initial_state() {
        let state = State::new();
        let s = state.load(Ordering::Relaxed);
        assert_eq!(s.ref_count(), 1);
        assert!(!s.get(Snapshot::POLLING));
        assert!(!s.get(Snapshot::COMPLETE));
        assert!(!s.get(Snapshot::WOKEN));
    }

    #[test]
    fn wake_coalesces() {
        let state = State::new();
        state.clone_ref(); // the "queue" reference

        // first wake enqueues
        assert_eq!(state.wake_by_ref(), WakeByRefAction::Enqueue);
        // subsequent wakes before the poll are coalesced
        assert_eq!(state.wake_by_ref(), WakeByRefAction::None);
        assert_eq!(state.wake_by_ref(), WakeByRefAction::None);

        // the poll consumes the wakeup
        assert!(matches!(state.start_poll(), StartPollAction::Poll));
        assert!(matches!(state.end_poll(false), PollResult::Pending));

        // and the next wake enqueues again
        assert_eq!(state.wake_by_ref(), WakeByRefAction::Enqueue);
    }

    #[test]
    fn wake_during_poll_reschedules() {
        let state = State::new();

        assert!(matches!(state.start_poll(), StartPollAction::Poll));
        assert_eq!(state.wake_by_ref(), WakeByRefAction::None);
        assert!(matches!(state.end_poll(false), PollResult::PendingSchedule));
    }

    #[test]
    fn cancel_prevents_poll() {
        let state = State::new();

        assert!(state.cancel());
        // cancelling twice is a no-op
        assert!(!state.cancel());

        assert!(matches!(
            state.start_poll(),
            StartPollAction::Cancelled {
                wake_join_waker: false
            }
        ));
        // the cancelled transition marked the task complete; it is never
        // polled again.
        assert!(matches!(state.start_poll(), StartPollAction::DontPoll));
    }

    #[test]
    fn refcount_round_trip() {
        let state = State::new();
        let before = state.load(Ordering::Relaxed).ref_count();

        for _ in 0..4 {
            state.clone_ref();
        }
        for _ in 0..4 {
            assert!(!state.drop_ref());
        }

        assert_eq!(state.load(Ordering::Relaxed).ref_count(), before);
    }
}
