// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

use core::time::Duration;

use crate::loom::sync::Mutex;
use crate::loom::sync::atomic::{AtomicUsize, Ordering};
use crate::park::Park;
use crate::park::parker::{Parker, UnparkToken};
use crate::util::loom_const_fn;

/// The set of currently sleeping workers.
///
/// Workers register an [`UnparkToken`] here before blocking; wakers call
/// [`unpark_one`][ParkingLot::unpark_one] after enqueuing a task so that an
/// idle worker picks it up.
#[derive(Debug)]
pub struct ParkingLot<P> {
    /// Number of currently parked workers.
    num_parked: AtomicUsize,
    /// Tokens of registered sleepers, tagged with the owning worker's id.
    unpark_tokens: Mutex<Vec<(usize, UnparkToken<P>)>>,
}

// === impl ParkingLot ===

impl<P: Park> ParkingLot<P> {
    loom_const_fn! {
        pub const fn new() -> Self {
            Self {
                num_parked: AtomicUsize::new(0),
                unpark_tokens: Mutex::new(Vec::new()),
            }
        }
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            num_parked: AtomicUsize::new(0),
            unpark_tokens: Mutex::new(Vec::with_capacity(capacity)),
        }
    }

    pub fn num_parked(&self) -> usize {
        self.num_parked.load(Ordering::Acquire)
    }

    /// Park the calling worker on `parker` unless `has_work` reports that
    /// work appeared in the meantime.
    ///
    /// The token is registered *before* `has_work` runs: a task enqueued
    /// concurrently either lands before the final check (the check sees it
    /// and the park is skipped) or after it (the enqueueing side finds the
    /// token and unparks us). Either way the wakeup cannot be lost.
    ///
    /// With a `timeout`, the park additionally gives up once the duration
    /// elapses. The worker's token is withdrawn on the way out, so tokens
    /// never accumulate; a token consumed by someone else in the meantime
    /// just means the next park returns immediately.
    pub fn park_unless(
        &self,
        id: usize,
        parker: &Parker<P>,
        timeout: Option<Duration>,
        has_work: impl FnOnce() -> bool,
    ) {
        self.transition_to_parked();
        self.unpark_tokens
            .lock()
            .unwrap()
            .push((id, parker.clone().into_unpark()));

        // last chance: anything enqueued before our token was visible would
        // not have unparked anyone.
        if has_work() {
            self.withdraw(id);
            self.transition_from_parked();
            return;
        }

        match timeout {
            Some(duration) => parker.park_timeout(duration),
            None => parker.park(),
        }

        self.withdraw(id);
        self.transition_from_parked();
    }

    /// Remove the token(s) registered by worker `id`.
    fn withdraw(&self, id: usize) {
        self.unpark_tokens
            .lock()
            .unwrap()
            .retain(|(owner, _)| *owner != id);
    }

    /// Unpark a single worker. Returns `true` when a token was consumed.
    ///
    /// Tokens are consumed newest-first. A consumed token may belong to a
    /// worker that already woke up on its own; its next park then returns
    /// immediately, which is indistinguishable from a spurious wakeup.
    pub fn unpark_one(&self) -> bool {
        if let Some((_, token)) = self.unpark_tokens.lock().unwrap().pop() {
            token.unpark();
            true
        } else {
            false
        }
    }

    /// Unpark all currently parked workers, returning how many tokens were
    /// consumed.
    pub fn unpark_all(&self) -> usize {
        let mut tokens = self.unpark_tokens.lock().unwrap();
        let mut unparked = 0;

        while let Some((_, token)) = tokens.pop() {
            token.unpark();
            unparked += 1;
        }

        unparked
    }

    fn transition_to_parked(&self) {
        let prev = self.num_parked.fetch_add(1, Ordering::Release);
        assert_ne!(prev, usize::MAX);
    }

    fn transition_from_parked(&self) {
        let prev = self.num_parked.fetch_sub(1, Ordering::Release);
        assert_ne!(prev, 0);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::loom::sync::Arc;
    use crate::loom::thread;
    use crate::park::StdPark;

    #[test]
    fn unpark_one_wakes_each_parked_worker() {
        crate::loom::model(|| {
            crate::loom::lazy_static! {
                static ref UNPARKED: AtomicUsize = AtomicUsize::new(0);
            }

            let lot: Arc<ParkingLot<StdPark>> = Arc::new(ParkingLot::with_capacity(4));

            let joins: Vec<_> = (0..4)
                .map(|id| {
                    let lot = lot.clone();
                    thread::spawn(move || {
                        let parker = Parker::new(StdPark::for_current());
                        lot.park_unless(id, &parker, None, || false);
                        UNPARKED.fetch_add(1, Ordering::Release);
                    })
                })
                .collect();

            // keep unparking until every worker has come back out; a popped
            // token may belong to a worker that left on its own, so this
            // cannot just count to four.
            while UNPARKED.load(Ordering::Acquire) < 4 {
                lot.unpark_one();
                std::thread::yield_now();
            }

            for join in joins {
                join.join().unwrap();
            }

            assert_eq!(UNPARKED.load(Ordering::Acquire), 4);
            assert_eq!(lot.num_parked(), 0);
        });
    }

    #[test]
    fn has_work_skips_the_park() {
        let lot: ParkingLot<StdPark> = ParkingLot::with_capacity(1);
        let parker = Parker::new(StdPark::for_current());

        // would deadlock if the park were not skipped
        lot.park_unless(0, &parker, None, || true);
        assert_eq!(lot.num_parked(), 0);
    }

    #[test]
    fn timed_park_returns() {
        let lot: ParkingLot<StdPark> = ParkingLot::with_capacity(1);
        let parker = Parker::new(StdPark::for_current());

        let start = std::time::Instant::now();
        lot.park_unless(0, &parker, Some(Duration::from_millis(20)), || false);
        assert!(start.elapsed() >= Duration::from_millis(10));
        assert_eq!(lot.num_parked(), 0);
    }
}
