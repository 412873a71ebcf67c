// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! A multi-threaded, work-stealing async runtime.
//!
//! The runtime drives user futures to completion by interleaving cooperative
//! polling with readiness notifications from the OS: spawned futures are
//! wrapped in reference-counted, type-erased [tasks][task], scheduled onto
//! per-worker bounded run queues (with a global injection queue for external
//! spawns and overflow), and polled by a fixed set of worker threads that
//! steal from each other when idle. Workers that run out of work either park
//! or, if the I/O [reactor] is enabled, drive the reactor inline, waking
//! tasks when their sources become ready or their [timers][time] expire.
//!
//! The main entry point is the [`Builder`]/[`Runtime`] pair:
//!
//! ```
//! let rt = riptide::Builder::new().worker_threads(2).build().unwrap();
//!
//! let out = rt.block_on(async {
//!     let handle = riptide::spawn(async { 6 * 7 }).unwrap();
//!     handle.await.unwrap()
//! });
//!
//! assert_eq!(out, 42);
//! ```

mod blocking;
mod error;
mod executor;
mod loom;
pub mod park;
pub mod reactor;
pub mod runtime;
pub mod sync;
pub mod task;
pub mod time;
mod util;

pub use blocking::Blocking;
pub use error::{Closed, SpawnError};
pub use runtime::{Builder, Runtime, RuntimeError, spawn, spawn_blocking};
pub use task::JoinHandle;
