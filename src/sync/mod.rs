// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! Low-level synchronization primitives used by the runtime internals: an
//! atomically registered single-waker cell, and a oneshot channel built on
//! top of it.

pub mod oneshot;
mod wait_cell;

pub use wait_cell::{PollWaitError, WaitCell};
