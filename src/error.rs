// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

use core::fmt;

/// Error returned when a future could not be spawned onto the runtime.
#[derive(Debug)]
#[non_exhaustive]
pub enum SpawnError {
    /// The runtime has begun shutting down and no longer accepts tasks.
    Shutdown,
}

impl From<Closed> for SpawnError {
    fn from(_: Closed) -> Self {
        Self::Shutdown
    }
}

impl fmt::Display for SpawnError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SpawnError::Shutdown => f.write_str("runtime is shutting down"),
        }
    }
}

impl core::error::Error for SpawnError {}

/// Marker error for operations against a closed resource (a shut-down
/// runtime, a closed wait cell, a dropped channel half).
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct Closed(pub(crate) ());

impl fmt::Display for Closed {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.pad("closed")
    }
}

impl core::error::Error for Closed {}
