// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

use crate::fiber::Defect;
use std::fmt;

/// Returned when an operation targets an [`crate::host::Rts`] that has
/// already been shut down.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct Closed(pub(crate) ());

impl fmt::Display for Closed {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.pad("rts was shut down")
    }
}

impl std::error::Error for Closed {}

/// Returned by [`crate::host::Rts::fork`]-style entry points when a fresh
/// fiber could not be started.
#[derive(Debug)]
pub enum SpawnError {
    /// The target [`crate::host::Rts`] has already been shut down.
    Closed(Closed),
}

impl fmt::Display for SpawnError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SpawnError::Closed(c) => c.fmt(f),
        }
    }
}

impl std::error::Error for SpawnError {}

impl From<Closed> for SpawnError {
    fn from(c: Closed) -> Self {
        SpawnError::Closed(c)
    }
}

/// A `Failed(E)` that reached the top of `unsafeRun` without being caught by
/// any `Redeem` handler.
#[derive(Debug)]
pub struct UnhandledError<E>(pub E);

impl<E: fmt::Debug> fmt::Display for UnhandledError<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "unhandled error: {:?}", self.0)
    }
}

impl<E: fmt::Debug> std::error::Error for UnhandledError<E> {}

/// Raised by a blocking join (`unsafeRun`, `unsafeRunSync`) when the fiber
/// being joined terminated with a defect rather than producing a value.
///
/// Kept distinct from [`crate::exit::ExitResult`] itself: `ExitResult` is the
/// RTS's own three-way outcome type, while `JoinError` is what a caller
/// reaching into `std::error::Error`-shaped code (e.g. `?`) actually wants.
#[derive(Debug)]
pub struct JoinError(pub Defect);

impl fmt::Display for JoinError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "fiber terminated: {}", self.0)
    }
}

impl std::error::Error for JoinError {}
