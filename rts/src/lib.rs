// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! A fiber-based interpreter for `IO[E, A]` effect descriptions.
//!
//! An [`IO`] value describes a possibly-asynchronous computation that
//! either produces an `A` or fails with a typed `E`; building one does
//! nothing on its own. [`Rts`] is the host that turns descriptions into
//! running fibers: cooperatively scheduled, stack-safe, interruptible units
//! of evaluation, each with its own [`Fiber`] handle.
//!
//! ```no_run
//! use rts::{Rts, IO};
//!
//! let rts = Rts::new();
//! let io: IO<std::convert::Infallible, i32> =
//!     IO::pure(1).flat_map(|n| IO::pure(n + 1));
//! assert_eq!(rts.unsafe_run(io), 2);
//! ```

mod async_descriptor;
mod config;
mod error;
mod exit;
mod fiber;
mod host;
mod interpreter;
mod loom;
mod node;
mod race;
mod stack;
mod status;
mod supervise;

pub use async_descriptor::{AsyncDescriptor, AsyncResult, Canceler};
pub use config::{RtsConfig, RtsConfigBuilder};
pub use error::{Closed, JoinError, SpawnError, UnhandledError};
pub use exit::ExitResult;
pub use fiber::{Defect, Fiber, FiberId};
pub use host::Rts;
pub use node::{async_register, async_register_effect, race, sleep, supervisor, Supervisor, IO};
