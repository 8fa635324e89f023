// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! The three shapes an async registration function may hand back to the
//! interpreter.

use crate::node::{BoxAny, IO};

/// A canceler that can be invoked synchronously from the fiber that
/// registered it, or from an interruptor on a different thread.
pub type Canceler = Box<dyn FnOnce() + Send>;

/// Result of calling an `Async register` node's registering function.
///
/// The registering function is handed a resume callback and returns one of
/// these three shapes to describe how (and whether) the result is already
/// available.
pub enum AsyncDescriptor {
    /// The result was already available by the time the registering
    /// function returned; the interpreter may continue immediately, subject
    /// to [`crate::status::Status`]'s race against a concurrent interrupt.
    Now(AsyncResult),
    /// No result is available yet; `resume` will be called later, from
    /// whatever thread drives the foreign event source. The canceler runs
    /// synchronously and must not block.
    MaybeLater(Option<Canceler>),
    /// Like `MaybeLater`, but canceling is itself effectful and must run as
    /// a top-level fiber rather than inline.
    MaybeLaterIo(Option<IO<std::convert::Infallible, ()>>),
}

/// The value handed back through a resume callback: either a produced value,
/// a typed failure, or a defect, all erased the same way `Node` erases them.
pub enum AsyncResult {
    Completed(BoxAny),
    Failed(BoxAny),
    Terminated(crate::fiber::Defect),
}
