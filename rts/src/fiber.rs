// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! Per-fiber mutable state: the evaluation stack, interrupt bookkeeping,
//! supervision membership, and the atomic status cell.

use crate::node::UnhandledHandler;
use crate::stack::EvalStack;
use crate::status::AtomicStatus;
use crate::supervise::ScopeStack;
use std::any::Any;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

static NEXT_FIBER_ID: AtomicUsize = AtomicUsize::new(0);

/// An untyped, unrecoverable cause of fiber termination.
///
/// Unlike a typed `Failed(E)`, a defect is never routed through a `Redeem`
/// error handler; it unwinds the whole stack and is reported to the
/// unhandled handler.
#[derive(Clone)]
pub struct Defect {
    message: Arc<str>,
}

impl Defect {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: Arc::from(message.into()),
        }
    }

    /// Builds a defect from a caught host panic payload, extracting a
    /// printable message where possible.
    pub fn from_panic(payload: Box<dyn Any + Send>) -> Self {
        let message = payload
            .downcast_ref::<&str>()
            .map(|s| (*s).to_string())
            .or_else(|| payload.downcast_ref::<String>().cloned())
            .unwrap_or_else(|| "host panic with non-string payload".to_string());
        Self::new(message)
    }

    pub fn message(&self) -> &str {
        &self.message
    }
}

impl fmt::Display for Defect {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.message)
    }
}

impl fmt::Debug for Defect {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("Defect").field(&self.message).finish()
    }
}

/// Unique, monotonically increasing identifier for a fiber, used only for
/// tracing spans.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash)]
pub struct FiberId(usize);

impl FiberId {
    fn next() -> Self {
        Self(NEXT_FIBER_ID.fetch_add(1, Ordering::Relaxed))
    }
}

impl fmt::Display for FiberId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "fiber-{}", self.0)
    }
}

/// The mutable state owned by a single fiber.
///
/// `stack`, `no_interrupt`, `killed`, and `scopes` are read by the fiber's
/// own worker and, for the latter two, by interruptors running on other
/// threads; interruptors never touch `stack` or `scopes` directly, only
/// `status` via CAS (see [`crate::status::Status::kill`]).
pub struct FiberContext {
    pub(crate) id: FiberId,
    pub(crate) stack: EvalStack,
    pub(crate) no_interrupt: AtomicUsize,
    pub(crate) killed: AtomicBool,
    pub(crate) scopes: ScopeStack,
    pub(crate) status: AtomicStatus,
    pub(crate) unhandled: UnhandledHandler,
}

impl FiberContext {
    pub(crate) fn new(unhandled: UnhandledHandler) -> Arc<Self> {
        Arc::new(Self {
            id: FiberId::next(),
            stack: EvalStack::new(),
            no_interrupt: AtomicUsize::new(0),
            killed: AtomicBool::new(false),
            scopes: ScopeStack::new(),
            status: AtomicStatus::initial(),
            unhandled,
        })
    }

    pub fn id(&self) -> FiberId {
        self.id
    }

    /// True once an interrupt has been latched. Never resets.
    pub fn is_killed(&self) -> bool {
        self.killed.load(Ordering::Acquire)
    }

    pub(crate) fn enter_uninterruptible(&self) {
        self.no_interrupt.fetch_add(1, Ordering::AcqRel);
    }

    pub(crate) fn exit_uninterruptible(&self) {
        self.no_interrupt.fetch_sub(1, Ordering::AcqRel);
    }

    pub(crate) fn is_interruptible(&self) -> bool {
        self.no_interrupt.load(Ordering::Acquire) == 0
    }
}

/// A handle to a running or completed fiber, cheaply cloneable.
///
/// This is the only thing user code and the interpreter hold onto; the
/// [`FiberContext`] itself is kept alive by the interpreter's fiber loop plus
/// whatever supervision scopes and joiners reference this handle.
#[derive(Clone)]
pub struct Fiber {
    pub(crate) ctx: Arc<FiberContext>,
}

impl Fiber {
    pub(crate) fn new(ctx: Arc<FiberContext>) -> Self {
        Self { ctx }
    }

    pub fn id(&self) -> FiberId {
        self.ctx.id()
    }

    pub fn is_killed(&self) -> bool {
        self.ctx.is_killed()
    }
}

impl fmt::Debug for Fiber {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Fiber").field("id", &self.ctx.id).finish()
    }
}
