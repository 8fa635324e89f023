// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! Structured supervision: lexical scopes that track forked children and
//! interrupt whichever are still running when the scope exits.
//!
//! The source material tracks scope membership with a weakly-referenced
//! set, relying on GC to drop entries for children that have already
//! completed. Rust has no GC, so instead each scope holds only
//! `Weak<FiberContext>`: a completed child whose last strong `Arc` (owned by
//! the interpreter's own fiber loop, plus whatever joiners/handles are still
//! around) has dropped simply fails to `upgrade()` on scope exit and is
//! skipped, with no explicit deregistration step needed. A child that *is*
//! still alive but already `Done` may still upgrade and get an `interrupt`
//! sent its way; that's a harmless no-op (see `AtomicStatus::kill`'s
//! `AlreadyDone` case).

use crate::fiber::{Fiber, FiberContext};
use std::sync::{Arc, Mutex, Weak};

struct Scope {
    children: Mutex<Vec<Weak<FiberContext>>>,
}

/// The stack of supervision scopes a fiber is nested inside, innermost last.
pub(crate) struct ScopeStack {
    scopes: Mutex<Vec<Arc<Scope>>>,
}

impl ScopeStack {
    pub(crate) fn new() -> Self {
        Self {
            scopes: Mutex::new(Vec::new()),
        }
    }

    pub(crate) fn enter(&self) {
        self.scopes.lock().unwrap().push(Arc::new(Scope {
            children: Mutex::new(Vec::new()),
        }));
    }

    /// Pops the innermost scope and returns the still-live children it held,
    /// so the caller can sequence `interrupt(cause)` across each of them.
    pub(crate) fn exit(&self) -> Vec<Fiber> {
        let Some(scope) = self.scopes.lock().unwrap().pop() else {
            return Vec::new();
        };
        scope
            .children
            .lock()
            .unwrap()
            .iter()
            .filter_map(Weak::upgrade)
            .map(Fiber::new)
            .collect()
    }

    /// Registers `child` with the innermost scope, if any are open.
    pub(crate) fn track(&self, child: &Arc<FiberContext>) {
        let scopes = self.scopes.lock().unwrap();
        if let Some(innermost) = scopes.last() {
            innermost
                .children
                .lock()
                .unwrap()
                .push(Arc::downgrade(child));
        }
    }

    pub(crate) fn depth(&self) -> usize {
        self.scopes.lock().unwrap().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exit_without_enter_yields_no_children() {
        let scopes = ScopeStack::new();
        assert!(scopes.exit().is_empty());
    }

    #[test]
    fn tracked_child_surfaces_on_exit() {
        let scopes = ScopeStack::new();
        scopes.enter();
        let child = FiberContext::new(crate::host::noop_unhandled_handler());
        scopes.track(&child);
        assert_eq!(scopes.depth(), 1);

        let live = scopes.exit();
        assert_eq!(live.len(), 1);
        assert_eq!(scopes.depth(), 0);
    }

    #[test]
    fn dropped_child_does_not_surface() {
        let scopes = ScopeStack::new();
        scopes.enter();
        {
            let child = FiberContext::new(crate::host::noop_unhandled_handler());
            scopes.track(&child);
        }
        assert!(scopes.exit().is_empty());
    }
}
