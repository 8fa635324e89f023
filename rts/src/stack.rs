// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! The per-fiber evaluation stack: continuations, Redeem frames, and
//! finalizer markers, stored in fixed-size chunks so a million-deep
//! `flatMap` chain doesn't force one giant contiguous allocation.

use crate::loom::cell::UnsafeCell;
use crate::node::{Cont, ErrCont, Node};

/// Number of entries held inline per chunk before a new one is allocated.
const CHUNK_SIZE: usize = 13;

pub(crate) enum StackEntry {
    Cont(Cont),
    Redeem { on_err: ErrCont, on_ok: Cont },
    Finalizer(Node),
}

struct Chunk {
    entries: Vec<StackEntry>,
    next: Option<Box<Chunk>>,
}

impl Chunk {
    fn new() -> Self {
        Self {
            entries: Vec::with_capacity(CHUNK_SIZE),
            next: None,
        }
    }
}

/// A chunked stack of [`StackEntry`] values.
///
/// Not `Sync`: only the fiber's current worker ever touches it. Concurrent
/// interruptors reach the fiber only through the atomic status cell, never
/// through the stack directly.
pub(crate) struct EvalStack {
    top: UnsafeCell<Box<Chunk>>,
}

// SAFETY: a fiber's stack is only ever touched by the single worker thread
// currently executing its interpreter loop; interruptors reach the fiber
// exclusively through the atomic status cell and never dereference this.
unsafe impl Send for EvalStack {}
unsafe impl Sync for EvalStack {}

impl EvalStack {
    pub(crate) fn new() -> Self {
        Self {
            top: UnsafeCell::new(Box::new(Chunk::new())),
        }
    }

    pub(crate) fn push(&self, entry: StackEntry) {
        self.top.with_mut(|top| {
            // SAFETY: single-writer invariant documented on the type.
            let top = unsafe { &mut *top };
            if top.entries.len() == CHUNK_SIZE {
                let mut fresh = Box::new(Chunk::new());
                let old = std::mem::replace(top, Box::new(Chunk::new()));
                fresh.next = Some(old);
                *top = fresh;
            }
            top.entries.push(entry);
        });
    }

    pub(crate) fn pop(&self) -> Option<StackEntry> {
        self.top.with_mut(|top| {
            // SAFETY: single-writer invariant documented on the type.
            let top = unsafe { &mut *top };
            if let Some(entry) = top.entries.pop() {
                return Some(entry);
            }
            if let Some(next) = top.next.take() {
                *top = next;
                return self.pop();
            }
            None
        })
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.top.with(|top| {
            // SAFETY: single-writer invariant documented on the type.
            let top = unsafe { &*top };
            top.entries.is_empty() && top.next.is_none()
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn marker(n: u32) -> StackEntry {
        StackEntry::Cont(Box::new(move |v| {
            let got = *v.downcast::<u32>().unwrap();
            Node::Pure(Box::new(got + n))
        }))
    }

    #[test]
    fn push_pop_is_lifo_across_chunks() {
        let stack = EvalStack::new();
        for i in 0..(CHUNK_SIZE as u32 * 3 + 2) {
            stack.push(marker(i));
        }
        assert!(!stack.is_empty());

        let mut popped = Vec::new();
        while let Some(StackEntry::Cont(k)) = stack.pop() {
            match k(Box::new(0u32)) {
                Node::Pure(v) => popped.push(*v.downcast::<u32>().unwrap()),
                _ => unreachable!(),
            }
        }
        let expected: Vec<u32> = (0..(CHUNK_SIZE as u32 * 3 + 2)).rev().collect();
        assert_eq!(popped, expected);
        assert!(stack.is_empty());
    }

    #[test]
    fn empty_stack_pops_none() {
        let stack = EvalStack::new();
        assert!(stack.pop().is_none());
    }
}
