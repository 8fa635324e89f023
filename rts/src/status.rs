// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! The atomic fiber status state machine.
//!
//! `Status` is a tagged sum type carrying variable-length joiner/killer
//! lists, so it cannot be packed into a fixed-width atomic word the way a
//! plain enum discriminant could. Instead each transition builds a brand new
//! `Status` value and swaps it in with [`arc_swap::ArcSwap::rcu`], which
//! retries the whole closure on CAS conflict — exactly the "atomic pointer
//! to an immutable record" encoding this calls for. Joiner and killer
//! callbacks are stored as `Arc<dyn Fn>` rather than `Box<dyn FnOnce>` so a
//! retried `rcu` closure can cheaply clone the list it read out of the old
//! value instead of consuming it.

use crate::fiber::Defect;
use crate::node::BoxAny;
use arc_swap::ArcSwap;
use std::cell::Cell;
use std::sync::Arc;

/// The erased outcome passed to joiners and produced by `done`. Mirrors
/// `crate::exit::ExitResult` but without the `E`/`A` type parameters, since
/// the status machine itself is generic infrastructure shared by every
/// fiber regardless of what it computes.
pub(crate) enum ErasedExit {
    Completed(BoxAny),
    /// Carries the same eagerly-computed debug summary `Node::Fail` does, so
    /// a Fail that escapes all the way to `done()` can still be re-described
    /// without the caller needing the erased `E`'s concrete type back.
    Failed(BoxAny, Arc<str>),
    Terminated(Defect),
}

/// Joiners see the stored exit wrapped in its `Arc` rather than by value:
/// `BoxAny` (`Box<dyn Any + Send + Sync>`) can't be cloned generically, and
/// any number of joiners may be registered against one `Done` value. Cloning
/// the `Arc` is always free regardless of what it points to; a joiner that
/// needs an owned `A`/`E` downcasts through the reference and clones the
/// typed value itself.
pub(crate) type Joiner = Arc<dyn Fn(Arc<DoneValue>) + Send + Sync>;
pub(crate) type Killer = Arc<dyn Fn() + Send + Sync>;
pub(crate) type Canceler = Arc<dyn Fn(Defect) + Send + Sync>;

#[derive(Clone)]
pub(crate) enum Status {
    Executing {
        error: Option<Defect>,
        joiners: Vec<Joiner>,
        killers: Vec<Killer>,
    },
    AsyncRegion {
        error: Option<Defect>,
        reentrancy: usize,
        resume: usize,
        canceler: Option<Canceler>,
        joiners: Vec<Joiner>,
        killers: Vec<Killer>,
    },
    Done(Arc<DoneValue>),
}

/// Wraps the final `ErasedExit` behind an `Arc` so `Status::Done` stays
/// cheaply `Clone` and any number of joiners can read the same value.
pub(crate) struct DoneValue(pub(crate) ErasedExit);

/// Outcome of [`AtomicStatus::kill`]: tells the caller what follow-up work
/// (if any) it must perform outside the CAS loop.
pub(crate) enum KillOutcome {
    /// The kill was merged into pending state; no immediate action.
    Deferred,
    /// The fiber was mid-async with nothing protecting it: the caller must
    /// invoke `canceler` (if any) and fan `joiners`/`killers` out exactly as
    /// [`AtomicStatus::done`] would have, since this path bypasses `done`.
    WentDirectlyToDone {
        canceler: Option<Canceler>,
        joiners: Vec<Joiner>,
        killers: Vec<Killer>,
    },
    /// The fiber was already `Done`; caller should invoke `cb` immediately.
    AlreadyDone,
}

pub(crate) struct AtomicStatus {
    inner: ArcSwap<Status>,
}

impl AtomicStatus {
    pub(crate) fn initial() -> Self {
        Self {
            inner: ArcSwap::new(Arc::new(Status::initial())),
        }
    }

    pub(crate) fn load(&self) -> Arc<Status> {
        self.inner.load_full()
    }

    /// Snapshot of the deferred defect a prior `kill()` merged in, if any.
    /// Read-only: does not itself consume or clear anything. A `Done` fiber
    /// never carries one (the interpreter has nothing left to die into).
    pub(crate) fn pending_defect(&self) -> Option<Defect> {
        match self.load().as_ref() {
            Status::Executing { error, .. } | Status::AsyncRegion { error, .. } => error.clone(),
            Status::Done(_) => None,
        }
    }

    /// Returns the new `reentrancy` count, which doubles as the async
    /// registration's `id`.
    pub(crate) fn enter_async_start(&self) -> usize {
        let out = Cell::new(0usize);
        self.inner.rcu(|cur| {
            let next = match cur.as_ref() {
                Status::Executing {
                    error,
                    joiners,
                    killers,
                } => {
                    out.set(1);
                    Status::AsyncRegion {
                        error: error.clone(),
                        reentrancy: 1,
                        resume: 1,
                        canceler: None,
                        joiners: joiners.clone(),
                        killers: killers.clone(),
                    }
                }
                Status::AsyncRegion {
                    error,
                    reentrancy,
                    resume,
                    canceler,
                    joiners,
                    killers,
                } => {
                    out.set(reentrancy + 1);
                    Status::AsyncRegion {
                        error: error.clone(),
                        reentrancy: reentrancy + 1,
                        resume: resume + 1,
                        canceler: canceler.clone(),
                        joiners: joiners.clone(),
                        killers: killers.clone(),
                    }
                }
                Status::Done(_) => {
                    panic!("rts: enterAsyncStart on a Done fiber, this is a bug");
                }
            };
            Arc::new(next)
        });
        out.get()
    }

    /// Installs `canceler` if the status is still in the `AsyncRegion`
    /// identified by `id`; stale calls (the region already advanced) are
    /// silently ignored.
    pub(crate) fn await_async(&self, id: usize, canceler: Canceler) {
        self.inner.rcu(|cur| match cur.as_ref() {
            Status::AsyncRegion {
                error,
                reentrancy,
                resume,
                joiners,
                killers,
                ..
            } if *reentrancy == id => Arc::new(Status::AsyncRegion {
                error: error.clone(),
                reentrancy: *reentrancy,
                resume: *resume,
                canceler: Some(canceler.clone()),
                joiners: joiners.clone(),
                killers: killers.clone(),
            }),
            _ => cur.clone(),
        });
    }

    pub(crate) fn enter_async_end(&self) {
        self.inner.rcu(|cur| match cur.as_ref() {
            Status::AsyncRegion {
                error,
                reentrancy: 1,
                resume: 0,
                joiners,
                killers,
                ..
            } => Arc::new(Status::Executing {
                error: error.clone(),
                joiners: joiners.clone(),
                killers: killers.clone(),
            }),
            Status::AsyncRegion {
                error,
                reentrancy,
                resume,
                canceler,
                joiners,
                killers,
            } if *reentrancy > 1 => Arc::new(Status::AsyncRegion {
                error: error.clone(),
                reentrancy: reentrancy - 1,
                resume: *resume,
                canceler: canceler.clone(),
                joiners: joiners.clone(),
                killers: killers.clone(),
            }),
            // Already raced to Done, or a reentrancy/resume combination that
            // doesn't match either arm above: a no-op, by design (see
            // module docs on `enterAsyncEnd`'s non-`AsyncRegion` case).
            other => Arc::new((**other).clone()),
        });
    }

    /// Returns `true` if this call consumed a pending resumption and the
    /// caller should proceed; `false` if the resumption is stale (the fiber
    /// already resolved through another path) and must be discarded.
    pub(crate) fn should_resume_async(&self) -> bool {
        let out = Cell::new(false);
        self.inner.rcu(|cur| match cur.as_ref() {
            Status::AsyncRegion {
                error,
                reentrancy: 0,
                resume: 1,
                joiners,
                killers,
                ..
            } => {
                out.set(true);
                Arc::new(Status::Executing {
                    error: error.clone(),
                    joiners: joiners.clone(),
                    killers: killers.clone(),
                })
            }
            Status::AsyncRegion {
                error,
                reentrancy,
                resume,
                joiners,
                killers,
                ..
            } if *resume > 0 => {
                out.set(true);
                Arc::new(Status::AsyncRegion {
                    error: error.clone(),
                    reentrancy: *reentrancy,
                    resume: resume - 1,
                    canceler: None,
                    joiners: joiners.clone(),
                    killers: killers.clone(),
                })
            }
            other => {
                out.set(false);
                Arc::new((**other).clone())
            }
        });
        out.get()
    }

    /// Transitions to `Done(v)`. Returns the joiners and killers to fan
    /// `v` out to, in arrival order, so the caller can submit them to the
    /// pool outside of the CAS loop.
    pub(crate) fn done(&self, v: ErasedExit) -> (Vec<Killer>, Vec<Joiner>) {
        let killers_out: Cell<Option<Vec<Killer>>> = Cell::new(None);
        let joiners_out: Cell<Option<Vec<Joiner>>> = Cell::new(None);
        let slot = Arc::new(DoneValue(v));
        self.inner.rcu(|cur| match cur.as_ref() {
            Status::Executing { joiners, killers }
            | Status::AsyncRegion {
                joiners, killers, ..
            } => {
                killers_out.set(Some(killers.clone()));
                joiners_out.set(Some(joiners.clone()));
                Arc::new(Status::Done(slot.clone()))
            }
            Status::Done(_) => panic!("rts: done() called twice on the same fiber"),
        });
        (
            killers_out.into_inner().unwrap_or_default(),
            joiners_out.into_inner().unwrap_or_default(),
        )
    }

    /// Registers a joiner. If the fiber is already `Done`, `cb` is invoked
    /// immediately (synchronously, on the calling thread) with the stored
    /// exit rather than being queued.
    pub(crate) fn join(&self, cb: Joiner) {
        let already_done: Cell<Option<Arc<DoneValue>>> = Cell::new(None);
        self.inner.rcu(|cur| match cur.as_ref() {
            Status::Executing {
                error,
                joiners,
                killers,
            } => {
                let mut joiners = joiners.clone();
                joiners.push(cb.clone());
                Arc::new(Status::Executing {
                    error: error.clone(),
                    joiners,
                    killers: killers.clone(),
                })
            }
            Status::AsyncRegion {
                error,
                reentrancy,
                resume,
                canceler,
                joiners,
                killers,
            } => {
                let mut joiners = joiners.clone();
                joiners.push(cb.clone());
                Arc::new(Status::AsyncRegion {
                    error: error.clone(),
                    reentrancy: *reentrancy,
                    resume: *resume,
                    canceler: canceler.clone(),
                    joiners,
                    killers: killers.clone(),
                })
            }
            Status::Done(slot) => {
                already_done.set(Some(slot.clone()));
                cur.clone()
            }
        });
        if let Some(slot) = already_done.into_inner() {
            cb(slot);
        }
    }

    /// Latches an interrupt. See module docs for the three distinct cases
    /// this can resolve to. `interruptible` is the caller's
    /// `FiberContext::is_interruptible()` snapshot (`noInterrupt == 0`):
    /// the direct-to-`Done` shortcut out of an unprotected `AsyncRegion`
    /// must not fire while the fiber is inside an `Uninterruptible` region,
    /// so that nesting stays latched until the fiber itself exits it.
    pub(crate) fn kill(&self, defect: Defect, cb: Killer, interruptible: bool) -> KillOutcome {
        let outcome: Cell<Option<KillOutcomeInner>> = Cell::new(None);
        self.inner.rcu(|cur| match cur.as_ref() {
            Status::Executing {
                error,
                joiners,
                killers,
            } => {
                outcome.set(Some(KillOutcomeInner::Deferred));
                let mut killers = killers.clone();
                killers.push(cb.clone());
                Arc::new(Status::Executing {
                    error: Some(error.clone().unwrap_or_else(|| defect.clone())),
                    joiners: joiners.clone(),
                    killers,
                })
            }
            Status::AsyncRegion {
                error: None,
                reentrancy,
                resume,
                canceler,
                joiners,
                killers,
            } if *resume > 0 && interruptible => {
                outcome.set(Some(KillOutcomeInner::WentDirectlyToDone {
                    canceler: canceler.clone(),
                    joiners: joiners.clone(),
                    killers: killers.clone(),
                }));
                let _ = reentrancy;
                Arc::new(Status::Done(Arc::new(DoneValue(ErasedExit::Terminated(
                    defect.clone(),
                )))))
            }
            Status::AsyncRegion {
                error,
                reentrancy,
                resume,
                canceler,
                joiners,
                killers,
            } => {
                outcome.set(Some(KillOutcomeInner::Deferred));
                let mut killers = killers.clone();
                killers.push(cb.clone());
                Arc::new(Status::AsyncRegion {
                    error: Some(error.clone().unwrap_or_else(|| defect.clone())),
                    reentrancy: *reentrancy,
                    resume: *resume,
                    canceler: canceler.clone(),
                    joiners: joiners.clone(),
                    killers,
                })
            }
            Status::Done(_) => {
                outcome.set(Some(KillOutcomeInner::AlreadyDone));
                cur.clone()
            }
        });
        match outcome.into_inner().expect("rcu always runs its closure") {
            KillOutcomeInner::Deferred => KillOutcome::Deferred,
            KillOutcomeInner::WentDirectlyToDone {
                canceler,
                joiners,
                killers,
            } => KillOutcome::WentDirectlyToDone {
                canceler,
                joiners,
                killers,
            },
            KillOutcomeInner::AlreadyDone => {
                cb();
                KillOutcome::AlreadyDone
            }
        }
    }
}

enum KillOutcomeInner {
    Deferred,
    WentDirectlyToDone {
        canceler: Option<Canceler>,
        joiners: Vec<Joiner>,
        killers: Vec<Killer>,
    },
    AlreadyDone,
}

impl Status {
    pub(crate) fn initial() -> Self {
        Status::Executing {
            error: None,
            joiners: Vec::new(),
            killers: Vec::new(),
        }
    }

    pub(crate) fn is_done(&self) -> bool {
        matches!(self, Status::Done(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn init_tracing() {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .with_test_writer()
            .try_init();
    }

    #[test]
    fn async_start_end_round_trips_to_executing() {
        init_tracing();
        let status = AtomicStatus::initial();
        let id = status.enter_async_start();
        assert_eq!(id, 1);
        assert!(status.should_resume_async());
        status.enter_async_end();
        assert!(!status.load().is_done());
    }

    #[test]
    fn join_after_done_fires_immediately() {
        init_tracing();
        let status = AtomicStatus::initial();
        let calls = Arc::new(AtomicUsize::new(0));
        let (killers, joiners) = status.done(ErasedExit::Completed(Box::new(42i32)));
        assert!(killers.is_empty());
        assert!(joiners.is_empty());

        let calls2 = calls.clone();
        let cb: Joiner = Arc::new(move |slot: Arc<DoneValue>| {
            if let ErasedExit::Completed(v) = &slot.0 {
                assert_eq!(*v.downcast_ref::<i32>().unwrap(), 42);
            }
            calls2.fetch_add(1, Ordering::SeqCst);
        });
        status.join(cb);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn kill_while_executing_is_deferred() {
        init_tracing();
        let status = AtomicStatus::initial();
        let outcome = status.kill(Defect::new("stop"), Arc::new(|| {}), true);
        assert!(matches!(outcome, KillOutcome::Deferred));
    }

    #[test]
    fn kill_in_unprotected_async_region_goes_directly_to_done() {
        init_tracing();
        let status = AtomicStatus::initial();
        status.enter_async_start();
        let outcome = status.kill(Defect::new("stop"), Arc::new(|| {}), true);
        assert!(matches!(outcome, KillOutcome::WentDirectlyToDone { .. }));
        assert!(status.load().is_done());
    }

    #[test]
    fn kill_in_uninterruptible_async_region_is_deferred_not_direct() {
        init_tracing();
        let status = AtomicStatus::initial();
        status.enter_async_start();
        let outcome = status.kill(Defect::new("stop"), Arc::new(|| {}), false);
        assert!(matches!(outcome, KillOutcome::Deferred));
        assert!(!status.load().is_done());
    }
}
