// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! The single-fiber bytecode-style interpreter: `evaluate`/`step` walk one
//! `Node` at a time, pushing continuations and finalizers onto the fiber's
//! stack and yielding to the pool at suspension points.
//!
//! Every suspension point (async register, sleep, run, race) follows the
//! same shape: `enter_async_start` before registering, `enter_async_end`
//! after, and a resume closure that funnels back through [`resume`], which
//! re-enters [`evaluate`] either inline (bounded by `MaxResumptionDepth`) or
//! via a fresh pool submission. This mirrors the way `kasync`'s task wakers
//! re-submit a task to the executor rather than running the poll chain
//! straight through an arbitrary number of nested wakeups.

use crate::async_descriptor::{AsyncDescriptor, AsyncResult};
use crate::error::Closed;
use crate::fiber::{Defect, Fiber, FiberContext};
use crate::host::{noop_unhandled_handler, RtsInner};
use crate::node::{BoxAny, Cont, Node, RaceArrival, ReraiseFail, ResumeCallback};
use crate::race::RaceState;
use crate::stack::StackEntry;
use crate::status::{Canceler, DoneValue, ErasedExit, Killer, Status};
use std::sync::atomic::Ordering;
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// Submits `ctx` to the pool to start running `node`, registering it in
/// `rts`'s fiber registry first so it stays reachable while suspended even
/// if every `Fiber` handle and resume callback pointing at it is dropped.
/// The registry entry is removed again in [`finish`] (normal/typed/defect
/// completion) or in [`interrupt`]'s direct-to-`Done` path, whichever
/// reaches `Done` first.
pub(crate) fn spawn(ctx: Arc<FiberContext>, rts: Arc<RtsInner>, node: Node) -> Result<(), Closed> {
    rts.track_fiber(ctx.clone());
    let ctx2 = ctx.clone();
    let rts2 = rts.clone();
    let result = rts.pool.submit(Box::new(move || evaluate(ctx2, rts2, node, 0)));
    if result.is_err() {
        rts.untrack_fiber(ctx.id());
    }
    result
}

/// Checked right before an async suspension point commits to
/// [`Step::Suspended`]: an interrupt latched while the fiber was briefly
/// `Executing`, between the loop top's own check and this registration, is
/// otherwise never revisited, since nothing drives the fiber's loop again
/// until a resumption that will now never arrive. Runs `canceler` (if any)
/// and hands back the defect to terminate into instead.
fn check_killed_on_suspend(ctx: &Arc<FiberContext>, canceler: Option<&Canceler>) -> Option<Defect> {
    if !(ctx.is_killed() && ctx.is_interruptible()) {
        return None;
    }
    let defect = ctx.status.pending_defect()?;
    if let Some(c) = canceler {
        c(defect.clone());
    }
    Some(defect)
}

/// What a single `step()` call did with `cur`.
enum Step {
    /// Keep looping with this as the new `cur`.
    Next(Node),
    /// The fiber yielded control; some other call (a resume closure, a pool
    /// job) owns driving it onward, or it already reached `Done`.
    Suspended,
}

/// Runs `cur` to completion or suspension, possibly resuming a previously
/// suspended fiber (`depth` bounds how many such resumptions may recurse
/// through this call inline before resubmitting to the pool).
pub(crate) fn evaluate(ctx: Arc<FiberContext>, rts: Arc<RtsInner>, mut cur: Node, depth: usize) {
    let _span = tracing::debug_span!("fiber", id = %ctx.id()).entered();
    let mut op_count: u64 = 0;

    loop {
        if ctx.is_killed() && ctx.is_interruptible() {
            if let Some(defect) = ctx.status.pending_defect() {
                cur = Node::Terminate(defect);
                ctx.enter_uninterruptible();
            }
        }

        op_count += 1;
        if op_count >= rts.config.yield_max_op_count {
            tracing::trace!(op_count, "fiber yielding to pool");
            let ctx2 = ctx.clone();
            let rts2 = rts.clone();
            let _ = rts.pool.submit(Box::new(move || evaluate(ctx2, rts2, cur, 0)));
            return;
        }

        let outcome =
            std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| step(&ctx, &rts, cur, depth)));
        cur = match outcome {
            Ok(Step::Next(next)) => next,
            Ok(Step::Suspended) => return,
            Err(payload) => {
                ctx.enter_uninterruptible();
                Node::Terminate(Defect::from_panic(payload))
            }
        };
    }
}

fn step(ctx: &Arc<FiberContext>, rts: &Arc<RtsInner>, cur: Node, depth: usize) -> Step {
    match cur {
        Node::Pure(v) => produce_value(ctx, rts, v),
        Node::Lazy(thunk) => produce_value(ctx, rts, thunk()),
        Node::Sync(thunk) => produce_value(ctx, rts, thunk()),
        Node::Sequence(inner, k) => {
            ctx.stack.push(StackEntry::Cont(k));
            Step::Next(*inner)
        }
        Node::Redeem(inner, on_err, on_ok) => {
            ctx.stack.push(StackEntry::Redeem {
                on_err,
                on_ok,
            });
            Step::Next(*inner)
        }
        Node::Fail(value, debug) => handle_fail(ctx, rts, value, debug),
        Node::Terminate(defect) => handle_terminate(ctx, rts, defect),
        Node::AsyncRegister(register) => handle_async_register(ctx, rts, register, depth),
        Node::AsyncRegisterEffect(register, reraise) => {
            handle_async_register_effect(ctx, rts, register, reraise, depth)
        }
        Node::Fork(child, handler) => {
            let fiber = do_fork(ctx, rts, *child, handler);
            produce_value(ctx, rts, Box::new(fiber))
        }
        Node::Run(child, clone_exit) => handle_run(ctx, rts, *child, clone_exit, depth),
        Node::Race(left, right, finish_left, finish_right, cloner) => {
            handle_race(ctx, rts, *left, *right, finish_left, finish_right, cloner, depth)
        }
        Node::Suspend(thunk) => Step::Next(thunk()),
        Node::Uninterruptible(inner) => {
            ctx.enter_uninterruptible();
            let ctx2 = ctx.clone();
            let decrement: Cont = Box::new(move |v| {
                ctx2.exit_uninterruptible();
                Node::Pure(v)
            });
            Step::Next(Node::Sequence(inner, decrement))
        }
        Node::Sleep(duration) => handle_sleep(ctx, rts, duration, depth),
        Node::Supervise(inner, cause) => {
            ctx.scopes.enter();
            let ctx2 = ctx.clone();
            let rts2 = rts.clone();
            let finalizer = Node::Sync(Box::new(move || {
                interrupt_scope_children(&ctx2, &rts2, &cause);
                Box::new(())
            }));
            Step::Next(Node::Ensuring(inner, Box::new(finalizer)))
        }
        Node::Supervisor => produce_value(ctx, rts, Box::new(crate::node::Supervisor(ctx.unhandled.clone()))),
        Node::Ensuring(inner, finalizer) => {
            ctx.stack.push(StackEntry::Finalizer(*finalizer));
            Step::Next(*inner)
        }
        Node::Interrupt(target, defect) => {
            interrupt_and_wait(rts, &target, defect);
            produce_value(ctx, rts, Box::new(()))
        }
    }
}

/// Handles value production for Pure/Lazy/Sync: pops the next continuation
/// (if any) and applies it, or completes the fiber if the stack is empty.
fn produce_value(ctx: &Arc<FiberContext>, rts: &Arc<RtsInner>, value: BoxAny) -> Step {
    match ctx.stack.pop() {
        None => finish(ctx, rts, ErasedExit::Completed(value)),
        Some(StackEntry::Cont(k)) => Step::Next(k(value)),
        Some(StackEntry::Redeem { on_ok, .. }) => Step::Next(on_ok(value)),
        Some(StackEntry::Finalizer(fin)) => {
            run_and_report_finalizers(ctx, rts, vec![fin]);
            produce_value(ctx, rts, value)
        }
    }
}

/// Unwinds the stack looking for a `Redeem` error handler: pops everything,
/// collecting finalizers, discarding plain continuations, until either a
/// `Redeem` frame or the bottom of the stack is reached.
fn handle_fail(ctx: &Arc<FiberContext>, rts: &Arc<RtsInner>, value: BoxAny, debug: Arc<str>) -> Step {
    let mut finalizers = Vec::new();
    loop {
        match ctx.stack.pop() {
            None => {
                run_and_report_finalizers(ctx, rts, finalizers);
                let unhandled_defect = Defect::new(format!("unhandled error: {debug}"));
                dispatch_unhandled(rts, &ctx.unhandled, unhandled_defect);
                return finish(ctx, rts, ErasedExit::Failed(value, debug));
            }
            Some(StackEntry::Redeem { on_err, .. }) => {
                run_and_report_finalizers(ctx, rts, finalizers);
                return Step::Next(on_err(value));
            }
            Some(StackEntry::Finalizer(fin)) => finalizers.push(fin),
            Some(StackEntry::Cont(_)) => {}
        }
    }
}

/// Unwinds the entire stack: every frame is popped, `Redeem` handlers are
/// discarded outright, and only finalizers survive to run. Always fatal.
fn handle_terminate(ctx: &Arc<FiberContext>, rts: &Arc<RtsInner>, defect: Defect) -> Step {
    let mut finalizers = Vec::new();
    while let Some(entry) = ctx.stack.pop() {
        if let StackEntry::Finalizer(fin) = entry {
            finalizers.push(fin);
        }
    }
    run_and_report_finalizers(ctx, rts, finalizers);
    dispatch_unhandled(rts, &ctx.unhandled, defect.clone());
    finish(ctx, rts, ErasedExit::Terminated(defect))
}

/// Runs each collected finalizer (innermost-first, i.e. already in the
/// right reverse-chronological order from how the stack unwound) on an
/// isolated, uninterruptible sub-fiber, reporting any defect the finalizer
/// itself raises as an independent, separate unhandled report.
fn run_and_report_finalizers(ctx: &Arc<FiberContext>, rts: &Arc<RtsInner>, finalizers: Vec<Node>) {
    for fin in finalizers {
        let done = run_blocking(rts, fin);
        match &done.0 {
            ErasedExit::Completed(_) => {}
            ErasedExit::Failed(_, summary) => {
                dispatch_unhandled(
                    rts,
                    &ctx.unhandled,
                    Defect::new(format!(
                        "finalizer raised a typed failure despite its IO<Infallible, ()> typing: {summary}"
                    )),
                );
            }
            ErasedExit::Terminated(d) => dispatch_unhandled(rts, &ctx.unhandled, d.clone()),
        }
    }
}

/// Submits `defect` to `handler`, evaluating the `IO` it produces as a
/// detached, fire-and-forget fiber under the noop handler (a handler that
/// itself raises is not re-reported; see module docs on the unhandled
/// handler's own failure mode being out of scope).
fn dispatch_unhandled(rts: &Arc<RtsInner>, handler: &crate::node::UnhandledHandler, defect: Defect) {
    let node = handler(defect);
    let tmp_ctx = FiberContext::new(noop_unhandled_handler());
    let _ = spawn(tmp_ctx, rts.clone(), node);
}

/// Transitions the fiber to `Done` and fans `exit` out to every registered
/// joiner/killer: killers first, in arrival order, then joiners.
fn finish(ctx: &Arc<FiberContext>, rts: &Arc<RtsInner>, exit: ErasedExit) -> Step {
    let (killers, joiners) = ctx.status.done(exit);
    rts.untrack_fiber(ctx.id());
    let slot = match &*ctx.status.load() {
        Status::Done(slot) => slot.clone(),
        _ => unreachable!("rts: status must be Done immediately after done()"),
    };
    for killer in killers {
        let _ = rts.pool.submit(Box::new(move || killer()));
    }
    for joiner in joiners {
        let slot = slot.clone();
        let _ = rts.pool.submit(Box::new(move || joiner(slot)));
    }
    Step::Suspended
}

/// Blocks the calling worker thread until `node`, evaluated as an isolated
/// uninterruptible sub-fiber, reaches `Done`. Used for finalizers and for
/// the registration effect of [`Node::AsyncRegisterEffect`] — both cases
/// where the surrounding step genuinely cannot proceed until the nested
/// computation settles, but the nested computation is expected to be quick
/// and free of its own indefinite suspension.
fn run_blocking(rts: &Arc<RtsInner>, node: Node) -> Arc<DoneValue> {
    let tmp_ctx = FiberContext::new(noop_unhandled_handler());
    tmp_ctx.enter_uninterruptible();
    let (tx, rx) = std::sync::mpsc::sync_channel(1);
    tmp_ctx.status.join(Arc::new(move |done: Arc<DoneValue>| {
        let _ = tx.send(done);
    }));
    let _ = spawn(tmp_ctx, rts.clone(), node);
    rx.recv().expect("a run_blocking sub-fiber always reaches Done")
}

/// What a suspended fiber should do once its one expected resumption
/// arrives, expressed generically enough to cover a plain value, a
/// propagated typed failure, a propagated defect, or (for `Race`) a whole
/// new `Node` to flatten in.
pub(crate) enum ResumeStep {
    Value(BoxAny),
    Fail(BoxAny, Arc<str>),
    Terminate(Defect),
    Continue(Node),
}

fn resume_step_to_node(step: ResumeStep) -> Node {
    match step {
        ResumeStep::Value(v) => Node::Pure(v),
        ResumeStep::Fail(v, s) => Node::Fail(v, s),
        ResumeStep::Terminate(d) => Node::Terminate(d),
        ResumeStep::Continue(n) => n,
    }
}

/// The single entry point every suspension's resume closure calls through.
/// Discards stale resumptions (the fiber already resolved through another
/// path — an interrupt that raced straight to `Done`) via
/// `should_resume_async`, then either continues inline or resubmits to the
/// pool depending on `depth` against `MaxResumptionDepth`.
pub(crate) fn resume(ctx: Arc<FiberContext>, rts: Arc<RtsInner>, step: ResumeStep, depth: usize) {
    if !ctx.status.should_resume_async() {
        return;
    }
    let node = resume_step_to_node(step);
    if depth > rts.config.max_resumption_depth {
        let ctx2 = ctx.clone();
        let rts2 = rts.clone();
        let _ = rts.pool.submit(Box::new(move || evaluate(ctx2, rts2, node, 0)));
    } else {
        evaluate(ctx, rts, node, depth);
    }
}

fn make_resume_callback(ctx: Arc<FiberContext>, rts: Arc<RtsInner>, depth: usize) -> ResumeCallback {
    Arc::new(move |result: AsyncResult| {
        let step = match result {
            AsyncResult::Completed(v) => ResumeStep::Value(v),
            AsyncResult::Failed(v) => {
                ResumeStep::Fail(v, Arc::from("async registration raised a typed failure"))
            }
            AsyncResult::Terminated(d) => ResumeStep::Terminate(d),
        };
        resume(ctx.clone(), rts.clone(), step, depth + 1);
    })
}

/// Adapts a one-shot, argument-less [`crate::async_descriptor::Canceler`]
/// into the `Fn(Defect)` shape [`crate::status::AtomicStatus`] stores,
/// tolerating being "called" more than once (only the first actually runs
/// the underlying canceler) since the status machine's `Canceler` slot is a
/// `Fn`, not a `FnOnce`.
fn adapt_canceler(c: crate::async_descriptor::Canceler) -> Canceler {
    let cell = Mutex::new(Some(c));
    Arc::new(move |_defect: Defect| {
        if let Some(c) = cell.lock().unwrap().take() {
            c();
        }
    })
}

fn handle_async_register(
    ctx: &Arc<FiberContext>,
    rts: &Arc<RtsInner>,
    register: Box<dyn FnOnce(ResumeCallback) -> AsyncDescriptor + Send>,
    depth: usize,
) -> Step {
    let id = ctx.status.enter_async_start();
    let resume_cb = make_resume_callback(ctx.clone(), rts.clone(), depth);
    let descriptor = register(resume_cb);
    let outcome = match descriptor {
        AsyncDescriptor::Now(result) => {
            if ctx.status.should_resume_async() {
                let step = match result {
                    AsyncResult::Completed(v) => ResumeStep::Value(v),
                    AsyncResult::Failed(v) => {
                        ResumeStep::Fail(v, Arc::from("async registration raised a typed failure"))
                    }
                    AsyncResult::Terminated(d) => ResumeStep::Terminate(d),
                };
                Step::Next(resume_step_to_node(step))
            } else {
                Step::Suspended
            }
        }
        AsyncDescriptor::MaybeLater(canceler) => {
            let adapted = canceler.map(adapt_canceler);
            if let Some(c) = adapted.clone() {
                ctx.status.await_async(id, c);
            }
            match check_killed_on_suspend(ctx, adapted.as_ref()) {
                Some(defect) => Step::Next(Node::Terminate(defect)),
                None => Step::Suspended,
            }
        }
        AsyncDescriptor::MaybeLaterIo(io_opt) => {
            let adapted = io_opt.map(|io| {
                let rts2 = rts.clone();
                let cell = Mutex::new(Some(io.node));
                let canceler: Canceler = Arc::new(move |_defect: Defect| {
                    if let Some(node) = cell.lock().unwrap().take() {
                        let tmp_ctx = FiberContext::new(noop_unhandled_handler());
                        let _ = spawn(tmp_ctx, rts2.clone(), node);
                    }
                });
                canceler
            });
            if let Some(c) = adapted.clone() {
                ctx.status.await_async(id, c);
            }
            match check_killed_on_suspend(ctx, adapted.as_ref()) {
                Some(defect) => Step::Next(Node::Terminate(defect)),
                None => Step::Suspended,
            }
        }
    };
    ctx.status.enter_async_end();
    outcome
}

/// `AsyncRegisterEffect`'s registering function performs the registration
/// as an `IO<E, ()>` of the surrounding fiber's own error type. That IO is
/// run to completion on an isolated blocking sub-fiber (the registration
/// itself is expected to be quick, unlike the eventual external resumption
/// it sets up); its own `Failed`/`Terminated` become this node's own
/// `Fail`/`Terminate`, and a plain `Completed(())` leaves the fiber
/// suspended awaiting the external resume callback already installed.
fn handle_async_register_effect(
    ctx: &Arc<FiberContext>,
    rts: &Arc<RtsInner>,
    register: Box<dyn FnOnce(ResumeCallback) -> Node + Send>,
    reraise: ReraiseFail,
    depth: usize,
) -> Step {
    ctx.status.enter_async_start();
    let resume_cb = make_resume_callback(ctx.clone(), rts.clone(), depth);
    let registration_node = register(resume_cb);
    let done = run_blocking(rts, registration_node);
    ctx.status.enter_async_end();
    match &done.0 {
        ErasedExit::Completed(_) => Step::Suspended,
        ErasedExit::Terminated(d) => Step::Next(Node::Terminate(d.clone())),
        failed @ ErasedExit::Failed(..) => Step::Next(reraise(failed)),
    }
}

fn do_fork(
    ctx: &Arc<FiberContext>,
    rts: &Arc<RtsInner>,
    child_node: Node,
    handler: Option<crate::node::UnhandledHandler>,
) -> Fiber {
    let child_handler = handler.unwrap_or_else(|| ctx.unhandled.clone());
    let child_ctx = FiberContext::new(child_handler);
    ctx.scopes.track(&child_ctx);
    let fiber = Fiber::new(child_ctx.clone());
    let _ = spawn(child_ctx, rts.clone(), child_node);
    fiber
}

/// `Run` forks `child`, then suspends awaiting its completion; the resumed
/// value is always a plain value (never a `Fail`/`Terminate` of its own —
/// the child's outcome, whatever it was, is wrapped into a `Completed`
/// `ExitResult<E, A>` by `clone_exit`).
fn handle_run(
    ctx: &Arc<FiberContext>,
    rts: &Arc<RtsInner>,
    child_node: Node,
    clone_exit: crate::node::CloneExit,
    depth: usize,
) -> Step {
    let child = do_fork(ctx, rts, child_node, None);
    ctx.status.enter_async_start();
    let ctx2 = ctx.clone();
    let rts2 = rts.clone();
    child.ctx.status.join(Arc::new(move |done: Arc<DoneValue>| {
        let value = clone_exit(&done.0);
        resume(ctx2.clone(), rts2.clone(), ResumeStep::Value(value), depth + 1);
    }));
    ctx.status.enter_async_end();
    Step::Suspended
}

/// Forks both sides, then lets whichever completion arrives first (per
/// [`RaceState`]'s CAS protocol) drive the resume; the other side is left
/// running untouched rather than auto-interrupted.
#[allow(clippy::too_many_arguments)]
fn handle_race(
    ctx: &Arc<FiberContext>,
    rts: &Arc<RtsInner>,
    left: Node,
    right: Node,
    finish_left: Cont,
    finish_right: Cont,
    cloner: crate::node::ExitCloner,
    depth: usize,
) -> Step {
    let left_fiber = do_fork(ctx, rts, left, None);
    let right_fiber = do_fork(ctx, rts, right, None);
    let state = Arc::new(RaceState::new());
    let cloner = Arc::new(cloner);

    ctx.status.enter_async_start();
    register_race_arm(ctx, rts, &left_fiber, state.clone(), cloner.clone(), finish_left, depth);
    register_race_arm(ctx, rts, &right_fiber, state, cloner, finish_right, depth);
    ctx.status.enter_async_end();
    Step::Suspended
}

fn register_race_arm(
    ctx: &Arc<FiberContext>,
    rts: &Arc<RtsInner>,
    fiber: &Fiber,
    state: Arc<RaceState>,
    cloner: Arc<crate::node::ExitCloner>,
    finish: Cont,
    depth: usize,
) {
    let ctx2 = ctx.clone();
    let rts2 = rts.clone();
    let finish = Mutex::new(Some(finish));
    fiber.ctx.status.join(Arc::new(move |done: Arc<DoneValue>| {
        let completed = matches!(&done.0, ErasedExit::Completed(_));
        if !state.arrive(completed) {
            return;
        }
        let Some(finish) = finish.lock().unwrap().take() else {
            return;
        };
        let step = match cloner(&done.0) {
            RaceArrival::Completed(v) => ResumeStep::Continue(finish(v)),
            RaceArrival::Failed(v, s) => ResumeStep::Fail(v, s),
            RaceArrival::Terminated(d) => ResumeStep::Terminate(d),
        };
        resume(ctx2.clone(), rts2.clone(), step, depth + 1);
    }));
}

fn handle_sleep(ctx: &Arc<FiberContext>, rts: &Arc<RtsInner>, duration: Duration, depth: usize) -> Step {
    let id = ctx.status.enter_async_start();
    let ctx2 = ctx.clone();
    let rts2 = rts.clone();
    let handle = rts.scheduled.schedule(
        Box::new(move || {
            resume(ctx2.clone(), rts2.clone(), ResumeStep::Value(Box::new(())), depth + 1);
        }),
        duration,
    );
    let canceler: Canceler = Arc::new(move |_defect: Defect| {
        handle.cancel();
    });
    ctx.status.await_async(id, canceler.clone());
    let outcome = match check_killed_on_suspend(ctx, Some(&canceler)) {
        Some(defect) => Step::Next(Node::Terminate(defect)),
        None => Step::Suspended,
    };
    ctx.status.enter_async_end();
    outcome
}

fn interrupt_scope_children(ctx: &Arc<FiberContext>, rts: &Arc<RtsInner>, cause: &Defect) {
    for child in ctx.scopes.exit() {
        interrupt_and_wait(rts, &child, cause.clone());
    }
}

/// Blocking variant of [`interrupt`] for callers (Supervise's scope exit,
/// `Node::Interrupt`) that must not proceed until the target has fully
/// settled.
fn interrupt_and_wait(rts: &Arc<RtsInner>, fiber: &Fiber, defect: Defect) {
    let (tx, rx) = std::sync::mpsc::sync_channel(1);
    let tx = Mutex::new(Some(tx));
    interrupt(
        rts,
        &fiber.ctx,
        defect,
        Arc::new(move || {
            if let Some(tx) = tx.lock().unwrap().take() {
                let _ = tx.send(());
            }
        }),
    );
    let _ = rx.recv();
}

/// Latches `defect` against `target_ctx` via [`crate::status::AtomicStatus::kill`]
/// and performs whatever follow-up that call hands back: nothing (deferred
/// to the target's own next interruptible step), an immediate `cb()` (already
/// done), or — when the target was suspended unprotected in an async region —
/// the full direct-to-`Done` unwind this function performs itself, since that
/// path bypasses the target's own `evaluate` loop entirely.
fn interrupt(rts: &Arc<RtsInner>, target_ctx: &Arc<FiberContext>, defect: Defect, cb: Killer) {
    target_ctx.killed.store(true, Ordering::Release);
    let interruptible = target_ctx.is_interruptible();
    match target_ctx.status.kill(defect.clone(), cb.clone(), interruptible) {
        crate::status::KillOutcome::Deferred | crate::status::KillOutcome::AlreadyDone => {}
        crate::status::KillOutcome::WentDirectlyToDone {
            canceler,
            joiners,
            killers,
        } => {
            rts.untrack_fiber(target_ctx.id());
            if let Some(c) = canceler {
                let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| c(defect.clone())));
                if let Err(payload) = result {
                    dispatch_unhandled(rts, &target_ctx.unhandled, Defect::from_panic(payload));
                }
            }
            let mut finalizers = Vec::new();
            while let Some(entry) = target_ctx.stack.pop() {
                if let StackEntry::Finalizer(fin) = entry {
                    finalizers.push(fin);
                }
            }
            run_and_report_finalizers(target_ctx, rts, finalizers);
            dispatch_unhandled(rts, &target_ctx.unhandled, defect.clone());
            let slot = match &*target_ctx.status.load() {
                Status::Done(slot) => slot.clone(),
                _ => unreachable!("rts: status must be Done after a direct kill"),
            };
            for killer in killers {
                let _ = rts.pool.submit(Box::new(move || killer()));
            }
            for joiner in joiners {
                let slot = slot.clone();
                let _ = rts.pool.submit(Box::new(move || joiner(slot)));
            }
            cb();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RtsConfig;
    use crate::exit::ExitResult;
    use crate::host::Rts;
    use crate::node::IO;
    use std::sync::atomic::AtomicU32;
    use std::time::Duration;

    fn init_tracing() {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .with_test_writer()
            .try_init();
    }

    fn small_rts() -> Rts {
        Rts::with_config(RtsConfig::builder().thread_pool_size(2).build())
    }

    #[test]
    fn pure_value_completes() {
        init_tracing();
        let rts = small_rts();
        let got = rts.unsafe_run(IO::<std::convert::Infallible, _>::pure(42));
        assert_eq!(got, 42);
    }

    #[test]
    fn deep_flat_map_chain_does_not_blow_the_stack() {
        init_tracing();
        let rts = small_rts();
        let mut io = IO::<std::convert::Infallible, i64>::pure(0);
        for _ in 0..200_000 {
            io = io.flat_map(|n| IO::pure(n + 1));
        }
        assert_eq!(rts.unsafe_run(io), 200_000);
    }

    #[test]
    fn fail_reaches_redeem_handler() {
        init_tracing();
        let rts = small_rts();
        let io: IO<&'static str, i32> = IO::fail("boom").redeem(|_e| IO::pure(-1), IO::pure);
        let exit = rts.unsafe_run_sync(io);
        assert!(matches!(exit, ExitResult::Completed(-1)));
    }

    #[test]
    fn uncaught_fail_surfaces_as_failed() {
        init_tracing();
        let rts = small_rts();
        let io: IO<&'static str, i32> = IO::fail("boom");
        let exit = rts.unsafe_run_sync(io);
        assert!(matches!(exit, ExitResult::Failed("boom")));
    }

    #[test]
    fn finalizer_runs_on_success() {
        init_tracing();
        let rts = small_rts();
        let ran = Arc::new(AtomicU32::new(0));
        let ran2 = ran.clone();
        let io: IO<std::convert::Infallible, i32> = IO::pure(1).ensuring(IO::sync(move || {
            ran2.fetch_add(1, Ordering::SeqCst);
        }));
        assert_eq!(rts.unsafe_run(io), 1);
        assert_eq!(ran.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn finalizer_defect_does_not_change_surrounding_outcome() {
        init_tracing();
        let rts = small_rts();
        let io: IO<std::convert::Infallible, i32> =
            IO::pure(1).ensuring(IO::terminate(Defect::new("boom")));
        let exit = rts.unsafe_run_sync(io);
        assert!(matches!(exit, ExitResult::Completed(1)));
    }

    #[test]
    fn finalizer_runs_on_fail_before_redeem() {
        init_tracing();
        let rts = small_rts();
        let ran = Arc::new(AtomicU32::new(0));
        let ran2 = ran.clone();
        let io: IO<&'static str, i32> = IO::fail("boom")
            .ensuring(IO::sync(move || {
                ran2.fetch_add(1, Ordering::SeqCst);
            }))
            .redeem(|_e| IO::pure(7), IO::pure);
        assert_eq!(rts.unsafe_run(io), 7);
        assert_eq!(ran.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn sleep_completes_after_delay() {
        init_tracing();
        let rts = small_rts();
        let start = std::time::Instant::now();
        rts.unsafe_run(crate::node::sleep(Duration::from_millis(20)));
        assert!(start.elapsed() >= Duration::from_millis(15));
    }

    #[test]
    fn run_observes_child_exit_result() {
        init_tracing();
        let rts = small_rts();
        let child: IO<&'static str, i32> = IO::fail("nope");
        let io = child.run();
        let exit = rts.unsafe_run(io);
        assert!(matches!(exit, ExitResult::Failed("nope")));
    }

    #[test]
    fn race_winner_drives_the_result() {
        init_tracing();
        let rts = small_rts();
        let fast: IO<std::convert::Infallible, i32> = IO::pure(1);
        let slow: IO<std::convert::Infallible, i32> =
            crate::node::sleep(Duration::from_millis(200)).map(|()| 2);
        let io = crate::node::race(fast, slow, IO::pure, IO::pure);
        assert_eq!(rts.unsafe_run(io), 1);
    }

    #[test]
    fn interrupt_during_async_terminates_child() {
        init_tracing();
        let rts = small_rts();
        let never: IO<std::convert::Infallible, ()> =
            crate::node::async_register(|_resume| AsyncDescriptor::MaybeLater(None));
        let fiber = rts.fork(never).unwrap();
        std::thread::sleep(Duration::from_millis(20));
        rts.unsafe_run(fiber.interrupt(Defect::new("stop")));
        assert!(fiber.is_killed());
    }

    #[test]
    fn supervise_interrupts_leaked_fiber() {
        init_tracing();
        let rts = small_rts();
        let never: IO<std::convert::Infallible, ()> =
            crate::node::async_register(|_resume| AsyncDescriptor::MaybeLater(None));
        let child_ran = Arc::new(AtomicU32::new(0));
        let child_ran2 = child_ran.clone();
        let io: IO<std::convert::Infallible, i32> = never
            .fork_with(move |_defect| {
                child_ran2.fetch_add(1, Ordering::SeqCst);
                IO::pure(())
            })
            .flat_map(|_fiber| IO::pure(0))
            .supervise(Defect::new("scope"));
        assert_eq!(rts.unsafe_run(io), 0);
        std::thread::sleep(Duration::from_millis(50));
        assert_eq!(child_ran.load(Ordering::SeqCst), 1);
    }
}
