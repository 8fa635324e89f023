// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! [`Rts`]: the host-facing entry point that owns the worker pool and
//! scheduled-delay executor every fiber runs on.

pub(crate) mod pool;
pub(crate) mod scheduled;

use crate::config::RtsConfig;
use crate::error::{JoinError, SpawnError, UnhandledError};
use crate::exit::ExitResult;
use crate::fiber::{Defect, Fiber, FiberContext, FiberId};
use crate::interpreter;
use crate::node::{IO, UnhandledHandler};
use crate::status::{DoneValue, ErasedExit};
use pool::Pool;
use scheduled::ScheduledExecutor;
use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex};
use std::time::Duration;

pub(crate) struct RtsInner {
    pub(crate) pool: Pool,
    pub(crate) scheduled: ScheduledExecutor,
    pub(crate) config: RtsConfig,
    /// Strong refs to every live (non-`Done`) fiber, keyed by id. A
    /// suspended fiber is otherwise reachable only through whoever holds
    /// its `Fiber` handle or resume callback, both of which user code is
    /// free to drop; this registry is what keeps it alive long enough for
    /// supervision and interruption to find it. Entries are inserted by
    /// [`interpreter::spawn`] and removed once the fiber reaches `Done`.
    fibers: Mutex<HashMap<FiberId, Arc<FiberContext>>>,
}

impl RtsInner {
    pub(crate) fn track_fiber(&self, ctx: Arc<FiberContext>) {
        self.fibers.lock().unwrap().insert(ctx.id(), ctx);
    }

    pub(crate) fn untrack_fiber(&self, id: FiberId) {
        self.fibers.lock().unwrap().remove(&id);
    }
}

/// The runtime host: owns the worker pool and scheduled-delay executor, and
/// is the entry point for turning an [`IO`] description into a running
/// fiber.
///
/// Cheaply cloneable; every clone shares the same pool, so dropping one
/// handle does not shut anything down — call [`Rts::unsafe_shutdown_and_wait`]
/// explicitly.
#[derive(Clone)]
pub struct Rts {
    inner: Arc<RtsInner>,
}

impl Default for Rts {
    fn default() -> Self {
        Self::new()
    }
}

impl Rts {
    pub fn new() -> Self {
        Self::with_config(RtsConfig::default())
    }

    pub fn with_config(config: RtsConfig) -> Self {
        Self {
            inner: Arc::new(RtsInner {
                pool: Pool::new(config.thread_pool_size),
                scheduled: ScheduledExecutor::new(),
                config,
                fibers: Mutex::new(HashMap::new()),
            }),
        }
    }

    /// Forks `io` as a top-level fiber under the default unhandled handler,
    /// returning a handle to it immediately without waiting for it to
    /// complete.
    pub fn fork<E, A>(&self, io: IO<E, A>) -> Result<Fiber, SpawnError>
    where
        E: Send + Sync + 'static,
        A: Send + Sync + 'static,
    {
        let ctx = FiberContext::new(default_unhandled_handler());
        let fiber = Fiber::new(ctx.clone());
        interpreter::spawn(ctx, self.inner.clone(), io.node).map_err(SpawnError::from)?;
        Ok(fiber)
    }

    /// Runs `io` to completion and returns its produced value, blocking the
    /// calling thread. Panics if `io` terminates with a defect (wrapped as
    /// [`JoinError`]) or fails with an unhandled `E` (wrapped as
    /// [`UnhandledError`]) rather than completing — callers that need to
    /// observe either case should use [`Rts::unsafe_run_sync`] instead.
    pub fn unsafe_run<E, A>(&self, io: IO<E, A>) -> A
    where
        E: fmt::Debug + Clone + Send + Sync + 'static,
        A: Clone + Send + Sync + 'static,
    {
        match self.unsafe_run_sync(io) {
            ExitResult::Completed(v) => v,
            ExitResult::Failed(e) => panic!("{}", UnhandledError(e)),
            ExitResult::Terminated(d) => panic!("{}", JoinError(d)),
        }
    }

    /// Runs `io` to completion and returns its full [`ExitResult`], blocking
    /// the calling thread.
    pub fn unsafe_run_sync<E, A>(&self, io: IO<E, A>) -> ExitResult<E, A>
    where
        E: Clone + Send + Sync + 'static,
        A: Clone + Send + Sync + 'static,
    {
        let ctx = FiberContext::new(default_unhandled_handler());
        let (tx, rx) = std::sync::mpsc::sync_channel(1);
        ctx.status.join(Arc::new(move |done: Arc<DoneValue>| {
            let _ = tx.send(done);
        }));
        let _ = interpreter::spawn(ctx, self.inner.clone(), io.node);
        let done = rx.recv().expect("a top-level fiber always reaches Done");
        exit_result_from_done(&done)
    }

    /// Runs `io` without blocking, invoking `on_exit` from a pool worker
    /// once it reaches [`ExitResult`].
    pub fn unsafe_run_async<E, A>(
        &self,
        io: IO<E, A>,
        on_exit: impl FnOnce(ExitResult<E, A>) + Send + Sync + 'static,
    ) where
        E: Clone + Send + Sync + 'static,
        A: Clone + Send + Sync + 'static,
    {
        let ctx = FiberContext::new(default_unhandled_handler());
        let on_exit = std::sync::Mutex::new(Some(on_exit));
        ctx.status.join(Arc::new(move |done: Arc<DoneValue>| {
            if let Some(on_exit) = on_exit.lock().unwrap().take() {
                on_exit(exit_result_from_done::<E, A>(&done));
            }
        }));
        let _ = interpreter::spawn(ctx, self.inner.clone(), io.node);
    }

    /// Stops accepting new top-level work and blocks until every pool
    /// worker and the scheduled-delay thread have exited, or until
    /// `timeout` elapses, whichever comes first. Idempotent. The scheduled
    /// executor is given first claim on the budget since sleeping fibers
    /// must be woken (or time out) before the workers that run them can
    /// drain.
    pub fn unsafe_shutdown_and_wait(&self, timeout: Duration) {
        let start = std::time::Instant::now();
        self.inner.scheduled.shutdown_and_wait(timeout);
        let remaining = timeout.saturating_sub(start.elapsed());
        self.inner.pool.shutdown_and_wait(remaining);
    }
}

fn exit_result_from_done<E, A>(done: &DoneValue) -> ExitResult<E, A>
where
    E: Clone + Send + Sync + 'static,
    A: Clone + Send + Sync + 'static,
{
    match &done.0 {
        ErasedExit::Completed(v) => ExitResult::Completed(
            v.downcast_ref::<A>()
                .unwrap_or_else(|| panic!("rts: value erasure mismatch, this is a bug"))
                .clone(),
        ),
        ErasedExit::Failed(v, _) => ExitResult::Failed(
            v.downcast_ref::<E>()
                .unwrap_or_else(|| panic!("rts: value erasure mismatch, this is a bug"))
                .clone(),
        ),
        ErasedExit::Terminated(d) => ExitResult::Terminated(d.clone()),
    }
}

/// Logs unhandled defects via `tracing` and takes no further action, the
/// default every top-level [`Rts`] entry point installs.
pub(crate) fn default_unhandled_handler() -> UnhandledHandler {
    Arc::new(|defect: Defect| {
        tracing::error!(%defect, "unhandled defect reached the top of a fiber");
        crate::node::Node::Pure(Box::new(()))
    })
}

/// Silently discards a defect, for internal sub-fibers (finalizer runners,
/// blocking registration effects) whose own failure is already reported by
/// whatever drove them.
pub(crate) fn noop_unhandled_handler() -> UnhandledHandler {
    Arc::new(|_defect: Defect| crate::node::Node::Pure(Box::new(())))
}
