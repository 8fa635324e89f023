// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! The type-erased effect tree the interpreter walks, and the phantom-typed
//! [`IO`] wrapper that gives it a safe, typed public face.
//!
//! Every `A`/`E` that ever appears in a program built from `IO` combinators
//! is boxed as `Box<dyn Any + Send + Sync>` the moment it crosses into a
//! [`Node`].
//! The interpreter (`crate::interpreter`) never downcasts these boxes itself
//! — continuations close over the concrete type and downcast on entry, the
//! same way `kasync`'s task header erases a `Task<F, S>` behind a `VTable`
//! of function pointers rather than carrying `F` as a type parameter all the
//! way through the scheduler.

use crate::async_descriptor::AsyncDescriptor;
use crate::fiber::{Defect, Fiber};
use std::any::Any;
use std::fmt;
use std::marker::PhantomData;
use std::sync::Arc;
use std::time::Duration;

/// Every value that crosses into the erased interpreter is required to be
/// `Sync` as well as `Send`: `Status::Done` hands its stored result out to
/// any number of joiners by shared reference (see `crate::status`), the
/// same reason `tokio::sync::watch`/`broadcast` require their payload type
/// to be `Clone` — multiple readers, one slot.
pub(crate) type BoxAny = Box<dyn Any + Send + Sync>;

pub(crate) type Cont = Box<dyn FnOnce(BoxAny) -> Node + Send>;
pub(crate) type ErrCont = Box<dyn FnOnce(BoxAny) -> Node + Send>;

/// Built at [`IO::run`]'s call site, where `E`/`A` are still concrete: reads
/// a child's [`crate::status::ErasedExit`] (shared via `Arc` with every other
/// joiner of that fiber) and clones out a freshly boxed, owned
/// `ExitResult<E, A>`. Needs `Clone` on both type parameters since the
/// stored exit is never uniquely owned — `Status::Done` itself keeps a
/// reference to it forever, for any joiner that registers later.
pub(crate) type CloneExit = Box<dyn Fn(&crate::status::ErasedExit) -> BoxAny + Send + Sync>;

/// Same idea as [`CloneExit`], built at [`race`]'s call site: tells a race
/// arm's joiner how to turn its shared, borrowed exit into an owned
/// [`RaceArrival`] without needing to move anything out of the `Arc` it
/// arrived in.
pub(crate) type ExitCloner = Box<dyn Fn(&crate::status::ErasedExit) -> RaceArrival + Send + Sync>;

pub(crate) enum RaceArrival {
    Completed(BoxAny),
    Failed(BoxAny, Arc<str>),
    Terminated(Defect),
}

/// Built at [`async_register_effect`]'s call site: turns a registration
/// effect's `Failed` exit back into a fresh `Node::Fail` carrying the
/// concrete `E`, the same way [`CloneExit`] does for `Run`.
pub(crate) type ReraiseFail = Box<dyn Fn(&crate::status::ErasedExit) -> Node + Send + Sync>;

/// Called by a foreign event source to resume a suspended fiber. Cheaply
/// cloneable so both a canceler and the event source itself can hold one.
pub(crate) type ResumeCallback = Arc<dyn Fn(crate::async_descriptor::AsyncResult) + Send + Sync>;

/// A handler invoked with the [`Defect`] that reached the top of a fiber
/// unhandled: an uncaught `Terminate`, or a `Fail(E)` wrapped into a defect
/// via [`crate::error::UnhandledError`]'s `Debug` rendering. Both paths
/// funnel through one `defect -> IO[Nothing, Unit]`-shaped handler.
pub(crate) type UnhandledHandler = Arc<dyn Fn(Defect) -> Node + Send + Sync>;

/// The type-erased effect tree. Each variant corresponds to one row of the
/// node table: pure/lazy/sync values, sequencing, error handling, fibers,
/// async suspension, and structured supervision.
pub(crate) enum Node {
    Pure(BoxAny),
    Lazy(Box<dyn FnOnce() -> BoxAny + Send>),
    Sync(Box<dyn FnOnce() -> BoxAny + Send>),
    Sequence(Box<Node>, Cont),
    Redeem(Box<Node>, ErrCont, Cont),
    /// Carries the erased error alongside a `Debug`-rendered summary,
    /// computed eagerly at [`IO::fail`] construction while `E` is still a
    /// concrete type: if this `Fail` reaches the top of a fiber uncaught,
    /// the interpreter needs *something* printable for the unhandled
    /// handler without being able to downcast an unknown `E`.
    Fail(BoxAny, Arc<str>),
    Terminate(Defect),
    AsyncRegister(Box<dyn FnOnce(ResumeCallback) -> AsyncDescriptor + Send>),
    AsyncRegisterEffect(Box<dyn FnOnce(ResumeCallback) -> Node + Send>, ReraiseFail),
    Fork(Box<Node>, Option<UnhandledHandler>),
    Run(Box<Node>, CloneExit),
    Race(Box<Node>, Box<Node>, Cont, Cont, ExitCloner),
    Suspend(Box<dyn FnOnce() -> Node + Send>),
    Uninterruptible(Box<Node>),
    Sleep(Duration),
    Supervise(Box<Node>, Defect),
    Supervisor,
    Ensuring(Box<Node>, Box<Node>),
    Interrupt(Fiber, Defect),
}

impl fmt::Debug for Node {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let tag = match self {
            Node::Pure(_) => "Pure",
            Node::Lazy(_) => "Lazy",
            Node::Sync(_) => "Sync",
            Node::Sequence(..) => "Sequence",
            Node::Redeem(..) => "Redeem",
            Node::Fail(..) => "Fail",
            Node::Terminate(_) => "Terminate",
            Node::AsyncRegister(_) => "AsyncRegister",
            Node::AsyncRegisterEffect(..) => "AsyncRegisterEffect",
            Node::Fork(..) => "Fork",
            Node::Run(..) => "Run",
            Node::Race(..) => "Race",
            Node::Suspend(_) => "Suspend",
            Node::Uninterruptible(_) => "Uninterruptible",
            Node::Sleep(_) => "Sleep",
            Node::Supervise(..) => "Supervise",
            Node::Supervisor => "Supervisor",
            Node::Ensuring(..) => "Ensuring",
            Node::Interrupt(..) => "Interrupt",
        };
        f.write_str(tag)
    }
}

fn downcast<T: 'static>(b: BoxAny) -> T {
    *b.downcast::<T>()
        .unwrap_or_else(|_| panic!("rts: value erasure mismatch, this is a bug"))
}

/// A description of an effectful computation that produces an `A` or fails
/// with an `E`.
///
/// `IO` values are inert descriptions: building one does nothing. Only
/// handing it to [`crate::host::Rts`] (or a running fiber, via `fork`/`run`)
/// causes evaluation.
pub struct IO<E, A> {
    pub(crate) node: Node,
    _marker: PhantomData<fn() -> (E, A)>,
}

impl<E, A> IO<E, A> {
    pub(crate) fn from_node(node: Node) -> Self {
        Self {
            node,
            _marker: PhantomData,
        }
    }
}

impl<E, A> IO<E, A>
where
    E: Send + Sync + 'static,
    A: Send + Sync + 'static,
{
    pub fn pure(value: A) -> Self {
        Self::from_node(Node::Pure(Box::new(value)))
    }

    pub fn lazy(thunk: impl FnOnce() -> A + Send + 'static) -> Self {
        Self::from_node(Node::Lazy(Box::new(move || Box::new(thunk()))))
    }

    pub fn sync(thunk: impl FnOnce() -> A + Send + 'static) -> Self {
        Self::from_node(Node::Sync(Box::new(move || Box::new(thunk()))))
    }

    pub fn fail(error: E) -> Self
    where
        E: fmt::Debug,
    {
        let summary: Arc<str> = Arc::from(format!("{error:?}"));
        Self::from_node(Node::Fail(Box::new(error), summary))
    }

    pub fn terminate(defect: Defect) -> Self {
        Self::from_node(Node::Terminate(defect))
    }

    pub fn suspend(thunk: impl FnOnce() -> IO<E, A> + Send + 'static) -> Self {
        Self::from_node(Node::Suspend(Box::new(move || thunk().node)))
    }

    pub fn flat_map<B>(self, k: impl FnOnce(A) -> IO<E, B> + Send + 'static) -> IO<E, B>
    where
        B: Send + Sync + 'static,
    {
        let k: Cont = Box::new(move |v| k(downcast(v)).node);
        IO::from_node(Node::Sequence(Box::new(self.node), k))
    }

    pub fn map<B>(self, f: impl FnOnce(A) -> B + Send + 'static) -> IO<E, B>
    where
        B: Send + Sync + 'static,
    {
        self.flat_map(move |a| IO::pure(f(a)))
    }

    pub fn redeem<B>(
        self,
        on_err: impl FnOnce(E) -> IO<E, B> + Send + 'static,
        on_ok: impl FnOnce(A) -> IO<E, B> + Send + 'static,
    ) -> IO<E, B>
    where
        B: Send + Sync + 'static,
    {
        let err_cont: ErrCont = Box::new(move |e| on_err(downcast(e)).node);
        let ok_cont: Cont = Box::new(move |v| on_ok(downcast(v)).node);
        IO::from_node(Node::Redeem(Box::new(self.node), err_cont, ok_cont))
    }

    pub fn ensuring(self, finalizer: IO<std::convert::Infallible, ()>) -> Self {
        Self::from_node(Node::Ensuring(Box::new(self.node), Box::new(finalizer.node)))
    }

    pub fn uninterruptible(self) -> Self {
        Self::from_node(Node::Uninterruptible(Box::new(self.node)))
    }

    pub fn supervise(self, cause: Defect) -> Self {
        Self::from_node(Node::Supervise(Box::new(self.node), cause))
    }

    /// Forks this effect as a child fiber, returning a handle to it. The
    /// child inherits the forking fiber's unhandled handler; use
    /// [`IO::fork_with`] to install a different one for just this child.
    pub fn fork(self) -> IO<std::convert::Infallible, Fiber> {
        IO::from_node(Node::Fork(Box::new(self.node), None))
    }

    /// Like [`IO::fork`], but `on_unhandled` replaces the inherited handler
    /// for defects that escape this child uncaught (an uncaught `Terminate`,
    /// or its own `E` reaching the top of its fiber via `Fail`).
    pub fn fork_with(
        self,
        on_unhandled: impl Fn(Defect) -> IO<std::convert::Infallible, ()> + Send + Sync + 'static,
    ) -> IO<std::convert::Infallible, Fiber> {
        let handler: crate::node::UnhandledHandler =
            Arc::new(move |defect| on_unhandled(defect).node);
        IO::from_node(Node::Fork(Box::new(self.node), Some(handler)))
    }

    /// Runs this effect as a child fiber and observes its
    /// [`crate::exit::ExitResult`] rather than raising its error.
    pub fn run(self) -> IO<std::convert::Infallible, crate::exit::ExitResult<E, A>>
    where
        E: Clone,
        A: Clone,
    {
        let clone_exit: CloneExit = Box::new(|exit: &crate::status::ErasedExit| -> BoxAny {
            Box::new(clone_erased_exit::<E, A>(exit))
        });
        IO::from_node(Node::Run(Box::new(self.node), clone_exit))
    }
}

fn clone_erased_exit<E, A>(exit: &crate::status::ErasedExit) -> crate::exit::ExitResult<E, A>
where
    E: Clone + Send + Sync + 'static,
    A: Clone + Send + Sync + 'static,
{
    use crate::status::ErasedExit;
    match exit {
        ErasedExit::Completed(v) => crate::exit::ExitResult::Completed(
            v.downcast_ref::<A>()
                .unwrap_or_else(|| panic!("rts: value erasure mismatch, this is a bug"))
                .clone(),
        ),
        ErasedExit::Failed(v, _) => crate::exit::ExitResult::Failed(
            v.downcast_ref::<E>()
                .unwrap_or_else(|| panic!("rts: value erasure mismatch, this is a bug"))
                .clone(),
        ),
        ErasedExit::Terminated(d) => crate::exit::ExitResult::Terminated(d.clone()),
    }
}

pub fn sleep(duration: Duration) -> IO<std::convert::Infallible, ()> {
    IO::from_node(Node::Sleep(duration))
}

impl Fiber {
    /// Requests interruption of this fiber with `defect` as the cause.
    /// Latches immediately; the target fiber dies at its next interruptible
    /// step, or right away if it is currently suspended unprotected in an
    /// async region. The returned `IO` completes once the target has fully
    /// unwound (its finalizers have run and its status is `Done`).
    pub fn interrupt(&self, defect: Defect) -> IO<std::convert::Infallible, ()> {
        IO::from_node(Node::Interrupt(self.clone(), defect))
    }
}

/// A handle to the unhandled-defect handler the current fiber runs under.
/// Opaque on purpose: the only thing a program can do with one is re-invoke
/// it, e.g. to forward a defect caught by one subsystem into whatever the
/// surrounding fiber would otherwise have done with it.
pub struct Supervisor(pub(crate) UnhandledHandler);

impl Supervisor {
    pub fn handle(&self, defect: Defect) -> IO<std::convert::Infallible, ()> {
        IO::from_node((self.0)(defect))
    }
}

pub fn supervisor() -> IO<std::convert::Infallible, Supervisor> {
    IO::from_node(Node::Supervisor)
}

/// Races two effects, returning whichever the winning finisher combinator
/// produces. The loser keeps running; see the race coordinator's module
/// docs for why this version does not auto-interrupt it.
pub fn race<E, A, B>(
    left: IO<E, A>,
    right: IO<E, A>,
    finish_left: impl FnOnce(A) -> IO<E, B> + Send + 'static,
    finish_right: impl FnOnce(A) -> IO<E, B> + Send + 'static,
) -> IO<E, B>
where
    E: Clone + Send + Sync + 'static,
    A: Clone + Send + Sync + 'static,
    B: Send + Sync + 'static,
{
    let fl: Cont = Box::new(move |v| finish_left(downcast(v)).node);
    let fr: Cont = Box::new(move |v| finish_right(downcast(v)).node);
    let cloner: ExitCloner = Box::new(|exit: &crate::status::ErasedExit| -> RaceArrival {
        use crate::status::ErasedExit;
        match exit {
            ErasedExit::Completed(v) => RaceArrival::Completed(Box::new(
                v.downcast_ref::<A>()
                    .unwrap_or_else(|| panic!("rts: value erasure mismatch, this is a bug"))
                    .clone(),
            )),
            ErasedExit::Failed(v, s) => RaceArrival::Failed(
                Box::new(
                    v.downcast_ref::<E>()
                        .unwrap_or_else(|| panic!("rts: value erasure mismatch, this is a bug"))
                        .clone(),
                ),
                s.clone(),
            ),
            ErasedExit::Terminated(d) => RaceArrival::Terminated(d.clone()),
        }
    });
    IO::from_node(Node::Race(
        Box::new(left.node),
        Box::new(right.node),
        fl,
        fr,
        cloner,
    ))
}

/// Registers a callback-style async operation. `register` is handed a
/// resume callback it may call zero or more times from any thread; only
/// the first call after the fiber is ready to resume has any effect.
pub fn async_register<E, A>(
    register: impl FnOnce(ResumeCallback) -> AsyncDescriptor + Send + 'static,
) -> IO<E, A>
where
    E: Send + Sync + 'static,
    A: Send + Sync + 'static,
{
    IO::from_node(Node::AsyncRegister(Box::new(register)))
}

/// Like [`async_register`], but `register` performs the registration as an
/// effect of the surrounding fiber's own error type rather than returning a
/// descriptor directly: if that effect fails, the failure is this node's own
/// `Fail`, not a defect. Useful when registering means writing to some other
/// `IO`-shaped subsystem that can itself fail with `E`.
pub fn async_register_effect<E, A>(
    register: impl FnOnce(ResumeCallback) -> IO<E, ()> + Send + 'static,
) -> IO<E, A>
where
    E: Clone + fmt::Debug + Send + Sync + 'static,
    A: Send + Sync + 'static,
{
    let reraise: ReraiseFail = Box::new(|exit: &crate::status::ErasedExit| -> Node {
        use crate::status::ErasedExit;
        match exit {
            ErasedExit::Failed(v, _) => {
                let e = v
                    .downcast_ref::<E>()
                    .unwrap_or_else(|| panic!("rts: value erasure mismatch, this is a bug"))
                    .clone();
                let summary: Arc<str> = Arc::from(format!("{e:?}"));
                Node::Fail(Box::new(e), summary)
            }
            _ => unreachable!("rts: reraise only ever called on a Failed exit"),
        }
    });
    IO::from_node(Node::AsyncRegisterEffect(
        Box::new(move |cb| register(cb).node),
        reraise,
    ))
}
