// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! A single background thread providing delayed one-shot submissions.
//!
//! `Sleep` and timeout-flavored async registrations are the only consumers
//! of delay scheduling this core needs; the source's hierarchical timer
//! wheel (`kasync::time::timer::Wheel`, six levels for efficient long-range
//! coalescing at OS-timer scale) is overkill here. A `BinaryHeap` ordered by
//! deadline plus a `Condvar` the submitting side can wake early is the
//! whole job.

use std::cmp::Ordering;
use std::collections::BinaryHeap;
use std::sync::atomic::{AtomicU64, Ordering as AtomicOrdering};
use std::sync::{Arc, Condvar, Mutex};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

type Job = Box<dyn FnOnce() + Send>;

struct Entry {
    deadline: Instant,
    id: u64,
    job: Job,
}

impl Eq for Entry {}
impl PartialEq for Entry {
    fn eq(&self, other: &Self) -> bool {
        self.deadline == other.deadline && self.id == other.id
    }
}
impl Ord for Entry {
    fn cmp(&self, other: &Self) -> Ordering {
        // `BinaryHeap` is a max-heap; reverse so the earliest deadline sorts
        // highest.
        other.deadline.cmp(&self.deadline).then(other.id.cmp(&self.id))
    }
}
impl PartialOrd for Entry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

struct Shared {
    queue: Mutex<BinaryHeap<Entry>>,
    condvar: Condvar,
    stop: std::sync::atomic::AtomicBool,
    next_id: AtomicU64,
    canceled: Mutex<std::collections::HashSet<u64>>,
}

/// A one-shot delayed submission. Dropping it does not cancel the job;
/// call [`CancelHandle::cancel`] explicitly.
pub(crate) struct CancelHandle {
    shared: Arc<Shared>,
    id: u64,
}

impl CancelHandle {
    pub(crate) fn cancel(&self) {
        self.shared.canceled.lock().unwrap().insert(self.id);
    }
}

/// Held behind `Arc` alongside [`crate::host::pool::Pool`], so shutdown
/// can't consume `self` either; see that type's docs for why.
pub(crate) struct ScheduledExecutor {
    shared: Arc<Shared>,
    thread: Mutex<Option<JoinHandle<()>>>,
}

impl ScheduledExecutor {
    pub(crate) fn new() -> Self {
        let shared = Arc::new(Shared {
            queue: Mutex::new(BinaryHeap::new()),
            condvar: Condvar::new(),
            stop: std::sync::atomic::AtomicBool::new(false),
            next_id: AtomicU64::new(0),
            canceled: Mutex::new(std::collections::HashSet::new()),
        });

        let loop_shared = shared.clone();
        let thread = std::thread::Builder::new()
            .name("rts-scheduler".to_string())
            .spawn(move || scheduler_loop(loop_shared))
            .expect("failed to spawn rts scheduler thread");

        Self {
            shared,
            thread: Mutex::new(Some(thread)),
        }
    }

    /// Schedules `job` to run once, after `delay`. A zero delay degrades to
    /// running as soon as the scheduler thread next wakes, matching the
    /// "schedule(thunk, 0) behaves like submit" collaborator contract.
    pub(crate) fn schedule(&self, job: Job, delay: Duration) -> CancelHandle {
        let id = self.shared.next_id.fetch_add(1, AtomicOrdering::Relaxed);
        let entry = Entry {
            deadline: Instant::now() + delay,
            id,
            job,
        };
        {
            let mut queue = self.shared.queue.lock().unwrap();
            queue.push(entry);
        }
        self.shared.condvar.notify_one();
        CancelHandle {
            shared: self.shared.clone(),
            id,
        }
    }

    /// Idempotent: a second call observes `thread` already taken and just
    /// returns `true` without blocking. Returns `false` if `timeout` elapses
    /// before the scheduler thread has exited.
    pub(crate) fn shutdown_and_wait(&self, timeout: Duration) -> bool {
        self.shared.stop.store(true, AtomicOrdering::SeqCst);
        self.shared.condvar.notify_all();
        let Some(thread) = self.thread.lock().unwrap().take() else {
            return true;
        };
        let (tx, rx) = std::sync::mpsc::channel();
        std::thread::Builder::new()
            .name("rts-scheduler-shutdown".to_string())
            .spawn(move || {
                let _ = thread.join();
                let _ = tx.send(());
            })
            .expect("failed to spawn rts scheduler shutdown watcher thread");
        rx.recv_timeout(timeout).is_ok()
    }
}

fn scheduler_loop(shared: Arc<Shared>) {
    loop {
        let mut queue = shared.queue.lock().unwrap();
        loop {
            if shared.stop.load(AtomicOrdering::SeqCst) {
                return;
            }
            match queue.peek() {
                None => {
                    queue = shared.condvar.wait(queue).unwrap();
                }
                Some(entry) => {
                    let now = Instant::now();
                    if entry.deadline <= now {
                        break;
                    }
                    let (guard, _timeout) = shared
                        .condvar
                        .wait_timeout(queue, entry.deadline - now)
                        .unwrap();
                    queue = guard;
                }
            }
        }

        let Entry { id, job, .. } = queue.pop().expect("peeked Some above");
        drop(queue);

        if shared.canceled.lock().unwrap().remove(&id) {
            continue;
        }
        job();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::mpsc;

    #[test]
    fn job_runs_after_delay() {
        let exec = ScheduledExecutor::new();
        let (tx, rx) = mpsc::channel();
        let start = Instant::now();
        exec.schedule(Box::new(move || tx.send(()).unwrap()), Duration::from_millis(20));
        rx.recv_timeout(Duration::from_secs(2)).unwrap();
        assert!(start.elapsed() >= Duration::from_millis(15));
        assert!(exec.shutdown_and_wait(Duration::from_secs(5)));
    }

    #[test]
    fn canceled_job_does_not_run() {
        let exec = ScheduledExecutor::new();
        let (tx, rx) = mpsc::channel::<()>();
        let handle = exec.schedule(Box::new(move || tx.send(()).unwrap()), Duration::from_millis(50));
        handle.cancel();
        assert!(rx.recv_timeout(Duration::from_millis(200)).is_err());
        assert!(exec.shutdown_and_wait(Duration::from_secs(5)));
    }
}
