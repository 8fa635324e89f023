// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! The fixed-size worker pool fibers run on.
//!
//! Adapted from the work-stealing shape of `kasync::executor::{Executor,
//! Worker}`: each worker owns a local run queue and only reaches for the
//! shared injector or a sibling's queue when its own is empty. Where the
//! source hand-rolls `Injector`/`Stealer` for a `no_std` target, this uses
//! `crossbeam-deque` directly; where it parks workers through a custom
//! `Parker`/`ParkingLot`, this uses a plain `Condvar`.

use crate::error::Closed;
use crossbeam_deque::{Injector, Steal, Stealer, Worker as LocalQueue};
use crossbeam_utils::CachePadded;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{mpsc, Arc, Condvar, Mutex};
use std::thread::JoinHandle;
use std::time::Duration;

pub(crate) type Job = Box<dyn FnOnce() + Send>;

struct Shared {
    injector: Injector<Job>,
    stealers: Vec<Stealer<Job>>,
    stop: AtomicBool,
    pending: CachePadded<AtomicUsize>,
    parking_lot: Mutex<()>,
    condvar: Condvar,
}

/// A fixed-size, work-stealing thread pool for submitting host-level jobs:
/// fiber evaluator invocations, completion fanout, and unhandled-error
/// reports.
///
/// Held behind `Arc` by every fiber it runs, so shutdown can't consume
/// `self` the way the source's one-shot thread pool wrappers often do;
/// `shutdown_and_wait` takes the workers out of a `Mutex` instead.
pub(crate) struct Pool {
    shared: Arc<Shared>,
    workers: Mutex<Option<Vec<JoinHandle<()>>>>,
}

impl Pool {
    pub(crate) fn new(size: usize) -> Self {
        let locals: Vec<LocalQueue<Job>> = (0..size).map(|_| LocalQueue::new_fifo()).collect();
        let stealers = locals.iter().map(LocalQueue::stealer).collect();

        let shared = Arc::new(Shared {
            injector: Injector::new(),
            stealers,
            stop: AtomicBool::new(false),
            pending: CachePadded::new(AtomicUsize::new(0)),
            parking_lot: Mutex::new(()),
            condvar: Condvar::new(),
        });

        let workers = locals
            .into_iter()
            .enumerate()
            .map(|(id, local)| {
                let shared = shared.clone();
                std::thread::Builder::new()
                    .name(format!("rts-worker-{id}"))
                    .spawn(move || worker_loop(id, local, shared))
                    .expect("failed to spawn rts worker thread")
            })
            .collect();

        Self {
            shared,
            workers: Mutex::new(Some(workers)),
        }
    }

    /// Schedules `job` to run once, as soon as a worker is free. Fails if
    /// the pool has already been told to shut down.
    pub(crate) fn submit(&self, job: Job) -> Result<(), Closed> {
        if self.shared.stop.load(Ordering::SeqCst) {
            return Err(Closed(()));
        }
        self.shared.pending.fetch_add(1, Ordering::Relaxed);
        self.shared.injector.push(job);
        self.shared.condvar.notify_one();
        Ok(())
    }

    /// Idempotent: a second call observes `workers` already taken and just
    /// returns `true` without blocking. Returns `false` if `timeout` elapses
    /// before every worker has exited; the workers are left to finish on
    /// their own in that case (there is no way to force-join a thread).
    pub(crate) fn shutdown_and_wait(&self, timeout: Duration) -> bool {
        self.shared.stop.store(true, Ordering::SeqCst);
        self.shared.condvar.notify_all();
        let Some(workers) = self.workers.lock().unwrap().take() else {
            return true;
        };
        let (tx, rx) = mpsc::channel();
        std::thread::Builder::new()
            .name("rts-pool-shutdown".to_string())
            .spawn(move || {
                for worker in workers {
                    let _ = worker.join();
                }
                let _ = tx.send(());
            })
            .expect("failed to spawn rts pool shutdown watcher thread");
        rx.recv_timeout(timeout).is_ok()
    }
}

fn worker_loop(id: usize, local: LocalQueue<Job>, shared: Arc<Shared>) {
    let rng = fastrand::Rng::with_seed(id as u64);
    loop {
        if let Some(job) = find_job(&local, &shared, &rng) {
            shared.pending.fetch_sub(1, Ordering::Relaxed);
            job();
            continue;
        }

        if shared.stop.load(Ordering::SeqCst) {
            return;
        }

        let guard = shared.parking_lot.lock().unwrap();
        if shared.pending.load(Ordering::Relaxed) > 0 || shared.stop.load(Ordering::SeqCst) {
            continue;
        }
        let _ = shared
            .condvar
            .wait_timeout(guard, std::time::Duration::from_millis(50))
            .unwrap();
    }
}

fn find_job(local: &LocalQueue<Job>, shared: &Shared, rng: &fastrand::Rng) -> Option<Job> {
    if let Some(job) = local.pop() {
        return Some(job);
    }

    loop {
        match shared.injector.steal_batch_and_pop(local) {
            Steal::Success(job) => return Some(job),
            Steal::Retry => continue,
            Steal::Empty => break,
        }
    }

    let start = rng.usize(..shared.stealers.len().max(1));
    for offset in 0..shared.stealers.len() {
        let victim = (start + offset) % shared.stealers.len();
        loop {
            match shared.stealers[victim].steal_batch_and_pop(local) {
                Steal::Success(job) => return Some(job),
                Steal::Retry => continue,
                Steal::Empty => break,
            }
        }
    }

    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::mpsc;

    #[test]
    fn submitted_jobs_run() {
        let pool = Pool::new(2);
        let (tx, rx) = mpsc::channel();
        for i in 0..100 {
            let tx = tx.clone();
            pool.submit(Box::new(move || tx.send(i).unwrap())).unwrap();
        }
        drop(tx);
        let mut got: Vec<i32> = rx.iter().collect();
        got.sort_unstable();
        assert_eq!(got, (0..100).collect::<Vec<_>>());
        assert!(pool.shutdown_and_wait(Duration::from_secs(5)));
    }
}
