//! Worker-pool dispatcher.
//!
//! Jobs are pushed onto a lock-free injector queue and drained by a set of
//! lazily spawned worker threads. Workers park on a condvar when the queue is
//! empty and are retired only at shutdown.
//!
//! The "eventually runs exactly once" contract holds across shutdown: workers
//! drain the queue before exiting, and a job scheduled after shutdown runs on
//! the scheduling thread itself.

use crossbeam_queue::SegQueue;
use parking_lot::{Condvar, Mutex};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;
use tracing::{debug, error};

use super::{Dispatcher, Job};

/// Safety net so a worker that raced past a notify still rechecks the queue.
const IDLE_PARK_TIMEOUT: Duration = Duration::from_millis(100);

/// A dispatcher backed by a pool of worker threads.
pub struct PoolDispatcher {
    inner: Arc<PoolInner>,
}

struct PoolInner {
    name: String,
    max_workers: usize,
    queue: SegQueue<Job>,
    /// Live worker threads.
    workers: AtomicUsize,
    /// Workers parked (or about to park) on the condvar.
    idle: AtomicUsize,
    scheduled: AtomicU64,
    shutdown: AtomicBool,
    lock: Mutex<()>,
    available: Condvar,
}

impl PoolDispatcher {
    /// Creates a pool with the given diagnostic name and worker cap.
    ///
    /// Threads are spawned lazily as jobs arrive, up to `max_workers`.
    ///
    /// # Panics
    ///
    /// Panics if `max_workers` is zero.
    #[must_use]
    pub fn new(name: impl Into<String>, max_workers: usize) -> Self {
        assert!(max_workers > 0, "pool needs at least one worker");
        Self {
            inner: Arc::new(PoolInner {
                name: name.into(),
                max_workers,
                queue: SegQueue::new(),
                workers: AtomicUsize::new(0),
                idle: AtomicUsize::new(0),
                scheduled: AtomicU64::new(0),
                shutdown: AtomicBool::new(false),
                lock: Mutex::new(()),
                available: Condvar::new(),
            }),
        }
    }

    /// Returns how many jobs have been scheduled so far.
    #[must_use]
    pub fn jobs_scheduled(&self) -> u64 {
        self.inner.scheduled.load(Ordering::Relaxed)
    }

    /// Returns the number of live worker threads.
    #[must_use]
    pub fn worker_count(&self) -> usize {
        self.inner.workers.load(Ordering::Relaxed)
    }

    /// Initiates shutdown. Queued jobs are drained, then workers exit.
    pub fn shutdown(&self) {
        self.inner.shutdown.store(true, Ordering::Release);
        let _guard = self.inner.lock.lock();
        self.inner.available.notify_all();
    }
}

impl Dispatcher for PoolDispatcher {
    fn schedule(&self, job: Job) {
        self.inner.scheduled.fetch_add(1, Ordering::Relaxed);
        if self.inner.shutdown.load(Ordering::Acquire) {
            // The pool no longer runs jobs; honor exactly-once here.
            run_job(&self.inner.name, job);
            return;
        }
        self.inner.queue.push(job);
        if self.inner.idle.load(Ordering::Acquire) == 0 {
            PoolInner::spawn_worker(&self.inner);
        }
        let _guard = self.inner.lock.lock();
        self.inner.available.notify_one();
    }

    fn name(&self) -> &str {
        &self.inner.name
    }
}

impl Drop for PoolDispatcher {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl std::fmt::Debug for PoolDispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PoolDispatcher")
            .field("name", &self.inner.name)
            .field("max_workers", &self.inner.max_workers)
            .field("workers", &self.inner.workers.load(Ordering::Relaxed))
            .field("idle", &self.inner.idle.load(Ordering::Relaxed))
            .field("scheduled", &self.inner.scheduled.load(Ordering::Relaxed))
            .finish()
    }
}

impl PoolInner {
    fn spawn_worker(this: &Arc<Self>) {
        loop {
            let count = this.workers.load(Ordering::Relaxed);
            if count >= this.max_workers {
                return;
            }
            if this
                .workers
                .compare_exchange(count, count + 1, Ordering::AcqRel, Ordering::Relaxed)
                .is_err()
            {
                continue;
            }
            let inner = this.clone();
            let spawned = thread::Builder::new()
                .name(format!("{}-{count}", this.name))
                .spawn(move || inner.run_worker());
            if let Err(err) = spawned {
                this.workers.fetch_sub(1, Ordering::AcqRel);
                error!(dispatcher = %this.name, error = %err, "failed to spawn worker thread");
            }
            return;
        }
    }

    fn run_worker(self: Arc<Self>) {
        debug!(dispatcher = %self.name, "worker started");
        loop {
            if let Some(job) = self.queue.pop() {
                run_job(&self.name, job);
                continue;
            }
            if self.shutdown.load(Ordering::Acquire) {
                break;
            }
            self.idle.fetch_add(1, Ordering::AcqRel);
            {
                let mut guard = self.lock.lock();
                // Recheck under the lock: schedule() pushes before locking,
                // so a job published before we parked is visible here.
                if self.queue.is_empty() && !self.shutdown.load(Ordering::Acquire) {
                    let _ = self
                        .available
                        .wait_for(&mut guard, IDLE_PARK_TIMEOUT);
                }
            }
            self.idle.fetch_sub(1, Ordering::AcqRel);
        }
        self.workers.fetch_sub(1, Ordering::AcqRel);
        debug!(dispatcher = %self.name, "worker exiting");
    }
}

fn run_job(name: &str, job: Job) {
    if catch_unwind(AssertUnwindSafe(job)).is_err() {
        error!(dispatcher = %name, "scheduled job panicked");
    }
}
