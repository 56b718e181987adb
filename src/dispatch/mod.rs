//! Dispatcher abstraction: accepts ready work and eventually runs it.
//!
//! A dispatcher's only contract is that every scheduled job eventually runs
//! exactly once. There is no ordering guarantee across dispatchers, and none
//! within one beyond what a concrete implementation documents.
//!
//! Two implementations ship with the crate:
//!
//! - [`InlineDispatcher`] runs jobs immediately on the calling thread. Used
//!   for undispatched starts and in tests.
//! - [`PoolDispatcher`](pool::PoolDispatcher) runs jobs on a worker pool.
//!
//! [`default_dispatcher`] returns the process-wide pool installed by
//! [`Context::with_dispatcher_fallback`](crate::context::Context::with_dispatcher_fallback).

pub mod pool;

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, OnceLock};

use self::pool::PoolDispatcher;

/// A unit of ready work submitted to a dispatcher.
pub type Job = Box<dyn FnOnce() + Send + 'static>;

/// Accepts ready work and eventually executes it.
pub trait Dispatcher: Send + Sync + 'static {
    /// Submits a job. The job eventually runs exactly once; on which thread
    /// and in what order relative to other jobs is implementation-defined.
    fn schedule(&self, job: Job);

    /// Diagnostic name for this dispatcher.
    fn name(&self) -> &str {
        "dispatcher"
    }
}

/// Runs every job immediately on the calling thread.
///
/// Scheduling through this dispatcher is a plain function call; the
/// scheduled-job counter exists so tests can assert on dispatch hops.
#[derive(Debug, Default)]
pub struct InlineDispatcher {
    scheduled: AtomicU64,
}

impl InlineDispatcher {
    /// Creates a new inline dispatcher.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns how many jobs have been scheduled so far.
    #[must_use]
    pub fn jobs_scheduled(&self) -> u64 {
        self.scheduled.load(Ordering::Relaxed)
    }
}

impl Dispatcher for InlineDispatcher {
    fn schedule(&self, job: Job) {
        self.scheduled.fetch_add(1, Ordering::Relaxed);
        job();
    }

    fn name(&self) -> &str {
        "inline"
    }
}

static DEFAULT_DISPATCHER: OnceLock<Arc<PoolDispatcher>> = OnceLock::new();

/// Returns the process-wide default dispatcher.
///
/// The pool is created on first use and lives for the rest of the process.
/// Repeated calls return handles to the same pool, so dispatcher-identity
/// comparisons treat all fallback-installed dispatchers as equal.
#[must_use]
pub fn default_dispatcher() -> Arc<dyn Dispatcher> {
    let pool = DEFAULT_DISPATCHER.get_or_init(|| {
        let workers = std::thread::available_parallelism()
            .map_or(4, std::num::NonZeroUsize::get)
            .max(2);
        Arc::new(PoolDispatcher::new("weft-default", workers))
    });
    pool.clone() as Arc<dyn Dispatcher>
}
