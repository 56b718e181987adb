//! The resumable-unit interface the core consumes.
//!
//! A continuation is an opaque paused computation supplied by the caller. It
//! is resumed exactly once, from any thread, with the final outcome; the
//! single-shot contract is enforced by consuming the box.
//!
//! Any `FnOnce(Outcome<T, Error>) + Send` closure is a continuation, so
//! callers rarely implement the trait by hand.

use crate::error::Error;
use crate::types::Outcome;
use parking_lot::{Condvar, Mutex};
use std::sync::Arc;

/// A paused computation that can be resumed exactly once with a result or a
/// failure.
pub trait Continuation<T>: Send {
    /// Consumes the continuation, delivering the final outcome.
    ///
    /// Safe to invoke from any thread.
    fn resume_with(self: Box<Self>, outcome: Outcome<T, Error>);
}

impl<T, F> Continuation<T> for F
where
    F: FnOnce(Outcome<T, Error>) + Send,
{
    fn resume_with(self: Box<Self>, outcome: Outcome<T, Error>) {
        (*self)(outcome);
    }
}

/// Blocking adapter: hands out a continuation half and parks the owning
/// thread until that continuation is resumed.
pub(crate) struct Parker<T> {
    shared: Arc<ParkerShared<T>>,
}

struct ParkerShared<T> {
    slot: Mutex<Option<Outcome<T, Error>>>,
    ready: Condvar,
}

impl<T: Send + 'static> Parker<T> {
    pub(crate) fn new() -> Self {
        Self {
            shared: Arc::new(ParkerShared {
                slot: Mutex::new(None),
                ready: Condvar::new(),
            }),
        }
    }

    /// Returns the continuation half. Resuming it publishes the outcome and
    /// wakes [`wait`](Self::wait).
    pub(crate) fn continuation(&self) -> Box<dyn Continuation<T>> {
        let shared = self.shared.clone();
        Box::new(move |outcome: Outcome<T, Error>| {
            let mut slot = shared.slot.lock();
            debug_assert!(slot.is_none(), "parker continuation resumed twice");
            *slot = Some(outcome);
            shared.ready.notify_all();
        })
    }

    /// Blocks until the continuation half is resumed, then returns the
    /// delivered outcome.
    pub(crate) fn wait(self) -> Outcome<T, Error> {
        let mut slot = self.shared.slot.lock();
        while slot.is_none() {
            self.shared.ready.wait(&mut slot);
        }
        match slot.take() {
            Some(outcome) => outcome,
            None => unreachable!("parker slot drained while holding the lock"),
        }
    }
}
