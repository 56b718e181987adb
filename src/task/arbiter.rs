//! The suspend/resume decision arbiter.
//!
//! When a caller hands work to another dispatcher and waits for the result,
//! the body may finish before the caller is done registering to wait. Naively
//! that either deadlocks (the resume fired into nothing and the caller parks
//! forever) or double-resumes. The arbiter is a tri-state atomic flag that
//! decides, exactly once, which side arrived first:
//!
//! - the consumer calls [`try_suspend`](DecisionArbiter::try_suspend) and
//!   either actually parks or learns the result is already stored;
//! - the producer stores the result, then calls
//!   [`try_resume`](DecisionArbiter::try_resume) and either learns nobody is
//!   parked yet or performs the actual wake.
//!
//! Each role runs exactly once per rendezvous. A second `try_suspend` or
//! `try_resume` is a consistency violation and panics; it must never be
//! caught.

use std::sync::atomic::{AtomicU8, Ordering};

const UNDECIDED: u8 = 0;
const SUSPENDED: u8 = 1;
const RESUMED: u8 = 2;

/// Allocation-free CAS rendezvous between one suspending consumer and one
/// resuming producer, where either may arrive first.
#[derive(Debug)]
pub(crate) struct DecisionArbiter {
    state: AtomicU8,
}

impl DecisionArbiter {
    pub(crate) const fn new() -> Self {
        Self {
            state: AtomicU8::new(UNDECIDED),
        }
    }

    /// Consumer side. Returns true when the caller must actually suspend;
    /// false when the producer already stored the result and no suspension
    /// is needed.
    pub(crate) fn try_suspend(&self) -> bool {
        match self.state.compare_exchange(
            UNDECIDED,
            SUSPENDED,
            Ordering::AcqRel,
            Ordering::Acquire,
        ) {
            Ok(_) => true,
            Err(RESUMED) => false,
            Err(state) => panic!("decision arbiter: double try_suspend (state {state})"),
        }
    }

    /// Producer side; call after the result is stored. Returns true when a
    /// consumer is parked and must now be woken; false when the consumer has
    /// not suspended yet and will observe the stored result itself.
    pub(crate) fn try_resume(&self) -> bool {
        match self.state.compare_exchange(
            UNDECIDED,
            RESUMED,
            Ordering::AcqRel,
            Ordering::Acquire,
        ) {
            Ok(_) => false,
            Err(SUSPENDED) => {
                self.state.store(RESUMED, Ordering::Release);
                true
            }
            Err(state) => panic!("decision arbiter: double try_resume (state {state})"),
        }
    }
}
