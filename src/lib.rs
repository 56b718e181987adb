//! Weft: a structured-concurrency task runtime.
//!
//! # Overview
//!
//! Weft lets a program spawn logical units of cooperative work ("tasks"),
//! compose them into parent/child trees, and get predictable propagation of
//! cancellation, failure, and context through that tree. Every spawned task
//! has an owning parent whose lifetime and cancellation bound the child's.
//!
//! # Core Guarantees
//!
//! - **Forward-only lifecycle**: a task moves `New → Active → {Completing,
//!   Cancelling} → {Completed, Cancelled}` and never backwards; exactly one
//!   terminal outcome is recorded
//! - **No orphaned children**: a parent cannot reach a terminal state while
//!   any child is non-terminal
//! - **Cancellation is a protocol**: cooperative, idempotent, first cause
//!   wins, and the request reaches every descendant before an ancestor
//!   finishes cancelling
//! - **No lost failures**: a fire-and-forget failure escalates to the parent
//!   and the process-wide sink; a deferred failure is stored until read
//! - **No missed wake-ups**: waiting on a result goes through a CAS-based
//!   decision arbiter, so a result that lands before the caller suspends is
//!   observed, never dropped
//!
//! # Module Structure
//!
//! - [`types`]: Core types (identifiers, outcomes, cancellation reasons)
//! - [`context`]: Immutable keyed context and its composition rules
//! - [`dispatch`]: Dispatcher abstraction and the worker-pool dispatcher
//! - [`task`]: Task state machine, handles, and the decision arbiter
//! - [`builders`]: `launch`, `deferred`, and `with_context`
//! - [`failure`]: Process-wide unhandled-failure sink
//! - [`error`]: Error types
//!
//! # Example
//!
//! ```
//! use weft::{deferred, Context, StartMode};
//!
//! let ctx = Context::new();
//! let total = deferred(&ctx, StartMode::Default, |cx| {
//!     let inner = deferred(cx.context(), StartMode::Default, |_| Ok(21));
//!     Ok(inner.wait().map(|v| v * 2).unwrap_or(0))
//! });
//! assert_eq!(total.wait().unwrap(), 42);
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs)]
#![warn(clippy::pedantic)]
#![allow(clippy::missing_panics_doc)]
#![allow(clippy::missing_errors_doc)]
#![allow(clippy::module_name_repetitions)]

pub mod builders;
pub mod context;
pub mod dispatch;
pub mod error;
pub mod failure;
pub mod task;
pub mod types;

#[cfg(test)]
mod test_utils;

// Re-exports for convenient access to core types
pub use builders::{deferred, launch, with_context, StartMode};
pub use context::{Context, DefaultDispatcherTag, DispatcherElement, FailureHandlerElement};
pub use dispatch::{default_dispatcher, pool::PoolDispatcher, Dispatcher, InlineDispatcher, Job};
pub use error::{Error, ErrorKind, Result};
pub use task::{Continuation, Cx, Deferred, JoinError, Stage, TaskHandle};
pub use types::{CancelKind, CancelReason, Outcome, PanicPayload, TaskId};
