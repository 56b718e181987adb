//! The per-task context handed to every body.
//!
//! `Cx` is how a body observes its own task: its identity, its context
//! elements, and pending cancellation. Cancellation is
//! cooperative: a running body only sees it at an explicit
//! [`checkpoint`](Cx::checkpoint) (or by polling
//! [`is_cancel_requested`](Cx::is_cancel_requested)), never preemptively.

use crate::context::Context;
use crate::error::{Error, ErrorKind};
use crate::task::core::TaskCore;
use crate::types::{CancelReason, TaskId};
use std::sync::Arc;

/// The context of a running task body.
///
/// The [`Context`] reachable through a `Cx` already carries this task as the
/// parent element, so builders invoked with `cx.context()` attach their tasks
/// here.
pub struct Cx {
    core: Arc<TaskCore>,
    context: Context,
}

impl Cx {
    pub(crate) fn new(core: Arc<TaskCore>, context: Context) -> Self {
        Self { core, context }
    }

    /// Returns this task's identity.
    #[must_use]
    pub fn task_id(&self) -> TaskId {
        self.core.id()
    }

    /// Returns this task's context.
    #[must_use]
    pub fn context(&self) -> &Context {
        &self.context
    }

    /// Returns true if cancellation of this task has been requested.
    #[must_use]
    pub fn is_cancel_requested(&self) -> bool {
        self.core.cancel_requested()
    }

    /// Returns the recorded cancellation cause, if any.
    #[must_use]
    pub fn cancel_reason(&self) -> Option<CancelReason> {
        self.core.cancel_reason()
    }

    /// Observes pending cancellation.
    ///
    /// # Errors
    ///
    /// Returns an error of kind [`ErrorKind::Cancelled`] when cancellation is
    /// pending, so bodies can bail out with `cx.checkpoint()?`.
    pub fn checkpoint(&self) -> Result<(), Error> {
        match self.core.cancel_reason() {
            Some(reason) => {
                Err(Error::new(ErrorKind::Cancelled).with_message(reason.to_string()))
            }
            None => Ok(()),
        }
    }
}

impl std::fmt::Debug for Cx {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Cx")
            .field("task_id", &self.core.id())
            .field("stage", &self.core.stage())
            .finish()
    }
}
