//! Handles for observing and controlling spawned tasks.
//!
//! `TaskHandle` is returned by [`launch`](crate::builders::launch);
//! `Deferred<T>` by [`deferred`](crate::builders::deferred). A handle does
//! not own the task: dropping it leaves the task running; it is a way to
//! start, cancel, and observe.

use crate::error::{Error, ErrorKind};
use crate::task::continuation::{Continuation, Parker};
use crate::task::core::{TaskCore, TaskOutcome};
use crate::task::state::Stage;
use crate::types::{CancelReason, Outcome, PanicPayload, TaskId};
use parking_lot::Mutex;
use std::sync::Arc;

/// Error returned when waiting on a task that did not succeed.
#[derive(Debug, Clone)]
pub enum JoinError {
    /// The task body failed.
    Failed(Error),
    /// The task was cancelled before completion.
    Cancelled(CancelReason),
    /// The task body panicked.
    Panicked(PanicPayload),
}

impl std::fmt::Display for JoinError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Failed(err) => write!(f, "task failed: {err}"),
            Self::Cancelled(reason) => write!(f, "task was cancelled: {reason}"),
            Self::Panicked(payload) => write!(f, "task panicked: {payload}"),
        }
    }
}

impl std::error::Error for JoinError {}

/// A handle to a fire-and-forget task.
///
/// Cloning is cheap; all clones observe the same task.
#[derive(Clone)]
pub struct TaskHandle {
    core: Arc<TaskCore>,
}

impl TaskHandle {
    pub(crate) fn new(core: Arc<TaskCore>) -> Self {
        Self { core }
    }

    /// Returns the task's identity.
    #[must_use]
    pub fn id(&self) -> TaskId {
        self.core.id()
    }

    /// Returns the task's current lifecycle stage.
    #[must_use]
    pub fn stage(&self) -> Stage {
        self.core.stage()
    }

    /// Starts a lazily-created task. Idempotent; returns whether this call
    /// performed the `New → Active` transition.
    pub fn start(&self) -> bool {
        self.core.start()
    }

    /// Requests cancellation with the given cause. Idempotent; the first
    /// cause wins. Returns whether this call newly requested cancellation.
    pub fn cancel(&self, reason: CancelReason) -> bool {
        self.core.cancel(reason)
    }

    /// Returns true once the task has reached a terminal stage.
    #[must_use]
    pub fn is_terminal(&self) -> bool {
        self.core.is_terminal()
    }

    /// Returns true while the task is started, not cancelled, and not yet
    /// terminal.
    #[must_use]
    pub fn is_active(&self) -> bool {
        matches!(self.core.stage(), Stage::Active | Stage::Completing)
            && !self.core.cancel_requested()
    }

    /// Returns true once the task finished with a value, failure, or panic.
    #[must_use]
    pub fn is_completed(&self) -> bool {
        self.core.stage() == Stage::Completed
    }

    /// Returns true once cancellation has been requested or completed.
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.core.cancel_requested() || self.core.stage() == Stage::Cancelled
    }

    /// Returns the number of live children.
    #[must_use]
    pub fn child_count(&self) -> usize {
        self.core.child_count()
    }

    /// Returns the recorded outcome; `None` until the task is terminal.
    #[must_use]
    pub fn outcome(&self) -> Option<Outcome<(), Error>> {
        self.core.outcome()
    }

    /// Registers a callback invoked exactly once with the final outcome.
    ///
    /// On an already-terminal task the handler runs synchronously, before
    /// this call returns, so a completion is never missed.
    pub fn on_completion<F>(&self, handler: F)
    where
        F: FnOnce(&Outcome<(), Error>) + Send + 'static,
    {
        self.core.on_completion(handler);
    }

    /// Registers `continuation` to be resumed when the task reaches a
    /// terminal stage. A lazily-created task is started first. If the task
    /// is already terminal the continuation is resumed synchronously.
    pub fn join_with(&self, continuation: Box<dyn Continuation<()>>) {
        self.core.start();
        self.core.on_completion(move |outcome: &TaskOutcome| {
            continuation.resume_with(outcome.clone());
        });
    }

    /// Blocks the calling thread until the task reaches a terminal stage.
    ///
    /// Starts the task first when it is lazy. Returns immediately when the
    /// task is already terminal.
    pub fn join(&self) {
        if self.core.is_terminal() {
            return;
        }
        let parker = Parker::new();
        self.join_with(parker.continuation());
        let _ = parker.wait();
    }

    pub(crate) fn core(&self) -> &Arc<TaskCore> {
        &self.core
    }
}

impl std::fmt::Debug for TaskHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaskHandle")
            .field("id", &self.core.id())
            .field("stage", &self.core.stage())
            .finish()
    }
}

/// A handle to a value-producing task.
///
/// The failure asymmetry lives here: a `Deferred` failure is *stored*, not
/// escalated, and only becomes visible through [`wait`](Self::wait),
/// [`try_wait`](Self::try_wait), or [`completed_value`](Self::completed_value).
pub struct Deferred<T> {
    handle: TaskHandle,
    value: Arc<Mutex<Option<T>>>,
}

impl<T> Clone for Deferred<T> {
    fn clone(&self) -> Self {
        Self {
            handle: self.handle.clone(),
            value: self.value.clone(),
        }
    }
}

impl<T: Send + 'static> Deferred<T> {
    pub(crate) fn new(handle: TaskHandle, value: Arc<Mutex<Option<T>>>) -> Self {
        Self { handle, value }
    }

    /// Returns the underlying task handle.
    #[must_use]
    pub fn handle(&self) -> &TaskHandle {
        &self.handle
    }

    /// Returns the task's identity.
    #[must_use]
    pub fn id(&self) -> TaskId {
        self.handle.id()
    }

    /// Starts a lazily-created task. See [`TaskHandle::start`].
    pub fn start(&self) -> bool {
        self.handle.start()
    }

    /// Requests cancellation. See [`TaskHandle::cancel`].
    pub fn cancel(&self, reason: CancelReason) -> bool {
        self.handle.cancel(reason)
    }

    /// Blocks until terminal without consuming the value.
    pub fn join(&self) {
        self.handle.join();
    }

    /// Registers `continuation` to be resumed with the task's value (or its
    /// failure) once the task reaches a terminal stage. Starts a lazy task.
    pub fn wait_with(&self, continuation: Box<dyn Continuation<T>>)
    where
        T: Clone,
    {
        self.handle.core().start();
        let value = self.value.clone();
        self.handle.core().on_completion(move |outcome: &TaskOutcome| {
            continuation.resume_with(resolve_outcome(outcome, &value));
        });
    }

    /// Blocks until terminal and returns the recorded value.
    ///
    /// The read is idempotent: every subsequent call returns the same value.
    ///
    /// # Errors
    ///
    /// Returns the stored failure, cancellation, or panic as a [`JoinError`].
    pub fn wait(&self) -> Result<T, JoinError>
    where
        T: Clone,
    {
        let parker = Parker::new();
        self.wait_with(parker.continuation());
        into_join_result(parker.wait())
    }

    /// Non-blocking probe: `None` while the task is not yet terminal.
    ///
    /// # Errors
    ///
    /// As for [`wait`](Self::wait), inside the `Some`.
    pub fn try_wait(&self) -> Option<Result<T, JoinError>>
    where
        T: Clone,
    {
        let outcome = self.handle.core().outcome()?;
        Some(into_join_result(resolve_outcome(&outcome, &self.value)))
    }

    /// Returns the recorded value of a terminal-success task.
    ///
    /// # Errors
    ///
    /// - kind [`ErrorKind::NotCompleted`] when the task is not yet terminal;
    /// - the stored failure when the task failed;
    /// - kind [`ErrorKind::Cancelled`] when the task was cancelled;
    /// - kind [`ErrorKind::Panicked`] when the body panicked.
    pub fn completed_value(&self) -> Result<T, Error>
    where
        T: Clone,
    {
        match self.handle.core().outcome() {
            None => Err(Error::new(ErrorKind::NotCompleted)
                .with_message("task has not reached a terminal stage")),
            Some(Outcome::Ok(())) => self.value.lock().clone().ok_or_else(|| {
                Error::new(ErrorKind::Internal).with_message("completed task has no stored value")
            }),
            Some(Outcome::Err(err)) => Err(err),
            Some(Outcome::Cancelled(reason)) => {
                Err(Error::new(ErrorKind::Cancelled).with_message(reason.to_string()))
            }
            Some(Outcome::Panicked(payload)) => {
                Err(Error::new(ErrorKind::Panicked).with_message(payload.message().to_string()))
            }
        }
    }
}

impl<T> std::fmt::Debug for Deferred<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Deferred")
            .field("id", &self.handle.id())
            .field("stage", &self.handle.stage())
            .finish()
    }
}

/// Maps an untyped terminal outcome to the typed one, reading the value cell
/// on success.
fn resolve_outcome<T: Clone>(
    outcome: &TaskOutcome,
    value: &Mutex<Option<T>>,
) -> Outcome<T, Error> {
    match outcome {
        Outcome::Ok(()) => match value.lock().clone() {
            Some(v) => Outcome::Ok(v),
            None => Outcome::Err(
                Error::new(ErrorKind::Internal).with_message("completed task has no stored value"),
            ),
        },
        Outcome::Err(err) => Outcome::Err(err.clone()),
        Outcome::Cancelled(reason) => Outcome::Cancelled(reason.clone()),
        Outcome::Panicked(payload) => Outcome::Panicked(payload.clone()),
    }
}

pub(crate) fn into_join_result<T>(outcome: Outcome<T, Error>) -> Result<T, JoinError> {
    match outcome {
        Outcome::Ok(value) => Ok(value),
        Outcome::Err(err) => Err(JoinError::Failed(err)),
        Outcome::Cancelled(reason) => Err(JoinError::Cancelled(reason)),
        Outcome::Panicked(payload) => Err(JoinError::Panicked(payload)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn join_error_display() {
        let cancelled = JoinError::Cancelled(CancelReason::user("stop"));
        assert!(cancelled.to_string().contains("task was cancelled"));
        assert!(cancelled.to_string().contains("stop"));

        let panicked = JoinError::Panicked(PanicPayload::new("crash"));
        assert!(panicked.to_string().contains("task panicked"));
        assert!(panicked.to_string().contains("crash"));

        let failed = JoinError::Failed(Error::user("bad input"));
        assert!(failed.to_string().contains("task failed"));
    }

    #[test]
    fn into_join_result_maps_variants() {
        assert!(matches!(
            into_join_result::<i32>(Outcome::Ok(3)),
            Ok(3)
        ));
        assert!(matches!(
            into_join_result::<i32>(Outcome::Err(Error::user("no"))),
            Err(JoinError::Failed(_))
        ));
        assert!(matches!(
            into_join_result::<i32>(Outcome::Cancelled(CancelReason::shutdown())),
            Err(JoinError::Cancelled(_))
        ));
        assert!(matches!(
            into_join_result::<i32>(Outcome::Panicked(PanicPayload::new("boom"))),
            Err(JoinError::Panicked(_))
        ));
    }
}
