//! The task lifecycle core.
//!
//! `TaskCore` is the untyped state machine shared by fire-and-forget and
//! value-producing tasks: the atomic stage word, the parent/child links, the
//! write-once outcome slot, and the completion handlers. Typed result
//! plumbing lives in the handles; scheduling lives in the builders.
//!
//! Invariants maintained here:
//!
//! - the stage only moves forward (`New → Active → {Completing, Cancelling}
//!   → {Completed, Cancelled}`);
//! - exactly one terminal outcome is recorded per task;
//! - a task never reaches a terminal stage while a child is non-terminal;
//! - cancelling a task propagates the request to every non-terminal child
//!   before the task itself can finish cancelling;
//! - the first recorded cancellation cause is immutable.

use crate::dispatch::Dispatcher;
use crate::error::Error;
use crate::task::state::{Stage, StageCell};
use crate::types::{CancelReason, Outcome, TaskId};
use parking_lot::Mutex;
use smallvec::SmallVec;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use tracing::{debug, trace};

/// The untyped outcome recorded at a task's terminal stage.
pub(crate) type TaskOutcome = Outcome<(), Error>;

type CompletionHandler = Box<dyn FnOnce(&TaskOutcome) + Send>;

/// The stored body of a not-yet-started task, released exactly once by
/// [`TaskCore::start`].
pub(crate) struct StoredBody {
    pub(crate) dispatcher: Arc<dyn Dispatcher>,
    pub(crate) job: Box<dyn FnOnce() + Send>,
    /// Run on the starting thread instead of dispatching.
    pub(crate) inline: bool,
}

pub(crate) struct TaskCore {
    id: TaskId,
    stage: StageCell,
    /// First recorded cancellation cause; never replaced once set.
    cancel: Mutex<Option<CancelReason>>,
    /// The body has finished, or will never run.
    body_done: AtomicBool,
    /// Body outcome, parked here until the children set drains.
    pending: Mutex<Option<TaskOutcome>>,
    /// Final outcome. Write-once; present exactly when the task is terminal.
    outcome: Mutex<Option<TaskOutcome>>,
    handlers: Mutex<SmallVec<[CompletionHandler; 2]>>,
    parent: Mutex<Option<Weak<TaskCore>>>,
    children: Mutex<SmallVec<[Arc<TaskCore>; 4]>>,
    stored: Mutex<Option<StoredBody>>,
}

impl TaskCore {
    pub(crate) fn new() -> Arc<Self> {
        Arc::new(Self {
            id: TaskId::next(),
            stage: StageCell::new(),
            cancel: Mutex::new(None),
            body_done: AtomicBool::new(false),
            pending: Mutex::new(None),
            outcome: Mutex::new(None),
            handlers: Mutex::new(SmallVec::new()),
            parent: Mutex::new(None),
            children: Mutex::new(SmallVec::new()),
            stored: Mutex::new(None),
        })
    }

    pub(crate) fn id(&self) -> TaskId {
        self.id
    }

    pub(crate) fn stage(&self) -> Stage {
        self.stage.load()
    }

    pub(crate) fn is_terminal(&self) -> bool {
        self.stage.load().is_terminal()
    }

    pub(crate) fn cancel_requested(&self) -> bool {
        self.cancel.lock().is_some()
    }

    pub(crate) fn cancel_reason(&self) -> Option<CancelReason> {
        self.cancel.lock().clone()
    }

    /// Final outcome; `None` until the task is terminal.
    pub(crate) fn outcome(&self) -> Option<TaskOutcome> {
        self.outcome.lock().clone()
    }

    pub(crate) fn child_count(&self) -> usize {
        self.children.lock().len()
    }

    pub(crate) fn parent(&self) -> Option<Arc<Self>> {
        self.parent.lock().as_ref().and_then(Weak::upgrade)
    }

    pub(crate) fn store_body(&self, body: StoredBody) {
        *self.stored.lock() = Some(body);
    }

    /// `New → Active`: releases the stored body to its dispatcher.
    ///
    /// Idempotent; returns whether this call performed the transition.
    pub(crate) fn start(self: &Arc<Self>) -> bool {
        if !self.stage.try_advance(Stage::New, Stage::Active) {
            return false;
        }
        trace!(task_id = ?self.id, "task started");
        let stored = self.stored.lock().take();
        match stored {
            Some(body) => {
                if body.inline {
                    (body.job)();
                } else {
                    body.dispatcher.schedule(body.job);
                }
            }
            // cancel() raced us and discarded the body.
            None => self.cancelled_before_run(),
        }
        true
    }

    /// Requests cancellation. Idempotent; the first cause wins and later
    /// causes are ignored. Returns whether this call newly requested it.
    pub(crate) fn cancel(self: &Arc<Self>, reason: CancelReason) -> bool {
        if self.stage.load().is_terminal() {
            return false;
        }
        {
            let mut slot = self.cancel.lock();
            if slot.is_some() {
                return false;
            }
            *slot = Some(reason.clone());
        }
        debug!(task_id = ?self.id, kind = %reason.kind, "cancellation requested");

        if self.stage.load() == Stage::New {
            // The body will never run.
            self.body_done.store(true, Ordering::Release);
            drop(self.stored.lock().take());
            let finished = {
                let children = self.children.lock();
                children.is_empty() && self.stage.try_advance(Stage::New, Stage::Cancelled)
            };
            if finished {
                self.terminalize(Outcome::Cancelled(reason));
                return true;
            }
            if self.stage.try_advance(Stage::New, Stage::Cancelling) {
                self.cascade_cancel(&reason);
                self.try_finish();
                return true;
            }
            // Lost the race with start(); the task is Active now.
        }

        self.cascade_cancel(&reason);
        self.stage.try_advance(Stage::Completing, Stage::Cancelling);
        self.try_finish();
        true
    }

    /// The scheduled body was skipped because cancellation preceded its
    /// first run.
    pub(crate) fn cancelled_before_run(self: &Arc<Self>) {
        self.body_done.store(true, Ordering::Release);
        self.stage.try_advance(Stage::Active, Stage::Cancelling);
        self.try_finish();
    }

    /// The body finished with `outcome` (value, failure, or observed
    /// cancellation). Moves into the transient stage and attempts the
    /// terminal transition, which stays gated on the children set.
    pub(crate) fn body_finished(self: &Arc<Self>, outcome: TaskOutcome) {
        *self.pending.lock() = Some(outcome);
        self.body_done.store(true, Ordering::Release);
        if self.cancel_requested() {
            self.stage.try_advance(Stage::Active, Stage::Cancelling);
        } else {
            self.stage.try_advance(Stage::Active, Stage::Completing);
            // A cancel landing right here performs Completing → Cancelling
            // itself before its own try_finish.
        }
        self.try_finish();
    }

    /// Attaches `child`. Returns false when this task is already terminal
    /// (the caller is expected to cancel the orphaned child).
    ///
    /// Holding the children lock across the stage check pairs with
    /// `try_finish`, which performs its terminal transition under the same
    /// lock: a child is either attached before the parent goes terminal, or
    /// the attach observes the terminal stage.
    pub(crate) fn adopt(self: &Arc<Self>, child: &Arc<TaskCore>) -> bool {
        {
            let mut children = self.children.lock();
            if self.stage.load().is_terminal() {
                return false;
            }
            children.push(child.clone());
        }
        *child.parent.lock() = Some(Arc::downgrade(self));
        trace!(task_id = ?self.id, child = ?child.id, "child attached");
        if let Some(reason) = self.cancel_reason() {
            // Children attached after the cancel request still receive it.
            child.cancel(reason.for_child());
        }
        true
    }

    /// A child reached its terminal stage; drop it from the children set and
    /// re-attempt the terminal transition.
    pub(crate) fn child_finished(self: &Arc<Self>, child: TaskId) {
        self.children.lock().retain(|c| c.id != child);
        self.try_finish();
    }

    /// Registers a completion handler, invoked exactly once with the final
    /// outcome. On an already-terminal task the handler runs synchronously
    /// before this call returns.
    pub(crate) fn on_completion<F>(&self, handler: F)
    where
        F: FnOnce(&TaskOutcome) + Send + 'static,
    {
        // The outcome lock serializes against terminalize: either the
        // outcome is visible here, or the push lands before the drain.
        let outcome_slot = self.outcome.lock();
        if let Some(outcome) = outcome_slot.as_ref() {
            let outcome = outcome.clone();
            drop(outcome_slot);
            handler(&outcome);
        } else {
            self.handlers.lock().push(Box::new(handler));
        }
    }

    fn cascade_cancel(self: &Arc<Self>, reason: &CancelReason) {
        let children: SmallVec<[Arc<TaskCore>; 4]> = self.children.lock().clone();
        for child in children {
            child.cancel(reason.for_child());
        }
    }

    /// Attempts the terminal transition. Gated on the body being done and
    /// the children set being empty; re-invoked as each child finishes.
    fn try_finish(self: &Arc<Self>) {
        if !self.body_done.load(Ordering::Acquire) {
            return;
        }
        loop {
            match self.stage.load() {
                Stage::Completing => {
                    if self.cancel_requested() {
                        self.stage.try_advance(Stage::Completing, Stage::Cancelling);
                        continue;
                    }
                    let children = self.children.lock();
                    if !children.is_empty() {
                        return;
                    }
                    let advanced = self.stage.try_advance(Stage::Completing, Stage::Completed);
                    drop(children);
                    if advanced {
                        let outcome = self.pending.lock().take().unwrap_or(Outcome::Ok(()));
                        self.terminalize(outcome);
                        return;
                    }
                    // Stage moved to Cancelling concurrently; retry.
                }
                Stage::Cancelling => {
                    let children = self.children.lock();
                    if !children.is_empty() {
                        return;
                    }
                    let advanced = self.stage.try_advance(Stage::Cancelling, Stage::Cancelled);
                    drop(children);
                    if advanced {
                        let reason = self.cancel.lock().clone().unwrap_or_default();
                        self.terminalize(Outcome::Cancelled(reason));
                    }
                    return;
                }
                _ => return,
            }
        }
    }

    /// Records the final outcome, drains handlers, and reports to the
    /// parent. Runs exactly once: callers reach it only by winning the
    /// terminal CAS.
    fn terminalize(self: &Arc<Self>, outcome: TaskOutcome) {
        let drained = {
            let mut slot = self.outcome.lock();
            debug_assert!(slot.is_none(), "terminal outcome recorded twice");
            *slot = Some(outcome.clone());
            let mut handlers = self.handlers.lock();
            std::mem::take(&mut *handlers)
        };
        debug!(
            task_id = ?self.id,
            stage = %self.stage.load(),
            severity = outcome.severity(),
            "task reached terminal stage"
        );
        for handler in drained {
            handler(&outcome);
        }
        let parent = self.parent.lock().take().and_then(|weak| weak.upgrade());
        if let Some(parent) = parent {
            parent.child_finished(self.id);
        }
    }
}

impl std::fmt::Debug for TaskCore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaskCore")
            .field("id", &self.id)
            .field("stage", &self.stage.load())
            .field("cancel_requested", &self.cancel_requested())
            .field("children", &self.child_count())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dispatch::InlineDispatcher;
    use crate::types::CancelKind;
    use std::sync::atomic::AtomicUsize;

    /// A core whose body has been released but not yet reported finished,
    /// leaving it parked in `Active` for manual driving.
    fn active_core() -> Arc<TaskCore> {
        crate::test_utils::init_test_logging();
        let core = TaskCore::new();
        core.store_body(StoredBody {
            dispatcher: Arc::new(InlineDispatcher::new()),
            job: Box::new(|| {}),
            inline: true,
        });
        assert!(core.start());
        core
    }

    #[test]
    fn start_is_idempotent() {
        let core = active_core();
        assert_eq!(core.stage(), Stage::Active);
        assert!(!core.start());
    }

    #[test]
    fn cancel_on_new_is_immediately_terminal() {
        let core = TaskCore::new();
        assert!(core.cancel(CancelReason::user("stop")));
        assert_eq!(core.stage(), Stage::Cancelled);
        let outcome = core.outcome().expect("terminal outcome recorded");
        assert!(outcome.is_cancelled());
        // The body was discarded; start can no longer run it.
        assert!(!core.start());
    }

    #[test]
    fn first_cancel_cause_wins() {
        let core = active_core();
        assert!(core.cancel(CancelReason::user("first")));
        assert!(!core.cancel(CancelReason::shutdown()));
        let reason = core.cancel_reason().expect("cause recorded");
        assert_eq!(reason.kind, CancelKind::User);
        assert_eq!(reason.message, Some("first"));
    }

    #[test]
    fn body_finished_reaches_completed() {
        let core = active_core();
        core.body_finished(Outcome::Ok(()));
        assert_eq!(core.stage(), Stage::Completed);
        assert!(core.outcome().is_some_and(|o| o.is_ok()));
    }

    #[test]
    fn cancel_after_body_routes_to_cancelled() {
        let core = active_core();
        core.cancel(CancelReason::user("stop"));
        core.body_finished(Outcome::Ok(()));
        assert_eq!(core.stage(), Stage::Cancelled);
        assert!(core.outcome().is_some_and(|o| o.is_cancelled()));
    }

    #[test]
    fn parent_waits_for_children() {
        let parent = active_core();
        let child = TaskCore::new();
        assert!(parent.adopt(&child));
        child.store_body(StoredBody {
            dispatcher: Arc::new(InlineDispatcher::new()),
            job: Box::new(|| {}),
            inline: true,
        });
        child.start();

        parent.body_finished(Outcome::Ok(()));
        assert_eq!(parent.stage(), Stage::Completing);
        assert!(parent.outcome().is_none());

        child.body_finished(Outcome::Ok(()));
        assert_eq!(child.stage(), Stage::Completed);
        // The last child's terminal report finished the parent.
        assert_eq!(parent.stage(), Stage::Completed);
    }

    #[test]
    fn cancel_cascades_to_children_before_parent_finishes() {
        let parent = active_core();
        let child_a = active_core();
        let child_b = active_core();
        assert!(parent.adopt(&child_a));
        assert!(parent.adopt(&child_b));

        parent.cancel(CancelReason::user("tear down"));
        for child in [&child_a, &child_b] {
            let reason = child.cancel_reason().expect("cancel propagated");
            assert_eq!(reason.kind, CancelKind::ParentCancelled);
        }
        // Parent cannot finish cancelling while children are live.
        parent.body_finished(Outcome::Ok(()));
        assert_eq!(parent.stage(), Stage::Cancelling);

        child_a.body_finished(Outcome::Ok(()));
        assert_eq!(parent.stage(), Stage::Cancelling);
        child_b.body_finished(Outcome::Ok(()));
        assert_eq!(parent.stage(), Stage::Cancelled);
    }

    #[test]
    fn adopt_after_cancel_request_cancels_child() {
        let parent = active_core();
        parent.cancel(CancelReason::shutdown());
        let child = TaskCore::new();
        assert!(parent.adopt(&child));
        assert!(child.cancel_requested());
        assert_eq!(child.stage(), Stage::Cancelled);
    }

    #[test]
    fn adopt_on_terminal_parent_is_refused() {
        let parent = active_core();
        parent.body_finished(Outcome::Ok(()));
        assert_eq!(parent.stage(), Stage::Completed);
        let child = TaskCore::new();
        assert!(!parent.adopt(&child));
    }

    #[test]
    fn handler_on_terminal_task_runs_synchronously() {
        let core = active_core();
        core.body_finished(Outcome::Ok(()));
        let ran = Arc::new(AtomicUsize::new(0));
        let inner = ran.clone();
        core.on_completion(move |outcome| {
            assert!(outcome.is_ok());
            inner.fetch_add(1, Ordering::SeqCst);
        });
        assert_eq!(ran.load(Ordering::SeqCst), 1, "handler ran before return");
    }

    #[test]
    fn handlers_run_exactly_once_at_terminal() {
        let core = active_core();
        let ran = Arc::new(AtomicUsize::new(0));
        let inner = ran.clone();
        core.on_completion(move |_| {
            inner.fetch_add(1, Ordering::SeqCst);
        });
        assert_eq!(ran.load(Ordering::SeqCst), 0);
        core.body_finished(Outcome::Ok(()));
        assert_eq!(ran.load(Ordering::SeqCst), 1);
    }
}
