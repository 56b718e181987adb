//! Task builders: `launch`, `deferred`, and `with_context`.
//!
//! Each builder merges the caller's context with the dispatcher fallback,
//! creates a task entity in the chosen initial state, and either releases it
//! to its dispatcher immediately or parks it until the first
//! `start`/`join`/`wait`.
//!
//! The exception-policy asymmetry is decided here: an uncaught failure in a
//! [`launch`]ed task escalates (parent cancelled, process-wide sink
//! notified) unless a failure handler is installed in the context; a
//! [`deferred`] task's failure is stored and surfaces only to whoever reads
//! the result; a [`with_context`] failure is re-raised to the caller.

use crate::context::{Context, ParentElement};
use crate::error::{Error, ErrorKind};
use crate::failure;
use crate::task::arbiter::DecisionArbiter;
use crate::task::core::{StoredBody, TaskCore, TaskOutcome};
use crate::task::cx::Cx;
use crate::task::handle::{Deferred, JoinError, TaskHandle};
use crate::types::{CancelReason, Outcome, PanicPayload};
use parking_lot::{Condvar, Mutex};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;
use tracing::trace;

/// When a task starts executing relative to its creation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StartMode {
    /// Schedule the body on the dispatcher immediately.
    Default,
    /// Stay in `New` until `start`, `join`, or `wait` is first called.
    Lazy,
    /// Run the body inline on the starting thread instead of dispatching.
    Undispatched,
    /// Like `Default`, but the body runs at least once even when
    /// cancellation arrives before its first run; the body observes the
    /// cancel at its first checkpoint.
    Atomic,
}

/// Spawns a fire-and-forget task.
///
/// An uncaught failure in the body is fatal to the parent: the parent task
/// is cancelled with the failure as cause and the failure is reported to the
/// process-wide unhandled-failure sink. A failure handler installed in the
/// context intercepts both and receives the failure instead.
pub fn launch<F>(context: &Context, mode: StartMode, body: F) -> TaskHandle
where
    F: FnOnce(&Cx) -> Result<(), Error> + Send + 'static,
{
    let (core, _value) = spawn_task::<(), F>(context, mode, true, body);
    TaskHandle::new(core)
}

/// Spawns a value-producing task.
///
/// A failure in the body is stored, not escalated; it surfaces only through
/// [`Deferred::wait`], [`Deferred::try_wait`], or
/// [`Deferred::completed_value`].
pub fn deferred<T, F>(context: &Context, mode: StartMode, body: F) -> Deferred<T>
where
    T: Send + 'static,
    F: FnOnce(&Cx) -> Result<T, Error> + Send + 'static,
{
    let (core, value) = spawn_task(context, mode, false, body);
    Deferred::new(TaskHandle::new(core), value)
}

/// Runs `body` under the caller's context merged with `delta`, re-raising
/// its failure to the caller.
///
/// Three cases, in priority order:
///
/// 1. the merge changes nothing: the body runs inline at the call site, with
///    no new task identity and no dispatch;
/// 2. only non-dispatcher elements changed: the body runs on the current
///    thread under a short-lived task wrapper so the new elements are
///    visible, with no dispatch hop;
/// 3. the dispatcher changed: the body runs as a full task wrapper on the
///    new dispatcher while the caller suspends; the suspend/resume race is
///    resolved by the decision arbiter.
///
/// In every case the body's failure comes back to the caller as the `Err` of
/// this call: `with_context` is a scoped call, not a spawn, so nothing
/// escalates to the parent tree.
///
/// # Errors
///
/// The body's failure, cancellation, or panic, as a [`JoinError`].
pub fn with_context<T, F>(cx: &Cx, delta: Context, body: F) -> Result<T, JoinError>
where
    T: Send + 'static,
    F: FnOnce(&Cx) -> Result<T, Error> + Send + 'static,
{
    let old = cx.context();
    let merged = old.merge(&delta);

    if merged.same_elements(old) {
        trace!(task_id = ?cx.task_id(), "with_context: unchanged context, inline call-through");
        return match catch_unwind(AssertUnwindSafe(|| body(cx))) {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(err)) => Err(JoinError::Failed(err)),
            Err(payload) => Err(JoinError::Panicked(PanicPayload::new(panic_message(
                payload.as_ref(),
            )))),
        };
    }

    if merged.same_dispatcher(old) {
        trace!(task_id = ?cx.task_id(), "with_context: same dispatcher, scoped wrapper");
        // Runs synchronously on this thread; the wrapper only exists so the
        // merged elements are visible to the body and to its spawns.
        let (core, value) = spawn_task(&merged, StartMode::Undispatched, false, body);
        let parker = crate::task::continuation::Parker::<()>::new();
        let continuation = parker.continuation();
        core.on_completion(move |outcome: &TaskOutcome| {
            continuation.resume_with(outcome.clone());
        });
        let outcome = parker.wait();
        return resolve_scoped(outcome, &value);
    }

    trace!(task_id = ?cx.task_id(), "with_context: dispatcher switch");
    let (core, value) = spawn_task(&merged, StartMode::Default, false, body);

    // The body may finish on the other dispatcher before this thread is done
    // registering to wait; the arbiter decides exactly once whether to park.
    let arbiter = Arc::new(DecisionArbiter::new());
    let slot: Arc<Mutex<Option<TaskOutcome>>> = Arc::new(Mutex::new(None));
    let gate = Arc::new((Mutex::new(false), Condvar::new()));
    {
        let arbiter = arbiter.clone();
        let slot = slot.clone();
        let gate = gate.clone();
        core.on_completion(move |outcome: &TaskOutcome| {
            *slot.lock() = Some(outcome.clone());
            if arbiter.try_resume() {
                let (lock, ready) = &*gate;
                let mut woken = lock.lock();
                *woken = true;
                ready.notify_one();
            }
        });
    }
    if arbiter.try_suspend() {
        let (lock, ready) = &*gate;
        let mut woken = lock.lock();
        while !*woken {
            ready.wait(&mut woken);
        }
    }
    let outcome = slot
        .lock()
        .take()
        .unwrap_or_else(|| Outcome::Err(Error::new(ErrorKind::Internal)
            .with_message("resumed without a stored outcome")));
    resolve_scoped(outcome, &value)
}

/// Creates the task entity, links it into the tree, and stores the body.
///
/// Returns the core and the typed value cell. `escalate` selects the
/// fire-and-forget failure policy.
fn spawn_task<T, F>(
    context: &Context,
    mode: StartMode,
    escalate: bool,
    body: F,
) -> (Arc<TaskCore>, Arc<Mutex<Option<T>>>)
where
    T: Send + 'static,
    F: FnOnce(&Cx) -> Result<T, Error> + Send + 'static,
{
    let ctx = context.with_dispatcher_fallback();
    let dispatcher = match ctx.dispatcher() {
        Some(dispatcher) => dispatcher,
        None => crate::dispatch::default_dispatcher(),
    };
    let core = TaskCore::new();
    let value: Arc<Mutex<Option<T>>> = Arc::new(Mutex::new(None));

    // The task's own context carries the task itself as parent, so spawns
    // from inside the body attach here.
    let task_ctx = ctx.with(ParentElement(Arc::downgrade(&core)));
    let job = {
        let core = core.clone();
        let value = value.clone();
        let task_ctx = task_ctx.clone();
        Box::new(move || run_body(core, task_ctx, value, mode, escalate, body))
    };
    core.store_body(StoredBody {
        dispatcher,
        job,
        inline: mode == StartMode::Undispatched,
    });

    if let Some(parent) = ctx.parent() {
        if !parent.adopt(&core) {
            // The parent is already terminal; the child never runs.
            core.cancel(CancelReason::parent_cancelled());
        }
    }
    if mode != StartMode::Lazy {
        core.start();
    }
    (core, value)
}

/// Runs the body and drives the completion protocol.
fn run_body<T, F>(
    core: Arc<TaskCore>,
    task_ctx: Context,
    value: Arc<Mutex<Option<T>>>,
    mode: StartMode,
    escalate: bool,
    body: F,
) where
    T: Send + 'static,
    F: FnOnce(&Cx) -> Result<T, Error> + Send + 'static,
{
    if mode != StartMode::Atomic && core.cancel_requested() {
        core.cancelled_before_run();
        return;
    }
    let cx = Cx::new(core.clone(), task_ctx.clone());
    let result = catch_unwind(AssertUnwindSafe(|| body(&cx)));
    let outcome: TaskOutcome = match result {
        Ok(Ok(v)) => {
            *value.lock() = Some(v);
            Outcome::Ok(())
        }
        Ok(Err(err)) if err.is_cancelled() && core.cancel_requested() => {
            // The body observed the pending cancellation at a checkpoint;
            // that is cancellation, not failure.
            let reason = core.cancel_reason().unwrap_or_default();
            Outcome::Cancelled(reason)
        }
        Ok(Err(err)) => Outcome::Err(err),
        Err(payload) => Outcome::Panicked(PanicPayload::new(panic_message(payload.as_ref()))),
    };
    let uncaught: Option<Error> = match &outcome {
        Outcome::Err(err) => Some(err.clone()),
        Outcome::Panicked(payload) => Some(
            Error::new(ErrorKind::Panicked).with_message(payload.message().to_string()),
        ),
        _ => None,
    };
    // The parent link is consumed at terminal; capture it first.
    let parent = core.parent();
    core.body_finished(outcome);
    if escalate {
        if let Some(err) = uncaught {
            match task_ctx.failure_handler() {
                Some(handler) => handler(&err),
                None => {
                    if let Some(parent) = parent {
                        parent.cancel(CancelReason::failure(err.clone()));
                    }
                    failure::report(&err);
                }
            }
        }
    }
}

fn resolve_scoped<T>(
    outcome: TaskOutcome,
    value: &Mutex<Option<T>>,
) -> Result<T, JoinError> {
    match outcome {
        Outcome::Ok(()) => match value.lock().take() {
            Some(v) => Ok(v),
            None => Err(JoinError::Failed(
                Error::new(ErrorKind::Internal).with_message("completed task has no stored value"),
            )),
        },
        Outcome::Err(err) => Err(JoinError::Failed(err)),
        Outcome::Cancelled(reason) => Err(JoinError::Cancelled(reason)),
        Outcome::Panicked(payload) => Err(JoinError::Panicked(payload)),
    }
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(msg) = payload.downcast_ref::<&'static str>() {
        (*msg).to_string()
    } else if let Some(msg) = payload.downcast_ref::<String>() {
        msg.clone()
    } else {
        "task body panicked".to_string()
    }
}
