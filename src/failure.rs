//! The process-wide unhandled-failure sink.
//!
//! An uncaught failure in a fire-and-forget task that no context handler
//! intercepts is reported here, so failures are observable even when nothing
//! ever joins the task. The sink has an explicit install/reset lifecycle for
//! test isolation; with nothing installed, failures are logged.

use crate::error::Error;
use parking_lot::RwLock;
use std::sync::Arc;
use tracing::error;

type Sink = Arc<dyn Fn(&Error) + Send + Sync>;

static SINK: RwLock<Option<Sink>> = RwLock::new(None);

/// Installs the process-wide failure sink, replacing any previous one.
pub fn install<F>(handler: F)
where
    F: Fn(&Error) + Send + Sync + 'static,
{
    *SINK.write() = Some(Arc::new(handler));
}

/// Removes the installed sink, restoring the logging default.
pub fn reset() {
    *SINK.write() = None;
}

/// Delivers an unhandled failure to the installed sink, or logs it.
pub fn report(err: &Error) {
    let sink = SINK.read().clone();
    match sink {
        Some(sink) => sink(err),
        None => error!(kind = ?err.kind(), error = %err, "unhandled task failure"),
    }
}
