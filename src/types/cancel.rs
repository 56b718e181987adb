//! Cancellation reason and kind types.
//!
//! Cancellation is a first-class protocol, not a silent drop. This module
//! defines the types that describe why cancellation was requested. A task
//! records exactly one cancellation cause: the first request wins, and later
//! requests with a different cause are ignored.

use crate::error::Error;
use core::fmt;
use std::sync::Arc;

/// The kind of cancellation request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum CancelKind {
    /// Explicit cancellation requested by user code.
    User,
    /// Cancellation because a fire-and-forget child failed and escalated.
    FailureEscalated,
    /// Cancellation because the parent task was cancelled.
    ParentCancelled,
    /// Cancellation due to runtime shutdown.
    Shutdown,
}

impl CancelKind {
    /// Returns the severity of this cancellation kind (diagnostic only;
    /// severity never overrides an already-recorded cause).
    #[must_use]
    pub const fn severity(self) -> u8 {
        match self {
            Self::User => 0,
            Self::FailureEscalated => 1,
            Self::ParentCancelled => 2,
            Self::Shutdown => 3,
        }
    }
}

impl fmt::Display for CancelKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::User => write!(f, "user"),
            Self::FailureEscalated => write!(f, "failure escalated"),
            Self::ParentCancelled => write!(f, "parent cancelled"),
            Self::Shutdown => write!(f, "shutdown"),
        }
    }
}

/// The reason for a cancellation: a kind, an optional static message, and
/// for failure escalation the failure that caused it.
#[derive(Debug, Clone)]
pub struct CancelReason {
    /// The kind of cancellation.
    pub kind: CancelKind,
    /// Optional human-readable message (static for determinism).
    pub message: Option<&'static str>,
    /// The failure that triggered this cancellation, if any.
    cause: Option<Arc<Error>>,
}

impl CancelReason {
    /// Creates a new cancellation reason with the given kind.
    #[must_use]
    pub const fn new(kind: CancelKind) -> Self {
        Self {
            kind,
            message: None,
            cause: None,
        }
    }

    /// Creates a user cancellation reason with a message.
    #[must_use]
    pub const fn user(message: &'static str) -> Self {
        Self {
            kind: CancelKind::User,
            message: Some(message),
            cause: None,
        }
    }

    /// Creates a parent-cancelled cancellation reason.
    #[must_use]
    pub const fn parent_cancelled() -> Self {
        Self::new(CancelKind::ParentCancelled)
    }

    /// Creates a shutdown cancellation reason.
    #[must_use]
    pub const fn shutdown() -> Self {
        Self::new(CancelKind::Shutdown)
    }

    /// Creates a cancellation reason carrying an escalated failure as cause.
    #[must_use]
    pub fn failure(cause: Error) -> Self {
        Self {
            kind: CancelKind::FailureEscalated,
            message: None,
            cause: Some(Arc::new(cause)),
        }
    }

    /// Derives the reason propagated to a child when this task is cancelled.
    ///
    /// The child sees `ParentCancelled`; the original message and cause are
    /// carried along for diagnostics.
    #[must_use]
    pub fn for_child(&self) -> Self {
        Self {
            kind: CancelKind::ParentCancelled,
            message: self.message,
            cause: self.cause.clone(),
        }
    }

    /// Returns the failure that triggered this cancellation, if any.
    #[must_use]
    pub fn cause(&self) -> Option<&Error> {
        self.cause.as_deref()
    }

    /// Returns the kind of this cancellation reason.
    #[must_use]
    pub const fn kind(&self) -> CancelKind {
        self.kind
    }

    /// Returns true if this reason indicates shutdown.
    #[must_use]
    pub const fn is_shutdown(&self) -> bool {
        matches!(self.kind, CancelKind::Shutdown)
    }
}

impl Default for CancelReason {
    fn default() -> Self {
        Self::new(CancelKind::User)
    }
}

/// Equality ignores the cause chain; two reasons are equal when kind and
/// message match.
impl PartialEq for CancelReason {
    fn eq(&self, other: &Self) -> bool {
        self.kind == other.kind && self.message == other.message
    }
}

impl Eq for CancelReason {}

impl fmt::Display for CancelReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.kind)?;
        if let Some(msg) = self.message {
            write!(f, ": {msg}")?;
        }
        if let Some(cause) = &self.cause {
            write!(f, " (caused by: {cause})")?;
        }
        Ok(())
    }
}
